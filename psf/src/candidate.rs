//! PSF candidates and the detections they come from.

use shared::Stamp;

use crate::error::PsfError;

/// Registry-assigned candidate identifier
pub type CandidateId = usize;

/// Chi-square of a candidate that has not been fit yet
pub const CHI2_UNSET: f64 = f64::MAX;

/// Judgement of a candidate by the fit loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateStatus {
    Good,
    Bad,
    Unknown,
}

/// Detected source a candidate was made from
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    /// Identifier from the upstream detection catalog
    pub id: u64,
    /// Centroid in parent pixel coordinates
    pub x: f64,
    pub y: f64,
    pub flux: f64,
    /// Second moments of the light distribution
    pub m_xx: f64,
    pub m_yy: f64,
    pub m_xy: f64,
    /// Set on sources whose candidate survived into the final PSF fit
    pub psf_star: bool,
}

impl Source {
    pub fn new(id: u64, x: f64, y: f64, flux: f64) -> Self {
        Self {
            id,
            x,
            y,
            flux,
            m_xx: 0.0,
            m_yy: 0.0,
            m_xy: 0.0,
            psf_star: false,
        }
    }

    pub fn with_moments(mut self, m_xx: f64, m_yy: f64, m_xy: f64) -> Self {
        self.m_xx = m_xx;
        self.m_yy = m_yy;
        self.m_xy = m_xy;
        self
    }
}

/// One star under consideration as a PSF exemplar
#[derive(Debug, Clone)]
pub struct Candidate {
    id: CandidateId,
    source: Source,
    status: CandidateStatus,
    chi2: f64,
    stamp: Option<Stamp>,
}

impl Candidate {
    /// Wrap a source; the registry assigns the id on insertion
    pub fn new(source: Source) -> Self {
        Self {
            id: 0,
            source,
            status: CandidateStatus::Unknown,
            chi2: CHI2_UNSET,
            stamp: None,
        }
    }

    pub fn id(&self) -> CandidateId {
        self.id
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn x(&self) -> f64 {
        self.source.x
    }

    pub fn y(&self) -> f64 {
        self.source.y
    }

    /// Ranking used for per-cell capacity: brighter stars rank higher
    pub fn rank(&self) -> f64 {
        self.source.flux
    }

    pub fn status(&self) -> CandidateStatus {
        self.status
    }

    pub fn is_bad(&self) -> bool {
        self.status == CandidateStatus::Bad
    }

    /// Reduced chi-square against the latest fit, [`CHI2_UNSET`] before any
    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    /// Record the reduced chi-square of this candidate against a fit
    pub fn set_chi2(&mut self, chi2: f64) {
        self.chi2 = chi2;
    }

    pub fn has_stamp(&self) -> bool {
        self.stamp.is_some()
    }

    /// Pixel stamp, or a fit error if none could be cut for this candidate
    pub fn stamp(&self) -> Result<&Stamp, PsfError> {
        self.stamp
            .as_ref()
            .ok_or_else(|| PsfError::candidate_fit(self.id, "candidate has no stamp"))
    }

    pub(crate) fn set_id(&mut self, id: CandidateId) {
        self.id = id;
    }

    pub(crate) fn set_status(&mut self, status: CandidateStatus) {
        self.status = status;
    }

    pub(crate) fn set_stamp(&mut self, stamp: Option<Stamp>) {
        self.stamp = stamp;
    }

    pub(crate) fn source_mut(&mut self) -> &mut Source {
        &mut self.source
    }
}
