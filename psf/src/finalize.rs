//! Quality bookkeeping after the final fit.

use std::collections::{BTreeMap, HashMap};

use crate::candidate::CandidateStatus;
use crate::registry::CandidateRegistry;

pub const SPATIAL_FIT_CHI2_KEY: &str = "phot.psf.spatialFitChi2";
pub const NUM_GOOD_STARS_KEY: &str = "phot.psf.numGoodStars";
pub const NUM_AVAIL_STARS_KEY: &str = "phot.psf.numAvailStars";
pub const SPATIAL_LOW_ORDER_FLAG_KEY: &str = "phot.psf.spatialLowOrdFlag";

/// Destination for scalar quality metrics, e.g. image metadata
pub trait QualitySink {
    fn set(&mut self, key: &str, value: f64);
}

impl QualitySink for BTreeMap<String, f64> {
    fn set(&mut self, key: &str, value: f64) {
        self.insert(key.to_string(), value);
    }
}

impl QualitySink for HashMap<String, f64> {
    fn set(&mut self, key: &str, value: f64) {
        self.insert(key.to_string(), value);
    }
}

/// Summary of a determination run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityReport {
    /// Candidates held by the registry
    pub num_available: usize,
    /// Candidates that survived every rejection
    pub num_good: usize,
    pub num_bad: usize,
    /// Reduced chi-square of the final spatial fit
    pub spatial_fit_chi2: f64,
    /// Set when the spatial order had to be lowered; never set by this fitter
    pub spatial_low_order: bool,
}

impl QualityReport {
    pub fn write_to(&self, sink: &mut dyn QualitySink) {
        sink.set(SPATIAL_FIT_CHI2_KEY, self.spatial_fit_chi2);
        sink.set(NUM_GOOD_STARS_KEY, self.num_good as f64);
        sink.set(NUM_AVAIL_STARS_KEY, self.num_available as f64);
        sink.set(
            SPATIAL_LOW_ORDER_FLAG_KEY,
            if self.spatial_low_order { 1.0 } else { 0.0 },
        );
    }
}

/// Promote every surviving candidate to GOOD, flag its source as a PSF star
/// and report the counts.
pub fn finalize(
    registry: &mut CandidateRegistry,
    spatial_fit_chi2: f64,
    sink: Option<&mut dyn QualitySink>,
) -> QualityReport {
    let mut num_good = 0;
    let mut num_bad = 0;
    for candidate in registry.candidates_mut() {
        if candidate.is_bad() {
            num_bad += 1;
            continue;
        }
        candidate.set_status(CandidateStatus::Good);
        candidate.source_mut().psf_star = true;
        num_good += 1;
    }

    let report = QualityReport {
        num_available: registry.len(),
        num_good,
        num_bad,
        spatial_fit_chi2,
        spatial_low_order: false,
    };
    log::info!(
        "PSF determination used {} of {} candidates (spatial chi2 {:.3})",
        report.num_good,
        report.num_available,
        report.spatial_fit_chi2
    );

    if let Some(sink) = sink {
        report.write_to(sink);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Candidate, Source};
    use shared::BoundingBox;

    #[test]
    fn test_counts_and_flags() {
        let mut registry =
            CandidateRegistry::new(BoundingBox::new(0, 0, 50, 50), 25, 25, 0).unwrap();
        for i in 0..5 {
            let source = Source::new(i, 5.0 + 8.0 * i as f64, 10.0, 100.0);
            registry.insert(Candidate::new(source)).unwrap();
        }
        registry.set_status(1, CandidateStatus::Bad).unwrap();
        registry.set_status(3, CandidateStatus::Bad).unwrap();

        let mut metrics: BTreeMap<String, f64> = BTreeMap::new();
        let report = finalize(&mut registry, 1.25, Some(&mut metrics));

        assert_eq!(report.num_available, 5);
        assert_eq!(report.num_good, 3);
        assert_eq!(report.num_bad, 2);
        assert_eq!(report.num_good + report.num_bad, report.num_available);

        assert_eq!(metrics[NUM_GOOD_STARS_KEY], 3.0);
        assert_eq!(metrics[NUM_AVAIL_STARS_KEY], 5.0);
        assert_eq!(metrics[SPATIAL_FIT_CHI2_KEY], 1.25);
        assert_eq!(metrics[SPATIAL_LOW_ORDER_FLAG_KEY], 0.0);

        for candidate in registry.iter(true) {
            assert_eq!(candidate.source().psf_star, !candidate.is_bad());
            if !candidate.is_bad() {
                assert_eq!(candidate.status(), CandidateStatus::Good);
            }
        }
    }

    #[test]
    fn test_without_sink() {
        let mut registry =
            CandidateRegistry::new(BoundingBox::new(0, 0, 10, 10), 10, 10, 0).unwrap();
        let report = finalize(&mut registry, f64::NAN, None);
        assert_eq!(report.num_available, 0);
        assert_eq!(report.num_good, 0);

        let mut metrics: HashMap<String, f64> = HashMap::new();
        report.write_to(&mut metrics);
        assert!(metrics[SPATIAL_FIT_CHI2_KEY].is_nan());
    }
}
