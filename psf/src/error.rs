//! Error type for PSF determination.

use meter_math::MathError;
use shared::ImageError;
use thiserror::Error;

use crate::candidate::CandidateId;

#[derive(Error, Debug)]
pub enum PsfError {
    /// Unusable input such as an empty candidate list or a position outside
    /// the image
    #[error("Invalid input: {0}")]
    Input(String),

    /// A fit could not be carried out. `candidate` names the star when the
    /// failure is specific to one stamp.
    #[error("Fit failed{}: {reason}", .candidate.map(|id| format!(" for candidate {id}")).unwrap_or_default())]
    Fit {
        candidate: Option<CandidateId>,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PsfError {
    /// Fit failure tied to one candidate
    pub fn candidate_fit(candidate: CandidateId, reason: impl Into<String>) -> Self {
        Self::Fit {
            candidate: Some(candidate),
            reason: reason.into(),
        }
    }

    /// Fit failure of the model as a whole
    pub fn model_fit(reason: impl Into<String>) -> Self {
        Self::Fit {
            candidate: None,
            reason: reason.into(),
        }
    }
}

impl From<MathError> for PsfError {
    fn from(err: MathError) -> Self {
        Self::model_fit(err.to_string())
    }
}

impl From<ImageError> for PsfError {
    fn from(err: ImageError) -> Self {
        Self::Input(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_message_names_candidate() {
        let err = PsfError::candidate_fit(7, "no stamp");
        assert_eq!(err.to_string(), "Fit failed for candidate 7: no stamp");

        let err = PsfError::model_fit("no survivors");
        assert_eq!(err.to_string(), "Fit failed: no survivors");
    }

    #[test]
    fn test_math_error_becomes_fit_error() {
        let err: PsfError = MathError::Singular.into();
        assert!(matches!(err, PsfError::Fit { candidate: None, .. }));
    }
}
