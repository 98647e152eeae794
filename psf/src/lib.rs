//! Spatially-varying PSF determination by principal component analysis.
//!
//! A run takes a masked image and a list of candidate stars and iterates a
//! robust fit: build a PCA kernel whose component amplitudes vary as
//! polynomials over the image, score every candidate against it, and reject
//! outliers by reduced chi-square and by spatial-interpolation residual. After
//! a fixed number of rounds one last fit over the survivors becomes the
//! returned model.
//!
//! Workflow: Sizing -> (Fitting -> Chi2Reject -> SpatialReject) x K -> Finalizing
//!
//! - [`kernel_size`]: pick one odd stamp size from the candidates' moments
//! - [`registry`]: grid of bounded per-cell candidate buckets
//! - [`delegate`]: PCA and spatial fitting behind the [`FitDelegate`] trait
//! - [`rejection`]: pure rejection rules and the escalating schedule
//! - [`determiner`]: the iteration loop
//! - [`finalize`]: star flags and quality metrics

pub mod candidate;
pub mod config;
pub mod delegate;
pub mod determiner;
pub mod error;
pub mod finalize;
pub mod kernel;
pub mod kernel_size;
pub mod registry;
pub mod rejection;

pub use candidate::{Candidate, CandidateId, CandidateStatus, Source, CHI2_UNSET};
pub use config::PcaPsfConfig;
pub use delegate::{FitDelegate, PcaFitDelegate};
pub use determiner::{PcaPsfDeterminer, PsfDetermination, RoundSummary};
pub use error::PsfError;
pub use finalize::{QualityReport, QualitySink};
pub use kernel::{FixedBasis, PcaPsf, SpatialKernel};
pub use registry::CandidateRegistry;
