//! Numeric building blocks shared by the PSF modelling crates.
//!
//! - [`stats`]: medians, percentiles and iterative sigma-clipped statistics
//! - [`poly2d`]: low-order 2-D polynomials used as spatial interpolants
//! - [`lstsq`]: dense linear least squares via SVD
//! - [`pca`]: principal components of a set of flattened images

pub mod lstsq;
pub mod pca;
pub mod poly2d;
pub mod stats;

use thiserror::Error;

pub use lstsq::solve_least_squares;
pub use pca::{principal_components, PcaDecomposition};
pub use poly2d::{Domain2D, Polynomial2D};
pub use stats::{median, sigma_clipped_stats, ClippedStats};

/// Errors raised by the numeric routines in this crate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MathError {
    #[error("Invalid argument: {0}")]
    ArgumentError(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Matrix is singular or has no usable rank")]
    Singular,

    #[error("Decomposition failed: {0}")]
    DecompositionFailed(&'static str),
}
