//! Dense linear least squares.

use nalgebra::{DMatrix, DVector};

use crate::MathError;

/// Relative cutoff below which singular values are treated as zero
const RCOND: f64 = 1e-12;

/// Solve `min ||A x - b||²` with an SVD.
///
/// Rank-deficient systems get the minimum-norm solution; singular values
/// smaller than `1e-12` times the largest one are dropped.
///
/// # Errors
/// * `MathError::DimensionMismatch` - `b` does not have one entry per row of `A`
/// * `MathError::Singular` - `A` is empty or identically zero
/// * `MathError::DecompositionFailed` - the SVD did not produce U / Vᵀ
pub fn solve_least_squares(
    design: &DMatrix<f64>,
    rhs: &DVector<f64>,
) -> Result<DVector<f64>, MathError> {
    if design.nrows() != rhs.len() {
        return Err(MathError::DimensionMismatch {
            expected: design.nrows(),
            actual: rhs.len(),
        });
    }
    if design.nrows() == 0 || design.ncols() == 0 {
        return Err(MathError::Singular);
    }
    if design.iter().chain(rhs.iter()).any(|v| !v.is_finite()) {
        return Err(MathError::ArgumentError(
            "least-squares inputs contain non-finite values".to_string(),
        ));
    }

    let svd = design.clone().svd(true, true);
    let largest = svd.singular_values.iter().copied().fold(0.0_f64, f64::max);
    if largest <= 0.0 {
        return Err(MathError::Singular);
    }

    svd.solve(rhs, largest * RCOND)
        .map_err(MathError::DecompositionFailed)
}
