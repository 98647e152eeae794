//! Principal component analysis of a stack of flattened images.
//!
//! The decomposition works on the uncentred data: with PSF stamps normalised to
//! unit flux the leading component is then the mean profile and the remaining
//! components describe departures from it. Eigenpairs come from the small
//! `n_obs x n_obs` Gram matrix, which is much cheaper than the pixel covariance
//! when there are far fewer stars than pixels per stamp.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ndarray::ArrayView2;

use crate::MathError;

/// Eigenvalues below this fraction of the largest carry no usable direction
const EIGEN_CUTOFF: f64 = 1e-12;

/// Leading principal components of a data set
#[derive(Debug, Clone, PartialEq)]
pub struct PcaDecomposition {
    /// Eigenvalues of the scatter matrix, largest first
    pub eigenvalues: Vec<f64>,
    /// Unit-norm component vectors, one per eigenvalue, each oriented to a
    /// non-negative sum
    pub components: Vec<Vec<f64>>,
}

impl PcaDecomposition {
    pub fn n_components(&self) -> usize {
        self.components.len()
    }
}

/// Compute up to `n_components` principal components of `data`.
///
/// Each row of `data` is one observation (e.g. a flattened stamp). Fewer
/// components than requested are returned when the data has lower rank.
///
/// # Errors
/// * `MathError::ArgumentError` - no rows, no columns, non-finite entries or
///   `n_components == 0`
/// * `MathError::Singular` - every observation is zero
pub fn principal_components(
    data: ArrayView2<f64>,
    n_components: usize,
) -> Result<PcaDecomposition, MathError> {
    let (n_obs, n_features) = data.dim();
    if n_obs == 0 || n_features == 0 {
        return Err(MathError::ArgumentError(format!(
            "PCA needs a non-empty data matrix, got {n_obs}x{n_features}"
        )));
    }
    if n_components == 0 {
        return Err(MathError::ArgumentError(
            "PCA needs at least one component".to_string(),
        ));
    }
    if data.iter().any(|v| !v.is_finite()) {
        return Err(MathError::ArgumentError(
            "PCA data contains non-finite values".to_string(),
        ));
    }

    let matrix = DMatrix::from_fn(n_obs, n_features, |i, j| data[[i, j]]);
    let gram = &matrix * matrix.transpose();
    let eigen = SymmetricEigen::new(gram);

    let mut order: Vec<usize> = (0..n_obs).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let largest = eigen.eigenvalues[order[0]];
    if largest <= 0.0 {
        return Err(MathError::Singular);
    }

    let mut eigenvalues = Vec::new();
    let mut components = Vec::new();
    for &idx in order.iter().take(n_components) {
        let lambda = eigen.eigenvalues[idx];
        if lambda <= largest * EIGEN_CUTOFF {
            break;
        }

        // Map the observation-space eigenvector back to feature space
        let weights: DVector<f64> = eigen.eigenvectors.column(idx).into_owned();
        let mut component: Vec<f64> = (matrix.transpose() * weights / lambda.sqrt())
            .iter()
            .copied()
            .collect();

        if component.iter().sum::<f64>() < 0.0 {
            component.iter_mut().for_each(|v| *v = -*v);
        }

        eigenvalues.push(lambda);
        components.push(component);
    }

    Ok(PcaDecomposition {
        eigenvalues,
        components,
    })
}
