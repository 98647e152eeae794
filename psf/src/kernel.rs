//! Spatially varying PSF kernel.
//!
//! The model at position `(x, y)` is `K(x, y) = Σ_k f_k(x, y) B_k`, where the
//! `B_k` are fixed basis images from the PCA and each `f_k` is a 2-D
//! polynomial. The polynomials are fit to fractional weights, so
//! `Σ_k f_k(x, y) ΣB_k` is close to one everywhere in the fitted region.

use meter_math::Polynomial2D;
use ndarray::Array2;

use crate::error::PsfError;

#[derive(Debug, Clone, PartialEq)]
pub struct SpatialKernel {
    basis: Vec<Array2<f64>>,
    spatial: Vec<Polynomial2D>,
}

impl SpatialKernel {
    /// Combine basis images with one spatial polynomial each
    pub fn new(basis: Vec<Array2<f64>>, spatial: Vec<Polynomial2D>) -> Result<Self, PsfError> {
        if basis.is_empty() {
            return Err(PsfError::model_fit("kernel needs at least one basis image"));
        }
        if basis.len() != spatial.len() {
            return Err(PsfError::model_fit(format!(
                "{} basis images but {} spatial functions",
                basis.len(),
                spatial.len()
            )));
        }
        let shape = basis[0].dim();
        if shape.0 != shape.1 || basis.iter().any(|b| b.dim() != shape) {
            return Err(PsfError::model_fit(
                "basis images must be square and share one shape",
            ));
        }
        Ok(Self { basis, spatial })
    }

    pub fn n_components(&self) -> usize {
        self.basis.len()
    }

    /// Side length of the kernel images
    pub fn size(&self) -> usize {
        self.basis[0].nrows()
    }

    pub fn basis(&self) -> &[Array2<f64>] {
        &self.basis
    }

    pub fn spatial(&self) -> &[Polynomial2D] {
        &self.spatial
    }

    pub(crate) fn spatial_mut(&mut self) -> &mut [Polynomial2D] {
        &mut self.spatial
    }

    /// Coefficients of every spatial polynomial, component by component
    pub fn spatial_coefficients(&self) -> Vec<Vec<f64>> {
        self.spatial
            .iter()
            .map(|p| p.coefficients().to_vec())
            .collect()
    }

    /// Value of each spatial polynomial at `(x, y)`
    pub fn component_weights(&self, x: f64, y: f64) -> Vec<f64> {
        self.spatial.iter().map(|p| p.eval(x, y)).collect()
    }

    /// Unnormalised kernel image at `(x, y)`
    pub fn image_at(&self, x: f64, y: f64) -> Array2<f64> {
        let mut image = Array2::zeros(self.basis[0].dim());
        for (basis, weight) in self.basis.iter().zip(self.component_weights(x, y)) {
            image.scaled_add(weight, basis);
        }
        image
    }

    /// Kernel image at `(x, y)` scaled to unit sum
    pub fn compute_image(&self, x: f64, y: f64) -> Result<Array2<f64>, PsfError> {
        let image = self.image_at(x, y);
        let sum = image.sum();
        if !sum.is_finite() || sum.abs() < f64::EPSILON {
            return Err(PsfError::model_fit(format!(
                "kernel at ({x:.2}, {y:.2}) has no flux to normalise"
            )));
        }
        Ok(image / sum)
    }

    /// The basis images without their spatial variation
    pub fn without_spatial_variation(&self) -> FixedBasis {
        FixedBasis::new(self.basis.clone())
    }
}

/// Basis images with their pixel sums, for single-stamp fits
#[derive(Debug, Clone, PartialEq)]
pub struct FixedBasis {
    pub basis: Vec<Array2<f64>>,
    pub sums: Vec<f64>,
}

impl FixedBasis {
    pub fn new(basis: Vec<Array2<f64>>) -> Self {
        let sums = basis.iter().map(|b| b.sum()).collect();
        Self { basis, sums }
    }

    pub fn n_components(&self) -> usize {
        self.basis.len()
    }
}

/// Final PSF model of a determination run
#[derive(Debug, Clone, PartialEq)]
pub struct PcaPsf {
    kernel: SpatialKernel,
    eigenvalues: Vec<f64>,
}

impl PcaPsf {
    pub fn new(kernel: SpatialKernel, eigenvalues: Vec<f64>) -> Self {
        Self {
            kernel,
            eigenvalues,
        }
    }

    pub fn kernel(&self) -> &SpatialKernel {
        &self.kernel
    }

    /// Eigen-spectrum in reduced chi-square per star units, largest first
    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    /// Unit-sum PSF image at `(x, y)`
    pub fn compute_image(&self, x: f64, y: f64) -> Result<Array2<f64>, PsfError> {
        self.kernel.compute_image(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use meter_math::Domain2D;
    use ndarray::array;

    fn two_component_kernel() -> SpatialKernel {
        let domain = Domain2D::new(0.0, 100.0, 0.0, 100.0);
        let basis = vec![
            array![[0.0, 1.0, 0.0], [1.0, 2.0, 1.0], [0.0, 1.0, 0.0]],
            array![[1.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, -1.0]],
        ];
        let spatial = vec![
            Polynomial2D::with_coefficients(0, domain, vec![1.0 / 6.0]).unwrap(),
            // 0.5 * x in normalised coordinates
            Polynomial2D::with_coefficients(1, domain, vec![0.0, 0.5, 0.0]).unwrap(),
        ];
        SpatialKernel::new(basis, spatial).unwrap()
    }

    #[test]
    fn test_image_varies_with_position() {
        let kernel = two_component_kernel();
        assert_eq!(kernel.size(), 3);
        assert_eq!(kernel.n_components(), 2);

        let centre = kernel.image_at(50.0, 50.0);
        assert_relative_eq!(centre[[0, 0]], 0.0);
        assert_relative_eq!(centre[[1, 1]], 2.0 / 6.0);

        let right = kernel.image_at(100.0, 50.0);
        assert_relative_eq!(right[[0, 0]], 0.5);
        assert_relative_eq!(right[[2, 2]], -0.5);
        assert_eq!(kernel.component_weights(100.0, 50.0), vec![1.0 / 6.0, 0.5]);
    }

    #[test]
    fn test_compute_image_has_unit_sum() {
        let kernel = two_component_kernel();
        for &(x, y) in &[(0.0, 0.0), (30.0, 70.0), (100.0, 100.0)] {
            let image = kernel.compute_image(x, y).unwrap();
            assert_relative_eq!(image.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_zero_kernel_cannot_be_normalised() {
        let domain = Domain2D::new(0.0, 1.0, 0.0, 1.0);
        let kernel = SpatialKernel::new(
            vec![Array2::ones((3, 3))],
            vec![Polynomial2D::new(0, domain)],
        )
        .unwrap();
        assert!(kernel.compute_image(0.5, 0.5).is_err());
    }

    #[test]
    fn test_fixed_basis_sums() {
        let fixed = two_component_kernel().without_spatial_variation();
        assert_eq!(fixed.n_components(), 2);
        assert_eq!(fixed.sums, vec![6.0, 0.0]);
    }

    #[test]
    fn test_mismatched_parts_rejected() {
        let domain = Domain2D::new(0.0, 1.0, 0.0, 1.0);
        assert!(SpatialKernel::new(Vec::new(), Vec::new()).is_err());
        assert!(SpatialKernel::new(
            vec![Array2::ones((3, 3)), Array2::ones((5, 5))],
            vec![Polynomial2D::new(0, domain), Polynomial2D::new(0, domain)],
        )
        .is_err());
        assert!(SpatialKernel::new(vec![Array2::ones((3, 3))], Vec::new()).is_err());
    }
}
