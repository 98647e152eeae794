//! Kernel fitting behind a trait seam.
//!
//! The fit loop only decides *which* candidates take part; the numerical work
//! of building and scoring a kernel is done by a [`FitDelegate`].
//! [`PcaFitDelegate`] is the dense linear algebra implementation used by
//! default.

mod pca;
mod spatial;

pub use pca::PcaFitDelegate;

use shared::{BoundingBox, Stamp};

use crate::error::PsfError;
use crate::kernel::{FixedBasis, SpatialKernel};
use crate::registry::CandidateRegistry;

/// Inputs of [`FitDelegate::fit_pca_kernel`]
#[derive(Debug, Clone, Copy)]
pub struct PcaFitParams {
    /// Domain of the spatial polynomials
    pub bbox: BoundingBox,
    pub n_components: usize,
    pub spatial_order: usize,
    /// Side length of the stamps and basis images
    pub kernel_size: usize,
    /// Stars per cell entering the PCA (0 = all)
    pub max_per_cell: usize,
    pub constant_weight: bool,
}

/// Inputs of [`FitDelegate::fit_spatial_kernel`]
#[derive(Debug, Clone, Copy)]
pub struct SpatialFitParams {
    pub non_linear: bool,
    /// Stars per cell entering the spatial fit (0 = all)
    pub max_per_cell: usize,
    pub tolerance: f64,
    pub lambda: f64,
}

/// Freshly fit PCA kernel
#[derive(Debug, Clone)]
pub struct KernelFit {
    pub kernel: SpatialKernel,
    /// Raw PCA eigenvalues, largest first
    pub eigenvalues: Vec<f64>,
    /// Number of stamps that entered the PCA
    pub n_used: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    Converged,
    MaxIterations,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialFit {
    pub status: FitStatus,
    /// Overall reduced chi-square of the spatial model
    pub chi2: f64,
}

/// Amplitudes of a fixed basis fit to a single stamp
#[derive(Debug, Clone, PartialEq)]
pub struct SingleImageFit {
    pub amplitudes: Vec<f64>,
    /// `a_k / Σ_j a_j ΣB_j`: each component's share of the fitted flux
    pub weights: Vec<f64>,
}

impl SingleImageFit {
    /// Derive fractional weights from amplitudes and basis sums
    pub fn from_amplitudes(amplitudes: Vec<f64>, basis: &FixedBasis) -> Result<Self, PsfError> {
        let flux: f64 = amplitudes.iter().zip(&basis.sums).map(|(a, s)| a * s).sum();
        if !flux.is_finite() || flux.abs() < f64::EPSILON {
            return Err(PsfError::model_fit(format!(
                "single-image fit has no flux ({flux})"
            )));
        }
        let weights = amplitudes.iter().map(|a| a / flux).collect();
        Ok(Self {
            amplitudes,
            weights,
        })
    }
}

/// Numerical engine of the fit loop.
///
/// Implementations must be deterministic: the same registry contents and
/// parameters have to produce bit-identical kernels.
pub trait FitDelegate {
    /// Build a kernel by PCA over the usable stamps (not BAD, first
    /// `max_per_cell` per cell) and fit its spatial polynomials.
    ///
    /// Every candidate that has a stamp, BAD ones included, gets its reduced
    /// chi-square against the new kernel recorded.
    fn fit_pca_kernel(
        &self,
        registry: &mut CandidateRegistry,
        params: &PcaFitParams,
    ) -> Result<KernelFit, PsfError>;

    /// Refine the spatial polynomials of `kernel` in place and refresh every
    /// candidate's reduced chi-square against the refined kernel.
    fn fit_spatial_kernel(
        &self,
        kernel: &mut SpatialKernel,
        registry: &mut CandidateRegistry,
        params: &SpatialFitParams,
    ) -> Result<SpatialFit, PsfError>;

    /// Weighted least-squares amplitudes of `basis` for one stamp centred at
    /// parent position `center`.
    fn fit_single_image(
        &self,
        basis: &FixedBasis,
        stamp: &Stamp,
        center: (f64, f64),
    ) -> Result<SingleImageFit, PsfError>;
}
