//! Dense PCA fit delegate.

use meter_math::{principal_components, solve_least_squares, Domain2D, Polynomial2D};
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use shared::{BoundingBox, Stamp};

use super::spatial::{refine_spatial, spatial_chi2};
use super::{
    FitDelegate, FitStatus, KernelFit, PcaFitParams, SingleImageFit, SpatialFit,
    SpatialFitParams,
};
use crate::candidate::CandidateId;
use crate::error::PsfError;
use crate::kernel::{FixedBasis, SpatialKernel};
use crate::registry::CandidateRegistry;

/// Reference [`FitDelegate`] built on `nalgebra` dense linear algebra.
///
/// Stamps are normalised to unit flux before the PCA and the decomposition is
/// not mean-subtracted, so the first basis image is the mean PSF. Spatial
/// polynomials are fit to each star's fractional component weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcaFitDelegate;

impl PcaFitDelegate {
    pub fn new() -> Self {
        Self
    }
}

/// Best-fit scaling of a model image to one stamp
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) struct ScaledResidual {
    pub amplitude: f64,
    /// `Σ (I - A K)² / var` over the pixels used
    pub chi2_sum: f64,
    pub n_pixels: usize,
}

/// Fit `stamp ≈ A * model` by weighted least squares.
///
/// Pixels with non-positive or non-finite variance are skipped. `None` when
/// the model has no support on the usable pixels.
pub(super) fn scale_to_stamp(model: &Array2<f64>, stamp: &Stamp) -> Option<ScaledResidual> {
    if model.dim() != stamp.image.dim() {
        return None;
    }
    let pixels = || {
        model
            .iter()
            .zip(stamp.image.iter())
            .zip(stamp.variance.iter())
            .filter(|(_, &v)| v > 0.0 && v.is_finite())
            .map(|((&k, &i), &v)| (k, i, v))
    };

    let (mut num, mut den) = (0.0, 0.0);
    for (k, i, v) in pixels() {
        num += k * i / v;
        den += k * k / v;
    }
    if !(den > 0.0 && den.is_finite()) {
        return None;
    }
    let amplitude = num / den;

    let mut chi2_sum = 0.0;
    let mut n_pixels = 0;
    for (k, i, v) in pixels() {
        let r = i - amplitude * k;
        chi2_sum += r * r / v;
        n_pixels += 1;
    }
    Some(ScaledResidual {
        amplitude,
        chi2_sum,
        n_pixels,
    })
}

/// Reduced chi-square of a stamp against a model image, NaN when undefined
pub(super) fn reduced_chi2(model: &Array2<f64>, stamp: &Stamp) -> f64 {
    match scale_to_stamp(model, stamp) {
        Some(fit) if fit.n_pixels > 1 => fit.chi2_sum / (fit.n_pixels - 1) as f64,
        _ => f64::NAN,
    }
}

/// Weighted least-squares amplitudes of `basis` for one stamp
fn fit_amplitudes(basis: &[Array2<f64>], stamp: &Stamp) -> Result<Vec<f64>, PsfError> {
    if basis.iter().any(|b| b.dim() != stamp.image.dim()) {
        return Err(PsfError::model_fit(format!(
            "stamp of size {} does not match the kernel",
            stamp.size()
        )));
    }

    let pixels: Vec<usize> = stamp
        .variance
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > 0.0 && v.is_finite())
        .map(|(p, _)| p)
        .collect();
    if pixels.len() < basis.len() {
        return Err(PsfError::model_fit(format!(
            "only {} usable pixels for {} components",
            pixels.len(),
            basis.len()
        )));
    }

    let flat_image: Vec<f64> = stamp.image.iter().copied().collect();
    let inv_sigma: Vec<f64> = stamp.variance.iter().map(|v| 1.0 / v.sqrt()).collect();
    let flat_basis: Vec<Vec<f64>> = basis.iter().map(|b| b.iter().copied().collect()).collect();

    let design = DMatrix::from_fn(pixels.len(), basis.len(), |row, col| {
        let p = pixels[row];
        flat_basis[col][p] * inv_sigma[p]
    });
    let rhs = DVector::from_fn(pixels.len(), |row, _| {
        let p = pixels[row];
        flat_image[p] * inv_sigma[p]
    });
    let solution = solve_least_squares(&design, &rhs)?;
    Ok(solution.iter().copied().collect())
}

fn domain_of(bbox: &BoundingBox) -> Domain2D {
    Domain2D::new(
        bbox.x_min as f64,
        bbox.x_max() as f64,
        bbox.y_min as f64,
        bbox.y_max() as f64,
    )
}

/// Fit one polynomial per component to the stars' fractional weights.
fn fit_spatial_polynomials(
    delegate: &PcaFitDelegate,
    fixed: &FixedBasis,
    registry: &CandidateRegistry,
    ids: &[CandidateId],
    order: usize,
    domain: Domain2D,
) -> Result<Vec<Polynomial2D>, PsfError> {
    let mut points = Vec::with_capacity(ids.len());
    let mut weights: Vec<Vec<f64>> = vec![Vec::with_capacity(ids.len()); fixed.n_components()];

    for &id in ids {
        let Some(candidate) = registry.get(id) else {
            continue;
        };
        let center = (candidate.x(), candidate.y());
        let fit = candidate
            .stamp()
            .and_then(|stamp| delegate.fit_single_image(fixed, stamp, center));
        match fit {
            Ok(fit) => {
                points.push((candidate.x(), candidate.y()));
                for (column, w) in weights.iter_mut().zip(fit.weights) {
                    column.push(w);
                }
            }
            Err(err) => log::debug!("Candidate {id} left out of spatial fit: {err}"),
        }
    }

    if points.is_empty() {
        return Err(PsfError::model_fit(
            "no candidate could be fit for the spatial model",
        ));
    }

    weights
        .iter()
        .map(|values| Polynomial2D::fit(order, domain, &points, values).map_err(PsfError::from))
        .collect()
}

/// Record every stamped candidate's reduced chi-square against `kernel`
fn refresh_chi2(kernel: &SpatialKernel, registry: &mut CandidateRegistry) {
    for candidate in registry.candidates_mut() {
        let chi2 = match candidate.stamp() {
            Ok(stamp) => reduced_chi2(&kernel.image_at(candidate.x(), candidate.y()), stamp),
            Err(_) => continue,
        };
        candidate.set_chi2(chi2);
    }
}

impl FitDelegate for PcaFitDelegate {
    fn fit_pca_kernel(
        &self,
        registry: &mut CandidateRegistry,
        params: &PcaFitParams,
    ) -> Result<KernelFit, PsfError> {
        let ids = registry.usable_per_cell(params.max_per_cell);
        if ids.is_empty() {
            return Err(PsfError::model_fit("no usable candidates for the PCA"));
        }

        let size = params.kernel_size;
        let n_pixels = size * size;
        let max_flux = ids
            .iter()
            .filter_map(|&id| registry.get(id))
            .map(|c| c.source().flux)
            .fold(0.0_f64, f64::max);

        let mut rows = Vec::with_capacity(ids.len() * n_pixels);
        let mut used = Vec::with_capacity(ids.len());
        for &id in &ids {
            let Some(candidate) = registry.get(id) else {
                continue;
            };
            let stamp = candidate.stamp()?;
            if stamp.size() != size {
                return Err(PsfError::candidate_fit(
                    id,
                    format!("stamp size {} differs from kernel size {size}", stamp.size()),
                ));
            }
            let sum = stamp.sum();
            if !(sum > 0.0 && sum.is_finite()) {
                log::debug!("Candidate {id} has non-positive stamp flux {sum}, skipped in PCA");
                continue;
            }
            let weight = if params.constant_weight || max_flux <= 0.0 {
                1.0
            } else {
                (candidate.source().flux.max(0.0) / max_flux).sqrt()
            };
            rows.extend(stamp.image.iter().map(|v| v / sum * weight));
            used.push(id);
        }
        if used.is_empty() {
            return Err(PsfError::model_fit("no stamp with positive flux for the PCA"));
        }

        let data = Array2::from_shape_vec((used.len(), n_pixels), rows)
            .map_err(|e| PsfError::model_fit(e.to_string()))?;
        let pca = principal_components(data.view(), params.n_components)?;

        let basis = pca
            .components
            .into_iter()
            .map(|c| Array2::from_shape_vec((size, size), c))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PsfError::model_fit(e.to_string()))?;

        let fixed = FixedBasis::new(basis.clone());
        let spatial = fit_spatial_polynomials(
            self,
            &fixed,
            registry,
            &used,
            params.spatial_order,
            domain_of(&params.bbox),
        )?;
        let kernel = SpatialKernel::new(basis, spatial)?;
        refresh_chi2(&kernel, registry);

        log::debug!(
            "PCA kernel from {} stamps, {} components, leading eigenvalue {:.4e}",
            used.len(),
            kernel.n_components(),
            pca.eigenvalues[0]
        );

        Ok(KernelFit {
            kernel,
            eigenvalues: pca.eigenvalues,
            n_used: used.len(),
        })
    }

    fn fit_spatial_kernel(
        &self,
        kernel: &mut SpatialKernel,
        registry: &mut CandidateRegistry,
        params: &SpatialFitParams,
    ) -> Result<SpatialFit, PsfError> {
        let ids = registry.usable_per_cell(params.max_per_cell);
        if ids.is_empty() {
            return Err(PsfError::model_fit("no usable candidates for the spatial fit"));
        }

        let order = kernel.spatial()[0].order();
        let domain = *kernel.spatial()[0].domain();
        let fixed = kernel.without_spatial_variation();
        let spatial = fit_spatial_polynomials(self, &fixed, registry, &ids, order, domain)?;
        for (current, fitted) in kernel.spatial_mut().iter_mut().zip(spatial) {
            *current = fitted;
        }

        let status = if params.non_linear {
            refine_spatial(kernel, registry, &ids, params)?
        } else {
            FitStatus::Converged
        };

        let chi2 = spatial_chi2(kernel, registry, &ids);
        refresh_chi2(kernel, registry);
        Ok(SpatialFit { status, chi2 })
    }

    fn fit_single_image(
        &self,
        basis: &FixedBasis,
        stamp: &Stamp,
        center: (f64, f64),
    ) -> Result<SingleImageFit, PsfError> {
        // Basis images are centred on the stamp's middle pixel
        let (lx, ly) = stamp.local(center.0, center.1);
        let middle = (stamp.size() / 2) as f64;
        if lx.round() != middle || ly.round() != middle {
            return Err(PsfError::model_fit(format!(
                "position ({:.2}, {:.2}) is not at the centre of its stamp",
                center.0, center.1
            )));
        }
        let amplitudes = fit_amplitudes(&basis.basis, stamp)?;
        SingleImageFit::from_amplitudes(amplitudes, basis)
    }
}
