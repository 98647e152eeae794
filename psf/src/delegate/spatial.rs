//! Spatial model quality and Levenberg-Marquardt refinement.
//!
//! The refinement adjusts every spatial coefficient at once against the pixel
//! residuals of the spatial-fit stars. Each star's amplitude is solved in
//! closed form for the current coefficients and held fixed while the
//! Jacobian is formed. The chi-square is invariant to an overall scale of the
//! coefficients, which lets the result be renormalised to unit flux
//! afterwards without changing its quality.

use meter_math::solve_least_squares;
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use shared::Stamp;

use super::pca::scale_to_stamp;
use super::{FitStatus, SpatialFitParams};
use crate::candidate::CandidateId;
use crate::error::PsfError;
use crate::kernel::SpatialKernel;
use crate::registry::CandidateRegistry;

const MAX_ITERATIONS: usize = 50;

/// Damping beyond which no improving step is expected
const MAX_LAMBDA: f64 = 1e10;

/// Damping used after a rejected step when the configured one is zero
const FALLBACK_LAMBDA: f64 = 1e-3;

struct SpatialStar<'a> {
    stamp: &'a Stamp,
    /// Polynomial terms at the star position
    terms: Vec<f64>,
}

fn collect_stars<'a>(
    kernel: &SpatialKernel,
    registry: &'a CandidateRegistry,
    ids: &[CandidateId],
) -> Vec<SpatialStar<'a>> {
    let template = &kernel.spatial()[0];
    ids.iter()
        .filter_map(|&id| registry.get(id))
        .filter_map(|c| {
            c.stamp().ok().map(|stamp| SpatialStar {
                stamp,
                terms: template.terms(c.x(), c.y()),
            })
        })
        .collect()
}

/// Kernel image for a flat coefficient vector laid out component-major
fn model_image(basis: &[Array2<f64>], theta: &[f64], terms: &[f64]) -> Array2<f64> {
    let n_terms = terms.len();
    let mut image = Array2::zeros(basis[0].dim());
    for (k, b) in basis.iter().enumerate() {
        let weight: f64 = theta[k * n_terms..(k + 1) * n_terms]
            .iter()
            .zip(terms)
            .map(|(c, t)| c * t)
            .sum();
        image.scaled_add(weight, b);
    }
    image
}

fn total_chi2(basis: &[Array2<f64>], theta: &[f64], stars: &[SpatialStar]) -> f64 {
    stars
        .iter()
        .filter_map(|s| scale_to_stamp(&model_image(basis, theta, &s.terms), s.stamp))
        .map(|fit| fit.chi2_sum)
        .sum()
}

/// Gauss-Newton normal equations `(JᵀJ, Jᵀr)` at `theta`.
///
/// For one star the Jacobian entry of coefficient `(k, t)` at pixel `p` is
/// `A B_k(p) T_t / σ_p`, so `JᵀJ` factors into the outer product of the terms
/// times the basis cross products `G_kk' = Σ_p A² B_k B_k' / σ²`.
fn normal_equations(
    basis: &[Array2<f64>],
    theta: &[f64],
    stars: &[SpatialStar],
) -> (DMatrix<f64>, DVector<f64>) {
    let n_comp = basis.len();
    let n_terms = theta.len() / n_comp;
    let n_params = theta.len();
    let mut jtj = DMatrix::zeros(n_params, n_params);
    let mut jtr = DVector::zeros(n_params);
    let flat_basis: Vec<Vec<f64>> = basis.iter().map(|b| b.iter().copied().collect()).collect();

    for star in stars {
        let model = model_image(basis, theta, &star.terms);
        let Some(fit) = scale_to_stamp(&model, star.stamp) else {
            continue;
        };
        let a = fit.amplitude;

        let mut gram = DMatrix::<f64>::zeros(n_comp, n_comp);
        let mut proj = DVector::<f64>::zeros(n_comp);
        for (p, ((&value, &var), &m)) in star
            .stamp
            .image
            .iter()
            .zip(star.stamp.variance.iter())
            .zip(model.iter())
            .enumerate()
        {
            if !(var > 0.0 && var.is_finite()) {
                continue;
            }
            let residual = value - a * m;
            let g: Vec<f64> = flat_basis.iter().map(|b| a * b[p]).collect();
            for k in 0..n_comp {
                proj[k] += g[k] * residual / var;
                for l in 0..n_comp {
                    gram[(k, l)] += g[k] * g[l] / var;
                }
            }
        }

        for k in 0..n_comp {
            for t in 0..n_terms {
                let row = k * n_terms + t;
                jtr[row] += star.terms[t] * proj[k];
                for l in 0..n_comp {
                    for u in 0..n_terms {
                        jtj[(row, l * n_terms + u)] += star.terms[t] * star.terms[u] * gram[(k, l)];
                    }
                }
            }
        }
    }
    (jtj, jtr)
}

/// Overall reduced chi-square of the kernel over the spatial-fit stars.
///
/// Degrees of freedom are the used pixels minus one amplitude per star and
/// the spatial coefficients. NaN when no star could be scored.
pub(super) fn spatial_chi2(
    kernel: &SpatialKernel,
    registry: &CandidateRegistry,
    ids: &[CandidateId],
) -> f64 {
    let mut chi2 = 0.0;
    let mut n_pixels = 0usize;
    let mut n_stars = 0usize;
    for candidate in ids.iter().filter_map(|&id| registry.get(id)) {
        let Ok(stamp) = candidate.stamp() else {
            continue;
        };
        if let Some(fit) = scale_to_stamp(&kernel.image_at(candidate.x(), candidate.y()), stamp) {
            chi2 += fit.chi2_sum;
            n_pixels += fit.n_pixels;
            n_stars += 1;
        }
    }
    if n_pixels == 0 {
        return f64::NAN;
    }
    let n_params = n_stars + kernel.spatial().iter().map(|p| p.n_terms()).sum::<usize>();
    let dof = if n_pixels > n_params {
        n_pixels - n_params
    } else {
        n_pixels
    };
    chi2 / dof as f64
}

/// Levenberg-Marquardt refinement of the spatial coefficients in place.
///
/// Starts from the current (linear) solution and only accepts steps that
/// lower the chi-square, so the result is never worse than the start.
pub(super) fn refine_spatial(
    kernel: &mut SpatialKernel,
    registry: &CandidateRegistry,
    ids: &[CandidateId],
    params: &SpatialFitParams,
) -> Result<FitStatus, PsfError> {
    let stars = collect_stars(kernel, registry, ids);
    if stars.is_empty() {
        return Err(PsfError::model_fit("no stamps for the non-linear spatial fit"));
    }
    let basis = kernel.basis().to_vec();
    let n_terms = kernel.spatial()[0].n_terms();
    let mut theta: Vec<f64> = kernel.spatial_coefficients().concat();

    let mut current = total_chi2(&basis, &theta, &stars);
    if !current.is_finite() {
        return Err(PsfError::model_fit("spatial chi-square is not finite"));
    }

    let mut lambda = params.lambda;
    let mut status = FitStatus::MaxIterations;
    for iteration in 0..MAX_ITERATIONS {
        let (jtj, jtr) = normal_equations(&basis, &theta, &stars);
        let mut damped = jtj.clone();
        for i in 0..damped.nrows() {
            let d = jtj[(i, i)];
            damped[(i, i)] += lambda * if d > 0.0 { d } else { 1.0 };
        }
        let step = solve_least_squares(&damped, &jtr)?;
        let trial: Vec<f64> = theta.iter().zip(step.iter()).map(|(t, s)| t + s).collect();
        let trial_chi2 = total_chi2(&basis, &trial, &stars);

        if trial_chi2.is_finite() && trial_chi2 < current {
            let change = (current - trial_chi2) / current.max(f64::MIN_POSITIVE);
            theta = trial;
            current = trial_chi2;
            lambda /= 10.0;
            if change < params.tolerance {
                log::debug!("Non-linear spatial fit converged after {} iterations", iteration + 1);
                status = FitStatus::Converged;
                break;
            }
        } else {
            lambda = if lambda == 0.0 {
                FALLBACK_LAMBDA
            } else {
                lambda * 10.0
            };
            if lambda > MAX_LAMBDA {
                status = FitStatus::Converged;
                break;
            }
        }
    }

    // Scale so the kernel integrates to one on average over the stars
    let sums: Vec<f64> = basis.iter().map(|b| b.sum()).collect();
    let mean_flux = stars
        .iter()
        .map(|s| {
            sums.iter()
                .enumerate()
                .map(|(k, sum)| {
                    let w: f64 = theta[k * n_terms..(k + 1) * n_terms]
                        .iter()
                        .zip(&s.terms)
                        .map(|(c, t)| c * t)
                        .sum();
                    w * sum
                })
                .sum::<f64>()
        })
        .sum::<f64>()
        / stars.len() as f64;
    if mean_flux.is_finite() && mean_flux.abs() > f64::EPSILON {
        theta.iter_mut().for_each(|c| *c /= mean_flux);
    }

    for (k, poly) in kernel.spatial_mut().iter_mut().enumerate() {
        poly.set_coefficients(&theta[k * n_terms..(k + 1) * n_terms])?;
    }
    Ok(status)
}
