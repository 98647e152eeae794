//! The robust iterative PSF fit loop.
//!
//! ```text
//! Sizing -> { Fitting -> Chi2Reject -> SpatialReject } x K -> Fitting -> Finalizing
//! ```
//!
//! Every round fits with the statuses left by the previous round (BAD stars
//! are left out), then resets all candidates to UNKNOWN and judges them afresh
//! against the new fit. A star rejected early can therefore come back once
//! the kernel is no longer distorted by worse stars, while the escalating
//! [`RejectionSchedule`] guarantees the last round removes every outlier it
//! finds. The kernel returned is one extra fit over the last round's
//! survivors.

use shared::MaskedImage;

use crate::candidate::{Candidate, CandidateId, CandidateStatus};
use crate::config::PcaPsfConfig;
use crate::delegate::{FitDelegate, KernelFit, PcaFitDelegate, PcaFitParams, SpatialFitParams};
use crate::error::PsfError;
use crate::finalize::{finalize, QualityReport, QualitySink};
use crate::kernel::{PcaPsf, SpatialKernel};
use crate::kernel_size::compute_kernel_size;
use crate::registry::{CandidateRegistry, InsertOutcome};
use crate::rejection::{chi2_rejections, spatial_rejections, RejectionSchedule};

/// What happened in one fit/reject round
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    pub round: usize,
    /// Stamps that entered the PCA
    pub n_fit: usize,
    /// Largest eigenvalue, in the units of [`PcaPsf::eigenvalues`]
    pub leading_eigenvalue: f64,
    pub spatial_chi2: f64,
    pub chi2_pool: usize,
    pub chi2_rejected: usize,
    /// Candidates with a negative chi-square this round
    pub anomalies: usize,
    pub spatial_rejected: usize,
    /// Survivors whose single-image fit failed during the spatial pass
    pub spatial_skipped: usize,
    /// BAD candidates at the end of the round
    pub n_bad: usize,
}

/// Result of [`PcaPsfDeterminer::determine_psf`]
#[derive(Debug, Clone)]
pub struct PsfDetermination {
    pub psf: PcaPsf,
    /// Candidates with their final statuses and chi-squares
    pub registry: CandidateRegistry,
    pub quality: QualityReport,
    /// Kernel size chosen from the candidates' moments
    pub kernel_size: usize,
    pub rounds: Vec<RoundSummary>,
}

/// Kernel of one fitting step with its quality numbers
struct RoundFit {
    fit: KernelFit,
    spatial_chi2: f64,
}

/// Eigenvalues in reduced chi-square per star: `lambda / (n_used * (stamp^2 - 1))`
fn normalized_eigenvalues(fit: &KernelFit, stamp_size: usize) -> Vec<f64> {
    let nu = (stamp_size * stamp_size) as f64 - 1.0;
    fit.eigenvalues
        .iter()
        .map(|lambda| lambda / (fit.n_used as f64 * nu))
        .collect()
}

pub struct PcaPsfDeterminer<D: FitDelegate = PcaFitDelegate> {
    config: PcaPsfConfig,
    delegate: D,
}

impl PcaPsfDeterminer<PcaFitDelegate> {
    /// Determiner using the dense PCA delegate
    pub fn new(config: PcaPsfConfig) -> Result<Self, PsfError> {
        Self::with_delegate(config, PcaFitDelegate)
    }
}

impl<D: FitDelegate> PcaPsfDeterminer<D> {
    pub fn with_delegate(config: PcaPsfConfig, delegate: D) -> Result<Self, PsfError> {
        config.validate()?;
        Ok(Self { config, delegate })
    }

    pub fn config(&self) -> &PcaPsfConfig {
        &self.config
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    /// Determine the PSF of `image` from `candidates`.
    ///
    /// # Errors
    /// * `PsfError::Input` - no candidates, or a candidate outside the image
    /// * `PsfError::Fit` - no usable candidate is left for a fit
    pub fn determine_psf(
        &self,
        image: &MaskedImage,
        candidates: Vec<Candidate>,
        sink: Option<&mut dyn QualitySink>,
    ) -> Result<PsfDetermination, PsfError> {
        if candidates.is_empty() {
            return Err(PsfError::Input("no PSF candidates supplied".to_string()));
        }
        let config = &self.config;

        // Sizing
        let kernel_size = compute_kernel_size(
            candidates.iter().map(Candidate::source),
            config.kernel_size,
            config.kernel_size_min,
            config.kernel_size_max,
        )?;
        let stamp_size = config.stamp_size(kernel_size);

        let mut registry = CandidateRegistry::new(
            image.bbox(),
            config.size_cell_x,
            config.size_cell_y,
            config.max_candidates_per_cell,
        )?;
        for candidate in candidates {
            if let InsertOutcome::Evicted { evicted, .. } = registry.insert(candidate)? {
                log::debug!("Candidate {evicted} evicted from a full cell");
            }
        }
        let missing = registry.extract_stamps(image, stamp_size);
        if !missing.is_empty() {
            log::warn!(
                "{} of {} candidates too close to the edge for a {}x{} stamp",
                missing.len(),
                registry.len(),
                stamp_size,
                stamp_size
            );
        }

        let schedule = RejectionSchedule::new(config.n_iterations);
        let mut rounds = Vec::with_capacity(config.n_iterations);

        for round in 0..config.n_iterations {
            // Fitting
            let current = self.fit_kernel(&mut registry, stamp_size)?;
            registry.reset_statuses();

            // Chi2Reject
            let scores: Vec<(CandidateId, f64)> = registry
                .iter(true)
                .map(|c| (c.id(), c.chi2()))
                .collect();
            let chi2 = chi2_rejections(&scores, config.reduced_chi2_threshold, &schedule, round);
            for &id in &chi2.anomalies {
                log::warn!("Candidate {id} has a negative reduced chi-square");
            }
            for &id in &chi2.rejected {
                if let Some(candidate) = registry.get(id) {
                    log::debug!(
                        "Rejecting candidate {id} at ({:.1}, {:.1}): chi2 {:.3}",
                        candidate.x(),
                        candidate.y(),
                        candidate.chi2()
                    );
                }
                registry.set_status(id, CandidateStatus::Bad)?;
            }

            // SpatialReject
            let (spatial_rejected, spatial_skipped) =
                self.reject_spatial_outliers(&mut registry, &current.fit.kernel, &schedule, round)?;

            let summary = RoundSummary {
                round,
                n_fit: current.fit.n_used,
                leading_eigenvalue: normalized_eigenvalues(&current.fit, stamp_size)
                    .first()
                    .copied()
                    .unwrap_or(f64::NAN),
                spatial_chi2: current.spatial_chi2,
                chi2_pool: chi2.pool_size,
                chi2_rejected: chi2.rejected.len(),
                anomalies: chi2.anomalies.len(),
                spatial_rejected,
                spatial_skipped,
                n_bad: registry.count(true) - registry.count(false),
            };
            log::info!(
                "Round {}/{}: fit {} stars, spatial chi2 {:.3}, rejected {} by chi2 (pool {}) and {} spatially, {} bad",
                round + 1,
                config.n_iterations,
                summary.n_fit,
                summary.spatial_chi2,
                summary.chi2_rejected,
                summary.chi2_pool,
                summary.spatial_rejected,
                summary.n_bad
            );
            rounds.push(summary);
        }

        // Final fit over the last round's survivors
        let last = self.fit_kernel(&mut registry, stamp_size)?;
        let eigenvalues = normalized_eigenvalues(&last.fit, stamp_size);
        let psf = PcaPsf::new(last.fit.kernel, eigenvalues);

        let quality = finalize(&mut registry, last.spatial_chi2, sink);
        Ok(PsfDetermination {
            psf,
            registry,
            quality,
            kernel_size,
            rounds,
        })
    }

    /// PCA fit followed by the spatial fit, over the non-BAD stamps
    fn fit_kernel(
        &self,
        registry: &mut CandidateRegistry,
        stamp_size: usize,
    ) -> Result<RoundFit, PsfError> {
        let config = &self.config;
        if registry.usable_per_cell(0).is_empty() {
            return Err(PsfError::model_fit(format!(
                "no usable PSF candidates left out of {}",
                registry.len()
            )));
        }

        let pca = PcaFitParams {
            bbox: registry.bbox(),
            n_components: config.n_eigen_components,
            spatial_order: config.spatial_order,
            kernel_size: stamp_size,
            max_per_cell: config.n_star_per_cell,
            constant_weight: config.constant_weight,
        };
        let mut fit = self.delegate.fit_pca_kernel(registry, &pca)?;

        let spatial = SpatialFitParams {
            non_linear: config.non_linear_spatial_fit,
            max_per_cell: config.n_star_per_cell_spatial_fit,
            tolerance: config.tolerance,
            lambda: config.damping_lambda,
        };
        let spatial_fit = self
            .delegate
            .fit_spatial_kernel(&mut fit.kernel, registry, &spatial)?;

        Ok(RoundFit {
            fit,
            spatial_chi2: spatial_fit.chi2,
        })
    }

    /// Mark survivors whose component weights stray from the spatial model.
    ///
    /// Returns the number rejected and the number skipped because their
    /// single-image fit failed.
    fn reject_spatial_outliers(
        &self,
        registry: &mut CandidateRegistry,
        kernel: &SpatialKernel,
        schedule: &RejectionSchedule,
        round: usize,
    ) -> Result<(usize, usize), PsfError> {
        let fixed = kernel.without_spatial_variation();
        let mut residuals = Vec::new();
        let mut skipped = 0;

        for candidate in registry.iter(false) {
            let fit = candidate.stamp().and_then(|stamp| {
                self.delegate
                    .fit_single_image(&fixed, stamp, (candidate.x(), candidate.y()))
            });
            match fit {
                Ok(fit) => {
                    let predicted = kernel.component_weights(candidate.x(), candidate.y());
                    let residual = fit
                        .weights
                        .iter()
                        .zip(predicted)
                        .map(|(w, p)| w - p)
                        .collect();
                    residuals.push((candidate.id(), residual));
                }
                Err(err) => {
                    log::debug!(
                        "Skipping candidate {} in spatial rejection: {err}",
                        candidate.id()
                    );
                    skipped += 1;
                }
            }
        }

        let rejection = spatial_rejections(
            &residuals,
            self.config.spatial_reject_sigma,
            schedule,
            round,
        );
        for (k, component) in rejection.components.iter().enumerate() {
            for &id in &component.rejected {
                log::debug!(
                    "Rejecting candidate {id} on component {k}: residual mean {:.3e}, std {:.3e}",
                    component.mean,
                    component.std_dev
                );
            }
        }

        let rejected = rejection.rejected();
        for &id in &rejected {
            registry.set_status(id, CandidateStatus::Bad)?;
        }
        Ok((rejected.len(), skipped))
    }
}

#[cfg(test)]
mod tests;
