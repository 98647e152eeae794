//! Outlier rejection rules.
//!
//! Both rules are pure: they look at scores and return the ids to mark BAD,
//! leaving the status change to the fit loop. Each round may only reject a
//! growing fraction of its outlier pool, so early rounds, judged against a
//! kernel still polluted by bad stars, remove only the worst offenders.

use std::collections::BTreeSet;

use meter_math::sigma_clipped_stats;

use crate::candidate::CandidateId;

/// Floor on the clipped standard deviation of spatial residuals
pub const MIN_RESIDUAL_STD: f64 = 1e-4;

/// Clipping used for the spatial residual statistics
const CLIP_SIGMA: f64 = 3.0;
const CLIP_PASSES: usize = 3;

/// How many pool members each round may reject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectionSchedule {
    n_rounds: usize,
}

impl RejectionSchedule {
    pub fn new(n_rounds: usize) -> Self {
        Self {
            n_rounds: n_rounds.max(1),
        }
    }

    pub fn n_rounds(&self) -> usize {
        self.n_rounds
    }

    /// `clamp(floor(pool * (round + 1) / n_rounds + 0.5), 0, pool)`
    pub fn reject_count(&self, pool: usize, round: usize) -> usize {
        let share = pool as f64 * (round + 1) as f64 / self.n_rounds as f64;
        ((share + 0.5).floor() as usize).min(pool)
    }
}

/// Outcome of the reduced chi-square rule
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chi2Rejection {
    /// Ids to mark BAD, worst first
    pub rejected: Vec<CandidateId>,
    pub pool_size: usize,
    /// Candidates with a negative chi-square
    pub anomalies: Vec<CandidateId>,
}

/// Pick the candidates to reject by reduced chi-square.
///
/// The pool holds scores above `threshold`, negative scores (numerically
/// impossible, reported as anomalies) and NaN. It is ranked worst first with
/// NaN ahead of everything and negative values last; equal scores keep the
/// order given in `scores`.
pub fn chi2_rejections(
    scores: &[(CandidateId, f64)],
    threshold: f64,
    schedule: &RejectionSchedule,
    round: usize,
) -> Chi2Rejection {
    let anomalies: Vec<CandidateId> = scores
        .iter()
        .filter(|(_, chi2)| *chi2 < 0.0)
        .map(|&(id, _)| id)
        .collect();

    let mut pool: Vec<(CandidateId, f64)> = scores
        .iter()
        .copied()
        .filter(|&(_, chi2)| chi2.is_nan() || chi2 > threshold || chi2 < 0.0)
        .collect();
    let badness = |chi2: f64| if chi2.is_nan() { f64::INFINITY } else { chi2 };
    pool.sort_by(|a, b| badness(b.1).total_cmp(&badness(a.1)));

    let n_reject = schedule.reject_count(pool.len(), round);
    Chi2Rejection {
        rejected: pool.iter().take(n_reject).map(|&(id, _)| id).collect(),
        pool_size: pool.len(),
        anomalies,
    }
}

/// Rejection outcome for one kernel component
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentRejection {
    pub mean: f64,
    /// Clipped standard deviation after the floor
    pub std_dev: f64,
    pub pool_size: usize,
    pub rejected: Vec<CandidateId>,
}

/// Outcome of the spatial residual rule
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpatialRejection {
    pub components: Vec<ComponentRejection>,
}

impl SpatialRejection {
    /// Union of the per-component rejections
    pub fn rejected(&self) -> BTreeSet<CandidateId> {
        self.components
            .iter()
            .flat_map(|c| c.rejected.iter().copied())
            .collect()
    }
}

/// Pick the candidates to reject by spatial-interpolation residual.
///
/// `residuals` holds, per candidate, the difference between its own
/// fractional component weights and the spatial model's prediction. Each
/// component is judged independently against its clipped mean and standard
/// deviation; a residual further than `n_sigma` deviations from the mean
/// enters that component's pool. Non-finite residuals always do.
pub fn spatial_rejections(
    residuals: &[(CandidateId, Vec<f64>)],
    n_sigma: f64,
    schedule: &RejectionSchedule,
    round: usize,
) -> SpatialRejection {
    let n_components = residuals.iter().map(|(_, r)| r.len()).max().unwrap_or(0);
    let mut components = Vec::with_capacity(n_components);

    for k in 0..n_components {
        let column: Vec<(CandidateId, f64)> = residuals
            .iter()
            .filter_map(|(id, r)| r.get(k).map(|&v| (*id, v)))
            .collect();
        let values: Vec<f64> = column.iter().map(|&(_, v)| v).collect();

        let (mean, std_dev) = match sigma_clipped_stats(&values, CLIP_SIGMA, CLIP_PASSES) {
            Some(stats) => (stats.mean, stats.std_dev.max(MIN_RESIDUAL_STD)),
            None => (0.0, MIN_RESIDUAL_STD),
        };

        let distance = |v: f64| {
            if v.is_finite() {
                (v - mean).abs()
            } else {
                f64::INFINITY
            }
        };
        let mut pool: Vec<(CandidateId, f64)> = column
            .iter()
            .map(|&(id, v)| (id, distance(v)))
            .filter(|&(_, d)| d > n_sigma * std_dev)
            .collect();
        pool.sort_by(|a, b| b.1.total_cmp(&a.1));

        let n_reject = schedule.reject_count(pool.len(), round);
        components.push(ComponentRejection {
            mean,
            std_dev,
            pool_size: pool.len(),
            rejected: pool.iter().take(n_reject).map(|&(id, _)| id).collect(),
        });
    }

    SpatialRejection { components }
}
