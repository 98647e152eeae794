use super::*;
use crate::candidate::Source;
use crate::delegate::{FitStatus, SingleImageFit, SpatialFit};
use crate::kernel::FixedBasis;
use approx::assert_relative_eq;
use meter_math::{Domain2D, Polynomial2D};
use ndarray::Array2;
use shared::Stamp;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};

type Key = (i64, i64);

fn key(x: f64, y: f64) -> Key {
    (x.round() as i64, y.round() as i64)
}

/// Delegate with scripted chi-squares and spatial weights per star position
#[derive(Default)]
struct MockDelegate {
    chi2: HashMap<Key, f64>,
    weights: HashMap<Key, f64>,
    /// Positions whose single-image fit fails
    failures: HashSet<Key>,
    pca_calls: Cell<usize>,
    spatial_calls: Cell<usize>,
    single_fits: RefCell<Vec<Key>>,
}

impl MockDelegate {
    fn with_chi2(mut self, at: Key, chi2: f64) -> Self {
        self.chi2.insert(at, chi2);
        self
    }

    fn with_weight(mut self, at: Key, weight: f64) -> Self {
        self.weights.insert(at, weight);
        self
    }

    fn with_failure(mut self, at: Key) -> Self {
        self.failures.insert(at);
        self
    }
}

impl FitDelegate for MockDelegate {
    fn fit_pca_kernel(
        &self,
        registry: &mut CandidateRegistry,
        params: &PcaFitParams,
    ) -> Result<KernelFit, PsfError> {
        self.pca_calls.set(self.pca_calls.get() + 1);
        let used = registry.usable_per_cell(params.max_per_cell);
        if used.is_empty() {
            return Err(PsfError::model_fit("nothing to fit"));
        }
        for id in registry.ids(true) {
            if let Some(candidate) = registry.get_mut(id) {
                if candidate.has_stamp() {
                    let chi2 = self
                        .chi2
                        .get(&key(candidate.x(), candidate.y()))
                        .copied()
                        .unwrap_or(1.0);
                    candidate.set_chi2(chi2);
                }
            }
        }

        let bbox = params.bbox;
        let domain = Domain2D::new(
            bbox.x_min as f64,
            bbox.x_max() as f64,
            bbox.y_min as f64,
            bbox.y_max() as f64,
        );
        let size = params.kernel_size;
        let kernel = SpatialKernel::new(
            vec![Array2::from_elem((size, size), 1.0)],
            vec![Polynomial2D::new(0, domain)],
        )?;
        Ok(KernelFit {
            kernel,
            eigenvalues: vec![2.0],
            n_used: used.len(),
        })
    }

    fn fit_spatial_kernel(
        &self,
        _kernel: &mut SpatialKernel,
        _registry: &mut CandidateRegistry,
        _params: &SpatialFitParams,
    ) -> Result<SpatialFit, PsfError> {
        self.spatial_calls.set(self.spatial_calls.get() + 1);
        Ok(SpatialFit {
            status: FitStatus::Converged,
            chi2: 1.0,
        })
    }

    fn fit_single_image(
        &self,
        _basis: &FixedBasis,
        _stamp: &Stamp,
        center: (f64, f64),
    ) -> Result<SingleImageFit, PsfError> {
        let at = key(center.0, center.1);
        self.single_fits.borrow_mut().push(at);
        if self.failures.contains(&at) {
            return Err(PsfError::model_fit("singular stamp"));
        }
        let w = self.weights.get(&at).copied().unwrap_or(0.0);
        Ok(SingleImageFit {
            amplitudes: vec![w],
            weights: vec![w],
        })
    }
}

fn blank_image() -> MaskedImage {
    MaskedImage::from_planes(Array2::zeros((100, 100)), Array2::ones((100, 100))).unwrap()
}

/// 20 candidates on a 5x4 grid
fn grid_candidates() -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for row in 0..4 {
        for col in 0..5 {
            let id = (row * 5 + col) as u64;
            let x = 10.0 + 20.0 * col as f64;
            let y = 10.0 + 20.0 * row as f64;
            candidates.push(Candidate::new(Source::new(id, x, y, 1000.0 + id as f64)));
        }
    }
    candidates
}

fn config(n_iterations: usize) -> PcaPsfConfig {
    PcaPsfConfig {
        n_eigen_components: 1,
        spatial_order: 0,
        size_cell_x: 100,
        size_cell_y: 100,
        n_star_per_cell: 0,
        n_star_per_cell_spatial_fit: 0,
        kernel_size: 5,
        kernel_size_min: 5,
        kernel_size_max: 5,
        n_iterations,
        ..Default::default()
    }
}

fn run(
    delegate: MockDelegate,
    n_iterations: usize,
    candidates: Vec<Candidate>,
) -> (Result<PsfDetermination, PsfError>, MockDelegate) {
    let _ = env_logger::builder().is_test(true).try_init();
    let determiner = PcaPsfDeterminer::with_delegate(config(n_iterations), delegate).unwrap();
    let result = determiner.determine_psf(&blank_image(), candidates, None);
    (result, determiner.delegate)
}

fn status_at(result: &PsfDetermination, at: Key) -> CandidateStatus {
    result
        .registry
        .iter(true)
        .find(|c| key(c.x(), c.y()) == at)
        .map(|c| c.status())
        .unwrap()
}

#[test]
fn test_runs_exactly_k_rounds() {
    let (result, delegate) = run(MockDelegate::default(), 4, grid_candidates());
    let result = result.unwrap();

    assert_eq!(result.rounds.len(), 4);
    for (i, round) in result.rounds.iter().enumerate() {
        assert_eq!(round.round, i);
        assert_eq!(round.n_fit, 20);
        assert_eq!(round.chi2_rejected, 0);
    }
    // One fit per round plus the final one
    assert_eq!(delegate.pca_calls.get(), 5);
    assert_eq!(delegate.spatial_calls.get(), 5);
    assert_eq!(result.kernel_size, 5);
    assert_eq!(result.quality.num_good, 20);
}

#[test]
fn test_chi2_rejected_star_skips_spatial_pass() {
    let outlier = (50, 30);
    let delegate = MockDelegate::default()
        .with_chi2(outlier, 10.0)
        .with_weight(outlier, 1.0);
    let (result, delegate) = run(delegate, 1, grid_candidates());
    let result = result.unwrap();

    let scored = delegate.single_fits.borrow();
    assert_eq!(scored.len(), 19);
    assert!(!scored.contains(&outlier));

    assert_eq!(result.rounds[0].chi2_rejected, 1);
    assert_eq!(result.rounds[0].spatial_rejected, 0);
    assert_eq!(status_at(&result, outlier), CandidateStatus::Bad);
    assert_eq!(result.quality.num_bad, 1);
}

#[test]
fn test_spatial_outlier_rejected() {
    let outlier = (70, 50);
    let delegate = MockDelegate::default().with_weight(outlier, 1.0);
    let (result, _) = run(delegate, 1, grid_candidates());
    let result = result.unwrap();

    assert_eq!(result.rounds[0].chi2_rejected, 0);
    assert_eq!(result.rounds[0].spatial_rejected, 1);
    assert_eq!(status_at(&result, outlier), CandidateStatus::Bad);
    assert_eq!(result.quality.num_good, 19);
}

#[test]
fn test_failed_single_image_fit_is_skipped() {
    let failing = (50, 30);
    let outlier = (70, 50);
    let delegate = MockDelegate::default()
        .with_failure(failing)
        .with_weight(failing, 1.0)
        .with_weight(outlier, 1.0);
    let (result, delegate) = run(delegate, 2, grid_candidates());
    let result = result.unwrap();

    assert_eq!(result.rounds.len(), 2);
    for round in &result.rounds {
        assert_eq!(round.spatial_skipped, 1);
        // Only the scored outlier goes; the zero residuals of the rest stay clean
        assert_eq!(round.spatial_rejected, 1);
        assert_eq!(round.n_bad, 1);
    }
    // Tried once per round, never dropped from the next fit
    let attempts = delegate
        .single_fits
        .borrow()
        .iter()
        .filter(|&&at| at == failing)
        .count();
    assert_eq!(attempts, 2);
    assert_eq!(result.rounds[1].n_fit, 19);

    assert_eq!(status_at(&result, failing), CandidateStatus::Good);
    assert_eq!(status_at(&result, outlier), CandidateStatus::Bad);
    assert_eq!(result.quality.num_good, 19);
}

#[test]
fn test_rejected_star_left_out_of_next_fit() {
    let delegate = MockDelegate::default().with_chi2((30, 10), 10.0);
    let (result, _) = run(delegate, 2, grid_candidates());
    let result = result.unwrap();

    assert_eq!(result.rounds[0].n_fit, 20);
    assert_eq!(result.rounds[0].chi2_rejected, 1);
    assert_eq!(result.rounds[1].n_fit, 19);
    assert_eq!(result.rounds[1].n_bad, 1);
}

#[test]
fn test_negative_chi2_is_anomaly_and_rejected() {
    let delegate = MockDelegate::default().with_chi2((10, 10), -1.0);
    let (result, _) = run(delegate, 2, grid_candidates());
    let result = result.unwrap();

    assert_eq!(result.rounds[0].anomalies, 1);
    assert_eq!(result.rounds[0].chi2_pool, 1);
    assert_eq!(status_at(&result, (10, 10)), CandidateStatus::Bad);
}

#[test]
fn test_fails_when_every_candidate_is_rejected() {
    let mut delegate = MockDelegate::default();
    for c in grid_candidates() {
        delegate = delegate.with_chi2(key(c.x(), c.y()), 10.0);
    }
    let (result, delegate) = run(delegate, 2, grid_candidates());

    assert!(matches!(result, Err(PsfError::Fit { candidate: None, .. })));
    // Both rounds fit, the final fit found nobody left
    assert_eq!(delegate.pca_calls.get(), 2);
}

#[test]
fn test_stampless_candidate_ends_bad() {
    let mut candidates = grid_candidates();
    candidates.push(Candidate::new(Source::new(99, 1.0, 50.0, 5000.0)));
    let (result, _) = run(MockDelegate::default(), 1, candidates);
    let result = result.unwrap();

    assert_eq!(status_at(&result, (1, 50)), CandidateStatus::Bad);
    assert_eq!(result.rounds[0].spatial_skipped, 0);
    assert_eq!(result.quality.num_available, 21);
    assert_eq!(result.quality.num_good, 20);
}

#[test]
fn test_quality_and_eigenvalue_units() {
    let _ = env_logger::builder().is_test(true).try_init();
    let determiner = PcaPsfDeterminer::with_delegate(config(2), MockDelegate::default()).unwrap();
    let mut metrics: BTreeMap<String, f64> = BTreeMap::new();
    let result = determiner
        .determine_psf(&blank_image(), grid_candidates(), Some(&mut metrics))
        .unwrap();

    // 2.0 / (20 stars * (5 * 5 - 1))
    assert_relative_eq!(result.psf.eigenvalues()[0], 1.0 / 240.0, epsilon = 1e-15);
    for round in &result.rounds {
        assert_relative_eq!(round.leading_eigenvalue, 1.0 / 240.0, epsilon = 1e-15);
    }
    assert_eq!(metrics["phot.psf.numGoodStars"], 20.0);
    assert_eq!(metrics["phot.psf.numAvailStars"], 20.0);
    assert_eq!(metrics["phot.psf.spatialFitChi2"], 1.0);
    assert!(result
        .registry
        .iter(true)
        .all(|c| c.source().psf_star && c.status() == CandidateStatus::Good));
}

#[test]
fn test_input_errors() {
    let (result, _) = run(MockDelegate::default(), 1, Vec::new());
    assert!(matches!(result, Err(PsfError::Input(_))));

    let mut candidates = grid_candidates();
    candidates.push(Candidate::new(Source::new(50, 150.0, 50.0, 1.0)));
    let (result, _) = run(MockDelegate::default(), 1, candidates);
    assert!(matches!(result, Err(PsfError::Input(_))));
}

#[test]
fn test_invalid_config_rejected() {
    let bad = PcaPsfConfig {
        n_iterations: 0,
        ..Default::default()
    };
    assert!(matches!(PcaPsfDeterminer::new(bad), Err(PsfError::Config(_))));
}
