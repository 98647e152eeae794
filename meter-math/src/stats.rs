//! Robust summary statistics.
//!
//! The clipped estimators follow the usual astronomical recipe: start from the
//! median and an interquartile-range sigma, then repeatedly discard points more
//! than `n_sigma` away from the current centre and recompute mean and standard
//! deviation from what is left.

/// Scale factor turning an interquartile range into a Gaussian sigma
const IQR_TO_SIGMA: f64 = 0.741;

/// Mean and standard deviation after iterative sigma clipping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    /// Clipped mean
    pub mean: f64,
    /// Clipped (sample) standard deviation
    pub std_dev: f64,
    /// Number of values that survived the final clipping pass
    pub n_used: usize,
}

fn finite_sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    sorted
}

/// Linear-interpolated percentile of already sorted data, `q` in [0, 1]
fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let t = pos - lo as f64;
    sorted[lo] + t * (sorted[hi] - sorted[lo])
}

/// Median of the finite values in `values`, `None` if there are none.
pub fn median(values: &[f64]) -> Option<f64> {
    let sorted = finite_sorted(values);
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some(0.5 * (sorted[n / 2 - 1] + sorted[n / 2]))
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

/// Iterative sigma-clipped mean and standard deviation.
///
/// Non-finite values are ignored. The first pass is centred on the median with
/// a sigma estimated from the interquartile range; later passes use the mean
/// and standard deviation of the previous survivors. A zero interquartile
/// sigma on the first pass keeps every value rather than collapsing onto the
/// median.
///
/// Returns `None` when `values` holds no finite numbers.
///
/// # Examples
/// ```
/// use meter_math::stats::sigma_clipped_stats;
///
/// let mut values = vec![1.0; 20];
/// values.push(1000.0);
/// let stats = sigma_clipped_stats(&values, 3.0, 3).unwrap();
/// assert_eq!(stats.mean, 1.0);
/// assert_eq!(stats.n_used, 20);
/// ```
pub fn sigma_clipped_stats(values: &[f64], n_sigma: f64, n_iter: usize) -> Option<ClippedStats> {
    let sorted = finite_sorted(values);
    if sorted.is_empty() {
        return None;
    }

    let mut center = median(&sorted)?;
    let mut sigma =
        IQR_TO_SIGMA * (percentile_sorted(&sorted, 0.75) - percentile_sorted(&sorted, 0.25));

    let (mut mean, mut std_dev) = mean_and_std(&sorted);
    let mut n_used = sorted.len();

    for pass in 0..n_iter.max(1) {
        // Survivors are all identical, nothing left to clip
        if pass > 0 && sigma <= 0.0 {
            break;
        }

        let kept: Vec<f64> = if sigma > 0.0 {
            sorted
                .iter()
                .copied()
                .filter(|v| (v - center).abs() <= n_sigma * sigma)
                .collect()
        } else {
            sorted.clone()
        };

        if kept.is_empty() {
            break;
        }

        (mean, std_dev) = mean_and_std(&kept);
        n_used = kept.len();
        center = mean;
        sigma = std_dev;
    }

    Some(ClippedStats {
        mean,
        std_dev,
        n_used,
    })
}
