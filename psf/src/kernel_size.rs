//! Choice of the kernel size for a run.
//!
//! The size scales with the square root of the median semi-major axis of the
//! candidates' second-moment ellipses, so broader seeing gets larger stamps.

use meter_math::median;

use crate::candidate::Source;
use crate::error::PsfError;

/// Nominal sizes at or above this are taken literally
pub const ABSOLUTE_SIZE_THRESHOLD: usize = 15;

/// Semi-major axis of the ellipse with second moments `(m_xx, m_yy, m_xy)`.
///
/// NaN for moments that do not describe an ellipse (negative trace etc.).
pub fn semi_major_axis(m_xx: f64, m_yy: f64, m_xy: f64) -> f64 {
    let half_sum = 0.5 * (m_xx + m_yy);
    let half_diff = 0.5 * (m_xx - m_yy);
    let a2 = half_sum + (half_diff * half_diff + m_xy * m_xy).sqrt();
    if a2 < 0.0 {
        f64::NAN
    } else {
        a2.sqrt()
    }
}

/// Pick the odd kernel size for a set of sources.
///
/// `size = 2 * floor(base * sqrt(median axis) + 0.5) + 1`, clamped to
/// `[min, max]`. A `base` of [`ABSOLUTE_SIZE_THRESHOLD`] or more is returned
/// unchanged without looking at the moments.
///
/// # Errors
/// `PsfError::Input` when `sources` is empty.
pub fn compute_kernel_size<'a, I>(
    sources: I,
    base: usize,
    min: usize,
    max: usize,
) -> Result<usize, PsfError>
where
    I: IntoIterator<Item = &'a Source>,
{
    let axes: Vec<f64> = sources
        .into_iter()
        .map(|s| semi_major_axis(s.m_xx, s.m_yy, s.m_xy))
        .collect();
    if axes.is_empty() {
        return Err(PsfError::Input(
            "no PSF candidates to size the kernel from".to_string(),
        ));
    }

    if base >= ABSOLUTE_SIZE_THRESHOLD {
        log::warn!(
            "Not scaling kernel size by stellar moments; using absolute size {}",
            base
        );
        return Ok(base);
    }

    let Some(median_axis) = median(&axes) else {
        log::warn!("No finite second moments among candidates; using base kernel size");
        return Ok(base.clamp(min, max));
    };

    let scaled = (base as f64 * median_axis.sqrt() + 0.5).floor() as usize;
    let size = (2 * scaled + 1).clamp(min, max);
    log::info!(
        "Kernel size {} from median semi-major axis {:.3} over {} candidates",
        size,
        median_axis,
        axes.len()
    );
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn round_source(axis: f64) -> Source {
        let m = axis * axis;
        Source::new(0, 0.0, 0.0, 1.0).with_moments(m, m, 0.0)
    }

    #[test]
    fn test_semi_major_axis() {
        assert_relative_eq!(semi_major_axis(4.0, 4.0, 0.0), 2.0);
        assert_relative_eq!(semi_major_axis(9.0, 1.0, 0.0), 3.0);
        // Rotated ellipse with eigenvalues 3 and 1
        assert_relative_eq!(semi_major_axis(2.0, 2.0, 1.0), 3.0_f64.sqrt(), epsilon = 1e-12);
        assert!(semi_major_axis(-4.0, -4.0, 0.0).is_nan());
    }

    #[test]
    fn test_median_axis_scaling() {
        let sources: Vec<Source> = [1.0, 4.0, 9.0].iter().map(|&a| round_source(a)).collect();
        assert_eq!(compute_kernel_size(&sources, 5, 5, 99).unwrap(), 21);
    }

    #[test]
    fn test_clamping() {
        let sources = vec![round_source(1.0)];
        // 2 * floor(5.5) + 1 = 11
        assert_eq!(compute_kernel_size(&sources, 5, 1, 99).unwrap(), 11);
        assert_eq!(compute_kernel_size(&sources, 5, 25, 45).unwrap(), 25);
        assert_eq!(compute_kernel_size(&sources, 5, 1, 9).unwrap(), 9);
    }

    #[test]
    fn test_large_base_used_directly() {
        let sources = vec![round_source(10.0)];
        assert_eq!(compute_kernel_size(&sources, 21, 25, 45).unwrap(), 21);
    }

    #[test]
    fn test_non_finite_axes_ignored() {
        let mut sources = vec![round_source(4.0)];
        sources.push(Source::new(1, 0.0, 0.0, 1.0).with_moments(-1.0, -1.0, 0.0));
        assert_eq!(compute_kernel_size(&sources, 5, 1, 99).unwrap(), 21);

        let degenerate = vec![Source::new(1, 0.0, 0.0, 1.0).with_moments(f64::NAN, 1.0, 0.0)];
        assert_eq!(compute_kernel_size(&degenerate, 10, 25, 45).unwrap(), 25);
    }

    #[test]
    fn test_empty_is_input_error() {
        let sources: Vec<Source> = Vec::new();
        assert!(matches!(
            compute_kernel_size(&sources, 5, 1, 99),
            Err(PsfError::Input(_))
        ));
    }
}
