//! Seeded noise fields for synthetic frames.
//!
//! Every generator takes an explicit seed so that test frames, and therefore
//! fitted PSF models, are reproducible bit for bit.

use ndarray::Array2;
use rand::distr::Uniform;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use super::ImageError;

/// Generate a 2D array of normally distributed values.
///
/// # Arguments
/// * `size` - Tuple of (height, width) for the output array dimensions
/// * `mean` - Mean value of the normal distribution
/// * `std_dev` - Standard deviation of the normal distribution
/// * `seed` - Random seed for deterministic output
///
/// # Example
/// ```
/// use shared::image_proc::noise::simple_normal_array;
///
/// // Create 10x10 array with mean=100, std_dev=10, seed=42
/// let noise = simple_normal_array((10, 10), 100.0, 10.0, 42).unwrap();
/// assert_eq!(noise.dim(), (10, 10));
/// ```
pub fn simple_normal_array(
    size: (usize, usize),
    mean: f64,
    std_dev: f64,
    seed: u64,
) -> Result<Array2<f64>, ImageError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal_dist =
        Normal::new(mean, std_dev).map_err(|e| ImageError::InvalidNoise(e.to_string()))?;
    Ok(Array2::from_shape_fn(size, |_| normal_dist.sample(&mut rng)))
}

/// Generate a 2D array of values drawn uniformly from `[-amplitude, amplitude)`.
///
/// The variance of each value is `amplitude² / 3`. A non-positive amplitude
/// gives an all-zero array.
pub fn uniform_noise_array(
    size: (usize, usize),
    amplitude: f64,
    seed: u64,
) -> Result<Array2<f64>, ImageError> {
    if amplitude <= 0.0 {
        return Ok(Array2::zeros(size));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let uniform = Uniform::new(-amplitude, amplitude)
        .map_err(|e| ImageError::InvalidNoise(e.to_string()))?;
    Ok(Array2::from_shape_fn(size, |_| uniform.sample(&mut rng)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normal_array_statistics() {
        let noise = simple_normal_array((200, 200), 5.0, 2.0, 42).unwrap();
        let n = noise.len() as f64;
        let mean = noise.sum() / n;
        let var = noise.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        assert_relative_eq!(mean, 5.0, epsilon = 0.05);
        assert_relative_eq!(var.sqrt(), 2.0, epsilon = 0.05);
    }

    #[test]
    fn test_uniform_array_bounds_and_variance() {
        let noise = uniform_noise_array((200, 200), 0.5, 7).unwrap();
        assert!(noise.iter().all(|&v| (-0.5..0.5).contains(&v)));
        let n = noise.len() as f64;
        let var = noise.iter().map(|v| v * v).sum::<f64>() / n;
        assert_relative_eq!(var, 0.25 / 3.0, epsilon = 0.005);
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let a = uniform_noise_array((8, 8), 1.0, 3).unwrap();
        let b = uniform_noise_array((8, 8), 1.0, 3).unwrap();
        let c = uniform_noise_array((8, 8), 1.0, 4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_zero_amplitude_and_invalid_sigma() {
        assert!(uniform_noise_array((4, 4), 0.0, 1)
            .unwrap()
            .iter()
            .all(|&v| v == 0.0));
        assert!(simple_normal_array((4, 4), 0.0, f64::NAN, 1).is_err());
    }
}
