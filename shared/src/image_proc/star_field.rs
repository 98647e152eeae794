//! Synthetic Gaussian star fields.
//!
//! Stars are pixel-sampled circular Gaussians normalised so that an
//! untruncated star sums to its flux. Noise is additive and stationary, so the
//! variance plane is a constant matching the chosen noise model.

use ndarray::Array2;

use super::noise::{simple_normal_array, uniform_noise_array};
use super::{ImageError, MaskedImage};
use crate::image_size::ImageSize;

/// Stars are rendered out to this many sigma from their centre
const RENDER_RADIUS_SIGMA: f64 = 8.0;

/// One star to render, in pixel coordinates of the frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticStar {
    pub x: f64,
    pub y: f64,
    pub flux: f64,
    /// Gaussian sigma in pixels
    pub sigma: f64,
}

impl SyntheticStar {
    pub fn new(x: f64, y: f64, flux: f64, sigma: f64) -> Self {
        Self { x, y, flux, sigma }
    }

    /// Second moments `(m_xx, m_yy, m_xy)` of the star profile
    pub fn moments(&self) -> (f64, f64, f64) {
        let s2 = self.sigma * self.sigma;
        (s2, s2, 0.0)
    }
}

/// Additive noise model for a synthetic frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldNoise {
    /// Noiseless frame; the variance plane is set to one
    None,
    /// Uniform noise in `[-amplitude, amplitude)`
    Uniform { amplitude: f64 },
    /// Zero-mean Gaussian noise
    Gaussian { std_dev: f64 },
}

impl FieldNoise {
    /// Per-pixel variance implied by the noise model
    pub fn variance(&self) -> f64 {
        match *self {
            FieldNoise::None => 1.0,
            FieldNoise::Uniform { amplitude } => amplitude * amplitude / 3.0,
            FieldNoise::Gaussian { std_dev } => std_dev * std_dev,
        }
    }

    fn sample(&self, shape: (usize, usize), seed: u64) -> Result<Array2<f64>, ImageError> {
        match *self {
            FieldNoise::None => Ok(Array2::zeros(shape)),
            FieldNoise::Uniform { amplitude } => uniform_noise_array(shape, amplitude, seed),
            FieldNoise::Gaussian { std_dev } => simple_normal_array(shape, 0.0, std_dev, seed),
        }
    }
}

/// Add one star to `image` in place.
pub fn add_gaussian_star(image: &mut Array2<f64>, star: &SyntheticStar) {
    if star.sigma <= 0.0 || !star.x.is_finite() || !star.y.is_finite() {
        return;
    }
    let (height, width) = image.dim();
    let s2 = star.sigma * star.sigma;
    let norm = star.flux / (2.0 * std::f64::consts::PI * s2);
    let radius = (RENDER_RADIUS_SIGMA * star.sigma).ceil();

    let x_lo = (star.x - radius).floor().max(0.0) as usize;
    let y_lo = (star.y - radius).floor().max(0.0) as usize;
    let x_hi = ((star.x + radius).ceil().max(-1.0) as i64 + 1).min(width as i64);
    let y_hi = ((star.y + radius).ceil().max(-1.0) as i64 + 1).min(height as i64);

    for row in y_lo..y_hi.max(0) as usize {
        for col in x_lo..x_hi.max(0) as usize {
            let dx = col as f64 - star.x;
            let dy = row as f64 - star.y;
            image[[row, col]] += norm * (-(dx * dx + dy * dy) / (2.0 * s2)).exp();
        }
    }
}

/// Render `stars` on a frame anchored at the parent origin.
///
/// # Arguments
/// * `size` - Frame dimensions
/// * `stars` - Stars to draw
/// * `noise` - Additive noise model; also sets the variance plane
/// * `seed` - Seed for the noise generator
pub fn render_star_field(
    size: ImageSize,
    stars: &[SyntheticStar],
    noise: FieldNoise,
    seed: u64,
) -> Result<MaskedImage, ImageError> {
    let mut image = noise.sample(size.shape(), seed)?;
    for star in stars {
        add_gaussian_star(&mut image, star);
    }
    MaskedImage::from_planes(image, size.filled(noise.variance()))
}

/// Centres of an `nx x ny` grid of positions inset by `margin` pixels from
/// every edge of the frame, in row-major order.
pub fn grid_positions(size: ImageSize, nx: usize, ny: usize, margin: f64) -> Vec<(f64, f64)> {
    let axis = |n: usize, extent: usize| -> Vec<f64> {
        let lo = margin;
        let hi = extent as f64 - 1.0 - margin;
        match n {
            0 => Vec::new(),
            1 => vec![(0.5 * (lo + hi)).round()],
            _ => (0..n)
                .map(|i| (lo + (hi - lo) * i as f64 / (n - 1) as f64).round())
                .collect(),
        }
    };
    let xs = axis(nx, size.width);
    let ys = axis(ny, size.height);
    ys.iter()
        .flat_map(|&y| xs.iter().map(move |&x| (x, y)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_star_sums_to_flux() {
        let mut image = Array2::zeros((64, 64));
        add_gaussian_star(&mut image, &SyntheticStar::new(32.0, 30.0, 1000.0, 2.0));
        assert_relative_eq!(image.sum(), 1000.0, epsilon = 1e-6);
        // Peak at the centre pixel
        let peak = image.iter().copied().fold(f64::MIN, f64::max);
        assert_eq!(image[[30, 32]], peak);
    }

    #[test]
    fn test_star_clipped_at_edge() {
        let mut image = Array2::zeros((20, 20));
        add_gaussian_star(&mut image, &SyntheticStar::new(0.0, 10.0, 1000.0, 1.5));
        let total = image.sum();
        assert!(total > 600.0 && total < 700.0);
    }

    #[test]
    fn test_render_sets_variance_plane() {
        let size = ImageSize::from_width_height(40, 30);
        let stars = [SyntheticStar::new(20.0, 15.0, 500.0, 1.5)];
        let field = render_star_field(size, &stars, FieldNoise::Uniform { amplitude: 0.6 }, 1).unwrap();

        assert_eq!(field.image().dim(), (30, 40));
        assert!(field
            .variance()
            .iter()
            .all(|&v| (v - 0.12).abs() < 1e-12));
        assert!(field.image()[[15, 20]] > 30.0);
    }

    #[test]
    fn test_noiseless_field_is_deterministic() {
        let size = ImageSize::from_width_height(16, 16);
        let stars = [SyntheticStar::new(8.0, 8.0, 100.0, 1.0)];
        let a = render_star_field(size, &stars, FieldNoise::None, 1).unwrap();
        let b = render_star_field(size, &stars, FieldNoise::None, 2).unwrap();
        assert_eq!(a, b);
        assert!(a.variance().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_grid_positions() {
        let size = ImageSize::from_width_height(101, 51);
        let grid = grid_positions(size, 3, 2, 10.0);
        assert_eq!(
            grid,
            vec![
                (10.0, 10.0),
                (50.0, 10.0),
                (90.0, 10.0),
                (10.0, 40.0),
                (50.0, 40.0),
                (90.0, 40.0)
            ]
        );
        assert!(grid_positions(size, 0, 2, 10.0).is_empty());
    }
}
