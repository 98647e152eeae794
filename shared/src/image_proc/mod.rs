//! Pixel containers and synthetic image generation.

pub mod masked_image;
pub mod noise;
pub mod star_field;

use thiserror::Error;

pub use masked_image::{BoundingBox, MaskedImage, Stamp};
pub use noise::{simple_normal_array, uniform_noise_array};
pub use star_field::{grid_positions, render_star_field, FieldNoise, SyntheticStar};

/// Errors raised while building or slicing images
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImageError {
    #[error("Plane shapes differ: image {image:?}, variance {variance:?}")]
    ShapeMismatch {
        image: (usize, usize),
        variance: (usize, usize),
    },

    #[error("Cutout of size {size} at ({x:.2}, {y:.2}) falls outside the image")]
    OutOfBounds { x: f64, y: f64, size: usize },

    #[error("Invalid cutout size: {0}")]
    InvalidSize(usize),

    #[error("Invalid noise parameters: {0}")]
    InvalidNoise(String),
}
