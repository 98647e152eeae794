//! Image containers shared by the PSF crates.
//!
//! - [`image_size`]: frame dimensions
//! - [`image_proc`]: masked images, stamp cutouts, seeded noise and synthetic
//!   Gaussian star fields used by tests and the command line tool

pub mod image_proc;
pub mod image_size;

pub use image_proc::{BoundingBox, ImageError, MaskedImage, Stamp};
pub use image_size::ImageSize;
