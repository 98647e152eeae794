//! Image plus variance planes placed on a parent pixel grid.
//!
//! Arrays are indexed `[row, col] = [y, x]`. Pixel `(col, row)` of a
//! [`MaskedImage`] sits at parent coordinates `(x_min + col, y_min + row)`;
//! integer coordinates are pixel centres.

use ndarray::{s, Array2};

use super::ImageError;

/// Axis-aligned pixel region in parent coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x_min: i64,
    pub y_min: i64,
    pub width: usize,
    pub height: usize,
}

impl BoundingBox {
    pub fn new(x_min: i64, y_min: i64, width: usize, height: usize) -> Self {
        Self {
            x_min,
            y_min,
            width,
            height,
        }
    }

    /// Last column inside the box
    pub fn x_max(&self) -> i64 {
        self.x_min + self.width as i64 - 1
    }

    /// Last row inside the box
    pub fn y_max(&self) -> i64 {
        self.y_min + self.height as i64 - 1
    }

    /// Local `(col, row)` of the pixel whose centre is nearest to `(x, y)`,
    /// or `None` when that pixel lies outside the box.
    pub fn pixel_index(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let col = x.round() as i64 - self.x_min;
        let row = y.round() as i64 - self.y_min;
        if col < 0 || row < 0 || col >= self.width as i64 || row >= self.height as i64 {
            return None;
        }
        Some((col as usize, row as usize))
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.pixel_index(x, y).is_some()
    }
}

/// Square cutout around a star
#[derive(Debug, Clone, PartialEq)]
pub struct Stamp {
    pub image: Array2<f64>,
    pub variance: Array2<f64>,
    /// Parent column of the stamp's first pixel
    pub x0: i64,
    /// Parent row of the stamp's first pixel
    pub y0: i64,
}

impl Stamp {
    /// Side length in pixels
    pub fn size(&self) -> usize {
        self.image.nrows()
    }

    /// Position of a parent coordinate relative to the stamp origin
    pub fn local(&self, x: f64, y: f64) -> (f64, f64) {
        (x - self.x0 as f64, y - self.y0 as f64)
    }

    pub fn sum(&self) -> f64 {
        self.image.sum()
    }
}

/// Image and variance planes sharing one bounding box
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedImage {
    bbox: BoundingBox,
    image: Array2<f64>,
    variance: Array2<f64>,
}

impl MaskedImage {
    /// Wrap planes whose first pixel sits at `(x_min, y_min)`
    pub fn new(
        x_min: i64,
        y_min: i64,
        image: Array2<f64>,
        variance: Array2<f64>,
    ) -> Result<Self, ImageError> {
        if image.dim() != variance.dim() {
            return Err(ImageError::ShapeMismatch {
                image: image.dim(),
                variance: variance.dim(),
            });
        }
        let (height, width) = image.dim();
        Ok(Self {
            bbox: BoundingBox::new(x_min, y_min, width, height),
            image,
            variance,
        })
    }

    /// Planes anchored at the parent origin
    pub fn from_planes(image: Array2<f64>, variance: Array2<f64>) -> Result<Self, ImageError> {
        Self::new(0, 0, image, variance)
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    pub fn variance(&self) -> &Array2<f64> {
        &self.variance
    }

    /// Cut a `size x size` stamp centred on the pixel nearest `(x, y)`.
    ///
    /// Even sizes put the extra pixel on the low side. The whole stamp must lie
    /// inside the image; there is no padding.
    pub fn cutout(&self, x: f64, y: f64, size: usize) -> Result<Stamp, ImageError> {
        if size == 0 {
            return Err(ImageError::InvalidSize(size));
        }
        let out_of_bounds = || ImageError::OutOfBounds { x, y, size };
        let (col, row) = self.bbox.pixel_index(x, y).ok_or_else(out_of_bounds)?;

        let half = size / 2;
        if col < half || row < half {
            return Err(out_of_bounds());
        }
        let (c0, r0) = (col - half, row - half);
        if c0 + size > self.bbox.width || r0 + size > self.bbox.height {
            return Err(out_of_bounds());
        }

        let window = s![r0..r0 + size, c0..c0 + size];
        Ok(Stamp {
            image: self.image.slice(window).to_owned(),
            variance: self.variance.slice(window).to_owned(),
            x0: self.bbox.x_min + c0 as i64,
            y0: self.bbox.y_min + r0 as i64,
        })
    }
}
