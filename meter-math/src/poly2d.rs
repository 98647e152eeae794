//! Two-dimensional polynomials over a rectangular domain.
//!
//! Terms are ordered by total degree, `1, x, y, x², xy, y², x³, ...`, the same
//! layout a `PolynomialFunction2D` of order `n` uses. Coordinates are mapped
//! from the domain onto `[-1, 1]` before evaluation so that fits over
//! thousand-pixel images stay well conditioned.

use nalgebra::{DMatrix, DVector};

use crate::lstsq::solve_least_squares;
use crate::MathError;

/// Rectangular domain a polynomial is defined over
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Domain2D {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Domain2D {
    pub fn new(x_min: f64, x_max: f64, y_min: f64, y_max: f64) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    /// Map a point into the unit square `[-1, 1] x [-1, 1]`
    pub fn normalize(&self, x: f64, y: f64) -> (f64, f64) {
        fn scale(v: f64, lo: f64, hi: f64) -> f64 {
            let span = hi - lo;
            if span.abs() < f64::EPSILON {
                0.0
            } else {
                2.0 * (v - lo) / span - 1.0
            }
        }
        (
            scale(x, self.x_min, self.x_max),
            scale(y, self.y_min, self.y_max),
        )
    }
}

/// Polynomial in two variables with total degree up to `order`
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial2D {
    order: usize,
    domain: Domain2D,
    coefficients: Vec<f64>,
}

impl Polynomial2D {
    /// Number of terms of a polynomial of the given order
    pub fn n_terms_for_order(order: usize) -> usize {
        (order + 1) * (order + 2) / 2
    }

    /// Zero polynomial
    pub fn new(order: usize, domain: Domain2D) -> Self {
        Self {
            order,
            domain,
            coefficients: vec![0.0; Self::n_terms_for_order(order)],
        }
    }

    /// Polynomial with explicit coefficients (term order as documented above)
    pub fn with_coefficients(
        order: usize,
        domain: Domain2D,
        coefficients: Vec<f64>,
    ) -> Result<Self, MathError> {
        let expected = Self::n_terms_for_order(order);
        if coefficients.len() != expected {
            return Err(MathError::DimensionMismatch {
                expected,
                actual: coefficients.len(),
            });
        }
        Ok(Self {
            order,
            domain,
            coefficients,
        })
    }

    /// Least-squares fit of `values` sampled at `points`.
    ///
    /// Under-determined systems (fewer points than terms) return the
    /// minimum-norm solution instead of failing.
    pub fn fit(
        order: usize,
        domain: Domain2D,
        points: &[(f64, f64)],
        values: &[f64],
    ) -> Result<Self, MathError> {
        if points.len() != values.len() {
            return Err(MathError::DimensionMismatch {
                expected: points.len(),
                actual: values.len(),
            });
        }
        if points.is_empty() {
            return Err(MathError::ArgumentError(
                "cannot fit a polynomial to zero points".to_string(),
            ));
        }

        let template = Self::new(order, domain);
        let n_terms = template.n_terms();
        let mut design = DMatrix::zeros(points.len(), n_terms);
        for (row, &(x, y)) in points.iter().enumerate() {
            for (col, term) in template.terms(x, y).into_iter().enumerate() {
                design[(row, col)] = term;
            }
        }
        let rhs = DVector::from_column_slice(values);
        let solution = solve_least_squares(&design, &rhs)?;

        Ok(Self {
            coefficients: solution.iter().copied().collect(),
            ..template
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn domain(&self) -> &Domain2D {
        &self.domain
    }

    pub fn n_terms(&self) -> usize {
        self.coefficients.len()
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn set_coefficients(&mut self, coefficients: &[f64]) -> Result<(), MathError> {
        if coefficients.len() != self.coefficients.len() {
            return Err(MathError::DimensionMismatch {
                expected: self.coefficients.len(),
                actual: coefficients.len(),
            });
        }
        self.coefficients.copy_from_slice(coefficients);
        Ok(())
    }

    /// Multiply every coefficient by `factor`
    pub fn scale(&mut self, factor: f64) {
        self.coefficients.iter_mut().for_each(|c| *c *= factor);
    }

    /// Values of each monomial at `(x, y)`, in coefficient order
    pub fn terms(&self, x: f64, y: f64) -> Vec<f64> {
        let (u, v) = self.domain.normalize(x, y);
        let mut terms = Vec::with_capacity(Self::n_terms_for_order(self.order));
        for degree in 0..=self.order {
            for y_power in 0..=degree {
                let x_power = degree - y_power;
                terms.push(u.powi(x_power as i32) * v.powi(y_power as i32));
            }
        }
        terms
    }

    /// Evaluate the polynomial at `(x, y)`
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        self.terms(x, y)
            .iter()
            .zip(&self.coefficients)
            .map(|(t, c)| t * c)
            .sum()
    }
}
