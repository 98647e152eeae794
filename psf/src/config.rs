//! Configuration for a PSF determination run.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PsfError;
use crate::kernel_size::ABSOLUTE_SIZE_THRESHOLD;

/// Tunables of the PCA PSF determiner.
///
/// JSON keys are camelCase (`nEigenComponents`, `sizeCellX`, ...); missing
/// keys take their default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PcaPsfConfig {
    /// Number of PCA basis images in the kernel
    pub n_eigen_components: usize,
    /// Total order of the per-component spatial polynomials
    pub spatial_order: usize,
    /// Registry cell width in pixels
    pub size_cell_x: usize,
    /// Registry cell height in pixels
    pub size_cell_y: usize,
    /// Stars per cell used in the PCA fit (0 = all)
    pub n_star_per_cell: usize,
    /// Stars per cell used in the spatial fit (0 = all)
    pub n_star_per_cell_spatial_fit: usize,
    /// Candidates kept per registry cell (0 = unbounded)
    pub max_candidates_per_cell: usize,
    /// Nominal kernel size; values of 15 or more are used as-is and must be odd
    pub kernel_size: usize,
    /// Odd bounds on the chosen kernel size
    pub kernel_size_min: usize,
    pub kernel_size_max: usize,
    /// Extra pixels on each side of the kernel in every stamp
    pub border_width: usize,
    /// Weight every star equally in the PCA instead of by `sqrt(flux)`
    pub constant_weight: bool,
    /// Relative chi-square change that ends the non-linear spatial fit
    pub tolerance: f64,
    /// Initial Levenberg-Marquardt damping of the non-linear spatial fit
    pub damping_lambda: f64,
    /// Candidates above this reduced chi-square are rejection candidates
    pub reduced_chi2_threshold: f64,
    /// Number of fit/reject rounds before the final fit
    pub n_iterations: usize,
    /// Spatial residual rejection threshold in clipped standard deviations
    pub spatial_reject_sigma: f64,
    /// Refine spatial polynomials with Levenberg-Marquardt on pixel residuals
    pub non_linear_spatial_fit: bool,
}

impl Default for PcaPsfConfig {
    fn default() -> Self {
        Self {
            n_eigen_components: 4,
            spatial_order: 2,
            size_cell_x: 256,
            size_cell_y: 256,
            n_star_per_cell: 3,
            n_star_per_cell_spatial_fit: 5,
            max_candidates_per_cell: 0,
            kernel_size: 10,
            kernel_size_min: 25,
            kernel_size_max: 45,
            border_width: 0,
            constant_weight: true,
            tolerance: 1e-2,
            damping_lambda: 0.1,
            reduced_chi2_threshold: 2.0,
            n_iterations: 3,
            spatial_reject_sigma: 3.0,
            non_linear_spatial_fit: false,
        }
    }
}

impl PcaPsfConfig {
    /// Check that the configuration describes a runnable fit
    pub fn validate(&self) -> Result<(), PsfError> {
        let fail = |msg: String| Err(PsfError::Config(msg));

        if self.n_eigen_components == 0 {
            return fail("nEigenComponents must be at least 1".to_string());
        }
        if self.size_cell_x == 0 || self.size_cell_y == 0 {
            return fail(format!(
                "cell size must be positive, got {}x{}",
                self.size_cell_x, self.size_cell_y
            ));
        }
        if self.kernel_size == 0 || self.kernel_size_min == 0 {
            return fail("kernel sizes must be positive".to_string());
        }
        if self.kernel_size_min > self.kernel_size_max {
            return fail(format!(
                "kernelSizeMin {} exceeds kernelSizeMax {}",
                self.kernel_size_min, self.kernel_size_max
            ));
        }
        // Kernels are centred on a pixel, so every size a run can pick is odd
        if self.kernel_size_min % 2 == 0 || self.kernel_size_max % 2 == 0 {
            return fail(format!(
                "kernelSizeMin and kernelSizeMax must be odd, got {} and {}",
                self.kernel_size_min, self.kernel_size_max
            ));
        }
        if self.kernel_size >= ABSOLUTE_SIZE_THRESHOLD && self.kernel_size % 2 == 0 {
            return fail(format!(
                "an absolute kernelSize must be odd, got {}",
                self.kernel_size
            ));
        }
        if self.n_iterations == 0 {
            return fail("nIterations must be at least 1".to_string());
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return fail(format!("tolerance must be positive, got {}", self.tolerance));
        }
        if !(self.damping_lambda.is_finite() && self.damping_lambda >= 0.0) {
            return fail(format!(
                "dampingLambda must be non-negative, got {}",
                self.damping_lambda
            ));
        }
        if !(self.reduced_chi2_threshold.is_finite() && self.reduced_chi2_threshold > 0.0) {
            return fail(format!(
                "reducedChi2Threshold must be positive, got {}",
                self.reduced_chi2_threshold
            ));
        }
        if !(self.spatial_reject_sigma.is_finite() && self.spatial_reject_sigma > 0.0) {
            return fail(format!(
                "spatialRejectSigma must be positive, got {}",
                self.spatial_reject_sigma
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self, PsfError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, PsfError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String, PsfError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Side length of the stamps cut for a kernel of `kernel_size` pixels
    pub fn stamp_size(&self, kernel_size: usize) -> usize {
        kernel_size + 2 * self.border_width
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PcaPsfConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.n_eigen_components, 4);
        assert_eq!(config.n_iterations, 3);
        assert_eq!(config.stamp_size(25), 25);
    }

    #[test]
    fn test_camel_case_keys_with_defaults() {
        let config = PcaPsfConfig::from_json_str(
            r#"{"nEigenComponents": 3, "sizeCellX": 110, "reducedChi2Threshold": 5.0,
                "nStarPerCellSpatialFit": 0, "borderWidth": 2}"#,
        )
        .unwrap();
        assert_eq!(config.n_eigen_components, 3);
        assert_eq!(config.size_cell_x, 110);
        assert_eq!(config.size_cell_y, 256);
        assert_eq!(config.reduced_chi2_threshold, 5.0);
        assert_eq!(config.n_star_per_cell_spatial_fit, 0);
        assert_eq!(config.stamp_size(15), 19);
    }

    #[test]
    fn test_json_roundtrip_uses_camel_case() {
        let json = PcaPsfConfig::default().to_json_pretty().unwrap();
        assert!(json.contains("\"nonLinearSpatialFit\""));
        assert!(json.contains("\"kernelSizeMin\""));
        assert_eq!(
            PcaPsfConfig::from_json_str(&json).unwrap(),
            PcaPsfConfig::default()
        );
    }

    #[test]
    fn test_invalid_configs() {
        let bad = [
            PcaPsfConfig {
                n_eigen_components: 0,
                ..Default::default()
            },
            PcaPsfConfig {
                kernel_size_min: 50,
                ..Default::default()
            },
            PcaPsfConfig {
                n_iterations: 0,
                ..Default::default()
            },
            PcaPsfConfig {
                tolerance: f64::NAN,
                ..Default::default()
            },
            PcaPsfConfig {
                size_cell_y: 0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(PsfError::Config(_))));
        }
    }

    #[test]
    fn test_kernel_bounds_must_be_odd() {
        let even_min = PcaPsfConfig {
            kernel_size_min: 24,
            ..Default::default()
        };
        assert!(matches!(even_min.validate(), Err(PsfError::Config(_))));

        let even_max = PcaPsfConfig {
            kernel_size_max: 44,
            ..Default::default()
        };
        assert!(matches!(even_max.validate(), Err(PsfError::Config(_))));

        let even_absolute = PcaPsfConfig {
            kernel_size: 20,
            ..Default::default()
        };
        assert!(matches!(even_absolute.validate(), Err(PsfError::Config(_))));

        // Below the absolute threshold the base only scales the moments
        let even_base = PcaPsfConfig {
            kernel_size: 10,
            ..Default::default()
        };
        assert!(even_base.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"spatialOrder": 1, "nIterations": 5}}"#).unwrap();

        let config = PcaPsfConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.spatial_order, 1);
        assert_eq!(config.n_iterations, 5);

        let missing = PcaPsfConfig::load_from_file(Path::new("/nonexistent/psf.json"));
        assert!(matches!(missing, Err(PsfError::Io(_))));

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        write!(broken, "{{not json").unwrap();
        assert!(matches!(
            PcaPsfConfig::load_from_file(broken.path()),
            Err(PsfError::Json(_))
        ));
    }
}
