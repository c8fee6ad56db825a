//! Correction workflow configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use warpdrive_core::convert::InversionOptions;
use warpdrive_core::error::{Result, WarpDriveError};

/// Correction workflow configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpDriveConfig {
    /// Radius in mm of the drawing brush used for stroke masks.
    pub brush_radius: f64,
    /// Isotropic spacing of the correction grid. `None` keeps the input grid.
    pub spacing_override: Option<f64>,
    /// Influence radius for points without a radius annotation.
    pub default_rbf_radius: f64,
    /// Global stiffness passed to the solver.
    pub stiffness: f64,
    /// Fixed-point iterations when inverting fields.
    pub inversion_iterations: usize,
    /// Inversion convergence threshold in mm.
    pub inversion_tolerance: f64,
    /// Modality of the anchor image. `None` accepts any.
    pub anchor_modality: Option<String>,
    /// Registration solver executable.
    pub solver_executable: Option<PathBuf>,
}

impl Default for WarpDriveConfig {
    fn default() -> Self {
        Self {
            brush_radius: 15.0,
            spacing_override: Some(2.0),
            default_rbf_radius: 30.0,
            stiffness: 0.1,
            inversion_iterations: 20,
            inversion_tolerance: 0.01,
            anchor_modality: None,
            solver_executable: None,
        }
    }
}

impl WarpDriveConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing keys take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            WarpDriveError::invalid_parameter(format!("bad config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_spacing_override(mut self, spacing: Option<f64>) -> Self {
        self.spacing_override = spacing;
        self
    }

    pub fn with_stiffness(mut self, stiffness: f64) -> Self {
        self.stiffness = stiffness;
        self
    }

    pub fn with_default_rbf_radius(mut self, radius: f64) -> Self {
        self.default_rbf_radius = radius;
        self
    }

    pub fn with_anchor_modality(mut self, modality: impl Into<String>) -> Self {
        self.anchor_modality = Some(modality.into());
        self
    }

    pub fn with_solver_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.solver_executable = Some(path.into());
        self
    }

    pub fn inversion_options(&self) -> InversionOptions {
        InversionOptions {
            iterations: self.inversion_iterations,
            tolerance: self.inversion_tolerance,
        }
    }

    /// Reject values no workflow step can use.
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(WarpDriveError::invalid_parameter(format!("{name} must be positive, got {v}")))
            }
        };
        positive("brush_radius", self.brush_radius)?;
        positive("default_rbf_radius", self.default_rbf_radius)?;
        positive("inversion_tolerance", self.inversion_tolerance)?;
        if let Some(spacing) = self.spacing_override {
            positive("spacing_override", spacing)?;
        }
        if !self.stiffness.is_finite() || self.stiffness < 0.0 {
            return Err(WarpDriveError::invalid_parameter(format!(
                "stiffness must be non-negative, got {}",
                self.stiffness
            )));
        }
        if self.inversion_iterations == 0 {
            return Err(WarpDriveError::invalid_parameter(
                "inversion_iterations must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WarpDriveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.spacing_override, Some(2.0));
        assert_eq!(config.inversion_options(), InversionOptions::default());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"stiffness": 0.5, "spacing_override": null}"#).unwrap();
        let config = WarpDriveConfig::from_file(&path).unwrap();
        assert_eq!(config.stiffness, 0.5);
        assert_eq!(config.spacing_override, None);
        assert_eq!(config.default_rbf_radius, 30.0);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(WarpDriveConfig::new().with_spacing_override(Some(0.0)).validate().is_err());
        assert!(WarpDriveConfig::new().with_stiffness(-1.0).validate().is_err());
        assert!(WarpDriveConfig::new().with_default_rbf_radius(f64::NAN).validate().is_err());
    }
}
