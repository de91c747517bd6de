use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::align::RegistrationParams;
use crate::deconvolve::DeconvVariant;
use crate::filters::Interpolation;
use crate::geometry::TileGrid;
use crate::kernel::Kernel;

/// Which PSF the deconvolver inverts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelSpec {
    /// Sampled Gaussian.
    Analytic { size: usize, sigma: f64 },
    /// Blur of a point source sampled by the sensor and upscaled with the
    /// run's interpolation. Needs an integral scale factor.
    Simulated,
}

impl Default for KernelSpec {
    fn default() -> Self {
        Self::Analytic { size: 5, sigma: 0.8 }
    }
}

/// What to do when a candidate frame cannot be registered on a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationFailurePolicy {
    /// Fail the run.
    #[default]
    Abort,
    /// Leave the frame out of this tile's average.
    SkipFrame,
}

/// Settings for one merge run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Tile edge in reference-frame pixels, before margin.
    pub tile_size: usize,
    pub scale_factor: f64,
    /// Context added around each tile, as a fraction of `tile_size`.
    pub margin_fraction: f64,
    pub interpolation: Interpolation,
    pub kernel: KernelSpec,
    pub deconv_iterations: usize,
    pub deconv_variant: DeconvVariant,
    pub registration: RegistrationParams,
    pub on_registration_failure: RegistrationFailurePolicy,
    /// First tile column processed. Earlier columns stay black.
    pub first_tile_column: usize,
    /// Leave the canvas's last row and column unwritten.
    pub reserve_canvas_edge: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            tile_size: 1024,
            scale_factor: 1.4,
            margin_fraction: 0.1,
            interpolation: Interpolation::Lanczos4,
            kernel: KernelSpec::default(),
            deconv_iterations: 40,
            deconv_variant: DeconvVariant::Guarded,
            registration: RegistrationParams::default(),
            on_registration_failure: RegistrationFailurePolicy::Abort,
            first_tile_column: 0,
            reserve_canvas_edge: false,
        }
    }
}

impl MergeConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if self.tile_size == 0 {
            return invalid("tile_size must be positive".into());
        }
        if !(self.scale_factor.is_finite() && self.scale_factor >= 1.0) {
            return invalid(format!("scale_factor must be at least 1, got {}", self.scale_factor));
        }
        if !(self.margin_fraction.is_finite() && self.margin_fraction >= 0.0) {
            return invalid(format!(
                "margin_fraction must be non-negative, got {}",
                self.margin_fraction
            ));
        }
        if self.deconv_iterations == 0 {
            return invalid("deconv_iterations must be positive".into());
        }
        if self.registration.max_iterations == 0 {
            return invalid("registration.max_iterations must be positive".into());
        }
        if !(self.registration.epsilon.is_finite() && self.registration.epsilon >= 0.0) {
            return invalid(format!(
                "registration.epsilon must be non-negative, got {}",
                self.registration.epsilon
            ));
        }
        match self.kernel {
            KernelSpec::Analytic { size, sigma } => {
                if size == 0 || !(sigma.is_finite() && sigma > 0.0) {
                    return invalid(format!("invalid analytic kernel {size}x{size}, sigma {sigma}"));
                }
            }
            KernelSpec::Simulated => {
                if self.scale_factor.fract() != 0.0 {
                    return invalid(format!(
                        "simulated kernel needs an integral scale factor, got {}",
                        self.scale_factor
                    ));
                }
            }
        }
        Ok(())
    }

    /// The PSF for this run.
    pub fn build_kernel(&self) -> Result<Kernel, Error> {
        match self.kernel {
            KernelSpec::Analytic { size, sigma } => Kernel::analytic(size, sigma),
            KernelSpec::Simulated => {
                Kernel::simulated(self.scale_factor.round() as u32, self.interpolation)
            }
        }
    }

    /// Tile grid for `width × height` frames.
    pub fn tile_grid(&self, width: usize, height: usize) -> Result<TileGrid, Error> {
        Ok(
            TileGrid::new(width, height, self.tile_size, self.scale_factor, self.margin_fraction)?
                .with_reserved_canvas_edge(self.reserve_canvas_edge),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MergeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.tile_size, 1024);
        assert_eq!(config.build_kernel().unwrap().size(), 5);
    }

    #[test]
    fn parses_partial_toml() {
        let config: MergeConfig = toml::from_str(
            r#"
            tile_size = 256
            scale_factor = 2.0
            interpolation = "bicubic"
            deconv_variant = "unguarded"
            on_registration_failure = "skip_frame"

            [kernel]
            type = "simulated"

            [registration]
            max_iterations = 100
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.tile_size, 256);
        assert_eq!(config.interpolation, Interpolation::Bicubic);
        assert_eq!(config.kernel, KernelSpec::Simulated);
        assert_eq!(config.deconv_variant, DeconvVariant::Unguarded);
        assert_eq!(config.on_registration_failure, RegistrationFailurePolicy::SkipFrame);
        assert_eq!(config.registration.max_iterations, 100);
        assert_eq!(config.registration.epsilon, 1e-5);
        assert_eq!(config.margin_fraction, 0.1);
        assert_eq!(config.build_kernel().unwrap().size(), 10);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merge.toml");
        std::fs::write(&path, "tile_size = 64\n[kernel]\ntype = \"analytic\"\nsize = 3\nsigma = 1.0\n")
            .unwrap();
        let config = MergeConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.kernel, KernelSpec::Analytic { size: 3, sigma: 1.0 });

        std::fs::write(&path, "tile_size = 0\n").unwrap();
        assert!(matches!(MergeConfig::from_toml_file(&path), Err(Error::InvalidConfig(_))));
        std::fs::write(&path, "tile_size = \"big\"\n").unwrap();
        assert!(matches!(MergeConfig::from_toml_file(&path), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            MergeConfig { scale_factor: -1.0, ..Default::default() },
            MergeConfig { scale_factor: 0.3, tile_size: 1, ..Default::default() },
            MergeConfig { margin_fraction: f64::NAN, ..Default::default() },
            MergeConfig { deconv_iterations: 0, ..Default::default() },
            MergeConfig { kernel: KernelSpec::Simulated, ..Default::default() },
            MergeConfig { kernel: KernelSpec::Analytic { size: 5, sigma: 0.0 }, ..Default::default() },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }
}
