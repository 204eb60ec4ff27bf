use crate::error::{DetectorError, Result};
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_SSIM_INTERVAL_SECS: f64 = 5.0;
const DEFAULT_BRIGHTNESS_HISTORY_LEN: usize = 10;

/// Tunables for `BackgroundChangeDetector`. Every field has a default, so a
/// TOML file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    /// Minimum gap between SSIM checks, in seconds.
    pub ssim_interval_secs: f64,
    /// Number of recent mean-brightness values kept for `average_brightness`.
    pub brightness_history_len: usize,
    pub stability: StabilityConfig,
    pub classification: ClassificationThresholds,
    pub flow: FlowParams,
    pub foreground: ForegroundConfig,
}

/// When an SSIM check counts as "stable" and how many in a row it takes to
/// adopt a new reference frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StabilityConfig {
    pub max_motion_ratio: f64,
    pub min_ssim: f64,
    pub required_checks: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassificationThresholds {
    /// Mean brightness below this is a lighting drop or a blocked camera.
    pub brightness_floor: f64,
    /// Inclusive motion band that reads as a person moving.
    pub movement_min: f64,
    pub movement_max: f64,
    /// Motion above this means the whole view moved.
    pub background_motion: f64,
    /// SSIM at or below this means the scene no longer matches the reference.
    pub ssim_floor: f64,
}

/// Dense optical flow parameters. `poly_n` and `poly_sigma` size the
/// Gaussian used to smooth each pyramid level before gradients are taken.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowParams {
    pub pyramid_scale: f32,
    pub levels: usize,
    pub window_size: usize,
    pub iterations: usize,
    pub poly_n: usize,
    pub poly_sigma: f32,
    /// Flow magnitude (pixels) a pixel must exceed to count as moving.
    pub magnitude_threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForegroundConfig {
    pub enabled: bool,
    pub history: u32,
    pub samples: usize,
    pub k_nearest: usize,
    pub dist2_threshold: f32,
    pub open_radius: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            ssim_interval_secs: DEFAULT_SSIM_INTERVAL_SECS,
            brightness_history_len: DEFAULT_BRIGHTNESS_HISTORY_LEN,
            stability: StabilityConfig::default(),
            classification: ClassificationThresholds::default(),
            flow: FlowParams::default(),
            foreground: ForegroundConfig::default(),
        }
    }
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            max_motion_ratio: 0.03,
            min_ssim: 0.98,
            required_checks: 3,
        }
    }
}

impl Default for ClassificationThresholds {
    fn default() -> Self {
        Self {
            brightness_floor: 50.0,
            movement_min: 0.1,
            movement_max: 0.6,
            background_motion: 0.7,
            ssim_floor: 0.5,
        }
    }
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            pyramid_scale: 0.5,
            levels: 3,
            window_size: 15,
            iterations: 3,
            poly_n: 5,
            poly_sigma: 1.2,
            magnitude_threshold: 1.0,
        }
    }
}

impl Default for ForegroundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history: 200,
            samples: 7,
            k_nearest: 2,
            dist2_threshold: 1000.0,
            open_radius: 1,
        }
    }
}

impl DetectorConfig {
    /// Saturates at `Duration::MAX` for values `validate` would reject.
    pub fn ssim_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.ssim_interval_secs).unwrap_or(Duration::MAX)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| DetectorError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        if Duration::try_from_secs_f64(self.ssim_interval_secs).is_err() {
            return invalid("ssim_interval_secs must be a non-negative number of seconds that fits a Duration");
        }
        if self.brightness_history_len == 0 {
            return invalid("brightness_history_len must be at least 1");
        }

        let s = &self.stability;
        check_unit("stability.max_motion_ratio", s.max_motion_ratio)?;
        check_unit("stability.min_ssim", s.min_ssim)?;
        if s.required_checks == 0 {
            return invalid("stability.required_checks must be at least 1");
        }

        let c = &self.classification;
        if !(0.0..=255.0).contains(&c.brightness_floor) {
            return invalid("classification.brightness_floor must be within 0..=255");
        }
        check_unit("classification.movement_min", c.movement_min)?;
        check_unit("classification.movement_max", c.movement_max)?;
        check_unit("classification.background_motion", c.background_motion)?;
        check_unit("classification.ssim_floor", c.ssim_floor)?;
        if c.movement_min > c.movement_max {
            return invalid("classification.movement_min must not exceed movement_max");
        }

        let f = &self.flow;
        if !(f.pyramid_scale > 0.0 && f.pyramid_scale < 1.0) {
            return invalid("flow.pyramid_scale must be strictly between 0 and 1");
        }
        if f.levels == 0 || f.iterations == 0 {
            return invalid("flow.levels and flow.iterations must be at least 1");
        }
        if f.window_size < 3 || f.window_size % 2 == 0 {
            return invalid("flow.window_size must be an odd number >= 3");
        }
        if f.poly_n == 0 || f.poly_n % 2 == 0 {
            return invalid("flow.poly_n must be an odd number >= 1");
        }
        if !(f.poly_sigma > 0.0) || !(f.magnitude_threshold >= 0.0) {
            return invalid("flow.poly_sigma must be positive and magnitude_threshold non-negative");
        }

        let g = &self.foreground;
        if g.samples == 0 || g.k_nearest == 0 || g.k_nearest > g.samples {
            return invalid("foreground.k_nearest must be within 1..=samples");
        }
        if g.history == 0 {
            return invalid("foreground.history must be at least 1");
        }
        if !(g.dist2_threshold > 0.0) {
            return invalid("foreground.dist2_threshold must be positive");
        }

        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        invalid(&format!("{} must be within 0..=1, got {}", name, value))
    }
}

fn invalid(message: &str) -> Result<()> {
    Err(DetectorError::InvalidConfig(message.to_string()))
}
