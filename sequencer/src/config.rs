//! Rig configuration.
//!
//! Loaded from JSON once at startup. Out-of-range numbers never abort
//! the program: [`RigConfig::sanitize`] pulls them back to defaults with
//! a logged warning, so a hand-edited file cannot leave the rig
//! unstartable.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Exposure defaults applied when the operator leaves a field blank.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    pub default_exptime_s: f64,
    pub default_count: usize,
    /// Rough per-frame readout overhead, used for progress estimates.
    pub readout_time_s: f64,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            default_exptime_s: 1.0,
            default_count: 1,
            readout_time_s: 3.0,
        }
    }
}

/// Floors and ceilings for calibration stacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackingConfig {
    pub min_bias_frames: usize,
    pub min_dark_frames: usize,
    /// Darks shorter than this are pointless; requests are raised to it.
    pub min_dark_exptime_s: f64,
    pub min_flat_frames: usize,
    pub max_continuous_frames: usize,
    /// Saturation ceiling for scaled dark subtraction, in counts.
    pub dark_ceiling: f64,
}

impl Default for StackingConfig {
    fn default() -> Self {
        Self {
            min_bias_frames: 5,
            min_dark_frames: 5,
            min_dark_exptime_s: 5.0,
            min_flat_frames: 3,
            max_continuous_frames: 10_000,
            dark_ceiling: 22_500.0,
        }
    }
}

/// Bounds of the adaptive flat exposure search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatSearchConfig {
    /// Acceptable bias-subtracted median range, in counts.
    pub counts_min: f64,
    pub counts_max: f64,
    pub exptime_min_s: f64,
    pub exptime_max_s: f64,
    pub max_attempts: usize,
}

impl Default for FlatSearchConfig {
    fn default() -> Self {
        Self {
            counts_min: 25_000.0,
            counts_max: 35_000.0,
            exptime_min_s: 0.1,
            exptime_max_s: 120.0,
            max_attempts: 8,
        }
    }
}

impl FlatSearchConfig {
    pub fn target(&self) -> f64 {
        (self.counts_min + self.counts_max) / 2.0
    }
}

/// Camera session connect behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_attempts: u32,
    pub connect_retry_s: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_retry_s: 20.0,
        }
    }
}

/// Guide loop and calibration training parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidingConfig {
    pub exptime_s: f64,
    /// Minimum spacing between applied actuator commands.
    pub min_step_interval_s: f64,
    /// Corrections smaller than this are dropped without touching the
    /// actuator.
    pub dead_band_px: f64,
    /// Wait after a training move before measuring the star.
    pub settle_s: f64,
    /// Bracket-test magnitudes in actuator steps, tried smallest first.
    pub train_magnitudes: Vec<f64>,
    /// Smallest measured displacement accepted as signal during
    /// training, in pixels.
    pub min_train_displacement_px: f64,
}

impl Default for GuidingConfig {
    fn default() -> Self {
        Self {
            exptime_s: 0.5,
            min_step_interval_s: 0.1,
            dead_band_px: 0.1,
            settle_s: 0.3,
            train_magnitudes: vec![10.0, 20.0, 40.0, 80.0],
            min_train_displacement_px: 1.0,
        }
    }
}

/// Top-level rig configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Root of the night data tree.
    pub store_root: PathBuf,
    /// Where trained guide calibrations persist between sessions.
    pub calibrations_path: PathBuf,
    pub exposure: ExposureConfig,
    pub stacking: StackingConfig,
    pub flat: FlatSearchConfig,
    pub session: SessionConfig,
    pub guiding: GuidingConfig,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("data"),
            calibrations_path: PathBuf::from("data/guide_calibrations.json"),
            exposure: ExposureConfig::default(),
            stacking: StackingConfig::default(),
            flat: FlatSearchConfig::default(),
            session: SessionConfig::default(),
            guiding: GuidingConfig::default(),
        }
    }
}

impl RigConfig {
    /// Load from a JSON file and sanitize numeric fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut config: Self = serde_json::from_reader(reader)?;
        config.sanitize();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Pull out-of-range numbers back to defaults, logging each fix.
    /// Invalid configuration is corrected, never fatal.
    pub fn sanitize(&mut self) {
        fn fix_f64(name: &str, value: &mut f64, ok: bool, default: f64) {
            if !ok {
                log::warn!("config: {name} = {value} out of range, using {default}");
                *value = default;
            }
        }
        fn fix_usize(name: &str, value: &mut usize, ok: bool, default: usize) {
            if !ok {
                log::warn!("config: {name} = {value} out of range, using {default}");
                *value = default;
            }
        }

        let d = ExposureConfig::default();
        let ok = self.exposure.default_exptime_s >= 0.0;
        fix_f64(
            "exposure.default_exptime_s",
            &mut self.exposure.default_exptime_s,
            ok,
            d.default_exptime_s,
        );
        let ok = self.exposure.default_count >= 1;
        fix_usize(
            "exposure.default_count",
            &mut self.exposure.default_count,
            ok,
            d.default_count,
        );

        let d = FlatSearchConfig::default();
        let ok = self.flat.exptime_min_s > 0.0;
        fix_f64(
            "flat.exptime_min_s",
            &mut self.flat.exptime_min_s,
            ok,
            d.exptime_min_s,
        );
        if self.flat.exptime_max_s < self.flat.exptime_min_s {
            log::warn!(
                "config: flat.exptime_max_s = {} below minimum, using {}",
                self.flat.exptime_max_s,
                d.exptime_max_s
            );
            self.flat.exptime_max_s = d.exptime_max_s;
        }
        if self.flat.counts_max <= self.flat.counts_min {
            log::warn!(
                "config: flat counts range [{}, {}] is empty, using defaults",
                self.flat.counts_min,
                self.flat.counts_max
            );
            self.flat.counts_min = d.counts_min;
            self.flat.counts_max = d.counts_max;
        }
        let ok = self.flat.max_attempts >= 1;
        fix_usize(
            "flat.max_attempts",
            &mut self.flat.max_attempts,
            ok,
            d.max_attempts,
        );

        let d = GuidingConfig::default();
        let ok = self.guiding.exptime_s > 0.0;
        fix_f64(
            "guiding.exptime_s",
            &mut self.guiding.exptime_s,
            ok,
            d.exptime_s,
        );
        let ok = self.guiding.min_step_interval_s >= 0.0;
        fix_f64(
            "guiding.min_step_interval_s",
            &mut self.guiding.min_step_interval_s,
            ok,
            d.min_step_interval_s,
        );
        let ok = self.guiding.dead_band_px >= 0.0;
        fix_f64(
            "guiding.dead_band_px",
            &mut self.guiding.dead_band_px,
            ok,
            d.dead_band_px,
        );
        if self.guiding.train_magnitudes.is_empty()
            || self.guiding.train_magnitudes.iter().any(|&m| m <= 0.0)
        {
            log::warn!("config: guiding.train_magnitudes invalid, using defaults");
            self.guiding.train_magnitudes = d.train_magnitudes;
        }
    }
}
