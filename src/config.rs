use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::HrrError;
use crate::logging::LogConfig;
use crate::models::RecoveryWindow;

/// Complete engine configuration.
///
/// Loaded once per run and passed by reference to every stage; nothing in the
/// engine mutates it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HrrConfig {
    /// Peak/valley detection
    pub detection: DetectionConfig,

    /// Decay fitting and feature computation
    pub metrics: MetricsConfig,

    /// Plateau re-anchoring
    pub reanchor: ReanchorConfig,

    /// Status and flag thresholds
    pub quality: QualityConfig,

    /// Multi-session processing
    pub batch: BatchConfig,

    /// Logging output
    pub logging: LogConfig,
}

/// Peak detection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Samples in the centered window used for smoothed slopes
    pub slope_window_samples: usize,

    /// Minimum rise above the surrounding troughs for a peak to count
    pub min_peak_prominence_bpm: f64,

    /// Peaks closer than this are treated as the same exertion
    pub peak_separation_sec: f64,

    /// How far back to look for the pre-exertion trough
    pub prominence_lookback_sec: f64,

    /// Smoothed slope above which heart rate counts as climbing
    pub rise_slope_min_bpm_per_sec: f64,

    /// Max-HR vs slope peak distance tolerated before slope wins
    pub method_disagreement_sec: f64,

    /// Backward peak search range
    pub backward_lookback_sec: f64,

    /// Span before the peak examined for a flat plateau
    pub lead_in_window_sec: f64,

    /// Largest |slope| still considered flat
    pub plateau_slope_max_bpm_per_sec: f64,

    /// Heart-rate band around the peak that counts as the same plateau
    pub plateau_tolerance_bpm: f64,

    /// Maximum recovery interval length after the peak
    pub recovery_horizon_sec: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            slope_window_samples: 5,
            min_peak_prominence_bpm: 15.0,
            peak_separation_sec: 60.0,
            prominence_lookback_sec: 120.0,
            rise_slope_min_bpm_per_sec: 0.25,
            method_disagreement_sec: 10.0,
            backward_lookback_sec: 30.0,
            lead_in_window_sec: 10.0,
            plateau_slope_max_bpm_per_sec: 0.15,
            plateau_tolerance_bpm: 2.0,
            recovery_horizon_sec: 120.0,
        }
    }
}

/// Feature computation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Windows (relative to the anchor) that get an R² value
    pub r2_windows: Vec<RecoveryWindow>,

    /// Fraction of a window's nominal per-second samples required for a fit
    pub min_window_coverage: f64,

    /// Absolute floor on samples per window
    pub min_window_samples: usize,

    /// Trailing span of the interval whose median is the settle heart rate
    pub settle_window_sec: f64,

    /// Drop (as a fraction of the reserve) marking decay onset
    pub onset_drop_fraction: f64,

    /// Search bounds for the decay time constant
    pub tau_min_sec: f64,
    pub tau_max_sec: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            r2_windows: vec![
                RecoveryWindow::new(0, 30),
                RecoveryWindow::new(30, 60),
                RecoveryWindow::new(15, 45),
                RecoveryWindow::new(0, 60),
                RecoveryWindow::new(90, 120),
            ],
            min_window_coverage: 0.8,
            min_window_samples: 5,
            settle_window_sec: 30.0,
            onset_drop_fraction: 0.1,
            tau_min_sec: 1.0,
            tau_max_sec: 600.0,
        }
    }
}

impl MetricsConfig {
    /// Samples a window needs before its R² is reported
    pub fn min_samples_for(&self, window: &RecoveryWindow) -> usize {
        let nominal = f64::from(window.length_sec()) + 1.0;
        let from_coverage = (nominal * self.min_window_coverage).ceil() as usize;
        from_coverage.max(self.min_window_samples)
    }
}

/// How the re-anchoring trigger combines its windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Any failing window triggers (current behavior)
    Any,
    /// Every window must fail (older single-symptom behavior)
    All,
}

/// Plateau re-anchoring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReanchorConfig {
    pub enabled: bool,

    /// Windows whose R² is checked against the pass threshold
    pub trigger_windows: Vec<RecoveryWindow>,

    pub trigger_mode: TriggerMode,

    /// Length of the sustained decline that marks true decay onset
    pub min_negative_run_sec: f64,

    /// Smoothed slope must be below the negative of this value
    pub negative_slope_bpm_per_sec: f64,

    /// Furthest the anchor may move forward
    pub max_shift_sec: f64,
}

impl Default for ReanchorConfig {
    fn default() -> Self {
        ReanchorConfig {
            enabled: true,
            trigger_windows: vec![RecoveryWindow::new(0, 30), RecoveryWindow::new(15, 45)],
            trigger_mode: TriggerMode::Any,
            min_negative_run_sec: 5.0,
            negative_slope_bpm_per_sec: 0.3,
            max_shift_sec: 60.0,
        }
    }
}

/// Quality assessment thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub r2_pass_threshold: f64,

    /// Shorter intervals are rejected
    pub min_duration_sec: f64,

    pub hr_reserve_floor_bpm: f64,

    pub onset_disagreement_sec: f64,

    /// Onset delays above this get ONSET_ADJUSTED
    pub onset_delay_flag_sec: f64,

    pub max_r2_delta: f64,

    /// Window pair compared for HIGH_R2_DELTA
    pub r2_delta_windows: [RecoveryWindow; 2],

    pub late_rise_window: RecoveryWindow,

    pub late_rise_slope_bpm_per_sec: f64,

    /// How close a manual adjustment's original time must be to a detected peak
    pub manual_peak_match_tolerance_sec: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        QualityConfig {
            r2_pass_threshold: 0.5,
            min_duration_sec: 60.0,
            hr_reserve_floor_bpm: 10.0,
            onset_disagreement_sec: 10.0,
            onset_delay_flag_sec: 15.0,
            max_r2_delta: 0.3,
            r2_delta_windows: [RecoveryWindow::new(0, 30), RecoveryWindow::new(30, 60)],
            late_rise_window: RecoveryWindow::new(90, 120),
            late_rise_slope_bpm_per_sec: 0.1,
            manual_peak_match_tolerance_sec: 2.0,
        }
    }
}

/// Multi-session processing settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Worker threads (None for the rayon default)
    pub num_threads: Option<usize>,

    /// Show a progress bar
    pub show_progress: bool,
}

fn invalid(reason: impl Into<String>) -> HrrError {
    HrrError::Configuration(reason.into())
}

/// Configuration management implementation
impl HrrConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: HrrConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        fs::write(&path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).with_context(|| "Failed to serialize configuration to TOML")
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hrrs")
            .join("config.toml")
    }

    /// Load the given file, or the default location, falling back to defaults
    /// when the default file does not exist. An explicitly named file must load.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }

        let config_path = Self::default_config_path();
        if !config_path.exists() {
            tracing::debug!("No config at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }
        Self::load_from_file(&config_path)
    }

    /// Check that thresholds are mutually consistent
    pub fn validate(&self) -> crate::error::Result<()> {
        let d = &self.detection;
        if d.slope_window_samples < 2 {
            return Err(invalid("detection.slope_window_samples must be at least 2"));
        }
        for (name, value) in [
            ("detection.peak_separation_sec", d.peak_separation_sec),
            ("detection.recovery_horizon_sec", d.recovery_horizon_sec),
            ("detection.prominence_lookback_sec", d.prominence_lookback_sec),
            ("detection.lead_in_window_sec", d.lead_in_window_sec),
            ("quality.min_duration_sec", self.quality.min_duration_sec),
            ("metrics.settle_window_sec", self.metrics.settle_window_sec),
            ("reanchor.min_negative_run_sec", self.reanchor.min_negative_run_sec),
        ] {
            if !(value > 0.0) {
                return Err(invalid(format!("{} must be positive, got {}", name, value)));
            }
        }
        if d.backward_lookback_sec < 0.0 || d.method_disagreement_sec < 0.0 {
            return Err(invalid("detection lookback and tolerance must not be negative"));
        }

        let m = &self.metrics;
        if m.r2_windows.is_empty() {
            return Err(invalid("metrics.r2_windows must not be empty"));
        }
        for window in &m.r2_windows {
            if window.start_sec >= window.end_sec {
                return Err(invalid(format!("window {} has start >= end", window)));
            }
        }
        if !(m.min_window_coverage > 0.0 && m.min_window_coverage <= 1.0) {
            return Err(invalid("metrics.min_window_coverage must be in (0, 1]"));
        }
        if !(m.onset_drop_fraction > 0.0 && m.onset_drop_fraction < 1.0) {
            return Err(invalid("metrics.onset_drop_fraction must be in (0, 1)"));
        }
        if !(m.tau_min_sec > 0.0 && m.tau_min_sec < m.tau_max_sec) {
            return Err(invalid("metrics.tau_min_sec must be positive and below tau_max_sec"));
        }

        for window in &self.reanchor.trigger_windows {
            if !m.r2_windows.contains(window) {
                return Err(invalid(format!(
                    "reanchor trigger window {} is not in metrics.r2_windows",
                    window
                )));
            }
        }
        for window in &self.quality.r2_delta_windows {
            if !m.r2_windows.contains(window) {
                return Err(invalid(format!(
                    "quality delta window {} is not in metrics.r2_windows",
                    window
                )));
            }
        }

        let q = &self.quality;
        if q.late_rise_window.start_sec >= q.late_rise_window.end_sec {
            return Err(invalid("quality.late_rise_window has start >= end"));
        }
        if q.r2_pass_threshold > 1.0 {
            return Err(invalid("quality.r2_pass_threshold cannot exceed 1"));
        }

        if let Some(0) = self.batch.num_threads {
            return Err(invalid("batch.num_threads must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_serialization() {
        let config = HrrConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: HrrConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
            [quality]
            r2_pass_threshold = 0.6

            [reanchor]
            trigger_mode = "all"
        "#;
        let config: HrrConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.quality.r2_pass_threshold, 0.6);
        assert_eq!(config.quality.min_duration_sec, 60.0);
        assert_eq!(config.reanchor.trigger_mode, TriggerMode::All);
        assert_eq!(config.detection.backward_lookback_sec, 30.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(HrrConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_unknown_trigger_window() {
        let mut config = HrrConfig::default();
        config.reanchor.trigger_windows = vec![RecoveryWindow::new(5, 35)];
        assert!(matches!(config.validate(), Err(HrrError::Configuration(_))));
    }

    #[test]
    fn test_validation_rejects_inverted_window() {
        let mut config = HrrConfig::default();
        config.metrics.r2_windows.push(RecoveryWindow::new(60, 30));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_samples_for_window() {
        let metrics = MetricsConfig::default();
        assert_eq!(metrics.min_samples_for(&RecoveryWindow::new(0, 30)), 25);

        let sparse = MetricsConfig {
            min_window_coverage: 0.1,
            ..MetricsConfig::default()
        };
        assert_eq!(sparse.min_samples_for(&RecoveryWindow::new(0, 30)), 5);
    }

    #[test]
    fn test_config_file_io() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = HrrConfig::default();
        original.quality.max_r2_delta = 0.25;
        original.batch.num_threads = Some(2);

        original.save_to_file(&config_path).unwrap();
        let loaded = HrrConfig::load_from_file(&config_path).unwrap();

        assert_eq!(loaded, original);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("nope.toml");
        assert!(HrrConfig::load_or_default(Some(&missing)).is_err());
    }
}
