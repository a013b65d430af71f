//! Typed settings snapshot consumed by every pipeline component.
//!
//! Settings are persisted as a JSON document. Unknown keys are rejected at
//! load time so a typo in the file surfaces immediately instead of silently
//! falling back to a default. A `Settings` value is immutable for the
//! duration of a pipeline run; preset switching replaces all preset-owned
//! fields in one step.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    UltraLite,
    #[default]
    Balanced,
    Accurate,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub preset: Preset,

    // Concurrency
    #[serde(default = "default_thread_cap")]
    pub thread_cap: usize,
    #[serde(default = "default_io_throttle")]
    pub io_throttle_ops_per_sec: f64,
    #[serde(default = "default_true")]
    pub back_off_enabled: bool,
    #[serde(default = "default_interaction_threshold")]
    pub interaction_threshold: u32,
    #[serde(default = "default_interaction_window")]
    pub interaction_window_seconds: f64,
    #[serde(default = "default_back_off_duration")]
    pub back_off_duration_seconds: f64,

    // Batch sizes
    #[serde(default = "default_batch_scanning")]
    pub batch_scanning: usize,
    #[serde(default = "default_batch_hashing")]
    pub batch_hashing: usize,
    #[serde(default = "default_batch_thumbnails")]
    pub batch_thumbnails: usize,

    // Hashing
    #[serde(default = "default_phash_threshold")]
    pub phash_threshold: u32,
    #[serde(default = "default_dhash_threshold")]
    pub dhash_threshold: u32,
    #[serde(default = "default_ahash_threshold")]
    pub ahash_threshold: u32,
    #[serde(default = "default_true")]
    pub enable_strong_hash_confirmation: bool,
    #[serde(default)]
    pub enable_feature_match_fallback: bool,

    // Grouping
    #[serde(default = "default_dimension_tolerance")]
    pub dimension_tolerance_fraction: f64,
    #[serde(default)]
    pub strict_exif_datetime_match: bool,

    // Escalation
    #[serde(default = "default_datetime_tolerance")]
    pub datetime_tolerance_seconds: f64,
    #[serde(default = "default_true")]
    pub enable_camera_model_check: bool,

    // Format policy
    #[serde(default)]
    pub skip_raw_formats: bool,
    #[serde(default)]
    pub skip_tiff_formats: bool,
    #[serde(default = "default_max_decode_dimension")]
    pub max_decode_dimension: u32,

    // Scanner patterns
    #[serde(default = "default_include_patterns")]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

fn default_thread_cap() -> usize {
    4
}

fn default_io_throttle() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_interaction_threshold() -> u32 {
    3
}

fn default_interaction_window() -> f64 {
    1.0
}

fn default_back_off_duration() -> f64 {
    2.0
}

fn default_batch_scanning() -> usize {
    100
}

fn default_batch_hashing() -> usize {
    50
}

fn default_batch_thumbnails() -> usize {
    25
}

fn default_phash_threshold() -> u32 {
    8
}

fn default_dhash_threshold() -> u32 {
    8
}

fn default_ahash_threshold() -> u32 {
    10
}

fn default_dimension_tolerance() -> f64 {
    0.10
}

fn default_datetime_tolerance() -> f64 {
    2.0
}

fn default_max_decode_dimension() -> u32 {
    512
}

fn default_include_patterns() -> Vec<String> {
    [
        "*.jpg", "*.jpeg", "*.png", "*.gif", "*.bmp", "*.tiff", "*.tif",
        "*.webp", "*.heic", "*.heif", "*.raw", "*.cr2", "*.cr3", "*.nef",
        "*.arw", "*.dng", "*.rw2", "*.orf",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            preset: Preset::Balanced,
            thread_cap: default_thread_cap(),
            io_throttle_ops_per_sec: default_io_throttle(),
            back_off_enabled: true,
            interaction_threshold: default_interaction_threshold(),
            interaction_window_seconds: default_interaction_window(),
            back_off_duration_seconds: default_back_off_duration(),
            batch_scanning: default_batch_scanning(),
            batch_hashing: default_batch_hashing(),
            batch_thumbnails: default_batch_thumbnails(),
            phash_threshold: default_phash_threshold(),
            dhash_threshold: default_dhash_threshold(),
            ahash_threshold: default_ahash_threshold(),
            enable_strong_hash_confirmation: true,
            enable_feature_match_fallback: false,
            dimension_tolerance_fraction: default_dimension_tolerance(),
            strict_exif_datetime_match: false,
            datetime_tolerance_seconds: default_datetime_tolerance(),
            enable_camera_model_check: true,
            skip_raw_formats: false,
            skip_tiff_formats: false,
            max_decode_dimension: default_max_decode_dimension(),
            include_patterns: default_include_patterns(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings: Settings = serde_json::from_str(&content)
                .map_err(|e| Error::Configuration(format!("malformed settings: {e}")))?;
            settings.validate()?;
            Ok(settings)
        } else {
            let settings = Settings::default();
            settings.save_to(path)?;
            Ok(settings)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("failed to serialize settings: {e}")))?;
        // Write-then-rename so a crash mid-save cannot truncate the document.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photodup")
            .join("settings.json")
    }

    /// Replace every preset-owned field with the named preset's values.
    /// `Custom` leaves the current values untouched.
    pub fn apply_preset(&mut self, preset: Preset) {
        self.preset = preset;
        match preset {
            Preset::UltraLite => {
                self.thread_cap = 2;
                self.io_throttle_ops_per_sec = 1.0;
                self.phash_threshold = 6;
                self.enable_feature_match_fallback = false;
                self.skip_raw_formats = true;
                self.skip_tiff_formats = true;
                self.max_decode_dimension = 128;
            }
            Preset::Balanced => {
                self.thread_cap = 4;
                self.io_throttle_ops_per_sec = 0.5;
                self.phash_threshold = 8;
                self.enable_feature_match_fallback = false;
                self.skip_raw_formats = false;
                self.skip_tiff_formats = false;
                self.max_decode_dimension = 512;
            }
            Preset::Accurate => {
                self.thread_cap = 8;
                self.io_throttle_ops_per_sec = 0.0;
                self.phash_threshold = 8;
                self.enable_feature_match_fallback = true;
                self.skip_raw_formats = false;
                self.skip_tiff_formats = false;
                self.max_decode_dimension = 1024;
            }
            Preset::Custom => {}
        }
    }

    /// Checked at pipeline start; a run refuses to start on bad settings.
    pub fn validate(&self) -> Result<()> {
        if self.thread_cap == 0 {
            return Err(Error::Configuration("thread_cap must be at least 1".into()));
        }
        if self.io_throttle_ops_per_sec < 0.0 {
            return Err(Error::Configuration(
                "io_throttle_ops_per_sec must not be negative".into(),
            ));
        }
        if self.interaction_window_seconds <= 0.0 || self.back_off_duration_seconds <= 0.0 {
            return Err(Error::Configuration(
                "interaction window and back-off duration must be positive".into(),
            ));
        }
        for (name, value) in [
            ("phash_threshold", self.phash_threshold),
            ("dhash_threshold", self.dhash_threshold),
            ("ahash_threshold", self.ahash_threshold),
        ] {
            if value > 64 {
                return Err(Error::Configuration(format!(
                    "{name} exceeds the 64-bit hash width"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.dimension_tolerance_fraction) {
            return Err(Error::Configuration(
                "dimension_tolerance_fraction must be within [0, 1]".into(),
            ));
        }
        if self.datetime_tolerance_seconds < 0.0 {
            return Err(Error::Configuration(
                "datetime_tolerance_seconds must not be negative".into(),
            ));
        }
        if self.include_patterns.is_empty() {
            return Err(Error::Configuration(
                "at least one include pattern is required".into(),
            ));
        }
        for pattern in self.include_patterns.iter().chain(&self.exclude_patterns) {
            glob::Pattern::new(pattern)
                .map_err(|e| Error::Configuration(format!("bad pattern {pattern:?}: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_balanced() {
        let s = Settings::default();
        assert_eq!(s.preset, Preset::Balanced);
        assert_eq!(s.thread_cap, 4);
        assert_eq!(s.phash_threshold, 8);
        assert_eq!(s.ahash_threshold, 10);
        assert!(s.enable_strong_hash_confirmation);
        s.validate().unwrap();
    }

    #[test]
    fn ultra_lite_overrides_preset_fields() {
        let mut s = Settings::default();
        s.apply_preset(Preset::UltraLite);
        assert_eq!(s.thread_cap, 2);
        assert_eq!(s.phash_threshold, 6);
        assert!(s.skip_raw_formats);
        assert!(s.skip_tiff_formats);
        assert_eq!(s.max_decode_dimension, 128);
        // Non-preset fields are untouched.
        assert_eq!(s.dhash_threshold, 8);
        assert_eq!(s.batch_hashing, 50);
    }

    #[test]
    fn round_trip_preserves_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut original = Settings::default();
        original.apply_preset(Preset::Accurate);
        original.exclude_patterns = vec!["*thumb*".to_string()];
        original.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"thread_cap": 4, "not_a_real_option": 1}"#).unwrap();

        let err = Settings::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn validation_rejects_out_of_range() {
        let mut s = Settings::default();
        s.thread_cap = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.phash_threshold = 65;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.dimension_tolerance_fraction = 1.5;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.include_patterns = vec!["[".to_string()];
        assert!(s.validate().is_err());
    }
}
