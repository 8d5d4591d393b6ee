use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::presence::AutoLockSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub camera: CameraConfig,
    pub thresholds: Thresholds,
    pub session: SessionConfig,
    pub activity: ActivityConfig,
    pub autolock: AutoLockConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub fps: u32,
    /// Metric samples kept by the classifier.
    pub window_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Degrees.
    pub neck_tilt: f32,
    /// Degrees.
    pub head_pitch: f32,
    /// Degrees.
    pub torso_lean: f32,
    /// Pixels.
    pub shoulder_asymmetry: f32,
    pub bad_posture_duration_secs: f64,
    pub good_posture_required_secs: f64,
    pub alert_ratio_percent: f32,
    pub good_ratio_percent: f32,
    pub alert_cooldown_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cumulative bad-posture durations that escalate the warning level.
    pub warning_thresholds_secs: Vec<f64>,
    pub min_state_duration_secs: f64,
    pub warning_reset_after_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub work_start_hour: u32,
    /// Inclusive.
    pub work_end_hour: u32,
    pub require_ac_power: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoLockConfig {
    pub enabled: bool,
    pub person_absent_threshold_secs: f64,
    pub lock_timeout_secs: f64,
    pub poll_interval_ms: u64,
    pub lock_command: Vec<String>,
    pub fallback_lock_command: Vec<String>,
    pub lock_state_command: Vec<String>,
    /// Trimmed output of `lock_state_command` meaning "locked".
    pub locked_output: String,
    pub wake_command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            camera: CameraConfig::default(),
            thresholds: Thresholds::default(),
            session: SessionConfig::default(),
            activity: ActivityConfig::default(),
            autolock: AutoLockConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fps: 15,
            window_size: 150,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            neck_tilt: 20.0,
            head_pitch: 30.0,
            torso_lean: 15.0,
            shoulder_asymmetry: 8.0,
            bad_posture_duration_secs: 3.0,
            good_posture_required_secs: 5.0,
            alert_ratio_percent: 60.0,
            good_ratio_percent: 80.0,
            alert_cooldown_secs: 300.0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            warning_thresholds_secs: vec![15.0, 45.0, 120.0],
            min_state_duration_secs: 2.0,
            warning_reset_after_secs: 10.0,
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            work_start_hour: 9,
            work_end_hour: 23,
            require_ac_power: true,
        }
    }
}

impl Default for AutoLockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            person_absent_threshold_secs: 10.0,
            lock_timeout_secs: 30.0,
            poll_interval_ms: 250,
            lock_command: args(&["loginctl", "lock-session"]),
            fallback_lock_command: args(&["xdg-screensaver", "lock"]),
            lock_state_command: args(&[
                "loginctl",
                "show-session",
                "self",
                "--property=LockedHint",
                "--value",
            ]),
            locked_output: "yes".to_string(),
            wake_command: args(&["xset", "dpms", "force", "on"]),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/posture_data.jsonl"),
        }
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

impl Thresholds {
    pub fn bad_posture_duration(&self) -> Duration {
        secs(self.bad_posture_duration_secs)
    }

    pub fn good_posture_required(&self) -> Duration {
        secs(self.good_posture_required_secs)
    }

    pub fn alert_cooldown(&self) -> Duration {
        secs(self.alert_cooldown_secs)
    }
}

impl SessionConfig {
    /// Warning thresholds in ascending order.
    pub fn warning_thresholds(&self) -> Vec<Duration> {
        let mut thresholds: Vec<Duration> =
            self.warning_thresholds_secs.iter().map(|&s| secs(s)).collect();
        thresholds.sort();
        thresholds
    }

    pub fn min_state_duration(&self) -> Duration {
        secs(self.min_state_duration_secs)
    }

    pub fn warning_reset_after(&self) -> Duration {
        secs(self.warning_reset_after_secs)
    }
}

impl AutoLockConfig {
    /// Timer settings with the same floors the settings UI enforces:
    /// at least 1s of absence and 5s to acknowledge.
    pub fn settings(&self) -> AutoLockSettings {
        AutoLockSettings {
            absent_threshold: secs(self.person_absent_threshold_secs.max(1.0)),
            lock_timeout: secs(self.lock_timeout_secs.max(5.0)),
            poll_interval: Duration::from_millis(self.poll_interval_ms.clamp(10, 1000)),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path))
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content).with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    /// Loads `path`, writing the defaults there first if it does not exist.
    pub fn load_or_create(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }
}
