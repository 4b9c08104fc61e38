use std::collections::BTreeMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::types::SeasonalMode;

/// Settings that are read once at startup. Changing them requires a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub check_interval_secs: u64,
    pub main_climate: String,
    pub algorithm_timeout_minutes: i64,
    pub stability_check_minutes: i64,
    pub progress_timeout_minutes: i64,
    pub history_retention_minutes: i64,
    pub progress_lookback_minutes: i64,
    pub progress_threshold: f32,
    pub stability_threshold: f32,
    pub mode_history_lookback_minutes: i64,
    pub config_refresh_secs: i64,
    pub damper_low_threshold: u8,
    pub activation_step_delay_secs: i64,
    pub temperature_verify_delay_secs: i64,
    pub temperature_retry_wait_secs: i64,
    pub temperature_max_retries: u8,
    pub temperature_verify_tolerance: f32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            main_climate: "climate.aircon".to_string(),
            algorithm_timeout_minutes: 30,
            stability_check_minutes: 10,
            progress_timeout_minutes: 15,
            history_retention_minutes: 30,
            progress_lookback_minutes: 5,
            progress_threshold: 0.1,
            stability_threshold: 0.1,
            mode_history_lookback_minutes: 120,
            config_refresh_secs: 60,
            damper_low_threshold: 10,
            activation_step_delay_secs: 5,
            temperature_verify_delay_secs: 5,
            temperature_retry_wait_secs: 10,
            temperature_max_retries: 3,
            temperature_verify_tolerance: 0.1,
        }
    }
}

const MAX_WINDOW_MINUTES: i64 = 7 * 24 * 60;
const MAX_DELAY_SECS: i64 = 24 * 60 * 60;

impl ControllerConfig {
    /// Clamps windows to at most a week and delays to at most a day.
    pub fn sanitize(&mut self) {
        let minutes = |value: i64, min: i64| value.clamp(min, MAX_WINDOW_MINUTES);
        let secs = |value: i64, min: i64| value.clamp(min, MAX_DELAY_SECS);

        self.check_interval_secs = self.check_interval_secs.clamp(1, MAX_DELAY_SECS as u64);
        self.algorithm_timeout_minutes = minutes(self.algorithm_timeout_minutes, 1);
        self.stability_check_minutes = minutes(self.stability_check_minutes, 0);
        self.progress_timeout_minutes = minutes(self.progress_timeout_minutes, 1);
        self.history_retention_minutes = minutes(self.history_retention_minutes, 1);
        self.progress_lookback_minutes = minutes(self.progress_lookback_minutes, 1);
        self.mode_history_lookback_minutes = minutes(self.mode_history_lookback_minutes, 1);
        self.config_refresh_secs = secs(self.config_refresh_secs, 1);
        self.damper_low_threshold = self.damper_low_threshold.min(100);
        self.activation_step_delay_secs = secs(self.activation_step_delay_secs, 0);
        self.temperature_verify_delay_secs = secs(self.temperature_verify_delay_secs, 1);
        self.temperature_retry_wait_secs = secs(self.temperature_retry_wait_secs, 1);
        self.temperature_max_retries = self.temperature_max_retries.clamp(1, 20);
        self.progress_threshold = self.progress_threshold.max(0.0);
        self.stability_threshold = self.stability_threshold.max(0.0);
        self.temperature_verify_tolerance = self.temperature_verify_tolerance.max(0.0);
    }

    pub fn algorithm_timeout(&self) -> Duration {
        Duration::minutes(self.algorithm_timeout_minutes)
    }

    pub fn progress_timeout(&self) -> Duration {
        Duration::minutes(self.progress_timeout_minutes)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::minutes(self.stability_check_minutes)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::minutes(self.history_retention_minutes)
    }

    pub fn progress_lookback(&self) -> Duration {
        Duration::minutes(self.progress_lookback_minutes)
    }

    pub fn mode_history_lookback(&self) -> Duration {
        Duration::minutes(self.mode_history_lookback_minutes)
    }

    pub fn config_refresh(&self) -> Duration {
        Duration::seconds(self.config_refresh_secs)
    }

    pub fn activation_step_delay(&self) -> Duration {
        Duration::seconds(self.activation_step_delay_secs)
    }

    pub fn temperature_verify_delay(&self) -> Duration {
        Duration::seconds(self.temperature_verify_delay_secs)
    }

    pub fn temperature_retry_wait(&self) -> Duration {
        Duration::seconds(self.temperature_retry_wait_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub climate_entity: String,
    pub damper_entity: String,
    #[serde(default)]
    pub isolation: bool,
    /// Overrides the climate entity's own setpoint when present.
    #[serde(default)]
    pub target_temp_entity: Option<String>,
    /// Overrides the global tolerance when present.
    #[serde(default)]
    pub threshold_entity: Option<String>,
}

/// Tuning knobs that are re-read from Home Assistant helpers while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    Enabled,
    TempTolerance,
    SmartHvacMode,
    PrimaryDamperPercent,
    SecondaryDamperPercent,
    OverflowDamperPercent,
    MinimumDamperPercent,
}

impl ConfigKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::TempTolerance => "temp_tolerance",
            Self::SmartHvacMode => "smart_hvac_mode",
            Self::PrimaryDamperPercent => "primary_damper_percent",
            Self::SecondaryDamperPercent => "secondary_damper_percent",
            Self::OverflowDamperPercent => "overflow_damper_percent",
            Self::MinimumDamperPercent => "minimum_damper_percent",
        }
    }

    /// Inclusive safe range for numeric keys.
    pub fn range(self) -> Option<(f32, f32)> {
        match self {
            Self::TempTolerance => Some((0.1, 5.0)),
            Self::PrimaryDamperPercent => Some((30.0, 100.0)),
            Self::SecondaryDamperPercent => Some((20.0, 80.0)),
            Self::OverflowDamperPercent => Some((5.0, 50.0)),
            Self::MinimumDamperPercent => Some((1.0, 20.0)),
            Self::Enabled | Self::SmartHvacMode => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicConfig {
    pub enabled: bool,
    pub temp_tolerance: f32,
    pub smart_hvac_mode: SeasonalMode,
    pub primary_damper_percent: u8,
    pub secondary_damper_percent: u8,
    pub overflow_damper_percent: u8,
    pub minimum_damper_percent: u8,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            temp_tolerance: 0.5,
            smart_hvac_mode: SeasonalMode::Heat,
            primary_damper_percent: 50,
            secondary_damper_percent: 40,
            overflow_damper_percent: 10,
            minimum_damper_percent: 5,
        }
    }
}

impl DynamicConfig {
    pub fn sanitize(&mut self) {
        self.temp_tolerance = clamp_key(ConfigKey::TempTolerance, self.temp_tolerance);
        self.primary_damper_percent =
            clamp_percent(ConfigKey::PrimaryDamperPercent, self.primary_damper_percent);
        self.secondary_damper_percent =
            clamp_percent(ConfigKey::SecondaryDamperPercent, self.secondary_damper_percent);
        self.overflow_damper_percent =
            clamp_percent(ConfigKey::OverflowDamperPercent, self.overflow_damper_percent);
        self.minimum_damper_percent =
            clamp_percent(ConfigKey::MinimumDamperPercent, self.minimum_damper_percent);
    }
}

fn clamp_key(key: ConfigKey, value: f32) -> f32 {
    match key.range() {
        Some((min, max)) => value.clamp(min, max),
        None => value,
    }
}

fn clamp_percent(key: ConfigKey, value: u8) -> u8 {
    clamp_key(key, f32::from(value)).round() as u8
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicConfigSource {
    pub entities: BTreeMap<ConfigKey, String>,
    pub defaults: DynamicConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: String,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            url: "http://homeassistant.local:8123".to_string(),
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub zones: BTreeMap<String, ZoneConfig>,
    pub dynamic: DynamicConfigSource,
    pub home_assistant: HomeAssistantConfig,
    pub http_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            zones: BTreeMap::new(),
            dynamic: DynamicConfigSource::default(),
            home_assistant: HomeAssistantConfig::default(),
            http_port: 8080,
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.controller.sanitize();
        self.dynamic.defaults.sanitize();
    }
}
