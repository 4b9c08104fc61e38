use chrono::{Duration, NaiveDateTime};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::{ConfigKey, DynamicConfig, DynamicConfigSource},
    hass::HomeAssistant,
    types::SeasonalMode,
};

#[derive(Debug, Error, PartialEq)]
enum CoerceError {
    #[error("{raw:?} is not a boolean")]
    NotBoolean { raw: String },
    #[error("{raw:?} is not a number")]
    NotNumber { raw: String },
}

/// A value written back to a configuration helper entity.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    Number(f32),
    Option(String),
}

#[derive(Debug, Clone)]
pub struct ConfigManager {
    source: DynamicConfigSource,
    refresh: Duration,
    config: DynamicConfig,
    last_update: Option<NaiveDateTime>,
}

impl ConfigManager {
    pub fn new(mut source: DynamicConfigSource, refresh: Duration) -> Self {
        source.defaults.sanitize();
        Self {
            config: source.defaults.clone(),
            source,
            refresh,
            last_update: None,
        }
    }

    pub fn config(&self) -> &DynamicConfig {
        &self.config
    }

    pub fn last_update(&self) -> Option<NaiveDateTime> {
        self.last_update
    }

    pub fn entity_for(&self, key: ConfigKey) -> Option<&str> {
        self.source.entities.get(&key).map(String::as_str)
    }

    pub fn should_update(&self, now: NaiveDateTime) -> bool {
        match self.last_update {
            None => true,
            Some(last) => now - last >= self.refresh,
        }
    }

    /// Re-reads every helper entity and returns whether anything changed.
    pub async fn update_config<H: HomeAssistant>(&mut self, host: &H, now: NaiveDateTime) -> bool {
        let mut next = self.source.defaults.clone();

        for (key, entity) in &self.source.entities {
            let raw = match host.get_state(entity).await {
                Ok(state) if state.is_available() => state.state,
                Ok(state) => {
                    warn!(
                        "config entity {entity} is {}, using default {}",
                        state.state,
                        key.as_str()
                    );
                    continue;
                }
                Err(err) => {
                    warn!(
                        "failed to read config entity {entity}: {err}, using default {}",
                        key.as_str()
                    );
                    continue;
                }
            };

            if let Err(err) = apply_raw(&mut next, *key, &raw) {
                warn!("config entity {entity}: {err}, using default {}", key.as_str());
            }
        }

        let changed = next != self.config;
        if changed {
            debug!("dynamic config changed: {next:?}");
        }
        self.config = next;
        self.last_update = Some(now);
        changed
    }

    pub fn set_enabled(&mut self, enabled: bool) -> ConfigValue {
        self.config.enabled = enabled;
        if !self.source.entities.contains_key(&ConfigKey::Enabled) {
            self.source.defaults.enabled = enabled;
        }
        ConfigValue::Bool(enabled)
    }

    pub fn set_temp_tolerance(&mut self, tolerance: f32) -> ConfigValue {
        let tolerance = clamp_logged(ConfigKey::TempTolerance, tolerance);
        self.config.temp_tolerance = tolerance;
        if !self.source.entities.contains_key(&ConfigKey::TempTolerance) {
            self.source.defaults.temp_tolerance = tolerance;
        }
        ConfigValue::Number(tolerance)
    }

    pub fn set_smart_hvac_mode(&mut self, mode: SeasonalMode) -> ConfigValue {
        self.config.smart_hvac_mode = mode;
        if !self.source.entities.contains_key(&ConfigKey::SmartHvacMode) {
            self.source.defaults.smart_hvac_mode = mode;
        }
        ConfigValue::Option(mode.as_str().to_string())
    }
}

fn apply_raw(config: &mut DynamicConfig, key: ConfigKey, raw: &str) -> Result<(), CoerceError> {
    match key {
        ConfigKey::Enabled => config.enabled = parse_bool(raw)?,
        ConfigKey::SmartHvacMode => {
            config.smart_hvac_mode = SeasonalMode::parse(raw);
            if config.smart_hvac_mode == SeasonalMode::Unknown {
                warn!("unrecognised seasonal mode {raw:?}");
            }
        }
        ConfigKey::TempTolerance => config.temp_tolerance = clamp_logged(key, parse_number(raw)?),
        ConfigKey::PrimaryDamperPercent => config.primary_damper_percent = parse_percent(key, raw)?,
        ConfigKey::SecondaryDamperPercent => {
            config.secondary_damper_percent = parse_percent(key, raw)?
        }
        ConfigKey::OverflowDamperPercent => {
            config.overflow_damper_percent = parse_percent(key, raw)?
        }
        ConfigKey::MinimumDamperPercent => config.minimum_damper_percent = parse_percent(key, raw)?,
    }
    Ok(())
}

fn parse_bool(raw: &str) -> Result<bool, CoerceError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        _ => Err(CoerceError::NotBoolean {
            raw: raw.to_string(),
        }),
    }
}

fn parse_number(raw: &str) -> Result<f32, CoerceError> {
    raw.trim()
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| CoerceError::NotNumber {
            raw: raw.to_string(),
        })
}

fn parse_percent(key: ConfigKey, raw: &str) -> Result<u8, CoerceError> {
    let value = parse_number(raw)?.round();
    Ok(clamp_logged(key, value) as u8)
}

fn clamp_logged(key: ConfigKey, value: f32) -> f32 {
    let Some((min, max)) = key.range() else {
        return value;
    };
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!("{} value {value} outside [{min}, {max}], clamped to {clamped}", key.as_str());
    }
    clamped
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;

    use super::*;
    use crate::{fake_home::FakeHome, hass::EntityState};

    fn at(minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(9, minute, second)
            .unwrap()
    }

    fn manager() -> ConfigManager {
        let entities = BTreeMap::from([
            (ConfigKey::Enabled, "input_boolean.smart_aircon".to_string()),
            (ConfigKey::TempTolerance, "input_number.aircon_tolerance".to_string()),
            (ConfigKey::SmartHvacMode, "input_select.aircon_season".to_string()),
            (ConfigKey::PrimaryDamperPercent, "input_number.primary_damper".to_string()),
            (ConfigKey::MinimumDamperPercent, "input_number.minimum_damper".to_string()),
        ]);
        ConfigManager::new(
            DynamicConfigSource {
                entities,
                defaults: DynamicConfig::default(),
            },
            Duration::seconds(60),
        )
    }

    #[test]
    fn refresh_is_throttled() {
        let mut manager = manager();
        assert!(manager.should_update(at(0, 0)));

        manager.last_update = Some(at(0, 0));
        assert!(!manager.should_update(at(0, 59)));
        assert!(manager.should_update(at(1, 0)));
    }

    #[tokio::test]
    async fn coerces_helper_states() {
        let home = FakeHome::new();
        home.put(EntityState::new("input_boolean.smart_aircon", "off"));
        home.put(EntityState::new("input_number.aircon_tolerance", "0.8"));
        home.put(EntityState::new("input_select.aircon_season", "Cool"));
        home.put(EntityState::new("input_number.primary_damper", "75.6"));
        home.put(EntityState::new("input_number.minimum_damper", "3"));

        let mut manager = manager();
        assert!(manager.update_config(&home, at(0, 0)).await);

        let config = manager.config();
        assert!(!config.enabled);
        assert_eq!(config.temp_tolerance, 0.8);
        assert_eq!(config.smart_hvac_mode, SeasonalMode::Cool);
        assert_eq!(config.primary_damper_percent, 76);
        assert_eq!(config.minimum_damper_percent, 3);
        assert_eq!(config.secondary_damper_percent, 40);

        assert!(!manager.update_config(&home, at(1, 0)).await);
        assert_eq!(manager.last_update(), Some(at(1, 0)));
    }

    #[tokio::test]
    async fn out_of_range_values_are_clamped() {
        let home = FakeHome::new();
        home.put(EntityState::new("input_number.aircon_tolerance", "0.01"));
        home.put(EntityState::new("input_number.primary_damper", "120"));
        home.put(EntityState::new("input_number.minimum_damper", "0"));

        let mut manager = manager();
        manager.update_config(&home, at(0, 0)).await;

        assert_eq!(manager.config().temp_tolerance, 0.1);
        assert_eq!(manager.config().primary_damper_percent, 100);
        assert_eq!(manager.config().minimum_damper_percent, 1);
    }

    #[tokio::test]
    async fn unusable_entities_fall_back_to_defaults() {
        let home = FakeHome::new();
        home.put(EntityState::new("input_boolean.smart_aircon", "maybe"));
        home.put(EntityState::new("input_number.aircon_tolerance", "unavailable"));
        home.put(EntityState::new("input_number.primary_damper", "wide"));
        home.fail_reads("input_select.aircon_season");

        let mut manager = manager();
        assert!(!manager.update_config(&home, at(0, 0)).await);

        assert_eq!(manager.config(), &DynamicConfig::default());
        assert_eq!(manager.last_update(), Some(at(0, 0)));
    }

    #[tokio::test]
    async fn local_setting_survives_refresh_without_helper_entity() {
        let home = FakeHome::new();
        let mut manager = ConfigManager::new(DynamicConfigSource::default(), Duration::seconds(60));

        assert_eq!(manager.set_temp_tolerance(7.0), ConfigValue::Number(5.0));
        manager.update_config(&home, at(0, 0)).await;

        assert_eq!(manager.config().temp_tolerance, 5.0);
    }
}
