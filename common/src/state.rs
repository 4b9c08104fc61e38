use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{Duration, NaiveDateTime};
use tracing::{debug, warn};

use crate::{
    config::{ControllerConfig, DynamicConfig, ZoneConfig},
    hass::{EntityState, HomeAssistant},
    types::{HvacMode, SeasonalMode},
    zone::Zone,
};

pub const UNKNOWN_MODE: &str = "unknown";

/// What the recorder told us about the main unit's last mode transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    NotQueried,
    QueryFailed,
    NoTransition,
    ChangedAt(NaiveDateTime),
}

#[derive(Debug, Clone)]
pub struct StateManager {
    main_climate: String,
    damper_low_threshold: u8,
    history_retention: Duration,
    mode_history_lookback: Duration,

    zones: BTreeMap<String, Zone>,
    history: HashMap<String, VecDeque<(NaiveDateTime, f32)>>,
    current_hvac_mode: String,
    last_mode_change: ModeChange,
}

impl StateManager {
    pub fn new(config: &ControllerConfig, zones: &BTreeMap<String, ZoneConfig>) -> Self {
        Self {
            main_climate: config.main_climate.clone(),
            damper_low_threshold: config.damper_low_threshold,
            history_retention: config.history_retention(),
            mode_history_lookback: config.mode_history_lookback(),
            zones: zones
                .iter()
                .map(|(name, zone)| (name.clone(), Zone::new(name.clone(), zone)))
                .collect(),
            history: HashMap::new(),
            current_hvac_mode: UNKNOWN_MODE.to_string(),
            last_mode_change: ModeChange::NotQueried,
        }
    }

    pub fn main_climate(&self) -> &str {
        &self.main_climate
    }

    pub fn zones(&self) -> &BTreeMap<String, Zone> {
        &self.zones
    }

    pub fn zone(&self, name: &str) -> Option<&Zone> {
        self.zones.get(name)
    }

    pub fn zone_mut(&mut self, name: &str) -> Option<&mut Zone> {
        self.zones.get_mut(name)
    }

    pub fn current_hvac_mode(&self) -> &str {
        &self.current_hvac_mode
    }

    pub fn record_hvac_mode(&mut self, mode: HvacMode) {
        self.current_hvac_mode = mode.as_str().to_string();
    }

    pub fn last_mode_change(&self) -> ModeChange {
        self.last_mode_change
    }

    pub fn set_last_mode_change(&mut self, change: ModeChange) {
        self.last_mode_change = change;
    }

    pub async fn update_all_zones<H: HomeAssistant>(&mut self, host: &H, now: NaiveDateTime) {
        let names: Vec<String> = self.zones.keys().cloned().collect();
        for name in names {
            if self.update_zone(host, &name).await {
                let current = self.zones[&name].current_temp;
                self.record_temperature(&name, current, now);
            }
        }
    }

    async fn update_zone<H: HomeAssistant>(&mut self, host: &H, name: &str) -> bool {
        let Some(zone) = self.zones.get(name) else {
            return false;
        };
        let climate_entity = zone.entity_id.clone();
        let damper_entity = zone.damper_entity.clone();
        let target_entity = zone.target_temp_entity.clone();
        let threshold_entity = zone.threshold_entity.clone();

        let climate = match host.get_state(&climate_entity).await {
            Ok(state) if state.is_available() => state,
            Ok(state) => {
                warn!(
                    "zone {name}: climate entity {climate_entity} is {}, keeping last values",
                    state.state
                );
                return false;
            }
            Err(err) => {
                warn!("zone {name}: failed to read {climate_entity}: {err}");
                return false;
            }
        };

        let damper = match host.get_state(&damper_entity).await {
            Ok(state) => state.attribute_f32("current_position"),
            Err(err) => {
                warn!("zone {name}: failed to read damper {damper_entity}: {err}");
                None
            }
        };

        let target_override = match &target_entity {
            Some(entity) => read_number(host, entity).await,
            None => None,
        };
        let threshold_override = match &threshold_entity {
            Some(entity) => read_number(host, entity).await,
            None => None,
        };

        let Some(zone) = self.zones.get_mut(name) else {
            return false;
        };
        apply_climate(zone, &climate);
        if let Some(target) = target_override {
            zone.target_temp = target;
        }
        zone.threshold_override = threshold_override.filter(|value| *value >= 0.0);
        if let Some(position) = damper {
            zone.damper_position = position.round().clamp(0.0, 100.0) as u8;
        }

        debug!(
            "zone {name}: active={} current={:.1} target={:.1} damper={}%",
            zone.is_active, zone.current_temp, zone.target_temp, zone.damper_position
        );
        true
    }

    pub async fn update_hvac_mode<H: HomeAssistant>(&mut self, host: &H) {
        self.current_hvac_mode = match host.get_state(&self.main_climate).await {
            Ok(state) if !state.state.trim().is_empty() => state.state,
            Ok(_) => UNKNOWN_MODE.to_string(),
            Err(err) => {
                warn!("failed to read hvac mode of {}: {err}", self.main_climate);
                UNKNOWN_MODE.to_string()
            }
        };
    }

    /// Scans the recorder for the most recent point where the main unit's
    /// mode actually changed.
    pub async fn refresh_last_mode_change<H: HomeAssistant>(
        &mut self,
        host: &H,
        now: NaiveDateTime,
    ) {
        let start = now - self.mode_history_lookback;
        self.last_mode_change = match host.get_history(&self.main_climate, start).await {
            Ok(entries) => {
                let mut points: Vec<(NaiveDateTime, String)> = entries
                    .iter()
                    .map(|entry| (entry.changed_local(), entry.state.clone()))
                    .collect();
                points.sort_by_key(|(changed, _)| *changed);

                points
                    .windows(2)
                    .rev()
                    .find(|pair| pair[0].1 != pair[1].1)
                    .map(|pair| ModeChange::ChangedAt(pair[1].0))
                    .unwrap_or(ModeChange::NoTransition)
            }
            Err(err) => {
                warn!("mode history query failed: {err}");
                ModeChange::QueryFailed
            }
        };
    }

    /// Timestamp of the last transition seen by `refresh_last_mode_change`.
    pub fn get_time_since_last_hvac_mode_change(&self) -> Option<NaiveDateTime> {
        match self.last_mode_change {
            ModeChange::ChangedAt(changed) => Some(changed),
            _ => None,
        }
    }

    pub fn get_active_zones(&self) -> BTreeSet<String> {
        self.zones
            .values()
            .filter(|zone| zone.is_active)
            .map(|zone| zone.name.clone())
            .collect()
    }

    pub fn get_zones_needing_heating(&self, config: &DynamicConfig) -> Vec<String> {
        if config.smart_hvac_mode != SeasonalMode::Heat {
            return Vec::new();
        }
        self.zones_needing(HvacMode::Heat, config.temp_tolerance)
    }

    pub fn get_zones_needing_cooling(&self, config: &DynamicConfig) -> Vec<String> {
        if config.smart_hvac_mode != SeasonalMode::Cool {
            return Vec::new();
        }
        self.zones_needing(HvacMode::Cool, config.temp_tolerance)
    }

    pub fn zones_needing(&self, mode: HvacMode, tolerance: f32) -> Vec<String> {
        self.zones
            .values()
            .filter(|zone| zone.needs(mode, tolerance))
            .map(|zone| zone.name.clone())
            .collect()
    }

    pub fn all_zones_satisfied(&self, mode: HvacMode) -> bool {
        self.zones
            .values()
            .filter(|zone| zone.is_active)
            .all(|zone| zone.is_satisfied(mode))
    }

    pub fn all_dampers_low(&self) -> bool {
        self.all_dampers_below(self.damper_low_threshold)
    }

    pub fn all_dampers_below(&self, threshold: u8) -> bool {
        self.zones
            .values()
            .filter(|zone| zone.is_active)
            .all(|zone| zone.damper_position <= threshold)
    }

    pub fn record_temperature(&mut self, zone: &str, temperature: f32, now: NaiveDateTime) {
        let cutoff = now - self.history_retention;
        let samples = self.history.entry(zone.to_string()).or_default();
        samples.push_back((now, temperature));
        while samples.front().is_some_and(|(at, _)| *at <= cutoff) {
            samples.pop_front();
        }
    }

    pub fn temperature_history(&self, zone: &str) -> Vec<(NaiveDateTime, f32)> {
        self.history
            .get(zone)
            .map(|samples| samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Most recent sample taken at or before `at`.
    pub fn temperature_at(&self, zone: &str, at: NaiveDateTime) -> Option<f32> {
        self.history
            .get(zone)?
            .iter()
            .rev()
            .find(|(sampled, _)| *sampled <= at)
            .map(|(_, temperature)| *temperature)
    }

    pub fn is_temperature_stable(
        &self,
        zone: &str,
        minutes: i64,
        threshold: f32,
        now: NaiveDateTime,
    ) -> bool {
        let Some(samples) = self.history.get(zone) else {
            return false;
        };
        let since = now - Duration::minutes(minutes);
        let window: Vec<f32> = samples
            .iter()
            .filter(|(sampled, _)| *sampled >= since)
            .map(|(_, temperature)| *temperature)
            .collect();

        if window.len() < 3 {
            return false;
        }
        let min = window.iter().copied().fold(f32::INFINITY, f32::min);
        let max = window.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        max - min <= threshold
    }
}

fn apply_climate(zone: &mut Zone, climate: &EntityState) {
    zone.is_active = !climate.state.trim().eq_ignore_ascii_case("off");
    if let Some(target) = climate.attribute_f32("temperature") {
        zone.target_temp = target;
    }
    if let Some(current) = climate.attribute_f32("current_temperature") {
        zone.current_temp = current;
    }
}

async fn read_number<H: HomeAssistant>(host: &H, entity_id: &str) -> Option<f32> {
    match host.get_state(entity_id).await {
        Ok(state) => {
            let value = state.state_f32();
            if value.is_none() {
                warn!("override entity {entity_id} has no usable value ({})", state.state);
            }
            value
        }
        Err(err) => {
            warn!("failed to read override entity {entity_id}: {err}");
            None
        }
    }
}
