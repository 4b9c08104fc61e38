use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use tracing::debug;

use crate::{
    config::{ControllerConfig, DynamicConfig},
    state::{ModeChange, StateManager},
    types::{HvacMode, SeasonalMode},
};

/// Pure decision rules. Nothing here talks to the host.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    stability_window: Duration,
}

impl DecisionEngine {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            stability_window: config.stability_window(),
        }
    }

    pub fn get_idle_mode(seasonal_mode: SeasonalMode) -> HvacMode {
        match seasonal_mode {
            SeasonalMode::Cool => HvacMode::Fan,
            SeasonalMode::Heat | SeasonalMode::Unknown => HvacMode::Dry,
        }
    }

    pub fn should_activate_heating(&self, state: &StateManager, config: &DynamicConfig) -> bool {
        config.smart_hvac_mode == SeasonalMode::Heat
            && !state.get_zones_needing_heating(config).is_empty()
    }

    pub fn should_activate_cooling(&self, state: &StateManager, config: &DynamicConfig) -> bool {
        config.smart_hvac_mode == SeasonalMode::Cool
            && !state.get_zones_needing_cooling(config).is_empty()
    }

    pub fn get_target_hvac_mode(&self, state: &StateManager, config: &DynamicConfig) -> HvacMode {
        match config.smart_hvac_mode {
            SeasonalMode::Heat if self.should_activate_heating(state, config) => HvacMode::Heat,
            SeasonalMode::Cool if self.should_activate_cooling(state, config) => HvacMode::Cool,
            seasonal => Self::get_idle_mode(seasonal),
        }
    }

    /// True while a recent mode change forbids going idle. An unanswered
    /// history query counts as inside the window.
    pub fn in_stability_window(&self, state: &StateManager, now: NaiveDateTime) -> bool {
        match state.last_mode_change() {
            ModeChange::ChangedAt(changed) => now - changed < self.stability_window,
            ModeChange::NoTransition => false,
            ModeChange::NotQueried | ModeChange::QueryFailed => true,
        }
    }

    // A failed history query holds back idling only; activation reads it
    // as no transition.
    fn activation_held_off(&self, state: &StateManager, now: NaiveDateTime) -> bool {
        match state.last_mode_change() {
            ModeChange::QueryFailed => false,
            _ => self.in_stability_window(state, now),
        }
    }

    pub fn should_switch_to_idle(
        &self,
        state: &StateManager,
        current_mode: HvacMode,
        now: NaiveDateTime,
    ) -> bool {
        if self.in_stability_window(state, now) {
            debug!("inside mode stability window, not idling");
            return false;
        }
        state.all_zones_satisfied(current_mode) && state.all_dampers_low()
    }

    pub fn should_activate_algorithm(
        &self,
        state: &StateManager,
        target_mode: HvacMode,
        current_hvac_mode: &str,
        now: NaiveDateTime,
    ) -> bool {
        if self.activation_held_off(state, now) {
            debug!("inside mode stability window, not activating");
            return false;
        }
        if !target_mode.is_active() {
            return false;
        }
        match HvacMode::parse(current_hvac_mode) {
            Some(current) if current == target_mode => false,
            Some(current) => current.is_idle() || current.is_active(),
            None => false,
        }
    }

    /// Damper opening for every configured zone while `mode` runs on behalf
    /// of `trigger_zones`.
    pub fn calculate_damper_positions(
        &self,
        state: &StateManager,
        trigger_zones: &[String],
        mode: HvacMode,
        config: &DynamicConfig,
    ) -> BTreeMap<String, u8> {
        let mut positions = BTreeMap::new();

        for (name, zone) in state.zones() {
            let is_trigger = trigger_zones.iter().any(|trigger| trigger == name);
            let position = if !zone.is_active {
                0
            } else if zone.isolation && !is_trigger {
                config.minimum_damper_percent
            } else if is_trigger {
                config.primary_damper_percent
            } else {
                let tolerance = zone.tolerance(config.temp_tolerance);
                let (current, target) = (zone.current_temp, zone.target_temp);
                match mode {
                    HvacMode::Heat if current < target => config.secondary_damper_percent,
                    HvacMode::Heat if current < target + tolerance => {
                        config.overflow_damper_percent
                    }
                    HvacMode::Cool if current > target => config.secondary_damper_percent,
                    HvacMode::Cool if current > target - tolerance => {
                        config.overflow_damper_percent
                    }
                    _ => config.minimum_damper_percent,
                }
            };
            positions.insert(name.clone(), position);
        }

        positions
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::ZoneConfig;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn manager(zones: &[(&str, bool)]) -> StateManager {
        let zones = zones
            .iter()
            .map(|(name, isolation)| {
                (
                    name.to_string(),
                    ZoneConfig {
                        climate_entity: format!("climate.{name}"),
                        damper_entity: format!("cover.{name}"),
                        isolation: *isolation,
                        target_temp_entity: None,
                        threshold_entity: None,
                    },
                )
            })
            .collect();
        let mut state = StateManager::new(&ControllerConfig::default(), &zones);
        state.set_last_mode_change(ModeChange::NoTransition);
        state
    }

    fn set(state: &mut StateManager, name: &str, current: f32, target: f32) {
        let zone = state.zone_mut(name).unwrap();
        zone.is_active = true;
        zone.current_temp = current;
        zone.target_temp = target;
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(&ControllerConfig::default())
    }

    fn cool() -> DynamicConfig {
        DynamicConfig {
            smart_hvac_mode: SeasonalMode::Cool,
            ..DynamicConfig::default()
        }
    }

    #[test]
    fn idle_mode_follows_season() {
        assert_eq!(DecisionEngine::get_idle_mode(SeasonalMode::Heat), HvacMode::Dry);
        assert_eq!(DecisionEngine::get_idle_mode(SeasonalMode::Cool), HvacMode::Fan);
        assert_eq!(DecisionEngine::get_idle_mode(SeasonalMode::Unknown), HvacMode::Dry);
    }

    #[test]
    fn target_mode_heats_only_when_a_zone_needs_it() {
        let mut state = manager(&[("living", false), ("study", false)]);
        set(&mut state, "living", 21.0, 21.0);
        set(&mut state, "study", 20.0, 21.0);
        let config = DynamicConfig::default();

        assert_eq!(engine().get_target_hvac_mode(&state, &config), HvacMode::Heat);
        assert_eq!(engine().get_target_hvac_mode(&state, &cool()), HvacMode::Fan);

        set(&mut state, "study", 20.6, 21.0);
        assert_eq!(engine().get_target_hvac_mode(&state, &config), HvacMode::Dry);

        let unknown = DynamicConfig {
            smart_hvac_mode: SeasonalMode::Unknown,
            ..DynamicConfig::default()
        };
        assert_eq!(engine().get_target_hvac_mode(&state, &unknown), HvacMode::Dry);
    }

    #[test]
    fn activation_rules() {
        let state = manager(&[("living", false)]);
        let engine = engine();
        let now = at(12, 0);

        assert!(engine.should_activate_algorithm(&state, HvacMode::Heat, "dry", now));
        assert!(engine.should_activate_algorithm(&state, HvacMode::Cool, "fan_only", now));
        assert!(engine.should_activate_algorithm(&state, HvacMode::Heat, "off", now));
        assert!(engine.should_activate_algorithm(&state, HvacMode::Heat, "cool", now));
        assert!(!engine.should_activate_algorithm(&state, HvacMode::Heat, "heat", now));
        assert!(!engine.should_activate_algorithm(&state, HvacMode::Dry, "heat", now));
        assert!(!engine.should_activate_algorithm(&state, HvacMode::Heat, "unknown", now));
    }

    #[test]
    fn stability_window_blocks_transitions() {
        let mut state = manager(&[("living", false)]);
        set(&mut state, "living", 21.5, 21.0);
        let engine = engine();

        state.set_last_mode_change(ModeChange::ChangedAt(at(11, 55)));
        assert!(!engine.should_activate_algorithm(&state, HvacMode::Heat, "dry", at(12, 0)));
        assert!(!engine.should_switch_to_idle(&state, HvacMode::Heat, at(12, 0)));

        assert!(engine.should_activate_algorithm(&state, HvacMode::Heat, "dry", at(12, 5)));
        assert!(engine.should_switch_to_idle(&state, HvacMode::Heat, at(12, 5)));

        state.set_last_mode_change(ModeChange::QueryFailed);
        assert!(!engine.should_switch_to_idle(&state, HvacMode::Heat, at(12, 5)));

        state.set_last_mode_change(ModeChange::NotQueried);
        assert!(!engine.should_activate_algorithm(&state, HvacMode::Heat, "dry", at(12, 5)));
    }

    #[test]
    fn failed_history_query_still_allows_activation() {
        let mut state = manager(&[("living", false)]);
        set(&mut state, "living", 19.0, 21.0);
        state.set_last_mode_change(ModeChange::QueryFailed);

        assert!(engine().should_activate_algorithm(&state, HvacMode::Heat, "dry", at(12, 0)));
        assert!(engine().in_stability_window(&state, at(12, 0)));
    }

    #[test]
    fn idle_requires_satisfied_zones_and_low_dampers() {
        let mut state = manager(&[("living", false), ("study", false)]);
        set(&mut state, "living", 21.5, 21.0);
        set(&mut state, "study", 21.0, 21.0);
        let engine = engine();

        assert!(!engine.should_switch_to_idle(&state, HvacMode::Heat, at(12, 0)));

        set(&mut state, "study", 21.1, 21.0);
        state.zone_mut("living").unwrap().damper_position = 50;
        assert!(!engine.should_switch_to_idle(&state, HvacMode::Heat, at(12, 0)));

        state.zone_mut("living").unwrap().damper_position = 5;
        assert!(engine.should_switch_to_idle(&state, HvacMode::Heat, at(12, 0)));
    }

    #[test]
    fn isolated_trigger_gets_primary_and_neighbour_leverages() {
        let mut state = manager(&[("baby_bed", true), ("living", false)]);
        set(&mut state, "baby_bed", 19.5, 20.0);
        set(&mut state, "living", 21.8, 22.0);

        let positions = engine().calculate_damper_positions(
            &state,
            &["baby_bed".to_string()],
            HvacMode::Heat,
            &DynamicConfig::default(),
        );

        assert_eq!(
            positions,
            BTreeMap::from([("baby_bed".to_string(), 50), ("living".to_string(), 40)])
        );
    }

    #[test]
    fn secondary_zones_step_down_through_overflow() {
        let mut state = manager(&[
            ("living", false),
            ("study", false),
            ("kitchen", false),
            ("nursery", true),
            ("garage", false),
        ]);
        set(&mut state, "living", 19.0, 21.0);
        set(&mut state, "study", 21.3, 21.0);
        set(&mut state, "kitchen", 21.5, 21.0);
        set(&mut state, "nursery", 18.0, 21.0);
        let config = DynamicConfig::default();

        let heat = engine().calculate_damper_positions(
            &state,
            &["living".to_string()],
            HvacMode::Heat,
            &config,
        );
        assert_eq!(
            heat,
            BTreeMap::from([
                ("garage".to_string(), 0),
                ("kitchen".to_string(), 5),
                ("living".to_string(), 50),
                ("nursery".to_string(), 5),
                ("study".to_string(), 10),
            ])
        );

        set(&mut state, "study", 20.7, 21.0);
        set(&mut state, "kitchen", 20.0, 21.0);
        let cool_positions = engine().calculate_damper_positions(
            &state,
            &["living".to_string()],
            HvacMode::Cool,
            &cool(),
        );
        assert_eq!(cool_positions["study"], 10);
        assert_eq!(cool_positions["kitchen"], 5);
    }

    #[test]
    fn every_active_zone_keeps_a_nonzero_damper() {
        let mut state = manager(&[("a", false), ("b", true), ("c", false), ("d", true)]);
        set(&mut state, "a", 30.0, 20.0);
        set(&mut state, "b", 10.0, 20.0);
        set(&mut state, "c", 20.0, 20.0);
        let config = DynamicConfig::default();

        for mode in [HvacMode::Heat, HvacMode::Cool] {
            let trigger_sets = [
                vec![],
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
            ];
            for triggers in trigger_sets {
                let positions =
                    engine().calculate_damper_positions(&state, &triggers, mode, &config);
                assert_eq!(positions.len(), 4);
                assert_eq!(positions["d"], 0);
                assert!(["a", "b", "c"].iter().all(|name| positions[*name] > 0));
            }
        }
    }
}
