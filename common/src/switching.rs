//! Priority-group switching for zones controlled by on/off switches rather
//! than dampers.
//!
//! Zones are grouped by priority (lower number first). The first group with
//! a zone that has to run claims the unit and every lower-priority group is
//! switched off.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{types::HvacMode, zone::is_out_of_desired_temp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerOnStrategy {
    Any,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchSettings {
    pub desired_temp: f32,
    pub threshold: f32,
    pub mode: HvacMode,
    pub strategy: PowerOnStrategy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchZone {
    pub name: String,
    pub priority: u32,
    pub ac_controlled: bool,
    pub running: bool,
    pub current_temp: f32,
    pub desired_temp: Option<f32>,
    pub threshold: Option<f32>,
}

impl SwitchZone {
    fn desired(&self, settings: &SwitchSettings) -> f32 {
        self.desired_temp.unwrap_or(settings.desired_temp)
    }

    /// Inclusive: sitting on the desired temperature counts as reached.
    pub fn has_reached_desired_temp(&self, settings: &SwitchSettings) -> bool {
        let desired = self.desired(settings);
        match settings.mode {
            HvacMode::Cool => self.current_temp <= desired,
            _ => self.current_temp >= desired,
        }
    }

    pub fn is_out_of_desired_temp(&self, settings: &SwitchSettings) -> bool {
        let mode = match settings.mode {
            HvacMode::Cool => HvacMode::Cool,
            _ => HvacMode::Heat,
        };
        is_out_of_desired_temp(
            mode,
            self.current_temp,
            self.desired(settings),
            self.threshold.unwrap_or(settings.threshold),
        )
    }
}

/// Controlled zones sorted into ascending priority groups.
pub fn zone_groups(zones: &[SwitchZone]) -> Vec<Vec<&SwitchZone>> {
    let mut groups: BTreeMap<u32, Vec<&SwitchZone>> = BTreeMap::new();
    for zone in zones.iter().filter(|zone| zone.ac_controlled) {
        groups.entry(zone.priority).or_default().push(zone);
    }
    groups.into_values().collect()
}

pub fn determine_power_state(
    power_on: bool,
    zones: &[SwitchZone],
    settings: &SwitchSettings,
) -> SwitchState {
    let active: Vec<&SwitchZone> = zones.iter().filter(|zone| zone.ac_controlled).collect();
    if active.is_empty() {
        return SwitchState::Off;
    }

    if power_on {
        return if active.iter().all(|zone| zone.has_reached_desired_temp(settings)) {
            SwitchState::Off
        } else {
            SwitchState::On
        };
    }

    let mut out_of_range = active.iter().map(|zone| zone.is_out_of_desired_temp(settings));
    let start = match settings.strategy {
        PowerOnStrategy::Any => out_of_range.any(|out| out),
        PowerOnStrategy::All => out_of_range.all(|out| out),
    };
    if start {
        SwitchState::On
    } else {
        SwitchState::Off
    }
}

pub fn determine_zone_switch_states(
    zones: &[SwitchZone],
    trigger: Option<&str>,
    settings: &SwitchSettings,
) -> BTreeMap<String, SwitchState> {
    let mut states: BTreeMap<String, SwitchState> = zones
        .iter()
        .filter(|zone| zone.ac_controlled)
        .map(|zone| (zone.name.clone(), SwitchState::Off))
        .collect();

    if let Some(trigger) = trigger {
        states.insert(trigger.to_string(), SwitchState::On);
        return states;
    }

    let groups = zone_groups(zones);
    for (index, group) in groups.iter().enumerate() {
        let mut group_active = false;
        for zone in group {
            let on = if zone.running {
                !zone.has_reached_desired_temp(settings)
            } else {
                zone.is_out_of_desired_temp(settings)
            };
            let state = if on { SwitchState::On } else { SwitchState::Off };
            states.insert(zone.name.clone(), state);
            group_active |= on;
        }

        if group_active {
            for zone in groups[index + 1..].iter().flatten() {
                states.insert(zone.name.clone(), SwitchState::Off);
            }
            break;
        }
    }

    states
}

fn strictly_increasing(temps: &[f32]) -> bool {
    !temps.is_empty() && temps.windows(2).all(|pair| pair[0] < pair[1])
}

fn strictly_decreasing(temps: &[f32]) -> bool {
    !temps.is_empty() && temps.windows(2).all(|pair| pair[0] > pair[1])
}

/// Detects a power switch that disagrees with the temperature trend, e.g. a
/// heater reported on while the room keeps cooling down. `temps` is oldest
/// first.
pub fn is_power_in_wrong_state(mode: HvacMode, power_on: bool, temps: &[f32]) -> bool {
    match (mode, power_on) {
        (HvacMode::Cool, true) => strictly_increasing(temps),
        (HvacMode::Cool, false) => strictly_decreasing(temps),
        (_, true) => strictly_decreasing(temps),
        (_, false) => strictly_increasing(temps),
    }
}
