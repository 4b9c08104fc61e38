use std::collections::BTreeMap;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    config::{ControllerConfig, DynamicConfig},
    config_manager::ConfigValue,
    hass::HomeAssistant,
    state::StateManager,
    types::HvacMode,
};

pub fn target_sensor_entity(zone: &str) -> String {
    format!("sensor.smart_aircon_{zone}_target_temp")
}

/// A temperature write that still has to be confirmed by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureRequest {
    pub entity_id: String,
    pub target: f32,
    pub attempt: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureOutcome {
    Confirmed,
    Retrying { attempt: u8 },
    Failed,
}

/// Issues host service calls. Failures are logged and reported as `false`,
/// never propagated.
#[derive(Debug, Clone)]
pub struct Executor {
    main_climate: String,
    verify_tolerance: f32,
    max_retries: u8,
}

impl Executor {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            main_climate: config.main_climate.clone(),
            verify_tolerance: config.temperature_verify_tolerance,
            max_retries: config.temperature_max_retries,
        }
    }

    pub async fn set_hvac_mode<H: HomeAssistant>(
        &self,
        host: &H,
        state: &mut StateManager,
        mode: HvacMode,
    ) -> bool {
        if state.current_hvac_mode() == mode.as_str() {
            debug!("{} already in {}", self.main_climate, mode.as_str());
            return true;
        }

        let data = json!({ "entity_id": self.main_climate, "hvac_mode": mode.as_str() });
        match host.call_service("climate", "set_hvac_mode", data).await {
            Ok(()) => {
                info!("set {} to {}", self.main_climate, mode.as_str());
                state.record_hvac_mode(mode);
                true
            }
            Err(err) => {
                warn!("failed to set {} to {}: {err}", self.main_climate, mode.as_str());
                false
            }
        }
    }

    pub async fn set_damper_position<H: HomeAssistant>(
        &self,
        host: &H,
        entity_id: &str,
        position: u8,
    ) -> bool {
        let data = json!({ "entity_id": entity_id, "position": position });
        match host.call_service("cover", "set_cover_position", data).await {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to set damper {entity_id} to {position}%: {err}");
                false
            }
        }
    }

    pub async fn set_damper_positions<H: HomeAssistant>(
        &self,
        host: &H,
        state: &mut StateManager,
        positions: &BTreeMap<String, u8>,
    ) {
        for (name, position) in positions {
            let Some(entity) = state.zone(name).map(|zone| zone.damper_entity.clone()) else {
                warn!("no damper configured for zone {name}");
                continue;
            };
            if self.set_damper_position(host, &entity, *position).await {
                info!("zone {name}: damper {entity} -> {position}%");
                if let Some(zone) = state.zone_mut(name) {
                    zone.damper_position = *position;
                }
            }
        }
    }

    pub async fn set_minimum_dampers<H: HomeAssistant>(
        &self,
        host: &H,
        state: &mut StateManager,
        config: &DynamicConfig,
    ) {
        let positions: BTreeMap<String, u8> = state
            .get_active_zones()
            .into_iter()
            .map(|name| (name, config.minimum_damper_percent))
            .collect();
        self.set_damper_positions(host, state, &positions).await;
    }

    pub async fn set_zone_temperature<H: HomeAssistant>(
        &self,
        host: &H,
        entity_id: &str,
        temperature: f32,
    ) -> bool {
        let data = json!({ "entity_id": entity_id, "temperature": temperature });
        match host.call_service("climate", "set_temperature", data).await {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to set {entity_id} to {temperature:.1}: {err}");
                false
            }
        }
    }

    /// Writes the setpoint and hands back a request to verify later. A
    /// rejected write is still verified, which turns it into a retry.
    pub async fn set_zone_temperature_with_retry<H: HomeAssistant>(
        &self,
        host: &H,
        entity_id: &str,
        target: f32,
    ) -> TemperatureRequest {
        self.set_zone_temperature(host, entity_id, target).await;
        TemperatureRequest {
            entity_id: entity_id.to_string(),
            target,
            attempt: 0,
        }
    }

    pub async fn verify_temperature<H: HomeAssistant>(
        &self,
        host: &H,
        request: &mut TemperatureRequest,
    ) -> TemperatureOutcome {
        let reported = match host.get_state(&request.entity_id).await {
            Ok(state) => state.attribute_f32("temperature"),
            Err(err) => {
                warn!("failed to read back {}: {err}", request.entity_id);
                None
            }
        };

        if let Some(reported) = reported {
            if (reported - request.target).abs() <= self.verify_tolerance {
                info!("{} confirmed at {:.1}", request.entity_id, reported);
                return TemperatureOutcome::Confirmed;
            }
        }

        if request.attempt >= self.max_retries {
            warn!(
                "{} did not reach {:.1} after {} retries (reports {reported:?})",
                request.entity_id, request.target, request.attempt
            );
            return TemperatureOutcome::Failed;
        }

        request.attempt += 1;
        debug!(
            "{} reports {reported:?}, retrying {:.1} (attempt {})",
            request.entity_id, request.target, request.attempt
        );
        self.set_zone_temperature(host, &request.entity_id, request.target)
            .await;
        TemperatureOutcome::Retrying {
            attempt: request.attempt,
        }
    }

    pub async fn save_zone_target<H: HomeAssistant>(&self, host: &H, zone: &str, target: f32) {
        let entity = target_sensor_entity(zone);
        let attributes = json!({
            "unit_of_measurement": "°C",
            "friendly_name": format!("Smart aircon {zone} target"),
        });
        match host
            .set_state(&entity, &format!("{target:.1}"), attributes)
            .await
        {
            Ok(()) => debug!("saved {zone} target {target:.1}"),
            Err(err) => warn!("failed to save {zone} target to {entity}: {err}"),
        }
    }

    pub async fn read_saved_target<H: HomeAssistant>(&self, host: &H, zone: &str) -> Option<f32> {
        let entity = target_sensor_entity(zone);
        match host.get_state(&entity).await {
            Ok(state) => state.state_f32(),
            Err(err) => {
                debug!("no saved target for {zone}: {err}");
                None
            }
        }
    }

    /// Pushes a runtime change back to its helper entity.
    pub async fn write_config_value<H: HomeAssistant>(
        &self,
        host: &H,
        entity_id: &str,
        value: &ConfigValue,
    ) -> bool {
        let domain = entity_id.split('.').next().unwrap_or_default();
        let (service, data) = match value {
            ConfigValue::Bool(true) => ("turn_on", json!({ "entity_id": entity_id })),
            ConfigValue::Bool(false) => ("turn_off", json!({ "entity_id": entity_id })),
            ConfigValue::Number(number) => {
                ("set_value", json!({ "entity_id": entity_id, "value": number }))
            }
            ConfigValue::Option(option) if domain == "input_select" || domain == "select" => (
                "select_option",
                json!({ "entity_id": entity_id, "option": option }),
            ),
            ConfigValue::Option(option) => {
                ("set_value", json!({ "entity_id": entity_id, "value": option }))
            }
        };

        match host.call_service(domain, service, data).await {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to write {value:?} to {entity_id}: {err}");
                false
            }
        }
    }
}
