//! In-memory Home Assistant used by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde_json::Value;

use crate::hass::{EntityState, HistoryEntry, HomeAssistant, HostError};

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub data: Value,
}

impl ServiceCall {
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.service)
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.data.get("entity_id").and_then(Value::as_str)
    }
}

#[derive(Default)]
pub struct FakeHome {
    states: Mutex<HashMap<String, EntityState>>,
    calls: Mutex<Vec<ServiceCall>>,
    history: Mutex<HashMap<String, Vec<HistoryEntry>>>,
    failing_services: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
    // Entities whose setpoint ignores set_temperature writes.
    sticky_setpoints: Mutex<HashSet<String>>,
    history_fails: Mutex<bool>,
}

impl FakeHome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, state: EntityState) {
        self.states
            .lock()
            .unwrap()
            .insert(state.entity_id.clone(), state);
    }

    pub fn put_climate(&self, entity_id: &str, mode: &str, current: f32, target: f32) {
        self.put(
            EntityState::new(entity_id, mode)
                .with_attribute("current_temperature", current)
                .with_attribute("temperature", target),
        );
    }

    pub fn put_damper(&self, entity_id: &str, position: u8) {
        self.put(EntityState::new(entity_id, "open").with_attribute("current_position", position));
    }

    pub fn state(&self, entity_id: &str) -> Option<EntityState> {
        self.states.lock().unwrap().get(entity_id).cloned()
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_named(&self, name: &str) -> Vec<ServiceCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.name() == name)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail_service(&self, name: &str) {
        self.failing_services
            .lock()
            .unwrap()
            .insert(name.to_string());
    }

    pub fn restore_service(&self, name: &str) {
        self.failing_services.lock().unwrap().remove(name);
    }

    pub fn fail_reads(&self, entity_id: &str) {
        self.failing_reads
            .lock()
            .unwrap()
            .insert(entity_id.to_string());
    }

    pub fn make_setpoint_sticky(&self, entity_id: &str) {
        self.sticky_setpoints
            .lock()
            .unwrap()
            .insert(entity_id.to_string());
    }

    pub fn push_history(&self, entity_id: &str, state: &str, changed: &str) {
        let last_changed = DateTime::<FixedOffset>::parse_from_rfc3339(changed).unwrap();
        self.history
            .lock()
            .unwrap()
            .entry(entity_id.to_string())
            .or_default()
            .push(HistoryEntry {
                state: state.to_string(),
                last_changed,
            });
    }

    pub fn fail_history(&self) {
        *self.history_fails.lock().unwrap() = true;
    }

    fn apply_side_effects(&self, call: &ServiceCall) {
        let Some(entity_id) = call.entity_id() else {
            return;
        };
        let mut states = self.states.lock().unwrap();
        let Some(entity) = states.get_mut(entity_id) else {
            return;
        };

        match call.name().as_str() {
            "climate/set_hvac_mode" => {
                if let Some(mode) = call.data.get("hvac_mode").and_then(Value::as_str) {
                    entity.state = mode.to_string();
                }
            }
            "climate/set_temperature" => {
                if self.sticky_setpoints.lock().unwrap().contains(entity_id) {
                    return;
                }
                if let Some(value) = call.data.get("temperature") {
                    entity
                        .attributes
                        .insert("temperature".to_string(), value.clone());
                }
            }
            "cover/set_cover_position" => {
                if let Some(value) = call.data.get("position") {
                    entity
                        .attributes
                        .insert("current_position".to_string(), value.clone());
                }
            }
            _ => {}
        }
    }
}

impl HomeAssistant for FakeHome {
    async fn get_state(&self, entity_id: &str) -> Result<EntityState, HostError> {
        if self.failing_reads.lock().unwrap().contains(entity_id) {
            return Err(HostError::Transport(format!("read of {entity_id} timed out")));
        }
        self.state(entity_id)
            .ok_or_else(|| HostError::NotFound(entity_id.to_string()))
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), HostError> {
        let call = ServiceCall {
            domain: domain.to_string(),
            service: service.to_string(),
            data,
        };
        self.calls.lock().unwrap().push(call.clone());

        if self.failing_services.lock().unwrap().contains(&call.name()) {
            return Err(HostError::ServiceCallFailed {
                service: call.name(),
                reason: "rejected by fake".to_string(),
            });
        }
        self.apply_side_effects(&call);
        Ok(())
    }

    async fn get_history(
        &self,
        entity_id: &str,
        _start: NaiveDateTime,
    ) -> Result<Vec<HistoryEntry>, HostError> {
        if *self.history_fails.lock().unwrap() {
            return Err(HostError::HistoryUnavailable {
                entity: entity_id.to_string(),
                reason: "recorder offline".to_string(),
            });
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(entity_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_state(
        &self,
        entity_id: &str,
        state: &str,
        attributes: Value,
    ) -> Result<(), HostError> {
        let mut entity = EntityState::new(entity_id, state);
        if let Value::Object(map) = attributes {
            entity.attributes = map;
        }
        self.put(entity);
        Ok(())
    }
}
