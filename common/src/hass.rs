//! Typed port onto the Home Assistant entity API.
//!
//! The controller only needs four operations from the host. Everything is
//! expressed as a `Result` so a failed read or a rejected service call can be
//! logged and skipped without unwinding the control loop.

use std::future::Future;

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HostError {
    #[error("entity {0} is unavailable")]
    EntityUnavailable(String),
    #[error("entity {0} not found")]
    NotFound(String),
    #[error("service {service} failed: {reason}")]
    ServiceCallFailed { service: String, reason: String },
    #[error("history for {entity} unavailable: {reason}")]
    HistoryUnavailable { entity: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn is_available(&self) -> bool {
        is_available_state(&self.state)
    }

    pub fn attribute_f32(&self, key: &str) -> Option<f32> {
        value_as_f32(self.attributes.get(key)?)
    }

    pub fn state_f32(&self) -> Option<f32> {
        if !self.is_available() {
            return None;
        }
        self.state.trim().parse::<f32>().ok().filter(|v| v.is_finite())
    }
}

pub fn is_available_state(state: &str) -> bool {
    let state = state.trim();
    !(state.is_empty()
        || state.eq_ignore_ascii_case("unavailable")
        || state.eq_ignore_ascii_case("unknown"))
}

fn value_as_f32(value: &Value) -> Option<f32> {
    let parsed = match value {
        Value::Number(number) => number.as_f64().map(|v| v as f32),
        Value::String(raw) => raw.trim().parse::<f32>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub state: String,
    pub last_changed: DateTime<FixedOffset>,
}

impl HistoryEntry {
    /// Timestamp in naive local time so it can be compared with `now`.
    pub fn changed_local(&self) -> NaiveDateTime {
        self.last_changed.with_timezone(&Local).naive_local()
    }
}

pub trait HomeAssistant: Send + Sync {
    fn get_state(
        &self,
        entity_id: &str,
    ) -> impl Future<Output = Result<EntityState, HostError>> + Send;

    fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> impl Future<Output = Result<(), HostError>> + Send;

    fn get_history(
        &self,
        entity_id: &str,
        start: NaiveDateTime,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>, HostError>> + Send;

    fn set_state(
        &self,
        entity_id: &str,
        state: &str,
        attributes: Value,
    ) -> impl Future<Output = Result<(), HostError>> + Send;
}
