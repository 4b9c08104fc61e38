pub mod config;
pub mod config_manager;
pub mod controller;
pub mod decision;
pub mod executor;
pub mod hass;
pub mod monitor;
pub mod scheduler;
pub mod state;
pub mod switching;
pub mod types;
pub mod zone;

#[cfg(test)]
mod fake_home;

pub use config::{ConfigKey, ControllerConfig, DynamicConfig, RuntimeConfig, ZoneConfig};
pub use config_manager::{ConfigManager, ConfigValue};
pub use controller::{ControllerTask, Phase, SmartAirconController};
pub use decision::DecisionEngine;
pub use executor::{Executor, TemperatureOutcome, TemperatureRequest};
pub use hass::{EntityState, HistoryEntry, HomeAssistant, HostError};
pub use monitor::Monitor;
pub use scheduler::TaskQueue;
pub use state::StateManager;
pub use types::{ControllerStatus, HvacMode, SeasonalMode, ZoneStatus};
pub use zone::Zone;
