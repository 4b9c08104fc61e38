use crate::{config::ZoneConfig, types::HvacMode};

#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub name: String,
    pub entity_id: String,
    pub damper_entity: String,
    pub isolation: bool,
    pub target_temp_entity: Option<String>,
    pub threshold_entity: Option<String>,

    pub current_temp: f32,
    pub target_temp: f32,
    pub is_active: bool,
    pub damper_position: u8,
    pub threshold_override: Option<f32>,
}

impl Zone {
    pub fn new(name: impl Into<String>, config: &ZoneConfig) -> Self {
        Self {
            name: name.into(),
            entity_id: config.climate_entity.clone(),
            damper_entity: config.damper_entity.clone(),
            isolation: config.isolation,
            target_temp_entity: config.target_temp_entity.clone(),
            threshold_entity: config.threshold_entity.clone(),
            current_temp: 0.0,
            target_temp: 0.0,
            is_active: false,
            damper_position: 0,
            threshold_override: None,
        }
    }

    pub fn tolerance(&self, global: f32) -> f32 {
        self.threshold_override.unwrap_or(global)
    }

    pub fn needs(&self, mode: HvacMode, global_tolerance: f32) -> bool {
        self.is_active
            && is_out_of_desired_temp(
                mode,
                self.current_temp,
                self.target_temp,
                self.tolerance(global_tolerance),
            )
    }

    /// Strictly past the setpoint. Sitting exactly on target does not count.
    pub fn is_satisfied(&self, mode: HvacMode) -> bool {
        match mode {
            HvacMode::Heat => self.current_temp > self.target_temp,
            HvacMode::Cool => self.current_temp < self.target_temp,
            _ => true,
        }
    }
}

/// Whether a zone is far enough from its setpoint to call for the compressor.
pub fn is_out_of_desired_temp(mode: HvacMode, current: f32, target: f32, tolerance: f32) -> bool {
    match mode {
        HvacMode::Heat => current < target - tolerance,
        HvacMode::Cool => current > target + tolerance,
        _ => false,
    }
}
