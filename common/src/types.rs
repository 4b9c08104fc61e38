use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    Heat,
    Cool,
    Dry,
    Fan,
    Off,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heat => "heat",
            Self::Cool => "cool",
            Self::Dry => "dry",
            Self::Fan => "fan",
            Self::Off => "off",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "heat" => Some(Self::Heat),
            "cool" => Some(Self::Cool),
            "dry" => Some(Self::Dry),
            "fan" | "fan_only" => Some(Self::Fan),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    /// Dry, fan and off are the modes the unit rests in between episodes.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Dry | Self::Fan | Self::Off)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Heat | Self::Cool)
    }
}

/// The season the controller is working towards, as chosen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonalMode {
    Heat,
    Cool,
    #[serde(other)]
    Unknown,
}

impl SeasonalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heat => "heat",
            Self::Cool => "cool",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "heat" => Self::Heat,
            "cool" => Self::Cool,
            _ => Self::Unknown,
        }
    }

    /// The compressor mode an episode in this season runs in.
    pub fn active_mode(self) -> Option<HvacMode> {
        match self {
            Self::Heat => Some(HvacMode::Heat),
            Self::Cool => Some(HvacMode::Cool),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneStatus {
    pub current_temp: f32,
    pub target_temp: f32,
    pub is_active: bool,
    pub isolation: bool,
    pub damper_position: u8,
    pub temperature_stable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub enabled: bool,
    pub algorithm_active: bool,
    pub activating: bool,
    pub current_hvac_mode: String,
    pub smart_hvac_mode: &'static str,
    pub algorithm_mode: Option<&'static str>,
    pub active_zones: Vec<String>,
    pub last_check: Option<String>,
    pub zone_states: BTreeMap<String, ZoneStatus>,
}
