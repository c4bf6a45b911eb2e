use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LightPhase {
    Off,
    Sunrise,
    Plateau,
    Sunset,
}

impl LightPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Sunrise => "SUNRISE",
            Self::Plateau => "PLATEAU",
            Self::Sunset => "SUNSET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    AuthenticatedWithDevice,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Authenticated => "AUTHENTICATED",
            Self::AuthenticatedWithDevice => "AUTHENTICATED_WITH_DEVICE",
        }
    }
}

/// Lamp brightness as seen by the controller. Zero means the lamp is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LampLevel(pub u8);

impl LampLevel {
    pub fn is_off(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LampLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_off() {
            write!(f, "OFF")
        } else {
            write!(f, "ON at {}% brightness", self.0)
        }
    }
}

/// First lamp reported by the cloud device list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LampInfo {
    pub id: String,
    #[serde(rename = "groupId")]
    pub group_id: Option<String>,
    #[serde(rename = "deviceName")]
    pub device_name: Option<String>,
    #[serde(rename = "deviceLightRate")]
    pub light_rate: Option<i64>,
    #[serde(rename = "isClose")]
    pub is_close: Option<bool>,
    #[serde(rename = "deviceImage")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    #[serde(rename = "lastApplied")]
    pub last_applied: Option<u8>,
    pub target: u8,
    pub phase: &'static str,
    #[serde(rename = "sessionState")]
    pub session_state: &'static str,
    pub lamp: Option<LampInfo>,
    pub ticks: u64,
    #[serde(rename = "appliedCount")]
    pub applied_count: u64,
    #[serde(rename = "failedCount")]
    pub failed_count: u64,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    pub timezone: String,
    #[serde(rename = "localTime")]
    pub local_time: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LampStatePayload {
    pub brightness: Option<u8>,
    pub target: u8,
    pub phase: &'static str,
    pub on: Option<bool>,
}
