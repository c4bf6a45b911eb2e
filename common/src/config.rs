use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Step sizes must be a multiple of this many percent.
pub const STEP_QUANTUM: u8 = 5;

pub const DEFAULT_BASE_URL: &str = "https://api.lgledsolutions.com/api/android";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be an hour below 24, got {value}")]
    HourOutOfRange { field: &'static str, value: u32 },
    #[error("EndHour ({end}) must be greater than StartHour ({start}) + PlateauHour ({plateau})")]
    WindowTooShort { start: u32, plateau: u32, end: u32 },
    #[error("StepSize must be a positive multiple of {STEP_QUANTUM}, got {0}")]
    InvalidStep(u8),
    #[error("Brightness must be between 1 and 100, got {0}")]
    InvalidBrightness(u8),
    #[error("Brightness ({max}) must be a multiple of StepSize ({step})")]
    BrightnessNotStepAligned { max: u8, step: u8 },
    #[error("{0} must not be empty")]
    MissingField(&'static str),
}

/// Daily ramp schedule, read from `timer.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(rename = "StartHour")]
    pub start_hour: u32,
    #[serde(rename = "PlateauHour")]
    pub plateau_hours: u32,
    #[serde(rename = "EndHour")]
    pub end_hour: u32,
    #[serde(rename = "StepSize")]
    pub step_size: u8,
    /// Hours moved from the sunset ramp to the sunrise ramp (negative moves the other way).
    #[serde(rename = "PlateauOffset", default)]
    pub plateau_offset_hours: i32,
    #[serde(rename = "Brightness")]
    pub max_brightness: u8,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_hour: 6,
            plateau_hours: 8,
            end_hour: 22,
            step_size: 10,
            plateau_offset_hours: 0,
            max_brightness: 100,
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_hour >= 24 {
            return Err(ConfigError::HourOutOfRange {
                field: "StartHour",
                value: self.start_hour,
            });
        }
        if self.end_hour >= 24 {
            return Err(ConfigError::HourOutOfRange {
                field: "EndHour",
                value: self.end_hour,
            });
        }
        if self
            .start_hour
            .checked_add(self.plateau_hours)
            .is_none_or(|plateau_end| self.end_hour <= plateau_end)
        {
            return Err(ConfigError::WindowTooShort {
                start: self.start_hour,
                plateau: self.plateau_hours,
                end: self.end_hour,
            });
        }
        if self.step_size == 0 || self.step_size % STEP_QUANTUM != 0 {
            return Err(ConfigError::InvalidStep(self.step_size));
        }
        if self.max_brightness == 0 || self.max_brightness > 100 {
            return Err(ConfigError::InvalidBrightness(self.max_brightness));
        }
        if self.max_brightness % self.step_size != 0 {
            return Err(ConfigError::BrightnessNotStepAligned {
                max: self.max_brightness,
                step: self.step_size,
            });
        }
        Ok(())
    }
}

/// Cloud account credentials and client metadata, read from `account.json`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Wifiname", default)]
    pub wifi_name: String,
    #[serde(rename = "Timezone", default)]
    pub timezone: String,
    #[serde(rename = "Language", default)]
    pub language: String,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("wifi_name", &self.wifi_name)
            .field("timezone", &self.timezone)
            .field("language", &self.language)
            .finish()
    }
}

impl AccountConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.email.trim().is_empty() {
            return Err(ConfigError::MissingField("Email"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::MissingField("Password"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub base_url: String,
    pub token_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token_ttl_secs: 300,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_interval_secs: u64,
    pub http_port: u16,
    pub state_publish_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            http_port: 8080,
            state_publish_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

/// Optional process settings, read from `runtime.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub cloud: CloudConfig,
    pub controller: ControllerConfig,
    pub mqtt: Option<MqttConfig>,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        let defaults = CloudConfig::default();
        if self.cloud.base_url.trim().is_empty() {
            self.cloud.base_url = defaults.base_url;
        }
        self.cloud.base_url = self.cloud.base_url.trim_end_matches('/').to_string();
        self.cloud.request_timeout_secs = self.cloud.request_timeout_secs.clamp(1, 300);
        self.cloud.connect_timeout_secs = self
            .cloud
            .connect_timeout_secs
            .clamp(1, self.cloud.request_timeout_secs);

        self.controller.tick_interval_secs = self.controller.tick_interval_secs.clamp(1, 3_600);
        self.controller.state_publish_interval_secs =
            self.controller.state_publish_interval_secs.max(1);

        if self
            .mqtt
            .as_ref()
            .is_some_and(|mqtt| mqtt.host.trim().is_empty())
        {
            self.mqtt = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn schedule(start: u32, plateau: u32, end: u32, step: u8, max: u8) -> ScheduleConfig {
        ScheduleConfig {
            start_hour: start,
            plateau_hours: plateau,
            end_hour: end,
            step_size: step,
            plateau_offset_hours: 0,
            max_brightness: max,
        }
    }

    #[test]
    fn parses_timer_file_keys() {
        let raw = r#"{"StartHour":8,"PlateauHour":6,"EndHour":20,"StepSize":10,"PlateauOffset":-1,"Brightness":100}"#;
        let parsed: ScheduleConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(
            parsed,
            ScheduleConfig {
                plateau_offset_hours: -1,
                ..schedule(8, 6, 20, 10, 100)
            }
        );
        assert_eq!(parsed.validate(), Ok(()));
    }

    #[test]
    fn rejects_window_without_room_for_ramps() {
        assert_eq!(
            schedule(8, 12, 20, 10, 100).validate(),
            Err(ConfigError::WindowTooShort {
                start: 8,
                plateau: 12,
                end: 20
            })
        );
        assert!(schedule(8, 11, 20, 10, 100).validate().is_ok());
    }

    #[test]
    fn huge_plateau_does_not_wrap_past_end_hour() {
        assert_eq!(
            schedule(8, u32::MAX - 7, 20, 10, 100).validate(),
            Err(ConfigError::WindowTooShort {
                start: 8,
                plateau: u32::MAX - 7,
                end: 20
            })
        );
        assert!(schedule(0, u32::MAX, 23, 10, 100).validate().is_err());
    }

    #[test]
    fn rejects_steps_off_the_quantum() {
        assert_eq!(
            schedule(8, 6, 20, 0, 100).validate(),
            Err(ConfigError::InvalidStep(0))
        );
        assert_eq!(
            schedule(8, 6, 20, 7, 100).validate(),
            Err(ConfigError::InvalidStep(7))
        );
        assert_eq!(
            schedule(8, 6, 20, 15, 100).validate(),
            Err(ConfigError::BrightnessNotStepAligned { max: 100, step: 15 })
        );
        assert!(schedule(8, 6, 20, 25, 100).validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_hours_and_brightness() {
        assert!(matches!(
            schedule(24, 0, 23, 10, 100).validate(),
            Err(ConfigError::HourOutOfRange { field: "StartHour", .. })
        ));
        assert!(matches!(
            schedule(8, 0, 24, 10, 100).validate(),
            Err(ConfigError::HourOutOfRange { field: "EndHour", .. })
        ));
        assert_eq!(
            schedule(8, 6, 20, 10, 0).validate(),
            Err(ConfigError::InvalidBrightness(0))
        );
        assert_eq!(
            schedule(8, 6, 20, 10, 110).validate(),
            Err(ConfigError::InvalidBrightness(110))
        );
    }

    #[test]
    fn account_requires_credentials_and_hides_password() {
        let raw = r#"{"Email":"grower@example.com","Password":"hunter2","Wifiname":"shed","Timezone":"Europe/Berlin","Language":"English"}"#;
        let account: AccountConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(account.validate(), Ok(()));
        assert!(!format!("{account:?}").contains("hunter2"));

        let missing = AccountConfig {
            password: String::new(),
            ..account
        };
        assert_eq!(missing.validate(), Err(ConfigError::MissingField("Password")));
    }

    #[test]
    fn runtime_defaults_fill_missing_sections() {
        let mut runtime: RuntimeConfig =
            serde_json::from_str(r#"{"controller":{"tick_interval_secs":0},"mqtt":{"host":" "}}"#)
                .unwrap();
        runtime.sanitize();

        assert_eq!(runtime.cloud.base_url, DEFAULT_BASE_URL);
        assert_eq!(runtime.cloud.token_ttl_secs, 300);
        assert_eq!(runtime.controller.tick_interval_secs, 1);
        assert_eq!(runtime.controller.http_port, 8080);
        assert!(runtime.mqtt.is_none());
    }
}
