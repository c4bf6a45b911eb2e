pub mod config;
pub mod schedule;
pub mod topics;
pub mod types;

pub use config::{
    AccountConfig, CloudConfig, ConfigError, ControllerConfig, MqttConfig, RuntimeConfig,
    ScheduleConfig,
};
pub use schedule::TimingReport;
pub use topics::*;
pub use types::{
    ControllerStatus, LampInfo, LampLevel, LampStatePayload, LightPhase, SessionState,
};
