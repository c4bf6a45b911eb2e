use async_trait::async_trait;
use chrono::NaiveTime;
use growlight_common::{LampLevel, ScheduleConfig};
use tracing::{info, warn};

use crate::cloud::{CloudError, DeviceSession, Transport};

/// Applies a brightness level to the lamp.
#[async_trait]
pub trait LampDriver: Send {
    async fn set_level(&mut self, level: u8) -> Result<(), CloudError>;
}

#[async_trait]
impl<T: Transport> LampDriver for DeviceSession<T> {
    async fn set_level(&mut self, level: u8) -> Result<(), CloudError> {
        self.apply_brightness(level).await
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    Applied(u8),
    Remains(u8),
    Failed { target: u8, error: CloudError },
}

impl TickOutcome {
    pub fn target(&self) -> u8 {
        match self {
            Self::Applied(level) | Self::Remains(level) => *level,
            Self::Failed { target, .. } => *target,
        }
    }
}

/// Last brightness confirmed by the cloud. `None` until the first success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerState {
    pub last_applied: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub ticks: u64,
    pub applied: u64,
    pub failed: u64,
}

pub struct Reconciler<D> {
    schedule: ScheduleConfig,
    driver: D,
    state: ReconcilerState,
    stats: ReconcilerStats,
    last_error: Option<String>,
}

impl<D: LampDriver> Reconciler<D> {
    pub fn new(schedule: ScheduleConfig, driver: D) -> Self {
        Self {
            schedule,
            driver,
            state: ReconcilerState::default(),
            stats: ReconcilerStats::default(),
            last_error: None,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Makes the next tick apply its target even if it matches the last one.
    pub fn forget_last_applied(&mut self) {
        self.state.last_applied = None;
    }

    pub async fn tick(&mut self, now: NaiveTime) -> TickOutcome {
        self.stats.ticks += 1;
        let target = self.schedule.brightness_at(&now);

        if self.state.last_applied == Some(target) {
            info!("Lamp remains {}", LampLevel(target));
            return TickOutcome::Remains(target);
        }

        info!("Setting lamp to {target}% brightness");
        match self.driver.set_level(target).await {
            Ok(()) => {
                self.state.last_applied = Some(target);
                self.stats.applied += 1;
                self.last_error = None;
                info!("Status: Lamp {}", LampLevel(target));
                TickOutcome::Applied(target)
            }
            Err(error) => {
                self.stats.failed += 1;
                self.last_error = Some(error.to_string());
                warn!(target, "failed to set brightness: {error}");
                TickOutcome::Failed { target, error }
            }
        }
    }
}
