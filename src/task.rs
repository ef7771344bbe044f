//! Thread configuration for the driver and service tasks.
//!
//! Every long running loop of the track core runs on its own named thread.
//! [`TaskConfig`] carries what the scheduler needs to know about it:
//!
//! | Preset | Name | Stack | Priority | Timeout |
//! |--------|------|-------|----------|---------|
//! | [`TaskConfig::dcc_driver`] | `out::track::dcc` | 4096 | 24 | 100 ms |
//! | [`TaskConfig::decup_driver`] | `out::track::decup` | 4096 | 24 | 5 s |
//! | [`TaskConfig::mdu_driver`] | `out::track::mdu` | 4096 | 24 | 5 s |
//! | [`TaskConfig::dcc_service`] | `dcc` | 4096 | 2 | 20 ms |
//!
//! The timeout is the task's idle period: drivers end their session when no
//! packet arrives within it, services use it as their fill interval.
//!
//! On the desktop priority and core are informational. With the `esp32`
//! feature they are applied through the ESP-IDF pthread spawn configuration.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, TrackError};

/// Highest task priority below the ESP-IDF maximum.
pub const DRIVER_PRIORITY: u8 = 24;

/// Priority of the protocol services.
pub const SERVICE_PRIORITY: u8 = 2;

/// Default stack size [bytes].
pub const DEFAULT_STACK_SIZE: usize = 4096;

/// Configuration of one spawned task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskConfig {
    /// Thread name.
    pub name: &'static str,
    /// Stack size [bytes].
    pub stack_size: usize,
    /// Scheduler priority.
    pub priority: u8,
    /// Core to pin the task to, `None` for any.
    pub core: Option<u8>,
    /// Idle timeout.
    pub timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: "task",
            stack_size: DEFAULT_STACK_SIZE,
            priority: SERVICE_PRIORITY,
            core: None,
            timeout: Duration::from_millis(100),
        }
    }
}

impl TaskConfig {
    /// Task with default settings.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    /// DCC track driver.
    pub fn dcc_driver() -> Self {
        Self::new("out::track::dcc")
            .with_priority(DRIVER_PRIORITY)
            .with_timeout(Duration::from_millis(100))
    }

    /// DECUP track driver.
    pub fn decup_driver() -> Self {
        Self::new("out::track::decup")
            .with_priority(DRIVER_PRIORITY)
            .with_timeout(Duration::from_secs(5))
    }

    /// MDU track driver.
    pub fn mdu_driver() -> Self {
        Self::new("out::track::mdu")
            .with_priority(DRIVER_PRIORITY)
            .with_timeout(Duration::from_secs(5))
    }

    /// DCC middleware service.
    pub fn dcc_service() -> Self {
        Self::new("dcc")
            .with_priority(SERVICE_PRIORITY)
            .with_timeout(Duration::from_millis(20))
    }

    /// Builder: set the stack size.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Builder: set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: pin to a core.
    pub fn with_core(mut self, core: u8) -> Self {
        self.core = Some(core);
        self
    }

    /// Builder: set the idle timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Spawns `f` on a new thread configured by `self`.
    pub fn spawn<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        #[cfg(feature = "esp32")]
        self.apply_spawn_configuration()?;

        let handle = thread::Builder::new()
            .name(self.name.into())
            .stack_size(self.stack_size)
            .spawn(f)
            .map_err(TrackError::hardware)?;
        log::info!(
            "Spawned task {} (priority {}, core {:?})",
            self.name,
            self.priority,
            self.core
        );
        Ok(handle)
    }

    #[cfg(feature = "esp32")]
    fn apply_spawn_configuration(&self) -> Result<()> {
        use esp_idf_hal::cpu::Core;
        use esp_idf_hal::task::thread::ThreadSpawnConfiguration;

        ThreadSpawnConfiguration {
            stack_size: self.stack_size,
            priority: self.priority,
            pin_to_core: self.core.map(|core| match core {
                0 => Core::Core0,
                _ => Core::Core1,
            }),
            ..Default::default()
        }
        .set()
        .map_err(TrackError::hardware)
    }
}
