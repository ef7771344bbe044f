//! Traits for the collaborators around the track core.
//!
//! Persistence, the front-end broadcast path and the ADC task live outside
//! this crate. The core only knows them through these calls.

use alloc::vec::Vec;
use core::fmt::Debug;

use crate::config::SettingKey;
use crate::dcc::Loco;

/// Number of current samples in one measurement window.
pub const CURRENT_WINDOW_SAMPLES: usize = 100;

/// The most recent window of raw current measurements.
pub type CurrentWindow = heapless::Vec<u16, CURRENT_WINDOW_SAMPLES>;

/// Non-volatile settings.
pub trait SettingsStore {
    /// Error type for write operations.
    type Error: Debug;

    /// Reads a value, `None` if it was never written.
    fn get(&self, key: SettingKey) -> Option<u16>;

    /// Writes a value.
    fn set(&mut self, key: SettingKey, value: u16) -> Result<(), Self::Error>;
}

/// Non-volatile loco table, one document per address.
///
/// Implementations synchronize internally.
pub trait LocoStore: Send + Sync {
    /// Error type for store operations.
    type Error: Debug;

    /// Reads every stored loco.
    fn load_all(&self) -> Result<Vec<(u16, Loco)>, Self::Error>;

    /// Writes one loco.
    fn set(&self, addr: u16, loco: &Loco) -> Result<(), Self::Error>;

    /// Erases one loco.
    fn erase(&self, addr: u16) -> Result<(), Self::Error>;

    /// Erases every loco.
    fn erase_all(&self) -> Result<(), Self::Error>;
}

/// Notifications from the core to all connected front-ends.
///
/// Fire and forget, delivery is the collaborator's concern.
pub trait Broadcaster: Send + Sync {
    /// A CV read or write succeeded.
    fn cv_ack(&self, cv: u16, byte: u8);

    /// A CV read or write failed.
    fn cv_nack(&self);

    /// A CV request was aborted by a short circuit.
    fn cv_nack_short_circuit(&self);

    /// Loco state changed.
    fn broadcast_loco_info(&self, addr: u16);

    /// RailCom data of a loco changed.
    fn broadcast_rail_com_data(&self, addr: u16);

    /// The track was switched off.
    fn broadcast_track_power_off(&self);
}

/// Read-only view of the ADC task's current measurements.
pub trait AnalogMeasurements {
    /// Copies the latest window without consuming it.
    fn peek_currents(&self) -> CurrentWindow;
}

impl<A: AnalogMeasurements + ?Sized> AnalogMeasurements for alloc::sync::Arc<A> {
    fn peek_currents(&self) -> CurrentWindow {
        (**self).peek_currents()
    }
}
