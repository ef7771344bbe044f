//! # zimo-track
//!
//! Track signal core of a model railway command station: DCC operations and
//! service mode with RailCom (BiDi) feedback, plus the ZIMO DECUP and MDU
//! decoder update protocols.
//!
//! ## Features
//!
//! - **Mode arbitration**: one lock-free state word decides which protocol owns the rails
//! - **Priority scheduling**: refresh traffic ages locos so recently changed ones go out first
//! - **BiDi**: cutout timing, 4-of-8 decoding and datagram dissection
//! - **ACK detection**: current pulses in service mode, edge counting for DECUP and MDU
//! - **Hardware abstraction**: traits for every peripheral, mocks for desktop testing
//!
//! ## Architecture
//!
//! - `state` - Track modes and the [`ModeArbiter`]
//! - `packet`, `encoder` - DCC packets and their RMT symbols
//! - `bidi`, `ack`, `current_limit` - Feedback paths and output stage
//! - `dcc` - Loco table, CV requests, scheduler, DCC driver and service
//! - `decup`, `mdu` - Decoder update drivers
//! - `track` - The driver task that owns the peripherals
//! - `upload` - Front-end side of DECUP and MDU updates
//! - `hal` - Concrete implementations (mock for testing, esp32 for hardware)
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use zimo_track::{ModeArbiter, TrackMode};
//!
//! let arbiter = Arc::new(ModeArbiter::new());
//!
//! let token = arbiter.try_acquire(TrackMode::DccOperations).unwrap();
//! assert!(arbiter.try_acquire(TrackMode::DecupZsu).is_err());
//!
//! // Dropping the token releases the track
//! drop(token);
//! assert!(arbiter.load().is_suspended());
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

extern crate alloc;

/// Service mode current ACK detection.
pub mod ack;
/// RailCom cutout timing and datagram decoding.
pub mod bidi;
/// Typed settings with defaults and builders.
pub mod config;
/// Current limit selection of the H-bridge.
pub mod current_limit;
/// DCC protocol layer.
pub mod dcc;
/// RMT symbol encoders for DCC, DECUP and MDU.
pub mod encoder;
/// Error type.
pub mod error;
/// Hardware abstraction layer with mock implementations for testing.
pub mod hal;
/// DCC packets and addresses.
pub mod packet;
/// Track modes and their arbitration.
pub mod state;
/// Core traits for hardware abstraction and collaborators.
pub mod traits;

/// Bounded queues between tasks.
#[cfg(feature = "std")]
pub mod channel;
/// Message buffers shared by services and the track driver.
#[cfg(feature = "std")]
pub mod buffers;
/// DECUP track driver.
#[cfg(feature = "std")]
pub mod decup;
/// MDU track driver.
#[cfg(feature = "std")]
pub mod mdu;
/// Task configuration and spawning.
#[cfg(feature = "std")]
pub mod task;
/// Track driver task.
#[cfg(feature = "std")]
pub mod track;
/// DECUP and MDU upload sessions.
#[cfg(feature = "std")]
pub mod upload;

// Re-exports for convenience
pub use config::{AnalogCalibration, CutoutOffsets, ProgrammingType, SettingKey, Settings};
pub use current_limit::{CurrentLimit, CurrentLimiter};
pub use dcc::{CvPomRequest, CvRequest, Loco, NvLocoBase, PriorityScheduler, RailComData};
pub use error::{Result, TrackError};
pub use packet::{Address, AddressKind, Packet};
pub use state::{ModeArbiter, ModeToken, State, TrackMode};
pub use traits::{
    // Hardware
    AckLine,
    // Collaborators
    AnalogMeasurements,
    BidiReceiver,
    Broadcaster,
    Clock,
    CurrentLimitPins,
    LocoStore,
    SettingsStore,
    TrackOutput,
    TrackTransmitter,
};

#[cfg(feature = "std")]
pub use buffers::{BidiFeedback, Reply, TrackBuffers};
#[cfg(feature = "std")]
pub use channel::MessageBuffer;
#[cfg(feature = "std")]
pub use dcc::{DccDriver, DccService};
#[cfg(feature = "std")]
pub use task::TaskConfig;
#[cfg(feature = "std")]
pub use track::{DriverHandle, Peripherals, SessionTimeouts, TrackDriver};
#[cfg(feature = "std")]
pub use upload::UploadSession;
