//! Trait definitions for hardware abstraction and collaborators.
//!
//! This module defines the core abstractions that allow zimo-track to:
//! - Run on different hardware (ESP32, desktop mock)
//! - Talk to persistence and front-ends it does not own
//!
//! # Submodules
//!
//! - `hardware`: RMT transmitter, H-bridge lines, BiDi, ACK input, clock
//! - `collaborators`: settings and loco stores, broadcasts, ADC windows
//!
//! # Hardware Abstraction
//!
//! The key hardware traits are:
//!
//! - [`TrackTransmitter`]: RMT symbol output
//! - [`BidiReceiver`]: Cutout and BiDi UART
//! - [`AckLine`]: DECUP/MDU ACK input
//! - [`Clock`]: Time source and busy delays

pub mod collaborators;
pub mod hardware;

pub use collaborators::*;
pub use hardware::*;
