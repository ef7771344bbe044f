//! ESP32-S3 hardware abstraction layer for the track output stage.
//!
//! # Hardware Configuration
//!
//! - **MCU**: ESP32-S3
//! - **Output stage**: H-bridge with enable, force-low and two current limit lines
//! - **BiDi**: 250 kBaud UART behind a BiDi-enable switch
//! - **ACK**: comparator output on a GPIO interrupt
//!
//! # Pin Assignments
//!
//! See the [`pins`] module.

mod ack;
mod analog;
mod bidi;
mod clock;
mod current_limit;
mod nvs;
mod output;
mod rmt;

pub use ack::Esp32AckLine;
pub use analog::Esp32Analog;
pub use bidi::Esp32Bidi;
pub use clock::Esp32Clock;
pub use current_limit::Esp32CurrentLimitPins;
pub use nvs::{Esp32LocoStore, Esp32SettingsStore};
pub use output::Esp32Output;
pub use rmt::Esp32Transmitter;

/// Pin assignments of the track output stage.
pub mod pins {
    // =========================================================================
    // Track
    // =========================================================================

    /// RMT output to the H-bridge inputs.
    pub const RMT_OUT: i32 = 11;

    /// H-bridge enable.
    pub const ENABLE: i32 = 12;

    /// Forces both rails low.
    pub const FORCE_LOW: i32 = 9;

    /// Current limit selection, high bit.
    pub const ILIM1: i32 = 16;

    /// Current limit selection, low bit.
    pub const ILIM0: i32 = 15;

    // =========================================================================
    // Feedback
    // =========================================================================

    /// Switches the rails onto the BiDi receiver during the cutout.
    pub const BIDI_EN: i32 = 13;

    /// BiDi UART receive.
    pub const BIDI_RX: i32 = 14;

    /// Decoder ACK comparator output.
    pub const ACK: i32 = 18;

    /// Track current sense (ADC1).
    pub const IMON: i32 = 1;
}
