//! Implementations of the [`crate::traits`] seams.
//!
//! | Module | Feature | Backs |
//! |--------|---------|-------|
//! | `mock` | `std` | every hardware and collaborator trait, for tests and desktop runs |
//! | `esp32` | `esp32` | RMT, H-bridge, BiDi UART, ACK input, ADC and NVS of the ESP32-S3 |

#[cfg(feature = "std")]
pub mod mock;
#[cfg(feature = "std")]
pub use mock::*;

#[cfg(feature = "esp32")]
pub mod esp32;
#[cfg(feature = "esp32")]
pub use esp32::*;
