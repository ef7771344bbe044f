//! Error type shared by the track drivers and the DCC service.
//!
//! Protocol-level failures (parity errors, missing ACKs, timeouts while
//! waiting for a decoder) are not errors: they become NAK replies or are
//! dropped. [`TrackError`] is reserved for conditions the caller has to act
//! on, most importantly peripheral failures which are fatal for a driver task.

use alloc::string::String;

use crate::state::TrackMode;

/// Errors raised by the track core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackError {
    /// A peripheral (RMT, timer, UART, GPIO) call failed.
    ///
    /// A half-initialized peripheral cannot safely drive the rails, so driver
    /// tasks abort on this error.
    Hardware(String),
    /// A bounded queue or deque had no room left.
    QueueFull,
    /// Nothing arrived within the protocol timeout.
    Timeout,
    /// The arbiter holds a mode no track driver exists for.
    UnsupportedMode(TrackMode),
    /// The arbiter was not in the state the caller expected.
    ModeConflict,
    /// Broadcast or out of range loco address.
    InvalidAddress(u16),
    /// A frame of this many bytes does not fit a packet.
    PacketTooLong(usize),
    /// A loco document could not be (de)serialized.
    Json(String),
    /// The persistence collaborator reported a failure.
    Store(String),
}

impl TrackError {
    /// Wraps any `Debug` hardware error.
    pub fn hardware<E: core::fmt::Debug>(err: E) -> Self {
        Self::Hardware(alloc::format!("{:?}", err))
    }
}

impl core::fmt::Display for TrackError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Hardware(e) => write!(f, "hardware error: {}", e),
            Self::QueueFull => write!(f, "queue full"),
            Self::Timeout => write!(f, "timeout"),
            Self::UnsupportedMode(mode) => write!(f, "no track driver for mode {:?}", mode),
            Self::ModeConflict => write!(f, "track mode changed concurrently"),
            Self::InvalidAddress(addr) => write!(f, "invalid loco address {}", addr),
            Self::PacketTooLong(len) => write!(f, "packet of {} bytes too long", len),
            Self::Json(e) => write!(f, "JSON error: {}", e),
            Self::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TrackError {}

#[cfg(feature = "json")]
impl From<serde_json::Error> for TrackError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(alloc::format!("{}", err))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, TrackError>;
