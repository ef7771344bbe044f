//! Hardware abstraction traits for the track output stage.
//!
//! These are the seams between the protocol drivers and the peripherals that
//! put a signal on the rails or listen to decoders.
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`TrackTransmitter`] | Clock out RMT symbols, blocking until done |
//! | [`TrackOutput`] | H-bridge enable and force-low lines |
//! | [`BidiReceiver`] | Cutout timing and BiDi UART |
//! | [`CurrentLimitPins`] | Two GPIOs selecting the current limit |
//! | [`AckLine`] | ISR fed ACK edge counter and first-edge capture |
//! | [`Clock`] | Monotonic microsecond time source and busy delays |
//!
//! # Implementation
//!
//! For testing and desktop development, use the mock implementations
//! from [`crate::hal::mock`]. For ESP32 hardware, use the
//! implementations from `hal::esp32` (requires `esp32` feature).
//!
//! # Example
//!
//! ```rust
//! use zimo_track::traits::Clock;
//! use zimo_track::hal::MockClock;
//!
//! let clock = MockClock::new();
//! clock.advance_us(1500);
//! assert_eq!(clock.now_ms(), 1);
//! ```

use core::fmt::Debug;

use crate::bidi::CutoutFlags;
use crate::encoder::RmtSymbol;

/// RMT transmit channel.
pub trait TrackTransmitter {
    /// Error type for transmit operations.
    type Error: Debug;

    /// Transmits `symbols` and blocks until the last one left the channel.
    fn transmit(&mut self, symbols: &[RmtSymbol]) -> Result<(), Self::Error>;
}

/// Control lines of the track H-bridge.
pub trait TrackOutput {
    /// Error type for GPIO operations.
    type Error: Debug;

    /// Drives the enable line.
    fn set_enable(&mut self, enabled: bool) -> Result<(), Self::Error>;

    /// Drives the force-low line, `true` shorts both rails to ground.
    fn set_force_low(&mut self, force_low: bool) -> Result<(), Self::Error>;
}

/// BiDi cutout and receiver.
///
/// The cutout itself is timed in interrupt context after each transmission.
/// The BiDi-enable line belongs to the receiver because the cutout ISR drives
/// it.
pub trait BidiReceiver {
    /// Error type for UART and timer operations.
    type Error: Debug;

    /// Arms or disarms the cutout after each transmission.
    ///
    /// Disarming releases the BiDi-enable line.
    fn set_enabled(&mut self, enabled: bool) -> Result<(), Self::Error>;

    /// Blocks until the cutout following the last transmission ended.
    fn wait_cutout(&mut self) -> Result<CutoutFlags, Self::Error>;

    /// Number of bytes in the receive FIFO.
    fn available(&mut self) -> Result<usize, Self::Error>;

    /// Reads up to `buf.len()` bytes from the receive FIFO.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Discards everything left in the receive FIFO.
    fn flush(&mut self) -> Result<(), Self::Error>;
}

/// The two GPIOs selecting the current limit.
pub trait CurrentLimitPins {
    /// Error type for GPIO operations.
    type Error: Debug;

    /// Sets ILIM1 and ILIM0.
    fn set_levels(&mut self, ilim1: bool, ilim0: bool) -> Result<(), Self::Error>;

    /// Reads ILIM1 and ILIM0 back.
    fn levels(&self) -> (bool, bool);
}

/// ACK input of DECUP and MDU decoders.
///
/// The implementation counts rising edges and captures the timer count of the
/// first edge since the last [`arm`](Self::arm).
pub trait AckLine {
    /// Error type for timer operations.
    type Error: Debug;

    /// Clears the edge counter and the capture, restarts the capture timer.
    fn arm(&mut self) -> Result<(), Self::Error>;

    /// Edges seen since the last arm.
    fn edge_count(&self) -> u8;

    /// Timer count [µs] at the first edge since the last arm.
    fn first_edge_ticks(&self) -> Option<u32>;
}

/// Time source trait.
///
/// Provides monotonic time in microseconds and blocking delays. On desktop
/// this wraps `std::time::Instant`, on ESP32 the high resolution timer.
///
/// # Example
///
/// ```rust
/// use zimo_track::traits::Clock;
/// use zimo_track::hal::MockClock;
///
/// let clock = MockClock::new();
/// assert_eq!(clock.now_us(), 0);
///
/// clock.delay_ms(100);
/// assert_eq!(clock.now_ms(), 100);
/// ```
pub trait Clock {
    /// Returns current time in microseconds since an arbitrary epoch.
    ///
    /// Must be monotonically increasing.
    fn now_us(&self) -> u64;

    /// Blocks for `us` microseconds.
    fn delay_us(&self, us: u32);

    /// Returns current time in milliseconds.
    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }

    /// Blocks for `ms` milliseconds.
    fn delay_ms(&self, ms: u32) {
        self.delay_us(ms.saturating_mul(1000));
    }

    /// Spins until `done` returns true or `us` microseconds passed.
    ///
    /// Returns the last result of `done`.
    fn spin_until(&self, us: u32, mut done: impl FnMut() -> bool) -> bool
    where
        Self: Sized,
    {
        let then = self.now_us() + us as u64;
        while self.now_us() < then {
            if done() {
                return true;
            }
        }
        done()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }

    fn delay_us(&self, us: u32) {
        (**self).delay_us(us)
    }
}

impl<C: Clock + ?Sized> Clock for alloc::sync::Arc<C> {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }

    fn delay_us(&self, us: u32) {
        (**self).delay_us(us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockClock;

    // =========================================================================
    // Clock Default Methods Tests
    // =========================================================================

    #[test]
    fn clock_now_ms_derives_from_us() {
        let clock = MockClock::new();
        clock.advance_us(2_999);
        assert_eq!(clock.now_ms(), 2);
    }

    #[test]
    fn spin_until_returns_early() {
        let clock = MockClock::new();
        let mut calls = 0;
        assert!(clock.spin_until(1_000, || {
            calls += 1;
            calls == 3
        }));
        assert_eq!(calls, 3);
    }

    #[test]
    fn spin_until_times_out() {
        let clock = MockClock::with_step_us(10);
        assert!(!clock.spin_until(100, || false));
        assert!(clock.now_us() >= 100);
    }

    #[test]
    fn clock_through_reference_and_arc() {
        let clock = alloc::sync::Arc::new(MockClock::new());
        let by_ref = &*clock;
        by_ref.delay_us(5);
        clock.delay_us(5);
        assert_eq!(Clock::now_us(&clock), 10);
    }
}
