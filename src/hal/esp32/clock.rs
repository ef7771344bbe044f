//! ESP32 clock implementation using the ESP-IDF timer.

use esp_idf_hal::delay::{Ets, FreeRtos};

use crate::traits::Clock;

/// ESP32 clock using the high resolution timer.
///
/// `esp_timer_get_time()` returns microseconds since boot. Delays below a
/// millisecond busy-wait, longer ones yield to the scheduler.
///
/// # Example
///
/// ```ignore
/// use zimo_track::hal::esp32::Esp32Clock;
/// use zimo_track::traits::Clock;
///
/// let clock = Esp32Clock::new();
/// let start = clock.now_us();
/// clock.delay_us(200);
/// assert!(clock.now_us() - start >= 200);
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Esp32Clock;

impl Esp32Clock {
    /// Creates a new ESP32 clock instance.
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for Esp32Clock {
    #[inline]
    fn now_us(&self) -> u64 {
        // Safe: plain read of the hardware timer
        let micros = unsafe { esp_idf_hal::sys::esp_timer_get_time() };
        micros as u64
    }

    fn delay_us(&self, us: u32) {
        if us < 1000 {
            Ets::delay_us(us);
        } else {
            FreeRtos::delay_ms(us / 1000);
            Ets::delay_us(us % 1000);
        }
    }
}
