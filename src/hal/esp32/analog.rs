//! Track current sensing via the ESP32 ADC.
//!
//! The H-bridge current monitor output (IMON) is sampled in windows of
//! [`CURRENT_WINDOW_SAMPLES`]. The latest window is kept for service mode ACK
//! detection, and a current above the active limit for longer than the short
//! circuit time latches a short circuit at the [`ModeArbiter`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use esp_idf_hal::adc::attenuation::DB_11;
use esp_idf_hal::adc::oneshot::config::AdcChannelConfig;
use esp_idf_hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
use esp_idf_hal::adc::ADC1;
use esp_idf_hal::delay::Ets;
use esp_idf_hal::gpio::Gpio1;
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::sys::EspError;

use crate::config::AnalogCalibration;
use crate::state::ModeArbiter;
use crate::traits::{AnalogMeasurements, CurrentWindow, CURRENT_WINDOW_SAMPLES};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Current sense channel with short circuit detection.
///
/// # Example
///
/// ```ignore
/// let adc1 = AdcDriver::new(peripherals.adc1)?;
/// let analog = Esp32Analog::new(&adc1, peripherals.pins.gpio1, arbiter.clone(), calibration)?;
///
/// loop {
///     analog.poll(settings.current_limit.milliamps(), 100);
/// }
/// ```
pub struct Esp32Analog<'d> {
    channel: Mutex<AdcChannelDriver<'d, Gpio1, &'d AdcDriver<'d, ADC1>>>,
    window: Mutex<CurrentWindow>,
    arbiter: Arc<ModeArbiter>,
    calibration: AnalogCalibration,
    overcurrent_ms: Mutex<u32>,
}

impl<'d> Esp32Analog<'d> {
    /// Creates the sense channel.
    ///
    /// # Errors
    ///
    /// Returns an error if ADC channel initialization fails.
    pub fn new(
        adc: &'d AdcDriver<'d, ADC1>,
        pin: impl Peripheral<P = Gpio1> + 'd,
        arbiter: Arc<ModeArbiter>,
        calibration: AnalogCalibration,
    ) -> Result<Self, EspError> {
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(adc, pin, &config)?;

        Ok(Self {
            channel: Mutex::new(channel),
            window: Mutex::new(CurrentWindow::new()),
            arbiter,
            calibration,
            overcurrent_ms: Mutex::new(0),
        })
    }

    /// Samples one window and checks it against `limit_ma`.
    ///
    /// Returns true if this window latched a short circuit.
    pub fn poll(&self, limit_ma: u16, short_circuit_ms: u32) -> bool {
        let period_us = 1_000_000 / self.calibration.sample_rate_hz;
        let mut window = CurrentWindow::new();
        {
            let mut channel = lock(&self.channel);
            for _ in 0..CURRENT_WINDOW_SAMPLES {
                let _ = window.push(channel.read().unwrap_or(0));
                Ets::delay_us(period_us);
            }
        }

        let threshold = self.calibration.milliamps_to_measurement(limit_ma);
        let peak = window.iter().copied().max().unwrap_or(0) as u32;
        *lock(&self.window) = window;

        let mut overcurrent_ms = lock(&self.overcurrent_ms);
        if peak < threshold {
            *overcurrent_ms = 0;
            return false;
        }
        *overcurrent_ms += CURRENT_WINDOW_SAMPLES as u32 * 1000 / self.calibration.sample_rate_hz;
        if *overcurrent_ms < short_circuit_ms {
            return false;
        }
        *overcurrent_ms = 0;
        log::warn!("Short circuit, {} above {}", peak, threshold);
        self.arbiter.short_circuit();
        true
    }
}

impl AnalogMeasurements for Esp32Analog<'_> {
    fn peek_currents(&self) -> CurrentWindow {
        lock(&self.window).clone()
    }
}
