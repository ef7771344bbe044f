//! H-bridge control lines.

use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_hal::sys::EspError;

use crate::traits::TrackOutput;

/// Enable and force-low lines of the H-bridge.
///
/// Both start in the safe state: disabled and forced low.
pub struct Esp32Output<'d> {
    enable: PinDriver<'d, AnyOutputPin, Output>,
    force_low: PinDriver<'d, AnyOutputPin, Output>,
}

impl<'d> Esp32Output<'d> {
    /// Creates the output stage.
    ///
    /// # Errors
    ///
    /// Returns an error if a pin can't be configured.
    pub fn new(enable: AnyOutputPin, force_low: AnyOutputPin) -> Result<Self, EspError> {
        let mut output = Self {
            enable: PinDriver::output(enable)?,
            force_low: PinDriver::output(force_low)?,
        };
        output.set_enable(false)?;
        output.set_force_low(true)?;
        Ok(output)
    }
}

impl TrackOutput for Esp32Output<'_> {
    type Error = EspError;

    fn set_enable(&mut self, enabled: bool) -> Result<(), EspError> {
        self.enable.set_level(enabled.into())
    }

    fn set_force_low(&mut self, force_low: bool) -> Result<(), EspError> {
        self.force_low.set_level(force_low.into())
    }
}
