//! Current limit selection lines.

use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_hal::sys::EspError;

use crate::traits::CurrentLimitPins;

/// ILIM1 and ILIM0 of the H-bridge.
pub struct Esp32CurrentLimitPins<'d> {
    ilim1: PinDriver<'d, AnyOutputPin, Output>,
    ilim0: PinDriver<'d, AnyOutputPin, Output>,
}

impl<'d> Esp32CurrentLimitPins<'d> {
    /// Creates the pins, both low.
    ///
    /// # Errors
    ///
    /// Returns an error if a pin can't be configured.
    pub fn new(ilim1: AnyOutputPin, ilim0: AnyOutputPin) -> Result<Self, EspError> {
        let mut pins = Self {
            ilim1: PinDriver::output(ilim1)?,
            ilim0: PinDriver::output(ilim0)?,
        };
        pins.set_levels(false, false)?;
        Ok(pins)
    }
}

impl CurrentLimitPins for Esp32CurrentLimitPins<'_> {
    type Error = EspError;

    fn set_levels(&mut self, ilim1: bool, ilim0: bool) -> Result<(), EspError> {
        self.ilim1.set_level(ilim1.into())?;
        self.ilim0.set_level(ilim0.into())
    }

    fn levels(&self) -> (bool, bool) {
        (self.ilim1.is_set_high(), self.ilim0.is_set_high())
    }
}
