//! Track current limit.
//!
//! The H-bridge trips at one of four thresholds selected by two GPIOs
//! (ILIM1, ILIM0).

use crate::error::{Result, TrackError};
use crate::traits::CurrentLimitPins;

/// Current limit thresholds, the discriminant is the ILIM1/ILIM0 bit pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CurrentLimit {
    /// 500 mA
    Ma500 = 0b00,
    /// 1300 mA
    Ma1300 = 0b01,
    /// 2700 mA
    Ma2700 = 0b10,
    /// 4100 mA
    #[default]
    Ma4100 = 0b11,
}

impl CurrentLimit {
    /// Decodes the two low bits.
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::Ma500,
            0b01 => Self::Ma1300,
            0b10 => Self::Ma2700,
            _ => Self::Ma4100,
        }
    }

    /// Decodes the pin levels.
    pub const fn from_levels(ilim1: bool, ilim0: bool) -> Self {
        Self::from_bits((ilim1 as u8) << 1 | ilim0 as u8)
    }

    /// ILIM1 and ILIM0 levels.
    pub const fn levels(self) -> (bool, bool) {
        (self as u8 & 0b10 != 0, self as u8 & 0b01 != 0)
    }

    /// Threshold in mA.
    pub const fn milliamps(self) -> u16 {
        match self {
            Self::Ma500 => 500,
            Self::Ma1300 => 1300,
            Self::Ma2700 => 2700,
            Self::Ma4100 => 4100,
        }
    }
}

/// Sets and reads back the current limit.
#[derive(Debug)]
pub struct CurrentLimiter<P> {
    pins: P,
}

impl<P: CurrentLimitPins> CurrentLimiter<P> {
    /// Wraps the limit pins.
    pub fn new(pins: P) -> Self {
        Self { pins }
    }

    /// Selects a limit.
    pub fn set(&mut self, limit: CurrentLimit) -> Result<()> {
        let (ilim1, ilim0) = limit.levels();
        self.pins
            .set_levels(ilim1, ilim0)
            .map_err(TrackError::hardware)
    }

    /// Currently selected limit.
    pub fn get(&self) -> CurrentLimit {
        let (ilim1, ilim0) = self.pins.levels();
        CurrentLimit::from_levels(ilim1, ilim0)
    }

    /// Gives the pins back.
    pub fn into_inner(self) -> P {
        self.pins
    }

    /// Access the pins.
    pub fn pins(&self) -> &P {
        &self.pins
    }
}
