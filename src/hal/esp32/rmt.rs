//! RMT transmitter for DCC, DECUP and MDU symbols.

use esp_idf_hal::gpio::OutputPin;
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::rmt::config::TransmitConfig;
use esp_idf_hal::rmt::{
    PinState, Pulse, PulseTicks, RmtChannel, TxRmtDriver, VariableLengthSignal,
};
use esp_idf_hal::sys::EspError;

use crate::encoder::RmtSymbol;
use crate::traits::TrackTransmitter;

/// RMT channel clocked at 1 MHz so one tick is one microsecond.
///
/// # Example
///
/// ```ignore
/// let peripherals = Peripherals::take()?;
/// let transmitter = Esp32Transmitter::new(
///     peripherals.rmt.channel0,
///     peripherals.pins.gpio11,
/// )?;
/// ```
pub struct Esp32Transmitter<'d> {
    tx: TxRmtDriver<'d>,
}

impl<'d> Esp32Transmitter<'d> {
    /// APB clock (80 MHz) divided down to 1 MHz.
    const CLOCK_DIVIDER: u8 = 80;

    /// Creates the transmitter.
    ///
    /// # Errors
    ///
    /// Returns an error if the RMT channel can't be configured.
    pub fn new<C: RmtChannel>(
        channel: impl Peripheral<P = C> + 'd,
        pin: impl Peripheral<P = impl OutputPin> + 'd,
    ) -> Result<Self, EspError> {
        let config = TransmitConfig::new()
            .clock_divider(Self::CLOCK_DIVIDER)
            .idle(Some(PinState::Low));
        let tx = TxRmtDriver::new(channel, pin, &config)?;
        Ok(Self { tx })
    }

    /// RMT channel, the cutout follows packets of this channel.
    pub fn channel(&self) -> esp_idf_hal::sys::rmt_channel_t {
        self.tx.channel()
    }

    fn pulse(level: bool, us: u16) -> Result<Pulse, EspError> {
        let state = if level { PinState::High } else { PinState::Low };
        Ok(Pulse::new(state, PulseTicks::new(us)?))
    }
}

impl TrackTransmitter for Esp32Transmitter<'_> {
    type Error = EspError;

    fn transmit(&mut self, symbols: &[RmtSymbol]) -> Result<(), EspError> {
        let mut signal = VariableLengthSignal::with_capacity(symbols.len() * 2);
        for symbol in symbols {
            signal.push(&[
                Self::pulse(symbol.level0, symbol.duration0)?,
                Self::pulse(symbol.level1, symbol.duration1)?,
            ])?;
        }
        self.tx.start_blocking(&signal)
    }
}
