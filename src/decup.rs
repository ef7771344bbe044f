//! DECUP track driver.
//!
//! DECUP transfers ZIMO sound projects (ZPP) and firmware (ZSU) over the rails
//! with a UART style framing. Every packet is answered by the decoder with 0, 1
//! or 2 pulses on the ACK line:
//!
//! 1. transmit the packet, blocking until the last bit is out
//! 2. clear the edge counter
//! 3. wait for the first edge ([`packet2timeout`]: 100 ms after data, 5 ms
//!    after one-byte packets)
//! 4. wait another 200 µs for a second edge
//! 5. settle for 100 µs, then reply with the count
//!
//! Several decoder firmwares pulse unreliably for certain packets, so the raw
//! count passes through [`AckWorkaround::manipulate_acks_workaround`] before it
//! is replied.

use std::time::Duration;

use alloc::vec::Vec;

use crate::buffers::{Reply, TrackBuffers};
use crate::current_limit::{CurrentLimit, CurrentLimiter};
use crate::encoder::{DecupEncoder, SymbolEncoder};
use crate::error::{Result, TrackError};
use crate::state::{ModeToken, TrackMode};
use crate::traits::{AckLine, Clock, CurrentLimitPins, TrackTransmitter};

/// First preamble byte.
pub const PREAMBLE0: u8 = 0xEF;

/// Second preamble byte.
pub const PREAMBLE1: u8 = 0xBF;

/// ACK window after multi-byte packets [µs].
pub const DATA_ACK_TIMEOUT_US: u32 = 100_000;

/// ACK window after one-byte packets [µs].
pub const SHORT_ACK_TIMEOUT_US: u32 = 5_000;

/// Wait for a second pulse after the first one [µs].
pub const SECOND_ACK_US: u32 = 200;

/// Settle time before the count is read [µs].
pub const ACK_SETTLE_US: u32 = 100;

/// True if `packet` is a single preamble byte.
pub fn is_preamble(packet: &[u8]) -> bool {
    matches!(packet.first(), Some(&PREAMBLE0) | Some(&PREAMBLE1))
}

/// ACK window of `packet` [µs].
pub fn packet2timeout(packet: &[u8]) -> u32 {
    if packet.len() > 1 {
        DATA_ACK_TIMEOUT_US
    } else {
        SHORT_ACK_TIMEOUT_US
    }
}

/// Counts ACK pulses after a transmission, never more than 2.
pub fn receive_acks<A: AckLine + ?Sized, C: Clock>(ack: &A, clock: &C, us: u32) -> u8 {
    clock.spin_until(us, || ack.edge_count() >= 1);
    clock.spin_until(SECOND_ACK_US, || ack.edge_count() >= 2);
    clock.delay_us(ACK_SETTLE_US);
    ack.edge_count().min(2)
}

/// ACK corrections for decoders with unreliable pulses.
///
/// | Mode | Packet | Replied ACKs |
/// |------|--------|--------------|
/// | any | no pulse after a preamble byte | 0, forgets the decoder id |
/// | `DecupZpp` | flash erase `03 55 FF FF` | 1 |
/// | `DecupZpp` | anything else | 2 |
/// | `DecupZsu` | first one-byte packet (decoder id) | 2, remembers the id |
/// | `DecupZsu` | further one-byte packets | 1 |
/// | `DecupZsu` | multi-byte packets (flash write) | 2 |
///
/// Packets without any pulse are never corrected. USB pass-through
/// (`DecupEin`) replies the raw count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AckWorkaround {
    decoder_id: u8,
}

impl AckWorkaround {
    /// Fresh state, no decoder id known.
    pub const fn new() -> Self {
        Self { decoder_id: 0 }
    }

    /// Decoder id seen in this session, 0 if none.
    pub fn decoder_id(&self) -> u8 {
        self.decoder_id
    }

    /// Replaces the raw pulse count `acks` of `packet` by the count the host
    /// expects.
    pub fn manipulate_acks_workaround(&mut self, mode: TrackMode, packet: &[u8], acks: u8) -> u8 {
        if acks == 0 {
            if packet.len() == 1 && is_preamble(packet) {
                self.decoder_id = 0;
            }
            return 0;
        }

        match mode {
            TrackMode::DecupZpp => {
                if packet == [0x03, 0x55, 0xFF, 0xFF] {
                    1
                } else {
                    2
                }
            }
            TrackMode::DecupZsu => match packet {
                [id] if self.decoder_id == 0 => {
                    self.decoder_id = *id;
                    2
                }
                [_] => 1,
                _ => 2,
            },
            _ => acks,
        }
    }
}

/// DECUP driver over borrowed peripherals.
///
/// Created by [`TrackDriver`](crate::track::TrackDriver) for one session.
pub struct DecupDriver<'a, T, L, A, C> {
    /// RMT channel.
    pub transmitter: &'a mut T,
    /// Current limit.
    pub current_limit: &'a mut CurrentLimiter<L>,
    /// ACK input.
    pub ack: &'a mut A,
    /// Time source for the ACK windows.
    pub clock: &'a C,
    /// Packet and reply queues.
    pub buffers: &'a TrackBuffers,
    /// Session ends if no packet arrives within this time.
    pub timeout: Duration,
}

impl<'a, T, L, A, C> DecupDriver<'a, T, L, A, C>
where
    T: TrackTransmitter,
    L: CurrentLimitPins,
    A: AckLine,
    C: Clock,
{
    /// Runs the session until exit, timeout or a hardware error.
    ///
    /// The limit starts at 4100 mA to charge the decoder and drops to
    /// 1300 mA with the first non-preamble packet.
    pub fn run(&mut self, token: &ModeToken) -> Result<()> {
        let encoder = DecupEncoder::default();
        let mut workaround = AckWorkaround::new();
        let mut symbols = Vec::new();

        self.current_limit.set(CurrentLimit::Ma4100)?;

        loop {
            if token.exit_requested() {
                return Ok(());
            }
            let Some(packet) = self
                .buffers
                .receive_front(self.timeout, || token.exit_requested())
            else {
                log::info!("DECUP session timed out");
                return Ok(());
            };

            if self.current_limit.get() == CurrentLimit::Ma4100 && !is_preamble(&packet) {
                self.current_limit.set(CurrentLimit::Ma1300)?;
            }

            symbols.clear();
            encoder.encode_into(&packet, &mut symbols);
            self.transmitter
                .transmit(&symbols)
                .map_err(TrackError::hardware)?;
            self.ack.arm().map_err(TrackError::hardware)?;

            let acks = receive_acks(&*self.ack, self.clock, packet2timeout(&packet));
            let acks = workaround.manipulate_acks_workaround(token.mode(), &packet, acks);
            if self.buffers.rx.try_send(Reply::Decup(acks)).is_err() {
                log::warn!("DECUP reply dropped, rx buffer full");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{MockAckLine, MockClock, MockCurrentLimitPins, MockTransmitter};
    use crate::packet::Packet;
    use crate::state::ModeArbiter;
    use std::sync::Arc;

    // =========================================================================
    // Workaround Tests
    // =========================================================================

    #[test]
    fn silent_preamble_forgets_decoder_id() {
        let mut w = AckWorkaround::new();
        assert_eq!(w.manipulate_acks_workaround(TrackMode::DecupZsu, &[221], 1), 2);
        assert_eq!(w.decoder_id(), 221);

        assert_eq!(w.manipulate_acks_workaround(TrackMode::DecupZsu, &[PREAMBLE1], 0), 0);
        assert_eq!(w.decoder_id(), 0);
    }

    #[test]
    fn zsu_block_count_and_security_bytes() {
        let mut w = AckWorkaround::new();
        assert_eq!(w.manipulate_acks_workaround(TrackMode::DecupZsu, &[221], 2), 2);
        assert_eq!(w.manipulate_acks_workaround(TrackMode::DecupZsu, &[8], 2), 1);
        assert_eq!(w.manipulate_acks_workaround(TrackMode::DecupZsu, &[0x55], 1), 1);
        assert_eq!(
            w.manipulate_acks_workaround(TrackMode::DecupZsu, &[0, 1, 2, 3, 4], 1),
            2
        );
    }

    #[test]
    fn zpp_flash_erase_acks_once() {
        let mut w = AckWorkaround::new();
        let erase = [0x03, 0x55, 0xFF, 0xFF];
        assert_eq!(w.manipulate_acks_workaround(TrackMode::DecupZpp, &erase, 2), 1);
        assert_eq!(w.manipulate_acks_workaround(TrackMode::DecupZpp, &[0x05, 1, 2], 1), 2);
    }

    #[test]
    fn missing_pulse_is_never_corrected() {
        let mut w = AckWorkaround::new();
        for mode in [TrackMode::DecupZpp, TrackMode::DecupZsu, TrackMode::DecupEin] {
            assert_eq!(w.manipulate_acks_workaround(mode, &[1, 2, 3], 0), 0);
        }
    }

    #[test]
    fn pass_through_keeps_raw_count() {
        let mut w = AckWorkaround::new();
        assert_eq!(w.manipulate_acks_workaround(TrackMode::DecupEin, &[221], 1), 1);
        assert_eq!(w.decoder_id(), 0);
    }

    // =========================================================================
    // ACK Window Tests
    // =========================================================================

    #[test]
    fn timeout_depends_on_length() {
        assert_eq!(packet2timeout(&[PREAMBLE0]), SHORT_ACK_TIMEOUT_US);
        assert_eq!(packet2timeout(&[1, 2]), DATA_ACK_TIMEOUT_US);
    }

    #[test]
    fn receive_acks_clamps_to_two() {
        let clock = MockClock::with_step_us(10);
        let mut ack = MockAckLine::new();
        ack.pulses(5);
        ack.arm().unwrap();
        assert_eq!(receive_acks(&ack, &clock, 1_000), 2);
    }

    #[test]
    fn receive_acks_waits_full_window_on_silence() {
        let clock = MockClock::with_step_us(10);
        let ack = MockAckLine::new();
        assert_eq!(receive_acks(&ack, &clock, SHORT_ACK_TIMEOUT_US), 0);
        assert!(clock.now_us() >= (SHORT_ACK_TIMEOUT_US + SECOND_ACK_US + ACK_SETTLE_US) as u64);
    }

    // =========================================================================
    // Driver Tests
    // =========================================================================

    #[test]
    fn driver_replies_and_drops_current_limit() {
        let arbiter = Arc::new(ModeArbiter::new());
        let token = arbiter.try_acquire(TrackMode::DecupZsu).unwrap();
        let buffers = TrackBuffers::default();
        let clock = MockClock::with_step_us(10);
        let mut tx = MockTransmitter::new();
        let mut limiter = CurrentLimiter::new(MockCurrentLimitPins::new());
        let mut ack = MockAckLine::new();
        ack.pulses(0);
        ack.pulses(1);

        buffers.tx_front.send(Packet::from_slice(&[PREAMBLE0]).unwrap());
        buffers.tx_front.send(Packet::from_slice(&[221]).unwrap());

        let mut driver = DecupDriver {
            transmitter: &mut tx,
            current_limit: &mut limiter,
            ack: &mut ack,
            clock: &clock,
            buffers: &buffers,
            timeout: Duration::from_millis(10),
        };
        driver.run(&token).unwrap();

        assert_eq!(buffers.rx.try_receive(), Some(Reply::Decup(0)));
        assert_eq!(buffers.rx.try_receive(), Some(Reply::Decup(2)));
        assert_eq!(tx.count(), 2);
        assert_eq!(limiter.get(), CurrentLimit::Ma1300);
        assert_eq!(
            limiter.pins().history,
            vec![CurrentLimit::Ma4100.levels(), CurrentLimit::Ma1300.levels()]
        );
    }

    #[test]
    fn driver_stops_on_exit_request() {
        let arbiter = Arc::new(ModeArbiter::new());
        let token = arbiter.try_acquire(TrackMode::DecupZpp).unwrap();
        let buffers = TrackBuffers::default();
        buffers.tx_front.send(Packet::from_slice(&[PREAMBLE0]).unwrap());
        arbiter.short_circuit();

        let clock = MockClock::with_step_us(10);
        let mut tx = MockTransmitter::new();
        let mut limiter = CurrentLimiter::new(MockCurrentLimitPins::new());
        let mut ack = MockAckLine::new();
        DecupDriver {
            transmitter: &mut tx,
            current_limit: &mut limiter,
            ack: &mut ack,
            clock: &clock,
            buffers: &buffers,
            timeout: Duration::from_secs(5),
        }
        .run(&token)
        .unwrap();

        assert_eq!(tx.count(), 0);
        assert_eq!(buffers.tx_front.len(), 1);
    }
}
