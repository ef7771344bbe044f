//! MDU track driver.
//!
//! MDU (multi decoder update) sends firmware to many decoders at once. A
//! decoder answers a packet by pulling the ACK line during one of two ACK
//! request phases that follow the packet. The ACK line ISR only captures the
//! timer count of the first edge; [`packet2ack_counts`] predicts the count of
//! both phases and the closer one wins.
//!
//! ```text
//! | preamble | 0 byte 0 byte ... | 1 | ackreq x2 | ackreq x4 |
//!                                     ^ position 0   ^ position 1
//! ```
//!
//! A session starts with 200 ms of busy packets at 4100 mA to charge the
//! decoders, then runs at 500 mA. The exit commands are followed by one second
//! of busy packets before the session ends.

use std::time::Duration;

use alloc::vec::Vec;

use crate::buffers::{Reply, TrackBuffers};
use crate::current_limit::{CurrentLimit, CurrentLimiter};
use crate::encoder::{MduEncoder, MduEncoderConfig, RmtSymbol, SymbolEncoder, TransferRate};
use crate::error::{Result, TrackError};
use crate::packet::Packet;
use crate::state::{ModeToken, TrackMode};
use crate::traits::{AckLine, Clock, CurrentLimitPins, TrackTransmitter};

/// Reply byte of an acknowledged ACK position.
pub const ACK: u8 = 0x06;

/// Reply byte of a silent ACK position.
pub const NAK: u8 = 0x15;

/// Busy packets after entering ZSU mode [µs].
pub const ZSU_ENTRY_BUSY_US: u32 = 200_000;

/// Busy packets after an exit command [µs].
pub const EXIT_BUSY_US: u32 = 1_000_000;

/// MDU commands, the first four bytes of a packet (big endian).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Addresses one decoder by id.
    Ping = 0xFFFF_FFFF,
    /// Switches the transfer rate, byte 4 holds the rate.
    ConfigTransferRate = 0xFFFF_FFFE,
    /// Binary search for decoders.
    BinaryTree = 0xFFFF_FFFA,
    /// Keeps decoders in update mode.
    Busy = 0xFFFF_FFF2,
    /// Leaves a ZPP update with a reset.
    ZppExitReset = 0xFFFF_FFF3,
    /// Queries the CRC32 result and leaves a ZSU update.
    ZsuCrc32ResultExit = 0xFFFF_FFFD,
}

impl Command {
    const ALL: [Command; 6] = [
        Command::Ping,
        Command::ConfigTransferRate,
        Command::BinaryTree,
        Command::Busy,
        Command::ZppExitReset,
        Command::ZsuCrc32ResultExit,
    ];

    /// Command of `packet`, `None` for data packets.
    pub fn from_packet(packet: &[u8]) -> Option<Self> {
        let head: [u8; 4] = packet.get(..4)?.try_into().ok()?;
        let value = u32::from_be_bytes(head);
        Self::ALL.iter().copied().find(|&cmd| cmd as u32 == value)
    }
}

/// Packet keeping decoders busy.
pub fn make_busy_packet() -> Packet {
    let mut packet = Packet::new();
    for byte in (Command::Busy as u32).to_be_bytes() {
        let _ = packet.push(byte);
    }
    packet
}

/// Expected timer counts [µs] at the first ACK edge for both positions.
///
/// The count runs from the start of the transmission: preamble, one start bit
/// per byte, the data bits, the end bit, then 2 (position 0) or 6 (position 1)
/// ACK request bits.
pub fn packet2ack_counts(config: &MduEncoderConfig, packet: &[u8]) -> (i32, i32) {
    let timing = config.transfer_rate.timing();
    let one = timing.one as i32;
    let zero = timing.zero as i32;
    let ackreq = timing.ackreq as i32;

    let ones: i32 = packet.iter().map(|b| b.count_ones() as i32).sum();
    let zeros = packet.len() as i32 * 8 - ones;

    let count = config.num_preamble as i32 * one
        + packet.len() as i32 * zero
        + ones * one
        + zeros * zero
        + one;

    (count + 2 * ackreq, count + 6 * ackreq)
}

/// ACK/NAK per position for a first edge at `first_edge` ticks.
///
/// Without edge both positions are NAK. Equal distance counts for position 1.
pub fn receive_acks(config: &MduEncoderConfig, packet: &[u8], first_edge: Option<u32>) -> [u8; 2] {
    let mut acks = [NAK, NAK];
    if let Some(count) = first_edge.filter(|&c| c != 0) {
        let count = count as i32;
        let (first, second) = packet2ack_counts(config, packet);
        if (first - count).abs() < (second - count).abs() {
            acks[0] = ACK;
        } else {
            acks[1] = ACK;
        }
    }
    acks
}

/// Rate after a `ConfigTransferRate` packet.
///
/// Decoders that cannot handle `requested` answer, which drops everyone to
/// [`TransferRate::Fallback`].
pub fn config_transfer_rate(requested: TransferRate, acks: [u8; 2]) -> TransferRate {
    if acks.contains(&ACK) {
        TransferRate::Fallback
    } else {
        requested
    }
}

/// MDU driver over borrowed peripherals.
pub struct MduDriver<'a, T, L, A, C> {
    /// RMT channel.
    pub transmitter: &'a mut T,
    /// Current limit.
    pub current_limit: &'a mut CurrentLimiter<L>,
    /// ACK input.
    pub ack: &'a mut A,
    /// Time source for busy phases.
    pub clock: &'a C,
    /// Packet and reply queues.
    pub buffers: &'a TrackBuffers,
    /// Session ends if no packet arrives within this time.
    pub timeout: Duration,
    /// Encoder settings at session start.
    pub config: MduEncoderConfig,
}

impl<'a, T, L, A, C> MduDriver<'a, T, L, A, C>
where
    T: TrackTransmitter,
    L: CurrentLimitPins,
    A: AckLine,
    C: Clock,
{
    /// Runs the session until exit, timeout, an exit command or a hardware
    /// error.
    pub fn run(&mut self, token: &ModeToken) -> Result<()> {
        if token.mode() == TrackMode::MduZpp {
            log::warn!("MDU ZPP entry not supported, entering like ZSU");
        }

        let mut encoder = MduEncoder::new(self.config);
        let mut symbols = Vec::new();
        let busy = make_busy_packet();

        self.zsu_entry(&encoder, &busy, &mut symbols)?;

        loop {
            if token.exit_requested() {
                return Ok(());
            }
            let Some(packet) = self
                .buffers
                .receive_front(self.timeout, || token.exit_requested())
            else {
                log::info!("MDU session timed out");
                return Ok(());
            };

            self.transmit(&encoder, &packet, &mut symbols)?;
            let acks = receive_acks(encoder.config(), &packet, self.ack.first_edge_ticks());
            if self.buffers.rx.try_send(Reply::Mdu(acks)).is_err() {
                log::warn!("MDU reply dropped, rx buffer full");
            }

            match Command::from_packet(&packet) {
                Some(Command::ConfigTransferRate) => {
                    match packet.get(4).copied().and_then(TransferRate::from_u8) {
                        Some(requested) => {
                            let transfer_rate = config_transfer_rate(requested, acks);
                            log::info!("MDU transfer rate {:?}", transfer_rate);
                            encoder = MduEncoder::new(MduEncoderConfig {
                                transfer_rate,
                                ..*encoder.config()
                            });
                        }
                        None => log::warn!("MDU invalid transfer rate {:?}", packet.get(4)),
                    }
                }
                Some(Command::ZppExitReset | Command::ZsuCrc32ResultExit) => {
                    self.transmit_for(&encoder, &busy, EXIT_BUSY_US, &mut symbols)?;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    fn zsu_entry(
        &mut self,
        encoder: &MduEncoder,
        busy: &Packet,
        symbols: &mut Vec<RmtSymbol>,
    ) -> Result<()> {
        self.current_limit.set(CurrentLimit::Ma4100)?;
        self.transmit_for(encoder, busy, ZSU_ENTRY_BUSY_US, symbols)?;
        self.current_limit.set(CurrentLimit::Ma500)
    }

    /// Restarts the capture, then transmits.
    fn transmit(
        &mut self,
        encoder: &MduEncoder,
        packet: &[u8],
        symbols: &mut Vec<RmtSymbol>,
    ) -> Result<()> {
        symbols.clear();
        encoder.encode_into(packet, symbols);
        self.ack.arm().map_err(TrackError::hardware)?;
        self.transmitter
            .transmit(symbols)
            .map_err(TrackError::hardware)
    }

    fn transmit_for(
        &mut self,
        encoder: &MduEncoder,
        packet: &[u8],
        us: u32,
        symbols: &mut Vec<RmtSymbol>,
    ) -> Result<()> {
        let then = self.clock.now_us() + us as u64;
        while self.clock.now_us() < then {
            self.transmit(encoder, packet, symbols)?;
        }
        Ok(())
    }
}
