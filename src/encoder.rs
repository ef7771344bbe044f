//! RMT symbol encoders for DCC, DECUP and MDU.
//!
//! Every protocol is transmitted through the same RMT channel. An encoder
//! turns a packet into a sequence of [`RmtSymbol`]s (two level/duration pairs
//! each, durations in µs at a 1 MHz RMT resolution) which the
//! [`TrackTransmitter`](crate::traits::TrackTransmitter) clocks out.
//!
//! | Encoder | Framing |
//! |---------|---------|
//! | [`DccEncoder`] | preamble, `0` start bit per byte, MSB first, `1` end bit |
//! | [`DecupEncoder`] | UART style, start bit low, LSB first, stop bit high |
//! | [`MduEncoder`] | like DCC with per-rate timings plus ACK request bits |

use alloc::vec::Vec;

/// Minimum number of DCC preamble bits (RCN-211).
pub const DCC_TX_MIN_PREAMBLE_BITS: u8 = 17;

/// Maximum number of DCC preamble bits.
pub const DCC_TX_MAX_PREAMBLE_BITS: u8 = 30;

/// Service mode needs at least this many preamble bits (RCN-216).
pub const DCC_SERVICE_MIN_PREAMBLE_BITS: u8 = 20;

/// Minimum number of MDU preamble bits.
pub const MDU_TX_MIN_PREAMBLE_BITS: u8 = 14;

/// Minimum number of MDU ACK request bits.
pub const MDU_TX_MIN_ACKREQ_BITS: u8 = 10;

/// One RMT item: two levels held for the given durations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RmtSymbol {
    /// Level of the first half.
    pub level0: bool,
    /// Duration of the first half in µs.
    pub duration0: u16,
    /// Level of the second half.
    pub level1: bool,
    /// Duration of the second half in µs.
    pub duration1: u16,
}

impl RmtSymbol {
    /// Creates a symbol.
    pub const fn new(level0: bool, duration0: u16, level1: bool, duration1: u16) -> Self {
        Self {
            level0,
            duration0,
            level1,
            duration1,
        }
    }

    /// Symmetric bit, high first.
    pub const fn bit(half: u16) -> Self {
        Self::new(true, half, false, half)
    }

    /// Total duration in µs.
    pub const fn duration(&self) -> u32 {
        self.duration0 as u32 + self.duration1 as u32
    }
}

/// Converts packets into RMT symbols.
pub trait SymbolEncoder {
    /// Appends the symbols for `packet` to `symbols`.
    fn encode_into(&self, packet: &[u8], symbols: &mut Vec<RmtSymbol>);

    /// Encodes `packet` into a fresh buffer.
    fn encode(&self, packet: &[u8]) -> Vec<RmtSymbol> {
        let mut symbols = Vec::new();
        self.encode_into(packet, &mut symbols);
        symbols
    }
}

// ============================================================================
// DCC
// ============================================================================

/// DCC encoder settings, durations are half bit durations in µs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DccEncoderConfig {
    /// Number of preamble bits.
    pub num_preamble: u8,
    /// Duration of the BiDi bit, `0` disables it.
    pub bidibit_duration: u8,
    /// Half duration of a one bit.
    pub bit1_duration: u8,
    /// Half duration of a zero bit.
    pub bit0_duration: u8,
    /// Second half of the end bit, `0` uses `bit1_duration`.
    ///
    /// Shortening the end bit moves the transmit-done interrupt forward and
    /// compensates the latency until the cutout timer starts.
    pub endbit_duration: u8,
}

impl Default for DccEncoderConfig {
    fn default() -> Self {
        Self {
            num_preamble: DCC_TX_MIN_PREAMBLE_BITS,
            bidibit_duration: 0,
            bit1_duration: 58,
            bit0_duration: 100,
            endbit_duration: 0,
        }
    }
}

impl DccEncoderConfig {
    /// True if packets are followed by a cutout.
    #[inline]
    pub const fn bidi(&self) -> bool {
        self.bidibit_duration != 0
    }
}

/// DCC encoder.
///
/// With BiDi enabled the first preamble bit is replaced by a BiDi bit of
/// `bidibit_duration`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DccEncoder {
    config: DccEncoderConfig,
}

impl DccEncoder {
    /// Creates an encoder.
    pub const fn new(config: DccEncoderConfig) -> Self {
        Self { config }
    }

    /// Current configuration.
    pub const fn config(&self) -> &DccEncoderConfig {
        &self.config
    }

    fn one(&self) -> RmtSymbol {
        RmtSymbol::bit(self.config.bit1_duration as u16)
    }

    fn zero(&self) -> RmtSymbol {
        RmtSymbol::bit(self.config.bit0_duration as u16)
    }
}

impl SymbolEncoder for DccEncoder {
    fn encode_into(&self, packet: &[u8], symbols: &mut Vec<RmtSymbol>) {
        let mut preamble = self.config.num_preamble;
        if self.config.bidi() {
            symbols.push(RmtSymbol::bit(self.config.bidibit_duration as u16));
            preamble = preamble.saturating_sub(1);
        }
        symbols.extend(core::iter::repeat(self.one()).take(preamble as usize));

        for &byte in packet {
            symbols.push(self.zero());
            for i in (0..8).rev() {
                symbols.push(if byte >> i & 1 != 0 {
                    self.one()
                } else {
                    self.zero()
                });
            }
        }

        let half = self.config.bit1_duration as u16;
        let endbit = match self.config.endbit_duration {
            0 => half,
            d => d as u16,
        };
        symbols.push(RmtSymbol::new(true, half, false, endbit));
    }
}

// ============================================================================
// DECUP
// ============================================================================

/// DECUP bit duration in µs (38400 baud).
pub const DECUP_BIT_DURATION: u16 = 26;

/// DECUP encoder, UART framing with 8 data bits and one stop bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecupEncoder {
    bit_duration: u16,
}

impl Default for DecupEncoder {
    fn default() -> Self {
        Self::new(DECUP_BIT_DURATION)
    }
}

impl DecupEncoder {
    /// Creates an encoder with the given bit duration.
    pub const fn new(bit_duration: u16) -> Self {
        Self { bit_duration }
    }

    fn level(&self, high: bool) -> RmtSymbol {
        let half = self.bit_duration / 2;
        RmtSymbol::new(high, half, high, self.bit_duration - half)
    }
}

impl SymbolEncoder for DecupEncoder {
    fn encode_into(&self, packet: &[u8], symbols: &mut Vec<RmtSymbol>) {
        for &byte in packet {
            symbols.push(self.level(false));
            for i in 0..8 {
                symbols.push(self.level(byte >> i & 1 != 0));
            }
            symbols.push(self.level(true));
        }
    }
}

// ============================================================================
// MDU
// ============================================================================

/// MDU transfer rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransferRate {
    /// Fastest rate.
    Fast0 = 0,
    /// Second fastest rate.
    Fast1 = 1,
    /// Third fastest rate.
    Fast2 = 2,
    /// Slow rate used when a decoder rejects a requested rate.
    Fallback = 3,
    /// Rate every decoder understands.
    #[default]
    Default = 4,
}

impl TransferRate {
    /// Looks a rate up by its wire value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Fast0),
            1 => Some(Self::Fast1),
            2 => Some(Self::Fast2),
            3 => Some(Self::Fallback),
            4 => Some(Self::Default),
            _ => None,
        }
    }

    /// Bit timings of this rate.
    pub const fn timing(self) -> MduTiming {
        MDU_TIMINGS[self as usize]
    }
}

/// Full bit durations of one MDU transfer rate in µs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MduTiming {
    /// One bit.
    pub one: u16,
    /// Zero bit.
    pub zero: u16,
    /// ACK request bit.
    pub ackreq: u16,
}

/// Timings indexed by [`TransferRate`].
pub const MDU_TIMINGS: [MduTiming; 5] = [
    MduTiming {
        one: 10,
        zero: 20,
        ackreq: 40,
    },
    MduTiming {
        one: 12,
        zero: 24,
        ackreq: 48,
    },
    MduTiming {
        one: 16,
        zero: 32,
        ackreq: 64,
    },
    MduTiming {
        one: 40,
        zero: 80,
        ackreq: 160,
    },
    MduTiming {
        one: 20,
        zero: 40,
        ackreq: 80,
    },
];

/// MDU encoder settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MduEncoderConfig {
    /// Transfer rate.
    pub transfer_rate: TransferRate,
    /// Number of preamble bits.
    pub num_preamble: u8,
    /// Number of ACK request bits.
    pub num_ackreq: u8,
}

impl Default for MduEncoderConfig {
    fn default() -> Self {
        Self {
            transfer_rate: TransferRate::Default,
            num_preamble: MDU_TX_MIN_PREAMBLE_BITS,
            num_ackreq: MDU_TX_MIN_ACKREQ_BITS,
        }
    }
}

/// MDU encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MduEncoder {
    config: MduEncoderConfig,
}

impl MduEncoder {
    /// Creates an encoder.
    pub const fn new(config: MduEncoderConfig) -> Self {
        Self { config }
    }

    /// Current configuration.
    pub const fn config(&self) -> &MduEncoderConfig {
        &self.config
    }
}

impl SymbolEncoder for MduEncoder {
    fn encode_into(&self, packet: &[u8], symbols: &mut Vec<RmtSymbol>) {
        let timing = self.config.transfer_rate.timing();
        let one = RmtSymbol::bit(timing.one / 2);
        let zero = RmtSymbol::bit(timing.zero / 2);

        symbols.extend(core::iter::repeat(one).take(self.config.num_preamble as usize));
        for &byte in packet {
            symbols.push(zero);
            for i in (0..8).rev() {
                symbols.push(if byte >> i & 1 != 0 { one } else { zero });
            }
        }
        symbols.push(one);
        symbols.extend(
            core::iter::repeat(RmtSymbol::bit(timing.ackreq / 2))
                .take(self.config.num_ackreq as usize),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total_us(symbols: &[RmtSymbol]) -> u32 {
        symbols.iter().map(RmtSymbol::duration).sum()
    }

    // =========================================================================
    // DCC Tests
    // =========================================================================

    #[test]
    fn dcc_idle_packet_layout() {
        let encoder = DccEncoder::new(DccEncoderConfig::default());
        let symbols = encoder.encode(&[0xFF, 0x00, 0xFF]);

        // 17 preamble + 3 * 9 + end bit
        assert_eq!(symbols.len(), 17 + 27 + 1);
        assert_eq!(symbols[17], RmtSymbol::bit(100));
        assert_eq!(symbols[18], RmtSymbol::bit(58));
    }

    #[test]
    fn dcc_bidi_bit_replaces_first_preamble_bit() {
        let encoder = DccEncoder::new(DccEncoderConfig {
            bidibit_duration: 60,
            endbit_duration: 27,
            ..Default::default()
        });
        let symbols = encoder.encode(&[0x00]);

        assert_eq!(symbols[0], RmtSymbol::bit(60));
        assert_eq!(symbols.len(), 17 + 9 + 1);
        assert_eq!(*symbols.last().unwrap(), RmtSymbol::new(true, 58, false, 27));
    }

    // =========================================================================
    // DECUP Tests
    // =========================================================================

    #[test]
    fn decup_frames_lsb_first() {
        let symbols = DecupEncoder::default().encode(&[0b0000_0001]);
        assert_eq!(symbols.len(), 10);
        assert!(!symbols[0].level0);
        assert!(symbols[1].level0);
        assert!(!symbols[2].level0);
        assert!(symbols[9].level0);
        assert_eq!(total_us(&symbols), 10 * DECUP_BIT_DURATION as u32);
    }

    // =========================================================================
    // MDU Tests
    // =========================================================================

    #[test]
    fn mdu_duration_matches_timings() {
        let config = MduEncoderConfig::default();
        let symbols = MduEncoder::new(config).encode(&[0xF0]);
        let t = TransferRate::Default.timing();

        let expected = config.num_preamble as u32 * t.one as u32
            + t.zero as u32
            + 4 * t.one as u32
            + 4 * t.zero as u32
            + t.one as u32
            + config.num_ackreq as u32 * t.ackreq as u32;
        assert_eq!(total_us(&symbols), expected);
    }

    #[test]
    fn transfer_rate_from_u8() {
        assert_eq!(TransferRate::from_u8(3), Some(TransferRate::Fallback));
        assert_eq!(TransferRate::from_u8(4), Some(TransferRate::Default));
        assert_eq!(TransferRate::from_u8(5), None);
    }
}
