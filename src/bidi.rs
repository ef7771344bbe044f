//! BiDi (RailCom) cutout timing and datagram decoding.
//!
//! After every DCC packet the track driver is muted for roughly 450 µs so
//! decoders can answer. The answer arrives on a 250 kBaud UART in two
//! channels:
//!
//! | Channel | Bytes | Window [µs] | Contents |
//! |---------|-------|-------------|----------|
//! | 1 | 2 | [`TTS1`]..[`TTC1`] | address broadcast (`adr_high` / `adr_low`) |
//! | 2 | 6 | [`TTS2`]..[`TCE_MIN`] | data addressed by the preceding packet |
//!
//! Every byte is a 4-of-8 symbol carrying 6 bits. Bytes with a different
//! number of ones are transmission errors.
//!
//! # Split between ISR and task
//!
//! [`Cutout`] is the interrupt side: it only steps through the three timer
//! alarms and reports which channels saw data. Decoding happens later in task
//! context through [`Dissector`].
//!
//! # Example
//!
//! ```rust
//! use zimo_track::bidi::{App, Dissector, encode_symbol};
//!
//! // dyn, subindex 0 (speed), value 42
//! let bits: u32 = (7 << 14) | (42 << 6);
//! let mut datagram = [0u8; 8];
//! datagram[2] = encode_symbol((bits >> 12) as u8 & 0x3F);
//! datagram[3] = encode_symbol((bits >> 6) as u8 & 0x3F);
//! datagram[4] = encode_symbol(bits as u8 & 0x3F);
//!
//! let dissector = Dissector::new(&datagram).unwrap();
//! assert_eq!(dissector.channel2(), &[App::Dyn { d: 42, x: 0 }]);
//! ```

use crate::config::CutoutOffsets;

// ============================================================================
// Timing
// ============================================================================

/// Earliest cutout start after the end bit [µs].
pub const TCS_MIN: u16 = 26;

/// Channel 1 start [µs].
pub const TTS1: u16 = 80;

/// Channel 1 end [µs].
pub const TTC1: u16 = 177;

/// Channel 2 start [µs].
pub const TTS2: u16 = 193;

/// Earliest cutout end [µs].
pub const TCE_MIN: u16 = 454;

/// Which channels of a cutout saw data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CutoutFlags(u8);

impl CutoutFlags {
    /// Creates flags.
    pub const fn new(ch1: bool, ch2: bool) -> Self {
        Self((ch2 as u8) << 1 | ch1 as u8)
    }

    /// Decodes the raw notification value.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b11)
    }

    /// Raw notification value.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Channel 1 received bytes.
    pub const fn ch1(self) -> bool {
        self.0 & 0b01 != 0
    }

    /// Channel 2 may have received bytes.
    pub const fn ch2(self) -> bool {
        self.0 & 0b10 != 0
    }
}

/// Actions the cutout ISR has to perform after one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CutoutStep {
    /// Load this value into the timer counter.
    pub set_count: Option<u16>,
    /// Next alarm, `None` disables the alarm.
    pub alarm: Option<u16>,
    /// Drive the BiDi-enable line.
    pub bidi_en: Option<bool>,
    /// Wake the driver task with these flags.
    pub notify: Option<CutoutFlags>,
}

/// Cutout state machine run from the transmit-done and timer interrupts.
///
/// The phase is derived from the alarm value that fired:
///
/// 1. transmit done: counter to 0, alarm at `TCS_MIN + offsets.tcs`
/// 2. TCS: counter to `TCS_MIN`, BiDi-enable high, alarm at `TTC1`
/// 3. TS2: sample whether channel 1 received data, alarm at `TCE_MIN`
/// 4. TCE: BiDi-enable low, notify the task, alarm off
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cutout {
    tcs: u16,
    ch1: bool,
}

impl Cutout {
    /// Creates the machine for the given latency offsets.
    pub const fn new(offsets: CutoutOffsets) -> Self {
        Self {
            tcs: TCS_MIN + offsets.tcs as u16,
            ch1: false,
        }
    }

    /// Alarm value of the cutout start.
    pub const fn tcs_alarm(&self) -> u16 {
        self.tcs
    }

    /// The RMT channel finished a packet.
    pub fn on_tx_done(&mut self) -> CutoutStep {
        CutoutStep {
            set_count: Some(0),
            alarm: Some(self.tcs),
            ..Default::default()
        }
    }

    /// The timer alarm `alarm_value` fired, `rx_fifo_len` bytes are waiting.
    pub fn on_alarm(&mut self, alarm_value: u16, rx_fifo_len: usize) -> CutoutStep {
        if alarm_value < TTS1 {
            CutoutStep {
                set_count: Some(TCS_MIN),
                alarm: Some(TTC1),
                bidi_en: Some(true),
                notify: None,
            }
        } else if alarm_value < TTS2 {
            self.ch1 = rx_fifo_len != 0;
            CutoutStep {
                alarm: Some(TCE_MIN),
                ..Default::default()
            }
        } else {
            CutoutStep {
                set_count: None,
                alarm: None,
                bidi_en: Some(false),
                notify: Some(CutoutFlags::new(self.ch1, true)),
            }
        }
    }
}

// ============================================================================
// Datagram
// ============================================================================

/// Bytes of channel 1.
pub const CHANNEL1_SIZE: usize = 2;

/// Bytes of channel 2.
pub const CHANNEL2_SIZE: usize = 6;

/// Raw bytes of one cutout, unreceived bytes stay zero.
pub type Datagram = [u8; CHANNEL1_SIZE + CHANNEL2_SIZE];

/// One 4-of-8 symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Symbol {
    /// Six data bits.
    Value(u8),
    /// Acknowledge.
    Ack,
    /// Not acknowledged.
    Nack,
    /// Decoder busy.
    Busy,
    /// Not a 4-of-8 code.
    Invalid,
}

/// 4-of-8 codes indexed by their 6 bit value.
pub const ENCODE: [u8; 64] = [
    0xAC, 0xAA, 0xA9, 0xA5, 0xA3, 0xA6, 0x9C, 0x9A, //
    0x99, 0x95, 0x93, 0x96, 0x8E, 0x8D, 0x8B, 0xB1, //
    0xB2, 0xB4, 0xB8, 0x74, 0x72, 0x6C, 0x6A, 0x69, //
    0x65, 0x63, 0x66, 0x5C, 0x5A, 0x59, 0x55, 0x53, //
    0x56, 0x4E, 0x4D, 0x4B, 0x47, 0x71, 0xE8, 0xE4, //
    0xE2, 0xD1, 0xC9, 0xC5, 0xD8, 0xD4, 0xD2, 0xCA, //
    0xC6, 0xCC, 0x78, 0x17, 0x1B, 0x1D, 0x1E, 0x2E, //
    0x36, 0x3A, 0x27, 0x2B, 0x2D, 0x35, 0x39, 0x33, //
];

/// ACK codes.
pub const ACK: [u8; 2] = [0x0F, 0xF0];

/// NACK code.
pub const NACK: u8 = 0x3C;

/// BUSY code.
pub const BUSY: u8 = 0xE1;

const INVALID: u8 = 0xFF;
const ACK_CODE: u8 = 0x40;
const NACK_CODE: u8 = 0x41;
const BUSY_CODE: u8 = 0x42;

const DECODE: [u8; 256] = {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < ENCODE.len() {
        table[ENCODE[i] as usize] = i as u8;
        i += 1;
    }
    table[ACK[0] as usize] = ACK_CODE;
    table[ACK[1] as usize] = ACK_CODE;
    table[NACK as usize] = NACK_CODE;
    table[BUSY as usize] = BUSY_CODE;
    table
};

/// Encodes 6 bits.
pub const fn encode_symbol(value: u8) -> u8 {
    ENCODE[(value & 0x3F) as usize]
}

/// Decodes one received byte.
pub const fn decode_symbol(byte: u8) -> Symbol {
    match DECODE[byte as usize] {
        INVALID => Symbol::Invalid,
        ACK_CODE => Symbol::Ack,
        NACK_CODE => Symbol::Nack,
        BUSY_CODE => Symbol::Busy,
        value => Symbol::Value(value),
    }
}

// ============================================================================
// Apps
// ============================================================================

/// Application ids.
pub mod app {
    /// POM read result.
    pub const POM: u8 = 0;
    /// Address high part.
    pub const ADR_HIGH: u8 = 1;
    /// Address low part.
    pub const ADR_LOW: u8 = 2;
    /// Location information.
    pub const EXT: u8 = 3;
    /// Dynamic decoder state.
    pub const DYN: u8 = 7;
    /// Extended POM, ids 8 to 11.
    pub const XPOM: u8 = 8;
    /// Automatic CV broadcast.
    pub const CV_AUTO: u8 = 12;
    /// Block data.
    pub const BLOCK: u8 = 13;
    /// Time until the decoder answers.
    pub const ZEIT: u8 = 14;

    /// Symbols occupied by an app, `None` for unknown ids.
    pub const fn symbols(id: u8) -> Option<usize> {
        match id {
            POM | ADR_HIGH | ADR_LOW | ZEIT => Some(2),
            EXT | DYN => Some(3),
            8..=11 | CV_AUTO | BLOCK => Some(6),
            _ => None,
        }
    }
}

/// `dyn` subindex: speed up to 255.
pub const DYN_SPEED1: u8 = 0;
/// `dyn` subindex: speed from 256 (value is speed - 256).
pub const DYN_SPEED2: u8 = 1;
/// `dyn` subindex: quality of service.
pub const DYN_QOS: u8 = 7;

/// One decoded message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum App {
    /// CV value of a POM read.
    Pom(u8),
    /// Address high part.
    AdrHigh(u8),
    /// Address low part.
    AdrLow(u8),
    /// Location information, 14 raw bits.
    Ext(u16),
    /// Dynamic value `d` with subindex `x`.
    Dyn {
        /// Value.
        d: u8,
        /// Subindex.
        x: u8,
    },
    /// Extended POM with sequence number.
    Xpom {
        /// Sequence number (low bits of the id).
        ss: u8,
        /// Four CV values.
        bytes: [u8; 4],
    },
    /// Automatic CV broadcast, 32 raw bits.
    CvAuto(u32),
    /// Block data, 32 raw bits.
    Block(u32),
    /// Time until the decoder answers.
    Zeit(u8),
    /// ACK symbol.
    Ack,
    /// NACK symbol.
    Nack,
    /// BUSY symbol.
    Busy,
}

impl App {
    fn from_bits(id: u8, payload: u32) -> Option<Self> {
        Some(match id {
            app::POM => Self::Pom(payload as u8),
            app::ADR_HIGH => Self::AdrHigh(payload as u8),
            app::ADR_LOW => Self::AdrLow(payload as u8),
            app::EXT => Self::Ext(payload as u16 & 0x3FFF),
            app::DYN => Self::Dyn {
                d: (payload >> 6) as u8,
                x: payload as u8 & 0x3F,
            },
            8..=11 => Self::Xpom {
                ss: id & 0b11,
                bytes: payload.to_be_bytes(),
            },
            app::CV_AUTO => Self::CvAuto(payload),
            app::BLOCK => Self::Block(payload),
            app::ZEIT => Self::Zeit(payload as u8),
            _ => return None,
        })
    }
}

// ============================================================================
// Dissector
// ============================================================================

/// Splits a datagram into apps.
///
/// A channel 2 byte which is neither zero (not received) nor a valid symbol
/// discards the whole datagram. Channel 1 is shared by all decoders on the
/// track, so collisions there only discard channel 1.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Dissector {
    channel1: Option<App>,
    channel2: heapless::Vec<App, CHANNEL2_SIZE>,
}

impl Dissector {
    /// Validates and decodes `datagram`, `None` if it has to be discarded.
    pub fn new(datagram: &Datagram) -> Option<Self> {
        let (ch1, ch2) = datagram.split_at(CHANNEL1_SIZE);

        let mut symbols = heapless::Vec::<Symbol, CHANNEL2_SIZE>::new();
        for &byte in ch2.iter().take_while(|&&b| b != 0) {
            match decode_symbol(byte) {
                Symbol::Invalid => return None,
                symbol => {
                    let _ = symbols.push(symbol);
                }
            }
        }
        if ch2[symbols.len()..].iter().any(|&b| b != 0) {
            return None;
        }

        Some(Self {
            channel1: Self::dissect_channel1(ch1),
            channel2: Self::dissect(&symbols),
        })
    }

    /// Address information of channel 1.
    pub fn channel1(&self) -> Option<App> {
        self.channel1
    }

    /// Apps of channel 2.
    pub fn channel2(&self) -> &[App] {
        &self.channel2
    }

    /// True if neither channel carried anything.
    pub fn is_empty(&self) -> bool {
        self.channel1.is_none() && self.channel2.is_empty()
    }

    fn dissect_channel1(ch1: &[u8]) -> Option<App> {
        match (decode_symbol(ch1[0]), decode_symbol(ch1[1])) {
            (Symbol::Value(a), Symbol::Value(b)) => {
                let bits = (a as u32) << 6 | b as u32;
                match (bits >> 8) as u8 {
                    id @ (app::ADR_HIGH | app::ADR_LOW) => App::from_bits(id, bits & 0xFF),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn dissect(symbols: &[Symbol]) -> heapless::Vec<App, CHANNEL2_SIZE> {
        let mut apps = heapless::Vec::new();
        let mut i = 0;
        while i < symbols.len() {
            let app = match symbols[i] {
                Symbol::Ack => Some((App::Ack, 1)),
                Symbol::Nack => Some((App::Nack, 1)),
                Symbol::Busy => Some((App::Busy, 1)),
                Symbol::Value(v) => Self::dissect_app(v >> 2, &symbols[i..]),
                Symbol::Invalid => None,
            };
            let Some((app, len)) = app else {
                break;
            };
            let _ = apps.push(app);
            i += len;
        }
        apps
    }

    fn dissect_app(id: u8, symbols: &[Symbol]) -> Option<(App, usize)> {
        let len = app::symbols(id)?;
        if symbols.len() < len {
            return None;
        }
        let mut bits = 0u64;
        for symbol in &symbols[..len] {
            match *symbol {
                Symbol::Value(v) => bits = bits << 6 | v as u64,
                _ => return None,
            }
        }
        let payload_bits = len * 6 - 4;
        let payload = (bits & ((1u64 << payload_bits) - 1)) as u32;
        App::from_bits(id, payload).map(|app| (app, len))
    }
}
