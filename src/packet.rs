//! Track packets and DCC packet builders.
//!
//! A [`Packet`] is the byte frame a driver hands to its symbol encoder. DCC
//! packets carry their XOR checksum as last byte; DECUP and MDU frames are
//! passed through unchanged.
//!
//! # DCC Instruction Layout
//!
//! | Builder | Instruction bytes |
//! |---------|-------------------|
//! | [`make_idle_packet`] | `FF 00 FF` |
//! | [`make_reset_packet`] | `00 00 00` |
//! | [`make_speed_and_direction_packet`] | `01RG GGGG` |
//! | [`make_advanced_operations_speed_packet`] | `0011 1111`, `RSSS SSSS` |
//! | [`make_function_group_f4_f0_packet`] | `100D DDDD` |
//! | [`make_function_group_f8_f5_packet`] | `1011 DDDD` |
//! | [`make_function_group_f12_f9_packet`] | `1010 DDDD` |
//! | [`make_feature_expansion_f20_f13_packet`] | `1101 1110`, `DDDD DDDD` |
//! | [`make_feature_expansion_f28_f21_packet`] | `1101 1111`, `DDDD DDDD` |
//! | [`make_cv_access_long_verify_packet`] | `1110 01VV`, `VVVV VVVV`, `DDDD DDDD` |
//! | [`make_cv_access_long_write_packet`] | `1110 11VV`, `VVVV VVVV`, `DDDD DDDD` |
//!
//! Service mode packets omit the address and use `0111 KKVV` instead.
//!
//! # Example
//!
//! ```rust
//! use zimo_track::packet::{make_function_group_f4_f0_packet, Address};
//!
//! let packet = make_function_group_f4_f0_packet(Address::basic_loco(3), 0b0_0011);
//! // F0 and F1 on
//! assert_eq!(packet.as_slice(), &[0x03, 0b1001_0001, 0x03 ^ 0b1001_0001]);
//! ```

use core::ops::Deref;

/// Largest frame any protocol transmits (MDU/DECUP data blocks included).
pub const MAX_PACKET_SIZE: usize = 264;

/// Largest DCC packet including checksum.
pub const DCC_MAX_PACKET_SIZE: usize = 18;

/// Highest loco address the long form can carry (first byte 0xE7).
pub const MAX_LOCO_ADDRESS: u16 = 10239;

/// One frame to transmit.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Packet(heapless::Vec<u8, MAX_PACKET_SIZE>);

impl Packet {
    /// Creates an empty packet.
    pub const fn new() -> Self {
        Self(heapless::Vec::new())
    }

    /// Copies `bytes` into a packet, `None` if it exceeds [`MAX_PACKET_SIZE`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        heapless::Vec::from_slice(bytes).ok().map(Self)
    }

    /// Appends a byte.
    #[must_use]
    pub fn push(&mut self, byte: u8) -> bool {
        self.0.push(byte).is_ok()
    }

    /// Bytes of the packet.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Total number of one bits in the packet.
    pub fn count_ones(&self) -> u32 {
        self.0.iter().map(|b| b.count_ones()).sum()
    }
}

impl Deref for Packet {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Packet{:02X?}", self.as_slice())
    }
}

// ============================================================================
// Addresses
// ============================================================================

/// Kind of decoder address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// Address 0, every decoder listens.
    Broadcast,
    /// 7 bit loco address (1..=127).
    BasicLoco,
    /// 14 bit loco address.
    ExtendedLoco,
    /// 9 bit accessory address.
    BasicAccessory,
    /// 11 bit accessory address.
    ExtendedAccessory,
    /// Idle packet.
    Idle,
    /// Reserved address range.
    Unknown,
}

/// Decoder address as it appears on the rails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    /// Numeric address.
    pub value: u16,
    /// Address kind.
    pub kind: AddressKind,
}

impl Address {
    /// Broadcast address.
    pub const BROADCAST: Address = Address {
        value: 0,
        kind: AddressKind::Broadcast,
    };

    /// 7 bit loco address.
    pub const fn basic_loco(value: u16) -> Self {
        Self {
            value,
            kind: AddressKind::BasicLoco,
        }
    }

    /// 14 bit loco address.
    pub const fn extended_loco(value: u16) -> Self {
        Self {
            value,
            kind: AddressKind::ExtendedLoco,
        }
    }

    /// Picks short or long form for a loco address.
    ///
    /// Short form is used up to 99, or up to 127 if `short_127` is set.
    /// Returns `None` above [`MAX_LOCO_ADDRESS`], those first bytes belong to
    /// reserved and special address ranges.
    pub const fn loco(value: u16, short_127: bool) -> Option<Self> {
        let limit = if short_127 { 127 } else { 99 };
        if value == 0 {
            Some(Self::BROADCAST)
        } else if value <= limit {
            Some(Self::basic_loco(value))
        } else if value <= MAX_LOCO_ADDRESS {
            Some(Self::extended_loco(value))
        } else {
            None
        }
    }

    /// True for short or long loco addresses.
    pub const fn is_loco(&self) -> bool {
        matches!(self.kind, AddressKind::BasicLoco | AddressKind::ExtendedLoco)
    }

    /// Number of address bytes this address occupies in a packet.
    pub const fn len(&self) -> usize {
        match self.kind {
            AddressKind::ExtendedLoco
            | AddressKind::BasicAccessory
            | AddressKind::ExtendedAccessory => 2,
            _ => 1,
        }
    }
}

// ============================================================================
// Builders
// ============================================================================

struct Builder {
    packet: Packet,
    xor: u8,
}

impl Builder {
    fn new() -> Self {
        Self {
            packet: Packet::new(),
            xor: 0,
        }
    }

    fn with_address(addr: Address) -> Self {
        let mut builder = Self::new();
        match addr.kind {
            AddressKind::ExtendedLoco => {
                builder.byte(0b1100_0000 | ((addr.value >> 8) as u8 & 0b0011_1111));
                builder.byte(addr.value as u8);
            }
            _ => {
                builder.byte(addr.value as u8);
            }
        }
        builder
    }

    fn byte(&mut self, byte: u8) -> &mut Self {
        // Builders never exceed DCC_MAX_PACKET_SIZE
        let _ = self.packet.push(byte);
        self.xor ^= byte;
        self
    }

    fn finish(&mut self) -> Packet {
        let xor = self.xor;
        let _ = self.packet.push(xor);
        core::mem::take(&mut self.packet)
    }
}

/// Idle packet.
pub fn make_idle_packet() -> Packet {
    Builder::new().byte(0xFF).byte(0x00).finish()
}

/// Digital decoder reset packet.
pub fn make_reset_packet() -> Packet {
    Builder::new().byte(0x00).byte(0x00).finish()
}

/// 14 or 28 speed step packet, `ddddd` is `0b0RGG_GGGG` without the instruction bits.
pub fn make_speed_and_direction_packet(addr: Address, ddddd: u8) -> Packet {
    Builder::with_address(addr)
        .byte(0b0100_0000 | (ddddd & 0b0011_1111))
        .finish()
}

/// 128 speed step packet.
pub fn make_advanced_operations_speed_packet(addr: Address, rvvvvvvv: u8) -> Packet {
    Builder::with_address(addr)
        .byte(0b0011_1111)
        .byte(rvvvvvvv)
        .finish()
}

/// F0..F4, `state` bit 0 is F0.
pub fn make_function_group_f4_f0_packet(addr: Address, state: u8) -> Packet {
    Builder::with_address(addr)
        .byte(0b1000_0000 | (state & 0b1) << 4 | (state >> 1 & 0b1111))
        .finish()
}

/// F5..F8, `state` bit 0 is F5.
pub fn make_function_group_f8_f5_packet(addr: Address, state: u8) -> Packet {
    Builder::with_address(addr)
        .byte(0b1011_0000 | (state & 0b1111))
        .finish()
}

/// F9..F12, `state` bit 0 is F9.
pub fn make_function_group_f12_f9_packet(addr: Address, state: u8) -> Packet {
    Builder::with_address(addr)
        .byte(0b1010_0000 | (state & 0b1111))
        .finish()
}

/// F13..F20, `state` bit 0 is F13.
pub fn make_feature_expansion_f20_f13_packet(addr: Address, state: u8) -> Packet {
    Builder::with_address(addr)
        .byte(0b1101_1110)
        .byte(state)
        .finish()
}

/// F21..F28, `state` bit 0 is F21.
pub fn make_feature_expansion_f28_f21_packet(addr: Address, state: u8) -> Packet {
    Builder::with_address(addr)
        .byte(0b1101_1111)
        .byte(state)
        .finish()
}

/// Programming on main: verify byte (read request, answered via BiDi).
pub fn make_cv_access_long_verify_packet(addr: Address, cv_addr: u16) -> Packet {
    Builder::with_address(addr)
        .byte(0b1110_0100 | (cv_addr >> 8 & 0b11) as u8)
        .byte(cv_addr as u8)
        .byte(0)
        .finish()
}

/// Programming on main: write byte.
pub fn make_cv_access_long_write_packet(addr: Address, cv_addr: u16, byte: u8) -> Packet {
    Builder::with_address(addr)
        .byte(0b1110_1100 | (cv_addr >> 8 & 0b11) as u8)
        .byte(cv_addr as u8)
        .byte(byte)
        .finish()
}

/// Service mode: verify byte.
pub fn make_cv_access_long_verify_service_packet(cv_addr: u16, byte: u8) -> Packet {
    Builder::new()
        .byte(0b0111_0100 | (cv_addr >> 8 & 0b11) as u8)
        .byte(cv_addr as u8)
        .byte(byte)
        .finish()
}

/// Service mode: verify a single bit at `position` (0..=7) against `bit`.
pub fn make_cv_access_long_verify_service_bit_packet(
    cv_addr: u16,
    bit: bool,
    position: u8,
) -> Packet {
    Builder::new()
        .byte(0b0111_1000 | (cv_addr >> 8 & 0b11) as u8)
        .byte(cv_addr as u8)
        .byte(0b1110_0000 | (bit as u8) << 3 | (position & 0b111))
        .finish()
}

/// Service mode: write byte.
pub fn make_cv_access_long_write_service_packet(cv_addr: u16, byte: u8) -> Packet {
    Builder::new()
        .byte(0b0111_1100 | (cv_addr >> 8 & 0b11) as u8)
        .byte(cv_addr as u8)
        .byte(byte)
        .finish()
}

// ============================================================================
// Decoding
// ============================================================================

/// Instruction class of an operations mode packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// Decoder and consist control.
    DecoderControl,
    /// Advanced operations (128 speed steps, ...).
    AdvancedOperations,
    /// 14/28 speed step speed and direction.
    SpeedDirection,
    /// Function groups one and two.
    FunctionGroup,
    /// Feature expansion (binary states, F13+).
    FeatureExpansion,
    /// CV access, long form.
    CvLong,
    /// CV access, short form.
    CvShort,
    /// Idle, reset or anything without instruction.
    Unknown,
}

/// Decodes the address a packet is sent to.
pub fn decode_address(packet: &[u8]) -> Address {
    let Some(&first) = packet.first() else {
        return Address {
            value: 0,
            kind: AddressKind::Unknown,
        };
    };
    let second = packet.get(1).copied().unwrap_or(0);
    match first {
        0 => Address::BROADCAST,
        1..=127 => Address::basic_loco(first as u16),
        128..=191 => Address {
            value: ((first & 0b0011_1111) as u16) | ((!second as u16 & 0b0111_0000) << 2),
            kind: AddressKind::BasicAccessory,
        },
        192..=231 => Address::extended_loco(((first & 0b0011_1111) as u16) << 8 | second as u16),
        255 => Address {
            value: 255,
            kind: AddressKind::Idle,
        },
        _ => Address {
            value: first as u16,
            kind: AddressKind::Unknown,
        },
    }
}

/// Decodes the instruction class following the address bytes.
pub fn decode_instruction(packet: &[u8]) -> Instruction {
    let addr = decode_address(packet);
    if !matches!(
        addr.kind,
        AddressKind::Broadcast | AddressKind::BasicLoco | AddressKind::ExtendedLoco
    ) {
        return Instruction::Unknown;
    }
    let Some(&instr) = packet.get(addr.len()) else {
        return Instruction::Unknown;
    };
    match instr >> 5 {
        0b000 => Instruction::DecoderControl,
        0b001 => Instruction::AdvancedOperations,
        0b010 | 0b011 => Instruction::SpeedDirection,
        0b100 | 0b101 => Instruction::FunctionGroup,
        0b110 => Instruction::FeatureExpansion,
        _ if instr & 0b0001_0000 == 0 => Instruction::CvLong,
        _ => Instruction::CvShort,
    }
}

/// CV address of a long form CV access packet (operations mode).
pub fn decode_cv_address(packet: &[u8]) -> Option<u16> {
    if decode_instruction(packet) != Instruction::CvLong {
        return None;
    }
    let off = decode_address(packet).len();
    let high = *packet.get(off)? as u16 & 0b11;
    let low = *packet.get(off + 1)? as u16;
    Some(high << 8 | low)
}

/// True if the checksum (last byte) matches.
pub fn checksum_ok(packet: &[u8]) -> bool {
    packet.len() >= 2 && packet.iter().fold(0u8, |acc, b| acc ^ b) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Builder Tests
    // =========================================================================

    #[test]
    fn idle_and_reset() {
        assert_eq!(make_idle_packet().as_slice(), &[0xFF, 0x00, 0xFF]);
        assert_eq!(make_reset_packet().as_slice(), &[0x00, 0x00, 0x00]);
    }

    #[test]
    fn extended_address_bytes() {
        let packet = make_advanced_operations_speed_packet(Address::extended_loco(1234), 0x80);
        assert_eq!(&packet[..2], &[0b1100_0100, 0xD2]);
        assert_eq!(packet[2], 0b0011_1111);
        assert_eq!(packet[3], 0x80);
        assert!(checksum_ok(&packet));
    }

    #[test]
    fn loco_address_selection() {
        let kind = |value, short_127| Address::loco(value, short_127).map(|a| a.kind);
        assert_eq!(kind(99, false), Some(AddressKind::BasicLoco));
        assert_eq!(kind(100, false), Some(AddressKind::ExtendedLoco));
        assert_eq!(kind(127, true), Some(AddressKind::BasicLoco));
        assert_eq!(kind(128, true), Some(AddressKind::ExtendedLoco));
        assert_eq!(Address::loco(0, true), Some(Address::BROADCAST));
    }

    #[test]
    fn long_addresses_end_below_reserved_range() {
        let highest = Address::loco(MAX_LOCO_ADDRESS, false).unwrap();
        let packet = make_advanced_operations_speed_packet(highest, 0x80);
        assert_eq!(&packet[..2], &[0xE7, 0xFF]);
        assert_eq!(decode_address(&packet), highest);

        assert_eq!(Address::loco(MAX_LOCO_ADDRESS + 1, false), None);
        assert_eq!(Address::loco(u16::MAX, true), None);
    }

    #[test]
    fn speed_and_direction_masks_instruction_bits() {
        let packet = make_speed_and_direction_packet(Address::basic_loco(3), 0b1111_1111);
        assert_eq!(packet[1], 0b0111_1111);
    }

    #[test]
    fn function_groups() {
        let addr = Address::basic_loco(10);
        assert_eq!(make_function_group_f8_f5_packet(addr, 0b0101)[1], 0b1011_0101);
        assert_eq!(make_function_group_f12_f9_packet(addr, 0b1000)[1], 0b1010_1000);
        assert_eq!(
            make_feature_expansion_f20_f13_packet(addr, 0xA5).as_slice()[1..3],
            [0xDE, 0xA5]
        );
        assert_eq!(
            make_feature_expansion_f28_f21_packet(addr, 0x5A).as_slice()[1..3],
            [0xDF, 0x5A]
        );
    }

    #[test]
    fn service_packets() {
        let packet = make_cv_access_long_verify_service_packet(0x301, 42);
        assert_eq!(packet.as_slice(), &[0b0111_0111, 0x01, 42, 0b0111_0111 ^ 0x01 ^ 42]);

        let packet = make_cv_access_long_write_service_packet(7, 8);
        assert_eq!(&packet[..3], &[0b0111_1100, 7, 8]);

        let packet = make_cv_access_long_verify_service_bit_packet(0, true, 5);
        assert_eq!(&packet[..3], &[0b0111_1000, 0, 0b1110_1101]);
    }

    // =========================================================================
    // Decoding Tests
    // =========================================================================

    #[test]
    fn decode_loco_addresses() {
        let short = make_idle_packet();
        assert_eq!(decode_address(&short).kind, AddressKind::Idle);

        let packet = make_speed_and_direction_packet(Address::basic_loco(3), 0);
        assert_eq!(decode_address(&packet), Address::basic_loco(3));

        let packet = make_speed_and_direction_packet(Address::extended_loco(10239), 0);
        assert_eq!(decode_address(&packet), Address::extended_loco(10239));
    }

    #[test]
    fn decode_instruction_classes() {
        let addr = Address::extended_loco(128);
        assert_eq!(
            decode_instruction(&make_advanced_operations_speed_packet(addr, 0)),
            Instruction::AdvancedOperations
        );
        assert_eq!(
            decode_instruction(&make_function_group_f4_f0_packet(addr, 0)),
            Instruction::FunctionGroup
        );
        assert_eq!(
            decode_instruction(&make_feature_expansion_f20_f13_packet(addr, 0)),
            Instruction::FeatureExpansion
        );
        assert_eq!(
            decode_instruction(&make_cv_access_long_verify_packet(addr, 7)),
            Instruction::CvLong
        );
        assert_eq!(decode_instruction(&make_idle_packet()), Instruction::Unknown);
    }

    #[test]
    fn decode_pom_cv_address() {
        let packet = make_cv_access_long_write_packet(Address::basic_loco(3), 0x2FF, 1);
        assert_eq!(decode_cv_address(&packet), Some(0x2FF));

        let packet = make_cv_access_long_verify_packet(Address::extended_loco(1000), 28);
        assert_eq!(decode_cv_address(&packet), Some(28));

        let packet = make_function_group_f4_f0_packet(Address::basic_loco(3), 0);
        assert_eq!(decode_cv_address(&packet), None);
    }

    #[test]
    fn packet_capacity() {
        assert!(Packet::from_slice(&[0u8; MAX_PACKET_SIZE]).is_some());
        assert!(Packet::from_slice(&[0u8; MAX_PACKET_SIZE + 1]).is_none());
    }
}
