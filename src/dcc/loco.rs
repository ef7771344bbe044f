//! Locomotive state.
//!
//! A [`Loco`] is composed of the persisted [`NvLocoBase`] (name, protocol,
//! speed steps), the volatile drive state (direction/speed byte, function
//! mask, scheduling priority) and the latest RailCom feedback in
//! [`BiDiState`].
//!
//! # JSON documents
//!
//! The loco store keeps one JSON document per address:
//!
//! ```json
//! {"name":"Reihe 2190","mode":0,"speed_steps":4,"rvvvvvvv":170,"f31_0":10}
//! ```
//!
//! Priority and RailCom state are not persisted. Reading a document only
//! updates the fields it contains, so front-ends can send partial updates.

use alloc::string::String;

use crate::packet::{
    make_advanced_operations_speed_packet, make_feature_expansion_f20_f13_packet,
    make_feature_expansion_f28_f21_packet, make_function_group_f12_f9_packet,
    make_function_group_f4_f0_packet, make_function_group_f8_f5_packet,
    make_speed_and_direction_packet, Address, Packet,
};

/// Number of bits of the scheduling priority.
pub const PRIORITY_BITS: u32 = 5;

/// Protocol of a loco.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize), serde(into = "u8"))]
#[repr(u8)]
pub enum Mode {
    /// DCC.
    #[default]
    Dcc = 0,
    /// Motorola, not supported on this track output.
    Mm = 1,
}

impl From<Mode> for u8 {
    fn from(mode: Mode) -> u8 {
        mode as u8
    }
}

impl Mode {
    /// Decodes a stored value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dcc),
            1 => Some(Self::Mm),
            _ => None,
        }
    }
}

/// Speed step mode, values as used by Z21 clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize), serde(into = "u8"))]
#[repr(u8)]
pub enum SpeedSteps {
    /// 14 speed steps.
    Dcc14 = 0,
    /// 28 speed steps.
    Dcc28 = 2,
    /// 128 speed steps.
    #[default]
    Dcc128 = 4,
}

impl From<SpeedSteps> for u8 {
    fn from(steps: SpeedSteps) -> u8 {
        steps as u8
    }
}

impl SpeedSteps {
    /// Decodes a stored value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dcc14),
            2 => Some(Self::Dcc28),
            4 => Some(Self::Dcc128),
            _ => None,
        }
    }
}

/// RailCom option flags.
pub struct RailComOptions;

impl RailComOptions {
    /// `speed` holds a speed up to 255.
    pub const SPEED1: u8 = 0x01;
    /// `speed` holds a speed from 256 (minus 256).
    pub const SPEED2: u8 = 0x02;
    /// `qos` is valid.
    pub const QOS: u8 = 0x04;
}

/// Latest RailCom feedback of a loco.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BiDiState {
    /// [`RailComOptions`] flags.
    pub options: u8,
    /// Speed reported by the decoder.
    pub speed: u8,
    /// Quality of service.
    pub qos: u8,
}

/// RailCom data of one address as broadcast to front-ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RailComData {
    /// Loco address.
    pub loco_address: u16,
    /// [`RailComOptions`] flags.
    pub options: u8,
    /// Speed reported by the decoder.
    pub speed: u8,
    /// Quality of service.
    pub qos: u8,
}

impl RailComData {
    /// Combines an address and its feedback.
    pub fn new(loco_address: u16, bidi: &BiDiState) -> Self {
        Self {
            loco_address,
            options: bidi.options,
            speed: bidi.speed,
            qos: bidi.qos,
        }
    }
}

/// Persisted part of a loco.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct NvLocoBase {
    /// Display name.
    pub name: String,
    /// Protocol.
    pub mode: Mode,
    /// Speed step mode.
    pub speed_steps: SpeedSteps,
}

/// Complete loco state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Loco {
    /// Persisted base.
    pub base: NvLocoBase,
    /// Direction (bit 7) and speed in Z21 format.
    pub rvvvvvvv: u8,
    /// Function states, bit 0 is F0.
    pub f31_0: u32,
    /// Scheduling priority, 1 is served most often.
    pub priority: u8,
    /// RailCom feedback.
    pub bidi: BiDiState,
}

impl Default for Loco {
    fn default() -> Self {
        Self {
            base: NvLocoBase::default(),
            rvvvvvvv: 0x80,
            f31_0: 0,
            priority: Self::MIN_PRIORITY,
            bidi: BiDiState::default(),
        }
    }
}

impl Loco {
    /// Lowest priority value (served every cycle).
    pub const MIN_PRIORITY: u8 = 1;

    /// Highest priority value.
    pub const MAX_PRIORITY: u8 = ((1u32 << PRIORITY_BITS) - 1) as u8;

    /// Loco with the given name and defaults otherwise.
    pub fn named(name: impl Into<String>) -> Self {
        let mut loco = Self::default();
        loco.base.name = name.into();
        loco
    }

    /// Speed packet matching the speed step mode.
    pub fn speed_packet(&self, addr: Address) -> Packet {
        let r = self.rvvvvvvv & 0x80;
        match self.base.speed_steps {
            SpeedSteps::Dcc14 => {
                let f0 = (self.f31_0 & 0b1) as u8;
                make_speed_and_direction_packet(
                    addr,
                    r >> 2 | f0 << 4 | (self.rvvvvvvv & 0x0F),
                )
            }
            SpeedSteps::Dcc28 => {
                make_speed_and_direction_packet(addr, r >> 2 | (self.rvvvvvvv & 0x1F))
            }
            SpeedSteps::Dcc128 => make_advanced_operations_speed_packet(addr, self.rvvvvvvv),
        }
    }

    /// Function group packets F0 to F12, plus F13 to F28 if `hfx`.
    pub fn function_packets(&self, addr: Address, hfx: bool) -> heapless::Vec<Packet, 5> {
        let f = self.f31_0;
        let mut packets = heapless::Vec::new();
        let _ = packets.push(make_function_group_f4_f0_packet(addr, (f & 0x1F) as u8));
        let _ = packets.push(make_function_group_f8_f5_packet(addr, (f >> 5 & 0xF) as u8));
        let _ = packets.push(make_function_group_f12_f9_packet(addr, (f >> 9 & 0xF) as u8));
        if hfx {
            let _ = packets.push(make_feature_expansion_f20_f13_packet(addr, (f >> 13) as u8));
            let _ = packets.push(make_feature_expansion_f28_f21_packet(addr, (f >> 21) as u8));
        }
        packets
    }

    /// Raises the priority by one, saturating at [`Self::MAX_PRIORITY`].
    pub fn age(&mut self) {
        self.priority = (self.priority + 1).clamp(Self::MIN_PRIORITY, Self::MAX_PRIORITY);
    }

    /// RailCom data for `addr`.
    pub fn rail_com_data(&self, addr: u16) -> RailComData {
        RailComData::new(addr, &self.bidi)
    }
}

// ============================================================================
// JSON
// ============================================================================

#[cfg(feature = "json")]
mod json {
    use super::*;
    use crate::error::Result;
    use alloc::string::ToString;
    use serde_json::Value;

    #[derive(serde::Serialize)]
    struct BaseDocument<'a> {
        name: &'a str,
        mode: Mode,
        speed_steps: SpeedSteps,
    }

    #[derive(serde::Serialize)]
    struct LocoDocument<'a> {
        name: &'a str,
        mode: Mode,
        speed_steps: SpeedSteps,
        rvvvvvvv: u8,
        f31_0: u32,
    }

    fn as_u8(value: &Value) -> Option<u8> {
        value.as_u64().and_then(|v| u8::try_from(v).ok())
    }

    impl NvLocoBase {
        /// Serializes the base.
        pub fn to_json(&self) -> Result<String> {
            Ok(serde_json::to_string(&BaseDocument {
                name: &self.name,
                mode: self.mode,
                speed_steps: self.speed_steps,
            })?)
        }

        /// Updates the fields present in `json`.
        pub fn update_from_json(&mut self, json: &str) -> Result<()> {
            self.apply(&serde_json::from_str(json)?);
            Ok(())
        }

        /// Parses a base, absent fields keep their defaults.
        pub fn from_json(json: &str) -> Result<Self> {
            let mut base = Self::default();
            base.update_from_json(json)?;
            Ok(base)
        }

        pub(super) fn apply(&mut self, doc: &Value) {
            if let Some(name) = doc.get("name").and_then(Value::as_str) {
                self.name = name.to_string();
            }
            if let Some(mode) = doc.get("mode").and_then(as_u8) {
                if Mode::from_u8(mode) != Some(Mode::Dcc) {
                    log::error!("Can't set mode to anything but DCC");
                }
            }
            if let Some(steps) = doc
                .get("speed_steps")
                .and_then(as_u8)
                .and_then(SpeedSteps::from_u8)
            {
                self.speed_steps = steps;
            }
        }
    }

    impl Loco {
        /// Serializes the persisted fields.
        pub fn to_json(&self) -> Result<String> {
            Ok(serde_json::to_string(&LocoDocument {
                name: &self.base.name,
                mode: self.base.mode,
                speed_steps: self.base.speed_steps,
                rvvvvvvv: self.rvvvvvvv,
                f31_0: self.f31_0,
            })?)
        }

        /// Updates the fields present in `json`.
        pub fn update_from_json(&mut self, json: &str) -> Result<()> {
            let doc: Value = serde_json::from_str(json)?;
            self.base.apply(&doc);
            if let Some(rvvvvvvv) = doc.get("rvvvvvvv").and_then(as_u8) {
                self.rvvvvvvv = rvvvvvvv;
            }
            if let Some(f31_0) = doc
                .get("f31_0")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
            {
                self.f31_0 = f31_0;
            }
            Ok(())
        }

        /// Parses a loco, absent fields keep their defaults.
        pub fn from_json(json: &str) -> Result<Self> {
            let mut loco = Self::default();
            loco.update_from_json(json)?;
            Ok(loco)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Address;

    // =========================================================================
    // Packet Tests
    // =========================================================================

    #[test]
    fn dcc128_speed_packet() {
        let loco = Loco {
            rvvvvvvv: 0x80 | 42,
            ..Default::default()
        };
        let packet = loco.speed_packet(Address::basic_loco(3));
        assert_eq!(packet.as_slice(), &[3, 0x3F, 0xAA, 3 ^ 0x3F ^ 0xAA]);
    }

    #[test]
    fn dcc28_speed_packet() {
        let mut loco = Loco::default();
        loco.base.speed_steps = SpeedSteps::Dcc28;
        loco.rvvvvvvv = 0x80 | 0x13;
        let packet = loco.speed_packet(Address::basic_loco(10));
        assert_eq!(packet[1], 0b0100_0000 | 0x20 | 0x13);
    }

    #[test]
    fn dcc14_speed_packet_carries_f0() {
        let mut loco = Loco::default();
        loco.base.speed_steps = SpeedSteps::Dcc14;
        loco.rvvvvvvv = 0x05;
        loco.f31_0 = 1;
        let packet = loco.speed_packet(Address::basic_loco(10));
        assert_eq!(packet[1], 0b0100_0000 | 0x10 | 0x05);
    }

    #[test]
    fn function_packets_with_and_without_hfx() {
        let loco = Loco {
            f31_0: 0b1_0000_0000_0001_1111,
            ..Default::default()
        };
        let addr = Address::basic_loco(3);
        assert_eq!(loco.function_packets(addr, false).len(), 3);

        let packets = loco.function_packets(addr, true);
        assert_eq!(packets.len(), 5);
        assert_eq!(packets[0][1], 0b1001_1111);
        assert_eq!(packets[3][2], 0b1000);
    }

    #[test]
    fn aging_saturates() {
        let mut loco = Loco::default();
        for _ in 0..100 {
            loco.age();
        }
        assert_eq!(loco.priority, Loco::MAX_PRIORITY);
        assert_eq!(Loco::MAX_PRIORITY, 31);
    }

    // =========================================================================
    // JSON Tests
    // =========================================================================

    #[cfg(feature = "json")]
    #[test]
    fn base_to_json() {
        let base = NvLocoBase {
            name: "BR85".into(),
            speed_steps: SpeedSteps::Dcc28,
            ..Default::default()
        };
        assert_eq!(
            base.to_json().unwrap(),
            r#"{"name":"BR85","mode":0,"speed_steps":2}"#
        );
    }

    #[cfg(feature = "json")]
    #[test]
    fn loco_to_json() {
        let loco = Loco {
            base: NvLocoBase {
                name: "Reihe 2190".into(),
                ..Default::default()
            },
            rvvvvvvv: 1 << 7 | 42,
            f31_0: 1 << 3 | 1 << 1,
            ..Default::default()
        };
        assert_eq!(
            loco.to_json().unwrap(),
            r#"{"name":"Reihe 2190","mode":0,"speed_steps":4,"rvvvvvvv":170,"f31_0":10}"#
        );
    }

    #[cfg(feature = "json")]
    #[test]
    fn partial_document_keeps_other_fields() {
        let mut loco = Loco::named("old");
        loco.f31_0 = 7;
        loco.update_from_json(r#"{"speed_steps":0,"unknown":true}"#)
            .unwrap();
        assert_eq!(loco.base.name, "old");
        assert_eq!(loco.base.speed_steps, SpeedSteps::Dcc14);
        assert_eq!(loco.f31_0, 7);
    }

    #[cfg(feature = "json")]
    #[test]
    fn invalid_values_are_ignored() {
        let loco = Loco::from_json(r#"{"speed_steps":3,"rvvvvvvv":300,"mode":1}"#).unwrap();
        assert_eq!(loco, Loco::default());
        assert!(Loco::from_json("not json").is_err());
    }
}
