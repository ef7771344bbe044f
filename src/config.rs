//! Typed view of the non-volatile settings used by the track drivers.
//!
//! The settings collaborator stores plain 16 bit values under [`SettingKey`]s.
//! [`Settings::load`] reads all of them in one shot when a mode resumes, so a
//! running driver never sees timing parameters change mid-packet.
//!
//! # Example
//!
//! ```rust
//! use zimo_track::config::{ProgrammingType, Settings};
//! use zimo_track::current_limit::CurrentLimit;
//!
//! // Use defaults
//! let settings = Settings::default();
//! assert_eq!(settings.dcc_preamble, 17);
//!
//! // Or customize
//! let settings = Settings::default()
//!     .with_current_limit(CurrentLimit::Ma2700)
//!     .with_dcc_programming_type(ProgrammingType::BitOnly);
//! ```

use crate::current_limit::CurrentLimit;
use crate::encoder::{
    DccEncoderConfig, MduEncoderConfig, TransferRate, DCC_SERVICE_MIN_PREAMBLE_BITS,
    DCC_TX_MAX_PREAMBLE_BITS, DCC_TX_MIN_PREAMBLE_BITS, MDU_TX_MIN_ACKREQ_BITS,
    MDU_TX_MIN_PREAMBLE_BITS,
};
use crate::traits::SettingsStore;

// ============================================================================
// Keys
// ============================================================================

/// Keys of the settings collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SettingKey {
    /// Operations mode current limit.
    CurrentLimit,
    /// Service mode current limit.
    CurrentLimitService,
    /// Time a current overshoot must last to count as short circuit [ms].
    CurrentShortCircuitTime,
    /// Number of DCC preamble bits.
    DccPreamble,
    /// Half duration of a DCC one bit [µs].
    DccBit1Duration,
    /// Half duration of a DCC zero bit [µs].
    DccBit0Duration,
    /// Duration of the BiDi bit [µs], `0` disables BiDi.
    DccBiDiBitDuration,
    /// [`ProgrammingType`] for service mode reads.
    DccProgrammingType,
    /// Reset packets sent when entering service mode.
    DccStartupResetPacketCount,
    /// Reset packets sent between service mode requests.
    DccContinueResetPacketCount,
    /// Repetitions of each programming packet.
    DccProgramPacketCount,
    /// Polarity of bit verify packets.
    DccBitVerifyTo1,
    /// Current increase which counts as service mode ACK [mA].
    DccProgrammingAckCurrent,
    /// Loco related flags, see [`LocoFlags`].
    DccLocoFlags,
    /// Number of MDU preamble bits.
    MduPreamble,
    /// Number of MDU ACK request bits.
    MduAckreq,
}

impl SettingKey {
    /// All keys.
    pub const ALL: [SettingKey; 16] = [
        Self::CurrentLimit,
        Self::CurrentLimitService,
        Self::CurrentShortCircuitTime,
        Self::DccPreamble,
        Self::DccBit1Duration,
        Self::DccBit0Duration,
        Self::DccBiDiBitDuration,
        Self::DccProgrammingType,
        Self::DccStartupResetPacketCount,
        Self::DccContinueResetPacketCount,
        Self::DccProgramPacketCount,
        Self::DccBitVerifyTo1,
        Self::DccProgrammingAckCurrent,
        Self::DccLocoFlags,
        Self::MduPreamble,
        Self::MduAckreq,
    ];

    /// Short storage name (at most 15 characters, NVS key limit).
    pub const fn name(self) -> &'static str {
        match self {
            Self::CurrentLimit => "cur_lim",
            Self::CurrentLimitService => "cur_lim_serv",
            Self::CurrentShortCircuitTime => "cur_sc_time",
            Self::DccPreamble => "dcc_preamble",
            Self::DccBit1Duration => "dcc_bit1_dur",
            Self::DccBit0Duration => "dcc_bit0_dur",
            Self::DccBiDiBitDuration => "dcc_bidibit_dur",
            Self::DccProgrammingType => "dcc_prog_type",
            Self::DccStartupResetPacketCount => "dcc_strtp_rs_pc",
            Self::DccContinueResetPacketCount => "dcc_cntn_rs_pc",
            Self::DccProgramPacketCount => "dcc_prog_pc",
            Self::DccBitVerifyTo1 => "dcc_verify_bit1",
            Self::DccProgrammingAckCurrent => "dcc_ack_cur",
            Self::DccLocoFlags => "dcc_loco_flags",
            Self::MduPreamble => "mdu_preamble",
            Self::MduAckreq => "mdu_ackreq",
        }
    }
}

// ============================================================================
// Value types
// ============================================================================

/// How service mode reads a CV.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ProgrammingType {
    /// Reads are disabled.
    Nothing = 0,
    /// Brute force byte verify.
    ByteOnly = 1,
    /// Eight bit verifies.
    BitOnly = 2,
    /// Bit verifies confirmed by one byte verify.
    #[default]
    Both = 3,
}

impl ProgrammingType {
    /// Decodes the stored value, unknown values fall back to the default.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Nothing,
            1 => Self::ByteOnly,
            2 => Self::BitOnly,
            3 => Self::Both,
            _ => Self::Both,
        }
    }

    /// True if byte verifies are used.
    pub const fn byte(self) -> bool {
        self as u8 & 0b01 != 0
    }

    /// True if bit verifies are used.
    pub const fn bit(self) -> bool {
        self as u8 & 0b10 != 0
    }
}

/// Loco flag bits stored under [`SettingKey::DccLocoFlags`].
pub struct LocoFlags;

impl LocoFlags {
    /// Repeat F13 to F28 in the background traffic.
    pub const REPEAT_HFX: u8 = 0x02;
    /// Addresses up to 127 are short addresses (instead of 99).
    pub const DCC_SHORT_127: u8 = 0x40;
}

/// Latency compensation of the cutout timing.
///
/// The values depend on the interrupt latency of a given build and have to
/// be measured on hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CutoutOffsets {
    /// Subtracted from the second half of the end bit [µs].
    pub endbit: u8,
    /// Added to the cutout start alarm [µs].
    pub tcs: u8,
}

impl CutoutOffsets {
    /// Offsets measured on a size optimized build.
    pub const RELEASE: Self = Self {
        endbit: 31,
        tcs: 20,
    };

    /// Offsets measured on a debug build.
    pub const DEBUG: Self = Self {
        endbit: 34,
        tcs: 21,
    };
}

impl Default for CutoutOffsets {
    fn default() -> Self {
        Self::RELEASE
    }
}

/// Conversion between milliamps and raw ADC current measurements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnalogCalibration {
    /// Current sense ratio.
    pub kimon: u32,
    /// Current sense resistor [Ω].
    pub rimon: u32,
    /// ADC reference voltage [mV].
    pub vref_mv: u32,
    /// Largest raw measurement.
    pub max_measurement: u32,
    /// Sample rate of the current channel [Hz].
    pub sample_rate_hz: u32,
}

impl Default for AnalogCalibration {
    fn default() -> Self {
        Self {
            kimon: 800,
            rimon: 180,
            vref_mv: 1000,
            max_measurement: 4095,
            sample_rate_hz: 4000,
        }
    }
}

impl AnalogCalibration {
    /// Converts a current into a raw measurement.
    pub const fn milliamps_to_measurement(&self, ma: u16) -> u32 {
        (ma as u32 * self.rimon * self.max_measurement) / (self.kimon * self.vref_mv)
    }

    /// Number of samples covering `ms` milliseconds.
    pub const fn samples_for_ms(&self, ms: u32) -> usize {
        (self.sample_rate_hz * ms / 1000) as usize
    }
}

// ============================================================================
// Settings
// ============================================================================

/// All settings the track core reads at resume time.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Settings {
    /// Operations mode current limit.
    pub current_limit: CurrentLimit,
    /// Service mode current limit.
    pub current_limit_service: CurrentLimit,
    /// Short circuit time [ms].
    pub current_short_circuit_time: u8,
    /// DCC preamble bits (17..=30).
    pub dcc_preamble: u8,
    /// DCC one bit half duration [µs] (56..=60).
    pub dcc_bit1_duration: u8,
    /// DCC zero bit half duration [µs] (97..=114).
    pub dcc_bit0_duration: u8,
    /// BiDi bit duration [µs], `0` or 57..=61.
    pub dcc_bidibit_duration: u8,
    /// Service mode read strategy.
    pub dcc_programming_type: ProgrammingType,
    /// Reset packets when entering service mode.
    pub dcc_startup_reset_packet_count: u8,
    /// Reset packets between service mode requests.
    pub dcc_continue_reset_packet_count: u8,
    /// Repetitions of each programming packet.
    pub dcc_program_packet_count: u8,
    /// Polarity of bit verify packets.
    pub dcc_bit_verify_to_1: bool,
    /// ACK current threshold [mA].
    pub dcc_programming_ack_current: u16,
    /// [`LocoFlags`] bits.
    pub dcc_loco_flags: u8,
    /// MDU preamble bits.
    pub mdu_preamble: u8,
    /// MDU ACK request bits.
    pub mdu_ackreq: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            current_limit: CurrentLimit::Ma4100,
            current_limit_service: CurrentLimit::Ma1300,
            current_short_circuit_time: 100,
            dcc_preamble: DCC_TX_MIN_PREAMBLE_BITS,
            dcc_bit1_duration: 58,
            dcc_bit0_duration: 100,
            dcc_bidibit_duration: 60,
            dcc_programming_type: ProgrammingType::Both,
            dcc_startup_reset_packet_count: 25,
            dcc_continue_reset_packet_count: 6,
            dcc_program_packet_count: 7,
            dcc_bit_verify_to_1: true,
            dcc_programming_ack_current: 50,
            dcc_loco_flags: 0,
            mdu_preamble: MDU_TX_MIN_PREAMBLE_BITS,
            mdu_ackreq: MDU_TX_MIN_ACKREQ_BITS,
        }
    }
}

impl Settings {
    /// Reads every key from `store`, missing keys keep their default.
    ///
    /// Out of range values are clamped into the valid range.
    pub fn load<S: SettingsStore + ?Sized>(store: &S) -> Self {
        let d = Self::default();
        let u8_or = |key: SettingKey, default: u8| {
            store
                .get(key)
                .map(|v| v.min(u8::MAX as u16) as u8)
                .unwrap_or(default)
        };

        let bidibit = u8_or(SettingKey::DccBiDiBitDuration, d.dcc_bidibit_duration);
        Self {
            current_limit: store
                .get(SettingKey::CurrentLimit)
                .map(|v| CurrentLimit::from_bits(v as u8))
                .unwrap_or(d.current_limit),
            current_limit_service: store
                .get(SettingKey::CurrentLimitService)
                .map(|v| CurrentLimit::from_bits(v as u8))
                .unwrap_or(d.current_limit_service),
            current_short_circuit_time: u8_or(
                SettingKey::CurrentShortCircuitTime,
                d.current_short_circuit_time,
            ),
            dcc_preamble: u8_or(SettingKey::DccPreamble, d.dcc_preamble)
                .clamp(DCC_TX_MIN_PREAMBLE_BITS, DCC_TX_MAX_PREAMBLE_BITS),
            dcc_bit1_duration: u8_or(SettingKey::DccBit1Duration, d.dcc_bit1_duration)
                .clamp(56, 60),
            dcc_bit0_duration: u8_or(SettingKey::DccBit0Duration, d.dcc_bit0_duration)
                .clamp(97, 114),
            dcc_bidibit_duration: if bidibit == 0 {
                0
            } else {
                bidibit.clamp(57, 61)
            },
            dcc_programming_type: ProgrammingType::from_u8(u8_or(
                SettingKey::DccProgrammingType,
                d.dcc_programming_type as u8,
            )),
            dcc_startup_reset_packet_count: u8_or(
                SettingKey::DccStartupResetPacketCount,
                d.dcc_startup_reset_packet_count,
            ),
            dcc_continue_reset_packet_count: u8_or(
                SettingKey::DccContinueResetPacketCount,
                d.dcc_continue_reset_packet_count,
            ),
            dcc_program_packet_count: u8_or(
                SettingKey::DccProgramPacketCount,
                d.dcc_program_packet_count,
            ),
            dcc_bit_verify_to_1: store
                .get(SettingKey::DccBitVerifyTo1)
                .map(|v| v != 0)
                .unwrap_or(d.dcc_bit_verify_to_1),
            dcc_programming_ack_current: store
                .get(SettingKey::DccProgrammingAckCurrent)
                .unwrap_or(d.dcc_programming_ack_current),
            dcc_loco_flags: u8_or(SettingKey::DccLocoFlags, d.dcc_loco_flags),
            mdu_preamble: u8_or(SettingKey::MduPreamble, d.mdu_preamble)
                .max(MDU_TX_MIN_PREAMBLE_BITS),
            mdu_ackreq: u8_or(SettingKey::MduAckreq, d.mdu_ackreq).max(MDU_TX_MIN_ACKREQ_BITS),
        }
    }

    /// Writes every setting back into `store`.
    pub fn store<S: SettingsStore + ?Sized>(&self, store: &mut S) -> Result<(), S::Error> {
        for key in SettingKey::ALL {
            store.set(key, self.value(key))?;
        }
        Ok(())
    }

    /// Raw value of one key.
    pub fn value(&self, key: SettingKey) -> u16 {
        match key {
            SettingKey::CurrentLimit => self.current_limit as u16,
            SettingKey::CurrentLimitService => self.current_limit_service as u16,
            SettingKey::CurrentShortCircuitTime => self.current_short_circuit_time as u16,
            SettingKey::DccPreamble => self.dcc_preamble as u16,
            SettingKey::DccBit1Duration => self.dcc_bit1_duration as u16,
            SettingKey::DccBit0Duration => self.dcc_bit0_duration as u16,
            SettingKey::DccBiDiBitDuration => self.dcc_bidibit_duration as u16,
            SettingKey::DccProgrammingType => self.dcc_programming_type as u16,
            SettingKey::DccStartupResetPacketCount => self.dcc_startup_reset_packet_count as u16,
            SettingKey::DccContinueResetPacketCount => {
                self.dcc_continue_reset_packet_count as u16
            }
            SettingKey::DccProgramPacketCount => self.dcc_program_packet_count as u16,
            SettingKey::DccBitVerifyTo1 => self.dcc_bit_verify_to_1 as u16,
            SettingKey::DccProgrammingAckCurrent => self.dcc_programming_ack_current,
            SettingKey::DccLocoFlags => self.dcc_loco_flags as u16,
            SettingKey::MduPreamble => self.mdu_preamble as u16,
            SettingKey::MduAckreq => self.mdu_ackreq as u16,
        }
    }

    /// Set the operations mode current limit
    pub fn with_current_limit(mut self, limit: CurrentLimit) -> Self {
        self.current_limit = limit;
        self
    }

    /// Set the service mode current limit
    pub fn with_current_limit_service(mut self, limit: CurrentLimit) -> Self {
        self.current_limit_service = limit;
        self
    }

    /// Set the number of DCC preamble bits
    pub fn with_dcc_preamble(mut self, bits: u8) -> Self {
        self.dcc_preamble = bits.clamp(DCC_TX_MIN_PREAMBLE_BITS, DCC_TX_MAX_PREAMBLE_BITS);
        self
    }

    /// Set the BiDi bit duration, `0` disables BiDi
    pub fn with_dcc_bidibit_duration(mut self, us: u8) -> Self {
        self.dcc_bidibit_duration = us;
        self
    }

    /// Set the service mode read strategy
    pub fn with_dcc_programming_type(mut self, programming_type: ProgrammingType) -> Self {
        self.dcc_programming_type = programming_type;
        self
    }

    /// Set the number of reset packets sent on service mode entry
    pub fn with_dcc_startup_reset_packet_count(mut self, count: u8) -> Self {
        self.dcc_startup_reset_packet_count = count;
        self
    }

    /// Set the number of reset packets between service mode requests
    pub fn with_dcc_continue_reset_packet_count(mut self, count: u8) -> Self {
        self.dcc_continue_reset_packet_count = count;
        self
    }

    /// Set the number of programming packet repetitions
    pub fn with_dcc_program_packet_count(mut self, count: u8) -> Self {
        self.dcc_program_packet_count = count;
        self
    }

    /// Set the bit verify polarity
    pub fn with_dcc_bit_verify_to_1(mut self, to_1: bool) -> Self {
        self.dcc_bit_verify_to_1 = to_1;
        self
    }

    /// Set the ACK current threshold
    pub fn with_dcc_programming_ack_current(mut self, ma: u16) -> Self {
        self.dcc_programming_ack_current = ma;
        self
    }

    /// Set the loco flags
    pub fn with_dcc_loco_flags(mut self, flags: u8) -> Self {
        self.dcc_loco_flags = flags;
        self
    }

    /// True if F13 to F28 are repeated in the background traffic.
    pub fn repeat_hfx(&self) -> bool {
        self.dcc_loco_flags & LocoFlags::REPEAT_HFX != 0
    }

    /// True if addresses up to 127 are short addresses.
    pub fn dcc_short_127(&self) -> bool {
        self.dcc_loco_flags & LocoFlags::DCC_SHORT_127 != 0
    }

    /// DCC encoder configuration for operations or service mode.
    ///
    /// Service mode can't do BiDi and needs at least 20 preamble bits.
    pub fn dcc_encoder_config(&self, service: bool, offsets: CutoutOffsets) -> DccEncoderConfig {
        let mut config = DccEncoderConfig {
            num_preamble: self.dcc_preamble,
            bidibit_duration: self.dcc_bidibit_duration,
            bit1_duration: self.dcc_bit1_duration,
            bit0_duration: self.dcc_bit0_duration,
            endbit_duration: self.dcc_bit1_duration.saturating_sub(offsets.endbit),
        };
        if service {
            config.num_preamble = config.num_preamble.max(DCC_SERVICE_MIN_PREAMBLE_BITS);
            config.bidibit_duration = 0;
        }
        config
    }

    /// MDU encoder configuration at the default transfer rate.
    pub fn mdu_encoder_config(&self) -> MduEncoderConfig {
        MduEncoderConfig {
            transfer_rate: TransferRate::Default,
            num_preamble: self.mdu_preamble,
            num_ackreq: self.mdu_ackreq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockSettingsStore;

    // =========================================================================
    // Settings Tests
    // =========================================================================

    #[test]
    fn load_from_empty_store_yields_defaults() {
        let store = MockSettingsStore::new();
        assert_eq!(Settings::load(&store), Settings::default());
    }

    #[test]
    fn load_clamps_out_of_range_values() {
        let mut store = MockSettingsStore::new();
        store.values.insert(SettingKey::DccPreamble, 5);
        store.values.insert(SettingKey::DccBit1Duration, 70);
        store.values.insert(SettingKey::DccBiDiBitDuration, 0);
        store.values.insert(SettingKey::CurrentLimit, 0b01);

        let settings = Settings::load(&store);
        assert_eq!(settings.dcc_preamble, 17);
        assert_eq!(settings.dcc_bit1_duration, 60);
        assert_eq!(settings.dcc_bidibit_duration, 0);
        assert_eq!(settings.current_limit, CurrentLimit::Ma1300);
    }

    #[test]
    fn store_then_load_is_identity() {
        let settings = Settings::default()
            .with_dcc_programming_type(ProgrammingType::BitOnly)
            .with_dcc_loco_flags(LocoFlags::DCC_SHORT_127);
        let mut store = MockSettingsStore::new();
        settings.store(&mut store).unwrap();
        assert_eq!(Settings::load(&store), settings);
    }

    #[test]
    fn key_names_fit_nvs() {
        for key in SettingKey::ALL {
            assert!(key.name().len() <= 15, "{:?}", key);
        }
    }

    // =========================================================================
    // Encoder Config Tests
    // =========================================================================

    #[test]
    fn service_mode_disables_bidi_and_extends_preamble() {
        let settings = Settings::default();
        let ops = settings.dcc_encoder_config(false, CutoutOffsets::RELEASE);
        assert_eq!(ops.num_preamble, 17);
        assert_eq!(ops.bidibit_duration, 60);
        assert_eq!(ops.endbit_duration, 58 - 31);

        let service = settings.dcc_encoder_config(true, CutoutOffsets::RELEASE);
        assert_eq!(service.num_preamble, 20);
        assert_eq!(service.bidibit_duration, 0);
    }

    #[test]
    fn programming_type_bits() {
        assert!(ProgrammingType::Both.bit() && ProgrammingType::Both.byte());
        assert!(!ProgrammingType::ByteOnly.bit());
        assert!(!ProgrammingType::Nothing.byte());
    }

    #[test]
    fn ack_current_conversion() {
        let cal = AnalogCalibration::default();
        // 50 mA * 180 * 4095 / (800 * 1000)
        assert_eq!(cal.milliamps_to_measurement(50), 46);
        assert_eq!(cal.samples_for_ms(5), 20);
    }
}
