//! ESP32-S3 track output firmware.
//!
//! Brings up the track peripherals, spawns the track driver task and the DCC
//! service, then powers the track in DCC operations mode. The main task
//! becomes the analog task: it samples the track current and latches short
//! circuits.
//!
//! Front-ends (Z21, WiThrottle, web) are separate crates. Here their
//! broadcasts only go to the log.
//!
//! # Build
//!
//! ```bash
//! cargo build --release --features esp32 --bin esp32_main
//! ```

use std::sync::Arc;

use esp_idf_hal::adc::oneshot::AdcDriver;
use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin};
use esp_idf_hal::peripherals::Peripherals as EspPeripherals;
use esp_idf_svc::log::EspLogger;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use zimo_track::hal::esp32::{
    Esp32AckLine, Esp32Analog, Esp32Bidi, Esp32Clock, Esp32CurrentLimitPins, Esp32LocoStore,
    Esp32Output, Esp32SettingsStore, Esp32Transmitter,
};
use zimo_track::traits::Broadcaster;
use zimo_track::{
    AnalogCalibration, CutoutOffsets, DccService, ModeArbiter, Peripherals, Settings, TaskConfig,
    TrackBuffers, TrackDriver, TrackMode,
};

/// Broadcasts of the DCC service, logged until a front-end subscribes.
struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn cv_ack(&self, cv: u16, byte: u8) {
        log::info!("CV {} = {}", cv, byte);
    }

    fn cv_nack(&self) {
        log::info!("CV NACK");
    }

    fn cv_nack_short_circuit(&self) {
        log::info!("CV NACK (short circuit)");
    }

    fn broadcast_loco_info(&self, addr: u16) {
        log::debug!("Loco {} changed", addr);
    }

    fn broadcast_rail_com_data(&self, addr: u16) {
        log::debug!("RailCom data of loco {} changed", addr);
    }

    fn broadcast_track_power_off(&self) {
        log::info!("Track power off");
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize ESP-IDF
    esp_idf_hal::sys::link_patches();
    EspLogger::initialize_default();

    log::info!("zimo-track starting");

    let peripherals = EspPeripherals::take()?;
    let partition = EspDefaultNvsPartition::take()?;
    let pins = peripherals.pins;

    // =========================================================================
    // Collaborators
    // =========================================================================
    let settings_store = Arc::new(Esp32SettingsStore::new(partition.clone())?);
    let loco_store = Esp32LocoStore::new(partition)?;
    let arbiter = Arc::new(ModeArbiter::new());
    let buffers = Arc::new(TrackBuffers::default());
    let offsets = CutoutOffsets::default();
    let calibration = AnalogCalibration::default();

    // =========================================================================
    // Analog (IMON on GPIO1)
    // =========================================================================
    let adc1: &'static AdcDriver<'static, _> =
        Box::leak(Box::new(AdcDriver::new(peripherals.adc1)?));
    let analog = Arc::new(Esp32Analog::new(adc1, pins.gpio1, Arc::clone(&arbiter), calibration)?);
    log::info!("[OK] Current sense initialized (GPIO1 ADC)");

    // =========================================================================
    // Track driver
    // =========================================================================
    let transmitter = Esp32Transmitter::new(peripherals.rmt.channel0, pins.gpio11)?;
    let rmt_channel = transmitter.channel();
    let track_peripherals = Peripherals {
        transmitter,
        output: Esp32Output::new(
            AnyOutputPin::from(pins.gpio12),
            AnyOutputPin::from(pins.gpio9),
        )?,
        bidi: Esp32Bidi::new(
            peripherals.uart1,
            pins.gpio14,
            AnyOutputPin::from(pins.gpio13),
            peripherals.timer00,
            rmt_channel,
            offsets,
        )?,
        current_limit: Esp32CurrentLimitPins::new(
            AnyOutputPin::from(pins.gpio16),
            AnyOutputPin::from(pins.gpio15),
        )?,
        ack: Esp32AckLine::new(AnyInputPin::from(pins.gpio18))?,
    };
    let driver = TrackDriver::new(
        track_peripherals,
        Arc::clone(&analog),
        Esp32Clock::new(),
        Arc::clone(&settings_store),
        Arc::clone(&buffers),
    )
    .with_offsets(offsets)
    .with_calibration(calibration)
    .spawn(TaskConfig::dcc_driver().with_core(1))?;
    log::info!("[OK] Track driver running");

    // =========================================================================
    // DCC service
    // =========================================================================
    let service = Arc::new(DccService::new(
        Arc::clone(&arbiter),
        driver,
        buffers,
        Arc::clone(&settings_store),
        loco_store,
        LogBroadcaster,
        Esp32Clock::new(),
    )?);
    service.track_power_on()?;
    log::info!("[OK] DCC service running");

    // =========================================================================
    // Analog task
    // =========================================================================
    let settings = Settings::load(&*settings_store);
    loop {
        let limit = match arbiter.load().mode() {
            Some(TrackMode::DccService) => settings.current_limit_service,
            _ => settings.current_limit,
        };
        if analog.poll(limit.milliamps(), settings.current_short_circuit_time as u32) {
            service.track_power_off();
        }
    }
}
