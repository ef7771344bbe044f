//! Integration tests for the DCC service against a track driver thread.
//!
//! Most tests run the service against a scripted driver that answers CV
//! packets like a decoder would. The last one spawns the real track driver
//! over mock peripherals.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use zimo_track::hal::mock::{
    BroadcastEvent, MockAckLine, MockAnalog, MockBidi, MockBroadcaster, MockClock,
    MockCurrentLimitPins, MockLocoStore, MockOutput, MockSettingsStore, MockTransmitter,
};
use zimo_track::{
    DccService, DriverHandle, ModeArbiter, ModeToken, Packet, Peripherals, Reply, TaskConfig,
    TrackBuffers, TrackDriver, TrackMode,
};

type Service = DccService<MockLocoStore, MockBroadcaster, MockSettingsStore, Arc<MockClock>>;

/// Repetitions of each programming packet with default settings.
const PROGRAM_PACKET_COUNT: usize = 7;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_for(what: &str, f: impl Fn() -> bool) {
    let start = Instant::now();
    while !f() {
        assert!(
            start.elapsed() < Duration::from_secs(20),
            "timed out waiting for {}",
            what
        );
        thread::sleep(Duration::from_millis(1));
    }
}

/// Answer of a decoder holding `value` in every CV.
fn decoder_ack(packet: &[u8], value: u8) -> bool {
    match packet[0] & 0xFC {
        0x74 => packet[2] == value,
        0x78 => {
            let position = packet[2] & 0x07;
            let bit = (packet[2] >> 3) & 0x01;
            (value >> position) & 0x01 == bit
        }
        0x7C => true,
        _ => false,
    }
}

#[derive(Clone, Copy)]
enum Decoder {
    /// Answers with the CV value.
    Value(u8),
    /// Shorts the track on the first CV packet.
    ShortCircuit,
}

/// Stands in for the track driver thread.
///
/// Operations sessions drain the back queue until asked to leave. Service
/// sessions answer every group of equal CV packets and end after 200 ms
/// without packets. Replies are left in place when a session ends.
fn scripted_driver(
    buffers: Arc<TrackBuffers>,
    rx: Receiver<ModeToken>,
    decoder: Decoder,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(token) = rx.recv() {
            let mut last: Option<Packet> = None;
            let mut repeats = 0;
            let mut idle = Duration::ZERO;

            while !token.exit_requested() {
                if token.mode() == TrackMode::DccOperations {
                    while buffers.tx_back.try_receive().is_some() {}
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }

                let Some(packet) = buffers.tx_front.receive(Duration::from_millis(5)) else {
                    idle += Duration::from_millis(5);
                    if idle >= Duration::from_millis(200) {
                        break;
                    }
                    continue;
                };
                idle = Duration::ZERO;

                if last.as_ref() == Some(&packet) {
                    repeats += 1;
                } else {
                    last = Some(packet);
                    repeats = 1;
                }
                if repeats < PROGRAM_PACKET_COUNT {
                    continue;
                }

                let ack = match decoder {
                    Decoder::Value(value) => last.as_deref().is_some_and(|p| decoder_ack(p, value)),
                    Decoder::ShortCircuit => {
                        token.arbiter().short_circuit();
                        false
                    }
                };
                buffers.rx.send(Reply::ServiceAck(ack));
                last = None;
                repeats = 0;
            }

            buffers.tx_front.clear();
            buffers.tx_back.clear();
            buffers.feedback.clear();
        }
    })
}

struct Rig {
    arbiter: Arc<ModeArbiter>,
    service: Arc<Service>,
}

impl Rig {
    fn new(decoder: Decoder) -> Self {
        init_logger();
        let arbiter = Arc::new(ModeArbiter::new());
        let buffers = Arc::new(TrackBuffers::default());
        let (handle, rx) = DriverHandle::channel();
        scripted_driver(Arc::clone(&buffers), rx, decoder);

        let service = DccService::new(
            Arc::clone(&arbiter),
            handle,
            buffers,
            Arc::new(MockSettingsStore::new()),
            MockLocoStore::new(),
            MockBroadcaster::new(),
            Arc::new(MockClock::new()),
        )
        .unwrap();
        Self {
            arbiter,
            service: Arc::new(service),
        }
    }

    fn events(&self) -> Vec<BroadcastEvent> {
        self.service.broadcaster().events()
    }

    fn wait_power_off(&self) {
        wait_for("track power off", || {
            self.service
                .broadcaster()
                .count(|e| *e == BroadcastEvent::TrackPowerOff)
                > 0
        });
        wait_for("session end", || !self.service.is_running());
    }
}

// =============================================================================
// Service Mode Tests
// =============================================================================

#[test]
fn service_mode_reads_cv_bitwise() {
    let rig = Rig::new(Decoder::Value(0x2A));
    rig.service.cv_read(8).unwrap();
    rig.service.start(TrackMode::DccService).unwrap();

    rig.wait_power_off();
    assert_eq!(
        rig.events(),
        vec![BroadcastEvent::CvAck(8, 0x2A), BroadcastEvent::TrackPowerOff]
    );
    assert!(rig.arbiter.load().is_suspended());
}

#[test]
fn service_mode_writes_in_request_order() {
    let rig = Rig::new(Decoder::Value(0));
    rig.service.cv_write(29, 6).unwrap();
    rig.service.cv_write(1, 3).unwrap();
    rig.service.start(TrackMode::DccService).unwrap();

    rig.wait_power_off();
    assert_eq!(
        rig.events(),
        vec![
            BroadcastEvent::CvAck(29, 6),
            BroadcastEvent::CvAck(1, 3),
            BroadcastEvent::TrackPowerOff
        ]
    );
}

#[test]
fn short_circuit_nacks_every_request() {
    let rig = Rig::new(Decoder::ShortCircuit);
    rig.service.cv_write(29, 6).unwrap();
    rig.service.cv_write(1, 3).unwrap();
    rig.service.start(TrackMode::DccService).unwrap();

    rig.wait_power_off();
    assert_eq!(
        rig.events(),
        vec![
            BroadcastEvent::CvNackShortCircuit,
            BroadcastEvent::CvNackShortCircuit,
            BroadcastEvent::TrackPowerOff
        ]
    );
    assert!(rig.arbiter.load().is_short_circuit());

    assert!(rig.service.track_power_on().is_ok());
    wait_for("operations", || {
        rig.arbiter.load().mode() == Some(TrackMode::DccOperations)
    });
    assert!(rig.service.track_power_off());
}

// =============================================================================
// Operations Tests
// =============================================================================

#[test]
fn cv_request_switches_operations_to_service_mode() {
    let rig = Rig::new(Decoder::Value(0x2A));
    rig.service.track_power_on().unwrap();
    wait_for("operations", || {
        rig.arbiter.load().mode() == Some(TrackMode::DccOperations)
    });

    rig.service.cv_read(8).unwrap();
    wait_for("service mode", || {
        rig.arbiter.load().mode() == Some(TrackMode::DccService)
    });

    rig.wait_power_off();
    assert_eq!(
        rig.events(),
        vec![BroadcastEvent::CvAck(8, 0x2A), BroadcastEvent::TrackPowerOff]
    );
}

#[test]
fn power_off_ends_operations() {
    let rig = Rig::new(Decoder::Value(0));
    rig.service.track_power_on().unwrap();
    wait_for("operations", || {
        rig.arbiter.load().mode() == Some(TrackMode::DccOperations)
    });
    assert!(rig.service.start(TrackMode::DccOperations).is_err());

    assert!(rig.service.track_power_off());
    rig.wait_power_off();
    assert!(rig.arbiter.load().is_suspended());
    assert_eq!(rig.events(), vec![BroadcastEvent::TrackPowerOff]);
}

// =============================================================================
// Track Driver Tests
// =============================================================================

#[test]
fn flat_current_reads_as_nack_on_real_driver() {
    init_logger();
    let arbiter = Arc::new(ModeArbiter::new());
    let buffers = Arc::new(TrackBuffers::default());
    let settings = Arc::new(MockSettingsStore::new());
    let clock = Arc::new(MockClock::new());

    let handle = TrackDriver::new(
        Peripherals {
            transmitter: MockTransmitter::new().with_clock(Arc::clone(&clock)),
            output: MockOutput::new(),
            bidi: MockBidi::new(),
            current_limit: MockCurrentLimitPins::new(),
            ack: MockAckLine::new(),
        },
        MockAnalog::flat(0),
        Arc::clone(&clock),
        Arc::clone(&settings),
        Arc::clone(&buffers),
    )
    .spawn(TaskConfig::new("track-e2e"))
    .unwrap();

    let service = Arc::new(
        DccService::new(
            Arc::clone(&arbiter),
            handle,
            buffers,
            settings,
            MockLocoStore::new(),
            MockBroadcaster::new(),
            clock,
        )
        .unwrap(),
    );
    service.cv_write(1, 3).unwrap();
    service.start(TrackMode::DccService).unwrap();

    wait_for("session end", || {
        service
            .broadcaster()
            .count(|e| *e == BroadcastEvent::TrackPowerOff)
            > 0
    });
    assert_eq!(
        service.broadcaster().events(),
        vec![BroadcastEvent::CvNack, BroadcastEvent::TrackPowerOff]
    );
    assert!(arbiter.load().is_suspended());
}
