//! Track driver task.
//!
//! One thread owns every track peripheral. Services claim the track at the
//! [`ModeArbiter`] and hand the resulting [`ModeToken`] to the thread through
//! a [`DriverHandle`]. For every token the thread runs one session:
//!
//! 1. **Resume**: load [`Settings`], enable the H-bridge, release force-low,
//!    arm BiDi for DCC operations.
//! 2. **Run** the protocol driver matching the token's mode.
//! 3. **Suspend**: force the outputs low, disarm BiDi, empty every queue.
//! 4. Drop the token, which stores `Suspended` (or leaves a latched short
//!    circuit behind).
//!
//! | Mode | Driver |
//! |------|--------|
//! | `DccOperations`, `DccEin`, `DccService` | [`DccDriver`] |
//! | `DecupZpp`, `DecupZsu`, `DecupEin` | [`DecupDriver`] |
//! | `MduZpp`, `MduZsu`, `MduEin` | [`MduDriver`] |
//!
//! A hardware error leaves peripherals in an unknown state. The thread logs
//! it and aborts the process.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::buffers::TrackBuffers;
use crate::config::{AnalogCalibration, CutoutOffsets, Settings};
use crate::current_limit::CurrentLimiter;
use crate::dcc::DccDriver;
use crate::decup::DecupDriver;
use crate::error::{Result, TrackError};
use crate::mdu::MduDriver;
use crate::state::{ModeToken, TrackMode};
use crate::task::TaskConfig;
use crate::traits::{
    AckLine, AnalogMeasurements, BidiReceiver, Clock, CurrentLimitPins, SettingsStore,
    TrackOutput, TrackTransmitter,
};

/// Time the H-bridge needs between enable and force-low changes [ms].
pub const OUTPUT_SETTLE_MS: u32 = 20;

/// Peripherals owned by the track driver.
#[derive(Debug)]
pub struct Peripherals<T, O, B, L, A> {
    /// RMT channel.
    pub transmitter: T,
    /// H-bridge enable and force-low lines.
    pub output: O,
    /// Cutout and BiDi UART.
    pub bidi: B,
    /// Current limit lines.
    pub current_limit: L,
    /// ACK input.
    pub ack: A,
}

/// Session timeouts per protocol family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// DCC.
    pub dcc: Duration,
    /// DECUP.
    pub decup: Duration,
    /// MDU.
    pub mdu: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            dcc: TaskConfig::dcc_driver().timeout,
            decup: TaskConfig::decup_driver().timeout,
            mdu: TaskConfig::mdu_driver().timeout,
        }
    }
}

/// Runs track sessions on the peripherals it owns.
pub struct TrackDriver<T, O, B, L, A, M, C, S: ?Sized> {
    transmitter: T,
    output: O,
    bidi: B,
    current_limit: CurrentLimiter<L>,
    ack: A,
    analog: M,
    clock: C,
    settings: Arc<S>,
    buffers: Arc<TrackBuffers>,
    offsets: CutoutOffsets,
    calibration: AnalogCalibration,
    timeouts: SessionTimeouts,
}

impl<T, O, B, L, A, M, C, S> TrackDriver<T, O, B, L, A, M, C, S>
where
    T: TrackTransmitter,
    O: TrackOutput,
    B: BidiReceiver,
    L: CurrentLimitPins,
    A: AckLine,
    M: AnalogMeasurements,
    C: Clock,
    S: SettingsStore + ?Sized,
{
    /// Creates a driver with release offsets, default calibration and the
    /// preset timeouts.
    pub fn new(
        peripherals: Peripherals<T, O, B, L, A>,
        analog: M,
        clock: C,
        settings: Arc<S>,
        buffers: Arc<TrackBuffers>,
    ) -> Self {
        Self {
            transmitter: peripherals.transmitter,
            output: peripherals.output,
            bidi: peripherals.bidi,
            current_limit: CurrentLimiter::new(peripherals.current_limit),
            ack: peripherals.ack,
            analog,
            clock,
            settings,
            buffers,
            offsets: CutoutOffsets::default(),
            calibration: AnalogCalibration::default(),
            timeouts: SessionTimeouts::default(),
        }
    }

    /// Builder: set the cutout offsets.
    pub fn with_offsets(mut self, offsets: CutoutOffsets) -> Self {
        self.offsets = offsets;
        self
    }

    /// Builder: set the ADC calibration.
    pub fn with_calibration(mut self, calibration: AnalogCalibration) -> Self {
        self.calibration = calibration;
        self
    }

    /// Builder: set the session timeouts.
    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Queues shared with the services.
    pub fn buffers(&self) -> &Arc<TrackBuffers> {
        &self.buffers
    }

    /// Peripherals, for inspection.
    pub fn peripherals(&self) -> (&T, &O, &B, &L, &A) {
        (
            &self.transmitter,
            &self.output,
            &self.bidi,
            self.current_limit.pins(),
            &self.ack,
        )
    }

    /// Runs one session and releases the track.
    ///
    /// Modes without a driver are refused before any peripheral is touched.
    pub fn run(&mut self, token: ModeToken) -> Result<()> {
        let mode = token.mode();
        if !Self::supports(mode) {
            return Err(TrackError::UnsupportedMode(mode));
        }

        let settings = Settings::load(&*self.settings);
        log::info!("Resuming track in {:?}", mode);
        self.resume(mode, &settings)?;

        let result = self.dispatch(&token, &settings);

        log::info!("Suspending track from {:?} ({:?})", mode, token.state());
        let suspended = self.suspend(mode);
        drop(token);
        result.and(suspended)
    }

    /// True if a driver exists for `mode`.
    pub fn supports(mode: TrackMode) -> bool {
        use TrackMode::*;
        matches!(
            mode,
            DccOperations | DccEin | DccService | DecupZpp | DecupZsu | DecupEin | MduZpp
                | MduZsu | MduEin
        )
    }

    fn dispatch(&mut self, token: &ModeToken, settings: &Settings) -> Result<()> {
        use TrackMode::*;
        match token.mode() {
            DccOperations | DccEin | DccService => DccDriver {
                transmitter: &mut self.transmitter,
                bidi: &mut self.bidi,
                current_limit: &mut self.current_limit,
                analog: &self.analog,
                clock: &self.clock,
                buffers: &self.buffers,
                settings,
                offsets: self.offsets,
                calibration: self.calibration,
                timeout: self.timeouts.dcc,
            }
            .run(token),
            DecupZpp | DecupZsu | DecupEin => DecupDriver {
                transmitter: &mut self.transmitter,
                current_limit: &mut self.current_limit,
                ack: &mut self.ack,
                clock: &self.clock,
                buffers: &self.buffers,
                timeout: self.timeouts.decup,
            }
            .run(token),
            MduZpp | MduZsu | MduEin => MduDriver {
                transmitter: &mut self.transmitter,
                current_limit: &mut self.current_limit,
                ack: &mut self.ack,
                clock: &self.clock,
                buffers: &self.buffers,
                timeout: self.timeouts.mdu,
                config: settings.mdu_encoder_config(),
            }
            .run(token),
            mode => Err(TrackError::UnsupportedMode(mode)),
        }
    }

    fn resume(&mut self, mode: TrackMode, settings: &Settings) -> Result<()> {
        self.output.set_enable(true).map_err(TrackError::hardware)?;
        self.clock.delay_ms(OUTPUT_SETTLE_MS);
        self.output
            .set_force_low(false)
            .map_err(TrackError::hardware)?;

        if matches!(mode, TrackMode::DccOperations | TrackMode::DccEin) {
            let bidi = settings.dcc_encoder_config(false, self.offsets).bidi();
            self.bidi.set_enabled(bidi).map_err(TrackError::hardware)?;
        }
        Ok(())
    }

    fn suspend(&mut self, mode: TrackMode) -> Result<()> {
        self.output.set_enable(false).map_err(TrackError::hardware)?;
        self.clock.delay_ms(OUTPUT_SETTLE_MS);
        self.output
            .set_force_low(true)
            .map_err(TrackError::hardware)?;

        if matches!(mode, TrackMode::DccOperations | TrackMode::DccEin) {
            self.bidi.set_enabled(false).map_err(TrackError::hardware)?;
            self.bidi.flush().map_err(TrackError::hardware)?;
        }
        self.buffers.clear_all();
        Ok(())
    }
}

impl<T, O, B, L, A, M, C, S> TrackDriver<T, O, B, L, A, M, C, S>
where
    T: TrackTransmitter + Send + 'static,
    O: TrackOutput + Send + 'static,
    B: BidiReceiver + Send + 'static,
    L: CurrentLimitPins + Send + 'static,
    A: AckLine + Send + 'static,
    M: AnalogMeasurements + Send + 'static,
    C: Clock + Send + 'static,
    S: SettingsStore + Send + Sync + ?Sized + 'static,
{
    /// Moves the driver onto its own thread.
    ///
    /// The thread runs one session per token received through the returned
    /// handle and exits once every handle is dropped.
    pub fn spawn(mut self, config: TaskConfig) -> Result<DriverHandle> {
        let (handle, rx) = DriverHandle::channel();
        config.spawn(move || {
            while let Ok(token) = rx.recv() {
                match self.run(token) {
                    Ok(()) => {}
                    Err(TrackError::UnsupportedMode(mode)) => {
                        log::warn!("No track driver for {:?}", mode);
                    }
                    Err(e) => {
                        log::error!("Track driver failed: {}", e);
                        std::process::abort();
                    }
                }
            }
        })?;
        Ok(handle)
    }
}

/// Sends claimed tokens to the track driver thread.
#[derive(Clone, Debug)]
pub struct DriverHandle {
    tx: Sender<ModeToken>,
}

impl DriverHandle {
    /// Handle and the receiving end a driver thread serves.
    pub fn channel() -> (Self, Receiver<ModeToken>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// Starts a session for `token`.
    ///
    /// If the driver thread is gone the token is dropped, which releases
    /// the track again.
    pub fn resume(&self, token: ModeToken) -> Result<()> {
        self.tx
            .send(token)
            .map_err(|_| TrackError::Hardware("track driver stopped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::Reply;
    use crate::current_limit::CurrentLimit;
    use crate::hal::mock::{
        MockAckLine, MockAnalog, MockBidi, MockClock, MockCurrentLimitPins, MockOutput,
        MockSettingsStore, MockTransmitter,
    };
    use crate::packet::make_idle_packet;
    use crate::state::ModeArbiter;
    use std::time::Instant;

    type MockDriver = TrackDriver<
        MockTransmitter,
        MockOutput,
        MockBidi,
        MockCurrentLimitPins,
        MockAckLine,
        MockAnalog,
        Arc<MockClock>,
        MockSettingsStore,
    >;

    fn driver(store: MockSettingsStore) -> MockDriver {
        let clock = Arc::new(MockClock::new());
        TrackDriver::new(
            Peripherals {
                transmitter: MockTransmitter::new().with_clock(Arc::clone(&clock)),
                output: MockOutput::new(),
                bidi: MockBidi::new(),
                current_limit: MockCurrentLimitPins::new(),
                ack: MockAckLine::new(),
            },
            MockAnalog::flat(0),
            clock,
            Arc::new(store),
            Arc::new(TrackBuffers::default()),
        )
        .with_timeouts(SessionTimeouts {
            dcc: Duration::from_millis(10),
            decup: Duration::from_millis(10),
            mdu: Duration::from_millis(10),
        })
    }

    // =========================================================================
    // Session Tests
    // =========================================================================

    #[test]
    fn dcc_session_resumes_runs_and_suspends() {
        let arbiter = Arc::new(ModeArbiter::new());
        let mut driver = driver(MockSettingsStore::new());
        driver.buffers().tx_front.send(make_idle_packet());

        let token = arbiter.try_acquire(TrackMode::DccOperations).unwrap();
        driver.run(token).unwrap();

        let (tx, output, bidi, pins, _) = driver.peripherals();
        assert_eq!(tx.count(), 3);
        assert_eq!(
            output.history,
            vec![(true, false), (true, false), (false, false), (false, true)]
        );
        assert!(!bidi.enabled);
        assert_eq!(bidi.cutouts, 3);
        assert_eq!(*pins.history.last().unwrap(), CurrentLimit::Ma4100.levels());
        assert!(arbiter.load().is_suspended());
        assert!(driver.buffers().feedback.is_empty());
    }

    #[test]
    fn unsupported_mode_leaves_outputs_alone() {
        let arbiter = Arc::new(ModeArbiter::new());
        let mut driver = driver(MockSettingsStore::new());

        let token = arbiter.try_acquire(TrackMode::Zusi).unwrap();
        assert_eq!(
            driver.run(token),
            Err(TrackError::UnsupportedMode(TrackMode::Zusi))
        );
        assert!(driver.peripherals().1.history.is_empty());
        assert!(arbiter.load().is_suspended());
    }

    #[test]
    fn settings_are_loaded_at_resume() {
        use crate::config::SettingKey;

        let arbiter = Arc::new(ModeArbiter::new());
        let store = MockSettingsStore::new().with(SettingKey::DccBiDiBitDuration, 0);
        let mut driver = driver(store);
        driver.buffers().tx_front.send(make_idle_packet());

        let token = arbiter.try_acquire(TrackMode::DccOperations).unwrap();
        driver.run(token).unwrap();
        assert_eq!(driver.peripherals().2.cutouts, 0);
    }

    #[test]
    fn short_circuit_is_left_latched() {
        let arbiter = Arc::new(ModeArbiter::new());
        let mut driver = driver(MockSettingsStore::new());

        let token = arbiter.try_acquire(TrackMode::DecupZsu).unwrap();
        arbiter.short_circuit();
        driver.run(token).unwrap();

        assert!(arbiter.load().is_short_circuit());
        assert!(arbiter.try_acquire(TrackMode::DccOperations).is_err());
        assert!(arbiter.clear_short_circuit());
    }

    // =========================================================================
    // Thread Tests
    // =========================================================================

    #[test]
    fn spawned_driver_serves_tokens_in_turn() {
        let arbiter = Arc::new(ModeArbiter::new());
        let driver = driver(MockSettingsStore::new());
        let buffers = Arc::clone(driver.buffers());
        let handle = driver.spawn(TaskConfig::new("track-test")).unwrap();

        for mode in [TrackMode::DccService, TrackMode::DecupZsu] {
            let token = arbiter.try_acquire(mode).unwrap();
            handle.resume(token).unwrap();

            let start = Instant::now();
            while !arbiter.load().is_suspended() {
                assert!(start.elapsed() < Duration::from_secs(5));
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(buffers.rx.try_receive(), None::<Reply>);
    }
}
