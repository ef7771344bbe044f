//! Mock implementations for testing without hardware.
//!
//! This module provides test doubles for all hardware and collaborator
//! traits, enabling development and testing on desktop without a board.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockClock`] | [`Clock`] | Controllable time source, optional auto-advance |
//! | [`MockTransmitter`] | [`TrackTransmitter`] | Records transmitted frames |
//! | [`MockOutput`] | [`TrackOutput`] | Tracks enable/force-low lines |
//! | [`MockBidi`] | [`BidiReceiver`] | Scripted decoder answers, runs the real [`Cutout`] |
//! | [`MockCurrentLimitPins`] | [`CurrentLimitPins`] | Records ILIM levels |
//! | [`MockAckLine`] | [`AckLine`] | Scripted ACK edges |
//! | [`MockAnalog`] | [`AnalogMeasurements`] | Scripted current windows |
//! | [`MockSettingsStore`] | [`SettingsStore`] | In-memory settings |
//! | [`MockLocoStore`] | [`LocoStore`] | In-memory loco table |
//! | [`MockBroadcaster`] | [`Broadcaster`] | Records notifications |
//!
//! # Example
//!
//! ```rust
//! use zimo_track::current_limit::{CurrentLimit, CurrentLimiter};
//! use zimo_track::hal::MockCurrentLimitPins;
//!
//! let mut limiter = CurrentLimiter::new(MockCurrentLimitPins::new());
//! limiter.set(CurrentLimit::Ma1300).unwrap();
//!
//! assert_eq!(limiter.get(), CurrentLimit::Ma1300);
//! assert_eq!(limiter.pins().history, vec![(false, true)]);
//! ```
//!
//! [`Clock`]: crate::traits::Clock
//! [`TrackTransmitter`]: crate::traits::TrackTransmitter
//! [`TrackOutput`]: crate::traits::TrackOutput
//! [`BidiReceiver`]: crate::traits::BidiReceiver
//! [`CurrentLimitPins`]: crate::traits::CurrentLimitPins
//! [`AckLine`]: crate::traits::AckLine
//! [`AnalogMeasurements`]: crate::traits::AnalogMeasurements
//! [`SettingsStore`]: crate::traits::SettingsStore
//! [`LocoStore`]: crate::traits::LocoStore
//! [`Broadcaster`]: crate::traits::Broadcaster

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bidi::{Cutout, CutoutFlags, TCE_MIN};
use crate::config::{CutoutOffsets, SettingKey};
use crate::dcc::Loco;
use crate::encoder::RmtSymbol;
use crate::traits::{
    AckLine, AnalogMeasurements, BidiReceiver, Broadcaster, Clock, CurrentLimitPins,
    CurrentWindow, LocoStore, SettingsStore, TrackOutput, TrackTransmitter,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Hardware Mocks
// ============================================================================

/// Mock clock for testing.
///
/// Time only moves through [`advance_us`](Self::advance_us), delays, or, if
/// created with [`with_step_us`](Self::with_step_us), by a fixed step on
/// every read. The auto-advance lets busy-wait windows expire
/// deterministically.
///
/// # Example
///
/// ```rust
/// use zimo_track::hal::MockClock;
/// use zimo_track::traits::Clock;
///
/// let clock = MockClock::new();
/// assert_eq!(clock.now_ms(), 0);
///
/// clock.advance_us(1_500);
/// assert_eq!(clock.now_us(), 1_500);
///
/// clock.delay_ms(1);
/// assert_eq!(clock.now_us(), 2_500);
/// ```
#[derive(Debug, Default)]
pub struct MockClock {
    now_us: AtomicU64,
    step_us: u64,
}

impl MockClock {
    /// Creates a clock at 0 that only moves when told to.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock that advances `step_us` on every read.
    pub fn with_step_us(step_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(0),
            step_us,
        }
    }

    /// Advances the clock.
    pub fn advance_us(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }

    /// Sets the current time.
    pub fn set_us(&self, us: u64) {
        self.now_us.store(us, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> u64 {
        self.now_us.fetch_add(self.step_us, Ordering::SeqCst)
    }

    fn delay_us(&self, us: u32) {
        self.advance_us(us as u64);
    }
}

/// Mock RMT channel.
///
/// Every transmission is recorded as one frame. With a clock attached, each
/// frame advances it by the frame's duration.
#[derive(Debug, Default)]
pub struct MockTransmitter {
    /// Transmitted frames in order.
    pub frames: Vec<Vec<RmtSymbol>>,
    /// Clock advanced by each frame.
    pub clock: Option<Arc<MockClock>>,
    /// Fail every transmission.
    pub fail: bool,
}

impl MockTransmitter {
    /// Creates a transmitter without clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances `clock` by the duration of every frame.
    pub fn with_clock(mut self, clock: Arc<MockClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Number of transmitted frames.
    pub fn count(&self) -> usize {
        self.frames.len()
    }
}

impl TrackTransmitter for MockTransmitter {
    type Error = ();

    fn transmit(&mut self, symbols: &[RmtSymbol]) -> Result<(), ()> {
        if self.fail {
            return Err(());
        }
        if let Some(clock) = &self.clock {
            clock.advance_us(symbols.iter().map(|s| s.duration() as u64).sum());
        }
        self.frames.push(symbols.to_vec());
        Ok(())
    }
}

/// Mock H-bridge control lines.
///
/// `history` records `(enable, force_low)` after every change.
#[derive(Debug, Default)]
pub struct MockOutput {
    /// Enable line.
    pub enable: bool,
    /// Force-low line.
    pub force_low: bool,
    /// Line states after each call.
    pub history: Vec<(bool, bool)>,
}

impl MockOutput {
    /// Creates an output with both lines low.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrackOutput for MockOutput {
    type Error = ();

    fn set_enable(&mut self, enabled: bool) -> Result<(), ()> {
        self.enable = enabled;
        self.history.push((self.enable, self.force_low));
        Ok(())
    }

    fn set_force_low(&mut self, force_low: bool) -> Result<(), ()> {
        self.force_low = force_low;
        self.history.push((self.enable, self.force_low));
        Ok(())
    }
}

/// Mock BiDi receiver.
///
/// Each cutout consumes one scripted reply `(channel 1 bytes, channel 2
/// bytes)` and steps the real [`Cutout`] machine: channel 1 bytes are in the
/// FIFO before the TS2 sample, channel 2 bytes arrive before TCE.
///
/// # Example
///
/// ```rust
/// use zimo_track::hal::MockBidi;
/// use zimo_track::traits::BidiReceiver;
///
/// let mut bidi = MockBidi::new();
/// bidi.set_enabled(true).unwrap();
/// bidi.replies.push_back((vec![], vec![0xA5, 0xA6]));
///
/// let flags = bidi.wait_cutout().unwrap();
/// assert!(!flags.ch1());
/// assert_eq!(bidi.available().unwrap(), 2);
/// ```
#[derive(Debug)]
pub struct MockBidi {
    /// Cutouts armed.
    pub enabled: bool,
    /// Replies for the next cutouts.
    pub replies: VecDeque<(Vec<u8>, Vec<u8>)>,
    /// Receive FIFO.
    pub fifo: Vec<u8>,
    /// BiDi-enable line.
    pub bidi_en: bool,
    /// Completed cutouts.
    pub cutouts: usize,
    /// FIFO flushes.
    pub flushes: usize,
    cutout: Cutout,
}

impl Default for MockBidi {
    fn default() -> Self {
        Self {
            enabled: false,
            replies: VecDeque::new(),
            fifo: Vec::new(),
            bidi_en: false,
            cutouts: 0,
            flushes: 0,
            cutout: Cutout::new(CutoutOffsets::default()),
        }
    }
}

impl MockBidi {
    /// Creates a disarmed receiver without replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply with channel 2 data only.
    pub fn reply_channel2(&mut self, bytes: &[u8]) {
        self.replies.push_back((Vec::new(), bytes.to_vec()));
    }
}

impl BidiReceiver for MockBidi {
    type Error = ();

    fn set_enabled(&mut self, enabled: bool) -> Result<(), ()> {
        self.enabled = enabled;
        if !enabled {
            self.bidi_en = false;
        }
        Ok(())
    }

    fn wait_cutout(&mut self) -> Result<CutoutFlags, ()> {
        if !self.enabled {
            return Err(());
        }
        let (ch1, ch2) = self.replies.pop_front().unwrap_or_default();
        self.fifo.extend(ch1);
        let mut ch2 = Some(ch2);

        let mut step = self.cutout.on_tx_done();
        loop {
            if let Some(level) = step.bidi_en {
                self.bidi_en = level;
            }
            if let Some(flags) = step.notify {
                self.cutouts += 1;
                return Ok(flags);
            }
            let Some(alarm) = step.alarm else {
                return Err(());
            };
            if alarm >= TCE_MIN {
                if let Some(bytes) = ch2.take() {
                    self.fifo.extend(bytes);
                }
            }
            step = self.cutout.on_alarm(alarm, self.fifo.len());
        }
    }

    fn available(&mut self) -> Result<usize, ()> {
        Ok(self.fifo.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ()> {
        let n = buf.len().min(self.fifo.len());
        buf[..n].copy_from_slice(&self.fifo[..n]);
        self.fifo.drain(..n);
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), ()> {
        self.fifo.clear();
        self.flushes += 1;
        Ok(())
    }
}

/// Mock current limit pins.
#[derive(Debug, Default)]
pub struct MockCurrentLimitPins {
    /// ILIM1.
    pub ilim1: bool,
    /// ILIM0.
    pub ilim0: bool,
    /// Levels written, in order.
    pub history: Vec<(bool, bool)>,
}

impl MockCurrentLimitPins {
    /// Creates pins with both levels low.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CurrentLimitPins for MockCurrentLimitPins {
    type Error = ();

    fn set_levels(&mut self, ilim1: bool, ilim0: bool) -> Result<(), ()> {
        self.ilim1 = ilim1;
        self.ilim0 = ilim0;
        self.history.push((ilim1, ilim0));
        Ok(())
    }

    fn levels(&self) -> (bool, bool) {
        (self.ilim1, self.ilim0)
    }
}

/// Mock ACK input.
///
/// Every [`arm`](AckLine::arm) takes the next scripted `(edge count, first
/// edge ticks)`. Without script the line stays silent.
#[derive(Debug, Default)]
pub struct MockAckLine {
    /// Answers for the next arms.
    pub script: VecDeque<(u8, Option<u32>)>,
    /// Number of arms.
    pub arms: usize,
    edges: u8,
    first_edge: Option<u32>,
}

impl MockAckLine {
    /// Creates a silent line.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `edges` pulses for the next arm (DECUP).
    pub fn pulses(&mut self, edges: u8) {
        self.script.push_back((edges, None));
    }

    /// Queues a first edge at `ticks` for the next arm (MDU).
    pub fn edge_at(&mut self, ticks: u32) {
        self.script.push_back((1, Some(ticks)));
    }
}

impl AckLine for MockAckLine {
    type Error = ();

    fn arm(&mut self) -> Result<(), ()> {
        let (edges, first_edge) = self.script.pop_front().unwrap_or((0, None));
        self.edges = edges;
        self.first_edge = first_edge;
        self.arms += 1;
        Ok(())
    }

    fn edge_count(&self) -> u8 {
        self.edges
    }

    fn first_edge_ticks(&self) -> Option<u32> {
        self.first_edge
    }
}

// ============================================================================
// Collaborator Mocks
// ============================================================================

/// Mock ADC task.
///
/// Every peek moves on to the next scripted window; once the script is
/// exhausted the last window repeats.
#[derive(Debug, Default)]
pub struct MockAnalog {
    windows: Mutex<VecDeque<CurrentWindow>>,
    last: Mutex<CurrentWindow>,
}

impl MockAnalog {
    /// Creates an ADC reporting an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an ADC reporting `value` on every sample.
    pub fn flat(value: u16) -> Self {
        let analog = Self::new();
        analog.push_window(&[value; crate::traits::CURRENT_WINDOW_SAMPLES]);
        analog
    }

    /// Queues a window, truncated to the window size.
    pub fn push_window(&self, samples: &[u16]) {
        let window = samples
            .iter()
            .copied()
            .take(crate::traits::CURRENT_WINDOW_SAMPLES)
            .collect();
        lock(&self.windows).push_back(window);
    }
}

impl AnalogMeasurements for MockAnalog {
    fn peek_currents(&self) -> CurrentWindow {
        let mut last = lock(&self.last);
        if let Some(next) = lock(&self.windows).pop_front() {
            *last = next;
        }
        last.clone()
    }
}

/// Mock settings store.
#[derive(Debug, Default)]
pub struct MockSettingsStore {
    /// Stored values.
    pub values: HashMap<SettingKey, u16>,
}

impl MockSettingsStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value.
    pub fn with(mut self, key: SettingKey, value: u16) -> Self {
        self.values.insert(key, value);
        self
    }
}

impl SettingsStore for MockSettingsStore {
    type Error = ();

    fn get(&self, key: SettingKey) -> Option<u16> {
        self.values.get(&key).copied()
    }

    fn set(&mut self, key: SettingKey, value: u16) -> Result<(), ()> {
        self.values.insert(key, value);
        Ok(())
    }
}

/// Mock loco store.
#[derive(Debug, Default)]
pub struct MockLocoStore {
    /// Stored locos.
    pub locos: Mutex<BTreeMap<u16, Loco>>,
    /// Number of writes.
    pub writes: AtomicUsize,
}

impl MockLocoStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a loco.
    pub fn with_loco(self, addr: u16, loco: Loco) -> Self {
        lock(&self.locos).insert(addr, loco);
        self
    }

    /// Copy of a stored loco.
    pub fn get(&self, addr: u16) -> Option<Loco> {
        lock(&self.locos).get(&addr).cloned()
    }
}

impl LocoStore for MockLocoStore {
    type Error = ();

    fn load_all(&self) -> Result<Vec<(u16, Loco)>, ()> {
        Ok(lock(&self.locos)
            .iter()
            .map(|(&addr, loco)| (addr, loco.clone()))
            .collect())
    }

    fn set(&self, addr: u16, loco: &Loco) -> Result<(), ()> {
        lock(&self.locos).insert(addr, loco.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn erase(&self, addr: u16) -> Result<(), ()> {
        lock(&self.locos).remove(&addr);
        Ok(())
    }

    fn erase_all(&self) -> Result<(), ()> {
        lock(&self.locos).clear();
        Ok(())
    }
}

/// Notification recorded by [`MockBroadcaster`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastEvent {
    /// `cv_ack(cv, byte)`.
    CvAck(u16, u8),
    /// `cv_nack()`.
    CvNack,
    /// `cv_nack_short_circuit()`.
    CvNackShortCircuit,
    /// `broadcast_loco_info(addr)`.
    LocoInfo(u16),
    /// `broadcast_rail_com_data(addr)`.
    RailComData(u16),
    /// `broadcast_track_power_off()`.
    TrackPowerOff,
}

/// Mock front-end broadcast path.
#[derive(Debug, Default)]
pub struct MockBroadcaster {
    events: Mutex<Vec<BroadcastEvent>>,
}

impl MockBroadcaster {
    /// Creates a broadcaster without events.
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications so far.
    pub fn events(&self) -> Vec<BroadcastEvent> {
        lock(&self.events).clone()
    }

    /// Notifications matching `f`.
    pub fn count(&self, f: impl Fn(&BroadcastEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| f(e)).count()
    }

    fn record(&self, event: BroadcastEvent) {
        lock(&self.events).push(event);
    }
}

impl Broadcaster for MockBroadcaster {
    fn cv_ack(&self, cv: u16, byte: u8) {
        self.record(BroadcastEvent::CvAck(cv, byte));
    }

    fn cv_nack(&self) {
        self.record(BroadcastEvent::CvNack);
    }

    fn cv_nack_short_circuit(&self) {
        self.record(BroadcastEvent::CvNackShortCircuit);
    }

    fn broadcast_loco_info(&self, addr: u16) {
        self.record(BroadcastEvent::LocoInfo(addr));
    }

    fn broadcast_rail_com_data(&self, addr: u16) {
        self.record(BroadcastEvent::RailComData(addr));
    }

    fn broadcast_track_power_off(&self) {
        self.record(BroadcastEvent::TrackPowerOff);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bidi::encode_symbol;

    // =========================================================================
    // MockClock Tests
    // =========================================================================

    #[test]
    fn mock_clock_steps_on_read() {
        let clock = MockClock::with_step_us(10);
        assert_eq!(clock.now_us(), 0);
        assert_eq!(clock.now_us(), 10);
        clock.set_us(1_000);
        assert_eq!(clock.now_ms(), 1);
    }

    // =========================================================================
    // MockTransmitter Tests
    // =========================================================================

    #[test]
    fn mock_transmitter_advances_clock() {
        let clock = Arc::new(MockClock::new());
        let mut tx = MockTransmitter::new().with_clock(Arc::clone(&clock));
        tx.transmit(&[RmtSymbol::bit(58), RmtSymbol::bit(100)]).unwrap();
        assert_eq!(tx.count(), 1);
        assert_eq!(clock.now_us(), 316);

        tx.fail = true;
        assert!(tx.transmit(&[]).is_err());
    }

    // =========================================================================
    // MockBidi Tests
    // =========================================================================

    #[test]
    fn mock_bidi_reports_channel1() {
        let mut bidi = MockBidi::new();
        bidi.set_enabled(true).unwrap();
        let ch1 = vec![encode_symbol(0x10), encode_symbol(0x03)];
        bidi.replies.push_back((ch1, vec![]));

        let flags = bidi.wait_cutout().unwrap();
        assert!(flags.ch1());
        assert!(flags.ch2());
        assert!(!bidi.bidi_en);
        assert_eq!(bidi.cutouts, 1);

        let mut buf = [0u8; 8];
        assert_eq!(bidi.read(&mut buf).unwrap(), 2);
        bidi.flush().unwrap();
        assert_eq!(bidi.available().unwrap(), 0);
    }

    #[test]
    fn mock_bidi_disarmed_fails() {
        let mut bidi = MockBidi::new();
        assert!(bidi.wait_cutout().is_err());
    }

    // =========================================================================
    // MockAckLine Tests
    // =========================================================================

    #[test]
    fn mock_ack_line_follows_script() {
        let mut ack = MockAckLine::new();
        ack.pulses(2);
        ack.edge_at(1234);

        ack.arm().unwrap();
        assert_eq!(ack.edge_count(), 2);
        ack.arm().unwrap();
        assert_eq!(ack.first_edge_ticks(), Some(1234));
        ack.arm().unwrap();
        assert_eq!(ack.edge_count(), 0);
        assert_eq!(ack.arms, 3);
    }

    // =========================================================================
    // Collaborator Mock Tests
    // =========================================================================

    #[test]
    fn mock_analog_repeats_last_window() {
        let analog = MockAnalog::flat(300);
        analog.push_window(&[400; 10]);
        assert_eq!(analog.peek_currents()[0], 300);
        assert_eq!(analog.peek_currents().len(), 10);
        assert_eq!(analog.peek_currents()[0], 400);
    }

    #[test]
    fn mock_broadcaster_records() {
        let broadcaster = MockBroadcaster::new();
        broadcaster.cv_ack(7, 42);
        broadcaster.cv_nack();
        assert_eq!(
            broadcaster.events(),
            vec![BroadcastEvent::CvAck(7, 42), BroadcastEvent::CvNack]
        );
        assert_eq!(broadcaster.count(|e| *e == BroadcastEvent::CvNack), 1);
    }

    #[test]
    fn mock_loco_store_roundtrip() {
        let store = MockLocoStore::new().with_loco(3, Loco::named("BR85"));
        store.set(10, &Loco::default()).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 2);
        store.erase(3).unwrap();
        assert!(store.get(3).is_none());
        store.erase_all().unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
