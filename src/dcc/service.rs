//! DCC middleware service.
//!
//! Sits between the front-ends and the track driver. It owns the loco table
//! and the pending CV requests, keeps the back queue filled with refresh
//! traffic and turns BiDi feedback into loco state and POM answers.
//!
//! # Sessions
//!
//! [`DccService::start`] claims the track and spawns the service thread:
//!
//! | Phase | Operations | Service |
//! |-------|------------|---------|
//! | resume | preload idle packets, resume driver | preload reset packets, resume driver |
//! | loop | fill back queue, decode feedback, every 20 ms | work off CV requests |
//! | suspend | clear requests, reset scheduler, power off broadcast | same |
//!
//! A queued CV request switches a running operations session to service mode:
//! the service asks the driver to suspend, waits until the track is released,
//! then claims it again for `DccService`.
//!
//! # Locking
//!
//! The loco table and the persistence call that follows a change are done
//! under one lock, so the store never lags behind the table. The table is
//! always locked before the request state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::bidi::{App, Dissector, DYN_QOS, DYN_SPEED1, DYN_SPEED2};
use crate::buffers::{Reply, TrackBuffers};
use crate::channel::MessageBuffer;
use crate::config::{ProgrammingType, Settings};
use crate::error::{Result, TrackError};
use crate::packet::{
    decode_address, decode_cv_address, make_cv_access_long_verify_packet,
    make_cv_access_long_verify_service_bit_packet, make_cv_access_long_verify_service_packet,
    make_cv_access_long_write_packet, make_cv_access_long_write_service_packet,
    make_feature_expansion_f20_f13_packet, make_feature_expansion_f28_f21_packet,
    make_idle_packet, make_reset_packet, Address, Packet, MAX_LOCO_ADDRESS,
};
use crate::state::{ModeArbiter, ModeToken, TrackMode};
use crate::task::TaskConfig;
use crate::track::DriverHandle;
use crate::traits::{Broadcaster, Clock, LocoStore, SettingsStore};

use super::cv::{CvRequest, CvRequestDeque, PomRequests};
use super::loco::{Loco, Mode, NvLocoBase, RailComData, RailComOptions, SpeedSteps};
use super::scheduler::PriorityScheduler;

/// Longest wait for one service mode ACK (256 verifies of 10 ms).
pub const SERVICE_ACK_TIMEOUT: Duration = Duration::from_millis(255 * 10);

/// Time one programming packet occupies the track [ms].
pub const PROGRAM_PACKET_MS: u64 = 10;

/// Function bits carried by the F13 to F20 packet.
pub const F20_F13_MASK: u32 = 0x001F_E000;

/// Function bits carried by the F21 to F28 packet.
pub const F28_F21_MASK: u32 = 0x1FE0_0000;

const INJECT_SLICE: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn store_error<E: core::fmt::Debug>(err: E) -> TrackError {
    TrackError::Store(format!("{:?}", err))
}

#[derive(Debug, Default)]
struct Requests {
    scheduler: PriorityScheduler,
    cv: CvRequestDeque,
    pom: PomRequests,
}

/// DCC middleware between the front-ends and the track driver.
///
/// Share it as `Arc<DccService<..>>`: front-ends call the loco and CV methods
/// from their own threads while the session runs on the service thread.
pub struct DccService<L, B, S: ?Sized, C> {
    arbiter: Arc<ModeArbiter>,
    driver: DriverHandle,
    buffers: Arc<TrackBuffers>,
    loco_store: L,
    broadcaster: B,
    clock: C,
    config: TaskConfig,
    locos: Mutex<BTreeMap<u16, Loco>>,
    requests: Mutex<Requests>,
    settings: Mutex<Settings>,
    running: AtomicBool,
    settings_store: Arc<S>,
}

impl<L, B, S, C> DccService<L, B, S, C>
where
    L: LocoStore + 'static,
    B: Broadcaster + 'static,
    S: SettingsStore + Send + Sync + ?Sized + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Creates the service and loads the loco table from `loco_store`.
    pub fn new(
        arbiter: Arc<ModeArbiter>,
        driver: DriverHandle,
        buffers: Arc<TrackBuffers>,
        settings_store: Arc<S>,
        loco_store: L,
        broadcaster: B,
        clock: C,
    ) -> Result<Self> {
        let locos: BTreeMap<u16, Loco> = loco_store
            .load_all()
            .map_err(store_error)?
            .into_iter()
            .filter(|(addr, _)| {
                let valid = is_loco_address(*addr);
                if !valid {
                    log::warn!("Ignoring stored loco with address {}", addr);
                }
                valid
            })
            .collect();
        log::info!("Got {} locos from store", locos.len());
        for (addr, loco) in &locos {
            log::info!("Loco: addr {}, name {}", addr, loco.base.name);
        }

        let settings = Settings::load(&*settings_store);
        Ok(Self {
            arbiter,
            driver,
            buffers,
            loco_store,
            broadcaster,
            clock,
            config: TaskConfig::dcc_service(),
            locos: Mutex::new(locos),
            requests: Mutex::new(Requests::default()),
            settings: Mutex::new(settings),
            running: AtomicBool::new(false),
            settings_store,
        })
    }

    /// Builder: set the task configuration.
    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    /// Loco persistence.
    pub fn loco_store(&self) -> &L {
        &self.loco_store
    }

    /// Front-end broadcast path.
    pub fn broadcaster(&self) -> &B {
        &self.broadcaster
    }

    /// Settings loaded at the last resume.
    pub fn settings(&self) -> Settings {
        lock(&self.settings).clone()
    }

    /// True while a session thread is alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Read access to the loco table.
    pub fn with_locos<R>(&self, f: impl FnOnce(&BTreeMap<u16, Loco>) -> R) -> R {
        f(&lock(&self.locos))
    }

    // ========================================================================
    // Track power
    // ========================================================================

    /// Claims the track for `mode` and starts a session thread.
    ///
    /// Only `DccOperations` and `DccService` are served here.
    pub fn start(self: &Arc<Self>, mode: TrackMode) -> Result<()> {
        if !matches!(mode, TrackMode::DccOperations | TrackMode::DccService) {
            return Err(TrackError::UnsupportedMode(mode));
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(TrackError::ModeConflict);
        }
        let token = match self.arbiter.try_acquire(mode) {
            Ok(token) => token,
            Err(state) => {
                self.running.store(false, Ordering::Release);
                log::warn!("Can't start {:?}, track is {:?}", mode, state);
                return Err(TrackError::ModeConflict);
            }
        };

        let service = Arc::clone(self);
        let spawned = self.config.spawn(move || {
            service.session(token);
            service.running.store(false, Ordering::Release);
        });
        if spawned.is_err() {
            self.running.store(false, Ordering::Release);
        }
        spawned.map(drop)
    }

    /// Clears a latched short circuit and starts operations mode.
    pub fn track_power_on(self: &Arc<Self>) -> Result<()> {
        if self.arbiter.clear_short_circuit() {
            log::info!("Short circuit cleared");
        }
        match self.arbiter.load().mode() {
            Some(TrackMode::DccOperations) => Ok(()),
            _ => self.start(TrackMode::DccOperations),
        }
    }

    /// Asks a running DCC session to end.
    ///
    /// Returns false if no DCC mode owns the track.
    pub fn track_power_off(&self) -> bool {
        match self.arbiter.load().mode() {
            Some(mode @ (TrackMode::DccOperations | TrackMode::DccService)) => {
                self.arbiter.request_suspend(mode)
            }
            _ => false,
        }
    }

    // ========================================================================
    // Locos
    // ========================================================================

    /// Current state of a loco, creating it on first access.
    pub fn loco_info(&self, addr: u16) -> Result<Loco> {
        self.with_loco(addr, |_| false).map(|(loco, _)| loco)
    }

    /// Sets speed steps and direction/speed of a loco.
    ///
    /// Address 0 is sent straight to every decoder and not stored.
    pub fn loco_drive(&self, addr: u16, speed_steps: SpeedSteps, rvvvvvvv: u8) -> Result<()> {
        if addr == 0 {
            let loco = Loco {
                base: NvLocoBase {
                    speed_steps,
                    ..Default::default()
                },
                rvvvvvvv,
                ..Default::default()
            };
            let count = self.settings().dcc_program_packet_count;
            self.inject(
                &self.buffers.tx_front,
                &loco.speed_packet(Address::BROADCAST),
                count,
            );
            return Ok(());
        }

        let (_, changed) = self.with_loco(addr, |loco| {
            if loco.base.speed_steps == speed_steps && loco.rvvvvvvv == rvvvvvvv {
                return false;
            }
            loco.base.speed_steps = speed_steps;
            loco.rvvvvvvv = rvvvvvvv;
            loco.priority = Loco::MIN_PRIORITY;
            true
        })?;
        if changed {
            self.broadcaster.broadcast_loco_info(addr);
        }
        Ok(())
    }

    /// Sets the functions selected by `mask` to `state`.
    ///
    /// Unless F13 to F28 are part of the refresh, changed groups of those are
    /// sent once.
    ///
    /// Address 0 is ignored.
    pub fn loco_function(&self, addr: u16, mask: u32, state: u32) -> Result<()> {
        if addr == 0 {
            return Ok(());
        }
        let (loco, changed) = self.with_loco(addr, |loco| {
            let f31_0 = (!mask & loco.f31_0) | (mask & state);
            if f31_0 == loco.f31_0 {
                return false;
            }
            loco.f31_0 = f31_0;
            loco.priority = Loco::MIN_PRIORITY;
            true
        })?;
        if !changed {
            return Ok(());
        }

        let settings = self.settings();
        if let Some(address) = Address::loco(addr, settings.dcc_short_127())
            .filter(|_| !settings.repeat_hfx())
        {
            if mask & F20_F13_MASK != 0 {
                let packet = make_feature_expansion_f20_f13_packet(address, (loco.f31_0 >> 13) as u8);
                self.inject(&self.buffers.tx_back, &packet, 1);
            }
            if mask & F28_F21_MASK != 0 {
                let packet = make_feature_expansion_f28_f21_packet(address, (loco.f31_0 >> 21) as u8);
                self.inject(&self.buffers.tx_back, &packet, 1);
            }
        }

        self.broadcaster.broadcast_loco_info(addr);
        Ok(())
    }

    /// Protocol of a loco.
    pub fn loco_mode(&self, addr: u16) -> Result<Mode> {
        self.with_loco(addr, |_| false)
            .map(|(loco, _)| loco.base.mode)
    }

    /// Changes the protocol of a loco. Only DCC is supported.
    pub fn set_loco_mode(&self, addr: u16, mode: Mode) {
        if mode == Mode::Mm {
            log::warn!("MM not supported (loco {})", addr);
        }
    }

    /// RailCom data of a loco.
    pub fn rail_com_data(&self, addr: u16) -> Result<RailComData> {
        self.with_loco(addr, |_| false)
            .map(|(loco, _)| loco.rail_com_data(addr))
    }

    /// Removes a loco from table and store.
    pub fn erase_loco(&self, addr: u16) -> Result<()> {
        let mut locos = lock(&self.locos);
        locos.remove(&addr);
        self.loco_store.erase(addr).map_err(store_error)
    }

    /// Removes every loco from table and store.
    pub fn erase_all_locos(&self) -> Result<()> {
        let mut locos = lock(&self.locos);
        locos.clear();
        self.loco_store.erase_all().map_err(store_error)
    }

    /// Runs `f` on the loco at `addr` and persists it if `f` changed it.
    ///
    /// A new or unnamed loco is named after its address and always persisted.
    /// The broadcast address and addresses beyond the long range are refused.
    fn with_loco(&self, addr: u16, f: impl FnOnce(&mut Loco) -> bool) -> Result<(Loco, bool)> {
        if !is_loco_address(addr) {
            return Err(TrackError::InvalidAddress(addr));
        }
        let mut locos = lock(&self.locos);
        let loco = locos.entry(addr).or_default();
        let changed = f(loco);
        let unnamed = loco.base.name.is_empty();
        if unnamed {
            loco.base.name = addr.to_string();
        }
        if changed || unnamed {
            self.loco_store.set(addr, loco).map_err(store_error)?;
        }
        Ok((loco.clone(), changed))
    }

    // ========================================================================
    // CV access
    // ========================================================================

    /// Queues a service mode read.
    pub fn cv_read(&self, cv: u16) -> Result<()> {
        self.push_cv_request(CvRequest::read(cv))
    }

    /// Queues a service mode write.
    pub fn cv_write(&self, cv: u16, byte: u8) -> Result<()> {
        self.push_cv_request(CvRequest::write(cv, byte))
    }

    /// Reads a CV on the main track.
    ///
    /// The answer arrives through BiDi; without one within 500 ms the read is
    /// answered with a NACK.
    pub fn cv_pom_read(&self, addr: u16, cv: u16) {
        let settings = self.settings();
        let Some(address) = Address::loco(addr, settings.dcc_short_127()) else {
            log::warn!("POM read of invalid loco address {}", addr);
            self.broadcaster.cv_nack();
            return;
        };
        if !self.owned_by(TrackMode::DccOperations) {
            log::warn!("POM read of loco {} without track power", addr);
            self.broadcaster.cv_nack();
            return;
        }
        if lock(&self.requests)
            .pom
            .push(self.clock.now_ms(), address, cv)
            .is_err()
        {
            log::warn!("POM request queue full");
            self.broadcaster.cv_nack();
            return;
        }

        let count = settings.dcc_program_packet_count;
        self.inject(
            &self.buffers.tx_front,
            &make_cv_access_long_verify_packet(address, cv),
            count,
        );
        thread::sleep(program_delay(count));
    }

    /// Writes a CV on the main track.
    pub fn cv_pom_write(&self, addr: u16, cv: u16, byte: u8) {
        let settings = self.settings();
        if !self.owned_by(TrackMode::DccOperations) {
            log::warn!("POM write of loco {} without track power", addr);
            return;
        }
        let Some(address) = Address::loco(addr, settings.dcc_short_127()) else {
            log::warn!("POM write of invalid loco address {}", addr);
            return;
        };
        let count = settings.dcc_program_packet_count;
        self.inject(
            &self.buffers.tx_front,
            &make_cv_access_long_write_packet(address, cv, byte),
            count,
        );
        thread::sleep(program_delay(count));
    }

    fn push_cv_request(&self, request: CvRequest) -> Result<()> {
        lock(&self.requests)
            .cv
            .push_back(request)
            .map_err(|_| TrackError::QueueFull)
    }

    fn has_cv_requests(&self) -> bool {
        !lock(&self.requests).cv.is_empty()
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Tops up the back queue with refresh traffic.
    pub fn fill_back_queue(&self) {
        let settings = self.settings();
        let mut locos = lock(&self.locos);
        let mut requests = lock(&self.requests);
        requests.scheduler.fill(
            &mut locos,
            &self.buffers.tx_back,
            settings.dcc_short_127(),
            settings.repeat_hfx(),
        );
    }

    /// Decodes all queued BiDi feedback and expires overdue POM reads.
    pub fn process_feedback(&self) {
        while let Some(feedback) = self.buffers.feedback.try_receive() {
            let addr = decode_address(&feedback.packet);
            if !addr.is_loco() {
                continue;
            }
            let Some(dissector) = Dissector::new(&feedback.datagram) else {
                continue;
            };
            for app in dissector.channel2() {
                match *app {
                    App::Pom(value) => self.pom_answer(&feedback.packet, addr, value),
                    App::Dyn { d, x } => self.dyn_data(addr.value, d, x),
                    other => log::debug!("Ignoring {:?} from loco {}", other, addr.value),
                }
            }
        }

        loop {
            let expired = lock(&self.requests).pom.expire(self.clock.now_ms());
            let Some(request) = expired else {
                break;
            };
            log::debug!("POM read of CV {} timed out", request.cv);
            self.broadcaster.cv_nack();
        }
    }

    fn pom_answer(&self, packet: &Packet, addr: Address, value: u8) {
        let Some(cv) = decode_cv_address(packet) else {
            return;
        };
        let resolved = lock(&self.requests).pom.resolve(addr, cv);
        if let Some(request) = resolved {
            self.broadcaster.cv_ack(request.cv, value);
        }
    }

    fn dyn_data(&self, addr: u16, d: u8, x: u8) {
        let changed = {
            let mut locos = lock(&self.locos);
            let Some(loco) = locos.get_mut(&addr) else {
                return;
            };
            let before = loco.bidi;
            let bidi = &mut loco.bidi;
            match x {
                DYN_SPEED1 => {
                    bidi.options = (bidi.options & !RailComOptions::SPEED2) | RailComOptions::SPEED1;
                    bidi.speed = d;
                }
                DYN_SPEED2 => {
                    bidi.options = (bidi.options & !RailComOptions::SPEED1) | RailComOptions::SPEED2;
                    bidi.speed = d;
                }
                DYN_QOS => {
                    bidi.options |= RailComOptions::QOS;
                    bidi.qos = d;
                }
                _ => return,
            }
            loco.bidi != before
        };
        if changed {
            self.broadcaster.broadcast_rail_com_data(addr);
        }
    }

    // ========================================================================
    // Session
    // ========================================================================

    fn session(&self, token: ModeToken) {
        let mode = token.mode();
        self.resume(mode);
        if let Err(e) = self.driver.resume(token) {
            log::error!("Can't resume track driver: {}", e);
            self.suspend();
            return;
        }

        match mode {
            TrackMode::DccService => self.service_loop(),
            _ => self.operations_loop(mode),
        }

        self.wait_released();
        self.suspend();
    }

    fn resume(&self, mode: TrackMode) {
        log::info!("DCC service resuming in {:?}", mode);
        *lock(&self.settings) = Settings::load(&*self.settings_store);

        let packet = if mode == TrackMode::DccOperations {
            make_idle_packet()
        } else {
            make_reset_packet()
        };
        let queue = &self.buffers.tx_back;
        while queue.spaces_available() * 2 > queue.capacity() {
            if queue.try_send(packet.clone()).is_err() {
                break;
            }
        }
    }

    /// Drops every pending request, each still gets its one answer.
    fn suspend(&self) {
        let short_circuit = self.arbiter.load().is_short_circuit();
        let pending = {
            let mut requests = lock(&self.requests);
            requests.scheduler.reset();
            requests.pom.clear();
            let pending = requests.cv.len();
            requests.cv.clear();
            pending
        };
        for _ in 0..pending {
            if short_circuit {
                self.broadcaster.cv_nack_short_circuit();
            } else {
                self.broadcaster.cv_nack();
            }
        }
        self.broadcaster.broadcast_track_power_off();
        log::info!("DCC service suspended");
    }

    fn operations_loop(&self, mode: TrackMode) {
        while self.owned_by(mode) {
            self.fill_back_queue();
            self.process_feedback();
            thread::sleep(self.config.timeout);

            if self.has_cv_requests() {
                return self.service_loop();
            }
        }
    }

    /// True while `mode` owns the track and nobody asked it to leave.
    fn owned_by(&self, mode: TrackMode) -> bool {
        let state = self.arbiter.load();
        state.mode() == Some(mode) && !state.exit_requested()
    }

    /// Waits until the driver released a DCC session.
    fn wait_released(&self) {
        while matches!(
            self.arbiter.load().mode(),
            Some(TrackMode::DccOperations | TrackMode::DccService)
        ) {
            thread::sleep(self.config.timeout);
        }
    }

    /// Queues `n` copies of `packet`, blocking while `queue` is full.
    ///
    /// Gives up once no DCC session is left to drain the queue.
    fn inject(&self, queue: &MessageBuffer<Packet>, packet: &Packet, n: u8) -> bool {
        for _ in 0..n {
            let mut item = packet.clone();
            while let Err(rejected) = queue.send_timeout(item, INJECT_SLICE) {
                if !self.owned_by(TrackMode::DccOperations) && !self.owned_by(TrackMode::DccService)
                {
                    return false;
                }
                item = rejected;
            }
        }
        true
    }

    // ========================================================================
    // Service mode
    // ========================================================================

    fn service_loop(&self) {
        if !self.has_cv_requests() {
            return;
        }

        if self.arbiter.load().mode() != Some(TrackMode::DccService) {
            let Some(token) = self.enter_service_mode() else {
                return;
            };
            if let Err(e) = self.driver.resume(token) {
                log::error!("Can't resume track driver: {}", e);
                return;
            }
        }

        while self.owned_by(TrackMode::DccService) {
            let Some(request) = lock(&self.requests).cv.pop_front() else {
                break;
            };
            let result = match request.byte {
                Some(byte) => self.service_write(request.cv, byte),
                None => self.service_read(request.cv),
            };
            log::debug!("CV {} {:?} -> {:?}", request.cv, request.byte, result);

            match result {
                Some(byte) => self.broadcaster.cv_ack(request.cv, byte),
                None if self.arbiter.load().is_short_circuit() => {
                    self.broadcaster.cv_nack_short_circuit()
                }
                None => self.broadcaster.cv_nack(),
            }
        }
    }

    /// Moves the track from operations to service mode.
    ///
    /// Operations peripherals have to be torn down before service mode ones
    /// come up, so the track passes through `Suspended`.
    fn enter_service_mode(&self) -> Option<ModeToken> {
        if !self.arbiter.request_suspend(TrackMode::DccOperations) {
            return None;
        }
        self.wait_released();
        match self.arbiter.try_acquire(TrackMode::DccService) {
            Ok(token) => {
                log::info!("DCC service switched to service mode");
                *lock(&self.settings) = Settings::load(&*self.settings_store);
                Some(token)
            }
            Err(state) => {
                log::warn!("Service mode refused, track is {:?}", state);
                None
            }
        }
    }

    fn service_read(&self, cv: u16) -> Option<u8> {
        let settings = self.settings();
        let programming_type = settings.dcc_programming_type;
        let count = settings.dcc_program_packet_count;
        let to_1 = settings.dcc_bit_verify_to_1;
        let front = &self.buffers.tx_front;

        if programming_type == ProgrammingType::Nothing {
            return None;
        }

        // Brute force
        if !programming_type.bit() {
            for byte in 0..=u8::MAX {
                if !self.inject(front, &make_cv_access_long_verify_service_packet(cv, byte), count)
                {
                    return None;
                }
                if self.receive_bit()? {
                    return Some(byte);
                }
            }
            return None;
        }

        for position in 0..8 {
            let packet = make_cv_access_long_verify_service_bit_packet(cv, to_1, position);
            if !self.inject(front, &packet, count) {
                return None;
            }
        }
        let byte = self.receive_byte(to_1)?;
        if !programming_type.byte() {
            return Some(byte);
        }

        if !self.inject(front, &make_cv_access_long_verify_service_packet(cv, byte), count) {
            return None;
        }
        self.receive_bit()?.then_some(byte)
    }

    fn service_write(&self, cv: u16, byte: u8) -> Option<u8> {
        let count = self.settings().dcc_program_packet_count;
        let packet = make_cv_access_long_write_service_packet(cv, byte);
        if !self.inject(&self.buffers.tx_front, &packet, count) {
            return None;
        }
        self.receive_bit()?.then_some(byte)
    }

    fn receive_bit(&self) -> Option<bool> {
        match self.buffers.rx.receive(SERVICE_ACK_TIMEOUT)? {
            Reply::ServiceAck(ack) => Some(ack),
            other => {
                log::warn!("Unexpected reply {:?} in service mode", other);
                None
            }
        }
    }

    /// Assembles a byte from eight bit verify ACKs, bit 0 first.
    fn receive_byte(&self, to_1: bool) -> Option<u8> {
        let mut byte = 0u8;
        for i in 0..8 {
            let ack = self.receive_bit()?;
            byte |= ((ack == to_1) as u8) << i;
        }
        Some(byte)
    }
}

#[cfg(feature = "json")]
impl<L, B, S, C> DccService<L, B, S, C>
where
    L: LocoStore + 'static,
    B: Broadcaster + 'static,
    S: SettingsStore + Send + Sync + ?Sized + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// JSON document of a loco, `None` if the address is unknown.
    pub fn loco_json(&self, addr: u16) -> Result<Option<String>> {
        lock(&self.locos)
            .get(&addr)
            .map(Loco::to_json)
            .transpose()
    }

    /// Updates a loco from a (partial) JSON document, creating it if needed.
    pub fn put_loco_json(&self, addr: u16, json: &str) -> Result<()> {
        Loco::from_json(json)?;
        let (_, changed) = self.with_loco(addr, |loco| {
            let before = loco.clone();
            loco.update_from_json(json).is_ok() && *loco != before
        })?;
        if changed {
            self.broadcaster.broadcast_loco_info(addr);
        }
        Ok(())
    }
}

fn is_loco_address(addr: u16) -> bool {
    (1..=MAX_LOCO_ADDRESS).contains(&addr)
}

/// Track time of `count` programming packets plus one.
fn program_delay(count: u8) -> Duration {
    Duration::from_millis((count as u64 + 1) * PROGRAM_PACKET_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bidi::{encode_symbol, Datagram};
    use crate::buffers::BidiFeedback;
    use crate::config::SettingKey;
    use crate::dcc::cv::CV_REQUEST_CAPACITY;
    use crate::hal::mock::{
        BroadcastEvent, MockBroadcaster, MockClock, MockLocoStore, MockSettingsStore,
    };
    use crate::packet::make_speed_and_direction_packet;
    use std::sync::mpsc::Receiver;

    type TestService = DccService<MockLocoStore, MockBroadcaster, MockSettingsStore, Arc<MockClock>>;

    struct Fixture {
        arbiter: Arc<ModeArbiter>,
        buffers: Arc<TrackBuffers>,
        clock: Arc<MockClock>,
        service: Arc<TestService>,
        _driver: Receiver<ModeToken>,
    }

    impl Fixture {
        fn new(store: MockLocoStore, settings: MockSettingsStore) -> Self {
            let arbiter = Arc::new(ModeArbiter::new());
            let buffers = Arc::new(TrackBuffers::default());
            let clock = Arc::new(MockClock::new());
            let (handle, rx) = DriverHandle::channel();
            let service = DccService::new(
                Arc::clone(&arbiter),
                handle,
                Arc::clone(&buffers),
                Arc::new(settings),
                store,
                MockBroadcaster::new(),
                Arc::clone(&clock),
            )
            .unwrap();
            Self {
                arbiter,
                buffers,
                clock,
                service: Arc::new(service),
                _driver: rx,
            }
        }

        fn events(&self) -> Vec<BroadcastEvent> {
            self.service.broadcaster().events()
        }
    }

    fn pom_datagram(value: u8) -> Datagram {
        let bits = value as u16;
        [
            0,
            0,
            encode_symbol((bits >> 6) as u8 & 0x3F),
            encode_symbol(bits as u8 & 0x3F),
            0,
            0,
            0,
            0,
        ]
    }

    fn dyn_datagram(d: u8, x: u8) -> Datagram {
        let bits = 7u32 << 14 | (d as u32) << 6 | x as u32;
        [
            0,
            0,
            encode_symbol((bits >> 12) as u8 & 0x3F),
            encode_symbol((bits >> 6) as u8 & 0x3F),
            encode_symbol(bits as u8 & 0x3F),
            0,
            0,
            0,
        ]
    }

    // =========================================================================
    // Loco Table Tests
    // =========================================================================

    #[test]
    fn loads_locos_from_store() {
        let store = MockLocoStore::new().with_loco(3, Loco::named("BR85"));
        let f = Fixture::new(store, MockSettingsStore::new());
        assert_eq!(f.service.with_locos(|l| l.len()), 1);
        assert_eq!(f.service.loco_info(3).unwrap().base.name, "BR85");
    }

    #[test]
    fn loco_info_names_and_persists_new_loco() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        let loco = f.service.loco_info(42).unwrap();
        assert_eq!(loco.base.name, "42");
        assert_eq!(f.service.loco_store().get(42).unwrap().base.name, "42");

        f.service.loco_info(42).unwrap();
        assert_eq!(f.service.loco_store().writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn loco_drive_broadcasts_changes_only() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        f.service.loco_drive(3, SpeedSteps::Dcc128, 0x80 | 20).unwrap();
        f.service.loco_drive(3, SpeedSteps::Dcc128, 0x80 | 20).unwrap();

        assert_eq!(f.events(), vec![BroadcastEvent::LocoInfo(3)]);
        assert_eq!(f.service.loco_store().get(3).unwrap().rvvvvvvv, 0x80 | 20);
    }

    #[test]
    fn loco_function_merges_masked_bits() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        f.service.loco_function(3, 0b0101, 0b1111).unwrap();
        assert_eq!(f.service.loco_info(3).unwrap().f31_0, 0b0101);

        f.service.loco_function(3, 0b0011, 0b0010).unwrap();
        assert_eq!(f.service.loco_info(3).unwrap().f31_0, 0b0110);
        assert_eq!(f.service.broadcaster().count(|e| *e == BroadcastEvent::LocoInfo(3)), 2);
    }

    #[test]
    fn broadcast_address_never_enters_the_table() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        f.service.loco_function(0, 0x1, 0x1).unwrap();
        assert_eq!(f.service.loco_info(0), Err(TrackError::InvalidAddress(0)));
        assert_eq!(f.service.loco_mode(0), Err(TrackError::InvalidAddress(0)));
        assert!(f.service.rail_com_data(0).is_err());

        f.service.fill_back_queue();
        assert_eq!(f.service.with_locos(|l| l.len()), 0);
        assert!(f.service.loco_store().get(0).is_none());
        while let Some(packet) = f.buffers.tx_back.try_receive() {
            assert_eq!(packet, make_idle_packet());
        }
        assert!(f.events().is_empty());
    }

    #[test]
    fn addresses_beyond_long_range_are_refused() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        assert_eq!(
            f.service.loco_drive(10240, SpeedSteps::Dcc128, 0x80),
            Err(TrackError::InvalidAddress(10240))
        );
        assert!(f.service.loco_info(10239).is_ok());

        let _token = f.arbiter.try_acquire(TrackMode::DccOperations).unwrap();
        f.service.cv_pom_read(u16::MAX, 1);
        assert_eq!(f.events(), vec![BroadcastEvent::CvNack]);
        assert!(f.buffers.tx_front.is_empty());
    }

    #[test]
    fn stored_broadcast_loco_is_not_loaded() {
        let store = MockLocoStore::new()
            .with_loco(0, Loco::named("all"))
            .with_loco(3, Loco::named("BR85"));
        let f = Fixture::new(store, MockSettingsStore::new());
        assert_eq!(f.service.with_locos(|l| l.keys().copied().collect::<Vec<_>>()), vec![3]);
    }

    #[test]
    fn high_functions_sent_once_while_operating() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        let _token = f.arbiter.try_acquire(TrackMode::DccOperations).unwrap();

        f.service.loco_function(3, 1 << 13, 1 << 13).unwrap();
        assert_eq!(
            f.buffers.tx_back.try_receive(),
            Some(make_feature_expansion_f20_f13_packet(Address::basic_loco(3), 1))
        );
        assert!(f.buffers.tx_back.is_empty());
    }

    #[test]
    fn high_functions_follow_refresh_with_repeat_hfx() {
        let settings = MockSettingsStore::new().with(SettingKey::DccLocoFlags, 0x02);
        let f = Fixture::new(MockLocoStore::new(), settings);
        let _token = f.arbiter.try_acquire(TrackMode::DccOperations).unwrap();

        f.service.loco_function(3, 1 << 13, 1 << 13).unwrap();
        assert!(f.buffers.tx_back.is_empty());
    }

    #[test]
    fn broadcast_drive_goes_to_front_queue() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        let _token = f.arbiter.try_acquire(TrackMode::DccOperations).unwrap();

        f.service.loco_drive(0, SpeedSteps::Dcc28, 0).unwrap();
        assert_eq!(f.buffers.tx_front.len(), 7);
        assert_eq!(
            f.buffers.tx_front.try_receive(),
            Some(make_speed_and_direction_packet(Address::BROADCAST, 0))
        );
        assert_eq!(f.service.with_locos(|l| l.len()), 0);
    }

    #[test]
    fn erase_removes_from_table_and_store() {
        let store = MockLocoStore::new()
            .with_loco(3, Loco::named("a"))
            .with_loco(4, Loco::named("b"));
        let f = Fixture::new(store, MockSettingsStore::new());

        f.service.erase_loco(3).unwrap();
        assert!(f.service.loco_store().get(3).is_none());
        assert_eq!(f.service.with_locos(|l| l.len()), 1);

        f.service.erase_all_locos().unwrap();
        assert!(f.service.loco_store().get(4).is_none());
        assert_eq!(f.service.with_locos(|l| l.len()), 0);
    }

    // =========================================================================
    // CV Request Tests
    // =========================================================================

    #[test]
    fn cv_requests_are_bounded() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        for cv in 0..CV_REQUEST_CAPACITY as u16 {
            f.service.cv_read(cv).unwrap();
        }
        assert_eq!(f.service.cv_write(0, 1), Err(TrackError::QueueFull));
    }

    #[test]
    fn pom_read_without_track_power_nacks() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        f.service.cv_pom_read(3, 28);
        assert_eq!(f.events(), vec![BroadcastEvent::CvNack]);
        assert!(f.buffers.tx_front.is_empty());
    }

    // =========================================================================
    // BiDi Feedback Tests
    // =========================================================================

    #[test]
    fn pom_answer_resolves_request() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        let _token = f.arbiter.try_acquire(TrackMode::DccOperations).unwrap();

        f.service.cv_pom_read(3, 28);
        let packet = f.buffers.tx_front.try_receive().unwrap();
        assert_eq!(packet, make_cv_access_long_verify_packet(Address::basic_loco(3), 28));

        f.buffers.feedback.send(BidiFeedback {
            packet,
            datagram: pom_datagram(0x2A),
        });
        f.service.process_feedback();
        assert_eq!(f.events(), vec![BroadcastEvent::CvAck(28, 0x2A)]);
    }

    #[test]
    fn pom_read_expires_exactly_once() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        let _token = f.arbiter.try_acquire(TrackMode::DccOperations).unwrap();

        f.service.cv_pom_read(3, 28);
        let packet = f.buffers.tx_front.try_receive().unwrap();

        f.clock.set_us(500_000);
        f.service.process_feedback();
        assert!(f.events().is_empty());

        f.clock.set_us(501_000);
        f.service.process_feedback();
        f.service.process_feedback();
        assert_eq!(f.events(), vec![BroadcastEvent::CvNack]);

        // Late answer
        f.buffers.feedback.send(BidiFeedback {
            packet,
            datagram: pom_datagram(0x2A),
        });
        f.service.process_feedback();
        assert_eq!(f.events(), vec![BroadcastEvent::CvNack]);
    }

    #[test]
    fn dyn_updates_rail_com_data() {
        let store = MockLocoStore::new().with_loco(3, Loco::named("a"));
        let f = Fixture::new(store, MockSettingsStore::new());
        let packet = make_speed_and_direction_packet(Address::basic_loco(3), 0);

        for (d, x) in [(80, DYN_SPEED1), (200, DYN_QOS), (200, DYN_QOS)] {
            f.buffers.feedback.send(BidiFeedback {
                packet: packet.clone(),
                datagram: dyn_datagram(d, x),
            });
        }
        f.service.process_feedback();

        let data = f.service.rail_com_data(3).unwrap();
        assert_eq!(data.speed, 80);
        assert_eq!(data.qos, 200);
        assert_eq!(data.options, RailComOptions::SPEED1 | RailComOptions::QOS);
        assert_eq!(
            f.service.broadcaster().count(|e| *e == BroadcastEvent::RailComData(3)),
            2
        );
    }

    #[test]
    fn invalid_datagram_is_discarded() {
        let store = MockLocoStore::new().with_loco(3, Loco::named("a"));
        let f = Fixture::new(store, MockSettingsStore::new());
        let mut datagram = dyn_datagram(80, DYN_SPEED1);
        datagram[3] = 0xFF;

        f.buffers.feedback.send(BidiFeedback {
            packet: make_speed_and_direction_packet(Address::basic_loco(3), 0),
            datagram,
        });
        f.service.process_feedback();
        assert!(f.events().is_empty());
        assert_eq!(f.service.rail_com_data(3).unwrap().speed, 0);
    }

    // =========================================================================
    // Operations Tests
    // =========================================================================

    #[test]
    fn fill_refreshes_known_locos() {
        let store = MockLocoStore::new().with_loco(3, Loco::named("a"));
        let f = Fixture::new(store, MockSettingsStore::new());

        f.service.fill_back_queue();

        assert!(f.buffers.tx_back.spaces_available() * 4 < f.buffers.tx_back.capacity());
        let speed = Loco::named("a").speed_packet(Address::basic_loco(3));
        assert_eq!(f.buffers.tx_back.try_receive(), Some(speed));
    }

    #[test]
    fn start_refuses_foreign_modes_and_busy_track() {
        let f = Fixture::new(MockLocoStore::new(), MockSettingsStore::new());
        assert_eq!(
            f.service.start(TrackMode::DecupZsu),
            Err(TrackError::UnsupportedMode(TrackMode::DecupZsu))
        );

        let _token = f.arbiter.try_acquire(TrackMode::MduZsu).unwrap();
        assert_eq!(
            f.service.start(TrackMode::DccOperations),
            Err(TrackError::ModeConflict)
        );
        assert!(!f.service.is_running());
        assert!(!f.service.track_power_off());
    }
}
