//! Track ownership arbitration.
//!
//! Exactly one protocol may drive the track at a time. Ownership is decided by
//! a compare-and-swap on a single 16 bit state word held by a [`ModeArbiter`]:
//!
//! | Bits | Meaning |
//! |------|---------|
//! | `0` | `Suspend` flag: the owner has been asked to leave |
//! | `1` | `ShortCircuit` flag: the analog layer detected a short |
//! | `8..16` | owning [`TrackMode`] id (`0` = nobody) |
//!
//! The word is `0` (`Suspended`) when no mode owns the hardware. A service
//! acquires the track with [`ModeArbiter::try_acquire`], which only succeeds
//! from `Suspended` and hands out a [`ModeToken`]. Dropping the token is the
//! single way back to `Suspended`; a pending short circuit survives the
//! release and is only cleared by [`ModeArbiter::clear_short_circuit`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use zimo_track::state::{ModeArbiter, TrackMode};
//!
//! let arbiter = Arc::new(ModeArbiter::new());
//! let token = arbiter.try_acquire(TrackMode::DccOperations).unwrap();
//!
//! // Second owner loses the race
//! assert!(arbiter.try_acquire(TrackMode::MduZsu).is_err());
//!
//! // Ask the owner to leave, it notices and drops its token
//! assert!(arbiter.request_suspend(TrackMode::DccOperations));
//! assert!(token.exit_requested());
//! drop(token);
//! assert!(arbiter.load().is_suspended());
//! ```

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU16, Ordering};

/// Protocol or mode that can own the track hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum TrackMode {
    /// DCC operations with BiDi cutout.
    DccOperations = 1,
    /// DCC service mode (programming track).
    DccService = 2,
    /// DECUP sound project upload.
    DecupZpp = 3,
    /// DECUP firmware update.
    DecupZsu = 4,
    /// MDU sound project upload.
    MduZpp = 5,
    /// MDU firmware update.
    MduZsu = 6,
    /// ZUSI (SUSI based) update.
    Zusi = 7,
    /// USB DCC pass-through.
    DccEin = 8,
    /// USB DECUP pass-through.
    DecupEin = 9,
    /// USB MDU pass-through.
    MduEin = 10,
    /// USB SUSI pass-through.
    SusiV2 = 11,
    /// Firmware update of the command station itself.
    Ota = 12,
}

impl TrackMode {
    /// All modes, in id order.
    pub const ALL: [TrackMode; 12] = [
        TrackMode::DccOperations,
        TrackMode::DccService,
        TrackMode::DecupZpp,
        TrackMode::DecupZsu,
        TrackMode::MduZpp,
        TrackMode::MduZsu,
        TrackMode::Zusi,
        TrackMode::DccEin,
        TrackMode::DecupEin,
        TrackMode::MduEin,
        TrackMode::SusiV2,
        TrackMode::Ota,
    ];

    /// Mode id as stored in the high byte of the state word.
    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Looks a mode up by id.
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|mode| mode.id() == id)
    }
}

/// Snapshot of the arbiter's state word.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct State(u16);

impl State {
    /// Nobody owns the track.
    pub const SUSPENDED: State = State(0);

    const SUSPEND: u16 = 1 << 0;
    const SHORT_CIRCUIT: u16 = 1 << 1;
    const FLAGS: u16 = 0x00FF;

    /// Track held by `mode`, no flags set.
    #[inline]
    pub const fn owned(mode: TrackMode) -> Self {
        State((mode as u16) << 8)
    }

    /// Short circuit latched, no owner.
    #[inline]
    pub const fn short_circuit() -> Self {
        State(Self::SHORT_CIRCUIT)
    }

    /// Raw state word.
    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Builds a state from a raw word.
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        State(raw)
    }

    /// Owning mode, if any.
    pub fn mode(self) -> Option<TrackMode> {
        TrackMode::from_id((self.0 >> 8) as u8)
    }

    /// True if nobody owns the track and no flag is pending.
    #[inline]
    pub const fn is_suspended(self) -> bool {
        self.0 == 0
    }

    /// True if the owner was asked to leave.
    #[inline]
    pub const fn is_suspend_requested(self) -> bool {
        self.0 & Self::SUSPEND != 0
    }

    /// True if a short circuit is latched.
    #[inline]
    pub const fn is_short_circuit(self) -> bool {
        self.0 & Self::SHORT_CIRCUIT != 0
    }

    /// True if the owning driver must unwind (suspend or short circuit).
    #[inline]
    pub const fn exit_requested(self) -> bool {
        self.0 & Self::FLAGS != 0
    }

    const fn with(self, flag: u16) -> Self {
        State(self.0 | flag)
    }
}

impl core::fmt::Debug for State {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("State")
            .field("mode", &self.mode())
            .field("suspend", &self.is_suspend_requested())
            .field("short_circuit", &self.is_short_circuit())
            .finish()
    }
}

/// Owner of the track state word.
///
/// Instances are independent, so tests can run several arbiters side by side.
/// Share one between tasks through an [`Arc`].
#[derive(Debug, Default)]
pub struct ModeArbiter {
    state: AtomicU16,
}

impl ModeArbiter {
    /// Creates an arbiter in `Suspended`.
    pub const fn new() -> Self {
        Self {
            state: AtomicU16::new(0),
        }
    }

    /// Current state.
    #[inline]
    pub fn load(&self) -> State {
        State(self.state.load(Ordering::Acquire))
    }

    /// Claims the track for `mode`.
    ///
    /// Succeeds only from `Suspended`. On failure the observed state is
    /// returned and the caller must not touch the hardware.
    pub fn try_acquire(self: &Arc<Self>, mode: TrackMode) -> Result<ModeToken, State> {
        self.state
            .compare_exchange(
                State::SUSPENDED.raw(),
                State::owned(mode).raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ModeToken {
                arbiter: Arc::clone(self),
                mode,
            })
            .map_err(State)
    }

    /// Asks the current owner to leave, if `mode` still owns the track.
    ///
    /// Returns `false` if `mode` is not the owner or a flag is already set.
    pub fn request_suspend(&self, mode: TrackMode) -> bool {
        let owned = State::owned(mode);
        self.state
            .compare_exchange(
                owned.raw(),
                owned.with(State::SUSPEND).raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Latches a short circuit. The owner, if any, unwinds on its next poll.
    pub fn short_circuit(&self) {
        self.state.fetch_or(State::SHORT_CIRCUIT, Ordering::AcqRel);
    }

    /// Clears a latched short circuit once the owner has left.
    ///
    /// This is the track-power-on request. Returns `false` while a driver
    /// still holds the track or if no short circuit is latched.
    pub fn clear_short_circuit(&self) -> bool {
        self.state
            .compare_exchange(
                State::short_circuit().raw(),
                State::SUSPENDED.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn release(&self, mode: TrackMode) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let state = State(raw);
                if state.mode() != Some(mode) {
                    return None;
                }
                Some(if state.is_short_circuit() {
                    State::short_circuit().raw()
                } else {
                    State::SUSPENDED.raw()
                })
            });
    }
}

/// Proof of track ownership.
///
/// Only the holder may drive the track. Dropping the token stores
/// `Suspended` (or leaves a latched `ShortCircuit` behind).
#[derive(Debug)]
#[must_use = "dropping the token releases the track immediately"]
pub struct ModeToken {
    arbiter: Arc<ModeArbiter>,
    mode: TrackMode,
}

impl ModeToken {
    /// Mode this token was issued for.
    #[inline]
    pub fn mode(&self) -> TrackMode {
        self.mode
    }

    /// Current arbiter state.
    #[inline]
    pub fn state(&self) -> State {
        self.arbiter.load()
    }

    /// True once the owner has to unwind through its suspend routine.
    #[inline]
    pub fn exit_requested(&self) -> bool {
        self.arbiter.load().exit_requested()
    }

    /// Arbiter that issued this token.
    pub fn arbiter(&self) -> &Arc<ModeArbiter> {
        &self.arbiter
    }
}

impl Drop for ModeToken {
    fn drop(&mut self) {
        self.arbiter.release(self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // State Tests
    // =========================================================================

    #[test]
    fn state_encoding_matches_flag_layout() {
        assert_eq!(State::SUSPENDED.raw(), 0);
        assert_eq!(State::owned(TrackMode::DccOperations).raw(), 0x0100);
        assert_eq!(State::owned(TrackMode::Ota).raw(), 0x0C00);
        assert_eq!(State::short_circuit().raw(), 0x0002);
    }

    #[test]
    fn state_mode_roundtrip() {
        for mode in TrackMode::ALL {
            assert_eq!(State::owned(mode).mode(), Some(mode));
        }
        assert_eq!(State::SUSPENDED.mode(), None);
        assert_eq!(TrackMode::from_id(0), None);
        assert_eq!(TrackMode::from_id(13), None);
    }

    #[test]
    fn exit_requested_on_either_flag() {
        let owned = State::owned(TrackMode::MduZsu);
        assert!(!owned.exit_requested());
        assert!(owned.with(State::SUSPEND).exit_requested());
        assert!(owned.with(State::SHORT_CIRCUIT).exit_requested());
    }

    // =========================================================================
    // Arbiter Tests
    // =========================================================================

    #[test]
    fn acquire_only_from_suspended() {
        let arbiter = Arc::new(ModeArbiter::new());
        let token = arbiter.try_acquire(TrackMode::DecupZsu).unwrap();
        assert_eq!(token.mode(), TrackMode::DecupZsu);

        let err = arbiter.try_acquire(TrackMode::DccService).unwrap_err();
        assert_eq!(err.mode(), Some(TrackMode::DecupZsu));
    }

    #[test]
    fn drop_releases_to_suspended() {
        let arbiter = Arc::new(ModeArbiter::new());
        let token = arbiter.try_acquire(TrackMode::DccOperations).unwrap();
        drop(token);
        assert!(arbiter.load().is_suspended());
        assert!(arbiter.try_acquire(TrackMode::DccService).is_ok());
    }

    #[test]
    fn request_suspend_requires_matching_owner() {
        let arbiter = Arc::new(ModeArbiter::new());
        assert!(!arbiter.request_suspend(TrackMode::DccOperations));

        let token = arbiter.try_acquire(TrackMode::DccOperations).unwrap();
        assert!(!arbiter.request_suspend(TrackMode::DccService));
        assert!(arbiter.request_suspend(TrackMode::DccOperations));
        // Already flagged
        assert!(!arbiter.request_suspend(TrackMode::DccOperations));
        assert!(token.exit_requested());
        assert_eq!(token.state().mode(), Some(TrackMode::DccOperations));
    }

    #[test]
    fn short_circuit_survives_release() {
        let arbiter = Arc::new(ModeArbiter::new());
        let token = arbiter.try_acquire(TrackMode::DccOperations).unwrap();

        arbiter.short_circuit();
        assert!(token.exit_requested());
        assert!(!arbiter.clear_short_circuit());

        drop(token);
        assert_eq!(arbiter.load(), State::short_circuit());
        assert!(arbiter.try_acquire(TrackMode::DccOperations).is_err());

        assert!(arbiter.clear_short_circuit());
        assert!(arbiter.load().is_suspended());
    }

    #[test]
    fn independent_arbiters() {
        let a = Arc::new(ModeArbiter::new());
        let b = Arc::new(ModeArbiter::new());
        let _ta = a.try_acquire(TrackMode::DccOperations).unwrap();
        let _tb = b.try_acquire(TrackMode::MduZsu).unwrap();
        assert_eq!(a.load().mode(), Some(TrackMode::DccOperations));
        assert_eq!(b.load().mode(), Some(TrackMode::MduZsu));
    }
}
