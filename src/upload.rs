//! Upload sessions for the decoder update protocols.
//!
//! A front-end streaming a DECUP or MDU update (WebSocket, USB) talks to the
//! track driver through an [`UploadSession`]:
//!
//! 1. [`UploadSession::open`] claims the track for the update mode and hands
//!    the token to the driver task.
//! 2. [`UploadSession::transmit`] queues one packet on the front queue and
//!    blocks until the driver replies with the decoder's ACKs.
//! 3. [`UploadSession::close`], or dropping the session, asks the driver to
//!    suspend.
//!
//! A reply that doesn't arrive within the session timeout closes the session.
//! So does the driver ending on its own, e.g. after an MDU exit command.

use std::sync::Arc;
use std::time::Duration;

use crate::buffers::{Reply, TrackBuffers};
use crate::error::{Result, TrackError};
use crate::packet::{Packet, MAX_PACKET_SIZE};
use crate::state::{ModeArbiter, TrackMode};
use crate::task::TaskConfig;
use crate::track::DriverHandle;

/// Largest packet an upload session accepts.
pub const MAX_UPLOAD_PACKET: usize = MAX_PACKET_SIZE;

/// One DECUP or MDU update between open and close.
#[derive(Debug)]
pub struct UploadSession {
    arbiter: Arc<ModeArbiter>,
    buffers: Arc<TrackBuffers>,
    mode: TrackMode,
    timeout: Duration,
    open: bool,
}

impl UploadSession {
    /// Claims the track for `mode` and resumes the driver.
    ///
    /// Only DECUP and MDU modes are accepted. Fails with
    /// [`TrackError::ModeConflict`] unless the track is suspended.
    pub fn open(
        arbiter: &Arc<ModeArbiter>,
        driver: &DriverHandle,
        buffers: Arc<TrackBuffers>,
        mode: TrackMode,
    ) -> Result<Self> {
        use TrackMode::*;
        let timeout = match mode {
            DecupZpp | DecupZsu | DecupEin => TaskConfig::decup_driver().timeout,
            MduZpp | MduZsu | MduEin => TaskConfig::mdu_driver().timeout,
            _ => return Err(TrackError::UnsupportedMode(mode)),
        };
        let token = arbiter.try_acquire(mode).map_err(|state| {
            log::warn!("Can't open {:?} session, track is {:?}", mode, state);
            TrackError::ModeConflict
        })?;
        driver.resume(token)?;
        log::info!("{:?} session opened", mode);

        Ok(Self {
            arbiter: Arc::clone(arbiter),
            buffers,
            mode,
            timeout,
            open: true,
        })
    }

    /// Builder: set the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mode the session claimed.
    pub fn mode(&self) -> TrackMode {
        self.mode
    }

    /// True while the session owns the track and nobody asked it to leave.
    pub fn is_open(&self) -> bool {
        let state = self.arbiter.load();
        self.open && state.mode() == Some(self.mode) && !state.exit_requested()
    }

    /// Transmits `bytes` as one packet and waits for the driver's reply.
    pub fn transmit(&mut self, bytes: &[u8]) -> Result<Reply> {
        if !self.is_open() {
            self.open = false;
            return Err(TrackError::ModeConflict);
        }
        let packet =
            Packet::from_slice(bytes).ok_or(TrackError::PacketTooLong(bytes.len()))?;

        let reply = match self.buffers.tx_front.send_timeout(packet, self.timeout) {
            Ok(()) => self.buffers.rx.receive(self.timeout),
            Err(_) => None,
        };
        reply.ok_or_else(|| {
            log::info!("{:?} session timed out", self.mode);
            self.close();
            TrackError::Timeout
        })
    }

    /// DECUP transmit, returns the ACK count.
    pub fn transmit_decup(&mut self, bytes: &[u8]) -> Result<u8> {
        match self.transmit(bytes)? {
            Reply::Decup(acks) => Ok(acks),
            other => Err(self.unexpected(other)),
        }
    }

    /// MDU transmit, returns ACK/NAK of both ACK positions.
    pub fn transmit_mdu(&mut self, bytes: &[u8]) -> Result<[u8; 2]> {
        match self.transmit(bytes)? {
            Reply::Mdu(acks) => Ok(acks),
            other => Err(self.unexpected(other)),
        }
    }

    /// Asks the driver to suspend. Further transmits fail.
    pub fn close(&mut self) {
        if !core::mem::replace(&mut self.open, false) {
            return;
        }
        if self.arbiter.request_suspend(self.mode) {
            log::info!("{:?} session closed", self.mode);
        }
    }

    fn unexpected(&self, reply: Reply) -> TrackError {
        log::warn!("Unexpected reply {:?} in {:?} session", reply, self.mode);
        TrackError::ModeConflict
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        self.close();
    }
}
