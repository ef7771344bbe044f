//! DCC track driver.
//!
//! Runs one DCC session on the track:
//!
//! - **Operations** (`DccOperations`, `DccEin`): transmit whatever the
//!   services queue, front queue first. With BiDi enabled every packet is
//!   followed by a cutout; the received datagram is forwarded together with
//!   its packet to the feedback queue.
//! - **Service** (`DccService`): reset packets frame every CV request. Equal
//!   CV packets are repeated while the track current is searched for an ACK
//!   pulse, then exactly one `bool` is replied.
//!
//! Both loops end when the arbiter asks to leave or when no packet arrives
//! within the session timeout.

use std::time::Duration;

use alloc::vec::Vec;

use crate::ack::{AckDetector, CurrentRecorder};
use crate::bidi::{Datagram, CHANNEL1_SIZE};
use crate::buffers::{BidiFeedback, Reply, TrackBuffers};
use crate::config::{AnalogCalibration, CutoutOffsets, Settings};
use crate::current_limit::{CurrentLimit, CurrentLimiter};
use crate::encoder::{DccEncoder, RmtSymbol, SymbolEncoder};
use crate::error::{Result, TrackError};
use crate::packet::{make_idle_packet, make_reset_packet, Packet};
use crate::state::{ModeToken, TrackMode};
use crate::traits::{
    AnalogMeasurements, BidiReceiver, Clock, CurrentLimitPins, TrackTransmitter,
};

/// Packets in flight on the RMT channel.
pub const TRANS_QUEUE_DEPTH: u32 = 2;

/// Reset packets on top of the startup count when entering service mode.
pub const SERVICE_ENTRY_EXTRA_RESETS: u32 = 3;

/// Time a decoder gets to acknowledge a write [ms].
pub const WRITE_TIMEOUT_MS: u64 = 100;

/// Longest gap between two repetitions of the same CV packet.
pub const CV_PACKET_GAP: Duration = Duration::from_millis(5);

/// DCC driver over borrowed peripherals.
pub struct DccDriver<'a, T, B, L, M: ?Sized, C> {
    /// RMT channel.
    pub transmitter: &'a mut T,
    /// Cutout and BiDi UART.
    pub bidi: &'a mut B,
    /// Current limit.
    pub current_limit: &'a mut CurrentLimiter<L>,
    /// Current measurements for service mode ACKs.
    pub analog: &'a M,
    /// Time source for the ACK deadline.
    pub clock: &'a C,
    /// Packet, reply and feedback queues.
    pub buffers: &'a TrackBuffers,
    /// Settings loaded at resume.
    pub settings: &'a Settings,
    /// Cutout latency compensation.
    pub offsets: CutoutOffsets,
    /// ADC calibration.
    pub calibration: AnalogCalibration,
    /// Session ends if no packet arrives within this time.
    pub timeout: Duration,
}

impl<'a, T, B, L, M: ?Sized, C> DccDriver<'a, T, B, L, M, C>
where
    T: TrackTransmitter,
    B: BidiReceiver,
    L: CurrentLimitPins,
    M: AnalogMeasurements,
    C: Clock,
{
    /// Runs the loop matching the token's mode.
    pub fn run(&mut self, token: &ModeToken) -> Result<()> {
        match token.mode() {
            TrackMode::DccService => self.service_loop(token),
            _ => self.operations_loop(token),
        }
    }

    /// Operations mode.
    pub fn operations_loop(&mut self, token: &ModeToken) -> Result<()> {
        let encoder = DccEncoder::new(self.settings.dcc_encoder_config(false, self.offsets));
        let bidi = encoder.config().bidi();
        let mut symbols = Vec::new();

        self.current_limit.set(self.settings.current_limit)?;

        let idle = make_idle_packet();
        for _ in 0..TRANS_QUEUE_DEPTH {
            self.transmit(&encoder, &idle, &mut symbols)?;
            if bidi {
                self.receive_bidi(&idle)?;
            }
        }

        loop {
            if token.exit_requested() {
                return Ok(());
            }
            let Some(packet) = self.buffers.receive_packet(self.timeout) else {
                log::info!("DCC session timed out");
                return Ok(());
            };
            self.transmit(&encoder, &packet, &mut symbols)?;
            if bidi {
                self.receive_bidi(&packet)?;
            }
        }
    }

    /// Service mode.
    pub fn service_loop(&mut self, token: &ModeToken) -> Result<()> {
        let encoder = DccEncoder::new(self.settings.dcc_encoder_config(true, self.offsets));
        let detector = AckDetector::from_calibration(
            &self.calibration,
            self.settings.dcc_programming_ack_current,
        );
        let reset = make_reset_packet();
        let mut symbols = Vec::new();
        let mut recorder = CurrentRecorder::new();
        let mut pending: Option<Packet> = None;

        self.current_limit.set(CurrentLimit::Ma4100)?;
        let entry_resets =
            self.settings.dcc_startup_reset_packet_count as u32 + SERVICE_ENTRY_EXTRA_RESETS;
        for _ in 0..entry_resets {
            self.transmit(&encoder, &reset, &mut symbols)?;
        }
        self.current_limit.set(self.settings.current_limit_service)?;

        loop {
            for _ in 0..self.settings.dcc_continue_reset_packet_count {
                self.transmit(&encoder, &reset, &mut symbols)?;
            }

            // Resets until the first CV packet
            let cv_packet = loop {
                if token.exit_requested() {
                    return Ok(());
                }
                let Some(packet) = pending
                    .take()
                    .or_else(|| self.buffers.receive_packet(self.timeout))
                else {
                    log::info!("DCC service session timed out");
                    return Ok(());
                };
                self.transmit(&encoder, &packet, &mut symbols)?;
                if packet != reset {
                    break packet;
                }
            };

            let deadline =
                self.clock.now_ms() + WRITE_TIMEOUT_MS + TRANS_QUEUE_DEPTH as u64 * 10;
            let mut ack = false;

            while let Some(packet) = self.buffers.receive_packet(CV_PACKET_GAP) {
                if packet != cv_packet {
                    pending = Some(packet);
                    break;
                }
                self.transmit(&encoder, &packet, &mut symbols)?;
                recorder.append(&self.analog.peek_currents());
                ack |= detector.detect(recorder.samples());
            }

            while !ack && self.clock.now_ms() < deadline {
                self.transmit(&encoder, &reset, &mut symbols)?;
                recorder.append(&self.analog.peek_currents());
                ack |= detector.detect(recorder.samples());
            }

            log::debug!("DCC service {:?} ack {}", cv_packet, ack);
            if self.buffers.rx.try_send(Reply::ServiceAck(ack)).is_err() {
                log::warn!("DCC service reply dropped, rx buffer full");
            }
            recorder.clear();
        }
    }

    fn transmit(
        &mut self,
        encoder: &DccEncoder,
        packet: &[u8],
        symbols: &mut Vec<RmtSymbol>,
    ) -> Result<()> {
        symbols.clear();
        encoder.encode_into(packet, symbols);
        self.transmitter
            .transmit(symbols)
            .map_err(TrackError::hardware)
    }

    /// Reads the cutout following `packet` and queues it as feedback.
    ///
    /// Without channel 1 data the bytes land in the channel 2 part of the
    /// datagram.
    fn receive_bidi(&mut self, packet: &Packet) -> Result<()> {
        let flags = self.bidi.wait_cutout().map_err(TrackError::hardware)?;
        let available = self.bidi.available().map_err(TrackError::hardware)?;

        let mut datagram: Datagram = [0; 8];
        let buf = if flags.ch1() {
            &mut datagram[..]
        } else {
            &mut datagram[CHANNEL1_SIZE..]
        };
        let n = available.min(buf.len());
        self.bidi.read(&mut buf[..n]).map_err(TrackError::hardware)?;
        self.bidi.flush().map_err(TrackError::hardware)?;

        let _ = self.buffers.feedback.try_send(BidiFeedback {
            packet: packet.clone(),
            datagram,
        });
        Ok(())
    }
}
