//! Queues shared by the services and the track driver.
//!
//! | Buffer | Direction | Contents |
//! |--------|-----------|----------|
//! | `tx_front` | service → driver | urgent packets (commands, CV access) |
//! | `tx_back` | service → driver | background traffic (refresh, idle) |
//! | `rx` | driver → service | one [`Reply`] per acknowledged packet |
//! | `feedback` | driver → service | BiDi datagram of each DCC packet |
//!
//! The driver always drains `tx_front` before `tx_back`.

use std::time::{Duration, Instant};

use crate::bidi::Datagram;
use crate::channel::{receive_biased, MessageBuffer};
use crate::packet::Packet;

/// Default capacity of each transmit queue in packets.
pub const TX_QUEUE_CAPACITY: usize = 32;

/// Capacity of the reply buffer.
pub const RX_CAPACITY: usize = 32;

/// Capacity of the BiDi feedback queue.
pub const FEEDBACK_QUEUE_CAPACITY: usize = 32;

const RECEIVE_SLICE: Duration = Duration::from_millis(100);

/// Result of one transmitted packet that requested an answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// DCC service mode ACK.
    ServiceAck(bool),
    /// DECUP ACK pulse count (0, 1 or 2).
    Decup(u8),
    /// MDU ACK/NAK for both ACK positions.
    Mdu([u8; 2]),
}

/// A transmitted DCC packet and the datagram received in its cutout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BidiFeedback {
    /// Packet preceding the cutout.
    pub packet: Packet,
    /// Raw cutout bytes.
    pub datagram: Datagram,
}

/// All queues of the track core.
#[derive(Debug)]
pub struct TrackBuffers {
    /// Urgent packets.
    pub tx_front: MessageBuffer<Packet>,
    /// Background packets.
    pub tx_back: MessageBuffer<Packet>,
    /// Replies to the service.
    pub rx: MessageBuffer<Reply>,
    /// BiDi feedback to the service.
    pub feedback: MessageBuffer<BidiFeedback>,
}

impl Default for TrackBuffers {
    fn default() -> Self {
        Self::new(TX_QUEUE_CAPACITY)
    }
}

impl TrackBuffers {
    /// Creates buffers with `tx_capacity` packets per transmit queue.
    pub fn new(tx_capacity: usize) -> Self {
        Self {
            tx_front: MessageBuffer::new(tx_capacity),
            tx_back: MessageBuffer::new(tx_capacity),
            rx: MessageBuffer::new(RX_CAPACITY),
            feedback: MessageBuffer::new(FEEDBACK_QUEUE_CAPACITY),
        }
    }

    /// Next packet, front queue first, waiting up to `timeout`.
    pub fn receive_packet(&self, timeout: Duration) -> Option<Packet> {
        receive_biased(&self.tx_front, &self.tx_back, timeout)
    }

    /// Next front queue packet, waiting up to `timeout`.
    ///
    /// Waits in 100 ms slices and gives up early once `exit` returns true.
    pub fn receive_front(&self, timeout: Duration, exit: impl Fn() -> bool) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if let Some(packet) = self.tx_front.receive(RECEIVE_SLICE.min(deadline - now)) {
                return Some(packet);
            }
            if exit() {
                return None;
            }
        }
    }

    /// Empties every queue.
    pub fn clear_all(&self) {
        self.tx_front.clear();
        self.tx_back.clear();
        self.rx.clear();
        self.feedback.clear();
    }
}
