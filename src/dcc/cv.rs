//! Pending CV requests.
//!
//! Service mode requests ([`CvRequest`]) are worked off one by one on the
//! programming track. POM reads ([`CvPomRequest`]) are answered by the decoder
//! through BiDi and expire after [`POM_TIMEOUT_MS`] (RCN-217).
//!
//! Both deques are bounded by the number of loco addresses a single client may
//! hold; a full deque is reported to the caller instead of blocking.

use heapless::Deque;

use crate::packet::Address;

/// Capacity of each request deque.
pub const CV_REQUEST_CAPACITY: usize = 16;

/// Time a decoder has to answer a POM read [ms].
pub const POM_TIMEOUT_MS: u64 = 500;

/// A service mode read or write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CvRequest {
    /// CV address, 0-based.
    pub cv: u16,
    /// Byte to write, `None` for a read.
    pub byte: Option<u8>,
}

impl CvRequest {
    /// Read request.
    pub const fn read(cv: u16) -> Self {
        Self { cv, byte: None }
    }

    /// Write request.
    pub const fn write(cv: u16, byte: u8) -> Self {
        Self {
            cv,
            byte: Some(byte),
        }
    }
}

/// FIFO of service mode requests.
pub type CvRequestDeque = Deque<CvRequest, CV_REQUEST_CAPACITY>;

/// A POM read waiting for its BiDi answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CvPomRequest {
    /// Time after which the request is answered with a NACK [ms].
    pub deadline_ms: u64,
    /// Loco address as sent on the rails.
    pub addr: Address,
    /// CV address, 0-based.
    pub cv: u16,
}

/// FIFO of POM reads.
///
/// Only the oldest request is ever answered. Each request leaves the queue
/// exactly once, either through [`resolve`](Self::resolve) or
/// [`expire`](Self::expire), so a late answer finds nothing to resolve.
#[derive(Clone, Debug, Default)]
pub struct PomRequests {
    deque: Deque<CvPomRequest, CV_REQUEST_CAPACITY>,
}

impl PomRequests {
    /// Empty queue.
    pub const fn new() -> Self {
        Self {
            deque: Deque::new(),
        }
    }

    /// Queues a read of `cv` sent to `addr` at `now_ms`.
    pub fn push(&mut self, now_ms: u64, addr: Address, cv: u16) -> Result<(), CvPomRequest> {
        self.deque.push_back(CvPomRequest {
            deadline_ms: now_ms + POM_TIMEOUT_MS,
            addr,
            cv,
        })
    }

    /// Pops the oldest request if it matches `addr` and `cv`.
    pub fn resolve(&mut self, addr: Address, cv: u16) -> Option<CvPomRequest> {
        match self.deque.front() {
            Some(req) if req.addr == addr && req.cv == cv => self.deque.pop_front(),
            _ => None,
        }
    }

    /// Pops the oldest request if its deadline passed.
    pub fn expire(&mut self, now_ms: u64) -> Option<CvPomRequest> {
        match self.deque.front() {
            Some(req) if now_ms > req.deadline_ms => self.deque.pop_front(),
            _ => None,
        }
    }

    /// Oldest request.
    pub fn front(&self) -> Option<&CvPomRequest> {
        self.deque.front()
    }

    /// Pending requests.
    pub fn len(&self) -> usize {
        self.deque.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }

    /// True if no further request fits.
    pub fn is_full(&self) -> bool {
        self.deque.is_full()
    }

    /// Drops every pending request.
    pub fn clear(&mut self) {
        self.deque.clear();
    }
}
