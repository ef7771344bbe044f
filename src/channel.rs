//! Bounded queues between front-ends, services and driver tasks.
//!
//! - [`MessageBuffer`]: multi-producer, blocking send and receive with timeout,
//!   on top of a bounded `crossbeam-channel`. Used for the transmit queues,
//!   the reply buffer and the BiDi feedback queue.
//! - [`isr_channel`]: lock-free single-producer/single-consumer handoff from
//!   interrupt context to a task, carrying small `Copy` payloads.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Select, Sender, TrySendError};
use heapless::spsc::{Consumer, Producer, Queue};

use crate::traits::Clock;

// ============================================================================
// MessageBuffer
// ============================================================================

/// Bounded FIFO with blocking send and receive.
///
/// Both channel ends live in the buffer, so it never disconnects.
#[derive(Debug)]
pub struct MessageBuffer<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> MessageBuffer<T> {
    /// Creates a buffer holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued items.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Free slots.
    pub fn spaces_available(&self) -> usize {
        self.capacity.saturating_sub(self.rx.len())
    }

    /// Queues `item`, hands it back if the buffer is full.
    pub fn try_send(&self, item: T) -> Result<(), T> {
        self.tx.try_send(item).map_err(TrySendError::into_inner)
    }

    /// Queues `item`, blocking until there is room.
    pub fn send(&self, item: T) {
        // Can't disconnect, `self.rx` is alive
        let _ = self.tx.send(item);
    }

    /// Queues `item`, waiting up to `timeout` for room.
    pub fn send_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        self.tx
            .send_timeout(item, timeout)
            .map_err(|e| e.into_inner())
    }

    /// Takes the oldest item without waiting.
    pub fn try_receive(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Takes the oldest item, waiting up to `timeout`.
    pub fn receive(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drops everything queued.
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// Takes the oldest item of `first`, or of `second` if `first` is empty.
///
/// Blocks until either buffer has an item or `timeout` passed. An item
/// arriving in `first` always wins over one waiting in `second`.
pub fn receive_biased<T>(
    first: &MessageBuffer<T>,
    second: &MessageBuffer<T>,
    timeout: Duration,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(item) = first.try_receive().or_else(|| second.try_receive()) {
            return Some(item);
        }
        let mut select = Select::new();
        select.recv(&first.rx);
        select.recv(&second.rx);
        // Readiness only, the item is taken in priority order above
        select.ready_deadline(deadline).ok()?;
    }
}

// ============================================================================
// ISR channel
// ============================================================================

/// Interrupt side of an [`isr_channel`].
pub struct IsrSender<T: 'static, const N: usize> {
    producer: Producer<'static, T, N>,
}

/// Task side of an [`isr_channel`].
pub struct IsrReceiver<T: 'static, const N: usize> {
    consumer: Consumer<'static, T, N>,
}

/// Creates a lock-free channel holding up to `N - 1` values.
///
/// The backing queue lives for the rest of the program, create channels once
/// at startup.
pub fn isr_channel<T: 'static, const N: usize>() -> (IsrSender<T, N>, IsrReceiver<T, N>) {
    let queue: &'static mut Queue<T, N> = Box::leak(Box::new(Queue::new()));
    let (producer, consumer) = queue.split();
    (IsrSender { producer }, IsrReceiver { consumer })
}

impl<T: 'static, const N: usize> IsrSender<T, N> {
    /// Posts `value`, returns false if the task fell behind.
    pub fn notify(&mut self, value: T) -> bool {
        self.producer.enqueue(value).is_ok()
    }
}

impl<T: 'static, const N: usize> IsrReceiver<T, N> {
    /// Takes the oldest value.
    pub fn try_take(&mut self) -> Option<T> {
        self.consumer.dequeue()
    }

    /// Waits up to `us` microseconds for a value.
    pub fn take_within<C: Clock>(&mut self, clock: &C, us: u32) -> Option<T> {
        let then = clock.now_us() + us as u64;
        loop {
            if let Some(value) = self.consumer.dequeue() {
                return Some(value);
            }
            if clock.now_us() >= then {
                return None;
            }
            std::thread::yield_now();
        }
    }

    /// Drops stale values.
    pub fn drain(&mut self) {
        while self.consumer.dequeue().is_some() {}
    }
}
