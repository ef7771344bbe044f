//! Priority aging for the background refresh traffic.
//!
//! Every loco carries a priority between [`Loco::MIN_PRIORITY`] and
//! [`Loco::MAX_PRIORITY`]. A pass over the loco table serves every loco whose
//! priority divides the global pass counter, then ages it by one. Once the
//! counter saturates, counter and priorities return to the minimum so the
//! whole table starts over.
//!
//! | Pass counter | Loco priority | Served? |
//! |--------------|---------------|---------|
//! | 6 | 1, 2, 3, 6 | yes |
//! | 6 | 4, 5 | no |
//! | 31 (max) | any | reset first |
//!
//! The refresh fill keeps the back queue between 25% and 50% free space:
//! nothing is queued while less than half of the queue is free, and a fill
//! stops as soon as less than a quarter is free.

use alloc::collections::BTreeMap;

use super::loco::Loco;

/// Pass counter of the refresh scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriorityScheduler {
    count: u8,
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityScheduler {
    /// Counter at its minimum.
    pub const fn new() -> Self {
        Self {
            count: Loco::MIN_PRIORITY,
        }
    }

    /// Current pass counter.
    pub fn count(&self) -> u8 {
        self.count
    }

    /// Resets counter and every priority once the counter saturated.
    ///
    /// Returns true if a reset happened.
    pub fn reset_if_saturated<'a>(
        &mut self,
        locos: impl IntoIterator<Item = &'a mut Loco>,
    ) -> bool {
        if self.count < Loco::MAX_PRIORITY {
            return false;
        }
        self.count = Loco::MIN_PRIORITY;
        for loco in locos {
            loco.priority = Loco::MIN_PRIORITY;
        }
        true
    }

    /// True if `loco` is served in the current pass.
    pub fn is_due(&self, loco: &Loco) -> bool {
        self.count % loco.priority.max(Loco::MIN_PRIORITY) == 0
    }

    /// Ages a loco that was just served.
    pub fn served(&self, loco: &mut Loco) {
        loco.age();
    }

    /// Advances the counter after a full pass.
    pub fn end_pass(&mut self) {
        self.count = (self.count + 1).clamp(Loco::MIN_PRIORITY, Loco::MAX_PRIORITY);
    }

    /// Starts over, every loco is due in the next pass.
    pub fn reset(&mut self) {
        self.count = Loco::MIN_PRIORITY;
    }

    /// One scheduling pass.
    ///
    /// Calls `serve` for every due loco in address order and ages it. `serve`
    /// returns false to stop the pass early; the counter then stays put.
    /// Returns true if the pass completed.
    pub fn pass(
        &mut self,
        locos: &mut BTreeMap<u16, Loco>,
        mut serve: impl FnMut(u16, &Loco) -> bool,
    ) -> bool {
        for (&addr, loco) in locos.iter_mut() {
            if !self.is_due(loco) {
                continue;
            }
            let more = serve(addr, loco);
            self.served(loco);
            if !more {
                return false;
            }
        }
        self.end_pass();
        true
    }
}

#[cfg(feature = "std")]
mod fill {
    use super::*;
    use crate::channel::MessageBuffer;
    use crate::packet::{make_idle_packet, Address, Packet};

    /// True while less than half of `queue` is free.
    pub fn below_half<T>(queue: &MessageBuffer<T>) -> bool {
        queue.spaces_available() * 2 < queue.capacity()
    }

    /// True while less than a quarter of `queue` is free.
    pub fn below_quarter<T>(queue: &MessageBuffer<T>) -> bool {
        queue.spaces_available() * 4 < queue.capacity()
    }

    impl PriorityScheduler {
        /// Tops up the back queue with refresh packets.
        ///
        /// Does nothing while less than half of the queue is free. An empty
        /// table is refreshed with idle packets. Otherwise passes run until
        /// less than a quarter of the queue is free, `hfx` adds F13 to F28.
        /// The saturation reset is checked before every pass.
        pub fn fill(
            &mut self,
            locos: &mut BTreeMap<u16, Loco>,
            queue: &MessageBuffer<Packet>,
            short_127: bool,
            hfx: bool,
        ) {
            if below_half(queue) {
                return;
            }

            if locos.is_empty() {
                while !below_quarter(queue) {
                    queue.send(make_idle_packet());
                }
                return;
            }

            loop {
                self.reset_if_saturated(locos.values_mut());
                let completed = self.pass(locos, |addr, loco| {
                    let Some(addr) = Address::loco(addr, short_127) else {
                        return !below_quarter(queue);
                    };
                    queue.send(loco.speed_packet(addr));
                    for packet in loco.function_packets(addr, hfx) {
                        queue.send(packet);
                    }
                    !below_quarter(queue)
                });
                if !completed {
                    return;
                }
            }
        }
    }
}

#[cfg(feature = "std")]
pub use fill::{below_half, below_quarter};

#[cfg(test)]
mod tests {
    use super::*;

    fn table(addrs: &[u16]) -> BTreeMap<u16, Loco> {
        addrs.iter().map(|&a| (a, Loco::default())).collect()
    }

    // =========================================================================
    // Aging Tests
    // =========================================================================

    #[test]
    fn due_when_priority_divides_count() {
        let mut scheduler = PriorityScheduler::new();
        for _ in 0..5 {
            scheduler.end_pass();
        }
        assert_eq!(scheduler.count(), 6);

        let mut loco = Loco::default();
        for (priority, due) in [(1, true), (2, true), (3, true), (4, false), (5, false), (6, true)] {
            loco.priority = priority;
            assert_eq!(scheduler.is_due(&loco), due, "priority {}", priority);
        }
    }

    #[test]
    fn pass_serves_and_ages() {
        let mut scheduler = PriorityScheduler::new();
        let mut locos = table(&[3, 10]);
        let mut served = Vec::new();

        assert!(scheduler.pass(&mut locos, |addr, _| {
            served.push(addr);
            true
        }));
        assert_eq!(served, [3, 10]);
        assert!(locos.values().all(|l| l.priority == 2));
        assert_eq!(scheduler.count(), 2);
    }

    #[test]
    fn aborted_pass_keeps_counter() {
        let mut scheduler = PriorityScheduler::new();
        let mut locos = table(&[3, 10, 128]);
        assert!(!scheduler.pass(&mut locos, |addr, _| addr < 10));
        assert_eq!(scheduler.count(), 1);
        assert_eq!(locos[&3].priority, 2);
        assert_eq!(locos[&10].priority, 2);
        assert_eq!(locos[&128].priority, 1);
    }

    #[test]
    fn saturated_counter_resets_everything() {
        let mut scheduler = PriorityScheduler::new();
        let mut locos = table(&[3, 10]);
        assert!(!scheduler.reset_if_saturated(locos.values_mut()));

        for _ in 0..100 {
            scheduler.pass(&mut locos, |_, _| true);
        }
        assert_eq!(scheduler.count(), Loco::MAX_PRIORITY);
        assert!(scheduler.reset_if_saturated(locos.values_mut()));
        assert_eq!(scheduler.count(), Loco::MIN_PRIORITY);
        assert!(locos.values().all(|l| l.priority == Loco::MIN_PRIORITY));
    }

    // =========================================================================
    // Fill Tests
    // =========================================================================

    #[cfg(feature = "std")]
    #[test]
    fn empty_table_fills_with_idle() {
        use crate::channel::MessageBuffer;
        use crate::packet::make_idle_packet;

        let queue = MessageBuffer::new(32);
        let mut scheduler = PriorityScheduler::new();
        scheduler.fill(&mut BTreeMap::new(), &queue, false, false);

        assert_eq!(queue.spaces_available(), 7);
        assert_eq!(queue.try_receive(), Some(make_idle_packet()));
    }

    #[cfg(feature = "std")]
    #[test]
    fn fill_skips_when_half_full() {
        use crate::channel::MessageBuffer;
        use crate::packet::make_idle_packet;

        let queue = MessageBuffer::new(32);
        for _ in 0..17 {
            queue.send(make_idle_packet());
        }
        let mut scheduler = PriorityScheduler::new();
        scheduler.fill(&mut table(&[3]), &queue, false, false);
        assert_eq!(queue.len(), 17);
    }
}
