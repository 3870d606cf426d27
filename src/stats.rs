//! Per-target probe counters, shared read-write by every worker.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct TargetStat {
    sent: AtomicU64,
    received: AtomicU64,
}

/// One {sent, received} pair per target index. The counters are
/// independently atomic; the pair is only combined for reporting, after
/// all workers have joined.
#[derive(Debug)]
pub struct StatsTable {
    slots: Vec<TargetStat>,
}

impl StatsTable {
    pub fn new(targets: usize) -> Self {
        Self {
            slots: (0..targets).map(|_| TargetStat::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn record_sent(&self, index: usize) {
        self.slots[index].sent.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_received(&self, index: usize) {
        self.slots[index].received.fetch_add(1, Ordering::AcqRel);
    }

    /// Reserves one probe slot toward `quota` for the target, refusing once
    /// the target is full. The compare-and-swap loop keeps `sent` from ever
    /// exceeding the quota, however many workers race on the same index.
    /// Returns the post-reservation count on success.
    pub fn try_reserve(&self, index: usize, quota: u64) -> Option<u64> {
        let sent = &self.slots[index].sent;
        let mut seen = sent.load(Ordering::Acquire);
        loop {
            if seen >= quota {
                return None;
            }
            match sent.compare_exchange_weak(seen, seen + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(seen + 1),
                Err(actual) => seen = actual,
            }
        }
    }

    pub fn sent(&self, index: usize) -> u64 {
        self.slots[index].sent.load(Ordering::Acquire)
    }

    pub fn received(&self, index: usize) -> u64 {
        self.slots[index].received.load(Ordering::Acquire)
    }

    /// Snapshot sums over all targets; eventually consistent while workers
    /// are still running.
    pub fn totals(&self) -> (u64, u64) {
        self.slots.iter().fold((0, 0), |(s, r), slot| {
            (
                s + slot.sent.load(Ordering::Acquire),
                r + slot.received.load(Ordering::Acquire),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn counters_accumulate_independently() {
        let table = StatsTable::new(2);
        table.record_sent(0);
        table.record_sent(0);
        table.record_received(0);
        table.record_sent(1);
        assert_eq!((table.sent(0), table.received(0)), (2, 1));
        assert_eq!((table.sent(1), table.received(1)), (1, 0));
        assert_eq!(table.totals(), (3, 1));
    }

    #[test]
    fn reservation_never_exceeds_quota_under_contention() {
        let table = StatsTable::new(1);
        let quota = 1000u64;
        let admitted: u64 = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let mut wins = 0u64;
                        while table.try_reserve(0, quota).is_some() {
                            wins += 1;
                        }
                        wins
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(admitted, quota);
        assert_eq!(table.sent(0), quota);
    }

    #[test]
    fn reservation_reports_the_filling_increment_once() {
        let table = StatsTable::new(1);
        assert_eq!(table.try_reserve(0, 2), Some(1));
        assert_eq!(table.try_reserve(0, 2), Some(2));
        assert_eq!(table.try_reserve(0, 2), None);
    }
}
