//! Per-guest statistics.
//!
//! Split between a cross-core atomic half (touched by the guest's RX
//! worker, read by the coordinator) and a single-writer plain half (touched
//! only by the guest's TX worker), per SPEC_FULL.md §4.6. A USR2 reset
//! zeroes both halves without synchronization; a transient inconsistency
//! between the two during a concurrent reset is acceptable (§4.6).

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters written by more than one core: the guest's RX worker increments
/// them, the coordinator (USR1/destroy) reads them.
#[derive(Debug, Default)]
pub struct RxStats {
    pub rx_total: AtomicU64,
    pub rx_success: AtomicU64,
}

impl RxStats {
    pub fn record(&self, total: u64, success: u64) {
        self.rx_total.fetch_add(total, Ordering::Relaxed);
        self.rx_success.fetch_add(success, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.rx_total.store(0, Ordering::Relaxed);
        self.rx_success.store(0, Ordering::Relaxed);
    }
}

/// Counters touched only by the one TX worker that owns this guest; no
/// atomics needed (SPEC_FULL.md §4.6/§5).
#[derive(Debug, Default)]
pub struct TxStats {
    pub tx_total: Cell<u64>,
    pub tx_tagged: Cell<u64>,
    pub tx_success: Cell<u64>,
    pub tx_dropped: Cell<u64>,
}

// SAFETY: a `TxStats` is only ever mutated from the single TX worker thread
// that owns the enclosing guest; cross-thread reads (USR1, destroy_device)
// happen only after that worker has observed the guest's removal, per the
// two-flag rendezvous in SPEC_FULL.md §4.4/§5.
unsafe impl Sync for TxStats {}

impl TxStats {
    pub fn record_tx(&self) {
        self.tx_total.set(self.tx_total.get() + 1);
    }

    pub fn record_tagged(&self) {
        self.tx_tagged.set(self.tx_tagged.get() + 1);
    }

    pub fn record_success(&self) {
        self.tx_success.set(self.tx_success.get() + 1);
    }

    pub fn record_dropped(&self) {
        self.tx_dropped.set(self.tx_dropped.get() + 1);
    }

    pub fn reset(&self) {
        self.tx_total.set(0);
        self.tx_tagged.set(0);
        self.tx_success.set(0);
        self.tx_dropped.set(0);
    }
}

/// Full per-guest statistics block, combining both halves.
#[derive(Debug, Default)]
pub struct GuestStats {
    pub rx: RxStats,
    pub tx: TxStats,
}

impl GuestStats {
    pub fn reset(&self) {
        self.rx.reset();
        self.tx.reset();
    }

    /// Snapshot for USR1 reporting; see SPEC_FULL.md §6c.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_total: self.rx.rx_total.load(Ordering::Relaxed),
            rx_success: self.rx.rx_success.load(Ordering::Relaxed),
            tx_total: self.tx.tx_total.get(),
            tx_tagged: self.tx.tx_tagged.get(),
            tx_success: self.tx.tx_success.get(),
            tx_dropped: self.tx.tx_dropped.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_total: u64,
    pub rx_success: u64,
    pub tx_total: u64,
    pub tx_tagged: u64,
    pub tx_success: u64,
    pub tx_dropped: u64,
}

impl StatsSnapshot {
    /// I6: rx_total >= rx_success; tx_total = tx_tagged + tx_dropped +
    /// unmatched drops (so tx_tagged + tx_dropped <= tx_total); tx_success
    /// <= tx_tagged.
    pub fn is_consistent(&self) -> bool {
        self.rx_total >= self.rx_success
            && self.tx_tagged + self.tx_dropped <= self.tx_total
            && self.tx_success <= self.tx_tagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_zeroes_both_halves() {
        let stats = GuestStats::default();
        stats.rx.record(5, 3);
        stats.tx.record_tx();
        stats.tx.record_tagged();
        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap, StatsSnapshot::default());
    }

    #[test]
    fn consistency_check_catches_violation() {
        let mut snap = StatsSnapshot {
            rx_total: 1,
            rx_success: 2,
            ..Default::default()
        };
        assert!(!snap.is_consistent());
        snap.rx_success = 1;
        assert!(snap.is_consistent());
    }
}
