//! Data-plane worker: the per-core busy loop (SPEC_FULL.md §4.5).
//!
//! Each `WorkerCore` owns two disjoint lists of guests — RX-from-NIC and
//! TX-from-guest — published via `ArcSwap` so the coordinator can splice
//! guests in and out without the hot loop ever taking a lock (SPEC_FULL.md
//! §5: "the hot loop never sleeps and must not take locks"). The coordinator
//! only replaces a list wholesale (copy-on-write), never mutates one in
//! place, so a loop iteration always sees a fully-formed snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use arc_swap::ArcSwap;

use crate::buffer::{BufferPool, PacketBuffer};
use crate::classifier::{self, ClassifyOutcome};
use crate::control;
use crate::guest_transport::GuestTransport;
use crate::matching_table::SharedMatchingTable;
use crate::nic::NicPort;
use crate::registry::{Guest, GuestRegistry, GuestState, LearnOutcome};
use crate::tsc;

/// Two-flag rendezvous state for one worker core (SPEC_FULL.md §3
/// WorkerCore, §4.4 "Removal protocol"). `ACK` is the idle/quiescent value;
/// the coordinator sets `REQUEST` and spins until the worker flips it back.
pub const REMOVAL_ACK: u8 = 0;
pub const REMOVAL_REQUEST: u8 = 1;

/// A worker's pending TX batch (SPEC_FULL.md §3 CoreBatch): lives on the
/// worker's own stack, single-writer by construction.
struct CoreBatch {
    txq_id: u16,
    buffers: Vec<PacketBuffer>,
}

impl CoreBatch {
    fn new(txq_id: u16) -> Self {
        Self {
            txq_id,
            buffers: Vec::with_capacity(crate::config::MAX_PKT_BURST),
        }
    }

    fn push(&mut self, buf: PacketBuffer, nic: &dyn NicPort) {
        self.buffers.push(buf);
        if self.buffers.len() >= crate::config::MAX_PKT_BURST {
            self.flush(nic);
        }
    }

    /// SPEC_FULL.md §4.5 "Batch flush": submit to the NIC; whatever it
    /// refuses is freed locally (dropped) rather than retried (§7 "NIC TX
    /// refusal").
    fn flush(&mut self, nic: &dyn NicPort) {
        if self.buffers.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffers);
        let _accepted = nic.tx_burst(self.txq_id, batch);
    }
}

/// One pinned, polling data-plane core. Guest membership is published by
/// the coordinator via RCU-style whole-list replacement.
pub struct WorkerCore {
    pub index: usize,
    rx_guests: ArcSwap<Vec<Arc<Guest>>>,
    tx_guests: ArcSwap<Vec<Arc<Guest>>>,
    removal_flag: AtomicU8,
}

impl WorkerCore {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            rx_guests: ArcSwap::from_pointee(Vec::new()),
            tx_guests: ArcSwap::from_pointee(Vec::new()),
            removal_flag: AtomicU8::new(REMOVAL_ACK),
        }
    }

    pub fn rx_count(&self) -> usize {
        self.rx_guests.load().len()
    }

    pub fn tx_count(&self) -> usize {
        self.tx_guests.load().len()
    }

    fn with_added(swap: &ArcSwap<Vec<Arc<Guest>>>, item: Arc<Guest>) {
        let current = swap.load();
        if current.iter().any(|g| g.id == item.id) {
            return;
        }
        let mut next = (**current).clone();
        next.push(item);
        swap.store(Arc::new(next));
    }

    fn with_removed(swap: &ArcSwap<Vec<Arc<Guest>>>, item: &Arc<Guest>) {
        let current = swap.load();
        let next: Vec<Arc<Guest>> = current.iter().filter(|g| g.id != item.id).cloned().collect();
        swap.store(Arc::new(next));
    }

    pub fn add_rx(&self, guest: Arc<Guest>) {
        Self::with_added(&self.rx_guests, guest);
    }

    pub fn add_tx(&self, guest: Arc<Guest>) {
        Self::with_added(&self.tx_guests, guest);
    }

    pub fn remove_rx(&self, guest: &Arc<Guest>) {
        Self::with_removed(&self.rx_guests, guest);
    }

    pub fn remove_tx(&self, guest: &Arc<Guest>) {
        Self::with_removed(&self.tx_guests, guest);
    }

    /// Coordinator side of the rendezvous: request acknowledgement.
    pub fn request_removal_ack(&self) {
        self.removal_flag.store(REMOVAL_REQUEST, Ordering::Release);
    }

    pub fn has_acked(&self) -> bool {
        self.removal_flag.load(Ordering::Acquire) == REMOVAL_ACK
    }

    /// Worker side, step 1 of the main loop (SPEC_FULL.md §4.5): "If
    /// dev_removal_flag == REQUEST, set it to ACK."
    fn observe_removal_request(&self) {
        let _ = self
            .removal_flag
            .compare_exchange(REMOVAL_REQUEST, REMOVAL_ACK, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Everything a worker or the coordinator needs a shared reference to
/// (SPEC_FULL.md §9: "a single 'switch context' value created at startup").
pub struct SwitchContext {
    pub pool: BufferPool,
    pub table: SharedMatchingTable,
    pub nic: Arc<dyn NicPort>,
    pub transport: Arc<dyn GuestTransport>,
    pub registry: Arc<GuestRegistry>,
    pub cores: Vec<Arc<WorkerCore>>,
    pub cpu_freq: u64,
    pub do_tag: bool,
    pub do_shape: bool,
}

/// Run one iteration of a worker's main loop (SPEC_FULL.md §4.5). Exposed
/// as a free function, rather than a method that loops forever, so tests
/// can drive a bounded number of iterations deterministically; `main.rs`
/// calls this in an unconditional `loop {}` per worker thread.
pub fn run_once(core: &WorkerCore, ctx: &SwitchContext) {
    core.observe_removal_request();

    for guest in core.rx_guests.load().iter() {
        process_rx(guest, ctx);
    }

    let mut batch = CoreBatch::new(core.index as u16);
    for guest in core.tx_guests.load().iter() {
        process_tx(guest, ctx, &mut batch);
    }
    batch.flush(ctx.nic.as_ref());
}

fn process_rx(guest: &Arc<Guest>, ctx: &SwitchContext) {
    let Some(pool_id) = guest.pool_id() else {
        return;
    };

    if guest.is_remove_requested() {
        // Drain whatever the NIC still has queued for this pool, then
        // unlink it (SPEC_FULL.md §4.5 step 2: "drain residual RX burst,
        // clear MAC/VLAN, free pool bit").
        let _ = ctx.nic.rx_burst(pool_id as u16, &ctx.pool, crate::config::MAX_PKT_BURST);
        ctx.nic.disable_pool_rx(pool_id);
        return;
    }

    if guest.state() != GuestState::DataRx || guest.is_control() {
        return;
    }

    let received = ctx.nic.rx_burst(pool_id as u16, &ctx.pool, crate::config::MAX_PKT_BURST);
    let total = received.len() as u64;
    let success = ctx.transport.enqueue_rx_burst(guest.id, received) as u64;
    guest.stats.rx.record(total, success);
}

fn process_tx(guest: &Arc<Guest>, ctx: &SwitchContext, batch: &mut CoreBatch) {
    let burst = ctx.transport.dequeue_tx_burst(guest.id, &ctx.pool, crate::config::MAX_PKT_BURST);

    match guest.state() {
        GuestState::MacLearning => {
            // SPEC_FULL.md §4.5 step 3: "attempt the MAC-learning transition
            // using the first packet (free the burst on failure)" — the
            // whole burst is consumed either way, success or collision.
            if let Some(first) = burst.first()
                && let Some(mac) = ethernet_src_mac(first.data())
            {
                attempt_mac_learning(guest, ctx, mac);
            }
        }
        GuestState::DataRx if guest.is_control() => {
            let table = unsafe { ctx.table.get_mut() };
            let now = tsc::read_tsc();
            for pkt in &burst {
                let _ = control::apply_control_frame(pkt.data(), table, ctx.cpu_freq, now);
            }
        }
        GuestState::DataRx => {
            let pool_tag = guest.vlan_tag() as usize;
            let table = unsafe { ctx.table.get_mut() };
            let now = tsc::read_tsc();
            for mut pkt in burst {
                guest.stats.tx.record_tx();
                let outcome = classifier::classify_and_tag(
                    &mut pkt,
                    table,
                    pool_tag,
                    ctx.cpu_freq,
                    now,
                    ctx.do_tag,
                    ctx.do_shape,
                );
                match outcome {
                    ClassifyOutcome::Tagged(_) | ClassifyOutcome::ForwardedUntagged => {
                        guest.stats.tx.record_tagged();
                        guest.stats.tx.record_success();
                        batch.push(pkt, ctx.nic.as_ref());
                    }
                    ClassifyOutcome::ShaperDropped => {
                        guest.stats.tx.record_dropped();
                    }
                    ClassifyOutcome::Unmatched | ClassifyOutcome::ZeroTagNoop | ClassifyOutcome::CannotTag => {}
                }
            }
        }
        GuestState::SafeRemove => {}
    }

    if guest.is_remove_requested() {
        guest.mark_safe_remove();
    }
}

/// SPEC_FULL.md §4.4: "Entering DataRx binds the guest to pool_id,
/// registers the MAC with the NIC for that pool, enables on-chip VLAN
/// stripping... Entering Control releases the RX core assignment."
fn attempt_mac_learning(guest: &Arc<Guest>, ctx: &SwitchContext, mac: [u8; 6]) {
    match ctx.registry.learn(guest, mac) {
        LearnOutcome::BoundData { pool_id, vlan_tag } => {
            if let Err(err) = ctx.nic.enable_pool_rx(pool_id, vlan_tag, mac) {
                tracing::error!(guest_id = guest.id, %err, "failed to enable pool rx");
            }
        }
        LearnOutcome::BoundControl => {
            if let Some(core_idx) = guest.rx_core() {
                if let Some(core) = ctx.cores.get(core_idx) {
                    core.remove_rx(guest);
                }
                guest.clear_rx_core();
            }
        }
        LearnOutcome::PoolCollision => {}
    }
}

fn ethernet_src_mac(data: &[u8]) -> Option<[u8; 6]> {
    if data.len() < 12 {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&data[6..12]);
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_transport::SoftwareGuestTransport;
    use crate::nic::SoftwareNic;

    fn context() -> (SwitchContext, Arc<SoftwareNic>, Arc<SoftwareGuestTransport>) {
        let nic = Arc::new(SoftwareNic::new());
        let transport = Arc::new(SoftwareGuestTransport::new());
        let registry = Arc::new(GuestRegistry::new(8, (0..=8u16).collect()));
        let ctx = SwitchContext {
            pool: BufferPool::new(64).unwrap(),
            table: SharedMatchingTable::new(),
            nic: nic.clone(),
            transport: transport.clone(),
            registry,
            cores: Vec::new(),
            cpu_freq: 1_000_000_000,
            do_tag: true,
            do_shape: true,
        };
        (ctx, nic, transport)
    }

    #[test]
    fn rx_forwards_burst_unchanged_and_updates_stats() {
        let (ctx, nic, transport) = context();
        let guest = ctx.registry.add();
        ctx.registry.learn(&guest, [0, 0, 0, 0, 0, 5]);
        nic.seed_rx(4, vec![vec![1, 2, 3], vec![4, 5, 6]]);

        let core = WorkerCore::new(1);
        core.add_rx(guest.clone());
        run_once(&core, &ctx);

        assert_eq!(transport.rx_log(guest.id).len(), 2);
        let snap = guest.stats.snapshot();
        assert_eq!(snap.rx_total, 2);
        assert_eq!(snap.rx_success, 2);
    }

    #[test]
    fn removed_rx_guest_drains_and_disables_pool() {
        let (ctx, nic, _transport) = context();
        let guest = ctx.registry.add();
        ctx.registry.learn(&guest, [0, 0, 0, 0, 0, 5]);
        nic.enable_pool_rx(4, 5, [0, 0, 0, 0, 0, 5]).unwrap();
        nic.seed_rx(4, vec![vec![1, 2, 3]]);
        guest.request_remove();

        let core = WorkerCore::new(1);
        core.add_rx(guest.clone());
        run_once(&core, &ctx);

        assert!(!nic.is_pool_enabled(4));
    }

    #[test]
    fn mac_learning_consumes_burst_and_enables_pool() {
        let (ctx, nic, transport) = context();
        let guest = ctx.registry.add();
        let mut frame = vec![0u8; 14];
        frame[6..12].copy_from_slice(&[0, 0, 0, 0, 0, 5]);
        transport.seed_tx(guest.id, vec![frame]);

        let core = WorkerCore::new(0);
        core.add_tx(guest.clone());
        run_once(&core, &ctx);

        assert_eq!(guest.state(), GuestState::DataRx);
        assert_eq!(guest.pool_id(), Some(4));
        assert!(nic.is_pool_enabled(4));
        // The learning packet itself is never forwarded to the NIC.
        assert!(nic.tx_log(0).is_empty());
    }

    #[test]
    fn tx_tags_and_flushes_to_nic() {
        let (ctx, nic, transport) = context();
        let guest = ctx.registry.add();
        ctx.registry.learn(&guest, [0x52, 0x54, 0, 0, 0, 5]);

        let mut frame = vec![0u8; 14 + 20 + 20];
        frame[0..6].copy_from_slice(&[0x52, 0x54, 0, 0, 0, 9]);
        frame[6..12].copy_from_slice(&[0x52, 0x54, 0, 0, 0, 5]);
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        frame[14] = 0x45;
        frame[16..18].copy_from_slice(&60u16.to_be_bytes());
        frame[23] = 6;
        frame[26..30].copy_from_slice(&[10, 0, 0, 1]);
        frame[30..34].copy_from_slice(&[10, 0, 0, 2]);
        frame[34..36].copy_from_slice(&1000u16.to_be_bytes());
        frame[36..38].copy_from_slice(&2000u16.to_be_bytes());
        transport.seed_tx(guest.id, vec![frame]);

        {
            let table = unsafe { ctx.table.get_mut() };
            *table.entry_mut(guest.vlan_tag() as usize, 0).unwrap() = crate::matching_table::MatchEntry {
                protocol: 6,
                src_ip: 0x0a000001,
                dst_ip: 0x0a000002,
                src_port: 1000,
                dst_port: 2000,
                rate_bps: u64::MAX,
                burst_bits: u64::MAX / (1 << 20),
                n_tokens: u64::MAX / 2,
                last_tsc: 0,
                n_tags: 1,
                tags: [crate::matching_table::Tag { eth_type: 0x8100, vid: 42 }; crate::config::MAX_TAGS],
            };
        }
        nic.enable_pool_rx(4, 5, [0x52, 0x54, 0, 0, 0, 5]).unwrap();

        let core = WorkerCore::new(0);
        core.add_tx(guest.clone());
        run_once(&core, &ctx);

        let sent = nic.tx_log(0);
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][16..18], &0x8100u16.to_be_bytes());
        let snap = guest.stats.snapshot();
        assert_eq!(snap.tx_total, 1);
        assert_eq!(snap.tx_tagged, 1);
        assert_eq!(snap.tx_success, 1);
    }

    #[test]
    fn control_guest_updates_table_without_forwarding() {
        let (ctx, nic, transport) = context();
        let guest = ctx.registry.add();
        ctx.registry.learn(&guest, [0, 0, 0, 0, 0, 0]);
        assert!(guest.is_control());

        let entry = crate::matching_table::MatchEntry {
            protocol: 6,
            src_ip: 0x0a000001,
            dst_ip: 0x0a000002,
            src_port: 1000,
            dst_port: 2000,
            rate_bps: 1_000_000_000,
            burst_bits: 1_000_000,
            n_tokens: 0,
            last_tsc: 0,
            n_tags: 2,
            tags: [crate::matching_table::Tag { eth_type: 0x8100, vid: 100 }; crate::config::MAX_TAGS],
        };
        let frame = control::build_control_frame([0, 0, 0, 0, 0, 0], 5, 0, &entry);
        transport.seed_tx(guest.id, vec![frame]);

        let core = WorkerCore::new(0);
        core.add_tx(guest.clone());
        run_once(&core, &ctx);

        let table = unsafe { ctx.table.get_mut() };
        assert_eq!(table.entry(5, 0).unwrap().protocol, 6);
        assert!(nic.tx_log(0).is_empty());
    }

    #[test]
    fn worker_core_add_remove_are_idempotent() {
        let (ctx, _nic, _transport) = context();
        let guest = ctx.registry.add();
        let core = WorkerCore::new(0);
        core.add_rx(guest.clone());
        core.add_rx(guest.clone());
        assert_eq!(core.rx_count(), 1);
        core.remove_rx(&guest);
        assert_eq!(core.rx_count(), 0);
    }
}
