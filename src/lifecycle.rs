//! Lifecycle coordinator: guest add/remove, core assignment, and the
//! two-flag rendezvous (SPEC_FULL.md §4.4).
//!
//! This is the one thread allowed to block (SPEC_FULL.md §5: "the only
//! blocking points are the coordinator thread spinning on per-guest
//! `ready == SafeRemove` and on per-core `dev_removal_flag == ACK`"). It is
//! driven by the guest-transport library's new-device/destroy-device
//! callbacks, mirroring the teacher's `dataplane::vhost` device-lifecycle
//! hooks but generalized to this crate's N-core worker pool instead of one
//! thread per guest.

use std::sync::Arc;
use std::time::Duration;

use crate::guest_transport::VhostGuestTransport;
use crate::guest_transport_vhost::VhostHandshake;
use crate::registry::{Guest, GuestId, GuestRegistry};
use crate::worker::WorkerCore;

/// Hint for the coordinator's busy-wait spins (SPEC_FULL.md §5: "both with
/// a CPU relaxation hint"). `std::hint::spin_loop` already compiles to a
/// `pause` instruction on x86_64; a short sleep bounds how aggressively the
/// coordinator thread burns a core while waiting on workers that only make
/// progress a handful of times per microsecond.
const SPIN_YIELD: Duration = Duration::from_micros(10);

/// Owns the worker-core pool and the registry on the coordinator's behalf.
/// `cores[0]` is always the sole TX core (SPEC_FULL.md §4.4: "The first
/// discovered worker core receives TX duty for all guests").
pub struct Coordinator {
    registry: Arc<GuestRegistry>,
    cores: Vec<Arc<WorkerCore>>,
    transport: Arc<VhostGuestTransport>,
}

impl Coordinator {
    pub fn new(registry: Arc<GuestRegistry>, cores: Vec<Arc<WorkerCore>>, transport: Arc<VhostGuestTransport>) -> Self {
        assert!(!cores.is_empty(), "at least one worker core is required");
        Self { registry, cores, transport }
    }

    fn tx_core(&self) -> &Arc<WorkerCore> {
        &self.cores[0]
    }

    /// Round-robin least-loaded RX assignment among every core except the
    /// dedicated TX core (SPEC_FULL.md §4.4). Falls back to the TX core
    /// itself when it is the only core in the pool.
    fn pick_rx_core(&self) -> usize {
        let candidates = if self.cores.len() > 1 { &self.cores[1..] } else { &self.cores[..] };
        let (idx, _) = candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, core)| core.rx_count())
            .expect("cores is non-empty");
        if self.cores.len() > 1 { idx + 1 } else { idx }
    }

    /// New-device callback (SPEC_FULL.md §3 Guest "Created by new-device
    /// callback"). Registers the guest, assigns TX duty to the sole TX
    /// core, and assigns an RX core round-robin; the RX assignment is
    /// released later if the guest turns out to be the control guest
    /// (`worker::attempt_mac_learning` handles that reactively once MAC
    /// learning resolves it).
    pub fn add_guest(&self) -> Arc<Guest> {
        let guest = self.registry.add();

        let tx_core = self.tx_core();
        guest.set_tx_core(tx_core.index);
        tx_core.add_tx(guest.clone());

        let rx_idx = self.pick_rx_core();
        guest.set_rx_core(rx_idx);
        self.cores[rx_idx].add_rx(guest.clone());

        tracing::info!(guest_id = guest.id, tx_core = tx_core.index, rx_core = rx_idx, "guest attached");
        guest
    }

    /// Install the negotiated vhost-user memory/vrings for `guest`, called
    /// from the guest-transport library's own accept thread once the
    /// handshake completes (SPEC_FULL.md §5 "(ii) any callback invoked by
    /// the external guest-transport library on its own thread").
    pub fn attach_transport(&self, guest: GuestId, handshake: VhostHandshake) {
        self.transport.install(guest, handshake);
    }

    /// Destroy-device callback (SPEC_FULL.md §4.4 "Removal protocol").
    /// Blocks until every worker has quiesced past the guest's removal.
    pub fn remove_guest(&self, id: GuestId) {
        let Some(guest) = self.registry.get(id) else {
            return;
        };

        guest.request_remove();
        tracing::info!(guest_id = id, stats = ?guest.stats.snapshot(), "removing guest, stats at request time");

        while guest.state() != crate::registry::GuestState::SafeRemove {
            std::hint::spin_loop();
            std::thread::yield_now();
        }

        self.tx_core().remove_tx(&guest);
        if let Some(rx_idx) = guest.rx_core()
            && let Some(core) = self.cores.get(rx_idx)
        {
            core.remove_rx(&guest);
        }

        self.rendezvous();

        self.transport.remove(id);
        self.registry.remove(id);
        tracing::info!(guest_id = id, "guest destroyed");
    }

    /// SPEC_FULL.md §4.4/§5/I5: "set each core's dev_removal_flag :=
    /// REQUEST; wait until every core has set it to ACK... after rendezvous,
    /// no worker can be mid-iteration over a list that still contained the
    /// removed guest."
    fn rendezvous(&self) {
        for core in &self.cores {
            core.request_removal_ack();
        }
        for core in &self.cores {
            while !core.has_acked() {
                std::hint::spin_loop();
                std::thread::sleep(SPIN_YIELD);
            }
        }
    }

    pub fn registry(&self) -> &Arc<GuestRegistry> {
        &self.registry
    }

    /// USR2 (SPEC_FULL.md §6c): reset every guest's statistics without
    /// synchronization; a transient inconsistency during a concurrent
    /// worker update is acceptable (§4.6).
    pub fn reset_all_stats(&self) {
        for guest in self.registry.all() {
            guest.stats.reset();
        }
    }

    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn cores(&self) -> &[Arc<WorkerCore>] {
        &self.cores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(num_cores: usize) -> Coordinator {
        let registry = Arc::new(GuestRegistry::new(8, (0..=8u16).collect()));
        let cores = (0..num_cores).map(|i| Arc::new(WorkerCore::new(i))).collect();
        let transport = Arc::new(VhostGuestTransport::new());
        Coordinator::new(registry, cores, transport)
    }

    #[test]
    fn add_guest_assigns_tx_to_core_zero_and_rx_round_robin() {
        let coord = coordinator(3);
        let a = coord.add_guest();
        let b = coord.add_guest();

        assert_eq!(a.tx_core(), Some(0));
        assert_eq!(b.tx_core(), Some(0));
        assert_eq!(coord.cores()[0].tx_count(), 2);

        // Least-loaded among cores 1..3: first goes to 1, second to 2.
        assert_eq!(a.rx_core(), Some(1));
        assert_eq!(b.rx_core(), Some(2));
    }

    #[test]
    fn remove_guest_waits_for_safe_remove_then_rendezvous() {
        let coord = coordinator(2);
        let guest = coord.add_guest();
        let id = guest.id;

        let handle = std::thread::spawn({
            let guest = guest.clone();
            move || {
                std::thread::sleep(Duration::from_millis(5));
                guest.mark_safe_remove();
            }
        });

        coord.remove_guest(id);
        handle.join().unwrap();

        assert!(coord.registry().get(id).is_none());
        assert_eq!(coord.cores()[0].tx_count(), 0);
    }

    #[test]
    fn single_core_pool_uses_same_core_for_rx_and_tx() {
        let coord = coordinator(1);
        let guest = coord.add_guest();
        assert_eq!(guest.tx_core(), Some(0));
        assert_eq!(guest.rx_core(), Some(0));
    }
}
