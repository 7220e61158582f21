//! Guest device registry: per-guest lifecycle state machine, pool
//! allocation, and core assignment (SPEC_FULL.md §3 Guest/PoolAllocation,
//! §4.4).
//!
//! The registry is the unique owner of every `Guest`; workers and the
//! coordinator hold `Arc<Guest>` clones in per-core index lists, avoiding
//! pointer cycles (SPEC_FULL.md §9, "a registry plus per-core index sets
//! keyed by guest id is the natural reformulation").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::stats::GuestStats;

/// Monotonically-increasing guest id, assigned by the registry at
/// creation. Stands in for the original's `vid` (virtqueue/device id).
pub type GuestId = u64;

/// The control guest's pool-id sentinel (SPEC_FULL.md §3 "Pool-id
/// derivation": "The value -1 designates the control guest").
pub const CONTROL_POOL_ID: i32 = -1;

/// A guest's lifecycle state. Per SPEC_FULL.md §3/§4.4: "State only
/// increases along the order above" (`MacLearning` < `DataRx`/`Control` <
/// `SafeRemove`), modeled here as a monotonically non-decreasing `AtomicU8`.
///
/// `DataRx` is shared by both the data-guest and control-guest bindings;
/// `Guest::is_control` distinguishes the two within that ordinal, since
/// both only ever move forward into `SafeRemove` together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GuestState {
    MacLearning = 0,
    DataRx = 1,
    SafeRemove = 2,
}

impl GuestState {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(GuestState::MacLearning),
            1 => Some(GuestState::DataRx),
            2 => Some(GuestState::SafeRemove),
            _ => None,
        }
    }
}

/// A guest whose `state` tag is `DataRx`/`Control` needs to distinguish the
/// two (both share ordinal 1 in the monotonic progression above); this
/// flag is set exactly once, alongside the `AtomicU8` transition, and never
/// changes again.
#[derive(Debug)]
pub struct Guest {
    pub id: GuestId,
    pub mac: Mutex<Option<[u8; 6]>>,
    /// `None` until the MAC-learning transition assigns a pool. For the
    /// control guest this stays `None` forever (SPEC_FULL.md §4.4:
    /// "Entering Control releases the RX core assignment").
    pool_id: AtomicU32, // stores pool_id + 1; 0 means "unassigned"
    is_control: AtomicBool,
    vlan_tag: AtomicU32,
    state: AtomicU8,
    pub remove: AtomicBool,
    tx_core: AtomicU16,
    rx_core: AtomicU16, // u16::MAX means "unassigned"
    pub stats: GuestStats,
}

const NO_CORE: u16 = u16::MAX;

impl Guest {
    fn new(id: GuestId) -> Self {
        Self {
            id,
            mac: Mutex::new(None),
            pool_id: AtomicU32::new(0),
            is_control: AtomicBool::new(false),
            vlan_tag: AtomicU32::new(0),
            state: AtomicU8::new(GuestState::MacLearning as u8),
            remove: AtomicBool::new(false),
            tx_core: AtomicU16::new(NO_CORE),
            rx_core: AtomicU16::new(NO_CORE),
            stats: GuestStats::default(),
        }
    }

    pub fn state(&self) -> GuestState {
        GuestState::from_u8(self.state.load(Ordering::Acquire)).expect("valid state tag")
    }

    pub fn is_control(&self) -> bool {
        self.is_control.load(Ordering::Acquire)
    }

    pub fn pool_id(&self) -> Option<u32> {
        let v = self.pool_id.load(Ordering::Acquire);
        if v == 0 { None } else { Some(v - 1) }
    }

    pub fn vlan_tag(&self) -> u32 {
        self.vlan_tag.load(Ordering::Acquire)
    }

    pub fn tx_core(&self) -> Option<usize> {
        let c = self.tx_core.load(Ordering::Acquire);
        if c == NO_CORE { None } else { Some(c as usize) }
    }

    pub fn rx_core(&self) -> Option<usize> {
        let c = self.rx_core.load(Ordering::Acquire);
        if c == NO_CORE { None } else { Some(c as usize) }
    }

    pub fn set_tx_core(&self, core: usize) {
        self.tx_core.store(core as u16, Ordering::Release);
    }

    pub fn set_rx_core(&self, core: usize) {
        self.rx_core.store(core as u16, Ordering::Release);
    }

    pub fn clear_rx_core(&self) {
        self.rx_core.store(NO_CORE, Ordering::Release);
    }

    pub fn request_remove(&self) {
        self.remove.store(true, Ordering::Release);
    }

    pub fn is_remove_requested(&self) -> bool {
        self.remove.load(Ordering::Acquire)
    }

    pub fn mark_safe_remove(&self) {
        self.state.store(GuestState::SafeRemove as u8, Ordering::Release);
    }

    /// Bind this guest into `DataRx` with `pool_id`/`vlan_tag`. Called once,
    /// from the MAC-learning transition (SPEC_FULL.md §4.4).
    fn bind_data_rx(&self, mac: [u8; 6], pool_id: u32, vlan_tag: u32) {
        *self.mac.lock().unwrap() = Some(mac);
        self.pool_id.store(pool_id + 1, Ordering::Release);
        self.vlan_tag.store(vlan_tag, Ordering::Release);
        self.state.store(GuestState::DataRx as u8, Ordering::Release);
    }

    /// Bind this guest into `Control` (SPEC_FULL.md §4.4).
    fn bind_control(&self, mac: [u8; 6]) {
        *self.mac.lock().unwrap() = Some(mac);
        self.is_control.store(true, Ordering::Release);
        self.state.store(GuestState::DataRx as u8, Ordering::Release);
    }
}

/// Bit vector over pool ids (SPEC_FULL.md §3 PoolAllocation). Touched only
/// by the coordinator (single-threaded); workers see it as read-only via
/// `GuestRegistry::pool_occupied`.
#[derive(Debug, Default)]
struct PoolBitmap {
    bits: Vec<bool>,
}

impl PoolBitmap {
    fn new(num_pools: usize) -> Self {
        Self { bits: vec![false; num_pools] }
    }

    fn try_claim(&mut self, pool_id: u32) -> bool {
        let idx = pool_id as usize;
        if idx >= self.bits.len() || self.bits[idx] {
            return false;
        }
        self.bits[idx] = true;
        true
    }

    fn release(&mut self, pool_id: u32) {
        if let Some(slot) = self.bits.get_mut(pool_id as usize) {
            *slot = false;
        }
    }

    fn is_set(&self, pool_id: u32) -> bool {
        self.bits.get(pool_id as usize).copied().unwrap_or(false)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LearnOutcome {
    BoundData { pool_id: u32, vlan_tag: u32 },
    BoundControl,
    /// Pool collision: another guest already owns that pool id. The
    /// original keeps learning and logs once per process (SPEC_FULL.md
    /// §4.4/§7 "MAC-pool collision").
    PoolCollision,
}

/// Owns every `Guest` for the process lifetime, the pool bitmap, and
/// derives pool ids from MACs per SPEC_FULL.md §3.
pub struct GuestRegistry {
    guests: Mutex<HashMap<GuestId, Arc<Guest>>>,
    next_id: AtomicU64,
    pools: Mutex<PoolBitmap>,
    num_pools: usize,
    vlan_tags: Vec<u16>,
    collision_logged: AtomicBool,
}

impl GuestRegistry {
    pub fn new(num_pools: usize, vlan_tags: Vec<u16>) -> Self {
        Self {
            guests: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pools: Mutex::new(PoolBitmap::new(num_pools + 1)),
            num_pools,
            vlan_tags,
            collision_logged: AtomicBool::new(false),
        }
    }

    /// Register a newly-connected guest in `MacLearning`, per the
    /// new-device callback (SPEC_FULL.md §3 Guest lifecycle).
    pub fn add(&self) -> Arc<Guest> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guest = Arc::new(Guest::new(id));
        self.guests.lock().unwrap().insert(id, guest.clone());
        guest
    }

    pub fn get(&self, id: GuestId) -> Option<Arc<Guest>> {
        self.guests.lock().unwrap().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Guest>> {
        self.guests.lock().unwrap().values().cloned().collect()
    }

    /// Pool-id derivation (SPEC_FULL.md §3): `pool_id = mac[5] mod
    /// (num_pools+1) - 1`; `-1` is the control guest.
    pub fn derive_pool_id(&self, mac: [u8; 6]) -> i32 {
        (mac[5] as i32) % (self.num_pools as i32 + 1) - 1
    }

    /// Attempt the MAC-learning transition on `guest`'s first TX packet
    /// (SPEC_FULL.md §4.4). Idempotent in the collision case: `guest`
    /// remains in `MacLearning` and the caller should keep trying on
    /// subsequent bursts (mirroring the original's per-packet retry).
    pub fn learn(&self, guest: &Guest, mac: [u8; 6]) -> LearnOutcome {
        let derived = self.derive_pool_id(mac);
        if derived < 0 {
            guest.bind_control(mac);
            return LearnOutcome::BoundControl;
        }
        let pool_id = derived as u32;
        let mut pools = self.pools.lock().unwrap();
        if !pools.try_claim(pool_id) {
            if !self.collision_logged.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    guest_id = guest.id,
                    pool_id,
                    "MAC-pool collision; guest remains in MacLearning"
                );
            }
            return LearnOutcome::PoolCollision;
        }
        let vlan_tag = self
            .vlan_tags
            .get(pool_id as usize + 1)
            .copied()
            .unwrap_or(pool_id as u16) as u32;
        guest.bind_data_rx(mac, pool_id, vlan_tag);
        LearnOutcome::BoundData { pool_id, vlan_tag }
    }

    /// I4: a guest in DataRx owns exactly one pool bit; no two DataRx
    /// guests share one. Exposed for workers that need a read-only check
    /// (e.g. before re-enabling an RX queue).
    pub fn pool_occupied(&self, pool_id: u32) -> bool {
        self.pools.lock().unwrap().is_set(pool_id)
    }

    /// Final step of the removal protocol (SPEC_FULL.md §4.4): drop the
    /// guest from the registry and free its pool bit. Must only be called
    /// after the two-flag rendezvous has completed (SPEC_FULL.md §5/I5).
    pub fn remove(&self, id: GuestId) {
        let guest = self.guests.lock().unwrap().remove(&id);
        if let Some(guest) = guest
            && let Some(pool_id) = guest.pool_id()
        {
            self.pools.lock().unwrap().release(pool_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_data_guest_binds_pool_from_mac() {
        let registry = GuestRegistry::new(8, (0..=8u16).collect());
        let guest = registry.add();
        let outcome = registry.learn(&guest, [0, 0, 0, 0, 0, 5]);
        assert_eq!(outcome, LearnOutcome::BoundData { pool_id: 4, vlan_tag: 5 });
        assert_eq!(guest.state(), GuestState::DataRx);
        assert!(!guest.is_control());
        assert_eq!(guest.pool_id(), Some(4));
        assert!(registry.pool_occupied(4));
    }

    #[test]
    fn s2_control_mac_binds_control_state() {
        let registry = GuestRegistry::new(8, (0..=8u16).collect());
        let guest = registry.add();
        let outcome = registry.learn(&guest, [0, 0, 0, 0, 0, 0]);
        assert_eq!(outcome, LearnOutcome::BoundControl);
        assert!(guest.is_control());
        assert_eq!(guest.pool_id(), None);
    }

    #[test]
    fn i4_collision_keeps_first_owner_and_rejects_second() {
        let registry = GuestRegistry::new(8, (0..=8u16).collect());
        let first = registry.add();
        let second = registry.add();
        assert_eq!(
            registry.learn(&first, [0, 0, 0, 0, 0, 5]),
            LearnOutcome::BoundData { pool_id: 4, vlan_tag: 5 }
        );
        assert_eq!(registry.learn(&second, [0, 0, 0, 0, 0, 5]), LearnOutcome::PoolCollision);
        assert_eq!(second.state(), GuestState::MacLearning);
    }

    #[test]
    fn removal_releases_pool_bit() {
        let registry = GuestRegistry::new(8, (0..=8u16).collect());
        let guest = registry.add();
        registry.learn(&guest, [0, 0, 0, 0, 0, 5]);
        assert!(registry.pool_occupied(4));
        registry.remove(guest.id);
        assert!(!registry.pool_occupied(4));
        assert!(registry.get(guest.id).is_none());
    }
}
