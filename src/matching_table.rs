//! The matching table: a fixed two-dimensional array of rate-limit + tag
//! rules, and the scaled-integer token bucket embedded in each entry.
//!
//! SPEC_FULL.md §4.1. Indexed by `(pool_tag, rule_slot)`; pool 0 is
//! reserved and never matched against (SPEC_FULL.md §3). Writers are the
//! control-channel decoder (single-writer); readers are every TX worker,
//! lock-free (SPEC_FULL.md §5).

use std::cell::UnsafeCell;

use crate::config::{MAX_POOLS, MAX_TAGS, N_ENTRIES_PER_VHOST};

/// One 802.1Q-style tag: EtherType followed by VID, both on-wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tag {
    pub eth_type: u16,
    pub vid: u16,
}

/// A single rate-limit + tag-list rule, plus its embedded token-bucket
/// state. Layout mirrors the on-wire control-message image (SPEC_FULL.md
/// §6, "Control-message wire format"), field by field rather than via a
/// raw struct memcmp (SPEC_FULL.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchEntry {
    pub protocol: u8,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub rate_bps: u64,
    pub burst_bits: u64,
    pub n_tokens: u64,
    pub last_tsc: u64,
    pub n_tags: u16,
    pub tags: [Tag; MAX_TAGS],
}

impl Default for MatchEntry {
    fn default() -> Self {
        Self {
            protocol: 0,
            src_ip: 0,
            dst_ip: 0,
            src_port: 0,
            dst_port: 0,
            rate_bps: 0,
            burst_bits: 0,
            n_tokens: 0,
            last_tsc: 0,
            n_tags: 0,
            tags: [Tag::default(); MAX_TAGS],
        }
    }
}

/// Line-rate accounting constants for the shaper cost formula
/// (SPEC_FULL.md §4.1 step 6): preamble + Ethernet header + FCS + IFG.
const PREAMBLE_BYTES: u64 = 8;
const ETHERNET_HEADER_BYTES: u64 = 14;
const FCS_BYTES: u64 = 4;
const IFG_BYTES: u64 = 12;
const TAG_BYTES: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeDecision {
    Pass,
    Drop,
}

impl MatchEntry {
    /// Whether the five-tuple fields of `self` match a packet's fields.
    /// Compared field-by-field in on-wire order, per SPEC_FULL.md §9 (the
    /// portable reformulation of the original's contiguous byte compare).
    pub fn matches(&self, protocol: u8, src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16) -> bool {
        self.protocol == protocol
            && self.src_ip == src_ip
            && self.dst_ip == dst_ip
            && self.src_port == src_port
            && self.dst_port == dst_port
    }

    /// Called when a control message overwrites this entry: scales the
    /// initial `n_tokens` into the same `cpu_freq`-scaled unit as refill,
    /// and resets `last_tsc` so the next packet doesn't see a spurious
    /// refill for time elapsed before the rule was loaded (SPEC_FULL.md
    /// §4.1 "Edge cases").
    pub fn load(&mut self, cpu_freq: u64, now_tsc: u64) {
        self.n_tokens = self.n_tokens.saturating_mul(cpu_freq);
        self.last_tsc = now_tsc;
    }

    fn capacity(&self, cpu_freq: u64) -> u64 {
        cpu_freq.saturating_mul(self.burst_bits)
    }

    /// Refill-then-debit algorithm per matched packet (SPEC_FULL.md §4.1
    /// steps 1–7). `ip_total_length` is the IPv4 header's `total_length`
    /// field; `n_tags` is the count this rule would push.
    pub fn shape(&mut self, cpu_freq: u64, now_tsc: u64, ip_total_length: u16) -> ShapeDecision {
        let capacity = self.capacity(cpu_freq);
        let delta = now_tsc.wrapping_sub(self.last_tsc);

        let refill = if delta == 0 {
            0
        } else {
            let candidate = delta.wrapping_mul(self.rate_bps);
            // Multiplicative overflow check (step 3): if the division
            // doesn't round-trip, treat as a long idle period and saturate
            // instead of wrapping into a bogus small refill.
            if self.rate_bps != 0 && candidate / delta != self.rate_bps {
                capacity
            } else {
                candidate
            }
        };

        self.last_tsc = now_tsc;
        self.n_tokens = self.n_tokens.saturating_add(refill).min(capacity);

        let line_size = PREAMBLE_BYTES
            + ETHERNET_HEADER_BYTES
            + FCS_BYTES
            + IFG_BYTES
            + ip_total_length as u64
            + TAG_BYTES * self.n_tags as u64;
        let cost = 8 * cpu_freq.saturating_mul(line_size);

        if self.n_tokens >= cost {
            self.n_tokens -= cost;
            ShapeDecision::Pass
        } else {
            ShapeDecision::Drop
        }
    }
}

/// `(MAX_POOLS+1) x N_ENTRIES_PER_VHOST` array of rules. Slot `[0][*]` is
/// reserved (pool 0 unused). Writes come from exactly one thread (the
/// worker draining the control guest); reads come from every TX worker
/// without locking — readers tolerate transiently torn reads across fields
/// since a mismatch simply fails the match (SPEC_FULL.md §5).
pub struct MatchingTable {
    entries: Box<[[MatchEntry; N_ENTRIES_PER_VHOST]]>,
}

impl MatchingTable {
    pub fn new() -> Self {
        Self {
            entries: vec![[MatchEntry::default(); N_ENTRIES_PER_VHOST]; MAX_POOLS + 1]
                .into_boxed_slice(),
        }
    }

    fn pool_tag_in_range(&self, pool_tag: usize) -> bool {
        pool_tag != 0 && pool_tag <= MAX_POOLS
    }

    /// Mutable access for the control-channel decoder. Returns `None` for
    /// an out-of-range pool index or rule slot (SPEC_FULL.md §7 "Control-
    /// message with unknown EtherType or out-of-range indices").
    pub fn entry_mut(&mut self, pool_tag: usize, slot: usize) -> Option<&mut MatchEntry> {
        if !self.pool_tag_in_range(pool_tag) || slot >= N_ENTRIES_PER_VHOST {
            return None;
        }
        Some(&mut self.entries[pool_tag][slot])
    }

    /// First-match lookup across a guest's rule slots (SPEC_FULL.md §4.1:
    /// "First-match wins; no wildcards, no priority beyond slot order").
    pub fn lookup_mut(
        &mut self,
        pool_tag: usize,
        protocol: u8,
        src_ip: u32,
        dst_ip: u32,
        src_port: u16,
        dst_port: u16,
    ) -> Option<&mut MatchEntry> {
        if !self.pool_tag_in_range(pool_tag) {
            return None;
        }
        self.entries[pool_tag]
            .iter_mut()
            .find(|e| e.matches(protocol, src_ip, dst_ip, src_port, dst_port))
    }

    pub fn entry(&self, pool_tag: usize, slot: usize) -> Option<&MatchEntry> {
        if !self.pool_tag_in_range(pool_tag) || slot >= N_ENTRIES_PER_VHOST {
            return None;
        }
        Some(&self.entries[pool_tag][slot])
    }

    pub fn num_pool_tags(&self) -> usize {
        self.entries.len()
    }
}

impl Default for MatchingTable {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the only writer is the single worker draining the control
// guest's TX stream (SPEC_FULL.md §5 "single-writer"); all other workers
// only read. This matches the teacher's `arc_swap`-style "lock-free shared
// registry" pattern applied to a plain array instead of a swapped pointer,
// since entries are mutated in place rather than replaced wholesale.
unsafe impl Sync for MatchingTable {}

/// Interior-mutable handle granting the single designated writer a `&mut
/// MatchingTable` through a shared `SwitchContext` reference (SPEC_FULL.md
/// §9: "inner mutability on the table is `UnsafeCell`-based single-
/// producer"). By construction (SPEC_FULL.md §4.4, "the first discovered
/// worker core receives TX duty for all guests") exactly one worker thread
/// ever calls `get_mut`, so a `Mutex` would only add uncontended overhead.
pub struct SharedMatchingTable {
    inner: UnsafeCell<MatchingTable>,
}

unsafe impl Sync for SharedMatchingTable {}

impl SharedMatchingTable {
    pub fn new() -> Self {
        Self {
            inner: UnsafeCell::new(MatchingTable::new()),
        }
    }

    /// # Safety
    /// The caller must be the single TX worker (SPEC_FULL.md §4.4/§5); no
    /// other thread may hold a `&mut` or `&` through this handle at the
    /// same time.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut MatchingTable {
        unsafe { &mut *self.inner.get() }
    }
}

impl Default for SharedMatchingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(rate_bps: u64, burst_bits: u64) -> MatchEntry {
        MatchEntry {
            protocol: 6,
            src_ip: 0x0a000001,
            dst_ip: 0x0a000002,
            src_port: 1000,
            dst_port: 2000,
            rate_bps,
            burst_bits,
            n_tokens: 0,
            last_tsc: 0,
            n_tags: 2,
            tags: [
                Tag { eth_type: 0x8100, vid: 100 },
                Tag { eth_type: 0x8100, vid: 200 },
                Tag::default(),
                Tag::default(),
                Tag::default(),
                Tag::default(),
                Tag::default(),
                Tag::default(),
                Tag::default(),
                Tag::default(),
            ],
        }
    }

    #[test]
    fn i1_tokens_never_exceed_capacity() {
        let cpu_freq = 1_000_000_000u64;
        let mut e = rule(1_000_000_000, 1_000_000);
        e.load(cpu_freq, 0);
        // Huge idle period: refill should saturate, not overflow past capacity.
        let _ = e.shape(cpu_freq, u64::MAX / 2, 60);
        assert!(e.n_tokens <= cpu_freq.saturating_mul(e.burst_bits));
    }

    #[test]
    fn s3_scenario_drops_then_admits() {
        let cpu_freq = 1_000_000_000u64;
        let mut e = rule(1_000_000_000, 1_000_000);
        e.n_tokens = 0;
        e.load(cpu_freq, 0);
        assert_eq!(e.shape(cpu_freq, 0, 60), ShapeDecision::Drop);
        // ~848ns of accumulated time should be enough to admit, per S3.
        let decision = e.shape(cpu_freq, 1000, 60);
        assert_eq!(decision, ShapeDecision::Pass);
    }

    #[test]
    fn b3_overflow_branch_saturates() {
        let cpu_freq = 1_000_000_000u64;
        let mut e = rule(1u64 << 63, 1_000_000);
        e.load(cpu_freq, 0);
        let before_cap = cpu_freq.saturating_mul(e.burst_bits);
        let decision = e.shape(cpu_freq, 2, 60);
        assert!(e.n_tokens <= before_cap);
        // With the full bucket now available the packet should be admitted.
        assert_eq!(decision, ShapeDecision::Pass);
    }

    #[test]
    fn lookup_is_first_match() {
        let mut table = MatchingTable::new();
        *table.entry_mut(5, 0).unwrap() = rule(0, 0);
        let found = table.lookup_mut(5, 6, 0x0a000001, 0x0a000002, 1000, 2000);
        assert!(found.is_some());
    }

    #[test]
    fn pool_zero_is_reserved() {
        let mut table = MatchingTable::new();
        assert!(table.entry_mut(0, 0).is_none());
        assert!(table.lookup_mut(0, 6, 0, 0, 0, 0).is_none());
    }

    #[test]
    fn out_of_range_slot_rejected() {
        let mut table = MatchingTable::new();
        assert!(table.entry_mut(1, N_ENTRIES_PER_VHOST).is_none());
    }
}
