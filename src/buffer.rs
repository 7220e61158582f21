//! Packet buffer pool.
//!
//! Implements the minimum contract SPEC_FULL.md §9 assigns to the external
//! packet-buffer allocator: prepend-headroom, refcount-is-one check,
//! direct-vs-indirect check, free, and burst-array transfer. Buffers are
//! fixed-size slices carved out of a single `mmap(MAP_HUGETLB)` arena
//! (`hugepage::HugePagePool`), in the manner of the teacher's fixed-slot
//! allocation scheme.
//!
//! A buffer is a handle (`Arc`-backed) over a fixed-size frame. Cloning a
//! handle (`PacketBuffer::share`) models the mbuf "indirect" case used for
//! zero-copy fan-out: the data region becomes shared and mutation (tagging)
//! is refused until the switch is again the sole owner.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::hugepage::HugePagePool;

/// Bytes of headroom reserved at the front of every frame, enough for the
/// worst case `MAX_TAGS` (10) × 4-byte tags plus slack.
pub const HEADROOM: usize = 128;

/// Payload capacity after headroom; comfortably covers a 1500-byte MTU
/// frame plus Ethernet header.
pub const FRAME_CAPACITY: usize = 2048;

const FRAME_SIZE: usize = HEADROOM + FRAME_CAPACITY;

struct Slot {
    head: usize,
    len: usize,
    indirect: bool,
    vlan_stripped: bool,
    vlan_insert_on_tx: bool,
    tunnel_offload: bool,
    outer_l2_len: u16,
    inner_l2_len: u16,
}

struct RawBuffer {
    /// Points at this buffer's `FRAME_SIZE`-byte slice within
    /// `pool.hugepages`. Valid for as long as `pool` (held via `Arc`) is
    /// alive, and exclusive to this `RawBuffer` for as long as `index`
    /// remains checked out (the free queue only hands an index to one
    /// allocation at a time; `Drop` below returns it only once no
    /// `PacketBuffer` references it any more).
    data_ptr: *mut u8,
    slot: UnsafeCell<Slot>,
    index: usize,
    pool: Arc<PoolInner>,
}

// SAFETY: a `RawBuffer` is mutated only by whichever thread currently holds
// the sole `Arc` strong reference to it (checked via `Arc::get_mut` in
// `PacketBuffer::prepend`/field setters); transfer between threads happens
// by moving the handle, never by concurrent access.
unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        self.pool.free.push(self.index);
    }
}

struct PoolInner {
    hugepages: HugePagePool,
    free: crossbeam_queue::SegQueue<usize>,
}

// SAFETY: every outstanding `RawBuffer::data_ptr` is a disjoint
// `FRAME_SIZE`-byte slice of `hugepages`, handed out through `free` (a
// lock-free queue) so no two threads ever hold the same slice at once.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

/// A fixed-capacity arena of packet buffers, backed by hugepages.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Option<Self> {
        let hugepages = HugePagePool::new(capacity * FRAME_SIZE)
            .or_else(|| HugePagePool::new(capacity * FRAME_SIZE))?;
        let free = crossbeam_queue::SegQueue::new();
        for i in 0..capacity {
            free.push(i);
        }
        let inner = Arc::new(PoolInner { hugepages, free });
        Some(Self { inner })
    }

    /// Check out a free buffer, or `None` if the pool is exhausted.
    pub fn alloc(&self) -> Option<PacketBuffer> {
        let index = self.inner.free.pop()?;
        // SAFETY: `index < capacity`, so `index * FRAME_SIZE + FRAME_SIZE`
        // stays within the `capacity * FRAME_SIZE` region reserved in `new`;
        // `free` guarantees no other live `RawBuffer` holds this index.
        let data_ptr = unsafe { self.inner.hugepages.ptr().add(index * FRAME_SIZE) };
        let raw = Box::new(RawBuffer {
            data_ptr,
            slot: UnsafeCell::new(Slot {
                head: HEADROOM,
                len: 0,
                indirect: false,
                vlan_stripped: false,
                vlan_insert_on_tx: false,
                tunnel_offload: false,
                outer_l2_len: 0,
                inner_l2_len: 0,
            }),
            index,
            pool: self.inner.clone(),
        });
        Some(PacketBuffer {
            inner: Arc::from(raw),
        })
    }

    pub fn outstanding_estimate(&self) -> usize {
        self.inner.free.len()
    }
}

/// An owned handle to a packet in flight. See module docs for the ownership
/// model this implements.
pub struct PacketBuffer {
    inner: Arc<RawBuffer>,
}

impl PacketBuffer {
    fn slot(&self) -> &Slot {
        // SAFETY: readers never race a concurrent mutator because mutation
        // requires exclusive ownership (checked separately); immutable
        // field reads of a shared buffer are always sound since no writer
        // can be active while any reader holds a clone.
        unsafe { &*self.inner.slot.get() }
    }

    /// The packet bytes currently in the buffer (post-headroom payload).
    pub fn data(&self) -> &[u8] {
        let slot = self.slot();
        // SAFETY: `data_ptr` is a valid `FRAME_SIZE`-byte slice for the
        // lifetime of `self.inner` (see `RawBuffer::data_ptr`); `data` is
        // only ever written through `data_mut`/`write_area`, which require
        // exclusivity, so reading here is a plain shared borrow.
        let data = unsafe { std::slice::from_raw_parts(self.inner.data_ptr, FRAME_SIZE) };
        &data[slot.head..slot.head + slot.len]
    }

    pub fn len(&self) -> usize {
        self.slot().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn headroom(&self) -> usize {
        self.slot().head
    }

    /// Whether this handle is the sole owner of its data region and was
    /// never produced via `share()`. Required before the tagger may mutate
    /// the buffer in place (SPEC_FULL.md §4.2 buffer-sharing rule).
    pub fn is_direct_and_exclusive(&self) -> bool {
        Arc::strong_count(&self.inner) == 1 && !self.slot().indirect
    }

    /// Produce an additional handle over the same data, marking both the
    /// original and the clone as no longer exclusively owned. Used by
    /// zero-copy fan-out paths (e.g. the NIC RX ring retaining a reference
    /// while the guest enqueue path also holds one).
    pub fn share(&self) -> PacketBuffer {
        // SAFETY: flipping `indirect` to true only ever narrows the set of
        // operations callers are permitted to perform (mutation is refused
        // once set); it never needs to be undone.
        unsafe { (*self.inner.slot.get()).indirect = true };
        PacketBuffer {
            inner: self.inner.clone(),
        }
    }

    /// Copy `payload` into the buffer starting right after full headroom,
    /// i.e. at the canonical Ethernet-frame start. Used when filling a
    /// buffer from an RX ring or test fixture.
    pub fn fill(&mut self, payload: &[u8]) -> bool {
        if payload.len() > FRAME_CAPACITY {
            return false;
        }
        let raw = Arc::get_mut(&mut self.inner).expect("fill requires exclusive ownership");
        // SAFETY: `Arc::get_mut` proves exclusivity over `raw`, hence over
        // the frame slice its `data_ptr` denotes.
        let data = unsafe { std::slice::from_raw_parts_mut(raw.data_ptr, FRAME_SIZE) };
        data[HEADROOM..HEADROOM + payload.len()].copy_from_slice(payload);
        let slot = raw.slot.get_mut();
        slot.head = HEADROOM;
        slot.len = payload.len();
        true
    }

    /// Mutable view of the full post-headroom frame capacity, for backends
    /// that fill a buffer incrementally (e.g. copying descriptor-chain
    /// segments out of guest memory) before the final length is known.
    /// Pairs with `set_len`. Requires exclusivity.
    pub fn write_area(&mut self) -> Option<&mut [u8]> {
        let raw = Arc::get_mut(&mut self.inner)?;
        let slot = raw.slot.get_mut();
        if slot.indirect {
            return None;
        }
        slot.head = HEADROOM;
        // SAFETY: `Arc::get_mut` above proves exclusivity.
        let data = unsafe { std::slice::from_raw_parts_mut(raw.data_ptr, FRAME_SIZE) };
        Some(&mut data[HEADROOM..])
    }

    /// Set the payload length after writing through `write_area`.
    pub fn set_len(&mut self, len: usize) {
        if let Some(raw) = Arc::get_mut(&mut self.inner) {
            let slot = raw.slot.get_mut();
            slot.head = HEADROOM;
            slot.len = len.min(FRAME_CAPACITY);
        }
    }

    /// Reserve `n` bytes immediately before the current payload start and
    /// return a mutable view over `[new_head, new_head + n)`. Fails (and
    /// leaves the buffer untouched) if fewer than `n` headroom bytes remain
    /// or the buffer is not exclusively owned.
    pub fn prepend(&mut self, n: usize) -> Option<&mut [u8]> {
        let raw = Arc::get_mut(&mut self.inner)?;
        let slot = raw.slot.get_mut();
        if slot.indirect || slot.head < n {
            return None;
        }
        slot.head -= n;
        slot.len += n;
        // SAFETY: `Arc::get_mut` above proves exclusivity.
        let data = unsafe { std::slice::from_raw_parts_mut(raw.data_ptr, FRAME_SIZE) };
        Some(&mut data[slot.head..slot.head + n])
    }

    /// Mutable view of the full payload, for in-place edits (e.g.
    /// overwriting the EtherType after a tag push). Requires exclusivity.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let raw = Arc::get_mut(&mut self.inner)?;
        let slot = raw.slot.get_mut();
        if slot.indirect {
            return None;
        }
        // SAFETY: `Arc::get_mut` above proves exclusivity.
        let data = unsafe { std::slice::from_raw_parts_mut(raw.data_ptr, FRAME_SIZE) };
        Some(&mut data[slot.head..slot.head + slot.len])
    }

    pub fn clear_vlan_strip_flag(&mut self) {
        if let Some(raw) = Arc::get_mut(&mut self.inner) {
            raw.slot.get_mut().vlan_stripped = false;
        }
    }

    pub fn clear_vlan_insert_flag(&mut self) {
        if let Some(raw) = Arc::get_mut(&mut self.inner) {
            raw.slot.get_mut().vlan_insert_on_tx = false;
        }
    }

    pub fn is_tunnel_offload(&self) -> bool {
        self.slot().tunnel_offload
    }

    pub fn set_tunnel_offload(&mut self, v: bool) {
        if let Some(raw) = Arc::get_mut(&mut self.inner) {
            raw.slot.get_mut().tunnel_offload = v;
        }
    }

    /// Extend the offload-relevant L2 length (outer if tunneled, else
    /// inner) by `extra` bytes, per SPEC_FULL.md §4.2 offload bookkeeping.
    pub fn extend_l2_len(&mut self, extra: u16) {
        if let Some(raw) = Arc::get_mut(&mut self.inner) {
            let slot = raw.slot.get_mut();
            if slot.tunnel_offload {
                slot.outer_l2_len += extra;
            } else {
                slot.inner_l2_len += extra;
            }
        }
    }

    pub fn outer_l2_len(&self) -> u16 {
        self.slot().outer_l2_len
    }

    pub fn inner_l2_len(&self) -> u16 {
        self.slot().inner_l2_len
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len())
            .field("headroom", &self.headroom())
            .field("exclusive", &self.is_direct_and_exclusive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> BufferPool {
        BufferPool::new(8).expect("hugepage alloc may require privilege; skip if unavailable")
    }

    #[test]
    fn prepend_then_exclusive_check() {
        let pool = small_pool();
        let mut buf = pool.alloc().unwrap();
        assert!(buf.fill(&[1, 2, 3, 4]));
        assert!(buf.is_direct_and_exclusive());
        {
            let hdr = buf.prepend(4).unwrap();
            hdr.copy_from_slice(&[9, 9, 9, 9]);
        }
        assert_eq!(buf.data(), &[9, 9, 9, 9, 1, 2, 3, 4]);
    }

    #[test]
    fn share_blocks_mutation() {
        let pool = small_pool();
        let mut buf = pool.alloc().unwrap();
        buf.fill(&[1, 2, 3]);
        let _clone = buf.share();
        assert!(!buf.is_direct_and_exclusive());
        assert!(buf.prepend(1).is_none());
    }

    #[test]
    fn prepend_fails_without_headroom() {
        let pool = small_pool();
        let mut buf = pool.alloc().unwrap();
        buf.fill(&[0u8; 4]);
        assert!(buf.prepend(HEADROOM + 1).is_none());
        assert!(buf.prepend(HEADROOM).is_some());
    }
}
