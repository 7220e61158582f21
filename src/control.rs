//! Control channel decoder (SPEC_FULL.md §4.3, §6 "Control-message wire
//! format").
//!
//! The control guest's TX stream is drained by its owning worker but never
//! forwarded to the NIC. A frame whose EtherType equals the reserved
//! sentinel `0xBEBE` carries a table-update message; anything else is
//! silently dropped (SPEC_FULL.md §7: "defense in depth; the control guest
//! is trusted").

use smoltcp::wire::EthernetFrame;

use crate::matching_table::{MatchEntry, MatchingTable, Tag};

/// Reserved EtherType (on-wire order 0xBE 0xBE) marking a table-update
/// control frame.
pub const CONTROL_ETHERTYPE: u16 = 0xbebe;

const HEADER_LEN: usize = 14;
const ENTRY_WIRE_LEN: usize = 1 + 1 + MATCH_ENTRY_WIRE_LEN;

// protocol(1) + src_ip(4) + dst_ip(4) + src_port(2) + dst_port(2)
// + rate_bps(8) + burst_bits(8) + n_tokens(8) + last_tsc(8) + n_tags(2)
// + tags(10 * 4)
const MATCH_ENTRY_WIRE_LEN: usize = 1 + 4 + 4 + 2 + 2 + 8 + 8 + 8 + 8 + 2 + 10 * 4;

/// Encode a `MatchEntry` into the on-wire image used both by the control
/// channel and by USR1's machine-parsable dump. Multi-byte IP/port fields
/// are on-wire order; the 64/16-bit accounting fields are host-endian, per
/// SPEC_FULL.md §6.
pub fn encode_match_entry(entry: &MatchEntry, out: &mut [u8]) {
    assert!(out.len() >= MATCH_ENTRY_WIRE_LEN);
    out[0] = entry.protocol;
    out[1..5].copy_from_slice(&entry.src_ip.to_be_bytes());
    out[5..9].copy_from_slice(&entry.dst_ip.to_be_bytes());
    out[9..11].copy_from_slice(&entry.src_port.to_be_bytes());
    out[11..13].copy_from_slice(&entry.dst_port.to_be_bytes());
    out[13..21].copy_from_slice(&entry.rate_bps.to_ne_bytes());
    out[21..29].copy_from_slice(&entry.burst_bits.to_ne_bytes());
    out[29..37].copy_from_slice(&entry.n_tokens.to_ne_bytes());
    out[37..45].copy_from_slice(&entry.last_tsc.to_ne_bytes());
    out[45..47].copy_from_slice(&entry.n_tags.to_ne_bytes());
    for (i, tag) in entry.tags.iter().enumerate() {
        let off = 47 + i * 4;
        out[off..off + 2].copy_from_slice(&tag.eth_type.to_be_bytes());
        out[off + 2..off + 4].copy_from_slice(&tag.vid.to_be_bytes());
    }
}

/// Decode a `MatchEntry` from its on-wire image. Returns `None` if `data`
/// is shorter than the fixed-size encoding.
pub fn decode_match_entry(data: &[u8]) -> Option<MatchEntry> {
    if data.len() < MATCH_ENTRY_WIRE_LEN {
        return None;
    }
    let mut entry = MatchEntry {
        protocol: data[0],
        src_ip: u32::from_be_bytes(data[1..5].try_into().unwrap()),
        dst_ip: u32::from_be_bytes(data[5..9].try_into().unwrap()),
        src_port: u16::from_be_bytes(data[9..11].try_into().unwrap()),
        dst_port: u16::from_be_bytes(data[11..13].try_into().unwrap()),
        rate_bps: u64::from_ne_bytes(data[13..21].try_into().unwrap()),
        burst_bits: u64::from_ne_bytes(data[21..29].try_into().unwrap()),
        n_tokens: u64::from_ne_bytes(data[29..37].try_into().unwrap()),
        last_tsc: u64::from_ne_bytes(data[37..45].try_into().unwrap()),
        n_tags: u16::from_ne_bytes(data[45..47].try_into().unwrap()),
        ..Default::default()
    };
    for i in 0..crate::config::MAX_TAGS {
        let off = 47 + i * 4;
        entry.tags[i] = Tag {
            eth_type: u16::from_be_bytes(data[off..off + 2].try_into().unwrap()),
            vid: u16::from_be_bytes(data[off + 2..off + 4].try_into().unwrap()),
        };
    }
    Some(entry)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Not a control-sentinel frame, or the frame is malformed/truncated.
    Ignored,
    /// Pool index or rule slot was out of range for the table.
    OutOfRange,
    /// The table entry at `(pool, slot)` was overwritten.
    Applied { pool: u8, slot: u8 },
}

/// Decode and apply one control-guest frame, per SPEC_FULL.md §4.3. On a
/// match, overwrites `last_tsc` with `now_tsc` and scales `n_tokens` by
/// `cpu_freq` so the entry starts out expressed in the shaper's scaled
/// unit (the `MatchEntry::load` edge case in §4.1).
pub fn apply_control_frame(
    frame: &[u8],
    table: &mut MatchingTable,
    cpu_freq: u64,
    now_tsc: u64,
) -> ControlOutcome {
    let Ok(eth) = EthernetFrame::new_checked(frame) else {
        return ControlOutcome::Ignored;
    };
    if u16::from(eth.ethertype()) != CONTROL_ETHERTYPE {
        return ControlOutcome::Ignored;
    }
    let payload = eth.payload();
    if payload.len() < ENTRY_WIRE_LEN {
        return ControlOutcome::Ignored;
    }
    let pool = payload[0];
    let slot = payload[1];
    let Some(mut entry) = decode_match_entry(&payload[2..]) else {
        return ControlOutcome::Ignored;
    };
    entry.load(cpu_freq, now_tsc);
    let Some(dest) = table.entry_mut(pool as usize, slot as usize) else {
        return ControlOutcome::OutOfRange;
    };
    *dest = entry;
    ControlOutcome::Applied { pool, slot }
}

/// Build a control frame for tests / the control-guest counterpart.
#[cfg(any(test, feature = "test-util"))]
pub fn build_control_frame(src_mac: [u8; 6], pool: u8, slot: u8, entry: &MatchEntry) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_LEN + ENTRY_WIRE_LEN];
    frame[0..6].copy_from_slice(&[0xff; 6]);
    frame[6..12].copy_from_slice(&src_mac);
    frame[12..14].copy_from_slice(&CONTROL_ETHERTYPE.to_be_bytes());
    frame[14] = pool;
    frame[15] = slot;
    encode_match_entry(entry, &mut frame[16..]);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> MatchEntry {
        MatchEntry {
            protocol: 6,
            src_ip: 0x0a000001,
            dst_ip: 0x0a000002,
            src_port: 1000,
            dst_port: 2000,
            rate_bps: 1_000_000_000,
            burst_bits: 1_000_000,
            n_tokens: 5,
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
    fn r1_roundtrip_scales_tokens_and_resets_tsc() {
        let entry = sample_entry();
        let frame = build_control_frame([1, 2, 3, 4, 5, 6], 5, 0, &entry);

        let mut table = MatchingTable::new();
        let outcome = apply_control_frame(&frame, &mut table, 1_000_000_000, 42);
        assert_eq!(outcome, ControlOutcome::Applied { pool: 5, slot: 0 });

        let applied = table.entry(5, 0).unwrap();
        assert_eq!(applied.protocol, entry.protocol);
        assert_eq!(applied.src_ip, entry.src_ip);
        assert_eq!(applied.dst_ip, entry.dst_ip);
        assert_eq!(applied.src_port, entry.src_port);
        assert_eq!(applied.dst_port, entry.dst_port);
        assert_eq!(applied.n_tags, entry.n_tags);
        assert_eq!(applied.tags, entry.tags);
        assert_eq!(applied.last_tsc, 42);
        assert_eq!(applied.n_tokens, entry.n_tokens * 1_000_000_000);
    }

    #[test]
    fn r2_reapplying_same_frame_is_idempotent_modulo_refill() {
        let entry = sample_entry();
        let frame = build_control_frame([1, 2, 3, 4, 5, 6], 5, 0, &entry);
        let mut table = MatchingTable::new();

        apply_control_frame(&frame, &mut table, 1_000_000_000, 0);
        let first = *table.entry(5, 0).unwrap();

        apply_control_frame(&frame, &mut table, 1_000_000_000, 0);
        let second = *table.entry(5, 0).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn non_sentinel_ethertype_is_ignored() {
        let entry = sample_entry();
        let mut frame = build_control_frame([1, 2, 3, 4, 5, 6], 5, 0, &entry);
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());

        let mut table = MatchingTable::new();
        let outcome = apply_control_frame(&frame, &mut table, 1_000_000_000, 0);
        assert_eq!(outcome, ControlOutcome::Ignored);
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let entry = sample_entry();
        let frame = build_control_frame([1, 2, 3, 4, 5, 6], 200, 0, &entry);
        let mut table = MatchingTable::new();
        let outcome = apply_control_frame(&frame, &mut table, 1_000_000_000, 0);
        assert_eq!(outcome, ControlOutcome::OutOfRange);
    }
}
