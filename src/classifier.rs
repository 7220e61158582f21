//! Packet classifier and tagger (SPEC_FULL.md §4.2).
//!
//! Parses the Ethernet/IPv4/L4 headers with `smoltcp`'s wire types (the
//! teacher's `dataplane::packet` parsing style), matches the five-tuple
//! against the guest's matching-table row, consults the token bucket, and
//! on a pass prepends the rule's tag stack in place.

use smoltcp::wire::{EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet, TcpPacket, UdpPacket};

use crate::buffer::PacketBuffer;
use crate::matching_table::{MatchingTable, ShapeDecision, Tag};

/// Result of running the classifier/tagger over one packet. The fast path
/// maps this onto `GuestStats` per SPEC_FULL.md §4.6/§7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyOutcome {
    /// Outer EtherType wasn't IPv4, L4 wasn't TCP/UDP, or no rule matched
    /// (including a header that failed to parse at all). Counts toward the
    /// "unmatched drops" term of I6.
    Unmatched,
    /// A rule matched but carries `n_tags == 0` (B2): a deliberate no-op
    /// match. Also folds into "unmatched drops" for I6 purposes, since the
    /// packet is not forwarded either way.
    ZeroTagNoop,
    /// The token bucket rejected the packet (§4.1 step 7).
    ShaperDropped,
    /// A rule matched, had tags, and passed shaping, but the buffer could
    /// not be mutated (shared/indirect, or insufficient headroom) per the
    /// §4.2 buffer-sharing rule.
    CannotTag,
    /// `do_tag` is disabled (CLI `--do_tag 0`): the packet is forwarded
    /// unmodified. Resolves Open Question Q1 (SPEC_FULL.md §9) by still
    /// counting it in `tx_tagged`, since a rule did match and would have
    /// been tagged had tagging been enabled; see DESIGN.md.
    ForwardedUntagged,
    /// Tags were written; `.0` is the tag count pushed (1..=MAX_TAGS).
    Tagged(u16),
}

struct FiveTuple {
    protocol: u8,
    src_ip: u32,
    dst_ip: u32,
    src_port: u16,
    dst_port: u16,
    ip_total_length: u16,
}

/// Acceptance predicate (SPEC_FULL.md §4.2): outer EtherType IPv4, next
/// protocol TCP/UDP. VLAN-in is not supported, matching the original's
/// scope. Returns `None` if any of that fails to parse or match.
fn parse_five_tuple(data: &[u8]) -> Option<FiveTuple> {
    let eth = EthernetFrame::new_checked(data).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    let (src_port, dst_port) = match ip.next_header() {
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
            (tcp.src_port(), tcp.dst_port())
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(ip.payload()).ok()?;
            (udp.src_port(), udp.dst_port())
        }
        _ => return None,
    };
    Some(FiveTuple {
        protocol: u8::from(ip.next_header()),
        src_ip: u32::from_be_bytes(ip.src_addr().octets()),
        dst_ip: u32::from_be_bytes(ip.dst_addr().octets()),
        src_port,
        dst_port,
        ip_total_length: ip.total_len(),
    })
}

/// Prepend `tags.len() * 4` bytes of headroom, move the two MAC addresses
/// to the new buffer start, and write the tag array immediately after them
/// (SPEC_FULL.md §4.2 "Tag push"). The original EtherType and payload are
/// already correctly positioned at `12 + 4*len(tags)` by the headroom
/// shift and are left untouched.
fn push_tags(buf: &mut PacketBuffer, tags: &[Tag]) -> bool {
    if !buf.is_direct_and_exclusive() {
        return false;
    }
    let extra = 4 * tags.len();
    if buf.len() < 12 {
        return false;
    }
    let mut mac = [0u8; 12];
    mac.copy_from_slice(&buf.data()[0..12]);
    if buf.prepend(extra).is_none() {
        return false;
    }
    let Some(data) = buf.data_mut() else {
        return false;
    };
    data[0..12].copy_from_slice(&mac);
    for (i, tag) in tags.iter().enumerate() {
        let off = 12 + i * 4;
        data[off..off + 2].copy_from_slice(&tag.eth_type.to_be_bytes());
        data[off + 2..off + 4].copy_from_slice(&tag.vid.to_be_bytes());
    }
    true
}

/// Clear offload flags made stale by the header rewrite and extend the
/// length the NIC's checksum offload should cover, per SPEC_FULL.md §4.2
/// "Offload bookkeeping".
fn update_offload_bookkeeping(buf: &mut PacketBuffer, extra: u16) {
    buf.clear_vlan_strip_flag();
    buf.clear_vlan_insert_flag();
    buf.extend_l2_len(extra);
}

/// Run the full classify/shape/tag pipeline for one packet owned by
/// `pool_tag`'s row in `table`. `now_tsc` is the current TSC reading
/// (injected so tests can control time deterministically).
pub fn classify_and_tag(
    buf: &mut PacketBuffer,
    table: &mut MatchingTable,
    pool_tag: usize,
    cpu_freq: u64,
    now_tsc: u64,
    do_tag: bool,
    do_shape: bool,
) -> ClassifyOutcome {
    let Some(tuple) = parse_five_tuple(buf.data()) else {
        return ClassifyOutcome::Unmatched;
    };

    let Some(entry) = table.lookup_mut(
        pool_tag,
        tuple.protocol,
        tuple.src_ip,
        tuple.dst_ip,
        tuple.src_port,
        tuple.dst_port,
    ) else {
        return ClassifyOutcome::Unmatched;
    };

    if entry.n_tags == 0 {
        // Still run the shaper so token accounting stays live even for a
        // no-op rule (SPEC_FULL.md §3: "drops-or-passes per shaping
        // decision"), but never forward.
        if do_shape {
            let _ = entry.shape(cpu_freq, now_tsc, tuple.ip_total_length);
        }
        return ClassifyOutcome::ZeroTagNoop;
    }

    let n_tags = entry.n_tags;
    let mut tags = [Tag::default(); crate::config::MAX_TAGS];
    tags[..n_tags as usize].copy_from_slice(&entry.tags[..n_tags as usize]);

    if do_shape {
        match entry.shape(cpu_freq, now_tsc, tuple.ip_total_length) {
            ShapeDecision::Drop => return ClassifyOutcome::ShaperDropped,
            ShapeDecision::Pass => {}
        }
    }

    if !do_tag {
        return ClassifyOutcome::ForwardedUntagged;
    }

    if !push_tags(buf, &tags[..n_tags as usize]) {
        return ClassifyOutcome::CannotTag;
    }
    update_offload_bookkeeping(buf, 4 * n_tags);
    ClassifyOutcome::Tagged(n_tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::matching_table::MatchEntry;

    fn tcp_frame(src_port: u16, dst_port: u16, ip_total_len: u16) -> Vec<u8> {
        let mut eth = vec![0u8; 14];
        eth[0..6].copy_from_slice(&[0x52, 0x54, 0, 0, 0, 5]); // dst mac
        eth[6..12].copy_from_slice(&[0x52, 0x54, 0, 0, 0, 1]); // src mac
        eth[12..14].copy_from_slice(&0x0800u16.to_be_bytes()); // IPv4

        let tcp_len = ip_total_len as usize - 20;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&ip_total_len.to_be_bytes());
        ip[9] = 6; // TCP
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);

        let mut tcp = vec![0u8; tcp_len.max(20)];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());

        let mut out = eth;
        out.extend_from_slice(&ip);
        out.extend_from_slice(&tcp);
        out
    }

    fn rule_with_tags(n_tags: u16) -> MatchEntry {
        let mut e = MatchEntry {
            protocol: 6,
            src_ip: 0x0a000001,
            dst_ip: 0x0a000002,
            src_port: 1000,
            dst_port: 2000,
            rate_bps: u64::MAX,
            burst_bits: u64::MAX / (1 << 20),
            n_tokens: u64::MAX / 2,
            last_tsc: 0,
            n_tags,
            ..Default::default()
        };
        for i in 0..n_tags as usize {
            e.tags[i] = Tag {
                eth_type: 0x8100,
                vid: 100 + i as u16,
            };
        }
        e
    }

    #[test]
    fn i3_tag_layout_preserves_macs_and_ethertype() {
        let pool = BufferPool::new(4).unwrap();
        let mut buf = pool.alloc().unwrap();
        buf.fill(&tcp_frame(1000, 2000, 60));

        let mut table = MatchingTable::new();
        *table.entry_mut(5, 0).unwrap() = rule_with_tags(2);

        let outcome = classify_and_tag(&mut buf, &mut table, 5, 1_000_000_000, 0, true, true);
        assert_eq!(outcome, ClassifyOutcome::Tagged(2));

        let data = buf.data();
        assert_eq!(&data[0..6], &[0x52, 0x54, 0, 0, 0, 5]);
        assert_eq!(&data[6..12], &[0x52, 0x54, 0, 0, 0, 1]);
        assert_eq!(&data[12..14], &0x8100u16.to_be_bytes());
        assert_eq!(&data[14..16], &100u16.to_be_bytes());
        assert_eq!(&data[16..18], &0x8100u16.to_be_bytes());
        assert_eq!(&data[18..20], &101u16.to_be_bytes());
        assert_eq!(&data[20..22], &0x0800u16.to_be_bytes());
    }

    #[test]
    fn b2_zero_tags_never_forwards() {
        let pool = BufferPool::new(4).unwrap();
        let mut buf = pool.alloc().unwrap();
        buf.fill(&tcp_frame(1000, 2000, 60));

        let mut table = MatchingTable::new();
        *table.entry_mut(5, 0).unwrap() = rule_with_tags(0);

        let outcome = classify_and_tag(&mut buf, &mut table, 5, 1_000_000_000, 0, true, true);
        assert_eq!(outcome, ClassifyOutcome::ZeroTagNoop);
    }

    #[test]
    fn s5_shared_buffer_cannot_be_tagged() {
        let pool = BufferPool::new(4).unwrap();
        let mut buf = pool.alloc().unwrap();
        buf.fill(&tcp_frame(1000, 2000, 60));
        let _clone = buf.share();

        let mut table = MatchingTable::new();
        *table.entry_mut(5, 0).unwrap() = rule_with_tags(2);

        let outcome = classify_and_tag(&mut buf, &mut table, 5, 1_000_000_000, 0, true, true);
        assert_eq!(outcome, ClassifyOutcome::CannotTag);
    }

    #[test]
    fn non_ipv4_is_unmatched() {
        let pool = BufferPool::new(4).unwrap();
        let mut buf = pool.alloc().unwrap();
        let mut frame = tcp_frame(1000, 2000, 60);
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes()); // ARP
        buf.fill(&frame);

        let mut table = MatchingTable::new();
        *table.entry_mut(5, 0).unwrap() = rule_with_tags(2);

        let outcome = classify_and_tag(&mut buf, &mut table, 5, 1_000_000_000, 0, true, true);
        assert_eq!(outcome, ClassifyOutcome::Unmatched);
    }

    #[test]
    fn do_tag_disabled_forwards_untagged() {
        let pool = BufferPool::new(4).unwrap();
        let mut buf = pool.alloc().unwrap();
        buf.fill(&tcp_frame(1000, 2000, 60));

        let mut table = MatchingTable::new();
        *table.entry_mut(5, 0).unwrap() = rule_with_tags(2);

        let before_len = buf.len();
        let outcome = classify_and_tag(&mut buf, &mut table, 5, 1_000_000_000, 0, false, true);
        assert_eq!(outcome, ClassifyOutcome::ForwardedUntagged);
        assert_eq!(buf.len(), before_len);
    }

    #[test]
    fn b1_boundary_ip_lengths_respect_headroom() {
        for &len in &[20u16, 1500u16] {
            let pool = BufferPool::new(4).unwrap();
            let mut buf = pool.alloc().unwrap();
            buf.fill(&tcp_frame(1000, 2000, len));

            let mut table = MatchingTable::new();
            *table.entry_mut(5, 0).unwrap() = rule_with_tags(10);

            let outcome = classify_and_tag(&mut buf, &mut table, 5, 1_000_000_000, 0, true, true);
            assert_eq!(outcome, ClassifyOutcome::Tagged(10));
        }
    }
}
