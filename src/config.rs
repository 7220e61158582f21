//! CLI surface and process-wide configuration.
//!
//! Mirrors the teacher's `config`/CLI split: a `clap` derive struct parsed
//! once in `main`, plus a small set of constants the rest of the crate
//! treats as process-lifetime facts (`SwitchConfig`).

use clap::Parser;

use crate::error::{SwitchError, SwitchResult};

/// Maximum number of pools (VMDQ-style classification buckets), excluding
/// the reserved pool 0 slot. See SPEC_FULL.md §3 (MatchingTable).
pub const MAX_POOLS: usize = 64;

/// Rule slots per guest pool.
pub const N_ENTRIES_PER_VHOST: usize = 3;

/// Maximum packets per NIC/guest burst transfer.
pub const MAX_PKT_BURST: usize = 32;

/// Maximum tags a single MatchEntry may carry.
pub const MAX_TAGS: usize = 10;

/// `prog [eal-opts] -- -p <port-id> [-P] --socket-file <path> [...] ...`
///
/// The `eal-opts` (DPDK-style core mask / memory channel args in the
/// original) have no counterpart in the AF_XDP + vhost-user ambient layer
/// this crate uses instead; core pinning is derived from `--cores` below.
#[derive(Parser, Debug, Clone)]
#[command(name = "vswitchd", version, about = "User-space tagging/shaping virtual switch")]
pub struct Args {
    /// Physical NIC port id to bind via AF_XDP.
    #[arg(short = 'p', long = "port")]
    pub port_id: u16,

    /// Enable promiscuous/broadcast/multicast acceptance on the VMDQ pools.
    #[arg(short = 'P', long = "promisc")]
    pub promiscuous: bool,

    /// vhost-user socket paths, one per guest slot. Repeatable.
    #[arg(long = "socket-file", required = true)]
    pub socket_files: Vec<String>,

    /// Enable TX checksum offload handoff to the NIC.
    #[arg(long = "tx-csum", default_value_t = 1)]
    pub tx_csum: u8,

    /// Enable the tagging stage of the fast path (§4.2). Disabling it still
    /// runs the shaper; see Open Question Q1 in SPEC_FULL.md for the
    /// ambiguity this crate resolves around `tx_tagged` accounting.
    #[arg(long = "do_tag", default_value_t = 1)]
    pub do_tag: u8,

    /// Enable the shaping stage of the fast path (§4.1).
    #[arg(long = "do_shape", default_value_t = 1)]
    pub do_shape: u8,

    /// Run the vhost-user backend in client (connect) mode instead of the
    /// default server (listen) mode.
    #[arg(long = "client")]
    pub client: bool,

    /// Advertise `VIRTIO_F_VHOST_DEQUEUE_ZERO_COPY` to guests that support it.
    #[arg(long = "dequeue-zero-copy")]
    pub dequeue_zero_copy: bool,

    /// Worker core ids to pin data-plane threads to. Defaults to one core
    /// per socket file plus one, derived at startup if left empty.
    #[arg(long = "cores", value_delimiter = ',')]
    pub cores: Vec<usize>,
}

impl Args {
    pub fn validate(&self) -> SwitchResult<()> {
        if self.socket_files.is_empty() {
            return Err(SwitchError::Config(
                "at least one --socket-file is required".into(),
            ));
        }
        if self.socket_files.len() > MAX_POOLS {
            return Err(SwitchError::Config(format!(
                "too many socket files: {} > MAX_POOLS ({MAX_POOLS})",
                self.socket_files.len()
            )));
        }
        Ok(())
    }
}

/// Derived, process-lifetime configuration handed to workers and the
/// coordinator. Replaces the teacher's SQLite-backed `NetworkEntry`/
/// `NicEntry` — this switch persists nothing (SPEC_FULL.md §6c).
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub port_id: u16,
    pub promiscuous: bool,
    pub num_pools: usize,
    pub tx_csum: bool,
    pub do_tag: bool,
    pub do_shape: bool,
    pub client_mode: bool,
    pub dequeue_zero_copy: bool,
    /// VLAN tag assigned to each pool index (1-based; pool 0 reserved).
    pub vlan_tags: Vec<u16>,
    /// CPU TSC frequency in ticks/second, used to scale the token bucket.
    pub cpu_freq: u64,
}

impl SwitchConfig {
    pub fn from_args(args: &Args, cpu_freq: u64) -> SwitchResult<Self> {
        args.validate()?;
        let num_pools = args.socket_files.len();
        let vlan_tags = (0..=num_pools as u16).collect();
        Ok(Self {
            port_id: args.port_id,
            promiscuous: args.promiscuous,
            num_pools,
            tx_csum: args.tx_csum != 0,
            do_tag: args.do_tag != 0,
            do_shape: args.do_shape != 0,
            client_mode: args.client,
            dequeue_zero_copy: args.dequeue_zero_copy,
            vlan_tags,
            cpu_freq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            port_id: 0,
            promiscuous: false,
            socket_files: vec!["/tmp/a.sock".into(), "/tmp/b.sock".into()],
            tx_csum: 1,
            do_tag: 1,
            do_shape: 1,
            client: false,
            dequeue_zero_copy: false,
            cores: vec![],
        }
    }

    #[test]
    fn rejects_empty_socket_list() {
        let mut args = base_args();
        args.socket_files.clear();
        assert!(args.validate().is_err());
    }

    #[test]
    fn derives_vlan_tags_per_pool() {
        let args = base_args();
        let cfg = SwitchConfig::from_args(&args, 2_000_000_000).unwrap();
        assert_eq!(cfg.num_pools, 2);
        assert_eq!(cfg.vlan_tags, vec![0, 1, 2]);
    }
}
