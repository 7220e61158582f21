//! Error types for the switch's control plane.
//!
//! Fast-path failures (shaper drops, "cannot tag", NIC TX refusal) are never
//! routed through `Result` — they are counted in per-guest statistics per the
//! policy in SPEC_FULL.md §7. This enum only covers errors that cross a
//! thread boundary or abort startup.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("failed to configure NIC port {port}: {source}")]
    NicConfig { port: u16, source: io::Error },

    #[error("failed to set up AF_XDP queue {queue} on port {port}: {source}")]
    QueueSetup {
        port: u16,
        queue: u16,
        source: io::Error,
    },

    #[error("failed to create hugepage-backed buffer pool: {0}")]
    BufferPoolCreate(String),

    #[error("failed to register vhost-user socket {path}: {source}")]
    SocketRegister { path: String, source: io::Error },

    #[error("guest allocation failed: {0}")]
    GuestAlloc(String),

    #[error("invalid CLI configuration: {0}")]
    Config(String),
}

pub type SwitchResult<T> = Result<T, SwitchError>;
