//! Process entry point: CLI parsing, driver setup, and the signal surface
//! (SPEC_FULL.md §6 "External Interfaces", §1 "OUT OF SCOPE"). Everything
//! fast-path and lifecycle-relevant lives in the library modules below;
//! this file only wires them together the way the teacher's single-binary
//! daemons (`mvirt-vmm`, `mvirt-shipper`) wire `clap` + `tracing` + a
//! run loop, adapted to this crate's synchronous poll-mode workers instead
//! of a `tokio` runtime.

mod buffer;
mod classifier;
mod config;
mod control;
mod error;
mod guest_transport;
mod guest_transport_vhost;
mod hugepage;
mod lifecycle;
mod matching_table;
mod nic;
mod registry;
mod report;
mod stats;
mod tsc;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::{SigHandler, Signal, signal};
use tracing::{error, info, warn};

use config::{Args, SwitchConfig};
use guest_transport::VhostGuestTransport;
use guest_transport_vhost::VhostUserNetDevice;
use lifecycle::Coordinator;
use matching_table::SharedMatchingTable;
use nic::{NicPort, XdpNicPort};
use registry::GuestRegistry;
use worker::{SwitchContext, WorkerCore};

/// Number of slab entries in the process-wide packet-buffer pool. Sized
/// generously above `MAX_PKT_BURST` per core so no worker ever starves
/// waiting on a buffer mid-burst.
const BUFFER_POOL_CAPACITY: usize = 8192;

static USR1_PENDING: AtomicBool = AtomicBool::new(false);
static USR2_PENDING: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_usr1(_: i32) {
    USR1_PENDING.store(true, Ordering::SeqCst);
}

extern "C" fn on_usr2(_: i32) {
    USR2_PENDING.store(true, Ordering::SeqCst);
}

extern "C" fn on_shutdown(_: i32) {
    SHUTDOWN_PENDING.store(true, Ordering::SeqCst);
}

/// SPEC_FULL.md §6 "Signals": USR1 dumps, USR2 resets, SIGINT/SIGRTMIN
/// unregister sockets and request clean shutdown. Handlers only flip
/// atomic flags; the actual work happens on the main thread's poll loop
/// below, never inside the signal handler itself.
fn install_signal_handlers() -> anyhow::Result<()> {
    unsafe {
        signal(Signal::SIGUSR1, SigHandler::Handler(on_usr1))?;
        signal(Signal::SIGUSR2, SigHandler::Handler(on_usr2))?;
        signal(Signal::SIGINT, SigHandler::Handler(on_shutdown))?;
        let sigrtmin = Signal::try_from(nix::libc::SIGRTMIN())?;
        signal(sigrtmin, SigHandler::Handler(on_shutdown))?;
    }
    Ok(())
}

/// Pin the calling thread to a single CPU core (SPEC_FULL.md §5: "N
/// parallel OS threads, one per enabled CPU core, each pinned and
/// polling").
fn pin_to_core(core_id: usize) {
    let mut cpu_set = nix::sched::CpuSet::new();
    if cpu_set.set(core_id).is_err() {
        warn!(core_id, "core id out of range for CpuSet, running unpinned");
        return;
    }
    if let Err(err) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &cpu_set) {
        warn!(core_id, %err, "failed to pin worker thread to core");
    }
}

/// Service one guest-facing vhost-user socket for the process lifetime:
/// accept a connection, bracket it with the coordinator's new-device/
/// destroy-device calls (SPEC_FULL.md §4.4, §5 "(ii) any callback invoked
/// by the external guest-transport library on its own thread"), then loop
/// to accept the next reconnection. The handshake is delivered
/// concurrently with the connection's lifetime by the backend's own epoll
/// thread, so a short-lived consumer thread bridges it back to the guest
/// id the coordinator assigned at connect time.
fn run_guest_socket(socket_path: String, coordinator: Arc<Coordinator>) {
    let device_mac = derive_switch_mac(&socket_path);
    let probe = VhostUserNetDevice::new(socket_path.clone(), device_mac);
    let mut listener = match probe.bind() {
        Ok(l) => l,
        Err(err) => {
            error!(socket = %socket_path, %err, "failed to bind vhost-user socket");
            return;
        }
    };

    loop {
        let (handshake_tx, handshake_rx) = crossbeam_channel::bounded(1);
        let device = VhostUserNetDevice::with_handshake(socket_path.clone(), device_mac, handshake_tx);

        let coordinator_for_handshake = coordinator.clone();
        let assigned_guest: Arc<std::sync::Mutex<Option<registry::GuestId>>> = Arc::new(std::sync::Mutex::new(None));
        let assigned_guest_writer = assigned_guest.clone();
        let handshake_thread = std::thread::spawn(move || {
            if let Ok(handshake) = handshake_rx.recv() {
                let guest = coordinator_for_handshake.add_guest();
                coordinator_for_handshake.attach_transport(guest.id, handshake);
                *assigned_guest_writer.lock().unwrap() = Some(guest.id);
            }
        });

        if let Err(err) = device.accept_one(&mut listener) {
            warn!(socket = %socket_path, %err, "vhost-user connection ended with error");
        }
        let _ = handshake_thread.join();

        if let Some(guest_id) = assigned_guest.lock().unwrap().take() {
            coordinator.remove_guest(guest_id);
        }
    }
}

/// The virtio-net device MAC reported to the guest's driver. This is
/// distinct from the guest's *own* source MAC used for pool-id derivation
/// (SPEC_FULL.md §3): the switch picks a locally-administered address per
/// socket so each guest's virtio-net device gets a stable identity, the
/// way the original assigns one MAC per `--socket-file` slot.
fn derive_switch_mac(socket_path: &str) -> [u8; 6] {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in socket_path.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    let b = hash.to_le_bytes();
    [0x52, 0x54, b[0], b[1], b[2], b[3]]
}

fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();

    install_signal_handlers()?;

    let cpu_freq = tsc::calibrate_cpu_freq();
    info!(cpu_freq, "calibrated TSC frequency");

    let cfg = SwitchConfig::from_args(&args, cpu_freq).map_err(anyhow::Error::from)?;

    let pool = buffer::BufferPool::new(BUFFER_POOL_CAPACITY)
        .ok_or_else(|| error::SwitchError::BufferPoolCreate("hugepage reservation failed".into()))?;

    let nic: Arc<dyn NicPort> = Arc::new(XdpNicPort::new(cfg.port_id, cfg.promiscuous));

    let registry = Arc::new(GuestRegistry::new(cfg.num_pools, cfg.vlan_tags.clone()));

    // SPEC_FULL.md §4.4 "Core assignment on creation": the first core is
    // the sole TX core; the remainder take RX duty round-robin. Default to
    // one core per socket file plus the TX core when `--cores` is empty.
    let num_cores = if args.cores.is_empty() { args.socket_files.len() + 1 } else { args.cores.len() };
    let cores: Vec<Arc<WorkerCore>> = (0..num_cores.max(1)).map(|i| Arc::new(WorkerCore::new(i))).collect();

    let transport = Arc::new(VhostGuestTransport::new());

    let ctx = Arc::new(SwitchContext {
        pool,
        table: SharedMatchingTable::new(),
        nic: nic.clone(),
        transport: transport.clone(),
        registry: registry.clone(),
        cores: cores.clone(),
        cpu_freq,
        do_tag: cfg.do_tag,
        do_shape: cfg.do_shape,
    });

    let coordinator = Arc::new(Coordinator::new(registry.clone(), cores.clone(), transport.clone()));

    let mut worker_handles = Vec::with_capacity(cores.len());
    for core in &cores {
        let core = core.clone();
        let ctx = ctx.clone();
        let physical_core_ids = args.cores.clone();
        worker_handles.push(std::thread::spawn(move || {
            let pin_target = physical_core_ids.get(core.index).copied().unwrap_or(core.index);
            pin_to_core(pin_target);
            info!(core = core.index, "worker core started");
            loop {
                worker::run_once(&core, &ctx);
            }
        }));
    }

    let mut guest_socket_handles = Vec::with_capacity(args.socket_files.len());
    for socket_path in &args.socket_files {
        let socket_path = socket_path.clone();
        let coordinator = coordinator.clone();
        guest_socket_handles.push(std::thread::spawn(move || run_guest_socket(socket_path, coordinator)));
    }

    info!(num_cores = cores.len(), num_sockets = args.socket_files.len(), "vswitchd running");

    // The only sanctioned blocking loop outside the coordinator's own
    // rendezvous spins (SPEC_FULL.md §5): dispatch signal-flagged work and
    // otherwise sleep, since nothing here is on the packet fast path.
    loop {
        if SHUTDOWN_PENDING.load(Ordering::SeqCst) {
            break;
        }
        if USR1_PENDING.swap(false, Ordering::SeqCst) {
            report::dump_matching_table(unsafe { ctx.table.get_mut() }, &cfg.vlan_tags);
            report::dump_stats(&registry);
        }
        if USR2_PENDING.swap(false, Ordering::SeqCst) {
            coordinator.reset_all_stats();
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutdown requested, exiting");
    // Worker threads and guest-socket threads run unconditional loops
    // (SPEC_FULL.md §4.5 "Workers do not exit the loop; termination is by
    // process signal") and are reaped by process exit rather than joined.
    let _ = worker_handles;
    let _ = guest_socket_handles;
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("vswitchd: fatal: {err}");
        std::process::exit(1);
    }
}
