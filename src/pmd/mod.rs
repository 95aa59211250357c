//! Poll-mode driver framework.
//!
//! A small in-process runtime in the shape of the big userspace NIC
//! frameworks: initialized exactly once per process from EAL-style
//! arguments, it keeps a registry of ports backed by poll-mode drivers
//! and hands out hugepage-backed mbuf pools. Physical NICs are out of
//! scope; ports come from virtual-device expressions (`--vdev`) or
//! hotplug probing, which is what the poll-mode backends and the test
//! suite use.

pub mod mbuf;
pub mod vdev;

use crate::{Error, Result};
use mbuf::{Mbuf, MbufPool, SocketMemory};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info, warn};
use vdev::VdevSpec;

/// Burst ceiling drivers are asked for in one call.
pub const MAX_BURST: usize = 32;

/// A poll-mode driver behind one port.
pub trait Pmd: Send {
    fn kind(&self) -> &'static str;

    /// Acquires device resources. Runs at port start.
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    /// Receives up to `max` frames into mbufs taken from `pool`.
    fn rx_burst(&mut self, pool: &std::sync::Arc<MbufPool>, out: &mut Vec<Mbuf>, max: usize)
        -> usize;

    /// Transmits frames. The default driver drops them.
    fn tx_burst(&mut self, frames: Vec<Mbuf>) -> usize {
        frames.len()
    }
}

/// EAL-style command line: core list, memory channels, file prefix and
/// virtual device expressions.
#[derive(Debug, Clone, Default)]
pub struct EalArgs {
    pub core_list: Vec<usize>,
    pub memory_channels: usize,
    pub file_prefix: String,
    pub vdevs: Vec<String>,
}

impl EalArgs {
    /// Parses `-l 0-3`, `-n 4`, `--file-prefix pfx`, `--vdev expr` pairs.
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut parsed = EalArgs::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-l" => {
                    let list = iter
                        .next()
                        .ok_or_else(|| Error::InvalidArgument("-l needs a core list".into()))?;
                    parsed.core_list = parse_core_list(list)?;
                }
                "-n" => {
                    let n = iter
                        .next()
                        .ok_or_else(|| Error::InvalidArgument("-n needs a channel count".into()))?;
                    parsed.memory_channels = n
                        .parse()
                        .map_err(|_| Error::InvalidArgument(format!("bad channel count {n}")))?;
                }
                "--file-prefix" => {
                    parsed.file_prefix = iter
                        .next()
                        .ok_or_else(|| Error::InvalidArgument("--file-prefix needs a value".into()))?
                        .clone();
                }
                "--vdev" => {
                    let expr = iter
                        .next()
                        .ok_or_else(|| Error::InvalidArgument("--vdev needs an expression".into()))?;
                    parsed.vdevs.push(expr.clone());
                }
                other => {
                    return Err(Error::InvalidArgument(format!("unknown EAL argument {other}")));
                }
            }
        }
        Ok(parsed)
    }
}

fn parse_core_list(list: &str) -> Result<Vec<usize>> {
    let mut cores = Vec::new();
    for part in list.split(',') {
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: usize = lo
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("bad core id {lo}")))?;
            let hi: usize = hi
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("bad core id {hi}")))?;
            if hi < lo {
                return Err(Error::InvalidArgument(format!("bad core range {part}")));
            }
            cores.extend(lo..=hi);
        } else {
            cores.push(
                part.parse()
                    .map_err(|_| Error::InvalidArgument(format!("bad core id {part}")))?,
            );
        }
    }
    Ok(cores)
}

#[derive(Debug, Clone, Copy)]
struct PortConfig {
    rx_queues: u16,
    tx_queues: u16,
    mtu: u16,
}

struct PortEntry {
    id: u16,
    name: String,
    driver: Box<dyn Pmd>,
    active: bool,
    config: Option<PortConfig>,
    rx_pool: Option<std::sync::Arc<MbufPool>>,
    tx_descriptors: usize,
    started: bool,
    promiscuous: bool,
    socket_id: u32,
}

#[derive(Default)]
struct RuntimeState {
    initialized: bool,
    args: EalArgs,
    ports: Vec<PortEntry>,
    next_port_id: u16,
}

fn runtime() -> &'static Mutex<RuntimeState> {
    static RUNTIME: OnceLock<Mutex<RuntimeState>> = OnceLock::new();
    RUNTIME.get_or_init(|| Mutex::new(RuntimeState::default()))
}

/// Initializes the framework. Idempotent: the first caller wins, later
/// calls return `false` and leave the runtime untouched (their vdev
/// expressions can still be probed individually).
pub fn init(args: &EalArgs) -> Result<bool> {
    {
        let mut state = runtime().lock().unwrap();
        if state.initialized {
            warn!("poll-mode runtime already initialized");
            return Ok(false);
        }
        state.args = args.clone();
        state.initialized = true;
        info!(
            cores = ?args.core_list,
            channels = args.memory_channels,
            prefix = %args.file_prefix,
            "poll-mode runtime initialized"
        );
    }
    for expr in &args.vdevs {
        probe_vdev(expr)?;
    }
    Ok(true)
}

pub fn is_initialized() -> bool {
    runtime().lock().unwrap().initialized
}

/// Hotplugs a virtual device, registering one port for it.
pub fn probe_vdev(expr: &str) -> Result<u16> {
    let spec = VdevSpec::parse(expr)?;
    let driver = vdev::create_driver(&spec)?;
    let mut state = runtime().lock().unwrap();
    if !state.initialized {
        return Err(Error::InitializationFailed("poll-mode runtime not initialized".into()));
    }
    if state.ports.iter().any(|p| p.active && p.name == spec.name) {
        return Err(Error::InvalidArgument(format!("device {} already exists", spec.name)));
    }
    let id = state.next_port_id;
    state.next_port_id += 1;
    state.ports.push(PortEntry {
        id,
        name: spec.name.clone(),
        driver,
        active: true,
        config: None,
        rx_pool: None,
        tx_descriptors: 0,
        started: false,
        promiscuous: false,
        socket_id: 0,
    });
    debug!(port = id, device = %spec.name, "virtual device probed");
    Ok(id)
}

/// Detaches a virtual device by name.
pub fn remove_vdev(name: &str) -> Result<()> {
    let mut state = runtime().lock().unwrap();
    let entry = state
        .ports
        .iter_mut()
        .find(|p| p.active && p.name == name)
        .ok_or_else(|| Error::InvalidArgument(format!("no device named {name}")))?;
    if entry.started {
        entry.driver.stop();
        entry.started = false;
    }
    entry.active = false;
    vdev::release_driver_state(name);
    debug!(device = name, "virtual device removed");
    Ok(())
}

pub fn available_port_count() -> u16 {
    runtime().lock().unwrap().ports.iter().filter(|p| p.active).count() as u16
}

pub fn available_ports() -> Vec<String> {
    runtime()
        .lock()
        .unwrap()
        .ports
        .iter()
        .filter(|p| p.active)
        .map(|p| p.name.clone())
        .collect()
}

pub fn first_available_port() -> Option<u16> {
    runtime()
        .lock()
        .unwrap()
        .ports
        .iter()
        .find(|p| p.active)
        .map(|p| p.id)
}

pub fn port_by_name(name: &str) -> Option<u16> {
    runtime()
        .lock()
        .unwrap()
        .ports
        .iter()
        .find(|p| p.active && p.name == name)
        .map(|p| p.id)
}

pub fn port_socket_id(port: u16) -> Result<u32> {
    with_port(port, |entry| Ok(entry.socket_id))
}

/// Configures queue counts and MTU. No offloads are supported.
pub fn configure_port(port: u16, rx_queues: u16, tx_queues: u16, mtu: u16) -> Result<()> {
    with_port(port, |entry| {
        if entry.started {
            return Err(Error::InvalidArgument("port is started".into()));
        }
        entry.config = Some(PortConfig {
            rx_queues,
            tx_queues,
            mtu,
        });
        Ok(())
    })
}

pub fn setup_rx_queue(port: u16, queue: u16, pool: std::sync::Arc<MbufPool>) -> Result<()> {
    with_port(port, |entry| {
        let config = entry
            .config
            .ok_or_else(|| Error::InitializationFailed("port not configured".into()))?;
        if queue >= config.rx_queues {
            return Err(Error::InvalidArgument(format!("rx queue {queue} out of range")));
        }
        entry.rx_pool = Some(pool);
        Ok(())
    })
}

pub fn setup_tx_queue(port: u16, queue: u16, descriptors: usize) -> Result<()> {
    with_port(port, |entry| {
        let config = entry
            .config
            .ok_or_else(|| Error::InitializationFailed("port not configured".into()))?;
        if queue >= config.tx_queues {
            return Err(Error::InvalidArgument(format!("tx queue {queue} out of range")));
        }
        entry.tx_descriptors = descriptors;
        Ok(())
    })
}

pub fn start_port(port: u16) -> Result<()> {
    with_port(port, |entry| {
        if entry.config.is_none() {
            return Err(Error::InitializationFailed("port not configured".into()));
        }
        if entry.rx_pool.is_none() {
            return Err(Error::InitializationFailed("rx queue not set up".into()));
        }
        if !entry.started {
            entry.driver.start()?;
            entry.started = true;
        }
        Ok(())
    })
}

pub fn stop_port(port: u16) -> Result<()> {
    with_port(port, |entry| {
        if entry.started {
            entry.driver.stop();
            entry.started = false;
        }
        Ok(())
    })
}

pub fn close_port(port: u16) -> Result<()> {
    with_port(port, |entry| {
        if entry.started {
            entry.driver.stop();
            entry.started = false;
        }
        entry.active = false;
        Ok(())
    })
}

pub fn enable_promiscuous(port: u16) -> Result<()> {
    with_port(port, |entry| {
        entry.promiscuous = true;
        Ok(())
    })
}

/// Burst-receives up to `max` mbufs from a port's RX queue.
pub fn rx_burst(port: u16, queue: u16, out: &mut Vec<Mbuf>, max: usize) -> Result<usize> {
    with_port(port, |entry| {
        if !entry.started {
            return Err(Error::InvalidArgument("port is not started".into()));
        }
        let config = entry.config.expect("started implies configured");
        if queue >= config.rx_queues {
            return Err(Error::InvalidArgument(format!("rx queue {queue} out of range")));
        }
        let pool = entry.rx_pool.clone().expect("started implies rx pool");
        Ok(entry.driver.rx_burst(&pool, out, max.min(MAX_BURST)))
    })
}

/// NUMA-aware allocation surface: memory tagged with the socket it should
/// live on. Backing is hugepages when available, regular pages otherwise.
pub fn alloc_socket_memory(name: &str, bytes: usize, socket_id: u32) -> Result<SocketMemory> {
    SocketMemory::allocate(name, bytes, socket_id)
}

fn with_port<T>(port: u16, f: impl FnOnce(&mut PortEntry) -> Result<T>) -> Result<T> {
    let mut state = runtime().lock().unwrap();
    let entry = state
        .ports
        .iter_mut()
        .find(|p| p.active && p.id == port)
        .ok_or_else(|| Error::InvalidArgument(format!("invalid port id {port}")))?;
    f(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_init() {
        let _ = init(&EalArgs::default());
    }

    #[test]
    fn test_parse_eal_args() {
        let args: Vec<String> = [
            "-l",
            "0-2,4",
            "-n",
            "4",
            "--file-prefix",
            "cap",
            "--vdev",
            "net_null7",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let parsed = EalArgs::parse(&args).unwrap();
        assert_eq!(parsed.core_list, vec![0, 1, 2, 4]);
        assert_eq!(parsed.memory_channels, 4);
        assert_eq!(parsed.file_prefix, "cap");
        assert_eq!(parsed.vdevs, vec!["net_null7".to_string()]);
    }

    #[test]
    fn test_parse_rejects_unknown_flag() {
        assert!(EalArgs::parse(&["--frobnicate".to_string()]).is_err());
    }

    #[test]
    fn test_probe_configure_start_burst() {
        ensure_init();
        let port = probe_vdev("net_null90").unwrap();
        configure_port(port, 1, 1, 1500).unwrap();
        let pool = MbufPool::create("test_pool_90", 64, 2048, 0).unwrap();
        setup_rx_queue(port, 0, pool).unwrap();
        setup_tx_queue(port, 0, 64).unwrap();
        start_port(port).unwrap();
        enable_promiscuous(port).unwrap();

        let mut frames = Vec::new();
        let n = rx_burst(port, 0, &mut frames, 8).unwrap();
        assert!(n > 0 && n <= 8);
        assert_eq!(frames.len(), n);
        assert!(frames.iter().all(|m| m.as_bytes().iter().all(|&b| b == 0)));

        close_port(port).unwrap();
    }

    #[test]
    fn test_start_unconfigured_port_fails() {
        ensure_init();
        let port = probe_vdev("net_null91").unwrap();
        assert!(start_port(port).is_err());
        remove_vdev("net_null91").unwrap();
    }

    #[test]
    fn test_duplicate_vdev_rejected() {
        ensure_init();
        probe_vdev("net_null92").unwrap();
        assert!(probe_vdev("net_null92").is_err());
        remove_vdev("net_null92").unwrap();
        // Removed name can be probed again.
        probe_vdev("net_null92").unwrap();
        remove_vdev("net_null92").unwrap();
    }
}
