//! Poll-mode backend: capture over the userspace driver framework.
//!
//! Initialization follows the framework's fixed sequence: init the
//! runtime once per process, select the first available port, configure
//! it for one RX and one TX queue at MTU 1500 with no offloads, create an
//! mbuf pool on the port's socket, set up both queues, start the port and
//! enable promiscuous mode. The capture loop burst-receives up to 32
//! mbufs per iteration and wraps each into a packet that frees its mbuf
//! only when dropped.

use super::dma::DmaBuffers;
use super::{CaptureBackend, CaptureConfig, CaptureCore, CaptureState, PacketCallback, Statistics};
use crate::decode;
use crate::packet::{Packet, PacketBuf};
use crate::pmd::{self, mbuf::MbufPool, mbuf::SocketMemory, EalArgs};
use crate::{Error, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const IDLE_BACKOFF: Duration = Duration::from_micros(100);
const BURST: usize = 32;
const MTU: u16 = 1500;

/// Shared capture loop for the poll-mode backends: burst RX, wrap, publish.
pub(crate) fn pmd_capture_loop(
    core: Arc<CaptureCore>,
    port: u16,
    config: CaptureConfig,
) {
    let mut frames = Vec::with_capacity(BURST);
    debug!(port, interface = %config.interface, "poll-mode capture loop started");

    while core.is_running() {
        frames.clear();
        match pmd::rx_burst(port, 0, &mut frames, BURST) {
            Ok(0) => thread::sleep(IDLE_BACKOFF),
            Ok(_) => {
                for mbuf in frames.drain(..) {
                    let metadata = decode::decode_metadata(mbuf.as_bytes(), &config.interface);
                    let len = mbuf.len();
                    let packet =
                        Packet::new(PacketBuf::Mbuf(mbuf), len, Instant::now(), metadata);
                    core.publish(packet);
                }
            }
            Err(e) => {
                core.fail(format!("rx burst on port {port}: {e}"));
                return;
            }
        }
    }
    debug!(port, "poll-mode capture loop stopped");
}

/// Runs the framework's port bring-up sequence. Returns the port id and
/// its RX pool.
pub(crate) fn bring_up_port(port: u16, config: &CaptureConfig) -> Result<Arc<MbufPool>> {
    pmd::configure_port(port, 1, 1, MTU)?;
    let socket_id = pmd::port_socket_id(port)?;
    let pool = MbufPool::create(
        &format!("rx_pool_p{port}"),
        config.num_buffers,
        config.buffer_size.max(MTU as usize + 128),
        socket_id,
    )?;
    pmd::setup_rx_queue(port, 0, pool.clone())?;
    pmd::setup_tx_queue(port, 0, config.num_buffers)?;
    pmd::start_port(port)?;
    if config.promiscuous {
        pmd::enable_promiscuous(port)?;
    }
    Ok(pool)
}

pub struct PollModeBackend {
    state: CaptureState,
    config: CaptureConfig,
    core: Arc<CaptureCore>,
    eal_args: Vec<String>,
    port: Option<u16>,
    thread: Option<JoinHandle<()>>,
    zero_copy: bool,
    dma: DmaBuffers,
    dma_memory: Option<SocketMemory>,
}

impl Default for PollModeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PollModeBackend {
    pub fn new() -> Self {
        let config = CaptureConfig::default();
        Self {
            core: Arc::new(CaptureCore::new(config.num_buffers)),
            state: CaptureState::Fresh,
            config,
            eal_args: Vec::new(),
            port: None,
            thread: None,
            zero_copy: true,
            dma: DmaBuffers::new(),
            dma_memory: None,
        }
    }

    /// Sets the framework command line. Refused once the runtime is up.
    pub fn set_eal_args(&mut self, args: &[String]) -> Result<()> {
        if pmd::is_initialized() {
            return Err(Error::InvalidArgument(
                "poll-mode runtime already initialized".into(),
            ));
        }
        self.eal_args = args.to_vec();
        Ok(())
    }

    pub fn is_framework_initialized(&self) -> bool {
        pmd::is_initialized()
    }

    fn refuse_while_running(&self, what: &str) -> Result<()> {
        if self.state == CaptureState::Running {
            Err(Error::InvalidArgument(format!("cannot {what} while running")))
        } else {
            Ok(())
        }
    }
}

impl CaptureBackend for PollModeBackend {
    fn initialize(&mut self, config: CaptureConfig) -> Result<()> {
        self.state.check(CaptureState::Initialized)?;
        if config.interface.is_empty() {
            return Err(Error::InvalidArgument("interface must not be empty".into()));
        }

        // The framework is initialized once per process. Without a
        // physical NIC a tap device stands in, like the reference
        // deployments do.
        let mut args = EalArgs::parse(&self.eal_args)?;
        if args.vdevs.is_empty() && pmd::available_port_count() == 0 {
            args.vdevs
                .push(format!("net_tap0,iface={}", config.interface));
        }
        pmd::init(&args)?;
        for expr in &args.vdevs {
            // A second init call skipped these; probe them directly.
            if pmd::is_initialized() {
                let name = expr.split(',').next().unwrap_or(expr);
                if pmd::port_by_name(name).is_none() {
                    pmd::probe_vdev(expr)?;
                }
            }
        }

        // Prefer the port of this backend's own device expression; fall
        // back to the first port the runtime knows.
        let port = args
            .vdevs
            .first()
            .and_then(|expr| pmd::port_by_name(expr.split(',').next().unwrap_or(expr)))
            .or_else(pmd::first_available_port)
            .ok_or_else(|| Error::InitializationFailed("no poll-mode ports available".into()))?;

        self.core = Arc::new(CaptureCore::new(config.num_buffers));
        self.zero_copy = config.zero_copy;
        self.port = Some(port);
        self.config = config;
        self.state = CaptureState::Initialized;
        info!(port, interface = %self.config.interface, "poll-mode backend initialized");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.state.check(CaptureState::Running)?;
        let port = self
            .port
            .ok_or_else(|| Error::InitializationFailed("backend not initialized".into()))?;

        bring_up_port(port, &self.config)?;

        self.core.begin();
        let core = self.core.clone();
        let config = self.config.clone();
        let pin = config.cpu_affinity.first().copied();
        let handle = thread::Builder::new()
            .name(format!("fastcap-pmd-{port}"))
            .spawn(move || {
                if let Some(cpu) = pin {
                    super::raw_socket::pin_current_thread(cpu);
                }
                pmd_capture_loop(core, port, config);
            })
            .map_err(|e| Error::InitializationFailed(format!("spawning capture thread: {e}")))?;

        self.thread = Some(handle);
        self.state = CaptureState::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.state != CaptureState::Running {
            return Ok(());
        }
        self.core.end();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        if let Some(port) = self.port {
            let _ = pmd::stop_port(port);
        }
        self.state = CaptureState::Stopped;
        info!("poll-mode backend stopped");
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let _ = self.stop();
        if let Some(port) = self.port.take() {
            let _ = pmd::close_port(port);
        }
        self.dma_memory = None;
        if self.dma.is_allocated() {
            let _ = self.dma.free();
        }
        self.state = CaptureState::Released;
        Ok(())
    }

    fn state(&self) -> CaptureState {
        self.state
    }

    fn next_packet(&self, timeout: Duration) -> Option<Packet> {
        self.core.next_packet(timeout)
    }

    fn get_packets(&self, max: usize, timeout: Duration) -> Vec<Packet> {
        self.core.get_packets(max, timeout)
    }

    fn set_packet_callback(&self, callback: PacketCallback) {
        self.core.set_callback(callback);
    }

    fn remove_packet_callback(&self) {
        self.core.remove_callback();
    }

    fn statistics(&self) -> Statistics {
        self.core.statistics()
    }

    fn reset_statistics(&self) {
        self.core.reset_statistics();
    }

    fn name(&self) -> &'static str {
        "poll-mode"
    }

    fn supported_features(&self) -> &'static [&'static str] {
        &[
            "zero_copy",
            "batch_processing",
            "cpu_affinity",
            "hugepage_pools",
        ]
    }

    fn config(&self) -> CaptureConfig {
        self.config.clone()
    }

    fn update_config(&mut self, config: CaptureConfig) -> Result<()> {
        self.refuse_while_running("update config")?;
        self.zero_copy = config.zero_copy;
        self.config = config;
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        self.core.last_error()
    }

    fn is_healthy(&self) -> bool {
        matches!(self.state, CaptureState::Initialized | CaptureState::Running)
            && self.core.last_error().is_none()
    }

    fn health_check(&self) -> Result<()> {
        if self.state == CaptureState::Fresh {
            return Err(Error::InitializationFailed("backend not initialized".into()));
        }
        if !pmd::is_initialized() {
            return Err(Error::InitializationFailed("poll-mode runtime not initialized".into()));
        }
        if let Some(error) = self.core.last_error() {
            return Err(Error::Backend(error));
        }
        Ok(())
    }

    fn enable_zero_copy(&mut self, enabled: bool) -> Result<()> {
        self.refuse_while_running("change zero-copy mode")?;
        self.zero_copy = enabled;
        Ok(())
    }

    fn is_zero_copy_enabled(&self) -> bool {
        self.zero_copy
    }

    fn enable_dma_access(&mut self, enabled: bool, device: &str) -> Result<()> {
        self.refuse_while_running("change DMA access")?;
        self.dma.set_access(enabled, device);
        Ok(())
    }

    fn set_dma_buffer_size(&mut self, size: usize) -> Result<()> {
        self.refuse_while_running("change DMA buffer size")?;
        self.dma.set_buffer_size(size);
        Ok(())
    }

    /// DMA buffers for this backend come from the framework's NUMA-aware
    /// allocator rather than a device mapping.
    fn allocate_dma_buffers(&mut self, count: usize) -> Result<()> {
        self.refuse_while_running("allocate DMA buffers")?;
        if !self.dma.is_access_enabled() {
            return Err(Error::InvalidArgument("DMA access not enabled".into()));
        }
        if self.dma_memory.is_some() {
            return Err(Error::InvalidArgument("DMA buffers already allocated".into()));
        }
        let buffer_size = match self.dma.buffer_size() {
            0 => 2048,
            n => n,
        };
        let socket_id = self
            .port
            .and_then(|p| pmd::port_socket_id(p).ok())
            .unwrap_or(0);
        let memory =
            pmd::alloc_socket_memory("dma_buffers", count * buffer_size, socket_id)?;
        info!(count, bytes = memory.len(), "poll-mode DMA buffers allocated");
        self.dma_memory = Some(memory);
        Ok(())
    }

    fn free_dma_buffers(&mut self) -> Result<()> {
        self.refuse_while_running("free DMA buffers")?;
        if self.dma_memory.take().is_some() {
            info!("poll-mode DMA buffers freed");
        }
        Ok(())
    }
}

impl Drop for PollModeBackend {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
