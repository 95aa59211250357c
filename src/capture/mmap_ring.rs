//! Kernel-bypass capture over an AF_XDP socket and four kernel-shared
//! rings, cooperating with an in-kernel filter program.
//!
//! Ring initialization is strictly ordered: create the socket, register
//! UMEM, size the rings and map them at the kernel's page offsets, verify
//! the filter program is attached, bind to (interface, queue), seed the
//! fill ring. Binding retries a small set of queue ids; on synthetic/veth
//! interfaces a failed bind degrades to the attached program running in
//! generic mode without the AF_XDP fast path, which this backend reports
//! through `is_fallback_mode`.

use super::dma::DmaBuffers;
use super::ring::{
    ConsumerRing, ProducerRing, RingMem, SockaddrXdp, XdpDesc, XdpMmapOffsets, XdpUmemReg, AF_XDP,
    SOL_XDP, XDP_MMAP_OFFSETS, XDP_PGOFF_RX_RING, XDP_PGOFF_TX_RING, XDP_RX_RING, XDP_TX_RING,
    XDP_UMEM_COMPLETION_RING, XDP_UMEM_FILL_RING, XDP_UMEM_PGOFF_COMPLETION_RING,
    XDP_UMEM_PGOFF_FILL_RING, XDP_UMEM_REG,
};
use super::umem::{UmemRegion, UmemSlice};
use super::xdp_loader::{XdpLoader, XdpMode};
use super::{CaptureBackend, CaptureConfig, CaptureCore, CaptureState, PacketCallback, Statistics};
use crate::decode;
use crate::packet::{Packet, PacketBuf};
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Yield period when the RX ring is empty; bounds RX latency together
/// with the kernel's own NAPI cadence.
const IDLE_BACKOFF: Duration = Duration::from_micros(10);

/// Queue ids tried at bind time before giving up.
const BIND_QUEUE_IDS: [u32; 4] = [0, 1, 2, 3];

/// An AF_XDP socket descriptor.
struct XdpSocket {
    fd: RawFd,
}

impl XdpSocket {
    fn create() -> Result<Self> {
        let fd = unsafe { libc::socket(AF_XDP, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(Error::last_os("creating AF_XDP socket"));
        }
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        Ok(Self { fd })
    }

    fn set_opt<T>(&self, name: libc::c_int, value: &T) -> Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                SOL_XDP,
                name,
                value as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::last_os("AF_XDP setsockopt"));
        }
        Ok(())
    }
}

impl Drop for XdpSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// The four mapped rings plus the socket that owns them.
struct RingSet {
    socket: XdpSocket,
    fill: ProducerRing<u64>,
    completion: ConsumerRing<u64>,
    rx: ConsumerRing<XdpDesc>,
    /// Mapped for the full four-ring protocol; the capture path never
    /// produces into it.
    #[allow(dead_code)]
    tx: ProducerRing<XdpDesc>,
    queue_id: u32,
}

impl RingSet {
    /// Runs the fixed initialization sequence against an attached filter
    /// program. Returns `Ok(None)` for the accepted generic-mode
    /// degradation on veth interfaces.
    fn setup(
        config: &CaptureConfig,
        umem: &UmemRegion,
        loader: &mut XdpLoader,
    ) -> Result<Option<RingSet>> {
        let socket = XdpSocket::create()?;

        // Register UMEM: chunk size and zero headroom.
        let reg = XdpUmemReg {
            addr: umem.as_ptr() as u64,
            len: umem.len() as u64,
            chunk_size: umem.chunk_size() as u32,
            headroom: 0,
            flags: 0,
        };
        socket
            .set_opt(XDP_UMEM_REG, &reg)
            .map_err(|e| Error::InitializationFailed(format!("registering UMEM: {e}")))?;

        // Ring sizes must be set before the rings can be mapped.
        let entries = (config.num_buffers.max(8) as u32).next_power_of_two();
        for opt in [
            XDP_UMEM_FILL_RING,
            XDP_UMEM_COMPLETION_RING,
            XDP_RX_RING,
            XDP_TX_RING,
        ] {
            socket
                .set_opt(opt, &(entries as libc::c_int))
                .map_err(|e| Error::InitializationFailed(format!("sizing ring {opt}: {e}")))?;
        }

        // Query the kernel's ring offsets and map all four rings.
        let mut offsets = XdpMmapOffsets::default();
        let mut optlen = std::mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                socket.fd,
                SOL_XDP,
                XDP_MMAP_OFFSETS,
                &mut offsets as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };
        if ret < 0 {
            return Err(Error::last_os("querying ring offsets"));
        }

        let fill = ProducerRing(RingMem::<u64>::map(
            socket.fd,
            XDP_UMEM_PGOFF_FILL_RING,
            offsets.fr,
            entries,
        )?);
        let completion = ConsumerRing(RingMem::<u64>::map(
            socket.fd,
            XDP_UMEM_PGOFF_COMPLETION_RING,
            offsets.cr,
            entries,
        )?);
        let rx = ConsumerRing(RingMem::<XdpDesc>::map(
            socket.fd,
            XDP_PGOFF_RX_RING,
            offsets.rx,
            entries,
        )?);
        let tx = ProducerRing(RingMem::<XdpDesc>::map(
            socket.fd,
            XDP_PGOFF_TX_RING,
            offsets.tx,
            entries,
        )?);

        // The filter program must already be attached; bind would be
        // rejected or useless otherwise.
        if !loader.is_attached() {
            return Err(Error::InitializationFailed(
                "no filter program attached to the interface".into(),
            ));
        }

        let ifindex = interface_index(&config.interface)?;
        let mut bound_queue = None;
        for queue_id in BIND_QUEUE_IDS {
            let sxdp = SockaddrXdp {
                sxdp_family: AF_XDP as u16,
                sxdp_ifindex: ifindex as u32,
                sxdp_queue_id: queue_id,
                ..SockaddrXdp::default()
            };
            let ret = unsafe {
                libc::bind(
                    socket.fd,
                    &sxdp as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<SockaddrXdp>() as libc::socklen_t,
                )
            };
            if ret == 0 {
                info!(interface = %config.interface, queue_id, "AF_XDP socket bound");
                bound_queue = Some(queue_id);
                break;
            }
            let errno = std::io::Error::last_os_error();
            match errno.raw_os_error() {
                Some(libc::EINVAL) | Some(libc::ENOENT) | Some(libc::EPERM)
                | Some(libc::ENODEV) => {
                    warn!(queue_id, "bind failed: {errno}, trying next queue");
                }
                _ => return Err(Error::from_os("binding AF_XDP socket", errno)),
            }
        }

        let queue_id = match bound_queue {
            Some(queue_id) => queue_id,
            None if config.interface.starts_with("veth") => {
                warn!(
                    interface = %config.interface,
                    "bind failed on every queue; degrading to generic-mode capture"
                );
                return Ok(None);
            }
            None => {
                return Err(Error::InitializationFailed(format!(
                    "binding AF_XDP socket to {} failed on queues {BIND_QUEUE_IDS:?}",
                    config.interface
                )));
            }
        };

        // Publish the socket in the redirect map under its queue id.
        loader.register_socket(queue_id, socket.fd)?;

        let mut set = RingSet {
            socket,
            fill,
            completion,
            rx,
            tx,
            queue_id,
        };

        // Seed the fill ring with every chunk.
        for index in 0..umem.chunk_count() {
            if !set.fill.push(umem.chunk_addr(index)) {
                break;
            }
        }
        debug!(entries, queue_id = set.queue_id, "rings initialized and fill seeded");
        Ok(Some(set))
    }
}

pub struct MmapRingBackend {
    state: CaptureState,
    config: CaptureConfig,
    core: Arc<CaptureCore>,
    loader: XdpLoader,
    umem: Option<Arc<UmemRegion>>,
    thread: Option<JoinHandle<XdpLoader>>,
    fallback: bool,
    zero_copy: bool,
    dma: DmaBuffers,
}

impl Default for MmapRingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapRingBackend {
    pub fn new() -> Self {
        let config = CaptureConfig::default();
        Self {
            core: Arc::new(CaptureCore::new(config.num_buffers)),
            state: CaptureState::Fresh,
            config,
            loader: XdpLoader::new(),
            umem: None,
            thread: None,
            fallback: false,
            zero_copy: true,
            dma: DmaBuffers::new(),
        }
    }

    /// Loads the in-kernel filter program from `object_path`.
    pub fn load_program(&mut self, object_path: &Path, program_name: &str) -> Result<()> {
        self.loader.load_program(object_path, program_name)
    }

    /// Attaches the loaded program to the configured interface.
    pub fn attach_program(&mut self, mode: XdpMode) -> Result<()> {
        self.loader.attach_program(&self.config.interface, mode)
    }

    pub fn detach_program(&mut self) -> Result<()> {
        self.loader.detach_program()
    }

    pub fn unload_program(&mut self) -> Result<()> {
        self.loader.unload_program()
    }

    pub fn is_program_loaded(&self) -> bool {
        self.loader.is_loaded()
    }

    pub fn program_stats(&self) -> String {
        self.loader.program_stats()
    }

    /// True when bind degraded to generic-mode capture without the
    /// AF_XDP fast path.
    pub fn is_fallback_mode(&self) -> bool {
        self.fallback
    }

    fn refuse_while_running(&self, what: &str) -> Result<()> {
        if self.state == CaptureState::Running {
            Err(Error::InvalidArgument(format!("cannot {what} while running")))
        } else {
            Ok(())
        }
    }

    fn capture_loop(
        core: Arc<CaptureCore>,
        rings: Option<RingSet>,
        umem: Arc<UmemRegion>,
        recycler: (Sender<u64>, Receiver<u64>),
        config: CaptureConfig,
        zero_copy: bool,
    ) {
        let (recycle_tx, recycle_rx) = recycler;
        let mut rings = match rings {
            Some(rings) => rings,
            None => {
                // Generic-mode degradation: the filter program observes
                // traffic in the kernel but no AF_XDP fast path exists.
                debug!("capture loop idling in generic-mode fallback");
                while core.is_running() {
                    thread::sleep(Duration::from_millis(10));
                }
                return;
            }
        };

        let chunk_size = umem.chunk_size() as u32;
        let mut pending_fill: VecDeque<u64> = VecDeque::new();
        debug!(interface = %config.interface, queue_id = rings.queue_id, "mmap-ring capture loop started");

        while core.is_running() {
            let mut idle = true;

            // Drain RX: one packet per descriptor, then recycle.
            while let Some(desc) = rings.rx.pop() {
                idle = false;
                if desc.len == 0 || desc.len > chunk_size {
                    pending_fill.push_back(umem.chunk_base(desc.addr));
                    continue;
                }
                let bytes = umem.slice(desc.addr, desc.len);
                if bytes.is_empty() {
                    pending_fill.push_back(umem.chunk_base(desc.addr));
                    continue;
                }
                let metadata = decode::decode_metadata(bytes, &config.interface);
                let packet = if zero_copy {
                    // The chunk returns through the recycler when the
                    // packet's last owner drops.
                    Packet::new(
                        PacketBuf::Umem(UmemSlice::new(
                            umem.clone(),
                            desc.addr,
                            desc.len,
                            recycle_tx.clone(),
                        )),
                        desc.len as usize,
                        Instant::now(),
                        metadata,
                    )
                } else {
                    let copied = bytes.to_vec().into_boxed_slice();
                    pending_fill.push_back(umem.chunk_base(desc.addr));
                    Packet::new(
                        PacketBuf::Heap(copied),
                        desc.len as usize,
                        Instant::now(),
                        metadata,
                    )
                };
                core.publish(packet);
            }

            // Completion ring: addresses the kernel is done with go back
            // to Fill.
            while let Some(addr) = rings.completion.pop() {
                idle = false;
                pending_fill.push_back(umem.chunk_base(addr));
            }

            // Refill from dropped packets.
            while let Ok(addr) = recycle_rx.try_recv() {
                pending_fill.push_back(addr);
            }
            while let Some(&addr) = pending_fill.front() {
                if rings.fill.push(addr) {
                    pending_fill.pop_front();
                } else {
                    break;
                }
            }

            if idle {
                thread::sleep(IDLE_BACKOFF);
            }
        }
        debug!("mmap-ring capture loop stopped");
    }
}

impl CaptureBackend for MmapRingBackend {
    fn initialize(&mut self, config: CaptureConfig) -> Result<()> {
        self.state.check(CaptureState::Initialized)?;

        if !Path::new("/sys/class/net").join(&config.interface).exists() {
            return Err(Error::InvalidArgument(format!(
                "invalid network interface: {}",
                config.interface
            )));
        }
        // The redirect handshake pins through the BPF filesystem; without
        // it this backend cannot run at all.
        if !Path::new("/sys/fs/bpf").exists() {
            return Err(Error::ResourceUnavailable(
                "BPF filesystem not mounted at /sys/fs/bpf".into(),
            ));
        }

        self.core = Arc::new(CaptureCore::new(config.num_buffers));
        self.zero_copy = config.zero_copy;
        self.config = config;
        self.state = CaptureState::Initialized;
        info!(interface = %self.config.interface, "mmap-ring backend initialized, awaiting filter program");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.state.check(CaptureState::Running)?;

        if !self.loader.is_attached() {
            return Err(Error::InitializationFailed(
                "no filter program attached; load and attach one before start".into(),
            ));
        }

        let chunk_size = self.config.buffer_size.max(2048).next_power_of_two();
        let umem = Arc::new(UmemRegion::allocate(
            self.config.num_buffers.max(8),
            chunk_size,
        )?);
        let rings = RingSet::setup(&self.config, &umem, &mut self.loader)?;
        self.fallback = rings.is_none();

        self.core.begin();
        let core = self.core.clone();
        let config = self.config.clone();
        let zero_copy = self.zero_copy;
        let recycler = crossbeam_channel::unbounded();
        let umem_for_loop = umem.clone();
        // The loader moves into the capture thread so the redirect map
        // outlives the bound socket; it comes back at join time.
        let loader = std::mem::take(&mut self.loader);
        let pin = config.cpu_affinity.first().copied();

        let handle = thread::Builder::new()
            .name(format!("fastcap-xdp-{}", config.interface))
            .spawn(move || {
                if let Some(cpu) = pin {
                    super::raw_socket::pin_current_thread(cpu);
                }
                Self::capture_loop(core, rings, umem_for_loop, recycler, config, zero_copy);
                loader
            })
            .map_err(|e| Error::InitializationFailed(format!("spawning capture thread: {e}")))?;

        self.umem = Some(umem);
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
            if let Ok(loader) = handle.join() {
                self.loader = loader;
            }
        }
        self.state = CaptureState::Stopped;
        info!(interface = %self.config.interface, "mmap-ring backend stopped");
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let _ = self.stop();
        if self.loader.is_attached() {
            let _ = self.loader.detach_program();
        }
        let _ = self.loader.unload_program();
        self.umem = None;
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
        "mmap-ring"
    }

    fn supported_features(&self) -> &'static [&'static str] {
        &[
            "zero_copy",
            "kernel_bypass",
            "in_kernel_filter",
            "batch_processing",
            "cpu_affinity",
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
        if let Some(error) = self.core.last_error() {
            return Err(Error::Backend(error));
        }
        Ok(())
    }

    fn enable_zero_copy(&mut self, enabled: bool) -> Result<()> {
        self.refuse_while_running("change zero-copy mode")?;
        self.zero_copy = enabled;
        info!(enabled, "zero-copy mode updated");
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

    fn allocate_dma_buffers(&mut self, count: usize) -> Result<()> {
        self.refuse_while_running("allocate DMA buffers")?;
        self.dma.allocate(count)
    }

    fn free_dma_buffers(&mut self) -> Result<()> {
        self.refuse_while_running("free DMA buffers")?;
        self.dma.free()
    }
}

impl Drop for MmapRingBackend {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Resolves an interface name to its index.
fn interface_index(interface: &str) -> Result<i32> {
    let name = std::ffi::CString::new(interface)
        .map_err(|_| Error::InvalidArgument("interface name contains NUL".into()))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        // Fall back to sysfs, which survives some namespace oddities.
        let path = format!("/sys/class/net/{interface}/ifindex");
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Ok(index) = content.trim().parse::<i32>() {
                return Ok(index);
            }
        }
        return Err(Error::InvalidArgument(format!(
            "interface not found: {interface}"
        )));
    }
    Ok(index as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_requires_attached_program() {
        let mut backend = MmapRingBackend::new();
        match backend.initialize(CaptureConfig {
            interface: "lo".to_string(),
            ..CaptureConfig::default()
        }) {
            Ok(()) => {
                // Initialized, but no program was ever attached: start
                // must refuse before touching the kernel.
                let err = backend.start().unwrap_err();
                assert_eq!(err.code(), crate::ErrorCode::InitializationFailed);
                assert_eq!(backend.state(), CaptureState::Initialized);
            }
            Err(e) => {
                // Environment without a BPF filesystem.
                assert_eq!(e.code(), crate::ErrorCode::ResourceUnavailable);
            }
        }
    }

    #[test]
    fn test_initialize_rejects_unknown_interface() {
        let mut backend = MmapRingBackend::new();
        let err = backend
            .initialize(CaptureConfig {
                interface: "no-such-nic".to_string(),
                ..CaptureConfig::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidArgument);
        assert_eq!(backend.state(), CaptureState::Fresh);
    }

    #[test]
    fn test_zero_copy_dma_lifecycle_outside_running() {
        let mut backend = MmapRingBackend::new();
        backend.enable_zero_copy(true).unwrap();
        backend.enable_dma_access(true, "/dev/zero").unwrap();
        backend.set_dma_buffer_size(4096).unwrap();
        match backend.allocate_dma_buffers(16) {
            Ok(()) => backend.free_dma_buffers().unwrap(),
            // mmap MAP_LOCKED may exceed RLIMIT_MEMLOCK in sandboxes.
            Err(e) => assert_eq!(e.code(), crate::ErrorCode::InitializationFailed),
        }
    }

    #[test]
    fn test_program_stats_without_program() {
        let backend = MmapRingBackend::new();
        assert_eq!(backend.program_stats(), "no program loaded");
        assert!(!backend.is_program_loaded());
        assert!(!backend.is_fallback_mode());
    }
}
