//! AF_PACKET raw-socket backend: kernel-copy capture.
//!
//! Portable baseline. Opens a packet-family socket for all ethertypes,
//! binds it to the configured interface, and copies each received frame
//! into a fresh heap buffer. Zero-copy is not supported by this backend;
//! the DMA toggle manages a staging pool only.

use super::dma::DmaBuffers;
use super::{CaptureBackend, CaptureConfig, CaptureCore, CaptureState, PacketCallback, Statistics};
use crate::decode;
use crate::packet::{Packet, PacketBuf};
use crate::{Error, Result};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sleep bounding the busy loop when the socket would block.
const IDLE_BACKOFF: Duration = Duration::from_micros(100);

/// AF_PACKET socket bound to one interface.
struct RawSocket {
    fd: RawFd,
    ifindex: i32,
    promiscuous: bool,
}

impl RawSocket {
    fn open(config: &CaptureConfig) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(Error::last_os("creating AF_PACKET socket"));
        }

        let ifindex = match interface_index(fd, &config.interface) {
            Ok(ifindex) => ifindex,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_ALL as u16).to_be(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let bound = unsafe {
            libc::bind(
                fd,
                &sockaddr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if bound < 0 {
            let err = Error::last_os("binding AF_PACKET socket");
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let mut socket = RawSocket {
            fd,
            ifindex,
            promiscuous: false,
        };

        let rcvbuf = config.buffer_size as libc::c_int;
        let set = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &rcvbuf as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as u32,
            )
        };
        if set < 0 {
            warn!("setting SO_RCVBUF failed: {}", std::io::Error::last_os_error());
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        if config.promiscuous {
            socket.set_promiscuous(true)?;
            socket.promiscuous = true;
        }

        Ok(socket)
    }

    fn set_promiscuous(&self, enable: bool) -> Result<()> {
        let mreq = libc::packet_mreq {
            mr_ifindex: self.ifindex,
            mr_type: libc::PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let optname = if enable {
            libc::PACKET_ADD_MEMBERSHIP
        } else {
            libc::PACKET_DROP_MEMBERSHIP
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_PACKET,
                optname,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as u32,
            )
        };
        if ret < 0 {
            return Err(Error::last_os("toggling promiscuous mode"));
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut _, buf.len(), 0) };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        if self.promiscuous {
            let _ = self.set_promiscuous(false);
        }
        unsafe { libc::close(self.fd) };
    }
}

/// Resolves an interface name to its index via `SIOCGIFINDEX`.
fn interface_index(fd: RawFd, interface: &str) -> Result<i32> {
    let name = CString::new(interface)
        .map_err(|_| Error::InvalidArgument("interface name contains NUL".into()))?;
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let bytes = name.as_bytes_with_nul();
    if bytes.len() > ifr.ifr_name.len() {
        return Err(Error::InvalidArgument(format!(
            "interface name too long: {interface}"
        )));
    }
    for (dst, &src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = src as libc::c_char;
    }

    let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut ifr) };
    if ret < 0 {
        return Err(Error::ResourceUnavailable(format!(
            "interface not found: {interface}"
        )));
    }
    Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
}

pub struct RawSocketBackend {
    state: CaptureState,
    config: CaptureConfig,
    core: Arc<CaptureCore>,
    socket: Option<Arc<RawSocket>>,
    thread: Option<JoinHandle<()>>,
    zero_copy: bool,
    dma: DmaBuffers,
}

impl Default for RawSocketBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSocketBackend {
    pub fn new() -> Self {
        let config = CaptureConfig::default();
        Self {
            core: Arc::new(CaptureCore::new(config.num_buffers)),
            state: CaptureState::Fresh,
            config,
            socket: None,
            thread: None,
            zero_copy: false,
            dma: DmaBuffers::new(),
        }
    }

    fn refuse_while_running(&self, what: &str) -> Result<()> {
        if self.state == CaptureState::Running {
            Err(Error::InvalidArgument(format!("cannot {what} while running")))
        } else {
            Ok(())
        }
    }

    fn capture_loop(core: Arc<CaptureCore>, socket: Arc<RawSocket>, config: CaptureConfig) {
        let mut buf = vec![0u8; config.max_packet_size.max(64)];
        debug!(interface = %config.interface, "raw socket capture loop started");

        while core.is_running() {
            match socket.recv(&mut buf) {
                Ok(0) => thread::sleep(IDLE_BACKOFF),
                Ok(len) => {
                    let bytes = &buf[..len];
                    let metadata = decode::decode_metadata(bytes, &config.interface);
                    let packet = Packet::new(
                        PacketBuf::Heap(bytes.to_vec().into_boxed_slice()),
                        len,
                        Instant::now(),
                        metadata,
                    );
                    core.publish(packet);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(IDLE_BACKOFF);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    core.fail(format!("recv on {}: {e}", config.interface));
                    return;
                }
            }
        }
        debug!(interface = %config.interface, "raw socket capture loop stopped");
    }
}

impl CaptureBackend for RawSocketBackend {
    fn initialize(&mut self, config: CaptureConfig) -> Result<()> {
        self.state.check(CaptureState::Initialized)?;

        if !Path::new("/sys/class/net").join(&config.interface).exists() {
            return Err(Error::InvalidArgument(format!(
                "invalid network interface: {}",
                config.interface
            )));
        }

        let socket = RawSocket::open(&config)?;
        info!(
            interface = %config.interface,
            ifindex = socket.ifindex,
            "raw socket backend initialized"
        );

        self.socket = Some(Arc::new(socket));
        self.core = Arc::new(CaptureCore::new(config.num_buffers));
        self.config = config;
        self.state = CaptureState::Initialized;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.state.check(CaptureState::Running)?;
        let socket = self
            .socket
            .clone()
            .ok_or_else(|| Error::InitializationFailed("backend not initialized".into()))?;

        self.core.begin();
        let core = self.core.clone();
        let config = self.config.clone();
        let pin = config.cpu_affinity.first().copied();
        let handle = thread::Builder::new()
            .name(format!("fastcap-rx-{}", config.interface))
            .spawn(move || {
                if let Some(cpu) = pin {
                    pin_current_thread(cpu);
                }
                Self::capture_loop(core, socket, config);
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
        self.state = CaptureState::Stopped;
        info!(interface = %self.config.interface, "raw socket backend stopped");
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let _ = self.stop();
        self.socket = None;
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
        "raw-socket"
    }

    fn supported_features(&self) -> &'static [&'static str] {
        &["promiscuous", "batch_processing", "cpu_affinity"]
    }

    fn config(&self) -> CaptureConfig {
        self.config.clone()
    }

    fn update_config(&mut self, config: CaptureConfig) -> Result<()> {
        self.refuse_while_running("update config")?;
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
        if enabled {
            info!("raw socket backend is kernel-copy; zero-copy request noted, delivery stays copied");
        }
        self.zero_copy = enabled;
        Ok(())
    }

    fn is_zero_copy_enabled(&self) -> bool {
        self.zero_copy
    }

    fn enable_dma_access(&mut self, enabled: bool, device: &str) -> Result<()> {
        self.refuse_while_running("change DMA access")?;
        self.dma.set_access(enabled, device);
        if enabled {
            info!("DMA region serves as a staging pool for this backend");
        }
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

impl Drop for RawSocketBackend {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Pins the calling thread to one CPU.
pub(crate) fn pin_current_thread(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            warn!(cpu, "pinning capture thread failed: {}", std::io::Error::last_os_error());
        } else {
            debug!(cpu, "capture thread pinned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_rejects_bogus_interface() {
        let mut backend = RawSocketBackend::new();
        let err = backend
            .initialize(CaptureConfig {
                interface: "definitely-not-a-nic".to_string(),
                ..CaptureConfig::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidArgument);
        assert_eq!(backend.state(), CaptureState::Fresh);
    }

    #[test]
    fn test_start_without_initialize_fails() {
        let mut backend = RawSocketBackend::new();
        assert!(backend.start().is_err());
    }

    #[test]
    fn test_zero_copy_toggle_round_trip() {
        let mut backend = RawSocketBackend::new();
        assert!(!backend.is_zero_copy_enabled());
        backend.enable_zero_copy(true).unwrap();
        backend.enable_zero_copy(false).unwrap();
        assert!(!backend.is_zero_copy_enabled());
    }

    #[test]
    fn test_next_packet_on_idle_backend_times_out() {
        let backend = RawSocketBackend::new();
        assert!(backend.next_packet(Duration::ZERO).is_none());
        assert!(backend.get_packets(8, Duration::ZERO).is_empty());
    }

    #[test]
    fn test_health_check_fresh() {
        let mut backend = RawSocketBackend::new();
        assert!(backend.health_check().is_err());
        assert!(!backend.is_healthy());
        assert!(backend.release().is_ok());
        assert_eq!(backend.state(), CaptureState::Released);
    }

    #[test]
    fn test_features() {
        let backend = RawSocketBackend::new();
        assert!(backend.is_feature_supported("promiscuous"));
        assert!(!backend.is_feature_supported("zero_copy"));
        assert_eq!(backend.name(), "raw-socket");
    }
}
