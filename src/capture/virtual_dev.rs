//! Virtual-device backend: the poll-mode machinery wired to synthetic
//! devices. Meant for development and tests on hosts without a capture
//! NIC; devices are described by a small parameter map and must be added
//! before the framework comes up.

use super::dma::DmaBuffers;
use super::poll_mode::{bring_up_port, pmd_capture_loop};
use super::{CaptureBackend, CaptureConfig, CaptureCore, CaptureState, PacketCallback, Statistics};
use crate::packet::Packet;
use crate::pmd::{self, vdev, EalArgs};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;

pub struct VirtualDeviceBackend {
    state: CaptureState,
    config: CaptureConfig,
    core: Arc<CaptureCore>,
    devices: Vec<String>,
    framework_up: bool,
    port: Option<u16>,
    thread: Option<JoinHandle<()>>,
    dma: DmaBuffers,
}

impl Default for VirtualDeviceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDeviceBackend {
    pub fn new() -> Self {
        let config = CaptureConfig::default();
        Self {
            core: Arc::new(CaptureCore::new(config.num_buffers)),
            state: CaptureState::Fresh,
            config,
            devices: Vec::new(),
            framework_up: false,
            port: None,
            thread: None,
            dma: DmaBuffers::new(),
        }
    }

    /// Synthetic device kinds this backend can instantiate.
    pub fn supported_device_kinds() -> &'static [&'static str] {
        &vdev::SUPPORTED_KINDS
    }

    /// Registers a synthetic device. Only before the framework is up.
    pub fn add_virtual_device(
        &mut self,
        name: &str,
        params: &HashMap<String, String>,
    ) -> Result<()> {
        if self.framework_up {
            return Err(Error::InvalidArgument(
                "framework already initialized".into(),
            ));
        }
        let mut expr = name.to_string();
        for (key, value) in params {
            expr.push_str(&format!(",{key}={value}"));
        }
        // Validate eagerly so a bad expression fails here, not at init.
        vdev::VdevSpec::parse(&expr)?;
        self.devices.push(expr);
        Ok(())
    }

    pub fn remove_virtual_device(&mut self, name: &str) -> Result<()> {
        if self.framework_up {
            return Err(Error::InvalidArgument(
                "framework already initialized".into(),
            ));
        }
        let before = self.devices.len();
        self.devices
            .retain(|expr| expr.split(',').next() != Some(name));
        if self.devices.len() == before {
            return Err(Error::InvalidArgument(format!("no device named {name}")));
        }
        Ok(())
    }

    pub fn virtual_devices(&self) -> &[String] {
        &self.devices
    }

    /// Driver kinds the underlying framework reports.
    pub fn available_pmds(&self) -> Vec<String> {
        vdev::SUPPORTED_KINDS.iter().map(|s| s.to_string()).collect()
    }

    /// Port names known to the framework; empty before init.
    pub fn available_ports(&self) -> Vec<String> {
        if self.framework_up {
            pmd::available_ports()
        } else {
            Vec::new()
        }
    }

    fn refuse_while_running(&self, what: &str) -> Result<()> {
        if self.state == CaptureState::Running {
            Err(Error::InvalidArgument(format!("cannot {what} while running")))
        } else {
            Ok(())
        }
    }
}

impl CaptureBackend for VirtualDeviceBackend {
    fn initialize(&mut self, config: CaptureConfig) -> Result<()> {
        self.state.check(CaptureState::Initialized)?;
        if self.devices.is_empty() {
            return Err(Error::InvalidArgument(
                "no virtual devices registered; add one before initialize".into(),
            ));
        }

        let args = EalArgs {
            file_prefix: "fastcap-vdev".to_string(),
            vdevs: self.devices.clone(),
            ..EalArgs::default()
        };
        pmd::init(&args)?;
        // Probe devices an earlier init did not know about.
        for expr in &self.devices {
            let name = expr.split(',').next().unwrap_or(expr);
            if pmd::port_by_name(name).is_none() {
                pmd::probe_vdev(expr)?;
            }
        }
        self.framework_up = true;

        let first = self.devices[0].split(',').next().unwrap_or(&self.devices[0]);
        let port = pmd::port_by_name(first)
            .ok_or_else(|| Error::InitializationFailed(format!("device {first} has no port")))?;

        self.core = Arc::new(CaptureCore::new(config.num_buffers));
        self.port = Some(port);
        self.config = config;
        self.state = CaptureState::Initialized;
        info!(port, device = first, "virtual-device backend initialized");
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
        let handle = thread::Builder::new()
            .name(format!("fastcap-vdev-{port}"))
            .spawn(move || pmd_capture_loop(core, port, config))
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
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let _ = self.stop();
        if let Some(port) = self.port.take() {
            let _ = pmd::close_port(port);
        }
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
        "virtual-device"
    }

    fn supported_features(&self) -> &'static [&'static str] {
        &["synthetic_devices", "batch_processing", "loopback_testing"]
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
        if !self.framework_up {
            return Err(Error::InitializationFailed("framework not initialized".into()));
        }
        if let Some(error) = self.core.last_error() {
            return Err(Error::Backend(error));
        }
        Ok(())
    }

    fn enable_zero_copy(&mut self, _enabled: bool) -> Result<()> {
        self.refuse_while_running("change zero-copy mode")?;
        // Synthetic devices copy by construction.
        Ok(())
    }

    fn is_zero_copy_enabled(&self) -> bool {
        false
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

impl Drop for VirtualDeviceBackend {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmd::vdev::ring_injector;

    #[test]
    fn test_device_management_before_init() {
        let mut backend = VirtualDeviceBackend::new();
        assert!(VirtualDeviceBackend::supported_device_kinds().contains(&"net_null"));

        backend
            .add_virtual_device("net_null80", &HashMap::new())
            .unwrap();
        backend
            .add_virtual_device("net_ring80", &HashMap::new())
            .unwrap();
        assert_eq!(backend.virtual_devices().len(), 2);

        backend.remove_virtual_device("net_ring80").unwrap();
        assert_eq!(backend.virtual_devices().len(), 1);
        assert!(backend.remove_virtual_device("net_ring80").is_err());
        assert!(backend
            .add_virtual_device("net_warp80", &HashMap::new())
            .is_err());
    }

    #[test]
    fn test_initialize_without_devices_fails() {
        let mut backend = VirtualDeviceBackend::new();
        let err = backend.initialize(CaptureConfig::default()).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_ring_device_end_to_end() {
        let mut backend = VirtualDeviceBackend::new();
        backend
            .add_virtual_device("net_ring81", &HashMap::new())
            .unwrap();
        backend
            .initialize(CaptureConfig {
                interface: "ring81".to_string(),
                num_buffers: 64,
                ..CaptureConfig::default()
            })
            .unwrap();
        assert!(!backend.available_ports().is_empty());
        backend.start().unwrap();

        let injector = ring_injector("net_ring81");
        for tag in 0..5u8 {
            injector.inject(&[tag; 60]);
        }

        let packets = backend.get_packets(5, Duration::from_secs(2));
        assert_eq!(packets.len(), 5);
        for (tag, packet) in packets.iter().enumerate() {
            assert_eq!(packet.data()[0], tag as u8, "RX order preserved");
            assert_eq!(packet.len(), 60);
        }

        backend.stop().unwrap();
        backend.release().unwrap();
    }
}
