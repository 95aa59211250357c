//! Packet capture backends.
//!
//! Four engines implement the same contract:
//! - `raw_socket`: AF_PACKET kernel-copy capture, portable, no special setup
//! - `mmap_ring`: AF_XDP socket over kernel-shared rings, needs an attached
//!   XDP program and kernel 4.18+
//! - `poll_mode`: userspace poll-mode driver framework with hugepage pools
//! - `virtual_dev`: poll-mode machinery against synthetic devices, for
//!   testing without a physical NIC

mod core;
pub mod dma;
pub mod mmap_ring;
pub mod poll_mode;
pub mod queue;
pub mod raw_socket;
pub mod ring;
mod stats;
pub mod umem;
pub mod virtual_dev;
pub mod xdp_loader;

pub(crate) use self::core::CaptureCore;
pub use self::stats::StatsRecorder;

use crate::config::NetworkConfig;
use crate::packet::Packet;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    RawSocket,
    MmapRing,
    PollMode,
    VirtualDevice,
}

/// Capture configuration, captured at `initialize` and immutable while the
/// backend runs.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interface: String,
    pub buffer_size: usize,
    pub num_buffers: usize,
    pub promiscuous: bool,
    pub timeout: Duration,
    pub batch_size: usize,
    pub timestamping: bool,
    pub cpu_affinity: Vec<usize>,
    pub zero_copy: bool,
    pub max_packet_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            buffer_size: 4096,
            num_buffers: 1024,
            promiscuous: true,
            timeout: Duration::from_millis(1000),
            batch_size: 64,
            timestamping: true,
            cpu_affinity: Vec::new(),
            zero_copy: true,
            max_packet_size: 65535,
        }
    }
}

impl From<&NetworkConfig> for CaptureConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            interface: network.interface.clone(),
            buffer_size: network.buffer_size,
            num_buffers: network.num_buffers,
            promiscuous: network.promiscuous,
            timeout: Duration::from_millis(network.timeout_ms),
            batch_size: network.batch_size,
            timestamping: network.timestamping,
            cpu_affinity: network.cpu_affinity.clone(),
            zero_copy: network.zero_copy,
            max_packet_size: network.max_packet_size,
        }
    }
}

/// Lifecycle of a backend. Config changes and zero-copy/DMA toggles are
/// only accepted outside `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Fresh,
    Initialized,
    Running,
    Stopped,
    Released,
}

impl CaptureState {
    /// Checks one transition of the state machine.
    pub fn check(self, to: CaptureState) -> Result<()> {
        use CaptureState::*;
        let allowed = match (self, to) {
            (Fresh, Initialized) => true,
            (Initialized | Stopped, Running) => true,
            (Running, Stopped) => true,
            (_, Released) => true,
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "illegal state transition {self:?} -> {to:?}"
            )))
        }
    }
}

/// Per-backend counters. Derived rates are recomputed over a one-second
/// sampling window.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub packets_captured: u64,
    pub packets_dropped: u64,
    pub bytes_captured: u64,
    pub bytes_dropped: u64,
    /// Packets per second over the last window.
    pub capture_rate: f64,
    /// Dropped packets as a percentage of everything seen.
    pub drop_rate: f64,
    pub last_update: Option<Instant>,
}

/// Push-mode sink. Invoked on the capture thread; must be fast and must
/// not call back into the backend.
pub type PacketCallback = Box<dyn Fn(Packet) + Send + Sync>;

/// The contract every capture engine implements.
///
/// Lifecycle: `initialize` (Fresh only) acquires kernel or driver
/// resources; `start` launches the capture thread; `stop` signals and
/// joins it; `release` (any state) tears everything down. Delivery is
/// pull (`next_packet`, `get_packets`), push (`set_packet_callback`), or
/// both; a single capture thread delivers in RX order.
pub trait CaptureBackend: Send + Sync {
    fn initialize(&mut self, config: CaptureConfig) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;

    /// Releases every acquired resource. Also runs on drop; errors are
    /// logged, never escalated.
    fn release(&mut self) -> Result<()>;

    fn state(&self) -> CaptureState;

    fn is_running(&self) -> bool {
        self.state() == CaptureState::Running
    }

    /// Blocks up to `timeout` for one packet. Expiry yields `None`.
    fn next_packet(&self, timeout: Duration) -> Option<Packet>;

    /// Drains up to `max` packets within `timeout`.
    fn get_packets(&self, max: usize, timeout: Duration) -> Vec<Packet>;

    fn set_packet_callback(&self, callback: PacketCallback);
    fn remove_packet_callback(&self);

    fn statistics(&self) -> Statistics;
    fn reset_statistics(&self);

    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn supported_features(&self) -> &'static [&'static str];

    fn is_feature_supported(&self, feature: &str) -> bool {
        self.supported_features().contains(&feature)
    }

    fn config(&self) -> CaptureConfig;

    /// Replaces the configuration. Refused while running.
    fn update_config(&mut self, config: CaptureConfig) -> Result<()>;

    fn last_error(&self) -> Option<String>;
    fn is_healthy(&self) -> bool;
    fn health_check(&self) -> Result<()>;

    // Zero-copy / DMA buffer management. All refuse while running.
    fn enable_zero_copy(&mut self, enabled: bool) -> Result<()>;
    fn is_zero_copy_enabled(&self) -> bool;
    fn enable_dma_access(&mut self, enabled: bool, device: &str) -> Result<()>;
    fn set_dma_buffer_size(&mut self, size: usize) -> Result<()>;
    fn allocate_dma_buffers(&mut self, count: usize) -> Result<()>;
    fn free_dma_buffers(&mut self) -> Result<()>;
}

/// Builds a backend of the requested kind.
pub fn create_backend(kind: BackendKind) -> Box<dyn CaptureBackend> {
    match kind {
        BackendKind::RawSocket => Box::new(raw_socket::RawSocketBackend::new()),
        BackendKind::MmapRing => Box::new(mmap_ring::MmapRingBackend::new()),
        BackendKind::PollMode => Box::new(poll_mode::PollModeBackend::new()),
        BackendKind::VirtualDevice => Box::new(virtual_dev::VirtualDeviceBackend::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use CaptureState::*;
        assert!(Fresh.check(Initialized).is_ok());
        assert!(Initialized.check(Running).is_ok());
        assert!(Running.check(Stopped).is_ok());
        assert!(Stopped.check(Running).is_ok());
        assert!(Stopped.check(Released).is_ok());
        assert!(Fresh.check(Released).is_ok());

        assert!(Fresh.check(Running).is_err());
        assert!(Initialized.check(Initialized).is_err());
        assert!(Released.check(Running).is_err());
    }

    #[test]
    fn test_backend_kind_serde() {
        assert_eq!(
            toml::from_str::<std::collections::HashMap<String, BackendKind>>(
                "backend = \"poll-mode\""
            )
            .unwrap()["backend"],
            BackendKind::PollMode
        );
    }

    #[test]
    fn test_capture_config_from_network() {
        let network = NetworkConfig {
            interface: "veth9".to_string(),
            timeout_ms: 250,
            ..NetworkConfig::default()
        };
        let config = CaptureConfig::from(&network);
        assert_eq!(config.interface, "veth9");
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.batch_size, 64);
    }
}
