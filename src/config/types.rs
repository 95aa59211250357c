//! Configuration types.

use crate::capture::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application configuration, loaded from TOML. Every section is optional
/// and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub plugins: PluginConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error.
    #[serde(default = "default_level")]
    pub level: String,
    /// pretty or json console output.
    #[serde(default = "default_format")]
    pub format: String,
    /// Log file path; no file sink when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Size cap per log file, bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Rotated files kept.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_true")]
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
            file: None,
            max_file_size: default_max_file_size(),
            max_files: default_max_files(),
            console: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default)]
    pub backend: BackendKind,
    /// RX buffer size in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_num_buffers")]
    pub num_buffers: usize,
    #[serde(default = "default_true")]
    pub promiscuous: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub timestamping: bool,
    #[serde(default)]
    pub cpu_affinity: Vec<usize>,
    #[serde(default = "default_true")]
    pub zero_copy: bool,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            backend: BackendKind::default(),
            buffer_size: default_buffer_size(),
            num_buffers: default_num_buffers(),
            promiscuous: true,
            timeout_ms: default_timeout_ms(),
            batch_size: default_batch_size(),
            timestamping: true,
            cpu_affinity: Vec::new(),
            zero_copy: true,
            max_packet_size: default_max_packet_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_workers")]
    pub worker_threads: usize,
    #[serde(default)]
    pub pin_threads: bool,
    /// CPU per worker, indexed by worker id.
    #[serde(default)]
    pub cpu_affinity: Vec<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_workers(),
            pin_threads: false,
            cpu_affinity: Vec::new(),
            batch_size: default_batch_size(),
            metrics: true,
        }
    }
}

/// Plugin discovery options. Carried for embedders; the SDK core performs
/// no dynamic loading itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_plugin_dir")]
    pub directory: PathBuf,
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub autoload: bool,
    #[serde(default = "default_max_plugins")]
    pub max_count: usize,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            directory: default_plugin_dir(),
            enabled: Vec::new(),
            autoload: false,
            max_count: default_max_plugins(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_max_files() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_buffer_size() -> usize {
    4096
}

fn default_num_buffers() -> usize {
    1024
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    64
}

fn default_max_packet_size() -> usize {
    65535
}

fn default_workers() -> usize {
    1
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("./plugins")
}

fn default_max_plugins() -> usize {
    32
}
