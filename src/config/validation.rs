//! Configuration validation.

use super::Config;

/// Collected validation findings. Errors block startup, warnings do not.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const FORMATS: [&str; 3] = ["pretty", "compact", "json"];

pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::default();

    if !LEVELS.contains(&config.logging.level.to_lowercase().as_str()) {
        result.error(format!("logging.level {:?} is not a known level", config.logging.level));
    }
    if !FORMATS.contains(&config.logging.format.as_str()) {
        result.warning(format!(
            "logging.format {:?} unknown, falling back to pretty",
            config.logging.format
        ));
    }
    if config.logging.max_files == 0 {
        result.error("logging.max_files must be at least 1");
    }

    if config.network.interface.is_empty() {
        result.error("network.interface must not be empty");
    }
    if config.network.buffer_size == 0 {
        result.error("network.buffer_size must be nonzero");
    } else if !config.network.buffer_size.is_power_of_two() {
        result.warning("network.buffer_size is not a power of two; ring backends round up");
    }
    if config.network.num_buffers == 0 {
        result.error("network.num_buffers must be nonzero");
    }
    if config.network.batch_size == 0 {
        result.error("network.batch_size must be nonzero");
    }
    if config.network.max_packet_size < 64 {
        result.error("network.max_packet_size must be at least 64");
    }
    if config.network.max_packet_size > config.network.buffer_size {
        result.warning("network.max_packet_size exceeds buffer_size; frames will be truncated");
    }

    if config.performance.worker_threads == 0 {
        result.error("performance.worker_threads must be at least 1");
    }
    if config.performance.batch_size == 0 {
        result.error("performance.batch_size must be nonzero");
    }
    if config.performance.pin_threads
        && config.performance.cpu_affinity.len() < config.performance.worker_threads
    {
        result.warning("performance.cpu_affinity shorter than worker count; extra workers float");
    }

    if config.plugins.max_count == 0 {
        result.error("plugins.max_count must be at least 1");
    }

    result
}
