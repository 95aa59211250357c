//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::{Error, Result};
use std::path::Path;

/// Loads and validates a TOML configuration file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::from_os("reading config file", e))?;
    let config: Config =
        toml::from_str(&content).map_err(|e| Error::InvalidArgument(e.to_string()))?;

    let result = validate(&config);
    for warning in &result.warnings {
        tracing::warn!("config: {warning}");
    }
    if !result.is_valid() {
        return Err(Error::InvalidArgument(result.errors.join("; ")));
    }
    Ok(config)
}

/// Loads `path` if it exists, otherwise the defaults.
pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Config> {
    if path.as_ref().exists() {
        load(path)
    } else {
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::BackendKind;

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [network]
            interface = "veth0"
            backend = "mmap-ring"
            zero_copy = false

            [performance]
            worker_threads = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.network.interface, "veth0");
        assert_eq!(config.network.backend, BackendKind::MmapRing);
        assert!(!config.network.zero_copy);
        assert_eq!(config.performance.worker_threads, 2);
        // Untouched sections keep their defaults.
        assert_eq!(config.network.buffer_size, 4096);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_missing_file_falls_back() {
        let config = load_or_default("/nonexistent/fastcap.toml").unwrap();
        assert_eq!(config.network.interface, "eth0");
    }
}
