use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::topology::TopologyConfig;

/// Runtime configuration of the bridge service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Unix socket of the PCM registry service.
    pub socket_path: PathBuf,
    /// Upper bound on descriptors the transport may ask the loop to wait on.
    pub max_poll_descriptors: usize,
    /// Sample rate of the shared audio backend.
    pub output_rate: u32,
    /// Latency held by the leaky capture queue.
    pub capture_queue_ms: u32,
    /// Executable used to run pipeline descriptions.
    pub launch_program: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/bluealsa/registry.sock"),
            max_poll_descriptors: 10,
            output_rate: 48_000,
            capture_queue_ms: 50,
            launch_program: "gst-launch-1.0".into(),
            log_filter: "info".into(),
        }
    }
}

impl BridgeConfig {
    /// Reads a JSON configuration file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_poll_descriptors == 0 {
            return Err(ConfigError::Invalid(
                "max_poll_descriptors must be at least 1".into(),
            ));
        }
        if self.output_rate == 0 {
            return Err(ConfigError::Invalid("output_rate must be non-zero".into()));
        }
        if self.launch_program.trim().is_empty() {
            return Err(ConfigError::Invalid("launch_program is empty".into()));
        }
        Ok(())
    }

    pub fn with_socket_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_launch_program<S: Into<String>>(mut self, program: S) -> Self {
        self.launch_program = program.into();
        self
    }

    pub fn topology(&self) -> TopologyConfig {
        TopologyConfig {
            output_rate: self.output_rate,
            capture_queue_ms: self.capture_queue_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "capture_queue_ms": 20, "socket_path": "/tmp/ba.sock" }"#).unwrap();
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.capture_queue_ms, 20);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/ba.sock"));
        assert_eq!(config.max_poll_descriptors, 10);
        assert_eq!(config.topology().output_rate, 48_000);
    }

    #[test]
    fn zero_descriptors_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "max_poll_descriptors": 0 }"#).unwrap();
        assert!(matches!(
            BridgeConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn builder_overrides() {
        let config = BridgeConfig::default()
            .with_socket_path("/tmp/other.sock")
            .with_launch_program("/usr/local/bin/gst-launch-1.0");
        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
        assert_eq!(config.launch_program, "/usr/local/bin/gst-launch-1.0");
    }
}
