// src/config.rs

//! Loads, resolves, and validates the coordination core's configuration.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Durability policy for the per-shard translog: `Always` fsyncs on every
/// `add()`, `EverySec` relies on the owning node's periodic flush instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslogFsync {
    Always,
    EverySec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslogSettings {
    /// Candidate directories the least-free-space heuristic picks from when
    /// rotating to a new current file. At least one is required.
    pub data_dirs: Vec<PathBuf>,
    #[serde(default = "default_translog_fsync")]
    pub fsync: TranslogFsync,
}

fn default_translog_fsync() -> TranslogFsync {
    TranslogFsync::EverySec
}

impl TranslogSettings {
    pub fn sync_on_each_operation(&self) -> bool {
        matches!(self.fsync, TranslogFsync::Always)
    }
}

/// Reporter settings: queue depth and drain cadence on the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterSettings {
    #[serde(default = "default_reporter_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_drain_period", with = "duration_millis")]
    pub drain_period: Duration,
}

fn default_reporter_queue_capacity() -> usize {
    256
}
fn default_drain_period_ms() -> u64 {
    200
}
fn default_drain_period() -> Duration {
    Duration::from_millis(default_drain_period_ms())
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_reporter_queue_capacity(),
            drain_period: Duration::from_millis(default_drain_period_ms()),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Retry backoff bounds used by the primary phase's caller-facing default
/// write timeout (the observer-driven retry loop itself has no backoff of
/// its own: it simply waits for the next cluster-state change).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteDefaults {
    #[serde(default = "default_write_timeout", with = "duration_millis")]
    pub timeout: Duration,
}

fn default_write_timeout_ms() -> u64 {
    30_000
}
fn default_write_timeout() -> Duration {
    Duration::from_millis(default_write_timeout_ms())
}

impl Default for WriteDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(default_write_timeout_ms()),
        }
    }
}

/// A raw representation of the config file before defaults are resolved.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_node_id")]
    node_id: String,
    #[serde(default = "default_bind_addr")]
    bind_addr: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    translog: TranslogSettings,
    #[serde(default)]
    reporter: ReporterSettings,
    #[serde(default)]
    write: WriteDefaults,
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_bind_addr() -> String {
    "127.0.0.1:9300".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// The resolved, validated configuration for one node's coordination core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub bind_addr: String,
    pub log_level: String,
    pub translog: TranslogSettings,
    pub reporter: ReporterSettings,
    pub write: WriteDefaults,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;

        let config = Config {
            node_id: raw.node_id,
            bind_addr: raw.bind_addr,
            log_level: raw.log_level,
            translog: raw.translog,
            reporter: raw.reporter,
            write: raw.write,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(anyhow!("node_id cannot be empty"));
        }
        if self.translog.data_dirs.is_empty() {
            return Err(anyhow!("translog.data_dirs must list at least one directory"));
        }
        if self.reporter.queue_capacity == 0 {
            return Err(anyhow!("reporter.queue_capacity cannot be 0"));
        }
        if self.write.timeout.is_zero() {
            return Err(anyhow!("write.timeout cannot be 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_data_dirs_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node_id = \"n1\"").unwrap();
        writeln!(file, "translog.data_dirs = []").unwrap();
        let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("data_dirs"));
    }

    #[test]
    fn minimal_file_resolves_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node_id = \"n1\"").unwrap();
        writeln!(file, "translog.data_dirs = [\"/tmp/shardrepl\"]").unwrap();
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.node_id, "n1");
        assert_eq!(config.reporter.queue_capacity, 256);
        assert!(!config.translog.sync_on_each_operation());
    }
}
