//! # Data Sources
//!
//! A harvest asks every registered [`DataSource`] for one payload section.
//! Sources are independent; a failing source only loses its own section.
//!
//! ## Host Adapters
//!
//! - [`SystemInfoSource`]: OS, hardware and memory details read from the
//!   procfs/sysfs tree, split into `deviceAttributes` and `runtimeContext`
//! - [`LogFileSource`]: the tail of configured log files as `logArtifacts`
//!
//! ## Privacy Considerations
//!
//! The primary MAC address is never reported directly. It is hashed with
//! SHA-256 and the digest serves as a stable device identifier.

use crate::constants::DEFAULT_LOG_TAIL_LINES;
use crate::error::SourceError;
use crate::payload::{DEVICE_ATTRIBUTES, LOG_ARTIFACTS, RUNTIME_CONTEXT, SYSTEM_LOGS};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Source name, used in `<name>-unavailable` diagnostics
    fn name(&self) -> &'static str;

    /// Payload section the collected value is placed under
    fn section(&self) -> &'static str;

    async fn collect(&self) -> Result<Value, SourceError>;
}

/// Static device details
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAttributes {
    pub os_name: String,
    pub os_version: String,
    pub architecture: String,
    pub cpu_model: String,
    pub cpu_cores: u32,
    /// SHA-256 of the primary MAC address
    pub device_id: Option<String>,
}

/// Point-in-time resource figures
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContext {
    pub total_memory_mb: u64,
    pub available_memory_mb: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub load_average: Option<[f64; 3]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemSection {
    Device,
    Runtime,
}

/// System information read from a procfs/sysfs root
pub struct SystemInfoSource {
    root: PathBuf,
    section: SystemSection,
}

impl SystemInfoSource {
    pub fn device_attributes() -> Self {
        Self::device_attributes_at("/")
    }

    pub fn runtime_context() -> Self {
        Self::runtime_context_at("/")
    }

    /// Read from `root` instead of `/`
    pub fn device_attributes_at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            section: SystemSection::Device,
        }
    }

    pub fn runtime_context_at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            section: SystemSection::Runtime,
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn read(&self, relative: &str) -> Option<String> {
        fs::read_to_string(self.path(relative)).ok()
    }

    pub fn collect_device_attributes(&self) -> DeviceAttributes {
        DeviceAttributes {
            os_name: os_name().to_string(),
            os_version: self.os_version(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_model: self.cpu_model(),
            cpu_cores: num_cpus::get() as u32,
            device_id: self.primary_mac_address().map(|mac| hash_identifier(&mac)),
        }
    }

    pub fn collect_runtime_context(&self) -> Result<RuntimeContext, SourceError> {
        let meminfo = self
            .read("proc/meminfo")
            .ok_or_else(|| SourceError::ApiUnavailable("meminfo".to_string()))?;

        let total_kb = meminfo_field(&meminfo, "MemTotal:").ok_or_else(|| SourceError::Failed {
            source_name: "runtime".to_string(),
            message: "MemTotal missing from meminfo".to_string(),
        })?;

        Ok(RuntimeContext {
            total_memory_mb: total_kb / 1024,
            available_memory_mb: meminfo_field(&meminfo, "MemAvailable:").map(|kb| kb / 1024),
            uptime_seconds: self.uptime_seconds(),
            load_average: self.load_average(),
        })
    }

    fn os_version(&self) -> String {
        self.read("etc/os-release")
            .and_then(|content| {
                content.lines().find_map(|line| {
                    line.strip_prefix("VERSION=")
                        .map(|version| version.trim_matches('"').to_string())
                })
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn cpu_model(&self) -> String {
        self.read("proc/cpuinfo")
            .and_then(|content| {
                content
                    .lines()
                    .filter(|line| line.starts_with("model name"))
                    .find_map(|line| line.split(':').nth(1))
                    .map(|model| model.trim().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn uptime_seconds(&self) -> Option<u64> {
        let content = self.read("proc/uptime")?;
        let seconds: f64 = content.split_whitespace().next()?.parse().ok()?;
        Some(seconds as u64)
    }

    fn load_average(&self) -> Option<[f64; 3]> {
        let content = self.read("proc/loadavg")?;
        let mut fields = content.split_whitespace().map(|f| f.parse::<f64>().ok());
        Some([fields.next()??, fields.next()??, fields.next()??])
    }

    /// First non-loopback, non-virtual interface with a real address
    fn primary_mac_address(&self) -> Option<String> {
        let net = self.path("sys/class/net");
        let mut interfaces: Vec<String> = fs::read_dir(&net)
            .ok()?
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| {
                !(name.starts_with("lo") || name.starts_with("vir") || name.starts_with("docker"))
            })
            .collect();
        interfaces.sort();

        interfaces.iter().find_map(|name| {
            let mac = fs::read_to_string(net.join(name).join("address")).ok()?;
            let mac = mac.trim();
            (!mac.is_empty() && mac != "00:00:00:00:00:00").then(|| mac.to_string())
        })
    }
}

#[async_trait]
impl DataSource for SystemInfoSource {
    fn name(&self) -> &'static str {
        match self.section {
            SystemSection::Device => "device",
            SystemSection::Runtime => "runtime",
        }
    }

    fn section(&self) -> &'static str {
        match self.section {
            SystemSection::Device => DEVICE_ATTRIBUTES,
            SystemSection::Runtime => RUNTIME_CONTEXT,
        }
    }

    async fn collect(&self) -> Result<Value, SourceError> {
        let value = match self.section {
            SystemSection::Device => serde_json::to_value(self.collect_device_attributes()),
            SystemSection::Runtime => serde_json::to_value(self.collect_runtime_context()?),
        };
        value.map_err(|e| SourceError::Failed {
            source_name: self.name().to_string(),
            message: e.to_string(),
        })
    }
}

fn os_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "Windows"
    } else if cfg!(target_os = "macos") {
        "macOS"
    } else if cfg!(target_os = "linux") {
        "Linux"
    } else {
        "Unknown"
    }
}

fn meminfo_field(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// Hex SHA-256 of an identifier
pub fn hash_identifier(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Host name reported in the GELF envelope
pub fn host_name() -> String {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Tail of each configured log file
pub struct LogFileSource {
    paths: Vec<PathBuf>,
    tail_lines: usize,
}

impl LogFileSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self::with_tail_lines(paths, DEFAULT_LOG_TAIL_LINES)
    }

    pub fn with_tail_lines(paths: Vec<PathBuf>, tail_lines: usize) -> Self {
        Self { paths, tail_lines }
    }

    async fn tail(&self, path: &Path) -> std::io::Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        let skip = lines.len().saturating_sub(self.tail_lines);
        Ok(lines[skip..].join("\n"))
    }
}

#[async_trait]
impl DataSource for LogFileSource {
    fn name(&self) -> &'static str {
        "logs"
    }

    fn section(&self) -> &'static str {
        LOG_ARTIFACTS
    }

    async fn collect(&self) -> Result<Value, SourceError> {
        let mut entries = Vec::new();
        let mut last_error = None;

        for path in &self.paths {
            match self.tail(path).await {
                Ok(message) => {
                    debug!(path = %path.display(), bytes = message.len(), "log file tailed");
                    entries.push(json!({
                        "source": path.display().to_string(),
                        "message": message,
                    }));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "log file unreadable");
                    last_error = Some(e);
                }
            }
        }

        if entries.is_empty() {
            if let Some(e) = last_error {
                return Err(SourceError::Failed {
                    source_name: self.name().to_string(),
                    message: e.to_string(),
                });
            }
        }

        Ok(json!({ SYSTEM_LOGS: entries }))
    }
}
