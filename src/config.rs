//! # Configuration Management Module
//!
//! This module resolves the delivery configuration from two raw sources:
//!
//! - **Managed policy**: read-only settings pushed by an administrator
//! - **Local settings**: the agent's own settings file, editable on the device
//!
//! Both are stored as TOML for human readability. Each source is normalised on
//! its own, merged over hard-coded safe defaults (managed wins), and the merged
//! endpoint is validated once more as a whole.
//!
//! ## Design Philosophy
//!
//! 1. **Fail-safe defaults**: resolution never fails, it degrades to defaults
//! 2. **Fail closed**: an endpoint that does not fully validate is replaced by
//!    the unconfigured default, never partially used
//! 3. **Observable**: every rejected value is reported with a reason code
//!
//! ## Configuration Storage Locations
//!
//! - **Windows**: `%APPDATA%\GraylogAgent\`
//! - **macOS**: `~/Library/Application Support/GraylogAgent/`
//! - **Linux**: `~/.config/graylog-agent/`

use crate::constants::{
    DEFAULT_GELF_PORT, DEFAULT_GUARD_THRESHOLD_MINUTES, DEFAULT_POLL_INTERVAL_MINUTES, GELF_PATH,
    MAX_POLL_INTERVAL_MINUTES, MIN_POLL_INTERVAL_MINUTES,
};
use crate::diagnostics::{codes, DiagnosticsStore};
use crate::error::AgentError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Transport protocol of the GELF endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Https,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Https => "https",
            Protocol::Http => "http",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "https" => Some(Protocol::Https),
            "http" => Some(Protocol::Http),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target of delivery
///
/// An empty host means "unconfigured": nothing is ever sent to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_GELF_PORT,
            protocol: Protocol::Https,
        }
    }
}

impl Endpoint {
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
    }

    /// GELF HTTP input URL for this endpoint
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, GELF_PATH)
    }
}

/// The single validated configuration the pipeline runs with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedConfiguration {
    pub endpoint: Endpoint,
    pub poll_interval_minutes: u32,
    pub guard_threshold_minutes: u32,
    pub allow_http_for_testing: bool,
    pub allowed_hosts: Vec<String>,
}

impl Default for ResolvedConfiguration {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            poll_interval_minutes: DEFAULT_POLL_INTERVAL_MINUTES,
            guard_threshold_minutes: DEFAULT_GUARD_THRESHOLD_MINUTES,
            allow_http_for_testing: false,
            allowed_hosts: Vec::new(),
        }
    }
}

/// One raw configuration source as written in TOML
///
/// Every field is optional; numbers are kept wide so out-of-range values can
/// be reported instead of failing deserialisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub allowed_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_http_for_testing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard_threshold_minutes: Option<i64>,
    /// Single `scheme://host:port` URL from older agent versions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_endpoint: Option<String>,
}

impl RawSettings {
    /// Load a managed policy file; a missing or unreadable file is an empty policy
    pub fn load_policy(path: &Path) -> Self {
        load_toml_or_default(path)
    }
}

/// The agent's local settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    #[serde(flatten)]
    pub delivery: RawSettings,
    /// Log files tailed into the log-artifacts section of each harvest
    pub log_files: Vec<PathBuf>,
}

impl LocalSettings {
    /// Load local settings, using defaults if the file doesn't exist or is invalid
    pub fn load(path: &Path) -> Self {
        load_toml_or_default(path)
    }

    /// Save local settings, creating the settings directory if needed
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        info!(path = %path.display(), "local settings saved");
        Ok(())
    }
}

fn load_toml_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse settings, using defaults");
                T::default()
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read settings, using defaults");
            T::default()
        }
    }
}

/// Host patterns the agent has been declared able to reach
///
/// Patterns use the host-permission format written at packaging time:
/// `https://logs.example.com/*`, `*://*.example.com/*` or `<all_urls>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCapabilities {
    pub host_permissions: Vec<String>,
}

impl HostCapabilities {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            host_permissions: patterns,
        }
    }

    /// Capabilities covering every host over either protocol
    pub fn unrestricted() -> Self {
        Self::new(vec!["<all_urls>".to_string()])
    }

    /// Load declared capabilities; `None` if no capability file exists
    pub fn load(path: &Path) -> Option<Self> {
        if path.exists() {
            Some(load_toml_or_default(path))
        } else {
            None
        }
    }

    /// Whether any pattern covers `host` over any protocol
    pub fn covers_host(&self, host: &str) -> bool {
        [Protocol::Https, Protocol::Http]
            .iter()
            .any(|protocol| self.covers(*protocol, host))
    }

    pub fn covers(&self, protocol: Protocol, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.host_permissions
            .iter()
            .any(|pattern| pattern_covers(pattern, protocol, &host))
    }
}

fn pattern_covers(pattern: &str, protocol: Protocol, host: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    if pattern == "<all_urls>" {
        return true;
    }

    let (scheme, rest) = match pattern.split_once("://") {
        Some(parts) => parts,
        None => ("*", pattern.as_str()),
    };
    if scheme != "*" && scheme != protocol.as_str() {
        return false;
    }

    let host_pattern = rest.split('/').next().unwrap_or_default();
    let host_pattern = host_pattern.split(':').next().unwrap_or_default();
    if host_pattern == "*" {
        return true;
    }
    match host_pattern.strip_prefix("*.") {
        Some(domain) => host == domain || host.ends_with(&format!(".{domain}")),
        None => host == host_pattern,
    }
}

/// Which raw source a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Managed,
    Local,
    Merged,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::Managed => "managed",
            ConfigSource::Local => "local",
            ConfigSource::Merged => "merged",
        }
    }
}

/// Why a configuration value was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueReason {
    InvalidHost,
    InvalidPort,
    DisallowedProtocol,
    HostNotAllowed,
    HostMissingCapability,
    InvalidInterval,
    InvalidLegacyEndpoint,
}

impl IssueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueReason::InvalidHost => "invalid-host",
            IssueReason::InvalidPort => "invalid-port",
            IssueReason::DisallowedProtocol => "disallowed-protocol",
            IssueReason::HostNotAllowed => "host-not-allowed",
            IssueReason::HostMissingCapability => "host-missing-capability",
            IssueReason::InvalidInterval => "invalid-interval",
            IssueReason::InvalidLegacyEndpoint => "invalid-legacy-endpoint",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub source: ConfigSource,
    pub field: &'static str,
    pub reason: IssueReason,
    pub value: String,
}

impl From<&ConfigIssue> for AgentError {
    fn from(issue: &ConfigIssue) -> Self {
        AgentError::ConfigurationInvalid(format!(
            "{} {} {:?}: {}",
            issue.source.as_str(),
            issue.field,
            issue.value,
            issue.reason.as_str()
        ))
    }
}

/// Result of resolving the two sources
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub config: ResolvedConfiguration,
    pub issues: Vec<ConfigIssue>,
}

impl Resolution {
    pub fn has_issue(&self, reason: IssueReason) -> bool {
        self.issues.iter().any(|issue| issue.reason == reason)
    }
}

/// A source after per-field validation
#[derive(Debug, Default)]
struct NormalizedSource {
    endpoint: Option<Endpoint>,
    allowed_hosts: Vec<String>,
    allow_http_for_testing: Option<bool>,
    poll_interval_minutes: Option<u32>,
    guard_threshold_minutes: Option<u32>,
}

/// Strict hostname check: dot-separated labels of ASCII alphanumerics and
/// inner hyphens, each 1 to 63 characters, 253 characters in total.
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Port written out in the authority of a `scheme://authority/...` URL
fn explicit_port(url: &str) -> Option<u16> {
    let (_, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let (host, port) = host_port.rsplit_once(':')?;
    if host.starts_with('[') && !host.ends_with(']') {
        return None;
    }
    port.parse().ok()
}

struct Normalizer<'a> {
    capabilities: &'a HostCapabilities,
    issues: Vec<ConfigIssue>,
}

impl<'a> Normalizer<'a> {
    fn report(&mut self, source: ConfigSource, field: &'static str, reason: IssueReason, value: impl ToString) {
        self.issues.push(ConfigIssue {
            source,
            field,
            reason,
            value: value.to_string(),
        });
    }

    fn normalize(&mut self, source: ConfigSource, raw: &RawSettings) -> NormalizedSource {
        NormalizedSource {
            endpoint: self.endpoint(source, raw),
            allowed_hosts: self.allowed_hosts(source, &raw.allowed_hosts),
            allow_http_for_testing: raw.allow_http_for_testing,
            poll_interval_minutes: self.interval(
                source,
                "poll_interval_minutes",
                raw.poll_interval_minutes,
                Some(MAX_POLL_INTERVAL_MINUTES),
            ),
            guard_threshold_minutes: self.interval(
                source,
                "guard_threshold_minutes",
                raw.guard_threshold_minutes,
                None,
            ),
        }
    }

    fn endpoint(&mut self, source: ConfigSource, raw: &RawSettings) -> Option<Endpoint> {
        let host = raw.host.as_deref().map(str::trim).filter(|h| !h.is_empty());
        let Some(host) = host else {
            return match (source, raw.legacy_endpoint.as_deref()) {
                (ConfigSource::Local, Some(legacy)) if !legacy.trim().is_empty() => self.legacy_endpoint(legacy),
                _ => None,
            };
        };

        let host = host.to_ascii_lowercase();
        if !is_valid_hostname(&host) {
            self.report(source, "host", IssueReason::InvalidHost, &host);
            return None;
        }

        let port = match raw.port {
            None => DEFAULT_GELF_PORT,
            Some(port) => match u16::try_from(port) {
                Ok(port) if port > 0 => port,
                _ => {
                    self.report(source, "port", IssueReason::InvalidPort, port);
                    DEFAULT_GELF_PORT
                }
            },
        };

        let protocol = match raw.protocol.as_deref() {
            None => Protocol::Https,
            Some(raw_protocol) => Protocol::parse(raw_protocol).unwrap_or_else(|| {
                self.report(source, "protocol", IssueReason::DisallowedProtocol, raw_protocol);
                Protocol::Https
            }),
        };

        Some(Endpoint { host, port, protocol })
    }

    fn legacy_endpoint(&mut self, legacy: &str) -> Option<Endpoint> {
        let parsed = reqwest::Url::parse(legacy.trim()).ok().and_then(|url| {
            let protocol = Protocol::parse(url.scheme())?;
            let host = url.host_str()?.to_ascii_lowercase();
            // Url drops a port equal to the scheme default, so look at the raw text too
            let port = url
                .port()
                .or_else(|| explicit_port(legacy.trim()))
                .unwrap_or(DEFAULT_GELF_PORT);
            Some(Endpoint { host, port, protocol })
        });

        match parsed {
            Some(endpoint) if is_valid_hostname(&endpoint.host) => {
                debug!(host = %endpoint.host, "using legacy endpoint setting");
                Some(endpoint)
            }
            _ => {
                self.report(
                    ConfigSource::Local,
                    "legacy_endpoint",
                    IssueReason::InvalidLegacyEndpoint,
                    legacy,
                );
                None
            }
        }
    }

    fn allowed_hosts(&mut self, source: ConfigSource, raw: &[String]) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for candidate in raw {
            let host = candidate.trim().to_ascii_lowercase();
            if host.is_empty() {
                continue;
            }
            if !is_valid_hostname(&host) {
                self.report(source, "allowed_hosts", IssueReason::InvalidHost, &host);
                continue;
            }
            if !self.capabilities.covers_host(&host) {
                self.report(source, "allowed_hosts", IssueReason::HostMissingCapability, &host);
                continue;
            }
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }

    /// Minutes value at or above the minimum; clamped to `max` when one is given
    fn interval(
        &mut self,
        source: ConfigSource,
        field: &'static str,
        raw: Option<i64>,
        max: Option<u32>,
    ) -> Option<u32> {
        let value = raw?;
        if value < i64::from(MIN_POLL_INTERVAL_MINUTES) {
            self.report(source, field, IssueReason::InvalidInterval, value);
            return None;
        }
        match max {
            Some(max) if value > i64::from(max) => {
                self.report(source, field, IssueReason::InvalidInterval, value);
                Some(max)
            }
            _ => Some(u32::try_from(value).unwrap_or(u32::MAX)),
        }
    }

    /// Whole-endpoint check after merging; `false` means fall back to default
    fn validate_merged(&mut self, config: &mut ResolvedConfiguration) -> bool {
        let endpoint = &mut config.endpoint;
        if !endpoint.is_configured() {
            return true;
        }

        if endpoint.protocol == Protocol::Http && !config.allow_http_for_testing {
            self.report(ConfigSource::Merged, "protocol", IssueReason::DisallowedProtocol, "http");
            endpoint.protocol = Protocol::Https;
        }

        let host = endpoint.host.clone();
        if !is_valid_hostname(&host) {
            self.report(ConfigSource::Merged, "host", IssueReason::InvalidHost, &host);
            return false;
        }
        if endpoint.port == 0 {
            self.report(ConfigSource::Merged, "port", IssueReason::InvalidPort, endpoint.port);
            return false;
        }
        if !config.allowed_hosts.is_empty() && !config.allowed_hosts.contains(&host) {
            self.report(ConfigSource::Merged, "host", IssueReason::HostNotAllowed, &host);
            return false;
        }
        if !self.capabilities.covers(endpoint.protocol, &host) {
            self.report(ConfigSource::Merged, "host", IssueReason::HostMissingCapability, &host);
            return false;
        }
        true
    }
}

/// Merge managed and local settings into one validated configuration
pub fn resolve(
    managed: &RawSettings,
    local: &RawSettings,
    capabilities: &HostCapabilities,
) -> Resolution {
    let mut normalizer = Normalizer {
        capabilities,
        issues: Vec::new(),
    };

    let local = normalizer.normalize(ConfigSource::Local, local);
    let managed = normalizer.normalize(ConfigSource::Managed, managed);

    let mut config = ResolvedConfiguration::default();
    for layer in [local, managed] {
        if !layer.allowed_hosts.is_empty() {
            config.allowed_hosts = layer.allowed_hosts;
        }
        if let Some(allow_http) = layer.allow_http_for_testing {
            config.allow_http_for_testing = allow_http;
        }
        if let Some(poll) = layer.poll_interval_minutes {
            config.poll_interval_minutes = poll;
        }
        if let Some(guard) = layer.guard_threshold_minutes {
            config.guard_threshold_minutes = guard;
        }
        if let Some(endpoint) = layer.endpoint {
            config.endpoint = endpoint;
        }
    }

    if !normalizer.validate_merged(&mut config) {
        config.endpoint = Endpoint::default();
    }

    config.poll_interval_minutes = config
        .poll_interval_minutes
        .clamp(MIN_POLL_INTERVAL_MINUTES, MAX_POLL_INTERVAL_MINUTES);
    config.guard_threshold_minutes = config.guard_threshold_minutes.max(config.poll_interval_minutes);

    Resolution {
        config,
        issues: normalizer.issues,
    }
}

/// Resolve and record every issue in the diagnostics store
pub async fn resolve_and_report(
    managed: &RawSettings,
    local: &RawSettings,
    capabilities: &HostCapabilities,
    diagnostics: &DiagnosticsStore,
) -> ResolvedConfiguration {
    let resolution = resolve(managed, local, capabilities);
    for issue in &resolution.issues {
        diagnostics
            .record(
                codes::CONFIG_INVALID,
                json!({
                    "source": issue.source.as_str(),
                    "field": issue.field,
                    "reason": issue.reason.as_str(),
                    "value": issue.value,
                    "error": AgentError::from(issue).to_string(),
                }),
            )
            .await;
    }
    resolution.config
}

/// Raw sources plus the lazily resolved configuration
///
/// Every change to a source bumps the version; the cached resolution is only
/// reused while its version matches.
pub struct ConfigState {
    managed: Mutex<RawSettings>,
    local: Mutex<RawSettings>,
    capabilities: Mutex<HostCapabilities>,
    version: AtomicU64,
    cached: Mutex<Option<(u64, ResolvedConfiguration)>>,
}

impl ConfigState {
    pub fn new(managed: RawSettings, local: RawSettings, capabilities: HostCapabilities) -> Self {
        Self {
            managed: Mutex::new(managed),
            local: Mutex::new(local),
            capabilities: Mutex::new(capabilities),
            version: AtomicU64::new(1),
            cached: Mutex::new(None),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Force the next `resolved` call to recompute
    pub fn invalidate(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Replace the managed policy; returns whether it changed
    pub fn update_managed(&self, managed: RawSettings) -> bool {
        Self::replace(&self.managed, managed) && self.bump()
    }

    /// Replace the local settings; returns whether they changed
    pub fn update_local(&self, local: RawSettings) -> bool {
        Self::replace(&self.local, local) && self.bump()
    }

    pub fn update_capabilities(&self, capabilities: HostCapabilities) -> bool {
        Self::replace(&self.capabilities, capabilities) && self.bump()
    }

    fn replace<T: PartialEq>(slot: &Mutex<T>, value: T) -> bool {
        match slot.lock() {
            Ok(mut current) if *current != value => {
                *current = value;
                true
            }
            _ => false,
        }
    }

    fn bump(&self) -> bool {
        self.invalidate();
        true
    }

    /// Current configuration, recomputed only after a source changed
    pub async fn resolved(&self, diagnostics: &DiagnosticsStore) -> ResolvedConfiguration {
        let version = self.version();
        if let Ok(cached) = self.cached.lock() {
            if let Some((cached_version, config)) = cached.as_ref() {
                if *cached_version == version {
                    return config.clone();
                }
            }
        }

        let (managed, local, capabilities) = (
            self.managed.lock().map(|m| m.clone()).unwrap_or_default(),
            self.local.lock().map(|l| l.clone()).unwrap_or_default(),
            self.capabilities.lock().map(|c| c.clone()).unwrap_or_default(),
        );
        let config = resolve_and_report(&managed, &local, &capabilities, diagnostics).await;
        debug!(version, endpoint = %config.endpoint.url(), "configuration resolved");

        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some((version, config.clone()));
        }
        config
    }
}

/// Platform-appropriate directory for settings files
pub fn settings_dir() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let base = dirs::config_dir().ok_or("Could not find config directory")?;
    let name = if cfg!(target_os = "windows") || cfg!(target_os = "macos") {
        "GraylogAgent"
    } else {
        "graylog-agent"
    };
    Ok(base.join(name))
}

/// Platform-appropriate path of the durable state file
pub fn state_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let base = dirs::data_local_dir().ok_or("Could not find data directory")?;
    Ok(base.join("graylog-agent").join("state.json"))
}
