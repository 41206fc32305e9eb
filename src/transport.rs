//! Network delivery of a single payload.
//!
//! Every failure mode (offline, connect error, timeout, non-2xx status) is a
//! [`DeliveryError`]; the retry queue treats them all the same way.

use crate::config::Endpoint;
use crate::constants::DELIVERY_TIMEOUT_SECONDS;
use crate::error::DeliveryError;
use async_trait::async_trait;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connectivity pre-check; when `false` no request is attempted
    fn is_online(&self) -> bool {
        true
    }

    /// POST one JSON payload to the endpoint
    async fn post(&self, endpoint: &Endpoint, payload: &Value) -> Result<(), DeliveryError>;
}

/// Link state of the network interfaces under `<root>/sys/class/net`
///
/// Online when any non-loopback interface reports `up` (or `unknown`, which
/// tunnels and some virtual links use). A missing interface tree gives no
/// signal at all and counts as online.
pub fn interfaces_online(root: &Path) -> bool {
    let net = root.join("sys/class/net");
    let Ok(entries) = fs::read_dir(&net) else {
        return true;
    };

    let mut states = entries
        .flatten()
        .filter(|entry| entry.file_name().to_str() != Some("lo"))
        .filter_map(|entry| fs::read_to_string(entry.path().join("operstate")).ok())
        .peekable();
    if states.peek().is_none() {
        return true;
    }
    states.any(|state| matches!(state.trim(), "up" | "unknown"))
}

/// GELF HTTP delivery through `reqwest`
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
    sysfs_root: PathBuf,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DELIVERY_TIMEOUT_SECONDS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
            sysfs_root: PathBuf::from("/"),
        }
    }

    /// Read interface link state below `root` instead of `/`
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn is_online(&self) -> bool {
        let online = interfaces_online(&self.sysfs_root);
        if !online {
            debug!("no network interface is up");
        }
        online
    }

    async fn post(&self, endpoint: &Endpoint, payload: &Value) -> Result<(), DeliveryError> {
        if !endpoint.is_configured() {
            return Err(DeliveryError::Unconfigured);
        }

        let body = serde_json::to_vec(payload)?;
        let url = endpoint.url();

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(self.timeout.as_secs())
                } else {
                    DeliveryError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %url, status = status.as_u16(), "payload delivered");
            Ok(())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}

/// Deliver with the offline pre-check applied
pub async fn deliver(
    transport: &dyn Transport,
    endpoint: &Endpoint,
    payload: &Value,
) -> Result<(), DeliveryError> {
    if !transport.is_online() {
        return Err(DeliveryError::Offline);
    }
    transport.post(endpoint, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use serde_json::json;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "logs.example.com".to_string(),
            port: 12201,
            protocol: Protocol::Https,
        }
    }

    #[tokio::test]
    async fn test_offline_skips_request() {
        let mut transport = MockTransport::new();
        transport.expect_is_online().return_const(false);
        transport.expect_post().never();

        let result = deliver(&transport, &endpoint(), &json!({})).await;
        assert!(matches!(result, Err(DeliveryError::Offline)));
    }

    #[tokio::test]
    async fn test_online_posts_once() {
        let mut transport = MockTransport::new();
        transport.expect_is_online().return_const(true);
        transport
            .expect_post()
            .times(1)
            .returning(|_, _| Err(DeliveryError::Status(503)));

        let result = deliver(&transport, &endpoint(), &json!({"a": 1})).await;
        assert!(matches!(result, Err(DeliveryError::Status(503))));
    }

    fn net_root(interfaces: &[(&str, &str)]) -> tempfile::TempDir {
        let root = tempfile::TempDir::new().expect("temp dir");
        for (name, state) in interfaces {
            let dir = root.path().join("sys/class/net").join(name);
            fs::create_dir_all(&dir).expect("interface dir");
            fs::write(dir.join("operstate"), format!("{state}\n")).expect("operstate");
        }
        root
    }

    #[test]
    fn test_interfaces_online() {
        let up = net_root(&[("lo", "unknown"), ("eth0", "up")]);
        assert!(interfaces_online(up.path()));

        let down = net_root(&[("lo", "unknown"), ("eth0", "down"), ("wlan0", "dormant")]);
        assert!(!interfaces_online(down.path()));

        let tunnel = net_root(&[("tun0", "unknown")]);
        assert!(interfaces_online(tunnel.path()));

        let no_sysfs = tempfile::TempDir::new().expect("temp dir");
        assert!(interfaces_online(no_sysfs.path()));
    }

    #[tokio::test]
    async fn test_http_transport_offline_when_links_down() {
        let root = net_root(&[("lo", "unknown"), ("eth0", "down")]);
        let transport = HttpTransport::new().with_sysfs_root(root.path());
        assert!(!transport.is_online());

        let result = deliver(&transport, &endpoint(), &json!({})).await;
        assert!(matches!(result, Err(DeliveryError::Offline)));
    }

    #[tokio::test]
    async fn test_http_transport_rejects_unconfigured_endpoint() {
        let transport = HttpTransport::new();
        let result = transport.post(&Endpoint::default(), &json!({})).await;
        assert!(matches!(result, Err(DeliveryError::Unconfigured)));
    }
}
