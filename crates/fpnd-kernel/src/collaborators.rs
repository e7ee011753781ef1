//! External collaborators of the reconciliation kernel.
//!
//! Each seam is a trait with one production implementation:
//! - [`NodeClient`]: the overlay node's local status API ([`LocalApiClient`]).
//! - [`PeerProbe`]: route reachability checks ([`PingProbe`]).
//! - [`Messenger`]: request/reply messages to the companion daemons
//!   ([`TcpMessenger`]).
//! - [`StatusSink`]: the published `NONE | WAITING | ERROR` word
//!   ([`FileStatusSink`]).

use crate::exec::CommandExecutor;
use async_trait::async_trait;
use fpnd_types::config::NodeSettings;
use fpnd_types::error::{FpndError, FpndResult};
use fpnd_types::status::{NetworkRecord, NodeStatus, PeerRecord, StatusMsg};
use serde::de::DeserializeOwned;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// Read access to the local overlay node's status.
///
/// Transport failures are reported as [`FpndError::Connection`].
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn status(&self) -> FpndResult<NodeStatus>;
    async fn peers(&self) -> FpndResult<Vec<PeerRecord>>;
    async fn networks(&self) -> FpndResult<Vec<NetworkRecord>>;
}

/// HTTP client for the overlay daemon's local JSON API.
pub struct LocalApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl LocalApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> FpndResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| FpndError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Build a client using the auth token in the overlay daemon's home.
    pub fn from_settings(settings: &NodeSettings) -> FpndResult<Self> {
        let token_path = settings.zt_home.join("authtoken.secret");
        let token = std::fs::read_to_string(&token_path).map_err(|e| {
            FpndError::Config(format!("cannot read {}: {e}", token_path.display()))
        })?;
        Self::new(&settings.api_url, token.trim())
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> FpndResult<T> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let resp = self
            .http
            .get(&url)
            .header("X-ZT1-Auth", &self.token)
            .send()
            .await
            .map_err(|e| FpndError::Connection(format!("{endpoint}: {e}")))?;
        if !resp.status().is_success() {
            return Err(FpndError::Connection(format!(
                "{endpoint}: HTTP {}",
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| FpndError::Decode(format!("{endpoint}: {e}")))
    }
}

#[async_trait]
impl NodeClient for LocalApiClient {
    async fn status(&self) -> FpndResult<NodeStatus> {
        self.get("status").await
    }

    async fn peers(&self) -> FpndResult<Vec<PeerRecord>> {
        self.get("peer").await
    }

    async fn networks(&self) -> FpndResult<Vec<NetworkRecord>> {
        self.get("network").await
    }
}

/// Checks whether a route to an address is usable.
#[async_trait]
pub trait PeerProbe: Send + Sync {
    async fn is_reachable(&self, addr: Ipv4Addr) -> bool;
}

/// Single ICMP echo via the system `ping`.
pub struct PingProbe {
    executor: Arc<dyn CommandExecutor>,
}

impl PingProbe {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl PeerProbe for PingProbe {
    async fn is_reachable(&self, addr: Ipv4Addr) -> bool {
        let args: Vec<String> = ["-c", "1", "-W", "2"]
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(addr.to_string()))
            .collect();
        match self.executor.exec("ping", &args).await {
            Ok(out) => {
                debug!(%addr, reachable = out.success(), "Peer check");
                out.success()
            }
            Err(e) => {
                warn!(%addr, error = %e, "Peer check could not run");
                false
            }
        }
    }
}

/// Request/reply messaging with the companion daemons.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send `method` on behalf of `node_id` and return the reply text, if any.
    async fn send(&self, addr: &str, method: &str, node_id: &str) -> FpndResult<Option<String>>;

    /// Announce this node ("hey, this is my id"); the reply is the message
    /// reference.
    async fn announce(&self, addr: &str, node_id: &str) -> FpndResult<Option<String>> {
        self.send(addr, "echo", node_id).await
    }

    /// Ask for network configuration; the reply is the request reference.
    async fn request_config(&self, addr: &str, node_id: &str) -> FpndResult<Option<String>> {
        self.send(addr, "cfg", node_id).await
    }
}

/// One JSON line out, one JSON line back, over TCP.
pub struct TcpMessenger {
    port: u16,
    timeout: Duration,
}

impl TcpMessenger {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl Messenger for TcpMessenger {
    async fn send(&self, addr: &str, method: &str, node_id: &str) -> FpndResult<Option<String>> {
        let exchange = async {
            let mut stream = tokio::net::TcpStream::connect((addr, self.port)).await?;
            let mut line = serde_json::to_string(&serde_json::json!({
                "method": method,
                "id": node_id,
            }))?;
            line.push('\n');
            stream.write_all(line.as_bytes()).await?;
            let mut reply = String::new();
            BufReader::new(stream).read_line(&mut reply).await?;
            Ok::<_, FpndError>(reply)
        };

        let reply = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| FpndError::Messaging(format!("{method} to {addr} timed out")))??;
        debug!(addr, method, reply = %reply.trim(), "Message reply");
        Ok(parse_reply(&reply))
    }
}

/// Extract the `result` field of a JSON reply, else the raw trimmed line.
fn parse_reply(reply: &str) -> Option<String> {
    let reply = reply.trim();
    if reply.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(serde_json::Value::Object(map)) => map
            .get("result")
            .and_then(|v| v.as_str())
            .map(String::from),
        _ => Some(reply.to_string()),
    }
}

/// Receives the published agent status.
pub trait StatusSink: Send + Sync {
    fn publish(&self, msg: StatusMsg);
}

/// Writes the status word to a file for the external reporter.
pub struct FileStatusSink {
    path: PathBuf,
}

impl FileStatusSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatusSink for FileStatusSink {
    fn publish(&self, msg: StatusMsg) {
        if let Err(e) = std::fs::write(&self.path, msg.to_string()) {
            warn!(path = %self.path.display(), error = %e, "Failed to publish status");
        } else {
            debug!(status = %msg, "Published status");
        }
    }
}
