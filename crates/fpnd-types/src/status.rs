//! Status records reported by the overlay node's local API and CLI.
//!
//! Field names follow the JSON the overlay daemon emits (camelCase).

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Published agent status, consumed by the external status reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusMsg {
    None,
    Waiting,
    Error,
}

impl std::fmt::Display for StatusMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Waiting => write!(f, "WAITING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Self status of the local overlay node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// 10-hex-digit node address.
    pub address: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub version: Option<String>,
}

/// Role of a peer as reported by the overlay daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeerRole {
    Leaf,
    /// Rendezvous node.
    Moon,
    Planet,
    #[serde(other)]
    Other,
}

/// A physical path to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPath {
    /// `ip/port` endpoint.
    pub address: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub preferred: bool,
}

/// One entry of the peer list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub address: String,
    pub role: PeerRole,
    #[serde(default)]
    pub latency: i64,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: Vec<PeerPath>,
}

impl PeerRecord {
    /// The preferred active path, else the first active one.
    pub fn best_path(&self) -> Option<&PeerPath> {
        self.paths
            .iter()
            .find(|p| p.active && p.preferred)
            .or_else(|| self.paths.iter().find(|p| p.active))
    }
}

/// Network status code as reported by the overlay daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkStatusCode {
    Ok,
    RequestingConfiguration,
    AccessDenied,
    NotFound,
    PortError,
    ClientTooOld,
    #[serde(other)]
    Unknown,
}

impl NetworkStatusCode {
    /// Statuses that mean the network will never come up as configured.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::NotFound | Self::AccessDenied)
    }
}

/// A route pushed by the network controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub target: String,
    #[serde(default)]
    pub via: Option<String>,
}

/// One entry of the network list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRecord {
    pub id: String,
    /// Same value as `id`; the daemon sends both keys.
    #[serde(default)]
    pub nwid: Option<String>,
    #[serde(default)]
    pub name: String,
    pub status: NetworkStatusCode,
    #[serde(default)]
    pub port_device_name: Option<String>,
    #[serde(default)]
    pub assigned_addresses: Vec<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub mac: Option<String>,
}

/// Per-network status derived from a [`NetworkRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetStatus {
    /// Network id.
    pub identity: String,
    pub status: NetworkStatusCode,
    /// Local device name, e.g. `fpn0`.
    pub device: Option<String>,
    /// Our IPv4 address on this network.
    pub address: Option<Ipv4Addr>,
    /// Next hop of the default route, when the network provides one.
    pub gateway: Option<Ipv4Addr>,
    pub mac: Option<String>,
}

impl NetStatus {
    pub fn from_record(net: &NetworkRecord) -> Self {
        let address = net
            .assigned_addresses
            .iter()
            .find_map(|a| find_ipv4_iface(a));
        let gateway = net
            .routes
            .iter()
            .filter(|r| r.target == "0.0.0.0/0")
            .find_map(|r| r.via.as_deref().and_then(|v| v.parse().ok()));
        Self {
            identity: net.id.clone(),
            status: net.status,
            device: net.port_device_name.clone(),
            address,
            gateway,
            mac: net.mac.clone(),
        }
    }

    /// Address a reachability check should target: the gateway, else our own.
    pub fn probe_addr(&self) -> Option<Ipv4Addr> {
        self.gateway.or(self.address)
    }
}

/// One root of a moon definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoonRoot {
    #[serde(default)]
    pub identity: Option<String>,
    /// `ip/port` endpoints.
    #[serde(default)]
    pub stable_endpoints: Vec<String>,
}

/// One entry of the `listmoons` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoonRecord {
    /// World id, zero-padded to 16 hex digits.
    pub id: String,
    #[serde(default)]
    pub roots: Vec<MoonRoot>,
    #[serde(default)]
    pub waiting: bool,
}

/// A parsed moon: id plus its IPv4 endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoonEndpoint {
    pub id: String,
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Pick the IPv4 address out of a CIDR string such as `192.168.1.10/24`.
pub fn find_ipv4_iface(cidr: &str) -> Option<Ipv4Addr> {
    let (ip, prefix) = cidr.split_once('/').unwrap_or((cidr, "32"));
    let prefix: u8 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    ip.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_ipv4_iface() {
        assert_eq!(
            find_ipv4_iface("192.168.1.10/24"),
            Some(Ipv4Addr::new(192, 168, 1, 10))
        );
        assert_eq!(find_ipv4_iface("fc00::1/88"), None);
        assert_eq!(find_ipv4_iface("10.0.0.1/40"), None);
    }

    #[test]
    fn test_network_record_decode() {
        let raw = r#"{
            "id": "b6079f73c63cea29",
            "nwid": "b6079f73c63cea29",
            "name": "fpn-exit",
            "status": "NOT_FOUND",
            "portDeviceName": "fpn0",
            "assignedAddresses": ["fcfb::1/40", "10.244.0.7/16"],
            "routes": [{"target": "0.0.0.0/0", "via": "10.244.0.1"}]
        }"#;
        let net: NetworkRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(net.id, "b6079f73c63cea29");
        assert_eq!(net.nwid.as_deref(), Some("b6079f73c63cea29"));
        assert!(net.status.is_rejected());

        let st = NetStatus::from_record(&net);
        assert_eq!(st.device.as_deref(), Some("fpn0"));
        assert_eq!(st.address, Some(Ipv4Addr::new(10, 244, 0, 7)));
        assert_eq!(st.probe_addr(), Some(Ipv4Addr::new(10, 244, 0, 1)));
    }

    #[test]
    fn test_network_list_as_the_daemon_sends_it() {
        let raw = r#"[{
            "allowDefault": false,
            "allowGlobal": false,
            "allowManaged": true,
            "assignedAddresses": ["10.244.0.7/16"],
            "bridge": false,
            "broadcastEnabled": true,
            "dhcp": false,
            "id": "b6079f73c63cea29",
            "mac": "5e:9a:1d:22:41:07",
            "mtu": 2800,
            "multicastSubscriptions": [{"adi": 4294967295, "mac": "ff:ff:ff:ff:ff:ff"}],
            "name": "fpn-exit",
            "netconfRevision": 12,
            "nwid": "b6079f73c63cea29",
            "portDeviceName": "fpn0",
            "portError": 0,
            "routes": [
                {"flags": 0, "metric": 0, "target": "10.244.0.0/16", "via": null},
                {"flags": 0, "metric": 0, "target": "0.0.0.0/0", "via": "10.244.0.1"}
            ],
            "status": "OK",
            "type": "PRIVATE"
        }]"#;
        let nets: Vec<NetworkRecord> = serde_json::from_str(raw).unwrap();
        assert_eq!(nets.len(), 1);
        let st = NetStatus::from_record(&nets[0]);
        assert_eq!(st.identity, "b6079f73c63cea29");
        assert_eq!(st.status, NetworkStatusCode::Ok);
        assert_eq!(st.gateway, Some(Ipv4Addr::new(10, 244, 0, 1)));
        assert_eq!(st.mac.as_deref(), Some("5e:9a:1d:22:41:07"));
    }

    #[test]
    fn test_unknown_status_code() {
        let code: NetworkStatusCode = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(code, NetworkStatusCode::Unknown);
        assert!(!code.is_rejected());
    }

    #[test]
    fn test_peer_best_path() {
        let raw = r#"{"address":"4f4114472a","role":"MOON","paths":[
            {"address":"1.2.3.4/9993","active":true,"preferred":false},
            {"address":"5.6.7.8/9993","active":true,"preferred":true}]}"#;
        let peer: PeerRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(peer.role, PeerRole::Moon);
        assert_eq!(peer.best_path().unwrap().address, "5.6.7.8/9993");
    }

    #[test]
    fn test_status_msg_display() {
        assert_eq!(StatusMsg::Waiting.to_string(), "WAITING");
        assert_eq!(serde_json::to_string(&StatusMsg::Error).unwrap(), "\"ERROR\"");
    }
}
