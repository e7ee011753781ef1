//! Node agent settings.
//!
//! `NodeSettings` is built once at startup (see `fpnd_kernel::config`) and
//! handed to every component by reference. Every field has a default so a
//! partial TOML file is always accepted.

use crate::state::Iface;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Name of the wait ticket that suppresses repeated leave/notify actions.
pub const OFFLINE_WAIT: &str = "offline_wait";

/// Role this node plays in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Rendezvous (relay) node other members orbit.
    Moon,
    /// Routes and subscribes to control messages, not a traffic exit.
    Controller,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Moon => write!(f, "moon"),
            Self::Controller => write!(f, "controller"),
        }
    }
}

/// Reconciliation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Full member: peers, rendezvous and two managed networks.
    #[default]
    Peer,
    /// Single configured network, no rendezvous machinery.
    Adhoc,
}

/// Settings for one node agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Maximum age of cached state before the whole cache is evicted.
    pub max_cache_age_secs: u64,
    /// Send messages to the loopback address instead of the moon.
    pub use_localhost: bool,
    /// Node role; `None` for a plain member node.
    pub node_role: Option<NodeRole>,
    /// Reconciliation mode.
    pub mode: Mode,
    /// Allow-list of moon ids this node may orbit.
    pub moon_list: Vec<String>,
    /// Directory holding the messaging daemon scripts and `bin/` net scripts.
    pub home_dir: Option<PathBuf>,
    /// Network id used in ad-hoc mode.
    pub nwid: Option<String>,
    /// Interface whose network is health-checked as the traffic exit.
    pub exit_iface: Iface,
    /// Lifetime of the `offline_wait` ticket.
    pub offline_wait_secs: u64,
    /// Upper bound on rendezvous polling after an orbit request.
    pub moon_timeout_secs: u64,
    /// Pause between an orbit request and the first listing poll.
    pub moon_settle_secs: u64,
    /// Delay before a deferred job becomes due.
    pub job_delay_secs: u64,
    /// Interval between reconciliation cycles in `fpnd run`.
    pub cycle_interval_secs: u64,
    /// Overlay command-line tool.
    pub zt_cli: String,
    /// Local overlay status API base URL.
    pub api_url: String,
    /// Overlay daemon home (auth token, moons.d, controller.d).
    pub zt_home: PathBuf,
    /// TCP port of the companion messaging daemons.
    pub msg_port: u16,
    /// File the published status word is written to.
    pub state_file: PathBuf,
    /// Enable debug logging.
    pub debug: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            max_cache_age_secs: 60,
            use_localhost: true,
            node_role: None,
            mode: Mode::Peer,
            moon_list: vec!["4f4114472a".to_string()],
            home_dir: None,
            nwid: None,
            exit_iface: Iface::Fpn0,
            offline_wait_secs: 75,
            moon_timeout_secs: 15,
            moon_settle_secs: 2,
            job_delay_secs: 1,
            cycle_interval_secs: 30,
            zt_cli: "zerotier-cli".to_string(),
            api_url: "http://127.0.0.1:9993".to_string(),
            zt_home: default_zt_home(),
            msg_port: 9443,
            state_file: std::env::temp_dir().join("fpnd.state"),
            debug: false,
        }
    }
}

impl NodeSettings {
    pub fn max_cache_age(&self) -> Duration {
        Duration::from_secs(self.max_cache_age_secs)
    }

    pub fn offline_wait(&self) -> Duration {
        Duration::from_secs(self.offline_wait_secs)
    }

    pub fn job_delay(&self) -> Duration {
        Duration::from_secs(self.job_delay_secs)
    }

    /// Whether `id` is on the moon allow-list.
    pub fn is_allowed_moon(&self, id: &str) -> bool {
        self.moon_list.iter().any(|m| m == id)
    }
}

/// Platform default for the overlay daemon's home directory.
pub fn default_zt_home() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/Library/Application Support/ZeroTier/One")
    } else if cfg!(any(target_os = "freebsd", target_os = "openbsd")) {
        PathBuf::from("/var/db/zerotier-one")
    } else if cfg!(windows) {
        PathBuf::from("C:\\ProgramData\\ZeroTier\\One")
    } else {
        PathBuf::from("/var/lib/zerotier-one")
    }
}
