//! The per-cycle reconciliation of node state against the overlay node.
//!
//! One cycle fetches self, peer and network status, loads it into the
//! [`TemporalCache`] under the aging policy, remediates rejected networks,
//! health-checks the exit route, then diffs the node state against the start
//! of the cycle and hands the diff to the [`EventDispatcher`].
//!
//! Cycles never overlap: a cycle started while another is running fails with
//! [`FpndError::CycleInFlight`].

use crate::cache::{KeyType, TemporalCache};
use crate::collaborators::{Messenger, NodeClient, PeerProbe, StatusSink};
use crate::dispatcher::{message_addr, EventDispatcher};
use crate::exec::ZtCli;
use fpnd_types::config::{Mode, NodeSettings, OFFLINE_WAIT};
use fpnd_types::error::{FpndError, FpndResult};
use fpnd_types::state::{Iface, NodeState, StateDiff};
use fpnd_types::status::{NetStatus, NetworkRecord, NetworkStatusCode, PeerRole, StatusMsg};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause between `leave` and `join` when cycling the ad-hoc network.
const ADHOC_NAP: Duration = Duration::from_secs(5);

/// Process-wide node state with snapshot reads and whole-record writes.
#[derive(Debug, Default)]
pub struct SharedState {
    inner: RwLock<NodeState>,
}

impl SharedState {
    pub fn new(state: NodeState) -> Self {
        Self {
            inner: RwLock::new(state),
        }
    }

    pub fn snapshot(&self) -> NodeState {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, state: NodeState) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Apply `f` under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        f(&mut self.inner.write().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Map an unreachable node API to "no data"; pass other errors through.
fn no_data<T>(result: FpndResult<T>) -> FpndResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(FpndError::Connection(e)) => {
            warn!(error = %e, "No data available, cache was NOT updated");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Collaborators a [`StateReconciler`] drives.
pub struct ReconcilerParts {
    pub cache: Arc<TemporalCache>,
    pub state: Arc<SharedState>,
    pub client: Arc<dyn NodeClient>,
    pub cli: ZtCli,
    pub probe: Arc<dyn PeerProbe>,
    pub messenger: Arc<dyn Messenger>,
    pub sink: Arc<dyn StatusSink>,
    pub dispatcher: Arc<EventDispatcher>,
}

/// Runs reconciliation cycles.
pub struct StateReconciler {
    settings: Arc<NodeSettings>,
    cache: Arc<TemporalCache>,
    state: Arc<SharedState>,
    client: Arc<dyn NodeClient>,
    cli: ZtCli,
    probe: Arc<dyn PeerProbe>,
    messenger: Arc<dyn Messenger>,
    sink: Arc<dyn StatusSink>,
    dispatcher: Arc<EventDispatcher>,
    adhoc_nap: Duration,
    last_status: Mutex<Option<StatusMsg>>,
    guard: tokio::sync::Mutex<()>,
}

impl StateReconciler {
    pub fn new(settings: Arc<NodeSettings>, parts: ReconcilerParts) -> Self {
        Self {
            settings,
            cache: parts.cache,
            state: parts.state,
            client: parts.client,
            cli: parts.cli,
            probe: parts.probe,
            messenger: parts.messenger,
            sink: parts.sink,
            dispatcher: parts.dispatcher,
            adhoc_nap: ADHOC_NAP,
            last_status: Mutex::new(None),
            guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Override the pause used when cycling the ad-hoc network.
    pub fn with_adhoc_nap(mut self, nap: Duration) -> Self {
        self.adhoc_nap = nap;
        self
    }

    /// Claim the cycle slot, failing if a cycle is already running.
    pub fn try_exclusive(&self) -> FpndResult<tokio::sync::MutexGuard<'_, ()>> {
        self.guard.try_lock().map_err(|_| FpndError::CycleInFlight)
    }

    /// Run one reconciliation cycle.
    ///
    /// Returns `Ok(None)` when the node had no data for us, otherwise the diff
    /// that was dispatched. Errors abort the rest of the cycle; cache writes
    /// made before the error are kept.
    pub async fn run_cycle(&self) -> FpndResult<Option<StateDiff>> {
        let _slot = self.try_exclusive()?;
        let result = self.cache.with_cache_aging(|| self.refresh()).await;
        if let Err(ref e) = result {
            error!(error = %e, mode = ?self.settings.mode, "Reconciliation cycle failed");
        }
        result
    }

    async fn refresh(&self) -> FpndResult<Option<StateDiff>> {
        let before = self.state.snapshot();
        let mut state = before.clone();

        let Some(status) = no_data(self.client.status().await)? else {
            return Ok(None);
        };
        info!(node_id = %status.address, "Found node");
        state.fpn_id = Some(status.address.clone());
        self.cache.load(KeyType::Node, &status.address, &status)?;

        let outcome = match self.settings.mode {
            Mode::Peer => self.peer_cycle(&mut state).await?,
            Mode::Adhoc => self.adhoc_cycle(&mut state).await?,
        };
        if outcome.is_none() {
            return Ok(None);
        }

        let diff = before.diff(&state);
        self.state.replace(state);
        debug!(changes = diff.len(), "Cycle diff");
        self.dispatcher.dispatch(&diff);
        Ok(Some(diff))
    }

    async fn peer_cycle(&self, state: &mut NodeState) -> FpndResult<Option<()>> {
        let Some(peers) = no_data(self.client.peers().await)? else {
            return Ok(None);
        };
        for peer in &peers {
            self.cache.load(KeyType::Peer, &peer.address, peer)?;
        }

        if state.moon_id0.is_none() {
            for moon in self.cli.list_moons().await {
                self.cache.load(KeyType::Moon, &moon.id, &moon)?;
                debug!(moon_id = %moon.id, roots = moon.roots.len(), "Cached moon");
            }
            let moon_peer = peers
                .iter()
                .find(|p| p.role == PeerRole::Moon && self.settings.is_allowed_moon(&p.address));
            if let Some(peer) = moon_peer {
                self.cache.load(KeyType::MoonState, &peer.address, peer)?;
                state.moon_id0 = Some(peer.address.clone());
                state.moon_addr = peer
                    .best_path()
                    .and_then(|p| p.address.split('/').next())
                    .map(String::from);
                info!(moon_id = %peer.address, addr = ?state.moon_addr, "Found moon peer");
            }
        }

        let Some(networks) = no_data(self.client.networks().await)? else {
            return Ok(None);
        };

        let mut requested = false;
        if networks.is_empty() {
            if state.cfg_ref.is_none() {
                self.request_config(state).await;
                requested = true;
            } else if !self.cache.ticket_active(OFFLINE_WAIT) {
                warn!(cfg_ref = ?state.cfg_ref, "Still no networks after config request");
                self.publish(StatusMsg::Error);
            } else {
                debug!("No networks, waiting on offline ticket");
            }
        }

        let statuses = self.load_networks(&networks, state).await?;
        if statuses.len() < 2 && state.cfg_ref.is_none() && !requested {
            self.request_config(state).await;
        }

        self.check_exit_route(state, &statuses).await;
        Ok(Some(()))
    }

    async fn adhoc_cycle(&self, state: &mut NodeState) -> FpndResult<Option<()>> {
        let Some(networks) = no_data(self.client.networks().await)? else {
            return Ok(None);
        };
        let statuses = self.load_networks(&networks, state).await?;

        let Some(nwid) = self.settings.nwid.as_deref() else {
            warn!("Ad-hoc mode without a network id");
            return Ok(Some(()));
        };
        let Some(net) = statuses.iter().find(|s| s.identity == nwid) else {
            debug!(nwid, "Ad-hoc network not present");
            return Ok(Some(()));
        };
        let Some(addr) = net.probe_addr() else {
            warn!(nwid, "Ad-hoc network has no IPv4 address");
            return Ok(Some(()));
        };

        let reachable = self.probe.is_reachable(addr).await;
        state.route = Some(reachable);
        if reachable {
            debug!(nwid, %addr, "Ad-hoc route ok");
        } else if !self.cache.ticket_active(OFFLINE_WAIT) {
            warn!(nwid, %addr, "Ad-hoc route unreachable, cycling network");
            self.cycle_adhoc_net(nwid).await;
            self.cache.set_ticket(OFFLINE_WAIT, self.settings.offline_wait());
        } else {
            debug!(nwid, "Ad-hoc route unreachable, waiting on offline ticket");
        }
        Ok(Some(()))
    }

    /// Leave then rejoin `nwid`.
    pub async fn cycle_adhoc_net(&self, nwid: &str) {
        for action in ["leave", "join"] {
            let res = self.cli.run(action, &[nwid]).await;
            debug!(action, nwid, result = ?res, "Ad-hoc network action");
            tokio::time::sleep(self.adhoc_nap).await;
        }
    }

    /// Cache network records, remediate rejected networks and rebind the
    /// managed interfaces. Returns the status of every network still usable.
    async fn load_networks(
        &self,
        networks: &[NetworkRecord],
        state: &mut NodeState,
    ) -> FpndResult<Vec<NetStatus>> {
        let mut usable = Vec::new();
        for net in networks {
            self.cache.load(KeyType::Network, &net.id, net)?;
            let status = NetStatus::from_record(net);
            debug!(nwid = %net.id, status = ?status.status, device = ?status.device, "Network");

            if status.status.is_rejected() {
                self.remediate_rejected(&status, state).await;
            } else {
                usable.push(status);
            }
        }

        for iface in Iface::ALL {
            let bound = usable.iter().find(|s| {
                s.status == NetworkStatusCode::Ok
                    && s.device.as_deref().and_then(Iface::from_device) == Some(iface)
            });
            match bound {
                Some(s) => state.set_interface(iface, &s.identity),
                None => state.clear_interface(iface),
            }
        }
        Ok(usable)
    }

    async fn remediate_rejected(&self, net: &NetStatus, state: &mut NodeState) {
        if let Some(iface) = state.iface_for(&net.identity) {
            state.clear_interface(iface);
        }
        if self.cache.ticket_active(OFFLINE_WAIT) {
            debug!(nwid = %net.identity, "Rejected network, waiting on offline ticket");
            return;
        }
        warn!(nwid = %net.identity, status = ?net.status, "Leaving rejected network");
        let res = self.cli.leave(&net.identity).await;
        debug!(nwid = %net.identity, result = ?res, "Leave result");
        self.cache.set_ticket(OFFLINE_WAIT, self.settings.offline_wait());
    }

    async fn check_exit_route(&self, state: &mut NodeState, statuses: &[NetStatus]) {
        let iface = self.settings.exit_iface;
        let Some(nwid) = state.network_for(iface).map(String::from) else {
            warn!(%iface, "No network id found for exit interface");
            return;
        };
        let Some(addr) = statuses
            .iter()
            .find(|s| s.identity == nwid)
            .and_then(NetStatus::probe_addr)
        else {
            warn!(%iface, nwid = %nwid, "No address to check on exit network");
            return;
        };

        let reachable = self.probe.is_reachable(addr).await;
        state.route = Some(reachable);
        if reachable {
            if state.wdg_ref {
                info!(%iface, %addr, "Exit route restored");
                state.wdg_ref = false;
                self.publish(StatusMsg::None);
            }
            return;
        }

        if state.wdg_ref || self.cache.ticket_active(OFFLINE_WAIT) {
            debug!(%iface, %addr, "Exit route unreachable, already handled");
            return;
        }
        error!(%iface, nwid = %nwid, %addr, "Exit route is wedged");
        let node_id = state.fpn_id.clone().unwrap_or_default();
        let msg_addr = message_addr(state, &self.settings);
        match self.messenger.send(&msg_addr, "wedged", &node_id).await {
            Ok(reply) => debug!(reply = ?reply, "Wedged notice sent"),
            Err(e) => warn!(error = %e, "Wedged notice failed"),
        }
        state.wdg_ref = true;
        self.publish(StatusMsg::Error);
    }

    async fn request_config(&self, state: &mut NodeState) {
        let node_id = state.fpn_id.clone().unwrap_or_default();
        let addr = message_addr(state, &self.settings);
        match self.messenger.request_config(&addr, &node_id).await {
            Ok(reply) => {
                info!(addr = %addr, cfg_ref = ?reply, "Requested network config");
                state.cfg_ref = reply;
            }
            Err(e) => warn!(addr = %addr, error = %e, "Config request failed"),
        }
        self.publish(StatusMsg::Waiting);
    }

    /// Publish `msg` unless it is already the current status.
    fn publish(&self, msg: StatusMsg) {
        let mut last = self.last_status.lock().unwrap_or_else(|e| e.into_inner());
        if *last != Some(msg) {
            self.sink.publish(msg);
            *last = Some(msg);
        }
    }
}
