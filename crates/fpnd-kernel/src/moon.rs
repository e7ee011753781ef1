//! Rendezvous (moon) orbit state machine.
//!
//! `NotOrbited -> OrbitRequested -> Polling -> Confirmed | TimedOut`
//!
//! An orbit request goes to each allow-listed moon until one is accepted,
//! then the moon listing is polled once per interval until it returns
//! records or the attempt budget runs out. Parsed records on the allow-list
//! update the node state; any other moon is deorbited.

use crate::exec::ZtCli;
use fpnd_types::config::NodeSettings;
use fpnd_types::error::{FpndError, FpndResult};
use fpnd_types::state::NodeState;
use fpnd_types::status::{MoonEndpoint, MoonRecord};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where the orbit machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrbitState {
    NotOrbited,
    OrbitRequested,
    Polling,
    Confirmed,
    TimedOut,
}

/// Result of one run of [`MoonOrbitController::orbit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrbitOutcome {
    /// An allow-listed moon was confirmed and written to the node state.
    Confirmed(MoonEndpoint),
    /// No usable record arrived in time. The node state is untouched.
    TimedOut,
}

/// Parse moon listing records into `(id, ipv4, port)` entries.
///
/// The first IPv4 endpoint of a record wins and IPv6 endpoints are skipped.
/// A record with no IPv4 endpoint at all ends parsing: only the entries
/// collected before it are returned.
pub fn parse_moon_data(records: &[MoonRecord]) -> Vec<MoonEndpoint> {
    let mut result = Vec::new();
    for record in records {
        let id = record.id.replacen("000000", "", 1);
        let endpoint = record
            .roots
            .iter()
            .flat_map(|root| root.stable_endpoints.iter())
            .find_map(|ep| parse_ipv4_endpoint(ep));

        match endpoint {
            Some((addr, port)) => result.push(MoonEndpoint { id, addr, port }),
            None => {
                warn!(moon_id = %id, "No IPv4 endpoint in moon record, stopping parse");
                return result;
            }
        }
    }
    result
}

fn parse_ipv4_endpoint(endpoint: &str) -> Option<(std::net::Ipv4Addr, u16)> {
    let (ip, port) = endpoint.split_once('/')?;
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => port.parse().ok().map(|p| (addr, p)),
        Ok(IpAddr::V6(_)) => None,
        Err(e) => {
            error!(endpoint, error = %e, "Bad moon endpoint address");
            None
        }
    }
}

/// Drives moon association for a member node.
pub struct MoonOrbitController {
    cli: ZtCli,
    moon_list: Vec<String>,
    settle: Duration,
    poll_interval: Duration,
    max_polls: u64,
    state: Mutex<OrbitState>,
}

impl MoonOrbitController {
    pub fn new(cli: ZtCli, settings: &NodeSettings) -> Self {
        Self {
            cli,
            moon_list: settings.moon_list.clone(),
            settle: Duration::from_secs(settings.moon_settle_secs),
            poll_interval: Duration::from_secs(1),
            max_polls: settings.moon_timeout_secs,
            state: Mutex::new(OrbitState::NotOrbited),
        }
    }

    /// Override the settle delay and poll interval.
    pub fn with_timing(mut self, settle: Duration, poll_interval: Duration) -> Self {
        self.settle = settle;
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> OrbitState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, next: OrbitState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug!(from = ?*state, to = ?next, "Orbit state");
        *state = next;
    }

    /// Request an orbit and wait for moon data; returns the parsed records.
    pub async fn wait_for_moon(&self) -> Vec<MoonEndpoint> {
        for moon in &self.moon_list {
            if self.cli.orbit(moon).await {
                info!(moon_id = %moon, "Orbit requested");
                break;
            }
        }
        self.transition(OrbitState::OrbitRequested);
        tokio::time::sleep(self.settle).await;

        self.transition(OrbitState::Polling);
        let mut count = 0;
        let mut records = self.cli.list_moons().await;
        while records.is_empty() && count < self.max_polls {
            count += 1;
            tokio::time::sleep(self.poll_interval).await;
            records = self.cli.list_moons().await;
            debug!(size = records.len(), "Moon data size");
        }
        debug!(polls = count, "Moon sync done");

        let parsed = parse_moon_data(&records);
        debug!(parsed = ?parsed, "Parsed moon data");
        parsed
    }

    /// Deorbit foreign moons and record an allow-listed one in `state`.
    ///
    /// Fails with [`FpndError::EmptyRendezvousResult`] on an empty slice.
    /// Returns the last allow-listed entry written to `state`, if any.
    pub async fn handle_moon_data(
        &self,
        data: &[MoonEndpoint],
        state: &mut NodeState,
    ) -> FpndResult<Option<MoonEndpoint>> {
        if data.is_empty() {
            return Err(FpndError::EmptyRendezvousResult);
        }

        for moon in data.iter().filter(|m| !self.is_allowed(&m.id)) {
            let ok = self.cli.deorbit(&moon.id).await;
            info!(moon_id = %moon.id, ok, "Deorbited foreign moon");
        }

        let mut confirmed = None;
        for moon in data.iter().filter(|m| self.is_allowed(&m.id)) {
            state.moon_id0 = Some(moon.id.clone());
            state.moon_addr = Some(moon.addr.to_string());
            debug!(moon_id = %moon.id, addr = %moon.addr, "Moon state updated");
            confirmed = Some(moon.clone());
        }
        Ok(confirmed)
    }

    /// Run the whole machine once against `state`.
    pub async fn orbit(&self, state: &mut NodeState) -> FpndResult<OrbitOutcome> {
        self.transition(OrbitState::NotOrbited);
        let data = self.wait_for_moon().await;
        if data.is_empty() {
            warn!("Timed out waiting for moon data");
            self.transition(OrbitState::TimedOut);
            return Ok(OrbitOutcome::TimedOut);
        }

        match self.handle_moon_data(&data, state).await? {
            Some(moon) => {
                info!(moon_id = %moon.id, addr = %moon.addr, "Orbit confirmed");
                self.transition(OrbitState::Confirmed);
                Ok(OrbitOutcome::Confirmed(moon))
            }
            None => {
                warn!("No allow-listed moon in moon data");
                self.transition(OrbitState::TimedOut);
                Ok(OrbitOutcome::TimedOut)
            }
        }
    }

    /// Post-startup check: deorbit once the moon has exchanged a message.
    ///
    /// Returns `None` when there is nothing to deorbit.
    pub async fn verify_and_deorbit(&self, state: &NodeState) -> Option<bool> {
        match (&state.moon_id0, &state.msg_ref) {
            (Some(moon_id), Some(_)) => Some(self.cli.deorbit(moon_id).await),
            _ => None,
        }
    }

    /// Drop the orbit around `moon_id`.
    pub async fn deorbit(&self, moon_id: &str) -> bool {
        self.cli.deorbit(moon_id).await
    }

    fn is_allowed(&self, id: &str) -> bool {
        self.moon_list.iter().any(|m| m == id)
    }
}
