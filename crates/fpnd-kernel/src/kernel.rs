//! FpndKernel: assembles the control-plane components and owns the node
//! agent's lifecycle (startup, periodic run loop, cleanup, forced shutdown).

use crate::cache::TemporalCache;
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    FileStatusSink, LocalApiClient, Messenger, NodeClient, PeerProbe, PingProbe, StatusSink,
    TcpMessenger,
};
use crate::config::{detect_role, validate_role};
use crate::dispatcher::{message_addr, EventDispatcher, NET_CHANGE};
use crate::error::{in_phase, KernelError, KernelResult, StartupPhase};
use crate::exec::{CommandExecutor, ProcessExecutor, ZtCli};
use crate::moon::{MoonOrbitController, OrbitOutcome};
use crate::reconciler::{ReconcilerParts, SharedState, StateReconciler};
use crate::supervisor::{
    DaemonSupervisor, ForceStopReport, Signaller, UnixSignaller, DEFAULT_KILL_INTERVAL,
};
use fpnd_types::config::{Mode, NodeRole, NodeSettings};
use fpnd_types::error::{FpndError, FpndResult};
use fpnd_types::state::{Iface, NodeState, StateDiff};
use fpnd_types::status::StatusMsg;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Timeout for one request/reply exchange with a messaging daemon.
const MSG_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval at which the run loop drains due jobs.
const JOB_TICK: Duration = Duration::from_secs(1);

/// External collaborators the kernel runs against.
pub struct Collaborators {
    pub executor: Arc<dyn CommandExecutor>,
    pub client: Arc<dyn NodeClient>,
    pub probe: Arc<dyn PeerProbe>,
    pub messenger: Arc<dyn Messenger>,
    pub sink: Arc<dyn StatusSink>,
    pub signaller: Arc<dyn Signaller>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Real processes, the local node API, TCP messaging and the status file.
    pub fn system(settings: &NodeSettings) -> KernelResult<Self> {
        let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessExecutor);
        let client = LocalApiClient::from_settings(settings)
            .map_err(|e| KernelError::BootFailed(e.to_string()))?;
        Ok(Self {
            probe: Arc::new(PingProbe::new(executor.clone())),
            executor,
            client: Arc::new(client),
            messenger: Arc::new(TcpMessenger::new(settings.msg_port, MSG_TIMEOUT)),
            sink: Arc::new(FileStatusSink::new(&settings.state_file)),
            signaller: Arc::new(UnixSignaller),
            clock: Arc::new(SystemClock),
        })
    }
}

/// Sleep lengths used by the bounded waits.
#[derive(Debug, Clone, Copy)]
pub struct KernelTiming {
    pub moon_settle: Duration,
    pub moon_poll: Duration,
    pub adhoc_nap: Duration,
    pub kill_interval: Duration,
}

impl KernelTiming {
    pub fn from_settings(settings: &NodeSettings) -> Self {
        Self {
            moon_settle: Duration::from_secs(settings.moon_settle_secs),
            moon_poll: Duration::from_secs(1),
            adhoc_nap: Duration::from_secs(5),
            kill_interval: DEFAULT_KILL_INTERVAL,
        }
    }

    /// No sleeping at all.
    pub fn immediate() -> Self {
        Self {
            moon_settle: Duration::ZERO,
            moon_poll: Duration::ZERO,
            adhoc_nap: Duration::ZERO,
            kill_interval: Duration::ZERO,
        }
    }
}

/// What [`FpndKernel::startup`] did.
#[derive(Debug, Clone)]
pub struct StartupReport {
    /// Diff of the first cycle, `None` if the node had no data.
    pub diff: Option<StateDiff>,
    pub role: Option<NodeRole>,
    /// Set when an orbit was attempted.
    pub orbit: Option<OrbitOutcome>,
    pub announced: bool,
}

/// The node agent.
pub struct FpndKernel {
    settings: Arc<NodeSettings>,
    role: RwLock<Option<NodeRole>>,
    cache: Arc<TemporalCache>,
    state: Arc<SharedState>,
    cli: ZtCli,
    client: Arc<dyn NodeClient>,
    messenger: Arc<dyn Messenger>,
    sink: Arc<dyn StatusSink>,
    dispatcher: Arc<EventDispatcher>,
    reconciler: StateReconciler,
    moon: MoonOrbitController,
    supervisor: DaemonSupervisor,
}

impl FpndKernel {
    /// Boot against the real system.
    pub fn boot(settings: NodeSettings) -> KernelResult<Self> {
        let collaborators = Collaborators::system(&settings)?;
        let timing = KernelTiming::from_settings(&settings);
        Ok(Self::with_collaborators(settings, collaborators, timing))
    }

    pub fn with_collaborators(
        settings: NodeSettings,
        c: Collaborators,
        timing: KernelTiming,
    ) -> Self {
        let role = settings.node_role.or_else(|| detect_role(&settings.zt_home));
        info!(role = ?role, mode = ?settings.mode, "Booting fpnd kernel");

        let settings = Arc::new(settings);
        let cli = ZtCli::new(c.executor.clone(), settings.zt_cli.clone());
        let cache = Arc::new(TemporalCache::new(settings.max_cache_age(), c.clock.clone()));
        let state = Arc::new(SharedState::default());
        let dispatcher = Arc::new(EventDispatcher::new(
            &settings,
            c.clock.clone(),
            c.executor.clone(),
            c.messenger.clone(),
        ));
        let reconciler = StateReconciler::new(
            settings.clone(),
            ReconcilerParts {
                cache: cache.clone(),
                state: state.clone(),
                client: c.client.clone(),
                cli: cli.clone(),
                probe: c.probe,
                messenger: c.messenger.clone(),
                sink: c.sink.clone(),
                dispatcher: dispatcher.clone(),
            },
        )
        .with_adhoc_nap(timing.adhoc_nap);
        let moon = MoonOrbitController::new(cli.clone(), &settings)
            .with_timing(timing.moon_settle, timing.moon_poll);
        let supervisor = DaemonSupervisor::new(c.executor, settings.home_dir.clone(), c.signaller)
            .with_kill_interval(timing.kill_interval);

        Self {
            settings,
            role: RwLock::new(role),
            cache,
            state,
            cli,
            client: c.client,
            messenger: c.messenger,
            sink: c.sink,
            dispatcher,
            reconciler,
            moon,
            supervisor,
        }
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn role(&self) -> Option<NodeRole> {
        *self.role.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> NodeState {
        self.state.snapshot()
    }

    pub fn cache(&self) -> &TemporalCache {
        &self.cache
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn supervisor(&self) -> &DaemonSupervisor {
        &self.supervisor
    }

    /// Run one reconciliation cycle.
    pub async fn run_cycle(&self) -> KernelResult<Option<StateDiff>> {
        Ok(self.reconciler.run_cycle().await?)
    }

    /// Run every job whose delay has passed.
    ///
    /// A reply to the announcement becomes the node's message reference.
    pub async fn run_due_jobs(&self) -> usize {
        let ok = self.dispatcher.run_due().await;
        if let Some(msg_ref) = self.dispatcher.take_msg_ref() {
            debug!(msg_ref = %msg_ref, "Recorded message reference");
            self.state.update(|s| s.msg_ref = Some(msg_ref));
        }
        ok
    }

    /// First cycle, role checks, daemon bring-up, orbit and announcement.
    pub async fn startup(&self) -> KernelResult<StartupReport> {
        if self.settings.mode == Mode::Adhoc {
            in_phase(StartupPhase::AdhocJoin, self.adhoc_join().await)?;
        }

        let diff = in_phase(StartupPhase::FirstCycle, self.reconciler.run_cycle().await)?;
        if diff.is_none() {
            warn!("No node data on startup");
        }

        let state = self.state.snapshot();
        let role = validate_role(&state, &self.settings, self.role());
        *self.role.write().unwrap_or_else(|e| e.into_inner()) = role;
        info!(role = ?role, "STARTUP: role validated");

        if let Some(role) = role {
            self.supervisor.start_role_daemons(role).await;
        }

        let mut report = StartupReport {
            diff,
            role,
            orbit: None,
            announced: false,
        };
        if self.settings.mode != Mode::Peer {
            return Ok(report);
        }

        if role.is_none() && state.moon_id0.is_none() {
            report.orbit = Some(in_phase(StartupPhase::Orbit, self.orbit_once().await)?);
        }

        let state = self.state.snapshot();
        report.announced = self
            .dispatcher
            .announce(state.fpn_id.as_deref(), &message_addr(&state, &self.settings));
        Ok(report)
    }

    /// Join the configured ad-hoc network unless the node already has it.
    async fn adhoc_join(&self) -> FpndResult<()> {
        let nwid = self
            .settings
            .nwid
            .as_deref()
            .ok_or_else(|| FpndError::Config("ad-hoc mode needs a network id".to_string()))?;
        let present = match self.client.networks().await {
            Ok(nets) => nets.iter().any(|n| n.id == nwid),
            Err(FpndError::Connection(e)) => {
                warn!(error = %e, "Node API unreachable, joining anyway");
                false
            }
            Err(e) => return Err(e),
        };
        if !present {
            info!(nwid, "STARTUP: joining ad-hoc network");
            self.cli.join(nwid).await;
        }
        Ok(())
    }

    /// Run the orbit state machine once and record a confirmed moon.
    pub async fn orbit(&self) -> KernelResult<OrbitOutcome> {
        Ok(self.orbit_once().await?)
    }

    async fn orbit_once(&self) -> FpndResult<OrbitOutcome> {
        let _slot = self.reconciler.try_exclusive()?;
        let mut state = self.state.snapshot();
        let outcome = self.moon.orbit(&mut state).await?;
        self.state.replace(state);
        Ok(outcome)
    }

    /// Deorbit once the moon has exchanged a message with us.
    pub async fn verify_and_deorbit(&self) -> Option<bool> {
        let result = self.moon.verify_and_deorbit(&self.state.snapshot()).await;
        debug!(result = ?result, "Post-startup deorbit check");
        result
    }

    /// Role-specific teardown.
    ///
    /// Moons and controllers stop their daemons. Member nodes bring their
    /// interfaces down, leave their networks, and deorbit with an `offline`
    /// notice when they have a moon.
    pub async fn cleanup(&self) {
        let cancelled = self.dispatcher.cancel_tag(NET_CHANGE);
        debug!(cancelled, "CLEANUP: dropped pending net jobs");

        match self.role() {
            Some(role) => self.supervisor.stop_role_daemons(role).await,
            None => self.member_teardown().await,
        }
    }

    async fn member_teardown(&self) {
        let state = self.state.snapshot();
        for iface in Iface::ALL {
            let Some(nwid) = state.network_for(iface) else {
                continue;
            };
            self.sink.publish(StatusMsg::None);
            info!(%iface, "CLEANUP: shutting down");
            let ok = self.dispatcher.run_net_command_now(iface, false).await;
            debug!(%iface, ok, "CLEANUP: shutdown returned");
            let res = self.cli.leave(nwid).await;
            debug!(%iface, nwid, result = ?res, "CLEANUP: leave returned");
            self.state.update(|s| s.clear_interface(iface));
        }

        if let Some(moon_id) = state.moon_id0.as_deref() {
            self.moon.deorbit(moon_id).await;
            let addr = message_addr(&state, &self.settings);
            let node_id = state.fpn_id.clone().unwrap_or_default();
            match self.messenger.send(&addr, "offline", &node_id).await {
                Ok(reply) => debug!(reply = ?reply, "CLEANUP: offline reply"),
                Err(e) => warn!(error = %e, "CLEANUP: offline notice failed"),
            }
        }
    }

    /// Force `pid` to exit.
    pub async fn shutdown(&self, pid: i32) -> ForceStopReport {
        self.supervisor.force_stop(pid).await
    }

    /// Cycle every `cycle_interval_secs` and drain due jobs every second
    /// until `shutdown` flips, then clean up.
    ///
    /// Overlapping ticks are skipped. Any other cycle error ends the loop
    /// after cleanup and is returned.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> KernelResult<()> {
        let mut cycle_tick =
            tokio::time::interval(Duration::from_secs(self.settings.cycle_interval_secs.max(1)));
        let mut job_tick = tokio::time::interval(JOB_TICK);
        info!(
            interval_secs = self.settings.cycle_interval_secs,
            "Starting reconciliation loop"
        );

        let result = loop {
            tokio::select! {
                _ = cycle_tick.tick() => {
                    match self.reconciler.run_cycle().await {
                        Ok(_) => {}
                        Err(FpndError::CycleInFlight) => debug!("Skipping tick (busy)"),
                        Err(e) => break Err(KernelError::from(e)),
                    }
                }
                _ = job_tick.tick() => {
                    self.run_due_jobs().await;
                    self.cache.evict_expired();
                }
                _ = shutdown.changed() => {
                    info!("Reconciliation loop: shutdown signal received");
                    break Ok(());
                }
            }
        };

        if let Err(ref e) = result {
            error!(error = %e, "Reconciliation loop stopped");
        }
        self.cleanup().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::supervisor::{RESPONDER, SUBSCRIBER};
    use crate::testing::{
        MockExecutor, MockMessenger, MockNodeClient, MockProbe, MockSignaller, RecordingSink,
    };
    use chrono::Utc;
    use fpnd_types::status::{NetworkRecord, NetworkStatusCode, Route};

    const NODE: &str = "abcdef0123";
    const MOON: &str = "4f4114472a";

    struct Harness {
        _home: tempfile::TempDir,
        clock: Arc<ManualClock>,
        exec: Arc<MockExecutor>,
        client: Arc<MockNodeClient>,
        messenger: Arc<MockMessenger>,
        sink: Arc<RecordingSink>,
        kernel: FpndKernel,
    }

    fn harness(mut settings: NodeSettings) -> Harness {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir(home.path().join("bin")).unwrap();
        for s in ["fpn0-setup.sh", "fpn0-down.sh", RESPONDER, SUBSCRIBER] {
            let path = if s.ends_with(".py") {
                home.path().join(s)
            } else {
                home.path().join("bin").join(s)
            };
            std::fs::write(path, "#!/bin/sh\n").unwrap();
        }
        settings.home_dir = Some(home.path().to_path_buf());
        settings.zt_home = home.path().join("zt");

        let exec = Arc::new(MockExecutor::new());
        let client = Arc::new(MockNodeClient::online(NODE));
        let messenger = Arc::new(MockMessenger::new());
        let sink = Arc::new(RecordingSink::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kernel = FpndKernel::with_collaborators(
            settings,
            Collaborators {
                executor: exec.clone(),
                client: client.clone(),
                probe: Arc::new(MockProbe::new()),
                messenger: messenger.clone(),
                sink: sink.clone(),
                signaller: Arc::new(MockSignaller::new(3)),
                clock: clock.clone(),
            },
            KernelTiming::immediate(),
        );
        Harness {
            _home: home,
            clock,
            exec,
            client,
            messenger,
            sink,
            kernel,
        }
    }

    fn exit_network() -> NetworkRecord {
        NetworkRecord {
            id: "b6079f73c63cea29".into(),
            nwid: None,
            name: "exit".into(),
            status: NetworkStatusCode::Ok,
            port_device_name: Some("fpn0".into()),
            assigned_addresses: vec!["10.1.0.5/24".into()],
            routes: vec![Route {
                target: "0.0.0.0/0".into(),
                via: Some("10.1.0.1".into()),
            }],
            mac: None,
        }
    }

    #[tokio::test]
    async fn test_member_startup_orbits_and_announces() {
        let h = harness(NodeSettings {
            moon_timeout_secs: 0,
            ..Default::default()
        });
        h.exec.respond("zerotier-cli orbit 4f4114472a 4f4114472a", "200 orbit OK");
        h.exec.respond(
            "zerotier-cli listmoons",
            r#"[{"id":"0000004f4114472a","roots":[{"stableEndpoints":["1.2.3.4/9993"]}]}]"#,
        );

        let report = h.kernel.startup().await.unwrap();
        assert_eq!(report.role, None);
        assert!(matches!(report.orbit, Some(OrbitOutcome::Confirmed(ref m)) if m.id == MOON));
        assert!(report.announced);
        assert_eq!(h.kernel.state().moon_id0.as_deref(), Some(MOON));
    }

    #[tokio::test]
    async fn test_answered_announcement_enables_deorbit() {
        let h = harness(NodeSettings::default());
        h.exec.respond("zerotier-cli orbit 4f4114472a 4f4114472a", "200 orbit OK");
        h.exec.respond(
            "zerotier-cli listmoons",
            r#"[{"id":"0000004f4114472a","roots":[{"stableEndpoints":["1.2.3.4/9993"]}]}]"#,
        );
        h.exec.respond("zerotier-cli deorbit 4f4114472a", "200 deorbit OK");
        h.messenger.reply("echo", "ref-1");

        h.kernel.startup().await.unwrap();
        assert_eq!(h.kernel.verify_and_deorbit().await, None);

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.kernel.run_due_jobs().await, 1);
        assert_eq!(h.kernel.state().msg_ref.as_deref(), Some("ref-1"));
        assert_eq!(h.kernel.verify_and_deorbit().await, Some(true));
    }

    #[tokio::test]
    async fn test_moon_startup_starts_daemons() {
        let h = harness(NodeSettings {
            moon_list: vec![NODE.to_string()],
            ..Default::default()
        });
        let home = h.kernel.settings().home_dir.clone().unwrap();
        let status_cmd = |s: &str| format!("{} status", home.join(s).display());
        h.exec.respond(&status_cmd(RESPONDER), "False");
        h.exec.respond(&status_cmd(SUBSCRIBER), "True");

        let report = h.kernel.startup().await.unwrap();
        assert_eq!(report.role, Some(NodeRole::Moon));
        assert!(report.orbit.is_none());
        assert_eq!(h.exec.count(&format!("{} start", home.join(RESPONDER).display())), 1);
        assert_eq!(h.exec.count(&format!("{} start", home.join(SUBSCRIBER).display())), 0);
    }

    #[tokio::test]
    async fn test_member_cleanup_tears_down() {
        let h = harness(NodeSettings::default());
        h.client.set_networks(vec![exit_network()]);
        h.kernel.run_cycle().await.unwrap();
        h.kernel.state.update(|s| {
            s.moon_id0 = Some(MOON.into());
            s.moon_addr = Some("1.2.3.4".into());
        });
        assert_eq!(h.kernel.dispatcher().queue().len(), 1);

        h.kernel.cleanup().await;
        let home = h.kernel.settings().home_dir.clone().unwrap();
        let calls = h.exec.calls();
        assert!(calls.contains(&home.join("bin/fpn0-down.sh").display().to_string()));
        assert!(calls.contains(&"zerotier-cli leave b6079f73c63cea29".to_string()));
        assert!(calls.contains(&"zerotier-cli deorbit 4f4114472a".to_string()));
        assert!(h.messenger.methods().contains(&"offline".to_string()));
        assert!(h.sink.published().contains(&StatusMsg::None));
        assert!(h.kernel.dispatcher().queue().is_empty());
        assert!(!h.kernel.state().fpn0);
    }

    #[tokio::test]
    async fn test_controller_cleanup_stops_subscriber_only() {
        let h = harness(NodeSettings {
            node_role: Some(NodeRole::Controller),
            ..Default::default()
        });
        h.kernel.cleanup().await;
        let home = h.kernel.settings().home_dir.clone().unwrap();
        assert_eq!(
            h.exec.calls(),
            vec![format!("{} stop", home.join(SUBSCRIBER).display())]
        );
    }

    #[tokio::test]
    async fn test_adhoc_startup_joins_missing_network() {
        let h = harness(NodeSettings {
            mode: Mode::Adhoc,
            nwid: Some("b6079f73c63cea29".into()),
            ..Default::default()
        });
        let report = h.kernel.startup().await.unwrap();
        assert!(report.orbit.is_none());
        assert!(!report.announced);
        assert_eq!(h.exec.count("zerotier-cli join b6079f73c63cea29"), 1);
    }

    #[tokio::test]
    async fn test_adhoc_startup_requires_nwid() {
        let h = harness(NodeSettings {
            mode: Mode::Adhoc,
            ..Default::default()
        });
        let err = h.kernel.startup().await.unwrap_err();
        assert!(matches!(
            err,
            KernelError::Startup {
                phase: StartupPhase::AdhocJoin,
                source: FpndError::Config(_),
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_reports_attempts() {
        let h = harness(NodeSettings::default());
        let report = h.kernel.shutdown(4242).await;
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_signal_and_cleans_up() {
        let h = harness(NodeSettings {
            node_role: Some(NodeRole::Controller),
            ..Default::default()
        });
        let (tx, rx) = watch::channel(false);
        let kernel = &h.kernel;
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(kernel.run(rx), stopper);
        assert!(result.is_ok());
        let home = kernel.settings().home_dir.clone().unwrap();
        assert!(h
            .exec
            .calls()
            .contains(&format!("{} stop", home.join(SUBSCRIBER).display())));
    }
}
