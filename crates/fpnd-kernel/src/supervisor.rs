//! Companion daemon supervision and forced shutdown.
//!
//! The messaging daemons are controlled through their own scripts, each called
//! with a single action word. A script reports its status by printing a
//! literal `True` or `False`. Forced shutdown of a process escalates from
//! repeated termination signals to an additional hangup every tenth attempt.

use crate::exec::{format_cmd, CommandExecutor};
use fpnd_types::config::NodeRole;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Request/reply responder daemon run by moons.
pub const RESPONDER: &str = "msg_responder.py";

/// Pub/sub subscriber daemon run by moons and controllers.
pub const SUBSCRIBER: &str = "msg_subscriber.py";

/// Default pause between termination signals.
pub const DEFAULT_KILL_INTERVAL: Duration = Duration::from_millis(100);

/// Every this many termination attempts, a hangup is sent as well.
const HANGUP_EVERY: u32 = 10;

/// Action word passed to a daemon script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonAction {
    Start,
    Stop,
    Restart,
    Status,
}

impl DaemonAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Status => "status",
        }
    }
}

impl std::str::FromStr for DaemonAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "status" => Ok(Self::Status),
            other => Err(format!("unknown daemon action '{other}'")),
        }
    }
}

/// Reported state of a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    Running,
    Stopped,
    Unknown,
}

impl DaemonStatus {
    /// `Some(true)` / `Some(false)`, or `None` when unknown.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Running => Some(true),
            Self::Stopped => Some(false),
            Self::Unknown => None,
        }
    }
}

/// Map script output to a status. `False` is checked first.
pub fn parse_status(output: &str) -> DaemonStatus {
    if output.contains("False") {
        DaemonStatus::Stopped
    } else if output.contains("True") {
        DaemonStatus::Running
    } else {
        DaemonStatus::Unknown
    }
}

/// Signals used by the forced shutdown loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Hangup,
}

/// Delivers a signal to a process id.
pub trait Signaller: Send + Sync {
    /// Fails once the process no longer exists.
    fn signal(&self, pid: i32, sig: Signal) -> std::io::Result<()>;
}

/// `kill(2)`-backed signaller.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixSignaller;

#[cfg(unix)]
impl Signaller for UnixSignaller {
    fn signal(&self, pid: i32, sig: Signal) -> std::io::Result<()> {
        let signo = match sig {
            Signal::Terminate => libc::SIGTERM,
            Signal::Hangup => libc::SIGHUP,
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(pid as libc::pid_t, signo) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
impl Signaller for UnixSignaller {
    fn signal(&self, _pid: i32, _sig: Signal) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process signals are only supported on unix",
        ))
    }
}

/// Outcome of [`DaemonSupervisor::force_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceStopReport {
    /// Termination signals delivered before the process went away.
    pub attempts: u32,
    /// Hangup signals delivered.
    pub hangups: u32,
}

/// Starts, stops and queries the companion daemons.
pub struct DaemonSupervisor {
    executor: Arc<dyn CommandExecutor>,
    home_dir: Option<PathBuf>,
    signaller: Arc<dyn Signaller>,
    kill_interval: Duration,
}

impl DaemonSupervisor {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        home_dir: Option<PathBuf>,
        signaller: Arc<dyn Signaller>,
    ) -> Self {
        Self {
            executor,
            home_dir,
            signaller,
            kill_interval: DEFAULT_KILL_INTERVAL,
        }
    }

    /// Override the pause between termination signals.
    pub fn with_kill_interval(mut self, interval: Duration) -> Self {
        self.kill_interval = interval;
        self
    }

    fn script_path(&self, script: &str) -> Option<PathBuf> {
        let path = self.home_dir.as_ref()?.join(script);
        path.is_file().then_some(path)
    }

    /// Run `script action` and return its combined output.
    ///
    /// Returns `None` without running anything if the script does not exist,
    /// and `None` if it fails to run or exits non-zero.
    pub async fn control(&self, action: DaemonAction, script: &str) -> Option<String> {
        let Some(path) = self.script_path(script) else {
            warn!(script, "Daemon script not found");
            return None;
        };
        let program = path.to_string_lossy().into_owned();
        let args = vec![action.as_str().to_string()];
        debug!(action = action.as_str(), script = %program, "Sending daemon action");

        match self.executor.exec(&program, &args).await {
            Ok(out) if out.success() => Some(out.combined()),
            Ok(out) => {
                error!(
                    command = %format_cmd(&program, &args),
                    code = ?out.code,
                    output = %out.combined().trim(),
                    "Daemon script failed"
                );
                None
            }
            Err(e) => {
                error!(error = %e, "Daemon script exception");
                None
            }
        }
    }

    pub async fn status(&self, script: &str) -> DaemonStatus {
        let output = self.control(DaemonAction::Status, script).await;
        let status = output
            .as_deref()
            .map(parse_status)
            .unwrap_or(DaemonStatus::Unknown);
        if status == DaemonStatus::Unknown {
            error!(script, output = ?output, "Bad daemon status result");
        }
        status
    }

    pub async fn start(&self, script: &str) -> Option<String> {
        self.control(DaemonAction::Start, script).await
    }

    pub async fn stop(&self, script: &str) -> Option<String> {
        self.control(DaemonAction::Stop, script).await
    }

    pub async fn restart(&self, script: &str) -> Option<String> {
        self.control(DaemonAction::Restart, script).await
    }

    /// Start `script` if it reports stopped. Returns the status seen first.
    pub async fn ensure_running(&self, script: &str) -> DaemonStatus {
        let status = self.status(script).await;
        if status == DaemonStatus::Stopped {
            info!(script, "Starting daemon");
            self.start(script).await;
        }
        status
    }

    /// Stop the daemons a node of `role` runs.
    pub async fn stop_role_daemons(&self, role: NodeRole) {
        for script in role_daemons(role) {
            info!(script, "CLEANUP: shutting down");
            self.stop(script).await;
        }
    }

    /// Start any stopped daemons a node of `role` runs.
    pub async fn start_role_daemons(&self, role: NodeRole) {
        for script in role_daemons(role) {
            self.ensure_running(script).await;
        }
    }

    /// Signal `pid` until it is gone.
    ///
    /// Sends a termination signal every `kill_interval`; every tenth attempt
    /// also sends a hangup. Ends at the first delivery that fails, which means
    /// the process no longer exists. A pid below 1 names a process group and
    /// is refused without sending anything.
    pub async fn force_stop(&self, pid: i32) -> ForceStopReport {
        let mut report = ForceStopReport {
            attempts: 0,
            hangups: 0,
        };
        if pid <= 0 {
            warn!(pid, "Refusing to signal a process group");
            return report;
        }
        loop {
            if let Err(e) = self.signaller.signal(pid, Signal::Terminate) {
                info!(pid, attempts = report.attempts, error = %e, "Process is gone");
                break;
            }
            report.attempts += 1;
            tokio::time::sleep(self.kill_interval).await;

            if report.attempts % HANGUP_EVERY == 0 {
                if let Err(e) = self.signaller.signal(pid, Signal::Hangup) {
                    info!(pid, attempts = report.attempts, error = %e, "Process is gone");
                    break;
                }
                report.hangups += 1;
            }
        }
        report
    }
}

/// Daemon scripts owned by a role.
pub fn role_daemons(role: NodeRole) -> &'static [&'static str] {
    match role {
        NodeRole::Moon => &[RESPONDER, SUBSCRIBER],
        NodeRole::Controller => &[SUBSCRIBER],
    }
}
