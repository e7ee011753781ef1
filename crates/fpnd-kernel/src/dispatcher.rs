//! State-change dispatch into deferred, tagged, one-shot jobs.
//!
//! [`EventDispatcher::dispatch`] turns interface flips in a [`StateDiff`] into
//! net-script jobs. Jobs are plain data held in a [`JobQueue`]; a periodic
//! driver calls [`EventDispatcher::run_due`] to execute the ones whose delay
//! has passed. Every job runs at most once.

use crate::clock::{deadline_after, Clock};
use crate::collaborators::Messenger;
use crate::exec::CommandExecutor;
use chrono::{DateTime, Utc};
use fpnd_types::config::NodeSettings;
use fpnd_types::state::{Iface, NodeState, StateDiff};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tag of interface reconfiguration jobs.
pub const NET_CHANGE: &str = "net-change";

/// Tag of the startup announcement job.
pub const HEY_MOON: &str = "hey-moon";

/// Loopback address used for local messaging.
pub const LOCALHOST: &str = "127.0.0.1";

/// What a job does when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobAction {
    /// Run an interface up/down script.
    NetCommand {
        iface: Iface,
        up: bool,
        script: PathBuf,
    },
    /// Announce this node to the messaging daemon at `addr`.
    Announce { node_id: String, addr: String },
}

/// A queued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: u64,
    pub tag: String,
    pub due: DateTime<Utc>,
    pub action: JobAction,
}

/// In-process queue of deferred jobs, keyed by tag.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Mutex<Vec<Job>>,
    next_id: AtomicU64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `action` under `tag`, due at `due`. Returns the job id.
    pub fn enqueue(&self, tag: &str, action: JobAction, due: DateTime<Utc>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = id, tag, due = %due, "Job queued");
        self.lock().push(Job {
            id,
            tag: tag.to_string(),
            due,
            action,
        });
        id
    }

    /// Drop every job under `tag`. Returns how many were dropped.
    pub fn cancel_tag(&self, tag: &str) -> usize {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|j| j.tag != tag);
        before - jobs.len()
    }

    pub fn jobs_with_tag(&self, tag: &str) -> Vec<Job> {
        self.lock().iter().filter(|j| j.tag == tag).cloned().collect()
    }

    /// Remove and return every job due at or before `now`, in queue order.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut jobs = self.lock();
        let (due, pending): (Vec<Job>, Vec<Job>) = jobs.drain(..).partition(|j| j.due <= now);
        *jobs = pending;
        due
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Path of the up or down script for `iface` under `home`, if it exists.
pub fn net_script(home: &Path, iface: Iface, up: bool) -> Option<PathBuf> {
    let suffix = if up { "setup" } else { "down" };
    let path = home.join("bin").join(format!("{iface}-{suffix}.sh"));
    path.is_file().then_some(path)
}

/// Address for messages to the moon's daemons.
///
/// The cached moon address when the recorded moon is allow-listed and
/// local addressing is off; the loopback address otherwise.
pub fn message_addr(state: &NodeState, settings: &NodeSettings) -> String {
    let moon_addr = state
        .moon_id0
        .as_deref()
        .filter(|id| settings.is_allowed_moon(id))
        .and(state.moon_addr.as_deref());
    match moon_addr {
        Some(addr) if !settings.use_localhost => addr.to_string(),
        _ => LOCALHOST.to_string(),
    }
}

/// Log each interface flip carried by `diff`.
pub fn log_fpn_state(diff: &StateDiff) {
    for (iface, up) in diff.iter().flat_map(|c| c.iface_changes()) {
        info!("{} is {}", iface, if up { "UP" } else { "DOWN" });
    }
}

/// Turns state diffs into jobs and runs them when due.
pub struct EventDispatcher {
    queue: JobQueue,
    home_dir: Option<PathBuf>,
    delay: Duration,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn CommandExecutor>,
    messenger: Arc<dyn Messenger>,
    msg_ref: Mutex<Option<String>>,
}

impl EventDispatcher {
    pub fn new(
        settings: &NodeSettings,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn CommandExecutor>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            queue: JobQueue::new(),
            home_dir: settings.home_dir.clone(),
            delay: settings.job_delay(),
            clock,
            executor,
            messenger,
            msg_ref: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Take the reference returned by the last answered announcement.
    pub fn take_msg_ref(&self) -> Option<String> {
        self.msg_ref.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn due_at(&self) -> DateTime<Utc> {
        deadline_after(self.clock.now(), self.delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Queue one net-change job per interface flip in `diff`.
    ///
    /// Returns the number of jobs queued. An empty diff queues nothing.
    pub fn dispatch(&self, diff: &StateDiff) -> usize {
        if diff.is_empty() {
            return 0;
        }
        log_fpn_state(diff);
        let mut queued = 0;
        for (iface, up) in diff.iter().flat_map(|c| c.iface_changes()) {
            debug!(%iface, up, "Running net change handler");
            if self.queue_net_command(iface, up) {
                queued += 1;
            }
        }
        queued
    }

    /// Queue the up or down script for `iface`. False if there is none.
    pub fn queue_net_command(&self, iface: Iface, up: bool) -> bool {
        let script = self
            .home_dir
            .as_deref()
            .and_then(|home| net_script(home, iface, up));
        let Some(script) = script else {
            error!(%iface, up, "No net command found for interface");
            return false;
        };
        self.queue.enqueue(
            NET_CHANGE,
            JobAction::NetCommand { iface, up, script },
            self.due_at(),
        );
        true
    }

    /// Queue the one-shot node announcement.
    pub fn announce(&self, node_id: Option<&str>, addr: &str) -> bool {
        let Some(node_id) = node_id else {
            warn!("No node id yet, skipping announcement");
            return false;
        };
        debug!(node_id, addr, "Queueing announcement");
        self.queue.enqueue(
            HEY_MOON,
            JobAction::Announce {
                node_id: node_id.to_string(),
                addr: addr.to_string(),
            },
            self.due_at(),
        );
        true
    }

    pub fn cancel_tag(&self, tag: &str) -> usize {
        let n = self.queue.cancel_tag(tag);
        debug!(tag, cancelled = n, "Cancelled jobs");
        n
    }

    /// Run every due job once. Returns the number of jobs that succeeded.
    pub async fn run_due(&self) -> usize {
        let mut ok = 0;
        for job in self.queue.drain_due(self.clock.now()) {
            if self.run_job(&job).await {
                ok += 1;
            }
        }
        ok
    }

    /// Run the up or down script for `iface` right away, without queueing.
    pub async fn run_net_command_now(&self, iface: Iface, up: bool) -> bool {
        match self
            .home_dir
            .as_deref()
            .and_then(|home| net_script(home, iface, up))
        {
            Some(script) => self.exec_net_script(iface, up, &script).await,
            None => {
                error!(%iface, up, "No net command found for interface");
                false
            }
        }
    }

    async fn exec_net_script(&self, iface: Iface, up: bool, script: &Path) -> bool {
        let program = script.to_string_lossy();
        match self.executor.exec(&program, &[]).await {
            Ok(out) if out.success() => {
                info!(%iface, up, "Net command ok");
                true
            }
            Ok(out) => {
                error!(
                    %iface,
                    up,
                    code = ?out.code,
                    output = %out.combined().trim(),
                    "Net command failed"
                );
                false
            }
            Err(e) => {
                error!(%iface, up, error = %e, "Net command could not run");
                false
            }
        }
    }

    async fn run_job(&self, job: &Job) -> bool {
        match &job.action {
            JobAction::NetCommand { iface, up, script } => {
                self.exec_net_script(*iface, *up, script).await
            }
            JobAction::Announce { node_id, addr } => {
                match self.messenger.announce(addr, node_id).await {
                    Ok(reply) => {
                        debug!(
                            node_id = %node_id,
                            addr = %addr,
                            reply = ?reply,
                            "Announcement sent"
                        );
                        if reply.is_some() {
                            *self.msg_ref.lock().unwrap_or_else(|e| e.into_inner()) = reply;
                        }
                        true
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "Announcement failed");
                        false
                    }
                }
            }
        }
    }
}
