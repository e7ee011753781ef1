//! In-process mock collaborators for unit tests.

use crate::collaborators::{Messenger, NodeClient, PeerProbe, StatusSink};
use crate::exec::{format_cmd, CommandExecutor, ExecOutput};
use crate::supervisor::{Signal, Signaller};
use async_trait::async_trait;
use fpnd_types::error::{FpndError, FpndResult};
use fpnd_types::status::{NetworkRecord, NodeStatus, PeerRecord, StatusMsg};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Command executor
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Reply {
    Output(ExecOutput),
    Fail,
}

/// Answers by exact command line. Queued replies are consumed in order and
/// the last one repeats. Unknown commands succeed with empty output.
#[derive(Default)]
pub struct MockExecutor {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, cmdline: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(cmdline.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn respond(&self, cmdline: &str, stdout: &str) {
        self.respond_with(
            cmdline,
            ExecOutput {
                code: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn respond_with(&self, cmdline: &str, out: ExecOutput) {
        self.push(cmdline, Reply::Output(out));
    }

    /// Successive stdout replies for the same command line.
    pub fn respond_seq(&self, cmdline: &str, stdouts: &[&str]) {
        for s in stdouts {
            self.respond(cmdline, s);
        }
    }

    /// Make the command fail to spawn.
    pub fn fail(&self, cmdline: &str) {
        self.push(cmdline, Reply::Fail);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, cmdline: &str) -> usize {
        self.calls().iter().filter(|c| *c == cmdline).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn exec(&self, program: &str, args: &[String]) -> FpndResult<ExecOutput> {
        let cmdline = format_cmd(program, args);
        self.calls.lock().unwrap().push(cmdline.clone());

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            match replies.get_mut(&cmdline) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match reply {
            Some(Reply::Output(out)) => Ok(out),
            Some(Reply::Fail) => Err(FpndError::CommandFailed {
                command: cmdline,
                reason: "mock failure".to_string(),
            }),
            None => Ok(ExecOutput {
                code: Some(0),
                ..Default::default()
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Node status client
// ---------------------------------------------------------------------------

/// Serves canned status; a `None` status means the node is unreachable.
pub struct MockNodeClient {
    pub status: Mutex<Option<NodeStatus>>,
    pub peers: Mutex<Vec<PeerRecord>>,
    pub networks: Mutex<Vec<NetworkRecord>>,
    /// Make `networks()` fail with a decode error.
    pub broken: Mutex<bool>,
}

impl MockNodeClient {
    pub fn online(address: &str) -> Self {
        Self {
            status: Mutex::new(Some(NodeStatus {
                address: address.to_string(),
                online: true,
                version: Some("1.4.6".to_string()),
            })),
            peers: Mutex::new(Vec::new()),
            networks: Mutex::new(Vec::new()),
            broken: Mutex::new(false),
        }
    }

    pub fn offline() -> Self {
        let client = Self::online("");
        *client.status.lock().unwrap() = None;
        client
    }

    pub fn set_networks(&self, nets: Vec<NetworkRecord>) {
        *self.networks.lock().unwrap() = nets;
    }

    pub fn set_peers(&self, peers: Vec<PeerRecord>) {
        *self.peers.lock().unwrap() = peers;
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn status(&self) -> FpndResult<NodeStatus> {
        self.status
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| FpndError::Connection("mock node offline".to_string()))
    }

    async fn peers(&self) -> FpndResult<Vec<PeerRecord>> {
        Ok(self.peers.lock().unwrap().clone())
    }

    async fn networks(&self) -> FpndResult<Vec<NetworkRecord>> {
        if *self.broken.lock().unwrap() {
            return Err(FpndError::Decode("mock bad payload".to_string()));
        }
        Ok(self.networks.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Reachability probe
// ---------------------------------------------------------------------------

/// Everything is reachable unless marked down.
#[derive(Default)]
pub struct MockProbe {
    down: Mutex<HashSet<Ipv4Addr>>,
    probed: Mutex<Vec<Ipv4Addr>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, addr: Ipv4Addr) {
        self.down.lock().unwrap().insert(addr);
    }

    pub fn set_up(&self, addr: Ipv4Addr) {
        self.down.lock().unwrap().remove(&addr);
    }

    pub fn probed(&self) -> Vec<Ipv4Addr> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerProbe for MockProbe {
    async fn is_reachable(&self, addr: Ipv4Addr) -> bool {
        self.probed.lock().unwrap().push(addr);
        !self.down.lock().unwrap().contains(&addr)
    }
}

// ---------------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------------

/// Records `(addr, method, node_id)` and answers with a canned reply per method.
#[derive(Default)]
pub struct MockMessenger {
    replies: Mutex<HashMap<String, String>>,
    sent: Mutex<Vec<(String, String, String)>>,
}

impl MockMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, method: &str, text: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), text.to_string());
    }

    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, m, _)| m).collect()
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send(&self, addr: &str, method: &str, node_id: &str) -> FpndResult<Option<String>> {
        self.sent
            .lock()
            .unwrap()
            .push((addr.to_string(), method.to_string(), node_id.to_string()));
        Ok(self.replies.lock().unwrap().get(method).cloned())
    }
}

// ---------------------------------------------------------------------------
// Status sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<StatusMsg>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<StatusMsg> {
        self.published.lock().unwrap().clone()
    }
}

impl StatusSink for RecordingSink {
    fn publish(&self, msg: StatusMsg) {
        self.published.lock().unwrap().push(msg);
    }
}

// ---------------------------------------------------------------------------
// Signaller
// ---------------------------------------------------------------------------

/// A fake process that survives `lives` termination signals.
pub struct MockSignaller {
    lives: u32,
    sent: Mutex<Vec<Signal>>,
}

impl MockSignaller {
    pub fn new(lives: u32) -> Self {
        Self {
            lives,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every signal attempted, including the one that failed.
    pub fn sent(&self) -> Vec<Signal> {
        self.sent.lock().unwrap().clone()
    }
}

impl Signaller for MockSignaller {
    fn signal(&self, _pid: i32, sig: Signal) -> std::io::Result<()> {
        let mut sent = self.sent.lock().unwrap();
        let terms = sent.iter().filter(|s| **s == Signal::Terminate).count() as u32;
        sent.push(sig);
        let alive = match sig {
            Signal::Terminate => terms < self.lives,
            Signal::Hangup => terms <= self.lives && self.lives > 0,
        };
        if alive {
            Ok(())
        } else {
            Err(std::io::Error::from_raw_os_error(3))
        }
    }
}
