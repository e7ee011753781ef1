//! External command execution and the overlay CLI wrapper.
//!
//! Everything the agent runs as a child process goes through
//! [`CommandExecutor`], so tests can substitute a recording mock. Failures of
//! the overlay CLI are logged and surfaced as `None`/`false`/empty, never as
//! errors.

use async_trait::async_trait;
use fpnd_types::error::{FpndError, FpndResult};
use fpnd_types::status::MoonRecord;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Captured result of one child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `None` if killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Runs an external program to completion.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn exec(&self, program: &str, args: &[String]) -> FpndResult<ExecOutput>;
}

/// Executor backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn exec(&self, program: &str, args: &[String]) -> FpndResult<ExecOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| FpndError::CommandFailed {
                command: format_cmd(program, args),
                reason: e.to_string(),
            })?;
        Ok(ExecOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub(crate) fn format_cmd(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Wrapper for the overlay command-line tool.
#[derive(Clone)]
pub struct ZtCli {
    executor: Arc<dyn CommandExecutor>,
    command: String,
}

impl ZtCli {
    pub fn new(executor: Arc<dyn CommandExecutor>, command: impl Into<String>) -> Self {
        Self {
            executor,
            command: command.into(),
        }
    }

    /// Run `<command> <action> [extra..]` and return trimmed stdout.
    ///
    /// Returns `None` if the command could not run, exited non-zero, or wrote
    /// anything to stderr.
    pub async fn run(&self, action: &str, extra: &[&str]) -> Option<String> {
        let mut args = vec![action.to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));

        match self.executor.exec(&self.command, &args).await {
            Ok(out) if !out.stderr.trim().is_empty() => {
                error!(
                    command = %self.command,
                    action,
                    stderr = %out.stderr.trim(),
                    "Overlay CLI error result"
                );
                None
            }
            Ok(out) if !out.success() => {
                error!(command = %self.command, action, code = ?out.code, "Overlay CLI failed");
                None
            }
            Ok(out) => {
                let text = out.stdout.trim().to_string();
                debug!(action, result = %text, "Overlay CLI result");
                Some(text)
            }
            Err(e) => {
                error!(command = %self.command, action, error = %e, "Overlay CLI exception");
                None
            }
        }
    }

    /// Current moon listing; empty on any failure.
    pub async fn list_moons(&self) -> Vec<MoonRecord> {
        let Some(raw) = self.run("listmoons", &[]).await else {
            return Vec::new();
        };
        if raw.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Vec<MoonRecord>>(&raw) {
            Ok(moons) => {
                if let Some(first) = moons.first() {
                    info!(moon_id = %first.id, count = moons.len(), "Got moon data");
                }
                moons
            }
            Err(e) => {
                error!(error = %e, "Failed to decode listmoons output");
                Vec::new()
            }
        }
    }

    /// Request an orbit around `moon_id`; true on an `OK` reply.
    pub async fn orbit(&self, moon_id: &str) -> bool {
        self.moon_cmd("orbit", &[moon_id, moon_id]).await
    }

    /// Drop the orbit around `moon_id`; true on an `OK` reply.
    pub async fn deorbit(&self, moon_id: &str) -> bool {
        self.moon_cmd("deorbit", &[moon_id]).await
    }

    async fn moon_cmd(&self, action: &str, args: &[&str]) -> bool {
        let ok = self
            .run(action, args)
            .await
            .map(|out| out.contains("OK"))
            .unwrap_or(false);
        debug!(action, moon_id = args[0], ok, "Moon command");
        ok
    }

    pub async fn join(&self, nwid: &str) -> Option<String> {
        self.run("join", &[nwid]).await
    }

    pub async fn leave(&self, nwid: &str) -> Option<String> {
        self.run("leave", &[nwid]).await
    }

    pub async fn info(&self) -> Option<String> {
        self.run("info", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockExecutor;

    #[test]
    fn test_combined_output() {
        let out = ExecOutput {
            code: Some(0),
            stdout: "a".into(),
            stderr: "b".into(),
        };
        assert_eq!(out.combined(), "ab");
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_run_trims_output() {
        let exec = Arc::new(MockExecutor::new());
        exec.respond("zerotier-cli info", "200 info abcdef0123 1.4.6 ONLINE\n");
        let cli = ZtCli::new(exec.clone(), "zerotier-cli");
        assert_eq!(
            cli.info().await.as_deref(),
            Some("200 info abcdef0123 1.4.6 ONLINE")
        );
        assert_eq!(exec.calls(), vec!["zerotier-cli info"]);
    }

    #[tokio::test]
    async fn test_run_stderr_is_failure() {
        let exec = Arc::new(MockExecutor::new());
        exec.respond_with(
            "zerotier-cli leave 123",
            ExecOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "invalid network id".into(),
            },
        );
        let cli = ZtCli::new(exec, "zerotier-cli");
        assert!(cli.leave("123").await.is_none());
    }

    #[tokio::test]
    async fn test_list_moons_empty_on_failure() {
        let exec = Arc::new(MockExecutor::new());
        exec.fail("zerotier-cli listmoons");
        let cli = ZtCli::new(exec, "zerotier-cli");
        assert!(cli.list_moons().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_moons_decodes() {
        let exec = Arc::new(MockExecutor::new());
        exec.respond(
            "zerotier-cli listmoons",
            r#"[{"id":"0000004f4114472a","roots":[{"stableEndpoints":["1.2.3.4/9993"]}]}]"#,
        );
        let cli = ZtCli::new(exec, "zerotier-cli");
        let moons = cli.list_moons().await;
        assert_eq!(moons.len(), 1);
        assert_eq!(moons[0].roots[0].stable_endpoints, vec!["1.2.3.4/9993"]);
    }

    #[tokio::test]
    async fn test_orbit_requires_ok() {
        let exec = Arc::new(MockExecutor::new());
        exec.respond("zerotier-cli orbit 4f4114472a 4f4114472a", "200 orbit OK");
        exec.respond("zerotier-cli deorbit 4f4114472a", "404 not found");
        let cli = ZtCli::new(exec, "zerotier-cli");
        assert!(cli.orbit("4f4114472a").await);
        assert!(!cli.deorbit("4f4114472a").await);
    }
}
