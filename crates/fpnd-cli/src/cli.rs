//! Clap CLI definitions for fpnd.

use clap::{Parser, Subcommand};
use fpnd_kernel::supervisor::DaemonAction;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  fpnd run                          Start the node agent in the foreground
  fpnd cycle                        Reconcile once and print the state diff
  fpnd orbit                        Join the rendezvous node and report the result
  fpnd daemon msg_responder.py status
  fpnd shutdown --pid 4242          Force a stuck agent process to exit";

/// fpnd: control-plane agent for an overlay mesh node.
#[derive(Parser)]
#[command(name = "fpnd", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to the settings file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent: startup, periodic reconciliation, cleanup on exit.
    Run,
    /// Run one reconciliation cycle and print the diff as JSON.
    Cycle {
        /// Exit without waiting for the queued interface jobs.
        #[arg(long)]
        no_jobs: bool,
    },
    /// Tear down interfaces, networks and daemons for this node's role.
    Cleanup,
    /// Signal a process until it exits.
    Shutdown {
        /// Process id to stop.
        #[arg(long, value_parser = clap::value_parser!(i32).range(1..))]
        pid: i32,
    },
    /// Control a messaging daemon script.
    Daemon {
        /// Script name under the home directory.
        script: String,
        /// One of start, stop, restart, status.
        action: DaemonAction,
    },
    /// Run the rendezvous orbit once and print the outcome.
    Orbit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daemon_command() {
        let cli = Cli::try_parse_from(["fpnd", "daemon", "msg_subscriber.py", "restart"]).unwrap();
        match cli.command {
            Commands::Daemon { script, action } => {
                assert_eq!(script, "msg_subscriber.py");
                assert_eq!(action, DaemonAction::Restart);
            }
            _ => panic!("expected daemon command"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_action() {
        assert!(Cli::try_parse_from(["fpnd", "daemon", "msg_subscriber.py", "reload"]).is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli =
            Cli::try_parse_from(["fpnd", "shutdown", "--pid", "42", "--config", "/tmp/f.toml"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/f.toml")));
        assert!(matches!(cli.command, Commands::Shutdown { pid: 42 }));
    }

    #[test]
    fn test_shutdown_rejects_group_pids() {
        for pid in ["0", "-1"] {
            let arg = format!("--pid={pid}");
            assert!(Cli::try_parse_from(["fpnd", "shutdown", arg.as_str()]).is_err());
        }
        assert!(Cli::try_parse_from(["fpnd", "shutdown", "--pid=1"]).is_ok());
    }
}
