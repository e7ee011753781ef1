//! fpnd: control-plane agent for an overlay mesh node.
//!
//! `fpnd run` boots the kernel and keeps the node reconciled until it is
//! interrupted. The other subcommands perform a single maintenance action.

mod cli;
mod cmd;
mod ui;

use clap::Parser;
use cli::{Cli, Commands};
use fpnd_kernel::config::load_config;
use tracing_subscriber::EnvFilter;

fn init_tracing(debug: bool, json: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let cli = Cli::parse();

    let settings = load_config(cli.config.as_deref());
    init_tracing(settings.debug, cli.log_json);
    tracing::debug!(mode = ?settings.mode, role = ?settings.node_role, "Settings loaded");

    match cli.command {
        Commands::Run => cmd::cmd_run(settings),
        Commands::Cycle { no_jobs } => cmd::cmd_cycle(settings, no_jobs),
        Commands::Cleanup => cmd::cmd_cleanup(settings),
        Commands::Shutdown { pid } => cmd::cmd_shutdown(settings, pid),
        Commands::Daemon { script, action } => cmd::cmd_daemon(settings, &script, action),
        Commands::Orbit => cmd::cmd_orbit(settings),
    }
}
