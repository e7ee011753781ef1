//! Subcommand implementations.

use crate::ui;
use fpnd_kernel::exec::ProcessExecutor;
use fpnd_kernel::moon::OrbitOutcome;
use fpnd_kernel::supervisor::{DaemonAction, DaemonStatus, DaemonSupervisor, UnixSignaller};
use fpnd_kernel::FpndKernel;
use fpnd_types::config::NodeSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start the async runtime: {e}"));
            std::process::exit(1);
        }
    }
}

fn boot(settings: NodeSettings) -> FpndKernel {
    match FpndKernel::boot(settings) {
        Ok(kernel) => kernel,
        Err(e) => {
            ui::error_with_fix(
                &format!("Kernel boot failed: {e}"),
                "Check that the overlay daemon is installed and its auth token is readable",
            );
            std::process::exit(1);
        }
    }
}

/// A supervisor against the real system, for commands that need no kernel.
fn supervisor(settings: &NodeSettings) -> DaemonSupervisor {
    DaemonSupervisor::new(
        Arc::new(ProcessExecutor),
        settings.home_dir.clone(),
        Arc::new(UnixSignaller),
    )
}

fn describe_orbit(outcome: &OrbitOutcome) -> String {
    match outcome {
        OrbitOutcome::Confirmed(moon) => format!("{} at {}:{}", moon.id, moon.addr, moon.port),
        OrbitOutcome::TimedOut => "timed out".to_string(),
    }
}

/// Resolve once SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}

pub fn cmd_run(settings: NodeSettings) {
    let verify_after = Duration::from_secs(settings.cycle_interval_secs.max(1));
    runtime().block_on(async {
        let kernel = Arc::new(boot(settings));
        ui::banner();
        ui::blank();

        match kernel.startup().await {
            Ok(report) => {
                let role = report.role.map(|r| r.to_string());
                ui::kv("Role", role.as_deref().unwrap_or("member"));
                ui::kv("Mode", &format!("{:?}", kernel.settings().mode).to_lowercase());
                if let Some(orbit) = &report.orbit {
                    ui::kv("Orbit", &describe_orbit(orbit));
                }
                if report.diff.is_none() {
                    ui::warn("No data from the overlay node yet");
                }
            }
            Err(e) => {
                ui::error(&e.to_string());
                std::process::exit(1);
            }
        }
        ui::blank();
        ui::hint("Press Ctrl+C to stop the agent");

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = tx.send(true);
        });

        let checker = kernel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(verify_after).await;
            checker.verify_and_deorbit().await;
        });

        if let Err(e) = kernel.run(rx).await {
            ui::error(&format!("Agent stopped: {e}"));
            std::process::exit(1);
        }
        ui::success("Agent stopped");
    });
}

pub fn cmd_cycle(settings: NodeSettings, no_jobs: bool) {
    let delay = settings.job_delay();
    runtime().block_on(async {
        let kernel = boot(settings);
        let diff = match kernel.run_cycle().await {
            Ok(diff) => diff,
            Err(e) => {
                ui::error(&format!("Cycle failed: {e}"));
                std::process::exit(1);
            }
        };

        match serde_json::to_string_pretty(&diff) {
            Ok(json) => println!("{json}"),
            Err(e) => ui::error(&format!("Cannot encode diff: {e}")),
        }

        if !no_jobs && !kernel.dispatcher().queue().is_empty() {
            tokio::time::sleep(delay).await;
            let ran = kernel.run_due_jobs().await;
            info!(ran, "Ran queued jobs");
        }
    });
}

pub fn cmd_cleanup(settings: NodeSettings) {
    runtime().block_on(async {
        let kernel = boot(settings);
        // Learn which networks are up before tearing them down.
        match kernel.run_cycle().await {
            Ok(Some(_)) => {}
            Ok(None) => ui::warn("No data from the overlay node, cleaning up roles only"),
            Err(e) => ui::warn(&format!("Cycle failed before cleanup: {e}")),
        }
        kernel.cleanup().await;
        ui::success("Cleanup done");
    });
}

pub fn cmd_shutdown(settings: NodeSettings, pid: i32) {
    runtime().block_on(async {
        let report = supervisor(&settings).force_stop(pid).await;
        ui::success(&format!(
            "Process {pid} is gone after {} signal(s), {} hangup(s)",
            report.attempts, report.hangups
        ));
    });
}

pub fn cmd_daemon(settings: NodeSettings, script: &str, action: DaemonAction) {
    runtime().block_on(async {
        let supervisor = supervisor(&settings);
        if action == DaemonAction::Status {
            let status = supervisor.status(script).await;
            ui::kv(script, &format!("{status:?}").to_lowercase());
            if status == DaemonStatus::Unknown {
                std::process::exit(1);
            }
            return;
        }
        match supervisor.control(action, script).await {
            Some(out) => {
                ui::success(&format!("{script} {}", action.as_str()));
                if !out.is_empty() {
                    println!("{out}");
                }
            }
            None => {
                ui::error(&format!("{script} {} gave no result", action.as_str()));
                std::process::exit(1);
            }
        }
    });
}

pub fn cmd_orbit(settings: NodeSettings) {
    runtime().block_on(async {
        let kernel = boot(settings);
        if let Err(e) = kernel.run_cycle().await {
            ui::warn(&format!("Cycle failed before orbit: {e}"));
        }
        match kernel.orbit().await {
            Ok(outcome @ OrbitOutcome::Confirmed(_)) => ui::success(&describe_orbit(&outcome)),
            Ok(outcome) => {
                ui::warn(&describe_orbit(&outcome));
                std::process::exit(2);
            }
            Err(e) => {
                ui::error(&format!("Orbit failed: {e}"));
                std::process::exit(1);
            }
        }
    });
}
