//! `gt projection-daemon` - the work-store → dashboard sync daemon.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::error::ExitError;
use crate::projection::daemon::{self, Daemon};
use crate::subprocess::Tool;
use crate::workspace::{self, TownPaths};

#[derive(Debug, Subcommand)]
pub enum ProjectionDaemonCommand {
    /// Start the sync daemon in the background.
    Start(IntervalArgs),
    /// Stop the running daemon.
    Stop,
    /// Show daemon status.
    Status,
    /// View the daemon log.
    Logs {
        /// Number of lines to show.
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: u32,
        /// Follow log output.
        #[arg(short, long)]
        follow: bool,
    },
    /// Run a single sync and exit.
    Once,
    /// Run the daemon in the foreground (used by start).
    #[command(hide = true)]
    Run(IntervalArgs),
}

#[derive(Debug, Args)]
pub struct IntervalArgs {
    /// Poll interval (e.g. 30s, 1m).
    #[arg(short, long, default_value = "30s")]
    pub interval: String,
}

impl IntervalArgs {
    fn parse(&self) -> anyhow::Result<Duration> {
        humantime::parse_duration(&self.interval)
            .map_err(|e| ExitError::Config(format!("invalid interval {:?}: {e}", self.interval)).into())
    }
}

pub fn execute(command: ProjectionDaemonCommand) -> anyhow::Result<()> {
    let town = TownPaths::new(workspace::find_from_cwd()?);
    match command {
        ProjectionDaemonCommand::Start(args) => {
            let pid = daemon::start(&town, Some(args.parse()?))?;
            println!("Projection sync daemon started (PID {pid})");
            Ok(())
        }
        ProjectionDaemonCommand::Stop => {
            let pid = daemon::stop(&town)?;
            println!("Projection sync daemon stopped (was PID {pid})");
            Ok(())
        }
        ProjectionDaemonCommand::Status => run_status(&town),
        ProjectionDaemonCommand::Logs { lines, follow } => run_logs(&town, lines, follow),
        ProjectionDaemonCommand::Once => {
            let mut d = Daemon::new(town, Duration::ZERO)?;
            println!("Running one-time sync...");
            d.tick()?;
            println!("Sync completed");
            Ok(())
        }
        ProjectionDaemonCommand::Run(args) => run_foreground(town, args.parse()?),
    }
}

fn run_status(town: &TownPaths) -> anyhow::Result<()> {
    let (running, pid) = daemon::is_running(town)?;
    if !running {
        println!("Projection sync daemon is not running");
        println!("  start with: gt projection-daemon start");
        return Ok(());
    }

    println!("Projection sync daemon is running (PID {pid})");
    let state = daemon::load_state(town)?;
    if !state.started_at.is_empty() {
        println!("  started:   {}", state.started_at);
    }
    if !state.last_sync.is_empty() {
        println!("  last sync: {}", state.last_sync);
    }
    println!("  syncs:     {}", state.sync_count);
    if state.error_count > 0 {
        println!("  errors:    {}", state.error_count);
    }
    println!("  last event id: {}", state.last_event_id);
    println!(
        "  incremental:   {}",
        if state.incremental_enabled { "on" } else { "off" }
    );
    Ok(())
}

fn run_logs(town: &TownPaths, lines: u32, follow: bool) -> anyhow::Result<()> {
    let log = daemon::log_path(town);
    if !log.exists() {
        anyhow::bail!("no log file found at {}", log.display());
    }
    let log = log.to_string_lossy().into_owned();

    if follow {
        // Streams until interrupted; inherit stdio instead of capturing.
        let status = std::process::Command::new("tail")
            .args(["-f", &log])
            .status()?;
        if !status.success() {
            anyhow::bail!("tail exited with {status}");
        }
        return Ok(());
    }

    let output = Tool::new("tail")
        .args(&["-n", &lines.to_string(), &log])
        .run_ok()?;
    print!("{}", output.stdout);
    Ok(())
}

fn run_foreground(town: TownPaths, interval: Duration) -> anyhow::Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|e| anyhow::anyhow!("installing signal handler: {e}"))?;

    let mut d = Daemon::new(town, interval)?;
    d.run(cancel)
}
