use std::process::ExitCode;

use clap::{Parser, Subcommand};

use gastown::commands::convoy::ConvoyCommand;
use gastown::commands::health::HealthCommand;
use gastown::commands::heartbeat::HeartbeatArgs;
use gastown::commands::lifecycle::LifecycleCommand;
use gastown::commands::mail::MailCommand;
use gastown::commands::molecules::MoleculesCommand;
use gastown::commands::mq::MqCommand;
use gastown::commands::projection_daemon::ProjectionDaemonCommand;
use gastown::commands::refinery::RefineryCommand;
use gastown::commands::sling::SlingArgs;
use gastown::commands::{self, print_json_error};
use gastown::error::{ExitError, StoreError};
use gastown::telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "gt",
    version,
    about = "Gas Town: multi-agent work orchestration"
)]
struct Cli {
    /// Emit errors as JSON envelopes.
    #[arg(long, global = true)]
    json_errors: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Assign work to an agent (the unified dispatch command).
    Sling(SlingArgs),
    /// Merge queue operations.
    Mq {
        #[command(subcommand)]
        command: MqCommand,
    },
    /// Send a heartbeat signal from a worker.
    Heartbeat(HeartbeatArgs),
    /// Check worker health and heartbeats.
    Health {
        #[command(subcommand)]
        command: HealthCommand,
    },
    /// Manage the projection sync daemon.
    ProjectionDaemon {
        #[command(subcommand)]
        command: ProjectionDaemonCommand,
    },
    /// Run the merge queue processor for a rig.
    Refinery {
        #[command(subcommand)]
        command: RefineryCommand,
    },
    /// Run the worker lifecycle manager.
    Lifecycle {
        #[command(subcommand)]
        command: LifecycleCommand,
    },
    /// Send and inspect agent mail.
    Mail {
        #[command(subcommand)]
        command: MailCommand,
    },
    /// Track convoys of related work.
    Convoy {
        #[command(subcommand)]
        command: ConvoyCommand,
    },
    /// Manage builtin workflow molecules.
    Molecules {
        #[command(subcommand)]
        command: MoleculesCommand,
    },
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Sling(_) => "sling",
            Self::Mq { .. } => "mq",
            Self::Heartbeat(_) => "heartbeat",
            Self::Health { .. } => "health",
            Self::ProjectionDaemon { .. } => "projection-daemon",
            Self::Refinery { .. } => "refinery",
            Self::Lifecycle { .. } => "lifecycle",
            Self::Mail { .. } => "mail",
            Self::Convoy { .. } => "convoy",
            Self::Molecules { .. } => "molecules",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Sling(args) => commands::sling::execute(args),
        Commands::Mq { command } => commands::mq::execute(command),
        Commands::Heartbeat(args) => commands::heartbeat::execute(args),
        Commands::Health { command } => commands::health::execute(command),
        Commands::ProjectionDaemon { command } => commands::projection_daemon::execute(command),
        Commands::Refinery { command } => commands::refinery::execute(command),
        Commands::Lifecycle { command } => commands::lifecycle::execute(command),
        Commands::Mail { command } => commands::mail::execute(command),
        Commands::Convoy { command } => commands::convoy::execute(command),
        Commands::Molecules { command } => commands::molecules::execute(command),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json_errors {
                let kind = e
                    .downcast_ref::<StoreError>()
                    .map(StoreError::kind)
                    .unwrap_or("error");
                print_json_error(kind, &format!("{e:#}"));
            }
            if let Some(exit_err) = e.downcast_ref::<ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
