//! `gt health` - worker health checks.

use chrono::Utc;
use clap::Subcommand;

use crate::beads::Beads;
use crate::commands::print_json;
use crate::lifecycle::check_worker_health;
use crate::workspace;

#[derive(Debug, Subcommand)]
pub enum HealthCommand {
    /// Check all worker health states and reassign work from dead workers.
    Check {
        #[arg(long)]
        json: bool,
    },
}

pub fn execute(command: HealthCommand) -> anyhow::Result<()> {
    match command {
        HealthCommand::Check { json } => run_check(json),
    }
}

fn run_check(json: bool) -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd()?;
    let beads = Beads::new(&town_root);

    let results = check_worker_health(&beads, Utc::now())?;

    if json {
        return print_json(&results);
    }

    if results.is_empty() {
        println!("No workers with heartbeat tracking found");
        return Ok(());
    }

    println!("Worker health check ({} workers)", results.len());
    let mut healthy = 0;
    let mut stale = 0;
    let mut dead = 0;
    let mut errors = 0;

    for result in &results {
        match result.current_health.as_str() {
            "healthy" => healthy += 1,
            "stale" => stale += 1,
            "dead" => dead += 1,
            _ => {}
        }
        if let Some(ref error) = result.error {
            errors += 1;
            println!("  ! {}: {error}", result.worker);
        } else if result.action == "no change" {
            println!("  - {}: {}", result.worker, result.current_health);
        } else {
            println!("  * {}: {}", result.worker, result.action);
        }
    }

    println!();
    println!("  healthy: {healthy}");
    if stale > 0 {
        println!("  stale: {stale}");
    }
    if dead > 0 {
        println!("  dead: {dead}");
    }
    if errors > 0 {
        println!("  errors: {errors}");
    }
    Ok(())
}
