//! `gt lifecycle` - the per-town worker lifecycle loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Subcommand;

use crate::config::RigConfig;
use crate::lifecycle::LifecycleManager;
use crate::workspace::{self, TownPaths};

#[derive(Debug, Subcommand)]
pub enum LifecycleCommand {
    /// Run the lifecycle manager loop in the foreground.
    Run,
    /// Run one lifecycle cycle and exit.
    Once,
}

pub fn execute(command: LifecycleCommand) -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd()?;
    let town = TownPaths::new(&town_root);
    let rigs = workspace::list_rigs(&town_root)?;

    // Town-wide settings come from the first rig that carries a lifecycle
    // section; a town with bare rigs runs on defaults.
    let config = rigs
        .iter()
        .find_map(|rig| RigConfig::load(&town.rig_dir(rig)).ok())
        .map(|c| c.lifecycle)
        .unwrap_or_default();

    if !config.enabled {
        anyhow::bail!("lifecycle management is disabled in configuration");
    }

    let manager = LifecycleManager::new(town, rigs, config);

    match command {
        LifecycleCommand::Run => {
            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
                .map_err(|e| anyhow::anyhow!("installing signal handler: {e}"))?;
            manager.run(cancel)
        }
        LifecycleCommand::Once => {
            let stats = manager.run_cycle();
            println!(
                "Lifecycle cycle complete: checked {}, recovered {}, cleaned {}",
                stats.checked, stats.recovered, stats.cleaned
            );
            Ok(())
        }
    }
}
