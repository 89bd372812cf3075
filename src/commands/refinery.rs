//! `gt refinery` - the per-rig merge queue loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Subcommand;

use crate::beads::Beads;
use crate::config::RigConfig;
use crate::git::Git;
use crate::mail::Router;
use crate::refinery::Engineer;
use crate::workspace::{self, TownPaths};

#[derive(Debug, Subcommand)]
pub enum RefineryCommand {
    /// Run the merge queue loop for a rig in the foreground.
    Run { rig: String },
    /// Process at most one ready merge request and exit.
    Once { rig: String },
}

pub fn execute(command: RefineryCommand) -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd()?;
    let town = TownPaths::new(&town_root);

    let rig = match &command {
        RefineryCommand::Run { rig } | RefineryCommand::Once { rig } => rig.clone(),
    };
    let rigs = workspace::list_rigs(&town_root)?;
    if !rigs.iter().any(|r| r == &rig) {
        anyhow::bail!("rig '{rig}' not found in this town");
    }

    let clone = town.rig_clone(&rig);
    let config = RigConfig::load(&town.rig_dir(&rig))?;
    let beads = Beads::new(&clone);
    let engineer = Engineer::new(&rig, &beads, Git::new(&clone), config.merge_queue)
        .with_mail(Router::new(town.root()));

    match command {
        RefineryCommand::Run { .. } => {
            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
                .map_err(|e| anyhow::anyhow!("installing signal handler: {e}"))?;
            engineer.run(cancel)
        }
        RefineryCommand::Once { .. } => {
            match engineer.process_once()? {
                Some(mr) => println!("Processed {mr}"),
                None => println!("Merge queue is empty"),
            }
            Ok(())
        }
    }
}
