//! `gt sling` - the unified work dispatch command.

use clap::Args;

use crate::beads::Beads;
use crate::config::RigConfig;
use crate::session::Tmux;
use crate::sling::{Sling, SlingOptions};
use crate::workspace::{self, TownPaths};

#[derive(Debug, Args)]
pub struct SlingArgs {
    /// Bead id or formula name.
    pub work: String,

    /// Target: agent address, rig name, `deacon/dogs[/name]`, or `.` for
    /// self. Defaults to self.
    pub target: Option<String>,

    /// Create the target worker if it does not exist.
    #[arg(long)]
    pub create: bool,

    /// Re-sling even if the work is pinned.
    #[arg(long)]
    pub force: bool,

    /// Account handle for the spawned worker.
    #[arg(long, default_value = "")]
    pub account: String,

    /// Context subject included in the nudge.
    #[arg(short, long, default_value = "")]
    pub subject: String,

    /// Free-form instructions stored on the bead and included in the nudge.
    #[arg(short, long, default_value = "")]
    pub args: String,

    /// Skip auto-convoy creation.
    #[arg(long)]
    pub no_convoy: bool,

    /// Skip session creation and nudging.
    #[arg(long)]
    pub naked: bool,

    /// Apply a formula to an existing bead.
    #[arg(long)]
    pub on: Option<String>,

    /// Formula variable (key=value), repeatable.
    #[arg(long = "var", value_parser = parse_key_value)]
    pub vars: Vec<(String, String)>,

    /// Show what would be done without doing it.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {s:?}"))
}

pub fn execute(args: SlingArgs) -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd()?;
    let town = TownPaths::new(&town_root);
    let rigs = workspace::list_rigs(&town_root)?;
    let beads = Beads::new(&town_root);
    let tmux = Tmux::new();

    // Lifecycle limits come from the target rig when there is one.
    let lifecycle = match args.target.as_deref() {
        Some(target) if rigs.iter().any(|r| r == target) => {
            RigConfig::load(&town.rig_dir(target))?.lifecycle
        }
        _ => RigConfig::default().lifecycle,
    };

    let engine = Sling {
        town: &town,
        beads: &beads,
        tmux: &tmux,
        rigs,
        lifecycle,
    };

    let opts = SlingOptions {
        work: args.work,
        target: args.target,
        subject: args.subject,
        args: args.args,
        account: args.account,
        create: args.create,
        force: args.force,
        no_convoy: args.no_convoy,
        naked: args.naked,
        on_bead: args.on,
        vars: args.vars,
        dry_run: args.dry_run,
    };

    if opts.dry_run {
        let outcome = engine.run(&opts)?;
        println!("Would sling {} to {}", outcome.work, outcome.target);
        return Ok(());
    }

    let outcome = engine.run(&opts)?;
    println!("Slung {} to {}", outcome.work, outcome.target);
    if let Some(ref convoy) = outcome.convoy {
        println!("  convoy: {convoy}");
    }
    if outcome.spawned {
        println!("  spawned fresh worker");
    }
    if outcome.nudged {
        println!("  start prompt sent");
    } else {
        println!("  no session nudged (worker will discover its hook)");
    }
    Ok(())
}
