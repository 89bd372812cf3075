//! `gt molecules` - builtin workflow molecules.

use clap::Subcommand;

use crate::beads::molecules::seed_builtin_molecules;
use crate::beads::Beads;
use crate::workspace;

#[derive(Debug, Subcommand)]
pub enum MoleculesCommand {
    /// Seed the builtin molecules into the work database. Idempotent.
    Seed,
}

pub fn execute(command: MoleculesCommand) -> anyhow::Result<()> {
    match command {
        MoleculesCommand::Seed => {
            let town_root = workspace::find_from_cwd()?;
            let beads = Beads::new(&town_root);
            let created = seed_builtin_molecules(&beads)?;
            if created == 0 {
                println!("Builtin molecules already present");
            } else {
                println!("Seeded {created} builtin molecules");
            }
            Ok(())
        }
    }
}
