//! `gt convoy` - convoy tracking.

use clap::{Args, Subcommand};
use serde::Serialize;

use crate::beads::fields::ConvoyFields;
use crate::beads::validation::{
    validate_convoy_stage_transition, validate_convoy_stage_transition_with_reopening,
};
use crate::beads::{Beads, ListOptions, UpdatePatch, WorkStore};
use crate::commands::print_json;
use crate::workspace;

#[derive(Debug, Subcommand)]
pub enum ConvoyCommand {
    /// List open convoys.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Move a convoy to a new stage.
    Stage(StageArgs),
}

#[derive(Debug, Args)]
pub struct StageArgs {
    /// Convoy bead id.
    pub id: String,
    /// New stage: planning, execution, review, or complete.
    pub stage: String,
    /// Allow reopening a completed convoy back to planning.
    #[arg(long)]
    pub reopen: bool,
}

pub fn execute(command: ConvoyCommand) -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd()?;
    let beads = Beads::new(&town_root);

    match command {
        ConvoyCommand::List { json } => run_list(&beads, json),
        ConvoyCommand::Stage(args) => run_stage(&beads, args),
    }
}

#[derive(Debug, Serialize)]
struct ConvoyRow {
    id: String,
    title: String,
    stage: String,
    tracked: Vec<String>,
    coordinator: String,
}

fn run_list(beads: &Beads, json: bool) -> anyhow::Result<()> {
    let convoys = beads.list(&ListOptions {
        issue_type: "convoy".into(),
        status: "open".into(),
        ..Default::default()
    })?;

    let rows: Vec<ConvoyRow> = convoys
        .iter()
        .map(|c| {
            let fields = ConvoyFields::parse(&c.description).unwrap_or_default();
            ConvoyRow {
                id: c.id.clone(),
                title: c.title.clone(),
                stage: fields.stage,
                tracked: fields
                    .spawned_work
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                coordinator: fields.coordinator,
            }
        })
        .collect();

    if json {
        return print_json(&rows);
    }

    if rows.is_empty() {
        println!("No open convoys");
        return Ok(());
    }
    for row in &rows {
        println!("{:<14} [{}] {}", row.id, row.stage, row.title);
        for work in &row.tracked {
            println!("  tracks {work}");
        }
    }
    Ok(())
}

fn run_stage(beads: &Beads, args: StageArgs) -> anyhow::Result<()> {
    let convoy = beads.show(&args.id)?;
    if convoy.issue_type != "convoy" {
        anyhow::bail!("'{}' is a {}, not a convoy", args.id, convoy.issue_type);
    }

    let mut fields = ConvoyFields::parse(&convoy.description).unwrap_or_default();
    let current = if fields.stage.is_empty() {
        crate::beads::validation::STAGE_PLANNING.to_string()
    } else {
        fields.stage.clone()
    };

    if args.reopen {
        validate_convoy_stage_transition_with_reopening(&current, &args.stage)?;
    } else {
        validate_convoy_stage_transition(&current, &args.stage)?;
    }

    fields.stage = args.stage.clone();
    beads.update(
        &args.id,
        &UpdatePatch {
            description: Some(fields.set(&convoy.description)),
            ..Default::default()
        },
    )?;

    println!("Convoy {} moved: {} → {}", args.id, current, args.stage);
    Ok(())
}
