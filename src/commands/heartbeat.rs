//! `gt heartbeat` - a worker's periodic liveness signal.
//!
//! Updates the worker's agent bead (last_heartbeat is monotonic) and mails
//! the rig's witness so the mailbox carries a liveness trail even when the
//! bead update loses a race.

use chrono::{DateTime, Utc};
use clap::Args;

use crate::beads::validation::{validate_heartbeat_timeout, DEFAULT_HEARTBEAT_TIMEOUT};
use crate::beads::Beads;
use crate::mail::{Message, Priority, Router};
use crate::workspace;

#[derive(Debug, Args)]
pub struct HeartbeatArgs {
    /// Worker name.
    pub worker: String,

    /// Worker type (polecat, dog, ...).
    #[arg(long = "type")]
    pub worker_type: String,

    /// Rig name.
    #[arg(long)]
    pub rig: String,

    /// Health status (healthy, stale, dead).
    #[arg(long, default_value = "healthy")]
    pub health: String,

    /// Work state (working, idle, blocked).
    #[arg(long, default_value = "working")]
    pub state: String,

    /// Currently assigned work item id.
    #[arg(long, default_value = "")]
    pub work: String,

    /// Heartbeat timeout in seconds (60-3600), set on first heartbeat.
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_TIMEOUT)]
    pub timeout: u32,
}

pub fn execute(args: HeartbeatArgs) -> anyhow::Result<()> {
    validate_heartbeat_timeout(args.timeout)?;

    let town_root = workspace::find_from_cwd()?;
    let beads = Beads::new(&town_root);
    let agent_id = format!("{}/{}s/{}", args.rig, args.worker_type, args.worker);
    let now = Utc::now();

    match beads.get_agent_bead(&agent_id) {
        Ok((_, mut fields)) => {
            fields.last_heartbeat = monotonic_heartbeat(&fields.last_heartbeat, now);
            fields.health = args.health.clone();
            fields.lifecycle_state = args.state.clone();
            fields.assigned_work = args.work.clone();
            if fields.heartbeat_timeout.is_empty() {
                fields.heartbeat_timeout = args.timeout.to_string();
            }
            beads.set_agent_fields(&agent_id, &fields)?;
        }
        Err(e) => {
            eprintln!("warning: agent bead {agent_id} not found ({e}), sending heartbeat mail only");
        }
    }

    let witness = format!("{}/witness", args.rig);
    let mut body = format!(
        "type: {}\nrig: {}\nhealth: {}\nstate: {}",
        args.worker_type, args.rig, args.health, args.state
    );
    if !args.work.is_empty() {
        body.push_str(&format!("\nassigned_work: {}", args.work));
    }

    let router = Router::new(&town_root);
    router.send(&Message {
        to: witness.clone(),
        from: format!("{}/{}s/{}", args.rig, args.worker_type, args.worker),
        subject: format!("HEARTBEAT {}", args.worker),
        body,
        priority: Priority::Normal,
    })?;

    println!("Heartbeat sent to {witness}");
    println!("  worker: {}/{}", args.rig, args.worker);
    println!("  health: {}", args.health);
    println!("  state:  {}", args.state);
    if !args.work.is_empty() {
        println!("  work:   {}", args.work);
    }
    Ok(())
}

/// Never move last_heartbeat backwards, even across skewed clocks.
fn monotonic_heartbeat(stored: &str, now: DateTime<Utc>) -> String {
    if let Ok(prev) = DateTime::parse_from_rfc3339(stored) {
        if prev.with_timezone(&Utc) > now {
            return stored.to_string();
        }
    }
    now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
