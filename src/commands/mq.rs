//! `gt mq` - merge queue operations.

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::beads::fields::MrFields;
use crate::beads::{Beads, Issue, ListOptions, WorkStore, STATUS_OPEN};
use crate::commands::print_json;
use crate::config::RigConfig;
use crate::error::ExitError;
use crate::git::Git;
use crate::mail::Router;
use crate::refinery::{self, Engineer, LandOptions, SubmitOptions};
use crate::workspace::{self, TownPaths};

#[derive(Debug, Subcommand)]
pub enum MqCommand {
    /// Submit the current branch to the merge queue.
    Submit(SubmitArgs),
    /// Show the merge queue for a rig.
    List(ListArgs),
    /// Requeue a failed merge request.
    Retry(RetryArgs),
    /// Reject a merge request without merging.
    Reject(RejectArgs),
    /// Show detailed merge request status.
    Status(StatusArgs),
    /// Manage integration branches for epics.
    #[command(subcommand)]
    Integration(IntegrationCommand),
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Source branch (default: current branch).
    #[arg(long, default_value = "")]
    pub branch: String,
    /// Source issue id (default: parsed from the branch name).
    #[arg(long, default_value = "")]
    pub issue: String,
    /// Target this epic's integration branch instead of main.
    #[arg(long, default_value = "")]
    pub epic: String,
    /// Override priority 0-4 (default: inherit from the source issue).
    #[arg(short, long, default_value_t = -1)]
    pub priority: i64,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Rig name.
    pub rig: String,
    /// Show only ready-to-merge requests (no blockers).
    #[arg(long)]
    pub ready: bool,
    /// Filter by status (open, in_progress, closed).
    #[arg(long, default_value = "")]
    pub status: String,
    /// Filter by worker name.
    #[arg(long, default_value = "")]
    pub worker: String,
    /// Show MRs targeting integration/<epic>.
    #[arg(long, default_value = "")]
    pub epic: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct RetryArgs {
    pub rig: String,
    pub mr_id: String,
    /// Process immediately instead of waiting for the next refinery tick.
    #[arg(long)]
    pub now: bool,
}

#[derive(Debug, Args)]
pub struct RejectArgs {
    pub rig: String,
    /// MR id or branch name.
    pub mr: String,
    /// Reason for rejection.
    #[arg(short, long)]
    pub reason: String,
    /// Send a mail notification to the worker.
    #[arg(long)]
    pub notify: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    pub mr_id: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum IntegrationCommand {
    /// Create an integration branch for an epic.
    Create { epic: String },
    /// Merge an epic's integration branch to main.
    Land {
        epic: String,
        /// Land even if some MRs are still open.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        skip_tests: bool,
        /// Preview only, make no changes.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show integration branch status for an epic.
    Status {
        epic: String,
        #[arg(long)]
        json: bool,
    },
}

pub fn execute(command: MqCommand) -> anyhow::Result<()> {
    match command {
        MqCommand::Submit(args) => run_submit(args),
        MqCommand::List(args) => run_list(args),
        MqCommand::Retry(args) => run_retry(args),
        MqCommand::Reject(args) => run_reject(args),
        MqCommand::Status(args) => run_status(args),
        MqCommand::Integration(command) => run_integration(command),
    }
}

/// Rig context for commands taking an explicit rig name.
fn rig_context(rig: &str) -> anyhow::Result<(TownPaths, Beads, Git, RigConfig)> {
    let town_root = workspace::find_from_cwd()?;
    let town = TownPaths::new(&town_root);
    let rigs = workspace::list_rigs(&town_root)?;
    if !rigs.iter().any(|r| r == rig) {
        return Err(ExitError::Usage(format!("rig '{rig}' not found in this town")).into());
    }
    let clone = town.rig_clone(rig);
    let config = RigConfig::load(&town.rig_dir(rig))?;
    let beads = Beads::new(&clone);
    let git = Git::new(&clone);
    Ok((town, beads, git, config))
}

fn run_submit(args: SubmitArgs) -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd()?;
    let cwd = std::env::current_dir()?;
    let rig = workspace::rig_from_dir(&town_root, &cwd)?;

    let beads = Beads::new(&cwd);
    let git = Git::new(&cwd);
    let mr = refinery::submit(
        &beads,
        &git,
        &rig,
        &SubmitOptions {
            branch: args.branch,
            issue: args.issue,
            epic: args.epic,
            priority: args.priority,
        },
    )?;

    let fields = MrFields::parse(&mr.description).unwrap_or_default();
    println!("Created merge request {}", mr.id);
    println!("  source: {}", fields.branch);
    println!("  target: {}", fields.target);
    println!("  issue:  {}", fields.source_issue);
    if !fields.worker.is_empty() {
        println!("  worker: {}", fields.worker);
    }
    println!("  priority: P{}", mr.priority);
    Ok(())
}

/// Row in `mq list` output.
#[derive(Debug, Serialize)]
struct MrListRow {
    id: String,
    status: String,
    priority: i64,
    branch: String,
    worker: String,
    age: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    waiting_on: Option<String>,
}

fn run_list(args: ListArgs) -> anyhow::Result<()> {
    let (_town, beads, _git, _config) = rig_context(&args.rig)?;

    let issues: Vec<Issue> = if args.ready {
        beads.ready(Some("merge-request"))?
    } else {
        beads.list(&ListOptions {
            issue_type: "merge-request".into(),
            status: if args.status.is_empty() {
                STATUS_OPEN.into()
            } else {
                args.status.clone()
            },
            ..Default::default()
        })?
    };

    let mut rows = Vec::new();
    for issue in &issues {
        let fields = MrFields::parse(&issue.description).unwrap_or_default();

        if !args.worker.is_empty() && !fields.worker.eq_ignore_ascii_case(&args.worker) {
            continue;
        }
        if !args.epic.is_empty() && fields.target != format!("integration/{}", args.epic) {
            continue;
        }

        let blocked = !issue.blocked_by.is_empty() || !issue.dependencies.is_empty();
        let status = if issue.status == STATUS_OPEN {
            if blocked { "blocked" } else { "ready" }
        } else {
            issue.status.as_str()
        };

        rows.push(MrListRow {
            id: issue.id.clone(),
            status: status.to_string(),
            priority: issue.priority,
            branch: fields.branch,
            worker: fields.worker,
            age: format_age(&issue.created_at),
            waiting_on: issue.blocked_by.first().cloned(),
        });
    }

    if args.json {
        return print_json(&rows);
    }

    println!("Merge queue for '{}':", args.rig);
    if rows.is_empty() {
        println!("  (empty)");
        return Ok(());
    }
    println!(
        "  {:<14} {:<12} {:<8} {:<32} {:<10} {}",
        "ID", "STATUS", "PRIORITY", "BRANCH", "WORKER", "AGE"
    );
    for row in &rows {
        println!(
            "  {:<14} {:<12} P{:<7} {:<32} {:<10} {}",
            truncate(&row.id, 14),
            row.status,
            row.priority,
            truncate(&row.branch, 32),
            row.worker,
            row.age
        );
        if let Some(ref blocker) = row.waiting_on {
            println!("  {:<14} (waiting on {blocker})", "");
        }
    }
    Ok(())
}

fn run_retry(args: RetryArgs) -> anyhow::Result<()> {
    let (town, beads, git, config) = rig_context(&args.rig)?;
    let engineer = Engineer::new(&args.rig, &beads, git, config.merge_queue)
        .with_mail(Router::new(town.root()));

    refinery::retry(&engineer, &args.mr_id, args.now)?;
    if args.now {
        println!("Merge request {} processed", args.mr_id);
    } else {
        println!("Merge request {} queued for retry", args.mr_id);
        println!("  (will be processed on the next refinery cycle)");
    }
    Ok(())
}

fn run_reject(args: RejectArgs) -> anyhow::Result<()> {
    let (town, beads, _git, _config) = rig_context(&args.rig)?;
    let router = args.notify.then(|| Router::new(town.root()));

    let result = refinery::reject(&beads, &args.rig, &args.mr, &args.reason, router.as_ref())?;
    println!("Rejected: {}", result.branch);
    if !result.worker.is_empty() {
        println!("  worker: {}", result.worker);
    }
    println!("  reason: {}", args.reason);
    if !result.source_issue.is_empty() {
        println!("  issue:  {} (not closed - work not done)", result.source_issue);
    }
    Ok(())
}

/// JSON output for `mq status`.
#[derive(Debug, Serialize)]
struct MrStatusOutput {
    id: String,
    title: String,
    status: String,
    priority: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    assignee: String,
    created_at: String,
    updated_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    closed_at: String,
    #[serde(flatten)]
    fields: MrStatusFields,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    blocks: Vec<String>,
}

#[derive(Debug, Serialize)]
struct MrStatusFields {
    #[serde(skip_serializing_if = "String::is_empty")]
    branch: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    target: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    source_issue: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    worker: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    rig: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    merge_commit: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    close_reason: String,
    retry_count: u32,
}

fn run_status(args: StatusArgs) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let beads = Beads::new(&cwd);
    let mr = beads.show(&args.mr_id)?;
    let fields = MrFields::parse(&mr.description).unwrap_or_default();

    let output = MrStatusOutput {
        id: mr.id.clone(),
        title: mr.title.clone(),
        status: mr.status.clone(),
        priority: mr.priority,
        assignee: mr.assignee.clone(),
        created_at: mr.created_at.clone(),
        updated_at: mr.updated_at.clone(),
        closed_at: mr.closed_at.clone(),
        fields: MrStatusFields {
            branch: fields.branch,
            target: fields.target,
            source_issue: fields.source_issue,
            worker: fields.worker,
            rig: fields.rig,
            merge_commit: fields.merge_commit,
            close_reason: fields.close_reason,
            retry_count: fields.retry_count,
        },
        depends_on: mr.dependencies.iter().map(|d| d.id.clone()).collect(),
        blocks: mr.dependents.iter().map(|d| d.id.clone()).collect(),
    };

    if args.json {
        return print_json(&output);
    }

    println!("Merge request {}", output.id);
    println!("  {}", output.title);
    println!("  status:   {} (P{})", output.status, output.priority);
    if !output.assignee.is_empty() {
        println!("  assignee: {}", output.assignee);
    }
    if !output.fields.branch.is_empty() {
        println!("  branch:   {} → {}", output.fields.branch, output.fields.target);
    }
    if !output.fields.worker.is_empty() {
        println!("  worker:   {}", output.fields.worker);
    }
    if output.fields.retry_count > 0 {
        println!("  retries:  {}", output.fields.retry_count);
    }
    if !output.fields.merge_commit.is_empty() {
        println!("  merged:   {}", output.fields.merge_commit);
    }
    if !output.fields.close_reason.is_empty() {
        println!("  closed:   {}", output.fields.close_reason);
    }
    for dep in &output.depends_on {
        println!("  waiting on {dep}");
    }
    for dep in &output.blocks {
        println!("  blocking {dep}");
    }
    Ok(())
}

fn run_integration(command: IntegrationCommand) -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd()?;
    let cwd = std::env::current_dir()?;
    let rig = workspace::rig_from_dir(&town_root, &cwd)?;
    let town = TownPaths::new(&town_root);
    let clone = town.rig_clone(&rig);
    let beads = Beads::new(&clone);
    let git = Git::new(&clone);

    match command {
        IntegrationCommand::Create { epic } => {
            let branch = refinery::integration_create(&beads, &git, &epic)?;
            println!("Created integration branch");
            println!("  epic:   {epic}");
            println!("  branch: {branch}");
            println!("  future MRs for this epic's children can target it:");
            println!("    gt mq submit --epic {epic}");
            Ok(())
        }
        IntegrationCommand::Land {
            epic,
            force,
            skip_tests,
            dry_run,
        } => {
            let config = RigConfig::load(&town.rig_dir(&rig))?;
            let opts = LandOptions {
                force,
                skip_tests,
                dry_run,
                test_command: config.merge_queue.test_command.clone(),
            };
            refinery::integration_land(&beads, &git, &epic, &opts)?;
            if dry_run {
                println!("Dry run: integration/{epic} is ready to land");
            } else {
                println!("Landed integration/{epic} to main");
            }
            Ok(())
        }
        IntegrationCommand::Status { epic, json } => {
            let status = refinery::integration_status(&beads, &git, &epic)?;
            if json {
                return print_json(&status);
            }
            println!("Integration: {}", status.branch);
            if !status.created.is_empty() {
                println!("  created: {}", status.created);
            }
            println!("  ahead of main: {} commits", status.ahead_of_main);
            println!("  merged MRs ({}):", status.merged_mrs.len());
            for mr in &status.merged_mrs {
                println!("    {:<14} {}", mr.id, mr.title);
            }
            println!("  pending MRs ({}):", status.pending_mrs.len());
            for mr in &status.pending_mrs {
                println!("    {:<14} {} ({})", mr.id, mr.title, mr.status);
            }
            Ok(())
        }
    }
}

/// Compact age like `5m` or `2d` from an RFC3339 creation time.
fn format_age(created_at: &str) -> String {
    let Ok(t) = DateTime::parse_from_rfc3339(created_at) else {
        return "?".into();
    };
    let elapsed = Utc::now().signed_duration_since(t.with_timezone(&Utc));
    let secs = elapsed.num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86_400)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else if max > 3 {
        format!("{}...", &s[..max - 3])
    } else {
        s[..max].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_formatting() {
        let now = Utc::now();
        let m5 = (now - chrono::Duration::minutes(5)).to_rfc3339();
        assert_eq!(format_age(&m5), "5m");
        let h3 = (now - chrono::Duration::hours(3)).to_rfc3339();
        assert_eq!(format_age(&h3), "3h");
        let d2 = (now - chrono::Duration::days(2)).to_rfc3339();
        assert_eq!(format_age(&d2), "2d");
        assert_eq!(format_age("junk"), "?");
    }

    #[test]
    fn truncation() {
        assert_eq!(truncate("short", 14), "short");
        assert_eq!(truncate("a-very-long-branch-name", 10), "a-very-...");
    }
}
