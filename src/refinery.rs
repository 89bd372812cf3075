//! Merge queue engine.
//!
//! One engineer per rig, strictly serial. Each tick drains exactly one
//! merge-request: the head of the ready queue (the store orders ready issues
//! by priority then age, so the head is the right pick). The MR is claimed
//! with a single atomic update, processed through fetch → merge → test →
//! push, and either closed with the merge commit or reopened for a later
//! tick. A failed MR never retries within the tick; returning it to the
//! queue keeps the other MRs from starving behind it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::beads::fields::MrFields;
use crate::beads::{CreateOptions, Issue, ListOptions, UpdatePatch, WorkStore, STATUS_CLOSED,
    STATUS_IN_PROGRESS, STATUS_OPEN};
use crate::config::MergeQueueConfig;
use crate::error::{GitError, StoreError};
use crate::git::Git;
use crate::lifecycle::sleep_cancellable;
use crate::mail::{Message, Priority, Router};
use crate::sling::polecat_address;
use crate::subprocess::Tool;

/// Push retry schedule: base delay, doubled per attempt.
const PUSH_RETRIES: u32 = 3;
const PUSH_BASE_DELAY: Duration = Duration::from_secs(1);

/// Result of processing one merge request.
#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    pub success: bool,
    pub merge_commit: String,
    pub error: String,
    pub conflict: bool,
    pub tests_failed: bool,
}

/// The per-rig merge queue processor.
pub struct Engineer<'a> {
    rig: String,
    store: &'a dyn WorkStore,
    git: Git,
    config: MergeQueueConfig,
    /// Mail router for MERGED / MERGE_FAILED notifications; absent in tests.
    mail: Option<Router>,
}

impl<'a> Engineer<'a> {
    pub fn new(rig: &str, store: &'a dyn WorkStore, git: Git, config: MergeQueueConfig) -> Self {
        Self {
            rig: rig.to_string(),
            store,
            git,
            config,
            mail: None,
        }
    }

    pub fn with_mail(mut self, router: Router) -> Self {
        self.mail = Some(router);
        self
    }

    pub fn config(&self) -> &MergeQueueConfig {
        &self.config
    }

    /// Run the engineer loop until cancelled. A tick in flight completes.
    pub fn run(&self, cancel: Arc<AtomicBool>) -> anyhow::Result<()> {
        if !self.config.enabled {
            anyhow::bail!("merge queue is disabled in configuration");
        }
        let interval = self.config.poll_interval()?;
        info!(rig = %self.rig, interval = %self.config.poll_interval, "engineer starting");

        while !cancel.load(Ordering::Relaxed) {
            if let Err(e) = self.process_once() {
                warn!(rig = %self.rig, error = %e, "engineer tick failed");
            }
            sleep_cancellable(interval, &cancel);
        }

        info!(rig = %self.rig, "engineer shutting down");
        Ok(())
    }

    /// One tick: claim and process the head of the ready queue. Returns the
    /// processed MR id, or None when the queue was empty.
    pub fn process_once(&self) -> Result<Option<String>, StoreError> {
        let ready = self.store.ready(Some("merge-request"))?;
        let Some(mr) = ready.into_iter().next() else {
            return Ok(None);
        };

        info!(rig = %self.rig, mr = %mr.id, title = %mr.title, "processing merge request");

        // Claim. The store's record-level exclusion makes this safe even if
        // a second engineer were ever pointed at the same rig.
        self.store.update(
            &mr.id,
            &UpdatePatch {
                status: Some(STATUS_IN_PROGRESS.into()),
                ..Default::default()
            },
        )?;

        let result = self.process_mr(&mr);

        if result.success {
            let reason = format!("merged: {}", result.merge_commit);
            if let Err(e) = self.store.close(&mr.id, &reason) {
                warn!(mr = %mr.id, error = %e, "failed to close merged MR");
            }
            info!(mr = %mr.id, commit = %result.merge_commit, "merged");
            self.notify_merged(&mr);
        } else {
            self.handle_failure(&mr, &result);
        }

        Ok(Some(mr.id))
    }

    /// Fetch, merge, test, and push one MR.
    pub fn process_mr(&self, mr: &Issue) -> ProcessResult {
        let Some(fields) = MrFields::parse(&mr.description) else {
            return ProcessResult {
                error: "no MR fields found in description".into(),
                ..Default::default()
            };
        };
        if fields.branch.is_empty() {
            return ProcessResult {
                error: "branch field is required in merge request".into(),
                ..Default::default()
            };
        }

        if let Err(e) = self.git.fetch_branch("origin", &fields.branch) {
            return ProcessResult {
                error: format!("fetch failed: {e}"),
                ..Default::default()
            };
        }

        self.execute_merge(mr, &fields)
    }

    fn execute_merge(&self, mr: &Issue, fields: &MrFields) -> ProcessResult {
        let target = if fields.target.is_empty() {
            self.config.target_branch.clone()
        } else {
            fields.target.clone()
        };
        let branch = &fields.branch;

        info!(branch = %branch, target = %target, "merging");

        if let Err(e) = self.git.checkout(&target) {
            return ProcessResult {
                error: format!("checkout target failed: {e}"),
                ..Default::default()
            };
        }

        // Non-fatal: the first push to a fresh target has nothing to pull.
        if let Err(e) = self.git.pull("origin", &target) {
            warn!(target = %target, error = %e, "pull failed (may be expected)");
        }

        let message = format!("Merge {branch}: {}", mr.title);
        match self.git.merge_no_ff(&format!("origin/{branch}"), &message) {
            Ok(()) => {}
            Err(GitError::Conflict(_)) => {
                let _ = self.git.abort_merge();
                return ProcessResult {
                    error: "merge conflict".into(),
                    conflict: true,
                    ..Default::default()
                };
            }
            Err(e) => {
                return ProcessResult {
                    error: format!("merge failed: {e}"),
                    ..Default::default()
                };
            }
        }

        if self.config.run_tests {
            if let Err(e) = self.run_tests() {
                info!("tests failed, resetting merge");
                let _ = self.git.reset_hard("HEAD~1");
                return ProcessResult {
                    error: format!("tests failed: {e}"),
                    tests_failed: true,
                    ..Default::default()
                };
            }
        }

        if let Err(e) = self.push_with_retry(&target) {
            info!("push failed, resetting merge");
            let _ = self.git.reset_hard("HEAD~1");
            return ProcessResult {
                error: format!("push failed: {e}"),
                ..Default::default()
            };
        }

        let merge_commit = self
            .git
            .rev_parse("HEAD")
            .unwrap_or_else(|_| "unknown".into());

        if self.config.delete_merged_branches {
            if let Err(e) = self.git.delete_remote_branch("origin", branch) {
                warn!(branch = %branch, error = %e, "could not delete merged branch");
            }
            let _ = self.git.delete_branch(branch, true);
        }

        ProcessResult {
            success: true,
            merge_commit,
            ..Default::default()
        }
    }

    /// Run the configured test command, retrying flaky failures up to the
    /// configured count.
    fn run_tests(&self) -> anyhow::Result<()> {
        let command = &self.config.test_command;
        if command.is_empty() {
            return Ok(());
        }

        let attempts = 1 + self.config.retry_flaky_tests;
        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                info!(attempt, "retrying flaky tests");
            }
            match run_test_command(self.git.work_dir(), command) {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e.to_string(),
            }
        }
        anyhow::bail!("{last_error}")
    }

    /// Push with exponential backoff: 1s, 2s, 4s between attempts.
    fn push_with_retry(&self, target: &str) -> Result<(), GitError> {
        let mut delay = PUSH_BASE_DELAY;
        let mut last = None;

        for attempt in 0..=PUSH_RETRIES {
            if attempt > 0 {
                info!(attempt, delay_secs = delay.as_secs(), "push retry");
                std::thread::sleep(delay);
                delay *= 2;
            }
            match self.git.push("origin", target, false) {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }

        Err(last.unwrap_or_else(|| GitError::PushFailed("push failed".into())))
    }

    /// Reopen a failed MR so it requeues, with the failure recorded and the
    /// retry count bumped. With `on_conflict = assign_back` a conflict also
    /// hands the MR to its worker with a needs-rebase note.
    fn handle_failure(&self, mr: &Issue, result: &ProcessResult) {
        let mut fields = MrFields::parse(&mr.description).unwrap_or_default();
        fields.retry_count += 1;
        if result.conflict {
            if let Ok(sha) = self.git.rev_parse(&format!("origin/{}", fields.branch)) {
                fields.last_conflict_sha = sha;
            }
        }

        let assign_back = result.conflict && !fields.worker.is_empty();
        if result.conflict && self.config.on_conflict == "auto_rebase" {
            // Rebase automation is not wired up; conflicts fall back to the
            // worker like assign_back.
            info!(mr = %mr.id, "on_conflict=auto_rebase configured; assigning back instead");
        }

        let patch = UpdatePatch {
            status: Some(STATUS_OPEN.into()),
            assignee: assign_back
                .then(|| polecat_address(&self.rig, &fields.worker)),
            description: Some(fields.set(&mr.description)),
            ..Default::default()
        };
        if let Err(e) = self.store.update(&mr.id, &patch) {
            warn!(mr = %mr.id, error = %e, "failed to reopen MR");
        }
        if assign_back {
            let note = format!("needs-rebase: {}", result.error);
            if let Err(e) = self.store.add_comment(&mr.id, &note) {
                warn!(mr = %mr.id, error = %e, "failed to annotate MR");
            }
        }

        warn!(mr = %mr.id, error = %result.error, "merge request failed");
        self.notify_failed(&mr.id, &fields, result);
    }

    fn notify_merged(&self, mr: &Issue) {
        let Some(ref mail) = self.mail else { return };
        let Some(fields) = MrFields::parse(&mr.description) else {
            return;
        };
        if fields.worker.is_empty() {
            return;
        }
        let msg = Message {
            to: polecat_address(&self.rig, &fields.worker),
            from: format!("{}/refinery", self.rig),
            subject: format!("MERGED {}", fields.worker),
            body: format!("Branch: {}\nIssue: {}", fields.branch, fields.source_issue),
            priority: Priority::Normal,
        };
        if let Err(e) = mail.send(&msg) {
            warn!(error = %e, "could not notify worker of merge");
        }
    }

    fn notify_failed(&self, mr_id: &str, fields: &MrFields, result: &ProcessResult) {
        let Some(ref mail) = self.mail else { return };
        if fields.worker.is_empty() {
            return;
        }
        let failure_type = if result.conflict {
            "conflict"
        } else if result.tests_failed {
            "test"
        } else if result.error.starts_with("push") {
            "push"
        } else {
            "build"
        };
        let msg = Message {
            to: polecat_address(&self.rig, &fields.worker),
            from: format!("{}/refinery", self.rig),
            subject: format!("MERGE_FAILED {}", fields.worker),
            body: format!(
                "Branch: {}\nIssue: {}\nFailureType: {failure_type}\nError: {}",
                fields.branch, fields.source_issue, result.error
            ),
            priority: Priority::High,
        };
        if let Err(e) = mail.send(&msg) {
            warn!(mr = %mr_id, error = %e, "could not notify worker of failure");
        }
    }
}

fn run_test_command(work_dir: &std::path::Path, command: &str) -> anyhow::Result<()> {
    let parts: Vec<&str> = command.split_whitespace().collect();
    let Some((program, args)) = parts.split_first() else {
        return Ok(());
    };
    let output = Tool::new(program)
        .args(args)
        .current_dir(work_dir)
        .run()?;
    if output.success() {
        Ok(())
    } else {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        anyhow::bail!("exit {}: {detail}", output.exit_code)
    }
}

// --- Submission ---

/// Parsed branch information for submit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchInfo {
    pub branch: String,
    pub issue: String,
    pub worker: String,
}

/// Extract issue id and worker from a branch name. `polecat/<worker>/<issue>`
/// is the worker convention; otherwise any `prefix-token` segment is taken as
/// the issue id.
pub fn parse_branch_name(branch: &str) -> BranchInfo {
    let mut info = BranchInfo {
        branch: branch.to_string(),
        ..Default::default()
    };

    if let Some(rest) = branch.strip_prefix("polecat/") {
        if let Some((worker, issue)) = rest.split_once('/') {
            if !worker.is_empty() && !issue.is_empty() {
                info.worker = worker.to_string();
                info.issue = issue.to_string();
                return info;
            }
        }
    }

    // Fall back to the first segment that looks like an issue id.
    for segment in branch.split('/') {
        if is_issue_token(segment) {
            info.issue = segment.to_string();
            return info;
        }
    }
    info
}

/// `prefix-suffix` where prefix is lowercase alpha and suffix is alphanumeric
/// with an optional `.N` subtask tail.
fn is_issue_token(s: &str) -> bool {
    let Some((prefix, rest)) = s.split_once('-') else {
        return false;
    };
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_lowercase()) {
        return false;
    }
    let (main, sub) = rest.split_once('.').map_or((rest, None), |(m, s)| (m, Some(s)));
    if main.is_empty() || !main.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return false;
    }
    match sub {
        None => true,
        Some(s) => !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
    }
}

/// Options for submitting the current branch to the merge queue.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub branch: String,
    pub issue: String,
    pub epic: String,
    /// -1 inherits from the source issue.
    pub priority: i64,
}

/// Create a merge-request bead for a worker branch. Target auto-detection:
/// an explicit epic wins, then the source issue's parent epic when its
/// integration branch exists, then the default target.
pub fn submit(
    store: &dyn WorkStore,
    git: &Git,
    rig: &str,
    opts: &SubmitOptions,
) -> anyhow::Result<Issue> {
    let branch = if opts.branch.is_empty() {
        git.current_branch().map_err(|e| anyhow::anyhow!("{e}"))?
    } else {
        opts.branch.clone()
    };
    if branch == "main" || branch == "master" {
        anyhow::bail!("cannot submit {branch} to the merge queue");
    }

    let info = parse_branch_name(&branch);
    let issue_id = if opts.issue.is_empty() {
        info.issue.clone()
    } else {
        opts.issue.clone()
    };
    if issue_id.is_empty() {
        anyhow::bail!("cannot determine source issue from branch '{branch}'; use --issue");
    }

    // At most one live MR per branch; a resubmit must retry or reject the
    // existing one instead.
    if let Ok(existing) = find_mr_by_branch(store, &branch) {
        anyhow::bail!(
            "merge request {} already open for branch '{branch}'",
            existing.id
        );
    }

    let target = if !opts.epic.is_empty() {
        format!("integration/{}", opts.epic)
    } else {
        detect_integration_branch(store, git, &issue_id)?.unwrap_or_else(|| "main".into())
    };

    let priority = if opts.priority >= 0 {
        opts.priority
    } else {
        store.show(&issue_id).map(|i| i.priority).unwrap_or(2)
    };

    let fields = MrFields {
        branch: branch.clone(),
        target,
        source_issue: issue_id.clone(),
        worker: info.worker,
        rig: rig.to_string(),
        ..Default::default()
    };

    let mr = store.create(&CreateOptions {
        title: format!("Merge: {issue_id}"),
        issue_type: "merge-request".into(),
        priority,
        description: fields.format(),
        ..Default::default()
    })?;
    Ok(mr)
}

/// When the source issue's parent is an epic with a live integration branch,
/// MRs default onto it.
pub fn detect_integration_branch(
    store: &dyn WorkStore,
    git: &Git,
    issue_id: &str,
) -> anyhow::Result<Option<String>> {
    let issue = match store.show(issue_id) {
        Ok(i) => i,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if issue.parent.is_empty() {
        return Ok(None);
    }
    let parent = match store.show(&issue.parent) {
        Ok(p) => p,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if parent.issue_type != "epic" {
        return Ok(None);
    }

    let branch = format!("integration/{}", parent.id);
    if git.branch_exists(&branch).unwrap_or(false) {
        return Ok(Some(branch));
    }
    if git.remote_branch_exists("origin", &branch).unwrap_or(false) {
        return Ok(Some(branch));
    }
    Ok(None)
}

// --- Retry and reject ---

/// Requeue a failed MR. With `now`, process it immediately instead of
/// waiting for the next engineer tick.
pub fn retry(engineer: &Engineer, mr_id: &str, now: bool) -> anyhow::Result<()> {
    let mr = engineer.store.show(mr_id)?;
    if mr.status == STATUS_CLOSED {
        anyhow::bail!("merge request {mr_id} is closed; nothing to retry");
    }
    engineer.store.reopen(mr_id)?;
    if now {
        engineer.process_once()?;
    }
    Ok(())
}

/// Outcome of a manual rejection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RejectResult {
    pub mr_id: String,
    pub branch: String,
    pub worker: String,
    pub source_issue: String,
}

/// Close an MR as rejected without merging. The source issue stays open; the
/// work is not done.
pub fn reject(
    store: &dyn WorkStore,
    rig: &str,
    mr_id_or_branch: &str,
    reason: &str,
    mail: Option<&Router>,
) -> anyhow::Result<RejectResult> {
    let mr = match store.show(mr_id_or_branch) {
        Ok(issue) if issue.issue_type == "merge-request" => issue,
        _ => find_mr_by_branch(store, mr_id_or_branch)?,
    };

    let mut fields = MrFields::parse(&mr.description).unwrap_or_default();
    fields.close_reason = format!("rejected: {reason}");
    store.update(
        &mr.id,
        &UpdatePatch {
            description: Some(fields.set(&mr.description)),
            ..Default::default()
        },
    )?;
    store.close(&mr.id, &format!("rejected: {reason}"))?;

    if let (Some(router), false) = (mail, fields.worker.is_empty()) {
        let msg = Message {
            to: polecat_address(rig, &fields.worker),
            from: format!("{rig}/refinery"),
            subject: format!("MERGE_FAILED {}", fields.worker),
            body: format!(
                "Branch: {}\nIssue: {}\nFailureType: rejected\nError: {reason}",
                fields.branch, fields.source_issue
            ),
            priority: Priority::High,
        };
        if let Err(e) = router.send(&msg) {
            warn!(error = %e, "could not notify worker of rejection");
        }
    }

    Ok(RejectResult {
        mr_id: mr.id,
        branch: fields.branch,
        worker: fields.worker,
        source_issue: fields.source_issue,
    })
}

fn find_mr_by_branch(store: &dyn WorkStore, branch: &str) -> anyhow::Result<Issue> {
    let mrs = store.list(&ListOptions {
        issue_type: "merge-request".into(),
        ..Default::default()
    })?;
    mrs.into_iter()
        .find(|mr| {
            MrFields::parse(&mr.description).is_some_and(|f| f.branch == branch)
                && mr.status != STATUS_CLOSED
        })
        .ok_or_else(|| anyhow::anyhow!("no open merge request for '{branch}'"))
}

// --- Integration branches ---

/// Create `integration/<epic>` from origin/main and push it.
pub fn integration_create(store: &dyn WorkStore, git: &Git, epic_id: &str) -> anyhow::Result<String> {
    let epic = store.show(epic_id)?;
    if epic.issue_type != "epic" {
        anyhow::bail!("'{epic_id}' is a {}, not an epic", epic.issue_type);
    }

    let branch = format!("integration/{epic_id}");
    if git.branch_exists(&branch).map_err(|e| anyhow::anyhow!("{e}"))? {
        anyhow::bail!("integration branch '{branch}' already exists locally");
    }
    if git.remote_branch_exists("origin", &branch).unwrap_or(false) {
        anyhow::bail!("integration branch '{branch}' already exists on origin");
    }

    git.fetch("origin").map_err(|e| anyhow::anyhow!("{e}"))?;
    git.create_branch_from(&branch, "origin/main")
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    if let Err(e) = git.push("origin", &branch, false) {
        let _ = git.delete_branch(&branch, true);
        return Err(anyhow::anyhow!("pushing to origin: {e}"));
    }

    // Record the branch on the epic; non-fatal when the update loses.
    let new_desc = add_integration_branch_field(&epic.description, &branch);
    if new_desc != epic.description {
        if let Err(e) = store.update(
            epic_id,
            &UpdatePatch {
                description: Some(new_desc),
                ..Default::default()
            },
        ) {
            warn!(epic = %epic_id, error = %e, "could not record integration branch on epic");
        }
    }

    Ok(branch)
}

/// Add or replace the `integration_branch` line in an epic description.
fn add_integration_branch_field(description: &str, branch: &str) -> String {
    let field_line = format!("integration_branch: {branch}");
    if description.is_empty() {
        return field_line;
    }

    let mut lines: Vec<String> = Vec::new();
    let mut found = false;
    for line in description.lines() {
        if line
            .trim()
            .to_ascii_lowercase()
            .starts_with("integration_branch:")
        {
            lines.push(field_line.clone());
            found = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !found {
        lines.insert(0, field_line);
    }
    lines.join("\n")
}

/// Options for landing an integration branch.
#[derive(Debug, Clone, Default)]
pub struct LandOptions {
    pub force: bool,
    pub skip_tests: bool,
    pub dry_run: bool,
    pub test_command: String,
}

/// All open MRs targeting an integration branch.
pub fn open_mrs_for_integration(
    store: &dyn WorkStore,
    target_branch: &str,
) -> Result<Vec<Issue>, StoreError> {
    let mrs = store.list(&ListOptions {
        issue_type: "merge-request".into(),
        status: STATUS_OPEN.into(),
        ..Default::default()
    })?;
    Ok(mrs
        .into_iter()
        .filter(|mr| {
            MrFields::parse(&mr.description).is_some_and(|f| f.target == target_branch)
        })
        .collect())
}

/// Land an integration branch onto main: one `--no-ff` merge, tests, push,
/// branch deletion, epic closed. Refuses while MRs still target the branch
/// unless forced.
pub fn integration_land(
    store: &dyn WorkStore,
    git: &Git,
    epic_id: &str,
    opts: &LandOptions,
) -> anyhow::Result<()> {
    let epic = store.show(epic_id)?;
    if epic.issue_type != "epic" {
        anyhow::bail!("'{epic_id}' is a {}, not an epic", epic.issue_type);
    }

    let branch = format!("integration/{epic_id}");
    let local = git.branch_exists(&branch).unwrap_or(false);
    if !local {
        if !git.remote_branch_exists("origin", &branch).unwrap_or(false) {
            anyhow::bail!("integration branch '{branch}' does not exist (locally or on origin)");
        }
        git.fetch_branch("origin", &branch)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    let open_mrs = open_mrs_for_integration(store, &branch)?;
    if !open_mrs.is_empty() && !opts.force {
        let ids: Vec<&str> = open_mrs.iter().map(|mr| mr.id.as_str()).collect();
        anyhow::bail!(
            "cannot land: {} open MRs targeting {branch} ({}) (use --force to override)",
            open_mrs.len(),
            ids.join(", ")
        );
    }

    if opts.dry_run {
        return Ok(());
    }

    let status = git.status().map_err(|e| anyhow::anyhow!("{e}"))?;
    if !status.clean {
        anyhow::bail!("working directory is not clean; commit or stash first");
    }

    git.fetch("origin").map_err(|e| anyhow::anyhow!("{e}"))?;
    git.checkout("main").map_err(|e| anyhow::anyhow!("{e}"))?;
    if git.pull("origin", "main").is_err() {
        info!("pull from origin/main skipped");
    }

    let message = format!("Merge {branch}: {}\n\nEpic: {epic_id}", epic.title);
    let merge_ref = if local {
        branch.clone()
    } else {
        format!("origin/{branch}")
    };
    if let Err(e) = git.merge_no_ff(&merge_ref, &message) {
        let _ = git.abort_merge();
        anyhow::bail!("merge failed: {e}");
    }

    if !opts.skip_tests && !opts.test_command.is_empty() {
        if let Err(e) = run_test_command(git.work_dir(), &opts.test_command) {
            let _ = git.reset_hard("HEAD~1");
            anyhow::bail!("tests failed: {e}");
        }
    }

    if let Err(e) = git.push("origin", "main", false) {
        let _ = git.reset_hard("HEAD~1");
        anyhow::bail!("push failed: {e}");
    }

    if let Err(e) = git.delete_remote_branch("origin", &branch) {
        warn!(branch = %branch, error = %e, "could not delete remote integration branch");
    }
    if local {
        if let Err(e) = git.delete_branch(&branch, true) {
            warn!(branch = %branch, error = %e, "could not delete local integration branch");
        }
    }

    if let Err(e) = store.close(epic_id, "integration branch landed") {
        warn!(epic = %epic_id, error = %e, "could not close epic");
    }

    Ok(())
}

/// Integration branch status for one epic.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IntegrationStatus {
    pub epic: String,
    pub branch: String,
    pub created: String,
    pub ahead_of_main: u32,
    pub merged_mrs: Vec<MrSummary>,
    pub pending_mrs: Vec<MrSummary>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MrSummary {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
}

pub fn integration_status(
    store: &dyn WorkStore,
    git: &Git,
    epic_id: &str,
) -> anyhow::Result<IntegrationStatus> {
    let branch = format!("integration/{epic_id}");

    let _ = git.fetch("origin");
    let local = git.branch_exists(&branch).unwrap_or(false);
    let remote = git.remote_branch_exists("origin", &branch).unwrap_or(false);
    if !local && !remote {
        anyhow::bail!("integration branch '{branch}' does not exist");
    }
    let reference = if local {
        branch.clone()
    } else {
        format!("origin/{branch}")
    };

    let created = git.branch_created_date(&reference).unwrap_or_default();
    let ahead = git.commits_ahead("main", &reference).unwrap_or(0);

    let mrs = store.list(&ListOptions {
        issue_type: "merge-request".into(),
        ..Default::default()
    })?;

    let mut merged = Vec::new();
    let mut pending = Vec::new();
    for mr in mrs {
        let Some(fields) = MrFields::parse(&mr.description) else {
            continue;
        };
        if fields.target != branch {
            continue;
        }
        let title = mr
            .title
            .strip_prefix("Merge: ")
            .unwrap_or(&mr.title)
            .to_string();
        if mr.status == STATUS_CLOSED {
            merged.push(MrSummary {
                id: mr.id,
                title,
                status: String::new(),
            });
        } else {
            pending.push(MrSummary {
                id: mr.id,
                title,
                status: mr.status,
            });
        }
    }

    Ok(IntegrationStatus {
        epic: epic_id.to_string(),
        branch,
        created,
        ahead_of_main: ahead,
        merged_mrs: merged,
        pending_mrs: pending,
    })
}
