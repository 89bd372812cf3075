//! Work store adapter.
//!
//! Wraps the external `bd` CLI in a working directory, giving the engines a
//! typed surface: issues, filtered listings, the ready queue, atomic updates,
//! comments, and messages. `bd update` is atomic per issue id (record-level
//! exclusion in the store); every claim in this crate is a single update call
//! against that guarantee.

pub mod fields;
pub mod molecules;
pub mod validation;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ExitError, StoreError};
use crate::subprocess::Tool;

use fields::AgentFields;

/// Issue statuses used across the engines.
pub const STATUS_OPEN: &str = "open";
pub const STATUS_HOOKED: &str = "hooked";
pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_BLOCKED: &str = "blocked";
pub const STATUS_PINNED: &str = "pinned";
pub const STATUS_CLOSED: &str = "closed";

/// An issue as returned by `bd --json`. Tolerant of missing and future
/// fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, rename = "issue_type", alias = "type")]
    pub issue_type: String,
    #[serde(default)]
    pub assignee: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub closed_at: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub dependencies: Vec<IssueRef>,
    #[serde(default)]
    pub dependents: Vec<IssueRef>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

/// Summary of a related issue in dependency listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueRef {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, rename = "issue_type", alias = "type")]
    pub issue_type: String,
}

/// A message from the store's message primitive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoredMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default, alias = "sender")]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, alias = "message")]
    pub body: String,
    #[serde(default)]
    pub created_at: String,
}

/// Filter for [`WorkStore::list`]. Empty strings mean "any"; priority -1
/// means "any".
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub issue_type: String,
    pub status: String,
    pub assignee: String,
    pub priority: i64,
    pub stale_since: String,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            issue_type: String::new(),
            status: String::new(),
            assignee: String::new(),
            priority: -1,
            stale_since: String::new(),
        }
    }
}

/// Options for [`WorkStore::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub title: String,
    pub issue_type: String,
    pub priority: i64,
    pub description: String,
    pub parent: String,
    /// Explicit id (agent beads use their worker address); empty lets the
    /// store assign one.
    pub id: String,
}

/// Partial patch for [`WorkStore::update`]. Only set fields are written; the
/// whole patch applies atomically.
#[derive(Debug, Clone, Default)]
pub struct UpdatePatch {
    pub status: Option<String>,
    pub assignee: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i64>,
}

/// Typed surface over the work database, implemented by [`Beads`] for the bd
/// CLI and by an in-memory store in tests.
pub trait WorkStore {
    fn show(&self, id: &str) -> Result<Issue, StoreError>;
    fn list(&self, opts: &ListOptions) -> Result<Vec<Issue>, StoreError>;
    /// Open issues with no open blockers, sorted by (priority asc, age asc).
    fn ready(&self, issue_type: Option<&str>) -> Result<Vec<Issue>, StoreError>;
    fn create(&self, opts: &CreateOptions) -> Result<Issue, StoreError>;
    fn update(&self, id: &str, patch: &UpdatePatch) -> Result<(), StoreError>;
    fn close(&self, id: &str, reason: &str) -> Result<(), StoreError>;
    fn reopen(&self, id: &str) -> Result<(), StoreError>;
    fn add_comment(&self, id: &str, text: &str) -> Result<(), StoreError>;
    /// Record a blocks-relation: `blocker` blocks `issue`.
    fn dep_add(&self, issue: &str, blocker: &str) -> Result<(), StoreError>;
}

/// bd CLI client bound to a working directory.
pub struct Beads {
    work_dir: PathBuf,
    timeout: Duration,
}

impl Beads {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            timeout: Duration::from_secs(30),
        }
    }

    fn bd(&self) -> Tool {
        Tool::new("bd")
            .current_dir(&self.work_dir)
            .timeout(self.timeout)
    }

    fn run(&self, args: &[&str]) -> Result<String, StoreError> {
        let output = self
            .bd()
            .args(args)
            .run()
            .map_err(|e| map_spawn_error(&e))?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(map_failure(&output.stderr, args))
        }
    }

    /// Fetch an agent bead along with its parsed fields.
    pub fn get_agent_bead(&self, agent_id: &str) -> Result<(Issue, AgentFields), StoreError> {
        let issue = self.show(agent_id)?;
        let fields = AgentFields::parse(&issue.description).unwrap_or_default();
        Ok((issue, fields))
    }

    /// Re-serialise an agent bead's typed fields, preserving the prose body.
    pub fn set_agent_fields(&self, agent_id: &str, fields: &AgentFields) -> Result<(), StoreError> {
        let issue = self.show(agent_id)?;
        let desc = fields.set(&issue.description);
        self.update(
            agent_id,
            &UpdatePatch {
                description: Some(desc),
                ..Default::default()
            },
        )
    }

    /// Unread messages for a recipient, oldest first.
    pub fn list_messages(&self, recipient: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let stdout = self.run(&["message", "list", recipient, "--json"])?;
        parse_json(&stdout)
    }

    /// True if a formula with this name exists.
    pub fn formula_exists(&self, name: &str) -> Result<bool, StoreError> {
        let stdout = self.run(&["formula", "list", "--quiet"])?;
        Ok(stdout.lines().any(|l| l.trim() == name))
    }

    /// Cook a formula so its proto exists. Cooking is idempotent.
    pub fn cook(&self, formula: &str) -> Result<(), StoreError> {
        self.run(&["--no-daemon", "cook", formula]).map(|_| ())
    }

    /// Instantiate a formula into a wisp. Returns the wisp root id.
    pub fn mol_wisp(&self, formula: &str, vars: &[(String, String)]) -> Result<String, StoreError> {
        let mut args: Vec<String> = vec![
            "--no-daemon".into(),
            "mol".into(),
            "wisp".into(),
            formula.into(),
            "--json".into(),
        ];
        for (k, v) in vars {
            args.push("--var".into());
            args.push(format!("{k}={v}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let stdout = self.run(&arg_refs)?;
        let parsed: serde_json::Value = parse_json(&stdout)?;
        let root = parsed["root_id"]
            .as_str()
            .or_else(|| parsed["id"].as_str())
            .unwrap_or("");
        if root.is_empty() {
            return Err(StoreError::Invalid("wisp output carries no root id".into()));
        }
        Ok(root.to_string())
    }

    /// Bond a wisp onto an existing bead, forming a compound. Returns the
    /// compound root id (the wisp root when the output omits one).
    pub fn mol_bond(&self, wisp_root: &str, bead: &str) -> Result<String, StoreError> {
        let stdout = self.run(&["--no-daemon", "mol", "bond", wisp_root, bead, "--json"])?;
        let parsed: serde_json::Value = parse_json(&stdout)?;
        Ok(parsed["root_id"]
            .as_str()
            .filter(|s| !s.is_empty())
            .unwrap_or(wisp_root)
            .to_string())
    }

    /// Send a message through the store's message primitive. `from` is passed
    /// as the sender identity in the environment.
    pub fn send_message(
        &self,
        to: &str,
        from: &str,
        body: &str,
        subject: &str,
        high_importance: bool,
    ) -> Result<(), StoreError> {
        let mut args = vec!["message", "send", to, body, "-s", subject];
        if high_importance {
            args.push("--importance");
            args.push("high");
        }
        let output = self
            .bd()
            .args(&args)
            .env("BEADS_AGENT_NAME", from)
            .run()
            .map_err(|e| map_spawn_error(&e))?;
        if output.success() {
            Ok(())
        } else {
            Err(map_failure(&output.stderr, &args))
        }
    }
}

impl WorkStore for Beads {
    fn show(&self, id: &str) -> Result<Issue, StoreError> {
        let stdout = self.run(&["show", id, "--json"])?;
        let issues: Vec<Issue> = parse_json(&stdout)?;
        issues
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list(&self, opts: &ListOptions) -> Result<Vec<Issue>, StoreError> {
        let mut args: Vec<String> = vec!["list".into(), "--json".into()];
        if !opts.issue_type.is_empty() {
            args.push(format!("--type={}", opts.issue_type));
        }
        if !opts.status.is_empty() {
            args.push(format!("--status={}", opts.status));
        }
        if !opts.assignee.is_empty() {
            args.push(format!("--assignee={}", opts.assignee));
        }
        if opts.priority >= 0 {
            args.push(format!("--priority={}", opts.priority));
        }
        if !opts.stale_since.is_empty() {
            args.push(format!("--stale-since={}", opts.stale_since));
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let stdout = self.run(&arg_refs)?;
        parse_json(&stdout)
    }

    fn ready(&self, issue_type: Option<&str>) -> Result<Vec<Issue>, StoreError> {
        let stdout = self.run(&["ready", "--json"])?;
        let issues: Vec<Issue> = parse_json(&stdout)?;
        Ok(match issue_type {
            Some(t) => issues.into_iter().filter(|i| i.issue_type == t).collect(),
            None => issues,
        })
    }

    fn create(&self, opts: &CreateOptions) -> Result<Issue, StoreError> {
        let priority = opts.priority.to_string();
        let mut args = vec![
            "create",
            "--json",
            "-t",
            &opts.title,
            "--type",
            &opts.issue_type,
            "-p",
            &priority,
        ];
        if !opts.description.is_empty() {
            args.push("-d");
            args.push(&opts.description);
        }
        if !opts.parent.is_empty() {
            args.push("--parent");
            args.push(&opts.parent);
        }
        if !opts.id.is_empty() {
            args.push("--id");
            args.push(&opts.id);
        }
        let stdout = self.run(&args)?;
        // bd create --json emits the created issue as a single object.
        serde_json::from_str(&stdout).map_err(|e| StoreError::Invalid(e.to_string()))
    }

    fn update(&self, id: &str, patch: &UpdatePatch) -> Result<(), StoreError> {
        let mut args: Vec<String> = vec!["update".into(), id.into()];
        if let Some(ref status) = patch.status {
            args.push(format!("--status={status}"));
        }
        if let Some(ref assignee) = patch.assignee {
            args.push(format!("--assignee={assignee}"));
        }
        if let Some(ref description) = patch.description {
            args.push(format!("--description={description}"));
        }
        if let Some(priority) = patch.priority {
            args.push(format!("--priority={priority}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run(&arg_refs).map(|_| ())
    }

    fn close(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        if reason.is_empty() {
            self.run(&["close", id]).map(|_| ())
        } else {
            self.run(&["close", id, "--reason", reason]).map(|_| ())
        }
    }

    fn reopen(&self, id: &str) -> Result<(), StoreError> {
        self.run(&["reopen", id]).map(|_| ())
    }

    fn add_comment(&self, id: &str, text: &str) -> Result<(), StoreError> {
        self.run(&["comments", "add", id, text]).map(|_| ())
    }

    fn dep_add(&self, issue: &str, blocker: &str) -> Result<(), StoreError> {
        self.run(&["dep", "add", issue, blocker]).map(|_| ())
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(stdout: &str) -> Result<T, StoreError> {
    serde_json::from_str(stdout).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn map_spawn_error(e: &anyhow::Error) -> StoreError {
    if let Some(exit) = e.downcast_ref::<ExitError>() {
        match exit {
            ExitError::ToolNotFound { .. } => StoreError::Transport("bd not installed".into()),
            ExitError::Timeout { timeout_secs, .. } => {
                StoreError::Timeout(format!("bd timed out after {timeout_secs}s"))
            }
            other => StoreError::Transport(other.to_string()),
        }
    } else {
        StoreError::Transport(e.to_string())
    }
}

fn map_failure(stderr: &str, args: &[impl AsRef<str>]) -> StoreError {
    let msg = stderr.trim().to_string();
    let lower = msg.to_ascii_lowercase();
    let what = args
        .iter()
        .map(|a| a.as_ref())
        .collect::<Vec<_>>()
        .join(" ");
    if lower.contains("not found") || lower.contains("no such issue") {
        StoreError::NotFound(if msg.is_empty() { what } else { msg })
    } else if lower.contains("conflict") || lower.contains("locked") || lower.contains("busy") {
        StoreError::Conflict(if msg.is_empty() { what } else { msg })
    } else if lower.contains("invalid") || lower.contains("malformed") {
        StoreError::Invalid(msg)
    } else {
        StoreError::Transport(if msg.is_empty() {
            format!("bd {what} failed")
        } else {
            msg
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_parses_bd_json() {
        let json = r#"[{
            "id": "gt-abc",
            "title": "Fix login",
            "description": "branch: polecat/x",
            "status": "open",
            "priority": 2,
            "issue_type": "merge-request",
            "assignee": "greenplace/polecats/alice",
            "created_at": "2026-02-06T10:00:00Z",
            "updated_at": "2026-02-06T11:00:00Z"
        }]"#;
        let issues: Vec<Issue> = serde_json::from_str(json).unwrap();
        assert_eq!(issues[0].id, "gt-abc");
        assert_eq!(issues[0].issue_type, "merge-request");
        assert_eq!(issues[0].priority, 2);
    }

    #[test]
    fn issue_tolerates_type_alias_and_extra_fields() {
        let json = r#"[{"id": "gt-x", "type": "agent", "labels": ["a"], "future": 1}]"#;
        let issues: Vec<Issue> = serde_json::from_str(json).unwrap();
        assert_eq!(issues[0].issue_type, "agent");
        assert_eq!(issues[0].status, "");
    }

    #[test]
    fn failure_mapping() {
        assert!(matches!(
            map_failure("error: issue gt-x not found", &["show", "gt-x"]),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            map_failure("error: database is locked", &["update", "gt-x"]),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            map_failure("error: update conflict, retry", &["update", "gt-x"]),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            map_failure("something else broke", &["list"]),
            StoreError::Transport(_)
        ));
    }

    #[test]
    fn list_options_default_means_any() {
        let opts = ListOptions::default();
        assert!(opts.issue_type.is_empty());
        assert!(opts.status.is_empty());
        assert_eq!(opts.priority, -1);
    }
}
