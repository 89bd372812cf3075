//! Typed fields embedded in issue descriptions.
//!
//! The work store only offers free-form description text, so structured
//! fields live as leading `key: value` lines. Keys are matched
//! case-insensitively (`-` and `_` interchangeable) on parse and emitted as
//! canonical lowercase underscore keys. Everything that is not a known field
//! line is the prose body and survives updates verbatim.

/// Split a description into (known field values, prose body).
///
/// `known` lists canonical keys. A line anywhere in the description whose
/// `key:` prefix normalises to a known key is captured (first occurrence
/// wins); all other lines make up the body.
fn split_fields(desc: &str, known: &[&str]) -> (Vec<(String, String)>, String) {
    let mut captured: Vec<(String, String)> = Vec::new();
    let mut body_lines: Vec<&str> = Vec::new();

    for line in desc.lines() {
        if let Some((key, value)) = field_line(line) {
            let key = normalize_key(&key);
            if known.contains(&key.as_str()) {
                if !captured.iter().any(|(k, _)| *k == key) {
                    captured.push((key, value));
                }
                continue;
            }
        }
        body_lines.push(line);
    }

    let body = trim_blank_edges(&body_lines).join("\n");
    (captured, body)
}

/// Parse a `key: value` line. The key must be a single word of letters,
/// digits, underscores, or dashes.
fn field_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    let idx = trimmed.find(':')?;
    let key = &trimmed[..idx];
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some((key.to_string(), trimmed[idx + 1..].trim().to_string()))
}

fn normalize_key(key: &str) -> String {
    key.to_ascii_lowercase().replace('-', "_")
}

fn trim_blank_edges<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    match (start, end) {
        (Some(s), Some(e)) => lines[s..=e].to_vec(),
        _ => Vec::new(),
    }
}

fn lookup<'a>(fields: &'a [(String, String)], key: &str) -> &'a str {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .unwrap_or("")
}

/// Emit `key: value` lines for non-empty values, in the given order.
fn format_lines(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Replace a family's field lines in a description, preserving the body.
fn set_in_description(desc: &str, known: &[&str], formatted: &str) -> String {
    let (_, body) = split_fields(desc, known);
    match (formatted.is_empty(), body.is_empty()) {
        (true, _) => body,
        (false, true) => formatted.to_string(),
        (false, false) => format!("{formatted}\n\n{body}"),
    }
}

// --- Agent fields ---

/// Lifecycle states stored on agent beads.
pub const LIFECYCLE_SPAWNING: &str = "spawning";
pub const LIFECYCLE_IDLE: &str = "idle";
pub const LIFECYCLE_WORKING: &str = "working";
pub const LIFECYCLE_BLOCKED: &str = "blocked";
pub const LIFECYCLE_CRASHED: &str = "crashed";
pub const LIFECYCLE_TERMINATED: &str = "terminated";

/// Health values stored on agent beads.
pub const HEALTH_HEALTHY: &str = "healthy";
pub const HEALTH_STALE: &str = "stale";
pub const HEALTH_DEAD: &str = "dead";

/// Typed fields on an agent bead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentFields {
    pub lifecycle_state: String,
    pub health: String,
    pub last_heartbeat: String,
    pub heartbeat_timeout: String,
    pub assigned_work: String,
    pub hook_bead: String,
    pub session_id: String,
    pub workspace: String,
    pub cleanup_status: String,
}

const AGENT_KEYS: &[&str] = &[
    "lifecycle_state",
    "health",
    "last_heartbeat",
    "heartbeat_timeout",
    "assigned_work",
    "hook_bead",
    "session_id",
    "workspace",
    "cleanup_status",
];

impl AgentFields {
    /// Parse from a description. Returns None if no agent fields are present.
    pub fn parse(desc: &str) -> Option<Self> {
        let (captured, _) = split_fields(desc, AGENT_KEYS);
        if captured.is_empty() {
            return None;
        }
        Some(Self {
            lifecycle_state: lookup(&captured, "lifecycle_state").to_string(),
            health: lookup(&captured, "health").to_string(),
            last_heartbeat: lookup(&captured, "last_heartbeat").to_string(),
            heartbeat_timeout: lookup(&captured, "heartbeat_timeout").to_string(),
            assigned_work: lookup(&captured, "assigned_work").to_string(),
            hook_bead: lookup(&captured, "hook_bead").to_string(),
            session_id: lookup(&captured, "session_id").to_string(),
            workspace: lookup(&captured, "workspace").to_string(),
            cleanup_status: lookup(&captured, "cleanup_status").to_string(),
        })
    }

    pub fn format(&self) -> String {
        format_lines(&[
            ("lifecycle_state", &self.lifecycle_state),
            ("health", &self.health),
            ("last_heartbeat", &self.last_heartbeat),
            ("heartbeat_timeout", &self.heartbeat_timeout),
            ("assigned_work", &self.assigned_work),
            ("hook_bead", &self.hook_bead),
            ("session_id", &self.session_id),
            ("workspace", &self.workspace),
            ("cleanup_status", &self.cleanup_status),
        ])
    }

    /// Re-emit the description with these fields, preserving the prose body.
    pub fn set(&self, desc: &str) -> String {
        set_in_description(desc, AGENT_KEYS, &self.format())
    }
}

// --- Merge request fields ---

/// Typed fields on a merge-request bead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MrFields {
    pub branch: String,
    pub target: String,
    pub source_issue: String,
    pub worker: String,
    pub rig: String,
    pub convoy: String,
    pub retry_count: u32,
    pub last_conflict_sha: String,
    pub merge_commit: String,
    pub close_reason: String,
}

const MR_KEYS: &[&str] = &[
    "branch",
    "target",
    "source_issue",
    "worker",
    "rig",
    "convoy",
    "retry_count",
    "last_conflict_sha",
    "merge_commit",
    "close_reason",
];

impl MrFields {
    pub fn parse(desc: &str) -> Option<Self> {
        let (captured, _) = split_fields(desc, MR_KEYS);
        if captured.is_empty() {
            return None;
        }
        Some(Self {
            branch: lookup(&captured, "branch").to_string(),
            target: lookup(&captured, "target").to_string(),
            source_issue: lookup(&captured, "source_issue").to_string(),
            worker: lookup(&captured, "worker").to_string(),
            rig: lookup(&captured, "rig").to_string(),
            convoy: lookup(&captured, "convoy").to_string(),
            retry_count: lookup(&captured, "retry_count").parse().unwrap_or(0),
            last_conflict_sha: lookup(&captured, "last_conflict_sha").to_string(),
            merge_commit: lookup(&captured, "merge_commit").to_string(),
            close_reason: lookup(&captured, "close_reason").to_string(),
        })
    }

    pub fn format(&self) -> String {
        let retry = if self.retry_count > 0 {
            self.retry_count.to_string()
        } else {
            String::new()
        };
        format_lines(&[
            ("branch", &self.branch),
            ("target", &self.target),
            ("source_issue", &self.source_issue),
            ("worker", &self.worker),
            ("rig", &self.rig),
            ("convoy", &self.convoy),
            ("retry_count", &retry),
            ("last_conflict_sha", &self.last_conflict_sha),
            ("merge_commit", &self.merge_commit),
            ("close_reason", &self.close_reason),
        ])
    }

    pub fn set(&self, desc: &str) -> String {
        set_in_description(desc, MR_KEYS, &self.format())
    }
}

// --- Convoy fields ---

/// Typed fields on a convoy bead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvoyFields {
    pub rigs: String,
    pub spawned_work: String,
    pub stage: String,
    pub coordinator: String,
    pub started: String,
    pub formula: String,
}

const CONVOY_KEYS: &[&str] = &[
    "rigs",
    "spawned_work",
    "stage",
    "coordinator",
    "started",
    "formula",
];

impl ConvoyFields {
    pub fn parse(desc: &str) -> Option<Self> {
        let (captured, _) = split_fields(desc, CONVOY_KEYS);
        if captured.is_empty() {
            return None;
        }
        Some(Self {
            rigs: lookup(&captured, "rigs").to_string(),
            spawned_work: lookup(&captured, "spawned_work").to_string(),
            stage: lookup(&captured, "stage").to_string(),
            coordinator: lookup(&captured, "coordinator").to_string(),
            started: lookup(&captured, "started").to_string(),
            formula: lookup(&captured, "formula").to_string(),
        })
    }

    pub fn format(&self) -> String {
        format_lines(&[
            ("rigs", &self.rigs),
            ("spawned_work", &self.spawned_work),
            ("stage", &self.stage),
            ("coordinator", &self.coordinator),
            ("started", &self.started),
            ("formula", &self.formula),
        ])
    }

    pub fn set(&self, desc: &str) -> String {
        set_in_description(desc, CONVOY_KEYS, &self.format())
    }
}

// --- Hook fields ---

/// The (workspace, branch) binding of a work item to a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookFields {
    pub workspace: String,
    pub worktree_base: String,
    pub branch: String,
    pub artifacts: String,
    pub commits: String,
}

const HOOK_KEYS: &[&str] = &[
    "hook_workspace",
    "hook_worktree_base",
    "hook_branch",
    "hook_artifacts",
    "hook_commits",
];

impl HookFields {
    pub fn parse(desc: &str) -> Option<Self> {
        let (captured, _) = split_fields(desc, HOOK_KEYS);
        if captured.is_empty() {
            return None;
        }
        Some(Self {
            workspace: lookup(&captured, "hook_workspace").to_string(),
            worktree_base: lookup(&captured, "hook_worktree_base").to_string(),
            branch: lookup(&captured, "hook_branch").to_string(),
            artifacts: lookup(&captured, "hook_artifacts").to_string(),
            commits: lookup(&captured, "hook_commits").to_string(),
        })
    }

    pub fn format(&self) -> String {
        format_lines(&[
            ("hook_workspace", &self.workspace),
            ("hook_worktree_base", &self.worktree_base),
            ("hook_branch", &self.branch),
            ("hook_artifacts", &self.artifacts),
            ("hook_commits", &self.commits),
        ])
    }

    pub fn set(&self, desc: &str) -> String {
        set_in_description(desc, HOOK_KEYS, &self.format())
    }
}

// --- Attachment fields ---

/// Dispatch bookkeeping stored on the work item so it survives process death.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentFields {
    pub attached_molecule: String,
    pub attached_at: String,
    pub attached_args: String,
    pub dispatched_by: String,
}

const ATTACHMENT_KEYS: &[&str] = &[
    "attached_molecule",
    "attached_at",
    "attached_args",
    "dispatched_by",
];

impl AttachmentFields {
    pub fn parse(desc: &str) -> Option<Self> {
        let (captured, _) = split_fields(desc, ATTACHMENT_KEYS);
        if captured.is_empty() {
            return None;
        }
        Some(Self {
            attached_molecule: lookup(&captured, "attached_molecule").to_string(),
            attached_at: lookup(&captured, "attached_at").to_string(),
            attached_args: lookup(&captured, "attached_args").to_string(),
            dispatched_by: lookup(&captured, "dispatched_by").to_string(),
        })
    }

    pub fn format(&self) -> String {
        format_lines(&[
            ("attached_molecule", &self.attached_molecule),
            ("attached_at", &self.attached_at),
            ("attached_args", &self.attached_args),
            ("dispatched_by", &self.dispatched_by),
        ])
    }

    pub fn set(&self, desc: &str) -> String {
        set_in_description(desc, ATTACHMENT_KEYS, &self.format())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_attachment_complete() {
        let desc = "attached_molecule: bd-abc123\nattached_at: 2026-02-06T10:00:00Z\nattached_args: --no-session foo bar\ndispatched_by: mayor";
        let got = AttachmentFields::parse(desc).unwrap();
        assert_eq!(got.attached_molecule, "bd-abc123");
        assert_eq!(got.attached_at, "2026-02-06T10:00:00Z");
        assert_eq!(got.attached_args, "--no-session foo bar");
        assert_eq!(got.dispatched_by, "mayor");
    }

    #[test]
    fn parse_attachment_absent() {
        assert!(AttachmentFields::parse("Some other content").is_none());
        assert!(AttachmentFields::parse("").is_none());
    }

    #[test]
    fn parse_case_insensitive_keys() {
        let desc = "Attached-Molecule: bd-test\nAttached-At: 2026-01-01T00:00:00Z";
        let got = AttachmentFields::parse(desc).unwrap();
        assert_eq!(got.attached_molecule, "bd-test");
        assert_eq!(got.attached_at, "2026-01-01T00:00:00Z");
    }

    #[test]
    fn format_skips_empty_fields() {
        let fields = AttachmentFields {
            attached_molecule: "bd-xyz".into(),
            ..Default::default()
        };
        assert_eq!(fields.format(), "attached_molecule: bd-xyz");
        assert_eq!(AttachmentFields::default().format(), "");
    }

    #[test]
    fn set_replaces_existing_fields() {
        let desc = "attached_molecule: bd-old\nattached_at: 2026-01-01T00:00:00Z\n\nSome other content";
        let fields = AttachmentFields {
            attached_molecule: "bd-new".into(),
            attached_at: "2026-02-06T10:00:00Z".into(),
            ..Default::default()
        };
        assert_eq!(
            fields.set(desc),
            "attached_molecule: bd-new\nattached_at: 2026-02-06T10:00:00Z\n\nSome other content"
        );
    }

    #[test]
    fn set_preserves_body_below_fields() {
        let desc = "Some important notes\n\nattached_molecule: bd-old";
        let fields = AttachmentFields {
            attached_molecule: "bd-new".into(),
            ..Default::default()
        };
        assert_eq!(
            fields.set(desc),
            "attached_molecule: bd-new\n\nSome important notes"
        );
    }

    #[test]
    fn parse_mr_complete() {
        let desc = "branch: polecat/alice-test\ntarget: main\nsource_issue: gt-123\nworker: alice\nrig: greenplace\nconvoy: hq-convoy1";
        let got = MrFields::parse(desc).unwrap();
        assert_eq!(got.branch, "polecat/alice-test");
        assert_eq!(got.target, "main");
        assert_eq!(got.source_issue, "gt-123");
        assert_eq!(got.worker, "alice");
        assert_eq!(got.rig, "greenplace");
        assert_eq!(got.convoy, "hq-convoy1");
        assert_eq!(got.retry_count, 0);
    }

    #[test]
    fn parse_mr_retry_count() {
        let desc = "branch: polecat/alice-test\nretry_count: 3\nlast_conflict_sha: abc123";
        let got = MrFields::parse(desc).unwrap();
        assert_eq!(got.retry_count, 3);
        assert_eq!(got.last_conflict_sha, "abc123");
    }

    #[test]
    fn mr_round_trip() {
        let fields = MrFields {
            branch: "polecat/alice-x".into(),
            target: "integration/gt-epic".into(),
            source_issue: "gt-9".into(),
            worker: "alice".into(),
            rig: "greenplace".into(),
            retry_count: 2,
            ..Default::default()
        };
        assert_eq!(MrFields::parse(&fields.format()).unwrap(), fields);
    }

    #[test]
    fn parse_convoy() {
        let desc = "rigs: greenplace,sandport\nspawned_work: gt-123,gt-456\nstage: execution\ncoordinator: mayor\nstarted: 2026-02-06T10:00:00Z";
        let got = ConvoyFields::parse(desc).unwrap();
        assert_eq!(got.rigs, "greenplace,sandport");
        assert_eq!(got.spawned_work, "gt-123,gt-456");
        assert_eq!(got.stage, "execution");
        assert_eq!(got.coordinator, "mayor");
    }

    #[test]
    fn convoy_set_replaces() {
        let desc = "rigs: oldrig\nstage: planning\n\nSome notes";
        let fields = ConvoyFields {
            rigs: "newrig".into(),
            stage: "execution".into(),
            ..Default::default()
        };
        assert_eq!(fields.set(desc), "rigs: newrig\nstage: execution\n\nSome notes");
    }

    #[test]
    fn parse_hook() {
        let desc = "hook_workspace: polecats/alice\nhook_worktree_base: mayor/greenplace\nhook_branch: polecat/alice-20260206-143000";
        let got = HookFields::parse(desc).unwrap();
        assert_eq!(got.workspace, "polecats/alice");
        assert_eq!(got.worktree_base, "mayor/greenplace");
        assert_eq!(got.branch, "polecat/alice-20260206-143000");
    }

    #[test]
    fn agent_round_trip() {
        let fields = AgentFields {
            lifecycle_state: "working".into(),
            health: "healthy".into(),
            last_heartbeat: "2026-02-06T10:00:00Z".into(),
            heartbeat_timeout: "180".into(),
            assigned_work: "gt-123".into(),
            hook_bead: "gt-123".into(),
            ..Default::default()
        };
        assert_eq!(AgentFields::parse(&fields.format()).unwrap(), fields);
    }

    #[test]
    fn unknown_field_lines_pass_through_to_body() {
        let desc = "branch: polecat/x\ncustom_key: kept\n\nbody text";
        let fields = MrFields::parse(desc).unwrap();
        let out = fields.set(desc);
        assert!(out.contains("custom_key: kept"));
        assert!(out.contains("body text"));
    }

    #[test]
    fn first_occurrence_wins() {
        let desc = "branch: first\nbranch: second";
        let got = MrFields::parse(desc).unwrap();
        assert_eq!(got.branch, "first");
    }

    #[test]
    fn prose_with_colon_is_not_a_field() {
        let desc = "Note: this line has a colon but 'note' is unknown\nbranch: b1";
        let got = MrFields::parse(desc).unwrap();
        assert_eq!(got.branch, "b1");
        let out = got.set(desc);
        assert!(out.contains("Note: this line has a colon"));
    }
}
