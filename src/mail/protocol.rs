//! Protocol message classification and parsing.
//!
//! Agents coordinate through mail with structured subjects. Classification
//! is pure and total: every subject maps to exactly one kind, with `Unknown`
//! as the catch-all. Body parsers are fail-soft; missing optional fields are
//! left empty.

use anyhow::bail;

/// Protocol message kinds, classified from the subject line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    PolecatDone,
    Shutdown,
    Help,
    Merged,
    MergeFailed,
    Handoff,
    SwarmStart,
    Heartbeat,
    Unknown,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::PolecatDone => "polecat_done",
            ProtocolKind::Shutdown => "shutdown",
            ProtocolKind::Help => "help",
            ProtocolKind::Merged => "merged",
            ProtocolKind::MergeFailed => "merge_failed",
            ProtocolKind::Handoff => "handoff",
            ProtocolKind::SwarmStart => "swarm_start",
            ProtocolKind::Heartbeat => "heartbeat",
            ProtocolKind::Unknown => "unknown",
        }
    }
}

/// Classify a subject line. Senders may decorate subjects (emoji prefixes),
/// so matching is on the protocol fragment, not the full line.
pub fn classify(subject: &str) -> ProtocolKind {
    if subject.contains("POLECAT_DONE") {
        ProtocolKind::PolecatDone
    } else if subject.contains("LIFECYCLE:Shutdown") {
        ProtocolKind::Shutdown
    } else if subject.contains("HELP:") {
        ProtocolKind::Help
    } else if subject.contains("MERGE_FAILED") {
        ProtocolKind::MergeFailed
    } else if subject.contains("MERGED") {
        ProtocolKind::Merged
    } else if subject.contains("HANDOFF from") {
        ProtocolKind::Handoff
    } else if subject.contains("SWARM_START") {
        ProtocolKind::SwarmStart
    } else if subject.contains("HEARTBEAT") {
        ProtocolKind::Heartbeat
    } else {
        ProtocolKind::Unknown
    }
}

/// The token following `keyword` in a subject line.
fn subject_arg(subject: &str, keyword: &str) -> String {
    subject
        .split_once(keyword)
        .map(|(_, rest)| rest.split_whitespace().next().unwrap_or("").to_string())
        .unwrap_or_default()
}

/// Value of a `Key: value` line in a body, matched case-insensitively.
fn body_field(body: &str, key: &str) -> String {
    for line in body.lines() {
        if let Some((k, v)) = line.split_once(':') {
            if k.trim().eq_ignore_ascii_case(key) {
                return v.trim().to_string();
            }
        }
    }
    String::new()
}

/// POLECAT_DONE: a worker finished (or gave up on) its assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolecatDone {
    pub polecat: String,
    /// COMPLETED, PHASE_COMPLETE, or ESCALATED.
    pub exit: String,
    pub issue: String,
    pub mr: String,
    pub gate: String,
    pub branch: String,
}

pub fn parse_polecat_done(subject: &str, body: &str) -> anyhow::Result<PolecatDone> {
    if classify(subject) != ProtocolKind::PolecatDone {
        bail!("not a POLECAT_DONE subject: {subject:?}");
    }
    Ok(PolecatDone {
        polecat: subject_arg(subject, "POLECAT_DONE"),
        exit: body_field(body, "Exit"),
        issue: body_field(body, "Issue"),
        mr: body_field(body, "MR"),
        gate: body_field(body, "Gate"),
        branch: body_field(body, "Branch"),
    })
}

/// LIFECYCLE:Shutdown: an agent announcing orderly exit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shutdown {
    pub agent: String,
}

pub fn parse_shutdown(subject: &str) -> anyhow::Result<Shutdown> {
    if classify(subject) != ProtocolKind::Shutdown {
        bail!("not a LIFECYCLE:Shutdown subject: {subject:?}");
    }
    Ok(Shutdown {
        agent: subject_arg(subject, "LIFECYCLE:Shutdown"),
    })
}

/// HELP: a worker asking its supervisor for assistance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Help {
    pub topic: String,
    pub agent: String,
    pub issue: String,
    pub problem: String,
    pub tried: String,
}

pub fn parse_help(subject: &str, body: &str) -> anyhow::Result<Help> {
    if classify(subject) != ProtocolKind::Help {
        bail!("not a HELP subject: {subject:?}");
    }
    let topic = subject
        .split_once("HELP:")
        .map(|(_, rest)| rest.trim().to_string())
        .unwrap_or_default();
    Ok(Help {
        topic,
        agent: body_field(body, "Agent"),
        issue: body_field(body, "Issue"),
        problem: body_field(body, "Problem"),
        tried: body_field(body, "Tried"),
    })
}

/// MERGED: the refinery confirming a worker's branch landed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Merged {
    pub polecat: String,
    pub branch: String,
    pub issue: String,
}

pub fn parse_merged(subject: &str, body: &str) -> anyhow::Result<Merged> {
    if classify(subject) != ProtocolKind::Merged {
        bail!("not a MERGED subject: {subject:?}");
    }
    Ok(Merged {
        polecat: subject_arg(subject, "MERGED"),
        branch: body_field(body, "Branch"),
        issue: body_field(body, "Issue"),
    })
}

/// MERGE_FAILED: the refinery reporting a failed merge attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeFailed {
    pub polecat: String,
    pub branch: String,
    pub issue: String,
    /// build, test, conflict, or push.
    pub failure_type: String,
    pub error: String,
}

pub fn parse_merge_failed(subject: &str, body: &str) -> anyhow::Result<MergeFailed> {
    if classify(subject) != ProtocolKind::MergeFailed {
        bail!("not a MERGE_FAILED subject: {subject:?}");
    }
    Ok(MergeFailed {
        polecat: subject_arg(subject, "MERGE_FAILED"),
        branch: body_field(body, "Branch"),
        issue: body_field(body, "Issue"),
        failure_type: body_field(body, "FailureType"),
        error: body_field(body, "Error"),
    })
}

/// SWARM_START: a coordinator fanning work out to a batch of workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwarmStart {
    pub swarm_id: String,
    pub total: u32,
}

pub fn parse_swarm_start(body: &str) -> anyhow::Result<SwarmStart> {
    Ok(SwarmStart {
        swarm_id: body_field(body, "SwarmID"),
        total: body_field(body, "Total").parse().unwrap_or(0),
    })
}

/// HEARTBEAT: a worker's periodic liveness signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Heartbeat {
    pub worker: String,
    pub worker_type: String,
    pub rig: String,
    pub health: String,
    pub state: String,
    pub assigned_work: String,
}

pub fn parse_heartbeat(subject: &str, body: &str) -> anyhow::Result<Heartbeat> {
    if classify(subject) != ProtocolKind::Heartbeat {
        bail!("not a HEARTBEAT subject: {subject:?}");
    }
    let mut assigned_work = body_field(body, "assigned_work");
    if assigned_work.is_empty() {
        assigned_work = body_field(body, "work");
    }
    Ok(Heartbeat {
        worker: subject_arg(subject, "HEARTBEAT"),
        worker_type: body_field(body, "type"),
        rig: body_field(body, "rig"),
        health: body_field(body, "health"),
        state: body_field(body, "state"),
        assigned_work,
    })
}

/// Assessment of a HELP request: whether the supervisor can handle it
/// mechanically or must escalate to the coordinator.
#[derive(Debug, Clone, Default)]
pub struct HelpAssessment {
    pub can_help: bool,
    pub help_action: String,
    pub needs_escalation: bool,
    pub escalation_reason: String,
}

/// Triage a help request. Push and build problems have mechanical fixes;
/// conflicts, test failures, and unclear requirements need a human-grade
/// decision and escalate.
pub fn assess_help_request(help: &Help) -> HelpAssessment {
    let text = format!("{} {}", help.topic, help.problem).to_lowercase();

    if text.contains("conflict") {
        return HelpAssessment {
            needs_escalation: true,
            escalation_reason: "merge conflicts need coordinator resolution".into(),
            ..Default::default()
        };
    }
    if text.contains("test") {
        return HelpAssessment {
            needs_escalation: true,
            escalation_reason: "test failures need the work owner's judgment".into(),
            ..Default::default()
        };
    }
    if text.contains("unclear") || text.contains("requirement") || text.contains("understand") {
        return HelpAssessment {
            needs_escalation: true,
            escalation_reason: "unclear requirements need the dispatcher".into(),
            ..Default::default()
        };
    }
    if text.contains("push") {
        return HelpAssessment {
            can_help: true,
            help_action: "retry the push after fetching and rebasing onto origin".into(),
            ..Default::default()
        };
    }
    if text.contains("build") || text.contains("compile") {
        return HelpAssessment {
            can_help: true,
            help_action: "rerun the build from a clean tree and read the first error".into(),
            ..Default::default()
        };
    }

    HelpAssessment {
        needs_escalation: true,
        escalation_reason: "unrecognised problem".into(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_covers_all_kinds() {
        assert_eq!(classify("POLECAT_DONE alice"), ProtocolKind::PolecatDone);
        assert_eq!(classify("LIFECYCLE:Shutdown bob"), ProtocolKind::Shutdown);
        assert_eq!(
            classify("HELP: Git conflict on polecat/alice-test"),
            ProtocolKind::Help
        );
        assert_eq!(classify("MERGED alice"), ProtocolKind::Merged);
        assert_eq!(classify("MERGE_FAILED bob"), ProtocolKind::MergeFailed);
        assert_eq!(classify("HANDOFF from alice"), ProtocolKind::Handoff);
        assert_eq!(classify("SWARM_START batch-123"), ProtocolKind::SwarmStart);
        assert_eq!(classify("HEARTBEAT alice"), ProtocolKind::Heartbeat);
        assert_eq!(classify("Unknown message format"), ProtocolKind::Unknown);
        assert_eq!(classify(""), ProtocolKind::Unknown);
    }

    #[test]
    fn classify_tolerates_decorated_subjects() {
        assert_eq!(classify("💓 HEARTBEAT alice"), ProtocolKind::Heartbeat);
        assert_eq!(classify("🤝 HANDOFF from alice"), ProtocolKind::Handoff);
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(ProtocolKind::PolecatDone.as_str(), "polecat_done");
        assert_eq!(ProtocolKind::MergeFailed.as_str(), "merge_failed");
        assert_eq!(ProtocolKind::Unknown.as_str(), "unknown");
    }

    #[test]
    fn parse_polecat_done_complete() {
        let got = parse_polecat_done(
            "POLECAT_DONE alice",
            "Exit: COMPLETED\nIssue: gt-123\nMR: mr-456\nBranch: polecat/alice-test",
        )
        .unwrap();
        assert_eq!(got.polecat, "alice");
        assert_eq!(got.exit, "COMPLETED");
        assert_eq!(got.issue, "gt-123");
        assert_eq!(got.mr, "mr-456");
        assert_eq!(got.branch, "polecat/alice-test");
        assert_eq!(got.gate, "");
    }

    #[test]
    fn parse_polecat_done_with_gate() {
        let got = parse_polecat_done(
            "POLECAT_DONE bob",
            "Exit: PHASE_COMPLETE\nIssue: gt-789\nGate: gate-001",
        )
        .unwrap();
        assert_eq!(got.exit, "PHASE_COMPLETE");
        assert_eq!(got.gate, "gate-001");
        assert_eq!(got.mr, "");
    }

    #[test]
    fn parse_polecat_done_rejects_wrong_subject() {
        assert!(parse_polecat_done("DONE alice", "").is_err());
    }

    #[test]
    fn parse_shutdown_names_agent() {
        let got = parse_shutdown("LIFECYCLE:Shutdown bob").unwrap();
        assert_eq!(got.agent, "bob");
        assert!(parse_shutdown("SHUTDOWN bob").is_err());
    }

    #[test]
    fn parse_help_fields() {
        let got = parse_help(
            "HELP: Git conflict",
            "Agent: alice\nIssue: gt-123\nProblem: Merge conflict on main\nTried: git merge --abort",
        )
        .unwrap();
        assert_eq!(got.topic, "Git conflict");
        assert_eq!(got.agent, "alice");
        assert_eq!(got.problem, "Merge conflict on main");
        assert_eq!(got.tried, "git merge --abort");
    }

    #[test]
    fn parse_merged_fields() {
        let got = parse_merged("MERGED alice", "Branch: polecat/alice-test\nIssue: gt-123").unwrap();
        assert_eq!(got.polecat, "alice");
        assert_eq!(got.branch, "polecat/alice-test");
        assert_eq!(got.issue, "gt-123");
    }

    #[test]
    fn parse_merge_failed_fields() {
        let got = parse_merge_failed(
            "MERGE_FAILED alice",
            "Branch: polecat/alice-test\nIssue: gt-123\nFailureType: build\nError: compilation error in main.rs",
        )
        .unwrap();
        assert_eq!(got.failure_type, "build");
        assert_eq!(got.error, "compilation error in main.rs");
    }

    #[test]
    fn parse_heartbeat_fields() {
        let got = parse_heartbeat(
            "HEARTBEAT alice",
            "type: polecat\nrig: greenplace\nhealth: healthy\nstate: working\nassigned_work: gt-123",
        )
        .unwrap();
        assert_eq!(got.worker, "alice");
        assert_eq!(got.worker_type, "polecat");
        assert_eq!(got.rig, "greenplace");
        assert_eq!(got.health, "healthy");
        assert_eq!(got.state, "working");
        assert_eq!(got.assigned_work, "gt-123");
    }

    #[test]
    fn parse_heartbeat_work_alias() {
        let got = parse_heartbeat(
            "HEARTBEAT charlie",
            "type: polecat\nrig: greenplace\nhealth: stale\nstate: working\nwork: gt-456",
        )
        .unwrap();
        assert_eq!(got.assigned_work, "gt-456");
    }

    #[test]
    fn parse_swarm_start_fail_soft() {
        let got = parse_swarm_start("SwarmID: batch-123\nTotal: 5").unwrap();
        assert_eq!(got.swarm_id, "batch-123");
        assert_eq!(got.total, 5);

        let empty = parse_swarm_start("").unwrap();
        assert_eq!(empty.swarm_id, "");
        assert_eq!(empty.total, 0);
    }

    #[test]
    fn body_fields_are_case_insensitive() {
        let got = parse_merged("MERGED bob", "branch: polecat/bob-x\nISSUE: gt-9").unwrap();
        assert_eq!(got.branch, "polecat/bob-x");
        assert_eq!(got.issue, "gt-9");
    }

    #[test]
    fn help_triage() {
        let escalate = |topic: &str, problem: &str| {
            assess_help_request(&Help {
                topic: topic.into(),
                problem: problem.into(),
                ..Default::default()
            })
        };

        let a = escalate("Git conflict", "merge conflict on main branch");
        assert!(a.needs_escalation && !a.can_help);
        assert!(!a.escalation_reason.is_empty());

        let a = escalate("Git push failed", "push rejected");
        assert!(a.can_help && !a.needs_escalation);
        assert!(!a.help_action.is_empty());

        let a = escalate("Test failures", "unit tests failing");
        assert!(a.needs_escalation);

        let a = escalate("Build failed", "compile error");
        assert!(a.can_help);

        let a = escalate("Requirements unclear", "don't understand what to implement");
        assert!(a.needs_escalation);

        let a = escalate("Unknown problem", "something weird happened");
        assert!(a.needs_escalation);
    }
}
