//! Worker lifecycle and health engine.
//!
//! One supervisory loop per town. Each tick makes three passes over the
//! worker population: a health pass driven by heartbeat age, a crash
//! recovery pass for workers whose session vanished, and a cleanup pass for
//! workers that finished and reported themselves safe to remove.
//!
//! The engine keeps no per-agent state between ticks; every pass reads the
//! work store fresh and computes from the snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::beads::fields::{
    AgentFields, HEALTH_DEAD, HEALTH_HEALTHY, HEALTH_STALE, LIFECYCLE_CRASHED,
    LIFECYCLE_TERMINATED,
};
use crate::beads::{Beads, ListOptions, UpdatePatch, WorkStore, STATUS_BLOCKED, STATUS_IN_PROGRESS};
use crate::config::LifecycleConfig;
use crate::error::StoreError;
use crate::git::Git;
use crate::session::{session_name, Tmux};
use crate::workspace::TownPaths;

/// Classify heartbeat age against the worker's timeout.
///
/// Boundaries are half-open: at exactly `timeout` the worker is stale, at
/// exactly `2 * timeout` it is dead.
pub fn classify_health(age: Duration, timeout: Duration) -> &'static str {
    if age < timeout {
        HEALTH_HEALTHY
    } else if age < 2 * timeout {
        HEALTH_STALE
    } else {
        HEALTH_DEAD
    }
}

/// Outcome of one agent's health pass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthCheckResult {
    pub agent_id: String,
    pub worker: String,
    pub previous_health: String,
    pub current_health: String,
    pub action: String,
    pub error: Option<String>,
}

/// Run one health pass over all open agent beads with heartbeat tracking.
///
/// Agents without heartbeat fields (the mayor, the deacon) are skipped. One
/// agent's failure is recorded in its result row; the pass always continues.
pub fn check_worker_health(
    store: &dyn WorkStore,
    now: DateTime<Utc>,
) -> Result<Vec<HealthCheckResult>, StoreError> {
    let agents = store.list(&ListOptions {
        issue_type: "agent".into(),
        status: "open".into(),
        ..Default::default()
    })?;

    let mut results = Vec::new();

    for agent in agents {
        let Some(mut fields) = AgentFields::parse(&agent.description) else {
            continue;
        };
        if fields.last_heartbeat.is_empty() || fields.heartbeat_timeout.is_empty() {
            continue;
        }

        let mut result = HealthCheckResult {
            agent_id: agent.id.clone(),
            worker: worker_name(&agent.id),
            previous_health: fields.health.clone(),
            current_health: fields.health.clone(),
            action: String::new(),
            error: None,
        };

        let last_heartbeat = match DateTime::parse_from_rfc3339(&fields.last_heartbeat) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                result.error = Some(format!("parsing last_heartbeat: {e}"));
                results.push(result);
                continue;
            }
        };
        let timeout_secs: u64 = match fields.heartbeat_timeout.parse() {
            Ok(t) => t,
            Err(e) => {
                result.error = Some(format!("parsing heartbeat_timeout: {e}"));
                results.push(result);
                continue;
            }
        };

        let age = (now - last_heartbeat).to_std().unwrap_or(Duration::ZERO);
        let new_health = classify_health(age, Duration::from_secs(timeout_secs));

        if new_health == fields.health {
            result.action = "no change".into();
            results.push(result);
            continue;
        }

        result.current_health = new_health.to_string();
        fields.health = new_health.to_string();
        if new_health == HEALTH_DEAD && fields.lifecycle_state != LIFECYCLE_CRASHED {
            fields.lifecycle_state = LIFECYCLE_CRASHED.into();
        }

        let new_desc = fields.set(&agent.description);
        if let Err(e) = store.update(
            &agent.id,
            &UpdatePatch {
                description: Some(new_desc),
                ..Default::default()
            },
        ) {
            result.error = Some(format!("updating agent bead: {e}"));
            results.push(result);
            continue;
        }

        result.action = format!(
            "updated health: {} → {}",
            result.previous_health, new_health
        );

        if new_health == HEALTH_DEAD && !fields.assigned_work.is_empty() {
            match reassign_orphan_work(store, &fields.assigned_work) {
                Ok(true) => {
                    result.action += &format!(", reassigned work {}", fields.assigned_work);
                }
                Ok(false) => {}
                Err(e) => result.error = Some(format!("reassigning work: {e}")),
            }
        }

        results.push(result);
    }

    Ok(results)
}

/// Reset a dead worker's work item so another worker can pick it up.
/// Only in_progress and blocked work is touched; closed or already-open work
/// needs no action. Returns whether a reassignment happened.
fn reassign_orphan_work(store: &dyn WorkStore, work_id: &str) -> Result<bool, StoreError> {
    let issue = store.show(work_id)?;
    if issue.status != STATUS_IN_PROGRESS && issue.status != STATUS_BLOCKED {
        return Ok(false);
    }
    store.update(
        work_id,
        &UpdatePatch {
            status: Some("open".into()),
            assignee: Some(String::new()),
            ..Default::default()
        },
    )?;
    Ok(true)
}

/// Worker name from an agent bead id like `greenplace/polecats/alice`.
fn worker_name(agent_id: &str) -> String {
    agent_id.rsplit('/').next().unwrap_or(agent_id).to_string()
}

/// Split `rig/polecats/name` into (rig, name).
pub fn polecat_from_agent_id(agent_id: &str) -> Option<(String, String)> {
    let mut parts = agent_id.split('/');
    let rig = parts.next()?;
    if parts.next()? != "polecats" {
        return None;
    }
    let name = parts.next()?;
    if parts.next().is_some() || rig.is_empty() || name.is_empty() {
        return None;
    }
    Some((rig.to_string(), name.to_string()))
}

/// A crashed worker is respawned when its session vanished while it still
/// held a hook. Agents paused on purpose are left alone.
pub fn needs_recovery(fields: &AgentFields, has_session: bool) -> bool {
    if fields.lifecycle_state == LIFECYCLE_TERMINATED {
        return false;
    }
    if fields.hook_bead.is_empty() && fields.assigned_work.is_empty() {
        return false;
    }
    if fields.lifecycle_state == "stuck" || fields.lifecycle_state == "awaiting-gate" {
        return false;
    }
    !has_session
}

/// A finished worker is removed once its session is gone and it reported
/// itself clean (or never reported at all).
pub fn should_cleanup(fields: &AgentFields, has_session: bool) -> bool {
    if fields.lifecycle_state != "done" {
        return false;
    }
    if has_session {
        return false;
    }
    fields.cleanup_status.is_empty() || fields.cleanup_status == "clean"
}

/// Summary of one lifecycle tick.
#[derive(Debug, Default)]
pub struct CycleStats {
    pub checked: usize,
    pub recovered: usize,
    pub cleaned: usize,
}

/// The per-town supervisory loop.
pub struct LifecycleManager {
    town: TownPaths,
    rigs: Vec<String>,
    config: LifecycleConfig,
    tmux: Tmux,
    /// Command started inside a recovered worker's session.
    agent_command: String,
}

impl LifecycleManager {
    pub fn new(town: TownPaths, rigs: Vec<String>, config: LifecycleConfig) -> Self {
        let agent_command =
            std::env::var("GT_AGENT_COMMAND").unwrap_or_else(|_| "claude".to_string());
        Self {
            town,
            rigs,
            config,
            tmux: Tmux::new(),
            agent_command,
        }
    }

    /// Run the loop until `cancel` is set. A tick in flight completes.
    pub fn run(&self, cancel: Arc<AtomicBool>) -> anyhow::Result<()> {
        let interval = self.config.check_interval()?;
        info!(
            interval = %self.config.check_interval,
            "worker lifecycle manager starting"
        );

        while !cancel.load(Ordering::Relaxed) {
            let stats = self.run_cycle();
            if stats.recovered > 0 || stats.cleaned > 0 {
                info!(
                    recovered = stats.recovered,
                    cleaned = stats.cleaned,
                    "lifecycle cycle complete"
                );
            }
            sleep_cancellable(interval, &cancel);
        }

        info!("worker lifecycle manager shutting down");
        Ok(())
    }

    /// One tick: health pass, recovery pass, cleanup pass. Never aborts on a
    /// single agent's failure.
    pub fn run_cycle(&self) -> CycleStats {
        let mut stats = CycleStats::default();
        let store = Beads::new(self.town.root());

        match check_worker_health(&store, Utc::now()) {
            Ok(results) => {
                stats.checked = results.len();
                for r in &results {
                    if let Some(ref e) = r.error {
                        warn!(agent = %r.agent_id, error = %e, "health pass error");
                    } else if r.action != "no change" {
                        info!(agent = %r.agent_id, action = %r.action, "health updated");
                    }
                }
            }
            Err(e) => warn!(error = %e, "health pass failed"),
        }

        if self.config.auto_recovery {
            stats.recovered = self.recover_crashed(&store);
        }
        if self.config.auto_cleanup {
            stats.cleaned = self.cleanup_done(&store);
        }

        stats
    }

    fn polecat_agents(&self, store: &Beads) -> Vec<(String, String, String, AgentFields)> {
        let agents = match store.list(&ListOptions {
            issue_type: "agent".into(),
            status: "open".into(),
            ..Default::default()
        }) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "listing agents failed");
                return Vec::new();
            }
        };

        agents
            .into_iter()
            .filter_map(|agent| {
                let (rig, name) = polecat_from_agent_id(&agent.id)?;
                if !self.rigs.contains(&rig) {
                    return None;
                }
                let fields = AgentFields::parse(&agent.description)?;
                Some((agent.id, rig, name, fields))
            })
            .collect()
    }

    /// Respawn workers whose session died while they still hold a hook.
    fn recover_crashed(&self, store: &Beads) -> usize {
        let mut recovered = 0;
        for (agent_id, rig, name, fields) in self.polecat_agents(store) {
            let session = session_name(&rig, &name);
            let has_session = self.tmux.has_session(&session).unwrap_or(true);
            if !needs_recovery(&fields, has_session) {
                continue;
            }

            info!(agent = %agent_id, "recovering crashed worker");
            match self.respawn(store, &agent_id, &rig, &name, &fields) {
                Ok(()) => recovered += 1,
                Err(e) => warn!(agent = %agent_id, error = %e, "recovery failed"),
            }
        }
        recovered
    }

    fn respawn(
        &self,
        store: &Beads,
        agent_id: &str,
        rig: &str,
        name: &str,
        fields: &AgentFields,
    ) -> anyhow::Result<()> {
        let hook_bead = if !fields.hook_bead.is_empty() {
            fields.hook_bead.clone()
        } else {
            fields.assigned_work.clone()
        };
        if hook_bead.is_empty() {
            anyhow::bail!("no hook bead recorded for recovery");
        }

        // Reap any session leftovers before restarting.
        let session = session_name(rig, name);
        let _ = self.tmux.kill_session(&session);

        // Make sure the worktree exists; recovery reuses the same workspace.
        let worktree = self.town.polecat_dir(rig, name);
        if !worktree.exists() {
            let git = Git::new(self.town.rig_clone(rig));
            let branch = format!("polecat/{name}");
            if !git.branch_exists(&branch).map_err(|e| anyhow::anyhow!("{e}"))? {
                git.create_branch_from(&branch, "main")
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
            }
            git.worktree_add(&worktree, &branch)
                .map_err(|e| anyhow::anyhow!("repairing worktree: {e}"))?;
        }

        self.tmux
            .new_session(&session, &worktree, &self.agent_command)?;

        let mut updated = fields.clone();
        updated.lifecycle_state = "working".into();
        updated.hook_bead = hook_bead.clone();
        updated.session_id = session;
        store.set_agent_fields(agent_id, &updated)?;

        // The work item was parked at hooked while the worker was down.
        if let Err(e) = store.update(
            &hook_bead,
            &UpdatePatch {
                status: Some(STATUS_IN_PROGRESS.into()),
                ..Default::default()
            },
        ) {
            warn!(work = %hook_bead, error = %e, "could not move work to in_progress");
        }

        Ok(())
    }

    /// Remove workers that finished and reported themselves clean.
    fn cleanup_done(&self, store: &Beads) -> usize {
        let mut cleaned = 0;
        for (agent_id, rig, name, fields) in self.polecat_agents(store) {
            let session = session_name(&rig, &name);
            let has_session = self.tmux.has_session(&session).unwrap_or(true);
            if !should_cleanup(&fields, has_session) {
                continue;
            }

            let worktree = self.town.polecat_dir(&rig, &name);
            let git = Git::new(self.town.rig_clone(&rig));
            if worktree.exists() {
                if let Err(e) = git.worktree_remove(&worktree, false) {
                    warn!(agent = %agent_id, error = %e, "worktree removal failed");
                    continue;
                }
            }

            let mut updated = fields.clone();
            updated.lifecycle_state = LIFECYCLE_TERMINATED.into();
            if let Err(e) = store.set_agent_fields(&agent_id, &updated) {
                warn!(agent = %agent_id, error = %e, "could not mark terminated");
            }
            if let Err(e) = store.close(&agent_id, "worker cleaned up") {
                warn!(agent = %agent_id, error = %e, "could not close agent bead");
            }
            cleaned += 1;
        }
        cleaned
    }
}

/// Sleep for `total`, waking early when `cancel` is set.
pub fn sleep_cancellable(total: Duration, cancel: &AtomicBool) {
    let slice = Duration::from_millis(250);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::{Issue, STATUS_CLOSED};
    use crate::test_utils::{issue, MemoryStore};

    fn agent_bead(id: &str, fields: &AgentFields) -> Issue {
        Issue {
            id: id.into(),
            title: format!("Agent {id}"),
            issue_type: "agent".into(),
            status: "open".into(),
            description: fields.format(),
            priority: 2,
            created_at: "2026-01-01T00:00:00Z".into(),
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-06T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn heartbeat_at(seconds_ago: i64) -> String {
        (now() - chrono::Duration::seconds(seconds_ago)).to_rfc3339()
    }

    #[test]
    fn classify_boundaries() {
        let timeout = Duration::from_secs(60);
        assert_eq!(classify_health(Duration::from_secs(30), timeout), "healthy");
        assert_eq!(classify_health(Duration::from_secs(59), timeout), "healthy");
        // Exactly T is stale, exactly 2T is dead.
        assert_eq!(classify_health(Duration::from_secs(60), timeout), "stale");
        assert_eq!(classify_health(Duration::from_secs(90), timeout), "stale");
        assert_eq!(classify_health(Duration::from_secs(119), timeout), "stale");
        assert_eq!(classify_health(Duration::from_secs(120), timeout), "dead");
        assert_eq!(classify_health(Duration::from_secs(300), timeout), "dead");
    }

    #[test]
    fn healthy_agent_unchanged() {
        let store = MemoryStore::new();
        let fields = AgentFields {
            lifecycle_state: "working".into(),
            health: "healthy".into(),
            last_heartbeat: heartbeat_at(30),
            heartbeat_timeout: "180".into(),
            ..Default::default()
        };
        store.insert(agent_bead("greenplace/polecats/alice", &fields));

        let results = check_worker_health(&store, now()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action, "no change");
        assert_eq!(results[0].current_health, "healthy");
    }

    #[test]
    fn stale_transition_updates_bead() {
        let store = MemoryStore::new();
        let fields = AgentFields {
            lifecycle_state: "working".into(),
            health: "healthy".into(),
            last_heartbeat: heartbeat_at(200),
            heartbeat_timeout: "180".into(),
            ..Default::default()
        };
        store.insert(agent_bead("greenplace/polecats/alice", &fields));

        let results = check_worker_health(&store, now()).unwrap();
        assert_eq!(results[0].action, "updated health: healthy → stale");

        let agent = store.show("greenplace/polecats/alice").unwrap();
        let updated = AgentFields::parse(&agent.description).unwrap();
        assert_eq!(updated.health, "stale");
        // Stale is logged only; lifecycle_state untouched.
        assert_eq!(updated.lifecycle_state, "working");
    }

    #[test]
    fn dead_transition_reassigns_in_progress_work() {
        let store = MemoryStore::new();
        let mut work = issue("gt-123", "task", STATUS_IN_PROGRESS);
        work.assignee = "greenplace/polecats/alice".into();
        store.insert(work);

        let fields = AgentFields {
            lifecycle_state: "working".into(),
            health: "stale".into(),
            last_heartbeat: heartbeat_at(400),
            heartbeat_timeout: "180".into(),
            assigned_work: "gt-123".into(),
            ..Default::default()
        };
        store.insert(agent_bead("greenplace/polecats/alice", &fields));

        let results = check_worker_health(&store, now()).unwrap();
        assert_eq!(
            results[0].action,
            "updated health: stale → dead, reassigned work gt-123"
        );

        let agent = store.show("greenplace/polecats/alice").unwrap();
        let updated = AgentFields::parse(&agent.description).unwrap();
        assert_eq!(updated.health, "dead");
        assert_eq!(updated.lifecycle_state, "crashed");

        let work = store.show("gt-123").unwrap();
        assert_eq!(work.status, "open");
        assert_eq!(work.assignee, "");
    }

    #[test]
    fn dead_transition_reassigns_blocked_work() {
        let store = MemoryStore::new();
        store.insert(issue("gt-9", "task", STATUS_BLOCKED));

        let fields = AgentFields {
            health: "stale".into(),
            last_heartbeat: heartbeat_at(1000),
            heartbeat_timeout: "180".into(),
            assigned_work: "gt-9".into(),
            ..Default::default()
        };
        store.insert(agent_bead("greenplace/polecats/bob", &fields));

        check_worker_health(&store, now()).unwrap();
        assert_eq!(store.show("gt-9").unwrap().status, "open");
    }

    #[test]
    fn dead_transition_leaves_closed_work_alone() {
        let store = MemoryStore::new();
        store.insert(issue("gt-77", "task", STATUS_CLOSED));

        let fields = AgentFields {
            health: "stale".into(),
            last_heartbeat: heartbeat_at(1000),
            heartbeat_timeout: "180".into(),
            assigned_work: "gt-77".into(),
            ..Default::default()
        };
        store.insert(agent_bead("greenplace/polecats/bob", &fields));

        let results = check_worker_health(&store, now()).unwrap();
        assert_eq!(results[0].action, "updated health: stale → dead");
        assert_eq!(store.show("gt-77").unwrap().status, STATUS_CLOSED);
    }

    #[test]
    fn heartbeat_restores_healthy() {
        let store = MemoryStore::new();
        let fields = AgentFields {
            health: "dead".into(),
            lifecycle_state: "crashed".into(),
            last_heartbeat: heartbeat_at(10),
            heartbeat_timeout: "180".into(),
            ..Default::default()
        };
        store.insert(agent_bead("greenplace/polecats/alice", &fields));

        let results = check_worker_health(&store, now()).unwrap();
        assert_eq!(results[0].action, "updated health: dead → healthy");
    }

    #[test]
    fn agents_without_heartbeat_tracking_skipped() {
        let store = MemoryStore::new();
        // The mayor has lifecycle fields but no heartbeat tracking.
        let fields = AgentFields {
            lifecycle_state: "working".into(),
            ..Default::default()
        };
        store.insert(agent_bead("mayor", &fields));
        // And a plain issue of another type is never considered.
        store.insert(issue("gt-1", "task", "open"));

        let results = check_worker_health(&store, now()).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn malformed_heartbeat_is_recorded_not_fatal() {
        let store = MemoryStore::new();
        let bad = AgentFields {
            health: "healthy".into(),
            last_heartbeat: "not-a-time".into(),
            heartbeat_timeout: "180".into(),
            ..Default::default()
        };
        store.insert(agent_bead("greenplace/polecats/bad", &bad));
        let good = AgentFields {
            health: "healthy".into(),
            last_heartbeat: heartbeat_at(10),
            heartbeat_timeout: "180".into(),
            ..Default::default()
        };
        store.insert(agent_bead("greenplace/polecats/good", &good));

        let results = check_worker_health(&store, now()).unwrap();
        assert_eq!(results.len(), 2);
        let bad_row = results
            .iter()
            .find(|r| r.agent_id.ends_with("bad"))
            .unwrap();
        assert!(bad_row.error.as_ref().unwrap().contains("last_heartbeat"));
        let good_row = results
            .iter()
            .find(|r| r.agent_id.ends_with("good"))
            .unwrap();
        assert!(good_row.error.is_none());
    }

    #[test]
    fn agent_id_parsing() {
        assert_eq!(
            polecat_from_agent_id("greenplace/polecats/alice").unwrap(),
            ("greenplace".into(), "alice".into())
        );
        assert!(polecat_from_agent_id("mayor").is_none());
        assert!(polecat_from_agent_id("greenplace/witness").is_none());
        assert!(polecat_from_agent_id("greenplace/polecats/").is_none());
    }

    #[test]
    fn recovery_decision() {
        let working = AgentFields {
            lifecycle_state: "working".into(),
            hook_bead: "gt-1".into(),
            ..Default::default()
        };
        assert!(needs_recovery(&working, false));
        assert!(!needs_recovery(&working, true));

        let stuck = AgentFields {
            lifecycle_state: "stuck".into(),
            hook_bead: "gt-1".into(),
            ..Default::default()
        };
        assert!(!needs_recovery(&stuck, false));

        let gated = AgentFields {
            lifecycle_state: "awaiting-gate".into(),
            hook_bead: "gt-1".into(),
            ..Default::default()
        };
        assert!(!needs_recovery(&gated, false));

        let terminated = AgentFields {
            lifecycle_state: "terminated".into(),
            hook_bead: "gt-1".into(),
            ..Default::default()
        };
        assert!(!needs_recovery(&terminated, false));

        let idle = AgentFields::default();
        assert!(!needs_recovery(&idle, false));
    }

    #[test]
    fn cleanup_decision() {
        let done_clean = AgentFields {
            lifecycle_state: "done".into(),
            cleanup_status: "clean".into(),
            ..Default::default()
        };
        assert!(should_cleanup(&done_clean, false));
        assert!(!should_cleanup(&done_clean, true));

        let done_unreported = AgentFields {
            lifecycle_state: "done".into(),
            ..Default::default()
        };
        assert!(should_cleanup(&done_unreported, false));

        let done_dirty = AgentFields {
            lifecycle_state: "done".into(),
            cleanup_status: "pending".into(),
            ..Default::default()
        };
        assert!(!should_cleanup(&done_dirty, false));

        let working = AgentFields {
            lifecycle_state: "working".into(),
            cleanup_status: "clean".into(),
            ..Default::default()
        };
        assert!(!should_cleanup(&working, false));
    }

    #[test]
    fn sleep_cancellable_returns_early() {
        let cancel = AtomicBool::new(true);
        let start = std::time::Instant::now();
        sleep_cancellable(Duration::from_secs(5), &cancel);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
