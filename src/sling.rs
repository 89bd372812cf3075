//! Work dispatch.
//!
//! `sling` is the single entry point for "assign work W to target T". It
//! resolves the work reference (bead or formula), resolves the target to a
//! worker address (spawning one when needed), claims the work with one atomic
//! update, mirrors the assignment onto the worker's agent bead, and nudges
//! the worker's session if it has one.

use chrono::Utc;
use tracing::{info, warn};

use crate::beads::fields::{AgentFields, AttachmentFields, ConvoyFields};
use crate::beads::molecules::POLECAT_WORK_MOLECULE;
use crate::beads::validation::DEFAULT_HEARTBEAT_TIMEOUT;
use crate::beads::{Beads, CreateOptions, Issue, ListOptions, UpdatePatch, WorkStore,
    STATUS_PINNED};
use crate::config::LifecycleConfig;
use crate::error::StoreError;
use crate::git::Git;
use crate::session::{session_name, Tmux};
use crate::workspace::TownPaths;

/// Foreground programs that count as a started agent.
const AGENT_PROGRAMS: &[&str] = &["claude", "gemini", "codex", "aider"];

/// How long to wait for a fresh session's agent to start before nudging.
const READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Options for one dispatch.
#[derive(Debug, Clone, Default)]
pub struct SlingOptions {
    /// Bead id or formula name.
    pub work: String,
    /// Agent address, rig name, dog-pool reference, or `.` for self.
    pub target: Option<String>,
    pub subject: String,
    pub args: String,
    pub account: String,
    pub create: bool,
    pub force: bool,
    pub no_convoy: bool,
    /// Skip session creation and nudging.
    pub naked: bool,
    /// Apply a formula to an existing bead.
    pub on_bead: Option<String>,
    pub vars: Vec<(String, String)>,
    pub dry_run: bool,
}

/// What a dispatch did.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SlingOutcome {
    pub work: String,
    pub target: String,
    pub convoy: Option<String>,
    pub spawned: bool,
    pub nudged: bool,
}

/// Where a target string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    /// `.`, the calling agent.
    Current,
    /// A rig name: spawn a fresh polecat inside it.
    Rig(String),
    /// `deacon/dogs` or `deacon/dogs/<name>`: the pooled helpers.
    DogPool(Option<String>),
    /// A specific agent address.
    Agent(String),
}

/// Classify a target string. Rig names are matched against the known rigs.
pub fn parse_target(target: &str, rigs: &[String]) -> TargetKind {
    if target == "." {
        return TargetKind::Current;
    }
    if target == "deacon/dogs" {
        return TargetKind::DogPool(None);
    }
    if let Some(name) = target.strip_prefix("deacon/dogs/") {
        if !name.is_empty() {
            return TargetKind::DogPool(Some(name.to_string()));
        }
    }
    if rigs.iter().any(|r| r == target) {
        return TargetKind::Rig(target.to_string());
    }
    TargetKind::Agent(target.to_string())
}

/// Address of a polecat worker.
pub fn polecat_address(rig: &str, name: &str) -> String {
    format!("{rig}/polecats/{name}")
}

/// Split `rig/polecats/name` into (rig, name).
pub fn parse_polecat_address(address: &str) -> Option<(String, String)> {
    crate::lifecycle::polecat_from_agent_id(address)
}

/// Refuse to re-dispatch pinned work unless forced. Returns the work item.
pub fn guard_pinned(store: &dyn WorkStore, work_id: &str, force: bool) -> anyhow::Result<Issue> {
    let issue = store.show(work_id)?;
    if issue.status == STATUS_PINNED && !force {
        let assignee = if issue.assignee.is_empty() {
            "(unknown)".to_string()
        } else {
            issue.assignee.clone()
        };
        anyhow::bail!("bead {work_id} is already pinned to {assignee} (use --force to re-sling)");
    }
    Ok(issue)
}

/// The convoy already tracking this work, if any.
pub fn tracking_convoy(store: &dyn WorkStore, work_id: &str) -> Result<Option<String>, StoreError> {
    let convoys = store.list(&ListOptions {
        issue_type: "convoy".into(),
        status: "open".into(),
        ..Default::default()
    })?;
    for convoy in convoys {
        if let Some(fields) = ConvoyFields::parse(&convoy.description) {
            if fields.spawned_work.split(',').any(|w| w.trim() == work_id) {
                return Ok(Some(convoy.id));
            }
        }
    }
    Ok(None)
}

/// Ensure the work is tracked by a convoy, creating `"Work: <title>"` when it
/// is not. Returns the convoy id.
pub fn ensure_convoy(
    store: &dyn WorkStore,
    work: &Issue,
    coordinator: &str,
) -> Result<String, StoreError> {
    if let Some(existing) = tracking_convoy(store, &work.id)? {
        return Ok(existing);
    }
    let fields = ConvoyFields {
        spawned_work: work.id.clone(),
        stage: crate::beads::validation::STAGE_EXECUTION.into(),
        coordinator: coordinator.to_string(),
        started: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        ..Default::default()
    };
    let convoy = store.create(&CreateOptions {
        title: format!("Work: {}", work.title),
        issue_type: "convoy".into(),
        priority: work.priority,
        description: fields.format(),
        ..Default::default()
    })?;
    Ok(convoy.id)
}

/// The linearisation point: one atomic update moving the work to hooked with
/// its assignee set. A Conflict here means someone else claimed first.
pub fn claim_work(store: &dyn WorkStore, work_id: &str, assignee: &str) -> Result<(), StoreError> {
    store.update(
        work_id,
        &UpdatePatch {
            status: Some(crate::beads::STATUS_HOOKED.into()),
            assignee: Some(assignee.to_string()),
            ..Default::default()
        },
    )
}

/// Mirror the assignment onto the worker's agent bead.
pub fn mirror_hook_to_agent(
    store: &dyn WorkStore,
    agent_id: &str,
    work_id: &str,
) -> Result<(), StoreError> {
    let agent = store.show(agent_id)?;
    let mut fields = AgentFields::parse(&agent.description).unwrap_or_default();
    fields.hook_bead = work_id.to_string();
    fields.assigned_work = work_id.to_string();
    store.update(
        agent_id,
        &UpdatePatch {
            description: Some(fields.set(&agent.description)),
            ..Default::default()
        },
    )
}

/// Attach the standard work molecule to a polecat's agent bead. Idempotent:
/// an existing attachment is left in place.
pub fn attach_work_molecule(store: &dyn WorkStore, agent_id: &str) -> Result<bool, StoreError> {
    let agent = store.show(agent_id)?;
    let mut attachment = AttachmentFields::parse(&agent.description).unwrap_or_default();
    if !attachment.attached_molecule.is_empty() {
        return Ok(false);
    }
    attachment.attached_molecule = POLECAT_WORK_MOLECULE.into();
    attachment.attached_at = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    store.update(
        agent_id,
        &UpdatePatch {
            description: Some(attachment.set(&agent.description)),
            ..Default::default()
        },
    )?;
    Ok(true)
}

/// Persist dispatcher identity and args on the work item so the data
/// survives process death.
pub fn store_dispatch_info(
    store: &dyn WorkStore,
    work_id: &str,
    dispatcher: &str,
    args: &str,
) -> Result<(), StoreError> {
    let issue = store.show(work_id)?;
    let mut attachment = AttachmentFields::parse(&issue.description).unwrap_or_default();
    attachment.dispatched_by = dispatcher.to_string();
    if !args.is_empty() {
        attachment.attached_args = args.to_string();
    }
    store.update(
        work_id,
        &UpdatePatch {
            description: Some(attachment.set(&issue.description)),
            ..Default::default()
        },
    )
}

/// Next free polecat name in a rig, `polecat-01` upward.
pub fn next_polecat_name(store: &dyn WorkStore, rig: &str) -> Result<String, StoreError> {
    let agents = store.list(&ListOptions {
        issue_type: "agent".into(),
        ..Default::default()
    })?;
    let taken: Vec<String> = agents
        .iter()
        .filter_map(|a| parse_polecat_address(&a.id))
        .filter(|(r, _)| r == rig)
        .map(|(_, name)| name)
        .collect();
    for n in 1..1000 {
        let candidate = format!("polecat-{n:02}");
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(StoreError::Invalid(format!("rig {rig} has no free polecat slot")))
}

/// Count of live (open) polecat agent beads in a rig.
pub fn polecat_count(store: &dyn WorkStore, rig: &str) -> Result<usize, StoreError> {
    let agents = store.list(&ListOptions {
        issue_type: "agent".into(),
        status: "open".into(),
        ..Default::default()
    })?;
    Ok(agents
        .iter()
        .filter_map(|a| parse_polecat_address(&a.id))
        .filter(|(r, _)| r == rig)
        .count())
}

/// An idle dog from the pool, if any.
pub fn find_idle_dog(store: &dyn WorkStore) -> Result<Option<String>, StoreError> {
    let agents = store.list(&ListOptions {
        issue_type: "agent".into(),
        status: "open".into(),
        ..Default::default()
    })?;
    for agent in agents {
        if !agent.id.starts_with("deacon/dogs/") {
            continue;
        }
        if let Some(fields) = AgentFields::parse(&agent.description) {
            if fields.lifecycle_state == "idle" && fields.assigned_work.is_empty() {
                return Ok(Some(agent.id));
            }
        }
    }
    Ok(None)
}

/// Count of pooled dogs (any state).
pub fn dog_count(store: &dyn WorkStore) -> Result<usize, StoreError> {
    let agents = store.list(&ListOptions {
        issue_type: "agent".into(),
        ..Default::default()
    })?;
    Ok(agents
        .iter()
        .filter(|a| a.id.starts_with("deacon/dogs/"))
        .count())
}

/// First free pooled-dog address, `deacon/dogs/dog-01` upward.
pub fn next_dog_address(store: &dyn WorkStore) -> Result<String, StoreError> {
    let agents = store.list(&ListOptions {
        issue_type: "agent".into(),
        ..Default::default()
    })?;
    let taken: Vec<&str> = agents
        .iter()
        .filter(|a| a.id.starts_with("deacon/dogs/"))
        .map(|a| a.id.as_str())
        .collect();
    for n in 1..1000 {
        let candidate = format!("deacon/dogs/dog-{n:02}");
        if !taken.contains(&candidate.as_str()) {
            return Ok(candidate);
        }
    }
    Err(StoreError::Invalid("dog pool has no free slot".into()))
}

/// The prompt injected into a nudged session.
pub fn build_start_prompt(work_id: &str, subject: &str, args: &str) -> String {
    match (subject.is_empty(), args.is_empty()) {
        (false, false) => format!(
            "Work slung: {work_id} ({subject}). Args: {args}. Start working now - use these args to guide your execution."
        ),
        (true, false) => format!(
            "Work slung: {work_id}. Args: {args}. Start working now - use these args to guide your execution."
        ),
        (false, true) => format!(
            "Work slung: {work_id} ({subject}). Start working on it now - no questions, just begin."
        ),
        (true, true) => format!(
            "Work slung: {work_id}. Start working on it now - check your hook, then begin."
        ),
    }
}

/// Identity of the calling agent, from the environment.
pub fn self_identity() -> String {
    std::env::var("GT_SELF").unwrap_or_else(|_| "mayor".to_string())
}

/// The dispatch engine, bound to one town.
pub struct Sling<'a> {
    pub town: &'a TownPaths,
    pub beads: &'a Beads,
    pub tmux: &'a Tmux,
    pub rigs: Vec<String>,
    pub lifecycle: LifecycleConfig,
}

impl<'a> Sling<'a> {
    /// Run one dispatch end to end.
    pub fn run(&self, opts: &SlingOptions) -> anyhow::Result<SlingOutcome> {
        let store: &dyn WorkStore = self.beads;

        // Resolve the work reference: a bead, or a formula to instantiate.
        let mut work_id = opts.work.clone();
        let mut formula: Option<String> = None;
        if let Some(ref on_bead) = opts.on_bead {
            if !opts.vars.is_empty() {
                anyhow::bail!("--var cannot be used with --on");
            }
            self.verify_formula(&opts.work)?;
            store.show(on_bead)?;
            formula = Some(opts.work.clone());
            work_id = on_bead.clone();
        } else if store.show(&work_id).is_err() {
            if self.beads.formula_exists(&work_id)? {
                formula = Some(work_id.clone());
                work_id = String::new();
            } else if !looks_like_bead_id(&work_id) {
                anyhow::bail!("'{}' is not a valid bead or formula", opts.work);
            }
        }

        // Standalone formula: instantiate first so the wisp root is the work.
        if let Some(ref name) = formula {
            if work_id.is_empty() {
                self.beads.cook(name)?;
                work_id = self.beads.mol_wisp(name, &opts.vars)?;
                info!(formula = %name, wisp = %work_id, "formula instantiated");
            }
        }

        let work = guard_pinned(store, &work_id, opts.force)?;
        let dispatcher = self_identity();

        if opts.dry_run {
            return Ok(SlingOutcome {
                work: work_id,
                target: opts.target.clone().unwrap_or_else(|| ".".into()),
                ..Default::default()
            });
        }

        // Auto-convoy for plain bead slings.
        let mut convoy = None;
        if !opts.no_convoy && formula.is_none() {
            match ensure_convoy(store, &work, &dispatcher) {
                Ok(id) => convoy = Some(id),
                Err(e) => warn!(error = %e, "could not create auto-convoy"),
            }
        }

        // Formula-on-bead: cook, wisp, bond; the compound root becomes W.
        let mut final_work = work_id.clone();
        if let (Some(name), Some(_)) = (&formula, &opts.on_bead) {
            self.beads.cook(name)?;
            let vars = vec![
                ("feature".to_string(), work.title.clone()),
                ("issue".to_string(), work_id.clone()),
            ];
            let wisp = self.beads.mol_wisp(name, &vars)?;
            final_work = self.beads.mol_bond(&wisp, &work_id)?;
            info!(formula = %name, compound = %final_work, "formula bonded");
        }

        // Resolve the target to an agent address with an optional session.
        let target = opts.target.clone().unwrap_or_else(|| ".".into());
        let (agent, session, spawned) = self.resolve_target(&target, &final_work, opts)?;

        // The claim. Atomic; a conflict surfaces to the caller.
        claim_work(store, &final_work, &agent)?;

        if let Err(e) = mirror_hook_to_agent(store, &agent, &final_work) {
            warn!(agent = %agent, error = %e, "could not mirror hook onto agent bead");
        }

        if parse_polecat_address(&agent).is_some() {
            match attach_work_molecule(store, &agent) {
                Ok(true) => {
                    self.beads.cook(POLECAT_WORK_MOLECULE).ok();
                }
                Ok(false) => {}
                Err(e) => warn!(agent = %agent, error = %e, "could not attach work molecule"),
            }
        }

        if let Err(e) = store_dispatch_info(store, &final_work, &dispatcher, &opts.args) {
            warn!(error = %e, "could not store dispatcher in bead");
        }

        // Nudge the live session; workers without one discover their hook on
        // next wakeup.
        let mut nudged = false;
        if let Some(ref session) = session {
            if self.ensure_agent_ready(session).is_ok() {
                let prompt = build_start_prompt(&final_work, &opts.subject, &opts.args);
                match self.tmux.nudge(session, &prompt) {
                    Ok(()) => nudged = true,
                    Err(e) => warn!(session = %session, error = %e, "nudge failed"),
                }
            }
        }

        Ok(SlingOutcome {
            work: final_work,
            target: agent,
            convoy,
            spawned,
            nudged,
        })
    }

    fn verify_formula(&self, name: &str) -> anyhow::Result<()> {
        if !self.beads.formula_exists(name)? {
            anyhow::bail!("formula '{name}' not found");
        }
        Ok(())
    }

    /// Resolve a target string to (agent address, session name, spawned).
    fn resolve_target(
        &self,
        target: &str,
        hook_bead: &str,
        opts: &SlingOptions,
    ) -> anyhow::Result<(String, Option<String>, bool)> {
        let store: &dyn WorkStore = self.beads;
        match parse_target(target, &self.rigs) {
            TargetKind::Current => {
                let identity = self_identity();
                Ok((identity, None, false))
            }
            TargetKind::Rig(rig) => {
                let (agent, session) = self.spawn_polecat(&rig, hook_bead, opts)?;
                Ok((agent, session, true))
            }
            TargetKind::DogPool(Some(name)) => {
                let agent = format!("deacon/dogs/{name}");
                store.show(&agent)?;
                Ok((agent, None, false))
            }
            TargetKind::DogPool(None) => {
                if let Some(agent) = find_idle_dog(store)? {
                    return Ok((agent, None, false));
                }
                if !opts.create {
                    anyhow::bail!("no idle dog in the pool (use --create to add one)");
                }
                let count = dog_count(store)?;
                if self.lifecycle.max_dogs > 0 && count as u32 >= self.lifecycle.max_dogs {
                    anyhow::bail!(
                        "dog pool is full ({count}/{} dogs)",
                        self.lifecycle.max_dogs
                    );
                }
                let agent = self.create_dog()?;
                Ok((agent, None, true))
            }
            TargetKind::Agent(address) => {
                // A dead polecat gets replaced with a fresh spawn in its rig.
                if let Some((rig, name)) = parse_polecat_address(&address) {
                    let session = session_name(&rig, &name);
                    let alive = self.tmux.has_session(&session).unwrap_or(false);
                    if !alive && !opts.naked {
                        info!(target = %address, "target has no session, spawning fresh polecat");
                        let (agent, session) = self.spawn_polecat(&rig, hook_bead, opts)?;
                        return Ok((agent, session, true));
                    }
                    return Ok((address, alive.then_some(session), false));
                }
                store.show(&address)?;
                Ok((address, None, false))
            }
        }
    }

    /// Spawn a fresh polecat in a rig with the hook bead bound at spawn. The
    /// agent bead carries `hook_bead` from its very first write so a starting
    /// worker never observes itself unassigned.
    fn spawn_polecat(
        &self,
        rig: &str,
        hook_bead: &str,
        opts: &SlingOptions,
    ) -> anyhow::Result<(String, Option<String>)> {
        let store: &dyn WorkStore = self.beads;

        let count = polecat_count(store, rig)?;
        if self.lifecycle.max_polecats > 0 && count as u32 >= self.lifecycle.max_polecats {
            anyhow::bail!(
                "rig {rig} is at its polecat limit ({count}/{})",
                self.lifecycle.max_polecats
            );
        }

        let name = next_polecat_name(store, rig)?;
        let address = polecat_address(rig, &name);
        let session = session_name(rig, &name);
        let worktree = self.town.polecat_dir(rig, &name);
        let branch = format!("polecat/{name}");

        let git = Git::new(self.town.rig_clone(rig));
        if !git.branch_exists(&branch).map_err(|e| anyhow::anyhow!("{e}"))? {
            git.create_branch_from(&branch, "main")
                .map_err(|e| anyhow::anyhow!("spawning {address}: {e}"))?;
        }
        git.worktree_add(&worktree, &branch)
            .map_err(|e| anyhow::anyhow!("spawning {address}: {e}"))?;

        let fields = AgentFields {
            lifecycle_state: "spawning".into(),
            health: "healthy".into(),
            last_heartbeat: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT.to_string(),
            assigned_work: hook_bead.to_string(),
            hook_bead: hook_bead.to_string(),
            session_id: session.clone(),
            workspace: worktree.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let created = store.create(&CreateOptions {
            title: format!("Agent {address}"),
            issue_type: "agent".into(),
            priority: 2,
            description: fields.format(),
            id: address.clone(),
            ..Default::default()
        });
        if let Err(e) = created {
            // Remove the half-made workspace before surfacing the failure.
            let _ = git.worktree_remove(&worktree, true);
            return Err(anyhow::anyhow!("creating agent bead for {address}: {e}"));
        }

        if opts.naked {
            return Ok((address, None));
        }

        let command = agent_command(&opts.account);
        if let Err(e) = self.tmux.new_session(&session, &worktree, &command) {
            let _ = git.worktree_remove(&worktree, true);
            let _ = store.close(&address, "spawn failed");
            return Err(anyhow::anyhow!("starting session for {address}: {e}"));
        }

        Ok((address, Some(session)))
    }

    fn create_dog(&self) -> anyhow::Result<String> {
        let store: &dyn WorkStore = self.beads;
        let address = next_dog_address(store)?;
        let fields = AgentFields {
            lifecycle_state: "idle".into(),
            health: "healthy".into(),
            last_heartbeat: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT.to_string(),
            ..Default::default()
        };
        store.create(&CreateOptions {
            title: format!("Agent {address}"),
            issue_type: "agent".into(),
            priority: 2,
            description: fields.format(),
            id: address.clone(),
            ..Default::default()
        })?;
        Ok(address)
    }

    /// Wait for a session's agent to come up before nudging. The check is
    /// conservative: it watches the foreground program, which proves the
    /// agent started but not that it finished initialising.
    fn ensure_agent_ready(&self, session: &str) -> anyhow::Result<()> {
        if let Ok(current) = self.tmux.current_command(session) {
            if AGENT_PROGRAMS.contains(&current.as_str()) {
                return Ok(());
            }
        }
        self.tmux
            .wait_for_program(session, AGENT_PROGRAMS, READY_TIMEOUT)?;
        std::thread::sleep(std::time::Duration::from_secs(2));
        Ok(())
    }
}

/// Bead ids are prefixed strings like `gt-abc` or `hq-x1`.
fn looks_like_bead_id(s: &str) -> bool {
    s.split_once('-')
        .is_some_and(|(prefix, rest)| {
            !prefix.is_empty()
                && prefix.chars().all(|c| c.is_ascii_lowercase())
                && !rest.is_empty()
        })
}

fn agent_command(account: &str) -> String {
    let base = std::env::var("GT_AGENT_COMMAND").unwrap_or_else(|_| "claude".to_string());
    if account.is_empty() {
        base
    } else {
        format!("GT_ACCOUNT={account} {base}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::STATUS_HOOKED;
    use crate::test_utils::{issue, MemoryStore};

    fn rigs() -> Vec<String> {
        vec!["greenplace".into(), "sandport".into()]
    }

    #[test]
    fn target_parsing() {
        assert_eq!(parse_target(".", &rigs()), TargetKind::Current);
        assert_eq!(
            parse_target("greenplace", &rigs()),
            TargetKind::Rig("greenplace".into())
        );
        assert_eq!(parse_target("deacon/dogs", &rigs()), TargetKind::DogPool(None));
        assert_eq!(
            parse_target("deacon/dogs/alpha", &rigs()),
            TargetKind::DogPool(Some("alpha".into()))
        );
        assert_eq!(
            parse_target("greenplace/polecats/alice", &rigs()),
            TargetKind::Agent("greenplace/polecats/alice".into())
        );
        assert_eq!(
            parse_target("mayor", &rigs()),
            TargetKind::Agent("mayor".into())
        );
    }

    #[test]
    fn pinned_guard_refuses_without_force() {
        let store = MemoryStore::new();
        let mut work = issue("gt-abc", "task", STATUS_PINNED);
        work.assignee = "greenplace/polecats/bob".into();
        store.insert(work);

        let err = guard_pinned(&store, "gt-abc", false).unwrap_err();
        assert!(err.to_string().contains("greenplace/polecats/bob"));
        assert!(guard_pinned(&store, "gt-abc", true).is_ok());
    }

    #[test]
    fn claim_is_single_update() {
        let store = MemoryStore::new();
        store.insert(issue("gt-abc", "task", "open"));
        claim_work(&store, "gt-abc", "greenplace/polecats/alice").unwrap();

        let work = store.show("gt-abc").unwrap();
        assert_eq!(work.status, STATUS_HOOKED);
        assert_eq!(work.assignee, "greenplace/polecats/alice");
    }

    #[test]
    fn claim_conflict_surfaces() {
        let store = MemoryStore::new();
        store.insert(issue("gt-abc", "task", "open"));
        store.conflict_on("gt-abc");
        let err = claim_work(&store, "gt-abc", "x").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn auto_convoy_created_and_reused() {
        let store = MemoryStore::new();
        let mut work = issue("gt-abc", "task", "open");
        work.title = "Fix login".into();
        store.insert(work.clone());

        let convoy = ensure_convoy(&store, &work, "mayor").unwrap();
        let convoy_issue = store.show(&convoy).unwrap();
        assert_eq!(convoy_issue.title, "Work: Fix login");
        let fields = ConvoyFields::parse(&convoy_issue.description).unwrap();
        assert_eq!(fields.spawned_work, "gt-abc");
        assert_eq!(fields.coordinator, "mayor");

        // Slinging again reuses the same convoy.
        let again = ensure_convoy(&store, &work, "mayor").unwrap();
        assert_eq!(again, convoy);
    }

    #[test]
    fn hook_mirrored_onto_agent_bead() {
        let store = MemoryStore::new();
        let fields = AgentFields {
            lifecycle_state: "idle".into(),
            ..Default::default()
        };
        let mut agent = issue("greenplace/polecats/alice", "agent", "open");
        agent.description = fields.format();
        store.insert(agent);

        mirror_hook_to_agent(&store, "greenplace/polecats/alice", "gt-abc").unwrap();
        let agent = store.show("greenplace/polecats/alice").unwrap();
        let fields = AgentFields::parse(&agent.description).unwrap();
        assert_eq!(fields.hook_bead, "gt-abc");
        assert_eq!(fields.assigned_work, "gt-abc");
    }

    #[test]
    fn molecule_attach_is_idempotent() {
        let store = MemoryStore::new();
        store.insert(issue("greenplace/polecats/alice", "agent", "open"));

        assert!(attach_work_molecule(&store, "greenplace/polecats/alice").unwrap());
        assert!(!attach_work_molecule(&store, "greenplace/polecats/alice").unwrap());

        let agent = store.show("greenplace/polecats/alice").unwrap();
        let attachment = AttachmentFields::parse(&agent.description).unwrap();
        assert_eq!(attachment.attached_molecule, POLECAT_WORK_MOLECULE);
    }

    #[test]
    fn dispatch_info_survives_in_description() {
        let store = MemoryStore::new();
        let mut work = issue("gt-abc", "task", "open");
        work.description = "Original notes".into();
        store.insert(work);

        store_dispatch_info(&store, "gt-abc", "mayor", "patch release").unwrap();
        let work = store.show("gt-abc").unwrap();
        let attachment = AttachmentFields::parse(&work.description).unwrap();
        assert_eq!(attachment.dispatched_by, "mayor");
        assert_eq!(attachment.attached_args, "patch release");
        assert!(work.description.contains("Original notes"));
    }

    #[test]
    fn polecat_names_allocate_sequentially() {
        let store = MemoryStore::new();
        assert_eq!(next_polecat_name(&store, "greenplace").unwrap(), "polecat-01");

        store.insert(issue("greenplace/polecats/polecat-01", "agent", "open"));
        assert_eq!(next_polecat_name(&store, "greenplace").unwrap(), "polecat-02");

        // Another rig's polecats don't collide.
        assert_eq!(next_polecat_name(&store, "sandport").unwrap(), "polecat-01");
    }

    #[test]
    fn idle_dog_lookup() {
        let store = MemoryStore::new();
        assert!(find_idle_dog(&store).unwrap().is_none());

        let busy = AgentFields {
            lifecycle_state: "working".into(),
            assigned_work: "gt-1".into(),
            ..Default::default()
        };
        let mut dog = issue("deacon/dogs/dog-01", "agent", "open");
        dog.description = busy.format();
        store.insert(dog);
        assert!(find_idle_dog(&store).unwrap().is_none());

        let idle = AgentFields {
            lifecycle_state: "idle".into(),
            ..Default::default()
        };
        let mut dog = issue("deacon/dogs/dog-02", "agent", "open");
        dog.description = idle.format();
        store.insert(dog);
        assert_eq!(find_idle_dog(&store).unwrap().unwrap(), "deacon/dogs/dog-02");
    }

    #[test]
    fn dog_addresses_fill_gaps() {
        let store = MemoryStore::new();
        assert_eq!(next_dog_address(&store).unwrap(), "deacon/dogs/dog-01");

        store.insert(issue("deacon/dogs/dog-02", "agent", "open"));
        assert_eq!(next_dog_address(&store).unwrap(), "deacon/dogs/dog-01");

        store.insert(issue("deacon/dogs/dog-01", "agent", "open"));
        assert_eq!(next_dog_address(&store).unwrap(), "deacon/dogs/dog-03");
    }

    #[test]
    fn start_prompt_variants() {
        assert!(build_start_prompt("gt-1", "", "").contains("Work slung: gt-1."));
        assert!(build_start_prompt("gt-1", "release", "").contains("(release)"));
        assert!(build_start_prompt("gt-1", "", "be careful").contains("Args: be careful"));
        let both = build_start_prompt("gt-1", "release", "be careful");
        assert!(both.contains("(release)") && both.contains("Args: be careful"));
    }

    #[test]
    fn bead_id_shapes() {
        assert!(looks_like_bead_id("gt-abc"));
        assert!(looks_like_bead_id("hq-x1"));
        assert!(looks_like_bead_id("bd-ka761"));
        assert!(!looks_like_bead_id("greenplace"));
        assert!(!looks_like_bead_id("-abc"));
        assert!(!looks_like_bead_id("gt-"));
    }
}
