//! Shared test fixtures.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use crate::beads::{CreateOptions, Issue, ListOptions, UpdatePatch, WorkStore};
use crate::error::StoreError;

/// In-memory [`WorkStore`] for engine tests. Single-process stand-in for the
/// bd database: updates are serialised by a mutex, ready() reproduces the
/// store's (priority asc, age asc) ordering.
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    issues: BTreeMap<String, Issue>,
    next_id: u64,
    close_reasons: BTreeMap<String, String>,
    comments: Vec<(String, String)>,
    deps: Vec<(String, String)>,
    conflict_ids: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Insert an issue directly, bypassing create().
    pub fn insert(&self, issue: Issue) {
        let mut state = self.state.lock().unwrap();
        state.issues.insert(issue.id.clone(), issue);
    }

    /// Make the next update to `id` fail with Conflict.
    pub fn conflict_on(&self, id: &str) {
        self.state.lock().unwrap().conflict_ids.insert(id.into());
    }

    pub fn close_reason(&self, id: &str) -> Option<String> {
        self.state.lock().unwrap().close_reasons.get(id).cloned()
    }

    pub fn comments_for(&self, id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .comments
            .iter()
            .filter(|(i, _)| i == id)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn deps(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().deps.clone()
    }

    fn open_blockers(state: &State, issue: &Issue) -> usize {
        state
            .deps
            .iter()
            .filter(|(i, blocker)| {
                i == &issue.id
                    && state
                        .issues
                        .get(blocker)
                        .is_some_and(|b| b.status != crate::beads::STATUS_CLOSED)
            })
            .count()
            + issue
                .blocked_by
                .iter()
                .filter(|b| {
                    state
                        .issues
                        .get(*b)
                        .is_some_and(|i| i.status != crate::beads::STATUS_CLOSED)
                })
                .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkStore for MemoryStore {
    fn show(&self, id: &str) -> Result<Issue, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .issues
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list(&self, opts: &ListOptions) -> Result<Vec<Issue>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut matched: Vec<Issue> = state
            .issues
            .values()
            .filter(|i| opts.issue_type.is_empty() || i.issue_type == opts.issue_type)
            .filter(|i| opts.status.is_empty() || i.status == opts.status)
            .filter(|i| opts.assignee.is_empty() || i.assignee == opts.assignee)
            .filter(|i| opts.priority < 0 || i.priority == opts.priority)
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(matched)
    }

    fn ready(&self, issue_type: Option<&str>) -> Result<Vec<Issue>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut matched: Vec<Issue> = state
            .issues
            .values()
            .filter(|i| i.status == crate::beads::STATUS_OPEN)
            .filter(|i| issue_type.map_or(true, |t| i.issue_type == t))
            .filter(|i| Self::open_blockers(&state, i) == 0)
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(matched)
    }

    fn create(&self, opts: &CreateOptions) -> Result<Issue, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = if opts.id.is_empty() {
            format!("gt-{:03}", state.next_id)
        } else {
            opts.id.clone()
        };
        let issue = Issue {
            id,
            title: opts.title.clone(),
            description: opts.description.clone(),
            status: crate::beads::STATUS_OPEN.into(),
            priority: opts.priority,
            issue_type: opts.issue_type.clone(),
            parent: opts.parent.clone(),
            created_at: format!("2026-01-01T00:00:{:02}Z", state.next_id % 60),
            ..Default::default()
        };
        state.issues.insert(issue.id.clone(), issue.clone());
        Ok(issue)
    }

    fn update(&self, id: &str, patch: &UpdatePatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.conflict_ids.remove(id) {
            return Err(StoreError::Conflict(id.to_string()));
        }
        let issue = state
            .issues
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(ref status) = patch.status {
            issue.status = status.clone();
        }
        if let Some(ref assignee) = patch.assignee {
            issue.assignee = assignee.clone();
        }
        if let Some(ref description) = patch.description {
            issue.description = description.clone();
        }
        if let Some(priority) = patch.priority {
            issue.priority = priority;
        }
        Ok(())
    }

    fn close(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let issue = state
            .issues
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        issue.status = crate::beads::STATUS_CLOSED.into();
        state.close_reasons.insert(id.into(), reason.into());
        Ok(())
    }

    fn reopen(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let issue = state
            .issues
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        issue.status = crate::beads::STATUS_OPEN.into();
        Ok(())
    }

    fn add_comment(&self, id: &str, text: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.issues.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        state.comments.push((id.into(), text.into()));
        Ok(())
    }

    fn dep_add(&self, issue: &str, blocker: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.deps.push((issue.into(), blocker.into()));
        Ok(())
    }
}

/// Build an issue with the common fields set.
pub fn issue(id: &str, issue_type: &str, status: &str) -> Issue {
    Issue {
        id: id.into(),
        title: format!("Issue {id}"),
        issue_type: issue_type.into(),
        status: status.into(),
        priority: 2,
        created_at: "2026-01-01T00:00:00Z".into(),
        ..Default::default()
    }
}
