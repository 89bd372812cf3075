//! Projection sync engine.
//!
//! Replicates the authoritative work database into a read-only projection
//! store (tasks, activities, comments, agent roster) plus JSON cache files
//! for dashboards. Steady state is incremental: dirty issues are upserted
//! and events are appended past a persisted id cursor. Full sync is the
//! bootstrap and the recovery path; one full pass restores consistency from
//! any state.

pub mod daemon;

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

/// Cap on events pulled per incremental tick.
const EVENT_BATCH_LIMIT: i64 = 10_000;

/// Full activity sync looks back this many days.
const ACTIVITY_WINDOW_DAYS: i64 = 7;

/// Paths and intervals for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub beads_db: PathBuf,
    pub projection_db: PathBuf,
    pub cache_dir: PathBuf,
}

/// Sync cursors, persisted across restarts in the daemon state file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursors {
    pub last_event_id: i64,
    pub last_task_update: i64,
    pub incremental_enabled: bool,
}

/// The sync engine. One instance per town; the daemon wrapper enforces that
/// with a pid file.
pub struct Syncer {
    config: SyncConfig,
    pub cursors: Cursors,
}

#[derive(Debug)]
struct TaskRow {
    id: String,
    title: String,
    description: String,
    status: String,
    priority: i64,
    issue_type: String,
    assignee: Option<String>,
    owner: Option<String>,
    created_at: String,
    updated_at: String,
    closed_at: Option<String>,
}

#[derive(Debug)]
struct EventRow {
    id: i64,
    issue_id: String,
    event_type: String,
    actor: String,
    old_value: String,
    new_value: String,
    comment: String,
    created_at: String,
}

impl Syncer {
    pub fn new(config: SyncConfig, cursors: Cursors) -> Self {
        Self { config, cursors }
    }

    /// One sync pass: tasks, agents, activities, comments. Incremental where
    /// the cursors allow it, with automatic fallback to full.
    pub fn sync(&mut self) -> anyhow::Result<()> {
        let started = std::time::Instant::now();

        let beads = open_db(&self.config.beads_db)
            .with_context(|| format!("opening {}", self.config.beads_db.display()))?;
        verify_beads_schema(&beads);

        std::fs::create_dir_all(&self.config.cache_dir)
            .with_context(|| format!("creating {}", self.config.cache_dir.display()))?;
        if let Some(parent) = self.config.projection_db.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut proj = open_db(&self.config.projection_db)
            .with_context(|| format!("opening {}", self.config.projection_db.display()))?;
        ensure_projection_schema(&proj)?;

        if self.cursors.incremental_enabled && self.cursors.last_task_update > 0 {
            if let Err(e) = self.sync_tasks_incremental(&beads, &mut proj) {
                warn!(error = %e, "incremental task sync failed, falling back to full");
                self.sync_tasks_full(&beads, &mut proj)?;
            }
        } else {
            self.sync_tasks_full(&beads, &mut proj)?;
        }

        self.sync_agents(&beads)?;

        if self.cursors.incremental_enabled && self.cursors.last_event_id > 0 {
            if let Err(e) = self.sync_activity_incremental(&beads, &mut proj) {
                warn!(error = %e, "incremental activity sync failed, falling back to full");
                self.sync_activity_full(&beads, &mut proj)?;
            }
        } else {
            self.sync_activity_full(&beads, &mut proj)?;
        }

        self.sync_comments(&beads, &mut proj)?;

        self.cursors.incremental_enabled = true;

        info!(elapsed_ms = started.elapsed().as_millis() as u64, "sync completed");
        Ok(())
    }

    /// Replace the whole tasks table from the authoritative issues.
    fn sync_tasks_full(&mut self, beads: &Connection, proj: &mut Connection) -> anyhow::Result<()> {
        let tasks = query_tasks(
            beads,
            "SELECT id, title, COALESCE(description, ''), status, priority, issue_type,
                    assignee, owner, created_at, updated_at, closed_at
             FROM issues
             WHERE deleted_at IS NULL
             ORDER BY updated_at DESC",
            params![],
        )?;

        let tx = proj.transaction()?;
        tx.execute("DELETE FROM tasks", [])?;
        let mut max_update = self.cursors.last_task_update;
        for t in &tasks {
            insert_task(&tx, t)?;
            max_update = max_update.max(to_millis(&t.updated_at));
        }
        tx.commit()?;

        self.cursors.last_task_update = max_update;
        self.write_tasks_json(&tasks)?;
        Ok(())
    }

    /// Upsert only the issues the store marked dirty, then clear the dirty
    /// set. Errors here trigger the full-sync fallback.
    fn sync_tasks_incremental(
        &mut self,
        beads: &Connection,
        proj: &mut Connection,
    ) -> anyhow::Result<()> {
        if !table_exists(beads, "dirty_issues")? {
            anyhow::bail!("dirty_issues table not available");
        }

        let tasks = query_tasks(
            beads,
            "SELECT i.id, i.title, COALESCE(i.description, ''), i.status, i.priority,
                    i.issue_type, i.assignee, i.owner, i.created_at, i.updated_at, i.closed_at
             FROM issues i
             INNER JOIN dirty_issues d ON i.id = d.issue_id
             WHERE i.deleted_at IS NULL
             ORDER BY i.updated_at ASC",
            params![],
        )?;

        if tasks.is_empty() {
            beads.execute("DELETE FROM dirty_issues", [])?;
            return Ok(());
        }

        let tx = proj.transaction()?;
        let mut max_update = self.cursors.last_task_update;
        for t in &tasks {
            insert_task(&tx, t)?;
            max_update = max_update.max(to_millis(&t.updated_at));
        }
        tx.commit()?;

        // The dirty set is cleared only after the projection committed;
        // losing the race re-syncs the same issues next tick, which the
        // upsert absorbs.
        beads.execute("DELETE FROM dirty_issues", [])?;

        self.cursors.last_task_update = max_update;
        info!(count = tasks.len(), "incremental task sync");
        Ok(())
    }

    /// Rebuild the activities table from the recent event window.
    fn sync_activity_full(
        &mut self,
        beads: &Connection,
        proj: &mut Connection,
    ) -> anyhow::Result<()> {
        let events = query_events(
            beads,
            &format!(
                "SELECT id, issue_id, event_type, actor, COALESCE(old_value, ''),
                        COALESCE(new_value, ''), COALESCE(comment, ''), created_at
                 FROM events
                 WHERE created_at >= datetime('now', '-{ACTIVITY_WINDOW_DAYS} days')
                 ORDER BY id ASC"
            ),
            params![],
        )?;

        let tx = proj.transaction()?;
        tx.execute("DELETE FROM activities", [])?;
        for e in &events {
            insert_activity(&tx, e)?;
        }
        tx.commit()?;

        // Advance the cursor past everything the store holds so the next
        // incremental pass only sees genuinely new events.
        let max_id: Option<i64> = beads
            .query_row("SELECT MAX(id) FROM events", [], |row| row.get(0))
            .optional()?
            .flatten();
        if let Some(max_id) = max_id {
            self.cursors.last_event_id = self.cursors.last_event_id.max(max_id);
        }

        self.write_activity_jsonl(&events)?;
        Ok(())
    }

    /// Append events past the id cursor, in id order.
    fn sync_activity_incremental(
        &mut self,
        beads: &Connection,
        proj: &mut Connection,
    ) -> anyhow::Result<()> {
        let events = query_events(
            beads,
            "SELECT id, issue_id, event_type, actor, COALESCE(old_value, ''),
                    COALESCE(new_value, ''), COALESCE(comment, ''), created_at
             FROM events
             WHERE id > ?1
             ORDER BY id ASC
             LIMIT ?2",
            params![self.cursors.last_event_id, EVENT_BATCH_LIMIT],
        )?;

        if events.is_empty() {
            return Ok(());
        }

        let tx = proj.transaction()?;
        let mut max_id = self.cursors.last_event_id;
        for e in &events {
            insert_activity(&tx, e)?;
            max_id = max_id.max(e.id);
        }
        tx.commit()?;

        self.cursors.last_event_id = max_id;
        info!(count = events.len(), last_event_id = max_id, "incremental activity sync");
        Ok(())
    }

    /// Replace projected comments. Bounded; comments are low-volume.
    fn sync_comments(&self, beads: &Connection, proj: &mut Connection) -> anyhow::Result<()> {
        if !table_exists(beads, "comments")? {
            warn!("comments table missing in work database");
            return Ok(());
        }

        let mut stmt = beads.prepare(
            "SELECT id, issue_id, COALESCE(author, ''), text, created_at
             FROM comments
             ORDER BY created_at DESC
             LIMIT 10000",
        )?;
        let rows: Vec<(String, String, String, String, String)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?.to_string(),
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        let tx = proj.transaction()?;
        tx.execute("DELETE FROM task_comments", [])?;
        for (id, issue_id, author, text, created_at) in &rows {
            tx.execute(
                "INSERT INTO task_comments (id, task_id, author, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, issue_id, author, text, to_millis(created_at)],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Denormalised agent roster for the dashboard, as a cache file.
    fn sync_agents(&self, beads: &Connection) -> anyhow::Result<()> {
        #[derive(Serialize)]
        struct AgentEntry {
            id: String,
            name: String,
            active: bool,
            #[serde(rename = "lastSeen")]
            last_seen: i64,
        }

        let mut stmt = beads.prepare(
            "SELECT id, title, status, updated_at
             FROM issues
             WHERE issue_type = 'agent' AND deleted_at IS NULL",
        )?;
        let agents: Vec<AgentEntry> = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let _title: String = row.get(1)?;
                let status: String = row.get(2)?;
                let updated_at: String = row.get(3)?;
                Ok(AgentEntry {
                    name: id.rsplit('/').next().unwrap_or(&id).to_string(),
                    active: status == "open" || status == "in_progress",
                    last_seen: to_millis(&updated_at),
                    id,
                })
            })?
            .collect::<Result<_, _>>()?;

        let path = self.config.cache_dir.join("agents.json");
        let json = serde_json::to_string_pretty(&agents)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    fn write_tasks_json(&self, tasks: &[TaskRow]) -> anyhow::Result<()> {
        #[derive(Serialize)]
        struct Meta {
            timestamp: String,
            version: i64,
            count: usize,
        }
        #[derive(Serialize)]
        struct Envelope<'a> {
            _meta: Meta,
            data: Vec<TaskJson<'a>>,
        }
        #[derive(Serialize)]
        struct TaskJson<'a> {
            id: &'a str,
            title: &'a str,
            status: &'a str,
            priority: i64,
            issue_type: &'a str,
            assignee: &'a Option<String>,
            updated_at: i64,
        }

        let now = Utc::now();
        let envelope = Envelope {
            _meta: Meta {
                timestamp: now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                version: now.timestamp_millis(),
                count: tasks.len(),
            },
            data: tasks
                .iter()
                .map(|t| TaskJson {
                    id: &t.id,
                    title: &t.title,
                    status: &t.status,
                    priority: t.priority,
                    issue_type: &t.issue_type,
                    assignee: &t.assignee,
                    updated_at: to_millis(&t.updated_at),
                })
                .collect(),
        };

        let path = self.config.cache_dir.join("tasks.json");
        let json = serde_json::to_string_pretty(&envelope)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    fn write_activity_jsonl(&self, events: &[EventRow]) -> anyhow::Result<()> {
        let mut lines = String::new();
        for e in events {
            let entry = serde_json::json!({
                "type": map_event_to_activity(&e.event_type),
                "agentId": e.actor,
                "taskId": e.issue_id,
                "content": build_activity_content(e),
                "timestamp": to_millis(&e.created_at),
            });
            lines.push_str(&entry.to_string());
            lines.push('\n');
        }
        let path = self.config.cache_dir.join("activity.jsonl");
        std::fs::write(&path, lines).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

fn open_db(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

fn table_exists(conn: &Connection, name: &str) -> anyhow::Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![name],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Create the projection tables when the store is fresh.
fn ensure_projection_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            priority INTEGER NOT NULL,
            issue_type TEXT NOT NULL,
            assignee TEXT,
            owner TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            closed_at INTEGER,
            indexed_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS activities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type TEXT NOT NULL,
            agent_id TEXT,
            task_id TEXT,
            content TEXT,
            timestamp INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS task_comments (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            author TEXT,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

/// Warn about missing columns in the authoritative schema. Non-fatal: the
/// queries themselves are the real check, this just makes drift visible.
fn verify_beads_schema(conn: &Connection) {
    let required: &[(&str, &[&str])] = &[
        (
            "issues",
            &[
                "id",
                "title",
                "description",
                "status",
                "issue_type",
                "created_at",
                "updated_at",
                "deleted_at",
            ],
        ),
        ("events", &["id", "issue_id", "event_type", "actor", "created_at"]),
        ("comments", &["id", "issue_id", "author", "text", "created_at"]),
    ];

    for (table, columns) in required {
        let mut stmt = match conn.prepare(&format!("PRAGMA table_info({table})")) {
            Ok(s) => s,
            Err(e) => {
                warn!(table, error = %e, "could not inspect table");
                continue;
            }
        };
        let found: Vec<String> = match stmt
            .query_map([], |row| row.get::<_, String>(1))
            .and_then(|rows| rows.collect())
        {
            Ok(f) => f,
            Err(e) => {
                warn!(table, error = %e, "could not read table columns");
                continue;
            }
        };
        for col in *columns {
            if !found.iter().any(|f| f == col) {
                warn!(table, column = col, "work database missing expected column");
            }
        }
    }
}

fn query_tasks(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> anyhow::Result<Vec<TaskRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(TaskRow {
                id: row.get(0)?,
                title: row.get(1)?,
                description: row.get(2)?,
                status: row.get(3)?,
                priority: row.get(4)?,
                issue_type: row.get(5)?,
                assignee: row.get(6)?,
                owner: row.get(7)?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
                closed_at: row.get(10)?,
            })
        })?
        .collect::<Result<_, _>>()?;
    Ok(rows)
}

fn query_events(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> anyhow::Result<Vec<EventRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(EventRow {
                id: row.get(0)?,
                issue_id: row.get(1)?,
                event_type: row.get(2)?,
                actor: row.get(3)?,
                old_value: row.get(4)?,
                new_value: row.get(5)?,
                comment: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<Result<_, _>>()?;
    Ok(rows)
}

fn insert_task(tx: &rusqlite::Transaction, t: &TaskRow) -> anyhow::Result<()> {
    let sql = "INSERT INTO tasks (id, title, description, status, priority, issue_type,
                            assignee, owner, created_at, updated_at, closed_at, indexed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            status = excluded.status,
            priority = excluded.priority,
            issue_type = excluded.issue_type,
            assignee = excluded.assignee,
            owner = excluded.owner,
            updated_at = excluded.updated_at,
            closed_at = excluded.closed_at,
            indexed_at = excluded.indexed_at";
    tx.execute(
        sql,
        params![
            t.id,
            t.title,
            t.description,
            t.status,
            t.priority,
            t.issue_type,
            t.assignee,
            t.owner,
            to_millis(&t.created_at),
            to_millis(&t.updated_at),
            t.closed_at.as_deref().map(to_millis),
            // indexed_at tracks the row's sync time relative to the source
            // update; using updated_at keeps repeated full syncs
            // bit-identical.
            to_millis(&t.updated_at),
        ],
    )?;
    Ok(())
}

fn insert_activity(tx: &rusqlite::Transaction, e: &EventRow) -> anyhow::Result<()> {
    tx.execute(
        "INSERT INTO activities (type, agent_id, task_id, content, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            map_event_to_activity(&e.event_type),
            e.actor,
            e.issue_id,
            build_activity_content(e),
            to_millis(&e.created_at),
        ],
    )?;
    Ok(())
}

/// Event type → dashboard activity type.
fn map_event_to_activity(event_type: &str) -> &'static str {
    match event_type {
        "create" => "task_created",
        "update" | "status_change" | "assign_change" => "task_updated",
        "comment" => "comment_added",
        "assign" => "task_assigned",
        "close" => "task_completed",
        _ => "task_updated",
    }
}

/// Human-readable activity line: the event's comment when present, else a
/// synthesised description.
fn build_activity_content(e: &EventRow) -> String {
    if !e.comment.is_empty() {
        return e.comment.clone();
    }
    match e.event_type.as_str() {
        "create" => "Created task".to_string(),
        "assign" => format!("Assigned to {}", e.new_value),
        "status_change" => format!("Status changed: {} → {}", e.old_value, e.new_value),
        "close" => "Task completed".to_string(),
        _ => e.event_type.clone(),
    }
}

/// Parse the store's timestamp text into unix milliseconds. The store writes
/// RFC3339; older rows use a space-separated form.
fn to_millis(s: &str) -> i64 {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return t.timestamp_millis();
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return t.and_utc().timestamp_millis();
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return t.and_utc().timestamp_millis();
        }
    }
    0
}
