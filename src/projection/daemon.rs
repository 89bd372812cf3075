//! Projection daemon lifecycle.
//!
//! The sync daemon is single-instance per town, enforced with a pid file
//! under `<town>/daemon/`. Stale pid files (process gone) are cleared on
//! startup. The state file persists the sync cursors and counters so a
//! restarted daemon resumes incrementally.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::lifecycle::sleep_cancellable;
use crate::projection::{Cursors, SyncConfig, Syncer};
use crate::workspace::TownPaths;

const PID_FILE: &str = "projection-sync.pid";
const STATE_FILE: &str = "projection-sync.state";
pub const LOG_FILE: &str = "projection-sync.log";

/// Warn when more than half of recent ticks failed.
const ERROR_RATE_THRESHOLD: f64 = 0.5;

/// Startup makes this many sync attempts before giving up.
const STARTUP_ATTEMPTS: u32 = 3;

/// Persisted daemon state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonState {
    pub running: bool,
    pub pid: u32,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub last_sync: String,
    #[serde(default)]
    pub sync_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub last_event_id: i64,
    #[serde(default)]
    pub last_task_update: i64,
    #[serde(default)]
    pub incremental_enabled: bool,
}

fn pid_path(town: &TownPaths) -> PathBuf {
    town.daemon_dir().join(PID_FILE)
}

fn state_path(town: &TownPaths) -> PathBuf {
    town.daemon_dir().join(STATE_FILE)
}

pub fn log_path(town: &TownPaths) -> PathBuf {
    town.daemon_dir().join(LOG_FILE)
}

/// Whether the daemon is running, and under which pid. A pid file whose
/// process no longer exists is stale and removed.
pub fn is_running(town: &TownPaths) -> anyhow::Result<(bool, u32)> {
    let path = pid_path(town);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((false, 0)),
        Err(e) => return Err(anyhow::Error::new(e).context("reading pid file")),
    };

    let pid: u32 = contents
        .trim()
        .parse()
        .with_context(|| format!("parsing pid file {}", path.display()))?;

    if process_exists(pid) {
        Ok((true, pid))
    } else {
        let _ = std::fs::remove_file(&path);
        Ok((false, 0))
    }
}

/// Check for a live process by pid.
fn process_exists(pid: u32) -> bool {
    // Single-host orchestration on Linux; /proc is authoritative.
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Start the daemon as a detached child of the current executable.
pub fn start(town: &TownPaths, interval: Option<Duration>) -> anyhow::Result<u32> {
    let (running, pid) = is_running(town)?;
    if running {
        anyhow::bail!("daemon already running (PID {pid})");
    }

    let exe = std::env::current_exe().context("finding executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("projection-daemon").arg("run");
    if let Some(interval) = interval {
        cmd.arg("--interval").arg(format!("{}s", interval.as_secs()));
    }
    cmd.current_dir(town.root())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    // Detached on purpose: the child writes its own pid file and outlives us.
    let child = cmd.spawn().context("starting daemon")?;
    drop(child);

    std::thread::sleep(Duration::from_millis(200));

    let (running, pid) = is_running(town)?;
    if !running {
        anyhow::bail!("daemon failed to start (check 'gt projection-daemon logs')");
    }
    Ok(pid)
}

/// Stop a running daemon with SIGTERM; its in-flight tick completes.
pub fn stop(town: &TownPaths) -> anyhow::Result<u32> {
    let (running, pid) = is_running(town)?;
    if !running {
        anyhow::bail!("daemon is not running");
    }

    crate::subprocess::run_command("kill", &["-TERM", &pid.to_string()], None)
        .with_context(|| format!("terminating process {pid}"))?;
    let _ = std::fs::remove_file(pid_path(town));
    Ok(pid)
}

pub fn load_state(town: &TownPaths) -> anyhow::Result<DaemonState> {
    let path = state_path(town);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DaemonState::default()),
        Err(e) => return Err(anyhow::Error::new(e).context("reading state file")),
    };
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

fn save_state(town: &TownPaths, state: &DaemonState) -> anyhow::Result<()> {
    let dir = town.daemon_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string(state)?;
    std::fs::write(state_path(town), json)?;
    Ok(())
}

/// The foreground daemon loop: acquire the pid file, reload cursors, sync on
/// the interval, persist state every tick.
pub struct Daemon {
    town: TownPaths,
    syncer: Syncer,
    interval: Duration,
    started_at: DateTime<Utc>,
    sync_count: u64,
    error_count: u64,
    last_sync: Option<DateTime<Utc>>,
}

impl Daemon {
    pub fn new(town: TownPaths, interval: Duration) -> anyhow::Result<Self> {
        let state = load_state(&town)?;
        let cursors = Cursors {
            last_event_id: state.last_event_id,
            last_task_update: state.last_task_update,
            incremental_enabled: state.incremental_enabled,
        };
        let config = SyncConfig {
            beads_db: town.beads_db(),
            projection_db: town.projection_db(),
            cache_dir: town.cache_dir(),
        };
        Ok(Self {
            syncer: Syncer::new(config, cursors),
            town,
            interval,
            started_at: Utc::now(),
            sync_count: state.sync_count,
            error_count: state.error_count,
            last_sync: None,
        })
    }

    /// Run until `cancel` is set (SIGTERM/SIGINT). The pid file is held for
    /// the whole run and removed on the way out.
    pub fn run(&mut self, cancel: Arc<AtomicBool>) -> anyhow::Result<()> {
        let (running, pid) = is_running(&self.town)?;
        if running {
            anyhow::bail!("daemon already running (PID {pid})");
        }
        std::fs::create_dir_all(self.town.daemon_dir())?;
        std::fs::write(pid_path(&self.town), std::process::id().to_string())?;

        info!(interval_secs = self.interval.as_secs(), "projection sync daemon starting");

        let result = self.run_loop(&cancel);

        let _ = std::fs::remove_file(pid_path(&self.town));
        let mut state = self.state();
        state.running = false;
        state.pid = 0;
        let _ = save_state(&self.town, &state);

        result
    }

    fn run_loop(&mut self, cancel: &Arc<AtomicBool>) -> anyhow::Result<()> {
        // Initial sync with limited retries; a town whose store is briefly
        // locked should not kill the daemon at boot.
        let mut attempt = 0;
        loop {
            match self.tick() {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt >= STARTUP_ATTEMPTS {
                        return Err(e.context(format!(
                            "initial sync failed after {STARTUP_ATTEMPTS} attempts"
                        )));
                    }
                    warn!(attempt, error = %e, "initial sync attempt failed");
                    std::thread::sleep(Duration::from_secs(attempt as u64));
                }
            }
        }

        while !cancel.load(Ordering::Relaxed) {
            sleep_cancellable(self.interval, cancel);
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.tick() {
                warn!(error = %e, "sync failed");
            }
        }

        info!("projection sync daemon stopping");
        Ok(())
    }

    /// One sync tick. Updates counters and persists state regardless of
    /// outcome; the error-rate warning fires when failures dominate.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        let result = self.syncer.sync();
        match &result {
            Ok(()) => {
                self.sync_count += 1;
                self.last_sync = Some(Utc::now());
            }
            Err(_) => {
                self.error_count += 1;
                let total = (self.sync_count + self.error_count) as f64;
                let rate = self.error_count as f64 / total;
                if rate > ERROR_RATE_THRESHOLD {
                    warn!(
                        error_rate = format!("{:.0}%", rate * 100.0),
                        "high sync error rate, check work database connectivity"
                    );
                }
            }
        }

        if let Err(e) = save_state(&self.town, &self.state()) {
            warn!(error = %e, "failed to save daemon state");
        }
        result
    }

    fn state(&self) -> DaemonState {
        DaemonState {
            running: true,
            pid: std::process::id(),
            started_at: self.started_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            last_sync: self
                .last_sync
                .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                .unwrap_or_default(),
            sync_count: self.sync_count,
            error_count: self.error_count,
            last_event_id: self.syncer.cursors.last_event_id,
            last_task_update: self.syncer.cursors.last_task_update,
            incremental_enabled: self.syncer.cursors.incremental_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_town() -> (tempfile::TempDir, TownPaths) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("mayor")).unwrap();
        let town = TownPaths::new(dir.path());
        (dir, town)
    }

    #[test]
    fn state_round_trips() {
        let (_dir, town) = make_town();
        let state = DaemonState {
            running: true,
            pid: 1234,
            started_at: "2026-02-06T10:00:00Z".into(),
            last_sync: "2026-02-06T10:05:00Z".into(),
            sync_count: 10,
            error_count: 1,
            last_event_id: 42,
            last_task_update: 99,
            incremental_enabled: true,
        };
        save_state(&town, &state).unwrap();

        let loaded = load_state(&town).unwrap();
        assert_eq!(loaded.pid, 1234);
        assert_eq!(loaded.sync_count, 10);
        assert_eq!(loaded.last_event_id, 42);
        assert!(loaded.incremental_enabled);
    }

    #[test]
    fn missing_state_is_default() {
        let (_dir, town) = make_town();
        let state = load_state(&town).unwrap();
        assert_eq!(state.sync_count, 0);
        assert!(!state.incremental_enabled);
    }

    #[test]
    fn stale_pid_file_is_cleared() {
        let (_dir, town) = make_town();
        std::fs::create_dir_all(town.daemon_dir()).unwrap();
        // A pid that cannot exist.
        std::fs::write(pid_path(&town), "4194304").unwrap();

        let (running, pid) = is_running(&town).unwrap();
        assert!(!running);
        assert_eq!(pid, 0);
        assert!(!pid_path(&town).exists());
    }

    #[test]
    fn own_pid_counts_as_running() {
        let (_dir, town) = make_town();
        std::fs::create_dir_all(town.daemon_dir()).unwrap();
        std::fs::write(pid_path(&town), std::process::id().to_string()).unwrap();

        let (running, pid) = is_running(&town).unwrap();
        assert!(running);
        assert_eq!(pid, std::process::id());
    }

    #[test]
    fn garbage_pid_file_is_an_error() {
        let (_dir, town) = make_town();
        std::fs::create_dir_all(town.daemon_dir()).unwrap();
        std::fs::write(pid_path(&town), "not-a-pid").unwrap();
        assert!(is_running(&town).is_err());
    }

    #[test]
    fn stop_without_daemon_errors() {
        let (_dir, town) = make_town();
        assert!(stop(&town).is_err());
    }
}
