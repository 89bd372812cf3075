//! Session adapter over tmux.
//!
//! Workers run inside named tmux sessions (`gt-<rig>-<worker>`, `gt-mayor`
//! for the town coordinator). The adapter covers session lifecycle, the
//! nudge contract for injecting input into an interactive agent, and
//! non-disruptive status-line notifications.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::subprocess::Tool;

/// Delay between sending literal text and the submitting Enter. Interactive
/// agents debounce input; sending Enter in the same keystroke batch gets the
/// text swallowed.
const NUDGE_DEBOUNCE: Duration = Duration::from_millis(500);

/// How often to poll the foreground program in [`Tmux::wait_for_program`].
const WAIT_POLL: Duration = Duration::from_millis(500);

/// tmux client. Stateless; every call shells out.
pub struct Tmux;

impl Tmux {
    pub fn new() -> Self {
        Self
    }

    fn tmux(&self) -> Tool {
        Tool::new("tmux").timeout(Duration::from_secs(10))
    }

    /// True if a session with this exact name exists.
    pub fn has_session(&self, name: &str) -> anyhow::Result<bool> {
        let output = self
            .tmux()
            .args(&["has-session", "-t", &exact_target(name)])
            .run()?;
        Ok(output.success())
    }

    /// Create a detached session running `command` in `workdir`.
    pub fn new_session(&self, name: &str, workdir: &Path, command: &str) -> anyhow::Result<()> {
        let dir = workdir.to_string_lossy();
        self.tmux()
            .args(&["new-session", "-d", "-s", name, "-c", &dir, command])
            .run_ok()
            .with_context(|| format!("creating session {name}"))?;
        Ok(())
    }

    /// Kill a session, reaping the pane's process tree first so descendant
    /// processes don't outlive it as zombies.
    pub fn kill_session(&self, name: &str) -> anyhow::Result<()> {
        for pid in self.pane_pids(name)? {
            let _ = Tool::new("kill").args(&["-TERM", "--", &format!("-{pid}")]).run();
            let _ = Tool::new("kill").args(&["-TERM", &pid.to_string()]).run();
        }
        self.tmux()
            .args(&["kill-session", "-t", &exact_target(name)])
            .run_ok()
            .with_context(|| format!("killing session {name}"))?;
        Ok(())
    }

    /// PIDs of the session's panes.
    fn pane_pids(&self, name: &str) -> anyhow::Result<Vec<i32>> {
        let output = self
            .tmux()
            .args(&[
                "list-panes",
                "-t",
                &exact_target(name),
                "-F",
                "#{pane_pid}",
            ])
            .run()?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect())
    }

    /// Inject text into a session using the nudge contract: literal-mode
    /// send-keys, a debounce pause, then a separate Enter.
    pub fn nudge(&self, name: &str, text: &str) -> anyhow::Result<()> {
        let target = exact_target(name);
        self.tmux()
            .args(&["send-keys", "-t", &target, "-l", text])
            .run_ok()
            .with_context(|| format!("sending text to {name}"))?;
        std::thread::sleep(NUDGE_DEBOUNCE);
        self.tmux()
            .args(&["send-keys", "-t", &target, "Enter"])
            .run_ok()
            .with_context(|| format!("submitting text to {name}"))?;
        Ok(())
    }

    /// Show a status-line message in the session. Non-disruptive: it never
    /// touches the foreground program's input.
    pub fn display_message(&self, name: &str, message: &str) -> anyhow::Result<()> {
        self.tmux()
            .args(&["display-message", "-t", &exact_target(name), message])
            .run_ok()?;
        Ok(())
    }

    /// The session's current foreground command (e.g. "bash", "claude").
    pub fn current_command(&self, name: &str) -> anyhow::Result<String> {
        let output = self
            .tmux()
            .args(&[
                "display-message",
                "-t",
                &exact_target(name),
                "-p",
                "#{pane_current_command}",
            ])
            .run_ok()
            .with_context(|| format!("querying foreground command of {name}"))?;
        Ok(output.stdout.trim().to_string())
    }

    /// Poll until the session's foreground command is one of `programs`.
    /// The check is conservative: a matching foreground program does not
    /// prove the agent inside is fully initialised, only that it started.
    pub fn wait_for_program(
        &self,
        name: &str,
        programs: &[&str],
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let start = Instant::now();
        loop {
            let current = self.current_command(name)?;
            if programs.contains(&current.as_str()) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                anyhow::bail!(
                    "session {name}: foreground program {current:?} never became one of {programs:?}"
                );
            }
            std::thread::sleep(WAIT_POLL);
        }
    }
}

impl Default for Tmux {
    fn default() -> Self {
        Self::new()
    }
}

/// tmux matches `-t name` as a prefix; `=name` forces an exact match.
fn exact_target(name: &str) -> String {
    format!("={name}")
}

/// Session name for a rig worker.
pub fn session_name(rig: &str, worker: &str) -> String {
    format!("gt-{rig}-{worker}")
}

/// Session name for the town coordinator.
pub const MAYOR_SESSION: &str = "gt-mayor";

/// Parse `gt-<rig>-<worker>` back into (rig, worker). Returns None for
/// sessions that are not gt worker sessions.
pub fn parse_session_name(name: &str) -> Option<(String, String)> {
    let rest = name.strip_prefix("gt-")?;
    let (rig, worker) = rest.split_once('-')?;
    if rig.is_empty() || worker.is_empty() {
        return None;
    }
    Some((rig.to_string(), worker.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_round_trip() {
        let name = session_name("greenplace", "alice");
        assert_eq!(name, "gt-greenplace-alice");
        let (rig, worker) = parse_session_name(&name).unwrap();
        assert_eq!(rig, "greenplace");
        assert_eq!(worker, "alice");
    }

    #[test]
    fn parse_keeps_dashes_in_worker() {
        let (rig, worker) = parse_session_name("gt-greenplace-polecat-01").unwrap();
        assert_eq!(rig, "greenplace");
        assert_eq!(worker, "polecat-01");
    }

    #[test]
    fn parse_rejects_foreign_sessions() {
        assert!(parse_session_name("vim").is_none());
        assert!(parse_session_name("gt-").is_none());
        assert!(parse_session_name("gt-onlyrig").is_none());
    }

    #[test]
    fn exact_target_prefixes_equals() {
        assert_eq!(exact_target("gt-x-y"), "=gt-x-y");
    }

    #[test]
    fn missing_session_reports_false() {
        let tmux = Tmux::new();
        // Either tmux is absent (error) or the session does not exist.
        if let Ok(has) = tmux.has_session("gt-session-that-never-exists") {
            assert!(!has);
        }
    }
}
