//! Per-rig configuration.
//!
//! Each rig carries a `config.json` at its root. The merge queue reads the
//! `merge_queue` object and the lifecycle manager reads the `lifecycle`
//! object. Unknown keys are ignored; unspecified keys keep their defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Merge queue configuration (`merge_queue` object).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeQueueConfig {
    pub enabled: bool,
    pub target_branch: String,
    pub integration_branches: bool,
    /// Conflict strategy: "assign_back" or "auto_rebase".
    pub on_conflict: String,
    pub run_tests: bool,
    pub test_command: String,
    pub delete_merged_branches: bool,
    pub retry_flaky_tests: u32,
    /// Duration string, e.g. "30s".
    pub poll_interval: String,
    pub max_concurrent: u32,
}

impl Default for MergeQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_branch: "main".into(),
            integration_branches: true,
            on_conflict: "assign_back".into(),
            run_tests: true,
            test_command: String::new(),
            delete_merged_branches: true,
            retry_flaky_tests: 1,
            poll_interval: "30s".into(),
            max_concurrent: 1,
        }
    }
}

impl MergeQueueConfig {
    pub fn poll_interval(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.poll_interval, "merge_queue.poll_interval")
    }
}

/// Worker lifecycle configuration (`lifecycle` object).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub enabled: bool,
    pub auto_cleanup: bool,
    pub auto_recovery: bool,
    /// Duration string, e.g. "30s".
    pub check_interval: String,
    /// Duration string, e.g. "5m".
    pub stale_threshold: String,
    /// Maximum polecats per rig (0 = unlimited).
    pub max_polecats: u32,
    /// Maximum pooled dogs per town (0 = unlimited).
    pub max_dogs: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_cleanup: true,
            auto_recovery: true,
            check_interval: "30s".into(),
            stale_threshold: "5m".into(),
            max_polecats: 10,
            max_dogs: 4,
        }
    }
}

impl LifecycleConfig {
    pub fn check_interval(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.check_interval, "lifecycle.check_interval")
    }

    pub fn stale_threshold(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.stale_threshold, "lifecycle.stale_threshold")
    }
}

/// Rig-level `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigConfig {
    #[serde(default)]
    pub merge_queue: MergeQueueConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl RigConfig {
    /// Load from `<rig>/config.json`. A missing file yields defaults; a
    /// malformed file or bad duration string is a config error.
    pub fn load(rig_path: &Path) -> anyhow::Result<Self> {
        let path = rig_path.join("config.json");
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("reading {}", path.display())))
            }
        };
        let config = Self::parse(&contents)?;
        config
            .merge_queue
            .poll_interval()
            .with_context(|| format!("in {}", path.display()))?;
        config
            .lifecycle
            .check_interval()
            .with_context(|| format!("in {}", path.display()))?;
        config
            .lifecycle
            .stale_threshold()
            .with_context(|| format!("in {}", path.display()))?;
        Ok(config)
    }

    /// Parse from a JSON string.
    pub fn parse(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid config.json: {e}")).into())
    }
}

fn parse_duration(s: &str, field: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s)
        .map_err(|e| ExitError::Config(format!("invalid {field} {s:?}: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = MergeQueueConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.target_branch, "main");
        assert_eq!(cfg.on_conflict, "assign_back");
        assert_eq!(cfg.poll_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(cfg.max_concurrent, 1);
        assert_eq!(cfg.retry_flaky_tests, 1);

        let lc = LifecycleConfig::default();
        assert!(lc.enabled && lc.auto_cleanup && lc.auto_recovery);
        assert_eq!(lc.check_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(lc.stale_threshold().unwrap(), Duration::from_secs(300));
        assert_eq!(lc.max_polecats, 10);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RigConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.merge_queue.target_branch, "main");
    }

    #[test]
    fn partial_merge_queue_overlays_defaults() {
        let json = r#"{
            "merge_queue": {
                "target_branch": "develop",
                "poll_interval": "10s",
                "max_concurrent": 2,
                "run_tests": false,
                "test_command": "make test"
            }
        }"#;
        let cfg = RigConfig::parse(json).unwrap();
        assert_eq!(cfg.merge_queue.target_branch, "develop");
        assert_eq!(
            cfg.merge_queue.poll_interval().unwrap(),
            Duration::from_secs(10)
        );
        assert_eq!(cfg.merge_queue.max_concurrent, 2);
        assert!(!cfg.merge_queue.run_tests);
        assert_eq!(cfg.merge_queue.test_command, "make test");
        // Unspecified keys keep defaults.
        assert_eq!(cfg.merge_queue.on_conflict, "assign_back");
        assert!(cfg.merge_queue.delete_merged_branches);
    }

    #[test]
    fn no_merge_queue_section_uses_defaults() {
        let json = r#"{"type": "rig", "version": 1, "name": "test-rig"}"#;
        let cfg = RigConfig::parse(json).unwrap();
        assert_eq!(
            cfg.merge_queue.poll_interval().unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn unknown_keys_ignored() {
        let json = r#"{"merge_queue": {"enabled": true, "future_knob": 9}}"#;
        let cfg = RigConfig::parse(json).unwrap();
        assert!(cfg.merge_queue.enabled);
    }

    #[test]
    fn invalid_poll_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"merge_queue": {"poll_interval": "not-a-duration"}}"#,
        )
        .unwrap();
        assert!(RigConfig::load(dir.path()).is_err());
    }

    #[test]
    fn lifecycle_section_parses() {
        let json = r#"{
            "lifecycle": {
                "enabled": false,
                "check_interval": "1m",
                "max_polecats": 3
            }
        }"#;
        let cfg = RigConfig::parse(json).unwrap();
        assert!(!cfg.lifecycle.enabled);
        assert_eq!(
            cfg.lifecycle.check_interval().unwrap(),
            Duration::from_secs(60)
        );
        assert_eq!(cfg.lifecycle.max_polecats, 3);
        // Unspecified keys keep defaults.
        assert!(cfg.lifecycle.auto_cleanup);
        assert_eq!(cfg.lifecycle.stale_threshold().unwrap(), Duration::from_secs(300));
    }
}
