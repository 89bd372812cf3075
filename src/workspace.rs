//! Town workspace discovery and on-disk layout.
//!
//! A town is the outer workspace: it contains a `mayor/` directory, one
//! directory per rig, a `daemon/` directory for background services, and a
//! `cache/` directory for projections.

use std::path::{Path, PathBuf};

use anyhow::Context;

/// Walk up from `start` looking for a directory containing `mayor/`.
pub fn find_town_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join("mayor").is_dir() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Find the town root from the current working directory, or error with a
/// usage hint.
pub fn find_from_cwd() -> anyhow::Result<PathBuf> {
    let cwd = std::env::current_dir().context("getting current directory")?;
    find_town_root(&cwd).ok_or_else(|| {
        anyhow::anyhow!("not inside a town workspace (no mayor/ directory found above {})", cwd.display())
    })
}

/// Per-town directory layout.
pub struct TownPaths {
    root: PathBuf,
}

impl TownPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn projection_db(&self) -> PathBuf {
        self.cache_dir().join("projections.db")
    }

    /// Authoritative beads database under the town's `.beads/`.
    pub fn beads_db(&self) -> PathBuf {
        self.root.join(".beads").join("beads.db")
    }

    pub fn rig_dir(&self, rig: &str) -> PathBuf {
        self.root.join(rig)
    }

    /// Canonical clone for a rig; holds the rig's `.beads/`.
    pub fn rig_clone(&self, rig: &str) -> PathBuf {
        self.rig_dir(rig).join("mayor").join("rig")
    }

    /// Worktree for one polecat.
    pub fn polecat_dir(&self, rig: &str, polecat: &str) -> PathBuf {
        self.rig_dir(rig).join("polecats").join(polecat)
    }
}

/// Rigs in a town: top-level directories with their own `mayor/` (the rig's
/// canonical clone lives at `<rig>/mayor/rig`).
pub fn list_rigs(town_root: &Path) -> anyhow::Result<Vec<String>> {
    let mut rigs = Vec::new();
    for entry in std::fs::read_dir(town_root)
        .with_context(|| format!("reading {}", town_root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "mayor" || name == "daemon" || name == "cache" || name.starts_with('.') {
            continue;
        }
        if entry.path().join("mayor").is_dir() {
            rigs.push(name);
        }
    }
    rigs.sort();
    Ok(rigs)
}

/// Determine the rig a working directory belongs to: the first path component
/// under the town root.
pub fn rig_from_dir(town_root: &Path, dir: &Path) -> anyhow::Result<String> {
    let rel = dir
        .strip_prefix(town_root)
        .map_err(|_| anyhow::anyhow!("{} is not inside the town", dir.display()))?;
    let first = rel
        .components()
        .next()
        .ok_or_else(|| anyhow::anyhow!("not inside a rig directory"))?;
    let name = first.as_os_str().to_string_lossy().to_string();
    if name == "mayor" || name == "daemon" || name == "cache" {
        anyhow::bail!("not inside a rig directory");
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_town() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("mayor")).unwrap();
        std::fs::create_dir_all(dir.path().join("greenplace").join("polecats")).unwrap();
        dir
    }

    #[test]
    fn find_root_from_nested_dir() {
        let town = make_town();
        let nested = town.path().join("greenplace").join("polecats");
        let found = find_town_root(&nested).unwrap();
        assert_eq!(found, town.path());
    }

    #[test]
    fn find_root_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_town_root(dir.path()).is_none());
    }

    #[test]
    fn layout_paths() {
        let paths = TownPaths::new("/town");
        assert_eq!(paths.daemon_dir(), PathBuf::from("/town/daemon"));
        assert_eq!(
            paths.projection_db(),
            PathBuf::from("/town/cache/projections.db")
        );
        assert_eq!(
            paths.rig_clone("greenplace"),
            PathBuf::from("/town/greenplace/mayor/rig")
        );
        assert_eq!(
            paths.polecat_dir("greenplace", "alice"),
            PathBuf::from("/town/greenplace/polecats/alice")
        );
    }

    #[test]
    fn list_rigs_finds_rig_dirs() {
        let town = make_town();
        // greenplace has no mayor/ yet, so it is not a rig.
        assert!(list_rigs(town.path()).unwrap().is_empty());

        std::fs::create_dir_all(town.path().join("greenplace").join("mayor")).unwrap();
        std::fs::create_dir_all(town.path().join("daemon")).unwrap();
        assert_eq!(list_rigs(town.path()).unwrap(), vec!["greenplace"]);
    }

    #[test]
    fn rig_from_nested_dir() {
        let town = make_town();
        let nested = town.path().join("greenplace").join("polecats");
        let rig = rig_from_dir(town.path(), &nested).unwrap();
        assert_eq!(rig, "greenplace");
    }

    #[test]
    fn rig_from_mayor_dir_rejected() {
        let town = make_town();
        let mayor = town.path().join("mayor");
        assert!(rig_from_dir(town.path(), &mayor).is_err());
    }
}
