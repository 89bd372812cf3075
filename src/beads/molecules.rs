//! Builtin workflow molecules.
//!
//! Molecules are workflow templates stored as beads of type=molecule. The
//! builtin set covers the common polecat loops and is seeded into a fresh
//! work database at rig setup.

use crate::error::StoreError;

use super::{CreateOptions, ListOptions, WorkStore};

/// A builtin molecule template.
pub struct BuiltinMolecule {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
}

/// The standard work molecule attached to every polecat at dispatch.
pub const POLECAT_WORK_MOLECULE: &str = "mol-polecat-work";

/// All builtin molecule definitions.
pub fn builtin_molecules() -> Vec<BuiltinMolecule> {
    vec![
        BuiltinMolecule {
            id: "mol-engineer-in-box",
            title: "Engineer in a Box",
            description: "Full workflow from design to merge.\n\n\
## Step: design\n\
Think carefully about architecture. Consider:\n\
- Existing patterns in the codebase\n\
- Trade-offs between approaches\n\
- Testability and maintainability\n\n\
Write a brief design summary before proceeding.\n\n\
## Step: implement\n\
Write the code. Follow codebase conventions.\n\
Needs: design\n\n\
## Step: review\n\
Self-review the changes. Look for:\n\
- Bugs and edge cases\n\
- Style issues\n\
- Missing error handling\n\
Needs: implement\n\n\
## Step: test\n\
Write and run tests. Cover happy path and edge cases.\n\
Fix any failures before proceeding.\n\
Needs: implement\n\n\
## Step: submit\n\
Submit for merge via refinery.\n\
Needs: review, test",
        },
        BuiltinMolecule {
            id: "mol-quick-fix",
            title: "Quick Fix",
            description: "Fast path for small changes.\n\n\
## Step: implement\n\
Make the fix. Keep it focused.\n\n\
## Step: test\n\
Run relevant tests. Fix any regressions.\n\
Needs: implement\n\n\
## Step: submit\n\
Submit for merge.\n\
Needs: test",
        },
        BuiltinMolecule {
            id: "mol-research",
            title: "Research",
            description: "Investigation workflow.\n\n\
## Step: investigate\n\
Explore the question. Search code, read docs,\n\
understand context. Take notes.\n\n\
## Step: document\n\
Write up findings. Include:\n\
- What you learned\n\
- Recommendations\n\
- Open questions\n\
Needs: investigate",
        },
        BuiltinMolecule {
            id: "mol-install-binary",
            title: "Install Binary",
            description: "Single step to rebuild and install the gt binary after code changes.\n\n\
## Step: install\n\
Build and install the gt binary locally.\n\n\
Run from the rig directory:\n\
```\n\
cargo install --path . --locked\n\
```\n\n\
Verify the installed binary is updated:\n\
```\n\
which gt\n\
gt --version\n\
```",
        },
    ]
}

/// Seed all builtin molecules, skipping any that already exist (matched by
/// title). Safe to run repeatedly. Returns the number created.
pub fn seed_builtin_molecules(store: &dyn WorkStore) -> Result<usize, StoreError> {
    let existing = store.list(&ListOptions {
        issue_type: "molecule".into(),
        ..Default::default()
    })?;
    let existing_titles: Vec<&str> = existing.iter().map(|i| i.title.as_str()).collect();

    let mut created = 0;
    for mol in builtin_molecules() {
        if existing_titles.contains(&mol.title) {
            continue;
        }
        store.create(&CreateOptions {
            title: mol.title.to_string(),
            issue_type: "molecule".into(),
            priority: 2,
            description: mol.description.to_string(),
            ..Default::default()
        })?;
        created += 1;
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryStore;

    #[test]
    fn builtin_set_is_stable() {
        let mols = builtin_molecules();
        assert_eq!(mols.len(), 4);
        assert!(mols.iter().any(|m| m.id == "mol-engineer-in-box"));
        assert!(mols.iter().any(|m| m.id == "mol-quick-fix"));
        // Step headers are what the executor follows.
        assert!(mols[0].description.contains("## Step: design"));
        assert!(mols[0].description.contains("Needs: review, test"));
    }

    #[test]
    fn seed_creates_all_on_empty_store() {
        let store = MemoryStore::new();
        let created = seed_builtin_molecules(&store).unwrap();
        assert_eq!(created, 4);
        let listed = store
            .list(&ListOptions {
                issue_type: "molecule".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(listed.len(), 4);
    }

    #[test]
    fn seed_is_idempotent() {
        let store = MemoryStore::new();
        assert_eq!(seed_builtin_molecules(&store).unwrap(), 4);
        assert_eq!(seed_builtin_molecules(&store).unwrap(), 0);
        let listed = store
            .list(&ListOptions {
                issue_type: "molecule".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(listed.len(), 4);
    }
}
