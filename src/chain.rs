//! Walking a patch's chain of base patches
//!
//! Chains are walked iteratively with a visited set, so depth is bounded only
//! by the data and a corrupted base pointer surfaces as [`PatchError::ChainCycle`]
//! instead of recursing forever.

use crate::db::Database;
use crate::error::{PatchError, Result};
use crate::model::Patch;
use std::collections::HashSet;

/// Layers from `patch` down to its root.
///
/// Index 0 is `patch` itself; the last element is the root patch.
pub fn ancestry(db: &Database, patch: &Patch) -> Result<Vec<Patch>> {
    let mut chain = vec![patch.clone()];
    let mut seen = HashSet::from([patch.id]);
    let mut next = patch.base_patch_id;

    while let Some(base_id) = next {
        if !seen.insert(base_id) {
            return Err(PatchError::ChainCycle(base_id));
        }
        let base = db.get_patch(base_id)?.ok_or(PatchError::PatchNotFound(base_id))?;
        next = base.base_patch_id;
        chain.push(base);
    }

    tracing::debug!(patch = patch.id, depth = chain.len(), "resolved patch chain");
    Ok(chain)
}

/// Commit hash of the root at the end of `chain`
pub fn root_commit(chain: &[Patch]) -> Result<&str> {
    let root = chain
        .last()
        .ok_or_else(|| PatchError::invalid("Empty patch chain"))?;
    root.commit_hash
        .as_deref()
        .ok_or_else(|| PatchError::invalid(format!("Root patch {} has no commit", root.id)))
}

/// Whether making `new_base_id` the base of `patch_id` would close a loop
pub fn would_create_cycle(db: &Database, patch_id: i32, new_base_id: i32) -> Result<bool> {
    let mut seen = HashSet::new();
    let mut next = Some(new_base_id);

    while let Some(id) = next {
        if id == patch_id {
            return Ok(true);
        }
        if !seen.insert(id) {
            // already looping without reaching patch_id
            return Err(PatchError::ChainCycle(id));
        }
        next = db.get_patch(id)?.ok_or(PatchError::PatchNotFound(id))?.base_patch_id;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_db;
    use chrono::Utc;

    #[test]
    fn test_ancestry_orders_target_to_root() {
        let (_dir, db) = temp_db();
        let root = db.create_root_patch("root", "abc123", Utc::now()).unwrap();
        let p1 = db.create_patch("p1", root.id, None).unwrap();
        let p2 = db.create_patch("p2", p1.id, None).unwrap();

        let chain = ancestry(&db, &p2).unwrap();
        let ids: Vec<i32> = chain.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![p2.id, p1.id, root.id]);
        assert_eq!(root_commit(&chain).unwrap(), "abc123");
    }

    #[test]
    fn test_root_is_its_own_chain() {
        let (_dir, db) = temp_db();
        let root = db.create_root_patch("root", "abc123", Utc::now()).unwrap();
        assert_eq!(ancestry(&db, &root).unwrap(), vec![root]);
    }

    #[test]
    fn test_cycle_detected() {
        let (_dir, db) = temp_db();
        let root = db.create_root_patch("root", "abc123", Utc::now()).unwrap();
        let p1 = db.create_patch("p1", root.id, None).unwrap();
        let p2 = db.create_patch("p2", p1.id, None).unwrap();

        assert!(would_create_cycle(&db, p1.id, p2.id).unwrap());
        assert!(!would_create_cycle(&db, p2.id, root.id).unwrap());

        // bypass the check to corrupt the chain on purpose
        db.set_base_patch(p1.id, p2.id).unwrap();
        let p2 = db.get_patch(p2.id).unwrap().unwrap();
        assert!(matches!(ancestry(&db, &p2), Err(PatchError::ChainCycle(_))));
    }
}
