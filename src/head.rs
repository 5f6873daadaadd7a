//! Root patch for the tip of a branch

use crate::db::{Database, DbError};
use crate::error::{PatchError, Result};
use crate::model::Patch;
use crate::repository::CodeRepository;

/// Root patch for the commit at the head of `branch`, creating it on first use.
///
/// Idempotent per commit: a second call for an unchanged head returns the same
/// patch, and two callers racing on a new head end up with one row.
pub fn materialize_head<R: CodeRepository + ?Sized>(db: &Database, repo: &R, branch: &str) -> Result<Patch> {
    let head = repo.resolve_branch_head(branch)?;

    if let Some(patch) = db.find_patch_by_commit(head.as_str())? {
        tracing::debug!(branch, commit = %head, patch = patch.id, "head already materialized");
        return Ok(patch);
    }

    let info = repo.commit_info(&head)?;
    match db.create_root_patch(&info.patch_title(), &info.commit, info.committed_at) {
        Ok(patch) => {
            tracing::info!(branch, commit = %head, patch = patch.id, title = %info.title(), "materialized root patch");
            Ok(patch)
        }
        Err(DbError::Duplicate(_)) => {
            tracing::debug!(branch, commit = %head, "root patch created concurrently");
            db.find_patch_by_commit(head.as_str())?
                .ok_or_else(|| PatchError::invalid(format!("Root patch for {} vanished", head)))
        }
        Err(e) => Err(e.into()),
    }
}
