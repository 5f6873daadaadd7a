//! File content resolution and the edit session
//!
//! Because a stored replacement fully shadows everything below it, content is
//! resolved by walking from the requested patch toward the root and stopping at
//! the first layer that carries replacement text for the file. Only when no
//! layer does is the blob read from the root commit.

use crate::chain::{ancestry, root_commit};
use crate::db::Database;
use crate::error::{PatchError, Result};
use crate::model::{ChangedFile, Patch};
use crate::repository::{CodeRepository, RepoError};
use crate::tree::{normalize_path, resolve_dir, split_path};

/// Read `filename` from a commit's tree
pub fn read_commit_file<R: CodeRepository + ?Sized>(repo: &R, commit: &str, filename: &str) -> Result<Vec<u8>> {
    let segments = split_path(filename);
    let not_found = || PatchError::FileNotFound(segments.join("/"));
    let (name, dirs) = segments.split_last().ok_or_else(not_found)?;

    let tree = match resolve_dir(repo, commit, dirs) {
        Ok(tree) => tree,
        Err(PatchError::PathNotFound(_)) => return Err(not_found()),
        Err(e) => return Err(e),
    };
    match repo.blob_content(&tree, name) {
        Ok(bytes) => Ok(bytes),
        Err(RepoError::FileNotFound(_)) => Err(not_found()),
        Err(e) => Err(e.into()),
    }
}

/// Content of `filename` as seen through `patch`
pub fn get_content<R: CodeRepository + ?Sized>(
    db: &Database,
    repo: &R,
    patch: &Patch,
    filename: &str,
) -> Result<Vec<u8>> {
    let filename = normalize_path(filename);
    let chain = ancestry(db, patch)?;

    for layer in chain.iter().filter(|p| !p.is_root()) {
        // at most one row per the unique key; if more ever exist, the newest wins
        for change in db.changed_files_named(layer.id, &filename)?.iter().rev() {
            if let Some(text) = change.replacement()?.content {
                tracing::debug!(patch = patch.id, layer = layer.id, file = %filename, "content shadowed by layer");
                return Ok(text.into_bytes());
            }
        }
    }

    read_commit_file(repo, root_commit(&chain)?, &filename)
}

/// Patch that owns `change`
fn owner(db: &Database, change: &ChangedFile) -> Result<Patch> {
    db.get_patch(change.patch_id)?
        .ok_or(PatchError::PatchNotFound(change.patch_id))
}

/// Text of the changed file in its patch's base, before this change
pub fn base_text<R: CodeRepository + ?Sized>(db: &Database, repo: &R, change: &ChangedFile) -> Result<Vec<u8>> {
    let patch = owner(db, change)?;
    let base_id = patch
        .base_patch_id
        .ok_or_else(|| PatchError::invalid("Root patches have no base text"))?;
    let base = db.get_patch(base_id)?.ok_or(PatchError::PatchNotFound(base_id))?;
    get_content(db, repo, &base, &change.filename)
}

/// Text of the changed file with this change applied
pub fn revised_text<R: CodeRepository + ?Sized>(db: &Database, repo: &R, change: &ChangedFile) -> Result<Vec<u8>> {
    let replacement = change.replacement()?;
    match replacement.content {
        Some(text) => Ok(text.into_bytes()),
        None => base_text(db, repo, change),
    }
}

/// Store `text` as the full replacement for `change`.
///
/// The only way file content changes. Rejected before any write when the
/// owning patch is a root patch.
pub fn set_new_text(db: &Database, change: &mut ChangedFile, text: &str) -> Result<()> {
    let patch = owner(db, change)?;
    if !patch.can_modify() {
        return Err(PatchError::invalid("This patch cannot be modified."));
    }

    let diff_json = change.replacement()?.with_content(text).to_json()?;
    db.save_replacement(change, &diff_json)?;
    change.diff_json = diff_json;

    tracing::info!(patch = patch.id, change = change.id, file = %change.filename, bytes = text.len(), "saved new text");
    Ok(())
}
