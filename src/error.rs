//! Errors surfaced by patch resolution and editing
//!
//! Each boundary has its own error type ([`DbError`], [`RepoError`],
//! [`RenderError`]); [`PatchError`] is what the resolvers and
//! [`crate::PatchManager`] return. Lookup misses stay distinct from empty
//! results so callers can tell "no files here" from "no such path".

use crate::db::DbError;
use crate::render::RenderError;
use crate::repository::RepoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    /// A modification or sub-patch rule was violated
    #[error("{0}")]
    InvalidOperation(String),
    #[error("Path not found: {0}")]
    PathNotFound(String),
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("There is no {0} branch in the git repository.")]
    BranchNotFound(String),
    #[error("Patch {0} does not exist")]
    PatchNotFound(i32),
    #[error("Change {0} does not exist in this patch")]
    ChangeNotFound(i32),
    #[error("Patch chain through patch {0} loops back on itself")]
    ChainCycle(i32),
    #[error("Repository access failed: {0}")]
    AdapterFailure(#[source] RepoError),
    #[error("Render service failed: {0}")]
    RenderServiceFailure(#[from] RenderError),
    #[error("Malformed change record: {0}")]
    MalformedRecord(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] DbError),
}

impl PatchError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PatchError::InvalidOperation(msg.into())
    }
}

impl From<RepoError> for PatchError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::BranchNotFound(branch) => PatchError::BranchNotFound(branch),
            RepoError::PathNotFound(path) => PatchError::PathNotFound(path),
            RepoError::FileNotFound(path) => PatchError::FileNotFound(path),
            other => PatchError::AdapterFailure(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;
