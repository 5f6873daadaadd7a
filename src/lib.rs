//! Codepatch - layered edits over published code in a git repository
//!
//! Edits are stored as stacks of patches in SQLite, never committed to git.
//!
//! # Overview
//!
//! A root patch pins one commit of the repository. Every other patch sits on a
//! base patch and records the files it changes, each as full replacement text.
//! Reading a patch resolves the chain down to its root: directory listings are
//! the root commit's tree overlaid with every layer's files, and a file's text
//! comes from the nearest layer that replaces it.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`chain`] | Walking base pointers down to the root |
//! | [`head`] | Root patch for a branch head |
//! | [`tree`] | Directory listings through a chain |
//! | [`content`] | File text through a chain, and saving new text |
//! | [`manager`] | Workflow rules on top of the above |
//!
//! # Quick Start
//!
//! ```no_run
//! use codepatch::{Config, PatchManager};
//!
//! let manager = PatchManager::open(Config::load()).unwrap();
//!
//! // Start from the published head and branch a patch off it
//! let root = manager.open_head().unwrap();
//! let patch = manager.new_patch(root.id).unwrap();
//!
//! // Edit a file
//! let change = manager.open_change(patch.id, "sections/1-101.xml").unwrap();
//! manager.update_change(patch.id, change.id, "<section/>").unwrap();
//!
//! let text = manager.get_content(&patch, "sections/1-101.xml").unwrap();
//! assert_eq!(text, b"<section/>");
//! ```

pub mod chain;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod head;
pub mod manager;
pub mod model;
pub mod render;
pub mod repository;
pub mod schema;
pub mod tree;

#[cfg(test)]
mod test_support;

pub use config::{Config, ConfigError};
pub use db::{resolve_db_path, Database, DbError, DB_PATH_ENV};
pub use error::{PatchError, Result};
pub use manager::{PatchInfo, PatchManager};
pub use model::{ChangedFile, EntryType, FileEntry, Patch, Replacement, NEW_PATCH_TITLE};
pub use render::{RenderClient, RenderError};
pub use repository::{CodeRepository, CommitInfo, GitRepository, ObjectRef, RepoError};
