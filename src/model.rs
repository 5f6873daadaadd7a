//! Patch layers and their changed files
//!
//! A [`Patch`] is either a root layer pinned to a repository commit or a layer
//! stacked on another patch. A [`ChangedFile`] records one file's replacement
//! text inside a non-root layer.
//!
//! "Diff" here is not a line-level delta: a stored [`Replacement`] with content
//! fully shadows the file's text from every layer below it.

use crate::schema::{changed_files, patches};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Title given to patches created by branching off another patch.
pub const NEW_PATCH_TITLE: &str = "New Patch";

/// Queryable patch layer
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = patches)]
pub struct Patch {
    pub id: i32,
    pub title: String,
    pub created_at: String,
    pub modified_at: String,
    pub base_patch_id: Option<i32>,
    pub commit_hash: Option<String>,
    pub metadata_json: String,
}

impl Patch {
    /// Root patches are immutable snapshots of a repository commit
    pub fn is_root(&self) -> bool {
        self.base_patch_id.is_none()
    }

    /// Only non-root patches accept new or changed files
    pub fn can_modify(&self) -> bool {
        !self.is_root()
    }

    /// Whether a new patch may be stacked on this one.
    ///
    /// An empty intermediate layer adds nothing, so callers should branch off
    /// its base instead. Roots can never hold changes and are always eligible.
    pub fn can_create_subpatch(&self, has_changes: bool) -> bool {
        self.is_root() || has_changes
    }

    /// Provenance metadata, passed through untouched
    pub fn metadata(&self) -> serde_json::Value {
        parse_metadata(&self.metadata_json)
    }

    /// Short label for listings. Root titles carry their commit description
    /// after " | "; other titles are shown as written.
    pub fn display_title(&self) -> &str {
        if !self.is_root() {
            return &self.title;
        }
        self.title.split(" | ").next().unwrap_or(&self.title)
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match (&self.base_patch_id, &self.commit_hash) {
            (Some(base), _) => format!("on #{}", base),
            (None, Some(hash)) => format!("@ {}", short_hash(hash)),
            (None, None) => "detached".to_string(),
        };
        write!(f, "Patch({}, {}, {}, {:?})", self.id, self.created_at, origin, self.display_title())
    }
}

/// Queryable changed file
#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, PartialEq, Serialize)]
#[diesel(belongs_to(Patch))]
#[diesel(table_name = changed_files)]
pub struct ChangedFile {
    pub id: i32,
    pub patch_id: i32,
    pub filename: String,
    pub title: String,
    pub metadata_json: String,
    pub diff_json: String,
}

impl ChangedFile {
    /// Decode the stored modification record
    pub fn replacement(&self) -> serde_json::Result<Replacement> {
        Replacement::from_json(&self.diff_json)
    }

    /// Content of the file after this layer's change is applied to `base`
    pub fn apply(&self, base: Vec<u8>) -> serde_json::Result<Vec<u8>> {
        Ok(self.replacement()?.apply(base))
    }

    pub fn metadata(&self) -> serde_json::Value {
        parse_metadata(&self.metadata_json)
    }
}

/// Stored modification record of a [`ChangedFile`].
///
/// `content` present means "the file is exactly this text at this layer";
/// absent means "no change at this layer". Unknown keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Replacement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Replacement {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Replacement text wins over whatever the base held
    pub fn apply(&self, base: Vec<u8>) -> Vec<u8> {
        match &self.content {
            Some(text) => text.clone().into_bytes(),
            None => base,
        }
    }

    pub fn with_content(mut self, text: &str) -> Self {
        self.content = Some(text.to_string());
        self
    }
}

/// Kind of an entry in a resolved directory listing.
///
/// Declaration order is the listing order: directories sort before files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Dir,
    File,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Dir => "dir",
            EntryType::File => "file",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(name, type)` pair of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub entry_type: EntryType,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, entry_type: EntryType) -> Self {
        Self {
            name: name.into(),
            entry_type,
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, EntryType::File)
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self::new(name, EntryType::Dir)
    }
}

fn parse_metadata(json: &str) -> serde_json::Value {
    serde_json::from_str(json).unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
}

/// First 7 characters of a commit hash, for display
pub fn short_hash(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}
