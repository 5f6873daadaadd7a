//! Access to the git repository holding the published code
//!
//! Resolution only touches the repository at root patches, through the
//! [`CodeRepository`] trait. [`GitRepository`] implements it with libgit2.
//! Objects are passed around as hex ids ([`ObjectRef`]) so another backend can
//! stand in without the resolvers knowing.

use crate::model::EntryType;
use chrono::{DateTime, Utc};
use git2::{BranchType, ErrorCode, ObjectType, Oid};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Default name of the metadata file at the root of every published tree
pub const DEFAULT_INDEX_FILE: &str = "index.xml";

/// Hex id of a commit, tree or blob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef(String);

impl ObjectRef {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a tree entry points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

impl From<EntryKind> for EntryType {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => EntryType::File,
            EntryKind::Dir => EntryType::Dir,
        }
    }
}

/// A named child of a tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub id: ObjectRef,
}

/// Display metadata for a commit, read from its index file
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub commit: String,
    pub heading: String,
    pub recency: String,
    pub committed_at: DateTime<Utc>,
    pub message_head: String,
}

impl CommitInfo {
    /// e.g. "Published Code as of 11/14/23: Current Through Law 20-1"
    pub fn title(&self) -> String {
        let date = self.committed_at.format("%m/%d/%y");
        if self.recency.is_empty() {
            format!("Published Code as of {}", date)
        } else {
            format!("Published Code as of {}: {}", date, title_case(&self.recency))
        }
    }

    pub fn description(&self) -> String {
        format!(
            "{}\n{}\n\ncommit: {}\n({})",
            self.heading, self.recency, self.commit, self.message_head
        )
    }

    /// Title stored on a root patch: short title and description joined by " | "
    pub fn patch_title(&self) -> String {
        format!("{} | {}", self.title(), self.description())
    }
}

/// Error type for repository access
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("There is no {0} branch in the git repository.")]
    BranchNotFound(String),
    #[error("Path not found: {0}")]
    PathNotFound(String),
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Invalid object id: {0}")]
    InvalidObject(String),
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
}

pub type Result<T> = std::result::Result<T, RepoError>;

/// Read-only view of a code repository.
///
/// Every method may block on I/O; resolvers call it only at root patches.
pub trait CodeRepository {
    /// Head commit of a local branch
    fn resolve_branch_head(&self, branch: &str) -> Result<ObjectRef>;

    /// Root tree of a commit
    fn commit_tree(&self, commit: &ObjectRef) -> Result<ObjectRef>;

    /// Look up one child of a tree by name
    fn tree_entry(&self, tree: &ObjectRef, name: &str) -> Result<Option<TreeEntry>>;

    /// Immediate children of a tree
    fn list_entries(&self, tree: &ObjectRef) -> Result<Vec<TreeEntry>>;

    /// Bytes of the blob named `name` inside `tree`
    fn blob_content(&self, tree: &ObjectRef, name: &str) -> Result<Vec<u8>>;

    /// Heading, recency label, time and message of a commit
    fn commit_info(&self, commit: &ObjectRef) -> Result<CommitInfo>;
}

/// libgit2-backed repository
pub struct GitRepository {
    repo: git2::Repository,
    index_file: String,
}

impl GitRepository {
    /// Open the repository at `path`, reading metadata from `index_file`
    pub fn open<P: AsRef<Path>>(path: P, index_file: &str) -> Result<Self> {
        let repo = git2::Repository::open(path.as_ref())?;
        Ok(Self {
            repo,
            index_file: index_file.to_string(),
        })
    }

    fn oid(&self, object: &ObjectRef) -> Result<Oid> {
        Oid::from_str(object.as_str()).map_err(|_| RepoError::InvalidObject(object.to_string()))
    }

    fn find_tree(&self, tree: &ObjectRef) -> Result<git2::Tree<'_>> {
        Ok(self.repo.find_tree(self.oid(tree)?)?)
    }
}

fn entry_kind(kind: Option<ObjectType>) -> Option<EntryKind> {
    match kind {
        Some(ObjectType::Blob) => Some(EntryKind::File),
        Some(ObjectType::Tree) => Some(EntryKind::Dir),
        // submodules and anything else are not part of the code
        _ => None,
    }
}

fn to_entry(entry: &git2::TreeEntry<'_>) -> Option<TreeEntry> {
    let kind = entry_kind(entry.kind())?;
    let name = entry.name()?.to_string();
    Some(TreeEntry {
        name,
        kind,
        id: ObjectRef::new(entry.id().to_string()),
    })
}

impl CodeRepository for GitRepository {
    fn resolve_branch_head(&self, branch: &str) -> Result<ObjectRef> {
        let found = match self.repo.find_branch(branch, BranchType::Local) {
            Ok(found) => found,
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(RepoError::BranchNotFound(branch.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let commit = found.get().peel_to_commit()?;
        Ok(ObjectRef::new(commit.id().to_string()))
    }

    fn commit_tree(&self, commit: &ObjectRef) -> Result<ObjectRef> {
        let commit = self.repo.find_commit(self.oid(commit)?)?;
        Ok(ObjectRef::new(commit.tree_id().to_string()))
    }

    fn tree_entry(&self, tree: &ObjectRef, name: &str) -> Result<Option<TreeEntry>> {
        let tree = self.find_tree(tree)?;
        let entry = tree.get_name(name).and_then(|e| to_entry(&e));
        Ok(entry)
    }

    fn list_entries(&self, tree: &ObjectRef) -> Result<Vec<TreeEntry>> {
        let tree = self.find_tree(tree)?;
        let entries = tree.iter().filter_map(|e| to_entry(&e)).collect();
        Ok(entries)
    }

    fn blob_content(&self, tree: &ObjectRef, name: &str) -> Result<Vec<u8>> {
        let tree = self.find_tree(tree)?;
        let entry = tree
            .get_name(name)
            .filter(|e| e.kind() == Some(ObjectType::Blob))
            .ok_or_else(|| RepoError::FileNotFound(name.to_string()))?;
        let blob = self.repo.find_blob(entry.id())?;
        Ok(blob.content().to_vec())
    }

    fn commit_info(&self, commit: &ObjectRef) -> Result<CommitInfo> {
        let commit = self.repo.find_commit(self.oid(commit)?)?;
        let tree = commit.tree()?;

        let index_xml = match tree.get_name(&self.index_file) {
            Some(entry) if entry.kind() == Some(ObjectType::Blob) => {
                let blob = self.repo.find_blob(entry.id())?;
                String::from_utf8_lossy(blob.content()).to_string()
            }
            _ => {
                tracing::warn!(commit = %commit.id(), index_file = %self.index_file, "index file missing, commit metadata will be empty");
                String::new()
            }
        };
        let (heading, recency) = parse_index_metadata(&index_xml);

        let seconds = commit.time().seconds();
        let committed_at = DateTime::<Utc>::from_timestamp(seconds, 0)
            .ok_or_else(|| RepoError::InvalidObject(format!("commit {} has time {}", commit.id(), seconds)))?;

        let message_head: String = commit.message().unwrap_or("").chars().take(50).collect();

        Ok(CommitInfo {
            commit: commit.id().to_string(),
            heading,
            recency,
            committed_at,
            message_head: message_head.trim().to_string(),
        })
    }
}

/// Extract the document element's `<heading>` and `<meta><recency>` text.
/// Missing elements, or a document that does not parse, come back empty.
pub fn parse_index_metadata(xml: &str) -> (String, String) {
    if xml.trim().is_empty() {
        return (String::new(), String::new());
    }

    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..roxmltree::ParsingOptions::default()
    };
    let doc = match roxmltree::Document::parse_with_options(xml, options) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(error = %e, "index file is not well-formed, commit metadata will be empty");
            return (String::new(), String::new());
        }
    };

    let root = doc.root_element();
    let heading = child_element(root, "heading").map(element_text).unwrap_or_default();
    let recency = child_element(root, "meta")
        .and_then(|meta| child_element(meta, "recency"))
        .map(element_text)
        .unwrap_or_default();
    (heading, recency)
}

fn child_element<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|n| n.is_element() && n.has_tag_name(name))
}

/// All text beneath `node`, trimmed
fn element_text(node: roxmltree::Node<'_, '_>) -> String {
    let text: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    text.trim().to_string()
}

/// Capitalize the first letter of every word, lowercase the rest
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}
