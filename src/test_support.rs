//! Shared fixtures for unit tests: scratch git repositories and databases

use crate::db::Database;
use crate::repository::GitRepository;
use chrono::{DateTime, Utc};
use std::cell::Cell;
use std::path::Path;
use tempfile::TempDir;

/// Branch every fixture commit lands on
pub const BRANCH: &str = "main";

const EPOCH: i64 = 1_700_000_000;

/// A scratch repository. Each `commit` adds or overwrites files in the work
/// tree, commits everything, and moves [`BRANCH`] to the new commit.
pub struct GitFixture {
    dir: TempDir,
    repo: git2::Repository,
    commits: Cell<i64>,
}

impl GitFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        // commit on a scratch branch so BRANCH can be force-moved freely
        repo.set_head("refs/heads/work").unwrap();
        Self {
            dir,
            repo,
            commits: Cell::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Author/commit time of the `n`th commit (1-based)
    pub fn commit_time(&self, n: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(EPOCH + n * 3600, 0).unwrap()
    }

    pub fn commit(&self, files: &[(&str, &str)], message: &str) -> String {
        for (path, content) in files {
            let full = self.dir.path().join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, content).unwrap();
        }

        let mut index = self.repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = self.repo.find_tree(tree_id).unwrap();

        let n = self.commits.get() + 1;
        self.commits.set(n);
        let time = git2::Time::new(self.commit_time(n).timestamp(), 0);
        let sig = git2::Signature::new("Code Publisher", "publisher@example.com", &time).unwrap();

        let parent = self.repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap();

        let commit = self.repo.find_commit(oid).unwrap();
        self.repo.branch(BRANCH, &commit, true).unwrap();
        oid.to_string()
    }

    pub fn repository(&self) -> GitRepository {
        GitRepository::open(self.dir.path(), "index.xml").unwrap()
    }
}

/// Minimal index document with a heading and a recency note
pub fn index_xml(heading: &str, recency: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<level>\n  <heading>{}</heading>\n  <meta>\n    <recency>{}</recency>\n  </meta>\n</level>\n",
        heading, recency
    )
}

pub fn temp_db() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let db = Database::open_at(dir.path().join("test.db")).unwrap();
    (dir, db)
}
