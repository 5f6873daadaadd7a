//! File tree resolution through a patch chain
//!
//! A listing starts from the root commit's tree and is overlaid, layer by
//! layer from the root upward, with the files each patch adds. Listings are
//! always sorted directories first, then by name.
//!
//! Overlay policy: a changed file under the listed directory contributes its
//! first path segment below that directory, as a `dir` when more segments
//! follow and as a `file` otherwise, unless an entry of that name is already
//! listed. A directory that only exists because upper layers add files under
//! it lists as those synthesized entries rather than failing.

use crate::chain::{ancestry, root_commit};
use crate::db::Database;
use crate::error::{PatchError, Result};
use crate::model::{ChangedFile, EntryType, FileEntry, Patch};
use crate::repository::{CodeRepository, EntryKind, ObjectRef};

/// Split a repository-relative path into its non-empty segments
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Canonical form of a path: no leading, trailing or doubled slashes
pub fn normalize_path(path: &str) -> String {
    split_path(path).join("/")
}

/// Directories before files, then by name
pub fn sort_entries(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        a.entry_type
            .cmp(&b.entry_type)
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Entry that `filename` contributes to the listing of directory `dir`, if any
pub fn overlay_entry(dir: &[&str], filename: &str) -> Option<FileEntry> {
    let segments = split_path(filename);
    if segments.len() <= dir.len() || segments[..dir.len()] != *dir {
        return None;
    }
    let rest = &segments[dir.len()..];
    let entry_type = if rest.len() > 1 {
        EntryType::Dir
    } else {
        EntryType::File
    };
    Some(FileEntry::new(rest[0], entry_type))
}

/// Walk from a commit's root tree down to the directory at `segments`
pub(crate) fn resolve_dir<R: CodeRepository + ?Sized>(
    repo: &R,
    commit: &str,
    segments: &[&str],
) -> Result<ObjectRef> {
    let mut tree = repo.commit_tree(&ObjectRef::new(commit))?;
    for (i, segment) in segments.iter().enumerate() {
        match repo.tree_entry(&tree, segment)? {
            Some(entry) if entry.kind == EntryKind::Dir => tree = entry.id,
            // missing, or a file where a directory was expected
            _ => return Err(PatchError::PathNotFound(segments[..=i].join("/"))),
        }
    }
    Ok(tree)
}

/// A patch chain loaded once: the root commit plus every upper layer's
/// changed files, root-most layer first.
struct Layers {
    commit: String,
    changes: Vec<Vec<ChangedFile>>,
}

impl Layers {
    fn load(db: &Database, patch: &Patch) -> Result<Self> {
        let chain = ancestry(db, patch)?;
        let commit = root_commit(&chain)?.to_string();
        let changes = chain
            .iter()
            .rev()
            .filter(|p| !p.is_root())
            .map(|p| db.changed_files(p.id))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { commit, changes })
    }

    fn adds_under(&self, dir: &[&str]) -> bool {
        self.changes
            .iter()
            .flatten()
            .any(|c| overlay_entry(dir, &c.filename).is_some())
    }

    fn list<R: CodeRepository + ?Sized>(&self, repo: &R, dir: &[&str]) -> Result<Vec<FileEntry>> {
        let mut entries: Vec<FileEntry> = match resolve_dir(repo, &self.commit, dir) {
            Ok(tree) => repo
                .list_entries(&tree)?
                .into_iter()
                .map(|e| FileEntry::new(e.name, e.kind.into()))
                .collect(),
            Err(PatchError::PathNotFound(_)) if self.adds_under(dir) => Vec::new(),
            Err(e) => return Err(e),
        };

        for layer in &self.changes {
            for change in layer {
                if let Some(entry) = overlay_entry(dir, &change.filename) {
                    if !entries.iter().any(|e| e.name == entry.name) {
                        tracing::debug!(patch = change.patch_id, name = %entry.name, kind = %entry.entry_type, "overlaying entry");
                        entries.push(entry);
                    }
                }
            }
        }

        sort_entries(&mut entries);
        Ok(entries)
    }
}

/// Directory listing at `path` (repository root when `None` or empty) as seen
/// through `patch`.
pub fn list_files<R: CodeRepository + ?Sized>(
    db: &Database,
    repo: &R,
    patch: &Patch,
    path: Option<&str>,
) -> Result<Vec<FileEntry>> {
    let dir = split_path(path.unwrap_or(""));
    Layers::load(db, patch)?.list(repo, &dir)
}

/// Whether `filename` names a file (not a directory) visible through `patch`.
///
/// Walks one directory at a time; a missing segment is `false`, not an error.
pub fn has_file<R: CodeRepository + ?Sized>(
    db: &Database,
    repo: &R,
    patch: &Patch,
    filename: &str,
) -> Result<bool> {
    let segments = split_path(filename);
    let Some((name, dirs)) = segments.split_last() else {
        return Ok(false);
    };

    let layers = Layers::load(db, patch)?;
    let mut entries = layers.list(repo, &[])?;
    for (i, dir) in dirs.iter().enumerate() {
        if !entries.contains(&FileEntry::dir(*dir)) {
            return Ok(false);
        }
        entries = layers.list(repo, &dirs[..=i])?;
    }
    Ok(entries.contains(&FileEntry::file(*name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Replacement;
    use crate::repository::GitRepository;
    use crate::test_support::{index_xml, temp_db, GitFixture};
    use proptest::prelude::*;
    use tempfile::TempDir;

    struct Setup {
        _fixture: GitFixture,
        _dir: TempDir,
        db: Database,
        repo: GitRepository,
        root: Patch,
    }

    fn setup() -> Setup {
        let fixture = GitFixture::new();
        let xml = index_xml("Code", "current");
        let hex = fixture.commit(
            &[
                ("index.xml", xml.as_str()),
                ("a.txt", "alpha"),
                ("c.txt", "gamma"),
                ("b/one.txt", "one"),
                ("b/sub/two.txt", "two"),
            ],
            "initial",
        );
        let repo = fixture.repository();
        let (dir, db) = temp_db();
        let root = db.create_root_patch("root", &hex, fixture.commit_time(1)).unwrap();
        Setup {
            _fixture: fixture,
            _dir: dir,
            db,
            repo,
            root,
        }
    }

    fn add(db: &Database, patch: &Patch, filename: &str) {
        let diff = Replacement::default().with_content("added").to_json().unwrap();
        db.get_or_create_changed_file(patch.id, filename, filename, &diff).unwrap();
    }

    fn names(entries: &[FileEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_split_and_normalize() {
        assert_eq!(split_path("/b//sub/"), vec!["b", "sub"]);
        assert_eq!(normalize_path("b/sub/"), "b/sub");
        assert!(split_path("").is_empty());
    }

    #[test]
    fn test_sort_dirs_first() {
        let mut entries = vec![FileEntry::file("a.txt"), FileEntry::dir("b"), FileEntry::file("c.txt")];
        sort_entries(&mut entries);
        assert_eq!(names(&entries), vec!["b", "a.txt", "c.txt"]);
    }

    #[test]
    fn test_overlay_entry() {
        assert_eq!(overlay_entry(&[], "new/deep/x.txt"), Some(FileEntry::dir("new")));
        assert_eq!(overlay_entry(&["new"], "new/deep/x.txt"), Some(FileEntry::dir("deep")));
        assert_eq!(overlay_entry(&["new", "deep"], "new/deep/x.txt"), Some(FileEntry::file("x.txt")));
        assert_eq!(overlay_entry(&["other"], "new/deep/x.txt"), None);
        assert_eq!(overlay_entry(&["new", "deep", "x.txt"], "new/deep/x.txt"), None);
    }

    #[test]
    fn test_root_listing() {
        let s = setup();
        let entries = list_files(&s.db, &s.repo, &s.root, None).unwrap();
        assert_eq!(names(&entries), vec!["b", "a.txt", "c.txt", "index.xml"]);
        assert_eq!(entries[0].entry_type, EntryType::Dir);

        let entries = list_files(&s.db, &s.repo, &s.root, Some("b")).unwrap();
        assert_eq!(entries, vec![FileEntry::dir("sub"), FileEntry::file("one.txt")]);
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let s = setup();
        let err = list_files(&s.db, &s.repo, &s.root, Some("b/nope")).unwrap_err();
        assert!(matches!(err, PatchError::PathNotFound(p) if p == "b/nope"));
        // a file where a directory was expected
        let err = list_files(&s.db, &s.repo, &s.root, Some("a.txt")).unwrap_err();
        assert!(matches!(err, PatchError::PathNotFound(_)));
    }

    #[test]
    fn test_empty_layer_matches_base() {
        let s = setup();
        let p1 = s.db.create_patch("p1", s.root.id, None).unwrap();
        for path in [None, Some("b"), Some("b/sub")] {
            assert_eq!(
                list_files(&s.db, &s.repo, &p1, path).unwrap(),
                list_files(&s.db, &s.repo, &s.root, path).unwrap()
            );
        }
    }

    #[test]
    fn test_edits_to_existing_files_do_not_duplicate() {
        let s = setup();
        let p1 = s.db.create_patch("p1", s.root.id, None).unwrap();
        add(&s.db, &p1, "a.txt");
        add(&s.db, &p1, "b/sub/two.txt");
        assert_eq!(
            list_files(&s.db, &s.repo, &p1, None).unwrap(),
            list_files(&s.db, &s.repo, &s.root, None).unwrap()
        );
    }

    #[test]
    fn test_added_files_synthesize_directories_once() {
        let s = setup();
        let p1 = s.db.create_patch("p1", s.root.id, None).unwrap();
        add(&s.db, &p1, "new/deep/x.txt");
        add(&s.db, &p1, "new/y.txt");
        add(&s.db, &p1, "b/three.txt");

        let top = list_files(&s.db, &s.repo, &p1, None).unwrap();
        assert_eq!(names(&top), vec!["b", "new", "a.txt", "c.txt", "index.xml"]);

        let new_dir = list_files(&s.db, &s.repo, &p1, Some("new")).unwrap();
        assert_eq!(new_dir, vec![FileEntry::dir("deep"), FileEntry::file("y.txt")]);

        let deep = list_files(&s.db, &s.repo, &p1, Some("new/deep")).unwrap();
        assert_eq!(deep, vec![FileEntry::file("x.txt")]);

        let b = list_files(&s.db, &s.repo, &p1, Some("b")).unwrap();
        assert_eq!(names(&b), vec!["sub", "one.txt", "three.txt"]);

        // the base does not see them
        assert!(list_files(&s.db, &s.repo, &s.root, Some("new")).is_err());
    }

    #[test]
    fn test_lower_layer_additions_carry_up() {
        let s = setup();
        let p1 = s.db.create_patch("p1", s.root.id, None).unwrap();
        add(&s.db, &p1, "new/x.txt");
        let p2 = s.db.create_patch("p2", p1.id, None).unwrap();
        add(&s.db, &p2, "new/z.txt");

        let entries = list_files(&s.db, &s.repo, &p2, Some("new")).unwrap();
        assert_eq!(entries, vec![FileEntry::file("x.txt"), FileEntry::file("z.txt")]);
        let entries = list_files(&s.db, &s.repo, &p1, Some("new")).unwrap();
        assert_eq!(entries, vec![FileEntry::file("x.txt")]);
    }

    #[test]
    fn test_has_file() {
        let s = setup();
        let p1 = s.db.create_patch("p1", s.root.id, None).unwrap();
        add(&s.db, &p1, "new/deep/x.txt");

        assert!(has_file(&s.db, &s.repo, &s.root, "b/sub/two.txt").unwrap());
        assert!(has_file(&s.db, &s.repo, &s.root, "/a.txt").unwrap());
        assert!(!has_file(&s.db, &s.repo, &s.root, "b/missing.txt").unwrap());
        assert!(!has_file(&s.db, &s.repo, &s.root, "b").unwrap());
        assert!(!has_file(&s.db, &s.repo, &s.root, "nope/x.txt").unwrap());
        assert!(!has_file(&s.db, &s.repo, &s.root, "a.txt/x").unwrap());
        assert!(!has_file(&s.db, &s.repo, &s.root, "").unwrap());

        assert!(has_file(&s.db, &s.repo, &p1, "new/deep/x.txt").unwrap());
        assert!(!has_file(&s.db, &s.repo, &s.root, "new/deep/x.txt").unwrap());
    }

    fn entry_strategy() -> impl Strategy<Value = FileEntry> {
        ("[a-z.]{1,6}", any::<bool>()).prop_map(|(name, is_dir)| {
            if is_dir {
                FileEntry::dir(name)
            } else {
                FileEntry::file(name)
            }
        })
    }

    proptest! {
        #[test]
        fn prop_sorted_dirs_first_then_by_name(mut entries in prop::collection::vec(entry_strategy(), 0..24)) {
            let mut original = entries.clone();
            sort_entries(&mut entries);

            for pair in entries.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a.entry_type <= b.entry_type);
                if a.entry_type == b.entry_type {
                    prop_assert!(a.name <= b.name);
                }
            }

            // same multiset of entries
            let mut resorted = entries.clone();
            original.sort_by(|a, b| a.name.cmp(&b.name).then(a.entry_type.cmp(&b.entry_type)));
            resorted.sort_by(|a, b| a.name.cmp(&b.name).then(a.entry_type.cmp(&b.entry_type)));
            prop_assert_eq!(original, resorted);
        }
    }
}
