//! Patch workflows on top of the resolvers
//!
//! [`PatchManager`] ties a [`Database`], a [`CodeRepository`] and the loaded
//! [`Config`] together and enforces the rules the resolvers leave to callers:
//! root patches never change, empty patches are not branched off, a change
//! belongs to exactly one patch.

use crate::chain::would_create_cycle;
use crate::config::Config;
use crate::content;
use crate::db::{resolve_db_path, Database};
use crate::error::{PatchError, Result};
use crate::head::materialize_head;
use crate::model::{ChangedFile, EntryType, FileEntry, Patch, Replacement, NEW_PATCH_TITLE};
use crate::render::RenderClient;
use crate::repository::{CodeRepository, GitRepository, ObjectRef};
use crate::tree::{self, normalize_path, split_path};
use serde::Serialize;

/// Heading and body text describing a patch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchInfo {
    pub title: String,
    pub description: String,
}

pub struct PatchManager<R: CodeRepository> {
    db: Database,
    repo: R,
    config: Config,
    render: RenderClient,
}

impl PatchManager<GitRepository> {
    /// Open the configured database and git repository
    pub fn open(config: Config) -> Result<Self> {
        let db = Database::open_at(resolve_db_path(config.database_path().as_deref()))?;
        let repo = GitRepository::open(config.repository_path(), &config.repository.index_file)?;
        Ok(Self::new(db, repo, config))
    }
}

impl<R: CodeRepository> PatchManager<R> {
    pub fn new(db: Database, repo: R, config: Config) -> Self {
        let render = RenderClient::new(config.render.url.clone(), config.render_timeout());
        Self {
            db,
            repo,
            config,
            render,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ========================================================================
    // Patches
    // ========================================================================

    /// Root patch for the head of the configured branch
    pub fn open_head(&self) -> Result<Patch> {
        materialize_head(&self.db, &self.repo, &self.config.repository.branch)
    }

    /// Most recently modified patches, at most `limit` (default from config)
    pub fn recent_patches(&self, limit: Option<i64>) -> Result<Vec<Patch>> {
        let limit = limit.unwrap_or(self.config.patches.recent_limit).max(0);
        Ok(self.db.recent_patches(limit)?)
    }

    pub fn get_patch(&self, patch_id: i32) -> Result<Patch> {
        self.db
            .get_patch(patch_id)?
            .ok_or(PatchError::PatchNotFound(patch_id))
    }

    /// Root patches describe their commit; other patches their stored title
    pub fn display_info(&self, patch: &Patch) -> Result<PatchInfo> {
        match &patch.commit_hash {
            Some(hash) => {
                let info = self.repo.commit_info(&ObjectRef::new(hash.as_str()))?;
                Ok(PatchInfo {
                    title: info.title(),
                    description: info.description(),
                })
            }
            None => Ok(PatchInfo {
                title: patch.title.clone(),
                description: String::new(),
            }),
        }
    }

    /// Whether a new patch may be stacked on `patch`
    pub fn can_create_subpatch(&self, patch: &Patch) -> Result<bool> {
        let has_changes = self.db.count_changed_files(patch.id)? > 0;
        Ok(patch.can_create_subpatch(has_changes))
    }

    /// Branch a new, empty patch off `base_id`
    pub fn new_patch(&self, base_id: i32) -> Result<Patch> {
        let base = self.get_patch(base_id)?;
        if !self.can_create_subpatch(&base)? {
            return Err(PatchError::invalid(
                "Cannot create a sub-patch of a patch with no changes.",
            ));
        }
        let patch = self.db.create_patch(NEW_PATCH_TITLE, base.id, None)?;
        tracing::info!(patch = patch.id, base = base.id, "created patch");
        Ok(patch)
    }

    /// Change title and/or provenance metadata of a non-root patch
    pub fn update_details(
        &self,
        patch_id: i32,
        title: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Patch> {
        let patch = self.modifiable_patch(patch_id)?;
        let metadata_json = metadata.map(serde_json::to_string).transpose()?;
        if let Some(title) = title {
            if title.trim().is_empty() {
                return Err(PatchError::invalid("Patch title cannot be empty."));
            }
        }
        self.db
            .update_patch_details(patch.id, title, metadata_json.as_deref())?;
        tracing::info!(patch = patch.id, "updated patch details");
        self.get_patch(patch.id)
    }

    /// Stack `patch_id` on a different base
    pub fn rebase_patch(&self, patch_id: i32, new_base_id: i32) -> Result<Patch> {
        let patch = self.modifiable_patch(patch_id)?;
        let new_base = self.get_patch(new_base_id)?;
        if new_base.id == patch.id || would_create_cycle(&self.db, patch.id, new_base.id)? {
            return Err(PatchError::invalid(format!(
                "Patch {} cannot be based on patch {}: that would form a cycle.",
                patch.id, new_base.id
            )));
        }
        self.db.set_base_patch(patch.id, new_base.id)?;
        tracing::info!(patch = patch.id, from = ?patch.base_patch_id, to = new_base.id, "rebased patch");
        self.get_patch(patch.id)
    }

    fn modifiable_patch(&self, patch_id: i32) -> Result<Patch> {
        let patch = self.get_patch(patch_id)?;
        if !patch.can_modify() {
            return Err(PatchError::invalid("This patch cannot be modified."));
        }
        Ok(patch)
    }

    fn base_of(&self, patch: &Patch) -> Result<Patch> {
        let base_id = patch
            .base_patch_id
            .ok_or_else(|| PatchError::invalid("Root patches have no base."))?;
        self.get_patch(base_id)
    }

    // ========================================================================
    // Changed files
    // ========================================================================

    pub fn changed_files(&self, patch_id: i32) -> Result<Vec<ChangedFile>> {
        let patch = self.get_patch(patch_id)?;
        Ok(self.db.changed_files(patch.id)?)
    }

    pub fn get_change(&self, patch_id: i32, change_id: i32) -> Result<ChangedFile> {
        self.db
            .get_changed_file(patch_id, change_id)?
            .ok_or(PatchError::ChangeNotFound(change_id))
    }

    /// Start (or resume) editing `filename` in a patch.
    ///
    /// The file must already exist in the patch's base, unless this patch
    /// itself added it.
    pub fn open_change(&self, patch_id: i32, filename: &str) -> Result<ChangedFile> {
        let patch = self.modifiable_patch(patch_id)?;
        let filename = normalize_path(filename);

        if let Some(existing) = self.db.changed_files_named(patch.id, &filename)?.pop() {
            return Ok(existing);
        }

        let base = self.base_of(&patch)?;
        if !tree::has_file(&self.db, &self.repo, &base, &filename)? {
            return Err(PatchError::invalid(format!("Invalid filename: {}", filename)));
        }

        let (change, created) = self
            .db
            .get_or_create_changed_file(patch.id, &filename, &filename, "{}")?;
        if created {
            tracing::info!(patch = patch.id, change = change.id, file = %filename, "opened file for editing");
        }
        Ok(change)
    }

    /// Add a file that does not exist below this patch
    pub fn add_file(&self, patch_id: i32, filename: &str, text: &str) -> Result<ChangedFile> {
        let patch = self.modifiable_patch(patch_id)?;
        let filename = normalize_path(filename);
        self.check_new_path(&patch, &filename)?;

        let diff_json = Replacement::default().with_content(text).to_json()?;
        let (change, created) = self
            .db
            .get_or_create_changed_file(patch.id, &filename, &filename, &diff_json)?;
        if !created {
            return Err(PatchError::invalid(format!("Invalid filename: {} already exists", filename)));
        }
        tracing::info!(patch = patch.id, change = change.id, file = %filename, "added file");
        Ok(change)
    }

    /// Every prefix of `filename` must be a directory or absent, and the
    /// file itself must be absent, as seen through `patch`.
    fn check_new_path(&self, patch: &Patch, filename: &str) -> Result<()> {
        let segments = split_path(filename);
        if segments.is_empty() {
            return Err(PatchError::invalid("Invalid filename: empty path"));
        }

        for (i, segment) in segments.iter().enumerate() {
            let dir = segments[..i].join("/");
            let entries = tree::list_files(&self.db, &self.repo, patch, Some(&dir))?;
            let is_last = i + 1 == segments.len();
            match entries.iter().find(|e| e.name == *segment) {
                None => return Ok(()),
                Some(entry) if !is_last && entry.entry_type == EntryType::Dir => {}
                Some(entry) => {
                    return Err(PatchError::invalid(format!(
                        "Invalid filename: {} is an existing {}",
                        segments[..=i].join("/"),
                        entry.entry_type
                    )));
                }
            }
        }
        Ok(())
    }

    /// Save new full text for a change of `patch_id`
    pub fn update_change(&self, patch_id: i32, change_id: i32, text: &str) -> Result<ChangedFile> {
        let patch = self.get_patch(patch_id)?;
        let mut change = self.get_change(patch.id, change_id)?;
        content::set_new_text(&self.db, &mut change, text)?;
        Ok(change)
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    pub fn list_files(&self, patch: &Patch, path: Option<&str>) -> Result<Vec<FileEntry>> {
        tree::list_files(&self.db, &self.repo, patch, path)
    }

    pub fn has_file(&self, patch: &Patch, filename: &str) -> Result<bool> {
        tree::has_file(&self.db, &self.repo, patch, filename)
    }

    pub fn get_content(&self, patch: &Patch, filename: &str) -> Result<Vec<u8>> {
        content::get_content(&self.db, &self.repo, patch, filename)
    }

    pub fn base_text(&self, change: &ChangedFile) -> Result<Vec<u8>> {
        content::base_text(&self.db, &self.repo, change)
    }

    pub fn revised_text(&self, change: &ChangedFile) -> Result<Vec<u8>> {
        content::revised_text(&self.db, &self.repo, change)
    }

    /// HTML preview of `text` from the render service
    pub fn render_body(&self, text: &str) -> Result<String> {
        Ok(self.render.render(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{index_xml, GitFixture, BRANCH};
    use tempfile::TempDir;

    struct Setup {
        fixture: GitFixture,
        _dir: TempDir,
        manager: PatchManager<GitRepository>,
    }

    fn setup() -> Setup {
        let fixture = GitFixture::new();
        let xml = index_xml("Code of the District of Columbia", "current through law 20-1");
        fixture.commit(
            &[
                ("index.xml", xml.as_str()),
                ("sections/1-101.xml", "<section>one</section>"),
                ("sections/1-102.xml", "<section>two</section>"),
                ("README", "readme"),
            ],
            "Publish",
        );

        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.repository.path = fixture.path().to_path_buf();
        config.repository.branch = BRANCH.to_string();
        config.database.path = Some(dir.path().join("patches.db"));

        let manager = PatchManager::open(config).unwrap();
        Setup {
            fixture,
            _dir: dir,
            manager,
        }
    }

    #[test]
    fn test_open_head_and_display_info() {
        let s = setup();
        let root = s.manager.open_head().unwrap();
        assert_eq!(s.manager.open_head().unwrap().id, root.id);

        let info = s.manager.display_info(&root).unwrap();
        assert_eq!(info.title, root.display_title());
        assert!(info.description.starts_with("Code of the District of Columbia\ncurrent through law 20-1"));

        // roots never show up as recent work
        assert!(s.manager.recent_patches(None).unwrap().is_empty());
    }

    #[test]
    fn test_branching_rules() {
        let s = setup();
        let root = s.manager.open_head().unwrap();
        let p1 = s.manager.new_patch(root.id).unwrap();
        assert_eq!(p1.title, NEW_PATCH_TITLE);
        assert_eq!(p1.base_patch_id, Some(root.id));

        // an empty patch can't be branched off
        assert!(matches!(s.manager.new_patch(p1.id), Err(PatchError::InvalidOperation(_))));

        s.manager.open_change(p1.id, "README").unwrap();
        let p2 = s.manager.new_patch(p1.id).unwrap();
        assert_eq!(p2.base_patch_id, Some(p1.id));

        let info = s.manager.display_info(&p2).unwrap();
        assert_eq!(info.title, NEW_PATCH_TITLE);
        assert!(matches!(s.manager.new_patch(999), Err(PatchError::PatchNotFound(999))));
    }

    #[test]
    fn test_edit_flow() {
        let s = setup();
        let root = s.manager.open_head().unwrap();
        let p1 = s.manager.new_patch(root.id).unwrap();

        let change = s.manager.open_change(p1.id, "/sections/1-101.xml").unwrap();
        assert_eq!(change.filename, "sections/1-101.xml");
        assert_eq!(change.title, "sections/1-101.xml");
        // reopening resumes the same change
        assert_eq!(s.manager.open_change(p1.id, "sections/1-101.xml").unwrap().id, change.id);

        let saved = s.manager.update_change(p1.id, change.id, "<section>ONE</section>").unwrap();
        assert_eq!(s.manager.revised_text(&saved).unwrap(), b"<section>ONE</section>".to_vec());
        assert_eq!(s.manager.base_text(&saved).unwrap(), b"<section>one</section>".to_vec());
        assert_eq!(
            s.manager.get_content(&p1, "sections/1-101.xml").unwrap(),
            b"<section>ONE</section>".to_vec()
        );
        assert_eq!(
            s.manager.get_content(&root, "sections/1-101.xml").unwrap(),
            b"<section>one</section>".to_vec()
        );

        let recent = s.manager.recent_patches(None).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, p1.id);
    }

    #[test]
    fn test_recent_limit_override() {
        let s = setup();
        let root = s.manager.open_head().unwrap();
        for _ in 0..3 {
            s.manager.new_patch(root.id).unwrap();
        }
        assert_eq!(s.manager.recent_patches(Some(2)).unwrap().len(), 2);

        // an explicit limit may exceed the configured default
        let mut config = s.manager.config().clone();
        config.patches.recent_limit = 1;
        let narrow = PatchManager::open(config).unwrap();
        assert_eq!(narrow.recent_patches(None).unwrap().len(), 1);
        assert_eq!(narrow.recent_patches(Some(10)).unwrap().len(), 3);
    }

    #[test]
    fn test_edit_rejections() {
        let s = setup();
        let root = s.manager.open_head().unwrap();
        let p1 = s.manager.new_patch(root.id).unwrap();
        let other = s.manager.new_patch(root.id).unwrap();

        let err = s.manager.open_change(root.id, "README").unwrap_err();
        assert!(matches!(err, PatchError::InvalidOperation(_)));

        let err = s.manager.open_change(p1.id, "sections/9-999.xml").unwrap_err();
        assert_eq!(err.to_string(), "Invalid filename: sections/9-999.xml");
        let err = s.manager.open_change(p1.id, "sections").unwrap_err();
        assert!(matches!(err, PatchError::InvalidOperation(_)));

        // a change is only reachable through its own patch
        let change = s.manager.open_change(p1.id, "README").unwrap();
        assert!(matches!(
            s.manager.update_change(other.id, change.id, "x"),
            Err(PatchError::ChangeNotFound(_))
        ));
        assert!(s.manager.changed_files(other.id).unwrap().is_empty());
    }

    #[test]
    fn test_add_file_overlays_listing() {
        let s = setup();
        let root = s.manager.open_head().unwrap();
        let p1 = s.manager.new_patch(root.id).unwrap();

        let added = s.manager.add_file(p1.id, "titles/1/index.xml", "<level/>").unwrap();
        assert_eq!(s.manager.revised_text(&added).unwrap(), b"<level/>".to_vec());
        assert!(s.manager.has_file(&p1, "titles/1/index.xml").unwrap());
        assert!(!s.manager.has_file(&root, "titles/1/index.xml").unwrap());

        let top = s.manager.list_files(&p1, None).unwrap();
        assert_eq!(top[0], FileEntry::dir("sections"));
        assert_eq!(top[1], FileEntry::dir("titles"));
        assert_eq!(s.manager.list_files(&p1, Some("titles")).unwrap(), vec![FileEntry::dir("1")]);

        // an added file can be edited like any other
        let reopened = s.manager.open_change(p1.id, "titles/1/index.xml").unwrap();
        assert_eq!(reopened.id, added.id);

        // the base text of an added file does not exist
        assert!(matches!(s.manager.base_text(&added), Err(PatchError::FileNotFound(_))));
    }

    #[test]
    fn test_add_file_rejects_existing_paths() {
        let s = setup();
        let root = s.manager.open_head().unwrap();
        let p1 = s.manager.new_patch(root.id).unwrap();

        for bad in ["README", "sections", "README/child.txt", "sections/1-101.xml", ""] {
            let err = s.manager.add_file(p1.id, bad, "x").unwrap_err();
            assert!(matches!(err, PatchError::InvalidOperation(_)), "{:?} accepted", bad);
        }
        s.manager.add_file(p1.id, "sections/1-103.xml", "three").unwrap();
        assert!(s.manager.add_file(p1.id, "sections/1-103.xml", "again").is_err());
        assert!(s.manager.add_file(root.id, "new.txt", "x").is_err());
    }

    #[test]
    fn test_rename_and_annotate() {
        let s = setup();
        let root = s.manager.open_head().unwrap();
        let p1 = s.manager.new_patch(root.id).unwrap();

        let metadata = serde_json::json!({ "law": "D.C. Law 20-1" });
        let updated = s.manager.update_details(p1.id, Some("Fix typo"), Some(&metadata)).unwrap();
        assert_eq!(updated.title, "Fix typo");
        assert_eq!(updated.metadata()["law"], "D.C. Law 20-1");
        assert!(updated.modified_at >= p1.modified_at);

        assert!(s.manager.update_details(root.id, Some("nope"), None).is_err());
        assert!(s.manager.update_details(p1.id, Some("  "), None).is_err());
    }

    #[test]
    fn test_rebase() {
        let s = setup();
        let old_root = s.manager.open_head().unwrap();
        let p1 = s.manager.new_patch(old_root.id).unwrap();
        let change = s.manager.open_change(p1.id, "README").unwrap();
        s.manager.update_change(p1.id, change.id, "patched readme").unwrap();
        let p2 = s.manager.new_patch(p1.id).unwrap();

        assert!(s.manager.rebase_patch(p1.id, p2.id).is_err());
        assert!(s.manager.rebase_patch(p1.id, p1.id).is_err());
        assert!(s.manager.rebase_patch(old_root.id, p1.id).is_err());

        s.fixture.commit(&[("sections/1-101.xml", "<section>uno</section>")], "Republish");
        let new_root = s.manager.open_head().unwrap();
        assert_ne!(new_root.id, old_root.id);

        let moved = s.manager.rebase_patch(p1.id, new_root.id).unwrap();
        assert_eq!(moved.base_patch_id, Some(new_root.id));
        // p2 now sees the new commit underneath p1's edit
        assert_eq!(
            s.manager.get_content(&p2, "sections/1-101.xml").unwrap(),
            b"<section>uno</section>".to_vec()
        );
        assert_eq!(s.manager.get_content(&p2, "README").unwrap(), b"patched readme".to_vec());
    }
}
