//! SQLite database with Diesel ORM
//!
//! Stores patch layers and the files they change. Tables are created on open,
//! and every pooled connection enforces foreign keys so a patch can never be
//! removed while another patch builds on it or while it owns changed files.

use crate::model::{ChangedFile, Patch};
use crate::schema::*;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::result::DatabaseErrorKind;
use diesel::sqlite::SqliteConnection;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Env var that overrides every other database location
pub const DB_PATH_ENV: &str = "CODEPATCH_DB_PATH";

/// Directory (like `.git`) that marks a codepatch workspace
pub const WORKSPACE_DIR: &str = ".codepatch";

/// Resolve the database location.
///
/// Priority: `CODEPATCH_DB_PATH`, then the configured path, then the nearest
/// `.codepatch` directory walking upward, then `.codepatch/codepatch.db`.
pub fn resolve_db_path(configured: Option<&Path>) -> PathBuf {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        return PathBuf::from(path);
    }

    if let Some(path) = configured {
        return path.to_path_buf();
    }

    if let Ok(current_dir) = std::env::current_dir() {
        let mut dir = current_dir.as_path();
        loop {
            let workspace = dir.join(WORKSPACE_DIR);
            if workspace.is_dir() {
                return workspace.join("codepatch.db");
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    PathBuf::from(WORKSPACE_DIR).join("codepatch.db")
}

/// Format a timestamp the way every row stores it.
///
/// UTC with fixed microsecond precision, so string order is time order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now() -> String {
    format_timestamp(Utc::now())
}

// ============================================================================
// Diesel Models
// ============================================================================

/// Insertable patch
#[derive(Insertable)]
#[diesel(table_name = patches)]
pub struct NewPatch<'a> {
    pub title: &'a str,
    pub created_at: &'a str,
    pub modified_at: &'a str,
    pub base_patch_id: Option<i32>,
    pub commit_hash: Option<&'a str>,
    pub metadata_json: &'a str,
}

/// Insertable changed file
#[derive(Insertable)]
#[diesel(table_name = changed_files)]
pub struct NewChangedFile<'a> {
    pub patch_id: i32,
    pub filename: &'a str,
    pub title: &'a str,
    pub metadata_json: &'a str,
    pub diff_json: &'a str,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas. SQLite forgets these between connections.
#[derive(Debug)]
struct ConnectionOptions {
    busy_timeout_ms: u32,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database connection wrapper with connection pool
pub struct Database {
    pool: DbPool,
}

/// Error type for database operations
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("{0} already exists")]
    Duplicate(String),
    #[error("{0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

fn is_unique_violation(e: &diesel::result::Error) -> bool {
    matches!(
        e,
        diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

fn last_insert_rowid(conn: &mut SqliteConnection) -> Result<i32> {
    let id: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()"))
        .first(conn)?;
    Ok(id)
}

impl Database {
    /// Open database at the default location (respects CODEPATCH_DB_PATH)
    pub fn open() -> Result<Self> {
        Self::open_at(resolve_db_path(None))
    }

    /// Open database at specified path, creating its directory if needed
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DbError::Connection(format!("{}: {}", parent.display(), e)))?;
            }
        }

        let path_str = path.to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(5)
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout_ms: 5_000,
            }))
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.init_schema()?;
        tracing::debug!(path = %path.display(), "opened patch database");
        Ok(db)
    }

    fn get_conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| DbError::Connection(e.to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        // Exactly one of base_patch_id / commit_hash identifies where a layer sits
        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS patches (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                base_patch_id INTEGER,
                commit_hash TEXT UNIQUE,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                FOREIGN KEY (base_patch_id) REFERENCES patches(id) ON DELETE RESTRICT,
                CHECK ((base_patch_id IS NULL) <> (commit_hash IS NULL))
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS changed_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                patch_id INTEGER NOT NULL,
                filename TEXT NOT NULL,
                title TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                diff_json TEXT NOT NULL DEFAULT '{}',
                FOREIGN KEY (patch_id) REFERENCES patches(id) ON DELETE RESTRICT,
                UNIQUE(patch_id, filename)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_patches_modified ON patches(modified_at)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_patches_created ON patches(created_at)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_patches_base ON patches(base_patch_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_changed_files_patch ON changed_files(patch_id)").execute(&mut conn)?;

        Ok(())
    }

    // ========================================================================
    // Patch Operations
    // ========================================================================

    /// Insert a root patch pinned to `commit_hash`, dated at `committed_at`.
    ///
    /// Fails with [`DbError::Duplicate`] when a root for that commit already
    /// exists; callers re-fetch in that case.
    pub fn create_root_patch(
        &self,
        title: &str,
        commit_hash: &str,
        committed_at: DateTime<Utc>,
    ) -> Result<Patch> {
        let mut conn = self.get_conn()?;
        let stamp = format_timestamp(committed_at);

        let new_patch = NewPatch {
            title,
            created_at: &stamp,
            modified_at: &stamp,
            base_patch_id: None,
            commit_hash: Some(commit_hash),
            metadata_json: "{}",
        };

        conn.transaction::<_, DbError, _>(|conn| {
            match diesel::insert_into(patches::table).values(&new_patch).execute(conn) {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(DbError::Duplicate(format!("Root patch for commit {}", commit_hash)));
                }
                Err(e) => return Err(e.into()),
            }
            let id = last_insert_rowid(conn)?;
            Ok(patches::table.find(id).select(Patch::as_select()).first(conn)?)
        })
    }

    /// Insert a patch stacked on `base_patch_id`
    pub fn create_patch(&self, title: &str, base_patch_id: i32, metadata_json: Option<&str>) -> Result<Patch> {
        let mut conn = self.get_conn()?;
        let now = now();

        let new_patch = NewPatch {
            title,
            created_at: &now,
            modified_at: &now,
            base_patch_id: Some(base_patch_id),
            commit_hash: None,
            metadata_json: metadata_json.unwrap_or("{}"),
        };

        conn.transaction::<_, DbError, _>(|conn| {
            diesel::insert_into(patches::table).values(&new_patch).execute(conn)?;
            let id = last_insert_rowid(conn)?;
            Ok(patches::table.find(id).select(Patch::as_select()).first(conn)?)
        })
    }

    /// Get a patch by id
    pub fn get_patch(&self, id: i32) -> Result<Option<Patch>> {
        let mut conn = self.get_conn()?;
        let patch = patches::table
            .find(id)
            .select(Patch::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(patch)
    }

    /// Get the root patch for a commit, if one was ever materialized
    pub fn find_patch_by_commit(&self, commit_hash: &str) -> Result<Option<Patch>> {
        let mut conn = self.get_conn()?;
        let patch = patches::table
            .filter(patches::commit_hash.eq(commit_hash))
            .select(Patch::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(patch)
    }

    /// Most recently modified non-root patches
    pub fn recent_patches(&self, limit: i64) -> Result<Vec<Patch>> {
        let mut conn = self.get_conn()?;
        let patches = patches::table
            .filter(patches::commit_hash.is_null())
            .order((patches::modified_at.desc(), patches::id.desc()))
            .limit(limit)
            .select(Patch::as_select())
            .load(&mut conn)?;
        Ok(patches)
    }

    /// Root patches, newest commit first
    pub fn root_patches(&self) -> Result<Vec<Patch>> {
        let mut conn = self.get_conn()?;
        let patches = patches::table
            .filter(patches::commit_hash.is_not_null())
            .order(patches::created_at.desc())
            .select(Patch::as_select())
            .load(&mut conn)?;
        Ok(patches)
    }

    /// Patches whose base is `patch_id`
    pub fn child_patches(&self, patch_id: i32) -> Result<Vec<Patch>> {
        let mut conn = self.get_conn()?;
        let patches = patches::table
            .filter(patches::base_patch_id.eq(patch_id))
            .order(patches::id.asc())
            .select(Patch::as_select())
            .load(&mut conn)?;
        Ok(patches)
    }

    /// Update title and/or metadata, bumping `modified_at`
    pub fn update_patch_details(&self, patch_id: i32, title: Option<&str>, metadata_json: Option<&str>) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = now();

        conn.transaction::<_, DbError, _>(|conn| {
            if let Some(title) = title {
                diesel::update(patches::table.find(patch_id))
                    .set(patches::title.eq(title))
                    .execute(conn)?;
            }
            if let Some(metadata_json) = metadata_json {
                diesel::update(patches::table.find(patch_id))
                    .set(patches::metadata_json.eq(metadata_json))
                    .execute(conn)?;
            }
            diesel::update(patches::table.find(patch_id))
                .set(patches::modified_at.eq(&now))
                .execute(conn)?;
            Ok(())
        })
    }

    /// Point a non-root patch at a different base. Cycle checks are the caller's job.
    pub fn set_base_patch(&self, patch_id: i32, base_patch_id: i32) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = now();

        let updated = diesel::update(
            patches::table
                .find(patch_id)
                .filter(patches::commit_hash.is_null()),
        )
        .set((
            patches::base_patch_id.eq(Some(base_patch_id)),
            patches::modified_at.eq(&now),
        ))
        .execute(&mut conn)?;

        if updated == 0 {
            return Err(DbError::Validation(format!("Patch {} is not a non-root patch", patch_id)));
        }
        Ok(())
    }

    // ========================================================================
    // Changed File Operations
    // ========================================================================

    /// Number of files a patch changes
    pub fn count_changed_files(&self, patch_id: i32) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let count = changed_files::table
            .filter(changed_files::patch_id.eq(patch_id))
            .count()
            .get_result(&mut conn)?;
        Ok(count)
    }

    /// All changed files of a patch, by filename
    pub fn changed_files(&self, patch_id: i32) -> Result<Vec<ChangedFile>> {
        let mut conn = self.get_conn()?;
        let files = changed_files::table
            .filter(changed_files::patch_id.eq(patch_id))
            .order(changed_files::filename.asc())
            .select(ChangedFile::as_select())
            .load(&mut conn)?;
        Ok(files)
    }

    /// Changed files of a patch for one filename (zero or one row by the unique key)
    pub fn changed_files_named(&self, patch_id: i32, filename: &str) -> Result<Vec<ChangedFile>> {
        let mut conn = self.get_conn()?;
        let files = changed_files::table
            .filter(changed_files::patch_id.eq(patch_id))
            .filter(changed_files::filename.eq(filename))
            .order(changed_files::id.asc())
            .select(ChangedFile::as_select())
            .load(&mut conn)?;
        Ok(files)
    }

    /// Get a changed file by id, scoped to its owning patch
    pub fn get_changed_file(&self, patch_id: i32, change_id: i32) -> Result<Option<ChangedFile>> {
        let mut conn = self.get_conn()?;
        let file = changed_files::table
            .find(change_id)
            .filter(changed_files::patch_id.eq(patch_id))
            .select(ChangedFile::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(file)
    }

    /// Get the changed file for `(patch_id, filename)`, creating it if absent.
    ///
    /// Returns the record and whether it was created. A concurrent insert of the
    /// same key resolves to the winner's row.
    pub fn get_or_create_changed_file(
        &self,
        patch_id: i32,
        filename: &str,
        title: &str,
        diff_json: &str,
    ) -> Result<(ChangedFile, bool)> {
        let mut conn = self.get_conn()?;
        let existing = changed_files::table
            .filter(changed_files::patch_id.eq(patch_id))
            .filter(changed_files::filename.eq(filename))
            .select(ChangedFile::as_select())
            .first(&mut conn)
            .optional()?;
        if let Some(file) = existing {
            return Ok((file, false));
        }

        self.insert_changed_file(&mut conn, patch_id, filename, title, diff_json)
    }

    /// Insert half of [`Database::get_or_create_changed_file`]. Losing a race
    /// on the unique key returns the existing row with `created == false`.
    fn insert_changed_file(
        &self,
        conn: &mut DbConn,
        patch_id: i32,
        filename: &str,
        title: &str,
        diff_json: &str,
    ) -> Result<(ChangedFile, bool)> {
        let now = now();
        let new_file = NewChangedFile {
            patch_id,
            filename,
            title,
            metadata_json: "{}",
            diff_json,
        };

        let created = conn.transaction::<_, DbError, _>(|conn| {
            diesel::insert_into(changed_files::table).values(&new_file).execute(conn)?;
            let id = last_insert_rowid(conn)?;
            diesel::update(patches::table.find(patch_id))
                .set(patches::modified_at.eq(&now))
                .execute(conn)?;
            Ok(changed_files::table.find(id).select(ChangedFile::as_select()).first(conn)?)
        });

        match created {
            Ok(file) => Ok((file, true)),
            Err(DbError::Query(e)) if is_unique_violation(&e) => {
                tracing::debug!(patch = patch_id, file = %filename, "changed file created concurrently");
                let file = changed_files::table
                    .filter(changed_files::patch_id.eq(patch_id))
                    .filter(changed_files::filename.eq(filename))
                    .select(ChangedFile::as_select())
                    .first(conn)?;
                Ok((file, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Store a new modification record and bump the owner's `modified_at`, atomically
    pub fn save_replacement(&self, change: &ChangedFile, diff_json: &str) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = now();

        conn.transaction::<_, DbError, _>(|conn| {
            diesel::update(changed_files::table.find(change.id))
                .set(changed_files::diff_json.eq(diff_json))
                .execute(conn)?;
            diesel::update(patches::table.find(change.patch_id))
                .set(patches::modified_at.eq(&now))
                .execute(conn)?;
            Ok(())
        })
    }
}
