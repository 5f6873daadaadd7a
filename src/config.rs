//! Configuration file support for codepatch
//!
//! Reads from .codepatch/config.toml, found by walking up from the current
//! directory. Relative paths in the file are taken relative to the directory
//! that holds `.codepatch`.

use crate::db::WORKSPACE_DIR;
use crate::render::DEFAULT_RENDER_URL;
use crate::repository::DEFAULT_INDEX_FILE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Where the published code lives
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Patch database location
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Render service endpoint
    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub patches: PatchesConfig,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    root: Option<PathBuf>,
}

/// Git repository settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RepositoryConfig {
    /// Path to the git repository
    /// Default: "."
    #[serde(default = "default_repo_path")]
    pub path: PathBuf,

    /// Branch whose head is offered as the starting point for new patches
    /// Default: "master"
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Metadata document at the root of every published tree
    /// Default: "index.xml"
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Explicit database file. CODEPATCH_DB_PATH still wins over this.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RenderConfig {
    /// Default: "http://localhost:8001/render-body"
    #[serde(default = "default_render_url")]
    pub url: String,

    /// Default: 30
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PatchesConfig {
    /// How many patches the recent list shows
    /// Default: 100
    #[serde(default = "default_recent_limit")]
    pub recent_limit: i64,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_index_file() -> String {
    DEFAULT_INDEX_FILE.to_string()
}

fn default_render_url() -> String {
    DEFAULT_RENDER_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_recent_limit() -> i64 {
    100
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: default_repo_path(),
            branch: default_branch(),
            index_file: default_index_file(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            url: default_render_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for PatchesConfig {
    fn default() -> Self {
        Self {
            recent_limit: default_recent_limit(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Load config from the nearest .codepatch/config.toml.
    /// Returns default config if there is none or it can't be read.
    pub fn load() -> Self {
        if let Some(path) = Self::find_config_path() {
            match Self::load_from(&path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!(error = %e, "ignoring unreadable config"),
            }
        }
        Self::default()
    }

    /// Load an explicitly named config file. Unlike [`Config::load`], a bad
    /// file is an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.root = Some(workspace_root(path));
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(WORKSPACE_DIR).join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Repository location with relative paths resolved
    pub fn repository_path(&self) -> PathBuf {
        self.resolve(&self.repository.path)
    }

    /// Configured database location with relative paths resolved
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database.path.as_deref().map(|p| self.resolve(p))
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render.timeout_secs)
    }
}

/// `.codepatch/config.toml` resolves against the directory holding
/// `.codepatch`; any other file resolves against its own directory.
fn workspace_root(config_path: &Path) -> PathBuf {
    let dir = config_path.parent().unwrap_or_else(|| Path::new(""));
    let root = if dir.file_name().is_some_and(|name| name == WORKSPACE_DIR) {
        dir.parent().unwrap_or(dir)
    } else {
        dir
    };
    if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root.to_path_buf()
    }
}
