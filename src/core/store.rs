//! Store handle for a single project instance.
//!
//! One process instance owns one project root. The markdown corpus under the
//! knowledge directory is the source of truth; everything under the runtime
//! directory is a rebuildable cache.

use crate::core::config::EngineConfig;
use crate::core::error::EngineError;
use crate::core::paths;
use std::fs;
use std::path::{Path, PathBuf};

/// Handle to a project's knowledge store.
///
/// Carries the resolved project root plus the derived layout paths. All
/// subsystem state (recipes, candidates, indices, stats, logs) is scoped to
/// a store.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute project root.
    pub project_root: PathBuf,
    /// Resolved engine configuration for this store.
    pub config: EngineConfig,
}

impl Store {
    /// Open a store rooted at `project_root`, creating the runtime layout.
    pub fn open(project_root: &Path) -> Result<Store, EngineError> {
        let runtime = project_root.join(paths::RUNTIME_DIR_NAME);
        fs::create_dir_all(runtime.join("logs")).map_err(EngineError::Io)?;
        fs::create_dir_all(runtime.join("index")).map_err(EngineError::Io)?;
        let config = EngineConfig::load(&runtime)?;
        Ok(Store {
            project_root: project_root.to_path_buf(),
            config,
        })
    }

    /// `AutoSnippet/` — source-of-truth markdown corpus and policy documents.
    pub fn knowledge_dir(&self) -> PathBuf {
        self.project_root.join(paths::KNOWLEDGE_DIR_NAME)
    }

    pub fn recipes_dir(&self) -> PathBuf {
        self.knowledge_dir().join("recipes")
    }

    pub fn candidates_dir(&self) -> PathBuf {
        self.knowledge_dir().join("candidates")
    }

    pub fn constitution_path(&self) -> PathBuf {
        self.knowledge_dir().join("constitution.yaml")
    }

    pub fn boxspec_path(&self) -> PathBuf {
        self.knowledge_dir().join(paths::BOXSPEC_NAME)
    }

    /// `.autosnippet/` — rebuildable runtime cache.
    pub fn runtime_dir(&self) -> PathBuf {
        self.project_root.join(paths::RUNTIME_DIR_NAME)
    }

    /// The single SQLite database file (honors `cache_path` override).
    pub fn db_path(&self) -> PathBuf {
        match &self.config.cache_path {
            Some(p) => PathBuf::from(p),
            None => self.runtime_dir().join(crate::core::schemas::DB_NAME),
        }
    }

    pub fn stats_path(&self) -> PathBuf {
        self.runtime_dir().join("recipe-stats.json")
    }

    pub fn stats_lock_path(&self) -> PathBuf {
        self.runtime_dir().join("recipe-stats.json.lock")
    }

    /// Append-only engine event log.
    pub fn events_log_path(&self) -> PathBuf {
        self.runtime_dir().join("logs").join("engine.events.jsonl")
    }

    /// Guard a write target against path escape before any file write.
    pub fn assert_write_safe(&self, path: &Path) -> Result<(), EngineError> {
        paths::assert_project_write_safe(&self.project_root, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_runtime_layout() {
        let tmp = tempdir().expect("tempdir");
        let store = Store::open(tmp.path()).expect("open");
        assert!(store.runtime_dir().join("logs").is_dir());
        assert!(store.runtime_dir().join("index").is_dir());
        assert!(store.db_path().ends_with(".autosnippet/autosnippet.db"));
    }

    #[test]
    fn test_layout_paths_are_rooted() {
        let tmp = tempdir().expect("tempdir");
        let store = Store::open(tmp.path()).expect("open");
        assert!(store.recipes_dir().starts_with(tmp.path()));
        assert!(store.constitution_path().ends_with("AutoSnippet/constitution.yaml"));
        assert!(store.stats_lock_path().ends_with("recipe-stats.json.lock"));
    }
}
