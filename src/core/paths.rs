//! Path and identity guard.
//!
//! Every filesystem write in the engine passes through this module. Callers
//! that bypass `assert_project_write_safe` are a bug.

use crate::core::config;
use crate::core::error::EngineError;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directory holding the markdown corpus, constitution, and project spec.
pub const KNOWLEDGE_DIR_NAME: &str = "AutoSnippet";
/// Hidden runtime directory holding the database, indices, logs, and stats.
pub const RUNTIME_DIR_NAME: &str = ".autosnippet";
/// Project spec file inside the knowledge directory.
pub const BOXSPEC_NAME: &str = "boxspec.json";

/// Produce a fresh entity identifier: `<prefix>-<uuid-v4>`.
///
/// Entity ids are immutable once assigned; references always use ids, never
/// titles or file paths.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Resolve the project root by walking up from `cwd` until a directory
/// containing `AutoSnippet/boxspec.json` is found.
///
/// `ASD_PROJECT_DIR` overrides the walk entirely.
pub fn resolve_project_root(cwd: &Path) -> Result<PathBuf, EngineError> {
    if let Some(dir) = config::env_project_dir() {
        let root = PathBuf::from(dir);
        if root.join(KNOWLEDGE_DIR_NAME).join(BOXSPEC_NAME).exists() {
            return Ok(root);
        }
        return Err(EngineError::NotFound(format!(
            "ASD_PROJECT_DIR='{}' does not contain {}/{}",
            root.display(),
            KNOWLEDGE_DIR_NAME,
            BOXSPEC_NAME
        )));
    }

    let mut current = PathBuf::from(cwd);
    loop {
        if current.join(KNOWLEDGE_DIR_NAME).join(BOXSPEC_NAME).exists() {
            return Ok(current);
        }
        if !current.pop() {
            return Err(EngineError::NotFound(format!(
                "'{}/{}' not found in current or parent directories. Run `asd init` first.",
                KNOWLEDGE_DIR_NAME, BOXSPEC_NAME
            )));
        }
    }
}

/// Assert that `path` is inside the project write-allowed area.
///
/// The check canonicalizes the deepest existing ancestor of `path` and
/// requires it to be a descendant of the canonicalized project root, which
/// also rejects symlinks whose target escapes the root. Escapes return
/// `PathEscape` and are never retried.
pub fn assert_project_write_safe(project_root: &Path, path: &Path) -> Result<(), EngineError> {
    if config::env_skip_write_guard() {
        return Ok(());
    }

    let canonical_root = project_root
        .canonicalize()
        .map_err(|e| EngineError::PathEscape(format!("unresolvable project root: {}", e)))?;

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    };

    // `path` itself may not exist yet (new file). Canonicalize the deepest
    // existing ancestor and re-append the remaining lexical components,
    // rejecting any `..` in the non-existing tail.
    let mut existing = absolute.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => {
                return Err(EngineError::PathEscape(format!(
                    "no existing ancestor for '{}'",
                    absolute.display()
                )))
            }
        }
    }

    for component in &tail {
        let c = component.to_string_lossy();
        if c == ".." {
            return Err(EngineError::PathEscape(format!(
                "parent traversal in '{}'",
                absolute.display()
            )));
        }
    }

    let canonical_existing = existing
        .canonicalize()
        .map_err(|e| EngineError::PathEscape(format!("{}: {}", existing.display(), e)))?;

    let mut resolved = canonical_existing;
    for component in tail.iter().rev() {
        resolved.push(component);
    }

    if !resolved.starts_with(&canonical_root) {
        return Err(EngineError::PathEscape(format!(
            "'{}' resolves outside project root '{}'",
            absolute.display(),
            canonical_root.display()
        )));
    }
    Ok(())
}
