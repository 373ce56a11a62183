//! Engine configuration: environment variables override `config.json`.

use crate::core::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const ENV_PROJECT_DIR: &str = "ASD_PROJECT_DIR";
pub const ENV_AI_PROVIDER: &str = "ASD_AI_PROVIDER";
pub const ENV_DISABLE_AI_ASSIST: &str = "ASD_DISABLE_AI_ASSIST";
pub const ENV_SKIP_WRITE_GUARD: &str = "ASD_SKIP_WRITE_GUARD";
pub const ENV_CACHE_PATH: &str = "ASD_CACHE_PATH";
pub const ENV_EMBED_CONCURRENCY: &str = "ASD_EMBED_CONCURRENCY";

/// Resolved engine configuration.
///
/// Precedence: environment > `config.json` in the runtime directory >
/// built-in defaults. Unknown keys in `config.json` are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// AI provider identifier (`none` disables every provider-backed path).
    #[serde(default = "default_ai_provider")]
    pub ai_provider: String,
    /// Disable the AI re-rank stage of hybrid search.
    #[serde(default)]
    pub disable_ai_assist: bool,
    /// Override location of the SQLite database file.
    #[serde(default)]
    pub cache_path: Option<String>,
    /// Bound on concurrent embedding calls during indexing.
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
}

fn default_ai_provider() -> String {
    "none".to_string()
}

fn default_embed_concurrency() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ai_provider: default_ai_provider(),
            disable_ai_assist: false,
            cache_path: None,
            embed_concurrency: default_embed_concurrency(),
        }
    }
}

impl EngineConfig {
    /// Load configuration for a runtime directory, applying env overrides.
    pub fn load(runtime_dir: &Path) -> Result<EngineConfig, EngineError> {
        let mut cfg = EngineConfig::default();
        let path = runtime_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).map_err(EngineError::Io)?;
            cfg = serde_json::from_str(&raw).map_err(|e| {
                EngineError::Schema(format!("invalid config.json at {}: {}", path.display(), e))
            })?;
        }

        if let Ok(provider) = std::env::var(ENV_AI_PROVIDER) {
            if !provider.trim().is_empty() {
                cfg.ai_provider = provider.trim().to_string();
            }
        }
        if env_flag(ENV_DISABLE_AI_ASSIST) {
            cfg.disable_ai_assist = true;
        }
        if let Ok(cache) = std::env::var(ENV_CACHE_PATH) {
            if !cache.trim().is_empty() {
                cfg.cache_path = Some(cache.trim().to_string());
            }
        }
        if let Ok(raw) = std::env::var(ENV_EMBED_CONCURRENCY) {
            if let Ok(n) = raw.trim().parse::<usize>() {
                if n > 0 {
                    cfg.embed_concurrency = n;
                }
            }
        }
        Ok(cfg)
    }
}

pub fn env_project_dir() -> Option<String> {
    std::env::var(ENV_PROJECT_DIR)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_skip_write_guard() -> bool {
    env_flag(ENV_SKIP_WRITE_GUARD)
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_config_missing() {
        let tmp = tempdir().expect("tempdir");
        let cfg = EngineConfig::load(tmp.path()).expect("load");
        assert_eq!(cfg.ai_provider, "none");
        assert_eq!(cfg.embed_concurrency, 4);
        assert!(!cfg.disable_ai_assist);
    }

    #[test]
    fn test_config_file_values_apply() {
        let tmp = tempdir().expect("tempdir");
        std::fs::write(
            tmp.path().join("config.json"),
            r#"{"ai_provider":"local","embed_concurrency":2,"unknown_key":true}"#,
        )
        .expect("write config");
        let cfg = EngineConfig::load(tmp.path()).expect("load");
        assert_eq!(cfg.ai_provider, "local");
        assert_eq!(cfg.embed_concurrency, 2);
    }

    #[test]
    fn test_corrupt_config_is_schema_error() {
        let tmp = tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("config.json"), "{not json").expect("write config");
        let err = EngineConfig::load(tmp.path()).unwrap_err();
        assert!(matches!(err, EngineError::Schema(_)));
    }
}
