//! Usage counters and authority scores, file-backed under the runtime
//! directory.
//!
//! Every read-modify-write cycles through an exclusive-create lock file so
//! concurrent recorders from the editor and the tool protocol cannot lose
//! updates.

use crate::core::error::EngineError;
use crate::core::store::Store;
use crate::core::time;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STATS_SCHEMA_VERSION: u32 = 2;

const LOCK_RETRIES: u32 = 10;
const LOCK_BACKOFF: Duration = Duration::from_millis(50);

/// Heat weights for guard/human/ai usage.
pub const HEAT_WEIGHTS: (f64, f64, f64) = (1.0, 2.0, 1.0);
/// Blend factor between normalized heat and explicit authority.
pub const AUTHORITY_ALPHA: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageSource {
    Guard,
    Human,
    Ai,
}

impl UsageSource {
    pub fn parse(raw: &str) -> Result<UsageSource, EngineError> {
        match raw {
            "guard" => Ok(UsageSource::Guard),
            "human" => Ok(UsageSource::Human),
            "ai" => Ok(UsageSource::Ai),
            other => Err(EngineError::Validation(format!(
                "invalid usage source '{}'. Expected guard|human|ai",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    #[serde(default)]
    pub guard_usage_count: u64,
    #[serde(default)]
    pub human_usage_count: u64,
    #[serde(default)]
    pub ai_usage_count: u64,
    #[serde(default)]
    pub last_used_at: String,
    /// Explicit authority in [0, 5].
    #[serde(default)]
    pub authority: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub schema_version: u32,
    #[serde(default)]
    pub by_trigger: BTreeMap<String, UsageEntry>,
    #[serde(default)]
    pub by_file: BTreeMap<String, UsageEntry>,
}

impl Default for UsageStats {
    fn default() -> Self {
        UsageStats {
            schema_version: STATS_SCHEMA_VERSION,
            by_trigger: BTreeMap::new(),
            by_file: BTreeMap::new(),
        }
    }
}

/// RAII lock file guard; releases on drop.
struct StatsLock {
    path: PathBuf,
}

impl Drop for StatsLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_lock(lock_path: &Path) -> Result<StatsLock, EngineError> {
    for attempt in 0..=LOCK_RETRIES {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(_) => {
                return Ok(StatsLock {
                    path: lock_path.to_path_buf(),
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if attempt == LOCK_RETRIES {
                    break;
                }
                std::thread::sleep(LOCK_BACKOFF);
            }
            Err(err) => return Err(EngineError::Io(err)),
        }
    }
    Err(EngineError::LockContention(format!(
        "could not acquire {} after {} attempts",
        lock_path.display(),
        LOCK_RETRIES + 1
    )))
}

fn load_stats(path: &Path) -> Result<UsageStats, EngineError> {
    if !path.exists() {
        return Ok(UsageStats::default());
    }
    let raw = fs::read_to_string(path).map_err(EngineError::Io)?;
    serde_json::from_str(&raw)
        .map_err(|e| EngineError::Schema(format!("corrupt stats file {}: {}", path.display(), e)))
}

fn save_stats(store: &Store, path: &Path, stats: &UsageStats) -> Result<(), EngineError> {
    store.assert_write_safe(path)?;
    let body = serde_json::to_string_pretty(stats)
        .map_err(|e| EngineError::Schema(format!("stats encode: {}", e)))?;
    // Atomic replace: readers never observe a half-written file.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).map_err(EngineError::Io)?;
    fs::rename(&tmp, path).map_err(EngineError::Io)?;
    Ok(())
}

/// Locked read-modify-write against the stats file.
fn with_stats<R>(
    store: &Store,
    f: impl FnOnce(&mut UsageStats) -> R,
) -> Result<R, EngineError> {
    let _lock = acquire_lock(&store.stats_lock_path())?;
    let path = store.stats_path();
    let mut stats = load_stats(&path)?;
    let result = f(&mut stats);
    save_stats(store, &path, &stats)?;
    Ok(result)
}

/// Keys touched by one usage record.
#[derive(Debug, Clone, Default)]
pub struct UsageTarget {
    /// Trigger key, e.g. `@singleton`.
    pub trigger: Option<String>,
    /// Recipe file path; only the basename is used as the key.
    pub recipe_file_path: Option<String>,
}

fn file_key(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

fn bump(entry: &mut UsageEntry, source: UsageSource, now: &str) {
    match source {
        UsageSource::Guard => entry.guard_usage_count += 1,
        UsageSource::Human => entry.human_usage_count += 1,
        UsageSource::Ai => entry.ai_usage_count += 1,
    }
    entry.last_used_at = now.to_string();
}

/// Increment the relevant counter on both dimensions of the target.
pub fn record_usage(
    store: &Store,
    target: &UsageTarget,
    source: UsageSource,
) -> Result<UsageStats, EngineError> {
    if target.trigger.is_none() && target.recipe_file_path.is_none() {
        return Err(EngineError::Validation(
            "usage record needs a trigger or a recipe file path".to_string(),
        ));
    }
    let now = time::now_epoch_z();
    with_stats(store, |stats| {
        if let Some(trigger) = &target.trigger {
            bump(stats.by_trigger.entry(trigger.clone()).or_default(), source, &now);
        }
        if let Some(path) = &target.recipe_file_path {
            bump(stats.by_file.entry(file_key(path)).or_default(), source, &now);
        }
        stats.clone()
    })
}

/// Set explicit authority on both dimensions, clamped to [0, 5].
pub fn set_authority(
    store: &Store,
    target: &UsageTarget,
    authority: f64,
) -> Result<(), EngineError> {
    let clamped = authority.clamp(0.0, 5.0);
    with_stats(store, |stats| {
        if let Some(trigger) = &target.trigger {
            stats.by_trigger.entry(trigger.clone()).or_default().authority = clamped;
        }
        if let Some(path) = &target.recipe_file_path {
            stats.by_file.entry(file_key(path)).or_default().authority = clamped;
        }
    })
}

pub fn read_stats(store: &Store) -> Result<UsageStats, EngineError> {
    load_stats(&store.stats_path())
}

/// Weighted usage heat of one entry.
pub fn usage_heat(entry: &UsageEntry) -> f64 {
    let (w_guard, w_human, w_ai) = HEAT_WEIGHTS;
    w_guard * entry.guard_usage_count as f64
        + w_human * entry.human_usage_count as f64
        + w_ai * entry.ai_usage_count as f64
}

/// Composite authority score in [0, 1]: `α·normalize(heat) + (1−α)·authority/5`,
/// normalized by the max heat across entries of the same dimension.
pub fn authority_score(entry: &UsageEntry, max_heat: f64) -> f64 {
    let normalized_heat = if max_heat > 0.0 {
        usage_heat(entry) / max_heat
    } else {
        0.0
    };
    AUTHORITY_ALPHA * normalized_heat + (1.0 - AUTHORITY_ALPHA) * (entry.authority / 5.0)
}

/// Authority score for a trigger key, or 0 when unrecorded.
pub fn authority_for_trigger(stats: &UsageStats, trigger: &str) -> f64 {
    let Some(entry) = stats.by_trigger.get(trigger) else {
        return 0.0;
    };
    let max_heat = stats
        .by_trigger
        .values()
        .map(usage_heat)
        .fold(0.0f64, f64::max);
    authority_score(entry, max_heat)
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "stats", about = "Usage counters and authority scores")]
pub struct StatsCli {
    #[clap(subcommand)]
    pub command: StatsCommand,
}

#[derive(Subcommand, Debug)]
pub enum StatsCommand {
    /// Record a usage event
    Record {
        #[clap(long)]
        trigger: Option<String>,
        #[clap(long)]
        file: Option<String>,
        #[clap(long, default_value = "human")]
        source: String,
    },
    /// Set explicit authority [0, 5]
    SetAuthority {
        #[clap(long)]
        trigger: Option<String>,
        #[clap(long)]
        file: Option<String>,
        #[clap(long)]
        value: f64,
    },
    /// Show the stats file
    Show,
}

pub fn run_stats_cli(store: &Store, cli: StatsCli) -> Result<(), EngineError> {
    match cli.command {
        StatsCommand::Record {
            trigger,
            file,
            source,
        } => {
            let source = UsageSource::parse(&source)?;
            let target = UsageTarget {
                trigger,
                recipe_file_path: file,
            };
            record_usage(store, &target, source)?;
            println!("usage recorded");
        }
        StatsCommand::SetAuthority {
            trigger,
            file,
            value,
        } => {
            let target = UsageTarget {
                trigger,
                recipe_file_path: file,
            };
            set_authority(store, &target, value)?;
            println!("authority set");
        }
        StatsCommand::Show => {
            let stats = read_stats(store)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&stats)
                    .map_err(|e| EngineError::Schema(e.to_string()))?
            );
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "stats",
        "version": "1.0.0",
        "description": "Per-recipe usage counters and composite authority scores",
        "sources": ["guard", "human", "ai"],
        "commands": [
            { "name": "record", "parameters": ["trigger", "file", "source"] },
            { "name": "set-authority", "parameters": ["trigger", "file", "value"] },
            { "name": "show", "parameters": [] }
        ],
        "storage": ["recipe-stats.json", "recipe-stats.json.lock"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let tmp = tempdir().expect("tempdir");
        let store = Store::open(tmp.path()).expect("store");
        (tmp, store)
    }

    #[test]
    fn test_record_usage_updates_both_dimensions() {
        let (_tmp, store) = test_store();
        let target = UsageTarget {
            trigger: Some("@singleton".to_string()),
            recipe_file_path: Some("AutoSnippet/recipes/singleton.md".to_string()),
        };
        record_usage(&store, &target, UsageSource::Human).expect("record");
        record_usage(&store, &target, UsageSource::Guard).expect("record");

        let stats = read_stats(&store).expect("read");
        let by_trigger = &stats.by_trigger["@singleton"];
        assert_eq!(by_trigger.human_usage_count, 1);
        assert_eq!(by_trigger.guard_usage_count, 1);
        let by_file = &stats.by_file["singleton.md"];
        assert_eq!(by_file.human_usage_count, 1);
        assert!(!by_file.last_used_at.is_empty());
    }

    #[test]
    fn test_record_usage_without_target_is_invalid() {
        let (_tmp, store) = test_store();
        let err = record_usage(&store, &UsageTarget::default(), UsageSource::Ai).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_set_authority_clamps_to_range() {
        let (_tmp, store) = test_store();
        let target = UsageTarget {
            trigger: Some("@x".to_string()),
            recipe_file_path: None,
        };
        set_authority(&store, &target, 9.5).expect("set");
        let stats = read_stats(&store).expect("read");
        assert_eq!(stats.by_trigger["@x"].authority, 5.0);

        set_authority(&store, &target, -1.0).expect("set");
        let stats = read_stats(&store).expect("read");
        assert_eq!(stats.by_trigger["@x"].authority, 0.0);
    }

    #[test]
    fn test_lock_contention_surfaces_after_retries() {
        let (_tmp, store) = test_store();
        // Hold the lock by pre-creating the lock file.
        std::fs::write(store.stats_lock_path(), "held").expect("hold lock");
        let target = UsageTarget {
            trigger: Some("@x".to_string()),
            recipe_file_path: None,
        };
        let err = record_usage(&store, &target, UsageSource::Human).unwrap_err();
        assert!(matches!(err, EngineError::LockContention(_)));
    }

    #[test]
    fn test_lock_released_after_use() {
        let (_tmp, store) = test_store();
        let target = UsageTarget {
            trigger: Some("@x".to_string()),
            recipe_file_path: None,
        };
        record_usage(&store, &target, UsageSource::Human).expect("record");
        assert!(!store.stats_lock_path().exists());
    }

    #[test]
    fn test_heat_and_authority_score_math() {
        let entry = UsageEntry {
            guard_usage_count: 2,
            human_usage_count: 3,
            ai_usage_count: 1,
            last_used_at: "0Z".to_string(),
            authority: 5.0,
        };
        // 1*2 + 2*3 + 1*1
        assert_eq!(usage_heat(&entry), 9.0);
        // alpha * (9/9) + (1-alpha) * (5/5)
        assert!((authority_score(&entry, 9.0) - 1.0).abs() < 1e-9);
        assert!((authority_score(&entry, 18.0) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_authority_for_trigger_normalizes_over_dimension() {
        let mut stats = UsageStats::default();
        stats.by_trigger.insert(
            "@hot".to_string(),
            UsageEntry {
                human_usage_count: 10,
                ..Default::default()
            },
        );
        stats.by_trigger.insert(
            "@cold".to_string(),
            UsageEntry {
                human_usage_count: 1,
                ..Default::default()
            },
        );
        let hot = authority_for_trigger(&stats, "@hot");
        let cold = authority_for_trigger(&stats, "@cold");
        assert!(hot > cold);
        assert!((0.0..=1.0).contains(&hot));
        assert_eq!(authority_for_trigger(&stats, "@missing"), 0.0);
    }

    #[test]
    fn test_stats_file_uses_documented_key_shape() {
        let (_tmp, store) = test_store();
        let target = UsageTarget {
            trigger: Some("@singleton".to_string()),
            recipe_file_path: None,
        };
        record_usage(&store, &target, UsageSource::Ai).expect("record");
        let raw = std::fs::read_to_string(store.stats_path()).expect("read file");
        assert!(raw.contains("\"schemaVersion\""));
        assert!(raw.contains("\"byTrigger\""));
        assert!(raw.contains("\"aiUsageCount\""));
    }
}
