//! Capability probes with a per-capability cached result.
//!
//! A capability (e.g. `git_write`) is an environmental ability gated by a
//! probe command, typically `git push --dry-run`. Probe results are cached
//! for the configured TTL; probe execution is serialized per capability id
//! and parallel across different capabilities.

use super::CapabilitySpec;
use crate::core::error::EngineError;
use crate::core::store::Store;
use crate::core::time;
use std::collections::HashMap;
use std::process::Command;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Probe deadline.
pub const PROBE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum CapabilityState {
    Available,
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Ok,
    /// Probe ran and reported failure.
    Failed,
    /// Probe could not run at all.
    Unrunnable,
}

#[derive(Debug, Clone, Copy)]
struct CachedProbe {
    outcome: ProbeOutcome,
    at: u64,
}

fn cache() -> &'static Mutex<HashMap<String, CachedProbe>> {
    static CACHE: OnceLock<Mutex<HashMap<String, CachedProbe>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn probe_lock(capability_id: &str) -> Result<Arc<Mutex<()>>, EngineError> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let map = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = map
        .lock()
        .map_err(|_| EngineError::Internal("probe lock map poisoned".to_string()))?;
    Ok(guard
        .entry(capability_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone())
}

/// Cache key is scoped to the project so two stores on one machine never
/// share probe results.
fn cache_key(store: &Store, capability_id: &str) -> String {
    format!("{}::{}", store.project_root.display(), capability_id)
}

/// Drop every cached probe result (test hook and `--refresh` path).
pub fn invalidate_all() {
    if let Ok(mut guard) = cache().lock() {
        guard.clear();
    }
}

fn run_probe(store: &Store, spec: &CapabilitySpec) -> ProbeOutcome {
    let command_line = spec.probe.clone();
    let cwd = store.project_root.clone();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut parts = command_line.split_whitespace();
        let Some(program) = parts.next() else {
            let _ = tx.send(ProbeOutcome::Unrunnable);
            return;
        };
        let args: Vec<&str> = parts.collect();
        let outcome = match Command::new(program).args(&args).current_dir(&cwd).output() {
            Ok(output) if output.status.success() => ProbeOutcome::Ok,
            Ok(_) => ProbeOutcome::Failed,
            Err(_) => ProbeOutcome::Unrunnable,
        };
        let _ = tx.send(outcome);
    });
    match rx.recv_timeout(PROBE_DEADLINE) {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::Failed,
    }
}

fn behavior_to_state(behavior: &str, capability_id: &str, detail: &str) -> CapabilityState {
    match behavior {
        "allow" => CapabilityState::Available,
        "review" => CapabilityState::Unavailable(format!(
            "capability '{}' requires review: {}",
            capability_id, detail
        )),
        _ => CapabilityState::Unavailable(format!(
            "capability '{}' unavailable: {}",
            capability_id, detail
        )),
    }
}

/// Resolve a capability, probing when no fresh cached result exists.
pub fn ensure(
    store: &Store,
    capability_id: &str,
    spec: &CapabilitySpec,
) -> Result<CapabilityState, EngineError> {
    let key = cache_key(store, capability_id);
    let now = time::now_epoch_secs();

    let fresh = {
        let guard = cache()
            .lock()
            .map_err(|_| EngineError::Internal("capability cache poisoned".to_string()))?;
        guard
            .get(&key)
            .filter(|entry| now.saturating_sub(entry.at) < spec.cache_ttl_secs.max(1))
            .copied()
    };

    let outcome = match fresh {
        Some(entry) => entry.outcome,
        None => {
            let lock = probe_lock(capability_id)?;
            let _serialized = lock
                .lock()
                .map_err(|_| EngineError::Internal("probe lock poisoned".to_string()))?;
            // Another caller may have probed while this one waited.
            let rechecked = {
                let guard = cache()
                    .lock()
                    .map_err(|_| EngineError::Internal("capability cache poisoned".to_string()))?;
                guard
                    .get(&key)
                    .filter(|entry| now.saturating_sub(entry.at) < spec.cache_ttl_secs.max(1))
                    .copied()
            };
            match rechecked {
                Some(entry) => entry.outcome,
                None => {
                    let outcome = run_probe(store, spec);
                    let mut guard = cache().lock().map_err(|_| {
                        EngineError::Internal("capability cache poisoned".to_string())
                    })?;
                    guard.insert(
                        key.clone(),
                        CachedProbe {
                            outcome,
                            at: time::now_epoch_secs(),
                        },
                    );
                    outcome
                }
            }
        }
    };

    Ok(match outcome {
        ProbeOutcome::Ok => CapabilityState::Available,
        ProbeOutcome::Failed => {
            behavior_to_state(&spec.on_missing_remote, capability_id, "probe failed")
        }
        ProbeOutcome::Unrunnable => {
            behavior_to_state(&spec.on_missing_repo, capability_id, "probe could not run")
        }
    })
}
