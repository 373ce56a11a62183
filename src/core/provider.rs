//! AI provider seam.
//!
//! The engine consumes embeddings and AI text through this interface; it
//! never implements a real provider. Every call carries a hard deadline and
//! every call site treats `ProviderUnavailable` as degrade-not-fail: the
//! enclosing operation continues without the AI result and never retries
//! within the same request.

use crate::core::error::EngineError;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Deadline for summarize/translate calls.
pub const TEXT_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for a single embedding call during indexing.
pub const EMBED_DEADLINE: Duration = Duration::from_secs(15);
/// Hard deadline for the search-assist re-rank (fast-abort).
pub const RERANK_DEADLINE: Duration = Duration::from_secs(2);

/// A candidate handed to the re-rank stage.
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub id: String,
    pub title: String,
    pub snippet: String,
}

/// Capability set of an AI provider.
///
/// Implementations may block; callers wrap invocations in
/// [`call_with_deadline`] so a slow provider cannot stall the engine.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a short summary of `text` in the requested locale.
    fn summarize(&self, text: &str, locale: &str) -> Result<String, EngineError>;

    /// Translate `text` into the target locale.
    fn translate(&self, text: &str, target_locale: &str) -> Result<String, EngineError>;

    /// Produce an embedding vector for `text`.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;

    /// Reorder candidate ids by relevance to `query`. Must return a
    /// permutation of the input ids; anything else is treated as a failure.
    fn rerank(&self, query: &str, candidates: &[RerankCandidate])
        -> Result<Vec<String>, EngineError>;
}

/// Run a provider call on a worker thread with a hard deadline.
///
/// Timeout, panic, or a hung provider all surface as `ProviderUnavailable`.
/// The worker thread is detached on timeout; the engine does not wait for it.
pub fn call_with_deadline<T, F>(deadline: Duration, f: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    match rx.recv_timeout(deadline) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(EngineError::ProviderUnavailable(format!(
            "provider call exceeded {}ms deadline",
            deadline.as_millis()
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(EngineError::ProviderUnavailable(
            "provider worker terminated without a result".to_string(),
        )),
    }
}

/// Resolve the configured provider.
///
/// `none` (the default) disables every provider-backed path. `hash` is the
/// built-in deterministic provider used by tests and offline setups; any
/// other identifier belongs to an external adapter and resolves to `None`
/// here, leaving those features degraded.
pub fn provider_for(name: &str) -> Option<Arc<dyn Provider>> {
    match name {
        "hash" => Some(Arc::new(HashProvider::default())),
        _ => None,
    }
}

/// Deterministic offline provider.
///
/// Embeddings are token-hash bucket counts, L2-normalized, so texts sharing
/// vocabulary score a positive cosine. Summaries and translations are
/// content-preserving stand-ins.
#[derive(Debug, Clone)]
pub struct HashProvider {
    pub dim: usize,
}

impl Default for HashProvider {
    fn default() -> Self {
        Self { dim: 256 }
    }
}

impl Provider for HashProvider {
    fn name(&self) -> &str {
        "hash"
    }

    fn summarize(&self, text: &str, _locale: &str) -> Result<String, EngineError> {
        let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let mut summary: String = first.chars().take(160).collect();
        if first.chars().count() > 160 {
            summary.push('…');
        }
        Ok(summary)
    }

    fn translate(&self, text: &str, _target_locale: &str) -> Result<String, EngineError> {
        Ok(text.to_string())
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let mut vector = vec![0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = token_bucket(&token.to_lowercase(), self.dim);
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn rerank(
        &self,
        _query: &str,
        candidates: &[RerankCandidate],
    ) -> Result<Vec<String>, EngineError> {
        Ok(candidates.iter().map(|c| c.id.clone()).collect())
    }
}

fn token_bucket(token: &str, dim: usize) -> usize {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(token.as_bytes());
    let mut acc = 0usize;
    for byte in digest.iter().take(4) {
        acc = (acc << 8) | *byte as usize;
    }
    acc % dim
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_embeddings_are_deterministic_and_normalized() {
        let provider = HashProvider::default();
        let a = provider.embed("singleton pattern in swift").expect("embed");
        let b = provider.embed("singleton pattern in swift").expect("embed");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_vocabulary_scores_positive_cosine() {
        let provider = HashProvider::default();
        let a = provider.embed("singleton shared instance").expect("embed");
        let b = provider.embed("a singleton holds one instance").expect("embed");
        let dot: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!(dot > 0.0);
    }

    #[test]
    fn test_deadline_aborts_slow_call() {
        let started = std::time::Instant::now();
        let result: Result<(), EngineError> =
            call_with_deadline(Duration::from_millis(50), || {
                std::thread::sleep(Duration::from_secs(5));
                Ok(())
            });
        assert!(matches!(result, Err(EngineError::ProviderUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_deadline_passes_fast_call_through() {
        let result = call_with_deadline(Duration::from_secs(1), || Ok(21 * 2));
        assert_eq!(result.expect("ok"), 42);
    }

    #[test]
    fn test_provider_for_unknown_is_none() {
        assert!(provider_for("none").is_none());
        assert!(provider_for("openai").is_none());
        assert!(provider_for("hash").is_some());
    }
}
