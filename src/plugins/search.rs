//! Hybrid search core.
//!
//! Retrieval merges three signals: BM25-style keyword scores, cosine
//! similarity over embedded chunks, and the composite authority score.
//! An optional AI re-rank runs under a hard two-second deadline with
//! fast-abort: any failure returns the pre-assist ordering unchanged with a
//! warning attached, and is never retried within the request.

use crate::core::error::EngineError;
use crate::core::provider::{self, Provider, RerankCandidate};
use crate::core::store::Store;
use crate::plugins::indexer::{blob_to_vector, tokenize};
use crate::plugins::{candidates, recipes, stats};
use clap::{Parser, Subcommand};
use regex::Regex;
use rusqlite::Connection;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

pub const BM25_K1: f64 = 1.5;
pub const BM25_B: f64 = 0.75;

/// Merge weights for semantic / keyword / authority.
pub const WEIGHT_SEMANTIC: f64 = 0.55;
pub const WEIGHT_KEYWORD: f64 = 0.35;
pub const WEIGHT_AUTHORITY: f64 = 0.10;

pub const WARNING_AI_ASSIST_ABORTED: &str = "ai_assist_aborted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Hybrid,
    Semantic,
    Keyword,
    Ranking,
}

impl SearchMode {
    pub fn parse(raw: &str) -> Result<SearchMode, EngineError> {
        match raw {
            "hybrid" => Ok(SearchMode::Hybrid),
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            "ranking" => Ok(SearchMode::Ranking),
            other => Err(EngineError::Validation(format!(
                "invalid search mode '{}'. Expected hybrid|semantic|keyword|ranking",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Hybrid => "hybrid",
            SearchMode::Semantic => "semantic",
            SearchMode::Keyword => "keyword",
            SearchMode::Ranking => "ranking",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    /// `recipe` or `candidate`.
    #[serde(default, rename = "type")]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    pub filter: SearchFilter,
    pub mode: SearchMode,
    pub enable_ai_assist: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        SearchRequest {
            query: String::new(),
            limit: 10,
            filter: SearchFilter::default(),
            mode: SearchMode::Hybrid,
            enable_ai_assist: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub score: f64,
    pub metadata: JsonValue,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub items: Vec<SearchHit>,
    pub total: usize,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Metadata needed to filter, break ties, and render one scored entity.
#[derive(Debug, Clone)]
struct EntityMeta {
    entity_type: String,
    title: String,
    trigger: String,
    language: String,
    category: String,
    kind: String,
    updated_at: String,
    excerpt: String,
}

fn load_meta(conn: &Connection, entity_id: &str, entity_type: &str) -> Option<EntityMeta> {
    match entity_type {
        "recipe" => recipes::get(conn, entity_id).ok().map(|r| EntityMeta {
            entity_type: "recipe".to_string(),
            title: r.title.clone(),
            trigger: r.trigger.clone(),
            language: r.language.clone(),
            category: r.category.clone(),
            kind: r.kind.clone(),
            updated_at: r.updated_at.clone(),
            excerpt: if r.summary_en.is_empty() {
                r.content.pattern.clone()
            } else {
                r.summary_en.clone()
            },
        }),
        "candidate" => candidates::get(conn, entity_id).ok().map(|c| EntityMeta {
            entity_type: "candidate".to_string(),
            title: c.category.clone(),
            trigger: String::new(),
            language: c.language.clone(),
            category: c.category.clone(),
            kind: String::new(),
            updated_at: c.updated_at.clone(),
            excerpt: c.code.clone(),
        }),
        _ => None,
    }
}

fn passes_filter(meta: &EntityMeta, filter: &SearchFilter) -> bool {
    if let Some(entity_type) = &filter.entity_type {
        if &meta.entity_type != entity_type {
            return false;
        }
    }
    if let Some(language) = &filter.language {
        if &meta.language != language {
            return false;
        }
    }
    if let Some(category) = &filter.category {
        if &meta.category != category {
            return false;
        }
    }
    if let Some(kind) = &filter.kind {
        if &meta.kind != kind {
            return false;
        }
    }
    true
}

// --- Keyword stage ---

/// BM25-style scores for the query terms, best-K entities.
fn keyword_scores(
    conn: &Connection,
    query: &str,
    top_k: usize,
) -> Result<FxHashMap<(String, String), f64>, EngineError> {
    let terms = tokenize(query);
    let mut scores: FxHashMap<(String, String), f64> = FxHashMap::default();
    if terms.is_empty() {
        return Ok(scores);
    }

    let doc_count: f64 = conn.query_row("SELECT COUNT(*) FROM index_state", [], |r| {
        r.get::<_, i64>(0).map(|v| v as f64)
    })?;
    if doc_count == 0.0 {
        return Ok(scores);
    }
    let avgdl: f64 = conn.query_row(
        "SELECT COALESCE(AVG(doc_len), 1.0) FROM index_state",
        [],
        |r| r.get(0),
    )?;
    let avgdl = if avgdl <= 0.0 { 1.0 } else { avgdl };

    let mut doc_lens: FxHashMap<(String, String), f64> = FxHashMap::default();
    {
        let mut stmt = conn.prepare("SELECT entity_id, entity_type, doc_len FROM index_state")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (id, entity_type, len) = row?;
            doc_lens.insert((id, entity_type), len.max(1) as f64);
        }
    }

    for term in &terms {
        let df: f64 = conn.query_row(
            "SELECT COUNT(*) FROM keyword_terms WHERE term = ?1",
            [term],
            |r| r.get::<_, i64>(0).map(|v| v as f64),
        )?;
        if df == 0.0 {
            continue;
        }
        let idf = ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln();

        let mut stmt = conn.prepare(
            "SELECT entity_id, entity_type, tf FROM keyword_terms WHERE term = ?1",
        )?;
        let rows = stmt.query_map([term], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (entity_id, entity_type, tf) = row?;
            let key = (entity_id, entity_type);
            let dl = doc_lens.get(&key).copied().unwrap_or(1.0);
            let tf = tf as f64;
            let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl);
            *scores.entry(key).or_insert(0.0) += idf * tf / denom;
        }
    }

    retain_top_k(&mut scores, top_k);
    Ok(scores)
}

// --- Semantic stage ---

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Best chunk cosine per entity against the query embedding, best-K.
fn semantic_scores(
    conn: &Connection,
    ai: &Arc<dyn Provider>,
    query: &str,
    top_k: usize,
) -> Result<FxHashMap<(String, String), f64>, EngineError> {
    let provider = Arc::clone(ai);
    let text = query.to_string();
    let query_vector =
        provider::call_with_deadline(provider::EMBED_DEADLINE, move || provider.embed(&text))?;

    let mut scores: FxHashMap<(String, String), f64> = FxHashMap::default();
    let mut stmt =
        conn.prepare("SELECT entity_id, entity_type, vector FROM embedding_chunks")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Vec<u8>>(2)?,
        ))
    })?;
    for row in rows {
        let (entity_id, entity_type, blob) = row?;
        let chunk_vector = blob_to_vector(&blob);
        let score = cosine(&query_vector, &chunk_vector);
        let key = (entity_id, entity_type);
        let best = scores.entry(key).or_insert(f64::MIN);
        if score > *best {
            *best = score;
        }
    }

    retain_top_k(&mut scores, top_k);
    Ok(scores)
}

fn retain_top_k(scores: &mut FxHashMap<(String, String), f64>, top_k: usize) {
    if scores.len() <= top_k {
        return;
    }
    let mut entries: Vec<((String, String), f64)> = scores.drain().collect();
    entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    entries.truncate(top_k);
    scores.extend(entries);
}

// --- Highlighting ---

/// Wrap query-term matches in `**` markers within a bounded excerpt.
pub fn highlight(excerpt: &str, query: &str) -> String {
    let bounded: String = excerpt.chars().take(240).collect();
    let mut out = bounded;
    for term in tokenize(query) {
        if term.len() < 2 {
            continue;
        }
        let Ok(re) = Regex::new(&format!("(?i){}", regex::escape(&term))) else {
            continue;
        };
        out = re.replace_all(&out, "**$0**").to_string();
    }
    out
}

// --- Pipeline ---

fn recency_score(updated_at: &str, newest: u64) -> f64 {
    let updated = crate::core::time::parse_epoch_z(updated_at).unwrap_or(0);
    if newest == 0 {
        return 0.0;
    }
    let age = newest.saturating_sub(updated) as f64;
    1.0 / (1.0 + age / 86_400.0)
}

/// Execute a search request against the store.
pub fn search(
    store: &Store,
    conn: &Connection,
    ai: Option<Arc<dyn Provider>>,
    request: &SearchRequest,
) -> Result<SearchResponse, EngineError> {
    let mode = request.mode;
    if request.query.trim().is_empty() && mode != SearchMode::Ranking {
        return Ok(SearchResponse {
            items: Vec::new(),
            total: 0,
            mode: mode.as_str().to_string(),
            warnings: Vec::new(),
        });
    }

    let limit = request.limit.max(1);
    let top_k = (3 * limit).max(30);
    let mut warnings = Vec::new();

    let keyword = match mode {
        SearchMode::Hybrid | SearchMode::Keyword => keyword_scores(conn, &request.query, top_k)?,
        _ => FxHashMap::default(),
    };
    let semantic = match (&ai, mode) {
        (Some(ai), SearchMode::Hybrid | SearchMode::Semantic) => {
            match semantic_scores(conn, ai, &request.query, top_k) {
                Ok(scores) => scores,
                Err(EngineError::ProviderUnavailable(_)) => {
                    // Degrade to the remaining signals; never retried here.
                    warnings.push("semantic_stage_unavailable".to_string());
                    FxHashMap::default()
                }
                Err(err) => return Err(err),
            }
        }
        _ => FxHashMap::default(),
    };

    // Union of both candidate sets (or the whole corpus for ranking mode).
    let mut keys: Vec<(String, String)> = Vec::new();
    if mode == SearchMode::Ranking {
        let mut stmt = conn.prepare("SELECT entity_id, entity_type FROM index_state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            keys.push(row?);
        }
    } else {
        keys.extend(keyword.keys().cloned());
        for key in semantic.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }

    let usage = stats::read_stats(store).unwrap_or_default();
    let max_keyword = keyword.values().copied().fold(0.0f64, f64::max);
    let newest = crate::core::time::now_epoch_secs();

    let mut scored: Vec<(SearchHit, String)> = Vec::new();
    for (entity_id, entity_type) in keys {
        let Some(meta) = load_meta(conn, &entity_id, &entity_type) else {
            continue;
        };
        if !passes_filter(&meta, &request.filter) {
            continue;
        }
        let key = (entity_id.clone(), entity_type.clone());
        let keyword_norm = if max_keyword > 0.0 {
            keyword.get(&key).copied().unwrap_or(0.0) / max_keyword
        } else {
            0.0
        };
        let semantic_norm = semantic.get(&key).copied().unwrap_or(0.0).clamp(0.0, 1.0);
        let authority = if meta.trigger.is_empty() {
            0.0
        } else {
            stats::authority_for_trigger(&usage, &meta.trigger)
        };

        let score = match mode {
            SearchMode::Ranking => {
                0.7 * authority + 0.3 * recency_score(&meta.updated_at, newest)
            }
            SearchMode::Keyword => keyword_norm,
            SearchMode::Semantic => semantic_norm,
            SearchMode::Hybrid => {
                WEIGHT_SEMANTIC * semantic_norm
                    + WEIGHT_KEYWORD * keyword_norm
                    + WEIGHT_AUTHORITY * authority
            }
        };
        if mode != SearchMode::Ranking && score <= 0.0 {
            continue;
        }

        let snippet = highlight(&meta.excerpt, &request.query);
        scored.push((
            SearchHit {
                id: entity_id,
                entity_type: meta.entity_type.clone(),
                score,
                metadata: serde_json::json!({
                    "title": meta.title,
                    "trigger": meta.trigger,
                    "language": meta.language,
                    "category": meta.category,
                    "kind": meta.kind,
                    "updated_at": meta.updated_at,
                }),
                snippet,
            },
            meta.updated_at.clone(),
        ));
    }

    // Merge ordering: score desc, then updated_at desc, then id.
    scored.sort_by(|a, b| {
        b.0.score
            .partial_cmp(&a.0.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.cmp(&a.1))
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
    let total = scored.len();
    let mut items: Vec<SearchHit> = scored.into_iter().map(|(hit, _)| hit).collect();

    // Optional single-round AI re-rank over the top 2·limit, fast-abort.
    if request.enable_ai_assist && !store.config.disable_ai_assist {
        if let Some(ai) = &ai {
            let window = items.len().min(2 * limit);
            match ai_rerank(ai, &request.query, &items[..window]) {
                Ok(order) => apply_rerank(&mut items, window, &order),
                Err(_) => warnings.push(WARNING_AI_ASSIST_ABORTED.to_string()),
            }
        }
    }

    items.truncate(limit);
    Ok(SearchResponse {
        items,
        total,
        mode: mode.as_str().to_string(),
        warnings,
    })
}

/// Single bounded re-rank call. Any error, timeout, empty response, or
/// non-permutation output is a failure; the caller keeps the pre-assist
/// ordering and never retries within the same request.
fn ai_rerank(
    ai: &Arc<dyn Provider>,
    query: &str,
    window: &[SearchHit],
) -> Result<Vec<String>, EngineError> {
    if window.is_empty() {
        return Ok(Vec::new());
    }
    let rerank_input: Vec<RerankCandidate> = window
        .iter()
        .map(|hit| RerankCandidate {
            id: hit.id.clone(),
            title: hit.metadata["title"].as_str().unwrap_or_default().to_string(),
            snippet: hit.snippet.clone(),
        })
        .collect();
    let provider = Arc::clone(ai);
    let query = query.to_string();
    let order = provider::call_with_deadline(provider::RERANK_DEADLINE, move || {
        provider.rerank(&query, &rerank_input)
    })?;

    if order.is_empty() {
        return Err(EngineError::ProviderUnavailable(
            "re-rank returned an empty ordering".to_string(),
        ));
    }
    let mut sorted_order = order.clone();
    sorted_order.sort();
    let mut expected: Vec<String> = window.iter().map(|h| h.id.clone()).collect();
    expected.sort();
    if sorted_order != expected {
        return Err(EngineError::ProviderUnavailable(
            "re-rank output is not a permutation of its input".to_string(),
        ));
    }
    Ok(order)
}

fn apply_rerank(items: &mut [SearchHit], window: usize, order: &[String]) {
    if order.is_empty() {
        return;
    }
    let mut by_id: FxHashMap<String, SearchHit> = items[..window]
        .iter()
        .cloned()
        .map(|hit| (hit.id.clone(), hit))
        .collect();
    for (slot, id) in order.iter().enumerate() {
        if let Some(hit) = by_id.remove(id) {
            items[slot] = hit;
        }
    }
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "search", about = "Hybrid retrieval over the knowledge store")]
pub struct SearchCli {
    #[clap(subcommand)]
    pub command: SearchCommand,
}

#[derive(Subcommand, Debug)]
pub enum SearchCommand {
    /// Run a query
    Query {
        #[clap(long)]
        query: String,
        #[clap(long, default_value = "10")]
        limit: usize,
        #[clap(long, default_value = "hybrid")]
        mode: String,
        #[clap(long)]
        language: Option<String>,
        #[clap(long)]
        ai_assist: bool,
    },
}

pub fn run_search_cli(store: &Store, cli: SearchCli) -> Result<(), EngineError> {
    match cli.command {
        SearchCommand::Query {
            query,
            limit,
            mode,
            language,
            ai_assist,
        } => {
            let conn = crate::core::db::open_store_db(store)?;
            let ai = provider::provider_for(&store.config.ai_provider);
            let request = SearchRequest {
                query,
                limit,
                filter: SearchFilter {
                    language,
                    ..Default::default()
                },
                mode: SearchMode::parse(&mode)?,
                enable_ai_assist: ai_assist,
            };
            let response = search(store, &conn, ai, &request)?;
            println!(
                "search: {} hit(s), mode={}{}",
                response.total,
                response.mode,
                if response.warnings.is_empty() {
                    String::new()
                } else {
                    format!(" warnings={}", response.warnings.join(","))
                }
            );
            for item in &response.items {
                println!(
                    "  {:.3}  {}  {}",
                    item.score,
                    item.id,
                    item.metadata["title"].as_str().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "search",
        "version": "1.0.0",
        "description": "Hybrid semantic + keyword + authority retrieval with optional AI re-rank",
        "modes": ["hybrid", "semantic", "keyword", "ranking"],
        "weights": { "semantic": WEIGHT_SEMANTIC, "keyword": WEIGHT_KEYWORD, "authority": WEIGHT_AUTHORITY },
        "commands": [
            { "name": "query", "parameters": ["query", "limit", "mode", "language", "ai_assist"] }
        ],
        "storage": []
    })
}
