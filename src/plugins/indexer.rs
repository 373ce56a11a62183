//! Indexing pipeline: semantic vectors plus a keyword index over the union
//! of active recipes and pending/approved candidates.
//!
//! Both indices are derived caches; `run` with `clear` rebuilds them
//! end-to-end and without `clear` only re-indexes entities whose content
//! hash moved. Embedding failures are per-entity and non-fatal; the entity
//! keeps participating in keyword search.

use crate::core::error::EngineError;
use crate::core::provider::{self, Provider};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::{candidates, recipes};
use clap::{Parser, Subcommand};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Character budget per semantic chunk.
pub const CHUNK_BUDGET: usize = 1500;

/// One indexable entity drawn from the store.
#[derive(Debug, Clone)]
pub struct IndexEntity {
    pub entity_id: String,
    pub entity_type: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IndexReport {
    pub indexed: usize,
    pub skipped: usize,
    pub removed: usize,
}

// --- Tokenization ---

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}')
}

/// Language-agnostic tokenizer: lowercase, split on non-alphanumeric, and
/// keep CJK runs as unigrams plus bigrams.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut ascii_run = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let mut flush_ascii = |run: &mut String, terms: &mut Vec<String>| {
        if !run.is_empty() {
            terms.push(run.to_lowercase());
            run.clear();
        }
    };
    let mut flush_cjk = |run: &mut Vec<char>, terms: &mut Vec<String>| {
        for c in run.iter() {
            terms.push(c.to_string());
        }
        for pair in run.windows(2) {
            terms.push(pair.iter().collect());
        }
        run.clear();
    };

    for c in text.chars() {
        if is_cjk(c) {
            flush_ascii(&mut ascii_run, &mut terms);
            cjk_run.push(c);
        } else if c.is_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut terms);
            ascii_run.push(c);
        } else {
            flush_ascii(&mut ascii_run, &mut terms);
            flush_cjk(&mut cjk_run, &mut terms);
        }
    }
    flush_ascii(&mut ascii_run, &mut terms);
    flush_cjk(&mut cjk_run, &mut terms);
    terms
}

// --- Chunking ---

fn normalize_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        lines.push(line.split_whitespace().collect::<Vec<_>>().join(" "));
    }
    let joined = lines.join("\n");
    // Collapse runs of blank lines into one paragraph break.
    let mut out = String::with_capacity(joined.len());
    let mut blank_pending = false;
    for line in joined.lines() {
        if line.is_empty() {
            blank_pending = !out.is_empty();
            continue;
        }
        if blank_pending {
            out.push_str("\n\n");
            blank_pending = false;
        } else if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    out
}

fn hard_split(text: &str, budget: usize, chunks: &mut Vec<String>) {
    let chars: Vec<char> = text.chars().collect();
    for piece in chars.chunks(budget) {
        let piece: String = piece.iter().collect();
        if !piece.trim().is_empty() {
            chunks.push(piece.trim().to_string());
        }
    }
}

fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in paragraph.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '。' | '！' | '？') {
            sentences.push(current.clone());
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }
    sentences
}

/// Split normalized content into chunks within the character budget,
/// preferring paragraph boundaries, then sentences, then hard cuts.
pub fn chunk_content(text: &str, budget: usize) -> Vec<String> {
    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Vec::new();
    }
    if normalized.chars().count() <= budget {
        return vec![normalized];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in normalized.split("\n\n") {
        let paragraph_len = paragraph.chars().count();
        let current_len = current.chars().count();
        if current_len + paragraph_len + 2 <= budget {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            continue;
        }
        if !current.is_empty() {
            chunks.push(current.clone());
            current.clear();
        }
        if paragraph_len <= budget {
            current.push_str(paragraph);
            continue;
        }
        for sentence in split_sentences(paragraph) {
            let sentence_len = sentence.chars().count();
            let current_len = current.chars().count();
            if sentence_len > budget {
                if !current.is_empty() {
                    chunks.push(current.clone());
                    current.clear();
                }
                hard_split(&sentence, budget, &mut chunks);
            } else if current_len + sentence_len <= budget {
                current.push_str(&sentence);
            } else {
                chunks.push(current.clone());
                current = sentence;
            }
        }
        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}

// --- Vector encoding ---

pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// --- Entity enumeration ---

fn recipe_entity(recipe: &recipes::Recipe) -> IndexEntity {
    let summary = if recipe.summary_en.is_empty() {
        recipe.summary_cn.clone()
    } else {
        recipe.summary_en.clone()
    };
    let usage_guide = if recipe.usage_guide_en.is_empty() {
        recipe.content.markdown.clone()
    } else {
        recipe.usage_guide_en.clone()
    };
    IndexEntity {
        entity_id: recipe.id.clone(),
        entity_type: "recipe".to_string(),
        title: recipe.title.clone(),
        content: format!(
            "{}\n{}\n{}\n{}",
            recipe.title, summary, recipe.content.pattern, usage_guide
        ),
    }
}

fn candidate_entity(candidate: &candidates::Candidate) -> IndexEntity {
    IndexEntity {
        entity_id: candidate.id.clone(),
        entity_type: "candidate".to_string(),
        title: candidate.category.clone(),
        content: format!(
            "{}\n{}\n{}",
            candidate.category, candidate.language, candidate.code
        ),
    }
}

/// The indexable universe: active recipes plus pending/approved candidates.
pub fn collect_entities(conn: &Connection) -> Result<Vec<IndexEntity>, EngineError> {
    let mut entities = Vec::new();
    for recipe in recipes::list_all(conn)? {
        if recipe.status == "active" {
            entities.push(recipe_entity(&recipe));
        }
    }
    for status in ["pending", "approved"] {
        for candidate in candidates::find_by_status(conn, status)? {
            entities.push(candidate_entity(&candidate));
        }
    }
    Ok(entities)
}

fn content_hash(entity: &IndexEntity) -> String {
    let digest = Sha256::digest(entity.content.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn delete_entity_index(
    conn: &Connection,
    entity_id: &str,
    entity_type: &str,
) -> Result<(), EngineError> {
    conn.execute(
        "DELETE FROM embedding_chunks WHERE entity_id = ?1 AND entity_type = ?2",
        params![entity_id, entity_type],
    )?;
    conn.execute(
        "DELETE FROM keyword_terms WHERE entity_id = ?1 AND entity_type = ?2",
        params![entity_id, entity_type],
    )?;
    conn.execute(
        "DELETE FROM index_state WHERE entity_id = ?1 AND entity_type = ?2",
        params![entity_id, entity_type],
    )?;
    Ok(())
}

fn write_keyword_index(conn: &Connection, entity: &IndexEntity) -> Result<usize, EngineError> {
    let terms = tokenize(&format!("{}\n{}", entity.title, entity.content));
    let doc_len = terms.len();
    let mut frequencies: rustc_hash::FxHashMap<String, u64> = rustc_hash::FxHashMap::default();
    for term in terms {
        *frequencies.entry(term).or_insert(0) += 1;
    }
    let mut sorted: Vec<(&String, &u64)> = frequencies.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (term, tf) in sorted {
        conn.execute(
            "INSERT OR REPLACE INTO keyword_terms(term, entity_id, entity_type, tf)
             VALUES(?1, ?2, ?3, ?4)",
            params![term, entity.entity_id, entity.entity_type, *tf as i64],
        )?;
    }
    Ok(doc_len)
}

/// Embed all chunks of one entity under the per-entity deadline. Any chunk
/// failure fails the whole entity.
fn embed_chunks(
    provider: &Arc<dyn Provider>,
    chunks: &[String],
) -> Result<Vec<Vec<f32>>, EngineError> {
    let mut vectors = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let provider = Arc::clone(provider);
        let text = chunk.clone();
        let vector = provider::call_with_deadline(provider::EMBED_DEADLINE, move || {
            provider.embed(&text)
        })?;
        vectors.push(vector);
    }
    Ok(vectors)
}

/// Run the indexing pipeline.
///
/// Embedding calls run on a dedicated pool bounded by the configured
/// concurrency; database writes stay on the calling thread.
pub fn run(
    store: &Store,
    conn: &Connection,
    ai: Option<Arc<dyn Provider>>,
    clear: bool,
) -> Result<IndexReport, EngineError> {
    if clear {
        conn.execute("DELETE FROM embedding_chunks", [])?;
        conn.execute("DELETE FROM keyword_terms", [])?;
        conn.execute("DELETE FROM index_state", [])?;
    }

    let entities = collect_entities(conn)?;
    let mut report = IndexReport::default();

    // Decide what needs work before any embedding call.
    let mut pending: Vec<(IndexEntity, String)> = Vec::new();
    for entity in entities.iter() {
        let hash = content_hash(entity);
        let existing: Option<(String, i64)> = conn
            .query_row(
                "SELECT content_hash, embedding_failed FROM index_state
                 WHERE entity_id = ?1 AND entity_type = ?2",
                params![entity.entity_id, entity.entity_type],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_or(None, Some);
        match existing {
            Some((old_hash, failed)) if old_hash == hash && (failed == 0 || ai.is_none()) => {
                report.skipped += 1;
            }
            _ => pending.push((entity.clone(), hash)),
        }
    }

    // Embed in parallel, bounded by the configured pool size.
    let chunked: Vec<(usize, Vec<String>)> = pending
        .iter()
        .enumerate()
        .map(|(i, (entity, _))| (i, chunk_content(&entity.content, CHUNK_BUDGET)))
        .collect();
    let mut embedded: Vec<Option<Result<Vec<Vec<f32>>, EngineError>>> =
        (0..pending.len()).map(|_| None).collect();
    if let Some(ai) = &ai {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(store.config.embed_concurrency.max(1))
            .build()
            .map_err(|e| EngineError::Internal(format!("embedding pool: {}", e)))?;
        let results: Vec<(usize, Result<Vec<Vec<f32>>, EngineError>)> = pool.install(|| {
            use rayon::prelude::*;
            chunked
                .par_iter()
                .map(|(index, chunks)| (*index, embed_chunks(ai, chunks)))
                .collect()
        });
        for (index, result) in results {
            embedded[index] = Some(result);
        }
    }

    let now = time::now_epoch_z();
    for (index, (entity, hash)) in pending.iter().enumerate() {
        delete_entity_index(conn, &entity.entity_id, &entity.entity_type)?;
        let doc_len = write_keyword_index(conn, entity)?;

        let mut embedding_failed = false;
        match (&ai, embedded[index].take()) {
            (Some(_), Some(Ok(vectors))) => {
                let chunks = &chunked[index].1;
                for (chunk_index, (chunk, vector)) in chunks.iter().zip(vectors.iter()).enumerate()
                {
                    let snippet: String = chunk.chars().take(240).collect();
                    conn.execute(
                        "INSERT INTO embedding_chunks(entity_id, entity_type, chunk_index, dim,
                             vector, content_snippet, metadata_json)
                         VALUES(?1, ?2, ?3, ?4, ?5, ?6, '{}')",
                        params![
                            entity.entity_id,
                            entity.entity_type,
                            chunk_index as i64,
                            vector.len() as i64,
                            vector_to_blob(vector),
                            snippet,
                        ],
                    )?;
                }
            }
            (Some(_), Some(Err(_))) => {
                // Provider failure is per-entity and non-fatal; keyword rows
                // above keep the entity searchable.
                embedding_failed = true;
            }
            _ => {}
        }

        conn.execute(
            "INSERT OR REPLACE INTO index_state(entity_id, entity_type, content_hash, indexed_at,
                 embedding_failed, doc_len)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entity.entity_id,
                entity.entity_type,
                hash,
                now,
                embedding_failed as i64,
                doc_len as i64,
            ],
        )?;
        report.indexed += 1;
    }

    // Entities deleted from the store leave both indices.
    let mut stale: Vec<(String, String)> = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT entity_id, entity_type FROM index_state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (entity_id, entity_type) = row?;
            let live = entities
                .iter()
                .any(|e| e.entity_id == entity_id && e.entity_type == entity_type);
            if !live {
                stale.push((entity_id, entity_type));
            }
        }
    }
    for (entity_id, entity_type) in stale {
        delete_entity_index(conn, &entity_id, &entity_type)?;
        report.removed += 1;
    }

    Ok(report)
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "index", about = "Build the semantic and keyword indices")]
pub struct IndexCli {
    #[clap(subcommand)]
    pub command: IndexCommand,
}

#[derive(Subcommand, Debug)]
pub enum IndexCommand {
    /// Run an index pass (incremental unless --clear)
    Run {
        #[clap(long)]
        clear: bool,
    },
}

pub fn run_index_cli(store: &Store, cli: IndexCli) -> Result<(), EngineError> {
    match cli.command {
        IndexCommand::Run { clear } => {
            let conn = crate::core::db::open_store_db(store)?;
            let ai = provider::provider_for(&store.config.ai_provider);
            let report = run(store, &conn, ai, clear)?;
            println!(
                "index: indexed={} skipped={} removed={}",
                report.indexed, report.skipped, report.removed
            );
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "index",
        "version": "1.0.0",
        "description": "Semantic vector and keyword indices over recipes and candidates",
        "commands": [
            { "name": "run", "parameters": ["clear"] }
        ],
        "storage": [
            "autosnippet.db#embedding_chunks",
            "autosnippet.db#keyword_terms",
            "autosnippet.db#index_state"
        ]
    })
}
