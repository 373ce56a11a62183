//! Markdown ↔ database synchronization.
//!
//! The markdown corpus under `AutoSnippet/` is the source of truth; the
//! database rows are a rebuildable cache. Sync parses every recipe and
//! candidate file, upserts rows keyed by stable ids, and marks rows whose
//! file disappeared as deprecated (`orphaned`) without ever hard-deleting.

use crate::core::error::EngineError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::candidates::{self, Candidate};
use crate::plugins::recipes::{self, Deprecation, Recipe, RecipeContent};
use clap::{Parser, Subcommand};
use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

pub const SNIPPET_HEADING: &str = "## Snippet / Code Reference";
pub const GUIDE_HEADING: &str = "## AI Context / Usage Guide";

pub const CATEGORIES: &[&str] = &[
    "View", "Service", "Tool", "Model", "Network", "Storage", "UI", "Utility",
];

pub const LANGUAGES: &[&str] = &["swift", "objectivec", "markdown"];

/// One parsed recipe block from a markdown file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecipeDoc {
    pub id: Option<String>,
    pub title: String,
    pub trigger: String,
    pub category: String,
    pub language: String,
    pub summary_cn: String,
    pub summary_en: String,
    /// Verbatim import statements.
    pub headers: Vec<String>,
    pub usage_guide_cn: Option<String>,
    pub usage_guide_en: Option<String>,
    pub knowledge_type: Option<String>,
    pub kind: Option<String>,
    pub complexity: Option<String>,
    pub scope: Option<String>,
    /// Fence language and code of the snippet block, when present.
    pub code: Option<(String, String)>,
    /// Body of the usage-guide section.
    pub guide_markdown: Option<String>,
}

impl RecipeDoc {
    /// A block without a snippet heading is declared intro-only and is
    /// exempt from the code-block requirement.
    pub fn intro_only(&self) -> bool {
        self.code.is_none()
    }
}

/// A structured validation issue collected during a sync run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncViolation {
    pub file: String,
    pub title: String,
    pub field: String,
    pub message: String,
}

/// Result envelope of one sync run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced: usize,
    pub created: usize,
    pub updated: usize,
    pub orphaned: Vec<String>,
    pub violations: Vec<SyncViolation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// First-time import: blocks with violations are skipped, the run
    /// succeeds.
    SkipViolations,
    /// Routine runs: any violation fails the run after the report is built.
    Strict,
}

// --- Parsing ---

fn is_front_matter_fence(line: &str) -> bool {
    line.trim_end() == "---"
}

/// Split a file into `(front_matter, body)` blocks. A `---` fence opens a
/// new block only at the start of content or after a blank line.
fn split_blocks(content: &str) -> Result<Vec<(String, String)>, EngineError> {
    let lines: Vec<&str> = content.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        while i < lines.len() && lines[i].trim().is_empty() {
            i += 1;
        }
        if i >= lines.len() {
            break;
        }
        if !is_front_matter_fence(lines[i]) {
            return Err(EngineError::Validation(format!(
                "expected '---' front matter fence, found '{}'",
                lines[i]
            )));
        }
        let fm_start = i + 1;
        let mut fm_end = fm_start;
        while fm_end < lines.len() && !is_front_matter_fence(lines[fm_end]) {
            fm_end += 1;
        }
        if fm_end >= lines.len() {
            return Err(EngineError::Validation(
                "unterminated front matter block".to_string(),
            ));
        }
        let front = lines[fm_start..fm_end].join("\n");

        let mut body_end = fm_end + 1;
        let mut in_fence = false;
        while body_end < lines.len() {
            let line = lines[body_end];
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            let next_block_start = !in_fence
                && is_front_matter_fence(line)
                && body_end > fm_end + 1
                && lines[body_end - 1].trim().is_empty();
            if next_block_start {
                break;
            }
            body_end += 1;
        }
        let body = lines[fm_end + 1..body_end].join("\n");
        blocks.push((front, body));
        i = body_end;
    }
    Ok(blocks)
}

fn yaml_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Accept `headers` as a YAML list or as a JSON array on one line. The
/// canonical emitted form is the JSON array.
fn parse_headers(value: &serde_yaml::Value) -> Result<Vec<String>, EngineError> {
    match value {
        serde_yaml::Value::Sequence(seq) => Ok(seq.iter().filter_map(yaml_string).collect()),
        serde_yaml::Value::String(raw) => serde_json::from_str::<Vec<String>>(raw)
            .map_err(|e| EngineError::Validation(format!("headers not a JSON array: {}", e))),
        serde_yaml::Value::Null => Ok(Vec::new()),
        _ => Err(EngineError::Validation(
            "headers must be a list of import statements".to_string(),
        )),
    }
}

fn parse_front_matter(front: &str) -> Result<RecipeDoc, EngineError> {
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(front)
        .map_err(|e| EngineError::Schema(format!("invalid front matter: {}", e)))?;
    let get = |key: &str| -> Option<&serde_yaml::Value> { mapping.get(key) };
    let get_string = |key: &str| -> String {
        get(key).and_then(yaml_string).unwrap_or_default()
    };
    let get_optional = |key: &str| -> Option<String> {
        get(key).and_then(yaml_string).filter(|s| !s.is_empty())
    };

    let headers = match get("headers") {
        Some(value) => parse_headers(value)?,
        None => Vec::new(),
    };

    Ok(RecipeDoc {
        id: get_optional("id"),
        title: get_string("title"),
        trigger: get_string("trigger"),
        category: get_string("category"),
        language: get_string("language"),
        summary_cn: get_string("summary_cn"),
        summary_en: get_string("summary_en"),
        headers,
        usage_guide_cn: get_optional("usageGuide_cn"),
        usage_guide_en: get_optional("usageGuide_en"),
        knowledge_type: get_optional("knowledgeType"),
        kind: get_optional("kind"),
        complexity: get_optional("complexity"),
        scope: get_optional("scope"),
        code: None,
        guide_markdown: None,
    })
}

fn parse_body(doc: &mut RecipeDoc, body: &str) {
    let lines: Vec<&str> = body.lines().collect();
    let mut i = 0usize;
    while i < lines.len() {
        let line = lines[i].trim_end();
        if line == SNIPPET_HEADING {
            i += 1;
            while i < lines.len() && !lines[i].trim_start().starts_with("```") {
                i += 1;
            }
            if i < lines.len() {
                let fence_language = lines[i].trim_start().trim_start_matches("```").to_string();
                i += 1;
                let mut code_lines = Vec::new();
                while i < lines.len() && !lines[i].trim_start().starts_with("```") {
                    code_lines.push(lines[i]);
                    i += 1;
                }
                doc.code = Some((fence_language, code_lines.join("\n")));
            }
        } else if line == GUIDE_HEADING {
            i += 1;
            let mut guide_lines = Vec::new();
            while i < lines.len() && !lines[i].trim_end().starts_with("## ") {
                guide_lines.push(lines[i]);
                i += 1;
            }
            let guide = guide_lines.join("\n").trim().to_string();
            if !guide.is_empty() {
                doc.guide_markdown = Some(guide);
            }
            continue;
        }
        i += 1;
    }
}

/// Parse every recipe block in a markdown document.
pub fn parse_document(content: &str) -> Result<Vec<RecipeDoc>, EngineError> {
    let mut docs = Vec::new();
    for (front, body) in split_blocks(content)? {
        let mut doc = parse_front_matter(&front)?;
        parse_body(&mut doc, &body);
        docs.push(doc);
    }
    Ok(docs)
}

// --- Serialization ---

fn yaml_scalar(value: &str) -> String {
    let needs_quoting = value.is_empty()
        || value.starts_with('@')
        || value.starts_with('-')
        || value.starts_with(' ')
        || value.ends_with(' ')
        || value.contains(':')
        || value.contains('#')
        || value.contains('"')
        || value.contains('\'')
        || value.contains('\n');
    if needs_quoting {
        serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value))
    } else {
        value.to_string()
    }
}

/// Canonical serialization of one recipe block. Parsing the result yields a
/// field-equivalent `RecipeDoc`; serializing a parsed canonical file is
/// byte-equal modulo trailing whitespace.
pub fn serialize_doc(doc: &RecipeDoc) -> String {
    let mut out = String::new();
    out.push_str("---\n");
    if let Some(id) = &doc.id {
        out.push_str(&format!("id: {}\n", yaml_scalar(id)));
    }
    out.push_str(&format!("title: {}\n", yaml_scalar(&doc.title)));
    out.push_str(&format!("trigger: {}\n", yaml_scalar(&doc.trigger)));
    out.push_str(&format!("category: {}\n", yaml_scalar(&doc.category)));
    out.push_str(&format!("language: {}\n", yaml_scalar(&doc.language)));
    out.push_str(&format!("summary_cn: {}\n", yaml_scalar(&doc.summary_cn)));
    out.push_str(&format!("summary_en: {}\n", yaml_scalar(&doc.summary_en)));
    out.push_str(&format!(
        "headers: {}\n",
        serde_json::to_string(&doc.headers).unwrap_or_else(|_| "[]".to_string())
    ));
    if let Some(guide) = &doc.usage_guide_cn {
        out.push_str(&format!("usageGuide_cn: {}\n", yaml_scalar(guide)));
    }
    if let Some(guide) = &doc.usage_guide_en {
        out.push_str(&format!("usageGuide_en: {}\n", yaml_scalar(guide)));
    }
    if let Some(knowledge_type) = &doc.knowledge_type {
        out.push_str(&format!("knowledgeType: {}\n", yaml_scalar(knowledge_type)));
    }
    if let Some(kind) = &doc.kind {
        out.push_str(&format!("kind: {}\n", yaml_scalar(kind)));
    }
    if let Some(complexity) = &doc.complexity {
        out.push_str(&format!("complexity: {}\n", yaml_scalar(complexity)));
    }
    if let Some(scope) = &doc.scope {
        out.push_str(&format!("scope: {}\n", yaml_scalar(scope)));
    }
    out.push_str("---\n");
    if let Some((fence_language, code)) = &doc.code {
        out.push('\n');
        out.push_str(SNIPPET_HEADING);
        out.push_str("\n\n");
        out.push_str(&format!("```{}\n{}\n```\n", fence_language, code));
    }
    if let Some(guide) = &doc.guide_markdown {
        out.push('\n');
        out.push_str(GUIDE_HEADING);
        out.push_str("\n\n");
        out.push_str(guide);
        out.push('\n');
    }
    out
}

pub fn serialize_document(docs: &[RecipeDoc]) -> String {
    docs.iter()
        .map(serialize_doc)
        .collect::<Vec<_>>()
        .join("\n")
}

// --- Validation ---

fn header_is_valid(header: &str) -> bool {
    let objc = Regex::new(r"^#import\s+<.+>$").expect("static pattern");
    let swift = Regex::new(r"^import\s+\w+").expect("static pattern");
    objc.is_match(header) || swift.is_match(header)
}

/// Validate one parsed block; issues are collected, not raised.
pub fn validate_doc(doc: &RecipeDoc, file: &str) -> Vec<SyncViolation> {
    let mut issues = Vec::new();
    let mut push = |field: &str, message: String| {
        issues.push(SyncViolation {
            file: file.to_string(),
            title: doc.title.clone(),
            field: field.to_string(),
            message,
        });
    };

    if doc.title.trim().is_empty() {
        push("title", "title is required".to_string());
    }
    if !doc.trigger.starts_with('@') {
        push(
            "trigger",
            format!("trigger '{}' must start with '@'", doc.trigger),
        );
    }
    if !CATEGORIES.contains(&doc.category.as_str()) {
        push(
            "category",
            format!(
                "category '{}' not in {}",
                doc.category,
                CATEGORIES.join("|")
            ),
        );
    }
    if !LANGUAGES.contains(&doc.language.as_str()) {
        push(
            "language",
            format!("language '{}' not in {}", doc.language, LANGUAGES.join("|")),
        );
    }
    for header in &doc.headers {
        if !header_is_valid(header) {
            push("headers", format!("invalid import statement '{}'", header));
        }
    }
    if let Some((_, code)) = &doc.code {
        if code.trim().is_empty() {
            push("code", "snippet code block is empty".to_string());
        }
    }
    // Intro-only blocks (no snippet heading) are exempt from the code rule.
    issues
}

// --- Entity mapping ---

/// Stable id derived from the source file and title, used when the front
/// matter carries no explicit id. Deterministic across runs so repeated
/// syncs hit the same row.
pub fn stable_recipe_id(source_file: &str, title: &str) -> String {
    let digest = Sha256::digest(format!("{}\n{}", source_file, title).as_bytes());
    let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", recipes::RECIPE_ID_PREFIX, hex)
}

fn stable_candidate_id(source_file: &str, title: &str) -> String {
    let digest = Sha256::digest(format!("{}\n{}", source_file, title).as_bytes());
    let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", candidates::CANDIDATE_ID_PREFIX, hex)
}

/// Build the recipe entity a parsed block normalizes to.
pub fn doc_to_recipe(doc: &RecipeDoc, source_file: &str) -> Result<Recipe, EngineError> {
    let knowledge_type = doc
        .knowledge_type
        .clone()
        .unwrap_or_else(|| "code-pattern".to_string());
    let kind = recipes::kind_for_knowledge_type(&knowledge_type).ok_or_else(|| {
        EngineError::Validation(format!("unknown knowledge type '{}'", knowledge_type))
    })?;
    if let Some(explicit) = &doc.kind {
        if explicit != kind {
            return Err(EngineError::Validation(format!(
                "kind '{}' disagrees with knowledge type '{}'",
                explicit, knowledge_type
            )));
        }
    }

    let mut content = RecipeContent::default();
    if let Some((_, code)) = &doc.code {
        content.pattern = code.clone();
    }
    if let Some(guide) = &doc.guide_markdown {
        content.markdown = guide.clone();
    }
    if !doc.headers.is_empty() {
        content.extra.insert(
            "headers".to_string(),
            JsonValue::Array(
                doc.headers
                    .iter()
                    .map(|h| JsonValue::String(h.clone()))
                    .collect(),
            ),
        );
    }

    let id = doc
        .id
        .clone()
        .unwrap_or_else(|| stable_recipe_id(source_file, &doc.title));

    let now = time::now_epoch_z();
    let mut recipe = Recipe {
        id,
        title: doc.title.clone(),
        description: String::new(),
        language: doc.language.clone(),
        category: doc.category.clone(),
        kind: kind.to_string(),
        knowledge_type,
        complexity: doc
            .complexity
            .clone()
            .unwrap_or_else(|| "intermediate".to_string()),
        scope: doc.scope.clone().unwrap_or_else(|| "project".to_string()),
        summary_cn: doc.summary_cn.clone(),
        summary_en: doc.summary_en.clone(),
        usage_guide_cn: doc.usage_guide_cn.clone().unwrap_or_default(),
        usage_guide_en: doc.usage_guide_en.clone().unwrap_or_default(),
        trigger: doc.trigger.clone(),
        status: "draft".to_string(),
        content,
        relations: Default::default(),
        constraints: Default::default(),
        dimensions: Default::default(),
        tags: Vec::new(),
        quality: Default::default(),
        statistics: Default::default(),
        publication: Default::default(),
        deprecation: None,
        status_history: Vec::new(),
        source_candidate_id: None,
        source_file: Some(source_file.to_string()),
        created_at: now.clone(),
        updated_at: now,
    };
    if recipe.has_substance() {
        recipe.status = "active".to_string();
    }
    Ok(recipe)
}

/// Rebuild the canonical block for a recipe row (used when materializing a
/// gateway-created recipe into the corpus).
pub fn recipe_to_doc(recipe: &Recipe) -> RecipeDoc {
    let headers = recipe
        .content
        .extra
        .get("headers")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    RecipeDoc {
        id: Some(recipe.id.clone()),
        title: recipe.title.clone(),
        trigger: recipe.trigger.clone(),
        category: recipe.category.clone(),
        language: recipe.language.clone(),
        summary_cn: recipe.summary_cn.clone(),
        summary_en: recipe.summary_en.clone(),
        headers,
        usage_guide_cn: if recipe.usage_guide_cn.is_empty() {
            None
        } else {
            Some(recipe.usage_guide_cn.clone())
        },
        usage_guide_en: if recipe.usage_guide_en.is_empty() {
            None
        } else {
            Some(recipe.usage_guide_en.clone())
        },
        knowledge_type: Some(recipe.knowledge_type.clone()),
        kind: Some(recipe.kind.clone()),
        complexity: Some(recipe.complexity.clone()),
        scope: Some(recipe.scope.clone()),
        code: if recipe.content.pattern.is_empty() {
            None
        } else {
            Some((recipe.language.clone(), recipe.content.pattern.clone()))
        },
        guide_markdown: if recipe.content.markdown.is_empty() {
            None
        } else {
            Some(recipe.content.markdown.clone())
        },
    }
}

/// Write a recipe's markdown file into the corpus (guarded, atomic rename).
pub fn write_recipe_file(store: &Store, recipe: &Recipe) -> Result<String, EngineError> {
    let file_name = recipe
        .source_file
        .clone()
        .unwrap_or_else(|| format!("recipes/{}.md", recipe.id));
    let path = store.knowledge_dir().join(&file_name);
    store.assert_write_safe(&path)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(EngineError::Io)?;
    }
    let body = serialize_doc(&recipe_to_doc(recipe));
    let tmp = path.with_extension("md.tmp");
    fs::write(&tmp, body).map_err(EngineError::Io)?;
    fs::rename(&tmp, &path).map_err(EngineError::Io)?;
    Ok(file_name)
}

// --- Sync run ---

fn markdown_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, EngineError> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir).map_err(EngineError::Io)? {
        let entry = entry.map_err(EngineError::Io)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("md") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn relative_source(store: &Store, path: &Path) -> String {
    path.strip_prefix(store.knowledge_dir())
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|_| path.to_string_lossy().to_string())
}

/// True when the synced fields of `incoming` differ from `existing`.
fn recipe_changed(existing: &Recipe, incoming: &Recipe) -> bool {
    existing.title != incoming.title
        || existing.trigger != incoming.trigger
        || existing.category != incoming.category
        || existing.language != incoming.language
        || existing.knowledge_type != incoming.knowledge_type
        || existing.complexity != incoming.complexity
        || existing.scope != incoming.scope
        || existing.summary_cn != incoming.summary_cn
        || existing.summary_en != incoming.summary_en
        || existing.usage_guide_cn != incoming.usage_guide_cn
        || existing.usage_guide_en != incoming.usage_guide_en
        || existing.content.pattern != incoming.content.pattern
        || existing.content.markdown != incoming.content.markdown
        || existing.content.extra.get("headers") != incoming.content.extra.get("headers")
        || existing.status == "deprecated"
}

/// Synchronize the markdown corpus into the database.
pub fn sync(store: &Store, conn: &Connection, mode: SyncMode) -> Result<SyncReport, EngineError> {
    let mut report = SyncReport::default();
    let mut seen_files: BTreeSet<String> = BTreeSet::new();

    for path in markdown_files(&store.recipes_dir())? {
        let source_file = relative_source(store, &path);
        let content = fs::read_to_string(&path).map_err(EngineError::Io)?;
        let docs = match parse_document(&content) {
            Ok(docs) => docs,
            Err(err) => {
                report.violations.push(SyncViolation {
                    file: source_file.clone(),
                    title: String::new(),
                    field: "format".to_string(),
                    message: err.to_string(),
                });
                continue;
            }
        };
        seen_files.insert(source_file.clone());

        for doc in docs {
            let issues = validate_doc(&doc, &source_file);
            if !issues.is_empty() {
                report.violations.extend(issues);
                continue;
            }
            let incoming = match doc_to_recipe(&doc, &source_file) {
                Ok(recipe) => recipe,
                Err(err) => {
                    report.violations.push(SyncViolation {
                        file: source_file.clone(),
                        title: doc.title.clone(),
                        field: "mapping".to_string(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            match recipes::get(conn, &incoming.id) {
                Ok(existing) => {
                    if recipe_changed(&existing, &incoming) {
                        // Preserve row-only state the corpus does not carry.
                        let mut merged = incoming;
                        merged.created_at = existing.created_at.clone();
                        merged.statistics = existing.statistics.clone();
                        merged.quality = existing.quality.clone();
                        merged.relations = existing.relations.clone();
                        merged.constraints = existing.constraints.clone();
                        merged.source_candidate_id = existing.source_candidate_id.clone();
                        recipes::upsert(conn, &merged)?;
                        report.updated += 1;
                    }
                }
                Err(EngineError::NotFound(_)) => {
                    recipes::upsert(conn, &incoming)?;
                    report.created += 1;
                }
                Err(err) => return Err(err),
            }
            report.synced += 1;
        }
    }

    // Candidate folder syncs the same way into the candidate table.
    for path in markdown_files(&store.candidates_dir())? {
        let source_file = relative_source(store, &path);
        let content = fs::read_to_string(&path).map_err(EngineError::Io)?;
        let docs = match parse_document(&content) {
            Ok(docs) => docs,
            Err(err) => {
                report.violations.push(SyncViolation {
                    file: source_file.clone(),
                    title: String::new(),
                    field: "format".to_string(),
                    message: err.to_string(),
                });
                continue;
            }
        };
        for doc in docs {
            let Some((_, code)) = &doc.code else {
                report.violations.push(SyncViolation {
                    file: source_file.clone(),
                    title: doc.title.clone(),
                    field: "code".to_string(),
                    message: "candidate file needs a code block".to_string(),
                });
                continue;
            };
            let id = stable_candidate_id(&source_file, &doc.title);
            if candidates::get(conn, &id).is_ok() {
                report.synced += 1;
                continue;
            }
            let mut candidate = Candidate::create(candidates::NewCandidate {
                code,
                language: &doc.language,
                category: &doc.category,
                source: "bootstrap-scan",
                reasoning: serde_json::json!({"title": doc.title, "file": source_file}),
                created_by: "sync",
                metadata: serde_json::json!({"title": doc.title}),
            })?;
            candidate.id = id;
            candidates::insert(conn, &candidate)?;
            report.created += 1;
            report.synced += 1;
        }
    }

    // Orphan detection: rows whose file vanished are deprecated, never
    // hard-deleted.
    for recipe in recipes::list_all(conn)? {
        let Some(source_file) = &recipe.source_file else {
            continue;
        };
        if seen_files.contains(source_file) || recipe.status == "deprecated" {
            continue;
        }
        if !store.knowledge_dir().join(source_file).exists() {
            let mut orphan = recipe.clone();
            orphan.status = "deprecated".to_string();
            orphan.deprecation = Some(Deprecation {
                reason: "orphaned".to_string(),
                at: time::now_epoch_z(),
            });
            orphan.updated_at = time::now_epoch_z();
            recipes::upsert(conn, &orphan)?;
            report.orphaned.push(orphan.id);
        }
    }

    if mode == SyncMode::Strict && !report.violations.is_empty() {
        return Err(EngineError::Validation(format!(
            "sync found {} violation(s) in strict mode",
            report.violations.len()
        )));
    }
    Ok(report)
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "sync", about = "Synchronize the markdown corpus with the store database")]
pub struct SyncCli {
    #[clap(subcommand)]
    pub command: SyncCommand,
}

#[derive(Subcommand, Debug)]
pub enum SyncCommand {
    /// Run a sync pass
    Run {
        /// First-time import: skip blocks with violations instead of failing
        #[clap(long)]
        skip_violations: bool,
    },
}

pub fn run_sync_cli(store: &Store, cli: SyncCli) -> Result<(), EngineError> {
    match cli.command {
        SyncCommand::Run { skip_violations } => {
            let conn = crate::core::db::open_store_db(store)?;
            let mode = if skip_violations {
                SyncMode::SkipViolations
            } else {
                SyncMode::Strict
            };
            let report = sync(store, &conn, mode)?;
            println!(
                "sync: synced={} created={} updated={} orphaned={} violations={}",
                report.synced,
                report.created,
                report.updated,
                report.orphaned.len(),
                report.violations.len()
            );
            for violation in &report.violations {
                println!(
                    "  violation: {} [{}] {}",
                    violation.file, violation.field, violation.message
                );
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "sync",
        "version": "1.0.0",
        "description": "Bidirectional markdown ↔ database synchronization with orphan handling",
        "commands": [
            { "name": "run", "parameters": ["skip_violations"] }
        ],
        "storage": ["AutoSnippet/recipes/*.md", "AutoSnippet/candidates/*.md"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"---
title: Singleton
trigger: "@singleton"
category: Utility
language: swift
summary_cn: 单例模式
summary_en: Shared instance pattern
headers: ["import Foundation"]
knowledgeType: code-pattern
---

## Snippet / Code Reference

```swift
final class Shared {
    static let instance = Shared()
}
```

## AI Context / Usage Guide

Use for process-wide services. Avoid for request-scoped state.
"#;

    fn test_store() -> (tempfile::TempDir, Store) {
        let tmp = tempdir().expect("tempdir");
        let store = Store::open(tmp.path()).expect("store");
        std::fs::create_dir_all(store.recipes_dir()).expect("recipes dir");
        (tmp, store)
    }

    #[test]
    fn test_parse_extracts_all_sections() {
        let docs = parse_document(SAMPLE).expect("parse");
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.title, "Singleton");
        assert_eq!(doc.trigger, "@singleton");
        assert_eq!(doc.headers, vec!["import Foundation"]);
        let (fence, code) = doc.code.as_ref().expect("code block");
        assert_eq!(fence, "swift");
        assert!(code.contains("static let instance"));
        assert!(doc.guide_markdown.as_ref().expect("guide").contains("process-wide"));
    }

    #[test]
    fn test_headers_accept_yaml_block_form() {
        let content = "---\ntitle: T\ntrigger: \"@t\"\ncategory: Utility\nlanguage: swift\nsummary_cn: a\nsummary_en: b\nheaders:\n  - import Foundation\n  - \"#import <UIKit/UIKit.h>\"\n---\n";
        let docs = parse_document(content).expect("parse");
        assert_eq!(
            docs[0].headers,
            vec!["import Foundation", "#import <UIKit/UIKit.h>"]
        );
        // Canonical emission is the one-line JSON array.
        let serialized = serialize_doc(&docs[0]);
        assert!(serialized.contains(r#"headers: ["import Foundation","#));
    }

    #[test]
    fn test_round_trip_is_field_equivalent_and_byte_stable() {
        let docs = parse_document(SAMPLE).expect("parse");
        let serialized = serialize_document(&docs);
        let reparsed = parse_document(&serialized).expect("reparse");
        assert_eq!(docs, reparsed);
        // A canonical file survives a second cycle byte-for-byte.
        assert_eq!(serialize_document(&reparsed), serialized);
    }

    #[test]
    fn test_multiple_recipes_in_one_file() {
        let two = format!("{}\n{}", SAMPLE, SAMPLE.replace("Singleton", "Observer"));
        let docs = parse_document(&two).expect("parse");
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].title, "Observer");
    }

    #[test]
    fn test_validation_catches_bad_fields() {
        let mut doc = parse_document(SAMPLE).expect("parse").remove(0);
        doc.trigger = "singleton".to_string();
        doc.category = "Gadgets".to_string();
        doc.language = "kotlin".to_string();
        doc.headers = vec!["include <stdio.h>".to_string()];
        let issues = validate_doc(&doc, "recipes/x.md");
        let fields: Vec<&str> = issues.iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"trigger"));
        assert!(fields.contains(&"category"));
        assert!(fields.contains(&"language"));
        assert!(fields.contains(&"headers"));
    }

    #[test]
    fn test_intro_only_block_passes_without_code() {
        let content = "---\ntitle: Guide\ntrigger: \"@guide\"\ncategory: Tool\nlanguage: markdown\nsummary_cn: a\nsummary_en: b\nheaders: []\n---\n\n## AI Context / Usage Guide\n\nJust prose.\n";
        let docs = parse_document(content).expect("parse");
        assert!(docs[0].intro_only());
        assert!(validate_doc(&docs[0], "recipes/guide.md").is_empty());
    }

    #[test]
    fn test_sync_creates_then_is_idempotent() {
        let (_tmp, store) = test_store();
        std::fs::write(store.recipes_dir().join("singleton.md"), SAMPLE).expect("write");
        let conn = db::open_store_db(&store).expect("db");

        let first = sync(&store, &conn, SyncMode::Strict).expect("first sync");
        assert_eq!(first.created, 1);
        assert_eq!(first.updated, 0);
        assert_eq!(first.synced, 1);

        let second = sync(&store, &conn, SyncMode::Strict).expect("second sync");
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert!(second.orphaned.is_empty());
    }

    #[test]
    fn test_sync_stable_id_is_reused_on_edit() {
        let (_tmp, store) = test_store();
        let path = store.recipes_dir().join("singleton.md");
        std::fs::write(&path, SAMPLE).expect("write");
        let conn = db::open_store_db(&store).expect("db");
        sync(&store, &conn, SyncMode::Strict).expect("sync");
        let before = recipes::list_all(&conn).expect("rows");
        assert_eq!(before.len(), 1);

        std::fs::write(&path, SAMPLE.replace("Shared instance", "One instance")).expect("edit");
        let report = sync(&store, &conn, SyncMode::Strict).expect("resync");
        assert_eq!(report.updated, 1);
        let after = recipes::list_all(&conn).expect("rows");
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, before[0].id);
        assert_eq!(after[0].summary_en, "One instance pattern");
    }

    #[test]
    fn test_orphaned_row_is_deprecated_not_deleted() {
        let (_tmp, store) = test_store();
        let path = store.recipes_dir().join("singleton.md");
        std::fs::write(&path, SAMPLE).expect("write");
        let conn = db::open_store_db(&store).expect("db");
        sync(&store, &conn, SyncMode::Strict).expect("sync");

        std::fs::remove_file(&path).expect("delete file");
        let report = sync(&store, &conn, SyncMode::Strict).expect("resync");
        assert_eq!(report.orphaned.len(), 1);

        let rows = recipes::list_all(&conn).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "deprecated");
        assert_eq!(
            rows[0].deprecation.as_ref().expect("deprecation").reason,
            "orphaned"
        );
    }

    #[test]
    fn test_strict_mode_fails_on_violations_skip_mode_continues() {
        let (_tmp, store) = test_store();
        let bad = SAMPLE.replace("\"@singleton\"", "singleton");
        std::fs::write(store.recipes_dir().join("bad.md"), &bad).expect("write");
        let conn = db::open_store_db(&store).expect("db");

        let err = sync(&store, &conn, SyncMode::Strict).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let report = sync(&store, &conn, SyncMode::SkipViolations).expect("skip mode");
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.synced, 0);
    }

    #[test]
    fn test_candidate_folder_syncs_into_candidate_table() {
        let (_tmp, store) = test_store();
        std::fs::create_dir_all(store.candidates_dir()).expect("candidates dir");
        std::fs::write(store.candidates_dir().join("scan.md"), SAMPLE).expect("write");
        let conn = db::open_store_db(&store).expect("db");

        let report = sync(&store, &conn, SyncMode::Strict).expect("sync");
        assert_eq!(report.created, 1);
        let pending = candidates::find_by_status(&conn, "pending").expect("pending");
        assert_eq!(pending.len(), 1);
        assert!(pending[0].code.contains("static let instance"));
        assert_eq!(pending[0].source, "bootstrap-scan");
    }

    #[test]
    fn test_write_recipe_file_round_trips_through_sync() {
        let (_tmp, store) = test_store();
        let conn = db::open_store_db(&store).expect("db");
        let docs = parse_document(SAMPLE).expect("parse");
        let recipe = doc_to_recipe(&docs[0], "recipes/out.md").expect("entity");
        let file = write_recipe_file(&store, &recipe).expect("write");
        assert_eq!(file, "recipes/out.md");

        let report = sync(&store, &conn, SyncMode::Strict).expect("sync");
        assert_eq!(report.created, 1);
        let rows = recipes::list_all(&conn).expect("rows");
        assert_eq!(rows[0].id, recipe.id);
    }
}
