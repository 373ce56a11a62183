//! Recipe subsystem: the curated unit of project knowledge.
//!
//! A recipe carries pattern text, rationale, constraints, typed relations,
//! bilingual summaries, and quality/usage metrics. Rows live in the store
//! database as a cache of the markdown corpus; the sync service owns the
//! file ↔ row mapping.

use crate::core::error::EngineError;
use crate::core::repo::{self, Page};
use crate::core::time;
use clap::{Parser, Subcommand};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

pub const RECIPE_ID_PREFIX: &str = "rcp";

pub const KINDS: &[&str] = &["rule", "pattern", "fact"];

pub const KNOWLEDGE_TYPES: &[&str] = &[
    "code-standard",
    "code-style",
    "best-practice",
    "boundary-constraint",
    "code-pattern",
    "architecture",
    "solution",
    "code-relation",
    "inheritance",
    "call-chain",
    "data-flow",
    "module-dependency",
];

pub const COMPLEXITIES: &[&str] = &["beginner", "intermediate", "advanced"];

pub const SCOPES: &[&str] = &["universal", "project", "target-specific"];

/// Relation groups embedded in a recipe, in canonical order.
pub const RELATION_GROUPS: &[&str] = &[
    "inherits",
    "implements",
    "calls",
    "dependsOn",
    "dataFlow",
    "conflicts",
    "extends",
    "related",
];

/// Declared edges of the recipe status machine. Re-activation from
/// `deprecated` is not an edge; a new recipe must be created instead.
const STATUS_EDGES: &[(&str, &str)] = &[
    ("draft", "active"),
    ("active", "deprecated"),
    ("draft", "deprecated"),
];

/// Derive the coarse kind from the fine knowledge type.
pub fn kind_for_knowledge_type(knowledge_type: &str) -> Option<&'static str> {
    match knowledge_type {
        "code-standard" | "code-style" | "best-practice" | "boundary-constraint" => Some("rule"),
        "code-pattern" | "architecture" | "solution" => Some("pattern"),
        "code-relation" | "inheritance" | "call-chain" | "data-flow" | "module-dependency" => {
            Some("fact")
        }
        _ => None,
    }
}

/// One code-change record inside recipe content.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CodeChange {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Verification {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub expected: String,
    #[serde(default, rename = "testCode")]
    pub test_code: String,
}

/// Structured recipe content. Unknown keys survive a round trip through
/// the flattened `extra` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecipeContent {
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default, rename = "codeChanges")]
    pub code_changes: Vec<CodeChange>,
    #[serde(default)]
    pub verification: Verification,
    #[serde(default)]
    pub markdown: String,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// A typed relation entry pointing at another knowledge unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationEntry {
    pub target: String,
    #[serde(default)]
    pub description: String,
}

/// Inline guard attached to a rule recipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardRule {
    pub pattern: String,
    #[serde(default = "default_guard_severity")]
    pub severity: String,
    #[serde(default)]
    pub message: String,
}

fn default_guard_severity() -> String {
    "warning".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecipeConstraints {
    #[serde(default)]
    pub boundaries: Vec<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default, rename = "sideEffects")]
    pub side_effects: Vec<String>,
    #[serde(default)]
    pub guards: Vec<GuardRule>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Quality metrics, each in [0, 1].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityMetrics {
    #[serde(default)]
    pub completeness: f64,
    #[serde(default)]
    pub adaptation: f64,
    #[serde(default)]
    pub clarity: f64,
    #[serde(default)]
    pub overall: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecipeStatistics {
    #[serde(default)]
    pub adoption_count: u64,
    #[serde(default)]
    pub application_count: u64,
    #[serde(default)]
    pub guard_hit_count: u64,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub feedback_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deprecation {
    pub reason: String,
    pub at: String,
}

/// The curated unit of knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub language: String,
    #[serde(default)]
    pub category: String,
    pub kind: String,
    pub knowledge_type: String,
    #[serde(default = "default_complexity")]
    pub complexity: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub summary_cn: String,
    #[serde(default)]
    pub summary_en: String,
    #[serde(default)]
    pub usage_guide_cn: String,
    #[serde(default)]
    pub usage_guide_en: String,
    #[serde(default)]
    pub trigger: String,
    pub status: String,
    #[serde(default)]
    pub content: RecipeContent,
    /// Relation groups in canonical order (`BTreeMap` keeps serialization
    /// stable for the round-trip property).
    #[serde(default)]
    pub relations: BTreeMap<String, Vec<RelationEntry>>,
    #[serde(default)]
    pub constraints: RecipeConstraints,
    #[serde(default)]
    pub dimensions: Map<String, JsonValue>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub quality: QualityMetrics,
    #[serde(default)]
    pub statistics: RecipeStatistics,
    #[serde(default)]
    pub publication: Map<String, JsonValue>,
    #[serde(default)]
    pub deprecation: Option<Deprecation>,
    #[serde(default)]
    pub status_history: Vec<crate::plugins::candidates::StatusChange>,
    #[serde(default)]
    pub source_candidate_id: Option<String>,
    #[serde(default)]
    pub source_file: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn default_complexity() -> String {
    "intermediate".to_string()
}

fn default_scope() -> String {
    "project".to_string()
}

/// Parameters for constructing a draft recipe.
#[derive(Debug, Clone)]
pub struct NewRecipe<'a> {
    pub title: &'a str,
    pub language: &'a str,
    pub category: &'a str,
    pub knowledge_type: &'a str,
    /// Optional explicit kind; must agree with the derived one when given.
    pub kind: Option<&'a str>,
    pub trigger: &'a str,
    pub content: RecipeContent,
    pub source_candidate_id: Option<&'a str>,
    pub source_file: Option<&'a str>,
}

impl Recipe {
    pub fn create(args: NewRecipe<'_>) -> Result<Recipe, EngineError> {
        if args.title.trim().is_empty() {
            return Err(EngineError::Validation(
                "recipe title must not be empty".to_string(),
            ));
        }
        if !KNOWLEDGE_TYPES.contains(&args.knowledge_type) {
            return Err(EngineError::Validation(format!(
                "unknown knowledge type '{}'",
                args.knowledge_type
            )));
        }
        let derived = kind_for_knowledge_type(args.knowledge_type)
            .expect("every listed knowledge type maps to a kind");
        if let Some(explicit) = args.kind {
            if explicit != derived {
                return Err(EngineError::Validation(format!(
                    "kind '{}' disagrees with knowledge type '{}' (expected '{}')",
                    explicit, args.knowledge_type, derived
                )));
            }
        }
        if !args.trigger.is_empty() && !args.trigger.starts_with('@') {
            return Err(EngineError::Validation(format!(
                "trigger '{}' must start with '@'",
                args.trigger
            )));
        }
        let now = time::now_epoch_z();
        Ok(Recipe {
            id: crate::core::paths::new_id(RECIPE_ID_PREFIX),
            title: args.title.trim().to_string(),
            description: String::new(),
            language: args.language.trim().to_lowercase(),
            category: args.category.to_string(),
            kind: derived.to_string(),
            knowledge_type: args.knowledge_type.to_string(),
            complexity: default_complexity(),
            scope: default_scope(),
            summary_cn: String::new(),
            summary_en: String::new(),
            usage_guide_cn: String::new(),
            usage_guide_en: String::new(),
            trigger: args.trigger.to_string(),
            status: "draft".to_string(),
            content: args.content,
            relations: BTreeMap::new(),
            constraints: RecipeConstraints::default(),
            dimensions: Map::new(),
            tags: Vec::new(),
            quality: QualityMetrics::default(),
            statistics: RecipeStatistics::default(),
            publication: Map::new(),
            deprecation: None,
            status_history: Vec::new(),
            source_candidate_id: args.source_candidate_id.map(|s| s.to_string()),
            source_file: args.source_file.map(|s| s.to_string()),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// True when the content carries any substantive body.
    pub fn has_substance(&self) -> bool {
        !self.content.pattern.trim().is_empty()
            || !self.content.rationale.trim().is_empty()
            || !self.content.steps.is_empty()
            || !self.content.markdown.trim().is_empty()
    }

    /// Structural invariants independent of filesystem state.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.status == "active" && (self.title.trim().is_empty() || !self.has_substance()) {
            return Err(EngineError::Validation(format!(
                "active recipe {} needs a title and one of pattern/rationale/steps/markdown",
                self.id
            )));
        }
        if self.status == "deprecated" && self.deprecation.is_none() {
            return Err(EngineError::Validation(format!(
                "deprecated recipe {} is missing its deprecation record",
                self.id
            )));
        }
        if kind_for_knowledge_type(&self.knowledge_type) != Some(self.kind.as_str()) {
            return Err(EngineError::Validation(format!(
                "recipe {} kind '{}' disagrees with knowledge type '{}'",
                self.id, self.kind, self.knowledge_type
            )));
        }
        for metric in [
            self.quality.completeness,
            self.quality.adaptation,
            self.quality.clarity,
            self.quality.overall,
        ] {
            if !(0.0..=1.0).contains(&metric) {
                return Err(EngineError::Validation(format!(
                    "recipe {} quality metric {} outside [0, 1]",
                    self.id, metric
                )));
            }
        }
        Ok(())
    }

    pub fn transition_allowed(from: &str, to: &str) -> bool {
        STATUS_EDGES.iter().any(|(f, t)| *f == from && *t == to)
    }

    /// Apply a status transition, appending history. Deprecation requires a
    /// reason, recorded in the deprecation field.
    pub fn transition(&mut self, to: &str, actor: &str, reason: &str) -> Result<(), EngineError> {
        if !Self::transition_allowed(&self.status, to) {
            return Err(EngineError::Conflict(format!(
                "InvalidStateTransition: recipe {} cannot move {} -> {}",
                self.id, self.status, to
            )));
        }
        let now = time::now_epoch_z();
        if to == "deprecated" {
            self.deprecation = Some(Deprecation {
                reason: if reason.is_empty() {
                    "unspecified".to_string()
                } else {
                    reason.to_string()
                },
                at: now.clone(),
            });
        }
        if to == "active" {
            // Activation enforces the completeness invariant up front.
            let mut probe = self.clone();
            probe.status = "active".to_string();
            probe.validate()?;
        }
        self.status_history
            .push(crate::plugins::candidates::StatusChange {
                from: self.status.clone(),
                to: to.to_string(),
                actor: actor.to_string(),
                ts: now.clone(),
                reason: reason.to_string(),
            });
        self.status = to.to_string();
        self.updated_at = now;
        Ok(())
    }

    /// Every relation target mentioned anywhere in the relation groups.
    pub fn relation_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self
            .relations
            .values()
            .flatten()
            .map(|entry| entry.target.clone())
            .filter(|t| !t.trim().is_empty())
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }
}

// --- Repository ---

const SELECT_COLUMNS: &str = "id, title, description, language, category, kind, knowledge_type,
    complexity, scope, summary_cn, summary_en, usage_guide_cn, usage_guide_en, trigger, status,
    content_json, relations_json, constraints_json, dimensions_json, tags_json, quality_json,
    statistics_json, publication_json, deprecation_json, status_history_json,
    source_candidate_id, source_file, created_at, updated_at";

fn decode_json<T: serde::de::DeserializeOwned + Default>(
    raw: &str,
    what: &str,
    id: &str,
) -> Result<T, EngineError> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw)
        .map_err(|e| EngineError::Schema(format!("corrupt {} on recipe {}: {}", what, id, e)))
}

fn row_to_recipe(row: &rusqlite::Row<'_>) -> Result<Recipe, EngineError> {
    let id: String = row.get(0).map_err(EngineError::Storage)?;
    let content_raw: String = row.get(15).map_err(EngineError::Storage)?;
    let relations_raw: String = row.get(16).map_err(EngineError::Storage)?;
    let constraints_raw: String = row.get(17).map_err(EngineError::Storage)?;
    let dimensions_raw: String = row.get(18).map_err(EngineError::Storage)?;
    let tags_raw: String = row.get(19).map_err(EngineError::Storage)?;
    let quality_raw: String = row.get(20).map_err(EngineError::Storage)?;
    let statistics_raw: String = row.get(21).map_err(EngineError::Storage)?;
    let publication_raw: String = row.get(22).map_err(EngineError::Storage)?;
    let deprecation_raw: Option<String> = row.get(23).map_err(EngineError::Storage)?;
    let history_raw: String = row.get(24).map_err(EngineError::Storage)?;

    Ok(Recipe {
        id: id.clone(),
        title: row.get(1).map_err(EngineError::Storage)?,
        description: row.get(2).map_err(EngineError::Storage)?,
        language: row.get(3).map_err(EngineError::Storage)?,
        category: row.get(4).map_err(EngineError::Storage)?,
        kind: row.get(5).map_err(EngineError::Storage)?,
        knowledge_type: row.get(6).map_err(EngineError::Storage)?,
        complexity: row.get(7).map_err(EngineError::Storage)?,
        scope: row.get(8).map_err(EngineError::Storage)?,
        summary_cn: row.get(9).map_err(EngineError::Storage)?,
        summary_en: row.get(10).map_err(EngineError::Storage)?,
        usage_guide_cn: row.get(11).map_err(EngineError::Storage)?,
        usage_guide_en: row.get(12).map_err(EngineError::Storage)?,
        trigger: row.get(13).map_err(EngineError::Storage)?,
        status: row.get(14).map_err(EngineError::Storage)?,
        content: decode_json(&content_raw, "content_json", &id)?,
        relations: decode_json(&relations_raw, "relations_json", &id)?,
        constraints: decode_json(&constraints_raw, "constraints_json", &id)?,
        dimensions: decode_json(&dimensions_raw, "dimensions_json", &id)?,
        tags: decode_json(&tags_raw, "tags_json", &id)?,
        quality: decode_json(&quality_raw, "quality_json", &id)?,
        statistics: decode_json(&statistics_raw, "statistics_json", &id)?,
        publication: decode_json(&publication_raw, "publication_json", &id)?,
        deprecation: match deprecation_raw {
            Some(raw) if !raw.trim().is_empty() => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| EngineError::Schema(format!("corrupt deprecation on {}: {}", id, e)))?,
            ),
            _ => None,
        },
        status_history: decode_json(&history_raw, "status_history_json", &id)?,
        source_candidate_id: row.get(25).map_err(EngineError::Storage)?,
        source_file: row.get(26).map_err(EngineError::Storage)?,
        created_at: row.get(27).map_err(EngineError::Storage)?,
        updated_at: row.get(28).map_err(EngineError::Storage)?,
    })
}

fn encode<T: Serialize>(value: &T, what: &str) -> Result<String, EngineError> {
    serde_json::to_string(value).map_err(|e| EngineError::Schema(format!("{} encode: {}", what, e)))
}

pub fn upsert(conn: &Connection, recipe: &Recipe) -> Result<(), EngineError> {
    recipe.validate()?;
    conn.execute(
        "INSERT INTO recipes(id, title, description, language, category, kind, knowledge_type,
             complexity, scope, summary_cn, summary_en, usage_guide_cn, usage_guide_en, trigger,
             status, content_json, relations_json, constraints_json, dimensions_json, tags_json,
             quality_json, statistics_json, publication_json, deprecation_json,
             status_history_json, source_candidate_id, source_file, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
                ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)
         ON CONFLICT(id) DO UPDATE SET
             title = excluded.title, description = excluded.description,
             language = excluded.language, category = excluded.category,
             kind = excluded.kind, knowledge_type = excluded.knowledge_type,
             complexity = excluded.complexity, scope = excluded.scope,
             summary_cn = excluded.summary_cn, summary_en = excluded.summary_en,
             usage_guide_cn = excluded.usage_guide_cn, usage_guide_en = excluded.usage_guide_en,
             trigger = excluded.trigger, status = excluded.status,
             content_json = excluded.content_json, relations_json = excluded.relations_json,
             constraints_json = excluded.constraints_json,
             dimensions_json = excluded.dimensions_json, tags_json = excluded.tags_json,
             quality_json = excluded.quality_json, statistics_json = excluded.statistics_json,
             publication_json = excluded.publication_json,
             deprecation_json = excluded.deprecation_json,
             status_history_json = excluded.status_history_json,
             source_candidate_id = excluded.source_candidate_id,
             source_file = excluded.source_file, updated_at = excluded.updated_at",
        params![
            recipe.id,
            recipe.title,
            recipe.description,
            recipe.language,
            recipe.category,
            recipe.kind,
            recipe.knowledge_type,
            recipe.complexity,
            recipe.scope,
            recipe.summary_cn,
            recipe.summary_en,
            recipe.usage_guide_cn,
            recipe.usage_guide_en,
            recipe.trigger,
            recipe.status,
            encode(&recipe.content, "content_json")?,
            encode(&recipe.relations, "relations_json")?,
            encode(&recipe.constraints, "constraints_json")?,
            encode(&recipe.dimensions, "dimensions_json")?,
            encode(&recipe.tags, "tags_json")?,
            encode(&recipe.quality, "quality_json")?,
            encode(&recipe.statistics, "statistics_json")?,
            encode(&recipe.publication, "publication_json")?,
            recipe
                .deprecation
                .as_ref()
                .map(|d| encode(d, "deprecation_json"))
                .transpose()?,
            encode(&recipe.status_history, "status_history_json")?,
            recipe.source_candidate_id,
            recipe.source_file,
            recipe.created_at,
            recipe.updated_at,
        ],
    )
    .map_err(|e| EngineError::from_storage(e, &format!("recipe {}", recipe.id)))?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Recipe, EngineError> {
    let sql = format!("SELECT {} FROM recipes WHERE id = ?1", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let recipe = stmt
        .query_row([id], |row| {
            Ok(row_to_recipe(row))
        })
        .optional()?;
    match recipe {
        Some(result) => result,
        None => Err(EngineError::NotFound(format!("recipe {}", id))),
    }
}

pub fn delete(conn: &Connection, id: &str) -> Result<(), EngineError> {
    let changed = conn.execute("DELETE FROM recipes WHERE id = ?1", [id])?;
    if changed == 0 {
        return Err(EngineError::NotFound(format!("recipe {}", id)));
    }
    Ok(())
}

fn select_where(
    conn: &Connection,
    predicate: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Recipe>, EngineError> {
    let sql = format!(
        "SELECT {} FROM recipes WHERE {} ORDER BY created_at DESC, id",
        SELECT_COLUMNS, predicate
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(args)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_recipe(row)?);
    }
    Ok(out)
}

pub fn find_by_kind(
    conn: &Connection,
    kind: &str,
    status: Option<&str>,
) -> Result<Vec<Recipe>, EngineError> {
    match status {
        Some(s) => select_where(conn, "kind = ?1 AND status = ?2", &[&kind, &s]),
        None => select_where(conn, "kind = ?1", &[&kind]),
    }
}

pub fn find_by_knowledge_type(
    conn: &Connection,
    knowledge_type: &str,
) -> Result<Vec<Recipe>, EngineError> {
    select_where(conn, "knowledge_type = ?1", &[&knowledge_type])
}

pub fn find_by_scope(conn: &Connection, scope: &str) -> Result<Vec<Recipe>, EngineError> {
    select_where(conn, "scope = ?1", &[&scope])
}

pub fn find_by_category(conn: &Connection, category: &str) -> Result<Vec<Recipe>, EngineError> {
    select_where(conn, "category = ?1", &[&category])
}

pub fn find_by_language(conn: &Connection, language: &str) -> Result<Vec<Recipe>, EngineError> {
    select_where(conn, "language = ?1", &[&language])
}

pub fn find_by_source_file(
    conn: &Connection,
    source_file: &str,
) -> Result<Vec<Recipe>, EngineError> {
    select_where(conn, "source_file = ?1", &[&source_file])
}

pub fn list_all(conn: &Connection) -> Result<Vec<Recipe>, EngineError> {
    select_where(conn, "1 = 1", &[])
}

/// Seven-field LIKE search in a single query. An empty keyword returns an
/// empty set, never an error.
pub fn search(conn: &Connection, keyword: &str) -> Result<Vec<Recipe>, EngineError> {
    if keyword.trim().is_empty() {
        return Ok(Vec::new());
    }
    let pattern = repo::contains_pattern(keyword);
    select_where(
        conn,
        "(title LIKE ?1 ESCAPE '\\' OR category LIKE ?1 ESCAPE '\\'
          OR content_json LIKE ?1 ESCAPE '\\' OR constraints_json LIKE ?1 ESCAPE '\\'
          OR tags_json LIKE ?1 ESCAPE '\\' OR description LIKE ?1 ESCAPE '\\'
          OR trigger LIKE ?1 ESCAPE '\\')",
        &[&pattern],
    )
}

/// Active rule recipes whose constraints carry at least one guard.
pub fn find_with_guards(
    conn: &Connection,
    language: Option<&str>,
) -> Result<Vec<Recipe>, EngineError> {
    let rows = match language {
        Some(lang) => select_where(
            conn,
            "kind = 'rule' AND status = 'active' AND language = ?1",
            &[&lang],
        )?,
        None => select_where(conn, "kind = 'rule' AND status = 'active'", &[])?,
    };
    Ok(rows
        .into_iter()
        .filter(|r| !r.constraints.guards.is_empty())
        .collect())
}

/// Forward relations plus reverse references (recipes whose relations
/// mention this id), deduped and fetched in one `IN` query.
pub fn find_related(conn: &Connection, id: &str) -> Result<Vec<Recipe>, EngineError> {
    let recipe = get(conn, id)?;
    let mut target_ids = recipe.relation_targets();

    let pattern = repo::contains_pattern(id);
    let mut stmt = conn.prepare(
        "SELECT id FROM recipes WHERE id != ?1 AND relations_json LIKE ?2 ESCAPE '\\'",
    )?;
    let reverse = stmt.query_map(params![id, pattern], |row| row.get::<_, String>(0))?;
    for row in reverse {
        target_ids.push(row?);
    }
    target_ids.sort();
    target_ids.dedup();
    target_ids.retain(|t| t != id);

    if target_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = (1..=target_ids.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {} FROM recipes WHERE id IN ({}) ORDER BY created_at DESC, id",
        SELECT_COLUMNS, placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(target_ids.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_recipe(row)?);
    }
    Ok(out)
}

/// Active recipes scored by `0.5·quality + 0.3·adoption + 0.2·application`
/// with the usage terms saturating at 100.
pub fn recommendations(conn: &Connection, limit: usize) -> Result<Vec<Recipe>, EngineError> {
    let mut active = select_where(conn, "status = 'active'", &[])?;
    let score = |r: &Recipe| -> f64 {
        0.5 * r.quality.overall
            + 0.3 * (r.statistics.adoption_count as f64 / 100.0).min(1.0)
            + 0.2 * (r.statistics.application_count as f64 / 100.0).min(1.0)
    };
    active.sort_by(|a, b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    active.truncate(limit);
    Ok(active)
}

/// Paginated listing with optional status filter, newest first.
pub fn list(
    conn: &Connection,
    status: Option<&str>,
    page: u32,
    page_size: u32,
) -> Result<Page<Recipe>, EngineError> {
    let (where_clause, filter): (&str, Vec<String>) = match status {
        Some(s) => ("WHERE status = ?1", vec![s.to_string()]),
        None => ("", vec![]),
    };
    let total: u64 = {
        let sql = format!("SELECT COUNT(*) FROM recipes {}", where_clause);
        let mut stmt = conn.prepare(&sql)?;
        stmt.query_row(rusqlite::params_from_iter(filter.iter()), |r| {
            r.get::<_, i64>(0)
        })? as u64
    };
    let sql = format!(
        "SELECT {} FROM recipes {} ORDER BY created_at DESC, id LIMIT {} OFFSET {}",
        SELECT_COLUMNS,
        where_clause,
        page_size.max(1),
        Page::<Recipe>::offset(page, page_size)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(filter.iter()))?;
    let mut data = Vec::new();
    while let Some(row) = rows.next()? {
        data.push(row_to_recipe(row)?);
    }
    Ok(Page::new(data, page, page_size, total))
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "recipes", about = "Curated knowledge units")]
pub struct RecipesCli {
    #[clap(subcommand)]
    pub command: RecipesCommand,
}

#[derive(Subcommand, Debug)]
pub enum RecipesCommand {
    /// List recipes, optionally filtered by status
    List {
        #[clap(long)]
        status: Option<String>,
        #[clap(long, default_value = "1")]
        page: u32,
        #[clap(long, default_value = "20")]
        page_size: u32,
    },
    /// Show one recipe as JSON
    Show {
        #[clap(long)]
        id: String,
    },
    /// Keyword search over the recipe table
    Search {
        #[clap(long)]
        query: String,
    },
    /// Recipes related to the given id (forward and reverse relations)
    Related {
        #[clap(long)]
        id: String,
    },
    /// Top recommendations by quality and usage
    Recommend {
        #[clap(long, default_value = "10")]
        limit: usize,
    },
}

pub fn run_recipes_cli(
    store: &crate::core::store::Store,
    cli: RecipesCli,
) -> Result<(), EngineError> {
    let conn = crate::core::db::open_store_db(store)?;
    match cli.command {
        RecipesCommand::List {
            status,
            page,
            page_size,
        } => {
            let result = list(&conn, status.as_deref(), page, page_size)?;
            println!(
                "recipes: page {}/{} total {}",
                result.page,
                result.pages.max(1),
                result.total
            );
            for recipe in result.data {
                println!(
                    "  {}  {}  [{}]  {}",
                    recipe.id, recipe.status, recipe.kind, recipe.title
                );
            }
        }
        RecipesCommand::Show { id } => {
            let recipe = get(&conn, &id)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&recipe)
                    .map_err(|e| EngineError::Schema(e.to_string()))?
            );
        }
        RecipesCommand::Search { query } => {
            for recipe in search(&conn, &query)? {
                println!("  {}  {}  {}", recipe.id, recipe.trigger, recipe.title);
            }
        }
        RecipesCommand::Related { id } => {
            for recipe in find_related(&conn, &id)? {
                println!("  {}  {}", recipe.id, recipe.title);
            }
        }
        RecipesCommand::Recommend { limit } => {
            for recipe in recommendations(&conn, limit)? {
                println!(
                    "  {}  q={:.2}  {}",
                    recipe.id, recipe.quality.overall, recipe.title
                );
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "recipes",
        "version": "1.0.0",
        "description": "Curated knowledge units with relations, constraints, and quality metrics",
        "kinds": KINDS,
        "knowledge_types": KNOWLEDGE_TYPES,
        "relation_groups": RELATION_GROUPS,
        "complexities": COMPLEXITIES,
        "scopes": SCOPES,
        "statuses": ["draft", "active", "deprecated"],
        "commands": [
            { "name": "list", "parameters": ["status", "page", "page_size"] },
            { "name": "show", "parameters": ["id"] },
            { "name": "search", "parameters": ["query"] },
            { "name": "related", "parameters": ["id"] },
            { "name": "recommend", "parameters": ["limit"] }
        ],
        "storage": ["autosnippet.db#recipes"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db;
    use tempfile::tempdir;

    fn test_conn() -> (tempfile::TempDir, Connection) {
        let tmp = tempdir().expect("tempdir");
        let mut conn = db::db_connect(&tmp.path().join("engine.db")).expect("connect");
        crate::core::migration::run_migrations(&mut conn).expect("migrate");
        (tmp, conn)
    }

    fn sample(title: &str, knowledge_type: &str) -> Recipe {
        Recipe::create(NewRecipe {
            title,
            language: "swift",
            category: "Utility",
            knowledge_type,
            kind: None,
            trigger: "@sample",
            content: RecipeContent {
                pattern: "final class Shared { static let instance = Shared() }".to_string(),
                rationale: "one shared instance".to_string(),
                ..Default::default()
            },
            source_candidate_id: None,
            source_file: None,
        })
        .expect("recipe")
    }

    #[test]
    fn test_kind_mapping_covers_every_knowledge_type() {
        for knowledge_type in KNOWLEDGE_TYPES {
            let kind = kind_for_knowledge_type(knowledge_type).expect("mapped");
            assert!(KINDS.contains(&kind));
        }
        assert!(kind_for_knowledge_type("nonsense").is_none());
    }

    #[test]
    fn test_explicit_kind_must_agree() {
        let err = Recipe::create(NewRecipe {
            title: "X",
            language: "swift",
            category: "",
            knowledge_type: "code-pattern",
            kind: Some("rule"),
            trigger: "",
            content: RecipeContent::default(),
            source_candidate_id: None,
            source_file: None,
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_trigger_must_start_with_at() {
        let err = Recipe::create(NewRecipe {
            title: "X",
            language: "swift",
            category: "",
            knowledge_type: "code-pattern",
            kind: None,
            trigger: "singleton",
            content: RecipeContent::default(),
            source_candidate_id: None,
            source_file: None,
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_activation_requires_substance() {
        let mut empty = sample("Empty", "code-pattern");
        empty.content = RecipeContent::default();
        let err = empty.transition("active", "tester", "").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(empty.status, "draft");

        let mut full = sample("Full", "code-pattern");
        full.transition("active", "tester", "").expect("activate");
        assert_eq!(full.status, "active");
    }

    #[test]
    fn test_deprecation_sets_record_and_blocks_reactivation() {
        let mut recipe = sample("S", "code-pattern");
        recipe.transition("active", "tester", "").expect("activate");
        recipe
            .transition("deprecated", "tester", "superseded by rcp-2")
            .expect("deprecate");
        let deprecation = recipe.deprecation.as_ref().expect("deprecation set");
        assert_eq!(deprecation.reason, "superseded by rcp-2");
        assert!(recipe.transition("active", "tester", "").is_err());
        assert!(recipe.transition("draft", "tester", "").is_err());
    }

    #[test]
    fn test_draft_can_be_abandoned() {
        let mut recipe = sample("S", "code-pattern");
        recipe.transition("deprecated", "tester", "abandoned").expect("abandon");
        assert_eq!(recipe.status, "deprecated");
    }

    #[test]
    fn test_upsert_round_trip_preserves_unknown_content_keys() {
        let (_tmp, conn) = test_conn();
        let mut recipe = sample("Singleton pattern", "code-pattern");
        recipe
            .content
            .extra
            .insert("futureField".to_string(), serde_json::json!({"x": 1}));
        recipe.relations.insert(
            "dependsOn".to_string(),
            vec![RelationEntry {
                target: "rcp-base".to_string(),
                description: "requires base utilities".to_string(),
            }],
        );
        recipe.constraints.guards.push(GuardRule {
            pattern: "DispatchQueue.main.sync".to_string(),
            severity: "error".to_string(),
            message: "deadlock on main".to_string(),
        });
        upsert(&conn, &recipe).expect("upsert");

        let loaded = get(&conn, &recipe.id).expect("get");
        assert_eq!(loaded.content.extra["futureField"], serde_json::json!({"x": 1}));
        assert_eq!(loaded.relations["dependsOn"][0].target, "rcp-base");
        assert_eq!(loaded.constraints.guards[0].severity, "error");
        assert_eq!(loaded.title, "Singleton pattern");
    }

    #[test]
    fn test_upsert_twice_updates_in_place() {
        let (_tmp, conn) = test_conn();
        let mut recipe = sample("V1", "code-pattern");
        upsert(&conn, &recipe).expect("insert");
        recipe.title = "V2".to_string();
        upsert(&conn, &recipe).expect("update");
        let loaded = get(&conn, &recipe.id).expect("get");
        assert_eq!(loaded.title, "V2");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM recipes", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_search_covers_seven_fields() {
        let (_tmp, conn) = test_conn();
        let mut by_trigger = sample("A", "code-pattern");
        by_trigger.trigger = "@needle1".to_string();
        upsert(&conn, &by_trigger).expect("upsert");
        let mut by_tag = sample("B", "code-pattern");
        by_tag.tags = vec!["needle2".to_string()];
        upsert(&conn, &by_tag).expect("upsert");
        let mut by_constraint = sample("C", "code-pattern");
        by_constraint.constraints.boundaries = vec!["needle3 only".to_string()];
        upsert(&conn, &by_constraint).expect("upsert");

        assert_eq!(search(&conn, "needle1").expect("q1").len(), 1);
        assert_eq!(search(&conn, "needle2").expect("q2").len(), 1);
        assert_eq!(search(&conn, "needle3").expect("q3").len(), 1);
        assert!(search(&conn, "").expect("empty").is_empty());
    }

    #[test]
    fn test_find_with_guards_filters_in_process() {
        let (_tmp, conn) = test_conn();
        let mut with_guard = sample("Guarded", "code-standard");
        with_guard.constraints.guards.push(GuardRule {
            pattern: "forbidden".to_string(),
            severity: "error".to_string(),
            message: "do not".to_string(),
        });
        with_guard.transition("active", "t", "").expect("activate");
        upsert(&conn, &with_guard).expect("upsert");

        let mut without_guard = sample("Bare", "code-standard");
        without_guard.transition("active", "t", "").expect("activate");
        upsert(&conn, &without_guard).expect("upsert");

        let hits = find_with_guards(&conn, None).expect("guards");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, with_guard.id);
    }

    #[test]
    fn test_find_related_merges_forward_and_reverse() {
        let (_tmp, conn) = test_conn();
        let mut a = sample("A", "code-pattern");
        let b = sample("B", "code-pattern");
        let mut c = sample("C", "code-pattern");
        a.relations.insert(
            "dependsOn".to_string(),
            vec![RelationEntry {
                target: b.id.clone(),
                description: String::new(),
            }],
        );
        c.relations.insert(
            "related".to_string(),
            vec![RelationEntry {
                target: a.id.clone(),
                description: String::new(),
            }],
        );
        upsert(&conn, &a).expect("a");
        upsert(&conn, &b).expect("b");
        upsert(&conn, &c).expect("c");

        let related = find_related(&conn, &a.id).expect("related");
        let ids: Vec<&str> = related.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(related.len(), 2);
        assert!(ids.contains(&b.id.as_str()));
        assert!(ids.contains(&c.id.as_str()));
    }

    #[test]
    fn test_recommendations_order_by_composite_score() {
        let (_tmp, conn) = test_conn();
        let mut low = sample("Low", "code-pattern");
        low.quality.overall = 0.2;
        low.transition("active", "t", "").expect("activate");
        upsert(&conn, &low).expect("low");

        let mut high = sample("High", "code-pattern");
        high.quality.overall = 0.9;
        high.statistics.adoption_count = 250;
        high.transition("active", "t", "").expect("activate");
        upsert(&conn, &high).expect("high");

        let draft = sample("Draft", "code-pattern");
        upsert(&conn, &draft).expect("draft");

        let top = recommendations(&conn, 10).expect("recommend");
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].id, high.id);
    }
}
