//! Action gateway: the only authorized entrypoint for mutating operations.
//!
//! Every dispatch runs the same strict pipeline: validate → capability
//! probe → permission check → priority rules → before hooks → handler →
//! audit. Reads bypass the gateway and hit repositories directly; a write
//! that bypasses it is a bug.

use crate::constitution::Constitution;
use crate::core::db;
use crate::core::error::EngineError;
use crate::core::provider::{self, Provider};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::{audit, candidates, recipes, snippets, sync};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// Actions the gateway knows, with their required parameters.
pub const ACTIONS: &[(&str, &[&str])] = &[
    ("create:recipe", &["title", "language"]),
    ("update:recipe", &["id"]),
    ("delete:recipe", &["id"]),
    ("deprecate:recipe", &["id"]),
    ("promote:candidate", &["id"]),
    ("approve:candidate", &["id"]),
    ("reject:candidate", &["id"]),
    ("submit:candidates", &["candidates"]),
    ("install:snippet", &["id", "target"]),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub actor: String,
    pub action: String,
    /// Resource the action touches; derived from params when empty.
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub params: JsonValue,
    #[serde(default)]
    pub req_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DispatchError>,
}

/// A before hook may veto a dispatch with a reason.
pub type BeforeHook = Box<dyn Fn(&DispatchRequest) -> Result<(), String> + Send + Sync>;

pub struct Gateway {
    store: Store,
    constitution: Constitution,
    ai: Option<Arc<dyn Provider>>,
    hooks: Vec<BeforeHook>,
}

/// Serialize writers per database file; readers go around the gateway.
fn write_lock(db_path: &Path) -> Result<Arc<Mutex<()>>, EngineError> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let map = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = map
        .lock()
        .map_err(|_| EngineError::Internal("write lock map poisoned".to_string()))?;
    Ok(guard
        .entry(db_path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone())
}

impl Gateway {
    pub fn new(store: Store) -> Result<Gateway, EngineError> {
        let constitution = Constitution::load(&store)?;
        let ai = provider::provider_for(&store.config.ai_provider);
        Ok(Gateway {
            store,
            constitution,
            ai,
            hooks: Vec::new(),
        })
    }

    pub fn with_provider(mut self, ai: Option<Arc<dyn Provider>>) -> Gateway {
        self.ai = ai;
        self
    }

    /// Register an ordered before hook.
    pub fn register_hook(&mut self, hook: BeforeHook) {
        self.hooks.push(hook);
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run the full dispatch pipeline for one mutating action.
    pub fn dispatch(&self, request: &DispatchRequest) -> DispatchResponse {
        let started = Instant::now();
        let req_id = request
            .req_id
            .clone()
            .unwrap_or_else(time::new_event_id);

        let outcome = self.dispatch_inner(request);

        let (result, data, error) = match &outcome {
            Ok(data) => ("allow", Some(data.clone()), None),
            Err(Veto::Denied(reason)) => (
                "deny",
                None,
                Some(DispatchError {
                    code: "PermissionDenied".to_string(),
                    message: reason.clone(),
                }),
            ),
            Err(Veto::Failed(err)) => (
                "error",
                None,
                Some(DispatchError {
                    code: err.code().to_string(),
                    message: err.to_string(),
                }),
            ),
        };

        // Audit rows land before the response returns; audit failure is
        // logged and suppressed, never surfaced to the caller.
        let entry = audit::AuditLog {
            id: crate::core::paths::new_id(audit::AUDIT_ID_PREFIX),
            ts: time::now_epoch_z(),
            actor: request.actor.clone(),
            actor_context: req_id.clone(),
            action: request.action.clone(),
            resource: self.resource_for(request),
            operation_data: request.params.clone(),
            result: result.to_string(),
            error_message: error.as_ref().map(|e| e.message.clone()),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if let Err(audit_err) = self.append_audit(&entry) {
            self.log_event(&request.action, "audit_write_failed", &audit_err.to_string());
        }
        self.log_event(&request.action, result, &req_id);

        DispatchResponse {
            ok: matches!(outcome, Ok(_)),
            data,
            error,
        }
    }

    fn append_audit(&self, entry: &audit::AuditLog) -> Result<(), EngineError> {
        let conn = db::open_store_db(&self.store)?;
        audit::append(&conn, entry)
    }

    fn log_event(&self, action: &str, status: &str, detail: &str) {
        let event = serde_json::json!({
            "schema_version": "1.0.0",
            "ts": time::now_epoch_z(),
            "event_id": time::new_event_id(),
            "op": action,
            "status": status,
            "detail": detail,
        });
        let path = self.store.events_log_path();
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            let _ = writeln!(file, "{}", event);
        }
    }

    fn dispatch_inner(&self, request: &DispatchRequest) -> Result<JsonValue, Veto> {
        // 1. Validate shape and required parameters.
        validate(request).map_err(Veto::Failed)?;

        // 2–4. Permission, capability probes, and priority rules.
        let resource = self.resource_for(request);
        let decision = self
            .constitution
            .check(&self.store, &request.actor, &request.action, &resource)
            .map_err(Veto::Failed)?;
        if !decision.allow {
            return Err(Veto::Denied(decision.reason));
        }

        // 5. Ordered before hooks; any veto aborts.
        for hook in &self.hooks {
            if let Err(reason) = hook(request) {
                return Err(Veto::Denied(format!("hook veto: {}", reason)));
            }
        }

        // 6. Handler, transactional, serialized with other writers.
        let lock = write_lock(&self.store.db_path()).map_err(Veto::Failed)?;
        let _writer = lock
            .lock()
            .map_err(|_| Veto::Failed(EngineError::Internal("writer lock poisoned".into())))?;
        let mut conn = db::open_store_db(&self.store).map_err(Veto::Failed)?;
        let tx = conn
            .transaction()
            .map_err(|e| Veto::Failed(EngineError::Storage(e)))?;
        let data = self.handle(&tx, request).map_err(Veto::Failed)?;
        tx.commit()
            .map_err(|e| Veto::Failed(EngineError::Storage(e)))?;
        Ok(data)
    }

    /// Derive the resource string priority rules match against.
    fn resource_for(&self, request: &DispatchRequest) -> String {
        if !request.resource.is_empty() {
            return request.resource.clone();
        }
        let id = request.params.get("id").and_then(|v| v.as_str());
        match request.action.split_once(':') {
            Some((_, "candidate")) => {
                let Some(id) = id else {
                    return "candidate".to_string();
                };
                // AI-sourced candidates count as reviewed once a human
                // approval is on record; priority rules key off this.
                let origin = db::open_store_db(&self.store)
                    .ok()
                    .and_then(|conn| candidates::get(&conn, id).ok())
                    .map(|c| {
                        let ai_sourced = matches!(c.source.as_str(), "mcp" | "cursor-scan");
                        if ai_sourced && c.approved_by.is_none() {
                            "ai"
                        } else {
                            "human"
                        }
                    })
                    .unwrap_or("human");
                format!("candidate:{}/{}", origin, id)
            }
            Some((_, "recipe")) => match id {
                Some(id) => {
                    let status = db::open_store_db(&self.store)
                        .ok()
                        .and_then(|conn| recipes::get(&conn, id).ok())
                        .map(|r| r.status)
                        .unwrap_or_else(|| "draft".to_string());
                    format!("recipe:{}/{}", status, id)
                }
                None => "recipe".to_string(),
            },
            Some((_, tail)) => tail.to_string(),
            None => request.action.clone(),
        }
    }

    fn handle(
        &self,
        conn: &Connection,
        request: &DispatchRequest,
    ) -> Result<JsonValue, EngineError> {
        match request.action.as_str() {
            "create:recipe" => self.handle_create_recipe(conn, &request.params, &request.actor),
            "update:recipe" => self.handle_update_recipe(conn, &request.params),
            "delete:recipe" => self.handle_delete_recipe(conn, &request.params),
            "deprecate:recipe" => self.handle_deprecate_recipe(conn, &request.params, &request.actor),
            "promote:candidate" => self.handle_promote(conn, &request.params, &request.actor),
            "approve:candidate" => self.handle_review(conn, &request.params, &request.actor, "approved"),
            "reject:candidate" => self.handle_review(conn, &request.params, &request.actor, "rejected"),
            "submit:candidates" => self.handle_submit(conn, &request.params, &request.actor),
            "install:snippet" => self.handle_install(conn, &request.params),
            other => Err(EngineError::Validation(format!("unknown action '{}'", other))),
        }
    }

    fn handle_create_recipe(
        &self,
        conn: &Connection,
        params: &JsonValue,
        actor: &str,
    ) -> Result<JsonValue, EngineError> {
        let title = str_param(params, "title")?;
        let language = str_param(params, "language")?;
        let knowledge_type = params
            .get("knowledge_type")
            .and_then(|v| v.as_str())
            .unwrap_or("code-pattern");
        let mut content = recipes::RecipeContent::default();
        if let Some(pattern) = params.get("pattern").and_then(|v| v.as_str()) {
            content.pattern = pattern.to_string();
        }
        if let Some(markdown) = params.get("markdown").and_then(|v| v.as_str()) {
            content.markdown = markdown.to_string();
        }
        let trigger = params
            .get("trigger")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| derive_trigger(title));
        let mut recipe = recipes::Recipe::create(recipes::NewRecipe {
            title,
            language,
            category: params.get("category").and_then(|v| v.as_str()).unwrap_or("Utility"),
            knowledge_type,
            kind: params.get("kind").and_then(|v| v.as_str()),
            trigger: &trigger,
            content,
            source_candidate_id: None,
            source_file: None,
        })?;
        recipe.summary_en = params
            .get("summary_en")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        recipe.summary_cn = params
            .get("summary_cn")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        self.fill_missing_summaries(&mut recipe);
        recipe.source_file = Some(format!("recipes/{}.md", recipe.id));
        recipe.status_history.push(candidates::StatusChange {
            from: String::new(),
            to: "draft".to_string(),
            actor: actor.to_string(),
            ts: time::now_epoch_z(),
            reason: "created".to_string(),
        });
        recipes::upsert(conn, &recipe)?;
        sync::write_recipe_file(&self.store, &recipe)?;
        Ok(serde_json::json!({"id": recipe.id, "status": recipe.status}))
    }

    fn handle_update_recipe(
        &self,
        conn: &Connection,
        params: &JsonValue,
    ) -> Result<JsonValue, EngineError> {
        let id = str_param(params, "id")?;
        let mut recipe = recipes::get(conn, id)?;
        if recipe.status == "deprecated" {
            return Err(EngineError::Conflict(format!(
                "recipe {} is deprecated; create a successor instead",
                id
            )));
        }
        let set = |target: &mut String, key: &str| {
            if let Some(value) = params.get(key).and_then(|v| v.as_str()) {
                *target = value.to_string();
            }
        };
        set(&mut recipe.title, "title");
        set(&mut recipe.description, "description");
        set(&mut recipe.summary_en, "summary_en");
        set(&mut recipe.summary_cn, "summary_cn");
        set(&mut recipe.usage_guide_en, "usage_guide_en");
        set(&mut recipe.usage_guide_cn, "usage_guide_cn");
        set(&mut recipe.trigger, "trigger");
        if let Some(pattern) = params.get("pattern").and_then(|v| v.as_str()) {
            recipe.content.pattern = pattern.to_string();
        }
        if let Some(tags) = params.get("tags").and_then(|v| v.as_array()) {
            recipe.tags = tags
                .iter()
                .filter_map(|t| t.as_str().map(|s| s.to_string()))
                .collect();
        }
        if !recipe.trigger.is_empty() && !recipe.trigger.starts_with('@') {
            return Err(EngineError::Validation(format!(
                "trigger '{}' must start with '@'",
                recipe.trigger
            )));
        }
        recipe.updated_at = time::now_epoch_z();
        recipes::upsert(conn, &recipe)?;
        if recipe.source_file.is_some() {
            sync::write_recipe_file(&self.store, &recipe)?;
        }
        Ok(serde_json::json!({"id": recipe.id, "updated_at": recipe.updated_at}))
    }

    fn handle_delete_recipe(
        &self,
        conn: &Connection,
        params: &JsonValue,
    ) -> Result<JsonValue, EngineError> {
        let id = str_param(params, "id")?;
        let recipe = recipes::get(conn, id)?;
        recipes::delete(conn, id)?;
        if let Some(source_file) = &recipe.source_file {
            let path = self.store.knowledge_dir().join(source_file);
            if path.exists() {
                self.store.assert_write_safe(&path)?;
                std::fs::remove_file(&path).map_err(EngineError::Io)?;
            }
        }
        Ok(serde_json::json!({"id": id, "deleted": true}))
    }

    fn handle_deprecate_recipe(
        &self,
        conn: &Connection,
        params: &JsonValue,
        actor: &str,
    ) -> Result<JsonValue, EngineError> {
        let id = str_param(params, "id")?;
        let reason = params.get("reason").and_then(|v| v.as_str()).unwrap_or("");
        let mut recipe = recipes::get(conn, id)?;
        recipe.transition("deprecated", actor, reason)?;
        recipes::upsert(conn, &recipe)?;
        Ok(serde_json::json!({"id": id, "status": "deprecated"}))
    }

    fn handle_review(
        &self,
        conn: &Connection,
        params: &JsonValue,
        actor: &str,
        to: &str,
    ) -> Result<JsonValue, EngineError> {
        let id = str_param(params, "id")?;
        let reason = params.get("reason").and_then(|v| v.as_str()).unwrap_or("");
        let candidate = candidates::apply_transition(conn, id, to, actor, reason)?;
        Ok(serde_json::json!({"id": candidate.id, "status": candidate.status}))
    }

    /// Promotion applies the full review path: a pending candidate passes
    /// through `approved` before landing on `applied`, never skipping states.
    fn handle_promote(
        &self,
        conn: &Connection,
        params: &JsonValue,
        actor: &str,
    ) -> Result<JsonValue, EngineError> {
        let id = str_param(params, "id")?;
        let mut candidate = candidates::get(conn, id)?;
        if candidate.status == "pending" {
            candidate.transition("approved", actor, "promotion review")?;
        }
        if candidate.status != "approved" {
            return Err(EngineError::Conflict(format!(
                "InvalidStateTransition: candidate {} cannot be promoted from '{}'",
                id, candidate.status
            )));
        }

        let title = params
            .get("title")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                candidate
                    .metadata
                    .get("title")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("{} pattern", candidate.category))
            });
        let trigger = params
            .get("trigger")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| derive_trigger(&title));
        let mut recipe = recipes::Recipe::create(recipes::NewRecipe {
            title: &title,
            language: &candidate.language,
            category: &candidate.category,
            knowledge_type: params
                .get("knowledge_type")
                .and_then(|v| v.as_str())
                .unwrap_or("code-pattern"),
            kind: None,
            trigger: &trigger,
            content: recipes::RecipeContent {
                pattern: candidate.code.clone(),
                ..Default::default()
            },
            source_candidate_id: Some(&candidate.id),
            source_file: None,
        })?;
        self.fill_missing_summaries(&mut recipe);
        recipe.source_file = Some(format!("recipes/{}.md", recipe.id));
        recipes::upsert(conn, &recipe)?;
        sync::write_recipe_file(&self.store, &recipe)?;

        candidate.transition("applied", actor, "promoted")?;
        candidate.applied_recipe_id = Some(recipe.id.clone());
        candidates::update(conn, &candidate)?;

        Ok(serde_json::json!({
            "candidate_id": candidate.id,
            "recipe_id": recipe.id,
            "recipe_status": recipe.status,
        }))
    }

    fn handle_submit(
        &self,
        conn: &Connection,
        params: &JsonValue,
        actor: &str,
    ) -> Result<JsonValue, EngineError> {
        let Some(entries) = params.get("candidates").and_then(|v| v.as_array()) else {
            return Err(EngineError::Validation(
                "'candidates' must be an array".to_string(),
            ));
        };
        if entries.is_empty() {
            return Err(EngineError::Validation(
                "'candidates' must not be empty".to_string(),
            ));
        }
        let mut ids = Vec::new();
        for entry in entries {
            let code = entry
                .get("code")
                .and_then(|v| v.as_str())
                .ok_or_else(|| EngineError::Validation("candidate needs 'code'".to_string()))?;
            let language = entry
                .get("language")
                .and_then(|v| v.as_str())
                .ok_or_else(|| EngineError::Validation("candidate needs 'language'".to_string()))?;
            let candidate = candidates::Candidate::create(candidates::NewCandidate {
                code,
                language,
                category: entry.get("category").and_then(|v| v.as_str()).unwrap_or(""),
                source: entry.get("source").and_then(|v| v.as_str()).unwrap_or("manual"),
                reasoning: entry.get("reasoning").cloned().unwrap_or(JsonValue::Null),
                created_by: actor,
                metadata: entry.get("metadata").cloned().unwrap_or(JsonValue::Null),
            })?;
            candidates::insert(conn, &candidate)?;
            ids.push(candidate.id);
        }
        Ok(serde_json::json!({"ids": ids, "count": ids.len()}))
    }

    fn handle_install(
        &self,
        conn: &Connection,
        params: &JsonValue,
    ) -> Result<JsonValue, EngineError> {
        let id = str_param(params, "id")?;
        let target = str_param(params, "target")?;
        let target_path = self.store.project_root.join(target);
        let snippet = snippets::install(&self.store, conn, id, &target_path)?;
        Ok(serde_json::json!({
            "id": snippet.id,
            "installed_path": snippet.installed_path,
        }))
    }

    /// Backfill empty bilingual summaries from the provider; degradation is
    /// silent and never retried within the dispatch.
    fn fill_missing_summaries(&self, recipe: &mut recipes::Recipe) {
        let Some(ai) = &self.ai else {
            return;
        };
        let source = if recipe.content.pattern.is_empty() {
            recipe.content.markdown.clone()
        } else {
            recipe.content.pattern.clone()
        };
        if source.trim().is_empty() {
            return;
        }
        if recipe.summary_en.is_empty() {
            let provider = Arc::clone(ai);
            let text = source.clone();
            if let Ok(summary) = provider::call_with_deadline(provider::TEXT_DEADLINE, move || {
                provider.summarize(&text, "en")
            }) {
                recipe.summary_en = summary;
            }
        }
        if recipe.summary_cn.is_empty() && !recipe.summary_en.is_empty() {
            let provider = Arc::clone(ai);
            let text = recipe.summary_en.clone();
            if let Ok(translated) = provider::call_with_deadline(provider::TEXT_DEADLINE, move || {
                provider.translate(&text, "cn")
            }) {
                recipe.summary_cn = translated;
            }
        }
    }
}

enum Veto {
    Denied(String),
    Failed(EngineError),
}

/// Default quick-activation trigger derived from a title, e.g.
/// `Singleton pattern` → `@singleton_pattern`.
fn derive_trigger(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_').to_string();
    format!("@{}", if slug.is_empty() { "recipe" } else { slug.as_str() })
}

fn str_param<'a>(params: &'a JsonValue, key: &str) -> Result<&'a str, EngineError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| EngineError::Validation(format!("missing required parameter '{}'", key)))
}

/// Schema-check a request before anything else runs.
pub fn validate(request: &DispatchRequest) -> Result<(), EngineError> {
    let Some(required) = ACTIONS
        .iter()
        .find(|(name, _)| *name == request.action)
        .map(|(_, required)| *required)
    else {
        return Err(EngineError::Validation(format!(
            "unknown action '{}'",
            request.action
        )));
    };
    if !request.params.is_object() {
        return Err(EngineError::Validation(
            "params must be a JSON object".to_string(),
        ));
    }
    for key in required {
        let present = match *key {
            "candidates" => request
                .params
                .get(key)
                .map(|v| v.is_array())
                .unwrap_or(false),
            _ => request
                .params
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false),
        };
        if !present {
            return Err(EngineError::Validation(format!(
                "missing required parameter '{}' for {}",
                key, request.action
            )));
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "gateway",
        "version": "1.0.0",
        "description": "Single choke-point for mutating actions: validate, permit, dispatch, audit",
        "actions": ACTIONS.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
        "pipeline": ["validate", "capability", "permission", "priority", "hooks", "dispatch", "audit"],
        "storage": ["autosnippet.db#audit_logs", "logs/engine.events.jsonl"]
    })
}
