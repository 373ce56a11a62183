//! HTTP dashboard contracts.
//!
//! Typed request/response bodies plus the core-side handlers the dashboard
//! adapter calls. The HTTP server itself is an external collaborator; the
//! core only guarantees these shapes. Failure bodies follow
//! `{ok: false, error: {code, message}}` with no stack traces.

use crate::core::db;
use crate::core::error::EngineError;
use crate::core::gateway::{DispatchRequest, Gateway};
use crate::core::provider;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::{audit, indexer, recipes, search};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// `GET /api/health`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub service: String,
    pub project_root: String,
    pub timestamp: String,
}

pub fn health(store: &Store) -> HealthResponse {
    HealthResponse {
        service: "autosnippet".to_string(),
        project_root: store.project_root.to_string_lossy().to_string(),
        timestamp: time::now_epoch_z(),
    }
}

/// `GET /api/recipes` query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipesQuery {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipesListResponse {
    pub results: Vec<JsonValue>,
    pub total: usize,
}

/// `GET /api/recipes` — keyword-search or list, sliced by limit/offset.
pub fn list_recipes(store: &Store, query: &RecipesQuery) -> Result<RecipesListResponse, EngineError> {
    let conn = db::open_store_db(store)?;
    let mut rows = if query.q.trim().is_empty() {
        recipes::list_all(&conn)?
    } else {
        recipes::search(&conn, &query.q)?
    };
    if let Some(scope) = &query.scope {
        rows.retain(|r| &r.scope == scope);
    }
    let total = rows.len();
    let offset = query.offset.unwrap_or(0).min(total);
    let limit = query.limit.unwrap_or(50);
    let results = rows
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|r| serde_json::to_value(&r).unwrap_or(JsonValue::Null))
        .collect();
    Ok(RecipesListResponse { results, total })
}

/// `GET /api/recipes/:id`
pub fn get_recipe(store: &Store, id: &str) -> Result<JsonValue, EngineError> {
    let conn = db::open_store_db(store)?;
    let recipe = recipes::get(&conn, id)?;
    serde_json::to_value(&recipe).map_err(|e| EngineError::Schema(e.to_string()))
}

/// `POST /api/candidates` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSubmission {
    pub code: String,
    #[serde(default)]
    pub file_path: String,
    pub language: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateSubmitResponse {
    pub id: String,
    pub status: String,
    pub message: String,
}

/// `POST /api/candidates` — routes through the gateway like every write.
pub fn submit_candidate(
    gateway: &Gateway,
    body: &CandidateSubmission,
) -> Result<CandidateSubmitResponse, EngineError> {
    let response = gateway.dispatch(&DispatchRequest {
        actor: body
            .actor
            .clone()
            .unwrap_or_else(|| crate::core::rpc::DEFAULT_ACTOR.to_string()),
        action: "submit:candidates".to_string(),
        resource: String::new(),
        params: serde_json::json!({
            "candidates": [{
                "code": body.code,
                "language": body.language,
                "source": body.source.clone().unwrap_or_else(|| "manual".to_string()),
                "metadata": {"filePath": body.file_path, "description": body.description},
            }]
        }),
        req_id: None,
    });
    match response.data {
        Some(data) if response.ok => {
            let id = data["ids"][0].as_str().unwrap_or_default().to_string();
            Ok(CandidateSubmitResponse {
                id,
                status: "pending".to_string(),
                message: "candidate queued for review".to_string(),
            })
        }
        _ => {
            let error = response
                .error
                .unwrap_or_else(|| crate::core::gateway::DispatchError {
                    code: "Internal".to_string(),
                    message: "dispatch returned no data".to_string(),
                });
            Err(match error.code.as_str() {
                "PermissionDenied" => EngineError::PermissionDenied(error.message),
                "ValidationError" => EngineError::Validation(error.message),
                _ => EngineError::Internal(error.message),
            })
        }
    }
}

/// `POST /api/audit` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditCheckRequest {
    pub file_content: String,
    pub file_path: String,
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// `POST /api/audit` → `{violations, suggestions, score}`.
pub fn audit_check(
    store: &Store,
    body: &AuditCheckRequest,
) -> Result<audit::GuardCheckReport, EngineError> {
    let conn = db::open_store_db(store)?;
    audit::check_guards(
        &conn,
        &body.file_content,
        &body.file_path,
        body.language.as_deref(),
    )
}

/// `POST /api/commands/embed` response.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedCommandResponse {
    pub success: bool,
    pub indexed: usize,
    pub skipped: usize,
    pub removed: usize,
}

/// `POST /api/commands/embed` — run an incremental index pass.
pub fn embed_command(store: &Store) -> Result<EmbedCommandResponse, EngineError> {
    let conn = db::open_store_db(store)?;
    let ai = provider::provider_for(&store.config.ai_provider);
    let report = indexer::run(store, &conn, ai, false)?;
    Ok(EmbedCommandResponse {
        success: true,
        indexed: report.indexed,
        skipped: report.skipped,
        removed: report.removed,
    })
}

/// Uniform failure body for every endpoint.
pub fn error_body(err: &EngineError) -> JsonValue {
    serde_json::json!({
        "ok": false,
        "error": {
            "code": err.code(),
            "message": err.to_string(),
        }
    })
}

/// Search endpoint shared by the dashboard (`GET /api/recipes?q=`) and the
/// editor quick panel; degraded AI stages surface as warnings, not errors.
pub fn search_endpoint(
    store: &Store,
    request: &search::SearchRequest,
) -> Result<search::SearchResponse, EngineError> {
    let conn = db::open_store_db(store)?;
    let ai = provider::provider_for(&store.config.ai_provider);
    search::search(store, &conn, ai, request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn harness() -> (tempfile::TempDir, Store, Gateway) {
        let tmp = tempdir().expect("tempdir");
        let store = Store::open(tmp.path()).expect("store");
        let gateway = Gateway::new(store.clone()).expect("gateway");
        (tmp, store, gateway)
    }

    #[test]
    fn test_health_reports_root_and_timestamp() {
        let (_tmp, store, _gateway) = harness();
        let body = health(&store);
        assert_eq!(body.service, "autosnippet");
        assert!(body.timestamp.ends_with('Z'));
        assert!(!body.project_root.is_empty());
    }

    #[test]
    fn test_submit_candidate_contract_shape() {
        let (_tmp, store, gateway) = harness();
        let response = submit_candidate(
            &gateway,
            &CandidateSubmission {
                code: "func x() {}".to_string(),
                file_path: "Sources/X.swift".to_string(),
                language: "swift".to_string(),
                description: "helper".to_string(),
                source: None,
                actor: Some("developer_admin".to_string()),
            },
        )
        .expect("submit");
        assert!(response.id.starts_with("cnd-"));
        assert_eq!(response.status, "pending");
        drop(store);
    }

    #[test]
    fn test_error_body_is_sanitized() {
        let err = EngineError::PermissionDenied("no permission create:recipe".to_string());
        let body = error_body(&err);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "PermissionDenied");
        assert!(body["error"]["message"].as_str().unwrap().contains("create:recipe"));
    }

    #[test]
    fn test_list_recipes_empty_query_and_pagination() {
        let (_tmp, store, _gateway) = harness();
        let response = list_recipes(&store, &RecipesQuery::default()).expect("list");
        assert_eq!(response.total, 0);
        assert!(response.results.is_empty());
    }

    #[test]
    fn test_embed_command_on_empty_store() {
        let (_tmp, store, _gateway) = harness();
        let response = embed_command(&store).expect("embed");
        assert!(response.success);
        assert_eq!(response.indexed, 0);
    }
}
