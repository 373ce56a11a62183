//! JSON-over-stdio tool protocol.
//!
//! Each request line is `{id, tool, params}`; each response line is
//! `{id, result}` or `{id, error: {code, message}}`. Write tools route
//! through the gateway; read tools hit repositories directly.

use crate::core::db;
use crate::core::error::EngineError;
use crate::core::gateway::{DispatchRequest, Gateway};
use crate::core::provider;
use crate::core::store::Store;
use crate::plugins::{candidates, graph, recipes, search, stats};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::io::{BufRead, Write};

/// Default actor for protocol calls that do not name one.
pub const DEFAULT_ACTOR: &str = "cursor_agent";

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    #[serde(default = "default_request_id")]
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub params: JsonValue,
}

fn default_request_id() -> String {
    crate::core::time::new_event_id()
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResponse {
    fn ok(id: String, result: JsonValue) -> ToolResponse {
        ToolResponse {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: String, code: &str, message: String) -> ToolResponse {
        ToolResponse {
            id,
            result: None,
            error: Some(ToolError {
                code: code.to_string(),
                message,
                details: None,
            }),
        }
    }
}

fn actor_of(params: &JsonValue) -> String {
    params
        .get("actor")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

fn to_value<T: Serialize>(value: &T) -> Result<JsonValue, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Schema(e.to_string()))
}

/// Route one tool call.
pub fn handle_tool(store: &Store, gateway: &Gateway, request: &ToolRequest) -> ToolResponse {
    let id = request.id.clone();
    match handle_tool_inner(store, gateway, request) {
        Ok(result) => ToolResponse::ok(id, result),
        Err(err) => ToolResponse::err(id, err.code(), err.to_string()),
    }
}

fn handle_tool_inner(
    store: &Store,
    gateway: &Gateway,
    request: &ToolRequest,
) -> Result<JsonValue, EngineError> {
    let params = &request.params;
    match request.tool.as_str() {
        // --- Read tools: straight to the repositories ---
        "recipes.search" => {
            let conn = db::open_store_db(store)?;
            let ai = provider::provider_for(&store.config.ai_provider);
            let search_request = search::SearchRequest {
                query: params
                    .get("query")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                limit: params.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize,
                filter: params
                    .get("filter")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| EngineError::Validation(format!("invalid filter: {}", e)))?
                    .unwrap_or_default(),
                mode: search::SearchMode::parse(
                    params.get("mode").and_then(|v| v.as_str()).unwrap_or("hybrid"),
                )?,
                enable_ai_assist: params
                    .get("enableAiAssist")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            };
            let response = search::search(store, &conn, ai, &search_request)?;
            to_value(&response)
        }
        "recipes.get" => {
            let conn = db::open_store_db(store)?;
            let recipe_id = require_str(params, "id")?;
            to_value(&recipes::get(&conn, recipe_id)?)
        }
        "candidates.list" => {
            let conn = db::open_store_db(store)?;
            let page = candidates::list(
                &conn,
                params.get("status").and_then(|v| v.as_str()),
                params.get("page").and_then(|v| v.as_u64()).unwrap_or(1) as u32,
                params.get("pageSize").and_then(|v| v.as_u64()).unwrap_or(20) as u32,
            )?;
            to_value(&page)
        }
        "graph.neighbors" => {
            let conn = db::open_store_db(store)?;
            let entity_id = require_str(params, "id")?;
            let direction = graph::Direction::parse(
                params.get("direction").and_then(|v| v.as_str()).unwrap_or("both"),
            )?;
            let depth = params.get("depth").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
            to_value(&graph::neighbors(&conn, entity_id, direction, None, depth)?)
        }
        "graph.related" => {
            let conn = db::open_store_db(store)?;
            let entity_id = require_str(params, "id")?;
            let max_results =
                params.get("maxResults").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
            to_value(&graph::related(&conn, entity_id, max_results)?)
        }
        "stats.record-usage" => {
            let source = stats::UsageSource::parse(
                params.get("source").and_then(|v| v.as_str()).unwrap_or("human"),
            )?;
            let target = stats::UsageTarget {
                trigger: params
                    .get("trigger")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                recipe_file_path: params
                    .get("recipeFilePath")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            };
            stats::record_usage(store, &target, source)?;
            Ok(serde_json::json!({"recorded": true}))
        }

        // --- Write tools: through the gateway ---
        "recipes.create" | "recipes.update" | "recipes.deprecate" | "candidates.submit"
        | "candidates.approve" | "candidates.reject" | "candidates.promote" => {
            let action = match request.tool.as_str() {
                "recipes.create" => "create:recipe",
                "recipes.update" => "update:recipe",
                "recipes.deprecate" => "deprecate:recipe",
                "candidates.submit" => "submit:candidates",
                "candidates.approve" => "approve:candidate",
                "candidates.reject" => "reject:candidate",
                "candidates.promote" => "promote:candidate",
                _ => unreachable!(),
            };
            let response = gateway.dispatch(&DispatchRequest {
                actor: actor_of(params),
                action: action.to_string(),
                resource: String::new(),
                params: params.clone(),
                req_id: Some(request.id.clone()),
            });
            if response.ok {
                Ok(response.data.unwrap_or(JsonValue::Null))
            } else {
                let error = response.error.expect("failed dispatch carries an error");
                Err(match error.code.as_str() {
                    "PermissionDenied" => EngineError::PermissionDenied(error.message),
                    "Conflict" => EngineError::Conflict(error.message),
                    "NotFound" => EngineError::NotFound(error.message),
                    "ValidationError" => EngineError::Validation(error.message),
                    _ => EngineError::Internal(error.message),
                })
            }
        }
        other => Err(EngineError::NotFound(format!("unknown tool '{}'", other))),
    }
}

fn require_str<'a>(params: &'a JsonValue, key: &str) -> Result<&'a str, EngineError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::Validation(format!("missing parameter '{}'", key)))
}

/// Serve newline-delimited requests until EOF.
///
/// Each serve loop correlates its calls under one session row; every
/// handled request touches it so `last_active_at` tracks the interaction.
pub fn serve<R: BufRead, W: Write>(
    store: &Store,
    gateway: &Gateway,
    reader: R,
    mut writer: W,
) -> Result<(), EngineError> {
    let session = {
        let conn = db::open_store_db(store)?;
        crate::plugins::sessions::open(&conn, "stdio", "", DEFAULT_ACTOR, "tool protocol")?
    };
    for line in reader.lines() {
        let line = line.map_err(EngineError::Io)?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ToolRequest>(&line) {
            Ok(request) => handle_tool(store, gateway, &request),
            Err(err) => ToolResponse::err(
                default_request_id(),
                "ValidationError",
                format!("malformed request: {}", err),
            ),
        };
        if let Ok(conn) = db::open_store_db(store) {
            let _ = crate::plugins::sessions::touch(&conn, &session.id);
        }
        let body = serde_json::to_string(&response)
            .map_err(|e| EngineError::Schema(e.to_string()))?;
        writeln!(writer, "{}", body).map_err(EngineError::Io)?;
    }
    Ok(())
}
