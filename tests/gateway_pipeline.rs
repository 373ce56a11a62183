use autosnippet::core::db;
use autosnippet::core::gateway::{DispatchRequest, Gateway};
use autosnippet::core::store::Store;
use autosnippet::plugins::audit;
use serde_json::json;
use tempfile::tempdir;

fn harness() -> (tempfile::TempDir, Store, Gateway) {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("store");
    let gateway = Gateway::new(store.clone()).expect("gateway");
    (tmp, store, gateway)
}

#[test]
fn visitor_write_is_denied_with_audit_row() {
    let (_tmp, store, gateway) = harness();
    let response = gateway.dispatch(&DispatchRequest {
        actor: "visitor".to_string(),
        action: "create:recipe".to_string(),
        resource: String::new(),
        params: json!({"title": "X", "language": "swift"}),
        req_id: None,
    });
    assert!(!response.ok);
    let error = response.error.expect("error");
    assert_eq!(error.code, "PermissionDenied");
    assert_eq!(error.message, "no permission create:recipe");

    let conn = db::open_store_db(&store).expect("db");
    let rows = audit::find_by_action(&conn, "create:recipe").expect("audit rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].result, "deny");
    assert_eq!(
        rows[0].error_message.as_deref(),
        Some("no permission create:recipe")
    );
}

#[test]
fn admin_create_recipe_lands_in_db_and_corpus() {
    let (_tmp, store, gateway) = harness();
    let response = gateway.dispatch(&DispatchRequest {
        actor: "developer_admin".to_string(),
        action: "create:recipe".to_string(),
        resource: String::new(),
        params: json!({
            "title": "Weak self capture",
            "language": "swift",
            "pattern": "guard let self = self else { return }",
            "trigger": "@weakself"
        }),
        req_id: None,
    });
    assert!(response.ok, "dispatch failed: {:?}", response.error);
    let data = response.data.expect("data");
    let recipe_id = data["id"].as_str().expect("id");

    let conn = db::open_store_db(&store).expect("db");
    let recipe = autosnippet::plugins::recipes::get(&conn, recipe_id).expect("row");
    assert_eq!(recipe.status, "draft");
    let file = store
        .knowledge_dir()
        .join(recipe.source_file.as_ref().expect("source file"));
    assert!(file.exists());

    let rows = audit::find_by_action(&conn, "create:recipe").expect("audit");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].result, "allow");
}

#[test]
fn malformed_params_fail_validation_before_any_state_change() {
    let (_tmp, store, gateway) = harness();
    let response = gateway.dispatch(&DispatchRequest {
        actor: "developer_admin".to_string(),
        action: "create:recipe".to_string(),
        resource: String::new(),
        params: json!({"title": "No language"}),
        req_id: None,
    });
    assert!(!response.ok);
    assert_eq!(response.error.expect("error").code, "ValidationError");

    let conn = db::open_store_db(&store).expect("db");
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM recipes", [], |r| r.get(0))
        .expect("count");
    assert_eq!(count, 0);
}

#[test]
fn unknown_action_is_rejected() {
    let (_tmp, _store, gateway) = harness();
    let response = gateway.dispatch(&DispatchRequest {
        actor: "developer_admin".to_string(),
        action: "explode:world".to_string(),
        resource: String::new(),
        params: json!({}),
        req_id: None,
    });
    assert!(!response.ok);
    assert_eq!(response.error.expect("error").code, "ValidationError");
}

#[test]
fn before_hook_veto_aborts_dispatch() {
    let (_tmp, store, mut gateway) = harness();
    gateway.register_hook(Box::new(|request| {
        if request.action == "create:recipe" {
            Err("maintenance freeze".to_string())
        } else {
            Ok(())
        }
    }));
    let response = gateway.dispatch(&DispatchRequest {
        actor: "developer_admin".to_string(),
        action: "create:recipe".to_string(),
        resource: String::new(),
        params: json!({"title": "X", "language": "swift"}),
        req_id: None,
    });
    assert!(!response.ok);
    let error = response.error.expect("error");
    assert!(error.message.contains("maintenance freeze"));

    let conn = db::open_store_db(&store).expect("db");
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM recipes", [], |r| r.get(0))
        .expect("count");
    assert_eq!(count, 0);
}

#[test]
fn audit_rows_are_readable_immediately_after_dispatch_returns() {
    let (_tmp, store, gateway) = harness();
    for i in 0..3 {
        let response = gateway.dispatch(&DispatchRequest {
            actor: "developer_admin".to_string(),
            action: "submit:candidates".to_string(),
            resource: String::new(),
            params: json!({"candidates": [{"code": format!("func f{}() {{}}", i), "language": "swift"}]}),
            req_id: Some(format!("req-{}", i)),
        });
        assert!(response.ok);

        let conn = db::open_store_db(&store).expect("db");
        let rows = audit::find_by_action(&conn, "submit:candidates").expect("audit");
        assert_eq!(rows.len(), i + 1);
    }
}

#[test]
fn deprecated_recipe_rejects_updates() {
    let (_tmp, store, gateway) = harness();
    let created = gateway.dispatch(&DispatchRequest {
        actor: "developer_admin".to_string(),
        action: "create:recipe".to_string(),
        resource: String::new(),
        params: json!({"title": "Old way", "language": "swift", "pattern": "legacy()"}),
        req_id: None,
    });
    let recipe_id = created.data.expect("data")["id"]
        .as_str()
        .expect("id")
        .to_string();

    let deprecated = gateway.dispatch(&DispatchRequest {
        actor: "developer_admin".to_string(),
        action: "deprecate:recipe".to_string(),
        resource: String::new(),
        params: json!({"id": recipe_id, "reason": "superseded"}),
        req_id: None,
    });
    assert!(deprecated.ok);

    let update = gateway.dispatch(&DispatchRequest {
        actor: "developer_admin".to_string(),
        action: "update:recipe".to_string(),
        resource: String::new(),
        params: json!({"id": recipe_id, "title": "New title"}),
        req_id: None,
    });
    assert!(!update.ok);

    let conn = db::open_store_db(&store).expect("db");
    let recipe = autosnippet::plugins::recipes::get(&conn, &recipe_id).expect("row");
    assert_eq!(recipe.title, "Old way");
    assert_eq!(
        recipe.deprecation.expect("deprecation").reason,
        "superseded"
    );
}
