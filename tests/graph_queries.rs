use autosnippet::core::db;
use autosnippet::core::store::Store;
use autosnippet::plugins::graph::{self, Direction, PAGERANK_DAMPING, PAGERANK_ITERATIONS};
use autosnippet::plugins::recipes::{self, NewRecipe, Recipe, RecipeContent, RelationEntry};
use tempfile::tempdir;

fn project() -> (tempfile::TempDir, Store, rusqlite::Connection) {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("store");
    let conn = db::open_store_db(&store).expect("db");
    (tmp, store, conn)
}

fn dep(conn: &rusqlite::Connection, from: &str, to: &str) {
    graph::add_edge(conn, from, "recipe", to, "recipe", "depends_on", None, None)
        .expect("edge");
}

#[test]
fn three_node_dependency_cycle_is_reported_once() {
    let (_tmp, _store, conn) = project();
    dep(&conn, "a", "b");
    dep(&conn, "b", "c");
    dep(&conn, "c", "a");

    let cycles = graph::detect_cycles(&conn).expect("cycles");
    assert_eq!(cycles.len(), 1);
    assert_eq!(
        cycles[0],
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
}

#[test]
fn add_edge_is_idempotent_across_runs() {
    let (_tmp, _store, conn) = project();
    for _ in 0..3 {
        dep(&conn, "x", "y");
    }
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM knowledge_edges", [], |r| r.get(0))
        .expect("count");
    assert_eq!(count, 1);
}

#[test]
fn dependencies_used_by_and_alternatives_agree_with_the_edge_set() {
    let (_tmp, _store, conn) = project();
    dep(&conn, "app", "network");
    dep(&conn, "app", "storage");
    dep(&conn, "widget", "app");
    graph::add_edge(
        &conn, "network", "recipe", "urlsession", "recipe", "alternative", None, None,
    )
    .expect("edge");

    let deps: Vec<String> = graph::dependencies(&conn, "app")
        .expect("deps")
        .into_iter()
        .map(|n| n.entity_id)
        .collect();
    assert_eq!(deps.len(), 2);
    assert!(deps.contains(&"network".to_string()));
    assert!(deps.contains(&"storage".to_string()));

    let users: Vec<String> = graph::used_by(&conn, "app")
        .expect("used_by")
        .into_iter()
        .map(|n| n.entity_id)
        .collect();
    assert_eq!(users, vec!["widget".to_string()]);

    let alternatives: Vec<String> = graph::alternatives(&conn, "urlsession")
        .expect("alternatives")
        .into_iter()
        .map(|n| n.entity_id)
        .collect();
    assert_eq!(alternatives, vec!["network".to_string()]);
}

#[test]
fn pagerank_scores_persist_and_order_related_results() {
    let (_tmp, _store, conn) = project();
    dep(&conn, "a", "hub");
    dep(&conn, "b", "hub");
    dep(&conn, "c", "hub");
    dep(&conn, "c", "leaf");

    let ranks = graph::pagerank(&conn, PAGERANK_ITERATIONS, PAGERANK_DAMPING).expect("pagerank");
    assert!(ranks["hub"] > ranks["leaf"]);

    let persisted = graph::load_pagerank(&conn).expect("load");
    assert_eq!(persisted.len(), ranks.len());

    // Equal-weight neighbors of `c` order by target PageRank.
    let related = graph::related(&conn, "c", 10).expect("related");
    assert_eq!(related[0].entity_id, "hub");
}

#[test]
fn migration_backfill_matches_relations_by_exact_id() {
    let (_tmp, _store, conn) = project();

    // A recipe whose relations reference another by exact id.
    let mut base = Recipe::create(NewRecipe {
        title: "Networking layer",
        language: "swift",
        category: "Network",
        knowledge_type: "architecture",
        kind: None,
        trigger: "@network",
        content: RecipeContent {
            rationale: "single request path".to_string(),
            ..Default::default()
        },
        source_candidate_id: None,
        source_file: None,
    })
    .expect("recipe");
    let helper = Recipe::create(NewRecipe {
        title: "Request builder",
        language: "swift",
        category: "Network",
        knowledge_type: "code-pattern",
        kind: None,
        trigger: "@requests",
        content: RecipeContent {
            pattern: "URLRequest(url:)".to_string(),
            ..Default::default()
        },
        source_candidate_id: None,
        source_file: None,
    })
    .expect("recipe");
    base.relations.insert(
        "dependsOn".to_string(),
        vec![RelationEntry {
            target: helper.id.clone(),
            description: "builds the request".to_string(),
        }],
    );
    recipes::upsert(&conn, &base).expect("base");
    recipes::upsert(&conn, &helper).expect("helper");

    // Rebuild the edge table the way migration 13 does on first appearance.
    conn.execute("DELETE FROM knowledge_edges", []).expect("clear");
    conn.execute("DELETE FROM schema_migrations WHERE version = 13", [])
        .expect("forget migration");
    let mut conn = conn;
    autosnippet::core::migration::run_migrations(&mut conn).expect("replay");

    let neighbors = graph::neighbors(&conn, &base.id, Direction::Out, None, 1).expect("out");
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].entity_id, helper.id);
    assert_eq!(neighbors[0].relation, "depends_on");
}
