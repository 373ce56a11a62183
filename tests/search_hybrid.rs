use autosnippet::core::db;
use autosnippet::core::error::EngineError;
use autosnippet::core::provider::{self, Provider, RerankCandidate};
use autosnippet::core::store::Store;
use autosnippet::plugins::indexer;
use autosnippet::plugins::recipes::{self, NewRecipe, Recipe, RecipeContent};
use autosnippet::plugins::search::{
    self, SearchFilter, SearchMode, SearchRequest, WARNING_AI_ASSIST_ABORTED,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn project() -> (tempfile::TempDir, Store, rusqlite::Connection) {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("store");
    let conn = db::open_store_db(&store).expect("db");
    (tmp, store, conn)
}

fn seed(conn: &rusqlite::Connection, title: &str, trigger: &str, pattern: &str) -> Recipe {
    let mut recipe = Recipe::create(NewRecipe {
        title,
        language: "swift",
        category: "Utility",
        knowledge_type: "code-pattern",
        kind: None,
        trigger,
        content: RecipeContent {
            pattern: pattern.to_string(),
            ..Default::default()
        },
        source_candidate_id: None,
        source_file: None,
    })
    .expect("recipe");
    recipe.transition("active", "t", "").expect("activate");
    recipes::upsert(conn, &recipe).expect("upsert");
    recipe
}

#[test]
fn hybrid_search_dedupes_and_ranks_the_title_match_first() {
    let (_tmp, store, conn) = project();
    let singleton = seed(
        &conn,
        "Singleton pattern",
        "@singleton",
        "final class Shared { static let instance = Shared() } // singleton",
    );
    let other = seed(
        &conn,
        "Global state avoidance",
        "@globals",
        "prefer dependency injection over global state",
    );
    let ai = provider::provider_for("hash");
    indexer::run(&store, &conn, ai.clone(), false).expect("index");

    let response = search::search(
        &store,
        &conn,
        ai,
        &SearchRequest {
            query: "singleton".to_string(),
            limit: 10,
            mode: SearchMode::Hybrid,
            filter: SearchFilter::default(),
            enable_ai_assist: false,
        },
    )
    .expect("search");

    let ids: Vec<&str> = response.items.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids.iter().filter(|id| **id == singleton.id).count(), 1);
    assert_eq!(ids.iter().filter(|id| **id == other.id).count() <= 1, true);
    assert_eq!(ids[0], singleton.id);
}

#[test]
fn empty_query_is_a_result_not_an_error() {
    let (_tmp, store, conn) = project();
    let response = search::search(
        &store,
        &conn,
        None,
        &SearchRequest {
            query: "   ".to_string(),
            ..Default::default()
        },
    )
    .expect("search");
    assert_eq!(response.total, 0);
    assert!(response.items.is_empty());
}

#[test]
fn huge_markdown_recipe_indexes_chunked_and_is_searchable() {
    let (_tmp, store, conn) = project();
    let mut recipe = Recipe::create(NewRecipe {
        title: "Encyclopedia",
        language: "swift",
        category: "Tool",
        knowledge_type: "architecture",
        kind: None,
        trigger: "@encyclopedia",
        content: RecipeContent {
            markdown: format!(
                "prelude glossary entry. {}",
                "filler sentence about architecture. ".repeat(3000)
            ),
            ..Default::default()
        },
        source_candidate_id: None,
        source_file: None,
    })
    .expect("recipe");
    recipe.transition("active", "t", "").expect("activate");
    recipes::upsert(&conn, &recipe).expect("upsert");

    let ai = provider::provider_for("hash");
    indexer::run(&store, &conn, ai.clone(), false).expect("index");

    let chunk_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM embedding_chunks", [], |r| r.get(0))
        .expect("count");
    assert!(chunk_count > 1, "100k-char content must chunk");

    let response = search::search(
        &store,
        &conn,
        ai,
        &SearchRequest {
            query: "glossary".to_string(),
            ..Default::default()
        },
    )
    .expect("search");
    assert_eq!(response.items[0].id, recipe.id);
}

struct HangingRerank(provider::HashProvider);

impl Provider for HangingRerank {
    fn name(&self) -> &str {
        "hanging-rerank"
    }
    fn summarize(&self, text: &str, locale: &str) -> Result<String, EngineError> {
        self.0.summarize(text, locale)
    }
    fn translate(&self, text: &str, locale: &str) -> Result<String, EngineError> {
        self.0.translate(text, locale)
    }
    fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        self.0.embed(text)
    }
    fn rerank(
        &self,
        _query: &str,
        _candidates: &[RerankCandidate],
    ) -> Result<Vec<String>, EngineError> {
        std::thread::sleep(Duration::from_secs(5));
        Ok(Vec::new())
    }
}

#[test]
fn slow_rerank_fast_aborts_within_the_deadline() {
    let (_tmp, store, conn) = project();
    seed(&conn, "Singleton pattern", "@singleton", "singleton body");
    seed(&conn, "Observer pattern", "@observer", "observer body");
    let slow: Arc<dyn Provider> = Arc::new(HangingRerank(provider::HashProvider::default()));
    indexer::run(&store, &conn, Some(slow.clone()), false).expect("index");

    let request = SearchRequest {
        query: "pattern".to_string(),
        enable_ai_assist: true,
        ..Default::default()
    };
    let plain = search::search(
        &store,
        &conn,
        Some(slow.clone()),
        &SearchRequest {
            enable_ai_assist: false,
            ..request.clone()
        },
    )
    .expect("baseline");

    let started = Instant::now();
    let assisted = search::search(&store, &conn, Some(slow), &request).expect("search");
    // Hard two-second deadline plus scheduling slack.
    assert!(started.elapsed() < Duration::from_millis(2600));
    assert!(assisted
        .warnings
        .contains(&WARNING_AI_ASSIST_ABORTED.to_string()));

    let plain_ids: Vec<&str> = plain.items.iter().map(|h| h.id.as_str()).collect();
    let assisted_ids: Vec<&str> = assisted.items.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(plain_ids, assisted_ids);
}

#[test]
fn disable_ai_assist_config_skips_rerank() {
    let (tmp, _store, conn) = project();
    seed(&conn, "Singleton pattern", "@singleton", "singleton body");

    // A store whose config disables assist never invokes the provider.
    std::fs::write(
        tmp.path().join(".autosnippet/config.json"),
        r#"{"ai_provider":"hash","disable_ai_assist":true}"#,
    )
    .expect("config");
    let store = Store::open(tmp.path()).expect("reload store");
    let slow: Arc<dyn Provider> = Arc::new(HangingRerank(provider::HashProvider::default()));
    indexer::run(&store, &conn, Some(slow.clone()), false).expect("index");

    let started = Instant::now();
    let response = search::search(
        &store,
        &conn,
        Some(slow),
        &SearchRequest {
            query: "singleton".to_string(),
            enable_ai_assist: true,
            ..Default::default()
        },
    )
    .expect("search");
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(response.warnings.is_empty());
    assert_eq!(response.items.len(), 1);
}
