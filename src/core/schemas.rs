// Centralized database schema definitions for the engine's single store file.

pub const DB_NAME: &str = "autosnippet.db";

// --- Migration ledger ---
pub const SCHEMA_MIGRATIONS: &str = "
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL
    )
";

// --- Recipes ---
pub const RECIPES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS recipes (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT DEFAULT '',
        language TEXT NOT NULL,
        category TEXT DEFAULT '',
        kind TEXT NOT NULL,
        knowledge_type TEXT NOT NULL,
        complexity TEXT DEFAULT 'intermediate',
        scope TEXT DEFAULT 'project',
        summary_cn TEXT DEFAULT '',
        summary_en TEXT DEFAULT '',
        usage_guide_cn TEXT DEFAULT '',
        usage_guide_en TEXT DEFAULT '',
        trigger TEXT DEFAULT '',
        status TEXT NOT NULL DEFAULT 'draft',
        content_json TEXT NOT NULL DEFAULT '{}',
        relations_json TEXT NOT NULL DEFAULT '{}',
        constraints_json TEXT NOT NULL DEFAULT '{}',
        dimensions_json TEXT NOT NULL DEFAULT '{}',
        tags_json TEXT NOT NULL DEFAULT '[]',
        quality_json TEXT NOT NULL DEFAULT '{}',
        statistics_json TEXT NOT NULL DEFAULT '{}',
        publication_json TEXT NOT NULL DEFAULT '{}',
        deprecation_json TEXT,
        status_history_json TEXT NOT NULL DEFAULT '[]',
        source_candidate_id TEXT,
        source_file TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const RECIPES_INDEX_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_recipes_status ON recipes(status)";
pub const RECIPES_INDEX_LANGUAGE: &str =
    "CREATE INDEX IF NOT EXISTS idx_recipes_language ON recipes(language)";
pub const RECIPES_INDEX_CATEGORY: &str =
    "CREATE INDEX IF NOT EXISTS idx_recipes_category ON recipes(category)";
pub const RECIPES_INDEX_KIND: &str =
    "CREATE INDEX IF NOT EXISTS idx_recipes_kind ON recipes(kind)";
pub const RECIPES_INDEX_SOURCE_FILE: &str =
    "CREATE INDEX IF NOT EXISTS idx_recipes_source_file ON recipes(source_file)";

// --- Candidates ---
pub const CANDIDATES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS candidates (
        id TEXT PRIMARY KEY,
        code TEXT NOT NULL,
        language TEXT NOT NULL,
        category TEXT DEFAULT '',
        source TEXT NOT NULL DEFAULT 'manual',
        reasoning_json TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'pending',
        status_history_json TEXT NOT NULL DEFAULT '[]',
        created_by TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        approved_by TEXT,
        approved_at TEXT,
        rejection_reason TEXT,
        rejected_by TEXT,
        applied_recipe_id TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}'
    )
";

pub const CANDIDATES_INDEX_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_candidates_status ON candidates(status)";
pub const CANDIDATES_INDEX_LANGUAGE: &str =
    "CREATE INDEX IF NOT EXISTS idx_candidates_language ON candidates(language)";
pub const CANDIDATES_INDEX_CREATED_BY: &str =
    "CREATE INDEX IF NOT EXISTS idx_candidates_created_by ON candidates(created_by)";

// --- Snippets ---
pub const SNIPPETS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS snippets (
        id TEXT PRIMARY KEY,
        external_id TEXT NOT NULL,
        title TEXT NOT NULL,
        language TEXT NOT NULL,
        category TEXT DEFAULT '',
        completion_trigger TEXT DEFAULT '',
        summary TEXT DEFAULT '',
        body TEXT NOT NULL,
        installed INTEGER NOT NULL DEFAULT 0,
        installed_path TEXT,
        source_recipe_id TEXT,
        source_candidate_id TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

// --- Knowledge graph ---
pub const KNOWLEDGE_EDGES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS knowledge_edges (
        id TEXT PRIMARY KEY,
        from_id TEXT NOT NULL,
        from_type TEXT NOT NULL,
        to_id TEXT NOT NULL,
        to_type TEXT NOT NULL,
        relation TEXT NOT NULL,
        weight REAL NOT NULL DEFAULT 1.0,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        UNIQUE(from_id, from_type, to_id, to_type, relation)
    )
";

pub const KNOWLEDGE_EDGES_INDEX_FROM: &str =
    "CREATE INDEX IF NOT EXISTS idx_edges_from ON knowledge_edges(from_id)";
pub const KNOWLEDGE_EDGES_INDEX_TO: &str =
    "CREATE INDEX IF NOT EXISTS idx_edges_to ON knowledge_edges(to_id)";

pub const PAGERANK_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pagerank (
        entity_id TEXT PRIMARY KEY,
        score REAL NOT NULL,
        computed_at TEXT NOT NULL
    )
";

// --- Guard violations ---
pub const GUARD_VIOLATIONS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS guard_violations (
        id TEXT PRIMARY KEY,
        file_path TEXT NOT NULL,
        triggered_at TEXT NOT NULL,
        violation_count INTEGER NOT NULL DEFAULT 0,
        summary TEXT DEFAULT '',
        violations_json TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    )
";

// --- Audit log (append-only, never updated) ---
pub const AUDIT_LOGS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS audit_logs (
        id TEXT PRIMARY KEY,
        ts TEXT NOT NULL,
        actor TEXT NOT NULL,
        actor_context TEXT DEFAULT '',
        action TEXT NOT NULL,
        resource TEXT DEFAULT '',
        operation_data TEXT NOT NULL DEFAULT '{}',
        result TEXT NOT NULL,
        error_message TEXT,
        duration_ms INTEGER NOT NULL DEFAULT 0
    )
";

pub const AUDIT_LOGS_INDEX_TS: &str =
    "CREATE INDEX IF NOT EXISTS idx_audit_logs_ts ON audit_logs(ts)";
pub const AUDIT_LOGS_INDEX_ACTION: &str =
    "CREATE INDEX IF NOT EXISTS idx_audit_logs_action ON audit_logs(action)";

// --- Sessions ---
pub const SESSIONS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        scope TEXT NOT NULL,
        scope_id TEXT DEFAULT '',
        context TEXT DEFAULT '',
        metadata_json TEXT NOT NULL DEFAULT '{}',
        actor TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        last_active_at TEXT NOT NULL,
        expired_at TEXT
    )
";

// --- Derived indices (rebuildable caches over recipes + candidates) ---
pub const EMBEDDING_CHUNKS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS embedding_chunks (
        entity_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        dim INTEGER NOT NULL,
        vector BLOB NOT NULL,
        content_snippet TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY(entity_id, entity_type, chunk_index)
    )
";

pub const KEYWORD_TERMS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS keyword_terms (
        term TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        tf INTEGER NOT NULL,
        PRIMARY KEY(term, entity_id, entity_type)
    )
";

pub const KEYWORD_TERMS_INDEX_TERM: &str =
    "CREATE INDEX IF NOT EXISTS idx_keyword_terms_term ON keyword_terms(term)";
pub const KEYWORD_TERMS_INDEX_ENTITY: &str =
    "CREATE INDEX IF NOT EXISTS idx_keyword_terms_entity ON keyword_terms(entity_id)";

pub const INDEX_STATE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS index_state (
        entity_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        indexed_at TEXT NOT NULL,
        embedding_failed INTEGER NOT NULL DEFAULT 0,
        doc_len INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY(entity_id, entity_type)
    )
";
