/// Schema for cache and queue tables.
///
/// Each entity kind gets its own `cached_<entity>` table. Rows are scoped
/// (e.g. chat history per agent) and keep snapshot order via `position`.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cached_agents (
    scope TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (scope, entity_key)
);

CREATE TABLE IF NOT EXISTS cached_messages (
    scope TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (scope, entity_key)
);

CREATE TABLE IF NOT EXISTS cached_memories (
    scope TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (scope, entity_key)
);

CREATE TABLE IF NOT EXISTS cached_memory_nodes (
    scope TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (scope, entity_key)
);

-- Last full refresh per entity type and scope
CREATE TABLE IF NOT EXISTS cache_refresh (
    entity_type TEXT NOT NULL,
    scope TEXT NOT NULL,
    refreshed_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, scope)
);

-- Durable FIFO of writes waiting for replay
CREATE TABLE IF NOT EXISTS offline_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

-- Provisional (client-generated) id -> server-assigned id
CREATE TABLE IF NOT EXISTS id_mappings (
    local_id TEXT PRIMARY KEY,
    server_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;
