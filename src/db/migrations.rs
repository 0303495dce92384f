// db/migrations.rs
// Ordered, versioned, idempotent schema migrations for the LCM store (spec §6.3).
//
// Unlike a flatter table_exists-guarded batch, the LCM schema is tracked
// through an explicit `lcm_schema_migrations` table so migrations apply in a
// fixed order exactly once, even as the schema grows new versions over time.

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

use super::migration_helpers::table_exists;

type Migration = (i64, &'static str, &'static str);

const MIGRATIONS: &[Migration] = &[
    (1, "lcm_schema_migrations", MIGRATION_001),
    (2, "lcm_conversations", MIGRATION_002),
    (3, "lcm_messages", MIGRATION_003),
    (4, "lcm_message_parts", MIGRATION_004),
    (5, "lcm_context_items", MIGRATION_005),
    (6, "lcm_lineage_edges", MIGRATION_006),
    (7, "lcm_artifacts", MIGRATION_007),
];

const MIGRATION_001: &str = "
CREATE TABLE IF NOT EXISTS lcm_schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at_ms INTEGER NOT NULL
);
";

const MIGRATION_002: &str = "
CREATE TABLE IF NOT EXISTS lcm_conversations (
    conversation_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    channel TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lcm_conversations_session ON lcm_conversations(session_id);
";

const MIGRATION_003: &str = "
CREATE TABLE IF NOT EXISTS lcm_messages (
    message_id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES lcm_conversations(conversation_id),
    ordinal INTEGER NOT NULL,
    role TEXT NOT NULL,
    author_id TEXT,
    content_text TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at_ms INTEGER NOT NULL,
    UNIQUE(conversation_id, ordinal)
);
CREATE INDEX IF NOT EXISTS idx_lcm_messages_conversation ON lcm_messages(conversation_id, ordinal);
";

const MIGRATION_004: &str = "
CREATE TABLE IF NOT EXISTS lcm_message_parts (
    part_id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES lcm_messages(message_id),
    part_index INTEGER NOT NULL,
    kind TEXT NOT NULL,
    mime_type TEXT,
    text_content TEXT,
    blob_path TEXT,
    token_count INTEGER,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at_ms INTEGER NOT NULL,
    UNIQUE(message_id, part_index)
);
CREATE INDEX IF NOT EXISTS idx_lcm_message_parts_message ON lcm_message_parts(message_id, part_index);
";

const MIGRATION_005: &str = "
CREATE TABLE IF NOT EXISTS lcm_context_items (
    item_id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES lcm_conversations(conversation_id),
    source_message_id TEXT REFERENCES lcm_messages(message_id),
    item_type TEXT NOT NULL,
    depth INTEGER NOT NULL DEFAULT 0,
    title TEXT,
    body TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    tombstoned INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lcm_context_items_active
    ON lcm_context_items(conversation_id, tombstoned, created_at_ms, item_id);
CREATE INDEX IF NOT EXISTS idx_lcm_context_items_source_message
    ON lcm_context_items(source_message_id);
";

const MIGRATION_006: &str = "
CREATE TABLE IF NOT EXISTS lcm_lineage_edges (
    parent_item_id TEXT NOT NULL REFERENCES lcm_context_items(item_id),
    child_item_id TEXT NOT NULL REFERENCES lcm_context_items(item_id),
    relation TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at_ms INTEGER NOT NULL,
    PRIMARY KEY (parent_item_id, child_item_id, relation)
);
CREATE INDEX IF NOT EXISTS idx_lcm_lineage_edges_child ON lcm_lineage_edges(child_item_id);
CREATE INDEX IF NOT EXISTS idx_lcm_lineage_edges_parent ON lcm_lineage_edges(parent_item_id);
";

const MIGRATION_007: &str = "
CREATE TABLE IF NOT EXISTS lcm_artifacts (
    artifact_id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES lcm_conversations(conversation_id),
    message_id TEXT REFERENCES lcm_messages(message_id),
    path TEXT NOT NULL,
    mime_type TEXT,
    bytes INTEGER,
    sha256 TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lcm_artifacts_conversation ON lcm_artifacts(conversation_id);
";

/// Apply every migration not yet recorded in `lcm_schema_migrations`, in order.
/// Safe to call on every open: each step is a no-op once its version is recorded.
pub fn run_all(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001)?;

    for (version, label, sql) in MIGRATIONS {
        let applied: bool = conn
            .query_row(
                "SELECT 1 FROM lcm_schema_migrations WHERE version = ?",
                [version],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if applied {
            continue;
        }

        info!("applying lcm schema migration {} ({})", version, label);
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO lcm_schema_migrations (version, applied_at_ms) VALUES (?, ?)",
            rusqlite::params![version, now_ms()],
        )?;
    }

    Ok(())
}

/// Create the FTS5 shadow table over `lcm_context_items.title||body` (spec
/// §4.1), if this SQLite build supports it. Separate from [`run_all`]
/// because the caller only knows whether FTS5 is available after probing it
/// post-migration (see `pool.rs`).
pub fn ensure_fts(conn: &Connection) -> Result<()> {
    if table_exists(conn, "lcm_context_items_fts") {
        return Ok(());
    }
    conn.execute_batch(
        "CREATE VIRTUAL TABLE lcm_context_items_fts USING fts5(
            item_id UNINDEXED,
            title,
            body,
            content=''
        );",
    )?;
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
