// src/db/migration_helpers.rs
// Database migration helper utilities

use rusqlite::Connection;

/// Check if a table exists in the database
pub fn table_exists(conn: &Connection, table_name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?",
        [table_name],
        |_| Ok(true),
    ).unwrap_or(false)
}
