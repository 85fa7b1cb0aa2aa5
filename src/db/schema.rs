//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(CONTENT_SCHEMA)?;
    conn.execute_batch(PROGRESS_SCHEMA)?;
    conn.execute_batch(INDEXES_SCHEMA)?;
    Ok(())
}

/// Route content, seeded outside the request path
const CONTENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS routes (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    route_id TEXT NOT NULL,
    id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    radius_m REAL NOT NULL DEFAULT 30,
    reward_points INTEGER NOT NULL DEFAULT 0,
    reward_seal TEXT,
    reward_text TEXT,
    order_index INTEGER NOT NULL,
    PRIMARY KEY (route_id, id),
    FOREIGN KEY (route_id) REFERENCES routes(id) ON DELETE CASCADE
);
"#;

/// Sessions and progress records
const PROGRESS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY NOT NULL,
    player_id TEXT NOT NULL,
    route_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    total_points INTEGER NOT NULL DEFAULT 0,
    is_completed INTEGER NOT NULL DEFAULT 0,
    total_time_ms INTEGER
);

-- Each checkpoint can be completed once per (player, route) lineage
CREATE TABLE IF NOT EXISTS progress (
    id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    player_id TEXT NOT NULL,
    route_id TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    points_earned INTEGER NOT NULL DEFAULT 0,
    puzzle_data TEXT,
    UNIQUE (player_id, route_id, checkpoint_id),
    FOREIGN KEY (session_id) REFERENCES sessions(id)
);
"#;

const INDEXES_SCHEMA: &str = r#"
-- At most one active session per (player, route)
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active
    ON sessions(player_id, route_id) WHERE is_completed = 0;

CREATE INDEX IF NOT EXISTS idx_sessions_route_started ON sessions(route_id, started_at);
CREATE INDEX IF NOT EXISTS idx_sessions_player ON sessions(player_id);
CREATE INDEX IF NOT EXISTS idx_progress_session ON progress(session_id);
CREATE INDEX IF NOT EXISTS idx_progress_route_checkpoint ON progress(route_id, checkpoint_id);
CREATE INDEX IF NOT EXISTS idx_checkpoints_order ON checkpoints(route_id, order_index);
"#;
