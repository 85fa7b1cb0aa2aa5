//! SQLite backend for route content, sessions and progress
//!
//! ## Tables
//!
//! - `routes` / `checkpoints` - seeded route content, read-only at runtime
//! - `sessions` - one row per (player, route) attempt; at most one active
//! - `progress` - one row per completed checkpoint, UNIQUE per (player, route, checkpoint)
//!
//! All access goes through a single connection behind a mutex. Async callers
//! hop onto the blocking pool so a slow transaction never stalls the runtime.

pub mod content;
pub mod progress;
pub mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{
    Checkpoint, CheckpointPopularity, PlayerSummary, ProgressRecord, Route, RouteSummary, Session,
    SessionStanding,
};
use crate::store::{CompletionCommit, CompletionWrite, ContentStore, ProgressStore, StartOutcome};

pub use content::{CreateCheckpointInput, CreateRouteInput};

/// SQLite database for routes and player progress
#[derive(Clone)]
pub struct ProgressDb {
    conn: Arc<Mutex<Connection>>,
}

impl ProgressDb {
    /// Open or create the progress database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        info!("Opening SQLite database at {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::Connection(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Connection(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a read against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Run `f` on the blocking pool with exclusive access to the connection
    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn_mut(f))
            .await
            .map_err(|e| StoreError::Internal(format!("Storage task failed: {}", e)))?
    }

    /// Insert or replace a route and its checkpoints
    pub fn upsert_route(&self, input: &CreateRouteInput) -> Result<(), StoreError> {
        self.with_conn_mut(|conn| content::upsert_route(conn, input))
    }

    /// Cheap liveness probe for the health endpoint
    pub fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

#[async_trait]
impl ContentStore for ProgressDb {
    async fn get_route(&self, route_id: &str) -> Result<Option<Route>, StoreError> {
        let route_id = route_id.to_string();
        self.blocking(move |conn| content::get_route(conn, &route_id)).await
    }

    async fn get_checkpoint(
        &self,
        route_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let route_id = route_id.to_string();
        let checkpoint_id = checkpoint_id.to_string();
        self.blocking(move |conn| content::get_checkpoint(conn, &route_id, &checkpoint_id))
            .await
    }

    async fn list_routes(&self) -> Result<Vec<RouteSummary>, StoreError> {
        self.blocking(|conn| content::list_routes(conn)).await
    }
}

#[async_trait]
impl ProgressStore for ProgressDb {
    async fn start_session(
        &self,
        player_id: &str,
        route_id: &str,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<StartOutcome, StoreError> {
        let player_id = player_id.to_string();
        let route_id = route_id.to_string();
        self.blocking(move |conn| {
            progress::start_session(conn, &player_id, &route_id, now, deadline)
        })
        .await
    }

    async fn record_completion(
        &self,
        write: CompletionWrite,
    ) -> Result<CompletionCommit, StoreError> {
        self.blocking(move |conn| progress::record_completion(conn, &write))
            .await
    }

    async fn latest_session(
        &self,
        player_id: &str,
        route_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let player_id = player_id.to_string();
        let route_id = route_id.to_string();
        self.blocking(move |conn| progress::latest_session(conn, &player_id, &route_id))
            .await
    }

    async fn progress_for(
        &self,
        player_id: &str,
        route_id: &str,
    ) -> Result<Vec<ProgressRecord>, StoreError> {
        let player_id = player_id.to_string();
        let route_id = route_id.to_string();
        self.blocking(move |conn| progress::progress_for(conn, &player_id, &route_id))
            .await
    }

    async fn route_standings(
        &self,
        route_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionStanding>, StoreError> {
        let route_id = route_id.to_string();
        self.blocking(move |conn| progress::route_standings(conn, &route_id, since))
            .await
    }

    async fn checkpoint_popularity(
        &self,
        route_id: &str,
    ) -> Result<Vec<CheckpointPopularity>, StoreError> {
        let route_id = route_id.to_string();
        self.blocking(move |conn| progress::checkpoint_popularity(conn, &route_id))
            .await
    }

    async fn player_summary(&self, player_id: &str) -> Result<PlayerSummary, StoreError> {
        let player_id = player_id.to_string();
        self.blocking(move |conn| progress::player_summary(conn, &player_id))
            .await
    }
}

/// Timestamps are stored as RFC 3339 text with millisecond precision, so
/// lexical order matches chronological order.
pub(crate) fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format_round_trips() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap()
            + chrono::Duration::milliseconds(589);
        let raw = format_ts(at);
        assert_eq!(raw, "2026-03-14T09:26:53.589Z");
        assert_eq!(parse_ts(&raw).unwrap(), at);
        assert!(parse_ts("yesterday").is_err());
    }

    #[test]
    fn test_open_on_disk_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("progress.db");

        let db = ProgressDb::open(&path).unwrap();
        db.ping().unwrap();
        drop(db);

        // Reopening an initialized file is a no-op migration
        let db = ProgressDb::open(&path).unwrap();
        db.ping().unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_async_reads_go_through_blocking_pool() {
        let db = ProgressDb::open_in_memory().unwrap();
        assert!(db.get_route("missing").await.unwrap().is_none());
        assert!(db.list_routes().await.unwrap().is_empty());
        assert_eq!(
            db.player_summary("nobody").await.unwrap().routes_started,
            0
        );
    }
}
