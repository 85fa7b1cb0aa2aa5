//! Storage seams
//!
//! ```text
//! ProgressService
//!     ↓
//! SessionLifecycle / CompletionEngine / LeaderboardEngine
//!     ↓
//! ContentStore + ProgressStore (traits, this module)
//!     ↓
//! ProgressDb (SQLite, db/*.rs)
//! ```
//!
//! Every `ProgressStore` write is one transaction: it either applies fully or
//! leaves no trace. Writes carry a deadline; a backend must roll back rather
//! than commit after it.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{
    Checkpoint, CheckpointPopularity, PlayerSummary, ProgressRecord, Route, RouteSummary, Session,
    SessionStanding,
};

/// Read-only route content
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Route with checkpoints ordered by `order_index`
    async fn get_route(&self, route_id: &str) -> Result<Option<Route>, StoreError>;

    /// Checkpoint only if it belongs to `route_id`
    async fn get_checkpoint(
        &self,
        route_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, StoreError>;

    async fn list_routes(&self) -> Result<Vec<RouteSummary>, StoreError>;
}

/// Result of a start request
#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub session: Session,
    /// False when an existing session was returned unchanged
    pub created: bool,
}

/// Everything the completion transaction needs, resolved before it begins
#[derive(Debug, Clone)]
pub struct CompletionWrite {
    pub player_id: String,
    pub route_id: String,
    pub checkpoint_id: String,
    pub points: u32,
    pub puzzle_data: Option<serde_json::Value>,
    pub total_checkpoints: u32,
    pub now: DateTime<Utc>,
    pub deadline: Instant,
}

/// What the completion transaction committed
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionCommit {
    pub record: ProgressRecord,
    /// Session state after the transaction
    pub session: Session,
    pub completed_count: u32,
    pub route_completed: bool,
}

/// Durable sessions and progress records
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Return the player's active session for the route, creating one if none is active
    async fn start_session(
        &self,
        player_id: &str,
        route_id: &str,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<StartOutcome, StoreError>;

    /// Record a checkpoint completion, credit the session and complete it when
    /// the last checkpoint lands. Fails with `DuplicateCompletion` on a repeat.
    async fn record_completion(&self, write: CompletionWrite)
        -> Result<CompletionCommit, StoreError>;

    /// Most recent session for (player, route)
    async fn latest_session(
        &self,
        player_id: &str,
        route_id: &str,
    ) -> Result<Option<Session>, StoreError>;

    /// Completed checkpoints for (player, route), in route order
    async fn progress_for(
        &self,
        player_id: &str,
        route_id: &str,
    ) -> Result<Vec<ProgressRecord>, StoreError>;

    /// All sessions of a route started at or after `since`
    async fn route_standings(
        &self,
        route_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionStanding>, StoreError>;

    /// Completion count per checkpoint of a route, zero counts included
    async fn checkpoint_popularity(
        &self,
        route_id: &str,
    ) -> Result<Vec<CheckpointPopularity>, StoreError>;

    async fn player_summary(&self, player_id: &str) -> Result<PlayerSummary, StoreError>;
}
