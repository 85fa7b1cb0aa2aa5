//! Service layer for route-progress
//!
//! Services sit between the HTTP handlers and the engines. They:
//! - Check the caller is acting as themselves
//! - Orchestrate engines and stores
//! - Shape results for clients
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin)
//!     ↓
//! ProgressService (authorization, read models)
//!     ↓
//! SessionLifecycle / CompletionEngine / LeaderboardEngine
//!     ↓
//! ContentStore + ProgressStore
//! ```

pub mod events;
pub mod response;

pub use events::{EventBus, EventListener, ProgressEvent};

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::auth::{authorize, Claims};
use crate::config::Config;
use crate::db::ProgressDb;
use crate::engine::{CompletionEngine, CompletionRequest, CompletionResult, EngineSettings};
use crate::error::ProgressError;
use crate::leaderboard::{Leaderboard, LeaderboardEngine, LeaderboardSettings, RouteStats, Timeframe};
use crate::locks::SessionLocks;
use crate::models::{validate_id, Clock, PlayerSummary, ProgressRecord, Route, RouteSummary, Session};
use crate::session::{SessionLifecycle, SessionState};
use crate::store::{ContentStore, ProgressStore, StartOutcome};

/// A player's standing on one route
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub route_id: String,
    pub state: SessionState,
    pub session: Option<Session>,
    pub completed_checkpoints: Vec<ProgressRecord>,
    pub total_completed: usize,
    pub total_points: i64,
}

/// Route detail, with the caller's completed checkpoints when known
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteView {
    #[serde(flatten)]
    pub route: Route,
    pub total_checkpoints: u32,
    pub total_points: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_checkpoint_ids: Option<Vec<String>>,
}

/// Client-facing operations
pub struct ProgressService {
    content: Arc<dyn ContentStore>,
    progress: Arc<dyn ProgressStore>,
    sessions: SessionLifecycle,
    completions: CompletionEngine,
    leaderboard: Arc<LeaderboardEngine>,
    retry: crate::retry::RetryPolicy,
}

impl ProgressService {
    pub fn new(
        content: Arc<dyn ContentStore>,
        progress: Arc<dyn ProgressStore>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        config: &Config,
    ) -> Self {
        let locks = Arc::new(SessionLocks::new());
        let retry = config.retry_policy();

        let sessions = SessionLifecycle::new(
            content.clone(),
            progress.clone(),
            locks.clone(),
            clock.clone(),
            events.clone(),
            retry,
            config.storage_timeout(),
        );
        let completions = CompletionEngine::new(
            content.clone(),
            progress.clone(),
            locks,
            clock.clone(),
            events,
            EngineSettings {
                geofence_tolerance_m: config.geofence_tolerance_m,
                storage_timeout: config.storage_timeout(),
                retry,
            },
        );
        let leaderboard = Arc::new(LeaderboardEngine::new(
            content.clone(),
            progress.clone(),
            clock,
            LeaderboardSettings {
                max_entries: config.leaderboard_max_entries,
                popular_checkpoints: config.popular_checkpoints,
                stats_ttl: config.stats_cache_ttl(),
                retry,
            },
        ));

        Self {
            content,
            progress,
            sessions,
            completions,
            leaderboard,
            retry,
        }
    }

    pub fn leaderboard_engine(&self) -> Arc<LeaderboardEngine> {
        self.leaderboard.clone()
    }

    pub async fn start_session(
        &self,
        caller: &Claims,
        player_id: &str,
        route_id: &str,
    ) -> Result<StartOutcome, ProgressError> {
        authorize(caller, player_id)?;
        self.sessions.start(player_id, route_id).await
    }

    pub async fn complete_checkpoint(
        &self,
        caller: &Claims,
        request: CompletionRequest,
    ) -> Result<CompletionResult, ProgressError> {
        authorize(caller, &request.player_id)?;
        self.completions.complete_checkpoint(request).await
    }

    pub async fn get_progress(
        &self,
        caller: &Claims,
        player_id: &str,
        route_id: &str,
    ) -> Result<ProgressView, ProgressError> {
        authorize(caller, player_id)?;
        let (state, session) = self.sessions.state(player_id, route_id).await?;

        let completed_checkpoints = self
            .retry
            .run("progress_for", || self.progress.progress_for(player_id, route_id))
            .await?;

        let total_points = completed_checkpoints.iter().map(|r| r.points_earned).sum();
        Ok(ProgressView {
            route_id: route_id.to_string(),
            state,
            session,
            total_completed: completed_checkpoints.len(),
            completed_checkpoints,
            total_points,
        })
    }

    pub async fn get_leaderboard(
        &self,
        route_id: &str,
        timeframe: Timeframe,
        caller: Option<&Claims>,
    ) -> Result<Leaderboard, ProgressError> {
        self.leaderboard
            .leaderboard(route_id, timeframe, caller.map(|c| c.player_id.as_str()))
            .await
    }

    pub async fn get_route_stats(&self, route_id: &str) -> Result<RouteStats, ProgressError> {
        self.leaderboard.route_stats(route_id).await
    }

    pub async fn list_routes(&self) -> Result<Vec<RouteSummary>, ProgressError> {
        Ok(self
            .retry
            .run("list_routes", || self.content.list_routes())
            .await?)
    }

    pub async fn get_route(
        &self,
        route_id: &str,
        caller: Option<&Claims>,
    ) -> Result<RouteView, ProgressError> {
        validate_id("routeId", route_id)?;
        let route = self
            .retry
            .run("get_route", || self.content.get_route(route_id))
            .await?
            .filter(|route| route.is_active)
            .ok_or_else(|| ProgressError::NotFound(format!("Route {} not found", route_id)))?;

        let completed_checkpoint_ids = match caller {
            Some(claims) => {
                let records = self
                    .retry
                    .run("progress_for", || {
                        self.progress.progress_for(&claims.player_id, route_id)
                    })
                    .await?;
                Some(records.into_iter().map(|r| r.checkpoint_id).collect())
            }
            None => None,
        };

        Ok(RouteView {
            total_checkpoints: route.total_checkpoints(),
            total_points: route.total_points(),
            route,
            completed_checkpoint_ids,
        })
    }

    pub async fn get_player_summary(
        &self,
        caller: &Claims,
        player_id: &str,
    ) -> Result<PlayerSummary, ProgressError> {
        authorize(caller, player_id)?;
        Ok(self
            .retry
            .run("player_summary", || self.progress.player_summary(player_id))
            .await?)
    }
}

/// Service container handed to the HTTP server
pub struct Services {
    pub progress: Arc<ProgressService>,
    pub events: Arc<EventBus>,
    pub db: ProgressDb,
}

impl Services {
    /// Wire every service over one database
    pub fn new(db: ProgressDb, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let events = Arc::new(EventBus::new());
        let store = Arc::new(db.clone());

        Self {
            progress: Arc::new(ProgressService::new(
                store.clone(),
                store,
                clock,
                events.clone(),
                config,
            )),
            events,
            db,
        }
    }

    /// Start the audit log and stats cache invalidation listeners
    pub fn spawn_listeners(&self) -> Vec<JoinHandle<()>> {
        vec![
            events::spawn_listener(&self.events, Arc::new(events::LoggingEventListener)),
            events::spawn_listener(&self.events, self.progress.leaderboard_engine()),
        ]
    }
}
