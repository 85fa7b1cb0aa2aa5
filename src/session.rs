//! Session lifecycle: NotStarted -> Active -> Completed
//!
//! `Completed` is terminal for a session. Starting returns the player's active
//! session on the route, or opens a new one when there is none (including
//! after a completed run). Checkpoints stay done across sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{ProgressError, StoreError};
use crate::locks::SessionLocks;
use crate::models::{validate_id, Clock, Session};
use crate::retry::RetryPolicy;
use crate::services::events::{EventBus, ProgressEvent};
use crate::store::{ContentStore, ProgressStore, StartOutcome};

/// Where a player stands on a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    NotStarted,
    Active,
    Completed,
}

impl SessionState {
    pub fn of(session: Option<&Session>) -> Self {
        match session {
            None => SessionState::NotStarted,
            Some(s) if s.is_completed => SessionState::Completed,
            Some(_) => SessionState::Active,
        }
    }
}

/// Active -> Completed. Stamps the completion time and elapsed milliseconds.
pub fn complete(session: &Session, now: DateTime<Utc>) -> Result<Session, StoreError> {
    if session.is_completed {
        return Err(StoreError::Transition(format!(
            "session {} is already completed",
            session.id
        )));
    }

    let elapsed_ms = (now - session.started_at).num_milliseconds().max(0);

    Ok(Session {
        completed_at: Some(now),
        is_completed: true,
        total_time_ms: Some(elapsed_ms),
        ..session.clone()
    })
}

/// Starts sessions and reports their state
pub struct SessionLifecycle {
    content: Arc<dyn ContentStore>,
    progress: Arc<dyn ProgressStore>,
    locks: Arc<SessionLocks>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    retry: RetryPolicy,
    storage_timeout: Duration,
}

impl SessionLifecycle {
    pub fn new(
        content: Arc<dyn ContentStore>,
        progress: Arc<dyn ProgressStore>,
        locks: Arc<SessionLocks>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        retry: RetryPolicy,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            content,
            progress,
            locks,
            clock,
            events,
            retry,
            storage_timeout,
        }
    }

    /// Resume the active session on an active route, or open a new one
    pub async fn start(&self, player_id: &str, route_id: &str) -> Result<StartOutcome, ProgressError> {
        validate_id("playerId", player_id)?;
        validate_id("routeId", route_id)?;

        let route = self
            .retry
            .run("get_route", || self.content.get_route(route_id))
            .await?;
        match route {
            Some(route) if route.is_active => {}
            _ => return Err(ProgressError::NotFound(format!("Route {} not found", route_id))),
        }

        let _guard = self.locks.acquire(player_id, route_id).await;
        let outcome = self
            .retry
            .run("start_session", || {
                let now = self.clock.now();
                let deadline = Instant::now() + self.storage_timeout;
                self.progress.start_session(player_id, route_id, now, deadline)
            })
            .await?;

        if outcome.created {
            info!(
                session_id = %outcome.session.id,
                player_id,
                route_id,
                "Session started"
            );
            self.events.emit(ProgressEvent::SessionStarted {
                session_id: outcome.session.id.clone(),
                player_id: player_id.to_string(),
                route_id: route_id.to_string(),
            });
        }

        Ok(outcome)
    }

    /// Current state and session, if any
    pub async fn state(
        &self,
        player_id: &str,
        route_id: &str,
    ) -> Result<(SessionState, Option<Session>), ProgressError> {
        validate_id("playerId", player_id)?;
        validate_id("routeId", route_id)?;

        let session = self
            .retry
            .run("latest_session", || self.progress.latest_session(player_id, route_id))
            .await?;
        Ok((SessionState::of(session.as_ref()), session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateRouteInput, ProgressDb};
    use crate::models::SystemClock;
    use chrono::TimeZone;

    fn session(started_at: DateTime<Utc>) -> Session {
        Session {
            id: "s1".into(),
            player_id: "p1".into(),
            route_id: "r1".into(),
            started_at,
            completed_at: None,
            total_points: 100,
            is_completed: false,
            total_time_ms: None,
        }
    }

    fn lifecycle(db: &ProgressDb) -> SessionLifecycle {
        SessionLifecycle::new(
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            Arc::new(SessionLocks::new()),
            Arc::new(SystemClock),
            Arc::new(EventBus::new()),
            RetryPolicy::none(),
            Duration::from_secs(5),
        )
    }

    fn seed(db: &ProgressDb, active: bool) {
        let input: CreateRouteInput = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "name": "Route",
            "isActive": active,
            "checkpoints": [
                {"id": "a", "name": "A", "latitude": 0.0, "longitude": 0.0,
                 "reward": {"points": 50}, "orderIndex": 1}
            ]
        }))
        .unwrap();
        db.upsert_route(&input).unwrap();
    }

    #[test]
    fn test_complete_sets_elapsed_once() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let end = start + chrono::Duration::milliseconds(900_250);

        let done = complete(&session(start), end).unwrap();
        assert!(done.is_completed);
        assert_eq!(done.completed_at, Some(end));
        assert_eq!(done.total_time_ms, Some(900_250));
        assert_eq!(done.total_points, 100);

        let again = complete(&done, end + chrono::Duration::seconds(5));
        assert!(matches!(again, Err(StoreError::Transition(_))));
    }

    #[test]
    fn test_state_of() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let active = session(start);
        let done = complete(&active, start).unwrap();
        assert_eq!(SessionState::of(None), SessionState::NotStarted);
        assert_eq!(SessionState::of(Some(&active)), SessionState::Active);
        assert_eq!(SessionState::of(Some(&done)), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_start_creates_then_returns_existing() {
        let db = ProgressDb::open_in_memory().unwrap();
        seed(&db, true);
        let lifecycle = lifecycle(&db);
        let mut events = lifecycle.events.subscribe();

        let first = lifecycle.start("p1", "r1").await.unwrap();
        assert!(first.created);
        assert_eq!(first.session.total_points, 0);

        let second = lifecycle.start("p1", "r1").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.session.id, first.session.id);

        // Only the creating call emits
        assert!(matches!(events.try_recv(), Ok(ProgressEvent::SessionStarted { .. })));
        assert!(events.try_recv().is_err());

        let (state, _) = lifecycle.state("p1", "r1").await.unwrap();
        assert_eq!(state, SessionState::Active);
    }

    #[tokio::test]
    async fn test_start_requires_active_route() {
        let db = ProgressDb::open_in_memory().unwrap();
        let lifecycle = lifecycle(&db);

        let err = lifecycle.start("p1", "r1").await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        seed(&db, false);
        let err = lifecycle.start("p1", "r1").await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        let err = lifecycle.start("", "r1").await.unwrap_err();
        assert_eq!(err.code(), "validation");
    }
}
