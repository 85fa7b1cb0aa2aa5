//! Checkpoint completion
//!
//! A completion is validated, gated by content and geofence, then written as
//! one store transaction under the (player, route) lock:
//!
//! ```text
//! validate input -> checkpoint lookup -> geofence -> lock -> transaction
//!                                                            ├ insert record (UNIQUE)
//!                                                            ├ add points
//!                                                            ├ count distinct
//!                                                            └ complete session if count == total
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{ProgressError, StoreError};
use crate::geofence::{distance_m, is_within_geofence, GeoPoint};
use crate::locks::SessionLocks;
use crate::models::{validate_id, Clock, ProgressRecord, PuzzleVerdict, Reward, Session};
use crate::retry::RetryPolicy;
use crate::services::events::{EventBus, ProgressEvent};
use crate::store::{CompletionWrite, ContentStore, ProgressStore};

/// A player's claim to have solved a checkpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub player_id: String,
    pub route_id: String,
    pub checkpoint_id: String,
    pub location: GeoPoint,
    pub verdict: PuzzleVerdict,
}

/// What a successful completion returns to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub progress: ProgressRecord,
    pub reward: Reward,
    pub route_completed: bool,
    pub session: Session,
    pub completed_checkpoints: u32,
    pub total_checkpoints: u32,
}

/// Tunables shared by every completion
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub geofence_tolerance_m: f64,
    pub storage_timeout: Duration,
    pub retry: RetryPolicy,
}

pub struct CompletionEngine {
    content: Arc<dyn ContentStore>,
    progress: Arc<dyn ProgressStore>,
    locks: Arc<SessionLocks>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    settings: EngineSettings,
}

impl CompletionEngine {
    pub fn new(
        content: Arc<dyn ContentStore>,
        progress: Arc<dyn ProgressStore>,
        locks: Arc<SessionLocks>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            content,
            progress,
            locks,
            clock,
            events,
            settings,
        }
    }

    fn validate(request: &CompletionRequest) -> Result<(), ProgressError> {
        validate_id("playerId", &request.player_id)?;
        validate_id("routeId", &request.route_id)?;
        validate_id("checkpointId", &request.checkpoint_id)?;
        request.location.validate()?;
        if !request.verdict.passed {
            return Err(ProgressError::Validation(
                "Puzzle must be solved before completing the checkpoint".into(),
            ));
        }
        Ok(())
    }

    /// Complete one checkpoint for one player
    pub async fn complete_checkpoint(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResult, ProgressError> {
        Self::validate(&request)?;
        let CompletionRequest {
            player_id,
            route_id,
            checkpoint_id,
            location,
            verdict,
        } = request;
        let retry = self.settings.retry;

        let checkpoint = retry
            .run("get_checkpoint", || {
                self.content.get_checkpoint(&route_id, &checkpoint_id)
            })
            .await?
            .ok_or_else(|| {
                ProgressError::NotFound(format!(
                    "Checkpoint {} not found on route {}",
                    checkpoint_id, route_id
                ))
            })?;

        let route = retry
            .run("get_route", || self.content.get_route(&route_id))
            .await?
            .filter(|route| route.is_active)
            .ok_or_else(|| ProgressError::NotFound(format!("Route {} not found", route_id)))?;

        if !is_within_geofence(
            &location,
            &checkpoint.position,
            checkpoint.radius_m,
            self.settings.geofence_tolerance_m,
        ) {
            let distance = distance_m(&location, &checkpoint.position);
            warn!(
                player_id = %player_id,
                checkpoint_id = %checkpoint_id,
                distance_m = distance,
                radius_m = checkpoint.radius_m,
                "Completion rejected outside geofence"
            );
            return Err(ProgressError::OutOfRange {
                checkpoint_id,
                checkpoint_name: checkpoint.name,
                required_radius_m: checkpoint.radius_m,
                distance_m: distance,
            });
        }

        let puzzle_data = serde_json::to_value(&verdict)
            .map_err(|e| ProgressError::Internal(format!("Failed to encode verdict: {}", e)))?;
        let total_checkpoints = route.total_checkpoints();

        let _guard = self.locks.acquire(&player_id, &route_id).await;
        debug!(player_id = %player_id, checkpoint_id = %checkpoint_id, "Session lock acquired");

        let commit = retry
            .run("record_completion", || {
                // Fresh timestamp and deadline per attempt; nothing survives a rollback
                self.progress.record_completion(CompletionWrite {
                    player_id: player_id.clone(),
                    route_id: route_id.clone(),
                    checkpoint_id: checkpoint_id.clone(),
                    points: checkpoint.reward.points,
                    puzzle_data: Some(puzzle_data.clone()),
                    total_checkpoints,
                    now: self.clock.now(),
                    deadline: Instant::now() + self.settings.storage_timeout,
                })
            })
            .await
            .map_err(|e| {
                match &e {
                    StoreError::DuplicateCompletion { .. } | StoreError::LineageCompleted { .. } => {
                        debug!(player_id = %player_id, checkpoint_id = %checkpoint_id, "Duplicate completion");
                    }
                    _ => {
                        error!(
                            player_id = %player_id,
                            route_id = %route_id,
                            checkpoint_id = %checkpoint_id,
                            error = %e,
                            "Completion transaction failed"
                        );
                    }
                }
                ProgressError::from(e)
            })?;

        info!(
            player_id = %player_id,
            route_id = %route_id,
            checkpoint_id = %checkpoint_id,
            points = checkpoint.reward.points,
            completed = commit.completed_count,
            total = total_checkpoints,
            "Checkpoint completed"
        );

        self.events.emit(ProgressEvent::CheckpointCompleted {
            session_id: commit.session.id.clone(),
            player_id: player_id.clone(),
            route_id: route_id.clone(),
            checkpoint_id: checkpoint_id.clone(),
            points: checkpoint.reward.points,
        });
        if commit.route_completed {
            self.events.emit(ProgressEvent::RouteCompleted {
                session_id: commit.session.id.clone(),
                player_id,
                route_id,
                total_points: commit.session.total_points,
                total_time_ms: commit.session.total_time_ms.unwrap_or_default(),
            });
        }

        Ok(CompletionResult {
            progress: commit.record,
            reward: checkpoint.reward,
            route_completed: commit.route_completed,
            session: commit.session,
            completed_checkpoints: commit.completed_count,
            total_checkpoints,
        })
    }
}
