//! Domain types shared by the store, engines and HTTP layer
//!
//! Route and checkpoint content is immutable at runtime. Sessions and progress
//! records are the only mutable state and are owned by the progress store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProgressError;
use crate::geofence::GeoPoint;

/// Longest accepted player, route or checkpoint id
pub const MAX_ID_LEN: usize = 255;

/// Reject empty, oversized or non-printable identifiers
pub fn validate_id(field: &str, value: &str) -> Result<(), ProgressError> {
    if value.trim().is_empty() {
        return Err(ProgressError::Validation(format!("{} is required", field)));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ProgressError::Validation(format!(
            "{} must be at most {} bytes",
            field, MAX_ID_LEN
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(ProgressError::Validation(format!(
            "{} contains control characters",
            field
        )));
    }
    Ok(())
}

// ============================================================================
// Content
// ============================================================================

/// Reward attached to a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    pub points: u32,
    /// Opaque seal token rendered by the client
    #[serde(default)]
    pub seal: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// A geofenced location on a route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub route_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub position: GeoPoint,
    pub radius_m: f64,
    pub reward: Reward,
    pub order_index: i32,
}

/// A route with its checkpoints in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub is_active: bool,
    pub checkpoints: Vec<Checkpoint>,
}

impl Route {
    pub fn total_checkpoints(&self) -> u32 {
        self.checkpoints.len() as u32
    }

    /// Sum of all checkpoint rewards
    pub fn total_points(&self) -> u64 {
        self.checkpoints.iter().map(|c| c.reward.points as u64).sum()
    }
}

/// Route listing row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub total_checkpoints: u32,
    pub total_points: u64,
}

// ============================================================================
// Progress
// ============================================================================

/// One player's attempt at one route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub player_id: String,
    pub route_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_points: i64,
    pub is_completed: bool,
    /// Set exactly once, when the session completes
    pub total_time_ms: Option<i64>,
}

/// One checkpoint completion, immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub id: String,
    pub session_id: String,
    pub player_id: String,
    pub route_id: String,
    pub checkpoint_id: String,
    pub completed_at: DateTime<Utc>,
    pub points_earned: i64,
    pub puzzle_data: Option<serde_json::Value>,
}

/// Outcome of a puzzle mini-game, produced by the client-side puzzle collaborator.
///
/// Only `passed` is interpreted here; points always come from checkpoint content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PuzzleVerdict {
    pub passed: bool,
    #[serde(default)]
    pub score: Option<u32>,
    /// Puzzle-specific detail, stored verbatim
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl PuzzleVerdict {
    pub fn passed() -> Self {
        Self {
            passed: true,
            score: None,
            payload: None,
        }
    }
}

/// Session plus the number of distinct checkpoints completed in its lineage
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStanding {
    pub session: Session,
    pub checkpoints_completed: u32,
}

/// Completion count for one checkpoint, used by route stats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointPopularity {
    pub checkpoint_id: String,
    pub name: String,
    pub order_index: i32,
    pub completion_count: u64,
}

/// Aggregate progress of one player across all routes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    pub player_id: String,
    pub routes_started: u64,
    pub routes_completed: u64,
    pub total_points: i64,
    pub checkpoints_completed: u64,
}

// ============================================================================
// Time
// ============================================================================

/// Source of "now" for lifecycle timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock, truncated to milliseconds to match what SQLite stores
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_to_millis(Utc::now())
    }
}

pub fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// Format a duration in seconds as `1h 2m 3s`, `2m 3s` or `3s`
pub fn format_duration_secs(total_secs: i64) -> String {
    let total_secs = total_secs.max(0);
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Format a millisecond duration, truncating to whole seconds
pub fn format_duration_ms(ms: i64) -> String {
    format_duration_secs(ms / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration_secs(0), "0s");
        assert_eq!(format_duration_secs(59), "59s");
        assert_eq!(format_duration_secs(900), "15m 0s");
        assert_eq!(format_duration_secs(3723), "1h 2m 3s");
        assert_eq!(format_duration_ms(1_200_999), "20m 0s");
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("routeId", "bern-classic").is_ok());
        assert!(validate_id("routeId", "").is_err());
        assert!(validate_id("routeId", "   ").is_err());
        assert!(validate_id("routeId", "a\nb").is_err());
        assert!(validate_id("routeId", &"x".repeat(MAX_ID_LEN)).is_ok());
        assert!(validate_id("routeId", &"x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_verdict_defaults() {
        let verdict: PuzzleVerdict = serde_json::from_str(r#"{"passed": true}"#).unwrap();
        assert!(verdict.passed);
        assert!(verdict.score.is_none());
        assert!(verdict.payload.is_none());
    }
}
