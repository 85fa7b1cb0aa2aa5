//! Per-route ranking and statistics
//!
//! Ranking is a pure function over session standings so the ordering rules can
//! be tested without storage. The order is total:
//!
//! 1. completed sessions first
//! 2. more points first
//! 3. faster elapsed time first, missing times last
//! 4. earlier start first
//! 5. session id, ascending

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProgressError;
use crate::models::{
    format_duration_ms, validate_id, CheckpointPopularity, Clock, SessionStanding,
};
use crate::retry::RetryPolicy;
use crate::services::events::{EventListener, ProgressEvent};
use crate::store::{ContentStore, ProgressStore};

/// Leaderboard time window, applied to session start times
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    #[default]
    All,
    Week,
    Month,
}

impl Timeframe {
    /// Unrecognized or missing values mean `All`
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("week") => Timeframe::Week,
            Some("month") => Timeframe::Month,
            _ => Timeframe::All,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::All => "all",
            Timeframe::Week => "week",
            Timeframe::Month => "month",
        }
    }

    /// Earliest start time inside the window
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Timeframe::All => None,
            Timeframe::Week => Some(now - chrono::Duration::days(7)),
            Timeframe::Month => Some(now - chrono::Duration::days(30)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub player_id: String,
    pub session_id: String,
    pub total_points: i64,
    pub total_time_ms: Option<i64>,
    pub formatted_time: Option<String>,
    pub is_completed: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub checkpoints_completed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboard {
    pub route_id: String,
    pub timeframe: Timeframe,
    pub entries: Vec<LeaderboardEntry>,
    /// Ranked sessions before the entry cap
    pub total_entries: usize,
    /// Caller's rank in the full list, even when outside the cap
    pub caller_rank: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStats {
    pub route_id: String,
    pub total_players: u64,
    pub completed_players: u64,
    /// Percent, one decimal
    pub completion_rate: f64,
    pub avg_completion_time_ms: Option<i64>,
    pub formatted_avg_time: Option<String>,
    pub best_time_ms: Option<i64>,
    pub formatted_best_time: Option<String>,
    pub highest_points: i64,
    pub average_points: i64,
    pub popular_checkpoints: Vec<CheckpointPopularity>,
}

fn standing_order(a: &SessionStanding, b: &SessionStanding) -> Ordering {
    let (a, b) = (&a.session, &b.session);
    b.is_completed
        .cmp(&a.is_completed)
        .then_with(|| b.total_points.cmp(&a.total_points))
        .then_with(|| match (a.total_time_ms, b.total_time_ms) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.started_at.cmp(&b.started_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Rank standings, cap the result and locate the caller
pub fn rank(
    route_id: &str,
    timeframe: Timeframe,
    mut standings: Vec<SessionStanding>,
    max_entries: usize,
    caller: Option<&str>,
) -> Leaderboard {
    standings.sort_by(standing_order);

    let total_entries = standings.len();
    let caller_rank = caller.and_then(|player_id| {
        standings
            .iter()
            .position(|s| s.session.player_id == player_id)
            .map(|i| i as u32 + 1)
    });

    let entries = standings
        .into_iter()
        .take(max_entries)
        .enumerate()
        .map(|(i, standing)| {
            let session = standing.session;
            LeaderboardEntry {
                rank: i as u32 + 1,
                formatted_time: session.total_time_ms.map(format_duration_ms),
                player_id: session.player_id,
                session_id: session.id,
                total_points: session.total_points,
                total_time_ms: session.total_time_ms,
                is_completed: session.is_completed,
                started_at: session.started_at,
                completed_at: session.completed_at,
                checkpoints_completed: standing.checkpoints_completed,
            }
        })
        .collect();

    Leaderboard {
        route_id: route_id.to_string(),
        timeframe,
        entries,
        total_entries,
        caller_rank,
    }
}

/// Aggregate route statistics from every session of the route
pub fn compute_stats(
    route_id: &str,
    standings: &[SessionStanding],
    mut popularity: Vec<CheckpointPopularity>,
    popular_count: usize,
) -> RouteStats {
    let players: HashSet<&str> = standings.iter().map(|s| s.session.player_id.as_str()).collect();
    let finishers: HashSet<&str> = standings
        .iter()
        .filter(|s| s.session.is_completed)
        .map(|s| s.session.player_id.as_str())
        .collect();

    let total_players = players.len() as u64;
    let completed_players = finishers.len() as u64;
    let completion_rate = if total_players == 0 {
        0.0
    } else {
        (completed_players as f64 * 1000.0 / total_players as f64).round() / 10.0
    };

    let times: Vec<i64> = standings
        .iter()
        .filter(|s| s.session.is_completed)
        .filter_map(|s| s.session.total_time_ms)
        .collect();
    let avg_completion_time_ms = if times.is_empty() {
        None
    } else {
        Some((times.iter().sum::<i64>() as f64 / times.len() as f64).round() as i64)
    };
    let best_time_ms = times.iter().copied().min();

    let highest_points = standings
        .iter()
        .map(|s| s.session.total_points)
        .max()
        .unwrap_or(0);
    let average_points = if standings.is_empty() {
        0
    } else {
        let sum: i64 = standings.iter().map(|s| s.session.total_points).sum();
        (sum as f64 / standings.len() as f64).round() as i64
    };

    popularity.sort_by(|a, b| {
        b.completion_count
            .cmp(&a.completion_count)
            .then_with(|| a.order_index.cmp(&b.order_index))
    });
    popularity.truncate(popular_count);

    RouteStats {
        route_id: route_id.to_string(),
        total_players,
        completed_players,
        completion_rate,
        formatted_avg_time: avg_completion_time_ms.map(format_duration_ms),
        avg_completion_time_ms,
        formatted_best_time: best_time_ms.map(format_duration_ms),
        best_time_ms,
        highest_points,
        average_points,
        popular_checkpoints: popularity,
    }
}

/// Tunables for ranking and stats
#[derive(Debug, Clone, Copy)]
pub struct LeaderboardSettings {
    pub max_entries: usize,
    pub popular_checkpoints: usize,
    /// Zero disables the stats cache
    pub stats_ttl: Duration,
    pub retry: RetryPolicy,
}

struct CachedStats {
    stats: RouteStats,
    computed_at: Instant,
}

pub struct LeaderboardEngine {
    content: Arc<dyn ContentStore>,
    progress: Arc<dyn ProgressStore>,
    clock: Arc<dyn Clock>,
    settings: LeaderboardSettings,
    stats_cache: DashMap<String, CachedStats>,
    /// Bumped on every invalidation; stats computed under an older value are not cached
    generations: DashMap<String, u64>,
}

impl LeaderboardEngine {
    pub fn new(
        content: Arc<dyn ContentStore>,
        progress: Arc<dyn ProgressStore>,
        clock: Arc<dyn Clock>,
        settings: LeaderboardSettings,
    ) -> Self {
        Self {
            content,
            progress,
            clock,
            settings,
            stats_cache: DashMap::new(),
            generations: DashMap::new(),
        }
    }

    async fn require_route(&self, route_id: &str) -> Result<(), ProgressError> {
        validate_id("routeId", route_id)?;
        let route = self
            .settings
            .retry
            .run("get_route", || self.content.get_route(route_id))
            .await?;
        if route.is_none() {
            return Err(ProgressError::NotFound(format!("Route {} not found", route_id)));
        }
        Ok(())
    }

    /// Ranked sessions of a route within a timeframe
    pub async fn leaderboard(
        &self,
        route_id: &str,
        timeframe: Timeframe,
        caller: Option<&str>,
    ) -> Result<Leaderboard, ProgressError> {
        self.require_route(route_id).await?;

        let since = timeframe.since(self.clock.now());
        let standings = self
            .settings
            .retry
            .run("route_standings", || self.progress.route_standings(route_id, since))
            .await?;

        debug!(
            route_id,
            timeframe = timeframe.as_str(),
            sessions = standings.len(),
            "Leaderboard computed"
        );
        Ok(rank(
            route_id,
            timeframe,
            standings,
            self.settings.max_entries,
            caller,
        ))
    }

    /// Aggregate statistics, served from cache while fresh
    pub async fn route_stats(&self, route_id: &str) -> Result<RouteStats, ProgressError> {
        if let Some(cached) = self.cached_stats(route_id) {
            return Ok(cached);
        }

        self.require_route(route_id).await?;

        let generation = self.generation(route_id);
        let retry = self.settings.retry;
        let standings = retry
            .run("route_standings", || self.progress.route_standings(route_id, None))
            .await?;
        let popularity = retry
            .run("checkpoint_popularity", || {
                self.progress.checkpoint_popularity(route_id)
            })
            .await?;

        let stats = compute_stats(
            route_id,
            &standings,
            popularity,
            self.settings.popular_checkpoints,
        );

        self.cache_stats(route_id, generation, &stats);
        Ok(stats)
    }

    fn generation(&self, route_id: &str) -> u64 {
        *self.generations.entry(route_id.to_string()).or_insert(0)
    }

    /// Cache `stats` unless the route was invalidated since `generation` was read
    fn cache_stats(&self, route_id: &str, generation: u64, stats: &RouteStats) {
        if self.settings.stats_ttl.is_zero() {
            return;
        }
        // Holding the generation shard blocks a concurrent invalidation until the insert lands
        let current = self.generations.get(route_id);
        if current.as_deref().copied() != Some(generation) {
            debug!(route_id, "Route stats went stale while computing; not cached");
            return;
        }
        self.stats_cache.insert(
            route_id.to_string(),
            CachedStats {
                stats: stats.clone(),
                computed_at: Instant::now(),
            },
        );
    }

    fn cached_stats(&self, route_id: &str) -> Option<RouteStats> {
        let entry = self.stats_cache.get(route_id)?;
        if entry.computed_at.elapsed() < self.settings.stats_ttl {
            Some(entry.stats.clone())
        } else {
            drop(entry);
            self.stats_cache.remove(route_id);
            None
        }
    }

    /// Drop cached stats for a route
    pub fn invalidate(&self, route_id: &str) {
        *self.generations.entry(route_id.to_string()).or_insert(0) += 1;
        if self.stats_cache.remove(route_id).is_some() {
            debug!(route_id, "Route stats cache invalidated");
        }
    }
}

impl EventListener for LeaderboardEngine {
    fn on_event(&self, event: &ProgressEvent) {
        self.invalidate(event.route_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Session;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn standing(
        id: &str,
        player: &str,
        points: i64,
        time_ms: Option<i64>,
        started: i64,
    ) -> SessionStanding {
        SessionStanding {
            session: Session {
                id: id.into(),
                player_id: player.into(),
                route_id: "r1".into(),
                started_at: t(started),
                completed_at: time_ms.map(|ms| t(started) + chrono::Duration::milliseconds(ms)),
                total_points: points,
                is_completed: time_ms.is_some(),
                total_time_ms: time_ms,
            },
            checkpoints_completed: 0,
        }
    }

    fn players(board: &Leaderboard) -> Vec<&str> {
        board.entries.iter().map(|e| e.player_id.as_str()).collect()
    }

    #[test]
    fn test_faster_time_wins_on_equal_points() {
        let board = rank(
            "r1",
            Timeframe::All,
            vec![
                standing("s1", "slow", 1000, Some(1_200_000), 0),
                standing("s2", "fast", 1000, Some(900_000), 10),
            ],
            100,
            None,
        );
        assert_eq!(players(&board), vec!["fast", "slow"]);
        assert_eq!(board.entries[0].rank, 1);
        assert_eq!(board.entries[0].formatted_time.as_deref(), Some("15m 0s"));
    }

    #[test]
    fn test_completed_beats_higher_points() {
        let board = rank(
            "r1",
            Timeframe::All,
            vec![
                standing("s1", "grinder", 500, None, 0),
                standing("s2", "finisher", 200, Some(600_000), 0),
            ],
            100,
            None,
        );
        assert_eq!(players(&board), vec!["finisher", "grinder"]);
        assert!(board.entries[1].formatted_time.is_none());
    }

    #[test]
    fn test_ties_break_on_start_then_id() {
        let board = rank(
            "r1",
            Timeframe::All,
            vec![
                standing("s-b", "b", 100, None, 5),
                standing("s-c", "c", 100, None, 0),
                standing("s-a", "a", 100, None, 5),
            ],
            100,
            None,
        );
        assert_eq!(players(&board), vec!["c", "a", "b"]);
        let ranks: Vec<u32> = board.entries.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[test]
    fn test_order_is_independent_of_input_order() {
        let input = vec![
            standing("s1", "a", 300, Some(1000), 3),
            standing("s2", "b", 300, None, 1),
            standing("s3", "c", 100, Some(500), 2),
            standing("s4", "d", 300, Some(1000), 3),
            standing("s5", "e", 50, None, 0),
        ];
        let expected = players(&rank("r1", Timeframe::All, input.clone(), 100, None))
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();

        let mut reversed = input;
        reversed.reverse();
        let board = rank("r1", Timeframe::All, reversed, 100, None);
        assert_eq!(players(&board), expected);
        assert_eq!(expected, vec!["a", "d", "c", "b", "e"]);
    }

    #[test]
    fn test_cap_keeps_total_and_caller_rank() {
        let standings: Vec<_> = (0..5)
            .map(|i| standing(&format!("s{}", i), &format!("p{}", i), 100 - i, None, 0))
            .collect();
        let board = rank("r1", Timeframe::Week, standings, 2, Some("p4"));
        assert_eq!(board.entries.len(), 2);
        assert_eq!(board.total_entries, 5);
        assert_eq!(board.caller_rank, Some(5));
        assert_eq!(board.timeframe, Timeframe::Week);

        let board = rank("r1", Timeframe::All, vec![], 2, Some("p4"));
        assert_eq!(board.caller_rank, None);
        assert_eq!(board.total_entries, 0);
    }

    #[test]
    fn test_timeframe_parse_and_window() {
        assert_eq!(Timeframe::parse(Some("week")), Timeframe::Week);
        assert_eq!(Timeframe::parse(Some("MONTH")), Timeframe::Month);
        assert_eq!(Timeframe::parse(Some("fortnight")), Timeframe::All);
        assert_eq!(Timeframe::parse(None), Timeframe::All);

        let now = t(0);
        assert_eq!(Timeframe::All.since(now), None);
        assert_eq!(Timeframe::Week.since(now), Some(now - chrono::Duration::days(7)));
        assert_eq!(Timeframe::Month.since(now), Some(now - chrono::Duration::days(30)));
    }

    #[test]
    fn test_compute_stats() {
        let standings = vec![
            standing("s1", "a", 1000, Some(900_000), 0),
            standing("s2", "b", 1000, Some(1_200_000), 0),
            standing("s3", "c", 250, None, 0),
        ];
        let popularity = vec![
            CheckpointPopularity {
                checkpoint_id: "x".into(),
                name: "X".into(),
                order_index: 2,
                completion_count: 3,
            },
            CheckpointPopularity {
                checkpoint_id: "y".into(),
                name: "Y".into(),
                order_index: 1,
                completion_count: 3,
            },
            CheckpointPopularity {
                checkpoint_id: "z".into(),
                name: "Z".into(),
                order_index: 0,
                completion_count: 1,
            },
        ];

        let stats = compute_stats("r1", &standings, popularity, 2);
        assert_eq!(stats.total_players, 3);
        assert_eq!(stats.completed_players, 2);
        assert_eq!(stats.completion_rate, 66.7);
        assert_eq!(stats.avg_completion_time_ms, Some(1_050_000));
        assert_eq!(stats.formatted_avg_time.as_deref(), Some("17m 30s"));
        assert_eq!(stats.best_time_ms, Some(900_000));
        assert_eq!(stats.highest_points, 1000);
        assert_eq!(stats.average_points, 750);
        let popular: Vec<&str> = stats
            .popular_checkpoints
            .iter()
            .map(|p| p.checkpoint_id.as_str())
            .collect();
        assert_eq!(popular, vec!["y", "x"]);
    }

    #[test]
    fn test_compute_stats_empty_route() {
        let stats = compute_stats("r1", &[], vec![], 5);
        assert_eq!(stats.total_players, 0);
        assert_eq!(stats.completion_rate, 0.0);
        assert!(stats.avg_completion_time_ms.is_none());
        assert_eq!(stats.highest_points, 0);
    }

    #[test]
    fn test_stats_invalidated_while_computing_are_not_cached() {
        let db = crate::db::ProgressDb::open_in_memory().unwrap();
        let engine = LeaderboardEngine::new(
            Arc::new(db.clone()),
            Arc::new(db),
            Arc::new(crate::models::SystemClock),
            LeaderboardSettings {
                max_entries: 100,
                popular_checkpoints: 5,
                stats_ttl: Duration::from_secs(60),
                retry: RetryPolicy::none(),
            },
        );
        let stats = compute_stats("r1", &[], vec![], 5);

        let generation = engine.generation("r1");
        engine.invalidate("r1");
        engine.cache_stats("r1", generation, &stats);
        assert!(engine.cached_stats("r1").is_none());

        let generation = engine.generation("r1");
        engine.cache_stats("r1", generation, &stats);
        assert_eq!(engine.cached_stats("r1"), Some(stats));
    }
}
