//! Session and progress record operations
//!
//! Writes run inside IMMEDIATE transactions so the write lock is taken up front
//! and concurrent completions for the same session serialize at BEGIN rather
//! than failing at COMMIT.

use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use super::{format_ts, parse_ts};
use crate::error::{is_unique_violation, StoreError};
use crate::models::{CheckpointPopularity, PlayerSummary, ProgressRecord, Session, SessionStanding};
use crate::session;
use crate::store::{CompletionCommit, CompletionWrite, StartOutcome};

fn session_from_row(row: &Row) -> Result<Session, rusqlite::Error> {
    let started_at: String = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    Ok(Session {
        id: row.get("id")?,
        player_id: row.get("player_id")?,
        route_id: row.get("route_id")?,
        started_at: parse_ts(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        total_points: row.get("total_points")?,
        is_completed: row.get::<_, i64>("is_completed")? != 0,
        total_time_ms: row.get("total_time_ms")?,
    })
}

fn progress_from_row(row: &Row) -> Result<ProgressRecord, rusqlite::Error> {
    let completed_at: String = row.get("completed_at")?;
    Ok(ProgressRecord {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        player_id: row.get("player_id")?,
        route_id: row.get("route_id")?,
        checkpoint_id: row.get("checkpoint_id")?,
        completed_at: parse_ts(&completed_at)?,
        points_earned: row.get("points_earned")?,
        puzzle_data: row.get("puzzle_data")?,
    })
}

/// Fail with `Timeout` once the caller's deadline has passed, otherwise bound
/// SQLite's busy wait by what is left of it
fn arm_deadline(conn: &Connection, deadline: Instant, op: &str) -> Result<(), StoreError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(StoreError::Timeout(format!("{} deadline passed before start", op)));
    }
    conn.busy_timeout(remaining)?;
    Ok(())
}

fn check_deadline(deadline: Instant, op: &str) -> Result<(), StoreError> {
    if Instant::now() >= deadline {
        return Err(StoreError::Timeout(format!("{} deadline passed before commit", op)));
    }
    Ok(())
}

fn insert_session(
    conn: &Connection,
    player_id: &str,
    route_id: &str,
    now: DateTime<Utc>,
) -> Result<Session, StoreError> {
    let session = Session {
        id: Uuid::new_v4().to_string(),
        player_id: player_id.to_string(),
        route_id: route_id.to_string(),
        started_at: now,
        completed_at: None,
        total_points: 0,
        is_completed: false,
        total_time_ms: None,
    };

    conn.execute(
        r#"
        INSERT INTO sessions (id, player_id, route_id, started_at, total_points, is_completed)
        VALUES (?1, ?2, ?3, ?4, 0, 0)
        "#,
        params![session.id, session.player_id, session.route_id, format_ts(now)],
    )?;

    Ok(session)
}

fn active_session(
    conn: &Connection,
    player_id: &str,
    route_id: &str,
) -> Result<Option<Session>, StoreError> {
    let session = conn
        .query_row(
            "SELECT * FROM sessions WHERE player_id = ? AND route_id = ? AND is_completed = 0",
            params![player_id, route_id],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

/// Most recent session for (player, route), preferring the active one
pub fn latest_session(
    conn: &Connection,
    player_id: &str,
    route_id: &str,
) -> Result<Option<Session>, StoreError> {
    let session = conn
        .query_row(
            r#"
            SELECT * FROM sessions
            WHERE player_id = ? AND route_id = ?
            ORDER BY is_completed ASC, started_at DESC
            LIMIT 1
            "#,
            params![player_id, route_id],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

/// Return the active session or open a new one. Completed sessions are
/// history; starting again after one opens a fresh active session.
pub fn start_session(
    conn: &mut Connection,
    player_id: &str,
    route_id: &str,
    now: DateTime<Utc>,
    deadline: Instant,
) -> Result<StartOutcome, StoreError> {
    arm_deadline(conn, deadline, "start_session")?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(session) = active_session(&tx, player_id, route_id)? {
        return Ok(StartOutcome {
            session,
            created: false,
        });
    }

    let session = insert_session(&tx, player_id, route_id, now)?;

    check_deadline(deadline, "start_session")?;
    tx.commit()?;

    debug!(session_id = %session.id, player_id, route_id, "Session started");
    Ok(StartOutcome {
        session,
        created: true,
    })
}

/// Insert a progress record, credit its session and complete the session
/// when every checkpoint of the route is done. One transaction.
pub fn record_completion(
    conn: &mut Connection,
    write: &CompletionWrite,
) -> Result<CompletionCommit, StoreError> {
    arm_deadline(conn, write.deadline, "record_completion")?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut session = match active_session(&tx, &write.player_id, &write.route_id)? {
        Some(session) => session,
        None => {
            if latest_session(&tx, &write.player_id, &write.route_id)?.is_some() {
                // Only completed sessions remain. A new attempt needs an explicit start.
                let repeated: bool = tx.query_row(
                    r#"
                    SELECT EXISTS(
                        SELECT 1 FROM progress
                        WHERE player_id = ? AND route_id = ? AND checkpoint_id = ?
                    )
                    "#,
                    params![write.player_id, write.route_id, write.checkpoint_id],
                    |row| row.get(0),
                )?;
                return Err(if repeated {
                    StoreError::DuplicateCompletion {
                        checkpoint_id: write.checkpoint_id.clone(),
                    }
                } else {
                    StoreError::LineageCompleted {
                        player_id: write.player_id.clone(),
                        route_id: write.route_id.clone(),
                        checkpoint_id: write.checkpoint_id.clone(),
                    }
                });
            }
            insert_session(&tx, &write.player_id, &write.route_id, write.now)?
        }
    };

    let record = ProgressRecord {
        id: Uuid::new_v4().to_string(),
        session_id: session.id.clone(),
        player_id: write.player_id.clone(),
        route_id: write.route_id.clone(),
        checkpoint_id: write.checkpoint_id.clone(),
        completed_at: write.now,
        points_earned: write.points as i64,
        puzzle_data: write.puzzle_data.clone(),
    };

    let inserted = tx.execute(
        r#"
        INSERT INTO progress (
            id, session_id, player_id, route_id, checkpoint_id,
            completed_at, points_earned, puzzle_data
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            record.id,
            record.session_id,
            record.player_id,
            record.route_id,
            record.checkpoint_id,
            format_ts(record.completed_at),
            record.points_earned,
            record.puzzle_data,
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(StoreError::DuplicateCompletion {
                checkpoint_id: write.checkpoint_id.clone(),
            });
        }
        Err(e) => return Err(e.into()),
    }

    tx.execute(
        "UPDATE sessions SET total_points = total_points + ? WHERE id = ?",
        params![record.points_earned, session.id],
    )?;
    session.total_points += record.points_earned;

    let completed_count: u32 = tx.query_row(
        "SELECT COUNT(DISTINCT checkpoint_id) FROM progress WHERE session_id = ?",
        params![session.id],
        |row| row.get(0),
    )?;

    let route_completed = write.total_checkpoints > 0 && completed_count >= write.total_checkpoints;
    if route_completed {
        session = session::complete(&session, write.now)?;
        let updated = tx.execute(
            r#"
            UPDATE sessions
            SET is_completed = 1, completed_at = ?1, total_time_ms = ?2
            WHERE id = ?3 AND is_completed = 0
            "#,
            params![
                session.completed_at.map(format_ts),
                session.total_time_ms,
                session.id,
            ],
        )?;
        if updated != 1 {
            return Err(StoreError::Transition(format!(
                "session {} was completed concurrently",
                session.id
            )));
        }
    }

    // Dropping the transaction rolls it back
    check_deadline(write.deadline, "record_completion")?;
    tx.commit()?;

    debug!(
        session_id = %session.id,
        checkpoint_id = %record.checkpoint_id,
        completed_count,
        route_completed,
        "Progress recorded"
    );

    Ok(CompletionCommit {
        record,
        session,
        completed_count,
        route_completed,
    })
}

/// Completed checkpoints for (player, route) in route order
pub fn progress_for(
    conn: &Connection,
    player_id: &str,
    route_id: &str,
) -> Result<Vec<ProgressRecord>, StoreError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT p.* FROM progress p
        LEFT JOIN checkpoints c ON c.route_id = p.route_id AND c.id = p.checkpoint_id
        WHERE p.player_id = ? AND p.route_id = ?
        ORDER BY COALESCE(c.order_index, 2147483647), p.completed_at
        "#,
    )?;

    let records = stmt
        .query_map(params![player_id, route_id], progress_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

/// Sessions of a route started at or after `since`, with distinct checkpoint counts
pub fn route_standings(
    conn: &Connection,
    route_id: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<SessionStanding>, StoreError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT s.*,
               (SELECT COUNT(DISTINCT p.checkpoint_id) FROM progress p
                WHERE p.session_id = s.id) AS checkpoints_completed
        FROM sessions s
        WHERE s.route_id = ?1 AND (?2 IS NULL OR s.started_at >= ?2)
        "#,
    )?;

    let standings = stmt
        .query_map(params![route_id, since.map(format_ts)], |row| {
            Ok(SessionStanding {
                session: session_from_row(row)?,
                checkpoints_completed: row.get("checkpoints_completed")?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(standings)
}

/// Completion count for every checkpoint of a route, most popular first
pub fn checkpoint_popularity(
    conn: &Connection,
    route_id: &str,
) -> Result<Vec<CheckpointPopularity>, StoreError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT c.id, c.name, c.order_index, COUNT(p.id) AS completion_count
        FROM checkpoints c
        LEFT JOIN progress p ON p.route_id = c.route_id AND p.checkpoint_id = c.id
        WHERE c.route_id = ?
        GROUP BY c.id, c.name, c.order_index
        ORDER BY completion_count DESC, c.order_index ASC
        "#,
    )?;

    let rows = stmt
        .query_map(params![route_id], |row| {
            Ok(CheckpointPopularity {
                checkpoint_id: row.get("id")?,
                name: row.get("name")?,
                order_index: row.get("order_index")?,
                completion_count: row.get::<_, i64>("completion_count")?.max(0) as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Totals for one player across every route
pub fn player_summary(conn: &Connection, player_id: &str) -> Result<PlayerSummary, StoreError> {
    let (routes_started, routes_completed, total_points): (i64, i64, i64) = conn.query_row(
        r#"
        SELECT COUNT(DISTINCT route_id),
               COUNT(DISTINCT CASE WHEN is_completed = 1 THEN route_id END),
               COALESCE(SUM(total_points), 0)
        FROM sessions WHERE player_id = ?
        "#,
        params![player_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let checkpoints_completed: i64 = conn.query_row(
        "SELECT COUNT(*) FROM progress WHERE player_id = ?",
        params![player_id],
        |row| row.get(0),
    )?;

    Ok(PlayerSummary {
        player_id: player_id.to_string(),
        routes_started: routes_started.max(0) as u64,
        routes_completed: routes_completed.max(0) as u64,
        total_points,
        checkpoints_completed: checkpoints_completed.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::content::{upsert_route, CreateRouteInput};
    use crate::db::schema::init_schema;
    use chrono::TimeZone;
    use std::time::Duration;

    fn setup() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let input: CreateRouteInput = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "name": "Two Stops",
            "checkpoints": [
                {"id": "a", "name": "A", "latitude": 46.9481, "longitude": 7.4474,
                 "reward": {"points": 100}, "orderIndex": 1},
                {"id": "b", "name": "B", "latitude": 46.9472, "longitude": 7.4518,
                 "reward": {"points": 120}, "orderIndex": 2}
            ]
        }))
        .unwrap();
        upsert_route(&mut conn, &input).unwrap();
        conn
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn write(checkpoint: &str, points: u32, now: DateTime<Utc>) -> CompletionWrite {
        CompletionWrite {
            player_id: "p1".into(),
            route_id: "r1".into(),
            checkpoint_id: checkpoint.into(),
            points,
            puzzle_data: Some(serde_json::json!({"answer": 42})),
            total_checkpoints: 2,
            now,
            deadline: later(),
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut conn = setup();
        let first = start_session(&mut conn, "p1", "r1", t(0), later()).unwrap();
        assert!(first.created);
        assert!(!first.session.is_completed);

        let second = start_session(&mut conn, "p1", "r1", t(60), later()).unwrap();
        assert!(!second.created);
        assert_eq!(second.session, first.session);
    }

    #[test]
    fn test_completion_flow_completes_session() {
        let mut conn = setup();
        start_session(&mut conn, "p1", "r1", t(0), later()).unwrap();

        let first = record_completion(&mut conn, &write("a", 100, t(300))).unwrap();
        assert!(!first.route_completed);
        assert_eq!(first.completed_count, 1);
        assert_eq!(first.session.total_points, 100);

        let second = record_completion(&mut conn, &write("b", 120, t(900))).unwrap();
        assert!(second.route_completed);
        assert_eq!(second.session.total_points, 220);
        assert_eq!(second.session.total_time_ms, Some(900_000));
        assert_eq!(second.session.completed_at, Some(t(900)));

        let stored = latest_session(&conn, "p1", "r1").unwrap().unwrap();
        assert_eq!(stored, second.session);

        let records = progress_for(&conn, "p1", "r1").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].checkpoint_id, "a");
        assert_eq!(records[0].puzzle_data, Some(serde_json::json!({"answer": 42})));
    }

    #[test]
    fn test_duplicate_leaves_no_trace() {
        let mut conn = setup();
        record_completion(&mut conn, &write("a", 100, t(10))).unwrap();

        let err = record_completion(&mut conn, &write("a", 100, t(20))).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCompletion { ref checkpoint_id } if checkpoint_id == "a"));

        let session = latest_session(&conn, "p1", "r1").unwrap().unwrap();
        assert_eq!(session.total_points, 100);
        assert_eq!(progress_for(&conn, "p1", "r1").unwrap().len(), 1);
    }

    #[test]
    fn test_completion_without_start_opens_session() {
        let mut conn = setup();
        let commit = record_completion(&mut conn, &write("b", 120, t(5))).unwrap();
        assert_eq!(commit.session.started_at, t(5));
        assert_eq!(commit.record.session_id, commit.session.id);
    }

    #[test]
    fn test_completed_lineage_rejects_further_writes() {
        let mut conn = setup();
        record_completion(&mut conn, &write("a", 100, t(0))).unwrap();
        record_completion(&mut conn, &write("b", 120, t(60))).unwrap();

        let err = record_completion(&mut conn, &write("a", 100, t(90))).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCompletion { .. }));

        let err = record_completion(&mut conn, &write("c", 10, t(90))).unwrap_err();
        assert!(matches!(
            err,
            StoreError::LineageCompleted { ref checkpoint_id, .. } if checkpoint_id == "c"
        ));
    }

    #[test]
    fn test_start_after_completion_opens_new_session() {
        let mut conn = setup();
        let first = start_session(&mut conn, "p1", "r1", t(0), later()).unwrap();
        record_completion(&mut conn, &write("a", 100, t(30))).unwrap();
        record_completion(&mut conn, &write("b", 120, t(60))).unwrap();

        let again = start_session(&mut conn, "p1", "r1", t(120), later()).unwrap();
        assert!(again.created);
        assert!(!again.session.is_completed);
        assert_ne!(again.session.id, first.session.id);
        assert_eq!(again.session.started_at, t(120));
        assert_eq!(again.session.total_points, 0);

        // Checkpoints from the finished session stay done
        let err = record_completion(&mut conn, &write("a", 100, t(150))).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCompletion { .. }));
        let active = active_session(&conn, "p1", "r1").unwrap().unwrap();
        assert_eq!(active.id, again.session.id);
        assert_eq!(active.total_points, 0);
        assert_eq!(progress_for(&conn, "p1", "r1").unwrap().len(), 2);

        let repeat = start_session(&mut conn, "p1", "r1", t(180), later()).unwrap();
        assert!(!repeat.created);
        assert_eq!(repeat.session.id, again.session.id);
        assert_eq!(route_standings(&conn, "r1", None).unwrap().len(), 2);
    }

    #[test]
    fn test_expired_deadline_writes_nothing() {
        let mut conn = setup();
        let mut expired = write("a", 100, t(0));
        expired.deadline = Instant::now();

        let err = record_completion(&mut conn, &expired).unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(latest_session(&conn, "p1", "r1").unwrap().is_none());
        assert!(progress_for(&conn, "p1", "r1").unwrap().is_empty());
    }

    #[test]
    fn test_failure_after_writes_rolls_back_everything() {
        let mut conn = setup();
        record_completion(&mut conn, &write("a", 100, t(0))).unwrap();

        // Fails the completing UPDATE, after the insert and the points update ran
        conn.execute_batch(
            r#"
            CREATE TRIGGER fail_session_completion
            AFTER UPDATE OF is_completed ON sessions WHEN NEW.is_completed = 1
            BEGIN SELECT RAISE(ABORT, 'completion rejected'); END;
            "#,
        )
        .unwrap();

        let err = record_completion(&mut conn, &write("b", 120, t(60))).unwrap_err();
        assert!(!matches!(err, StoreError::DuplicateCompletion { .. }));

        let session = latest_session(&conn, "p1", "r1").unwrap().unwrap();
        assert_eq!(session.total_points, 100);
        assert!(!session.is_completed);
        let records = progress_for(&conn, "p1", "r1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].checkpoint_id, "a");

        // Nothing left half-written: the retry succeeds once the fault is gone
        conn.execute_batch("DROP TRIGGER fail_session_completion").unwrap();
        let commit = record_completion(&mut conn, &write("b", 120, t(60))).unwrap();
        assert!(commit.route_completed);
        assert_eq!(commit.session.total_points, 220);
    }

    #[test]
    fn test_standings_respect_since() {
        let mut conn = setup();
        start_session(&mut conn, "p1", "r1", t(0), later()).unwrap();
        record_completion(&mut conn, &write("a", 100, t(30))).unwrap();
        start_session(&mut conn, "p2", "r1", t(3600), later()).unwrap();

        let all = route_standings(&conn, "r1", None).unwrap();
        assert_eq!(all.len(), 2);
        let p1 = all.iter().find(|s| s.session.player_id == "p1").unwrap();
        assert_eq!(p1.checkpoints_completed, 1);

        let recent = route_standings(&conn, "r1", Some(t(60))).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].session.player_id, "p2");
        assert_eq!(recent[0].checkpoints_completed, 0);
    }

    #[test]
    fn test_popularity_and_summary() {
        let mut conn = setup();
        record_completion(&mut conn, &write("b", 120, t(0))).unwrap();

        let popularity = checkpoint_popularity(&conn, "r1").unwrap();
        assert_eq!(popularity.len(), 2);
        assert_eq!(popularity[0].checkpoint_id, "b");
        assert_eq!(popularity[0].completion_count, 1);
        assert_eq!(popularity[1].completion_count, 0);

        let summary = player_summary(&conn, "p1").unwrap();
        assert_eq!(summary.routes_started, 1);
        assert_eq!(summary.routes_completed, 0);
        assert_eq!(summary.total_points, 120);
        assert_eq!(summary.checkpoints_completed, 1);
        assert_eq!(player_summary(&conn, "ghost").unwrap().routes_started, 0);
    }
}
