//! Route and checkpoint content operations

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use tracing::debug;

use super::format_ts;
use crate::error::StoreError;
use crate::geofence::GeoPoint;
use crate::models::{Checkpoint, Reward, Route, RouteSummary};

/// Input for creating or replacing a route
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRouteInput {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub checkpoints: Vec<CreateCheckpointInput>,
}

fn default_active() -> bool { true }

/// Input for a checkpoint inside a [`CreateRouteInput`]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckpointInput {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_radius")]
    pub radius_m: f64,
    pub reward: Reward,
    pub order_index: i32,
}

fn default_radius() -> f64 { 30.0 }

fn checkpoint_from_row(row: &Row) -> Result<Checkpoint, rusqlite::Error> {
    Ok(Checkpoint {
        id: row.get("id")?,
        route_id: row.get("route_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        position: GeoPoint {
            latitude: row.get("latitude")?,
            longitude: row.get("longitude")?,
        },
        radius_m: row.get("radius_m")?,
        reward: Reward {
            points: row.get("reward_points")?,
            seal: row.get("reward_seal")?,
            text: row.get("reward_text")?,
        },
        order_index: row.get("order_index")?,
    })
}

/// Get route with checkpoints in order
pub fn get_route(conn: &Connection, id: &str) -> Result<Option<Route>, StoreError> {
    let route = conn
        .query_row(
            "SELECT id, name, description, is_active FROM routes WHERE id = ?",
            params![id],
            |row| {
                Ok(Route {
                    id: row.get("id")?,
                    name: row.get("name")?,
                    description: row.get("description")?,
                    is_active: row.get::<_, i64>("is_active")? != 0,
                    checkpoints: vec![],
                })
            },
        )
        .optional()?;

    match route {
        Some(mut route) => {
            route.checkpoints = get_checkpoints(conn, id)?;
            Ok(Some(route))
        }
        None => Ok(None),
    }
}

/// Checkpoints of a route ordered by `order_index`
pub fn get_checkpoints(conn: &Connection, route_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM checkpoints WHERE route_id = ? ORDER BY order_index, id",
    )?;

    let checkpoints = stmt
        .query_map(params![route_id], checkpoint_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(checkpoints)
}

/// Get a checkpoint scoped to its route
pub fn get_checkpoint(
    conn: &Connection,
    route_id: &str,
    checkpoint_id: &str,
) -> Result<Option<Checkpoint>, StoreError> {
    let checkpoint = conn
        .query_row(
            "SELECT * FROM checkpoints WHERE route_id = ? AND id = ?",
            params![route_id, checkpoint_id],
            checkpoint_from_row,
        )
        .optional()?;

    Ok(checkpoint)
}

/// List active routes with checkpoint totals
pub fn list_routes(conn: &Connection) -> Result<Vec<RouteSummary>, StoreError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT r.id, r.name, r.description,
               COUNT(c.id) AS total_checkpoints,
               COALESCE(SUM(c.reward_points), 0) AS total_points
        FROM routes r
        LEFT JOIN checkpoints c ON c.route_id = r.id
        WHERE r.is_active = 1
        GROUP BY r.id
        ORDER BY r.created_at DESC, r.id
        "#,
    )?;

    let routes = stmt
        .query_map([], |row| {
            Ok(RouteSummary {
                id: row.get("id")?,
                name: row.get("name")?,
                description: row.get("description")?,
                total_checkpoints: row.get("total_checkpoints")?,
                total_points: row.get::<_, i64>("total_points")?.max(0) as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(routes)
}

/// Insert or replace a route and its checkpoints in one transaction
pub fn upsert_route(conn: &mut Connection, input: &CreateRouteInput) -> Result<(), StoreError> {
    for checkpoint in &input.checkpoints {
        GeoPoint::new(checkpoint.latitude, checkpoint.longitude)
            .map_err(|e| StoreError::Internal(format!("checkpoint {}: {}", checkpoint.id, e)))?;
    }

    let tx = conn.transaction()?;

    tx.execute(
        r#"
        INSERT INTO routes (id, name, description, is_active, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            is_active = excluded.is_active
        "#,
        params![
            input.id,
            input.name,
            input.description,
            input.is_active as i64,
            format_ts(chrono::Utc::now()),
        ],
    )?;

    // Checkpoints are replaced wholesale; progress rows reference them by id only
    tx.execute("DELETE FROM checkpoints WHERE route_id = ?", params![input.id])?;

    for checkpoint in &input.checkpoints {
        tx.execute(
            r#"
            INSERT INTO checkpoints (
                route_id, id, name, description, latitude, longitude, radius_m,
                reward_points, reward_seal, reward_text, order_index
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                input.id,
                checkpoint.id,
                checkpoint.name,
                checkpoint.description,
                checkpoint.latitude,
                checkpoint.longitude,
                checkpoint.radius_m,
                checkpoint.reward.points,
                checkpoint.reward.seal,
                checkpoint.reward.text,
                checkpoint.order_index,
            ],
        )?;
    }

    tx.commit()?;

    debug!(route_id = %input.id, checkpoints = input.checkpoints.len(), "Route upserted");
    Ok(())
}
