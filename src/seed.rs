//! Route content seeding from JSON files

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::db::{CreateRouteInput, ProgressDb};
use crate::error::StoreError;

/// A seed file holds one route or a list of routes
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SeedFile {
    Many(Vec<CreateRouteInput>),
    One(CreateRouteInput),
}

/// Parse route definitions from JSON text
pub fn parse_routes(json: &str) -> Result<Vec<CreateRouteInput>, StoreError> {
    Ok(match serde_json::from_str::<SeedFile>(json)? {
        SeedFile::Many(routes) => routes,
        SeedFile::One(route) => vec![route],
    })
}

/// Upsert every route in `path`; returns how many were written
pub fn seed_from_file(db: &ProgressDb, path: &Path) -> Result<usize, StoreError> {
    let json = std::fs::read_to_string(path)?;
    let routes = parse_routes(&json)?;

    for route in &routes {
        db.upsert_route(route)?;
        info!(
            route_id = %route.id,
            checkpoints = route.checkpoints.len(),
            "Seeded route"
        );
    }

    Ok(routes.len())
}
