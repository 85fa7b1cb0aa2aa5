//! Route Progress - geofenced puzzle route tracking
//!
//! Tracks players through "escape room" routes: a checkpoint only counts when
//! the player is physically there and has solved its puzzle. Completions are
//! recorded atomically, route completion is derived from them, and every
//! route has a deterministic leaderboard.
//!
//! ## Architecture
//!
//! ```text
//! http (hyper)  ──>  services::ProgressService
//!                        ├── session::SessionLifecycle
//!                        ├── engine::CompletionEngine ── geofence, locks, retry
//!                        └── leaderboard::LeaderboardEngine
//!                                 │
//!                        store::{ContentStore, ProgressStore}
//!                                 │
//!                        db::ProgressDb (SQLite)
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/route-progress/
//! ├── progress.db    # Routes, checkpoints, sessions, progress
//! └── config.toml    # Configuration
//! ```

pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod geofence;
pub mod http;
pub mod leaderboard;
pub mod locks;
pub mod models;
pub mod rate_limit;
pub mod retry;
pub mod seed;
pub mod services;
pub mod session;
pub mod store;

// Re-exports
pub use auth::{Claims, JwtValidator};
pub use config::Config;
pub use db::ProgressDb;
pub use engine::{CompletionEngine, CompletionRequest, CompletionResult};
pub use error::{ProgressError, StoreError};
pub use geofence::{distance_m, is_within_geofence, GeoPoint};
pub use http::HttpServer;
pub use leaderboard::{Leaderboard, LeaderboardEngine, RouteStats, Timeframe};
pub use models::{Clock, PuzzleVerdict, SystemClock};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use services::{ProgressService, Services};
pub use session::{SessionLifecycle, SessionState};
