//! Route Progress Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! route-progress
//!
//! # Seed the demo route and start
//! route-progress --seed demos/bern-classic.json
//!
//! # Custom config, port and JSON logs
//! route-progress --config /etc/route-progress.toml --http-port 9000 --json-logs
//! ```

use anyhow::Context;
use clap::Parser;
use route_progress::{seed, Config, HttpServer, JwtValidator, ProgressDb, RateLimiter, Services, SystemClock};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Player tokens stay valid for a day
const TOKEN_EXPIRY_SECS: u64 = 24 * 60 * 60;

#[derive(Parser, Debug)]
#[command(name = "route-progress")]
#[command(about = "Progress and leaderboard service for geofenced puzzle routes")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "ROUTE_PROGRESS_HTTP_PORT")]
    http_port: Option<u16>,

    /// HS256 secret for player tokens (development secret if unset)
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Route definitions (JSON) to upsert before serving
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::from_default_env().add_directive("route_progress=info".parse()?);
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if args.jwt_secret.is_some() {
        config.jwt_secret = args.jwt_secret;
    }

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        tolerance_m = config.geofence_tolerance_m,
        "Starting route-progress"
    );

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .context("Failed to create storage directory")?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        // Secrets come from the environment, never from the saved file
        let mut saved = config.clone();
        saved.jwt_secret = None;
        saved.save(&config_path).context("Failed to save default config")?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = ProgressDb::open(&config.db_path()).context("Failed to open progress database")?;

    if let Some(seed_path) = &args.seed {
        let count = seed::seed_from_file(&db, seed_path)
            .with_context(|| format!("Failed to seed routes from {}", seed_path.display()))?;
        info!(routes = count, "Seeded routes");
    }

    let validator = match config.jwt_secret.clone() {
        Some(secret) => JwtValidator::new(secret, TOKEN_EXPIRY_SECS).context("Invalid JWT secret")?,
        None => JwtValidator::new_dev(),
    };

    let services = Arc::new(Services::new(db, Arc::new(SystemClock), &config));
    let _listeners = services.spawn_listeners();

    let rate_limiter = Arc::new(RateLimiter::new(
        Duration::from_secs(config.rate_limit_window_secs),
        config.rate_limit_max_requests,
    ));

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let server = Arc::new(HttpServer::new(services, validator, rate_limiter, bind_addr));

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server failed");
                return Err(e).context("HTTP server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
