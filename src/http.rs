//! HTTP API for route progress
//!
//! ## Routes
//! - `GET /routes` - Active routes with checkpoint totals
//! - `GET /routes/{route}` - Route detail (caller's completed checkpoints if authenticated)
//!
//! ## Progress (bearer token required, path player must match the token)
//! - `POST /progress/{player}/start` - `{routeId}`
//! - `POST /progress/{player}/complete` - `{routeId, checkpointId, location, verdict}`
//! - `GET /progress/{player}/{route}` - Session and completed checkpoints
//! - `GET /players/{player}/summary` - Totals across routes
//!
//! ## Leaderboard
//! - `GET /leaderboard/{route}?timeframe=all|week|month` - Ranked sessions
//! - `GET /leaderboard/{route}/stats` - Route statistics
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST -H "Authorization: Bearer $TOKEN" -H "Content-Type: application/json" \
//!      -d '{"routeId": "bern-classic", "checkpointId": "zytglogge",
//!           "location": {"latitude": 46.9481, "longitude": 7.4474},
//!           "verdict": {"passed": true}}' \
//!      http://localhost:8095/progress/player-1/complete
//! ```

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::auth::JwtValidator;
use crate::engine::CompletionRequest;
use crate::error::{ProgressError, StoreError};
use crate::geofence::GeoPoint;
use crate::leaderboard::Timeframe;
use crate::models::PuzzleVerdict;
use crate::rate_limit::RateLimiter;
use crate::services::response::{self, HttpResponse};
use crate::services::Services;

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    route_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteBody {
    route_id: String,
    checkpoint_id: String,
    location: GeoPoint,
    verdict: PuzzleVerdict,
}

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    validator: JwtValidator,
    rate_limiter: Arc<RateLimiter>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(
        services: Arc<Services>,
        validator: JwtValidator,
        rate_limiter: Arc<RateLimiter>,
        bind_addr: SocketAddr,
    ) -> Self {
        Self {
            services,
            validator,
            rate_limiter,
            bind_addr,
        }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), StoreError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        let limiter = self.rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                limiter.evict_expired();
            }
        });

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req, remote_addr.ip()).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    pub async fn handle_request<B>(
        &self,
        req: Request<B>,
        remote_ip: IpAddr,
    ) -> Result<HttpResponse, Infallible>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(method = %method, path = %path, "Incoming request");

        let result = self.route(req, remote_ip).await;

        Ok(match result {
            Ok(response) => response,
            Err(e) => {
                if e.is_client_error() {
                    debug!(method = %method, path = %path, code = e.code(), error = %e, "Request rejected");
                } else {
                    error!(method = %method, path = %path, error = %e, "Request failed");
                }
                response::error_response(e)
            }
        })
    }

    async fn route<B>(&self, req: Request<B>, remote_ip: IpAddr) -> Result<HttpResponse, ProgressError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let method = req.method().clone();
        let auth = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let auth = auth.as_deref();

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        if segments.as_slice() != ["health"] {
            self.rate_limiter.check(&remote_ip.to_string())?;
        }

        let progress = &self.services.progress;

        match (&method, segments.as_slice()) {
            (&Method::GET, ["health"]) => self.handle_health(),

            (&Method::GET, ["routes"]) => Ok(response::ok(&progress.list_routes().await?)),
            (&Method::GET, ["routes", route_id]) => {
                let caller = self.validator.authenticate_optional(auth);
                Ok(response::ok(&progress.get_route(route_id, caller.as_ref()).await?))
            }

            (&Method::POST, ["progress", player_id, "start"]) => {
                let claims = self.validator.authenticate(auth)?;
                let body: StartBody = read_json(req.into_body()).await?;
                let outcome = progress
                    .start_session(&claims, player_id, &body.route_id)
                    .await?;
                Ok(if outcome.created {
                    response::created(&outcome.session)
                } else {
                    response::ok(&outcome.session)
                })
            }
            (&Method::POST, ["progress", player_id, "complete"]) => {
                let claims = self.validator.authenticate(auth)?;
                let body: CompleteBody = read_json(req.into_body()).await?;
                let result = progress
                    .complete_checkpoint(
                        &claims,
                        CompletionRequest {
                            player_id: player_id.to_string(),
                            route_id: body.route_id,
                            checkpoint_id: body.checkpoint_id,
                            location: body.location,
                            verdict: body.verdict,
                        },
                    )
                    .await?;
                Ok(response::created(&result))
            }
            (&Method::GET, ["progress", player_id, route_id]) => {
                let claims = self.validator.authenticate(auth)?;
                Ok(response::ok(
                    &progress.get_progress(&claims, player_id, route_id).await?,
                ))
            }
            (&Method::GET, ["players", player_id, "summary"]) => {
                let claims = self.validator.authenticate(auth)?;
                Ok(response::ok(
                    &progress.get_player_summary(&claims, player_id).await?,
                ))
            }

            (&Method::GET, ["leaderboard", route_id]) => {
                let timeframe = Timeframe::parse(query_param(query.as_deref(), "timeframe").as_deref());
                let caller = self.validator.authenticate_optional(auth);
                Ok(response::ok(
                    &progress
                        .get_leaderboard(route_id, timeframe, caller.as_ref())
                        .await?,
                ))
            }
            (&Method::GET, ["leaderboard", route_id, "stats"]) => {
                Ok(response::ok(&progress.get_route_stats(route_id).await?))
            }

            (_, ["health"])
            | (_, ["routes"])
            | (_, ["routes", _])
            | (_, ["progress", _, _])
            | (_, ["players", _, "summary"])
            | (_, ["leaderboard", _])
            | (_, ["leaderboard", _, "stats"]) => Ok(response::method_not_allowed()),

            _ => Ok(response::not_found("Not found")),
        }
    }

    /// Health check endpoint
    fn handle_health(&self) -> Result<HttpResponse, ProgressError> {
        let database = match self.services.db.ping() {
            Ok(()) => "ok",
            Err(e) => {
                error!(error = %e, "Health check database ping failed");
                "unavailable"
            }
        };
        Ok(response::ok(&serde_json::json!({
            "status": if database == "ok" { "ok" } else { "degraded" },
            "database": database,
            "version": env!("CARGO_PKG_VERSION"),
            "rateLimitedClients": self.rate_limiter.tracked_clients(),
            "eventSubscribers": self.services.events.subscriber_count(),
        })))
    }
}

/// Collect and decode a JSON request body
async fn read_json<T, B>(body: B) -> Result<T, ProgressError>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Reading stops at the first frame past the limit
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                ProgressError::Validation(format!("Request body exceeds {} bytes", MAX_BODY_BYTES))
            } else {
                ProgressError::Validation(format!("Failed to read body: {}", e))
            }
        })?
        .to_bytes();

    serde_json::from_slice(&bytes)
        .map_err(|e| ProgressError::Validation(format!("Invalid JSON body: {}", e)))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
