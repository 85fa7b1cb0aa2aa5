//! Progress event bus
//!
//! Engines emit an event after each committed write. Listeners use them for:
//! - Audit logging
//! - Route stats cache invalidation
//! - Real-time notifications

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Events emitted after a progress write commits
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    SessionStarted {
        session_id: String,
        player_id: String,
        route_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CheckpointCompleted {
        session_id: String,
        player_id: String,
        route_id: String,
        checkpoint_id: String,
        points: u32,
    },
    #[serde(rename_all = "camelCase")]
    RouteCompleted {
        session_id: String,
        player_id: String,
        route_id: String,
        total_points: i64,
        total_time_ms: i64,
    },
}

impl ProgressEvent {
    pub fn route_id(&self) -> &str {
        match self {
            ProgressEvent::SessionStarted { route_id, .. }
            | ProgressEvent::CheckpointCompleted { route_id, .. }
            | ProgressEvent::RouteCompleted { route_id, .. } => route_id,
        }
    }
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Event bus for broadcasting progress events
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: ProgressEvent) {
        trace!(event = ?event, "Emitting progress event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Audit trail listener
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::SessionStarted { player_id, route_id, .. } => {
                debug!(player_id = %player_id, route_id = %route_id, "Session started");
            }
            ProgressEvent::CheckpointCompleted {
                player_id,
                checkpoint_id,
                points,
                ..
            } => {
                debug!(
                    player_id = %player_id,
                    checkpoint_id = %checkpoint_id,
                    points,
                    "Checkpoint completed"
                );
            }
            ProgressEvent::RouteCompleted {
                player_id,
                route_id,
                total_points,
                total_time_ms,
                ..
            } => {
                info!(
                    player_id = %player_id,
                    route_id = %route_id,
                    total_points,
                    total_time_ms,
                    "Route completed"
                );
            }
        }
    }
}

/// Spawn a background task feeding every event to `listener`
pub fn spawn_listener(
    event_bus: &EventBus,
    listener: Arc<dyn EventListener>,
) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
