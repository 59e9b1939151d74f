//! Event types for the CGX event system
//!
//! Provides the pipeline event enum and the broadcast-based `EventBus` used to
//! fan progress out to SSE clients and log sinks.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// CGX event types
///
/// Events are broadcast via `EventBus` and serialized as-is for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CgxEvent {
    /// Pipeline run accepted and started
    PipelineRunStarted {
        run_id: Uuid,
        /// Raw conversations in the submitted export
        conversation_count: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Pipeline progress update
    ///
    /// Emitted on every stage transition and as per-item work completes.
    PipelineProgressUpdate {
        run_id: Uuid,
        /// Current run state (e.g. "ENRICHING")
        state: String,
        /// Items completed in the current stage
        current: usize,
        /// Items in the current stage
        total: usize,
        /// Progress percentage (0.0-100.0)
        percentage: f32,
        /// Current operation description
        current_operation: String,
        elapsed_seconds: u64,
        estimated_remaining_seconds: Option<u64>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Pipeline run finished and its cluster solution is visible
    PipelineRunCompleted {
        run_id: Uuid,
        /// "SUCCESS" or "PARTIAL"
        status: String,
        cluster_solution_id: String,
        conversations_clustered: usize,
        conversations_excluded: usize,
        duration_seconds: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Pipeline run aborted; no solution was written
    PipelineRunFailed {
        run_id: Uuid,
        error_message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Pipeline run cancelled between stages
    PipelineRunCancelled {
        run_id: Uuid,
        /// Stage that was about to start when cancellation was observed
        state: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl CgxEvent {
    /// Event type name, matching the serialized `type` tag
    pub fn event_type(&self) -> &str {
        match self {
            CgxEvent::PipelineRunStarted { .. } => "PipelineRunStarted",
            CgxEvent::PipelineProgressUpdate { .. } => "PipelineProgressUpdate",
            CgxEvent::PipelineRunCompleted { .. } => "PipelineRunCompleted",
            CgxEvent::PipelineRunFailed { .. } => "PipelineRunFailed",
            CgxEvent::PipelineRunCancelled { .. } => "PipelineRunCancelled",
        }
    }

    /// Run this event belongs to
    pub fn run_id(&self) -> Uuid {
        match self {
            CgxEvent::PipelineRunStarted { run_id, .. }
            | CgxEvent::PipelineProgressUpdate { run_id, .. }
            | CgxEvent::PipelineRunCompleted { run_id, .. }
            | CgxEvent::PipelineRunFailed { run_id, .. }
            | CgxEvent::PipelineRunCancelled { run_id, .. } => *run_id,
        }
    }
}

/// Central event distribution bus
///
/// Cloning is cheap; every clone shares the same channel. Slow subscribers
/// that fall more than `capacity` events behind observe `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CgxEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<CgxEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: CgxEvent) -> Result<usize, broadcast::error::SendError<CgxEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: CgxEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(run_id: Uuid) -> CgxEvent {
        CgxEvent::PipelineRunFailed {
            run_id,
            error_message: "boom".to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let run_id = Uuid::new_v4();
        let json = serde_json::to_value(failed(run_id)).unwrap();

        assert_eq!(json["type"], "PipelineRunFailed");
        assert_eq!(json["run_id"], run_id.to_string());
        assert_eq!(failed(run_id).event_type(), "PipelineRunFailed");
    }

    #[test]
    fn test_emit_without_subscribers_is_err() {
        let bus = EventBus::new(10);
        assert!(bus.emit(failed(Uuid::new_v4())).is_err());
        // Lossy variant never fails
        bus.emit_lossy(failed(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let run_id = Uuid::new_v4();
        bus.emit(failed(run_id)).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), run_id);
    }
}
