//! Engine events and best-effort emitters.
//!
//! The engine reports progress through an [`EventEmitter`]. Emission is
//! telemetry only: a failing emitter is logged and otherwise ignored, it
//! never fails a reconciliation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::EventSettings;
use crate::model::ResourceId;
use crate::planner::{Action, PlanSummary, PropertyChange};

/// Something that happened during a reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Planning of a module started.
    PlanStarted {
        /// Module name.
        module: String,
    },
    /// Planning finished.
    PlanCompleted {
        /// Module name.
        module: String,
        /// Counted actions.
        summary: PlanSummary,
    },
    /// Execution of a plan started.
    ApplyStarted {
        /// Number of batches.
        batches: usize,
        /// Number of scheduled operations.
        operations: usize,
    },
    /// Execution finished.
    ApplyCompleted {
        /// Whether every operation succeeded.
        success: bool,
        /// Number of forward operations attempted.
        attempted: usize,
    },
    /// An operation on a resource started.
    ResourceStarted {
        /// Target resource.
        id: ResourceId,
        /// Action being applied.
        action: Action,
    },
    /// An operation on a resource succeeded.
    ResourceCompleted {
        /// Target resource.
        id: ResourceId,
        /// Action applied.
        action: Action,
        /// Wall time of the operation.
        duration: Duration,
    },
    /// An operation on a resource failed.
    ResourceFailed {
        /// Target resource.
        id: ResourceId,
        /// Action attempted.
        action: Action,
        /// Failure description.
        error: String,
    },
    /// A previously applied change was unwound.
    ResourceRolledBack {
        /// Target resource.
        id: ResourceId,
        /// Inverse action applied.
        action: Action,
        /// Whether the rollback succeeded.
        success: bool,
    },
    /// A resource no longer matches its declared state.
    DriftDetected {
        /// Drifted resource.
        id: ResourceId,
        /// Action that would restore it.
        action: Action,
        /// Property deltas.
        changes: Vec<PropertyChange>,
    },
}

/// An event stamped with the time it was emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// Emission time.
    pub at: DateTime<Utc>,
    /// The event.
    #[serde(flatten)]
    pub event: Event,
}

/// Failure to deliver an event.
#[derive(Debug, Error)]
pub enum EmitError {
    /// The event buffer is full.
    #[error("event buffer full")]
    Full,
    /// The receiving side has gone away.
    #[error("event receiver closed")]
    Closed,
}

/// Sink for engine events.
pub trait EventEmitter: Send + Sync {
    /// Delivers an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be delivered.
    fn emit(&self, event: &Event) -> Result<(), EmitError>;
}

/// Emits an event, logging and discarding any delivery failure.
pub fn emit_best_effort(emitter: &dyn EventEmitter, event: &Event) {
    if let Err(e) = emitter.emit(event) {
        warn!("Dropped engine event: {e}");
    }
}

/// Emitter that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&self, _event: &Event) -> Result<(), EmitError> {
        Ok(())
    }
}

/// Emitter that writes events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

impl EventEmitter for TracingEmitter {
    fn emit(&self, event: &Event) -> Result<(), EmitError> {
        match event {
            Event::ResourceFailed { id, action, error } => {
                warn!(resource = %id, %action, "Resource failed: {error}");
            }
            Event::DriftDetected { id, changes, .. } => {
                warn!(resource = %id, changes = changes.len(), "Drift detected");
            }
            other => info!(event = ?other, "Engine event"),
        }
        Ok(())
    }
}

/// Emitter that forwards events into a bounded channel without blocking.
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    sender: mpsc::Sender<EventRecord>,
}

impl ChannelEmitter {
    /// Creates an emitter and the receiver for its events.
    #[must_use]
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<EventRecord>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }

    /// Creates an emitter sized by the event settings.
    #[must_use]
    pub fn from_settings(settings: &EventSettings) -> (Self, mpsc::Receiver<EventRecord>) {
        Self::new(settings.buffer)
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: &Event) -> Result<(), EmitError> {
        let record = EventRecord {
            at: Utc::now(),
            event: event.clone(),
        };
        self.sender.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EmitError::Full,
            mpsc::error::TrySendError::Closed(_) => EmitError::Closed,
        })
    }
}

/// Shared emitter handle used across the engine.
pub type SharedEmitter = Arc<dyn EventEmitter>;

/// Returns an emitter that discards events.
#[must_use]
pub fn noop() -> SharedEmitter {
    Arc::new(NoopEmitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_emitter_delivers() {
        let (emitter, mut rx) = ChannelEmitter::new(4);
        emitter
            .emit(&Event::PlanStarted {
                module: String::from("web"),
            })
            .expect("emit failed");

        let record = rx.recv().await.expect("no event");
        assert_eq!(
            record.event,
            Event::PlanStarted {
                module: String::from("web")
            }
        );
    }

    #[test]
    fn test_full_buffer_reports_error() {
        let (emitter, _rx) = ChannelEmitter::new(1);
        let event = Event::ApplyStarted {
            batches: 1,
            operations: 1,
        };
        assert!(emitter.emit(&event).is_ok());
        assert!(matches!(emitter.emit(&event), Err(EmitError::Full)));

        // Best-effort emission swallows the failure.
        emit_best_effort(&emitter, &event);
    }

    #[test]
    fn test_buffer_from_settings() {
        let (emitter, _rx) = ChannelEmitter::from_settings(&EventSettings { buffer: 3 });
        let event = Event::PlanStarted {
            module: String::from("web"),
        };
        for _ in 0..3 {
            assert!(emitter.emit(&event).is_ok());
        }
        assert!(matches!(emitter.emit(&event), Err(EmitError::Full)));
    }

    #[test]
    fn test_closed_receiver() {
        let (emitter, rx) = ChannelEmitter::new(1);
        drop(rx);
        let event = Event::PlanStarted {
            module: String::from("web"),
        };
        assert!(matches!(emitter.emit(&event), Err(EmitError::Closed)));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = Event::ResourceStarted {
            id: ResourceId::new("pkg", "git"),
            action: Action::Create,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "resource_started");
        assert_eq!(json["id"], "pkg.git");
        assert_eq!(json["action"], "create");
    }
}
