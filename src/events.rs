//! Status events emitted by the orchestrator
//!
//! Every consumer (UI, logger, test harness) subscribes to a broadcast
//! stream and cannot influence orchestrator control flow. Events that
//! report persistence (`Recognized`, `CompletionDelta`, `CompletionDone`,
//! `Interrupted`, `Cancelled`) are emitted only after the corresponding
//! store write has returned.

use tokio::sync::broadcast;

use crate::error::ErrorKind;

/// Default capacity of the event channel
const EVENT_CAPACITY: usize = 256;

/// A status event for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// A turn was accepted and started
    TurnStarted { session_id: String },
    /// Microphone is open and buffering
    Listening { session_id: String },
    /// Capture was recognized as text (persisted as a user message)
    Recognized { session_id: String, text: String },
    /// Capture contained no usable speech; no message was appended
    NothingHeard { session_id: String },
    /// A streamed completion fragment was applied to the pending message
    CompletionDelta { session_id: String, text: String },
    /// The assistant message was finalized as complete
    CompletionDone { session_id: String },
    /// Synthesized audio is being played back
    Speaking { session_id: String },
    /// The in-flight message was finalized as interrupted (barge-in)
    Interrupted { session_id: String },
    /// The turn was cancelled by the user
    Cancelled { session_id: String },
    /// A turn was rejected because one is already active
    Busy { session_id: String },
    /// A collaborator failed; the turn was aborted
    Error {
        session_id: String,
        kind: ErrorKind,
        message: String,
    },
    /// The session returned to idle
    Idle { session_id: String },
}

impl StatusEvent {
    /// Session the event belongs to
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::TurnStarted { session_id }
            | Self::Listening { session_id }
            | Self::Recognized { session_id, .. }
            | Self::NothingHeard { session_id }
            | Self::CompletionDelta { session_id, .. }
            | Self::CompletionDone { session_id }
            | Self::Speaking { session_id }
            | Self::Interrupted { session_id }
            | Self::Cancelled { session_id }
            | Self::Busy { session_id }
            | Self::Error { session_id, .. }
            | Self::Idle { session_id } => session_id,
        }
    }
}

/// Broadcast bus for status events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    /// Create a new bus with the default capacity
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to the event stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; best-effort when no subscriber is attached
    pub fn emit(&self, event: StatusEvent) {
        tracing::trace!(?event, "status event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(StatusEvent::TurnStarted {
            session_id: "s1".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), "s1");
    }

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.emit(StatusEvent::Idle {
            session_id: "s1".into(),
        });
    }
}
