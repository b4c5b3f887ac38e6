//! Agent event broadcasting.
//!
//! Handlers emit events as they mutate records; the application
//! subscribes to react to state changes without polling the store.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::{
    envelope::EncryptedMessage,
    records::{ConnectionState, MediationState, OutOfBandState, ProofState},
};

#[derive(Debug, Clone)]
pub enum AgentEvent {
    ConnectionStateChanged {
        connection_id: String,
        state: ConnectionState,
    },
    MediationStateChanged {
        mediation_id: String,
        state: MediationState,
    },
    OutOfBandStateChanged {
        out_of_band_id: String,
        state: OutOfBandState,
    },
    ProofStateChanged {
        proof_exchange_id: String,
        state: ProofState,
        verified: Option<bool>,
    },
    HandshakeReused {
        out_of_band_id: String,
        connection_id: String,
    },
    BasicMessageReceived {
        connection_id: String,
        content: String,
        sent_time: Option<DateTime<Utc>>,
    },
    ProblemReportReceived {
        connection_id: Option<String>,
        thread_id: String,
        code: Option<String>,
        explain: Option<String>,
    },
    /// A forward arrived for a served recipient key; the application
    /// delivers the inner envelope over its own transport.
    ForwardReceived {
        to: String,
        envelope: EncryptedMessage,
    },
}

/// Broadcast fan-out for [`AgentEvent`]s. Emitting with no subscribers
/// is not an error; slow subscribers may observe lag per tokio's
/// broadcast semantics.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: AgentEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(AgentEvent::ConnectionStateChanged {
            connection_id: "conn-1".into(),
            state: ConnectionState::Complete,
        });

        match rx.recv().await.unwrap() {
            AgentEvent::ConnectionStateChanged { connection_id, state } => {
                assert_eq!(connection_id, "conn-1");
                assert_eq!(state, ConnectionState::Complete);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn emitting_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        bus.emit(AgentEvent::BasicMessageReceived {
            connection_id: "conn-1".into(),
            content: "hello".into(),
            sent_time: None,
        });
    }
}
