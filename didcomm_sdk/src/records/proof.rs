use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StateError;
use crate::storage::{Record, RecordTags};

/// Present-proof exchange lifecycle. Each state belongs to one role;
/// transitions alternate between the prover and verifier sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofState {
    ProposalSent,
    ProposalReceived,
    RequestSent,
    RequestReceived,
    PresentationSent,
    PresentationReceived,
    Done,
}

impl ProofState {
    fn can_transition_to(self, next: ProofState) -> bool {
        matches!(
            (self, next),
            (ProofState::ProposalSent, ProofState::RequestReceived)
                | (ProofState::ProposalReceived, ProofState::RequestSent)
                | (ProofState::RequestSent, ProofState::PresentationReceived)
                | (ProofState::RequestReceived, ProofState::PresentationSent)
                | (ProofState::PresentationSent, ProofState::Done)
                | (ProofState::PresentationReceived, ProofState::Done)
        )
    }
}

impl fmt::Display for ProofState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProofState::ProposalSent => "proposal-sent",
            ProofState::ProposalReceived => "proposal-received",
            ProofState::RequestSent => "request-sent",
            ProofState::RequestReceived => "request-received",
            ProofState::PresentationSent => "presentation-sent",
            ProofState::PresentationReceived => "presentation-received",
            ProofState::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// How far the agent goes without an explicit operator decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoAcceptProof {
    Always,
    ContentApproved,
    Never,
}

/// One present-proof/1.0 exchange with a remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofExchangeRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: ProofState,
    pub connection_id: String,
    pub thread_id: String,
    /// Set once the verifier has checked the presentation.
    pub verified: Option<bool>,
    pub presentation_id: Option<String>,
    pub auto_accept: AutoAcceptProof,
    pub error_message: Option<String>,
}

impl ProofExchangeRecord {
    pub fn new(
        connection_id: String,
        thread_id: String,
        state: ProofState,
        auto_accept: AutoAcceptProof,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            state,
            connection_id,
            thread_id,
            verified: None,
            presentation_id: None,
            auto_accept,
            error_message: None,
        }
    }

    pub fn assert_state(&self, expected: &[ProofState]) -> Result<(), StateError> {
        if expected.contains(&self.state) {
            return Ok(());
        }
        Err(StateError::InvalidState {
            current: self.state.to_string(),
            expected: expected.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Reject messages arriving over a different connection than the one
    /// the exchange was started on.
    pub fn assert_connection(&self, connection_id: &str) -> Result<(), StateError> {
        if self.connection_id == connection_id {
            return Ok(());
        }
        Err(StateError::ConnectionMismatch {
            expected: self.connection_id.clone(),
            actual: connection_id.to_string(),
        })
    }

    pub fn advance_to(&mut self, state: ProofState) -> Result<(), StateError> {
        if !self.state.can_transition_to(state) {
            return Err(StateError::InvalidTransition {
                from: self.state.to_string(),
                to: state.to_string(),
            });
        }
        self.state = state;
        self.touch();
        Ok(())
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Record for ProofExchangeRecord {
    const RECORD_TYPE: &'static str = "proof_exchange";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert("state".into(), self.state.to_string().into());
        tags.insert("connection_id".into(), self.connection_id.as_str().into());
        tags.insert("thread_id".into(), self.thread_id.as_str().into());
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(state: ProofState) -> ProofExchangeRecord {
        ProofExchangeRecord::new(
            "conn-1".into(),
            "thread-1".into(),
            state,
            AutoAcceptProof::Never,
        )
    }

    #[test]
    fn verifier_path_through_the_machine() {
        let mut rec = exchange(ProofState::RequestSent);
        rec.advance_to(ProofState::PresentationReceived).unwrap();
        rec.verified = Some(true);
        rec.advance_to(ProofState::Done).unwrap();
    }

    #[test]
    fn prover_cannot_skip_the_presentation() {
        let mut rec = exchange(ProofState::RequestReceived);
        let err = rec.advance_to(ProofState::Done).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition {
                from: "request-received".into(),
                to: "done".into(),
            }
        );
    }

    #[test]
    fn roles_do_not_cross() {
        // a proposal we sent is answered by a request, never by one we send
        let mut rec = exchange(ProofState::ProposalSent);
        assert!(rec.advance_to(ProofState::RequestSent).is_err());
        rec.advance_to(ProofState::RequestReceived).unwrap();
    }

    #[test]
    fn connection_guard_rejects_other_connections() {
        let rec = exchange(ProofState::RequestSent);
        let err = rec.assert_connection("conn-2").unwrap_err();
        assert_eq!(
            err,
            StateError::ConnectionMismatch {
                expected: "conn-1".into(),
                actual: "conn-2".into(),
            }
        );
    }
}
