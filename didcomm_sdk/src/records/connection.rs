use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StateError;
use crate::{
    did::{DidCommService, DidDocument},
    storage::{Record, RecordTags},
};

/// Pairwise connection lifecycle. States are strictly ordered; a
/// connection only ever advances one step at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub enum ConnectionState {
    Invited,
    Requested,
    Responded,
    Complete,
}

impl ConnectionState {
    fn ordinal(self) -> u8 {
        match self {
            ConnectionState::Invited => 0,
            ConnectionState::Requested => 1,
            ConnectionState::Responded => 2,
            ConnectionState::Complete => 3,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Invited => "invited",
            ConnectionState::Requested => "requested",
            ConnectionState::Responded => "responded",
            ConnectionState::Complete => "complete",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionRole {
    Inviter,
    Invitee,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionRole::Inviter => "inviter",
            ConnectionRole::Invitee => "invitee",
        };
        write!(f, "{name}")
    }
}

/// One pairwise relationship with a remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: ConnectionState,
    pub role: ConnectionRole,
    pub did: Option<String>,
    pub did_doc: Option<DidDocument>,
    pub verkey: Option<String>,
    pub their_did: Option<String>,
    pub their_did_doc: Option<DidDocument>,
    pub their_label: Option<String>,
    pub thread_id: Option<String>,
    pub out_of_band_id: Option<String>,
    pub mediator_id: Option<String>,
}

impl ConnectionRecord {
    pub fn new(role: ConnectionRole, state: ConnectionState) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            state,
            role,
            did: None,
            did_doc: None,
            verkey: None,
            their_did: None,
            their_did_doc: None,
            their_label: None,
            thread_id: None,
            out_of_band_id: None,
            mediator_id: None,
        }
    }

    pub fn assert_state(&self, expected: &[ConnectionState]) -> Result<(), StateError> {
        if expected.contains(&self.state) {
            return Ok(());
        }
        Err(StateError::InvalidState {
            current: self.state.to_string(),
            expected: expected.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn assert_role(&self, expected: ConnectionRole) -> Result<(), StateError> {
        if self.role == expected {
            return Ok(());
        }
        Err(StateError::InvalidRole {
            current: self.role.to_string(),
            expected: expected.to_string(),
        })
    }

    /// Advance to the next state. Skipping states and moving backwards
    /// are both rejected.
    pub fn advance_to(&mut self, state: ConnectionState) -> Result<(), StateError> {
        if state.ordinal() != self.state.ordinal() + 1 {
            return Err(StateError::InvalidTransition {
                from: self.state.to_string(),
                to: state.to_string(),
            });
        }
        self.state = state;
        self.touch();
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Complete
    }

    /// The remote agent's did-communication service, once their DID
    /// document is known.
    pub fn remote_service(&self) -> Option<&DidCommService> {
        self.their_did_doc.as_ref().and_then(|doc| doc.didcomm_service())
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Record for ConnectionRecord {
    const RECORD_TYPE: &'static str = "connection";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert("state".into(), self.state.to_string().into());
        tags.insert("role".into(), self.role.to_string().into());
        if let Some(ref did) = self.did {
            tags.insert("did".into(), did.as_str().into());
        }
        if let Some(ref verkey) = self.verkey {
            tags.insert("verkey".into(), verkey.as_str().into());
        }
        if let Some(ref their_did) = self.their_did {
            tags.insert("their_did".into(), their_did.as_str().into());
        }
        if let Some(service) = self.remote_service() {
            if let Some(their_key) = service.recipient_keys.first() {
                tags.insert("their_key".into(), their_key.as_str().into());
            }
        }
        if let Some(ref thread_id) = self.thread_id {
            tags.insert("thread_id".into(), thread_id.as_str().into());
        }
        if let Some(ref oob_id) = self.out_of_band_id {
            tags.insert("out_of_band_id".into(), oob_id.as_str().into());
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_one_step_at_a_time() {
        let mut conn = ConnectionRecord::new(ConnectionRole::Inviter, ConnectionState::Invited);
        let before = conn.updated_at;

        conn.advance_to(ConnectionState::Requested).unwrap();
        conn.advance_to(ConnectionState::Responded).unwrap();
        conn.advance_to(ConnectionState::Complete).unwrap();
        assert!(conn.is_ready());
        assert!(conn.updated_at >= before);
    }

    #[test]
    fn skipping_and_regressing_are_rejected() {
        let mut conn = ConnectionRecord::new(ConnectionRole::Invitee, ConnectionState::Invited);

        let err = conn.advance_to(ConnectionState::Responded).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition {
                from: "invited".into(),
                to: "responded".into(),
            }
        );

        conn.advance_to(ConnectionState::Requested).unwrap();
        assert!(conn.advance_to(ConnectionState::Invited).is_err());
    }

    #[test]
    fn state_guard_names_current_and_expected() {
        let conn = ConnectionRecord::new(ConnectionRole::Inviter, ConnectionState::Invited);

        let err = conn
            .assert_state(&[ConnectionState::Responded, ConnectionState::Complete])
            .unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidState {
                current: "invited".into(),
                expected: vec!["responded".into(), "complete".into()],
            }
        );
    }

    #[test]
    fn tags_track_current_fields() {
        let mut conn = ConnectionRecord::new(ConnectionRole::Inviter, ConnectionState::Invited);
        assert!(!conn.tags().contains_key("verkey"));

        conn.verkey = Some("8HH5gYEeNc3z7PYXmd54d4".into());
        conn.thread_id = Some("thread-1".into());
        let tags = conn.tags();
        assert_eq!(tags.get("state"), Some(&"invited".into()));
        assert_eq!(tags.get("verkey"), Some(&"8HH5gYEeNc3z7PYXmd54d4".into()));
        assert_eq!(tags.get("thread_id"), Some(&"thread-1".into()));
    }
}
