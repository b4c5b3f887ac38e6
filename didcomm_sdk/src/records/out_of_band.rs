use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StateError;
use crate::{
    did::{DidCommService, DidError, key_reference_to_verkey, verkey_to_fingerprint},
    message::Attachment,
    storage::{Record, RecordTags},
};

/// A service entry of an out-of-band invitation: either a resolvable DID
/// or an inline did-communication service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OobService {
    Did(String),
    Inline(DidCommService),
}

/// An out-of-band/1.1 invitation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutOfBandInvitation {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handshake_protocols: Vec<String>,
    #[serde(
        rename = "requests~attach",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub requests: Vec<Attachment>,
    pub services: Vec<OobService>,
}

impl OutOfBandInvitation {
    pub const TYPE: &'static str = "https://didcomm.org/out-of-band/1.1/invitation";

    pub fn new(label: Option<String>, services: Vec<OobService>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: Self::TYPE.to_string(),
            label,
            handshake_protocols: vec![crate::protocols::connection::PROTOCOL_URI.to_string()],
            requests: Vec::new(),
            services,
        }
    }

    /// The first inline recipient key, normalized to a raw verkey. This
    /// is what inbound handshake messages are correlated against.
    pub fn invitation_key(&self) -> Result<Option<String>, DidError> {
        for service in &self.services {
            if let OobService::Inline(service) = service {
                if let Some(key) = service.recipient_keys.first() {
                    return Ok(Some(key_reference_to_verkey(key)?));
                }
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutOfBandRole {
    Sender,
    Receiver,
}

impl fmt::Display for OutOfBandRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutOfBandRole::Sender => "sender",
            OutOfBandRole::Receiver => "receiver",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutOfBandState {
    Initial,
    AwaitResponse,
    PrepareResponse,
    Done,
}

impl OutOfBandState {
    /// Senders wait for a response; receivers prepare one. Both sides
    /// finish in `Done`, except that a reusable sender invitation stays
    /// in `AwaitResponse`.
    fn can_transition_to(self, next: OutOfBandState) -> bool {
        matches!(
            (self, next),
            (OutOfBandState::Initial, OutOfBandState::AwaitResponse)
                | (OutOfBandState::Initial, OutOfBandState::PrepareResponse)
                | (OutOfBandState::AwaitResponse, OutOfBandState::Done)
                | (OutOfBandState::PrepareResponse, OutOfBandState::Done)
        )
    }
}

impl fmt::Display for OutOfBandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutOfBandState::Initial => "initial",
            OutOfBandState::AwaitResponse => "await-response",
            OutOfBandState::PrepareResponse => "prepare-response",
            OutOfBandState::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// One out-of-band exchange, kept on both the sender and receiver side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutOfBandRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: OutOfBandState,
    pub role: OutOfBandRole,
    pub invitation: OutOfBandInvitation,
    pub reusable: bool,
    pub mediator_id: Option<String>,
    pub reuse_connection_id: Option<String>,
}

impl OutOfBandRecord {
    pub fn new(role: OutOfBandRole, invitation: OutOfBandInvitation, reusable: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            state: OutOfBandState::Initial,
            role,
            invitation,
            reusable,
            mediator_id: None,
            reuse_connection_id: None,
        }
    }

    pub fn assert_state(&self, expected: &[OutOfBandState]) -> Result<(), StateError> {
        if expected.contains(&self.state) {
            return Ok(());
        }
        Err(StateError::InvalidState {
            current: self.state.to_string(),
            expected: expected.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn assert_role(&self, expected: OutOfBandRole) -> Result<(), StateError> {
        if self.role == expected {
            return Ok(());
        }
        Err(StateError::InvalidRole {
            current: self.role.to_string(),
            expected: expected.to_string(),
        })
    }

    pub fn advance_to(&mut self, state: OutOfBandState) -> Result<(), StateError> {
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

impl Record for OutOfBandRecord {
    const RECORD_TYPE: &'static str = "out_of_band";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert("state".into(), self.state.to_string().into());
        tags.insert("role".into(), self.role.to_string().into());
        tags.insert("invitation_id".into(), self.invitation.id.as_str().into());
        if let Ok(Some(invitation_key)) = self.invitation.invitation_key() {
            if let Ok(fingerprint) = verkey_to_fingerprint(&invitation_key) {
                tags.insert("recipient_key_fingerprint".into(), fingerprint.into());
            }
            tags.insert("invitation_key".into(), invitation_key.into());
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{did::verkey_to_did_key, keys::LocalKey};
    use url::Url;

    fn inline_invitation(verkey: &str) -> OutOfBandInvitation {
        let service = DidCommService {
            id: "#inline".into(),
            service_type: "did-communication".into(),
            service_endpoint: Url::parse("https://agent.example.com").unwrap(),
            recipient_keys: vec![verkey_to_did_key(verkey).unwrap()],
            routing_keys: vec![],
        };
        OutOfBandInvitation::new(Some("Alice".into()), vec![OobService::Inline(service)])
    }

    #[test]
    fn invitation_key_is_normalized_to_verkey() {
        let key = LocalKey::generate();
        let invitation = inline_invitation(&key.verkey());

        assert_eq!(invitation.invitation_key().unwrap().as_deref(), Some(key.verkey()));
    }

    #[test]
    fn did_only_services_have_no_invitation_key() {
        let invitation = OutOfBandInvitation::new(
            None,
            vec![OobService::Did("did:example:123".into())],
        );
        assert!(invitation.invitation_key().unwrap().is_none());
    }

    #[test]
    fn record_tags_carry_key_and_fingerprint() {
        let key = LocalKey::generate();
        let record =
            OutOfBandRecord::new(OutOfBandRole::Sender, inline_invitation(&key.verkey()), false);

        let tags = record.tags();
        assert_eq!(tags.get("invitation_key"), Some(&key.verkey().into()));
        assert_eq!(
            tags.get("recipient_key_fingerprint"),
            Some(&verkey_to_fingerprint(&key.verkey()).unwrap().into()),
        );
    }

    #[test]
    fn sender_and_receiver_paths_through_the_machine() {
        let key = LocalKey::generate();
        let invitation = inline_invitation(&key.verkey());

        let mut sender = OutOfBandRecord::new(OutOfBandRole::Sender, invitation.clone(), false);
        sender.advance_to(OutOfBandState::AwaitResponse).unwrap();
        sender.advance_to(OutOfBandState::Done).unwrap();

        let mut receiver = OutOfBandRecord::new(OutOfBandRole::Receiver, invitation, false);
        receiver.advance_to(OutOfBandState::PrepareResponse).unwrap();
        let err = receiver.advance_to(OutOfBandState::AwaitResponse).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition {
                from: "prepare-response".into(),
                to: "await-response".into(),
            }
        );
    }

    #[test]
    fn invitation_round_trips_through_json() {
        let key = LocalKey::generate();
        let invitation = inline_invitation(&key.verkey());

        let json = serde_json::to_value(&invitation).unwrap();
        assert_eq!(json["@type"], OutOfBandInvitation::TYPE);
        assert!(json.get("requests~attach").is_none());

        let back: OutOfBandInvitation = serde_json::from_value(json).unwrap();
        assert_eq!(back.services, invitation.services);
    }
}
