use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::StateError;
use crate::storage::{Record, RecordTags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediationState {
    Requested,
    Granted,
    Denied,
}

impl fmt::Display for MediationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediationState::Requested => "requested",
            MediationState::Granted => "granted",
            MediationState::Denied => "denied",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediationRole {
    Mediator,
    Recipient,
}

impl fmt::Display for MediationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediationRole::Mediator => "mediator",
            MediationRole::Recipient => "recipient",
        };
        write!(f, "{name}")
    }
}

/// A routing agreement with a mediator, or (in the mediator role) with a
/// served recipient. `recipient_keys` is the registered keylist; on the
/// mediator side it drives forward matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediationRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: MediationState,
    pub role: MediationRole,
    pub connection_id: String,
    pub thread_id: String,
    pub endpoint: Option<Url>,
    pub recipient_keys: Vec<String>,
    pub routing_keys: Vec<String>,
}

impl MediationRecord {
    pub fn new(role: MediationRole, connection_id: String, thread_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            state: MediationState::Requested,
            role,
            connection_id,
            thread_id,
            endpoint: None,
            recipient_keys: Vec::new(),
            routing_keys: Vec::new(),
        }
    }

    pub fn assert_state(&self, expected: &[MediationState]) -> Result<(), StateError> {
        if expected.contains(&self.state) {
            return Ok(());
        }
        Err(StateError::InvalidState {
            current: self.state.to_string(),
            expected: expected.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn assert_role(&self, expected: MediationRole) -> Result<(), StateError> {
        if self.role == expected {
            return Ok(());
        }
        Err(StateError::InvalidRole {
            current: self.role.to_string(),
            expected: expected.to_string(),
        })
    }

    /// Settle the request as granted, recording the mediator's endpoint
    /// and routing keys.
    pub fn to_granted(
        &mut self,
        endpoint: Url,
        routing_keys: Vec<String>,
    ) -> Result<(), StateError> {
        self.assert_state(&[MediationState::Requested])?;
        self.state = MediationState::Granted;
        self.endpoint = Some(endpoint);
        self.routing_keys = routing_keys;
        self.touch();
        Ok(())
    }

    pub fn to_denied(&mut self) -> Result<(), StateError> {
        self.assert_state(&[MediationState::Requested])?;
        self.state = MediationState::Denied;
        self.touch();
        Ok(())
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Record for MediationRecord {
    const RECORD_TYPE: &'static str = "mediation";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert("state".into(), self.state.to_string().into());
        tags.insert("role".into(), self.role.to_string().into());
        tags.insert("connection_id".into(), self.connection_id.as_str().into());
        tags.insert("thread_id".into(), self.thread_id.as_str().into());
        tags.insert("recipient_keys".into(), self.recipient_keys.clone().into());
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requested() -> MediationRecord {
        MediationRecord::new(MediationRole::Recipient, "conn-1".into(), "thread-1".into())
    }

    #[test]
    fn grant_settles_endpoint_and_routing_keys() {
        let mut rec = requested();
        rec.to_granted(
            Url::parse("https://mediator.example.com").unwrap(),
            vec!["route-key".into()],
        )
            .unwrap();

        assert_eq!(rec.state, MediationState::Granted);
        assert_eq!(
            rec.endpoint.as_ref().map(Url::as_str),
            Some("https://mediator.example.com/")
        );
        assert_eq!(rec.routing_keys, vec!["route-key".to_string()]);
    }

    #[test]
    fn settled_records_cannot_be_settled_again() {
        let mut rec = requested();
        rec.to_denied().unwrap();

        let err = rec
            .to_granted(Url::parse("https://mediator.example.com").unwrap(), vec![])
            .unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidState {
                current: "denied".into(),
                expected: vec!["requested".into()],
            }
        );
    }

    #[test]
    fn granted_guard_rejects_requested_record() {
        let rec = requested();
        let err = rec.assert_state(&[MediationState::Granted]).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidState {
                current: "requested".into(),
                expected: vec!["granted".into()],
            }
        );
    }

    #[test]
    fn keylist_is_indexed_as_list_tag() {
        let mut rec = requested();
        rec.recipient_keys = vec!["key-a".into(), "key-b".into()];

        let tags = rec.tags();
        assert_eq!(
            tags.get("recipient_keys"),
            Some(&vec!["key-a".to_string(), "key-b".to_string()].into())
        );
    }
}
