//! `coordinate-mediation/1.0` handlers.
//!
//! The mediator side answers mediate requests and maintains per-recipient
//! keylists; the recipient side settles its own mediation record from
//! grants and denies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::{
    Error,
    did::key_reference_to_verkey,
    dispatch::{InboundContext, MessageHandler, OutboundMessage},
    events::{AgentEvent, EventBus},
    message::PlainMessage,
    records::{MediationRecord, MediationRole, MediationState},
    storage::{RecordStore, TagFilter},
};

pub const MEDIATE_REQUEST_TYPE: &str =
    "https://didcomm.org/coordinate-mediation/1.0/mediate-request";
pub const MEDIATE_GRANT_TYPE: &str = "https://didcomm.org/coordinate-mediation/1.0/mediate-grant";
pub const MEDIATE_DENY_TYPE: &str = "https://didcomm.org/coordinate-mediation/1.0/mediate-deny";
pub const KEYLIST_UPDATE_TYPE: &str =
    "https://didcomm.org/coordinate-mediation/1.0/keylist-update";
pub const KEYLIST_UPDATE_RESPONSE_TYPE: &str =
    "https://didcomm.org/coordinate-mediation/1.0/keylist-update-response";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediationGrant {
    pub endpoint: Url,
    pub routing_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeylistUpdateAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdateItem {
    pub recipient_key: String,
    pub action: KeylistUpdateAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdate {
    pub updates: Vec<KeylistUpdateItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeylistUpdateResult {
    Success,
    NoChange,
    ClientError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdated {
    pub recipient_key: String,
    pub action: KeylistUpdateAction,
    pub result: KeylistUpdateResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdateResponse {
    pub updated: Vec<KeylistUpdated>,
}

async fn mediation_for_connection(
    store: &RecordStore,
    connection_id: &str,
    role: MediationRole,
) -> Result<MediationRecord, Error> {
    Ok(store
        .get_single_by_query(
            &TagFilter::new()
                .is("connection_id", connection_id)
                .is("role", role.to_string()),
        )
        .await?)
}

/// Mediator side: record mediate requests and grant or deny them.
pub struct MediationRequestHandler {
    pub store: RecordStore,
    pub events: EventBus,
    pub endpoint: Url,
    /// The key routed envelopes must be wrapped for.
    pub routing_verkey: String,
    pub auto_accept: bool,
}

#[async_trait]
impl MessageHandler for MediationRequestHandler {
    fn message_type(&self) -> &'static str {
        MEDIATE_REQUEST_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let connection = ctx.connection()?;

        let mut mediation = MediationRecord::new(
            MediationRole::Mediator,
            connection.id.clone(),
            ctx.message.thread_id().to_string(),
        );

        if !self.auto_accept {
            self.store.save(&mediation).await?;
            self.events.emit(AgentEvent::MediationStateChanged {
                mediation_id: mediation.id,
                state: mediation.state,
            });
            return Ok(None);
        }

        mediation.to_granted(self.endpoint.clone(), vec![self.routing_verkey.clone()])?;
        self.store.save(&mediation).await?;
        self.events.emit(AgentEvent::MediationStateChanged {
            mediation_id: mediation.id.clone(),
            state: mediation.state,
        });

        let grant = PlainMessage::new(
            MEDIATE_GRANT_TYPE,
            serde_json::to_value(MediationGrant {
                endpoint: self.endpoint.clone(),
                routing_keys: vec![self.routing_verkey.clone()],
            })?,
        )
        .with_thread_id(ctx.message.thread_id());

        Ok(Some(OutboundMessage::reply(grant, connection.id.clone())))
    }
}

/// Recipient side: settle the pending mediation record from a grant.
pub struct MediationGrantHandler {
    pub store: RecordStore,
    pub events: EventBus,
}

#[async_trait]
impl MessageHandler for MediationGrantHandler {
    fn message_type(&self) -> &'static str {
        MEDIATE_GRANT_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let grant: MediationGrant = ctx.message.decode()?;
        let connection = ctx.connection()?;

        let mut mediation =
            mediation_for_connection(&self.store, &connection.id, MediationRole::Recipient).await?;
        mediation.to_granted(grant.endpoint, grant.routing_keys)?;
        self.store.update(&mediation).await?;
        self.events.emit(AgentEvent::MediationStateChanged {
            mediation_id: mediation.id,
            state: mediation.state,
        });

        Ok(None)
    }
}

/// Recipient side: settle the pending mediation record from a deny.
pub struct MediationDenyHandler {
    pub store: RecordStore,
    pub events: EventBus,
}

#[async_trait]
impl MessageHandler for MediationDenyHandler {
    fn message_type(&self) -> &'static str {
        MEDIATE_DENY_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let connection = ctx.connection()?;

        let mut mediation =
            mediation_for_connection(&self.store, &connection.id, MediationRole::Recipient).await?;
        mediation.to_denied()?;
        self.store.update(&mediation).await?;
        self.events.emit(AgentEvent::MediationStateChanged {
            mediation_id: mediation.id,
            state: mediation.state,
        });

        Ok(None)
    }
}

/// Mediator side: maintain the recipient's registered keylist. Updates
/// are only honored once mediation has been granted.
pub struct KeylistUpdateHandler {
    pub store: RecordStore,
}

#[async_trait]
impl MessageHandler for KeylistUpdateHandler {
    fn message_type(&self) -> &'static str {
        KEYLIST_UPDATE_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let update: KeylistUpdate = ctx.message.decode()?;
        let connection = ctx.connection()?;

        let mut mediation =
            mediation_for_connection(&self.store, &connection.id, MediationRole::Mediator).await?;
        mediation.assert_state(&[MediationState::Granted])?;

        let mut updated = Vec::with_capacity(update.updates.len());
        for item in update.updates {
            let result = match key_reference_to_verkey(&item.recipient_key) {
                Err(_) => KeylistUpdateResult::ClientError,
                Ok(verkey) => match item.action {
                    KeylistUpdateAction::Add => {
                        if mediation.recipient_keys.contains(&verkey) {
                            KeylistUpdateResult::NoChange
                        } else {
                            mediation.recipient_keys.push(verkey);
                            KeylistUpdateResult::Success
                        }
                    }
                    KeylistUpdateAction::Remove => {
                        let before = mediation.recipient_keys.len();
                        mediation.recipient_keys.retain(|k| *k != verkey);
                        if mediation.recipient_keys.len() == before {
                            KeylistUpdateResult::NoChange
                        } else {
                            KeylistUpdateResult::Success
                        }
                    }
                },
            };
            updated.push(KeylistUpdated {
                recipient_key: item.recipient_key,
                action: item.action,
                result,
            });
        }
        mediation.touch();
        self.store.update(&mediation).await?;

        let response = PlainMessage::new(
            KEYLIST_UPDATE_RESPONSE_TYPE,
            serde_json::to_value(KeylistUpdateResponse { updated })?,
        )
        .with_thread_id(ctx.message.thread_id());

        Ok(Some(OutboundMessage::reply(response, connection.id.clone())))
    }
}

/// Recipient side: mirror confirmed keylist changes into the local
/// mediation record.
pub struct KeylistUpdateResponseHandler {
    pub store: RecordStore,
}

#[async_trait]
impl MessageHandler for KeylistUpdateResponseHandler {
    fn message_type(&self) -> &'static str {
        KEYLIST_UPDATE_RESPONSE_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let response: KeylistUpdateResponse = ctx.message.decode()?;
        let connection = ctx.connection()?;

        let mut mediation =
            mediation_for_connection(&self.store, &connection.id, MediationRole::Recipient).await?;

        for entry in response.updated {
            if entry.result != KeylistUpdateResult::Success {
                tracing::warn!(
                    recipient_key = %entry.recipient_key,
                    result = ?entry.result,
                    "keylist update was not applied by the mediator"
                );
                continue;
            }
            let verkey = key_reference_to_verkey(&entry.recipient_key)?;
            match entry.action {
                KeylistUpdateAction::Add => {
                    if !mediation.recipient_keys.contains(&verkey) {
                        mediation.recipient_keys.push(verkey);
                    }
                }
                KeylistUpdateAction::Remove => {
                    mediation.recipient_keys.retain(|k| *k != verkey);
                }
            }
        }
        mediation.touch();
        self.store.update(&mediation).await?;

        Ok(None)
    }
}

pub(crate) fn mediate_request() -> PlainMessage {
    PlainMessage::new(MEDIATE_REQUEST_TYPE, json!({}))
}

pub(crate) fn keylist_update(updates: Vec<KeylistUpdateItem>) -> Result<PlainMessage, Error> {
    Ok(PlainMessage::new(
        KEYLIST_UPDATE_TYPE,
        serde_json::to_value(KeylistUpdate { updates })?,
    ))
}
