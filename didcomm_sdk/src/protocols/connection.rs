//! `connections/1.0` exchange handlers.
//!
//! The inviter side answers requests correlated to a published
//! out-of-band invitation; the invitee side consumes the response and
//! confirms with a trust ping.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    Error,
    did::DidDocument,
    dispatch::{InboundContext, MessageHandler, OutboundMessage},
    events::{AgentEvent, EventBus},
    keys::KeyRing,
    message::PlainMessage,
    records::{
        ConnectionRecord, ConnectionRole, ConnectionState, MediationRecord, MediationState,
        OutOfBandRecord, OutOfBandRole, OutOfBandState,
    },
    storage::{RecordStore, TagFilter},
};

pub const PROTOCOL_URI: &str = "https://didcomm.org/connections/1.0";
pub const REQUEST_TYPE: &str = "https://didcomm.org/connections/1.0/request";
pub const RESPONSE_TYPE: &str = "https://didcomm.org/connections/1.0/response";

/// The `connection` block shared by requests and responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionData {
    #[serde(rename = "DID")]
    pub did: String,
    #[serde(rename = "DIDDoc")]
    pub did_doc: DidDocument,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub label: String,
    pub connection: ConnectionData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub connection: ConnectionData,
}

/// Resolve the endpoint and routing keys a fresh key should be reachable
/// at: the mediator's when one is granted, the agent's own otherwise.
pub(crate) async fn reachable_endpoint(
    store: &RecordStore,
    own_endpoint: &Url,
    mediator_id: Option<&str>,
) -> Result<(Url, Vec<String>), Error> {
    let Some(mediator_id) = mediator_id else {
        return Ok((own_endpoint.clone(), Vec::new()));
    };

    let mediation: MediationRecord = store.get_by_id(mediator_id).await?;
    mediation.assert_state(&[MediationState::Granted])?;
    let endpoint = mediation
        .endpoint
        .clone()
        .ok_or(Error::MissingService)?;
    Ok((endpoint, mediation.routing_keys.clone()))
}

/// Inviter side: consume a connection request against a published
/// invitation and answer with a response under a fresh key.
pub struct ConnectionRequestHandler {
    pub store: RecordStore,
    pub events: EventBus,
    pub keys: KeyRing,
    pub endpoint: Url,
}

#[async_trait]
impl MessageHandler for ConnectionRequestHandler {
    fn message_type(&self) -> &'static str {
        REQUEST_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let request: ConnectionRequest = ctx.message.decode()?;
        let recipient_verkey = ctx
            .recipient_verkey
            .as_deref()
            .ok_or(Error::InvalidMessage("connection request was not encrypted to a known key"))?;

        // the request is correlated to our invitation by the key it was
        // encrypted to
        let mut oob: OutOfBandRecord = self
            .store
            .get_single_by_query(
                &TagFilter::new()
                    .is("invitation_key", recipient_verkey)
                    .is("role", OutOfBandRole::Sender.to_string()),
            )
            .await?;
        oob.assert_state(&[OutOfBandState::AwaitResponse])?;

        let mut connection = ConnectionRecord::new(ConnectionRole::Inviter, ConnectionState::Invited);
        connection.thread_id = Some(ctx.message.thread_id().to_string());
        connection.out_of_band_id = Some(oob.id.clone());
        connection.mediator_id = oob.mediator_id.clone();
        connection.their_label = Some(request.label);
        connection.their_did = Some(request.connection.did);
        connection.their_did_doc = Some(request.connection.did_doc);
        connection.advance_to(ConnectionState::Requested)?;
        self.store.save(&connection).await?;
        self.events.emit(AgentEvent::ConnectionStateChanged {
            connection_id: connection.id.clone(),
            state: connection.state,
        });

        if !oob.reusable {
            oob.advance_to(OutOfBandState::Done)?;
            self.store.update(&oob).await?;
            self.events.emit(AgentEvent::OutOfBandStateChanged {
                out_of_band_id: oob.id.clone(),
                state: oob.state,
            });
        }

        // respond under a fresh pairwise key, never the invitation key
        let response_key = self.keys.create_key();
        let (endpoint, routing_keys) =
            reachable_endpoint(&self.store, &self.endpoint, oob.mediator_id.as_deref()).await?;
        let did = response_key.verkey().to_string();
        let did_doc = DidDocument::for_endpoint(&did, response_key.verkey(), endpoint, routing_keys);

        connection.did = Some(did.clone());
        connection.did_doc = Some(did_doc.clone());
        connection.verkey = Some(response_key.verkey().to_string());
        connection.advance_to(ConnectionState::Responded)?;
        self.store.update(&connection).await?;
        self.events.emit(AgentEvent::ConnectionStateChanged {
            connection_id: connection.id.clone(),
            state: connection.state,
        });

        let response = PlainMessage::new(
            RESPONSE_TYPE,
            serde_json::to_value(ConnectionResponse {
                connection: ConnectionData { did, did_doc },
            })?,
        )
        .with_thread_id(ctx.message.thread_id());

        Ok(Some(OutboundMessage::reply(response, connection.id)))
    }
}

/// Invitee side: consume the inviter's response and confirm the
/// connection with a trust ping.
pub struct ConnectionResponseHandler {
    pub store: RecordStore,
    pub events: EventBus,
}

#[async_trait]
impl MessageHandler for ConnectionResponseHandler {
    fn message_type(&self) -> &'static str {
        RESPONSE_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let response: ConnectionResponse = ctx.message.decode()?;

        // the response arrives under the inviter's fresh key; correlate
        // by thread instead of sender
        let thread_id = ctx.message.thread_id();
        let mut connection: ConnectionRecord = self
            .store
            .get_single_by_query(
                &TagFilter::new()
                    .is("thread_id", thread_id)
                    .is("role", ConnectionRole::Invitee.to_string()),
            )
            .await?;
        connection.assert_state(&[ConnectionState::Requested])?;

        connection.their_did = Some(response.connection.did);
        connection.their_did_doc = Some(response.connection.did_doc);
        connection.advance_to(ConnectionState::Responded)?;
        self.store.update(&connection).await?;
        self.events.emit(AgentEvent::ConnectionStateChanged {
            connection_id: connection.id.clone(),
            state: connection.state,
        });

        // complete only once the inviter's ping-response comes back
        let ping = super::trust_ping::ping();

        if let Some(ref oob_id) = connection.out_of_band_id {
            let mut oob: OutOfBandRecord = self.store.get_by_id(oob_id).await?;
            if oob.state != OutOfBandState::Done {
                oob.advance_to(OutOfBandState::Done)?;
                self.store.update(&oob).await?;
                self.events.emit(AgentEvent::OutOfBandStateChanged {
                    out_of_band_id: oob.id,
                    state: OutOfBandState::Done,
                });
            }
        }

        Ok(Some(OutboundMessage::reply(ping, connection.id)))
    }
}
