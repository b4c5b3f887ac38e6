//! `trust_ping/1.0` handlers.
//!
//! The ping doubles as the connection-complete acknowledgement: an
//! inviter in `responded` moves to `complete` when the first ping
//! arrives over the new connection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    Error,
    dispatch::{InboundContext, MessageHandler, OutboundMessage},
    events::{AgentEvent, EventBus},
    message::PlainMessage,
    records::{ConnectionRecord, ConnectionState},
    storage::RecordStore,
};

pub const PING_TYPE: &str = "https://didcomm.org/trust_ping/1.0/ping";
pub const PING_RESPONSE_TYPE: &str = "https://didcomm.org/trust_ping/1.0/ping_response";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustPing {
    #[serde(default = "default_response_requested")]
    pub response_requested: bool,
}

fn default_response_requested() -> bool {
    true
}

pub(crate) fn ping() -> PlainMessage {
    PlainMessage::new(PING_TYPE, json!({ "response_requested": true }))
}

pub struct TrustPingHandler {
    pub store: RecordStore,
    pub events: EventBus,
}

#[async_trait]
impl MessageHandler for TrustPingHandler {
    fn message_type(&self) -> &'static str {
        PING_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let ping: TrustPing = ctx.message.decode()?;
        let mut connection = ctx.connection()?.clone();

        if connection.state == ConnectionState::Responded {
            connection.advance_to(ConnectionState::Complete)?;
            self.store.update(&connection).await?;
            self.events.emit(AgentEvent::ConnectionStateChanged {
                connection_id: connection.id.clone(),
                state: connection.state,
            });
        }

        if !ping.response_requested {
            return Ok(None);
        }

        let response = PlainMessage::new(PING_RESPONSE_TYPE, json!({}))
            .with_thread_id(ctx.message.thread_id());
        Ok(Some(OutboundMessage::reply(response, connection.id)))
    }
}

/// Invitee side: the ping-response confirms the inviter processed the
/// first message over the connection, so `responded` moves to `complete`.
pub struct TrustPingResponseHandler {
    pub store: RecordStore,
    pub events: EventBus,
}

#[async_trait]
impl MessageHandler for TrustPingResponseHandler {
    fn message_type(&self) -> &'static str {
        PING_RESPONSE_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let mut connection: ConnectionRecord = ctx.connection()?.clone();

        if connection.state == ConnectionState::Responded {
            connection.advance_to(ConnectionState::Complete)?;
            self.store.update(&connection).await?;
            self.events.emit(AgentEvent::ConnectionStateChanged {
                connection_id: connection.id.clone(),
                state: connection.state,
            });
        }

        tracing::debug!(connection_id = %connection.id, "trust ping acknowledged");
        Ok(None)
    }
}
