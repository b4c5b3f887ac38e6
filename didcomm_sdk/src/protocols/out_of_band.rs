//! `out-of-band/1.1` handshake-reuse handlers.
//!
//! Reuse lets a receiver who already has a completed connection with the
//! inviter acknowledge a new invitation over it instead of opening a
//! second connection. Reuse messages carry the invitation id as their
//! parent thread.

use async_trait::async_trait;
use serde_json::json;

use crate::{
    Error,
    dispatch::{InboundContext, MessageHandler, OutboundMessage},
    events::{AgentEvent, EventBus},
    message::PlainMessage,
    records::{OutOfBandRecord, OutOfBandRole, OutOfBandState},
    storage::{RecordStore, TagFilter},
};

pub const HANDSHAKE_REUSE_TYPE: &str = "https://didcomm.org/out-of-band/1.1/handshake-reuse";
pub const HANDSHAKE_REUSE_ACCEPTED_TYPE: &str =
    "https://didcomm.org/out-of-band/1.1/handshake-reuse-accepted";

async fn out_of_band_by_invitation(
    store: &RecordStore,
    invitation_id: &str,
    role: OutOfBandRole,
) -> Result<OutOfBandRecord, Error> {
    Ok(store
        .get_single_by_query(
            &TagFilter::new()
                .is("invitation_id", invitation_id)
                .is("role", role.to_string()),
        )
        .await?)
}

/// Inviter side: acknowledge reuse of a reusable invitation over an
/// existing connection.
pub struct HandshakeReuseHandler {
    pub store: RecordStore,
    pub events: EventBus,
}

#[async_trait]
impl MessageHandler for HandshakeReuseHandler {
    fn message_type(&self) -> &'static str {
        HANDSHAKE_REUSE_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let connection = ctx.connection()?;
        if !connection.is_ready() {
            return Err(Error::InvalidMessage(
                "handshake reuse requires a completed connection",
            ));
        }

        let invitation_id = ctx
            .message
            .parent_thread_id()
            .ok_or(Error::InvalidMessage("handshake reuse without parent thread"))?;
        let oob =
            out_of_band_by_invitation(&self.store, invitation_id, OutOfBandRole::Sender).await?;
        oob.assert_state(&[OutOfBandState::AwaitResponse])?;
        if !oob.reusable {
            return Err(Error::InvalidMessage("invitation is not reusable"));
        }

        self.events.emit(AgentEvent::HandshakeReused {
            out_of_band_id: oob.id,
            connection_id: connection.id.clone(),
        });

        let accepted = PlainMessage::new(HANDSHAKE_REUSE_ACCEPTED_TYPE, json!({}))
            .with_thread_id(ctx.message.thread_id())
            .with_parent_thread_id(invitation_id);
        Ok(Some(OutboundMessage::reply(accepted, connection.id.clone())))
    }
}

/// Receiver side: close the out-of-band exchange once reuse has been
/// accepted.
pub struct HandshakeReuseAcceptedHandler {
    pub store: RecordStore,
    pub events: EventBus,
}

#[async_trait]
impl MessageHandler for HandshakeReuseAcceptedHandler {
    fn message_type(&self) -> &'static str {
        HANDSHAKE_REUSE_ACCEPTED_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let connection = ctx.connection()?;

        let invitation_id = ctx
            .message
            .parent_thread_id()
            .ok_or(Error::InvalidMessage("handshake reuse without parent thread"))?;
        let mut oob =
            out_of_band_by_invitation(&self.store, invitation_id, OutOfBandRole::Receiver).await?;

        oob.reuse_connection_id = Some(connection.id.clone());
        oob.advance_to(OutOfBandState::Done)?;
        self.store.update(&oob).await?;

        self.events.emit(AgentEvent::HandshakeReused {
            out_of_band_id: oob.id.clone(),
            connection_id: connection.id.clone(),
        });
        self.events.emit(AgentEvent::OutOfBandStateChanged {
            out_of_band_id: oob.id,
            state: OutOfBandState::Done,
        });

        Ok(None)
    }
}

pub(crate) fn handshake_reuse(invitation_id: &str) -> PlainMessage {
    PlainMessage::new(HANDSHAKE_REUSE_TYPE, json!({})).with_parent_thread_id(invitation_id)
}
