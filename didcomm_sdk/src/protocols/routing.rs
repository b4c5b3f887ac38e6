//! `routing/1.0` forward handler (mediator side).
//!
//! Delivery is the application's concern; the handler only checks that
//! the `to` key is registered under a granted mediation and hands the
//! inner envelope out as an event.

use async_trait::async_trait;

use crate::{
    Error,
    did::key_reference_to_verkey,
    dispatch::{InboundContext, MessageHandler, OutboundMessage},
    envelope::ForwardMessage,
    events::{AgentEvent, EventBus},
    records::{MediationRole, MediationState},
    storage::{RecordStore, TagFilter},
};

pub struct ForwardHandler {
    pub store: RecordStore,
    pub events: EventBus,
}

#[async_trait]
impl MessageHandler for ForwardHandler {
    fn message_type(&self) -> &'static str {
        ForwardMessage::TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let forward: ForwardMessage = ctx.message.decode()?;
        let to = key_reference_to_verkey(&forward.to)?;

        let mediation = self
            .store
            .get_single_by_query::<crate::records::MediationRecord>(
                &TagFilter::new()
                    .is("role", MediationRole::Mediator.to_string())
                    .is("recipient_keys", to.as_str()),
            )
            .await?;
        mediation.assert_state(&[MediationState::Granted])?;

        tracing::debug!(%to, mediation_id = %mediation.id, "queueing forwarded envelope");
        self.events.emit(AgentEvent::ForwardReceived {
            to,
            envelope: forward.msg,
        });

        Ok(None)
    }
}
