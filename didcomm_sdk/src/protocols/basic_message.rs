//! `basicmessage/1.0` handler: surface the content to the application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    dispatch::{InboundContext, MessageHandler, OutboundMessage},
    events::{AgentEvent, EventBus},
    message::PlainMessage,
};

pub const BASIC_MESSAGE_TYPE: &str = "https://didcomm.org/basicmessage/1.0/message";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_time: Option<DateTime<Utc>>,
}

pub struct BasicMessageHandler {
    pub events: EventBus,
}

#[async_trait]
impl MessageHandler for BasicMessageHandler {
    fn message_type(&self) -> &'static str {
        BASIC_MESSAGE_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let body: BasicMessage = ctx.message.decode()?;
        let connection = ctx.connection()?;

        self.events.emit(AgentEvent::BasicMessageReceived {
            connection_id: connection.id.clone(),
            content: body.content,
            sent_time: body.sent_time,
        });

        Ok(None)
    }
}

pub(crate) fn basic_message(content: &str) -> Result<PlainMessage, Error> {
    Ok(PlainMessage::new(
        BASIC_MESSAGE_TYPE,
        serde_json::to_value(BasicMessage {
            content: content.to_string(),
            sent_time: Some(Utc::now()),
        })?,
    ))
}
