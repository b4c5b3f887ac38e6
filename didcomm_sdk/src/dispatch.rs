//! Message dispatch by `@type`.
//!
//! The dispatcher is a flat registry: one handler per exact message-type
//! URI, resolved after the envelope has been unpacked and the sending
//! connection (if any) looked up.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    Error,
    did::DidCommService,
    message::PlainMessage,
    records::ConnectionRecord,
};

/// Everything a handler gets to see about an inbound message.
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub message: PlainMessage,
    /// Authenticated sender key for authcrypt envelopes.
    pub sender_verkey: Option<String>,
    /// The local key the envelope was addressed to.
    pub recipient_verkey: Option<String>,
    /// The connection the sender key resolved to, if any.
    pub connection: Option<ConnectionRecord>,
}

impl InboundContext {
    /// The resolved connection, or [`Error::MissingConnection`] for
    /// handlers that require one.
    pub fn connection(&self) -> Result<&ConnectionRecord, Error> {
        self.connection.as_ref().ok_or(Error::MissingConnection)
    }
}

/// A reply produced by a handler, with enough addressing information for
/// the agent to pack it.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message: PlainMessage,
    /// Target connection; its remote service and local key are used
    /// unless overridden below.
    pub connection_id: Option<String>,
    /// Explicit target service, for messages sent before a connection
    /// exists.
    pub service: Option<DidCommService>,
    /// Explicit sender key, for authcrypt outside a completed connection.
    pub sender_verkey: Option<String>,
}

impl OutboundMessage {
    /// A reply over an established connection.
    pub fn reply(message: PlainMessage, connection_id: impl Into<String>) -> Self {
        Self {
            message,
            connection_id: Some(connection_id.into()),
            service: None,
            sender_verkey: None,
        }
    }

    /// A message addressed to an explicit service, signed with the given
    /// local key.
    pub fn to_service(
        message: PlainMessage,
        service: DidCommService,
        sender_verkey: impl Into<String>,
    ) -> Self {
        Self {
            message,
            connection_id: None,
            service: Some(service),
            sender_verkey: Some(sender_verkey.into()),
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The exact message-type URI this handler consumes.
    fn message_type(&self) -> &'static str;

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error>;
}

/// Handler registry keyed by message-type URI.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<&'static str, Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a handler; registering two handlers for the same type is
    /// a configuration error and fails fast.
    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) -> Result<(), Error> {
        let message_type = handler.message_type();
        if self.handlers.contains_key(message_type) {
            return Err(Error::DuplicateHandler(message_type.to_string()));
        }
        self.handlers.insert(message_type, handler);
        Ok(())
    }

    pub async fn dispatch(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let message_type = ctx.message.message_type.clone();
        let handler = self
            .handlers
            .get(message_type.as_str())
            .ok_or_else(|| Error::UnsupportedMessageType(message_type.clone()))?;

        tracing::debug!(%message_type, id = %ctx.message.id, "dispatching message");
        handler.handle(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        fn message_type(&self) -> &'static str {
            "https://didcomm.org/test/1.0/echo"
        }

        async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
            Ok(Some(OutboundMessage::reply(ctx.message, "conn-1")))
        }
    }

    fn context(message_type: &str) -> InboundContext {
        InboundContext {
            message: PlainMessage::new(message_type, json!({})),
            sender_verkey: None,
            recipient_verkey: None,
            connection: None,
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Arc::new(EchoHandler)).unwrap();

        let outbound = dispatcher
            .dispatch(context("https://didcomm.org/test/1.0/echo"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outbound.connection_id.as_deref(), Some("conn-1"));
    }

    #[tokio::test]
    async fn unknown_type_is_an_error() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .dispatch(context("https://didcomm.org/test/1.0/echo"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedMessageType(t) if t.ends_with("echo")));
    }

    #[tokio::test]
    async fn duplicate_registration_fails_fast() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Arc::new(EchoHandler)).unwrap();

        let err = dispatcher.register(Arc::new(EchoHandler)).unwrap_err();
        assert!(matches!(err, Error::DuplicateHandler(t) if t.ends_with("echo")));
    }

    #[tokio::test]
    async fn missing_connection_guard() {
        let ctx = context("https://didcomm.org/test/1.0/echo");
        assert!(matches!(ctx.connection(), Err(Error::MissingConnection)));
    }
}
