//! Plaintext agent messages (JWM) and their decorators.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use base64ct::{Base64UrlUnpadded, Encoding};

/// The `~thread` decorator correlating messages of one protocol exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
}

/// A decrypted wire message: `@id`, `@type`, optional `~thread`, and the
/// protocol-specific body kept as JSON until a handler decodes it.
///
/// Plain messages are ephemeral; they live for one unpack/dispatch cycle
/// and are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlainMessage {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub message_type: String,
    #[serde(rename = "~thread", skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
    #[serde(flatten)]
    pub body: serde_json::Value,
}

impl PlainMessage {
    pub fn new(message_type: &str, body: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: message_type.to_string(),
            thread: None,
            body,
        }
    }

    pub fn with_thread_id(mut self, thid: &str) -> Self {
        self.thread.get_or_insert_with(Thread::default).thid = Some(thid.to_string());
        self
    }

    pub fn with_parent_thread_id(mut self, pthid: &str) -> Self {
        self.thread.get_or_insert_with(Thread::default).pthid = Some(pthid.to_string());
        self
    }

    /// The thread id of this message, falling back to `@id` for the first
    /// message of an exchange.
    pub fn thread_id(&self) -> &str {
        self.thread
            .as_ref()
            .and_then(|t| t.thid.as_deref())
            .unwrap_or(&self.id)
    }

    pub fn parent_thread_id(&self) -> Option<&str> {
        self.thread.as_ref().and_then(|t| t.pthid.as_deref())
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Decode the full message into a typed protocol message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }

    /// Encode a typed protocol message as a plain message.
    pub fn encode<T: Serialize>(message: &T) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(message)?)
    }
}

/// An `~attach` decorator entry carrying opaque base64 payload data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "mime-type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub data: AttachmentData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentData {
    pub base64: String,
}

impl Attachment {
    pub fn from_bytes(id: &str, bytes: &[u8]) -> Self {
        Self {
            id: id.to_string(),
            mime_type: Some("application/json".to_string()),
            data: AttachmentData {
                base64: Base64UrlUnpadded::encode_string(bytes),
            },
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64ct::Error> {
        Base64UrlUnpadded::decode_vec(&self.data.base64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_id_falls_back_to_message_id() {
        let message = PlainMessage::new("https://didcomm.org/test/1.0/msg", json!({}));
        assert_eq!(message.thread_id(), message.id);

        let threaded = message.clone().with_thread_id("thread-1");
        assert_eq!(threaded.thread_id(), "thread-1");
        assert_eq!(threaded.parent_thread_id(), None);

        let parented = threaded.with_parent_thread_id("parent-1");
        assert_eq!(parented.parent_thread_id(), Some("parent-1"));
    }

    #[test]
    fn body_fields_are_flattened() {
        let message = PlainMessage::new(
            "https://didcomm.org/basicmessage/1.0/message",
            json!({"content": "hi"}),
        );

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["@type"], "https://didcomm.org/basicmessage/1.0/message");
        assert_eq!(json["content"], "hi");

        let parsed = PlainMessage::from_bytes(&serde_json::to_vec(&message).unwrap()).unwrap();
        assert_eq!(parsed.body["content"], "hi");
        assert_eq!(parsed.id, message.id);
    }

    #[test]
    fn attachment_round_trip() {
        let attachment = Attachment::from_bytes("presentation-1", b"{\"proof\":42}");
        assert_eq!(attachment.decode().unwrap(), b"{\"proof\":42}");
    }
}
