use thiserror::Error;

/// Top-level agent error, aggregating the module errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("DID error: {0}")]
    Did(#[from] crate::did::DidError),
    #[error("envelope error: {0}")]
    Crypto(#[from] crate::envelope::CryptoError),
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("state error: {0}")]
    State(#[from] crate::records::StateError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no handler registered for message type {0}")]
    UnsupportedMessageType(String),
    #[error("a handler is already registered for message type {0}")]
    DuplicateHandler(String),
    #[error("message requires an established connection")]
    MissingConnection,
    #[error("key not found in keyring: {0}")]
    MissingKey(String),
    #[error("no did-communication service available for the target")]
    MissingService,
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
}
