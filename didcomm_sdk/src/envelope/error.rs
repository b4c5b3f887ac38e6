use crate::did::DidError;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("decryption failed: no recipient entry matches an owned key, or authentication failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),
    #[error("envelope requires at least one recipient key")]
    MissingRecipients,
    #[error("invalid recipient key: {0}")]
    InvalidKey(#[from] DidError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}
