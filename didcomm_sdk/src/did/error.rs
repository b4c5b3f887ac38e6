#[derive(thiserror::Error, Debug)]
pub enum DidError {
    #[error("invalid DID '{0}'")]
    InvalidDid(String),
    #[error("invalid multibase prefix in '{0}': expected base58btc ('z')")]
    InvalidMultibase(String),
    #[error("invalid base58 encoding: {0}")]
    Base58(#[from] bs58::decode::Error),
    #[error("unsupported key type (multicodec prefix {0:#04x}): only Ed25519 is supported")]
    UnsupportedKeyType(u8),
    #[error("invalid key length {0}, expected 32 bytes")]
    InvalidKeyLength(usize),
}
