//! DID parsing helpers and the `did:key` codec.
//!
//! A `did:key` embeds a public key in the identifier itself:
//! `did:key:` + multibase (`z`, base58btc) over the multicodec-prefixed
//! raw key. Only Ed25519 keys are supported; any other multicodec prefix
//! is rejected rather than silently tolerated.

mod document;
pub mod error;

pub use document::{DidCommService, DidDocument};
pub use error::DidError;

/// Multicodec prefix for an Ed25519 public key (unsigned varint 0xed).
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

const DID_KEY_PREFIX: &str = "did:key:";

/// Encode a base58 Ed25519 verkey as a `did:key` identifier.
pub fn verkey_to_did_key(verkey: &str) -> Result<String, DidError> {
    Ok(format!("{DID_KEY_PREFIX}{}", verkey_to_fingerprint(verkey)?))
}

/// Encode a base58 Ed25519 verkey as a bare multibase fingerprint (`z…`).
pub fn verkey_to_fingerprint(verkey: &str) -> Result<String, DidError> {
    let raw = bs58::decode(verkey).into_vec()?;
    if raw.len() != 32 {
        return Err(DidError::InvalidKeyLength(raw.len()));
    }

    let mut prefixed = Vec::with_capacity(34);
    prefixed.extend_from_slice(&ED25519_MULTICODEC);
    prefixed.extend_from_slice(&raw);

    Ok(format!("z{}", bs58::encode(&prefixed).into_string()))
}

/// Decode a `did:key` identifier back to the base58 verkey it embeds.
pub fn did_key_to_verkey(did: &str) -> Result<String, DidError> {
    let fingerprint = did
        .strip_prefix(DID_KEY_PREFIX)
        .ok_or_else(|| DidError::InvalidDid(did.to_string()))?;

    fingerprint_to_verkey(fingerprint)
}

/// Decode a bare multibase fingerprint back to the base58 verkey.
pub fn fingerprint_to_verkey(fingerprint: &str) -> Result<String, DidError> {
    let encoded = fingerprint
        .strip_prefix('z')
        .ok_or_else(|| DidError::InvalidMultibase(fingerprint.to_string()))?;

    let prefixed = bs58::decode(encoded).into_vec()?;

    match prefixed.as_slice() {
        [0xed, 0x01, key @ ..] => {
            if key.len() != 32 {
                return Err(DidError::InvalidKeyLength(key.len()));
            }

            Ok(bs58::encode(key).into_string())
        }
        [codec, ..] => Err(DidError::UnsupportedKeyType(*codec)),
        [] => Err(DidError::InvalidMultibase(fingerprint.to_string())),
    }
}

/// The DID method: the token between the first and second `:`.
pub fn did_method(did: &str) -> Result<&str, DidError> {
    let rest = did
        .strip_prefix("did:")
        .ok_or_else(|| DidError::InvalidDid(did.to_string()))?;

    let (method, _) = rest
        .split_once(':')
        .ok_or_else(|| DidError::InvalidDid(did.to_string()))?;

    Ok(method)
}

/// The method-specific id: everything after the method token, truncated
/// at the first path, query or fragment separator.
pub fn did_method_id(did: &str) -> Result<&str, DidError> {
    let rest = did
        .strip_prefix("did:")
        .ok_or_else(|| DidError::InvalidDid(did.to_string()))?;

    let (_, id) = rest
        .split_once(':')
        .ok_or_else(|| DidError::InvalidDid(did.to_string()))?;

    let end = id.find(['/', '?', '#']).unwrap_or(id.len());

    Ok(&id[..end])
}

/// Normalize a recipient or routing key reference to a base58 verkey.
/// Accepts both bare verkeys and `did:key` references.
pub fn key_reference_to_verkey(key: &str) -> Result<String, DidError> {
    if key.starts_with(DID_KEY_PREFIX) {
        did_key_to_verkey(key)
    } else {
        Ok(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_verkey() -> String {
        bs58::encode([42u8; 32]).into_string()
    }

    #[test]
    fn did_key_has_expected_shape() {
        let did = verkey_to_did_key(&sample_verkey()).unwrap();
        assert!(did.starts_with("did:key:z"));
        assert_eq!(did_method(&did).unwrap(), "key");
    }

    #[test]
    fn did_key_round_trip() {
        for byte in [0u8, 1, 42, 255] {
            let verkey = bs58::encode([byte; 32]).into_string();
            let did = verkey_to_did_key(&verkey).unwrap();
            assert_eq!(did_key_to_verkey(&did).unwrap(), verkey);
        }
    }

    #[test]
    fn fingerprint_round_trip() {
        let verkey = sample_verkey();
        let fingerprint = verkey_to_fingerprint(&verkey).unwrap();
        assert_eq!(fingerprint_to_verkey(&fingerprint).unwrap(), verkey);
    }

    #[test]
    fn rejects_non_ed25519_codec() {
        // secp256k1-pub multicodec prefix (0xe7) with a 33 byte key
        let mut prefixed = vec![0xe7, 0x01];
        prefixed.extend_from_slice(&[7u8; 33]);
        let fingerprint = format!("z{}", bs58::encode(&prefixed).into_string());
        let did = format!("did:key:{fingerprint}");

        assert!(matches!(
            did_key_to_verkey(&did),
            Err(DidError::UnsupportedKeyType(0xe7))
        ));
        assert!(matches!(
            fingerprint_to_verkey(&fingerprint),
            Err(DidError::UnsupportedKeyType(0xe7))
        ));
    }

    #[test]
    fn rejects_wrong_multibase() {
        assert!(matches!(
            did_key_to_verkey("did:key:a12345"),
            Err(DidError::InvalidMultibase(_))
        ));
    }

    #[test]
    fn method_extraction() {
        assert_eq!(did_method("did:key:12345").unwrap(), "key");
        assert_eq!(did_method("did:example:123456/path").unwrap(), "example");
        assert!(did_method("key:12345").is_err());
    }

    #[test]
    fn method_id_truncates_path_query_fragment() {
        assert_eq!(did_method_id("did:example:123456/path").unwrap(), "123456");
        assert_eq!(
            did_method_id("did:example:123?service=agent&relativeRef=/credentials#degree")
                .unwrap(),
            "123"
        );
        assert_eq!(did_method_id("did:example:123#keys-1").unwrap(), "123");
        assert_eq!(did_method_id("did:key:z6Mkmj").unwrap(), "z6Mkmj");
    }

    #[test]
    fn key_reference_normalization() {
        let verkey = sample_verkey();
        let did = verkey_to_did_key(&verkey).unwrap();
        assert_eq!(key_reference_to_verkey(&verkey).unwrap(), verkey);
        assert_eq!(key_reference_to_verkey(&did).unwrap(), verkey);
    }
}
