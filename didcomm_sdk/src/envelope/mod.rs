//! JWE-style envelope encryption for wire messages.
//!
//! A packed message carries a base64url protected header (`enc`, `typ`,
//! `alg` and one recipient entry per recipient key), a random nonce, the
//! ciphertext and a detached authentication tag. The content is encrypted
//! once with a fresh content-encryption key (CEK); the CEK is wrapped per
//! recipient:
//!
//! - **authcrypt** (sender key present): the CEK is boxed between the
//!   sender's and the recipient's X25519 keys, and the sender's verkey is
//!   sealed to the recipient so only they learn who sent the message.
//! - **anoncrypt** (no sender key): the CEK is sealed to the recipient
//!   with an ephemeral key.
//!
//! Multi-hop routing wraps an already-packed envelope in `forward`
//! messages, innermost first, so each mediator can only decrypt its own
//! layer.

pub mod error;

use base64ct::{Base64UrlUnpadded, Encoding};
use chacha20poly1305::{
    Key, Tag, XChaCha20Poly1305, XNonce,
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
};
use crypto_box::{
    ChaChaBox, PublicKey, SecretKey,
    aead::Aead,
};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::{did, keys::LocalKey};

pub use error::CryptoError;

const ENVELOPE_ENC: &str = "xchacha20poly1305_ietf";
const ENVELOPE_TYP: &str = "JWM/1.0";

const BOX_NONCE_SIZE: usize = 24;
const SEAL_OVERHEAD: usize = 32 + BOX_NONCE_SIZE + 16;

/// A packed wire message. The four required fields form the compact
/// serialization; the remaining fields only appear in the extended
/// non-compact form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub protected: String,
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<Recipient>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unprotected: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aad: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
}

/// The decoded contents of the `protected` field.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProtectedHeader {
    pub enc: String,
    pub typ: String,
    pub alg: EnvelopeAlg,
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeAlg {
    Authcrypt,
    Anoncrypt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub encrypted_key: String,
    pub header: RecipientHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientHeader {
    pub kid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// Keys governing how a message is packed. Recipient and routing keys may
/// be bare base58 verkeys or `did:key` references.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeKeys {
    pub recipient_keys: Vec<String>,
    pub routing_keys: Vec<String>,
    pub sender_key: Option<LocalKey>,
}

/// The result of unpacking an envelope.
#[derive(Debug)]
pub struct UnpackedMessage {
    pub plaintext: Vec<u8>,
    /// Present for authcrypt envelopes only.
    pub sender_verkey: Option<String>,
    /// The owned key the envelope was decrypted with.
    pub recipient_verkey: String,
}

/// A `routing/1.0` forward message wrapping an envelope for a mediator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardMessage {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub message_type: String,
    pub to: String,
    pub msg: EncryptedMessage,
}

impl ForwardMessage {
    pub const TYPE: &'static str = "https://didcomm.org/routing/1.0/forward";

    pub fn new(to: &str, msg: EncryptedMessage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: Self::TYPE.to_string(),
            to: to.to_string(),
            msg,
        }
    }
}

/// Pack `plaintext` for the given keys, wrapping the envelope in forward
/// messages when routing keys are present.
pub fn pack_message(
    plaintext: &[u8],
    keys: &EnvelopeKeys,
) -> Result<EncryptedMessage, CryptoError> {
    if keys.recipient_keys.is_empty() {
        return Err(CryptoError::MissingRecipients);
    }

    let recipient_keys = normalize_keys(&keys.recipient_keys)?;
    let mut envelope =
        pack_for_recipients(plaintext, &recipient_keys, keys.sender_key.as_ref())?;

    // innermost layer first: the first routing key is closest to the
    // recipient, the last one receives the outermost envelope
    let mut to = recipient_keys[0].clone();
    for routing_key in normalize_keys(&keys.routing_keys)? {
        let forward = ForwardMessage::new(&to, envelope);
        let payload = serde_json::to_vec(&forward)?;
        envelope = pack_for_recipients(&payload, std::slice::from_ref(&routing_key), None)?;
        to = routing_key;
    }

    Ok(envelope)
}

fn normalize_keys(keys: &[String]) -> Result<Vec<String>, CryptoError> {
    keys.iter()
        .map(|key| did::key_reference_to_verkey(key).map_err(CryptoError::from))
        .collect()
}

fn pack_for_recipients(
    plaintext: &[u8],
    recipient_verkeys: &[String],
    sender: Option<&LocalKey>,
) -> Result<EncryptedMessage, CryptoError> {
    let cek = XChaCha20Poly1305::generate_key(&mut OsRng);

    let mut recipients = Vec::with_capacity(recipient_verkeys.len());
    for verkey in recipient_verkeys {
        let recipient_public = agreement_public(verkey)?;

        let recipient = match sender {
            Some(sender_key) => {
                let sender_box = ChaChaBox::new(&recipient_public, &sender_key.agreement_secret());
                let nonce = ChaChaBox::generate_nonce(&mut OsRng);
                let encrypted_cek = sender_box
                    .encrypt(&nonce, cek.as_slice())
                    .map_err(|_| CryptoError::EncryptionFailed)?;
                let sender_blob = seal(&recipient_public, sender_key.verkey().as_bytes())?;

                Recipient {
                    encrypted_key: Base64UrlUnpadded::encode_string(&encrypted_cek),
                    header: RecipientHeader {
                        kid: verkey.clone(),
                        iv: Some(Base64UrlUnpadded::encode_string(&nonce)),
                        sender: Some(Base64UrlUnpadded::encode_string(&sender_blob)),
                    },
                }
            }
            None => {
                let sealed_cek = seal(&recipient_public, cek.as_slice())?;

                Recipient {
                    encrypted_key: Base64UrlUnpadded::encode_string(&sealed_cek),
                    header: RecipientHeader {
                        kid: verkey.clone(),
                        iv: None,
                        sender: None,
                    },
                }
            }
        };

        recipients.push(recipient);
    }

    let protected = ProtectedHeader {
        enc: ENVELOPE_ENC.to_string(),
        typ: ENVELOPE_TYP.to_string(),
        alg: if sender.is_some() {
            EnvelopeAlg::Authcrypt
        } else {
            EnvelopeAlg::Anoncrypt
        },
        recipients,
    };
    let protected = Base64UrlUnpadded::encode_string(&serde_json::to_vec(&protected)?);

    // encrypt the content once, with the protected header as AAD
    let content = XChaCha20Poly1305::new(&cek);
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut buffer = plaintext.to_vec();
    let tag = content
        .encrypt_in_place_detached(&nonce, protected.as_bytes(), &mut buffer)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(EncryptedMessage {
        protected,
        iv: Base64UrlUnpadded::encode_string(&nonce),
        ciphertext: Base64UrlUnpadded::encode_string(&buffer),
        tag: Base64UrlUnpadded::encode_string(&tag),
        recipients: None,
        unprotected: None,
        aad: None,
        header: None,
        encrypted_key: None,
    })
}

/// Unpack an envelope with the given owned keys.
pub fn unpack_message(
    envelope: &EncryptedMessage,
    owned: &[LocalKey],
) -> Result<UnpackedMessage, CryptoError> {
    let protected_raw = b64_decode(&envelope.protected, "protected")?;
    let protected: ProtectedHeader = serde_json::from_slice(&protected_raw)
        .map_err(|_| CryptoError::MalformedEnvelope("protected header"))?;

    let Some((recipient, local)) = protected.recipients.iter().find_map(|recipient| {
        owned
            .iter()
            .find(|key| key.verkey() == recipient.header.kid)
            .map(|key| (recipient, key))
    }) else {
        return Err(CryptoError::DecryptionFailed);
    };

    let local_secret = local.agreement_secret();
    let encrypted_cek = b64_decode(&recipient.encrypted_key, "encrypted_key")?;

    let (cek_bytes, sender_verkey) = match protected.alg {
        EnvelopeAlg::Authcrypt => {
            let sender_blob = recipient
                .header
                .sender
                .as_deref()
                .ok_or(CryptoError::MalformedEnvelope("missing sender"))?;
            let sender_raw = seal_open(&local_secret, &b64_decode(sender_blob, "sender")?)?;
            let sender_verkey = String::from_utf8(sender_raw)
                .map_err(|_| CryptoError::MalformedEnvelope("sender verkey"))?;
            let sender_public = agreement_public(&sender_verkey)?;

            let nonce_raw = recipient
                .header
                .iv
                .as_deref()
                .ok_or(CryptoError::MalformedEnvelope("missing recipient iv"))?;
            let nonce_raw = b64_decode(nonce_raw, "recipient iv")?;
            if nonce_raw.len() != BOX_NONCE_SIZE {
                return Err(CryptoError::MalformedEnvelope("recipient iv"));
            }

            let sender_box = ChaChaBox::new(&sender_public, &local_secret);
            let cek = sender_box
                .decrypt(crypto_box::Nonce::from_slice(&nonce_raw), encrypted_cek.as_slice())
                .map_err(|_| CryptoError::DecryptionFailed)?;

            (cek, Some(sender_verkey))
        }
        EnvelopeAlg::Anoncrypt => (seal_open(&local_secret, &encrypted_cek)?, None),
    };

    if cek_bytes.len() != 32 {
        return Err(CryptoError::DecryptionFailed);
    }

    let nonce_raw = b64_decode(&envelope.iv, "iv")?;
    if nonce_raw.len() != BOX_NONCE_SIZE {
        return Err(CryptoError::MalformedEnvelope("iv"));
    }
    let tag_raw = b64_decode(&envelope.tag, "tag")?;
    if tag_raw.len() != 16 {
        return Err(CryptoError::MalformedEnvelope("tag"));
    }
    let mut buffer = b64_decode(&envelope.ciphertext, "ciphertext")?;

    let content = XChaCha20Poly1305::new(Key::from_slice(&cek_bytes));
    content
        .decrypt_in_place_detached(
            XNonce::from_slice(&nonce_raw),
            envelope.protected.as_bytes(),
            &mut buffer,
            Tag::from_slice(&tag_raw),
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(UnpackedMessage {
        plaintext: buffer,
        sender_verkey,
        recipient_verkey: local.verkey().to_string(),
    })
}

fn b64_decode(value: &str, field: &'static str) -> Result<Vec<u8>, CryptoError> {
    Base64UrlUnpadded::decode_vec(value).map_err(|_| CryptoError::MalformedEnvelope(field))
}

/// Seal `plaintext` to `recipient` under an ephemeral key:
/// `ephemeral_pk || nonce || box(plaintext)`.
fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = SecretKey::generate(&mut OsRng);
    let nonce = ChaChaBox::generate_nonce(&mut OsRng);

    let ciphertext = ChaChaBox::new(recipient, &ephemeral)
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut blob = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
    blob.extend_from_slice(ephemeral.public_key().as_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);

    Ok(blob)
}

fn seal_open(secret: &SecretKey, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < SEAL_OVERHEAD {
        return Err(CryptoError::DecryptionFailed);
    }

    let ephemeral_public: [u8; 32] = blob[..32]
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let nonce = &blob[32..32 + BOX_NONCE_SIZE];

    ChaChaBox::new(&PublicKey::from(ephemeral_public), secret)
        .decrypt(crypto_box::Nonce::from_slice(nonce), &blob[32 + BOX_NONCE_SIZE..])
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// The X25519 public key corresponding to a base58 Ed25519 verkey.
fn agreement_public(verkey: &str) -> Result<PublicKey, CryptoError> {
    let raw = bs58::decode(verkey)
        .into_vec()
        .map_err(crate::did::DidError::from)?;
    let bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(crate::did::DidError::InvalidKeyLength(raw.len())))?;

    let verifying = VerifyingKey::from_bytes(&bytes)
        .map_err(|_| CryptoError::MalformedEnvelope("key is not a valid Ed25519 point"))?;

    Ok(PublicKey::from(verifying.to_montgomery().to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_key(seed: u8) -> LocalKey {
        LocalKey::from_seed([seed; 32])
    }

    #[test]
    fn authcrypt_round_trip() {
        let sender = local_key(1);
        let recipient = local_key(2);

        let keys = EnvelopeKeys {
            recipient_keys: vec![recipient.verkey().to_string()],
            routing_keys: vec![],
            sender_key: Some(sender.clone()),
        };

        let envelope = pack_message(b"hello world", &keys).unwrap();
        let unpacked = unpack_message(&envelope, &[recipient.clone()]).unwrap();

        assert_eq!(unpacked.plaintext, b"hello world");
        assert_eq!(unpacked.sender_verkey.as_deref(), Some(sender.verkey()));
        assert_eq!(unpacked.recipient_verkey, recipient.verkey());
    }

    #[test]
    fn anoncrypt_round_trip() {
        let recipient = local_key(3);

        let keys = EnvelopeKeys {
            recipient_keys: vec![recipient.verkey().to_string()],
            routing_keys: vec![],
            sender_key: None,
        };

        let envelope = pack_message(b"anonymous", &keys).unwrap();
        let unpacked = unpack_message(&envelope, &[recipient]).unwrap();

        assert_eq!(unpacked.plaintext, b"anonymous");
        assert_eq!(unpacked.sender_verkey, None);
    }

    #[test]
    fn multiple_recipients_each_decrypt() {
        let sender = local_key(1);
        let first = local_key(2);
        let second = local_key(3);

        let keys = EnvelopeKeys {
            recipient_keys: vec![first.verkey().to_string(), second.verkey().to_string()],
            routing_keys: vec![],
            sender_key: Some(sender),
        };

        let envelope = pack_message(b"fan out", &keys).unwrap();

        for recipient in [first, second] {
            let unpacked = unpack_message(&envelope, &[recipient.clone()]).unwrap();
            assert_eq!(unpacked.plaintext, b"fan out");
            assert_eq!(unpacked.recipient_verkey, recipient.verkey());
        }
    }

    #[test]
    fn disjoint_keys_fail() {
        let recipient = local_key(2);
        let stranger = local_key(9);

        let keys = EnvelopeKeys {
            recipient_keys: vec![recipient.verkey().to_string()],
            routing_keys: vec![],
            sender_key: None,
        };

        let envelope = pack_message(b"secret", &keys).unwrap();

        assert!(matches!(
            unpack_message(&envelope, &[stranger]),
            Err(CryptoError::DecryptionFailed)
        ));
        assert!(matches!(
            unpack_message(&envelope, &[]),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let recipient = local_key(2);

        let keys = EnvelopeKeys {
            recipient_keys: vec![recipient.verkey().to_string()],
            routing_keys: vec![],
            sender_key: None,
        };

        let mut envelope = pack_message(b"integrity", &keys).unwrap();
        let mut raw = Base64UrlUnpadded::decode_vec(&envelope.ciphertext).unwrap();
        raw[0] ^= 0xff;
        envelope.ciphertext = Base64UrlUnpadded::encode_string(&raw);

        assert!(matches!(
            unpack_message(&envelope, &[recipient]),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn corrupt_base64_fields_are_malformed() {
        let recipient = local_key(2);

        let keys = EnvelopeKeys {
            recipient_keys: vec![recipient.verkey().to_string()],
            routing_keys: vec![],
            sender_key: Some(local_key(1)),
        };

        let envelope = pack_message(b"payload", &keys).unwrap();

        let mut bad_protected = envelope.clone();
        bad_protected.protected = "!not-base64!".into();
        assert!(matches!(
            unpack_message(&bad_protected, &[recipient.clone()]),
            Err(CryptoError::MalformedEnvelope("protected"))
        ));

        let mut bad_iv = envelope.clone();
        bad_iv.iv = "!not-base64!".into();
        assert!(matches!(
            unpack_message(&bad_iv, &[recipient.clone()]),
            Err(CryptoError::MalformedEnvelope("iv"))
        ));

        let mut bad_tag = envelope;
        bad_tag.tag = "!not-base64!".into();
        assert!(matches!(
            unpack_message(&bad_tag, &[recipient]),
            Err(CryptoError::MalformedEnvelope("tag"))
        ));
    }

    #[test]
    fn no_recipients_is_rejected() {
        let keys = EnvelopeKeys::default();
        assert!(matches!(
            pack_message(b"nobody", &keys),
            Err(CryptoError::MissingRecipients)
        ));
    }

    #[test]
    fn routing_wraps_innermost_first() {
        let sender = local_key(1);
        let recipient = local_key(2);
        let near_mediator = local_key(3);
        let far_mediator = local_key(4);

        let keys = EnvelopeKeys {
            recipient_keys: vec![recipient.verkey().to_string()],
            routing_keys: vec![
                near_mediator.verkey().to_string(),
                far_mediator.verkey().to_string(),
            ],
            sender_key: Some(sender),
        };

        let outer = pack_message(b"routed", &keys).unwrap();

        // outermost layer is for the last routing key
        let unpacked = unpack_message(&outer, &[far_mediator]).unwrap();
        let forward: ForwardMessage = serde_json::from_slice(&unpacked.plaintext).unwrap();
        assert_eq!(forward.message_type, ForwardMessage::TYPE);
        assert_eq!(forward.to, near_mediator.verkey());

        let unpacked = unpack_message(&forward.msg, &[near_mediator]).unwrap();
        let forward: ForwardMessage = serde_json::from_slice(&unpacked.plaintext).unwrap();
        assert_eq!(forward.to, recipient.verkey());

        let unpacked = unpack_message(&forward.msg, &[recipient]).unwrap();
        assert_eq!(unpacked.plaintext, b"routed");
    }

    #[test]
    fn compact_serialization_has_no_optional_fields() {
        let recipient = local_key(2);
        let keys = EnvelopeKeys {
            recipient_keys: vec![recipient.verkey().to_string()],
            routing_keys: vec![],
            sender_key: None,
        };

        let envelope = pack_message(b"compact", &keys).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        let object = json.as_object().unwrap();

        assert_eq!(object.len(), 4);
        for field in ["protected", "iv", "ciphertext", "tag"] {
            assert!(object.contains_key(field));
        }
    }
}
