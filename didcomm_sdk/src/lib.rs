#![deny(rustdoc::broken_intra_doc_links)]

//! # DIDComm agent core
//!
//! A transport-agnostic implementation of the DIDComm v1 agent protocols:
//! `did:key` codecs, JWE-style envelope encryption with multi-hop forward
//! routing, tag-indexed protocol-state records, and handlers for the
//! connection, mediation, out-of-band, present-proof and basic-message
//! protocols.
//!
//! The primary API is the [Agent] struct. Inbound envelopes go through
//! [Agent::receive_message]; every operation that produces wire output
//! returns an [agent::OutboundEnvelope] naming the endpoint the
//! application must deliver it to. State changes are observable through
//! [Agent::events].
//!
//! Records persist through a [storage::RecordStore]; an in-memory backend
//! is built in, and an encrypted Aries Askar backend is available behind
//! the `askar` feature (enabled by default).

pub mod agent;
pub mod did;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod events;
pub mod keys;
pub mod message;
pub mod protocols;
pub mod records;
pub mod storage;


pub use agent::{Agent, AgentConfig, OutboundEnvelope};
pub use error::Error;
pub use events::AgentEvent;
