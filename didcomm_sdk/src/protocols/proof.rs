//! `present-proof/1.0` handlers.
//!
//! Presentation payloads are opaque attachments; producing and checking
//! them is delegated to the [`PresentationSource`] and
//! [`PresentationVerifier`] collaborators. The handlers own the exchange
//! record and its state machine.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    dispatch::{InboundContext, MessageHandler, OutboundMessage},
    events::{AgentEvent, EventBus},
    message::{Attachment, PlainMessage},
    records::{AutoAcceptProof, ProofExchangeRecord, ProofState},
    storage::{RecordStore, TagFilter},
};

pub const PROPOSE_PRESENTATION_TYPE: &str =
    "https://didcomm.org/present-proof/1.0/propose-presentation";
pub const REQUEST_PRESENTATION_TYPE: &str =
    "https://didcomm.org/present-proof/1.0/request-presentation";
pub const PRESENTATION_TYPE: &str = "https://didcomm.org/present-proof/1.0/presentation";
pub const ACK_TYPE: &str = "https://didcomm.org/present-proof/1.0/ack";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationRequestBody {
    #[serde(rename = "request_presentations~attach")]
    pub requests: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationBody {
    #[serde(rename = "presentations~attach")]
    pub presentations: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalBody {
    #[serde(rename = "proposals~attach", default)]
    pub proposals: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckBody {
    pub status: String,
}

/// Checks a received presentation against the request it answers.
#[async_trait]
pub trait PresentationVerifier: Send + Sync {
    async fn verify(&self, presentations: &[Attachment]) -> Result<bool, Error>;
}

/// Produces a presentation from a received request.
#[async_trait]
pub trait PresentationSource: Send + Sync {
    async fn create_presentation(&self, requests: &[Attachment]) -> Result<Vec<Attachment>, Error>;
}

async fn exchange_by_thread(
    store: &RecordStore,
    thread_id: &str,
) -> Result<ProofExchangeRecord, Error> {
    Ok(store
        .get_single_by_query(&TagFilter::new().is("thread_id", thread_id))
        .await?)
}

fn emit_state(events: &EventBus, record: &ProofExchangeRecord) {
    events.emit(AgentEvent::ProofStateChanged {
        proof_exchange_id: record.id.clone(),
        state: record.state,
        verified: record.verified,
    });
}

/// Verifier side: record an incoming proposal. Turning the proposal into
/// a request needs a business decision, so no auto path exists here.
pub struct ProposePresentationHandler {
    pub store: RecordStore,
    pub events: EventBus,
    pub auto_accept: AutoAcceptProof,
}

#[async_trait]
impl MessageHandler for ProposePresentationHandler {
    fn message_type(&self) -> &'static str {
        PROPOSE_PRESENTATION_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let connection = ctx.connection()?;

        let record = ProofExchangeRecord::new(
            connection.id.clone(),
            ctx.message.thread_id().to_string(),
            ProofState::ProposalReceived,
            self.auto_accept,
        );
        self.store.save(&record).await?;
        emit_state(&self.events, &record);

        Ok(None)
    }
}

/// Prover side: record an incoming request and, when configured to
/// always accept, answer it from the presentation source.
pub struct RequestPresentationHandler {
    pub store: RecordStore,
    pub events: EventBus,
    pub auto_accept: AutoAcceptProof,
    pub source: Option<Arc<dyn PresentationSource>>,
}

#[async_trait]
impl MessageHandler for RequestPresentationHandler {
    fn message_type(&self) -> &'static str {
        REQUEST_PRESENTATION_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let request: PresentationRequestBody = ctx.message.decode()?;
        let connection = ctx.connection()?;
        let thread_id = ctx.message.thread_id();

        // a request may answer our proposal or start a fresh exchange
        let mut record = match self
            .store
            .find_single_by_query::<ProofExchangeRecord>(
                &TagFilter::new().is("thread_id", thread_id),
            )
            .await?
        {
            Some(mut record) => {
                record.assert_connection(&connection.id)?;
                record.advance_to(ProofState::RequestReceived)?;
                self.store.update(&record).await?;
                record
            }
            None => {
                let record = ProofExchangeRecord::new(
                    connection.id.clone(),
                    thread_id.to_string(),
                    ProofState::RequestReceived,
                    self.auto_accept,
                );
                self.store.save(&record).await?;
                record
            }
        };
        emit_state(&self.events, &record);

        let (AutoAcceptProof::Always, Some(source)) = (record.auto_accept, self.source.as_ref())
        else {
            return Ok(None);
        };

        let presentations = source.create_presentation(&request.requests).await?;
        let presentation = PlainMessage::new(
            PRESENTATION_TYPE,
            serde_json::to_value(PresentationBody {
                presentations,
                comment: None,
            })?,
        )
        .with_thread_id(thread_id);

        record.presentation_id = Some(presentation.id.clone());
        record.advance_to(ProofState::PresentationSent)?;
        self.store.update(&record).await?;
        emit_state(&self.events, &record);

        Ok(Some(OutboundMessage::reply(presentation, connection.id.clone())))
    }
}

/// Verifier side: record an incoming presentation and, when configured
/// to always accept, verify and acknowledge it.
pub struct PresentationHandler {
    pub store: RecordStore,
    pub events: EventBus,
    pub verifier: Option<Arc<dyn PresentationVerifier>>,
}

#[async_trait]
impl MessageHandler for PresentationHandler {
    fn message_type(&self) -> &'static str {
        PRESENTATION_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let presentation: PresentationBody = ctx.message.decode()?;
        let connection = ctx.connection()?;
        let thread_id = ctx.message.thread_id();

        let mut record = exchange_by_thread(&self.store, thread_id).await?;
        record.assert_connection(&connection.id)?;
        record.presentation_id = Some(ctx.message.id.clone());
        record.advance_to(ProofState::PresentationReceived)?;
        self.store.update(&record).await?;
        emit_state(&self.events, &record);

        let (AutoAcceptProof::Always, Some(verifier)) = (record.auto_accept, self.verifier.as_ref())
        else {
            return Ok(None);
        };

        let verified = verifier.verify(&presentation.presentations).await?;
        record.verified = Some(verified);
        record.advance_to(ProofState::Done)?;
        self.store.update(&record).await?;
        emit_state(&self.events, &record);

        if !verified {
            return Ok(None);
        }

        let ack = PlainMessage::new(
            ACK_TYPE,
            serde_json::to_value(AckBody {
                status: "OK".to_string(),
            })?,
        )
        .with_thread_id(thread_id);
        Ok(Some(OutboundMessage::reply(ack, connection.id.clone())))
    }
}

/// Prover side: close the exchange on the verifier's acknowledgement.
pub struct PresentationAckHandler {
    pub store: RecordStore,
    pub events: EventBus,
}

#[async_trait]
impl MessageHandler for PresentationAckHandler {
    fn message_type(&self) -> &'static str {
        ACK_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let ack: AckBody = ctx.message.decode()?;
        let connection = ctx.connection()?;

        let mut record = exchange_by_thread(&self.store, ctx.message.thread_id()).await?;
        record.assert_connection(&connection.id)?;
        record.assert_state(&[ProofState::PresentationSent])?;

        if ack.status != "OK" {
            record.error_message = Some(format!("presentation not accepted: {}", ack.status));
        }
        record.advance_to(ProofState::Done)?;
        self.store.update(&record).await?;
        emit_state(&self.events, &record);

        Ok(None)
    }
}
