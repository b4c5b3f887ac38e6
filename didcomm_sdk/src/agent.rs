//! Agent assembly: keyring, record store, dispatcher and the operations
//! an application drives the protocols with.
//!
//! The agent is transport-agnostic. Inbound envelopes are handed to
//! [`Agent::receive_message`]; every operation that produces wire output
//! returns an [`OutboundEnvelope`] naming the endpoint the application
//! must deliver it to.

use std::sync::Arc;

use url::Url;

use crate::{
    Error,
    did::{DidCommService, DidDocument, verkey_to_did_key},
    dispatch::{Dispatcher, InboundContext, OutboundMessage},
    envelope::{self, EncryptedMessage, EnvelopeKeys},
    events::{AgentEvent, EventBus},
    keys::KeyRing,
    message::{Attachment, PlainMessage},
    protocols::{
        basic_message::{self, BasicMessageHandler},
        connection::{
            self, ConnectionData, ConnectionRequest, ConnectionRequestHandler,
            ConnectionResponseHandler,
        },
        mediation::{
            self, KeylistUpdateHandler, KeylistUpdateItem, KeylistUpdateResponseHandler,
            MediationDenyHandler, MediationGrant, MediationGrantHandler, MediationRequestHandler,
        },
        out_of_band::{self, HandshakeReuseAcceptedHandler, HandshakeReuseHandler},
        problem_report::{ProblemReport, ProblemReportHandler},
        proof::{
            AckBody, PresentationAckHandler, PresentationBody, PresentationHandler,
            PresentationRequestBody, PresentationSource, PresentationVerifier, ProposalBody,
            ProposePresentationHandler, RequestPresentationHandler,
        },
        routing::ForwardHandler,
        trust_ping::{TrustPingHandler, TrustPingResponseHandler},
    },
    records::{
        AutoAcceptProof, ConnectionRecord, ConnectionRole, ConnectionState, MediationRecord,
        MediationRole, MediationState, OobService, OutOfBandInvitation, OutOfBandRecord,
        OutOfBandRole, OutOfBandState, ProofExchangeRecord, ProofState,
    },
    storage::{RecordStore, TagFilter},
};

/// Static agent configuration.
#[derive(Clone)]
pub struct AgentConfig {
    pub label: String,
    /// Where remote agents reach this one when no mediator is involved.
    pub endpoint: Url,
    pub auto_accept_mediation_requests: bool,
    pub auto_accept_proofs: AutoAcceptProof,
    pub presentation_verifier: Option<Arc<dyn PresentationVerifier>>,
    pub presentation_source: Option<Arc<dyn PresentationSource>>,
}

impl AgentConfig {
    pub fn new(label: &str, endpoint: Url) -> Self {
        Self {
            label: label.to_string(),
            endpoint,
            auto_accept_mediation_requests: false,
            auto_accept_proofs: AutoAcceptProof::Never,
            presentation_verifier: None,
            presentation_source: None,
        }
    }
}

/// A packed envelope plus the endpoint it must be delivered to.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub endpoint: Url,
    pub envelope: EncryptedMessage,
}

pub struct Agent {
    keys: KeyRing,
    store: RecordStore,
    dispatcher: Dispatcher,
    events: EventBus,
    label: String,
    endpoint: Url,
    auto_accept_proofs: AutoAcceptProof,
    /// The key this agent wraps forwards for when acting as a mediator.
    routing_verkey: String,
}

impl Agent {
    pub fn new(config: AgentConfig, store: RecordStore) -> Result<Self, Error> {
        let keys = KeyRing::new();
        let events = EventBus::default();
        let routing_verkey = keys.create_key().verkey().to_string();

        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Arc::new(ConnectionRequestHandler {
            store: store.clone(),
            events: events.clone(),
            keys: keys.clone(),
            endpoint: config.endpoint.clone(),
        }))?;
        dispatcher.register(Arc::new(ConnectionResponseHandler {
            store: store.clone(),
            events: events.clone(),
        }))?;
        dispatcher.register(Arc::new(TrustPingHandler {
            store: store.clone(),
            events: events.clone(),
        }))?;
        dispatcher.register(Arc::new(TrustPingResponseHandler {
            store: store.clone(),
            events: events.clone(),
        }))?;
        dispatcher.register(Arc::new(MediationRequestHandler {
            store: store.clone(),
            events: events.clone(),
            endpoint: config.endpoint.clone(),
            routing_verkey: routing_verkey.clone(),
            auto_accept: config.auto_accept_mediation_requests,
        }))?;
        dispatcher.register(Arc::new(MediationGrantHandler {
            store: store.clone(),
            events: events.clone(),
        }))?;
        dispatcher.register(Arc::new(MediationDenyHandler {
            store: store.clone(),
            events: events.clone(),
        }))?;
        dispatcher.register(Arc::new(KeylistUpdateHandler {
            store: store.clone(),
        }))?;
        dispatcher.register(Arc::new(KeylistUpdateResponseHandler {
            store: store.clone(),
        }))?;
        dispatcher.register(Arc::new(HandshakeReuseHandler {
            store: store.clone(),
            events: events.clone(),
        }))?;
        dispatcher.register(Arc::new(HandshakeReuseAcceptedHandler {
            store: store.clone(),
            events: events.clone(),
        }))?;
        dispatcher.register(Arc::new(ProposePresentationHandler {
            store: store.clone(),
            events: events.clone(),
            auto_accept: config.auto_accept_proofs,
        }))?;
        dispatcher.register(Arc::new(RequestPresentationHandler {
            store: store.clone(),
            events: events.clone(),
            auto_accept: config.auto_accept_proofs,
            source: config.presentation_source.clone(),
        }))?;
        dispatcher.register(Arc::new(PresentationHandler {
            store: store.clone(),
            events: events.clone(),
            verifier: config.presentation_verifier.clone(),
        }))?;
        dispatcher.register(Arc::new(PresentationAckHandler {
            store: store.clone(),
            events: events.clone(),
        }))?;
        dispatcher.register(Arc::new(BasicMessageHandler {
            events: events.clone(),
        }))?;
        dispatcher.register(Arc::new(ProblemReportHandler {
            store: store.clone(),
            events: events.clone(),
        }))?;
        dispatcher.register(Arc::new(ForwardHandler {
            store: store.clone(),
            events: events.clone(),
        }))?;

        Ok(Self {
            keys,
            store,
            dispatcher,
            events,
            label: config.label,
            endpoint: config.endpoint,
            auto_accept_proofs: config.auto_accept_proofs,
            routing_verkey,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    pub fn routing_verkey(&self) -> &str {
        &self.routing_verkey
    }

    /// Unpack an inbound envelope, resolve its connection and dispatch
    /// it. The reply, if the handler produced one, comes back packed and
    /// addressed.
    pub async fn receive_message(&self, raw: &[u8]) -> Result<Option<OutboundEnvelope>, Error> {
        let envelope: EncryptedMessage = serde_json::from_slice(raw)?;
        let unpacked = envelope::unpack_message(&envelope, &self.keys.all())?;
        let message = PlainMessage::from_bytes(&unpacked.plaintext)?;

        let connection = self
            .resolve_connection(unpacked.sender_verkey.as_deref(), &unpacked.recipient_verkey)
            .await?;

        tracing::debug!(
            message_type = %message.message_type,
            connection_id = connection.as_ref().map(|c| c.id.as_str()),
            "received message"
        );

        let ctx = InboundContext {
            message,
            sender_verkey: unpacked.sender_verkey,
            recipient_verkey: Some(unpacked.recipient_verkey),
            connection,
        };

        match self.dispatcher.dispatch(ctx).await? {
            Some(outbound) => Ok(Some(self.pack_outbound(outbound).await?)),
            None => Ok(None),
        }
    }

    /// Pack a handler's outbound message for the wire.
    async fn pack_outbound(&self, outbound: OutboundMessage) -> Result<OutboundEnvelope, Error> {
        let (service, sender_verkey) = match (&outbound.service, &outbound.connection_id) {
            (Some(service), _) => (service.clone(), outbound.sender_verkey.clone()),
            (None, Some(connection_id)) => {
                let connection: ConnectionRecord = self.store.get_by_id(connection_id).await?;
                let service = connection
                    .remote_service()
                    .ok_or(Error::MissingService)?
                    .clone();
                (
                    service,
                    outbound.sender_verkey.clone().or(connection.verkey),
                )
            }
            (None, None) => return Err(Error::MissingService),
        };

        let sender_key = match sender_verkey {
            Some(verkey) => Some(
                self.keys
                    .get(&verkey)
                    .ok_or_else(|| Error::MissingKey(verkey))?,
            ),
            None => None,
        };

        let plaintext = serde_json::to_vec(&outbound.message)?;
        let envelope = envelope::pack_message(
            &plaintext,
            &EnvelopeKeys {
                recipient_keys: service.recipient_keys.clone(),
                routing_keys: service.routing_keys.clone(),
                sender_key,
            },
        )?;

        Ok(OutboundEnvelope {
            endpoint: service.service_endpoint,
            envelope,
        })
    }

    async fn resolve_connection(
        &self,
        sender_verkey: Option<&str>,
        recipient_verkey: &str,
    ) -> Result<Option<ConnectionRecord>, Error> {
        if let Some(sender) = sender_verkey {
            let by_sender = self
                .store
                .find_single_by_query::<ConnectionRecord>(
                    &TagFilter::new().is("their_key", sender),
                )
                .await?;
            if by_sender.is_some() {
                return Ok(by_sender);
            }
        }

        // messages arriving under a fresh remote key can still resolve
        // through the pairwise key they were encrypted to
        Ok(self
            .store
            .find_single_by_query::<ConnectionRecord>(
                &TagFilter::new().is("verkey", recipient_verkey),
            )
            .await?)
    }

    /// Publish a new out-of-band invitation. With a mediator, the
    /// invitation advertises the mediator's endpoint and routing keys;
    /// register the invitation key there with
    /// [`Agent::update_mediator_keylist`] before sharing the invitation.
    pub async fn create_out_of_band_invitation(
        &self,
        reusable: bool,
        mediator_id: Option<&str>,
    ) -> Result<OutOfBandRecord, Error> {
        let key = self.keys.create_key();
        let (endpoint, routing_keys) =
            connection::reachable_endpoint(&self.store, &self.endpoint, mediator_id).await?;

        let routing_refs = routing_keys
            .iter()
            .map(|k| verkey_to_did_key(k))
            .collect::<Result<Vec<_>, _>>()?;
        let service = DidCommService::new(
            "#inline".to_string(),
            endpoint,
            vec![verkey_to_did_key(key.verkey())?],
        )
        .with_routing_keys(routing_refs);

        let invitation = OutOfBandInvitation::new(
            Some(self.label.clone()),
            vec![OobService::Inline(service)],
        );

        let mut record = OutOfBandRecord::new(OutOfBandRole::Sender, invitation, reusable);
        record.mediator_id = mediator_id.map(str::to_string);
        record.advance_to(OutOfBandState::AwaitResponse)?;
        self.store.save(&record).await?;
        self.events.emit(AgentEvent::OutOfBandStateChanged {
            out_of_band_id: record.id.clone(),
            state: record.state,
        });

        Ok(record)
    }

    /// Accept a received invitation. With `reuse_connection_id` naming a
    /// completed connection to the inviter, a handshake-reuse goes out
    /// over it; otherwise a fresh connection request is produced.
    pub async fn receive_out_of_band_invitation(
        &self,
        invitation: OutOfBandInvitation,
        reuse_connection_id: Option<&str>,
        mediator_id: Option<&str>,
    ) -> Result<(OutOfBandRecord, OutboundEnvelope), Error> {
        invitation
            .invitation_key()?
            .ok_or(Error::InvalidMessage("invitation has no inline recipient key"))?;
        let mut record = OutOfBandRecord::new(OutOfBandRole::Receiver, invitation, false);
        record.advance_to(OutOfBandState::PrepareResponse)?;

        if let Some(connection_id) = reuse_connection_id {
            let existing = self.ready_connection(connection_id).await?;
            record.reuse_connection_id = Some(existing.id.clone());
            self.store.save(&record).await?;

            let reuse_msg = out_of_band::handshake_reuse(&record.invitation.id);
            let envelope = self
                .pack_outbound(OutboundMessage::reply(reuse_msg, existing.id))
                .await?;
            return Ok((record, envelope));
        }

        let key = self.keys.create_key();
        let (endpoint, routing_keys) =
            connection::reachable_endpoint(&self.store, &self.endpoint, mediator_id).await?;
        let did = key.verkey().to_string();
        let did_doc = DidDocument::for_endpoint(&did, key.verkey(), endpoint, routing_keys);

        let request = PlainMessage::new(
            connection::REQUEST_TYPE,
            serde_json::to_value(ConnectionRequest {
                label: self.label.clone(),
                connection: ConnectionData {
                    did: did.clone(),
                    did_doc: did_doc.clone(),
                },
            })?,
        )
        .with_parent_thread_id(&record.invitation.id);

        let mut conn = ConnectionRecord::new(ConnectionRole::Invitee, ConnectionState::Invited);
        conn.did = Some(did);
        conn.did_doc = Some(did_doc);
        conn.verkey = Some(key.verkey().to_string());
        conn.their_label = record.invitation.label.clone();
        conn.thread_id = Some(request.thread_id().to_string());
        conn.out_of_band_id = Some(record.id.clone());
        conn.mediator_id = mediator_id.map(str::to_string);
        conn.advance_to(ConnectionState::Requested)?;
        self.store.save(&conn).await?;
        self.events.emit(AgentEvent::ConnectionStateChanged {
            connection_id: conn.id.clone(),
            state: conn.state,
        });
        self.store.save(&record).await?;

        let service = record
            .invitation
            .services
            .iter()
            .find_map(|s| match s {
                OobService::Inline(service) => Some(service.clone()),
                OobService::Did(_) => None,
            })
            .ok_or(Error::MissingService)?;

        let envelope = self
            .pack_outbound(OutboundMessage::to_service(request, service, key.verkey()))
            .await?;
        Ok((record, envelope))
    }

    /// Ask the agent behind `connection_id` to mediate for this one.
    pub async fn request_mediation(&self, connection_id: &str) -> Result<OutboundEnvelope, Error> {
        let connection = self.ready_connection(connection_id).await?;

        let request = mediation::mediate_request();
        let record = MediationRecord::new(
            MediationRole::Recipient,
            connection.id.clone(),
            request.thread_id().to_string(),
        );
        self.store.save(&record).await?;
        self.events.emit(AgentEvent::MediationStateChanged {
            mediation_id: record.id,
            state: record.state,
        });

        self.pack_outbound(OutboundMessage::reply(request, connection.id))
            .await
    }

    /// Grant a mediate request held in `requested` (mediator side, when
    /// auto-accept is off).
    pub async fn grant_mediation(&self, mediation_id: &str) -> Result<OutboundEnvelope, Error> {
        let mut record: MediationRecord = self.store.get_by_id(mediation_id).await?;
        record.assert_role(MediationRole::Mediator)?;
        record.to_granted(self.endpoint.clone(), vec![self.routing_verkey.clone()])?;
        self.store.update(&record).await?;
        self.events.emit(AgentEvent::MediationStateChanged {
            mediation_id: record.id.clone(),
            state: record.state,
        });

        let grant = PlainMessage::new(
            mediation::MEDIATE_GRANT_TYPE,
            serde_json::to_value(MediationGrant {
                endpoint: self.endpoint.clone(),
                routing_keys: vec![self.routing_verkey.clone()],
            })?,
        )
        .with_thread_id(&record.thread_id);

        self.pack_outbound(OutboundMessage::reply(grant, record.connection_id))
            .await
    }

    /// Deny a mediate request held in `requested` (mediator side).
    pub async fn deny_mediation(&self, mediation_id: &str) -> Result<OutboundEnvelope, Error> {
        let mut record: MediationRecord = self.store.get_by_id(mediation_id).await?;
        record.assert_role(MediationRole::Mediator)?;
        record.to_denied()?;
        self.store.update(&record).await?;
        self.events.emit(AgentEvent::MediationStateChanged {
            mediation_id: record.id.clone(),
            state: record.state,
        });

        let deny = PlainMessage::new(mediation::MEDIATE_DENY_TYPE, serde_json::json!({}))
            .with_thread_id(&record.thread_id);
        self.pack_outbound(OutboundMessage::reply(deny, record.connection_id))
            .await
    }

    /// Send keylist updates to a granted mediator.
    pub async fn update_mediator_keylist(
        &self,
        mediation_id: &str,
        updates: Vec<KeylistUpdateItem>,
    ) -> Result<OutboundEnvelope, Error> {
        let record: MediationRecord = self.store.get_by_id(mediation_id).await?;
        record.assert_role(MediationRole::Recipient)?;
        record.assert_state(&[MediationState::Granted])?;

        let update = mediation::keylist_update(updates)?;
        self.pack_outbound(OutboundMessage::reply(update, record.connection_id))
            .await
    }

    /// Open a proof exchange by proposing a presentation (prover side).
    pub async fn propose_proof(
        &self,
        connection_id: &str,
        proposals: Vec<Attachment>,
    ) -> Result<OutboundEnvelope, Error> {
        let connection = self.ready_connection(connection_id).await?;

        let proposal = PlainMessage::new(
            crate::protocols::proof::PROPOSE_PRESENTATION_TYPE,
            serde_json::to_value(ProposalBody {
                proposals,
                comment: None,
            })?,
        );
        let record = ProofExchangeRecord::new(
            connection.id.clone(),
            proposal.thread_id().to_string(),
            ProofState::ProposalSent,
            self.auto_accept_proofs,
        );
        self.store.save(&record).await?;
        self.events.emit(AgentEvent::ProofStateChanged {
            proof_exchange_id: record.id,
            state: record.state,
            verified: None,
        });

        self.pack_outbound(OutboundMessage::reply(proposal, connection.id))
            .await
    }

    /// Request a presentation (verifier side). With `thread_id` set the
    /// request answers a previously received proposal.
    pub async fn request_proof(
        &self,
        connection_id: &str,
        requests: Vec<Attachment>,
        thread_id: Option<&str>,
    ) -> Result<OutboundEnvelope, Error> {
        let connection = self.ready_connection(connection_id).await?;

        let mut request = PlainMessage::new(
            crate::protocols::proof::REQUEST_PRESENTATION_TYPE,
            serde_json::to_value(PresentationRequestBody {
                requests,
                comment: None,
            })?,
        );
        if let Some(thread_id) = thread_id {
            request = request.with_thread_id(thread_id);
        }

        let record = match thread_id {
            Some(thread_id) => {
                let mut record: ProofExchangeRecord = self
                    .store
                    .get_single_by_query(&TagFilter::new().is("thread_id", thread_id))
                    .await?;
                record.assert_connection(&connection.id)?;
                record.advance_to(ProofState::RequestSent)?;
                self.store.update(&record).await?;
                record
            }
            None => {
                let record = ProofExchangeRecord::new(
                    connection.id.clone(),
                    request.thread_id().to_string(),
                    ProofState::RequestSent,
                    self.auto_accept_proofs,
                );
                self.store.save(&record).await?;
                record
            }
        };
        self.events.emit(AgentEvent::ProofStateChanged {
            proof_exchange_id: record.id,
            state: record.state,
            verified: None,
        });

        self.pack_outbound(OutboundMessage::reply(request, connection.id))
            .await
    }

    /// Answer a received presentation request (prover side, manual path).
    pub async fn send_presentation(
        &self,
        proof_exchange_id: &str,
        presentations: Vec<Attachment>,
    ) -> Result<OutboundEnvelope, Error> {
        let mut record: ProofExchangeRecord = self.store.get_by_id(proof_exchange_id).await?;
        record.assert_state(&[ProofState::RequestReceived])?;

        let presentation = PlainMessage::new(
            crate::protocols::proof::PRESENTATION_TYPE,
            serde_json::to_value(PresentationBody {
                presentations,
                comment: None,
            })?,
        )
        .with_thread_id(&record.thread_id);

        record.presentation_id = Some(presentation.id.clone());
        record.advance_to(ProofState::PresentationSent)?;
        self.store.update(&record).await?;
        self.events.emit(AgentEvent::ProofStateChanged {
            proof_exchange_id: record.id.clone(),
            state: record.state,
            verified: None,
        });

        self.pack_outbound(OutboundMessage::reply(presentation, record.connection_id))
            .await
    }

    /// Settle a received presentation (verifier side, manual path). An
    /// accepted presentation is acknowledged to the prover.
    pub async fn accept_presentation(
        &self,
        proof_exchange_id: &str,
        verified: bool,
    ) -> Result<Option<OutboundEnvelope>, Error> {
        let mut record: ProofExchangeRecord = self.store.get_by_id(proof_exchange_id).await?;
        record.assert_state(&[ProofState::PresentationReceived])?;

        record.verified = Some(verified);
        record.advance_to(ProofState::Done)?;
        self.store.update(&record).await?;
        self.events.emit(AgentEvent::ProofStateChanged {
            proof_exchange_id: record.id.clone(),
            state: record.state,
            verified: record.verified,
        });

        if !verified {
            return Ok(None);
        }

        let ack = PlainMessage::new(
            crate::protocols::proof::ACK_TYPE,
            serde_json::to_value(AckBody {
                status: "OK".to_string(),
            })?,
        )
        .with_thread_id(&record.thread_id);
        Ok(Some(
            self.pack_outbound(OutboundMessage::reply(ack, record.connection_id))
                .await?,
        ))
    }

    pub async fn send_basic_message(
        &self,
        connection_id: &str,
        content: &str,
    ) -> Result<OutboundEnvelope, Error> {
        let connection = self.ready_connection(connection_id).await?;
        let message = basic_message::basic_message(content)?;
        self.pack_outbound(OutboundMessage::reply(message, connection.id))
            .await
    }

    pub async fn send_problem_report(
        &self,
        connection_id: &str,
        thread_id: &str,
        code: Option<String>,
        explain: Option<String>,
    ) -> Result<OutboundEnvelope, Error> {
        let connection = self.ready_connection(connection_id).await?;

        let report = PlainMessage::new(
            crate::protocols::problem_report::PROBLEM_REPORT_TYPE,
            serde_json::to_value(ProblemReport { code, explain })?,
        )
        .with_thread_id(thread_id);
        self.pack_outbound(OutboundMessage::reply(report, connection.id))
            .await
    }

    async fn ready_connection(&self, connection_id: &str) -> Result<ConnectionRecord, Error> {
        let connection: ConnectionRecord = self.store.get_by_id(connection_id).await?;
        connection.assert_state(&[ConnectionState::Complete])?;
        Ok(connection)
    }
}
