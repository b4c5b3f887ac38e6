use serde::{Deserialize, Serialize};
use url::Url;

/// A `did-communication` service entry: where to deliver envelopes for a
/// DID and which keys to encrypt them to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidCommService {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub service_endpoint: Url,
    pub recipient_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<String>,
}

impl DidCommService {
    pub fn new(id: String, endpoint: Url, recipient_keys: Vec<String>) -> Self {
        Self {
            id,
            service_type: "did-communication".to_string(),
            service_endpoint: endpoint,
            recipient_keys,
            routing_keys: Vec::new(),
        }
    }

    pub fn with_routing_keys(mut self, routing_keys: Vec<String>) -> Self {
        self.routing_keys = routing_keys;
        self
    }
}

/// Minimal DID document carrying the service entries needed for DIDComm
/// delivery. Verification methods beyond the service recipient keys are
/// out of scope for the agent core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidDocument {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service: Vec<DidCommService>,
}

impl DidDocument {
    /// Build a single-service document for a DID reachable at `endpoint`
    /// under `verkey`, optionally behind the given routing keys.
    pub fn for_endpoint(
        did: &str,
        verkey: &str,
        endpoint: Url,
        routing_keys: Vec<String>,
    ) -> Self {
        let service = DidCommService::new(
            format!("{did}#did-communication"),
            endpoint,
            vec![verkey.to_string()],
        )
        .with_routing_keys(routing_keys);

        Self {
            id: did.to_string(),
            service: vec![service],
        }
    }

    /// The first `did-communication` service, if any.
    pub fn didcomm_service(&self) -> Option<&DidCommService> {
        self.service
            .iter()
            .find(|s| s.service_type == "did-communication")
            .or_else(|| self.service.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_lookup_prefers_did_communication() {
        let endpoint: Url = "https://agent.example.com/didcomm".parse().unwrap();
        let doc = DidDocument::for_endpoint("did:example:123", "verkey", endpoint, vec![]);

        let service = doc.didcomm_service().unwrap();
        assert_eq!(service.service_type, "did-communication");
        assert_eq!(service.recipient_keys, vec!["verkey".to_string()]);
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let endpoint: Url = "https://agent.example.com/didcomm".parse().unwrap();
        let doc = DidDocument::for_endpoint(
            "did:example:123",
            "verkey",
            endpoint,
            vec!["router".to_string()],
        );

        let json = serde_json::to_value(&doc).unwrap();
        let service = &json["service"][0];
        assert_eq!(service["type"], "did-communication");
        assert!(service["serviceEndpoint"].is_string());
        assert_eq!(service["recipientKeys"][0], "verkey");
        assert_eq!(service["routingKeys"][0], "router");
    }
}
