//! Wire models of the signaling protocol

use crate::types::Role;
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of POST /offer when registering this node's offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterOfferRequest {
    /// Role of the registering node
    pub role: Role,
    /// Base64 of the UTF-8 offer SDP
    pub offer: String,
    /// Clients this node is already connected to
    pub established_clients: Vec<Uuid>,
}

impl RegisterOfferRequest {
    /// Build a request, encoding the SDP
    pub fn new(role: Role, offer_sdp: &str, established_clients: &[Uuid]) -> Self {
        Self {
            role,
            offer: BASE64.encode(offer_sdp.as_bytes()),
            established_clients: established_clients.to_vec(),
        }
    }

    /// Decode the offer SDP
    pub fn offer_sdp(&self) -> Result<String> {
        decode_sdp(&self.offer)
    }
}

/// Response of POST /offer when registering an offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferRegistration {
    /// The offer just registered, with its server-assigned sdp_id
    pub registered_offer: OfferInfo,
    /// Pending remote offers matched to this registration
    #[serde(default)]
    pub received_offer_array: Vec<OfferInfo>,
}

/// A registered offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferInfo {
    /// Server-assigned offer ID
    pub sdp_id: Uuid,
    /// Client that registered the offer
    pub offer_client_id: Uuid,
    /// Role of that client
    pub offer_client_role: String,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Base64 of the UTF-8 offer SDP
    pub offer: String,
}

impl OfferInfo {
    /// Build an offer record, encoding the SDP
    pub fn new(sdp_id: Uuid, offer_client_id: Uuid, role: Role, offer_sdp: &str) -> Self {
        Self {
            sdp_id,
            offer_client_id,
            offer_client_role: role.to_string(),
            created_at: Utc::now(),
            offer: BASE64.encode(offer_sdp.as_bytes()),
        }
    }

    /// Decode the offer SDP
    pub fn offer_sdp(&self) -> Result<String> {
        decode_sdp(&self.offer)
    }
}

/// One element of the POST /offer answer batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSubmission {
    /// The remote offer being answered
    pub sdp_id: Uuid,
    /// UTF-8 answer SDP
    pub answer: String,
}

/// Response of GET /offer/{sdp_id} once an answer exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerInfo {
    /// The offer that was answered
    pub sdp_id: Uuid,
    /// Client that answered
    pub answer_client_id: Uuid,
    /// Answer SDP; the service sends it base64 encoded, see [`AnswerInfo::decode_answer`]
    pub answer: String,
}

impl AnswerInfo {
    /// Replace a base64 `answer` with the UTF-8 SDP it encodes
    ///
    /// Answers that are not base64 of valid UTF-8 are kept as they are.
    pub fn decode_answer(mut self) -> Self {
        if let Ok(sdp) = decode_sdp(&self.answer) {
            self.answer = sdp;
        }
        self
    }
}

fn decode_sdp(encoded: &str) -> Result<String> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::SignalingError(format!("Offer is not valid base64: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| Error::SignalingError(format!("Offer is not valid UTF-8: {}", e)))
}
