//! Signaling clients
//!
//! - [`HttpSignalingClient`]: the HTTP offer/answer service
//! - [`MemorySignalingServer`]: an in-process server with the same matching
//!   rules, for tests and single-process meshes

mod http;
mod memory;
pub mod model;

pub use http::HttpSignalingClient;
pub use memory::{MemorySignalingClient, MemorySignalingServer};
pub use model::{AnswerInfo, AnswerSubmission, OfferInfo, OfferRegistration, RegisterOfferRequest};

use crate::types::Role;
use crate::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Offer/answer exchange with the signaling service
///
/// Every call may fail with a transport or authentication error; the mesh
/// aborts the current negotiation cycle when it does.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Identity this client presents to the service
    fn client_id(&self) -> Uuid;

    /// Register an offer and collect pending remote offers
    async fn register_offer(
        &self,
        role: Role,
        offer_sdp: &str,
        established_clients: &[Uuid],
    ) -> Result<OfferRegistration>;

    /// Submit answers to remote offers in one batch
    async fn register_answers(&self, answers: &[AnswerSubmission]) -> Result<()>;

    /// Fetch the answer to one of this client's offers, if any yet
    async fn poll_answer(&self, sdp_id: Uuid) -> Result<Option<AnswerInfo>>;
}
