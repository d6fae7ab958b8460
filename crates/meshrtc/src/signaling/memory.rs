//! In-process signaling server
//!
//! Matching rules, applied when a client registers an offer:
//! - every pending offer from another client is a candidate
//! - offers from clients listed in `established_clients` are skipped
//! - clients already paired with the caller through an earlier claim are skipped
//! - at most one offer per remote client (its newest) is returned
//!
//! Returned offers are claimed by the caller; only the claimant may answer
//! them and only the owner may poll them.

use super::model::{AnswerInfo, AnswerSubmission, OfferInfo, OfferRegistration};
use super::SignalingClient;
use crate::types::Role;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredOffer {
    info: OfferInfo,
    claimed_by: Option<Uuid>,
    answer: Option<AnswerInfo>,
    polls: usize,
}

#[derive(Debug, Default)]
struct ServerState {
    offers: HashMap<Uuid, StoredOffer>,
    order: Vec<Uuid>,
    answer_batches: Vec<(Uuid, Vec<AnswerSubmission>)>,
}

/// Shared in-memory signaling service
#[derive(Debug, Default)]
pub struct MemorySignalingServer {
    state: Mutex<ServerState>,
}

impl MemorySignalingServer {
    /// Create an empty server
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a client with a fresh identity
    pub fn client(self: &Arc<Self>) -> Arc<MemorySignalingClient> {
        self.client_with_id(Uuid::new_v4())
    }

    /// Create a client with the given identity
    pub fn client_with_id(self: &Arc<Self>, client_id: Uuid) -> Arc<MemorySignalingClient> {
        Arc::new(MemorySignalingClient {
            server: Arc::clone(self),
            client_id,
        })
    }

    /// Store an offer directly, bypassing matching
    pub fn insert_offer(&self, client_id: Uuid, role: Role, offer_sdp: &str) -> OfferInfo {
        let info = OfferInfo::new(Uuid::new_v4(), client_id, role, offer_sdp);
        let mut state = self.state.lock();
        state.order.push(info.sdp_id);
        state.offers.insert(
            info.sdp_id,
            StoredOffer {
                info: info.clone(),
                claimed_by: None,
                answer: None,
                polls: 0,
            },
        );
        info
    }

    /// Answer batches received so far, with the submitting client
    pub fn answer_batches(&self) -> Vec<(Uuid, Vec<AnswerSubmission>)> {
        self.state.lock().answer_batches.clone()
    }

    /// Answer stored for an offer
    pub fn answer_for(&self, sdp_id: Uuid) -> Option<AnswerInfo> {
        self.state
            .lock()
            .offers
            .get(&sdp_id)
            .and_then(|offer| offer.answer.clone())
    }

    /// How many times an offer has been polled
    pub fn poll_count(&self, sdp_id: Uuid) -> usize {
        self.state
            .lock()
            .offers
            .get(&sdp_id)
            .map(|offer| offer.polls)
            .unwrap_or(0)
    }

    /// Offers registered by a client, oldest first
    pub fn offers_from(&self, client_id: Uuid) -> Vec<OfferInfo> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.offers.get(id))
            .filter(|offer| offer.info.offer_client_id == client_id)
            .map(|offer| offer.info.clone())
            .collect()
    }

    fn register_offer(
        &self,
        caller: Uuid,
        role: Role,
        offer_sdp: &str,
        established_clients: &[Uuid],
    ) -> OfferRegistration {
        let registered_offer = OfferInfo::new(Uuid::new_v4(), caller, role, offer_sdp);
        let established: HashSet<Uuid> = established_clients.iter().copied().collect();

        let mut state = self.state.lock();

        // Clients already paired with the caller in either direction
        let paired: HashSet<Uuid> = state
            .offers
            .values()
            .filter_map(|offer| match offer.claimed_by {
                Some(claimant) if offer.info.offer_client_id == caller => Some(claimant),
                Some(claimant) if claimant == caller => Some(offer.info.offer_client_id),
                _ => None,
            })
            .collect();

        let mut newest_per_owner: HashMap<Uuid, Uuid> = HashMap::new();
        for sdp_id in &state.order {
            let Some(offer) = state.offers.get(sdp_id) else {
                continue;
            };
            let owner = offer.info.offer_client_id;
            if owner == caller
                || established.contains(&owner)
                || paired.contains(&owner)
                || offer.claimed_by.is_some()
                || offer.answer.is_some()
            {
                continue;
            }
            newest_per_owner.insert(owner, *sdp_id);
        }

        let mut matched: Vec<Uuid> = newest_per_owner.into_values().collect();
        matched.sort_by_key(|id| state.order.iter().position(|o| o == id));

        let mut received_offer_array = Vec::with_capacity(matched.len());
        for sdp_id in matched {
            if let Some(offer) = state.offers.get_mut(&sdp_id) {
                offer.claimed_by = Some(caller);
                received_offer_array.push(offer.info.clone());
            }
        }

        state.order.push(registered_offer.sdp_id);
        state.offers.insert(
            registered_offer.sdp_id,
            StoredOffer {
                info: registered_offer.clone(),
                claimed_by: None,
                answer: None,
                polls: 0,
            },
        );

        debug!(
            client_id = %caller,
            sdp_id = %registered_offer.sdp_id,
            matched = received_offer_array.len(),
            "Memory signaling registered offer"
        );

        OfferRegistration {
            registered_offer,
            received_offer_array,
        }
    }

    fn register_answers(&self, caller: Uuid, answers: &[AnswerSubmission]) -> Result<()> {
        let mut state = self.state.lock();

        for answer in answers {
            match state.offers.get(&answer.sdp_id) {
                None => {
                    return Err(Error::SignalingError(format!(
                        "Unknown offer {}",
                        answer.sdp_id
                    )))
                }
                Some(offer) if offer.claimed_by != Some(caller) => {
                    return Err(Error::SignalingError(format!(
                        "Offer {} was not handed to client {}",
                        answer.sdp_id, caller
                    )))
                }
                Some(offer) if offer.answer.is_some() => {
                    return Err(Error::SignalingError(format!(
                        "Offer {} is already answered",
                        answer.sdp_id
                    )))
                }
                Some(_) => {}
            }
        }

        for answer in answers {
            if let Some(offer) = state.offers.get_mut(&answer.sdp_id) {
                offer.answer = Some(AnswerInfo {
                    sdp_id: answer.sdp_id,
                    answer_client_id: caller,
                    answer: answer.answer.clone(),
                });
            }
        }
        state.answer_batches.push((caller, answers.to_vec()));
        Ok(())
    }

    fn poll_answer(&self, caller: Uuid, sdp_id: Uuid) -> Result<Option<AnswerInfo>> {
        let mut state = self.state.lock();
        let offer = state
            .offers
            .get_mut(&sdp_id)
            .ok_or_else(|| Error::SignalingError(format!("Unknown offer {}", sdp_id)))?;

        if offer.info.offer_client_id != caller {
            return Err(Error::SignalingError(format!(
                "Offer {} does not belong to client {}",
                sdp_id, caller
            )));
        }

        offer.polls += 1;
        Ok(offer.answer.clone())
    }
}

/// Client handle bound to one identity on a [`MemorySignalingServer`]
#[derive(Debug, Clone)]
pub struct MemorySignalingClient {
    server: Arc<MemorySignalingServer>,
    client_id: Uuid,
}

impl MemorySignalingClient {
    /// Server this client talks to
    pub fn server(&self) -> &Arc<MemorySignalingServer> {
        &self.server
    }
}

#[async_trait]
impl SignalingClient for MemorySignalingClient {
    fn client_id(&self) -> Uuid {
        self.client_id
    }

    async fn register_offer(
        &self,
        role: Role,
        offer_sdp: &str,
        established_clients: &[Uuid],
    ) -> Result<OfferRegistration> {
        Ok(self
            .server
            .register_offer(self.client_id, role, offer_sdp, established_clients))
    }

    async fn register_answers(&self, answers: &[AnswerSubmission]) -> Result<()> {
        self.server.register_answers(self.client_id, answers)
    }

    async fn poll_answer(&self, sdp_id: Uuid) -> Result<Option<AnswerInfo>> {
        self.server.poll_answer(self.client_id, sdp_id)
    }
}
