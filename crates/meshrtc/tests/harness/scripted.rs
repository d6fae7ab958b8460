//! Scripted signaling service
//!
//! Records every call with its (tokio) timestamp and answers the mesh's own
//! offers from loopback transports on the shared [`MockNetwork`].

use async_trait::async_trait;
use meshrtc::signaling::{
    AnswerInfo, AnswerSubmission, OfferInfo, OfferRegistration, SignalingClient,
};
use meshrtc::transport::{
    MockNetwork, MockPeerTransport, PeerTransport, SessionDescription, TransportEvents,
};
use meshrtc::{Error, Result, Role};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// One recorded offer registration
#[derive(Debug, Clone)]
pub struct Registration {
    pub at: Instant,
    pub sdp_id: Option<Uuid>,
    pub established: Vec<Uuid>,
}

/// Transport that answered one of the mesh's offers
pub struct Answerer {
    pub client_id: Uuid,
    pub transport: Arc<MockPeerTransport>,
    pub events: TransportEvents,
}

#[derive(Default)]
struct Script {
    fail_registrations: u32,
    failure_status: Option<u16>,
    bundled: VecDeque<Vec<OfferInfo>>,
    answer_after_polls: Option<u32>,
    max_answers: Option<usize>,
    answered: usize,
    offers: HashMap<Uuid, String>,
    registrations: Vec<Registration>,
    polls: HashMap<Uuid, Vec<Instant>>,
    answer_batches: Vec<Vec<AnswerSubmission>>,
    answerers: HashMap<Uuid, Answerer>,
}

pub struct ScriptedSignaling {
    client_id: Uuid,
    network: MockNetwork,
    script: Mutex<Script>,
}

impl ScriptedSignaling {
    pub fn new(network: &MockNetwork) -> Arc<Self> {
        Arc::new(Self {
            client_id: Uuid::new_v4(),
            network: network.clone(),
            script: Mutex::new(Script::default()),
        })
    }

    /// Fail the next `count` registrations with a server error
    pub fn fail_registrations(&self, count: u32) {
        self.script.lock().fail_registrations = count;
    }

    /// HTTP status of failed registrations (default 503)
    pub fn failure_status(&self, status: u16) {
        self.script.lock().failure_status = Some(status);
    }

    /// Hand `offers` to the next successful registration
    pub fn bundle_offers(&self, offers: Vec<OfferInfo>) {
        self.script.lock().bundled.push_back(offers);
    }

    /// Answer each offer on its `polls`-th poll; `None` never answers
    pub fn answer_after_polls(&self, polls: Option<u32>) {
        self.script.lock().answer_after_polls = polls;
    }

    /// Stop answering after `count` offers
    pub fn max_answers(&self, count: usize) {
        self.script.lock().max_answers = Some(count);
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.script.lock().registrations.clone()
    }

    pub fn polls(&self, sdp_id: Uuid) -> Vec<Instant> {
        self.script
            .lock()
            .polls
            .get(&sdp_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn answer_batches(&self) -> Vec<Vec<AnswerSubmission>> {
        self.script.lock().answer_batches.clone()
    }

    /// Remove and return the transport that answered `sdp_id`
    pub fn take_answerer(&self, sdp_id: Uuid) -> Option<Answerer> {
        self.script.lock().answerers.remove(&sdp_id)
    }

    async fn answer(&self, offer_sdp: String) -> Result<(Uuid, String, Answerer)> {
        let (transport, events) = self.network.transport();
        transport
            .set_remote_description(SessionDescription::offer(offer_sdp))
            .await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;

        let client_id = Uuid::new_v4();
        Ok((
            client_id,
            answer.sdp,
            Answerer {
                client_id,
                transport,
                events,
            },
        ))
    }
}

#[async_trait]
impl SignalingClient for ScriptedSignaling {
    fn client_id(&self) -> Uuid {
        self.client_id
    }

    async fn register_offer(
        &self,
        role: Role,
        offer_sdp: &str,
        established_clients: &[Uuid],
    ) -> Result<OfferRegistration> {
        let mut script = self.script.lock();

        if script.fail_registrations > 0 {
            script.fail_registrations -= 1;
            script.registrations.push(Registration {
                at: Instant::now(),
                sdp_id: None,
                established: established_clients.to_vec(),
            });
            return Err(Error::HttpStatus {
                status: script.failure_status.unwrap_or(503),
                body: "unavailable".to_string(),
            });
        }

        let registered_offer = OfferInfo::new(Uuid::new_v4(), self.client_id, role, offer_sdp);
        script
            .offers
            .insert(registered_offer.sdp_id, offer_sdp.to_string());
        script.registrations.push(Registration {
            at: Instant::now(),
            sdp_id: Some(registered_offer.sdp_id),
            established: established_clients.to_vec(),
        });

        Ok(OfferRegistration {
            registered_offer,
            received_offer_array: script.bundled.pop_front().unwrap_or_default(),
        })
    }

    async fn register_answers(&self, answers: &[AnswerSubmission]) -> Result<()> {
        self.script.lock().answer_batches.push(answers.to_vec());
        Ok(())
    }

    async fn poll_answer(&self, sdp_id: Uuid) -> Result<Option<AnswerInfo>> {
        let offer_sdp = {
            let mut script = self.script.lock();
            let polls = script.polls.entry(sdp_id).or_default();
            polls.push(Instant::now());
            let count = polls.len() as u32;

            let budget_left = script
                .max_answers
                .map_or(true, |max| script.answered < max);

            match script.answer_after_polls {
                Some(after) if count >= after && budget_left => {
                    script.answered += 1;
                    script.offers.get(&sdp_id).cloned()
                }
                _ => None,
            }
        };

        let Some(offer_sdp) = offer_sdp else {
            return Ok(None);
        };

        let (client_id, answer, answerer) = self.answer(offer_sdp).await?;
        self.script.lock().answerers.insert(sdp_id, answerer);

        Ok(Some(AnswerInfo {
            sdp_id,
            answer_client_id: client_id,
            answer,
        }))
    }
}
