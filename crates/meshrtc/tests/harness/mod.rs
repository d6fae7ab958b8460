//! Mesh integration test harness
//!
//! - [`ScriptedSignaling`]: a signaling service whose answers, failures and
//!   bundled offers are driven by the test
//! - loopback remote peers on a shared [`MockNetwork`]
//! - event and condition waiting helpers

#![allow(dead_code)]

pub mod scripted;

use meshrtc::signaling::OfferInfo;
use meshrtc::transport::{
    MockNetwork, MockPeerTransport, MockTransportFactory, PeerTransport, SessionDescription,
    TransportEvent, TransportEvents,
};
use meshrtc::{MeshConfig, MeshEvent, MeshEvents, Role, DEFAULT_CHANNEL_LABEL};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use scripted::{Answerer, ScriptedSignaling};

/// Default wait used by the helpers
pub const WAIT: Duration = Duration::from_secs(10);

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,meshrtc=debug")
        .with_test_writer()
        .try_init();
}

/// Fast negotiation settings for in-process meshes
pub fn test_config(role: Role) -> MeshConfig {
    MeshConfig::local_testing().with_role(role)
}

/// Wait for the first event matching `pred`, skipping the others
pub async fn next_event<F>(events: &mut MeshEvents, mut pred: F) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("mesh event stream ended"),
            }
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .expect("timed out waiting for mesh event")
}

/// Collect every event delivered within `window`
pub async fn collect_events(events: &mut MeshEvents, window: Duration) -> Vec<MeshEvent> {
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        collected.push(event);
    }
    collected
}

/// Poll `condition` every 10ms until it holds
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(WAIT, wait).await.is_err() {
        panic!("timed out waiting for {}", what);
    }
}

/// A loopback peer that registered an offer with the signaling service
pub struct RemotePeer {
    pub client_id: Uuid,
    pub transport: Arc<MockPeerTransport>,
    pub events: TransportEvents,
    pub offer: OfferInfo,
}

impl RemotePeer {
    /// Create a peer with the default data channel and a registered offer
    pub async fn offering(network: &MockNetwork) -> Self {
        let (transport, events) = network.transport();
        transport
            .create_data_channel(DEFAULT_CHANNEL_LABEL)
            .await
            .unwrap();
        let offer = transport.create_offer().await.unwrap();
        transport.set_local_description(offer.clone()).await.unwrap();

        let client_id = Uuid::new_v4();
        Self {
            client_id,
            transport,
            events,
            offer: OfferInfo::new(Uuid::new_v4(), client_id, Role::Provider, &offer.sdp),
        }
    }

    /// Apply the mesh's answer, connecting this peer
    pub async fn accept(&self, answer_sdp: &str) {
        self.transport
            .set_remote_description(SessionDescription::answer(answer_sdp))
            .await
            .unwrap();
    }

    /// The mesh's transport that answered this peer's offer
    pub fn mesh_side(&self, factory: &MockTransportFactory) -> Arc<MockPeerTransport> {
        let offer = SessionDescription::offer(self.offer.offer_sdp().unwrap());
        factory
            .transports()
            .into_iter()
            .find(|t| t.remote_description() == Some(offer.clone()))
            .expect("responder transport for this peer")
    }

    /// Messages received so far on the default channel
    pub fn received(&mut self) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let TransportEvent::ChannelMessage { data, .. } = event {
                messages.push(data.to_vec());
            }
        }
        messages
    }
}

/// An offer no transport can apply
pub fn garbage_offer() -> OfferInfo {
    OfferInfo::new(Uuid::new_v4(), Uuid::new_v4(), Role::Subscriber, "not an sdp")
}
