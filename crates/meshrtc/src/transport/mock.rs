//! In-memory loopback transport for tests and single-process simulations
//!
//! Offers and answers are opaque tokens naming the transports involved.
//! Applying an answer on the offering side links both transports through
//! their shared [`MockNetwork`], reports the connection as established on
//! both ends and mirrors the offerer's data channels onto the answerer.

use super::{
    DataChannelHandle, PeerTransport, PeerTransportFactory, SdpKind, SessionDescription,
    TransportEvent, TransportEventSender, TransportEvents,
};
use crate::types::TransportState;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

const OFFER_PREFIX: &str = "mock-offer";
const ANSWER_PREFIX: &str = "mock-answer";

/// Registry linking mock transports created by any factory sharing it
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    next_id: AtomicU64,
    transports: Mutex<HashMap<u64, Weak<MockPeerTransport>>>,
}

impl MockNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory whose transports live on this network
    pub fn factory(&self) -> Arc<MockTransportFactory> {
        Arc::new(MockTransportFactory {
            network: self.clone(),
            created: Mutex::new(Vec::new()),
        })
    }

    /// Allocate a standalone transport on this network
    pub fn transport(&self) -> (Arc<MockPeerTransport>, TransportEvents) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockPeerTransport {
            id,
            network: self.clone(),
            events: events_tx,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            peer: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            close_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.inner
            .transports
            .lock()
            .insert(id, Arc::downgrade(&transport));
        (transport, events_rx)
    }

    fn lookup(&self, id: u64) -> Option<Arc<MockPeerTransport>> {
        self.inner.transports.lock().get(&id).and_then(Weak::upgrade)
    }
}

/// Factory handing out mock transports and remembering every one it created
pub struct MockTransportFactory {
    network: MockNetwork,
    created: Mutex<Vec<Arc<MockPeerTransport>>>,
}

impl MockTransportFactory {
    /// Every transport created so far, in creation order
    pub fn transports(&self) -> Vec<Arc<MockPeerTransport>> {
        self.created.lock().clone()
    }

    /// The network this factory creates transports on
    pub fn network(&self) -> &MockNetwork {
        &self.network
    }
}

#[async_trait]
impl PeerTransportFactory for MockTransportFactory {
    async fn create(&self) -> Result<(Arc<dyn PeerTransport>, TransportEvents)> {
        let (transport, events) = self.network.transport();
        self.created.lock().push(Arc::clone(&transport));
        Ok((transport as Arc<dyn PeerTransport>, events))
    }
}

/// Loopback peer transport
pub struct MockPeerTransport {
    id: u64,
    network: MockNetwork,
    events: TransportEventSender,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    peer: Mutex<Option<Weak<MockPeerTransport>>>,
    channels: Mutex<HashMap<String, Arc<MockDataChannel>>>,
    close_count: AtomicUsize,
    closed: AtomicBool,
}

impl MockPeerTransport {
    /// Network-unique transport ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver a state notification as if the engine had raised it
    pub fn inject_state(&self, state: TransportState) {
        let _ = self.events.send(TransportEvent::StateChanged(state));
    }

    /// How many times `close` has been called
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Whether `close` has been called at least once
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether an answer has linked this transport to a peer
    pub fn is_linked(&self) -> bool {
        self.linked_peer().is_some()
    }

    /// Data channel with the given label, local or mirrored
    pub fn channel(&self, label: &str) -> Option<Arc<MockDataChannel>> {
        self.channels.lock().get(label).cloned()
    }

    /// Remote description as applied
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    fn linked_peer(&self) -> Option<Arc<MockPeerTransport>> {
        self.peer.lock().as_ref().and_then(Weak::upgrade)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PeerConnectionError(format!(
                "mock transport {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn new_channel(&self, label: &str) -> Arc<MockDataChannel> {
        let channel = Arc::new(MockDataChannel {
            label: label.to_string(),
            events: self.events.clone(),
            open: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            remote: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
        });
        self.channels
            .lock()
            .insert(label.to_string(), Arc::clone(&channel));
        channel
    }

    /// Create the answerer-side twin of `local` and open both ends
    fn mirror_channel(&self, peer: &MockPeerTransport, local: &Arc<MockDataChannel>) {
        let remote = peer.new_channel(&local.label);
        *local.remote.lock() = Some(Arc::downgrade(&remote));
        *remote.remote.lock() = Some(Arc::downgrade(local));
        local.open.store(true, Ordering::SeqCst);
        remote.open.store(true, Ordering::SeqCst);

        peer.emit(TransportEvent::DataChannel(
            Arc::clone(&remote) as Arc<dyn DataChannelHandle>
        ));
        peer.emit(TransportEvent::ChannelOpen {
            label: remote.label.clone(),
        });
        self.emit(TransportEvent::ChannelOpen {
            label: local.label.clone(),
        });
    }

    fn link(&self, answerer: &Arc<MockPeerTransport>) -> Result<()> {
        answerer.ensure_open()?;
        let self_arc = self
            .network
            .lookup(self.id)
            .ok_or_else(|| Error::PeerConnectionError("offerer not registered".to_string()))?;

        *self.peer.lock() = Some(Arc::downgrade(answerer));
        *answerer.peer.lock() = Some(Arc::downgrade(&self_arc));

        for side in [self, answerer.as_ref()] {
            side.emit(TransportEvent::StateChanged(TransportState::Negotiating));
            side.emit(TransportEvent::StateChanged(TransportState::Connected));
        }

        let local_channels: Vec<_> = self.channels.lock().values().cloned().collect();
        for channel in &local_channels {
            self.mirror_channel(answerer, channel);
        }

        debug!("Mock transports {} and {} linked", self.id, answerer.id);
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!(
            "{} {}",
            OFFER_PREFIX, self.id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let offerer = match self.remote.lock().as_ref() {
            Some(remote) if remote.kind == SdpKind::Offer => parse_offer(&remote.sdp)?,
            _ => {
                return Err(Error::SdpError(
                    "cannot answer without a remote offer".to_string(),
                ))
            }
        };
        Ok(SessionDescription::answer(format!(
            "{} {} {}",
            ANSWER_PREFIX, offerer, self.id
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        match description.kind {
            SdpKind::Offer => {
                parse_offer(&description.sdp)?;
                *self.remote.lock() = Some(description);
                Ok(())
            }
            SdpKind::Answer => {
                let (offerer, answerer) = parse_answer(&description.sdp)?;
                if offerer != self.id {
                    return Err(Error::SdpError(format!(
                        "answer targets transport {}, not {}",
                        offerer, self.id
                    )));
                }
                let answerer = self.network.lookup(answerer).ok_or_else(|| {
                    Error::SdpError(format!("answering transport {} is gone", answerer))
                })?;
                *self.remote.lock() = Some(description);
                self.link(&answerer)
            }
        }
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannelHandle>> {
        self.ensure_open()?;
        let channel = self.new_channel(label);
        if let Some(peer) = self.linked_peer() {
            self.mirror_channel(&peer, &channel);
        }
        Ok(channel as Arc<dyn DataChannelHandle>)
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channels: Vec<_> = self.channels.lock().values().cloned().collect();
        for channel in channels {
            channel.open.store(false, Ordering::SeqCst);
            if let Some(remote) = channel.remote_channel() {
                remote.open.store(false, Ordering::SeqCst);
            }
        }

        self.emit(TransportEvent::StateChanged(TransportState::Closed));
        if let Some(peer) = self.linked_peer() {
            if !peer.is_closed() {
                peer.emit(TransportEvent::StateChanged(TransportState::Disconnected));
            }
        }
        Ok(())
    }
}

/// Loopback data channel
pub struct MockDataChannel {
    label: String,
    events: TransportEventSender,
    open: AtomicBool,
    fail_sends: AtomicBool,
    remote: Mutex<Option<Weak<MockDataChannel>>>,
    sent: Mutex<Vec<Bytes>>,
    close_count: AtomicUsize,
}

impl MockDataChannel {
    /// Make every subsequent send fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Messages successfully sent on this channel
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// How many times `close` has been called
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn remote_channel(&self) -> Option<Arc<MockDataChannel>> {
        self.remote.lock().as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl DataChannelHandle for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::DataChannelError(format!(
                "mock send failure on '{}'",
                self.label
            )));
        }
        if !self.is_open() {
            return Err(Error::DataChannelError(format!(
                "Data channel '{}' is not open",
                self.label
            )));
        }

        let remote = self.remote_channel().ok_or_else(|| {
            Error::DataChannelError(format!("Data channel '{}' has no remote end", self.label))
        })?;
        let _ = remote.events.send(TransportEvent::ChannelMessage {
            label: remote.label.clone(),
            data: data.clone(),
        });
        self.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.events.send(TransportEvent::ChannelClosed {
            label: self.label.clone(),
        });
        if let Some(remote) = self.remote_channel() {
            if remote.open.swap(false, Ordering::SeqCst) {
                let _ = remote.events.send(TransportEvent::ChannelClosed {
                    label: remote.label.clone(),
                });
            }
        }
        Ok(())
    }
}

fn parse_offer(sdp: &str) -> Result<u64> {
    let mut parts = sdp.split_whitespace();
    match (parts.next(), parts.next().map(str::parse::<u64>), parts.next()) {
        (Some(OFFER_PREFIX), Some(Ok(id)), None) => Ok(id),
        _ => Err(Error::SdpError(format!("not a mock offer: '{}'", sdp))),
    }
}

fn parse_answer(sdp: &str) -> Result<(u64, u64)> {
    let mut parts = sdp.split_whitespace();
    match (
        parts.next(),
        parts.next().map(str::parse::<u64>),
        parts.next().map(str::parse::<u64>),
        parts.next(),
    ) {
        (Some(ANSWER_PREFIX), Some(Ok(offerer)), Some(Ok(answerer)), None) => {
            Ok((offerer, answerer))
        }
        _ => Err(Error::SdpError(format!("not a mock answer: '{}'", sdp))),
    }
}
