//! Peer transport abstraction
//!
//! The mesh only needs a narrow slice of a peer connection: offer/answer
//! creation, local/remote descriptions, data channels and state
//! notifications. Every engine callback is funnelled into one
//! [`TransportEvents`] receiver per transport so a single task can consume
//! them in order.

pub mod mock;
pub mod rtc;

use crate::types::TransportState;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use self::mock::{MockDataChannel, MockNetwork, MockPeerTransport, MockTransportFactory};
pub use self::rtc::{WebRtcPeerTransport, WebRtcTransportFactory};

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description exchanged through signaling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP payload
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Notification raised by a peer transport
pub enum TransportEvent {
    /// Connection state transition
    StateChanged(TransportState),
    /// Remote peer announced a data channel
    DataChannel(Arc<dyn DataChannelHandle>),
    /// Data channel is open
    ChannelOpen { label: String },
    /// Message received on a data channel
    ChannelMessage { label: String, data: Bytes },
    /// Data channel closed
    ChannelClosed { label: String },
    /// Data channel reported an error
    ChannelError { label: String, error: String },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            TransportEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            TransportEvent::ChannelOpen { label } => {
                f.debug_struct("ChannelOpen").field("label", label).finish()
            }
            TransportEvent::ChannelMessage { label, data } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("len", &data.len())
                .finish(),
            TransportEvent::ChannelClosed { label } => {
                f.debug_struct("ChannelClosed").field("label", label).finish()
            }
            TransportEvent::ChannelError { label, error } => f
                .debug_struct("ChannelError")
                .field("label", label)
                .field("error", error)
                .finish(),
        }
    }
}

/// Sending half of a transport's event ingress
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of a transport's event ingress
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// One point-to-point peer session
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an SDP offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an SDP answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description
    ///
    /// Implementations that gather ICE candidates return once gathering has
    /// finished so the description is complete without trickle.
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// The local description as currently applied
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Apply the remote peer's description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Create a locally initiated data channel
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannelHandle>>;

    /// Close the transport
    async fn close(&self) -> Result<()>;
}

/// One labeled data channel on a peer transport
#[async_trait]
pub trait DataChannelHandle: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Whether the channel can currently carry messages
    fn is_open(&self) -> bool;

    /// Send a binary message
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}

/// Creates peer transports together with their event ingress
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Allocate a new transport
    async fn create(&self) -> Result<(Arc<dyn PeerTransport>, TransportEvents)>;
}
