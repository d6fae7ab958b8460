//! Events delivered to the embedding application

use crate::types::{CorrelationId, Origin};
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identity of the connection an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Local identity, present from creation
    pub correlation_id: CorrelationId,
    /// Signaling offer ID, once known
    pub sdp_id: Option<Uuid>,
    /// Remote client, once known
    pub client_id: Option<Uuid>,
    /// Which side of the exchange created the connection
    pub origin: Origin,
}

/// Mesh lifecycle and data events
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A connection reached the connected state and joined the pool
    ConnectionEstablished { connection: ConnectionInfo },

    /// A data channel opened and is now used by broadcast
    DataChannelOpened {
        connection: ConnectionInfo,
        label: String,
    },

    /// A message arrived on a data channel
    DataReceived {
        connection: ConnectionInfo,
        label: String,
        data: Bytes,
    },

    /// A data channel closed or failed and was removed
    DataChannelClosed {
        connection: ConnectionInfo,
        label: String,
    },

    /// A connection with a known remote client ended
    ConnectionClosed {
        client_id: Uuid,
        connection: ConnectionInfo,
    },

    /// The supervisor exhausted its retry budget and stopped negotiating
    NegotiationHalted { reason: String },
}

/// Receiving end of the mesh event stream
pub type MeshEvents = mpsc::UnboundedReceiver<MeshEvent>;

pub(crate) type MeshEventSender = mpsc::UnboundedSender<MeshEvent>;
