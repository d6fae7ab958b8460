//! Core identity and state types shared across the mesh

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Node role forwarded to the signaling service when registering offers
///
/// The role labels registered offers only; both roles negotiate identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Provides data to the mesh (default)
    #[default]
    Provider,
    /// Subscribes to data from the mesh
    Subscriber,
}

impl Role {
    /// Wire representation of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Provider => "provider",
            Role::Subscriber => "subscriber",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "provider" => Ok(Role::Provider),
            "subscriber" => Ok(Role::Subscriber),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown role '{}', expected provider or subscriber",
                other
            ))),
        }
    }
}

/// Locally generated connection identity, present from creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh correlation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which side of the offer/answer exchange created a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// This node registered the offer and polled for the answer
    Initiator,
    /// This node answered an offer bundled in a registration response
    Responder,
}

/// Peer transport state
///
/// `Disconnected`, `Failed` and `Closed` are terminal: once one of them is
/// reached every later notification is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportState {
    /// Transport allocated, nothing exchanged yet
    Created,
    /// Offer/answer exchange or ICE/DTLS handshake in progress
    Negotiating,
    /// Transport established
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Transport failed
    Failed,
    /// Transport closed
    Closed,
}

impl TransportState {
    /// Whether this state ends the connection's life
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }

    /// Compute the state after a notification of `next`
    ///
    /// States only move forward (`Created` < `Negotiating` < `Connected` <
    /// terminal). Returns `None` when the notification changes nothing: the
    /// current state is already terminal, or `next` does not move forward.
    pub fn advance(self, next: TransportState) -> Option<TransportState> {
        if self.is_terminal() || next.rank() <= self.rank() {
            return None;
        }
        Some(next)
    }

    fn rank(&self) -> u8 {
        match self {
            TransportState::Created => 0,
            TransportState::Negotiating => 1,
            TransportState::Connected => 2,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed => 3,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Created => "created",
            TransportState::Negotiating => "negotiating",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(name)
    }
}
