//! Self-organizing WebRTC data mesh
//!
//! This crate keeps a node connected to every other node registered with an
//! HTTP offer/answer signaling service, and multiplexes labelled data
//! channels over those connections.
//!
//! # Features
//!
//! - **Continuous negotiation**: one offer cycle at a time, restarted as soon
//!   as the previous one connects, with exponential backoff on failure
//! - **Batched answering**: remote offers handed out with a registration are
//!   answered in parallel and submitted in one request
//! - **Connection pool**: in-flight and established connections tracked
//!   separately, with a monotonic per-connection state machine
//! - **Broadcast**: fan-out to every open data channel with per-channel fault
//!   isolation
//! - **Pluggable seams**: signaling, token refresh and peer transports are
//!   traits, with in-process implementations for tests
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  PeerMesh                                               │
//! │  ├─ Supervisor (offer cycle loop, backoff)              │
//! │  │   └─ Negotiation (offer → answers batch → poll)      │
//! │  ├─ SignalingClient (HTTP + bearer token)               │
//! │  ├─ ConnectionPool (in-flight / established)            │
//! │  │   └─ ConnectionRecord per transport                  │
//! │  │       └─ Dispatcher task (state machine, channels)   │
//! │  └─ MeshEvents (to the embedder)                        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use meshrtc::{MeshConfig, Role};
//!
//! let config = MeshConfig::default().with_role(Role::Subscriber);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.negotiation.default_channel_label, "mesh-data-main");
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use meshrtc::auth::StaticTokenProvider;
//! use meshrtc::signaling::HttpSignalingClient;
//! use meshrtc::{MeshConfig, MeshEvent, PeerMesh};
//! use std::sync::Arc;
//!
//! # async fn example() -> meshrtc::Result<()> {
//! let config = MeshConfig::default();
//! let tokens = Arc::new(StaticTokenProvider::new("token"));
//! let signaling = Arc::new(HttpSignalingClient::new(&config.signaling, tokens)?);
//!
//! let (mesh, mut events) = PeerMesh::with_webrtc(config, signaling).await?;
//! while let Some(event) = events.recv().await {
//!     if let MeshEvent::DataChannelOpened { .. } = event {
//!         mesh.broadcast("hello").await;
//!     }
//! }
//! mesh.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod signaling;
pub mod supervisor;
pub mod transport;
pub mod types;

mod connection;
mod context;
mod dispatch;
mod mesh;
mod negotiation;
mod pool;

pub use config::{
    AuthConfig, DataChannelMode, IceConfig, MeshConfig, NegotiationConfig, SignalingConfig,
    TurnServerConfig, DEFAULT_CHANNEL_LABEL,
};
pub use error::{Error, Result};
pub use events::{ConnectionInfo, MeshEvent, MeshEvents};
pub use mesh::{BroadcastStats, FailedChannel, PeerMesh, SHUTDOWN_GRACE};
pub use supervisor::BackoffPolicy;
pub use types::{CorrelationId, Origin, Role, TransportState};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
