//! Peer mesh orchestrator
//!
//! [`PeerMesh`] owns the connection pool, the negotiation supervisor and one
//! dispatcher task per connection. Embedders receive lifecycle and data
//! events on the [`MeshEvents`] stream returned by [`PeerMesh::create`].

use crate::config::MeshConfig;
use crate::connection::ConnectionRecord;
use crate::context::MeshContext;
use crate::events::{ConnectionInfo, MeshEvent, MeshEvents};
use crate::pool::ConnectionPool;
use crate::signaling::SignalingClient;
use crate::supervisor;
use crate::transport::{DataChannelHandle, PeerTransportFactory, WebRtcTransportFactory};
use crate::types::{Role, TransportState};
use crate::Result;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long shutdown waits for background tasks to finish
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A channel a broadcast could not deliver to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedChannel {
    /// Offer ID of the connection
    pub sdp_id: Option<Uuid>,
    /// Remote client of the connection
    pub client_id: Option<Uuid>,
    /// Channel label
    pub label: String,
}

/// Statistics from broadcasting data to every open channel
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    /// Established connections at the time of the broadcast
    pub total_connections: usize,
    /// Open channels targeted
    pub total_channels: usize,
    /// Number of successful sends
    pub sent_count: usize,
    /// Number of failed sends
    pub failed_count: usize,
    /// Channels that failed and were removed
    pub failed_channels: Vec<FailedChannel>,
    /// Total duration of broadcast operation in milliseconds
    pub total_duration_ms: u64,
}

/// Self-organizing mesh of WebRTC data connections
///
/// Dropping the mesh cancels its background tasks; call
/// [`shutdown`](Self::shutdown) to also close every transport.
pub struct PeerMesh {
    ctx: Arc<MeshContext>,
    shut_down: AtomicBool,
}

impl PeerMesh {
    /// Create a mesh and start negotiating
    ///
    /// # Arguments
    ///
    /// * `config` - Mesh configuration, validated here
    /// * `signaling` - Offer/answer exchange
    /// * `factory` - Source of peer transports
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid.
    pub async fn create(
        config: MeshConfig,
        signaling: Arc<dyn SignalingClient>,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> Result<(Self, MeshEvents)> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(MeshContext {
            config,
            signaling,
            factory,
            pool: ConnectionPool::new(),
            events: events_tx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        info!(
            role = %ctx.config.role,
            client_id = %ctx.signaling.client_id(),
            channel = %ctx.config.negotiation.default_channel_label,
            "Starting peer mesh"
        );

        ctx.tracker.spawn(supervisor::run(Arc::clone(&ctx)));

        Ok((
            Self {
                ctx,
                shut_down: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    /// Create a mesh on webrtc-rs transports configured from `config.ice`
    pub async fn with_webrtc(
        config: MeshConfig,
        signaling: Arc<dyn SignalingClient>,
    ) -> Result<(Self, MeshEvents)> {
        config.validate()?;
        let factory = WebRtcTransportFactory::new(&config.ice, config.negotiation.data_channel_mode)?;
        Self::create(config, signaling, Arc::new(factory)).await
    }

    /// Send `data` on every open channel of every established connection
    ///
    /// A failing channel is logged, removed from its connection and closed;
    /// the remaining channels still receive the data.
    pub async fn broadcast(&self, data: impl Into<Bytes>) -> BroadcastStats {
        let start = Instant::now();
        let data = data.into();

        let connections = self.ctx.pool.established();
        let targets: Vec<(Arc<ConnectionRecord>, Arc<dyn DataChannelHandle>)> = connections
            .iter()
            .flat_map(|record| {
                record
                    .open_channels()
                    .into_iter()
                    .map(move |channel| (Arc::clone(record), channel))
            })
            .collect();

        debug!(
            connections = connections.len(),
            channels = targets.len(),
            bytes = data.len(),
            "Broadcasting"
        );

        let sends = targets.iter().map(|(_, channel)| channel.send(data.clone()));
        let results = join_all(sends).await;

        let mut stats = BroadcastStats {
            total_connections: connections.len(),
            total_channels: targets.len(),
            ..Default::default()
        };

        for ((record, channel), result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => stats.sent_count += 1,
                Err(e) => {
                    let label = channel.label().to_string();
                    warn!(
                        sdp_id = ?record.sdp_id(),
                        label = %label,
                        "Failed to send on data channel: {}", e
                    );
                    stats.failed_count += 1;
                    stats.failed_channels.push(FailedChannel {
                        sdp_id: record.sdp_id(),
                        client_id: record.client_id(),
                        label: label.clone(),
                    });

                    if record.remove_channel_handle(&channel) {
                        if let Err(e) = channel.close().await {
                            debug!(label = %label, "Error closing failed channel: {}", e);
                        }
                        self.ctx.emit(MeshEvent::DataChannelClosed {
                            connection: record.info(),
                            label,
                        });
                    }
                }
            }
        }

        stats.total_duration_ms = start.elapsed().as_millis() as u64;
        stats
    }

    /// Stop negotiating and close every connection
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down peer mesh");
        self.ctx.cancel.cancel();

        let records = self.ctx.pool.drain();
        let count = records.len();
        join_all(records.iter().map(|record| record.release())).await;

        self.ctx.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.ctx.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.ctx.tracker.len(),
                "Background tasks still running after {:?}", SHUTDOWN_GRACE
            );
        }

        info!(released = count, "Peer mesh shutdown complete");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Identity presented to signaling
    pub fn client_id(&self) -> Uuid {
        self.ctx.signaling.client_id()
    }

    pub fn role(&self) -> Role {
        self.ctx.config.role
    }

    pub fn config(&self) -> &MeshConfig {
        &self.ctx.config
    }

    /// Established connections
    pub fn established_connections(&self) -> Vec<ConnectionInfo> {
        self.ctx
            .pool
            .established()
            .iter()
            .map(|record| record.info())
            .collect()
    }

    /// Every connection the mesh tracks with its current transport state
    pub fn connection_states(&self) -> Vec<(ConnectionInfo, TransportState)> {
        self.ctx
            .pool
            .records()
            .iter()
            .map(|record| (record.info(), record.state()))
            .collect()
    }

    /// Remote clients of the established connections
    pub fn established_client_ids(&self) -> Vec<Uuid> {
        self.ctx.pool.established_client_ids()
    }

    /// Channel labels of an established connection
    pub fn channel_labels(&self, sdp_id: &Uuid) -> Option<Vec<String>> {
        self.ctx.pool.get(sdp_id).map(|record| record.channel_labels())
    }

    /// Connections created but not yet established
    pub fn in_flight_count(&self) -> usize {
        self.ctx.pool.in_flight_count()
    }
}

impl Drop for PeerMesh {
    fn drop(&mut self) {
        self.ctx.cancel.cancel();
    }
}
