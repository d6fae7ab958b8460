//! State shared by the mesh's background tasks

use crate::config::MeshConfig;
use crate::connection::ConnectionRecord;
use crate::dispatch;
use crate::events::{MeshEvent, MeshEventSender};
use crate::pool::ConnectionPool;
use crate::signaling::SignalingClient;
use crate::transport::PeerTransportFactory;
use crate::types::Origin;
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::trace;

pub(crate) struct MeshContext {
    pub config: MeshConfig,
    pub signaling: Arc<dyn SignalingClient>,
    pub factory: Arc<dyn PeerTransportFactory>,
    pub pool: ConnectionPool,
    pub events: MeshEventSender,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

impl MeshContext {
    /// Create a transport, track it and start its event dispatcher
    pub async fn open_connection(self: &Arc<Self>, origin: Origin) -> Result<Arc<ConnectionRecord>> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let (transport, transport_events) = self.factory.create().await?;
        let record = ConnectionRecord::new(origin, transport);

        if let Err(e) = self.pool.track(&record) {
            record.release().await;
            return Err(e);
        }

        dispatch::spawn(self, Arc::clone(&record), transport_events);
        Ok(record)
    }

    /// Release a record and drop it from the pool
    pub async fn discard(&self, record: &Arc<ConnectionRecord>) {
        record.release().await;
        self.pool.evict(record);
    }

    /// Run `fut` unless shutdown starts first
    pub async fn cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::ShuttingDown),
            result = fut => result,
        }
    }

    pub fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            trace!("Mesh event receiver dropped");
        }
    }
}
