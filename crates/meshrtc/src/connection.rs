//! Per-connection bookkeeping
//!
//! A [`ConnectionRecord`] wraps one peer transport together with its
//! identities, its state machine and the data channels opened on it.

use crate::events::ConnectionInfo;
use crate::transport::{DataChannelHandle, PeerTransport};
use crate::types::{CorrelationId, Origin, TransportState};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A data channel tracked on a connection
#[derive(Clone)]
pub(crate) struct ChannelRecord {
    pub handle: Arc<dyn DataChannelHandle>,
    pub open: bool,
}

/// One peer connection and everything known about it
pub struct ConnectionRecord {
    correlation_id: CorrelationId,
    origin: Origin,

    /// Offer ID assigned by signaling, set once
    sdp_id: OnceLock<Uuid>,

    /// Remote client, set once
    client_id: OnceLock<Uuid>,

    state: watch::Sender<TransportState>,

    /// Channels keyed by label
    channels: RwLock<HashMap<String, ChannelRecord>>,

    transport: Arc<dyn PeerTransport>,

    released: AtomicBool,
    released_signal: CancellationToken,
}

impl ConnectionRecord {
    /// Wrap a freshly created transport
    pub(crate) fn new(origin: Origin, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let (state, _) = watch::channel(TransportState::Created);
        Arc::new(Self {
            correlation_id: CorrelationId::new(),
            origin,
            sdp_id: OnceLock::new(),
            client_id: OnceLock::new(),
            state,
            channels: RwLock::new(HashMap::new()),
            transport,
            released: AtomicBool::new(false),
            released_signal: CancellationToken::new(),
        })
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn sdp_id(&self) -> Option<Uuid> {
        self.sdp_id.get().copied()
    }

    pub fn client_id(&self) -> Option<Uuid> {
        self.client_id.get().copied()
    }

    /// Set the offer ID; later calls are ignored
    pub(crate) fn set_sdp_id(&self, sdp_id: Uuid) {
        if self.sdp_id.set(sdp_id).is_err() {
            debug!(correlation_id = %self.correlation_id, "sdp_id already assigned");
        }
    }

    /// Set the remote client; later calls are ignored
    pub(crate) fn set_client_id(&self, client_id: Uuid) {
        if self.client_id.set(client_id).is_err() {
            debug!(correlation_id = %self.correlation_id, "client_id already assigned");
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Apply a state notification
    ///
    /// Returns the new state if the notification moved the state machine,
    /// `None` if it was ignored.
    pub(crate) fn apply_state(&self, next: TransportState) -> Option<TransportState> {
        let mut applied = None;
        self.state.send_if_modified(|current| match current.advance(next) {
            Some(advanced) => {
                *current = advanced;
                applied = Some(advanced);
                true
            }
            None => false,
        });
        applied
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            correlation_id: self.correlation_id,
            sdp_id: self.sdp_id(),
            client_id: self.client_id(),
            origin: self.origin,
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Track a channel; an existing entry with the same label is replaced
    pub(crate) fn insert_channel(&self, handle: Arc<dyn DataChannelHandle>, open: bool) {
        let label = handle.label().to_string();
        self.channels
            .write()
            .insert(label, ChannelRecord { handle, open });
    }

    /// Mark a channel open, returning true if it was not open before
    pub(crate) fn mark_channel_open(&self, label: &str) -> bool {
        match self.channels.write().get_mut(label) {
            Some(channel) if !channel.open => {
                channel.open = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove_channel(&self, label: &str) -> Option<ChannelRecord> {
        self.channels.write().remove(label)
    }

    /// Remove a channel only if the entry still holds `handle`
    pub(crate) fn remove_channel_handle(&self, handle: &Arc<dyn DataChannelHandle>) -> bool {
        let mut channels = self.channels.write();
        let same = channels
            .get(handle.label())
            .is_some_and(|channel| same_channel(&channel.handle, handle));
        if same {
            channels.remove(handle.label());
        }
        same
    }

    pub(crate) fn take_channels(&self) -> Vec<ChannelRecord> {
        self.channels.write().drain().map(|(_, channel)| channel).collect()
    }

    /// Channels currently open, for broadcast
    pub(crate) fn open_channels(&self) -> Vec<Arc<dyn DataChannelHandle>> {
        self.channels
            .read()
            .values()
            .filter(|channel| channel.open)
            .map(|channel| Arc::clone(&channel.handle))
            .collect()
    }

    /// Labels of all tracked channels, sorted
    pub fn channel_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.channels.read().keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Resolves once the record has been released
    pub(crate) async fn released(&self) {
        self.released_signal.cancelled().await
    }

    /// Close the transport; only the first call does anything
    pub(crate) async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.released_signal.cancel();

        debug!(correlation_id = %self.correlation_id, sdp_id = ?self.sdp_id(), "Releasing transport");
        if let Err(e) = self.transport.close().await {
            warn!(
                correlation_id = %self.correlation_id,
                "Error closing transport: {}", e
            );
        }
        true
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("correlation_id", &self.correlation_id)
            .field("origin", &self.origin)
            .field("sdp_id", &self.sdp_id())
            .field("client_id", &self.client_id())
            .field("state", &self.state())
            .field("channels", &self.channel_labels())
            .finish()
    }
}

fn same_channel(a: &Arc<dyn DataChannelHandle>, b: &Arc<dyn DataChannelHandle>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
