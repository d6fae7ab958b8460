//! Per-connection event dispatcher
//!
//! One task per connection consumes its transport events in order, drives the
//! record's state machine and forwards channel traffic as [`MeshEvent`]s. The
//! task ends when the connection reaches a terminal state, when the record is
//! released elsewhere, or on shutdown.
//!
//! Responder connections get `connect_timeout_ms` to reach `Connected`; the
//! supervisor applies the same deadline to self-initiated ones.

use crate::connection::ConnectionRecord;
use crate::context::MeshContext;
use crate::events::MeshEvent;
use crate::transport::{DataChannelHandle, TransportEvent, TransportEvents};
use crate::types::{Origin, TransportState};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

enum Flow {
    Continue,
    Stop,
}

pub(crate) fn spawn(
    ctx: &Arc<MeshContext>,
    record: Arc<ConnectionRecord>,
    transport_events: TransportEvents,
) {
    let span = tracing::debug_span!(
        "connection",
        correlation_id = %record.correlation_id(),
        origin = ?record.origin()
    );
    let dispatcher = Dispatcher {
        ctx: Arc::clone(ctx),
        record,
    };
    ctx.tracker
        .spawn(dispatcher.run(transport_events).instrument(span));
}

struct Dispatcher {
    ctx: Arc<MeshContext>,
    record: Arc<ConnectionRecord>,
}

impl Dispatcher {
    async fn run(self, mut transport_events: TransportEvents) {
        let mut awaiting_connect = self.record.origin() == Origin::Responder;
        let connect_deadline = tokio::time::sleep(self.ctx.config.negotiation.connect_timeout());
        tokio::pin!(connect_deadline);

        loop {
            let flow = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => Flow::Stop,
                _ = self.record.released() => {
                    self.on_state(TransportState::Closed).await
                }
                _ = &mut connect_deadline, if awaiting_connect => {
                    awaiting_connect = false;
                    self.on_connect_deadline().await
                }
                event = transport_events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        debug!("Transport event stream ended");
                        self.on_state(TransportState::Closed).await
                    }
                },
            };

            if let Flow::Stop = flow {
                break;
            }
        }
    }

    async fn handle(&self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::StateChanged(state) => return self.on_state(state).await,
            TransportEvent::DataChannel(handle) => self.on_data_channel(handle),
            TransportEvent::ChannelOpen { label } => {
                if self.record.mark_channel_open(&label) {
                    self.channel_opened(label);
                }
            }
            TransportEvent::ChannelMessage { label, data } => {
                self.ctx.emit(MeshEvent::DataReceived {
                    connection: self.record.info(),
                    label,
                    data,
                });
            }
            TransportEvent::ChannelClosed { label } => {
                if self.record.remove_channel(&label).is_some() {
                    debug!(label = %label, "Data channel closed");
                    self.channel_closed(label);
                }
            }
            TransportEvent::ChannelError { label, error } => {
                warn!(label = %label, "Data channel error: {}", error);
                if let Some(channel) = self.record.remove_channel(&label) {
                    if let Err(e) = channel.handle.close().await {
                        debug!(label = %label, "Error closing failed channel: {}", e);
                    }
                    self.channel_closed(label);
                }
            }
        }
        Flow::Continue
    }

    async fn on_state(&self, state: TransportState) -> Flow {
        let Some(state) = self.record.apply_state(state) else {
            // Terminal already: another path finished the teardown
            return if self.record.state().is_terminal() {
                Flow::Stop
            } else {
                Flow::Continue
            };
        };

        debug!(state = %state, "Transport state changed");
        match state {
            TransportState::Connected => {
                if self.ctx.pool.promote(&self.record) {
                    self.ctx.emit(MeshEvent::ConnectionEstablished {
                        connection: self.record.info(),
                    });
                }
                Flow::Continue
            }
            TransportState::Created | TransportState::Negotiating => Flow::Continue,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed => {
                self.terminate(state).await;
                Flow::Stop
            }
        }
    }

    async fn on_connect_deadline(&self) -> Flow {
        if self.record.state() == TransportState::Connected {
            return Flow::Continue;
        }

        warn!(
            sdp_id = ?self.record.sdp_id(),
            client_id = ?self.record.client_id(),
            timeout_ms = self.ctx.config.negotiation.connect_timeout_ms,
            "Remote peer did not connect in time, closing"
        );
        self.on_state(TransportState::Closed).await
    }

    async fn terminate(&self, state: TransportState) {
        if state == TransportState::Failed {
            warn!(sdp_id = ?self.record.sdp_id(), "Transport failed, closing");
        }

        self.record.release().await;
        let was_established = self.ctx.pool.evict(&self.record);

        for channel in self.record.take_channels() {
            if channel.open {
                self.channel_closed(channel.handle.label().to_string());
            }
        }

        info!(
            state = %state,
            sdp_id = ?self.record.sdp_id(),
            client_id = ?self.record.client_id(),
            was_established,
            "Connection ended"
        );

        if let Some(client_id) = self.record.client_id() {
            self.ctx.emit(MeshEvent::ConnectionClosed {
                client_id,
                connection: self.record.info(),
            });
        }
    }

    fn on_data_channel(&self, handle: Arc<dyn DataChannelHandle>) {
        let label = handle.label().to_string();
        let open = handle.is_open();
        debug!(label = %label, open, "Remote data channel announced");
        self.record.insert_channel(handle, open);
        if open {
            self.channel_opened(label);
        }
    }

    fn channel_opened(&self, label: String) {
        debug!(label = %label, "Data channel open");
        self.ctx.emit(MeshEvent::DataChannelOpened {
            connection: self.record.info(),
            label,
        });
    }

    fn channel_closed(&self, label: String) {
        self.ctx.emit(MeshEvent::DataChannelClosed {
            connection: self.record.info(),
            label,
        });
    }
}
