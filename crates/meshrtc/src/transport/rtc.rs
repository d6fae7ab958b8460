//! Peer transport backed by webrtc-rs

use super::{
    DataChannelHandle, PeerTransport, PeerTransportFactory, SdpKind, SessionDescription,
    TransportEvent, TransportEventSender, TransportEvents,
};
use crate::config::{DataChannelMode, IceConfig};
use crate::types::TransportState;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Creates webrtc-rs peer connections sharing one API instance
pub struct WebRtcTransportFactory {
    api: API,
    rtc_config: RTCConfiguration,
    channel_mode: DataChannelMode,
    gathering_timeout: Duration,
}

impl WebRtcTransportFactory {
    /// Build the factory from ICE settings
    ///
    /// # Arguments
    ///
    /// * `ice` - STUN/TURN servers and the ICE gathering bound
    /// * `channel_mode` - Delivery mode of locally created data channels
    pub fn new(ice: &IceConfig, channel_mode: DataChannelMode) -> Result<Self> {
        // Create MediaEngine with default codecs
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        // Create InterceptorRegistry with default interceptors
        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        // Configure ICE servers (STUN/TURN)
        let ice_servers: Vec<RTCIceServer> = ice
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(ice.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            channel_mode,
            gathering_timeout: Duration::from_millis(ice.gathering_timeout_ms),
        })
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(&self) -> Result<(Arc<dyn PeerTransport>, TransportEvents)> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(|e| {
                    Error::WebRtcError(format!("Failed to create peer connection: {}", e))
                })?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = WebRtcPeerTransport::wire(
            peer_connection,
            events_tx,
            self.channel_mode,
            self.gathering_timeout,
        );

        Ok((Arc::new(transport) as Arc<dyn PeerTransport>, events_rx))
    }
}

/// WebRTC peer connection wrapper
///
/// Forwards connection-state and data-channel callbacks into the
/// transport's event ingress.
pub struct WebRtcPeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    events: TransportEventSender,
    channel_mode: DataChannelMode,
    gathering_timeout: Duration,
}

impl WebRtcPeerTransport {
    fn wire(
        peer_connection: Arc<RTCPeerConnection>,
        events: TransportEventSender,
        channel_mode: DataChannelMode,
        gathering_timeout: Duration,
    ) -> Self {
        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let state_events = state_events.clone();
                Box::pin(async move {
                    debug!("Peer connection state changed: {:?}", s);
                    if let Some(state) = map_connection_state(s) {
                        let _ = state_events.send(TransportEvent::StateChanged(state));
                    }
                })
            },
        ));

        let channel_events = events.clone();
        peer_connection.on_data_channel(Box::new(move |rtc_channel: Arc<RTCDataChannel>| {
            let channel_events = channel_events.clone();
            Box::pin(async move {
                debug!("Remote data channel announced: {}", rtc_channel.label());
                let channel = WebRtcDataChannel::wire(rtc_channel, channel_events.clone());
                let _ = channel_events.send(TransportEvent::DataChannel(Arc::new(channel)));
            })
        }));

        Self {
            peer_connection,
            events,
            channel_mode,
            gathering_timeout,
        }
    }

    /// Access the underlying peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    #[instrument(skip(self, description), fields(kind = ?description.kind))]
    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;

        // Registered before applying so a fast gatherer cannot complete unobserved
        let mut gathering_complete = self.peer_connection.gathering_complete_promise().await;

        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(self.gathering_timeout, gathering_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "ICE gathering did not complete within {:?}, publishing partial description",
                self.gathering_timeout
            );
        }

        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.peer_connection.local_description().await?;
        match description.sdp_type {
            RTCSdpType::Offer => Some(SessionDescription::offer(description.sdp)),
            RTCSdpType::Answer => Some(SessionDescription::answer(description.sdp)),
            _ => None,
        }
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannelHandle>> {
        let init = RTCDataChannelInit {
            ordered: Some(self.channel_mode.ordered()),
            max_retransmits: self.channel_mode.max_retransmits(),
            ..Default::default()
        };

        let rtc_channel = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        debug!("Created data channel '{}' ({:?})", label, self.channel_mode);

        let channel = WebRtcDataChannel::wire(rtc_channel, self.events.clone());
        Ok(Arc::new(channel) as Arc<dyn DataChannelHandle>)
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection");
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close: {}", e)))
    }
}

/// WebRTC data channel wrapper
pub struct WebRtcDataChannel {
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    fn wire(rtc_channel: Arc<RTCDataChannel>, events: TransportEventSender) -> Self {
        let label = rtc_channel.label().to_string();

        let open_events = events.clone();
        let open_label = label.clone();
        rtc_channel.on_open(Box::new(move || {
            let open_events = open_events.clone();
            let label = open_label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' opened", label);
                let _ = open_events.send(TransportEvent::ChannelOpen { label });
            })
        }));

        let close_events = events.clone();
        let close_label = label.clone();
        rtc_channel.on_close(Box::new(move || {
            let close_events = close_events.clone();
            let label = close_label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' closed", label);
                let _ = close_events.send(TransportEvent::ChannelClosed { label });
            })
        }));

        let error_events = events.clone();
        let error_label = label.clone();
        rtc_channel.on_error(Box::new(move |err: webrtc::Error| {
            let error_events = error_events.clone();
            let label = error_label.clone();
            Box::pin(async move {
                let _ = error_events.send(TransportEvent::ChannelError {
                    label,
                    error: err.to_string(),
                });
            })
        }));

        let message_label = label.clone();
        rtc_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            let label = message_label.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::ChannelMessage {
                    label,
                    data: msg.data,
                });
            })
        }));

        Self { label, rtc_channel }
    }
}

#[async_trait]
impl DataChannelHandle for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.rtc_channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannelError(format!(
                "Data channel '{}' is not open (state: {:?})",
                self.label,
                self.rtc_channel.ready_state()
            )));
        }

        self.rtc_channel
            .send(&data)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send binary: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.rtc_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| Error::SdpError(format!("Invalid session description: {}", e)))
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(TransportState::Negotiating),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => None,
    }
}
