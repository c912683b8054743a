//! webrtc-rs negotiation engine.
//!
//! Negotiation is non-trickle: a description is only handed out once ICE
//! gathering has finished, so each direction is a single payload carrying
//! every candidate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SessionConfig;
use crate::connection::Role;
use crate::error::{Error, Result};
use crate::media::{LocalMedia, MediaKind, RemoteMedia};
use crate::session::{LinkObserver, PeerConnector, PeerLink};
use crate::signaling::{ConnectionId, SignalPayload};

pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
        })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open(
        &self,
        peer: &ConnectionId,
        role: Role,
        media: &LocalMedia,
        observer: LinkObserver,
    ) -> Result<Arc<dyn PeerLink>> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.rtc_configuration()).await?);

        let senders = add_local_tracks(&peer_connection, media).await?;

        let remote = RemoteMedia::new(peer.as_str());
        let track_media = remote.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                debug!(kind = %track.kind(), "remote track received");
                track_media.add_track(track);
                Box::pin(async {})
            },
        ));

        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            debug!(peer = %observer.peer(), "Peer Connection State has changed: {}", s);
            match s {
                RTCPeerConnectionState::Connected => observer.connected(remote.clone()),
                RTCPeerConnectionState::Failed => observer.terminated("peer connection failed"),
                RTCPeerConnectionState::Closed => observer.terminated("peer connection closed"),
                _ => {}
            }
            Box::pin(async {})
        }));

        debug!(peer = %peer, role = %role, tracks = senders.len(), "peer connection created");
        Ok(Arc::new(WebRtcLink {
            peer_connection,
            senders,
        }))
    }
}

/// Adds every local track. On failure the connection is closed, since
/// webrtc-rs does not close it on drop.
async fn add_local_tracks(
    peer_connection: &RTCPeerConnection,
    media: &LocalMedia,
) -> Result<HashMap<MediaKind, Arc<RTCRtpSender>>> {
    let mut senders = HashMap::new();
    for (kind, track) in media.tracks() {
        let sender = match peer_connection
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                if let Err(close_err) = peer_connection.close().await {
                    debug!("closing half-built peer connection failed: {}", close_err);
                }
                return Err(e.into());
            }
        };

        // Interceptors only work while incoming RTCP is drained.
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });
        senders.insert(kind, sender);
    }
    Ok(senders)
}

pub struct WebRtcLink {
    peer_connection: Arc<RTCPeerConnection>,
    senders: HashMap<MediaKind, Arc<RTCRtpSender>>,
}

impl WebRtcLink {
    /// Applies `description` locally and returns it once gathering is done.
    async fn set_local_and_gather(&self, description: RTCSessionDescription) -> Result<SignalPayload> {
        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(description).await?;
        let _ = gather_complete.recv().await;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("no local description".to_string()))?;
        Ok(SignalPayload::new(serde_json::to_value(local)?))
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SignalPayload> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.set_local_and_gather(offer).await
    }

    async fn accept_offer(&self, offer: SignalPayload) -> Result<SignalPayload> {
        let offer: RTCSessionDescription = serde_json::from_value(offer.into_value())?;
        self.peer_connection.set_remote_description(offer).await?;

        let answer = self.peer_connection.create_answer(None).await?;
        self.set_local_and_gather(answer).await
    }

    async fn accept_answer(&self, answer: SignalPayload) -> Result<()> {
        let answer: RTCSessionDescription = serde_json::from_value(answer.into_value())?;
        self.peer_connection.set_remote_description(answer).await?;
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: MediaKind,
        track: Option<Arc<TrackLocalStaticSample>>,
    ) -> Result<()> {
        let Some(sender) = self.senders.get(&kind) else {
            debug!(kind = %kind, "no sender for track kind, nothing to replace");
            return Ok(());
        };
        sender
            .replace_track(track.map(|t| t as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}
