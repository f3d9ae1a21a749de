//! Peer connection seam
//!
//! The orchestrator drives connections through the [`ConnectionHandle`]
//! trait so the escalation ladder can be exercised without networking.
//! [`RtcConnectionFactory`] is the production implementation over
//! `webrtc-rs`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use lockstep_core::{Error, IceCandidate, Result, SdpKind, SessionDescription};

use crate::ice::{RtcIceConfig, TransportPolicy};
use crate::media::LocalMedia;

/// Connection lifecycle state as seen by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSessionState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Hooks a connection fires into the orchestrator. Each connection is
/// created for one remote peer, so the orchestrator closes over the peer id.
#[derive(Clone)]
pub struct ConnectionHooks {
    /// A local network candidate was produced and must go out via the relay
    pub on_local_candidate: Arc<dyn Fn(IceCandidate) + Send + Sync>,
    /// Underlying connection state changed
    pub on_state_change: Arc<dyn Fn(PeerSessionState) + Send + Sync>,
    /// Remote media arrived; the argument is the track kind
    pub on_media: Arc<dyn Fn(String) + Send + Sync>,
}

impl ConnectionHooks {
    /// Hooks that drop everything, for connections nobody observes
    #[must_use]
    pub fn noop() -> Self {
        Self {
            on_local_candidate: Arc::new(|_| {}),
            on_state_change: Arc::new(|_| {}),
            on_media: Arc::new(|_| {}),
        }
    }
}

/// One underlying peer connection
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Create an offer and install it as the local description
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    /// Create an answer and install it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach local tracks; must happen before the first offer
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()>;

    /// Whether the signaling state machine is stable (no exchange mid-flight)
    fn signaling_stable(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Creates connections for a resolved ICE configuration
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: RtcIceConfig,
        hooks: ConnectionHooks,
    ) -> Result<Arc<dyn ConnectionHandle>>;
}

fn rtc_err(err: webrtc::Error) -> Error {
    Error::NegotiationFailed(err.to_string())
}

const fn map_state(state: RTCPeerConnectionState) -> PeerSessionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerSessionState::New,
        RTCPeerConnectionState::Connecting => PeerSessionState::Negotiating,
        RTCPeerConnectionState::Connected => PeerSessionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerSessionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerSessionState::Failed,
        RTCPeerConnectionState::Closed => PeerSessionState::Closed,
    }
}

/// Production connection over `webrtc-rs`
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl ConnectionHandle for RtcConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self.pc.create_offer(options).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<()> {
        let description = match sdp.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.sdp).map_err(rtc_err)?,
            SdpKind::Answer => RTCSessionDescription::answer(sdp.sdp).map_err(rtc_err)?,
        };
        self.pc
            .set_remote_description(description)
            .await
            .map_err(rtc_err)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(rtc_err)
    }

    async fn add_local_media(&self, media: &LocalMedia) -> Result<()> {
        for track in media.tracks() {
            self.pc.add_track(track).await.map_err(rtc_err)?;
        }
        Ok(())
    }

    fn signaling_stable(&self) -> bool {
        self.pc.signaling_state() == RTCSignalingState::Stable
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(rtc_err)
    }
}

/// Builds `webrtc-rs` connections with default codecs and interceptors
pub struct RtcConnectionFactory;

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(
        &self,
        config: RtcIceConfig,
        hooks: ConnectionHooks,
    ) -> Result<Arc<dyn ConnectionHandle>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_transport_policy: match config.policy {
                TransportPolicy::All => RTCIceTransportPolicy::All,
                TransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(rtc_err)?,
        );

        let candidate_hook = hooks.on_local_candidate.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_hook = candidate_hook.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => candidate_hook(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let state_hook = hooks.on_state_change.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state_hook = state_hook.clone();
            Box::pin(async move {
                state_hook(map_state(state));
            })
        }));

        let media_hook = hooks.on_media.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let media_hook = media_hook.clone();
                Box::pin(async move {
                    media_hook(track.kind().to_string());
                })
            },
        ));

        Ok(Arc::new(RtcConnection { pc }))
    }
}
