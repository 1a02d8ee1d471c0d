//! Peer collaborator backed by the `webrtc` crate. The server only ever
//! answers: it receives the browser's audio track and reports its lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::envelope::{IceCandidate, SdpKind, SessionDescription};
use crate::error::CollaboratorError;
use crate::peer::{PeerConnector, PeerEventKind, PeerEventSink, PeerSession};

pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, CollaboratorError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|err| CollaboratorError::Setup(err.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|err| CollaboratorError::Setup(err.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
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
    async fn connect(
        &self,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerSession>, CollaboratorError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(|err| CollaboratorError::Setup(err.to_string()))?,
        );

        let candidate_sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(context = %sink.key(), "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }))
                        .await;
                    }
                    Err(err) => warn!(context = %sink.key(), error = %err, "unserializable local candidate"),
                }
            })
        }));

        let state_sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                debug!(context = %sink.key(), state = %state, "peer connection state changed");
                if state == RTCPeerConnectionState::Failed {
                    sink.emit(PeerEventKind::Failed("peer connection failed".into()))
                        .await;
                }
            })
        }));

        let track_sink = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = track_sink.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    debug!(context = %sink.key(), kind = %track.kind(), "ignoring non-audio track");
                    return;
                }
                info!(
                    context = %sink.key(),
                    ssrc = track.ssrc(),
                    "remote audio track received"
                );
                sink.emit(PeerEventKind::TrackStarted).await;
                tokio::spawn(async move {
                    let mut packets = 0u64;
                    while track.read_rtp().await.is_ok() {
                        packets += 1;
                    }
                    debug!(context = %sink.key(), packets, "remote audio track drained");
                    sink.emit(PeerEventKind::TrackEnded).await;
                });
            })
        }));

        Ok(Box::new(WebRtcSession { pc }))
    }
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, CollaboratorError> {
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    converted.map_err(|err| CollaboratorError::Description(err.to_string()))
}

#[async_trait]
impl PeerSession for WebRtcSession {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CollaboratorError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|err| CollaboratorError::Description(err.to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CollaboratorError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| CollaboratorError::Description(err.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CollaboratorError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|err| CollaboratorError::Description(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CollaboratorError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| CollaboratorError::Candidate(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "peer connection close reported an error");
        }
    }
}
