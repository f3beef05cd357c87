//! webrtc-rs implementation of the media-stack seam.
//!
//! One shared `API` (media engine + default interceptors) serves every peer
//! connection. Outbound tracks are `TrackLocalStaticRTP`: the engine hands
//! them fully rewritten RTP bytes and the stack paces and encrypts them.
//! Each sender's RTCP stream is drained — required for the interceptors —
//! and PLI/FIR found there feed the engine's keyframe solicitation.

use std::sync::Arc;

use async_trait::async_trait;
use lancast_protocol::IceConfig;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::error::EngineError;
use crate::stack::{CandidateInit, IceLinkState, MediaStack, PeerHandlers, PeerLink, RtpSink,
                   TrackSpec};

pub struct WebRtcStack {
    api: API,
}

impl WebRtcStack {
    pub fn new() -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // Interceptors provide NACK/RTCP handling; without the registry each
        // peer connection would need manual wiring.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(Self {
            api: APIBuilder::new()
                .with_media_engine(media_engine)
                .with_interceptor_registry(registry)
                .build(),
        })
    }
}

#[async_trait]
impl MediaStack for WebRtcStack {
    async fn create_peer(
        &self,
        ice: &IceConfig,
        handlers: PeerHandlers,
    ) -> Result<Arc<dyn PeerLink>, EngineError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers(ice),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| EngineError::Stack(e.into()))?,
        );

        let PeerHandlers {
            on_ice_candidate,
            on_ice_state,
            on_keyframe_request,
        } = handlers;

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(json) => on_ice_candidate(CandidateInit {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                    }),
                    Err(err) => warn!("failed to serialize ICE candidate: {err}"),
                }
            }
            Box::pin(async {})
        }));

        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            if let Some(mapped) = map_ice_state(state) {
                on_ice_state(mapped);
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeer {
            pc,
            on_keyframe_request: Arc::from(on_keyframe_request),
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    on_keyframe_request: Arc<dyn Fn() + Send + Sync>,
}

#[async_trait]
impl PeerLink for WebRtcPeer {
    async fn add_sendonly_track(&self, spec: &TrackSpec) -> Result<Arc<dyn RtpSink>, EngineError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: spec.mime_type.clone(),
                clock_rate: spec.clock_rate,
                channels: spec.channels,
                ..Default::default()
            },
            spec.track_id.clone(),
            spec.stream_id.clone(),
        ));

        // The subscriber offers recvonly m-lines; pairing our track against
        // them makes the answered direction sendonly.
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::Stack(e.into()))?;

        // Drain sender RTCP (the interceptors need the reads). PLI/FIR from
        // the subscriber cannot be answered locally — the relay never
        // decodes — so they become upstream keyframe requests.
        let on_keyframe = Arc::clone(&self.on_keyframe_request);
        let track_id = spec.track_id.clone();
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                for packet in &packets {
                    let any = packet.as_any();
                    if any.is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                        || any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                    {
                        debug!(track_id = %track_id, "PLI/FIR from subscriber");
                        on_keyframe();
                    }
                }
            }
        });

        Ok(Arc::new(WebRtcSink { track }))
    }

    async fn apply_remote_offer(&self, sdp: &str) -> Result<(), EngineError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| EngineError::SdpRejected(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| EngineError::SdpRejected(e.to_string()))
    }

    async fn create_answer(&self) -> Result<String, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::SdpRejected(e.to_string()))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| EngineError::SdpRejected(e.to_string()))?;

        // Non-trickle answer: wait for gathering so the SDP carries the
        // candidates. Trickled candidates still flow for later additions.
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        let _ = gather_complete.recv().await;

        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| {
                EngineError::IceSetupFailed("no local description after gathering".into())
            })
    }

    async fn create_offer(&self) -> Result<String, EngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::SdpRejected(e.to_string()))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| EngineError::SdpRejected(e.to_string()))?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        let _ = gather_complete.recv().await;

        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| {
                EngineError::IceSetupFailed("no local description after gathering".into())
            })
    }

    async fn apply_remote_answer(&self, sdp: &str) -> Result<(), EngineError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| EngineError::SdpRejected(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| EngineError::SdpRejected(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::Stack(e.into()))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            warn!("failed to close peer connection: {err}");
        }
    }
}

struct WebRtcSink {
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl RtpSink for WebRtcSink {
    async fn write_rtp(&self, packet: &[u8]) -> Result<(), EngineError> {
        // TrackLocalWriter::write parses the bytes and fans them to every
        // bound sender; zero bindings (pre-negotiation) is not an error.
        self.track
            .write(packet)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Stack(e.into()))
    }
}

fn ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = vec![RTCIceServer {
        urls: config.stun_urls.clone(),
        ..Default::default()
    }];
    if !config.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.turn_urls.clone(),
            username: config.turn_username.clone().unwrap_or_default(),
            credential: config.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceLinkState> {
    match state {
        RTCIceConnectionState::New => Some(IceLinkState::New),
        RTCIceConnectionState::Checking => Some(IceLinkState::Checking),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(IceLinkState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(IceLinkState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceLinkState::Failed),
        RTCIceConnectionState::Closed => Some(IceLinkState::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}
