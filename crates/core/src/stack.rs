//! Trait seam between the engine and the WebRTC stack.
//!
//! The engine only needs five capabilities from a stack: create a peer
//! connection, add a sendonly track, set local/remote descriptions, add an
//! ICE candidate, and write an RTP packet to a track. Everything else (ICE,
//! DTLS, SRTP, pacing) stays behind these traits, so the engine runs
//! unchanged against webrtc-rs in production and an in-memory stack in tests.

use std::sync::Arc;

use async_trait::async_trait;
use lancast_protocol::IceConfig;

use crate::error::EngineError;

/// Media kind of a track or ingress lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn is_video(self) -> bool {
        matches!(self, Self::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-subscriber ICE transport state, mirroring the WebRTC state machine
/// {new → checking → connected → [disconnected ↔ connected]* → failed|closed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IceLinkState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl IceLinkState {
    /// Terminal states after which a peer connection is never written again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Trickled ICE candidate, stack-agnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Codec and naming parameters for an outbound track.
#[derive(Debug, Clone)]
pub struct TrackSpec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    /// 0 for video
    pub channels: u16,
    pub track_id: String,
    pub stream_id: String,
}

/// Callbacks a peer connection reports through. All are invoked from stack
/// context and must not block.
pub struct PeerHandlers {
    /// A local ICE candidate was gathered and should be trickled out.
    pub on_ice_candidate: Box<dyn Fn(CandidateInit) + Send + Sync>,
    /// The ICE transport changed state.
    pub on_ice_state: Box<dyn Fn(IceLinkState) + Send + Sync>,
    /// The remote side asked for a keyframe (PLI/FIR).
    pub on_keyframe_request: Box<dyn Fn() + Send + Sync>,
}

/// Factory for peer connections.
#[async_trait]
pub trait MediaStack: Send + Sync {
    async fn create_peer(
        &self,
        ice: &IceConfig,
        handlers: PeerHandlers,
    ) -> Result<Arc<dyn PeerLink>, EngineError>;
}

/// One peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Add a sendonly track; returns the sink RTP packets are written to.
    async fn add_sendonly_track(&self, spec: &TrackSpec) -> Result<Arc<dyn RtpSink>, EngineError>;

    /// Apply the remote subscriber's SDP offer.
    async fn apply_remote_offer(&self, sdp: &str) -> Result<(), EngineError>;

    /// Create an answer, install it locally and return it once ICE gathering
    /// permits (gathering complete, or the stack's non-trickle fallback).
    async fn create_answer(&self) -> Result<String, EngineError>;

    /// Create a renegotiation offer and install it locally.
    async fn create_offer(&self) -> Result<String, EngineError>;

    /// Apply the remote answer to a renegotiation offer.
    async fn apply_remote_answer(&self, sdp: &str) -> Result<(), EngineError>;

    /// Add a trickled remote candidate.
    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), EngineError>;

    async fn close(&self);
}

/// Write half of one outbound track.
#[async_trait]
pub trait RtpSink: Send + Sync {
    /// Write one complete RTP packet (header already rewritten).
    async fn write_rtp(&self, packet: &[u8]) -> Result<(), EngineError>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Deterministic in-memory stack used by the engine tests. Records every
    //! packet written per track and lets tests drive ICE transitions and
    //! inject failures.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    pub struct MockStack {
        pub peers: Mutex<Vec<Arc<MockPeer>>>,
        pub fail_create: AtomicBool,
        /// The next created peer rejects its remote offer.
        pub fail_next_offer: AtomicBool,
    }

    impl MockStack {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn peer(&self, index: usize) -> Arc<MockPeer> {
            self.peers.lock().unwrap()[index].clone()
        }

        pub fn last_peer(&self) -> Arc<MockPeer> {
            self.peers.lock().unwrap().last().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaStack for MockStack {
        async fn create_peer(
            &self,
            _ice: &IceConfig,
            handlers: PeerHandlers,
        ) -> Result<Arc<dyn PeerLink>, EngineError> {
            if self.fail_create.load(Ordering::Relaxed) {
                return Err(EngineError::Stack(anyhow::anyhow!(
                    "peer connection factory disabled"
                )));
            }
            let peer = Arc::new(MockPeer {
                handlers: Mutex::new(Some(handlers)),
                sinks: Mutex::new(Vec::new()),
                remote_offers: Mutex::new(Vec::new()),
                remote_answers: Mutex::new(Vec::new()),
                candidates: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                fail_offer: AtomicBool::new(self.fail_next_offer.swap(false, Ordering::Relaxed)),
                fail_answer: AtomicBool::new(false),
            });
            self.peers.lock().unwrap().push(peer.clone());
            Ok(peer)
        }
    }

    pub struct MockPeer {
        handlers: Mutex<Option<PeerHandlers>>,
        pub sinks: Mutex<Vec<Arc<MockSink>>>,
        pub remote_offers: Mutex<Vec<String>>,
        pub remote_answers: Mutex<Vec<String>>,
        pub candidates: Mutex<Vec<CandidateInit>>,
        pub closed: AtomicBool,
        pub fail_offer: AtomicBool,
        pub fail_answer: AtomicBool,
    }

    impl MockPeer {
        /// Drive the ICE state machine from a test.
        pub fn set_ice_state(&self, state: IceLinkState) {
            let guard = self.handlers.lock().unwrap();
            if let Some(handlers) = guard.as_ref() {
                (handlers.on_ice_state)(state);
            }
        }

        /// Surface a gathered local candidate from a test.
        pub fn emit_candidate(&self, candidate: CandidateInit) {
            let guard = self.handlers.lock().unwrap();
            if let Some(handlers) = guard.as_ref() {
                (handlers.on_ice_candidate)(candidate);
            }
        }

        /// Surface a remote PLI/FIR from a test.
        pub fn request_keyframe(&self) {
            let guard = self.handlers.lock().unwrap();
            if let Some(handlers) = guard.as_ref() {
                (handlers.on_keyframe_request)();
            }
        }

        pub fn sink(&self, kind: MediaKind) -> Arc<MockSink> {
            self.sinks
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.kind == kind)
                .cloned()
                .unwrap()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl PeerLink for MockPeer {
        async fn add_sendonly_track(
            &self,
            spec: &TrackSpec,
        ) -> Result<Arc<dyn RtpSink>, EngineError> {
            let sink = Arc::new(MockSink {
                kind: spec.kind,
                track_id: spec.track_id.clone(),
                written: Mutex::new(Vec::new()),
                fail_writes: AtomicBool::new(false),
            });
            self.sinks.lock().unwrap().push(sink.clone());
            Ok(sink)
        }

        async fn apply_remote_offer(&self, sdp: &str) -> Result<(), EngineError> {
            if self.fail_offer.load(Ordering::Relaxed) {
                return Err(EngineError::SdpRejected("mock rejection".into()));
            }
            self.remote_offers.lock().unwrap().push(sdp.to_string());
            Ok(())
        }

        async fn create_answer(&self) -> Result<String, EngineError> {
            if self.fail_answer.load(Ordering::Relaxed) {
                return Err(EngineError::IceSetupFailed("mock gathering failure".into()));
            }
            Ok("v=0\r\nmock-answer".to_string())
        }

        async fn create_offer(&self) -> Result<String, EngineError> {
            Ok("v=0\r\nmock-offer".to_string())
        }

        async fn apply_remote_answer(&self, sdp: &str) -> Result<(), EngineError> {
            self.remote_answers.lock().unwrap().push(sdp.to_string());
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), EngineError> {
            self.candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    pub struct MockSink {
        pub kind: MediaKind,
        pub track_id: String,
        pub written: Mutex<Vec<Vec<u8>>>,
        pub fail_writes: AtomicBool,
    }

    impl MockSink {
        pub fn packets(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }

        pub fn packet_count(&self) -> usize {
            self.written.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RtpSink for MockSink {
        async fn write_rtp(&self, packet: &[u8]) -> Result<(), EngineError> {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(EngineError::Stack(anyhow::anyhow!("mock write failure")));
            }
            self.written.lock().unwrap().push(packet.to_vec());
            Ok(())
        }
    }
}
