use lancast_protocol::SignalEnvelope;

use crate::failover::Phase;
use crate::stack::{CandidateInit, IceLinkState, MediaKind};

/// Events the engine emits to the embedder over an unbounded channel.
///
/// `NeedSignalling` carries every outbound signalling datum; the embedder is
/// responsible for putting it on the transport.
#[derive(Debug)]
pub enum RelayEvent {
    StateChanged {
        room_id: String,
        phase: Phase,
    },
    RelayChanged {
        room_id: String,
        relay_id: Option<String>,
        epoch: u64,
    },
    PeerJoined {
        room_id: String,
        peer_id: String,
    },
    PeerLeft {
        room_id: String,
        peer_id: String,
    },
    /// The keepalive wants a ping sent to this peer. The same ping is also
    /// emitted as a `NeedSignalling` envelope.
    PingRequested {
        room_id: String,
        peer_id: String,
    },
    SubscriberJoined {
        room_id: String,
        peer_id: String,
    },
    SubscriberLeft {
        room_id: String,
        peer_id: String,
        cause: LeaveCause,
    },
    /// The upstream source should produce a fresh keyframe (IDR). The relay
    /// cannot generate one itself; the embedder forwards this to the cloud
    /// bridge or local capturer.
    KeyframeRequested {
        room_id: String,
    },
    NeedSignalling(SignalEnvelope),
    Error {
        room_id: String,
        message: String,
    },
}

/// Why a subscriber entry was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveCause {
    /// Explicit removal (remote `leave` or embedder call).
    Removed,
    /// ICE reached `failed`.
    IceFailed,
    /// ICE reached `closed`.
    IceClosed,
    /// The keepalive declared the peer offline.
    LivenessOffline,
    /// Room teardown.
    RoomClosed,
}

/// Events a `RelayRoom` raises towards its coordinator (or, when the room is
/// used standalone, towards the embedder).
#[derive(Debug)]
pub enum RoomEvent {
    SubscriberJoined {
        peer_id: String,
    },
    SubscriberLeft {
        peer_id: String,
        cause: LeaveCause,
    },
    /// Local candidate gathered for this subscriber's connection; trickle it.
    IceCandidate {
        peer_id: String,
        candidate: CandidateInit,
    },
    IceState {
        peer_id: String,
        state: IceLinkState,
    },
    /// The active ingress changed payload type (codec). The rewriter cannot
    /// hide that; every subscriber needs a fresh offer.
    RenegotiationNeeded {
        media: MediaKind,
    },
    KeyframeRequested,
    Error {
        message: String,
    },
}
