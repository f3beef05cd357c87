//! lancast-core
//!
//! An embedded LAN micro-SFU. One peer per room — the elected *relay* —
//! terminates the upstream media connection and fans its RTP out, byte for
//! byte, over WebRTC peer connections to every other device on the local
//! network. Any peer can temporarily replace the upstream stream with a
//! locally produced share; per-subscriber header rewriting keeps the switch
//! invisible to downstream decoders (stable SSRC, contiguous sequence
//! numbers, monotonic timestamps), so no renegotiation is needed.
//!
//! The embedder owns the signalling transport and the media sources. It
//! feeds inbound signalling envelopes and RTP into a [`RoomHandle`], and
//! consumes [`RelayEvent`]s — outbound signalling, state changes, keyframe
//! requests — from the event channel returned by [`RelayEngine::new`].
//!
//! Relay election runs by score (device class, link, power, optional
//! network metrics) with deterministic `(epoch, score, peerId)` arbitration,
//! and fails over automatically when the relay stops answering pings.

pub mod coordinator;
pub mod error;
pub mod events;
pub mod failover;
pub mod jitter;
pub mod keepalive;
pub mod pool;
pub mod registry;
pub mod room;
pub mod score;
pub mod stack;
pub mod switcher;
pub mod webrtc_stack;

use std::collections::HashMap;
use std::sync::Arc;

use lancast_protocol::{DeviceProfile, NetMetrics, RelayConfig, SignalEnvelope};
use tokio::sync::RwLock as AsyncRwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::warn;

use crate::coordinator::{Command, Coordinator, Msg};
use crate::room::RelayRoom;
use crate::webrtc_stack::WebRtcStack;

pub use crate::coordinator::{EngineStatus, PeerStatus};
pub use crate::error::EngineError;
pub use crate::events::{LeaveCause, RelayEvent};
pub use crate::failover::Phase;
pub use crate::keepalive::Liveness;
pub use crate::room::{RoomStatus, SubscriberStatus};
pub use crate::stack::{CandidateInit, IceLinkState, MediaKind, MediaStack, PeerLink, RtpSink};
pub use crate::switcher::LaneKind;

/// Engine facade: owns the rooms and the shared media stack.
pub struct RelayEngine {
    stack: Arc<dyn MediaStack>,
    config: RelayConfig,
    rooms: AsyncRwLock<HashMap<String, RoomHandle>>,
    events: UnboundedSender<RelayEvent>,
}

impl RelayEngine {
    /// Build an engine over an explicit media stack. Fails when the
    /// configuration carries `ERROR:` issues; `WARNING:`s are logged.
    pub fn new(
        stack: Arc<dyn MediaStack>,
        config: RelayConfig,
    ) -> anyhow::Result<(Arc<Self>, UnboundedReceiver<RelayEvent>)> {
        if let Err(issues) = config.validate() {
            let mut fatal = false;
            for issue in &issues {
                if issue.starts_with("ERROR:") {
                    fatal = true;
                }
                warn!("config: {issue}");
            }
            if fatal {
                anyhow::bail!("invalid configuration:\n{}", issues.join("\n"));
            }
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            stack,
            config,
            rooms: AsyncRwLock::new(HashMap::new()),
            events: events_tx,
        });
        Ok((engine, events_rx))
    }

    /// Build an engine over the bundled webrtc-rs stack.
    pub fn with_webrtc(
        config: RelayConfig,
    ) -> anyhow::Result<(Arc<Self>, UnboundedReceiver<RelayEvent>)> {
        let stack = Arc::new(WebRtcStack::new()?);
        Self::new(stack, config)
    }

    /// Create a room and its coordination actor. Double-creation of a room
    /// id is a programmer error and fails fast.
    pub async fn create_room(
        &self,
        room_id: &str,
        local_peer_id: &str,
    ) -> Result<RoomHandle, EngineError> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(room_id) {
            return Err(EngineError::RoomExists(room_id.to_string()));
        }

        let (room_tx, room_rx) = mpsc::unbounded_channel();
        let room = RelayRoom::new(room_id, self.config.clone(), self.stack.clone(), room_tx);
        let msg_tx = Coordinator::spawn(
            room_id,
            local_peer_id,
            self.config.clone(),
            room.clone(),
            room_rx,
            self.events.clone(),
        );

        let handle = RoomHandle {
            room_id: room_id.to_string(),
            local_peer_id: local_peer_id.to_string(),
            room,
            msg_tx,
        };
        rooms.insert(room_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Tear a room down: coordinator stops, subscribers close, state drops.
    pub async fn destroy_room(&self, room_id: &str) -> Result<(), EngineError> {
        let handle = self
            .rooms
            .write()
            .await
            .remove(room_id)
            .ok_or_else(|| EngineError::UnknownRoom(room_id.to_string()))?;
        let _ = handle.msg_tx.send(Msg::Command(Command::Shutdown));
        // The actor also closes the room, but only after it drains its
        // queue; closing here makes teardown observable to the caller.
        handle.room.close().await;
        Ok(())
    }

    pub async fn room(&self, room_id: &str) -> Result<RoomHandle, EngineError> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRoom(room_id.to_string()))
    }

    pub async fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Embedder-facing handle for one room. Control calls route through the
/// room's coordination actor; ingress goes straight to the data plane and
/// never takes the coordinator's queue.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    local_peer_id: String,
    room: Arc<RelayRoom>,
    msg_tx: UnboundedSender<Msg>,
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", &self.room_id)
            .field("local_peer_id", &self.local_peer_id)
            .finish()
    }
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    fn command(&self, command: Command) {
        let _ = self.msg_tx.send(Msg::Command(command));
    }

    /// Feed one inbound signalling envelope to the coordinator.
    pub fn handle_signal(&self, envelope: SignalEnvelope) {
        self.command(Command::Signal(envelope));
    }

    /// Start auto-coordination: keepalive, join broadcast, first election.
    pub fn enable(&self) {
        self.command(Command::Enable);
    }

    /// Stop auto-coordination; the room itself stays usable.
    pub fn disable(&self) {
        self.command(Command::Disable);
    }

    pub fn add_peer(&self, peer_id: &str, profile: DeviceProfile) {
        self.command(Command::AddPeer {
            peer_id: peer_id.to_string(),
            profile,
        });
    }

    pub fn remove_peer(&self, peer_id: &str) {
        self.command(Command::RemovePeer {
            peer_id: peer_id.to_string(),
        });
    }

    pub fn handle_pong(&self, peer_id: &str) {
        self.command(Command::HandlePong {
            peer_id: peer_id.to_string(),
        });
    }

    pub fn update_local_device(&self, profile: DeviceProfile, net: Option<NetMetrics>) {
        self.command(Command::UpdateLocalDevice { profile, net });
    }

    /// Consistent status snapshot assembled by the coordination actor.
    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Status { reply });
        rx.await.map_err(|_| EngineError::RoomClosed)
    }

    /// Mark this node as publisher without waiting for an election (e.g.
    /// when the embedder already knows who the relay is).
    pub fn become_relay(&self) {
        self.room.become_relay(&self.local_peer_id);
    }

    /// Create a subscriber from its offer; returns the answer SDP.
    pub async fn add_subscriber(
        &self,
        peer_id: &str,
        offer_sdp: &str,
    ) -> Result<String, EngineError> {
        self.room.add_subscriber(peer_id, offer_sdp).await
    }

    pub async fn remove_subscriber(&self, peer_id: &str) {
        self.room
            .remove_subscriber(peer_id, LeaveCause::Removed)
            .await;
    }

    pub async fn add_ice_candidate(
        &self,
        peer_id: &str,
        candidate: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) {
        self.room
            .add_ice_candidate(
                peer_id,
                CandidateInit {
                    candidate: candidate.to_string(),
                    sdp_mid,
                    sdp_mline_index,
                },
            )
            .await;
    }

    /// Fresh offers for every subscriber, keyed by peer id.
    pub async fn trigger_renegotiation(&self) -> HashMap<String, String> {
        self.room.trigger_renegotiation().await
    }

    pub async fn handle_answer(&self, peer_id: &str, answer_sdp: &str) {
        self.room.handle_answer(peer_id, answer_sdp).await;
    }

    /// Ask the upstream source for a keyframe (rate limited per room).
    pub fn request_keyframe(&self) {
        self.room.request_keyframe();
    }

    /// Activate the LOCAL ingress lane for `sharer_peer_id`.
    pub fn start_local_share(&self, sharer_peer_id: &str) {
        self.room.start_local_share(sharer_peer_id);
    }

    /// Return to the SFU ingress lane.
    pub fn stop_local_share(&self) {
        self.room.stop_local_share();
    }

    /// Push one RTP packet from the cloud bridge.
    pub async fn inject_sfu(&self, is_video: bool, payload: &[u8]) {
        self.room.inject_sfu(is_video, payload).await;
    }

    /// Push one RTP packet from local capture.
    pub async fn inject_local(&self, is_video: bool, payload: &[u8]) {
        self.room.inject_local(is_video, payload).await;
    }
}
