//! Per-room coordination actor.
//!
//! One task per room processes one message at a time from a single queue:
//! embedder commands, inbound signalling, room events, keepalive ticks, and
//! election timeouts (timers are messages — a stale timeout generation is
//! simply ignored). Everything that mutates Failover or Keepalive state runs
//! here, so signalling- and liveness-induced transitions are totally
//! ordered. RTP injection never enters this queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lancast_protocol::{DeviceProfile, NetMetrics, RelayConfig, SignalEnvelope, SignalPayload};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::events::{LeaveCause, RelayEvent, RoomEvent};
use crate::failover::{Failover, FailoverAction, Phase};
use crate::keepalive::{Keepalive, KeepaliveEvent, Liveness};
use crate::room::{RelayRoom, RoomStatus};
use crate::score::score;
use crate::stack::CandidateInit;
use crate::switcher::LaneKind;

/// Embedder-facing commands, wrapped by `RoomHandle`.
#[derive(Debug)]
pub(crate) enum Command {
    Signal(SignalEnvelope),
    Enable,
    Disable,
    AddPeer {
        peer_id: String,
        profile: DeviceProfile,
    },
    RemovePeer {
        peer_id: String,
    },
    HandlePong {
        peer_id: String,
    },
    UpdateLocalDevice {
        profile: DeviceProfile,
        net: Option<NetMetrics>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Msg {
    Command(Command),
    ElectionTimeout { generation: u64 },
}

/// Coordinator-level status, the §6 `getStatus` shape.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub room_id: String,
    pub local_peer_id: String,
    pub state: Phase,
    pub relay_id: Option<String>,
    pub epoch: u64,
    pub local_score: f64,
    pub subscriber_count: usize,
    pub active_lane: LaneKind,
    pub sharer_id: Option<String>,
    /// Outbound bitrate estimate (EMA over keepalive ticks)
    pub bitrate_bps: u64,
    pub peers: Vec<PeerStatus>,
    pub room: RoomStatus,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub peer_id: String,
    pub profile: DeviceProfile,
    /// Last score observed for the peer (profile-derived, refreshed by its
    /// claims)
    pub score: f64,
    pub liveness: Liveness,
    pub rtt_ms: Option<u64>,
}

struct PeerInfo {
    profile: DeviceProfile,
    score: f64,
}

struct BitrateEstimator {
    last_bytes: u64,
    last_at: Instant,
    ema_bps: f64,
}

impl BitrateEstimator {
    fn update(&mut self, total_bytes: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let bits = total_bytes.saturating_sub(self.last_bytes) as f64 * 8.0;
        let instant_bps = bits / elapsed;
        self.ema_bps = self.ema_bps * 0.7 + instant_bps * 0.3;
        self.last_bytes = total_bytes;
        self.last_at = now;
    }
}

pub(crate) struct Coordinator {
    room_id: String,
    local_peer: String,
    config: RelayConfig,
    room: Arc<RelayRoom>,
    keepalive: Keepalive,
    failover: Failover,
    peers: HashMap<String, PeerInfo>,
    local_profile: DeviceProfile,
    local_net: Option<NetMetrics>,
    events: UnboundedSender<RelayEvent>,
    msg_tx: UnboundedSender<Msg>,
    enabled: bool,
    bitrate: BitrateEstimator,
}

impl Coordinator {
    /// Spawn the actor; the returned sender is its only input.
    pub(crate) fn spawn(
        room_id: &str,
        local_peer: &str,
        config: RelayConfig,
        room: Arc<RelayRoom>,
        room_rx: UnboundedReceiver<RoomEvent>,
        events: UnboundedSender<RelayEvent>,
    ) -> UnboundedSender<Msg> {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            room_id: room_id.to_string(),
            local_peer: local_peer.to_string(),
            keepalive: Keepalive::new(config.keepalive.clone()),
            failover: Failover::new(local_peer),
            config,
            room,
            peers: HashMap::new(),
            local_profile: DeviceProfile::default(),
            local_net: None,
            events,
            msg_tx: msg_tx.clone(),
            enabled: false,
            bitrate: BitrateEstimator {
                last_bytes: 0,
                last_at: Instant::now(),
                ema_bps: 0.0,
            },
        };
        tokio::spawn(coordinator.run(msg_rx, room_rx));
        msg_tx
    }

    async fn run(
        mut self,
        mut msg_rx: UnboundedReceiver<Msg>,
        mut room_rx: UnboundedReceiver<RoomEvent>,
    ) {
        let mut tick = tokio::time::interval(self.keepalive.interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut room_open = true;

        loop {
            tokio::select! {
                msg = msg_rx.recv() => match msg {
                    None => {
                        self.shutdown().await;
                        break;
                    }
                    Some(Msg::Command(Command::Shutdown)) => {
                        self.shutdown().await;
                        break;
                    }
                    Some(Msg::Command(command)) => self.handle_command(command).await,
                    Some(Msg::ElectionTimeout { generation }) => {
                        let actions = self.failover.on_election_timeout(generation);
                        self.apply(actions).await;
                    }
                },
                event = room_rx.recv(), if room_open => match event {
                    None => room_open = false,
                    Some(event) => self.handle_room_event(event).await,
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }
        info!(room_id = %self.room_id, "coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Signal(envelope) => self.handle_signal(envelope).await,
            Command::Enable => self.enable().await,
            Command::Disable => self.disable().await,
            Command::AddPeer { peer_id, profile } => self.on_join(&peer_id, profile),
            Command::RemovePeer { peer_id } => self.on_leave(&peer_id).await,
            Command::HandlePong { peer_id } => {
                let events = self.keepalive.handle_pong(&peer_id, Instant::now());
                self.process_keepalive_events(events).await;
            }
            Command::UpdateLocalDevice { profile, net } => {
                self.local_profile = profile;
                self.local_net = net;
                let local_score = score(&profile, net.as_ref(), &self.config.election);
                self.failover.set_local_score(local_score);
                debug!(room_id = %self.room_id, local_score, "local device updated");
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status().await);
            }
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// §4.7 startup sequence: keepalive on, local score installed, `join`
    /// broadcast, idle → electing with the longer initial timer.
    async fn enable(&mut self) {
        if self.enabled {
            return;
        }
        self.enabled = true;
        self.keepalive.start();
        let local_score = score(
            &self.local_profile,
            self.local_net.as_ref(),
            &self.config.election,
        );
        self.failover.set_local_score(local_score);

        self.send_signal(SignalPayload::Join(self.local_profile), None);
        let connecting = self.failover.mark_connecting();
        self.apply(connecting).await;
        let electing = self.failover.start_election();
        self.apply(electing).await;
        info!(room_id = %self.room_id, local_score, "coordinator enabled");
    }

    async fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        self.keepalive.stop();
        self.send_signal(SignalPayload::Leave, None);
        self.room.resign_relay();
        let actions = self.failover.reset();
        self.apply(actions).await;
        info!(room_id = %self.room_id, "coordinator disabled");
    }

    /// §4.7 shutdown sequence: stop timers, close subscribers, emit `leave`.
    async fn shutdown(&mut self) {
        self.keepalive.stop();
        if self.enabled {
            self.enabled = false;
            self.send_signal(SignalPayload::Leave, None);
        }
        let actions = self.failover.reset();
        self.apply(actions).await;
        self.room.close().await;
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        if envelope.room_id != self.room_id {
            warn!(room_id = %self.room_id, theirs = %envelope.room_id, "signal for foreign room dropped");
            return;
        }
        // Broadcast transports may loop our own messages back
        if envelope.peer_id == self.local_peer {
            return;
        }
        if !envelope.targets(&self.local_peer) {
            return;
        }

        let from = envelope.peer_id;
        match envelope.payload {
            SignalPayload::Join(profile) => self.on_join(&from, profile),
            SignalPayload::Leave => self.on_leave(&from).await,
            SignalPayload::Ping => {
                self.send_signal(SignalPayload::Pong, Some(&from));
            }
            SignalPayload::Pong => {
                let events = self.keepalive.handle_pong(&from, Instant::now());
                self.process_keepalive_events(events).await;
            }
            SignalPayload::RelayClaim { epoch, score } => {
                self.ensure_tracked(&from, score);
                if let Some(info) = self.peers.get_mut(&from) {
                    info.score = score;
                }
                let actions = self.failover.on_remote_claim(&from, epoch, score);
                self.apply(actions).await;
            }
            SignalPayload::RelayChanged {
                relay_id,
                epoch,
                score,
            } => {
                self.ensure_tracked(&relay_id, score);
                let actions = self.failover.on_relay_changed(&from, &relay_id, epoch, score);
                self.apply(actions).await;
            }
            SignalPayload::Offer { sdp } => self.on_offer(&from, &sdp).await,
            SignalPayload::Answer { sdp } => {
                if self.room.is_relay() {
                    self.room.handle_answer(&from, &sdp).await;
                }
            }
            SignalPayload::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                if self.room.is_relay() {
                    self.room
                        .add_ice_candidate(
                            &from,
                            CandidateInit {
                                candidate,
                                sdp_mid,
                                sdp_mline_index,
                            },
                        )
                        .await;
                }
            }
        }
    }

    /// Track a peer first observed through an election message rather than
    /// a `join` (a late joiner learns the sitting relay this way). Its
    /// liveness matters — it may be the relay — so the keepalive must watch
    /// it even though its device profile is unknown.
    fn ensure_tracked(&mut self, peer_id: &str, observed_score: f64) {
        if peer_id == self.local_peer || self.peers.contains_key(peer_id) {
            return;
        }
        self.keepalive.add_peer(peer_id);
        self.peers.insert(
            peer_id.to_string(),
            PeerInfo {
                profile: DeviceProfile::default(),
                score: observed_score,
            },
        );
        let _ = self.events.send(RelayEvent::PeerJoined {
            room_id: self.room_id.clone(),
            peer_id: peer_id.to_string(),
        });
    }

    fn on_join(&mut self, peer_id: &str, profile: DeviceProfile) {
        let peer_score = score(&profile, None, &self.config.election);
        self.keepalive.add_peer(peer_id);
        let known = self
            .peers
            .insert(
                peer_id.to_string(),
                PeerInfo {
                    profile,
                    score: peer_score,
                },
            )
            .is_some();
        if !known {
            let _ = self.events.send(RelayEvent::PeerJoined {
                room_id: self.room_id.clone(),
                peer_id: peer_id.to_string(),
            });
        }
        // A late joiner must not start a needless election
        if let Some(announcement) = self.failover.current_announcement() {
            self.send_signal(announcement, Some(peer_id));
        }
        debug!(room_id = %self.room_id, %peer_id, peer_score, "peer joined");
    }

    async fn on_leave(&mut self, peer_id: &str) {
        self.keepalive.remove_peer(peer_id);
        if self.peers.remove(peer_id).is_some() {
            let _ = self.events.send(RelayEvent::PeerLeft {
                room_id: self.room_id.clone(),
                peer_id: peer_id.to_string(),
            });
        }
        self.room
            .remove_subscriber(peer_id, LeaveCause::Removed)
            .await;
        if self.failover.current_relay() == Some(peer_id) {
            let actions = self.failover.on_relay_offline();
            self.apply(actions).await;
        }
    }

    async fn on_offer(&mut self, from: &str, sdp: &str) {
        if !self.room.is_relay() {
            debug!(room_id = %self.room_id, %from, "offer ignored: not relay");
            return;
        }
        match self.room.add_subscriber(from, sdp).await {
            Ok(answer) => {
                self.send_signal(SignalPayload::Answer { sdp: answer }, Some(from));
            }
            Err(EngineError::AlreadyExists(_)) => {
                warn!(room_id = %self.room_id, %from, "duplicate offer dropped");
            }
            Err(err @ EngineError::Stack(_)) => {
                // Peer connections cannot be created at all (e.g. the ICE
                // configuration was rejected). Only a restart recovers.
                warn!(room_id = %self.room_id, %from, "peer connection factory failed: {err}");
                let actions = self.failover.on_fatal();
                self.apply(actions).await;
                let _ = self.events.send(RelayEvent::Error {
                    room_id: self.room_id.clone(),
                    message: format!("subscriber {from}: {err}"),
                });
            }
            Err(err) => {
                warn!(room_id = %self.room_id, %from, "subscriber setup failed: {err}");
                let _ = self.events.send(RelayEvent::Error {
                    room_id: self.room_id.clone(),
                    message: format!("subscriber {from}: {err}"),
                });
            }
        }
    }

    async fn handle_room_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::SubscriberJoined { peer_id } => {
                let _ = self.events.send(RelayEvent::SubscriberJoined {
                    room_id: self.room_id.clone(),
                    peer_id,
                });
            }
            RoomEvent::SubscriberLeft { peer_id, cause } => {
                let _ = self.events.send(RelayEvent::SubscriberLeft {
                    room_id: self.room_id.clone(),
                    peer_id,
                    cause,
                });
            }
            RoomEvent::IceCandidate { peer_id, candidate } => {
                self.send_signal(
                    SignalPayload::Candidate {
                        candidate: candidate.candidate,
                        sdp_mid: candidate.sdp_mid,
                        sdp_mline_index: candidate.sdp_mline_index,
                    },
                    Some(&peer_id),
                );
            }
            RoomEvent::IceState { peer_id, state } => {
                debug!(room_id = %self.room_id, %peer_id, ?state, "subscriber ICE state");
            }
            RoomEvent::RenegotiationNeeded { media } => {
                info!(room_id = %self.room_id, %media, "ingress topology changed, renegotiating");
                let offers = self.room.trigger_renegotiation().await;
                for (peer_id, sdp) in offers {
                    self.send_signal(SignalPayload::Offer { sdp }, Some(&peer_id));
                }
            }
            RoomEvent::KeyframeRequested => {
                let _ = self.events.send(RelayEvent::KeyframeRequested {
                    room_id: self.room_id.clone(),
                });
            }
            RoomEvent::Error { message } => {
                let actions = self.failover.on_fatal();
                self.apply(actions).await;
                let _ = self.events.send(RelayEvent::Error {
                    room_id: self.room_id.clone(),
                    message,
                });
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let events = self.keepalive.tick(now);
        self.process_keepalive_events(events).await;
        self.room.switcher().drain_jitter(now).await;
        self.bitrate.update(self.room.total_bytes_out(), now);
    }

    async fn process_keepalive_events(&mut self, events: Vec<KeepaliveEvent>) {
        for event in events {
            match event {
                KeepaliveEvent::PingRequested(peer_id) => {
                    let _ = self.events.send(RelayEvent::PingRequested {
                        room_id: self.room_id.clone(),
                        peer_id: peer_id.clone(),
                    });
                    self.send_signal(SignalPayload::Ping, Some(&peer_id));
                }
                KeepaliveEvent::PeerOnline(peer_id) => {
                    debug!(room_id = %self.room_id, %peer_id, "peer online");
                }
                KeepaliveEvent::PeerSlow(peer_id) => {
                    debug!(room_id = %self.room_id, %peer_id, "peer slow");
                }
                KeepaliveEvent::PeerOffline(peer_id) => {
                    info!(room_id = %self.room_id, %peer_id, "peer offline");
                    self.room
                        .remove_subscriber(&peer_id, LeaveCause::LivenessOffline)
                        .await;
                    if self.failover.current_relay() == Some(peer_id.as_str()) {
                        let actions = self.failover.on_relay_offline();
                        self.apply(actions).await;
                    }
                }
            }
        }
    }

    async fn apply(&mut self, actions: Vec<FailoverAction>) {
        for action in actions {
            match action {
                FailoverAction::Send { payload, target } => {
                    self.send_signal(payload, target.as_deref());
                }
                FailoverAction::StartElectionTimer {
                    generation,
                    initial,
                } => {
                    let base = Duration::from_millis(self.config.election.base_timer_ms);
                    let delay = if initial {
                        base * self.config.election.initial_timer_factor
                    } else {
                        base
                    };
                    let tx = self.msg_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(Msg::ElectionTimeout { generation });
                    });
                }
                FailoverAction::BecomeRelay => {
                    self.room.become_relay(&self.local_peer);
                }
                FailoverAction::ResignRelay => self.room.resign_relay(),
                FailoverAction::PhaseChanged(phase) => {
                    let _ = self.events.send(RelayEvent::StateChanged {
                        room_id: self.room_id.clone(),
                        phase,
                    });
                }
                FailoverAction::RelayChanged { relay_id, epoch } => {
                    info!(room_id = %self.room_id, ?relay_id, epoch, "relay changed");
                    let _ = self.events.send(RelayEvent::RelayChanged {
                        room_id: self.room_id.clone(),
                        relay_id,
                        epoch,
                    });
                }
            }
        }
    }

    fn send_signal(&self, payload: SignalPayload, target: Option<&str>) {
        let envelope = match target {
            Some(target) => {
                SignalEnvelope::to_peer(&self.room_id, &self.local_peer, target, payload)
            }
            None => SignalEnvelope::broadcast(&self.room_id, &self.local_peer, payload),
        };
        let _ = self.events.send(RelayEvent::NeedSignalling(envelope));
    }

    async fn status(&self) -> EngineStatus {
        let room = self.room.status().await;
        let mut peers: Vec<PeerStatus> = self
            .peers
            .iter()
            .map(|(peer_id, info)| PeerStatus {
                peer_id: peer_id.clone(),
                profile: info.profile,
                score: info.score,
                liveness: self
                    .keepalive
                    .liveness(peer_id)
                    .unwrap_or(Liveness::Unknown),
                rtt_ms: self
                    .keepalive
                    .health(peer_id)
                    .and_then(|h| h.rtt)
                    .map(|rtt| rtt.as_millis() as u64),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        EngineStatus {
            room_id: self.room_id.clone(),
            local_peer_id: self.local_peer.clone(),
            state: self.failover.phase(),
            relay_id: self.failover.current_relay().map(str::to_string),
            epoch: self.failover.epoch(),
            local_score: self.failover.local_score(),
            subscriber_count: room.subscriber_count,
            active_lane: room.active_lane,
            sharer_id: room.sharer_id.clone(),
            bitrate_bps: self.bitrate.ema_bps as u64,
            peers,
            room,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::mock::MockStack;
    use lancast_protocol::{DeviceClass, LinkType, PowerSource};
    use tokio::sync::mpsc::error::TryRecvError;

    const ROOM: &str = "living-room";
    const OFFER: &str = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

    fn fast_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.keepalive.interval_ms = 50;
        config.keepalive.timeout_ms = 75;
        config.election.base_timer_ms = 100;
        config.election.initial_timer_factor = 2;
        config
    }

    struct Node {
        peer_id: String,
        msg_tx: UnboundedSender<Msg>,
        events: UnboundedReceiver<RelayEvent>,
        stack: Arc<MockStack>,
        room: Arc<RelayRoom>,
        alive: bool,
        log: Vec<RelayEvent>,
    }

    impl Node {
        fn new(peer_id: &str, profile: DeviceProfile) -> Self {
            let stack = MockStack::new();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (room_tx, room_rx) = mpsc::unbounded_channel();
            let room = RelayRoom::new(ROOM, fast_config(), stack.clone(), room_tx);
            let msg_tx = Coordinator::spawn(
                ROOM,
                peer_id,
                fast_config(),
                room.clone(),
                room_rx,
                events_tx,
            );
            msg_tx
                .send(Msg::Command(Command::UpdateLocalDevice {
                    profile,
                    net: None,
                }))
                .unwrap();
            Self {
                peer_id: peer_id.to_string(),
                msg_tx,
                events: events_rx,
                stack,
                room,
                alive: true,
                log: Vec::new(),
            }
        }

        fn enable(&self) {
            self.msg_tx.send(Msg::Command(Command::Enable)).unwrap();
        }

        fn signal(&self, envelope: SignalEnvelope) {
            let _ = self.msg_tx.send(Msg::Command(Command::Signal(envelope)));
        }

        async fn status(&self) -> EngineStatus {
            let (reply, rx) = oneshot::channel();
            self.msg_tx
                .send(Msg::Command(Command::Status { reply }))
                .unwrap();
            rx.await.unwrap()
        }
    }

    fn pc_profile() -> DeviceProfile {
        DeviceProfile::new(DeviceClass::Pc, LinkType::Ethernet, PowerSource::Plugged)
    }

    fn mobile_profile() -> DeviceProfile {
        DeviceProfile::new(DeviceClass::Mobile, LinkType::Wifi, PowerSource::Battery)
    }

    /// Route NeedSignalling envelopes between live nodes every 10 ms for
    /// the given duration (an in-memory broadcast transport without
    /// loopback). Non-signalling events are kept on each node's log.
    async fn pump(nodes: &mut [Node], duration_ms: u64) {
        for _ in 0..duration_ms / 10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut outbox: Vec<(usize, SignalEnvelope)> = Vec::new();
            for (index, node) in nodes.iter_mut().enumerate() {
                loop {
                    match node.events.try_recv() {
                        Ok(RelayEvent::NeedSignalling(envelope)) => {
                            if node.alive {
                                outbox.push((index, envelope));
                            }
                        }
                        Ok(event) => node.log.push(event),
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
            }
            for (sender, envelope) in outbox {
                for (index, node) in nodes.iter().enumerate() {
                    if index != sender && node.alive && envelope.targets(&node.peer_id) {
                        node.signal(envelope.clone());
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn solo_node_elects_itself() {
        let mut nodes = [Node::new("a", pc_profile())];
        nodes[0].enable();
        // Initial timer is 2 × 100 ms
        pump(&mut nodes, 400).await;

        let status = nodes[0].status().await;
        assert_eq!(status.state, Phase::AsRelay);
        assert_eq!(status.relay_id.as_deref(), Some("a"));
        assert_eq!(status.epoch, 1);
        assert!(nodes[0].room.is_relay());

        let phases: Vec<Phase> = nodes[0]
            .log
            .iter()
            .filter_map(|e| match e {
                RelayEvent::StateChanged { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![Phase::Connecting, Phase::Electing, Phase::AsRelay]);
    }

    #[tokio::test]
    async fn two_nodes_converge_on_higher_score() {
        // pc/ethernet/plugged (100) vs mobile/wifi/battery (60)
        let mut nodes = [
            Node::new("a", pc_profile()),
            Node::new("b", mobile_profile()),
        ];
        nodes[0].enable();
        nodes[1].enable();
        pump(&mut nodes, 600).await;

        let a = nodes[0].status().await;
        let b = nodes[1].status().await;
        assert_eq!(a.relay_id.as_deref(), Some("a"));
        assert_eq!(b.relay_id.as_deref(), Some("a"));
        assert_eq!(a.state, Phase::AsRelay);
        assert_eq!(b.state, Phase::Connected);
        assert_eq!((a.epoch, b.epoch), (1, 1));
    }

    #[tokio::test]
    async fn identical_profiles_tie_break_on_peer_id() {
        // Both score 60; the lexicographically greater id wins everywhere
        let mut nodes = [
            Node::new("p1", mobile_profile()),
            Node::new("p2", mobile_profile()),
        ];
        nodes[0].enable();
        nodes[1].enable();
        pump(&mut nodes, 600).await;

        let p1 = nodes[0].status().await;
        let p2 = nodes[1].status().await;
        assert_eq!(p1.relay_id.as_deref(), Some("p2"));
        assert_eq!(p2.relay_id.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn late_joiner_adopts_existing_relay() {
        let mut nodes = [Node::new("a", pc_profile())];
        nodes[0].enable();
        pump(&mut nodes, 400).await;
        assert_eq!(nodes[0].status().await.state, Phase::AsRelay);

        let mut all = {
            let [a] = nodes;
            [a, Node::new("b", mobile_profile())]
        };
        all[1].enable();
        pump(&mut all, 600).await;

        let b = all[1].status().await;
        assert_eq!(b.relay_id.as_deref(), Some("a"));
        assert_eq!(b.state, Phase::Connected);
        // The sitting relay answered b's join directly; epoch did not move
        assert_eq!(b.epoch, 1);
    }

    #[tokio::test]
    async fn relay_failure_triggers_failover() {
        // The relay dies; the survivors re-elect the better one at epoch 2
        let mut nodes = [
            Node::new("a", pc_profile()),
            Node::new(
                "b",
                DeviceProfile::new(DeviceClass::Pad, LinkType::Wifi, PowerSource::Plugged),
            ),
            Node::new("c", mobile_profile()),
        ];
        nodes[0].enable();
        nodes[1].enable();
        nodes[2].enable();
        pump(&mut nodes, 600).await;
        assert_eq!(nodes[1].status().await.relay_id.as_deref(), Some("a"));
        assert_eq!(nodes[2].status().await.relay_id.as_deref(), Some("a"));

        // A vanishes: its traffic stops flowing both ways
        nodes[0].alive = false;
        // Two missed pongs at 50/75 ms timers, then a 100 ms election
        pump(&mut nodes, 1500).await;

        let b = nodes[1].status().await;
        let c = nodes[2].status().await;
        // b (pad+wifi+plugged = 80) outranks c (60)
        assert_eq!(b.relay_id.as_deref(), Some("b"));
        assert_eq!(c.relay_id.as_deref(), Some("b"));
        assert_eq!(b.state, Phase::AsRelay);
        assert_eq!(c.state, Phase::Connected);
        assert_eq!(b.epoch, 2);
        assert_eq!(c.epoch, 2);
    }

    #[tokio::test]
    async fn offer_to_relay_creates_subscriber_and_answers() {
        let mut nodes = [Node::new("a", pc_profile())];
        nodes[0].enable();
        pump(&mut nodes, 400).await;
        assert!(nodes[0].room.is_relay());

        nodes[0].signal(SignalEnvelope::to_peer(
            ROOM,
            "viewer",
            "a",
            SignalPayload::Offer { sdp: OFFER.into() },
        ));
        pump(&mut nodes, 100).await;

        assert_eq!(nodes[0].status().await.subscriber_count, 1);
        assert!(nodes[0].log.iter().any(|e| matches!(
            e,
            RelayEvent::SubscriberJoined { peer_id, .. } if peer_id == "viewer"
        )));

        // Trickled candidate reaches the new connection
        nodes[0].signal(SignalEnvelope::to_peer(
            ROOM,
            "viewer",
            "a",
            SignalPayload::Candidate {
                candidate: "candidate:1 1 UDP 2130706431 192.168.1.3 4242 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        ));
        pump(&mut nodes, 100).await;
        assert_eq!(nodes[0].stack.peer(0).candidates.lock().unwrap().len(), 1);

        // Leave tears the subscriber down
        nodes[0].signal(SignalEnvelope::broadcast(ROOM, "viewer", SignalPayload::Leave));
        pump(&mut nodes, 100).await;
        assert_eq!(nodes[0].status().await.subscriber_count, 0);
    }

    #[tokio::test]
    async fn offer_ignored_when_not_relay() {
        let mut nodes = [Node::new("a", pc_profile())];
        // Never enabled, never relay
        nodes[0].signal(SignalEnvelope::to_peer(
            ROOM,
            "viewer",
            "a",
            SignalPayload::Offer { sdp: OFFER.into() },
        ));
        pump(&mut nodes, 100).await;
        assert_eq!(nodes[0].status().await.subscriber_count, 0);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let mut nodes = [Node::new("a", pc_profile())];
        nodes[0].enable();
        nodes[0].signal(SignalEnvelope::to_peer(ROOM, "x", "a", SignalPayload::Ping));

        // Catch the pong before the pump would discard it (no x node exists)
        let mut pong = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            while let Ok(event) = nodes[0].events.try_recv() {
                if let RelayEvent::NeedSignalling(envelope) = &event
                    && envelope.payload == SignalPayload::Pong
                {
                    pong = Some(envelope.clone());
                }
            }
            if pong.is_some() {
                break;
            }
        }
        let pong = pong.expect("pong not sent");
        assert_eq!(pong.target_peer_id.as_deref(), Some("x"));
        assert_eq!(pong.peer_id, "a");
    }

    #[tokio::test]
    async fn foreign_room_signals_are_dropped() {
        let mut nodes = [Node::new("a", pc_profile())];
        nodes[0].enable();
        nodes[0].signal(SignalEnvelope::broadcast(
            "another-room",
            "b",
            SignalPayload::RelayChanged {
                relay_id: "b".into(),
                epoch: 99,
                score: 100.0,
            },
        ));
        pump(&mut nodes, 200).await;
        let status = nodes[0].status().await;
        assert_ne!(status.relay_id.as_deref(), Some("b"));
        assert!(status.epoch < 99);
    }

    #[tokio::test]
    async fn status_lists_known_peers_with_liveness() {
        let mut nodes = [
            Node::new("a", pc_profile()),
            Node::new("b", mobile_profile()),
        ];
        nodes[0].enable();
        nodes[1].enable();
        pump(&mut nodes, 600).await;

        let status = nodes[0].status().await;
        assert_eq!(status.peers.len(), 1);
        let peer = &status.peers[0];
        assert_eq!(peer.peer_id, "b");
        assert_eq!(peer.profile, mobile_profile());
        assert_eq!(peer.score, 60.0);
        // Pings flowed both ways during the pump
        assert_eq!(peer.liveness, Liveness::Online);
        assert!(peer.rtt_ms.is_some());
    }

    #[tokio::test]
    async fn status_serializes_with_camel_case_keys() {
        let mut nodes = [Node::new("a", pc_profile())];
        nodes[0].enable();
        pump(&mut nodes, 400).await;

        let status = nodes[0].status().await;
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains(r#""relayId":"a""#));
        assert!(json.contains(r#""subscriberCount":0"#));
        assert!(json.contains(r#""activeLane":"sfu""#));
        assert!(json.contains(r#""sharerId":null"#));
        assert!(json.contains(r#""state":"asRelay""#));
        assert!(json.contains(r#""epoch":1"#));
    }

    #[tokio::test]
    async fn disable_broadcasts_leave_and_resets() {
        let mut nodes = [Node::new("a", pc_profile())];
        nodes[0].enable();
        pump(&mut nodes, 400).await;
        assert_eq!(nodes[0].status().await.state, Phase::AsRelay);

        nodes[0]
            .msg_tx
            .send(Msg::Command(Command::Disable))
            .unwrap();
        // Read events directly; the pump has nowhere to route them
        let mut saw_leave = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            while let Ok(event) = nodes[0].events.try_recv() {
                if let RelayEvent::NeedSignalling(envelope) = &event
                    && envelope.payload == SignalPayload::Leave
                {
                    saw_leave = true;
                }
            }
            if saw_leave {
                break;
            }
        }
        assert!(saw_leave);
        let status = nodes[0].status().await;
        assert_eq!(status.state, Phase::Idle);
        assert!(!nodes[0].room.is_relay());
    }
}
