//! Per-room ping scheduling and liveness accounting.
//!
//! The component is passive: the coordinator owns the actual timer and calls
//! `tick` with the current instant, so every state transition is
//! deterministic and testable without a runtime. Events come back in the
//! order they are generated.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use lancast_protocol::KeepaliveConfig;

/// Liveness of a tracked peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    #[default]
    Unknown,
    Online,
    /// Answering, but RTT is above the slow threshold. Informational.
    Slow,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveEvent {
    /// Send a ping to this peer through the signalling transport.
    PingRequested(String),
    PeerOnline(String),
    PeerSlow(String),
    PeerOffline(String),
}

#[derive(Debug, Default)]
pub struct PeerHealth {
    pub liveness: Liveness,
    pub rtt: Option<Duration>,
    pub missed: u32,
    pub last_pong: Option<Instant>,
    last_ping_sent: Option<Instant>,
    /// Send time of the oldest ping still waiting for a pong; misses are
    /// counted against this, not against the newest ping.
    oldest_unanswered: Option<Instant>,
}

pub struct Keepalive {
    config: KeepaliveConfig,
    peers: HashMap<String, PeerHealth>,
    running: bool,
}

impl Keepalive {
    pub fn new(config: KeepaliveConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
            running: false,
        }
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    /// Track a peer. Re-adding resets its health, which is also how an
    /// offline peer becomes pingable again.
    pub fn add_peer(&mut self, peer_id: &str) {
        self.peers.insert(peer_id.to_string(), PeerHealth::default());
    }

    pub fn remove_peer(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn liveness(&self, peer_id: &str) -> Option<Liveness> {
        self.peers.get(peer_id).map(|p| p.liveness)
    }

    pub fn health(&self, peer_id: &str) -> Option<&PeerHealth> {
        self.peers.get(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PeerHealth)> {
        self.peers.iter()
    }

    /// Record a pong. The peer returns to `online` (or `slow` when the RTT is
    /// above the threshold) and its miss counter clears.
    pub fn handle_pong(&mut self, peer_id: &str, now: Instant) -> Vec<KeepaliveEvent> {
        let mut events = Vec::new();
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return events;
        };

        if let Some(sent) = peer.last_ping_sent {
            peer.rtt = Some(now.saturating_duration_since(sent));
        }
        peer.missed = 0;
        peer.oldest_unanswered = None;
        peer.last_pong = Some(now);

        let slow = peer
            .rtt
            .is_some_and(|rtt| rtt > Duration::from_millis(self.config.slow_threshold_ms));
        let was = peer.liveness;
        peer.liveness = if slow { Liveness::Slow } else { Liveness::Online };

        if matches!(was, Liveness::Unknown | Liveness::Offline) {
            events.push(KeepaliveEvent::PeerOnline(peer_id.to_string()));
        }
        if slow && was != Liveness::Slow {
            events.push(KeepaliveEvent::PeerSlow(peer_id.to_string()));
        }
        events
    }

    /// Advance the scheduler. Call once per interval with the current
    /// instant; returns ping requests and liveness transitions.
    pub fn tick(&mut self, now: Instant) -> Vec<KeepaliveEvent> {
        let mut events = Vec::new();
        if !self.running {
            return events;
        }

        let interval = Duration::from_millis(self.config.interval_ms);
        let timeout = Duration::from_millis(self.config.timeout_ms);

        // Sort so event order is stable regardless of map layout
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();

        for peer_id in ids {
            let Some(peer) = self.peers.get_mut(&peer_id) else {
                continue;
            };

            // A peer declared offline is left alone until it is re-added
            if peer.liveness == Liveness::Offline {
                continue;
            }

            if let Some(since) = peer.oldest_unanswered
                && now.saturating_duration_since(since) >= timeout
            {
                peer.missed += 1;
                peer.oldest_unanswered = None;
                if peer.missed >= self.config.offline_after_misses {
                    peer.liveness = Liveness::Offline;
                    events.push(KeepaliveEvent::PeerOffline(peer_id.clone()));
                    continue;
                }
            }

            let due = peer
                .last_ping_sent
                .is_none_or(|sent| now.saturating_duration_since(sent) >= interval);
            if due {
                peer.last_ping_sent = Some(now);
                if peer.oldest_unanswered.is_none() {
                    peer.oldest_unanswered = Some(now);
                }
                events.push(KeepaliveEvent::PingRequested(peer_id));
            }
        }
        events
    }
}
