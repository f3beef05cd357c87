//! Relay failover state machine.
//!
//! Pure state: every input returns the actions the coordinator must perform
//! (broadcasts, timer arms, room mode changes), so the whole election
//! protocol is testable without a runtime. Claim arbitration is a strict
//! total order over `(epoch, score, peerId)`; any two peers comparing the
//! same pair of claims reach the same verdict.

use std::cmp::Ordering;

use lancast_protocol::SignalPayload;

/// Relay-side phase of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    /// Enabled, join in flight, first election not yet started.
    Connecting,
    Electing,
    /// Subscribed (or about to subscribe) to a remote relay.
    Connected,
    AsRelay,
    Error,
}

/// A relay candidacy: either an incoming claim/announcement or the local
/// node's own belief.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Claim<'a> {
    pub peer_id: &'a str,
    pub epoch: u64,
    pub score: f64,
}

/// Strict total order over claims: higher epoch wins, then higher score,
/// then lexicographically greater peer id. `Ordering::Greater` means `a`
/// outranks `b`; equality only occurs for the same peer.
pub fn arbitrate(a: &Claim<'_>, b: &Claim<'_>) -> Ordering {
    a.epoch
        .cmp(&b.epoch)
        .then(a.score.total_cmp(&b.score))
        .then(a.peer_id.cmp(b.peer_id))
}

/// Effects the coordinator must carry out after feeding the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum FailoverAction {
    /// Send a signalling payload; broadcast when `target` is `None`.
    Send {
        payload: SignalPayload,
        target: Option<String>,
    },
    /// Arm the election timer. A newer generation invalidates older arms.
    StartElectionTimer {
        generation: u64,
        initial: bool,
    },
    /// Put the relay room into publish mode.
    BecomeRelay,
    /// Leave publish mode (another relay won arbitration).
    ResignRelay,
    PhaseChanged(Phase),
    RelayChanged {
        relay_id: Option<String>,
        epoch: u64,
    },
}

pub struct Failover {
    local_peer: String,
    phase: Phase,
    current_relay: Option<String>,
    epoch: u64,
    local_score: f64,
    current_relay_score: f64,
    timer_generation: u64,
}

impl Failover {
    pub fn new(local_peer: &str) -> Self {
        Self {
            local_peer: local_peer.to_string(),
            phase: Phase::Idle,
            current_relay: None,
            epoch: 0,
            local_score: 0.0,
            current_relay_score: 0.0,
            timer_generation: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_relay(&self) -> Option<&str> {
        self.current_relay.as_deref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn local_score(&self) -> f64 {
        self.local_score
    }

    pub fn is_relay(&self) -> bool {
        self.current_relay.as_deref() == Some(self.local_peer.as_str())
    }

    pub fn set_local_score(&mut self, score: f64) {
        self.local_score = score;
    }

    /// The announcement a late joiner should receive while we are relay.
    pub fn current_announcement(&self) -> Option<SignalPayload> {
        (self.phase == Phase::AsRelay).then(|| SignalPayload::RelayChanged {
            relay_id: self.local_peer.clone(),
            epoch: self.epoch,
            score: self.local_score,
        })
    }

    /// Enabled; signalling join is going out. idle → connecting.
    pub fn mark_connecting(&mut self) -> Vec<FailoverAction> {
        if self.phase != Phase::Idle {
            return Vec::new();
        }
        self.phase = Phase::Connecting;
        vec![FailoverAction::PhaseChanged(Phase::Connecting)]
    }

    /// Enter an election: bump the epoch, broadcast a claim, arm the timer.
    /// The first election waits longer so an existing relay can announce.
    pub fn start_election(&mut self) -> Vec<FailoverAction> {
        if matches!(self.phase, Phase::Error) {
            return Vec::new();
        }
        self.epoch += 1;
        self.current_relay = None;
        self.phase = Phase::Electing;
        self.timer_generation += 1;
        vec![
            FailoverAction::PhaseChanged(Phase::Electing),
            FailoverAction::Send {
                payload: SignalPayload::RelayClaim {
                    epoch: self.epoch,
                    score: self.local_score,
                },
                target: None,
            },
            FailoverAction::StartElectionTimer {
                generation: self.timer_generation,
                initial: self.epoch == 1,
            },
        ]
    }

    /// Election timer fired. Stale generations (timer re-armed or election
    /// resolved meanwhile) are ignored.
    pub fn on_election_timeout(&mut self, generation: u64) -> Vec<FailoverAction> {
        if generation != self.timer_generation || self.phase != Phase::Electing {
            return Vec::new();
        }
        self.phase = Phase::AsRelay;
        self.current_relay = Some(self.local_peer.clone());
        self.current_relay_score = self.local_score;
        vec![
            FailoverAction::PhaseChanged(Phase::AsRelay),
            FailoverAction::BecomeRelay,
            FailoverAction::Send {
                payload: SignalPayload::RelayChanged {
                    relay_id: self.local_peer.clone(),
                    epoch: self.epoch,
                    score: self.local_score,
                },
                target: None,
            },
            FailoverAction::RelayChanged {
                relay_id: Some(self.local_peer.clone()),
                epoch: self.epoch,
            },
        ]
    }

    /// A `relayClaim` arrived.
    pub fn on_remote_claim(
        &mut self,
        from: &str,
        claim_epoch: u64,
        claim_score: f64,
    ) -> Vec<FailoverAction> {
        if self.phase == Phase::Error || from == self.local_peer {
            return Vec::new();
        }
        let claimant = Claim {
            peer_id: from,
            epoch: claim_epoch,
            score: claim_score,
        };

        let claimant_wins = match self.local_candidate() {
            None => true,
            Some(candidate) => arbitrate(&claimant, &candidate) == Ordering::Greater,
        };

        if claimant_wins {
            return self.accept_relay(from, claim_epoch, claim_score);
        }

        match self.phase {
            // Our own candidacy outranks the claim: the election is decided,
            // announce instead of waiting out the timer.
            Phase::Electing => self.promote(),
            // Already relay: re-assert towards the claimant so it settles.
            Phase::AsRelay => vec![FailoverAction::Send {
                payload: SignalPayload::RelayChanged {
                    relay_id: self.local_peer.clone(),
                    epoch: self.epoch,
                    score: self.local_score,
                },
                target: Some(from.to_string()),
            }],
            // An established relay outranks the claim; it will answer itself.
            _ => Vec::new(),
        }
    }

    /// A `relayChanged` arrived.
    pub fn on_relay_changed(
        &mut self,
        from: &str,
        relay_id: &str,
        epoch: u64,
        score: f64,
    ) -> Vec<FailoverAction> {
        if self.phase == Phase::Error {
            return Vec::new();
        }
        // Arbitration inconsistency: stale epoch, ignore silently
        if epoch < self.epoch {
            return Vec::new();
        }
        // Someone says we are the relay; believable only if we think so too
        if relay_id == self.local_peer {
            return Vec::new();
        }
        // Re-announcement of the relay we already follow: refresh, no events
        if self.current_relay.as_deref() == Some(relay_id) {
            self.epoch = self.epoch.max(epoch);
            self.current_relay_score = score;
            return Vec::new();
        }

        let candidate = Claim {
            peer_id: relay_id,
            epoch,
            score,
        };
        let candidate_wins = match self.local_candidate() {
            None => true,
            Some(local) => arbitrate(&candidate, &local) == Ordering::Greater,
        };

        if candidate_wins {
            self.accept_relay(relay_id, epoch, score)
        } else if self.phase == Phase::AsRelay {
            // Concurrent winner with a lower claim: point it at us.
            vec![FailoverAction::Send {
                payload: SignalPayload::RelayChanged {
                    relay_id: self.local_peer.clone(),
                    epoch: self.epoch,
                    score: self.local_score,
                },
                target: Some(from.to_string()),
            }]
        } else {
            Vec::new()
        }
    }

    /// The current relay stopped answering (or sent `leave`).
    pub fn on_relay_offline(&mut self) -> Vec<FailoverAction> {
        if self.phase == Phase::Connected && self.current_relay.is_some() {
            self.start_election()
        } else {
            Vec::new()
        }
    }

    /// Unrecoverable room failure; only a full restart recovers.
    pub fn on_fatal(&mut self) -> Vec<FailoverAction> {
        if self.phase == Phase::Error {
            return Vec::new();
        }
        self.phase = Phase::Error;
        vec![FailoverAction::PhaseChanged(Phase::Error)]
    }

    /// Back to idle on disable/teardown.
    pub fn reset(&mut self) -> Vec<FailoverAction> {
        self.timer_generation += 1;
        self.current_relay = None;
        if self.phase == Phase::Idle {
            return Vec::new();
        }
        self.phase = Phase::Idle;
        vec![FailoverAction::PhaseChanged(Phase::Idle)]
    }

    /// The candidacy incoming claims are compared against: our own while
    /// electing or relaying, otherwise whatever relay we currently follow.
    fn local_candidate(&self) -> Option<Claim<'_>> {
        match self.phase {
            Phase::Electing | Phase::AsRelay => Some(Claim {
                peer_id: &self.local_peer,
                epoch: self.epoch,
                score: self.local_score,
            }),
            _ => self.current_relay.as_deref().map(|relay| Claim {
                peer_id: relay,
                epoch: self.epoch,
                score: self.current_relay_score,
            }),
        }
    }

    /// Win an election early (our claim outranked a competitor's).
    fn promote(&mut self) -> Vec<FailoverAction> {
        self.timer_generation += 1; // the pending timeout becomes stale
        self.phase = Phase::AsRelay;
        self.current_relay = Some(self.local_peer.clone());
        self.current_relay_score = self.local_score;
        vec![
            FailoverAction::PhaseChanged(Phase::AsRelay),
            FailoverAction::BecomeRelay,
            FailoverAction::Send {
                payload: SignalPayload::RelayChanged {
                    relay_id: self.local_peer.clone(),
                    epoch: self.epoch,
                    score: self.local_score,
                },
                target: None,
            },
            FailoverAction::RelayChanged {
                relay_id: Some(self.local_peer.clone()),
                epoch: self.epoch,
            },
        ]
    }

    fn accept_relay(&mut self, relay_id: &str, epoch: u64, score: f64) -> Vec<FailoverAction> {
        let was_relay = self.phase == Phase::AsRelay;
        let changed = self.current_relay.as_deref() != Some(relay_id) || self.epoch != epoch;

        self.current_relay = Some(relay_id.to_string());
        self.epoch = self.epoch.max(epoch);
        self.current_relay_score = score;
        self.timer_generation += 1; // cancels any pending election

        let mut actions = Vec::new();
        if was_relay {
            actions.push(FailoverAction::ResignRelay);
        }
        if self.phase != Phase::Connected {
            self.phase = Phase::Connected;
            actions.push(FailoverAction::PhaseChanged(Phase::Connected));
        }
        if changed {
            actions.push(FailoverAction::RelayChanged {
                relay_id: Some(relay_id.to_string()),
                epoch: self.epoch,
            });
        }
        actions
    }
}
