//! Relay room: per-subscriber peer connection lifecycle.
//!
//! On the elected relay node the room terminates one peer connection per
//! subscriber, exposes a sendonly video and audio track on each, and lets
//! the source switcher push rewritten RTP onto those tracks. Everything here
//! is control plane; the data plane lives in [`crate::switcher`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use lancast_protocol::RelayConfig;
use tokio::sync::mpsc;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{LeaveCause, RoomEvent};
use crate::pool::{BufferPool, PoolStats};
use crate::registry::{SubscriberSink, TrackCounters, TrackRegistry};
use crate::stack::{CandidateInit, IceLinkState, MediaKind, MediaStack, PeerHandlers, PeerLink,
                   TrackSpec};
use crate::switcher::{LaneKind, LaneStats, SourceSwitcher};

/// Trickled candidates buffered for a peer whose subscriber entry does not
/// exist yet; anything beyond this is dropped.
const MAX_PENDING_CANDIDATES: usize = 32;

struct SubscriberEntry {
    /// None while `add_subscriber` is still setting the connection up.
    link: Option<Arc<dyn PeerLink>>,
    renegotiation_needed: bool,
}

/// Rate limiter for upstream keyframe solicitation. The relay cannot
/// generate an IDR itself (it never decodes); it asks the source, at most
/// once per interval however many subscribers churn.
struct KeyframeGate {
    events: mpsc::UnboundedSender<RoomEvent>,
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl KeyframeGate {
    fn request(&self) {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap();
        if last.is_some_and(|t| now.duration_since(t) < self.min_interval) {
            return;
        }
        *last = Some(now);
        drop(last);
        let _ = self.events.send(RoomEvent::KeyframeRequested);
    }
}

pub struct RelayRoom {
    room_id: String,
    config: RelayConfig,
    stack: Arc<dyn MediaStack>,
    registry: Arc<TrackRegistry>,
    switcher: Arc<SourceSwitcher>,
    pool: Arc<BufferPool>,
    events: mpsc::UnboundedSender<RoomEvent>,
    subscribers: AsyncRwLock<HashMap<String, SubscriberEntry>>,
    pending_candidates: AsyncMutex<HashMap<String, Vec<CandidateInit>>>,
    keyframe: KeyframeGate,
    publisher: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl RelayRoom {
    pub fn new(
        room_id: &str,
        config: RelayConfig,
        stack: Arc<dyn MediaStack>,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Arc<Self> {
        let registry = TrackRegistry::new();
        let pool = BufferPool::new(64);
        let switcher =
            SourceSwitcher::new(registry.clone(), pool.clone(), &config.jitter, events.clone());
        let keyframe = KeyframeGate {
            events: events.clone(),
            min_interval: Duration::from_millis(config.keyframe_min_interval_ms),
            last: Mutex::new(None),
        };
        Arc::new(Self {
            room_id: room_id.to_string(),
            config,
            stack,
            registry,
            switcher,
            pool,
            events,
            subscribers: AsyncRwLock::new(HashMap::new()),
            pending_candidates: AsyncMutex::new(HashMap::new()),
            keyframe,
            publisher: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn switcher(&self) -> &Arc<SourceSwitcher> {
        &self.switcher
    }

    /// Mark this node as the publisher. Idempotent.
    pub fn become_relay(&self, peer_id: &str) {
        let mut publisher = self.publisher.lock().unwrap();
        if publisher.as_deref() != Some(peer_id) {
            info!(room_id = %self.room_id, %peer_id, "room entering relay mode");
        }
        *publisher = Some(peer_id.to_string());
    }

    /// Leave publish mode (another relay won arbitration). Existing
    /// subscribers drain away on their own ICE lifecycle.
    pub fn resign_relay(&self) {
        if self.publisher.lock().unwrap().take().is_some() {
            info!(room_id = %self.room_id, "room leaving relay mode");
        }
    }

    pub fn is_relay(&self) -> bool {
        self.publisher.lock().unwrap().is_some()
    }

    pub fn publisher_id(&self) -> Option<String> {
        self.publisher.lock().unwrap().clone()
    }

    /// Create a subscriber peer connection from its SDP offer and return the
    /// answer. Fails fast with a structured error when the room is not in
    /// relay mode, the peer already subscribes, the SDP is rejected, or ICE
    /// setup fails.
    pub async fn add_subscriber(
        self: &Arc<Self>,
        peer_id: &str,
        offer_sdp: &str,
    ) -> Result<String, EngineError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::RoomClosed);
        }
        if !self.is_relay() {
            return Err(EngineError::NotRelay);
        }

        // Reserve the slot first so concurrent offers for the same peer
        // cannot both pass the duplicate check.
        {
            let mut subscribers = self.subscribers.write().await;
            if subscribers.contains_key(peer_id) {
                return Err(EngineError::AlreadyExists(peer_id.to_string()));
            }
            subscribers.insert(
                peer_id.to_string(),
                SubscriberEntry {
                    link: None,
                    renegotiation_needed: false,
                },
            );
        }

        let result = self.setup_subscriber(peer_id, offer_sdp).await;
        let (link, answer, sink) = match result {
            Ok(parts) => parts,
            Err(err) => {
                self.subscribers.write().await.remove(peer_id);
                return Err(err);
            }
        };

        self.registry.insert(sink);
        {
            let mut subscribers = self.subscribers.write().await;
            if self.closed.load(Ordering::Relaxed) {
                // Torn down while we were negotiating
                subscribers.remove(peer_id);
                drop(subscribers);
                self.registry.remove(peer_id);
                link.close().await;
                return Err(EngineError::RoomClosed);
            }
            match subscribers.get_mut(peer_id) {
                Some(entry) => entry.link = Some(link.clone()),
                None => {
                    // Removed while we were negotiating
                    drop(subscribers);
                    self.registry.remove(peer_id);
                    link.close().await;
                    return Err(EngineError::RoomClosed);
                }
            }
        }

        // Candidates that raced ahead of the offer
        let buffered = self.pending_candidates.lock().await.remove(peer_id);
        if let Some(candidates) = buffered {
            for candidate in candidates {
                if let Err(err) = link.add_ice_candidate(candidate).await {
                    debug!(room_id = %self.room_id, %peer_id, "buffered candidate rejected: {err}");
                }
            }
        }

        info!(room_id = %self.room_id, %peer_id, "subscriber added");
        let _ = self.events.send(RoomEvent::SubscriberJoined {
            peer_id: peer_id.to_string(),
        });
        Ok(answer)
    }

    async fn setup_subscriber(
        self: &Arc<Self>,
        peer_id: &str,
        offer_sdp: &str,
    ) -> Result<(Arc<dyn PeerLink>, String, Arc<SubscriberSink>), EngineError> {
        let link = self
            .stack
            .create_peer(&self.config.ice, self.peer_handlers(peer_id))
            .await?;

        let setup = async {
            let stream_id = Uuid::new_v4().to_string();
            let video_sink = link
                .add_sendonly_track(&TrackSpec {
                    kind: MediaKind::Video,
                    mime_type: self.config.media.video_mime.clone(),
                    clock_rate: self.config.media.video_clock,
                    channels: 0,
                    track_id: format!("video-{peer_id}"),
                    stream_id: stream_id.clone(),
                })
                .await?;
            let audio_sink = link
                .add_sendonly_track(&TrackSpec {
                    kind: MediaKind::Audio,
                    mime_type: self.config.media.audio_mime.clone(),
                    clock_rate: self.config.media.audio_clock,
                    channels: self.config.media.audio_channels,
                    track_id: format!("audio-{peer_id}"),
                    stream_id,
                })
                .await?;

            link.apply_remote_offer(offer_sdp).await?;
            let answer = link.create_answer().await?;

            let sink = SubscriberSink::new(
                peer_id,
                video_sink,
                audio_sink,
                self.config.media.video_clock,
                self.config.media.audio_clock,
            );
            Ok((answer, sink))
        };

        let result = setup.await;
        match result {
            Ok((answer, sink)) => Ok((link, answer, sink)),
            Err(err) => {
                link.close().await;
                Err(err)
            }
        }
    }

    fn peer_handlers(self: &Arc<Self>, peer_id: &str) -> PeerHandlers {
        let events = self.events.clone();
        let peer = peer_id.to_string();
        let on_ice_candidate = Box::new(move |candidate: CandidateInit| {
            let _ = events.send(RoomEvent::IceCandidate {
                peer_id: peer.clone(),
                candidate,
            });
        });

        let events = self.events.clone();
        let registry = self.registry.clone();
        let room: Weak<RelayRoom> = Arc::downgrade(self);
        let peer = peer_id.to_string();
        let on_ice_state = Box::new(move |state: IceLinkState| {
            // First connect is the moment the new subscriber can decode —
            // pull a keyframe for it.
            if registry.apply_ice_state(&peer, state) == Some(true)
                && let Some(room) = room.upgrade()
            {
                room.keyframe.request();
            }
            let _ = events.send(RoomEvent::IceState {
                peer_id: peer.clone(),
                state,
            });
            if state.is_terminal()
                && let Some(room) = room.upgrade()
            {
                let peer = peer.clone();
                let cause = match state {
                    IceLinkState::Failed => LeaveCause::IceFailed,
                    _ => LeaveCause::IceClosed,
                };
                tokio::spawn(async move {
                    room.remove_subscriber(&peer, cause).await;
                });
            }
        });

        let room: Weak<RelayRoom> = Arc::downgrade(self);
        let on_keyframe_request = Box::new(move || {
            if let Some(room) = room.upgrade() {
                room.keyframe.request();
            }
        });

        PeerHandlers {
            on_ice_candidate,
            on_ice_state,
            on_keyframe_request,
        }
    }

    /// Close and forget a subscriber. Idempotent for unknown peers. The
    /// outbound tracks leave the registry before the connection closes, so
    /// nothing is written to them afterwards.
    pub async fn remove_subscriber(&self, peer_id: &str, cause: LeaveCause) {
        let entry = self.subscribers.write().await.remove(peer_id);
        let Some(entry) = entry else {
            return;
        };
        self.registry.remove(peer_id);
        self.pending_candidates.lock().await.remove(peer_id);
        if let Some(link) = entry.link {
            link.close().await;
        }
        info!(room_id = %self.room_id, %peer_id, ?cause, "subscriber removed");
        let _ = self.events.send(RoomEvent::SubscriberLeft {
            peer_id: peer_id.to_string(),
            cause,
        });
    }

    /// Forward a trickled candidate. Candidates for unknown peers are
    /// buffered — they routinely arrive before the answer is applied.
    pub async fn add_ice_candidate(&self, peer_id: &str, candidate: CandidateInit) {
        let link = {
            let subscribers = self.subscribers.read().await;
            subscribers.get(peer_id).and_then(|e| e.link.clone())
        };
        match link {
            Some(link) => {
                if let Err(err) = link.add_ice_candidate(candidate).await {
                    debug!(room_id = %self.room_id, %peer_id, "candidate rejected: {err}");
                }
            }
            None => {
                if self.closed.load(Ordering::Relaxed) {
                    return;
                }
                let mut pending = self.pending_candidates.lock().await;
                let queue = pending.entry(peer_id.to_string()).or_default();
                if queue.len() < MAX_PENDING_CANDIDATES {
                    queue.push(candidate);
                }
            }
        }
    }

    /// Create a fresh offer for every subscriber. Used when the ingress
    /// topology changes in a way the rewriter cannot hide.
    pub async fn trigger_renegotiation(&self) -> HashMap<String, String> {
        let links: Vec<(String, Arc<dyn PeerLink>)> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .filter_map(|(id, e)| e.link.clone().map(|l| (id.clone(), l)))
                .collect()
        };

        let mut offers = HashMap::new();
        for (peer_id, link) in links {
            match link.create_offer().await {
                Ok(offer) => {
                    offers.insert(peer_id.clone(), offer);
                    if let Some(entry) = self.subscribers.write().await.get_mut(&peer_id) {
                        entry.renegotiation_needed = true;
                    }
                }
                Err(err) => {
                    warn!(room_id = %self.room_id, %peer_id, "renegotiation offer failed: {err}");
                }
            }
        }
        offers
    }

    /// Apply a renegotiation answer. Unknown peers are tolerated (they may
    /// have left while the offer was in flight).
    pub async fn handle_answer(&self, peer_id: &str, answer_sdp: &str) {
        let link = {
            let subscribers = self.subscribers.read().await;
            subscribers.get(peer_id).and_then(|e| e.link.clone())
        };
        let Some(link) = link else {
            warn!(room_id = %self.room_id, %peer_id, "answer for unknown subscriber dropped");
            return;
        };
        match link.apply_remote_answer(answer_sdp).await {
            Ok(()) => {
                if let Some(entry) = self.subscribers.write().await.get_mut(peer_id) {
                    entry.renegotiation_needed = false;
                }
            }
            Err(err) => {
                warn!(room_id = %self.room_id, %peer_id, "renegotiation answer rejected: {err}");
            }
        }
    }

    /// Ask the upstream source for a fresh keyframe (rate limited).
    pub fn request_keyframe(&self) {
        self.keyframe.request();
    }

    /// Activate the LOCAL ingress lane. A switch pulls a keyframe so the new
    /// stream starts decodable.
    pub fn start_local_share(&self, sharer_peer_id: &str) {
        if self.switcher.start_local_share(sharer_peer_id) {
            self.keyframe.request();
        }
    }

    /// Back to the SFU lane. Idempotent.
    pub fn stop_local_share(&self) {
        if self.switcher.stop_local_share() {
            self.keyframe.request();
        }
    }

    /// Cloud-side ingress; delegates to the switcher.
    pub async fn inject_sfu(&self, is_video: bool, payload: &[u8]) {
        self.switcher
            .inject(LaneKind::Sfu, media_kind(is_video), payload)
            .await;
    }

    /// Local-capture ingress; delegates to the switcher.
    pub async fn inject_local(&self, is_video: bool, payload: &[u8]) {
        self.switcher
            .inject(LaneKind::Local, media_kind(is_video), payload)
            .await;
    }

    pub async fn status(&self) -> RoomStatus {
        let renegotiating: HashMap<String, bool> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .map(|(id, e)| (id.clone(), e.renegotiation_needed))
                .collect()
        };
        let snapshot = self.registry.snapshot();
        let subscribers = snapshot
            .iter()
            .map(|sink| SubscriberStatus {
                peer_id: sink.peer_id.clone(),
                ice_state: sink.ice_state(),
                writable: sink.writable(),
                renegotiation_needed: renegotiating.get(&sink.peer_id).copied().unwrap_or(false),
                video: sink.track(MediaKind::Video).counters(),
                audio: sink.track(MediaKind::Audio).counters(),
            })
            .collect::<Vec<_>>();

        let switcher = self.switcher.stats();
        RoomStatus {
            room_id: self.room_id.clone(),
            is_relay: self.is_relay(),
            publisher_id: self.publisher_id(),
            subscriber_count: subscribers.len(),
            active_lane: switcher.active_lane,
            sharer_id: switcher.sharer_id,
            subscribers,
            lanes: switcher.lanes,
            pool: self.pool.stats(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Total bytes written to all subscriber tracks; feeds the outbound
    /// bitrate estimate.
    pub fn total_bytes_out(&self) -> u64 {
        self.registry
            .snapshot()
            .iter()
            .map(|sink| {
                sink.track(MediaKind::Video).counters().bytes_out
                    + sink.track(MediaKind::Audio).counters().bytes_out
            })
            .sum()
    }

    /// Tear the room down: stop ingress, close every subscriber, drop all
    /// state. Ingress tasks observe the closed flag and drop packets.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.switcher.close();
        self.registry.clear();
        self.pending_candidates.lock().await.clear();

        let entries: Vec<(String, SubscriberEntry)> =
            self.subscribers.write().await.drain().collect();
        for (peer_id, entry) in entries {
            if let Some(link) = entry.link {
                link.close().await;
            }
            let _ = self.events.send(RoomEvent::SubscriberLeft {
                peer_id,
                cause: LeaveCause::RoomClosed,
            });
        }
        self.resign_relay();
        info!(room_id = %self.room_id, "room closed");
    }
}

fn media_kind(is_video: bool) -> MediaKind {
    if is_video {
        MediaKind::Video
    } else {
        MediaKind::Audio
    }
}

/// Room-level status snapshot.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatus {
    pub room_id: String,
    pub is_relay: bool,
    pub publisher_id: Option<String>,
    pub subscriber_count: usize,
    pub active_lane: LaneKind,
    pub sharer_id: Option<String>,
    pub subscribers: Vec<SubscriberStatus>,
    pub lanes: Vec<LaneStats>,
    pub pool: PoolStats,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberStatus {
    pub peer_id: String,
    pub ice_state: IceLinkState,
    pub writable: bool,
    pub renegotiation_needed: bool,
    pub video: TrackCounters,
    pub audio: TrackCounters,
}
