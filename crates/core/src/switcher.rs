//! Dual-source ingress and fan-out.
//!
//! Two ingress lanes per media kind: the cloud SFU feed and the local share
//! feed. Exactly one lane kind is active at a time (SFU by default); the
//! inactive lane's packets are dropped without I/O, which is expected
//! traffic during a switch. Active packets are rewritten per subscriber and
//! written to every writable outbound track.
//!
//! The injection path never takes a lock across I/O: the active-lane check
//! and the registry snapshot are each a short lock, the rewrite and writes
//! run on the clones. Each lane switch bumps a generation counter; tracks
//! re-anchor when they see a newer generation and reject older ones, so an
//! in-flight fan-out racing a switch cannot corrupt a timeline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use bytes::Bytes;
use lancast_protocol::{JitterConfig, RtpHeader};
use tokio::sync::mpsc;

use crate::events::RoomEvent;
use crate::jitter::{JitterBuffer, JitterStats};
use crate::pool::BufferPool;
use crate::registry::TrackRegistry;
use crate::stack::MediaKind;

/// Ingress lane kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneKind {
    Sfu,
    Local,
}

impl std::fmt::Display for LaneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sfu => "sfu",
            Self::Local => "local",
        })
    }
}

struct ActiveState {
    kind: LaneKind,
    /// Bumped on every lane activation; rewrite anchors key off it.
    generation: u64,
    sharer: Option<String>,
}

/// Sentinel bit marking `last_ssrc` as observed.
const SSRC_SEEN: u64 = 1 << 32;
/// Sentinel bit marking `last_pt` as observed.
const PT_SEEN: u64 = 1 << 8;

struct LaneState {
    kind: LaneKind,
    media: MediaKind,
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    drops: AtomicU64,
    last_ssrc: AtomicU64,
    last_pt: AtomicU64,
    jitter: Option<Mutex<JitterBuffer>>,
}

impl LaneState {
    fn new(kind: LaneKind, media: MediaKind, jitter: &JitterConfig) -> Self {
        Self {
            kind,
            media,
            packets_in: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            last_ssrc: AtomicU64::new(0),
            last_pt: AtomicU64::new(0),
            jitter: jitter
                .enabled
                .then(|| Mutex::new(JitterBuffer::new(jitter))),
        }
    }

    fn observe(&self, header: &RtpHeader, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_ssrc
            .store(SSRC_SEEN | header.ssrc as u64, Ordering::Relaxed);
    }

    /// True when this packet's payload type differs from the lane's last
    /// observed one (a codec change upstream).
    fn payload_type_changed(&self, payload_type: u8) -> bool {
        let new = PT_SEEN | payload_type as u64;
        let prev = self.last_pt.swap(new, Ordering::Relaxed);
        prev != 0 && prev != new
    }

    fn stats(&self) -> LaneStats {
        let raw = self.last_ssrc.load(Ordering::Relaxed);
        LaneStats {
            kind: self.kind,
            media: self.media,
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            last_ssrc: (raw & SSRC_SEEN != 0).then_some(raw as u32),
            jitter: self.jitter.as_ref().map(|j| j.lock().unwrap().stats()),
        }
    }
}

/// Per-lane counter snapshot.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneStats {
    pub kind: LaneKind,
    pub media: MediaKind,
    pub packets_in: u64,
    pub bytes_in: u64,
    pub drops: u64,
    pub last_ssrc: Option<u32>,
    pub jitter: Option<JitterStats>,
}

/// Switcher-level counter snapshot.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitcherStats {
    pub active_lane: LaneKind,
    pub sharer_id: Option<String>,
    pub lanes: Vec<LaneStats>,
}

pub struct SourceSwitcher {
    active: RwLock<ActiveState>,
    // sfu-video, sfu-audio, local-video, local-audio
    lanes: [LaneState; 4],
    registry: Arc<TrackRegistry>,
    pool: Arc<BufferPool>,
    events: mpsc::UnboundedSender<RoomEvent>,
    closed: AtomicBool,
}

impl SourceSwitcher {
    pub fn new(
        registry: Arc<TrackRegistry>,
        pool: Arc<BufferPool>,
        jitter: &JitterConfig,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            active: RwLock::new(ActiveState {
                kind: LaneKind::Sfu,
                generation: 1,
                sharer: None,
            }),
            lanes: [
                LaneState::new(LaneKind::Sfu, MediaKind::Video, jitter),
                LaneState::new(LaneKind::Sfu, MediaKind::Audio, jitter),
                LaneState::new(LaneKind::Local, MediaKind::Video, jitter),
                LaneState::new(LaneKind::Local, MediaKind::Audio, jitter),
            ],
            registry,
            pool,
            events,
            closed: AtomicBool::new(false),
        })
    }

    fn lane(&self, kind: LaneKind, media: MediaKind) -> &LaneState {
        let index = match (kind, media) {
            (LaneKind::Sfu, MediaKind::Video) => 0,
            (LaneKind::Sfu, MediaKind::Audio) => 1,
            (LaneKind::Local, MediaKind::Video) => 2,
            (LaneKind::Local, MediaKind::Audio) => 3,
        };
        &self.lanes[index]
    }

    /// Activate the LOCAL lane for `sharer`. Idempotent; a different sharer
    /// re-splices (its stream has its own sequence space). Returns whether a
    /// switch happened.
    pub fn start_local_share(&self, sharer: &str) -> bool {
        let mut active = self.active.write().unwrap();
        if active.kind == LaneKind::Local && active.sharer.as_deref() == Some(sharer) {
            return false;
        }
        active.kind = LaneKind::Local;
        active.generation += 1;
        active.sharer = Some(sharer.to_string());
        drop(active);
        self.reset_jitter();
        true
    }

    /// Return to the SFU lane. Idempotent.
    pub fn stop_local_share(&self) -> bool {
        let mut active = self.active.write().unwrap();
        if active.kind == LaneKind::Sfu {
            return false;
        }
        active.kind = LaneKind::Sfu;
        active.generation += 1;
        active.sharer = None;
        drop(active);
        self.reset_jitter();
        true
    }

    pub fn active_lane(&self) -> LaneKind {
        self.active.read().unwrap().kind
    }

    pub fn sharer(&self) -> Option<String> {
        self.active.read().unwrap().sharer.clone()
    }

    /// Inject one RTP packet on a lane. Never blocks on the control plane;
    /// drops (short packet, inactive lane, closed) are counted, not errors.
    pub async fn inject(&self, kind: LaneKind, media: MediaKind, payload: &[u8]) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let lane = self.lane(kind, media);
        let header = match RtpHeader::parse(payload) {
            Ok(header) => header,
            Err(_) => {
                lane.drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        lane.observe(&header, payload.len());

        let (is_active, generation) = {
            let active = self.active.read().unwrap();
            (active.kind == kind, active.generation)
        };
        if !is_active {
            // Expected while a switch propagates; no I/O, no error
            lane.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if lane.payload_type_changed(header.payload_type) {
            tracing::info!(%media, payload_type = header.payload_type, "ingress codec changed");
            let _ = self.events.send(RoomEvent::RenegotiationNeeded { media });
        }

        match &lane.jitter {
            None => self.fan_out(&header, media, generation, payload).await,
            Some(jitter) => {
                let now = Instant::now();
                let due = {
                    let mut buffer = jitter.lock().unwrap();
                    if !buffer.push(header.sequence, Bytes::copy_from_slice(payload), now) {
                        lane.drops.fetch_add(1, Ordering::Relaxed);
                    }
                    buffer.pop_ready(now)
                };
                self.forward_released(media, generation, due).await;
            }
        }
    }

    /// Release packets whose smoothing delay expired on the active lanes.
    /// Driven from the coordinator tick so a paused source cannot strand
    /// buffered packets.
    pub async fn drain_jitter(&self, now: Instant) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let (kind, generation) = {
            let active = self.active.read().unwrap();
            (active.kind, active.generation)
        };
        for media in [MediaKind::Video, MediaKind::Audio] {
            let lane = self.lane(kind, media);
            if let Some(jitter) = &lane.jitter {
                let due = jitter.lock().unwrap().pop_ready(now);
                self.forward_released(media, generation, due).await;
            }
        }
    }

    async fn forward_released(&self, media: MediaKind, generation: u64, packets: Vec<Bytes>) {
        for data in packets {
            if let Ok(header) = RtpHeader::parse(&data) {
                self.fan_out(&header, media, generation, &data).await;
            }
        }
    }

    /// Rewrite per subscriber and write to each writable track. A write
    /// failure on one subscriber is counted and does not stop the others.
    async fn fan_out(&self, header: &RtpHeader, media: MediaKind, generation: u64, payload: &[u8]) {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut buf = self.pool.acquire(payload.len());
        buf.copy_from_slice(payload);

        for subscriber in snapshot.iter() {
            if !subscriber.writable() {
                continue;
            }
            let track = subscriber.track(media);
            if !track.rewrite(header, generation, now, &mut buf) {
                continue;
            }
            match track.sink().write_rtp(&buf).await {
                Ok(()) => track.record_write(buf.len()),
                Err(err) => {
                    track.record_write_failure();
                    tracing::debug!(
                        peer_id = %subscriber.peer_id,
                        %media,
                        "dropping packet for subscriber: {err}"
                    );
                }
            }
        }
        // `buf` returns to the pool here, after all subscriber writes
    }

    pub fn stats(&self) -> SwitcherStats {
        let active = self.active.read().unwrap();
        SwitcherStats {
            active_lane: active.kind,
            sharer_id: active.sharer.clone(),
            lanes: self.lanes.iter().map(LaneState::stats).collect(),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn reset_jitter(&self) {
        for lane in &self.lanes {
            if let Some(jitter) = &lane.jitter {
                jitter.lock().unwrap().reset();
            }
        }
    }
}
