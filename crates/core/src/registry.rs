//! Outbound track registry.
//!
//! Remembers the sendonly tracks added to each subscriber peer connection and
//! owns the per-track rewrite state that splices ingress sources onto each
//! subscriber's private output timeline. The subscriber set is a
//! copy-on-write snapshot: the control plane rebuilds the vector under a
//! short write lock, the data plane clones the `Arc` under a short read lock
//! and then works lock-free.
//!
//! Rewrite offsets live here, on the subscriber track, not on the ingress
//! lane: every subscriber joined at a different moment and therefore has an
//! independent timeline. The lane only contributes the *switch generation*
//! that tells a track when to re-anchor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use lancast_protocol::rtp::{self, RtpHeader};
use rand::Rng;

use crate::stack::{IceLinkState, MediaKind, RtpSink};

/// Fallback inter-frame gap when a track has never been written: one video
/// frame at ~30 fps, one audio frame at 20 ms.
const DEFAULT_VIDEO_GAP_MS: u64 = 33;
const DEFAULT_AUDIO_GAP_MS: u64 = 20;

/// Cap on the timestamp gap spliced in at a source switch.
const MAX_SPLICE_GAP_MS: u64 = 33;

#[derive(Debug, Default)]
struct RewriteState {
    /// Switch generation this track last anchored at; 0 = never anchored.
    anchored_generation: u64,
    seq_offset: u16,
    ts_offset: u32,
    last_seq: Option<u16>,
    last_ts: Option<u32>,
    last_write: Option<Instant>,
}

/// Counters for one outbound track, readable without locks.
#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackCounters {
    pub packets_out: u64,
    pub bytes_out: u64,
    pub write_failures: u64,
    pub rewrites: u64,
}

/// One outbound track of one subscriber: the stack sink plus the rewrite
/// state that keeps its sequence numbers, timestamps and SSRC coherent
/// across source switches.
pub struct RewriteTrack {
    sink: Arc<dyn RtpSink>,
    kind: MediaKind,
    clock_rate: u32,
    /// Synthetic SSRC, chosen at subscriber creation, constant for the
    /// lifetime of the entry.
    ssrc: u32,
    state: Mutex<RewriteState>,
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
    write_failures: AtomicU64,
    rewrites: AtomicU64,
}

impl RewriteTrack {
    fn new(sink: Arc<dyn RtpSink>, kind: MediaKind, clock_rate: u32, ssrc: u32) -> Self {
        Self {
            sink,
            kind,
            clock_rate,
            ssrc,
            state: Mutex::new(RewriteState::default()),
            packets_out: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            rewrites: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sink(&self) -> &Arc<dyn RtpSink> {
        &self.sink
    }

    /// Rewrite the packet in `buf` for this track.
    ///
    /// On the first packet of a newer switch generation the track re-anchors:
    /// the packet continues the output timeline at `last_seq + 1` and
    /// `last_ts + gap`, hiding the source discontinuity from the decoder.
    /// Packets from an older generation (a lane that has already been
    /// switched away from) are rejected.
    pub fn rewrite(
        &self,
        header: &RtpHeader,
        generation: u64,
        now: Instant,
        buf: &mut [u8],
    ) -> bool {
        let (seq, ts) = {
            let mut state = self.state.lock().unwrap();
            if generation < state.anchored_generation {
                return false;
            }
            if generation > state.anchored_generation {
                let next_seq = state.last_seq.map(|s| s.wrapping_add(1)).unwrap_or(1);
                state.seq_offset = next_seq.wrapping_sub(header.sequence);
                let target_ts = state
                    .last_ts
                    .unwrap_or(0)
                    .wrapping_add(self.splice_gap(&state, now));
                state.ts_offset = target_ts.wrapping_sub(header.timestamp);
                state.anchored_generation = generation;
            }

            let seq = header.sequence.wrapping_add(state.seq_offset);
            let ts = header.timestamp.wrapping_add(state.ts_offset);
            state.last_seq = Some(seq);
            state.last_ts = Some(ts);
            state.last_write = Some(now);
            (seq, ts)
        };

        rtp::patch_sequence(buf, seq);
        rtp::patch_timestamp(buf, ts);
        rtp::patch_ssrc(buf, self.ssrc);
        self.rewrites.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Timestamp advance applied at an anchor point, in clock ticks:
    /// `clock_rate × min(33 ms, elapsed since last write)`, or one nominal
    /// frame when the track was never written. Never zero, so timestamps
    /// move strictly forward across a splice.
    fn splice_gap(&self, state: &RewriteState, now: Instant) -> u32 {
        let gap_us = match state.last_write {
            Some(prev) => {
                let elapsed = now.saturating_duration_since(prev);
                elapsed
                    .min(std::time::Duration::from_millis(MAX_SPLICE_GAP_MS))
                    .as_micros() as u64
            }
            None => {
                let default_ms = match self.kind {
                    MediaKind::Video => DEFAULT_VIDEO_GAP_MS,
                    MediaKind::Audio => DEFAULT_AUDIO_GAP_MS,
                };
                default_ms * 1000
            }
        };
        ((self.clock_rate as u64 * gap_us / 1_000_000) as u32).max(1)
    }

    pub fn record_write(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> TrackCounters {
        TrackCounters {
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            rewrites: self.rewrites.load(Ordering::Relaxed),
        }
    }
}

/// All engine state attached to one subscriber's peer connection.
pub struct SubscriberSink {
    pub peer_id: String,
    video: RewriteTrack,
    audio: RewriteTrack,
    /// True once ICE reached `connected`, cleared forever on
    /// `failed`/`closed`. Packets are only written while this holds.
    writable: AtomicBool,
    ice_state: Mutex<IceLinkState>,
}

impl SubscriberSink {
    pub fn new(
        peer_id: &str,
        video_sink: Arc<dyn RtpSink>,
        audio_sink: Arc<dyn RtpSink>,
        video_clock: u32,
        audio_clock: u32,
    ) -> Arc<Self> {
        let mut rng = rand::thread_rng();
        Arc::new(Self {
            peer_id: peer_id.to_string(),
            video: RewriteTrack::new(video_sink, MediaKind::Video, video_clock, rng.r#gen()),
            audio: RewriteTrack::new(audio_sink, MediaKind::Audio, audio_clock, rng.r#gen()),
            writable: AtomicBool::new(false),
            ice_state: Mutex::new(IceLinkState::New),
        })
    }

    pub fn track(&self, kind: MediaKind) -> &RewriteTrack {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    pub fn writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }

    pub fn ice_state(&self) -> IceLinkState {
        *self.ice_state.lock().unwrap()
    }

    /// Apply an ICE transition. Returns true when this is the first time the
    /// connection reached `connected` (the moment to solicit a keyframe).
    /// `failed`/`closed` are sticky: nothing revives a dead entry.
    pub fn apply_ice_state(&self, state: IceLinkState) -> bool {
        let mut guard = self.ice_state.lock().unwrap();
        if guard.is_terminal() {
            return false;
        }
        *guard = state;
        drop(guard);

        match state {
            IceLinkState::Connected => !self.writable.swap(true, Ordering::Relaxed),
            IceLinkState::Failed | IceLinkState::Closed => {
                self.writable.store(false, Ordering::Relaxed);
                false
            }
            // `disconnected` may recover; keep writing until ICE gives up
            _ => false,
        }
    }
}

/// Copy-on-write set of subscriber sinks.
#[derive(Default)]
pub struct TrackRegistry {
    subscribers: RwLock<Arc<Vec<Arc<SubscriberSink>>>>,
}

impl TrackRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert (or replace) the sink for a peer. At most one entry per peer
    /// id exists at any time.
    pub fn insert(&self, sink: Arc<SubscriberSink>) {
        let mut guard = self.subscribers.write().unwrap();
        let mut next: Vec<Arc<SubscriberSink>> = guard
            .iter()
            .filter(|s| s.peer_id != sink.peer_id)
            .cloned()
            .collect();
        next.push(sink);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, peer_id: &str) -> Option<Arc<SubscriberSink>> {
        let mut guard = self.subscribers.write().unwrap();
        let removed = guard.iter().find(|s| s.peer_id == peer_id).cloned()?;
        *guard = Arc::new(
            guard
                .iter()
                .filter(|s| s.peer_id != peer_id)
                .cloned()
                .collect(),
        );
        Some(removed)
    }

    pub fn clear(&self) -> Vec<Arc<SubscriberSink>> {
        let mut guard = self.subscribers.write().unwrap();
        let drained = guard.to_vec();
        *guard = Arc::new(Vec::new());
        drained
    }

    /// Lock-free view for the fan-out path; the `Arc` clone is the only
    /// thing done under the read lock.
    pub fn snapshot(&self) -> Arc<Vec<Arc<SubscriberSink>>> {
        self.subscribers.read().unwrap().clone()
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<SubscriberSink>> {
        self.snapshot()
            .iter()
            .find(|s| s.peer_id == peer_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Route an ICE transition to the sink. Returns `Some(first_connect)`
    /// when the peer is known.
    pub fn apply_ice_state(&self, peer_id: &str, state: IceLinkState) -> Option<bool> {
        self.get(peer_id).map(|sink| sink.apply_ice_state(state))
    }
}
