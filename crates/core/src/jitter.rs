//! Optional per-lane reorder and smoothing buffer.
//!
//! Disabled by default; the direct forwarding path bypasses it entirely.
//! When enabled, packets are reinserted in sequence order and released
//! `target_delay` after arrival, so short bursts of reordering upstream do
//! not reach subscribers. The buffer is bounded and drops on overflow.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lancast_protocol::{JitterConfig, seq_diff};

struct BufferedPacket {
    sequence: u16,
    arrival: Instant,
    data: Bytes,
}

/// Statistics for monitoring jitter buffer health
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JitterStats {
    pub packets_received: u64,
    pub packets_released: u64,
    pub packets_dropped_late: u64,
    pub packets_dropped_duplicate: u64,
    pub packets_dropped_overflow: u64,
    pub packets_reordered: u64,
}

/// Reorders packets by sequence number and releases each one
/// `target_delay` after it arrived.
pub struct JitterBuffer {
    packets: VecDeque<BufferedPacket>,
    target_delay: Duration,
    late_threshold: u16,
    max_packets: usize,
    /// Sequence of the most recently released packet
    last_released: Option<u16>,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: &JitterConfig) -> Self {
        Self {
            packets: VecDeque::with_capacity(config.max_packets.min(64)),
            target_delay: Duration::from_millis(config.target_delay_ms),
            late_threshold: config.late_threshold,
            max_packets: config.max_packets,
            last_released: None,
            stats: JitterStats::default(),
        }
    }

    /// Insert a packet. Returns false if it was dropped (late, duplicate,
    /// or pushed out by overflow).
    pub fn push(&mut self, sequence: u16, data: Bytes, now: Instant) -> bool {
        self.stats.packets_received += 1;

        // Already played out, or hopelessly behind the newest packet
        if let Some(last) = self.last_released
            && seq_diff(last, sequence) <= 0
        {
            self.stats.packets_dropped_late += 1;
            return false;
        }
        if let Some(newest) = self.packets.back()
            && seq_diff(sequence, newest.sequence) > self.late_threshold as i32
        {
            self.stats.packets_dropped_late += 1;
            return false;
        }

        let packet = BufferedPacket {
            sequence,
            arrival: now,
            data,
        };

        match self.insert_position(sequence) {
            InsertAt::Duplicate => {
                self.stats.packets_dropped_duplicate += 1;
                return false;
            }
            InsertAt::Back => self.packets.push_back(packet),
            InsertAt::Index(pos) => {
                self.stats.packets_reordered += 1;
                self.packets.insert(pos, packet);
            }
        }

        while self.packets.len() > self.max_packets {
            self.packets.pop_front();
            self.stats.packets_dropped_overflow += 1;
        }

        true
    }

    /// Release every packet whose smoothing delay has elapsed, oldest first.
    pub fn pop_ready(&mut self, now: Instant) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(front) = self.packets.front() {
            if now.duration_since(front.arrival) < self.target_delay {
                break;
            }
            let packet = self.packets.pop_front().unwrap();
            self.last_released = Some(packet.sequence);
            self.stats.packets_released += 1;
            out.push(packet.data);
        }
        out
    }

    /// Binary search for the insertion point that keeps sequence order.
    fn insert_position(&self, sequence: u16) -> InsertAt {
        if self
            .packets
            .back()
            .is_none_or(|newest| seq_diff(newest.sequence, sequence) > 0)
        {
            return InsertAt::Back;
        }

        let mut left = 0;
        let mut right = self.packets.len();
        while left < right {
            let mid = (left + right) / 2;
            match seq_diff(self.packets[mid].sequence, sequence) {
                0 => return InsertAt::Duplicate,
                d if d > 0 => left = mid + 1,
                _ => right = mid,
            }
        }
        if left < self.packets.len() && self.packets[left].sequence == sequence {
            return InsertAt::Duplicate;
        }
        InsertAt::Index(left)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    /// Drop everything, e.g. when the lane re-activates after a switch.
    pub fn reset(&mut self) {
        self.packets.clear();
        self.last_released = None;
    }
}

enum InsertAt {
    Back,
    Index(usize),
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(delay_ms: u64) -> JitterConfig {
        JitterConfig {
            enabled: true,
            target_delay_ms: delay_ms,
            late_threshold: 64,
            max_packets: 16,
        }
    }

    fn payload(n: u16) -> Bytes {
        Bytes::copy_from_slice(&n.to_be_bytes())
    }

    #[test]
    fn holds_packets_for_target_delay() {
        let mut buf = JitterBuffer::new(&config(50));
        let t0 = Instant::now();
        buf.push(1, payload(1), t0);
        assert!(buf.pop_ready(t0 + Duration::from_millis(10)).is_empty());
        let out = buf.pop_ready(t0 + Duration::from_millis(50));
        assert_eq!(out, vec![payload(1)]);
    }

    #[test]
    fn reorders_out_of_order_arrivals() {
        let mut buf = JitterBuffer::new(&config(10));
        let t0 = Instant::now();
        for seq in [5u16, 3, 4, 1, 2] {
            buf.push(seq, payload(seq), t0);
        }
        let out = buf.pop_ready(t0 + Duration::from_millis(20));
        let seqs: Vec<u16> = out
            .iter()
            .map(|d| u16::from_be_bytes([d[0], d[1]]))
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(buf.stats().packets_reordered, 3);
    }

    #[test]
    fn reorders_across_wraparound() {
        let mut buf = JitterBuffer::new(&config(0));
        let t0 = Instant::now();
        for seq in [65_534u16, 1, 65_535, 0] {
            buf.push(seq, payload(seq), t0);
        }
        let out = buf.pop_ready(t0);
        let seqs: Vec<u16> = out
            .iter()
            .map(|d| u16::from_be_bytes([d[0], d[1]]))
            .collect();
        assert_eq!(seqs, vec![65_534, 65_535, 0, 1]);
    }

    #[test]
    fn drops_duplicates() {
        let mut buf = JitterBuffer::new(&config(10));
        let t0 = Instant::now();
        assert!(buf.push(7, payload(7), t0));
        assert!(!buf.push(7, payload(7), t0));
        assert_eq!(buf.stats().packets_dropped_duplicate, 1);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn drops_packets_behind_playout() {
        let mut buf = JitterBuffer::new(&config(0));
        let t0 = Instant::now();
        buf.push(10, payload(10), t0);
        assert_eq!(buf.pop_ready(t0).len(), 1);
        // 10 released; 9 is late now
        assert!(!buf.push(9, payload(9), t0));
        assert_eq!(buf.stats().packets_dropped_late, 1);
    }

    #[test]
    fn drops_far_behind_head() {
        let mut buf = JitterBuffer::new(&config(10));
        let t0 = Instant::now();
        buf.push(1000, payload(1000), t0);
        // 64 behind the newest — beyond the late threshold
        assert!(!buf.push(1000 - 65, payload(0), t0));
        assert_eq!(buf.stats().packets_dropped_late, 1);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut buf = JitterBuffer::new(&config(1000));
        let t0 = Instant::now();
        for seq in 0..20u16 {
            buf.push(seq, payload(seq), t0);
        }
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.stats().packets_dropped_overflow, 4);
    }

    #[test]
    fn reset_clears_playout_state() {
        let mut buf = JitterBuffer::new(&config(0));
        let t0 = Instant::now();
        buf.push(100, payload(100), t0);
        buf.pop_ready(t0);
        buf.reset();
        // Sequence numbers from a fresh source are accepted again
        assert!(buf.push(5, payload(5), t0));
    }
}
