//! Minimal RTP fixed-header codec (RFC 3550).
//!
//! Only the first 12 bytes are ever inspected or modified; CSRC entries,
//! header extensions and the payload pass through untouched:
//! ```text
//! [0]      V(2) P(1) X(1) CC(4)
//! [1]      M(1) PT(7)
//! [2..4]   sequence number (u16, BE)
//! [4..8]   timestamp (u32, BE)
//! [8..12]  SSRC (u32, BE)
//! ```

/// Fixed RTP header length; shorter packets are dropped on ingress.
pub const RTP_HEADER_LEN: usize = 12;

const RTP_VERSION: u8 = 2;

/// Header fields needed for per-subscriber rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse the fixed header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(RtpError::TooShort(data.len()));
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::BadVersion(version));
        }

        Ok(Self {
            padding: data[0] & 0x20 != 0,
            extension: data[0] & 0x10 != 0,
            csrc_count: data[0] & 0x0f,
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// Overwrite the sequence number in place. `buf` must hold a full header.
pub fn patch_sequence(buf: &mut [u8], sequence: u16) {
    buf[2..4].copy_from_slice(&sequence.to_be_bytes());
}

/// Overwrite the timestamp in place.
pub fn patch_timestamp(buf: &mut [u8], timestamp: u32) {
    buf[4..8].copy_from_slice(&timestamp.to_be_bytes());
}

/// Overwrite the SSRC in place.
pub fn patch_ssrc(buf: &mut [u8], ssrc: u32) {
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
}

/// Wrap-aware distance from `a` to `b` in sequence-number space.
///
/// Positive when `b` is ahead of `a`, negative when it lags; the result is
/// exact for gaps smaller than 2^15.
pub fn seq_diff(a: u16, b: u16) -> i32 {
    let diff = b.wrapping_sub(a);
    if diff < 0x8000 {
        diff as i32
    } else {
        diff as i32 - 0x10000
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RtpError {
    #[error("packet too short: {0} bytes (need at least {RTP_HEADER_LEN})")]
    TooShort(usize),
    #[error("unsupported RTP version: {0} (expected {RTP_VERSION})")]
    BadVersion(u8),
}
