use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub jitter: JitterConfig,
    /// Minimum spacing between upstream keyframe requests, per room.
    #[serde(default = "default_keyframe_min_interval")]
    pub keyframe_min_interval_ms: u64,
}

/// ICE/TURN server configuration handed to the WebRTC stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (for long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

/// Codec parameters for the outbound tracks offered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_video_mime")]
    pub video_mime: String,
    /// Video RTP clock rate in Hz
    #[serde(default = "default_video_clock")]
    pub video_clock: u32,
    #[serde(default = "default_audio_mime")]
    pub audio_mime: String,
    /// Audio RTP clock rate in Hz
    #[serde(default = "default_audio_clock")]
    pub audio_clock: u32,
    #[serde(default = "default_audio_channels")]
    pub audio_channels: u16,
}

/// Ping/pong liveness tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Ping interval in milliseconds
    #[serde(default = "default_keepalive_interval")]
    pub interval_ms: u64,
    /// How long an unanswered ping counts as one miss
    #[serde(default = "default_keepalive_timeout")]
    pub timeout_ms: u64,
    /// RTT above this is reported as `slow` (informational)
    #[serde(default = "default_slow_threshold")]
    pub slow_threshold_ms: u64,
    /// Consecutive misses before a peer is declared offline
    #[serde(default = "default_offline_misses")]
    pub offline_after_misses: u32,
}

/// Relay election tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Election timer in milliseconds
    #[serde(default = "default_election_timer")]
    pub base_timer_ms: u64,
    /// First election waits this many times longer, giving an existing
    /// relay time to announce itself
    #[serde(default = "default_initial_timer_factor")]
    pub initial_timer_factor: u32,
    /// Weight of the device/link/power base score
    #[serde(default = "default_base_weight")]
    pub base_weight: f64,
    /// Weight of the optional network-metrics adjustment
    #[serde(default = "default_net_weight")]
    pub net_weight: f64,
}

/// Optional per-lane reorder/smoothing buffer. Disabled by default; the
/// direct forwarding path bypasses it entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitterConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Packets are released `target_delay_ms` after arrival
    #[serde(default = "default_jitter_delay")]
    pub target_delay_ms: u64,
    /// Packets this many sequence numbers behind the head are dropped
    #[serde(default = "default_late_threshold")]
    pub late_threshold: u16,
    /// Hard bound; the oldest packet is dropped on overflow
    #[serde(default = "default_jitter_capacity")]
    pub max_packets: usize,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_mime: default_video_mime(),
            video_clock: default_video_clock(),
            audio_mime: default_audio_mime(),
            audio_clock: default_audio_clock(),
            audio_channels: default_audio_channels(),
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_keepalive_interval(),
            timeout_ms: default_keepalive_timeout(),
            slow_threshold_ms: default_slow_threshold(),
            offline_after_misses: default_offline_misses(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            base_timer_ms: default_election_timer(),
            initial_timer_factor: default_initial_timer_factor(),
            base_weight: default_base_weight(),
            net_weight: default_net_weight(),
        }
    }
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_delay_ms: default_jitter_delay(),
            late_threshold: default_late_threshold(),
            max_packets: default_jitter_capacity(),
        }
    }
}

impl RelayConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the engine should not
    /// start) or "WARNING:" (advisory).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found
    /// problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.keepalive.interval_ms == 0 {
            issues.push("ERROR: keepalive.interval_ms must be greater than 0".to_string());
        }
        if self.keepalive.timeout_ms < self.keepalive.interval_ms {
            issues.push(format!(
                "WARNING: keepalive.timeout_ms ({}) is below interval_ms ({}); \
                 every ping will count as a miss before the next one is sent",
                self.keepalive.timeout_ms, self.keepalive.interval_ms
            ));
        }
        if self.keepalive.offline_after_misses == 0 {
            issues.push("ERROR: keepalive.offline_after_misses must be at least 1".to_string());
        }

        if self.election.base_timer_ms == 0 {
            issues.push("ERROR: election.base_timer_ms must be greater than 0".to_string());
        }
        if self.election.initial_timer_factor == 0 {
            issues.push("ERROR: election.initial_timer_factor must be at least 1".to_string());
        }
        let weight_sum = self.election.base_weight + self.election.net_weight;
        if (weight_sum - 1.0).abs() > 1e-9 {
            issues.push(format!(
                "ERROR: election.base_weight + election.net_weight must sum to 1 (got {weight_sum})"
            ));
        }

        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: turn_urls configured without turn_username/turn_credential; \
                 TURN allocation will fail"
                    .to_string(),
            );
        }

        if self.media.video_clock == 0 || self.media.audio_clock == 0 {
            issues.push("ERROR: media clock rates must be greater than 0".to_string());
        }

        if self.jitter.enabled {
            if self.jitter.max_packets == 0 {
                issues.push("ERROR: jitter.max_packets must be greater than 0".to_string());
            }
            if self.jitter.target_delay_ms > 1000 {
                issues.push(format!(
                    "WARNING: jitter.target_delay_ms ({}) exceeds 1s; interactive media \
                     will feel sluggish",
                    self.jitter.target_delay_ms
                ));
            }
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

fn default_video_mime() -> String {
    "video/VP8".to_string()
}

fn default_video_clock() -> u32 {
    90_000
}

fn default_audio_mime() -> String {
    "audio/opus".to_string()
}

fn default_audio_clock() -> u32 {
    48_000
}

fn default_audio_channels() -> u16 {
    2
}

fn default_keepalive_interval() -> u64 {
    1000
}

fn default_keepalive_timeout() -> u64 {
    1500
}

fn default_slow_threshold() -> u64 {
    200
}

fn default_offline_misses() -> u32 {
    2
}

fn default_election_timer() -> u64 {
    1000
}

fn default_initial_timer_factor() -> u32 {
    2
}

fn default_base_weight() -> f64 {
    0.8
}

fn default_net_weight() -> f64 {
    0.2
}

fn default_jitter_delay() -> u64 {
    60
}

fn default_late_threshold() -> u16 {
    64
}

fn default_jitter_capacity() -> usize {
    512
}

fn default_keyframe_min_interval() -> u64 {
    1000
}
