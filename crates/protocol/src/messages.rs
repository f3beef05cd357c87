use serde::{Deserialize, Serialize};

use crate::profile::DeviceProfile;

/// Signalling envelope exchanged between peers over the embedder's transport.
///
/// The transport is assumed reliable, ordered per sender, and
/// broadcast-capable; the envelope itself is transport-agnostic JSON:
///
/// ```json
/// { "type": "...", "roomId": "...", "peerId": "...",
///   "targetPeerId": "...", "data": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Room this message belongs to.
    pub room_id: String,
    /// Sender peer id.
    pub peer_id: String,
    /// Recipient peer id; absent for broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<String>,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

/// Typed payload of a signalling message.
///
/// `type` selects the variant; variant fields live under `data`. Unit
/// variants omit `data` entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum SignalPayload {
    /// Peer enters the room, announcing its device profile.
    Join(DeviceProfile),
    /// Peer leaves the room.
    Leave,
    /// Liveness probe; the recipient answers with `pong`.
    Ping,
    /// Answer to a `ping`.
    Pong,
    /// "I would like to be the relay" — sent on entering an election.
    #[serde(rename_all = "camelCase")]
    RelayClaim { epoch: u64, score: f64 },
    /// "This peer is now the relay" — sent by the winner, and to late joiners.
    #[serde(rename_all = "camelCase")]
    RelayChanged {
        relay_id: String,
        epoch: u64,
        score: f64,
    },
    /// WebRTC SDP offer (subscriber → relay, or relay renegotiation).
    Offer { sdp: String },
    /// WebRTC SDP answer.
    Answer { sdp: String },
    /// Trickled ICE candidate.
    #[serde(rename_all = "camelCase")]
    Candidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            rename = "sdpMLineIndex"
        )]
        sdp_mline_index: Option<u16>,
    },
}

impl SignalEnvelope {
    /// Broadcast envelope (no target).
    pub fn broadcast(room_id: &str, peer_id: &str, payload: SignalPayload) -> Self {
        Self {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            target_peer_id: None,
            payload,
        }
    }

    /// Directed envelope.
    pub fn to_peer(room_id: &str, peer_id: &str, target: &str, payload: SignalPayload) -> Self {
        Self {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            target_peer_id: Some(target.to_string()),
            payload,
        }
    }

    /// Whether this envelope is addressed to `peer_id` (directed) or to
    /// everyone (broadcast).
    pub fn targets(&self, peer_id: &str) -> bool {
        match &self.target_peer_id {
            Some(target) => target == peer_id,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{DeviceClass, LinkType, PowerSource};

    #[test]
    fn join_wire_shape() {
        let msg = SignalEnvelope::broadcast(
            "room-1",
            "p1",
            SignalPayload::Join(DeviceProfile::new(
                DeviceClass::Pc,
                LinkType::Ethernet,
                PowerSource::Plugged,
            )),
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"join""#));
        assert!(json.contains(r#""roomId":"room-1""#));
        assert!(json.contains(r#""peerId":"p1""#));
        assert!(json.contains(r#""data":{"device":1,"link":1,"power":1}"#));
        // Broadcast — no target key at all
        assert!(!json.contains("targetPeerId"));

        let parsed: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn unit_payloads_omit_data() {
        for (payload, tag) in [
            (SignalPayload::Leave, "leave"),
            (SignalPayload::Ping, "ping"),
            (SignalPayload::Pong, "pong"),
        ] {
            let msg = SignalEnvelope::broadcast("r", "p", payload.clone());
            let json = serde_json::to_string(&msg).unwrap();
            assert!(json.contains(&format!(r#""type":"{tag}""#)));
            assert!(!json.contains("data"));
            let parsed: SignalEnvelope = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.payload, payload);
        }
    }

    #[test]
    fn relay_claim_roundtrip() {
        let msg = SignalEnvelope::broadcast(
            "r",
            "p2",
            SignalPayload::RelayClaim {
                epoch: 3,
                score: 87.5,
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"relayClaim""#));
        assert!(json.contains(r#""epoch":3"#));
        let parsed: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn relay_changed_uses_camel_case_relay_id() {
        let msg = SignalEnvelope::broadcast(
            "r",
            "p1",
            SignalPayload::RelayChanged {
                relay_id: "p1".into(),
                epoch: 1,
                score: 100.0,
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""relayId":"p1""#));
        assert!(!json.contains("relay_id"));
    }

    #[test]
    fn candidate_field_casing() {
        let msg = SignalEnvelope::to_peer(
            "r",
            "sub",
            "relay",
            SignalPayload::Candidate {
                candidate: "candidate:1 1 UDP 2130706431 192.168.1.7 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        // Exact casing matters for interop with the embedder's WebRTC side
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));
        assert!(json.contains(r#""targetPeerId":"relay""#));

        let parsed: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn candidate_optional_fields_absent() {
        let json = r#"{"type":"candidate","roomId":"r","peerId":"p",
                       "data":{"candidate":"candidate:1"}}"#;
        let parsed: SignalEnvelope = serde_json::from_str(json).unwrap();
        match parsed.payload {
            SignalPayload::Candidate {
                sdp_mid,
                sdp_mline_index,
                ..
            } => {
                assert_eq!(sdp_mid, None);
                assert_eq!(sdp_mline_index, None);
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_rejected() {
        let json = r#"{"type":"teleport","roomId":"r","peerId":"p"}"#;
        assert!(serde_json::from_str::<SignalEnvelope>(json).is_err());
    }

    #[test]
    fn missing_fields_rejected() {
        // relayChanged without its data payload
        let json = r#"{"type":"relayChanged","roomId":"r","peerId":"p"}"#;
        assert!(serde_json::from_str::<SignalEnvelope>(json).is_err());
    }

    #[test]
    fn targets_matches_directed_and_broadcast() {
        let directed = SignalEnvelope::to_peer("r", "a", "b", SignalPayload::Ping);
        assert!(directed.targets("b"));
        assert!(!directed.targets("c"));

        let broadcast = SignalEnvelope::broadcast("r", "a", SignalPayload::Ping);
        assert!(broadcast.targets("b"));
        assert!(broadcast.targets("c"));
    }
}
