//! Relay election scorer.
//!
//! A pure function from observed device attributes to a suitability score.
//! Identical inputs always produce identical outputs; all arbitration
//! determinism rests on that.

use lancast_protocol::{DeviceClass, DeviceProfile, ElectionConfig, LinkType, NetMetrics,
                       PowerSource};

// Net-adjustment mix (fixed): bandwidth and latency dominate, loss corrects.
const NET_BW_WEIGHT: f64 = 0.4;
const NET_LAT_WEIGHT: f64 = 0.4;
const NET_LOSS_WEIGHT: f64 = 0.2;

/// Score a peer from its device profile and optional network metrics.
///
/// Without metrics the score is the plain device+link+power base (max 100).
/// With metrics, base and net adjustment are blended using the configured
/// weights (which must sum to 1; see `RelayConfig::validate`).
pub fn score(profile: &DeviceProfile, net: Option<&NetMetrics>, config: &ElectionConfig) -> f64 {
    let base = device_points(profile.device) + link_points(profile.link)
        + power_points(profile.power);

    match net {
        None => base,
        Some(metrics) => {
            let bw = (metrics.bandwidth_bps / 10_000_000.0 * 100.0).clamp(0.0, 100.0);
            let lat = (100.0 - metrics.latency_ms / 2.0).clamp(0.0, 100.0);
            let loss = ((1.0 - metrics.loss) * 100.0).clamp(0.0, 100.0);
            let net_score = NET_BW_WEIGHT * bw + NET_LAT_WEIGHT * lat + NET_LOSS_WEIGHT * loss;
            config.base_weight * base + config.net_weight * net_score
        }
    }
}

fn device_points(device: DeviceClass) -> f64 {
    match device {
        DeviceClass::Pc => 40.0,
        DeviceClass::Tv => 25.0,
        DeviceClass::Pad => 30.0,
        DeviceClass::Mobile => 20.0,
        DeviceClass::Unknown => 0.0,
    }
}

fn link_points(link: LinkType) -> f64 {
    match link {
        LinkType::Ethernet => 40.0,
        LinkType::Wifi => 30.0,
        LinkType::Cellular => 10.0,
        LinkType::Unknown => 0.0,
    }
}

fn power_points(power: PowerSource) -> f64 {
    match power {
        PowerSource::Plugged => 20.0,
        PowerSource::Battery => 10.0,
        PowerSource::LowBattery => 0.0,
        PowerSource::Unknown => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ElectionConfig {
        ElectionConfig {
            base_timer_ms: 1000,
            initial_timer_factor: 2,
            base_weight: 0.8,
            net_weight: 0.2,
        }
    }

    #[test]
    fn plugged_ethernet_pc_scores_100() {
        let profile =
            DeviceProfile::new(DeviceClass::Pc, LinkType::Ethernet, PowerSource::Plugged);
        assert_eq!(score(&profile, None, &config()), 100.0);
    }

    #[test]
    fn battery_wifi_mobile_scores_60() {
        let profile =
            DeviceProfile::new(DeviceClass::Mobile, LinkType::Wifi, PowerSource::Battery);
        assert_eq!(score(&profile, None, &config()), 60.0);
    }

    #[test]
    fn unknown_everything_scores_0() {
        assert_eq!(score(&DeviceProfile::default(), None, &config()), 0.0);
    }

    #[test]
    fn device_table_matches_documented_weights() {
        let base = |device| {
            score(
                &DeviceProfile::new(device, LinkType::Unknown, PowerSource::Unknown),
                None,
                &config(),
            )
        };
        assert_eq!(base(DeviceClass::Pc), 40.0);
        assert_eq!(base(DeviceClass::Tv), 25.0);
        assert_eq!(base(DeviceClass::Pad), 30.0);
        assert_eq!(base(DeviceClass::Mobile), 20.0);
    }

    #[test]
    fn net_metrics_blend_with_configured_weights() {
        let profile =
            DeviceProfile::new(DeviceClass::Pc, LinkType::Ethernet, PowerSource::Plugged);
        // Perfect network: 10 Mbps → 100, 0 ms → 100, 0 loss → 100
        let perfect = NetMetrics {
            bandwidth_bps: 10_000_000.0,
            latency_ms: 0.0,
            loss: 0.0,
        };
        assert_eq!(score(&profile, Some(&perfect), &config()), 100.0);

        // Dead network drags a perfect base down to base_weight * 100
        let dead = NetMetrics {
            bandwidth_bps: 0.0,
            latency_ms: 1000.0,
            loss: 1.0,
        };
        let scored = score(&profile, Some(&dead), &config());
        assert!((scored - 80.0).abs() < 1e-9);
    }

    #[test]
    fn net_contributions_are_clamped() {
        let profile = DeviceProfile::default();
        // Absurd bandwidth and negative-latency inputs stay within [0, 100]
        let metrics = NetMetrics {
            bandwidth_bps: 1e12,
            latency_ms: -50.0,
            loss: 0.0,
        };
        let scored = score(&profile, Some(&metrics), &config());
        assert!((scored - 20.0).abs() < 1e-9); // 0.2 * 100
    }

    #[test]
    fn score_is_pure() {
        let profile =
            DeviceProfile::new(DeviceClass::Pad, LinkType::Wifi, PowerSource::Battery);
        let metrics = NetMetrics {
            bandwidth_bps: 4_200_000.0,
            latency_ms: 17.0,
            loss: 0.02,
        };
        let cfg = config();
        let first = score(&profile, Some(&metrics), &cfg);
        for _ in 0..100 {
            assert_eq!(score(&profile, Some(&metrics), &cfg), first);
        }
    }
}
