//! Threshold evaluator
//!
//! Walks a host's published rates after each tick and reports the first
//! enabled rule whose moving average exceeds its threshold. The rule order
//! is fixed so the reported trigger is deterministic across runs:
//! TCP-SYN pps, TCP pps, UDP pps, ICMP pps, TCP bps, UDP bps, ICMP bps,
//! overall pps, overall bps, flows/s. Incoming is checked before outgoing
//! within each rule.

use crate::config::BanSettings;
use crate::core::{ema_to_mbps, SectionEma, ThresholdDirection, ThresholdType, TrafficRates};

/// A rule that fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdHit {
    pub threshold: ThresholdType,
    pub direction: ThresholdDirection,
    /// Value of the exceeded metric (pps, mbps or flows/s)
    pub rate: u64,
}

fn pps(section: &SectionEma, direction: ThresholdDirection) -> u64 {
    match direction {
        ThresholdDirection::Outgoing => section.outgoing.packets.round() as u64,
        _ => section.incoming.packets.round() as u64,
    }
}

fn mbps(section: &SectionEma, direction: ThresholdDirection) -> u64 {
    match direction {
        ThresholdDirection::Outgoing => ema_to_mbps(section.outgoing.bytes),
        _ => ema_to_mbps(section.incoming.bytes),
    }
}

fn flows(section: &SectionEma, direction: ThresholdDirection) -> u64 {
    match direction {
        ThresholdDirection::Outgoing => section.outgoing.flows.round() as u64,
        _ => section.incoming.flows.round() as u64,
    }
}

/// Current value of the metric a given rule watches; used both for
/// evaluation and for peak tracking of an active attack
pub fn metric_value(rates: &TrafficRates, threshold: ThresholdType, direction: ThresholdDirection) -> u64 {
    let average = &rates.average;
    match threshold {
        ThresholdType::TcpSynPacketsPerSecond => pps(&average.tcp_syn, direction),
        ThresholdType::TcpSynBytesPerSecond => mbps(&average.tcp_syn, direction),
        ThresholdType::TcpPacketsPerSecond => pps(&average.tcp, direction),
        ThresholdType::UdpPacketsPerSecond => pps(&average.udp, direction),
        ThresholdType::IcmpPacketsPerSecond => pps(&average.icmp, direction),
        ThresholdType::TcpBytesPerSecond => mbps(&average.tcp, direction),
        ThresholdType::UdpBytesPerSecond => mbps(&average.udp, direction),
        ThresholdType::IcmpBytesPerSecond => mbps(&average.icmp, direction),
        ThresholdType::PacketsPerSecond => pps(&average.total, direction),
        ThresholdType::BytesPerSecond => mbps(&average.total, direction),
        ThresholdType::FlowsPerSecond => flows(&average.total, direction),
        ThresholdType::Unknown => 0,
    }
}

struct Rule {
    enabled: bool,
    threshold: u64,
    kind: ThresholdType,
}

/// Evaluate one host against a policy. Returns the first rule that
/// exceeds, or `None` when the host is within policy.
pub fn evaluate(rates: &TrafficRates, ban: &BanSettings) -> Option<ThresholdHit> {
    if !ban.enable_ban {
        return None;
    }

    let rules = [
        Rule {
            enabled: ban.enable_ban_for_tcp_syn_pps,
            threshold: ban.threshold_tcp_syn_pps,
            kind: ThresholdType::TcpSynPacketsPerSecond,
        },
        Rule {
            enabled: ban.enable_ban_for_tcp_pps,
            threshold: ban.threshold_tcp_pps,
            kind: ThresholdType::TcpPacketsPerSecond,
        },
        Rule {
            enabled: ban.enable_ban_for_udp_pps,
            threshold: ban.threshold_udp_pps,
            kind: ThresholdType::UdpPacketsPerSecond,
        },
        Rule {
            enabled: ban.enable_ban_for_icmp_pps,
            threshold: ban.threshold_icmp_pps,
            kind: ThresholdType::IcmpPacketsPerSecond,
        },
        Rule {
            enabled: ban.enable_ban_for_tcp_bandwidth,
            threshold: ban.threshold_tcp_mbps,
            kind: ThresholdType::TcpBytesPerSecond,
        },
        Rule {
            enabled: ban.enable_ban_for_udp_bandwidth,
            threshold: ban.threshold_udp_mbps,
            kind: ThresholdType::UdpBytesPerSecond,
        },
        Rule {
            enabled: ban.enable_ban_for_icmp_bandwidth,
            threshold: ban.threshold_icmp_mbps,
            kind: ThresholdType::IcmpBytesPerSecond,
        },
        Rule {
            enabled: ban.enable_ban_for_pps,
            threshold: ban.threshold_pps,
            kind: ThresholdType::PacketsPerSecond,
        },
        Rule {
            enabled: ban.enable_ban_for_bandwidth,
            threshold: ban.threshold_mbps,
            kind: ThresholdType::BytesPerSecond,
        },
        Rule {
            enabled: ban.enable_ban_for_flows_per_second,
            threshold: ban.threshold_flows,
            kind: ThresholdType::FlowsPerSecond,
        },
    ];

    for rule in &rules {
        if !rule.enabled {
            continue;
        }
        for direction in [ThresholdDirection::Incoming, ThresholdDirection::Outgoing] {
            let value = metric_value(rates, rule.kind, direction);
            if value > rule.threshold {
                return Some(ThresholdHit {
                    threshold: rule.kind,
                    direction,
                    rate: value,
                });
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed(threshold_pps: u64) -> BanSettings {
        let mut ban = BanSettings::default();
        ban.enable_ban = true;
        ban.enable_ban_for_pps = true;
        ban.threshold_pps = threshold_pps;
        ban
    }

    fn rates_with_incoming_pps(pps: f64) -> TrafficRates {
        let mut rates = TrafficRates::default();
        rates.average.total.incoming.packets = pps;
        rates
    }

    #[test]
    fn test_within_policy_no_hit() {
        let rates = rates_with_incoming_pps(500.0);
        assert!(evaluate(&rates, &armed(1000)).is_none());
    }

    #[test]
    fn test_overall_pps_hit() {
        let rates = rates_with_incoming_pps(150_000.0);
        let hit = evaluate(&rates, &armed(100_000)).unwrap();
        assert_eq!(hit.threshold, ThresholdType::PacketsPerSecond);
        assert_eq!(hit.direction, ThresholdDirection::Incoming);
        assert_eq!(hit.rate, 150_000);
    }

    #[test]
    fn test_disabled_rule_never_fires() {
        let mut ban = armed(100_000);
        ban.enable_ban_for_pps = false;
        let rates = rates_with_incoming_pps(10_000_000.0);
        assert!(evaluate(&rates, &ban).is_none());
    }

    #[test]
    fn test_master_switch_off() {
        let mut ban = armed(100);
        ban.enable_ban = false;
        let rates = rates_with_incoming_pps(10_000_000.0);
        assert!(evaluate(&rates, &ban).is_none());
    }

    #[test]
    fn test_exact_threshold_does_not_fire() {
        let rates = rates_with_incoming_pps(100_000.0);
        assert!(evaluate(&rates, &armed(100_000)).is_none());
    }

    #[test]
    fn test_tie_break_syn_beats_overall() {
        // Both TCP-SYN pps and overall pps exceed in the same tick; the
        // reported trigger must be the SYN rule.
        let mut ban = armed(100_000);
        ban.enable_ban_for_tcp_syn_pps = true;
        ban.threshold_tcp_syn_pps = 50_000;

        let mut rates = rates_with_incoming_pps(200_000.0);
        rates.average.tcp_syn.incoming.packets = 190_000.0;

        let hit = evaluate(&rates, &ban).unwrap();
        assert_eq!(hit.threshold, ThresholdType::TcpSynPacketsPerSecond);
        assert_eq!(hit.threshold.to_string(), "tcp_syn_packets_per_second");
    }

    #[test]
    fn test_tie_break_pps_beats_bandwidth() {
        let mut ban = BanSettings::default();
        ban.enable_ban = true;
        ban.enable_ban_for_udp_pps = true;
        ban.threshold_udp_pps = 1_000;
        ban.enable_ban_for_udp_bandwidth = true;
        ban.threshold_udp_mbps = 10;

        let mut rates = TrafficRates::default();
        rates.average.udp.incoming.packets = 50_000.0;
        rates.average.udp.incoming.bytes = 75_000_000.0; // 600 mbps

        let hit = evaluate(&rates, &ban).unwrap();
        assert_eq!(hit.threshold, ThresholdType::UdpPacketsPerSecond);
    }

    #[test]
    fn test_incoming_checked_before_outgoing() {
        let mut rates = TrafficRates::default();
        rates.average.total.incoming.packets = 200_000.0;
        rates.average.total.outgoing.packets = 300_000.0;

        let hit = evaluate(&rates, &armed(100_000)).unwrap();
        assert_eq!(hit.direction, ThresholdDirection::Incoming);
    }

    #[test]
    fn test_outgoing_only_hit() {
        let mut rates = TrafficRates::default();
        rates.average.total.outgoing.packets = 300_000.0;

        let hit = evaluate(&rates, &armed(100_000)).unwrap();
        assert_eq!(hit.direction, ThresholdDirection::Outgoing);
        assert_eq!(hit.rate, 300_000);
    }

    #[test]
    fn test_bandwidth_in_mbps() {
        let mut ban = BanSettings::default();
        ban.enable_ban = true;
        ban.enable_ban_for_bandwidth = true;
        ban.threshold_mbps = 100;

        // 20 MB/s = 160 mbps
        let mut rates = TrafficRates::default();
        rates.average.total.incoming.bytes = 20_000_000.0;

        let hit = evaluate(&rates, &ban).unwrap();
        assert_eq!(hit.threshold, ThresholdType::BytesPerSecond);
        assert_eq!(hit.rate, 160);
    }

    #[test]
    fn test_flows_rule() {
        let mut ban = BanSettings::default();
        ban.enable_ban = true;
        ban.enable_ban_for_flows_per_second = true;
        ban.threshold_flows = 3_000;

        let mut rates = TrafficRates::default();
        rates.average.total.incoming.flows = 5_000.0;

        let hit = evaluate(&rates, &ban).unwrap();
        assert_eq!(hit.threshold, ThresholdType::FlowsPerSecond);
        assert_eq!(hit.rate, 5_000);
    }

    #[test]
    fn test_metric_value_tracks_peak_source() {
        let mut rates = TrafficRates::default();
        rates.average.tcp_syn.incoming.packets = 42_000.0;

        let value = metric_value(&rates, ThresholdType::TcpSynPacketsPerSecond, ThresholdDirection::Incoming);
        assert_eq!(value, 42_000);
        assert_eq!(metric_value(&rates, ThresholdType::Unknown, ThresholdDirection::Incoming), 0);
    }
}
