//! Attack descriptor
//!
//! Created by the attack manager when detection fires. An attack *contains*
//! a snapshot of the host's counters at onset; it does not share storage
//! with the live bucket.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::counters::{ema_to_mbps, bytes_to_mbps, SectionEma, SectionValues, TrafficRates};
use super::packet::{IpProtocol, TrafficDirection};
use super::subnet::SubnetCidr;

/// Attack severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackSeverity {
    Low,
    Middle,
    High,
}

impl std::fmt::Display for AttackSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttackSeverity::Low => write!(f, "low"),
            AttackSeverity::Middle => write!(f, "middle"),
            AttackSeverity::High => write!(f, "high"),
        }
    }
}

/// How the detection was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Automatic,
    Manual,
}

/// Traffic pattern classification at onset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    Unknown,
    SynFlood,
    IcmpFlood,
    UdpFlood,
    IpFragmentationFlood,
}

impl std::fmt::Display for AttackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttackType::Unknown => write!(f, "unknown"),
            AttackType::SynFlood => write!(f, "syn_flood"),
            AttackType::IcmpFlood => write!(f, "icmp_flood"),
            AttackType::UdpFlood => write!(f, "udp_flood"),
            AttackType::IpFragmentationFlood => write!(f, "ip_fragmentation_flood"),
        }
    }
}

/// Which configured rule triggered a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdType {
    Unknown,
    PacketsPerSecond,
    BytesPerSecond,
    FlowsPerSecond,
    TcpPacketsPerSecond,
    UdpPacketsPerSecond,
    IcmpPacketsPerSecond,
    TcpBytesPerSecond,
    UdpBytesPerSecond,
    IcmpBytesPerSecond,
    TcpSynPacketsPerSecond,
    TcpSynBytesPerSecond,
}

impl std::fmt::Display for ThresholdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ThresholdType::Unknown => "unknown",
            ThresholdType::PacketsPerSecond => "packets_per_second",
            ThresholdType::BytesPerSecond => "bytes_per_second",
            ThresholdType::FlowsPerSecond => "flows_per_second",
            ThresholdType::TcpPacketsPerSecond => "tcp_packets_per_second",
            ThresholdType::UdpPacketsPerSecond => "udp_packets_per_second",
            ThresholdType::IcmpPacketsPerSecond => "icmp_packets_per_second",
            ThresholdType::TcpBytesPerSecond => "tcp_bytes_per_second",
            ThresholdType::UdpBytesPerSecond => "udp_bytes_per_second",
            ThresholdType::IcmpBytesPerSecond => "icmp_bytes_per_second",
            ThresholdType::TcpSynPacketsPerSecond => "tcp_syn_packets_per_second",
            ThresholdType::TcpSynBytesPerSecond => "tcp_syn_bytes_per_second",
        };
        write!(f, "{}", name)
    }
}

/// Direction of the rate that crossed the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdDirection {
    Unknown,
    Incoming,
    Outgoing,
}

/// Everything recorded about one attack on one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackDetails {
    /// Stable identifier; nil when entropy was unavailable at creation
    pub uuid: Uuid,
    pub host: IpAddr,
    pub ipv6: bool,
    /// Owning customer network, when resolution succeeded
    pub customer_network: Option<SubnetCidr>,
    pub host_group: String,
    pub parent_host_group: String,

    pub direction: TrafficDirection,
    pub attack_type: AttackType,
    /// Dominant L4 protocol, when one dominates
    pub protocol: Option<IpProtocol>,
    pub severity: AttackSeverity,
    pub source: DetectionSource,

    /// Rule that fired, frozen at onset
    pub threshold: ThresholdType,
    pub threshold_direction: ThresholdDirection,

    /// Rate of the triggering metric at first detection
    pub attack_power: u64,
    /// Highest rate of the triggering metric over the attack lifetime
    pub max_attack_power: u64,

    pub ban_timestamp: DateTime<Utc>,
    /// Seconds the ban lasts; 0 means until cleared
    pub ban_time_secs: u64,
    pub unban_enabled: bool,

    /// Set when a mitigation or notification hook exceeded its budget
    pub degraded: bool,
    /// Set while the mitigation announcement is failing
    pub mitigation_failed: bool,

    /// Counter snapshot at onset
    pub rates: TrafficRates,
}

impl AttackDetails {
    pub fn protocol_name(&self) -> &'static str {
        match self.protocol {
            Some(IpProtocol::Tcp) => "tcp",
            Some(IpProtocol::Udp) => "udp",
            Some(IpProtocol::Icmp) | Some(IpProtocol::Icmpv6) => "icmp",
            _ => "unknown",
        }
    }
}

impl Default for AttackDetails {
    fn default() -> Self {
        Self {
            uuid: Uuid::nil(),
            host: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            ipv6: false,
            customer_network: None,
            host_group: String::new(),
            parent_host_group: String::new(),
            direction: TrafficDirection::Other,
            attack_type: AttackType::Unknown,
            protocol: None,
            severity: AttackSeverity::Middle,
            source: DetectionSource::Automatic,
            threshold: ThresholdType::Unknown,
            threshold_direction: ThresholdDirection::Unknown,
            attack_power: 0,
            max_attack_power: 0,
            ban_timestamp: DateTime::<Utc>::UNIX_EPOCH,
            ban_time_secs: 0,
            unban_enabled: true,
            degraded: false,
            mitigation_failed: false,
            rates: TrafficRates::default(),
        }
    }
}

/// Generate a random attack identifier.
///
/// Entropy shortage must not lose the attack: on RNG failure the nil UUID
/// is used as a sentinel and a warning is logged.
pub fn generate_attack_uuid() -> Uuid {
    use rand::RngCore;

    let mut bytes = [0u8; 16];
    match rand::rngs::OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => uuid::Builder::from_random_bytes(bytes).into_uuid(),
        Err(err) => {
            warn!("UUID generation failed, recording attack with nil UUID: {}", err);
            Uuid::nil()
        }
    }
}

/// Classify the traffic pattern from the counter snapshot.
///
/// A protocol dominates when it carries more than half of the total packet
/// rate in the attack direction.
pub fn classify_attack(rates: &TrafficRates, direction: TrafficDirection) -> (AttackType, Option<IpProtocol>) {
    let pick = |section: &SectionValues| -> u64 {
        match direction {
            TrafficDirection::Outgoing => section.outgoing.packets,
            _ => section.incoming.packets,
        }
    };

    let total = pick(&rates.speed.total);
    if total == 0 {
        return (AttackType::Unknown, None);
    }

    let syn = pick(&rates.speed.tcp_syn);
    let tcp = pick(&rates.speed.tcp);
    let udp = pick(&rates.speed.udp);
    let icmp = pick(&rates.speed.icmp);
    let fragmented = pick(&rates.speed.fragmented);

    if fragmented * 2 > total {
        return (AttackType::IpFragmentationFlood, None);
    }
    if syn * 2 > total {
        return (AttackType::SynFlood, Some(IpProtocol::Tcp));
    }
    if icmp * 2 > total {
        return (AttackType::IcmpFlood, Some(IpProtocol::Icmp));
    }
    if udp * 2 > total {
        return (AttackType::UdpFlood, Some(IpProtocol::Udp));
    }
    if tcp * 2 > total {
        return (AttackType::Unknown, Some(IpProtocol::Tcp));
    }

    (AttackType::Unknown, None)
}

/// Render the operator-facing attack report.
///
/// Labels, ordering and units are a stable external format consumed by
/// notification scripts; do not reorder or rename lines.
pub fn serialize_attack_description(attack: &AttackDetails) -> String {
    let mut out = String::with_capacity(1536);

    let speed = &attack.rates.speed;
    let average = &attack.rates.average;

    out.push_str(&format!("Attack type: {}\n", attack.attack_type));
    out.push_str(&format!(
        "Initial attack power: {} packets per second\n",
        attack.attack_power
    ));
    out.push_str(&format!(
        "Peak attack power: {} packets per second\n",
        attack.max_attack_power
    ));
    out.push_str(&format!("Attack direction: {}\n", attack.direction));
    out.push_str(&format!("Attack protocol: {}\n", attack.protocol_name()));

    push_speed_section(&mut out, "Total", &speed.total);
    push_flows(&mut out, &speed.total);
    push_average_section(&mut out, &average.total);
    push_average_flows(&mut out, &average.total);

    push_fragmented_section(&mut out, &speed.fragmented);
    push_protocol_section(&mut out, "tcp", &speed.tcp);
    push_protocol_section(&mut out, "syn tcp", &speed.tcp_syn);
    push_protocol_section(&mut out, "udp", &speed.udp);
    push_protocol_section(&mut out, "icmp", &speed.icmp);

    out
}

fn push_speed_section(out: &mut String, prefix: &str, section: &SectionValues) {
    out.push_str(&format!(
        "{} incoming traffic: {} mbps\n",
        prefix,
        bytes_to_mbps(section.incoming.bytes)
    ));
    out.push_str(&format!(
        "{} outgoing traffic: {} mbps\n",
        prefix,
        bytes_to_mbps(section.outgoing.bytes)
    ));
    out.push_str(&format!(
        "{} incoming pps: {} packets per second\n",
        prefix, section.incoming.packets
    ));
    out.push_str(&format!(
        "{} outgoing pps: {} packets per second\n",
        prefix, section.outgoing.packets
    ));
}

fn push_flows(out: &mut String, section: &SectionValues) {
    out.push_str(&format!(
        "Total incoming flows: {} flows per second\n",
        section.incoming.flows
    ));
    out.push_str(&format!(
        "Total outgoing flows: {} flows per second\n",
        section.outgoing.flows
    ));
}

fn push_average_section(out: &mut String, section: &SectionEma) {
    out.push_str(&format!(
        "Average incoming traffic: {} mbps\n",
        ema_to_mbps(section.incoming.bytes)
    ));
    out.push_str(&format!(
        "Average outgoing traffic: {} mbps\n",
        ema_to_mbps(section.outgoing.bytes)
    ));
    out.push_str(&format!(
        "Average incoming pps: {} packets per second\n",
        section.incoming.packets.round() as u64
    ));
    out.push_str(&format!(
        "Average outgoing pps: {} packets per second\n",
        section.outgoing.packets.round() as u64
    ));
}

fn push_average_flows(out: &mut String, section: &SectionEma) {
    out.push_str(&format!(
        "Average incoming flows: {} flows per second\n",
        section.incoming.flows.round() as u64
    ));
    out.push_str(&format!(
        "Average outgoing flows: {} flows per second\n",
        section.outgoing.flows.round() as u64
    ));
}

fn push_fragmented_section(out: &mut String, section: &SectionValues) {
    out.push_str(&format!(
        "Incoming ip fragmented traffic: {} mbps\n",
        bytes_to_mbps(section.incoming.bytes)
    ));
    out.push_str(&format!(
        "Outgoing ip fragmented traffic: {} mbps\n",
        bytes_to_mbps(section.outgoing.bytes)
    ));
    out.push_str(&format!(
        "Incoming ip fragmented pps: {} packets per second\n",
        section.incoming.packets
    ));
    out.push_str(&format!(
        "Outgoing ip fragmented pps: {} packets per second\n",
        section.outgoing.packets
    ));
}

fn push_protocol_section(out: &mut String, name: &str, section: &SectionValues) {
    out.push_str(&format!(
        "Incoming {} traffic: {} mbps\n",
        name,
        bytes_to_mbps(section.incoming.bytes)
    ));
    out.push_str(&format!(
        "Outgoing {} traffic: {} mbps\n",
        name,
        bytes_to_mbps(section.outgoing.bytes)
    ));
    out.push_str(&format!(
        "Incoming {} pps: {} packets per second\n",
        name, section.incoming.packets
    ));
    out.push_str(&format!(
        "Outgoing {} pps: {} packets per second\n",
        name, section.outgoing.packets
    ));
}
