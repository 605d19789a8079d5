//! Core data model: normalised packets, rolling counters, attack records

pub mod attack;
pub mod counters;
pub mod packet;
pub mod subnet;

pub use attack::{
    classify_attack, generate_attack_uuid, serialize_attack_description, AttackDetails,
    AttackSeverity, AttackType, DetectionSource, ThresholdDirection, ThresholdType,
};
pub use counters::{
    bytes_to_mbps, ema_alpha, ema_to_mbps, CounterSide, CounterValues, EmaValues, SectionEma,
    SectionValues, TrafficCounters, TrafficEma, TrafficRates, TrafficValues,
};
pub use packet::{
    IpProtocol, SimplePacket, TcpFlags, TelemetrySource, TrafficDirection, MAX_PAYLOAD_CAPTURE,
};
pub use subnet::SubnetCidr;
