//! Normalised packet record
//!
//! Every telemetry source (sFlow, NetFlow v5/v9, IPFIX, mirror) decodes into
//! this one record; everything downstream of the intake is source-agnostic.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(v) => v,
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Icmpv6 => write!(f, "ICMPv6"),
            IpProtocol::Other(n) => write!(f, "Proto({})", n),
        }
    }
}

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        if self.ece { flags |= 0x40; }
        if self.cwr { flags |= 0x80; }
        flags
    }

    /// Pure SYN, the opening packet of a handshake
    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// Traffic direction relative to the monitored network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficDirection {
    /// Destination is inside monitored space, source is not
    Incoming,
    /// Source is inside monitored space, destination is not
    Outgoing,
    /// Both endpoints inside monitored space
    Internal,
    /// Neither endpoint inside monitored space
    Other,
}

impl Default for TrafficDirection {
    fn default() -> Self {
        TrafficDirection::Other
    }
}

impl std::fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrafficDirection::Incoming => write!(f, "incoming"),
            TrafficDirection::Outgoing => write!(f, "outgoing"),
            TrafficDirection::Internal => write!(f, "internal"),
            TrafficDirection::Other => write!(f, "other"),
        }
    }
}

/// Which telemetry source produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetrySource {
    Sflow,
    NetflowV5,
    NetflowV9,
    Ipfix,
    Mirror,
}

impl std::fmt::Display for TelemetrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetrySource::Sflow => write!(f, "sflow"),
            TelemetrySource::NetflowV5 => write!(f, "netflow_v5"),
            TelemetrySource::NetflowV9 => write!(f, "netflow_v9"),
            TelemetrySource::Ipfix => write!(f, "ipfix"),
            TelemetrySource::Mirror => write!(f, "mirror"),
        }
    }
}

/// Maximum payload bytes retained on a record when capture is enabled
pub const MAX_PAYLOAD_CAPTURE: usize = 128;

/// The canonical per-packet record produced by the intake
///
/// `packets` and `length` are the raw observed values; multiplying by
/// `sample_ratio` estimates the true traffic. Flow exports carry more than
/// one packet per record; sampled and mirrored frames carry exactly one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimplePacket {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: IpProtocol,
    pub flags: TcpFlags,
    pub fragmented: bool,
    pub input_interface: u32,
    pub output_interface: u32,
    /// Observed bytes for this record (pre-sampling)
    pub length: u64,
    /// Observed packets for this record, always >= 1 (pre-sampling)
    pub packets: u64,
    /// Sampling divisor reported by (or configured for) the exporter
    pub sample_ratio: u64,
    /// Capture timestamp, monotonic nanoseconds
    pub ts_nanos: u64,
    /// First bytes of the frame when capture is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    pub source: TelemetrySource,
}

impl SimplePacket {
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, protocol: IpProtocol, source: TelemetrySource) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            protocol,
            flags: TcpFlags::default(),
            fragmented: false,
            input_interface: 0,
            output_interface: 0,
            length: 0,
            packets: 1,
            sample_ratio: 1,
            ts_nanos: 0,
            payload: None,
            source,
        }
    }

    /// Estimated bytes on the wire after undoing sampling
    pub fn sampled_bytes(&self) -> u64 {
        self.length.saturating_mul(self.sample_ratio)
    }

    /// Estimated packets on the wire after undoing sampling
    pub fn sampled_packets(&self) -> u64 {
        self.packets.saturating_mul(self.sample_ratio)
    }

    pub fn is_ipv6(&self) -> bool {
        self.src_ip.is_ipv6() || self.dst_ip.is_ipv6()
    }

    /// Directionless 5-tuple key for flow accounting
    pub fn flow_key(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        // Normalize so both directions of a conversation hash identically
        if (self.src_ip, self.src_port) <= (self.dst_ip, self.dst_port) {
            (self.src_ip, self.dst_ip, self.src_port, self.dst_port).hash(&mut hasher);
        } else {
            (self.dst_ip, self.src_ip, self.dst_port, self.src_port).hash(&mut hasher);
        }
        u8::from(self.protocol).hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_tcp_flags_roundtrip() {
        let flags = TcpFlags::from_u8(0x12); // SYN+ACK
        assert!(flags.syn);
        assert!(flags.ack);
        assert!(!flags.fin);
        assert!(!flags.is_syn());
        assert_eq!(flags.to_u8(), 0x12);
    }

    #[test]
    fn test_protocol_conversion() {
        assert_eq!(IpProtocol::from(6), IpProtocol::Tcp);
        assert_eq!(IpProtocol::from(17), IpProtocol::Udp);
        assert_eq!(u8::from(IpProtocol::Other(47)), 47);
    }

    #[test]
    fn test_flow_key_symmetric() {
        let a = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let mut fwd = SimplePacket::new(a, b, IpProtocol::Tcp, TelemetrySource::Mirror);
        fwd.src_port = 54321;
        fwd.dst_port = 80;

        let mut rev = SimplePacket::new(b, a, IpProtocol::Tcp, TelemetrySource::Mirror);
        rev.src_port = 80;
        rev.dst_port = 54321;

        assert_eq!(fwd.flow_key(), rev.flow_key());
    }

    #[test]
    fn test_sampled_estimates() {
        let a = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut pkt = SimplePacket::new(a, b, IpProtocol::Udp, TelemetrySource::Sflow);
        pkt.length = 1500;
        pkt.sample_ratio = 1024;

        assert_eq!(pkt.sampled_bytes(), 1500 * 1024);
        assert_eq!(pkt.sampled_packets(), 1024);
    }
}
