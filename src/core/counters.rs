//! Rolling traffic counters
//!
//! The accounting bucket kept per host, per subnet and per host group.
//! Six sections (total, TCP, TCP-SYN, UDP, ICMP, fragmented), each with
//! independent incoming and outgoing bytes/packets/flows.
//!
//! Three representations of the same shape:
//! - [`TrafficCounters`]: atomic cumulative counters written from the
//!   ingestion path, monotonically increasing
//! - [`TrafficValues`]: a plain snapshot (also used for per-second deltas)
//! - [`TrafficEma`]: exponential moving averages, updated once per tick

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::packet::{IpProtocol, SimplePacket};

/// One cumulative counter cell: bytes, packets, flows
#[derive(Debug, Default)]
pub struct CounterCell {
    pub bytes: AtomicU64,
    pub packets: AtomicU64,
    pub flows: AtomicU64,
}

impl CounterCell {
    fn add(&self, bytes: u64, packets: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.packets.fetch_add(packets, Ordering::Relaxed);
    }

    fn add_flow(&self) {
        self.flows.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CounterValues {
        CounterValues {
            bytes: self.bytes.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            flows: self.flows.load(Ordering::Relaxed),
        }
    }
}

/// Plain bytes/packets/flows triple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterValues {
    pub bytes: u64,
    pub packets: u64,
    pub flows: u64,
}

impl CounterValues {
    /// Saturating difference; raw counters are monotonic so this is the
    /// per-interval delta.
    pub fn delta_since(&self, prev: &CounterValues) -> CounterValues {
        CounterValues {
            bytes: self.bytes.saturating_sub(prev.bytes),
            packets: self.packets.saturating_sub(prev.packets),
            flows: self.flows.saturating_sub(prev.flows),
        }
    }
}

/// Incoming/outgoing pair of cumulative cells
#[derive(Debug, Default)]
pub struct SectionCounters {
    pub incoming: CounterCell,
    pub outgoing: CounterCell,
}

/// Incoming/outgoing pair of plain values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionValues {
    pub incoming: CounterValues,
    pub outgoing: CounterValues,
}

/// Exponential moving averages for one cell
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EmaValues {
    pub bytes: f64,
    pub packets: f64,
    pub flows: f64,
}

impl EmaValues {
    /// One EMA step: `ema += alpha * (delta - ema)`
    pub fn update(&mut self, delta: &CounterValues, alpha: f64) {
        self.bytes += alpha * (delta.bytes as f64 - self.bytes);
        self.packets += alpha * (delta.packets as f64 - self.packets);
        self.flows += alpha * (delta.flows as f64 - self.flows);
    }
}

/// Incoming/outgoing pair of EMA cells
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionEma {
    pub incoming: EmaValues,
    pub outgoing: EmaValues,
}

impl SectionEma {
    fn update(&mut self, delta: &SectionValues, alpha: f64) {
        self.incoming.update(&delta.incoming, alpha);
        self.outgoing.update(&delta.outgoing, alpha);
    }
}

/// Whether a packet counts against a host's incoming or outgoing side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterSide {
    Incoming,
    Outgoing,
}

/// The full atomic counter bucket
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub total: SectionCounters,
    pub tcp: SectionCounters,
    pub tcp_syn: SectionCounters,
    pub udp: SectionCounters,
    pub icmp: SectionCounters,
    pub fragmented: SectionCounters,
}

impl TrafficCounters {
    /// Account one normalised record against this bucket.
    ///
    /// `new_flow` comes from the conntrack sketch and lands on the total
    /// section and the owning protocol section.
    pub fn account(&self, pkt: &SimplePacket, side: CounterSide, new_flow: bool) {
        let bytes = pkt.sampled_bytes();
        let packets = pkt.sampled_packets();

        self.cell(&self.total, side).add(bytes, packets);
        if new_flow {
            self.cell(&self.total, side).add_flow();
        }

        match pkt.protocol {
            IpProtocol::Tcp => {
                self.cell(&self.tcp, side).add(bytes, packets);
                if new_flow {
                    self.cell(&self.tcp, side).add_flow();
                }
                if pkt.flags.is_syn() {
                    self.cell(&self.tcp_syn, side).add(bytes, packets);
                }
            }
            IpProtocol::Udp => {
                self.cell(&self.udp, side).add(bytes, packets);
                if new_flow {
                    self.cell(&self.udp, side).add_flow();
                }
            }
            IpProtocol::Icmp | IpProtocol::Icmpv6 => {
                self.cell(&self.icmp, side).add(bytes, packets);
                if new_flow {
                    self.cell(&self.icmp, side).add_flow();
                }
            }
            IpProtocol::Other(_) => {}
        }

        if pkt.fragmented {
            self.cell(&self.fragmented, side).add(bytes, packets);
        }
    }

    fn cell<'a>(&self, section: &'a SectionCounters, side: CounterSide) -> &'a CounterCell {
        match side {
            CounterSide::Incoming => &section.incoming,
            CounterSide::Outgoing => &section.outgoing,
        }
    }

    pub fn snapshot(&self) -> TrafficValues {
        TrafficValues {
            total: self.snapshot_section(&self.total),
            tcp: self.snapshot_section(&self.tcp),
            tcp_syn: self.snapshot_section(&self.tcp_syn),
            udp: self.snapshot_section(&self.udp),
            icmp: self.snapshot_section(&self.icmp),
            fragmented: self.snapshot_section(&self.fragmented),
        }
    }

    fn snapshot_section(&self, section: &SectionCounters) -> SectionValues {
        SectionValues {
            incoming: section.incoming.snapshot(),
            outgoing: section.outgoing.snapshot(),
        }
    }
}

/// Plain snapshot of all six sections; also the shape of a per-second delta
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficValues {
    pub total: SectionValues,
    pub tcp: SectionValues,
    pub tcp_syn: SectionValues,
    pub udp: SectionValues,
    pub icmp: SectionValues,
    pub fragmented: SectionValues,
}

impl TrafficValues {
    pub fn delta_since(&self, prev: &TrafficValues) -> TrafficValues {
        fn section(cur: &SectionValues, prev: &SectionValues) -> SectionValues {
            SectionValues {
                incoming: cur.incoming.delta_since(&prev.incoming),
                outgoing: cur.outgoing.delta_since(&prev.outgoing),
            }
        }

        TrafficValues {
            total: section(&self.total, &prev.total),
            tcp: section(&self.tcp, &prev.tcp),
            tcp_syn: section(&self.tcp_syn, &prev.tcp_syn),
            udp: section(&self.udp, &prev.udp),
            icmp: section(&self.icmp, &prev.icmp),
            fragmented: section(&self.fragmented, &prev.fragmented),
        }
    }
}

/// Exponential moving averages for all six sections
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficEma {
    pub total: SectionEma,
    pub tcp: SectionEma,
    pub tcp_syn: SectionEma,
    pub udp: SectionEma,
    pub icmp: SectionEma,
    pub fragmented: SectionEma,
}

impl TrafficEma {
    pub fn update(&mut self, delta: &TrafficValues, alpha: f64) {
        self.total.update(&delta.total, alpha);
        self.tcp.update(&delta.tcp, alpha);
        self.tcp_syn.update(&delta.tcp_syn, alpha);
        self.udp.update(&delta.udp, alpha);
        self.icmp.update(&delta.icmp, alpha);
        self.fragmented.update(&delta.fragmented, alpha);
    }
}

/// The published per-second view for one bucket: instantaneous rates
/// (last-second deltas) plus moving averages
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficRates {
    pub speed: TrafficValues,
    pub average: TrafficEma,
}

/// EMA smoothing factor for an averaging window of `tau` seconds
pub fn ema_alpha(tau_secs: f64) -> f64 {
    1.0 - (-1.0 / tau_secs).exp()
}

/// Convert a byte rate to megabits per second, the unit thresholds and
/// attack reports use
pub fn bytes_to_mbps(bytes_per_second: u64) -> u64 {
    bytes_per_second * 8 / 1_000_000
}

/// Same conversion for EMA values
pub fn ema_to_mbps(bytes_per_second: f64) -> u64 {
    bytes_to_mbps(bytes_per_second.round() as u64)
}
