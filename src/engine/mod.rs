//! Counter engine
//!
//! Aggregates normalised records into per-host, per-subnet and per-group
//! buckets, derives per-second rates and moving averages on each tick, and
//! walks the result against the configured thresholds.
//!
//! ```text
//! intake ──▶ TrafficProcessor ──▶ HostMap ◀── tick driver (1 Hz)
//!                  │                               │
//!                  ▼                               ▼
//!           capture rings                  evaluator ──▶ BanManager
//! ```

pub mod conntrack;
pub mod evaluator;
pub mod host_map;
pub mod tick;

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;

use crate::capture::{CaptureHandle, CapturedPacket};
use crate::core::{CounterSide, SimplePacket, TrafficDirection};
use crate::resolver::HostGroupResolver;
use crate::telemetry::PacketSink;

pub use evaluator::{evaluate, metric_value, ThresholdHit};
pub use host_map::{CounterBucket, EngineStats, HostMap, HostMapConfig, HostTraffic, SortMetric};

/// The sink between intake and the counter engine.
///
/// Classifies each record against monitored space, attributes both
/// endpoints, and tees frames of hosts under attack into their capture
/// rings. Never blocks: capture rings displace, counters are atomics.
pub struct TrafficProcessor {
    resolver: Arc<HostGroupResolver>,
    map: Arc<HostMap>,
    stats: Arc<EngineStats>,
    capture_index: Arc<DashMap<IpAddr, CaptureHandle>>,
}

impl TrafficProcessor {
    pub fn new(
        resolver: Arc<HostGroupResolver>,
        map: Arc<HostMap>,
        stats: Arc<EngineStats>,
        capture_index: Arc<DashMap<IpAddr, CaptureHandle>>,
    ) -> Self {
        Self {
            resolver,
            map,
            stats,
            capture_index,
        }
    }

    fn tee_capture(&self, host: IpAddr, pkt: &SimplePacket) {
        if let Some(handle) = self.capture_index.get(&host) {
            if let Some(payload) = &pkt.payload {
                handle.push(CapturedPacket {
                    data: payload.clone(),
                    ts_nanos: pkt.ts_nanos,
                    orig_len: pkt.length.min(u32::MAX as u64) as u32,
                });
            }
        }
    }
}

impl PacketSink for TrafficProcessor {
    fn consume(&self, pkt: SimplePacket) {
        self.stats.packets_processed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_processed
            .fetch_add(pkt.sampled_bytes(), Ordering::Relaxed);

        let generation = self.resolver.generation();
        let src_resolution = generation.resolve(pkt.src_ip);
        let dst_resolution = generation.resolve(pkt.dst_ip);

        let direction = match (&src_resolution, &dst_resolution) {
            (Some(_), Some(_)) => TrafficDirection::Internal,
            (Some(_), None) => TrafficDirection::Outgoing,
            (None, Some(_)) => TrafficDirection::Incoming,
            (None, None) => TrafficDirection::Other,
        };

        self.map.account_direction(direction, &pkt);

        if direction == TrafficDirection::Other {
            // Outside monitored space entirely
            self.stats.dropped_outside.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Some(resolution) = src_resolution {
            self.map.account_host(
                pkt.src_ip,
                CounterSide::Outgoing,
                &pkt,
                resolution.subnet,
                &resolution.group.name,
                resolution.parent.as_ref().map(|p| p.name.as_str()),
                &self.stats,
            );
            self.tee_capture(pkt.src_ip, &pkt);
        }

        if let Some(resolution) = dst_resolution {
            self.map.account_host(
                pkt.dst_ip,
                CounterSide::Incoming,
                &pkt,
                resolution.subnet,
                &resolution.group.name,
                resolution.parent.as_ref().map(|p| p.name.as_str()),
                &self.stats,
            );
            self.tee_capture(pkt.dst_ip, &pkt);
        }
    }
}
