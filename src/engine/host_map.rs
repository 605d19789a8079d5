//! Per-host, per-subnet and per-group counter storage
//!
//! The host map is the hot shared structure: ingest workers insert and
//! account, the tick driver rotates, inspectors snapshot. Insertion goes
//! through the sharded map's own locking; counter fields are atomics; the
//! published rate view is swapped whole under a short write lock so any
//! snapshot is consistent with a tick boundary.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::core::{
    CounterSide, CounterValues, EmaValues, SimplePacket, SubnetCidr, TrafficCounters,
    TrafficDirection, TrafficRates, TrafficValues,
};

use super::conntrack::FlowSketch;

/// Counter bucket with rotation state: cumulative atomics, the previous
/// tick's snapshot, and the published per-second view
#[derive(Debug, Default)]
pub struct CounterBucket {
    pub counters: TrafficCounters,
    prev: Mutex<TrafficValues>,
    rates: RwLock<TrafficRates>,
}

impl CounterBucket {
    /// One tick: delta against the previous snapshot, EMA step, publish
    fn rotate(&self, alpha: f64) {
        let snapshot = self.counters.snapshot();
        let delta = {
            let mut prev = self.prev.lock();
            let delta = snapshot.delta_since(&prev);
            *prev = snapshot;
            delta
        };

        let mut rates = self.rates.write();
        rates.speed = delta;
        rates.average.update(&delta, alpha);
    }

    /// Read the published view; consistent with the last tick boundary
    pub fn rates(&self) -> TrafficRates {
        *self.rates.read()
    }
}

/// Live accounting state for one host
#[derive(Debug)]
pub struct HostTraffic {
    pub bucket: CounterBucket,
    /// Engine clock seconds at last accounted packet
    last_seen: AtomicU64,
    conntrack_in: Mutex<FlowSketch>,
    conntrack_out: Mutex<FlowSketch>,
    /// Attribution captured at creation
    pub subnet: SubnetCidr,
    pub group_name: String,
    pub parent_group_name: Option<String>,
    pub ipv6: bool,
}

impl HostTraffic {
    pub fn rates(&self) -> TrafficRates {
        self.bucket.rates()
    }
}

/// Per-group bucket plus the distinct-host ceiling state
#[derive(Debug, Default)]
struct GroupBucket {
    bucket: CounterBucket,
    host_count: AtomicUsize,
}

/// Aggregate totals for the four traffic directions
#[derive(Debug, Default)]
pub struct DirectionTotals {
    counters: [TrafficCounters; 4],
    prev: Mutex<[TrafficValues; 4]>,
    speed: RwLock<[TrafficValues; 4]>,
    average: RwLock<[crate::core::TrafficEma; 4]>,
}

fn direction_index(direction: TrafficDirection) -> usize {
    match direction {
        TrafficDirection::Incoming => 0,
        TrafficDirection::Outgoing => 1,
        TrafficDirection::Internal => 2,
        TrafficDirection::Other => 3,
    }
}

impl DirectionTotals {
    fn account(&self, direction: TrafficDirection, pkt: &SimplePacket) {
        // Totals are single-sided; incoming is used as the storage side
        self.counters[direction_index(direction)].account(pkt, CounterSide::Incoming, false);
    }

    fn rotate(&self, alpha: f64) {
        let mut prev = self.prev.lock();
        let mut speed = self.speed.write();
        let mut average = self.average.write();
        for i in 0..4 {
            let snapshot = self.counters[i].snapshot();
            let delta = snapshot.delta_since(&prev[i]);
            prev[i] = snapshot;
            speed[i] = delta;
            average[i].update(&delta, alpha);
        }
    }

    /// Published per-second totals for one direction
    pub fn speed(&self, direction: TrafficDirection) -> CounterValues {
        self.speed.read()[direction_index(direction)].total.incoming
    }

    pub fn average(&self, direction: TrafficDirection) -> EmaValues {
        self.average.read()[direction_index(direction)].total.incoming
    }
}

/// Hot-path and lifecycle gauges
#[derive(Debug, Default)]
pub struct EngineStats {
    pub packets_processed: AtomicU64,
    pub bytes_processed: AtomicU64,
    pub hosts_created: AtomicU64,
    pub hosts_collected: AtomicU64,
    /// Packets folded into a subnet bucket because the group host cap
    /// was reached
    pub hosts_folded: AtomicU64,
    /// Packets outside monitored space
    pub dropped_outside: AtomicU64,
}

/// Ordering key for top-talker inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMetric {
    Packets,
    Bytes,
    Flows,
}

#[derive(Debug, Clone)]
pub struct HostMapConfig {
    pub max_hosts_per_group: usize,
    pub host_idle_timeout_secs: u64,
    pub conntrack_capacity: usize,
}

impl Default for HostMapConfig {
    fn default() -> Self {
        Self {
            max_hosts_per_group: 65_536,
            host_idle_timeout_secs: 900,
            conntrack_capacity: 1024,
        }
    }
}

/// The live counter store
pub struct HostMap {
    hosts: DashMap<IpAddr, Arc<HostTraffic>>,
    subnets: DashMap<SubnetCidr, Arc<CounterBucket>>,
    groups: DashMap<String, Arc<GroupBucket>>,
    pub totals: DirectionTotals,
    config: HostMapConfig,
    /// Coarse engine clock, seconds; advanced by the tick driver
    clock_secs: AtomicU64,
    /// Tick window number used by the conntrack sketches
    window: AtomicU32,
}

impl HostMap {
    pub fn new(config: HostMapConfig) -> Self {
        Self {
            hosts: DashMap::new(),
            subnets: DashMap::new(),
            groups: DashMap::new(),
            totals: DirectionTotals::default(),
            config,
            clock_secs: AtomicU64::new(0),
            window: AtomicU32::new(1),
        }
    }

    /// Account a packet against the global direction totals
    pub fn account_direction(&self, direction: TrafficDirection, pkt: &SimplePacket) {
        self.totals.account(direction, pkt);
    }

    /// Account a packet for one monitored endpoint.
    ///
    /// `side` is the host's perspective: `Incoming` when `host` is the
    /// destination, `Outgoing` when it is the source.
    pub fn account_host(
        &self,
        host: IpAddr,
        side: CounterSide,
        pkt: &SimplePacket,
        subnet: SubnetCidr,
        group_name: &str,
        parent_group_name: Option<&str>,
        stats: &EngineStats,
    ) {
        let entry = match self.hosts.get(&host) {
            Some(entry) => Arc::clone(entry.value()),
            None => match self.create_host(host, subnet, group_name, parent_group_name, stats) {
                Some(entry) => entry,
                None => {
                    // Group ceiling reached: fold into the subnet bucket
                    stats.hosts_folded.fetch_add(1, Ordering::Relaxed);
                    self.subnet_bucket(subnet)
                        .counters
                        .account(pkt, side, false);
                    return;
                }
            },
        };

        entry
            .last_seen
            .store(self.clock_secs.load(Ordering::Relaxed), Ordering::Relaxed);

        let window = self.window.load(Ordering::Relaxed);
        let new_flow = {
            let sketch = match side {
                CounterSide::Incoming => &entry.conntrack_in,
                CounterSide::Outgoing => &entry.conntrack_out,
            };
            sketch.lock().observe(pkt.flow_key(), window)
        };

        entry.bucket.counters.account(pkt, side, new_flow);

        self.subnet_bucket(subnet).counters.account(pkt, side, false);
        self.group_bucket(group_name).bucket.counters.account(pkt, side, false);
    }

    fn create_host(
        &self,
        host: IpAddr,
        subnet: SubnetCidr,
        group_name: &str,
        parent_group_name: Option<&str>,
        stats: &EngineStats,
    ) -> Option<Arc<HostTraffic>> {
        let group = self.group_bucket(group_name);

        // Reserve a slot under the group ceiling; undo on overshoot
        let prior = group.host_count.fetch_add(1, Ordering::Relaxed);
        if prior >= self.config.max_hosts_per_group {
            group.host_count.fetch_sub(1, Ordering::Relaxed);
            return None;
        }

        let entry = Arc::new(HostTraffic {
            bucket: CounterBucket::default(),
            last_seen: AtomicU64::new(self.clock_secs.load(Ordering::Relaxed)),
            conntrack_in: Mutex::new(FlowSketch::with_capacity(self.config.conntrack_capacity)),
            conntrack_out: Mutex::new(FlowSketch::with_capacity(self.config.conntrack_capacity)),
            subnet,
            group_name: group_name.to_string(),
            parent_group_name: parent_group_name.map(str::to_string),
            ipv6: host.is_ipv6(),
        });

        match self.hosts.entry(host) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                // Lost the race; release the reserved slot
                group.host_count.fetch_sub(1, Ordering::Relaxed);
                Some(Arc::clone(existing.get()))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                stats.hosts_created.fetch_add(1, Ordering::Relaxed);
                vacant.insert(Arc::clone(&entry));
                Some(entry)
            }
        }
    }

    fn subnet_bucket(&self, subnet: SubnetCidr) -> Arc<CounterBucket> {
        Arc::clone(
            self.subnets
                .entry(subnet)
                .or_insert_with(|| Arc::new(CounterBucket::default()))
                .value(),
        )
    }

    fn group_bucket(&self, name: &str) -> Arc<GroupBucket> {
        Arc::clone(
            self.groups
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(GroupBucket::default()))
                .value(),
        )
    }

    /// One tick: advance the clock and window, rotate every bucket,
    /// collect idle hosts. Called exactly once per second by the single
    /// tick driver.
    pub fn tick(&self, now_secs: u64, alpha: f64, stats: &EngineStats) {
        self.clock_secs.store(now_secs, Ordering::Relaxed);
        self.window.fetch_add(1, Ordering::Relaxed);

        for entry in self.hosts.iter() {
            entry.value().bucket.rotate(alpha);
        }
        for entry in self.subnets.iter() {
            entry.value().rotate(alpha);
        }
        for entry in self.groups.iter() {
            entry.value().bucket.rotate(alpha);
        }
        self.totals.rotate(alpha);

        self.collect_idle(now_secs, stats);
    }

    fn collect_idle(&self, now_secs: u64, stats: &EngineStats) {
        let idle_cutoff = now_secs.saturating_sub(self.config.host_idle_timeout_secs);

        let idle: Vec<IpAddr> = self
            .hosts
            .iter()
            .filter(|entry| entry.value().last_seen.load(Ordering::Relaxed) < idle_cutoff)
            .map(|entry| *entry.key())
            .collect();

        if idle.is_empty() {
            return;
        }

        for host in idle {
            if let Some((_, entry)) = self.hosts.remove(&host) {
                if let Some(group) = self.groups.get(&entry.group_name) {
                    group.host_count.fetch_sub(1, Ordering::Relaxed);
                }
                stats.hosts_collected.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!("Collected idle hosts; {} remain", self.hosts.len());
    }

    pub fn get(&self, host: IpAddr) -> Option<Arc<HostTraffic>> {
        self.hosts.get(&host).map(|entry| Arc::clone(entry.value()))
    }

    /// Visit every live host; used by the threshold evaluator and exporters
    pub fn for_each_host<F: FnMut(IpAddr, &Arc<HostTraffic>)>(&self, mut f: F) {
        for entry in self.hosts.iter() {
            f(*entry.key(), entry.value());
        }
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn subnet_rates(&self, subnet: SubnetCidr) -> Option<TrafficRates> {
        self.subnets.get(&subnet).map(|bucket| bucket.rates())
    }

    pub fn group_rates(&self, name: &str) -> Option<TrafficRates> {
        self.groups.get(name).map(|bucket| bucket.bucket.rates())
    }

    /// Top hosts by one metric, busiest first
    pub fn top_hosts(&self, metric: SortMetric, side: CounterSide, limit: usize) -> Vec<(IpAddr, u64)> {
        let mut rows: Vec<(IpAddr, u64)> = self
            .hosts
            .iter()
            .map(|entry| {
                let speed = entry.value().rates().speed.total;
                let cell = match side {
                    CounterSide::Incoming => speed.incoming,
                    CounterSide::Outgoing => speed.outgoing,
                };
                let value = match metric {
                    SortMetric::Packets => cell.packets,
                    SortMetric::Bytes => cell.bytes,
                    SortMetric::Flows => cell.flows,
                };
                (*entry.key(), value)
            })
            .collect();

        rows.sort_by(|a, b| b.1.cmp(&a.1));
        rows.truncate(limit);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ema_alpha, IpProtocol, TelemetrySource};

    fn make_packet(src: &str, dst: &str, bytes: u64) -> SimplePacket {
        let mut pkt = SimplePacket::new(
            src.parse().unwrap(),
            dst.parse().unwrap(),
            IpProtocol::Udp,
            TelemetrySource::NetflowV5,
        );
        pkt.length = bytes;
        pkt.src_port = 53;
        pkt.dst_port = 40000;
        pkt
    }

    fn subnet(s: &str) -> SubnetCidr {
        s.parse().unwrap()
    }

    #[test]
    fn test_record_and_tick() {
        let map = HostMap::new(HostMapConfig::default());
        let stats = EngineStats::default();
        let alpha = ema_alpha(15.0);

        let pkt = make_packet("8.8.8.8", "10.1.2.3", 1000);
        let host: IpAddr = "10.1.2.3".parse().unwrap();

        map.account_host(host, CounterSide::Incoming, &pkt, subnet("10.1.0.0/16"), "customers", None, &stats);
        map.tick(1, alpha, &stats);

        let rates = map.get(host).unwrap().rates();
        assert_eq!(rates.speed.total.incoming.bytes, 1000);
        assert_eq!(rates.speed.total.incoming.packets, 1);
        assert_eq!(rates.speed.total.incoming.flows, 1);
        assert_eq!(rates.speed.udp.incoming.bytes, 1000);

        // Second tick with no traffic: speed drops to zero, EMA decays
        map.tick(2, alpha, &stats);
        let rates = map.get(host).unwrap().rates();
        assert_eq!(rates.speed.total.incoming.bytes, 0);
        assert!(rates.average.total.incoming.bytes > 0.0);
    }

    #[test]
    fn test_flow_counted_once_per_window() {
        let map = HostMap::new(HostMapConfig::default());
        let stats = EngineStats::default();
        let host: IpAddr = "10.1.2.3".parse().unwrap();

        for _ in 0..5 {
            let pkt = make_packet("8.8.8.8", "10.1.2.3", 100);
            map.account_host(host, CounterSide::Incoming, &pkt, subnet("10.1.0.0/16"), "customers", None, &stats);
        }

        map.tick(1, ema_alpha(15.0), &stats);
        let rates = map.get(host).unwrap().rates();
        assert_eq!(rates.speed.total.incoming.packets, 5);
        assert_eq!(rates.speed.total.incoming.flows, 1);
    }

    #[test]
    fn test_group_ceiling_folds_into_subnet() {
        let config = HostMapConfig {
            max_hosts_per_group: 2,
            ..Default::default()
        };
        let map = HostMap::new(config);
        let stats = EngineStats::default();
        let net = subnet("10.1.0.0/16");

        for i in 1..=5u8 {
            let dst = format!("10.1.0.{}", i);
            let pkt = make_packet("8.8.8.8", &dst, 100);
            map.account_host(dst.parse().unwrap(), CounterSide::Incoming, &pkt, net, "customers", None, &stats);
        }

        assert_eq!(map.host_count(), 2);
        assert_eq!(stats.hosts_folded.load(Ordering::Relaxed), 3);

        // Folded traffic still lands in the subnet bucket
        map.tick(1, ema_alpha(15.0), &stats);
        let rates = map.subnet_rates(net).unwrap();
        assert_eq!(rates.speed.total.incoming.packets, 5);
    }

    #[test]
    fn test_idle_host_collected() {
        let config = HostMapConfig {
            host_idle_timeout_secs: 10,
            ..Default::default()
        };
        let map = HostMap::new(config);
        let stats = EngineStats::default();
        let host: IpAddr = "10.1.2.3".parse().unwrap();

        map.tick(100, ema_alpha(15.0), &stats);
        let pkt = make_packet("8.8.8.8", "10.1.2.3", 100);
        map.account_host(host, CounterSide::Incoming, &pkt, subnet("10.1.0.0/16"), "customers", None, &stats);
        assert_eq!(map.host_count(), 1);

        map.tick(105, ema_alpha(15.0), &stats);
        assert_eq!(map.host_count(), 1);

        map.tick(200, ema_alpha(15.0), &stats);
        assert_eq!(map.host_count(), 0);
        assert_eq!(stats.hosts_collected.load(Ordering::Relaxed), 1);

        // Reappearing host is recreated lazily
        map.account_host(host, CounterSide::Incoming, &pkt, subnet("10.1.0.0/16"), "customers", None, &stats);
        assert_eq!(map.host_count(), 1);
    }

    #[test]
    fn test_direction_totals() {
        let map = HostMap::new(HostMapConfig::default());
        let pkt = make_packet("8.8.8.8", "10.1.2.3", 700);

        map.account_direction(TrafficDirection::Incoming, &pkt);
        map.account_direction(TrafficDirection::Incoming, &pkt);
        map.account_direction(TrafficDirection::Outgoing, &pkt);

        let stats = EngineStats::default();
        map.tick(1, ema_alpha(15.0), &stats);

        assert_eq!(map.totals.speed(TrafficDirection::Incoming).packets, 2);
        assert_eq!(map.totals.speed(TrafficDirection::Outgoing).packets, 1);
        assert_eq!(map.totals.speed(TrafficDirection::Internal).packets, 0);
    }

    #[test]
    fn test_top_hosts_ordering() {
        let map = HostMap::new(HostMapConfig::default());
        let stats = EngineStats::default();
        let net = subnet("10.1.0.0/16");

        for (dst, count) in [("10.1.0.1", 3u32), ("10.1.0.2", 10), ("10.1.0.3", 5)] {
            for _ in 0..count {
                let pkt = make_packet("8.8.8.8", dst, 100);
                map.account_host(dst.parse().unwrap(), CounterSide::Incoming, &pkt, net, "customers", None, &stats);
            }
        }
        map.tick(1, ema_alpha(15.0), &stats);

        let top = map.top_hosts(SortMetric::Packets, CounterSide::Incoming, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, "10.1.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(top[0].1, 10);
        assert_eq!(top[1].0, "10.1.0.3".parse::<IpAddr>().unwrap());
    }
}
