//! Tick driver
//!
//! One thread fires every second from a monotonic clock: rotates the
//! counter map, walks the fresh snapshot against each host's effective
//! policy, and drives the attack manager. Hosts are visited in address
//! order so the emitted event sequence is reproducible for a given trace.
//!
//! On shutdown one final drain tick runs so active attacks are flushed
//! and outstanding mitigations withdrawn.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::info;

use crate::ban::BanManager;
use crate::config::BanSettings;
use crate::core::DetectionSource;
use crate::resolver::{Generation, HostGroupResolver};

use super::evaluator::evaluate;
use super::host_map::{EngineStats, HostMap, HostTraffic};

/// Everything one tick needs
pub struct TickContext {
    pub map: Arc<HostMap>,
    pub resolver: Arc<HostGroupResolver>,
    pub ban: Arc<BanManager>,
    pub stats: Arc<EngineStats>,
    /// EMA smoothing factor derived from `average_calculation_time`
    pub alpha: f64,
}

/// Effective policy for a host attributed at creation time: its group's
/// settings, else the parent's (one hop), else the global defaults. A
/// group name that vanished in a reload falls back to the global policy.
fn effective_ban<'a>(
    generation: &'a Generation,
    group_name: &str,
    parent_name: Option<&str>,
) -> &'a BanSettings {
    if let Some(group) = generation.group(group_name) {
        if let Some(ban) = &group.ban {
            return ban;
        }
        let parent = group
            .parent
            .as_deref()
            .or(parent_name)
            .and_then(|name| generation.group(name));
        if let Some(ban) = parent.and_then(|p| p.ban.as_ref()) {
            return ban;
        }
    }
    generation.global_ban()
}

/// Run one tick against the context. `now_secs` is the engine's monotonic
/// clock; detection timestamps use wall time.
pub fn run_tick(ctx: &TickContext, now_secs: u64) {
    ctx.map.tick(now_secs, ctx.alpha, &ctx.stats);

    let generation = ctx.resolver.generation();
    let now = Utc::now();

    // Address order makes the onset sequence deterministic for a trace
    let mut hosts: Vec<(IpAddr, Arc<HostTraffic>)> = Vec::with_capacity(ctx.map.host_count());
    ctx.map.for_each_host(|ip, host| hosts.push((ip, Arc::clone(host))));
    hosts.sort_by_key(|(ip, _)| *ip);

    for (ip, host) in hosts {
        let ban = effective_ban(&generation, &host.group_name, host.parent_group_name.as_deref());
        if !ban.enable_ban {
            continue;
        }
        if host.ipv6 && !ban.enable_ban_ipv6 {
            continue;
        }

        let rates = host.rates();
        if let Some(hit) = evaluate(&rates, ban) {
            ctx.ban.ban(
                ip,
                hit,
                rates,
                Some(host.subnet),
                &host.group_name,
                host.parent_group_name.as_deref(),
                DetectionSource::Automatic,
                now,
            );
        }
    }

    let map = Arc::clone(&ctx.map);
    ctx.ban.on_tick(now, move |ip| map.get(ip).map(|host| host.rates()));
}

/// The 1 Hz loop. Ticks are scheduled on absolute deadlines so hook time
/// does not skew the cadence; missed deadlines are skipped, not bunched.
pub fn run_tick_loop(ctx: TickContext, cancel: Arc<AtomicBool>) {
    let started = Instant::now();
    let period = Duration::from_secs(1);
    let mut deadline = started + period;

    info!("Tick driver started");

    loop {
        let cancelled = cancel.load(Ordering::Relaxed);

        run_tick(&ctx, started.elapsed().as_secs());

        if cancelled {
            // That was the drain tick
            break;
        }

        let now = Instant::now();
        while deadline <= now {
            deadline += period;
        }
        std::thread::sleep(deadline - now);
    }

    ctx.ban.shutdown();
    info!("Tick driver stopped");
}
