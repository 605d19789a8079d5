//! Attack manager
//!
//! Owns the ban/unban lifecycle per host:
//! `calm -> attack_active -> ban_expired_awaiting_clear -> calm`.
//!
//! All transitions run on the evaluator thread. Hooks (notification, then
//! mitigation) are invoked outside the attack-map lock and timed against a
//! budget; an over-budget hook marks the attack degraded but never stalls
//! the state machine. A rejected mitigation is retried with exponential
//! backoff for as long as the attack stays active.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::capture::{AttackCapture, CaptureHandle};
use crate::config::{CaptureConfig, MitigationConfig, MitigationMode};
use crate::core::{
    classify_attack, generate_attack_uuid, serialize_attack_description, AttackDetails,
    DetectionSource, SubnetCidr, ThresholdDirection, TrafficDirection, TrafficRates,
};
use crate::engine::evaluator::{metric_value, ThresholdHit};
use crate::mitigation::{blackhole_rule, FlowSpecAction, FlowSpecActionType, FlowSpecRule, Mitigator};

/// Hook seam invoked around attack lifecycle transitions
pub trait AttackObserver: Send + Sync {
    fn on_attack_onset(&self, attack: &AttackDetails, description: &str);
    fn on_attack_peak(&self, attack: &AttackDetails);
    fn on_attack_clear(&self, attack: &AttackDetails);
}

/// Observer that reports transitions to the log
pub struct LogObserver;

impl AttackObserver for LogObserver {
    fn on_attack_onset(&self, attack: &AttackDetails, _description: &str) {
        info!(
            "Attack detected on {} ({}): {} via {} at {} units, uuid {}",
            attack.host,
            attack.host_group,
            attack.attack_type,
            attack.threshold,
            attack.attack_power,
            attack.uuid
        );
    }

    fn on_attack_peak(&self, attack: &AttackDetails) {
        debug!(
            "Attack on {} peaked at {} units",
            attack.host, attack.max_attack_power
        );
    }

    fn on_attack_clear(&self, attack: &AttackDetails) {
        info!("Attack on {} cleared, uuid {}", attack.host, attack.uuid);
    }
}

/// Observer that runs an operator script with the attack report on stdin.
///
/// Arguments mirror the classic notify interface: address, direction,
/// power, action.
pub struct ExecScriptObserver {
    script: PathBuf,
}

impl ExecScriptObserver {
    pub fn new(script: PathBuf) -> Self {
        Self { script }
    }

    fn run(&self, attack: &AttackDetails, action: &str, stdin_body: &str) {
        use std::io::Write;

        let spawned = Command::new(&self.script)
            .arg(attack.host.to_string())
            .arg(attack.direction.to_string())
            .arg(attack.attack_power.to_string())
            .arg(action)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(mut child) => {
                if let Some(mut stdin) = child.stdin.take() {
                    let _ = stdin.write_all(stdin_body.as_bytes());
                }
                match child.wait() {
                    Ok(status) if !status.success() => {
                        warn!("Notify script exited with {} for {}", status, attack.host)
                    }
                    Ok(_) => {}
                    Err(err) => warn!("Notify script wait failed: {}", err),
                }
            }
            Err(err) => warn!("Failed to spawn notify script {}: {}", self.script.display(), err),
        }
    }
}

impl AttackObserver for ExecScriptObserver {
    fn on_attack_onset(&self, attack: &AttackDetails, description: &str) {
        self.run(attack, "ban", description);
    }

    fn on_attack_peak(&self, _attack: &AttackDetails) {}

    fn on_attack_clear(&self, attack: &AttackDetails) {
        self.run(attack, "unban", &serialize_attack_description(attack));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttackState {
    Active,
    AwaitingClear,
}

struct ActiveAttack {
    details: AttackDetails,
    state: AttackState,
    capture: Option<AttackCapture>,
    rule: FlowSpecRule,
    announced: bool,
    retry_failures: u32,
    next_retry: Option<DateTime<Utc>>,
}

const BACKOFF_CAP_SECS: u64 = 60;
const ARCHIVE_LIMIT: usize = 128;

fn backoff_delay(failures: u32) -> Duration {
    Duration::from_secs((1u64 << failures.min(6)).min(BACKOFF_CAP_SECS))
}

#[derive(Debug, Clone)]
pub struct BanConfig {
    pub ban_time_secs: u64,
    pub unban_enabled: bool,
    pub hook_budget: Duration,
    pub mitigation: MitigationConfig,
    pub capture: CaptureConfig,
}

impl BanConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            ban_time_secs: config.detection.ban_time,
            unban_enabled: config.detection.unban_enabled,
            hook_budget: Duration::from_secs(config.detection.hook_budget_secs),
            mitigation: config.mitigation.clone(),
            capture: config.capture.clone(),
        }
    }
}

/// The attack manager
pub struct BanManager {
    active: RwLock<HashMap<IpAddr, ActiveAttack>>,
    archive: Mutex<Vec<AttackDetails>>,
    observers: Vec<Box<dyn AttackObserver>>,
    mitigator: Arc<dyn Mitigator>,
    /// Hot-path index: ingest workers look up capture rings here
    capture_index: Arc<DashMap<IpAddr, CaptureHandle>>,
    config: BanConfig,
}

impl BanManager {
    pub fn new(
        config: BanConfig,
        mitigator: Arc<dyn Mitigator>,
        observers: Vec<Box<dyn AttackObserver>>,
    ) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            archive: Mutex::new(Vec::new()),
            observers,
            mitigator,
            capture_index: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn capture_index(&self) -> Arc<DashMap<IpAddr, CaptureHandle>> {
        Arc::clone(&self.capture_index)
    }

    pub fn has_active_attack(&self, host: IpAddr) -> bool {
        self.active.read().contains_key(&host)
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Snapshot of every active attack, for inspectors
    pub fn active_attacks(&self) -> Vec<AttackDetails> {
        self.active.read().values().map(|a| a.details.clone()).collect()
    }

    /// Archived (finished) attacks, newest last
    pub fn archived_attacks(&self) -> Vec<AttackDetails> {
        self.archive.lock().clone()
    }

    /// Time a hook against the configured budget; returns whether the
    /// budget was exceeded.
    fn with_budget(&self, what: &str, host: IpAddr, f: impl FnOnce()) -> bool {
        let started = Instant::now();
        f();
        let elapsed = started.elapsed();
        if elapsed > self.config.hook_budget {
            warn!(
                "{} hook for {} took {:?}, over the {:?} budget; marking attack degraded",
                what, host, elapsed, self.config.hook_budget
            );
            return true;
        }
        false
    }

    fn build_rule(&self, host: IpAddr) -> FlowSpecRule {
        match self.config.mitigation.mode {
            MitigationMode::Blackhole => blackhole_rule(host),
            MitigationMode::Flowspec => {
                let mut action = FlowSpecAction::default();
                match self.config.mitigation.rate_limit {
                    Some(rate) => {
                        action.set_type(FlowSpecActionType::RateLimit);
                        action.set_rate_limit(rate);
                    }
                    None => action.set_type(FlowSpecActionType::Discard),
                }
                FlowSpecRule {
                    destination: Some(SubnetCidr::host(host)),
                    action,
                    ..Default::default()
                }
            }
        }
    }

    /// `calm -> attack_active`. Idempotent: a host with an active attack
    /// is left untouched (peak tracking happens on tick).
    #[allow(clippy::too_many_arguments)]
    pub fn ban(
        &self,
        host: IpAddr,
        hit: ThresholdHit,
        rates: TrafficRates,
        subnet: Option<SubnetCidr>,
        host_group: &str,
        parent_host_group: Option<&str>,
        source: DetectionSource,
        now: DateTime<Utc>,
    ) {
        {
            let active = self.active.read();
            if active.contains_key(&host) {
                return;
            }
        }

        let direction = match hit.direction {
            ThresholdDirection::Incoming => TrafficDirection::Incoming,
            ThresholdDirection::Outgoing => TrafficDirection::Outgoing,
            ThresholdDirection::Unknown => TrafficDirection::Other,
        };
        let (attack_type, protocol) = classify_attack(&rates, direction);

        let mut details = AttackDetails {
            uuid: generate_attack_uuid(),
            host,
            ipv6: host.is_ipv6(),
            customer_network: subnet,
            host_group: host_group.to_string(),
            parent_host_group: parent_host_group.unwrap_or_default().to_string(),
            direction,
            attack_type,
            protocol,
            source,
            threshold: hit.threshold,
            threshold_direction: hit.direction,
            attack_power: hit.rate,
            max_attack_power: hit.rate,
            ban_timestamp: now,
            ban_time_secs: self.config.ban_time_secs,
            unban_enabled: self.config.unban_enabled,
            rates,
            ..Default::default()
        };

        let capture = if self.config.capture.enabled {
            let (capture, handle) = AttackCapture::open(self.config.capture.packets_per_attack);
            self.capture_index.insert(host, handle);
            Some(capture)
        } else {
            None
        };

        let rule = self.build_rule(host);

        // Notification before mitigation, so an operator observer sees the
        // event before routes shift.
        let description = serialize_attack_description(&details);
        for observer in &self.observers {
            if self.with_budget("onset", host, || observer.on_attack_onset(&details, &description)) {
                details.degraded = true;
            }
        }

        let mut announced = false;
        let mut next_retry = None;
        if self.config.mitigation.enabled {
            match self.mitigator.announce(&rule) {
                Ok(()) => announced = true,
                Err(err) => {
                    error!("Mitigation announcement for {} failed: {}", host, err);
                    details.mitigation_failed = true;
                    next_retry = Some(now + chrono::Duration::seconds(backoff_delay(0).as_secs() as i64));
                }
            }
        }

        let entry = ActiveAttack {
            details,
            state: AttackState::Active,
            capture,
            rule,
            announced,
            retry_failures: 0,
            next_retry,
        };

        self.active.write().insert(host, entry);
    }

    /// Manual or timer unban; applying it twice is equivalent to once.
    pub fn unban(&self, host: IpAddr, source: DetectionSource) {
        let entry = {
            let mut active = self.active.write();
            let is_active = matches!(active.get(&host), Some(attack) if attack.state == AttackState::Active);
            if is_active {
                active.remove(&host).map(|mut attack| {
                    attack.state = AttackState::AwaitingClear;
                    attack
                })
            } else {
                // Already awaiting clear or calm: nothing to do
                None
            }
        };

        let Some(mut entry) = entry else { return };

        if source == DetectionSource::Manual {
            info!("Manual unban for {}", host);
        }

        self.clear(host, &mut entry);
    }

    /// `ban_expired_awaiting_clear -> calm`: withdraw mitigation, flush
    /// capture, run clear hooks, archive.
    fn clear(&self, host: IpAddr, entry: &mut ActiveAttack) {
        self.capture_index.remove(&host);

        if entry.announced {
            if let Err(err) = self.mitigator.withdraw(&entry.rule) {
                error!("Mitigation withdrawal for {} failed: {}", host, err);
            }
            entry.announced = false;
        }

        if let Some(capture) = entry.capture.take() {
            match capture.flush_to_pcap(&self.config.capture.dump_dir, entry.details.uuid) {
                Ok(path) => debug!("Capture for {} written to {}", host, path.display()),
                Err(err) => warn!("Failed to flush capture for {}: {}", host, err),
            }
        }

        for observer in &self.observers {
            if self.with_budget("clear", host, || observer.on_attack_clear(&entry.details)) {
                entry.details.degraded = true;
            }
        }

        let mut archive = self.archive.lock();
        if archive.len() >= ARCHIVE_LIMIT {
            archive.remove(0);
        }
        archive.push(entry.details.clone());
    }

    /// Per-tick maintenance: peak tracking against the frozen triggering
    /// metric, mitigation retries, and ban expiry.
    pub fn on_tick(&self, now: DateTime<Utc>, lookup: impl Fn(IpAddr) -> Option<TrafficRates>) {
        let mut peaks: Vec<AttackDetails> = Vec::new();
        let mut retries: Vec<(IpAddr, FlowSpecRule, u32)> = Vec::new();
        let mut expired: Vec<IpAddr> = Vec::new();

        {
            let mut active = self.active.write();
            for (host, attack) in active.iter_mut() {
                if attack.state != AttackState::Active {
                    continue;
                }

                if let Some(rates) = lookup(*host) {
                    let value = metric_value(
                        &rates,
                        attack.details.threshold,
                        attack.details.threshold_direction,
                    );
                    if value > attack.details.max_attack_power {
                        attack.details.max_attack_power = value;
                        peaks.push(attack.details.clone());
                    }
                }

                if attack.details.mitigation_failed {
                    if let Some(next_retry) = attack.next_retry {
                        if now >= next_retry {
                            retries.push((*host, attack.rule.clone(), attack.retry_failures));
                        }
                    }
                }

                let expires = attack.details.unban_enabled
                    && attack.details.ban_time_secs > 0
                    && (now - attack.details.ban_timestamp).num_seconds()
                        >= attack.details.ban_time_secs as i64;
                if expires {
                    expired.push(*host);
                }
            }
        }

        for details in peaks {
            let mut over_budget = false;
            for observer in &self.observers {
                over_budget |= self.with_budget("peak", details.host, || observer.on_attack_peak(&details));
            }
            if over_budget {
                if let Some(attack) = self.active.write().get_mut(&details.host) {
                    attack.details.degraded = true;
                }
            }
        }

        for (host, rule, failures) in retries {
            let result = self.mitigator.announce(&rule);
            let mut active = self.active.write();
            let Some(attack) = active.get_mut(&host) else { continue };
            match result {
                Ok(()) => {
                    info!("Mitigation retry for {} succeeded", host);
                    attack.announced = true;
                    attack.details.mitigation_failed = false;
                    attack.next_retry = None;
                    attack.retry_failures = 0;
                }
                Err(err) => {
                    let failures = failures + 1;
                    warn!("Mitigation retry {} for {} failed: {}", failures, host, err);
                    attack.retry_failures = failures;
                    attack.next_retry =
                        Some(now + chrono::Duration::seconds(backoff_delay(failures).as_secs() as i64));
                }
            }
        }

        for host in expired {
            debug!("Ban timer expired for {}", host);
            self.unban(host, DetectionSource::Automatic);
        }
    }

    /// Graceful shutdown: withdraw every outstanding mitigation and close
    /// out active attacks.
    pub fn shutdown(&self) {
        let hosts: Vec<IpAddr> = self.active.read().keys().copied().collect();
        for host in hosts {
            self.unban(host, DetectionSource::Automatic);
        }
    }
}
