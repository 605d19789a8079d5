//! Daemon configuration
//!
//! Loaded from TOML. Every section has serde defaults so a minimal config
//! only needs `networks_list` and whichever thresholds should be armed.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::core::SubnetCidr;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub intake: IntakeConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub mitigation: MitigationConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    /// CIDRs constituting monitored space; traffic outside is dropped
    /// before resolution
    #[serde(default)]
    pub networks_list: Vec<String>,

    /// Named host groups with per-group thresholds
    #[serde(default)]
    pub hostgroups: HashMap<String, HostGroupConfig>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/ddosmon/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("ddosmon/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Structural validation beyond what serde can express.
    ///
    /// Errors here reject a reload atomically; the running generation
    /// stays in place.
    pub fn validate(&self) -> Result<()> {
        for net in &self.networks_list {
            net.parse::<SubnetCidr>()
                .with_context(|| format!("Bad CIDR in networks_list: {}", net))?;
        }

        let mut seen: HashSet<SubnetCidr> = HashSet::new();
        for (name, group) in &self.hostgroups {
            if name == crate::resolver::UNKNOWN_HOST_GROUP {
                bail!("Host group name {} is reserved", name);
            }

            for net in &group.networks {
                let subnet: SubnetCidr = net
                    .parse()
                    .with_context(|| format!("Bad CIDR {} in host group {}", net, name))?;
                if !seen.insert(subnet) {
                    bail!("Prefix {} is claimed by more than one host group", subnet);
                }
            }

            if let Some(parent) = &group.parent_host_group {
                if parent == name {
                    bail!("Host group {} cannot be its own parent", name);
                }
                if !self.hostgroups.contains_key(parent) {
                    bail!("Host group {} references unknown parent {}", name, parent);
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file; stdout when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

/// One UDP telemetry listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default)]
    pub enabled: bool,
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_sflow_listener")]
    pub sflow: ListenerConfig,

    /// NetFlow v5/v9 and IPFIX share one listener; the datagram version
    /// field dispatches
    #[serde(default = "default_netflow_listener")]
    pub netflow: ListenerConfig,

    /// Sampling divisor applied to NetFlow v5 records; the v5 header's own
    /// sampling field is informational only
    #[serde(default = "default_one")]
    pub netflow_sampling_ratio: u64,

    #[serde(default)]
    pub mirror: MirrorConfig,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            sflow: default_sflow_listener(),
            netflow: default_netflow_listener(),
            netflow_sampling_ratio: default_one(),
            mirror: MirrorConfig::default(),
        }
    }
}

/// Mirror/span capture source. Frames are replayed from a pcap file; live
/// attachment is a deployment concern outside the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MirrorConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub pcap_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// EMA averaging window tau, seconds
    #[serde(default = "default_average_calculation_time")]
    pub average_calculation_time: u64,

    /// Ban duration in seconds; 0 means until cleared
    #[serde(default = "default_ban_time")]
    pub ban_time: u64,

    /// Whether bans expire automatically
    #[serde(default = "default_true")]
    pub unban_enabled: bool,

    /// Seconds of silence before an idle host's counters are collected
    #[serde(default = "default_host_idle_timeout")]
    pub host_idle_timeout: u64,

    /// Safety cap on distinct hosts per host group; excess hosts fold
    /// into their subnet's overflow bucket
    #[serde(default = "default_max_hosts_per_group")]
    pub max_hosts_per_group: usize,

    /// Slots in the per-host conntrack sketch used for flow counting
    #[serde(default = "default_conntrack_capacity")]
    pub conntrack_capacity: usize,

    /// Budget for a single notification/mitigation hook, seconds
    #[serde(default = "default_hook_budget")]
    pub hook_budget_secs: u64,

    /// Global thresholds, used for monitored hosts outside any named group
    #[serde(default)]
    pub thresholds: BanSettings,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            average_calculation_time: default_average_calculation_time(),
            ban_time: default_ban_time(),
            unban_enabled: true,
            host_idle_timeout: default_host_idle_timeout(),
            max_hosts_per_group: default_max_hosts_per_group(),
            conntrack_capacity: default_conntrack_capacity(),
            hook_budget_secs: default_hook_budget(),
            thresholds: BanSettings::default(),
        }
    }
}

/// Per-metric detection policy. A disabled rule never fires regardless of
/// its numeric threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BanSettings {
    pub enable_ban: bool,
    pub enable_ban_ipv6: bool,

    pub enable_ban_for_pps: bool,
    pub enable_ban_for_bandwidth: bool,
    pub enable_ban_for_flows_per_second: bool,

    pub enable_ban_for_tcp_pps: bool,
    pub enable_ban_for_tcp_bandwidth: bool,

    pub enable_ban_for_udp_pps: bool,
    pub enable_ban_for_udp_bandwidth: bool,

    pub enable_ban_for_icmp_pps: bool,
    pub enable_ban_for_icmp_bandwidth: bool,

    pub enable_ban_for_tcp_syn_pps: bool,

    pub threshold_pps: u64,
    pub threshold_mbps: u64,
    pub threshold_flows: u64,

    pub threshold_tcp_pps: u64,
    pub threshold_tcp_mbps: u64,

    pub threshold_udp_pps: u64,
    pub threshold_udp_mbps: u64,

    pub threshold_icmp_pps: u64,
    pub threshold_icmp_mbps: u64,

    pub threshold_tcp_syn_pps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostGroupConfig {
    /// CIDRs owned by this group
    pub networks: Vec<String>,

    #[serde(default)]
    pub parent_host_group: Option<String>,

    /// Group policy; when absent the parent's (or the global) policy applies
    #[serde(default)]
    pub thresholds: Option<BanSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationMode {
    /// Announce a Flow Spec rule matching the attacked host
    Flowspec,
    /// Announce a /32 (or /128) blackhole for the attacked host
    Blackhole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MitigationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_mitigation_mode")]
    pub mode: MitigationMode,

    /// Byte-rate cap for flow spec rules; discard when unset
    #[serde(default)]
    pub rate_limit: Option<u64>,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_mitigation_mode(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Ring size: the last N packets of an attack are kept
    #[serde(default = "default_capture_packets")]
    pub packets_per_attack: usize,

    /// Directory for `<attack_uuid>.pcap` dumps
    #[serde(default = "default_capture_dir")]
    pub dump_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            packets_per_attack: default_capture_packets(),
            dump_dir: default_capture_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Protobuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Record format handed to the Kafka producer
    #[serde(default = "default_export_format")]
    pub kafka_traffic_export_format: ExportFormat,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            kafka_traffic_export_format: default_export_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifyConfig {
    /// Script invoked on ban/unban with the attack report on stdin
    #[serde(default)]
    pub script_path: Option<PathBuf>,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sflow_listener() -> ListenerConfig {
    ListenerConfig {
        enabled: false,
        listen: "0.0.0.0:6343".parse().unwrap(),
    }
}

fn default_netflow_listener() -> ListenerConfig {
    ListenerConfig {
        enabled: false,
        listen: "0.0.0.0:2055".parse().unwrap(),
    }
}

fn default_one() -> u64 {
    1
}

fn default_average_calculation_time() -> u64 {
    15
}

fn default_ban_time() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}

fn default_host_idle_timeout() -> u64 {
    900
}

fn default_max_hosts_per_group() -> usize {
    65_536
}

fn default_conntrack_capacity() -> usize {
    1024
}

fn default_hook_budget() -> u64 {
    2
}

fn default_mitigation_mode() -> MitigationMode {
    MitigationMode::Blackhole
}

fn default_capture_packets() -> usize {
    500
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("/var/lib/ddosmon/pcap")
}

fn default_export_format() -> ExportFormat {
    ExportFormat::Json
}
