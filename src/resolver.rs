//! Host-group resolver
//!
//! Maps an IP address to its owning customer subnet and host group by
//! longest-prefix match. The whole lookup structure is one immutable
//! generation; reconfiguration builds a fresh generation offline and swaps
//! it under a lock, so readers never observe a partial rebuild.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::info;

use crate::config::{BanSettings, Config};
use crate::core::SubnetCidr;
use crate::patricia::PatriciaTree;

/// Synthetic group for monitored traffic that matches no configured prefix;
/// its thresholds are always disabled.
pub const UNKNOWN_HOST_GROUP: &str = "__unknown";

/// Implicit group covering `networks_list` space not claimed by any named
/// group; carries the global thresholds.
pub const GLOBAL_HOST_GROUP: &str = "global";

/// A named set of customer networks sharing a detection policy
#[derive(Debug)]
pub struct HostGroup {
    pub name: String,
    pub networks: Vec<SubnetCidr>,
    pub parent: Option<String>,
    /// Group policy; `None` means inherit (parent first, then global)
    pub ban: Option<BanSettings>,
}

/// Result of a successful resolution
#[derive(Clone)]
pub struct Resolution {
    pub subnet: SubnetCidr,
    pub group: Arc<HostGroup>,
    pub parent: Option<Arc<HostGroup>>,
}

impl Resolution {
    /// Effective policy: the group's own settings, else the parent's
    /// (one hop at most), else the global defaults.
    pub fn effective_ban<'a>(&'a self, global: &'a BanSettings) -> &'a BanSettings {
        if let Some(ban) = &self.group.ban {
            return ban;
        }
        if let Some(parent) = &self.parent {
            if let Some(ban) = &parent.ban {
                return ban;
            }
        }
        global
    }
}

/// One immutable lookup generation
pub struct Generation {
    groups_v4: PatriciaTree<Arc<HostGroup>>,
    groups_v6: PatriciaTree<Arc<HostGroup>>,
    monitored_v4: PatriciaTree<()>,
    monitored_v6: PatriciaTree<()>,
    groups: HashMap<String, Arc<HostGroup>>,
    unknown: Arc<HostGroup>,
    global_ban: BanSettings,
}

impl Generation {
    /// Build a generation from configuration. Assumes `config.validate()`
    /// already passed; CIDR parse failures here are still reported.
    pub fn build(config: &Config) -> Result<Self> {
        let mut monitored_v4 = PatriciaTree::ipv4();
        let mut monitored_v6 = PatriciaTree::ipv6();
        for net in &config.networks_list {
            let subnet: SubnetCidr = net
                .parse()
                .with_context(|| format!("Bad CIDR in networks_list: {}", net))?;
            if subnet.is_ipv6() {
                monitored_v6.insert(subnet, ());
            } else {
                monitored_v4.insert(subnet, ());
            }
        }

        let mut groups: HashMap<String, Arc<HostGroup>> = HashMap::new();
        let mut groups_v4 = PatriciaTree::ipv4();
        let mut groups_v6 = PatriciaTree::ipv6();

        for (name, group_config) in &config.hostgroups {
            let mut networks = Vec::with_capacity(group_config.networks.len());
            for net in &group_config.networks {
                let subnet: SubnetCidr = net
                    .parse()
                    .with_context(|| format!("Bad CIDR {} in host group {}", net, name))?;
                networks.push(subnet);
            }

            let group = Arc::new(HostGroup {
                name: name.clone(),
                networks: networks.clone(),
                parent: group_config.parent_host_group.clone(),
                ban: group_config.thresholds.clone(),
            });

            for subnet in networks {
                if subnet.is_ipv6() {
                    groups_v6.insert(subnet, Arc::clone(&group));
                } else {
                    groups_v4.insert(subnet, Arc::clone(&group));
                }
            }

            groups.insert(name.clone(), group);
        }

        // Monitored space outside every named group belongs to the implicit
        // global group with the global thresholds.
        let global = Arc::new(HostGroup {
            name: GLOBAL_HOST_GROUP.to_string(),
            networks: Vec::new(),
            parent: None,
            ban: Some(config.detection.thresholds.clone()),
        });
        groups.entry(GLOBAL_HOST_GROUP.to_string()).or_insert(global);

        let unknown = Arc::new(HostGroup {
            name: UNKNOWN_HOST_GROUP.to_string(),
            networks: Vec::new(),
            parent: None,
            ban: Some(BanSettings::default()),
        });
        groups.insert(UNKNOWN_HOST_GROUP.to_string(), Arc::clone(&unknown));

        info!(
            "Built resolver generation: {} monitored v4 + {} v6 prefixes, {} host groups",
            monitored_v4.len(),
            monitored_v6.len(),
            groups.len()
        );

        Ok(Self {
            groups_v4,
            groups_v6,
            monitored_v4,
            monitored_v6,
            groups,
            unknown,
            global_ban: config.detection.thresholds.clone(),
        })
    }

    /// Is this address inside `networks_list`?
    pub fn is_monitored(&self, ip: IpAddr) -> bool {
        let tree = if ip.is_ipv6() { &self.monitored_v6 } else { &self.monitored_v4 };
        tree.search_best(ip, true).is_some()
    }

    /// Longest-prefix resolution to `(subnet, group, parent)`.
    ///
    /// A monitored address outside every named group resolves to the
    /// synthetic `__unknown` group attributed to its monitored prefix.
    pub fn resolve(&self, ip: IpAddr) -> Option<Resolution> {
        let tree = if ip.is_ipv6() { &self.groups_v6 } else { &self.groups_v4 };

        if let Some((subnet, group)) = tree.search_best(ip, true) {
            let parent = group
                .parent
                .as_ref()
                .and_then(|name| self.groups.get(name))
                .cloned();
            return Some(Resolution {
                subnet,
                group: Arc::clone(group),
                parent,
            });
        }

        let monitored = if ip.is_ipv6() { &self.monitored_v6 } else { &self.monitored_v4 };
        monitored.search_best(ip, true).map(|(subnet, _)| Resolution {
            subnet,
            group: Arc::clone(&self.unknown),
            parent: None,
        })
    }

    pub fn group(&self, name: &str) -> Option<&Arc<HostGroup>> {
        self.groups.get(name)
    }

    pub fn global_ban(&self) -> &BanSettings {
        &self.global_ban
    }
}

/// Shared handle to the current generation
pub struct HostGroupResolver {
    current: RwLock<Arc<Generation>>,
}

impl HostGroupResolver {
    pub fn new(generation: Generation) -> Self {
        Self {
            current: RwLock::new(Arc::new(generation)),
        }
    }

    /// Publish a new generation. The old one is freed once the last
    /// in-flight reader drops its handle.
    pub fn swap(&self, generation: Generation) {
        *self.current.write() = Arc::new(generation);
    }

    /// Grab the current generation for a batch of lookups
    pub fn generation(&self) -> Arc<Generation> {
        Arc::clone(&self.current.read())
    }
}
