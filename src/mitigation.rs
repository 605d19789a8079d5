//! Flow Spec / blackhole announcement encoder
//!
//! Translates an attack into the canonical textual mitigation rule handed
//! to the BGP speaker. The speaker itself is an external collaborator
//! behind the [`Mitigator`] trait.

use std::fmt::Display;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::core::SubnetCidr;

#[derive(Debug, Error)]
pub enum MitigationError {
    #[error("announcement rejected: {0}")]
    Rejected(String),

    #[error("speaker unavailable: {0}")]
    Unavailable(String),
}

/// Flow Spec action kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowSpecActionType {
    Accept,
    Discard,
    RateLimit,
}

/// One Flow Spec action clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpecAction {
    action_type: FlowSpecActionType,
    /// Byte-rate cap, consulted only for rate-limit actions
    rate_limit: u64,
}

impl Default for FlowSpecAction {
    fn default() -> Self {
        Self {
            action_type: FlowSpecActionType::Accept,
            rate_limit: 0,
        }
    }
}

impl FlowSpecAction {
    pub fn set_type(&mut self, action_type: FlowSpecActionType) {
        self.action_type = action_type;
    }

    pub fn set_rate_limit(&mut self, rate_limit: u64) {
        self.rate_limit = rate_limit;
    }

    pub fn serialize(&self) -> String {
        match self.action_type {
            FlowSpecActionType::Accept => "accept;".to_string(),
            FlowSpecActionType::Discard => "discard;".to_string(),
            FlowSpecActionType::RateLimit => format!("rate-limit {};", self.rate_limit),
        }
    }
}

/// Serialise a list of values with a separator and a per-value operator
/// prefix: `prefix+v1+sep+prefix+v2+...`. An empty list yields "".
///
/// This is the foundation of the rule encoder; the operator token (`=`,
/// `^`, ...) is chosen by the caller.
pub fn serialize_list<T: Display>(items: &[T], sep: &str, prefix: &str) -> String {
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        out.push_str(prefix);
        out.push_str(&item.to_string());
    }
    out
}

/// A complete Flow Spec rule: match clause plus exactly one action clause
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSpecRule {
    pub source: Option<SubnetCidr>,
    pub destination: Option<SubnetCidr>,
    pub source_ports: Vec<u16>,
    pub destination_ports: Vec<u16>,
    /// IP protocol numbers
    pub protocols: Vec<u8>,
    pub action: FlowSpecAction,
}

impl FlowSpecRule {
    pub fn serialize(&self) -> String {
        let mut matches = String::new();

        if let Some(source) = &self.source {
            matches.push_str(&format!(" source {};", source));
        }
        if let Some(destination) = &self.destination {
            matches.push_str(&format!(" destination {};", destination));
        }
        if !self.protocols.is_empty() {
            matches.push_str(&format!(
                " protocol {};",
                serialize_list(&self.protocols, " ", "=")
            ));
        }
        if !self.source_ports.is_empty() {
            matches.push_str(&format!(
                " source-port {};",
                serialize_list(&self.source_ports, " ", "=")
            ));
        }
        if !self.destination_ports.is_empty() {
            matches.push_str(&format!(
                " destination-port {};",
                serialize_list(&self.destination_ports, " ", "=")
            ));
        }

        format!("match {{{} }} then {{ {} }}", matches, self.action.serialize())
    }
}

/// A blackhole announcement is a degenerate rule: discard everything to
/// the attacked host
pub fn blackhole_rule(host: IpAddr) -> FlowSpecRule {
    let mut action = FlowSpecAction::default();
    action.set_type(FlowSpecActionType::Discard);

    FlowSpecRule {
        destination: Some(SubnetCidr::host(host)),
        action,
        ..Default::default()
    }
}

/// Seam to the BGP speaker
pub trait Mitigator: Send + Sync {
    fn announce(&self, rule: &FlowSpecRule) -> Result<(), MitigationError>;
    fn withdraw(&self, rule: &FlowSpecRule) -> Result<(), MitigationError>;
}

/// Speaker stub that logs announcements; the default when no external
/// speaker is wired in
pub struct LogMitigator;

impl Mitigator for LogMitigator {
    fn announce(&self, rule: &FlowSpecRule) -> Result<(), MitigationError> {
        info!("announce: {}", rule.serialize());
        Ok(())
    }

    fn withdraw(&self, rule: &FlowSpecRule) -> Result<(), MitigationError> {
        info!("withdraw: {}", rule.serialize());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_rate_limit() {
        let mut action = FlowSpecAction::default();
        action.set_type(FlowSpecActionType::RateLimit);
        action.set_rate_limit(1024);

        assert_eq!(action.serialize(), "rate-limit 1024;");
    }

    #[test]
    fn test_action_discard() {
        let mut action = FlowSpecAction::default();
        action.set_type(FlowSpecActionType::Discard);

        assert_eq!(action.serialize(), "discard;");
    }

    #[test]
    fn test_action_accept() {
        let mut action = FlowSpecAction::default();
        action.set_type(FlowSpecActionType::Accept);

        assert_eq!(action.serialize(), "accept;");
    }

    #[test]
    fn test_action_default_constructor() {
        let action = FlowSpecAction::default();
        assert_eq!(action.serialize(), "accept;");
    }

    #[test]
    fn test_serialize_list_single_element() {
        let items = vec!["123".to_string()];
        assert_eq!(serialize_list(&items, ",", ""), "123");
    }

    #[test]
    fn test_serialize_list_few_elements() {
        let items = vec!["123".to_string(), "456".to_string()];
        assert_eq!(serialize_list(&items, ",", ""), "123,456");
    }

    #[test]
    fn test_serialize_list_with_prefix_single_element() {
        let items: Vec<u16> = vec![123];
        assert_eq!(serialize_list(&items, ",", "^"), "^123");
    }

    #[test]
    fn test_serialize_list_with_prefix_few_elements() {
        let items: Vec<u16> = vec![123, 456];
        assert_eq!(serialize_list(&items, ",", "^"), "^123,^456");
    }

    #[test]
    fn test_serialize_list_empty() {
        let items: Vec<u16> = vec![];
        assert_eq!(serialize_list(&items, ",", "^"), "");
    }

    #[test]
    fn test_serialize_list_copy_counts() {
        // n copies of the prefix, n-1 copies of the separator
        let items: Vec<u16> = vec![1, 2, 3, 4, 5];
        let out = serialize_list(&items, "|", "^");
        assert_eq!(out.matches('^').count(), items.len());
        assert_eq!(out.matches('|').count(), items.len() - 1);
    }

    #[test]
    fn test_blackhole_v4() {
        let rule = blackhole_rule("10.1.2.3".parse().unwrap());
        assert_eq!(
            rule.serialize(),
            "match { destination 10.1.2.3/32; } then { discard; }"
        );
    }

    #[test]
    fn test_blackhole_v6() {
        let rule = blackhole_rule("2a03:f480::1".parse().unwrap());
        assert_eq!(
            rule.serialize(),
            "match { destination 2a03:f480::1/128; } then { discard; }"
        );
    }

    #[test]
    fn test_full_rule() {
        let mut action = FlowSpecAction::default();
        action.set_type(FlowSpecActionType::RateLimit);
        action.set_rate_limit(1_000_000);

        let rule = FlowSpecRule {
            destination: Some("10.1.2.3/32".parse().unwrap()),
            protocols: vec![17],
            destination_ports: vec![53, 123],
            action,
            ..Default::default()
        };

        assert_eq!(
            rule.serialize(),
            "match { destination 10.1.2.3/32; protocol =17; destination-port =53 =123; } then { rate-limit 1000000; }"
        );
    }
}
