//! Mitigation policy for the threat mitigation service.
//!
//! Rules map a condition over a (traffic sample, enrichment) pair to an
//! action kind. Classification is a pure function of its inputs: the same
//! samples and enrichments always produce the same ranked candidates.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::collector::TrafficSample;
use crate::core::enrichment::EnrichmentResult;
use crate::models::{MitigationRequest, Scope};

/// Rule condition type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyCondition {
    /// Listed by at least `min_hits` reputation zones
    ZoneListed { min_hits: usize },
    /// Share of total sampled bytes strictly above `threshold`
    TrafficShare { threshold: f64 },
    /// GeoIP country code in `codes`
    Country { codes: Vec<String> },
    /// Origin ASN in `numbers`
    Asn { numbers: Vec<u32> },
}

/// Rule action type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Block,
    Throttle,
    CdnBlock,
    AlertOnly,
}

/// Rule definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    /// Rule name
    pub name: String,
    /// Rule condition
    pub condition: PolicyCondition,
    /// Action taken when the condition holds
    pub action: ActionKind,
    /// Rule priority (higher numbers are evaluated first)
    #[serde(default)]
    pub priority: i32,
    /// Whether the rule is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Address flagged by at least one rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MitigationCandidate {
    /// Flagged source
    pub address: IpAddr,
    /// Bytes in the sampled window
    pub bytes: u64,
    /// Packets in the sampled window
    pub packets: u64,
    /// Fraction of the range's bytes
    pub share: f64,
    /// Number of zones listing the address
    pub zone_hits: usize,
    /// Names of those zones
    pub listed_zones: Vec<String>,
    /// Origin ASN, when known
    pub asn: Option<u32>,
    /// ISO country code, when known
    pub country: Option<String>,
    /// Distinct actions of the matched rules
    pub actions: Vec<ActionKind>,
    /// Matched rule names, in priority order
    pub matched_rules: Vec<String>,
}

impl MitigationCandidate {
    pub fn wants(&self, action: ActionKind) -> bool {
        self.actions.contains(&action)
    }
}

/// Default rules: listed anywhere, or above the traffic share threshold, is blocked.
pub fn default_rules(share_threshold: f64) -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            name: "reputation-listed".to_string(),
            condition: PolicyCondition::ZoneListed { min_hits: 1 },
            action: ActionKind::Block,
            priority: 10,
            enabled: true,
        },
        PolicyRule {
            name: "traffic-share".to_string(),
            condition: PolicyCondition::TrafficShare {
                threshold: share_threshold,
            },
            action: ActionKind::Block,
            priority: 5,
            enabled: true,
        },
    ]
}

/// Deterministic classifier
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    /// Create a policy engine; rules are ordered by priority, then name
    pub fn new(mut rules: Vec<PolicyRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Self { rules }
    }

    pub fn with_defaults(share_threshold: f64) -> Self {
        Self::new(default_rules(share_threshold))
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Copy of this engine with every traffic share threshold replaced
    pub fn with_share_threshold(&self, threshold: f64) -> Self {
        let rules = self
            .rules
            .iter()
            .cloned()
            .map(|mut rule| {
                if let PolicyCondition::TrafficShare { .. } = rule.condition {
                    rule.condition = PolicyCondition::TrafficShare { threshold };
                }
                rule
            })
            .collect();
        Self::new(rules)
    }

    fn matches(
        condition: &PolicyCondition,
        share: f64,
        enrichment: Option<&EnrichmentResult>,
    ) -> bool {
        match condition {
            PolicyCondition::ZoneListed { min_hits } => {
                enrichment.map_or(false, |e| e.hits() >= (*min_hits).max(1))
            }
            PolicyCondition::TrafficShare { threshold } => share > *threshold,
            PolicyCondition::Country { codes } => enrichment
                .and_then(|e| e.geo.as_ref())
                .and_then(|g| g.country_code.as_deref())
                .map_or(false, |cc| codes.iter().any(|c| c.eq_ignore_ascii_case(cc))),
            PolicyCondition::Asn { numbers } => enrichment
                .and_then(|e| e.geo.as_ref())
                .and_then(|g| g.asn)
                .map_or(false, |asn| numbers.contains(&asn)),
        }
    }

    /// Evaluate every rule over every sampled or enriched address.
    ///
    /// # Arguments
    ///
    /// * `samples` - Ranked window deltas of the range
    /// * `enrichments` - Reputation results for sampled and audited addresses
    ///
    /// # Returns
    ///
    /// Candidates ordered by zone hits, then bytes, then address
    pub fn classify(
        &self,
        samples: &[TrafficSample],
        enrichments: &[EnrichmentResult],
    ) -> Vec<MitigationCandidate> {
        let total: u64 = samples.iter().map(|s| s.bytes).sum();

        let mut subjects: BTreeMap<IpAddr, (Option<&TrafficSample>, Option<&EnrichmentResult>)> =
            BTreeMap::new();
        for sample in samples {
            subjects.entry(sample.address).or_default().0 = Some(sample);
        }
        for enrichment in enrichments {
            subjects.entry(enrichment.address).or_default().1 = Some(enrichment);
        }

        let mut candidates: Vec<MitigationCandidate> = subjects
            .into_iter()
            .filter_map(|(address, (sample, enrichment))| {
                let bytes = sample.map_or(0, |s| s.bytes);
                let packets = sample.map_or(0, |s| s.packets);
                let share = if total > 0 {
                    bytes as f64 / total as f64
                } else {
                    0.0
                };

                let mut actions = BTreeSet::new();
                let mut matched_rules = Vec::new();
                for rule in self.rules.iter().filter(|r| r.enabled) {
                    if Self::matches(&rule.condition, share, enrichment) {
                        actions.insert(rule.action);
                        matched_rules.push(rule.name.clone());
                    }
                }
                if matched_rules.is_empty() {
                    return None;
                }

                let geo = enrichment.and_then(|e| e.geo.as_ref());
                Some(MitigationCandidate {
                    address,
                    bytes,
                    packets,
                    share,
                    zone_hits: enrichment.map_or(0, |e| e.hits()),
                    listed_zones: enrichment.map(|e| e.listed_zones()).unwrap_or_default(),
                    asn: geo.and_then(|g| g.asn),
                    country: geo.and_then(|g| g.country_code.clone()),
                    actions: actions.into_iter().collect(),
                    matched_rules,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.zone_hits
                .cmp(&a.zone_hits)
                .then_with(|| b.bytes.cmp(&a.bytes))
                .then_with(|| a.address.cmp(&b.address))
        });
        candidates
    }
}

/// Shaping parameters for the planned throttle action
#[derive(Debug, Clone, PartialEq)]
pub struct ShapingTarget {
    pub interface: String,
    pub default_limit_mbit: u64,
    pub priority_rate_mbit: u64,
    /// Ranked top talkers receiving priority classes
    pub priority_addresses: Vec<IpAddr>,
}

/// What the planner may emit for one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct PlanContext {
    pub block_set: String,
    pub shaping: Option<ShapingTarget>,
    pub cdn_enabled: bool,
}

/// Turn ranked candidates into mitigation requests.
pub fn plan_actions(candidates: &[MitigationCandidate], ctx: &PlanContext) -> Vec<MitigationRequest> {
    let mut requests = Vec::new();

    let blocked: Vec<String> = candidates
        .iter()
        .filter(|c| c.wants(ActionKind::Block))
        .map(|c| c.address.to_string())
        .collect();
    if !blocked.is_empty() {
        requests.push(MitigationRequest::new(
            Scope::Edge,
            "block",
            json!({ "set": ctx.block_set, "list": blocked }),
        ));
    }

    if let Some(shaping) = &ctx.shaping {
        let mut addresses: Vec<String> = shaping
            .priority_addresses
            .iter()
            .map(|a| a.to_string())
            .collect();
        for candidate in candidates.iter().filter(|c| c.wants(ActionKind::Throttle)) {
            let address = candidate.address.to_string();
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
        requests.push(MitigationRequest::new(
            Scope::Edge,
            "throttle",
            json!({
                "iface": shaping.interface,
                "rate": format!("{}mbit", shaping.default_limit_mbit),
                "priority_rate": format!("{}mbit", shaping.priority_rate_mbit),
                "addresses": addresses,
            }),
        ));
    }

    if ctx.cdn_enabled {
        let asns: BTreeSet<u32> = candidates
            .iter()
            .filter(|c| c.wants(ActionKind::CdnBlock))
            .filter_map(|c| c.asn)
            .collect();
        if !asns.is_empty() {
            requests.push(MitigationRequest::new(
                Scope::Cdn,
                "asn_block",
                json!({ "asn": asns.into_iter().collect::<Vec<_>>() }),
            ));
        }
    }

    requests
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::enrichment::{GeoInfo, ZoneVerdict};
    use chrono::Utc;

    fn sample(ip: &str, bytes: u64) -> TrafficSample {
        let now = Utc::now();
        TrafficSample {
            address: ip.parse().unwrap(),
            bytes,
            packets: bytes / 100,
            window_start: now,
            window_end: now,
        }
    }

    fn enrichment(ip: &str, listed: &[bool], asn: Option<u32>) -> EnrichmentResult {
        EnrichmentResult {
            address: ip.parse().unwrap(),
            geo: asn.map(|asn| GeoInfo {
                country: Some("Exampleland".to_string()),
                country_code: Some("EX".to_string()),
                asn: Some(asn),
                org: None,
            }),
            geo_error: None,
            zones: listed
                .iter()
                .enumerate()
                .map(|(i, l)| ZoneVerdict {
                    zone: format!("zone{i}.example"),
                    listed: *l,
                    returned: Vec::new(),
                    error: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_listed_address_is_flagged() {
        let engine = PolicyEngine::with_defaults(0.9);
        let samples = vec![sample("192.168.0.10", 500), sample("192.168.0.20", 500)];
        let enrichments = vec![
            enrichment("192.168.0.10", &[false, false], None),
            enrichment("192.168.0.20", &[true, false], None),
        ];

        let candidates = engine.classify(&samples, &enrichments);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].address.to_string(), "192.168.0.20");
        assert_eq!(candidates[0].matched_rules, vec!["reputation-listed"]);
        assert_eq!(candidates[0].listed_zones, vec!["zone0.example"]);
    }

    #[test]
    fn test_traffic_share_threshold() {
        let engine = PolicyEngine::with_defaults(0.5);
        let samples = vec![sample("10.0.0.1", 800), sample("10.0.0.2", 200)];

        let candidates = engine.classify(&samples, &[]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].address.to_string(), "10.0.0.1");
        assert!((candidates[0].share - 0.8).abs() < f64::EPSILON);

        let strict = engine.with_share_threshold(0.9);
        assert!(strict.classify(&samples, &[]).is_empty());
    }

    #[test]
    fn test_classify_is_deterministic() {
        let engine = PolicyEngine::with_defaults(0.1);
        let samples = vec![
            sample("10.0.0.3", 100),
            sample("10.0.0.1", 500),
            sample("10.0.0.2", 500),
        ];
        let enrichments = vec![enrichment("10.0.0.3", &[true, true], None)];

        let first = engine.classify(&samples, &enrichments);
        let mut reversed = samples.clone();
        reversed.reverse();
        let second = engine.classify(&reversed, &enrichments);

        assert_eq!(first, second);
        let order: Vec<String> = first.iter().map(|c| c.address.to_string()).collect();
        // Listed first, then bytes, then address
        assert_eq!(order, vec!["10.0.0.3", "10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let mut rules = default_rules(0.0);
        for rule in &mut rules {
            rule.enabled = false;
        }
        let engine = PolicyEngine::new(rules);
        assert!(engine.classify(&[sample("10.0.0.1", 10)], &[]).is_empty());
    }

    #[test]
    fn test_asn_rule_plans_cdn_block() {
        let engine = PolicyEngine::new(vec![PolicyRule {
            name: "hostile-asn".to_string(),
            condition: PolicyCondition::Asn {
                numbers: vec![4134, 4837],
            },
            action: ActionKind::CdnBlock,
            priority: 1,
            enabled: true,
        }]);
        let enrichments = vec![
            enrichment("198.51.100.1", &[false], Some(4134)),
            enrichment("198.51.100.2", &[false], Some(4837)),
            enrichment("198.51.100.3", &[false], Some(15169)),
        ];
        let candidates = engine.classify(&[], &enrichments);
        assert_eq!(candidates.len(), 2);

        let ctx = PlanContext {
            block_set: "bad_ips".to_string(),
            shaping: None,
            cdn_enabled: true,
        };
        let requests = plan_actions(&candidates, &ctx);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].scope, Scope::Cdn);
        assert_eq!(requests[0].params["asn"], json!([4134, 4837]));

        let no_cdn = PlanContext {
            cdn_enabled: false,
            ..ctx
        };
        assert!(plan_actions(&candidates, &no_cdn).is_empty());
    }

    #[test]
    fn test_plan_block_and_throttle() {
        let engine = PolicyEngine::with_defaults(0.5);
        let samples = vec![sample("192.168.0.10", 200), sample("192.168.0.20", 50)];
        let candidates = engine.classify(&samples, &[]);

        let ctx = PlanContext {
            block_set: "bad_ips".to_string(),
            shaping: Some(ShapingTarget {
                interface: "eth0".to_string(),
                default_limit_mbit: 8,
                priority_rate_mbit: 100,
                priority_addresses: samples.iter().map(|s| s.address).collect(),
            }),
            cdn_enabled: false,
        };
        let requests = plan_actions(&candidates, &ctx);

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].action, "block");
        assert_eq!(requests[0].params["list"], json!(["192.168.0.10"]));
        assert_eq!(requests[1].action, "throttle");
        assert_eq!(requests[1].params["rate"], json!("8mbit"));
        assert_eq!(
            requests[1].params["addresses"],
            json!(["192.168.0.10", "192.168.0.20"])
        );
    }

    #[test]
    fn test_rules_deserialize() {
        let rules: Vec<PolicyRule> = serde_json::from_str(
            r#"[{"name":"ru","condition":{"type":"country","codes":["RU"]},"action":"alert_only"}]"#,
        )
        .unwrap();
        assert_eq!(rules[0].action, ActionKind::AlertOnly);
        assert!(rules[0].enabled);
        assert_eq!(rules[0].priority, 0);
    }
}
