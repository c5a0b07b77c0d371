use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::core::notifier::{AlertChannel, DeliveryPolicy};
use crate::core::policy::{MitigationCandidate, PolicyRule};

/// Failure taxonomy shared by every component.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Reputation, CDN or GeoIP network failure
    TransientProvider,
    /// Missing capability for firewall or shaping commands
    Privilege,
    /// Missing credentials, invalid range or invalid parameters
    Configuration,
    /// Required tool or backend not present on this host
    Unavailable,
    /// External command failed for any other reason
    Command,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::TransientProvider => "transient_provider",
            FailureKind::Privilege => "privilege",
            FailureKind::Configuration => "configuration",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Command => "command",
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Per-source traffic accounting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// nftables table holding the accounting set
    pub table: String,
    /// Dynamic set with per-element counters
    pub set: String,
    /// Chain carrying the accounting rule
    pub chain: String,
    /// Number of talkers reported per cycle
    pub top_n: usize,
    /// Flush the accounting set after every sample
    pub rotate_after_sample: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            table: "tms_mon".to_string(),
            set: "src_acct".to_string(),
            chain: "account".to_string(),
            top_n: 10,
            rotate_after_sample: false,
        }
    }
}

/// Connection audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Maximum distinct remote addresses handed to enrichment
    pub max_addresses: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { max_addresses: 50 }
    }
}

/// Reputation enrichment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// DNS blacklist zones queried for every address
    pub zones: Vec<String>,
    /// Whether GeoIP/ASN lookups are performed
    pub geo_enabled: bool,
    /// GeoIP JSON endpoint
    pub geo_endpoint: String,
    /// Timeout applied to each individual lookup
    pub lookup_timeout_ms: u64,
    /// Maximum number of lookups in flight
    pub max_in_flight: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            zones: crate::core::enrichment::DEFAULT_ZONES
                .iter()
                .map(|z| z.to_string())
                .collect(),
            geo_enabled: true,
            geo_endpoint: "http://ip-api.com/json".to_string(),
            lookup_timeout_ms: 2000,
            max_in_flight: 16,
        }
    }
}

/// Policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Share of total sampled bytes above which an address is flagged
    pub share_threshold: f64,
    /// Custom rules; the default rule set is used when absent
    pub rules: Option<Vec<PolicyRule>>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            share_threshold: 0.5,
            rules: None,
        }
    }
}

/// Local packet-filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// nftables table holding block sets
    pub table: String,
    /// Default block set name
    pub block_set: String,
    /// Input chain carrying the drop rules
    pub chain: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            table: "tms_guard".to_string(),
            block_set: "bad_ips".to_string(),
            chain: "input".to_string(),
        }
    }
}

/// Traffic shaping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingConfig {
    /// Whether cycles rebuild the shaping tree
    pub enabled: bool,
    /// Interface to shape; the default route interface when absent
    pub interface: Option<String>,
    /// Ceiling for unclassified traffic in megabytes per second
    pub limit_mb_per_s: f64,
    /// Guaranteed rate of priority classes in mbit
    pub priority_rate_mbit: u64,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interface: None,
            limit_mb_per_s: 1.0,
            priority_rate_mbit: 100,
        }
    }
}

/// CDN firewall configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CdnConfig {
    /// Whether the policy plans CDN rules
    pub enabled: bool,
    /// API token; falls back to CLOUDFLARE_API_TOKEN
    pub api_token: Option<String>,
    /// Zone the rules are created in
    pub zone_id: Option<String>,
    /// API base URL
    pub base_url: String,
    /// Firewall rule action
    pub rule_action: String,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_token: None,
            zone_id: None,
            base_url: "https://api.cloudflare.com/client/v4".to_string(),
            rule_action: "block".to_string(),
        }
    }
}

/// Operator notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Channels notified after every dispatch
    pub channels: Vec<AlertChannel>,
    /// Handling of failed deliveries
    pub policy: DeliveryPolicy,
    /// Sender address for mail alerts
    pub sender: String,
    /// Timeout for HTTP based channels
    pub timeout_seconds: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            policy: DeliveryPolicy::default(),
            sender: "tms@localhost".to_string(),
            timeout_seconds: 10,
        }
    }
}

/// Cycle scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Ranges monitored by the periodic loop
    pub ranges: Vec<String>,
    /// Seconds between periodic cycles; zero disables the loop
    pub interval_seconds: u64,
    /// Default sampling window in seconds
    pub window_seconds: u64,
    /// Outer deadline for a whole cycle
    pub deadline_seconds: u64,
    /// Directory receiving JSON cycle reports
    pub report_dir: Option<String>,
    /// Plan actions without dispatching them
    pub dry_run: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            ranges: Vec::new(),
            interval_seconds: 0,
            window_seconds: 30,
            deadline_seconds: 120,
            report_dir: None,
            dry_run: false,
        }
    }
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Counter collector configuration
    pub collector: CollectorConfig,
    /// Connection audit configuration
    pub audit: AuditConfig,
    /// Enrichment configuration
    pub enrichment: EnrichmentConfig,
    /// Policy configuration
    pub policy: PolicyConfig,
    /// Edge backend configuration
    pub edge: EdgeConfig,
    /// Shaping configuration
    pub shaping: ShapingConfig,
    /// CDN backend configuration
    pub cdn: CdnConfig,
    /// Alert configuration
    pub alerts: AlertsConfig,
    /// Cycle configuration
    pub cycle: CycleConfig,
}

/// Mitigation scope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Edge,
    #[serde(alias = "cloudflare")]
    Cdn,
    Upstream,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Edge => "edge",
            Scope::Cdn => "cdn",
            Scope::Upstream => "upstream",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mitigation request routed to a backend adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MitigationRequest {
    /// Backend family handling the request
    pub scope: Scope,
    /// Adapter action, aliases included
    pub action: String,
    /// Action parameters, validated by the adapter
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl MitigationRequest {
    pub fn new(scope: Scope, action: &str, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            scope,
            action: action.to_string(),
            params,
        }
    }
}

/// Per-target dispatch outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOutcome {
    /// Backend family of the target
    pub scope: Scope,
    /// Action as requested
    pub action: String,
    /// The adapter call returned without error
    pub ok: bool,
    /// The backend state changed
    pub applied: bool,
    /// Completion time of the adapter call
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// Adapter specific result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    /// Error message when `ok` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error category when `ok` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
}

/// Aggregated dispatch result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Dispatch itself never fails; see `targets` for the breakdown
    pub success: bool,
    /// Targets whose backend state changed
    pub applied: usize,
    /// Targets whose adapter call failed
    pub failed: usize,
    /// Outcomes in request order
    pub targets: Vec<TargetOutcome>,
}

/// Cycle invocation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CycleRequest {
    /// Monitored range in CIDR notation
    pub cidr: String,
    /// Sampling window, defaults to `cycle.window_seconds`
    pub sample_seconds: Option<u64>,
    /// Interface to shape, defaults to the configured or detected one
    pub interface: Option<String>,
    /// Rebuild the shaping tree for this range
    pub apply_shaping: Option<bool>,
    /// Default ceiling in MB/s
    pub limit_mb_per_s: Option<f64>,
    /// Traffic share above which a source is blocked
    pub share_threshold: Option<f64>,
    /// Plan without dispatching
    pub dry_run: Option<bool>,
}

impl CycleRequest {
    pub fn for_range(cidr: &str) -> Self {
        Self {
            cidr: cidr.to_string(),
            ..Self::default()
        }
    }
}

/// Ranked talker entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopTalker {
    /// Source address
    pub ip: String,
    /// Bytes seen in the window
    pub bytes: u64,
}

/// Cycle output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    /// Identifier shared by logs, alerts and dispatch
    pub cycle_id: Uuid,
    /// Interface used for shaping, if any
    pub interface: Option<String>,
    /// Canonical monitored range
    pub cidr: String,
    /// Length of the sampling window
    pub sampled_seconds: u64,
    /// Ranked sources of the window
    pub top10: Vec<TopTalker>,
    /// A throttle target was applied
    pub shaping_applied: bool,
    /// Ceiling for unclassified traffic
    pub default_limit_mbit: u64,
    /// Where the JSON report was written
    pub report_path: Option<String>,
    /// Remote addresses taken from the connection audit
    pub connections_audited: usize,
    /// Ranked classifier output
    pub candidates: Vec<MitigationCandidate>,
    /// Requests planned for dispatch; applied only when `dispatch` is set
    pub planned: Vec<MitigationRequest>,
    pub dispatch: Option<DispatchReport>,
    /// One entry per alert channel
    pub notifications: Vec<crate::core::notifier::NotifyOutcome>,
}
