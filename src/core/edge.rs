//! Local packet-filter and shaping backend.
//!
//! `block` merges addresses into an nftables interval set and makes sure a
//! drop rule references it, all in one `nft -f` transaction. `throttle`
//! rebuilds an HTB tree on an interface: the old tree is torn down first,
//! so flows briefly lose fine-grained classification during the rebuild.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;

use crate::core::capability::ExecutionPlan;
use crate::core::dispatcher::{AdapterOutcome, DispatchContext, MitigationBackend, MitigationError};
use crate::core::exec::{argv, CommandError, CommandRunner};
use crate::models::{EdgeConfig, MitigationRequest, Scope, ShapingConfig};
use crate::utils::is_valid_object_name;

const DEFAULT_CLASS: u16 = 30;
const FIRST_PRIORITY_CLASS: u16 = 10;
const MAX_PRIORITY_CLASSES: usize = 20;

/// A single value or a list of values
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlockParams {
    set: Option<String>,
    list: Option<OneOrMany>,
}

#[derive(Debug, Deserialize)]
struct ThrottleParams {
    iface: Option<String>,
    rate: Option<RateSpec>,
    priority_rate: Option<RateSpec>,
    #[serde(default)]
    addresses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RateSpec {
    Text(String),
    Mbit(f64),
}

/// Bandwidth in kbit/s
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Rate {
    pub kbit: u64,
}

impl Rate {
    pub fn mbit(mbit: u64) -> Self {
        Self {
            kbit: mbit.saturating_mul(1000),
        }
    }

    /// Parse `"500kbit"`, `"8mbit"`, `"1gbit"` or a bare number of mbit
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().to_ascii_lowercase();
        let (number, factor) = if let Some(n) = text.strip_suffix("kbit") {
            (n, 1.0)
        } else if let Some(n) = text.strip_suffix("mbit") {
            (n, 1000.0)
        } else if let Some(n) = text.strip_suffix("gbit") {
            (n, 1_000_000.0)
        } else {
            (text.as_str(), 1000.0)
        };
        let value: f64 = number.trim().parse().ok()?;
        if !value.is_finite() || value <= 0.0 {
            return None;
        }
        Some(Self {
            kbit: ((value * factor).round() as u64).max(1),
        })
    }

    fn from_spec(spec: &RateSpec) -> Option<Self> {
        match spec {
            RateSpec::Text(text) => Self::parse(text),
            RateSpec::Mbit(mbit) if mbit.is_finite() && *mbit > 0.0 => Some(Self {
                kbit: ((mbit * 1000.0).round() as u64).max(1),
            }),
            RateSpec::Mbit(_) => None,
        }
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kbit % 1000 == 0 {
            write!(f, "{}mbit", self.kbit / 1000)
        } else {
            write!(f, "{}kbit", self.kbit)
        }
    }
}

/// Ceiling for unclassified traffic: MB/s × 8, at least 1 mbit
pub fn default_limit_mbit(limit_mb_per_s: f64) -> u64 {
    let mbit = (limit_mb_per_s * 8.0).round();
    if mbit.is_finite() && mbit >= 1.0 {
        mbit as u64
    } else {
        1
    }
}

/// Canonical block-set entries split by family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockEntries {
    pub v4: Vec<IpNetwork>,
    pub v6: Vec<IpNetwork>,
}

impl BlockEntries {
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse, normalize, sort and deduplicate block-set entries
pub fn canonical_entries(list: &[String]) -> Result<BlockEntries, MitigationError> {
    let mut entries = BlockEntries::default();
    for raw in list {
        let parsed = IpNetwork::from_str(raw.trim())
            .map_err(|_| MitigationError::Configuration(format!("invalid address '{raw}'")))?;
        let network = IpNetwork::new(parsed.network(), parsed.prefix())
            .map_err(|_| MitigationError::Configuration(format!("invalid address '{raw}'")))?;
        if network.is_ipv4() {
            entries.v4.push(network);
        } else {
            entries.v6.push(network);
        }
    }
    for family in [&mut entries.v4, &mut entries.v6] {
        family.sort_by(|a, b| a.ip().cmp(&b.ip()).then_with(|| a.prefix().cmp(&b.prefix())));
        family.dedup();
    }
    Ok(entries)
}

fn render_entry(network: &IpNetwork) -> String {
    let full = if network.is_ipv4() { 32 } else { 128 };
    if network.prefix() == full {
        network.ip().to_string()
    } else {
        network.to_string()
    }
}

fn render_elements(networks: &[IpNetwork]) -> String {
    networks.iter().map(render_entry).collect::<Vec<_>>().join(", ")
}

/// nft transaction merging `entries` into `set`, with the drop rules
/// included only when missing.
pub fn block_script(
    table: &str,
    chain: &str,
    set: &str,
    entries: &BlockEntries,
    add_v4_rule: bool,
    add_v6_rule: bool,
) -> String {
    let mut lines = vec![
        format!("add table inet {table}"),
        format!(
            "add chain inet {table} {chain} {{ type filter hook input priority 0; policy accept; }}"
        ),
    ];
    if !entries.v4.is_empty() {
        lines.push(format!(
            "add set inet {table} {set} {{ type ipv4_addr; flags interval; auto-merge; }}"
        ));
        lines.push(format!(
            "add element inet {table} {set} {{ {} }}",
            render_elements(&entries.v4)
        ));
        if add_v4_rule {
            lines.push(format!("add rule inet {table} {chain} ip saddr @{set} drop"));
        }
    }
    if !entries.v6.is_empty() {
        lines.push(format!(
            "add set inet {table} {set}_v6 {{ type ipv6_addr; flags interval; auto-merge; }}"
        ));
        lines.push(format!(
            "add element inet {table} {set}_v6 {{ {} }}",
            render_elements(&entries.v6)
        ));
        if add_v6_rule {
            lines.push(format!(
                "add rule inet {table} {chain} ip6 saddr @{set}_v6 drop"
            ));
        }
    }
    let mut script = lines.join("\n");
    script.push('\n');
    script
}

/// One priority class of the shaping tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityClass {
    pub minor: u16,
    pub address: IpAddr,
}

/// HTB tree for one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapingPlan {
    pub interface: String,
    pub default_ceiling: Rate,
    pub priority_rate: Rate,
    pub classes: Vec<PriorityClass>,
    /// Addresses beyond the class id space
    pub skipped: usize,
}

impl ShapingPlan {
    pub fn build(
        interface: &str,
        default_ceiling: Rate,
        priority_rate: Rate,
        addresses: &[IpAddr],
    ) -> Self {
        let mut unique: Vec<IpAddr> = Vec::new();
        for address in addresses {
            if !unique.contains(address) {
                unique.push(*address);
            }
        }
        let skipped = unique.len().saturating_sub(MAX_PRIORITY_CLASSES);
        let classes = unique
            .into_iter()
            .take(MAX_PRIORITY_CLASSES)
            .enumerate()
            .map(|(i, address)| PriorityClass {
                minor: FIRST_PRIORITY_CLASS + i as u16,
                address,
            })
            .collect();
        Self {
            interface: interface.to_string(),
            default_ceiling,
            priority_rate,
            classes,
            skipped,
        }
    }

    /// `tc` argument lists installing the tree, in order
    pub fn commands(&self) -> Vec<Vec<String>> {
        let dev = self.interface.as_str();
        let prio = self.priority_rate.to_string();
        let def = self.default_ceiling.to_string();
        let default_class = format!("1:{DEFAULT_CLASS}");
        let default_handle = format!("{DEFAULT_CLASS}:");
        let default_minor = DEFAULT_CLASS.to_string();

        let mut commands = vec![
            argv(&["qdisc", "add", "dev", dev, "root", "handle", "1:", "htb", "default", &default_minor]),
            argv(&["class", "add", "dev", dev, "parent", "1:", "classid", "1:1", "htb", "rate", &prio]),
            argv(&[
                "class", "add", "dev", dev, "parent", "1:1", "classid", &default_class, "htb", "rate",
                &def, "ceil", &def,
            ]),
            argv(&[
                "qdisc", "add", "dev", dev, "parent", &default_class, "handle", &default_handle, "sfq",
                "perturb", "10",
            ]),
        ];

        for class in &self.classes {
            let classid = format!("1:{}", class.minor);
            let handle = format!("{}:", class.minor);
            commands.push(argv(&[
                "class", "add", "dev", dev, "parent", "1:1", "classid", &classid, "htb", "rate", &prio,
                "ceil", &prio,
            ]));
            commands.push(argv(&[
                "qdisc", "add", "dev", dev, "parent", &classid, "handle", &handle, "sfq", "perturb",
                "10",
            ]));
            let (protocol, prio_num, matcher, host) = match class.address {
                IpAddr::V4(v4) => ("ip", "1", "ip", format!("{v4}/32")),
                IpAddr::V6(v6) => ("ipv6", "2", "ip6", format!("{v6}/128")),
            };
            commands.push(argv(&[
                "filter", "add", "dev", dev, "protocol", protocol, "parent", "1:", "prio", prio_num,
                "u32", "match", matcher, "dst", &host, "flowid", &classid,
            ]));
        }
        commands
    }

    /// The install as a `tc -batch` script, one command per line
    pub fn batch_script(&self) -> String {
        let mut script = String::new();
        for args in self.commands() {
            script.push_str(&args.join(" "));
            script.push('\n');
        }
        script
    }
}

/// nftables/tc adapter
pub struct EdgeAdapter {
    runner: Arc<dyn CommandRunner>,
    plan: ExecutionPlan,
    config: EdgeConfig,
    shaping: ShapingConfig,
}

impl EdgeAdapter {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        plan: ExecutionPlan,
        config: EdgeConfig,
        shaping: ShapingConfig,
    ) -> Self {
        Self {
            runner,
            plan,
            config,
            shaping,
        }
    }

    fn canonical_action(action: &str) -> &str {
        match action {
            "block_ipset" => "block",
            "throttle_iface" => "throttle",
            other => other,
        }
    }

    fn interface_for(&self, requested: Option<&str>) -> Option<String> {
        requested
            .map(|s| s.to_string())
            .or_else(|| self.shaping.interface.clone())
            .or_else(|| self.plan.default_interface.clone())
    }

    fn parse<T: for<'de> Deserialize<'de>>(request: &MitigationRequest) -> Result<T, MitigationError> {
        serde_json::from_value(serde_json::Value::Object(request.params.clone()))
            .map_err(|e| MitigationError::Configuration(format!("invalid parameters: {e}")))
    }

    async fn block(&self, request: &MitigationRequest) -> Result<AdapterOutcome, MitigationError> {
        if !self.plan.nft {
            return Err(MitigationError::Unavailable("nftables is not installed".to_string()));
        }
        let params: BlockParams = Self::parse(request)?;
        let set = params.set.unwrap_or_else(|| self.config.block_set.clone());
        if !is_valid_object_name(&set, 60) {
            return Err(MitigationError::Configuration(format!("invalid set name '{set}'")));
        }
        let list = params.list.map(OneOrMany::into_vec).unwrap_or_default();
        let entries = canonical_entries(&list)?;
        if entries.is_empty() {
            return Err(MitigationError::Configuration("empty address list".to_string()));
        }

        let table = self.config.table.as_str();
        let chain = self.config.chain.as_str();
        let listing = match self
            .runner
            .run("nft", &argv(&["list", "chain", "inet", table, chain]), None)
            .await
        {
            Ok(out) => out.stdout,
            Err(CommandError::Failed { .. }) => String::new(),
            Err(e) => return Err(e.into()),
        };
        let add_v4_rule = !listing.contains(&format!("ip saddr @{set} drop"));
        let add_v6_rule = !listing.contains(&format!("ip6 saddr @{set}_v6 drop"));

        let script = block_script(table, chain, &set, &entries, add_v4_rule, add_v6_rule);
        self.runner
            .run("nft", &argv(&["-f", "-"]), Some(script))
            .await?;

        let rule_added = (add_v4_rule && !entries.v4.is_empty()) || (add_v6_rule && !entries.v6.is_empty());
        info!("Block set {} merged ({} entries)", set, entries.len());
        Ok(AdapterOutcome {
            applied: true,
            detail: json!({
                "edge": "nftables",
                "set": set,
                "added": entries.len(),
                "rule_added": rule_added,
            }),
        })
    }

    async fn throttle(&self, request: &MitigationRequest) -> Result<AdapterOutcome, MitigationError> {
        if !self.plan.tc {
            return Err(MitigationError::Unavailable("tc is not installed".to_string()));
        }
        let params: ThrottleParams = Self::parse(request)?;
        let interface = self
            .interface_for(params.iface.as_deref())
            .ok_or_else(|| MitigationError::Configuration("no interface to shape".to_string()))?;
        if !is_valid_object_name(&interface, 15) {
            return Err(MitigationError::Configuration(format!(
                "invalid interface name '{interface}'"
            )));
        }

        let default_ceiling = match &params.rate {
            Some(spec) => Rate::from_spec(spec)
                .ok_or_else(|| MitigationError::Configuration("invalid rate".to_string()))?,
            None => Rate::mbit(default_limit_mbit(self.shaping.limit_mb_per_s)),
        };
        let priority_rate = match &params.priority_rate {
            Some(spec) => Rate::from_spec(spec)
                .ok_or_else(|| MitigationError::Configuration("invalid priority rate".to_string()))?,
            None => Rate::mbit(self.shaping.priority_rate_mbit.max(1)),
        };
        let addresses = params
            .addresses
            .iter()
            .map(|a| {
                a.parse::<IpAddr>()
                    .map_err(|_| MitigationError::Configuration(format!("invalid address '{a}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let plan = ShapingPlan::build(&interface, default_ceiling, priority_rate.max(default_ceiling), &addresses);

        // Teardown of a missing tree is expected on first install
        match self
            .runner
            .run("tc", &argv(&["qdisc", "del", "dev", &interface, "root"]), None)
            .await
        {
            Ok(_) => {}
            Err(CommandError::Failed { stderr, .. }) => {
                debug!("No shaping tree to remove on {}: {}", interface, stderr)
            }
            Err(e) => return Err(e.into()),
        }

        // The whole tree goes in as one batch so no partial tree is left
        self.runner
            .run("tc", &argv(&["-batch", "-"]), Some(plan.batch_script()))
            .await?;

        info!(
            "Shaping tree rebuilt on {} ({} priority classes, default {})",
            interface,
            plan.classes.len(),
            plan.default_ceiling
        );
        Ok(AdapterOutcome {
            applied: true,
            detail: json!({
                "edge": "tc",
                "iface": interface,
                "default_limit": plan.default_ceiling.to_string(),
                "priority_rate": plan.priority_rate.to_string(),
                "priority_classes": plan.classes.len(),
                "skipped": plan.skipped,
            }),
        })
    }
}

#[async_trait]
impl MitigationBackend for EdgeAdapter {
    fn scope(&self) -> Scope {
        Scope::Edge
    }

    fn resource_key(&self, request: &MitigationRequest) -> String {
        match Self::canonical_action(&request.action) {
            "block" => {
                let set = request
                    .params
                    .get("set")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&self.config.block_set);
                format!("edge:set:{set}")
            }
            "throttle" => {
                let requested = request.params.get("iface").and_then(|v| v.as_str());
                let iface = self.interface_for(requested).unwrap_or_default();
                format!("edge:tc:{iface}")
            }
            _ => "edge".to_string(),
        }
    }

    async fn apply(
        &self,
        request: &MitigationRequest,
        _ctx: &DispatchContext,
    ) -> Result<AdapterOutcome, MitigationError> {
        match Self::canonical_action(&request.action) {
            "block" => self.block(request).await,
            "throttle" => self.throttle(request).await,
            other => Err(MitigationError::UnsupportedAction {
                scope: Scope::Edge,
                action: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exec::testing::{failed, ScriptedRunner};
    use crate::core::exec::CommandOutput;
    use crate::models::FailureKind;

    fn adapter(runner: Arc<ScriptedRunner>) -> EdgeAdapter {
        EdgeAdapter::new(
            runner,
            ExecutionPlan::full(Some("eth0")),
            EdgeConfig::default(),
            ShapingConfig::default(),
        )
    }

    fn block_request(list: serde_json::Value) -> MitigationRequest {
        MitigationRequest::new(Scope::Edge, "block", json!({ "set": "bad_ips", "list": list }))
    }

    #[test]
    fn test_rate_parsing() {
        assert_eq!(Rate::parse("8mbit"), Some(Rate::mbit(8)));
        assert_eq!(Rate::parse("1gbit"), Some(Rate::mbit(1000)));
        assert_eq!(Rate::parse("500kbit").unwrap().to_string(), "500kbit");
        assert_eq!(Rate::parse("100"), Some(Rate::mbit(100)));
        assert_eq!(Rate::parse("fast"), None);
        assert_eq!(Rate::parse("-1mbit"), None);
    }

    #[test]
    fn test_default_limit_mbit() {
        assert_eq!(default_limit_mbit(1.0), 8);
        assert_eq!(default_limit_mbit(0.01), 1);
        assert_eq!(default_limit_mbit(12.5), 100);
    }

    #[test]
    fn test_canonical_entries_dedupes() {
        let list = vec![
            "10.0.0.5".to_string(),
            "10.0.0.5/32".to_string(),
            "192.168.1.77/24".to_string(),
            "2001:db8::1".to_string(),
        ];
        let entries = canonical_entries(&list).unwrap();
        assert_eq!(entries.v4.len(), 2);
        assert_eq!(entries.v6.len(), 1);
        assert_eq!(render_elements(&entries.v4), "10.0.0.5, 192.168.1.0/24");
        assert!(canonical_entries(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_shaping_plan_commands() {
        let addresses: Vec<IpAddr> = vec!["192.168.0.10".parse().unwrap(), "192.168.0.20".parse().unwrap()];
        let plan = ShapingPlan::build("eth0", Rate::mbit(8), Rate::mbit(100), &addresses);
        let lines: Vec<String> = plan.commands().iter().map(|c| c.join(" ")).collect();

        assert_eq!(lines[0], "qdisc add dev eth0 root handle 1: htb default 30");
        assert_eq!(lines[1], "class add dev eth0 parent 1: classid 1:1 htb rate 100mbit");
        assert_eq!(lines[2], "class add dev eth0 parent 1:1 classid 1:30 htb rate 8mbit ceil 8mbit");
        assert!(lines.contains(&"filter add dev eth0 protocol ip parent 1: prio 1 u32 match ip dst 192.168.0.10/32 flowid 1:10".to_string()));
        assert!(lines.contains(&"filter add dev eth0 protocol ip parent 1: prio 1 u32 match ip dst 192.168.0.20/32 flowid 1:11".to_string()));
        assert_eq!(lines.len(), 4 + 3 * 2);
    }

    #[test]
    fn test_shaping_plan_caps_classes() {
        let addresses: Vec<IpAddr> = (1..=25u8)
            .map(|i| IpAddr::from([10, 0, 0, i]))
            .collect();
        let plan = ShapingPlan::build("eth0", Rate::mbit(8), Rate::mbit(100), &addresses);
        assert_eq!(plan.classes.len(), 20);
        assert_eq!(plan.skipped, 5);
        assert_eq!(plan.classes.last().unwrap().minor, 29);
    }

    #[tokio::test]
    async fn test_block_is_single_transaction() {
        let runner = Arc::new(ScriptedRunner::new(|line, _| {
            if line.starts_with("nft list chain") {
                return Err(failed("nft", "Error: No such file or directory"));
            }
            Ok(CommandOutput::default())
        }));
        let edge = adapter(runner.clone());

        let outcome = edge
            .apply(&block_request(json!(["203.0.113.9", "198.51.100.0/24"])), &DispatchContext::new())
            .await
            .unwrap();

        assert!(outcome.applied);
        assert_eq!(outcome.detail["added"], json!(2));
        assert_eq!(outcome.detail["rule_added"], json!(true));

        let calls = runner.calls();
        let transactions: Vec<_> = calls.iter().filter(|c| c.line == "nft -f -").collect();
        assert_eq!(transactions.len(), 1);
        let script = transactions[0].stdin.as_deref().unwrap();
        assert!(script.contains("add element inet tms_guard bad_ips { 198.51.100.0/24, 203.0.113.9 }"));
        assert!(script.contains("add rule inet tms_guard input ip saddr @bad_ips drop"));
    }

    #[tokio::test]
    async fn test_block_does_not_duplicate_rule() {
        let runner = Arc::new(ScriptedRunner::new(|line, _| {
            if line.starts_with("nft list chain") {
                return Ok(CommandOutput::stdout(
                    "table inet tms_guard {\n chain input {\n ip saddr @bad_ips drop\n }\n}",
                ));
            }
            Ok(CommandOutput::default())
        }));
        let edge = adapter(runner.clone());

        let outcome = edge
            .apply(&block_request(json!("203.0.113.9")), &DispatchContext::new())
            .await
            .unwrap();

        assert_eq!(outcome.detail["rule_added"], json!(false));
        let script = runner
            .calls()
            .into_iter()
            .find(|c| c.line == "nft -f -")
            .and_then(|c| c.stdin)
            .unwrap();
        assert!(!script.contains("add rule"));
    }

    #[tokio::test]
    async fn test_block_without_privilege_fails_target() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| {
            Err(failed("nft", "Error: Operation not permitted"))
        }));
        let edge = adapter(runner);
        let err = tokio_test::assert_err!(
            edge.apply(&block_request(json!(["203.0.113.9"])), &DispatchContext::new())
                .await
        );
        assert_eq!(err.kind(), FailureKind::Privilege);
    }

    #[tokio::test]
    async fn test_block_rejects_bad_set_name() {
        let edge = adapter(Arc::new(ScriptedRunner::permissive()));
        let request = MitigationRequest::new(
            Scope::Edge,
            "block_ipset",
            json!({ "set": "x; flush ruleset", "list": ["1.2.3.4"] }),
        );
        let err = edge.apply(&request, &DispatchContext::new()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Configuration);
    }

    #[tokio::test]
    async fn test_throttle_rebuilds_tree() {
        let runner = Arc::new(ScriptedRunner::new(|line, _| {
            if line.starts_with("tc qdisc del") {
                return Err(failed("tc", "Error: Cannot delete qdisc with handle of zero."));
            }
            Ok(CommandOutput::default())
        }));
        let edge = adapter(runner.clone());
        let request = MitigationRequest::new(
            Scope::Edge,
            "throttle_iface",
            json!({ "iface": "eth1", "rate": "8mbit", "addresses": ["192.168.0.10"] }),
        );

        let outcome = edge.apply(&request, &DispatchContext::new()).await.unwrap();
        assert_eq!(outcome.detail["priority_classes"], json!(1));

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].line, "tc qdisc del dev eth1 root");
        assert_eq!(calls[1].line, "tc -batch -");

        let script = calls[1].stdin.as_deref().unwrap();
        let batch: Vec<&str> = script.lines().collect();
        assert_eq!(batch.len(), 7);
        assert_eq!(batch[0], "qdisc add dev eth1 root handle 1: htb default 30");
        assert!(batch.contains(&"class add dev eth1 parent 1:1 classid 1:30 htb rate 8mbit ceil 8mbit"));
        assert!(batch.contains(&"filter add dev eth1 protocol ip parent 1: prio 1 u32 match ip dst 192.168.0.10/32 flowid 1:10"));
    }

    #[tokio::test]
    async fn test_failed_batch_fails_target_after_single_install() {
        let runner = Arc::new(ScriptedRunner::new(|line, _| {
            if line == "tc -batch -" {
                return Err(failed("tc", "Command failed -:3"));
            }
            Ok(CommandOutput::default())
        }));
        let edge = adapter(runner.clone());
        let request = MitigationRequest::new(
            Scope::Edge,
            "throttle",
            json!({ "iface": "eth1", "addresses": ["192.168.0.10", "192.168.0.11"] }),
        );

        let err = edge.apply(&request, &DispatchContext::new()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Command);
        assert_eq!(
            runner.lines().iter().filter(|l| l.starts_with("tc ") && *l != "tc qdisc del dev eth1 root").count(),
            1
        );
    }

    #[test]
    fn test_rate_mbit_saturates() {
        assert_eq!(Rate::mbit(u64::MAX).kbit, u64::MAX);
        assert_eq!(Rate::mbit(8).to_string(), "8mbit");
    }

    #[test]
    fn test_resource_keys() {
        let edge = adapter(Arc::new(ScriptedRunner::permissive()));
        assert_eq!(edge.resource_key(&block_request(json!([]))), "edge:set:bad_ips");
        let throttle = MitigationRequest::new(Scope::Edge, "throttle", json!({}));
        assert_eq!(edge.resource_key(&throttle), "edge:tc:eth0");
    }
}
