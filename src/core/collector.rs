//! Per-source traffic accounting for a monitored address range.
//!
//! Accounting lives in an nftables dynamic set with per-element counters.
//! A sample reads the counters before and after the window and reports the
//! per-address delta, ranked by bytes.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::exec::{argv, CommandError, CommandRunner};
use crate::models::{CollectorConfig, FailureKind, TopTalker};

/// Errors that can occur during traffic accounting
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("invalid monitored range '{0}'")]
    InvalidRange(String),
    #[error("packet filter command failed: {0}")]
    Command(#[from] CommandError),
    #[error("unreadable counter listing: {0}")]
    Parse(String),
}

impl CollectorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CollectorError::InvalidRange(_) => FailureKind::Configuration,
            CollectorError::Command(e) => e.kind(),
            CollectorError::Parse(_) => FailureKind::Command,
        }
    }
}

/// Address range under observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredRange {
    /// Canonical network (host bits cleared)
    pub cidr: IpNetwork,
    /// Sampling window
    pub window: Duration,
}

impl MonitoredRange {
    pub fn parse(cidr: &str, window: Duration) -> Result<Self, CollectorError> {
        let parsed = IpNetwork::from_str(cidr.trim())
            .map_err(|_| CollectorError::InvalidRange(cidr.to_string()))?;
        let cidr = IpNetwork::new(parsed.network(), parsed.prefix())
            .map_err(|_| CollectorError::InvalidRange(cidr.to_string()))?;
        Ok(Self { cidr, window })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.cidr.contains(addr)
    }
}

/// Raw counter pair for one address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    pub bytes: u64,
    pub packets: u64,
}

/// Per-address traffic within one window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficSample {
    pub address: IpAddr,
    pub bytes: u64,
    pub packets: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Outcome of `install`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
    /// False when the accounting rule was already present
    pub rule_added: bool,
}

/// Waits out the sampling window
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by `tokio::time`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sort descending by bytes, then packets, then ascending by address.
pub fn rank_samples(samples: &mut [TrafficSample]) {
    samples.sort_by(|a, b| {
        b.bytes
            .cmp(&a.bytes)
            .then_with(|| b.packets.cmp(&a.packets))
            .then_with(|| a.address.cmp(&b.address))
    });
}

/// First `n` entries of an already ranked list
pub fn top_talkers(samples: &[TrafficSample], n: usize) -> Vec<TopTalker> {
    samples
        .iter()
        .take(n)
        .map(|s| TopTalker {
            ip: s.address.to_string(),
            bytes: s.bytes,
        })
        .collect()
}

fn element_address(value: &Value) -> Option<IpAddr> {
    match value {
        Value::String(s) => IpAddr::from_str(s).ok(),
        Value::Object(obj) => {
            if let Some(prefix) = obj.get("prefix") {
                return prefix.get("addr").and_then(element_address);
            }
            obj.get("addr")
                .or_else(|| obj.get("val"))
                .and_then(element_address)
        }
        Value::Array(items) => items.first().and_then(element_address),
        _ => None,
    }
}

fn element_counter(value: &Value) -> Counter {
    let counter = value.get("counter");
    Counter {
        bytes: counter
            .and_then(|c| c.get("bytes"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
        packets: counter
            .and_then(|c| c.get("packets"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
}

/// Parse `nft --json list set|map` output into an address → counter mapping.
pub fn parse_counters(text: &str) -> Result<BTreeMap<IpAddr, Counter>, CollectorError> {
    let doc: Value =
        serde_json::from_str(text).map_err(|e| CollectorError::Parse(e.to_string()))?;
    let items = doc
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| CollectorError::Parse("missing nftables array".to_string()))?;

    let mut counters = BTreeMap::new();
    let container = items
        .iter()
        .find_map(|item| item.get("set").or_else(|| item.get("map")));
    let elements = container
        .and_then(|c| c.get("elem"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for element in &elements {
        // Either {"elem": {"val": .., "counter": ..}} or {"key": [..], "counter": ..}
        let inner = element.get("elem").unwrap_or(element);
        let address = inner
            .get("val")
            .or_else(|| inner.get("key"))
            .and_then(element_address);
        let Some(address) = address else {
            debug!("Skipping counter element without address: {}", element);
            continue;
        };
        let counter = element_counter(inner);
        let entry: &mut Counter = counters.entry(address).or_default();
        entry.bytes = entry.bytes.saturating_add(counter.bytes);
        entry.packets = entry.packets.saturating_add(counter.packets);
    }

    Ok(counters)
}

/// Kernel-level per-source traffic accounting
pub struct CounterCollector {
    runner: Arc<dyn CommandRunner>,
    sleeper: Arc<dyn Sleeper>,
    config: CollectorConfig,
}

impl CounterCollector {
    /// Create a new collector instance
    pub fn new(runner: Arc<dyn CommandRunner>, config: CollectorConfig) -> Self {
        Self {
            runner,
            sleeper: Arc::new(TokioSleeper),
            config,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn top_n(&self) -> usize {
        self.config.top_n
    }

    /// Accounting set, rule family and element type for `range`.
    ///
    /// Every range gets its own set so rotating one never resets another
    /// range's open window.
    pub fn set_for(&self, range: &MonitoredRange) -> (String, &'static str, &'static str) {
        let slug: String = range
            .cidr
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        if range.cidr.is_ipv4() {
            (format!("{}_{}", self.config.set, slug), "ip", "ipv4_addr")
        } else {
            (format!("{}_v6_{}", self.config.set, slug), "ip6", "ipv6_addr")
        }
    }

    fn rule_comment(range: &MonitoredRange) -> String {
        format!("tms-acct {}", range.cidr)
    }

    async fn nft(&self, args: &[&str]) -> Result<String, CommandError> {
        self.runner
            .run("nft", &argv(args), None)
            .await
            .map(|out| out.stdout)
    }

    async fn nft_tolerant(&self, args: &[&str]) -> Result<(), CommandError> {
        match self.nft(args).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Ensure the accounting table, set, chain and rule exist for `range`.
    ///
    /// Existing structures count as success; the rule is only added when the
    /// chain listing does not already carry it.
    pub async fn install(&self, range: &MonitoredRange) -> Result<InstallOutcome, CollectorError> {
        let table = self.config.table.as_str();
        let chain = self.config.chain.as_str();
        let (set, family, addr_type) = self.set_for(range);

        self.nft_tolerant(&["add", "table", "inet", table]).await?;
        let set_spec = format!("{{ type {addr_type}; size 65535; flags dynamic; counter; }}");
        self.nft_tolerant(&["add", "set", "inet", table, &set, &set_spec])
            .await?;
        self.nft_tolerant(&[
            "add",
            "chain",
            "inet",
            table,
            chain,
            "{ type filter hook prerouting priority -150; policy accept; }",
        ])
        .await?;

        let comment = Self::rule_comment(range);
        let listing = self.nft(&["list", "chain", "inet", table, chain]).await?;
        if listing.contains(&comment) {
            debug!("Accounting rule for {} already installed", range.cidr);
            return Ok(InstallOutcome { rule_added: false });
        }

        let cidr = range.cidr.to_string();
        let quoted = format!("\"{comment}\"");
        let update = format!("{{ {family} saddr counter }}");
        let target = format!("@{set}");
        self.nft(&[
            "add", "rule", "inet", table, chain, family, "saddr", &cidr, "add", &target, &update,
            "comment", &quoted,
        ])
        .await?;

        info!("Installed traffic accounting for {}", range.cidr);
        Ok(InstallOutcome { rule_added: true })
    }

    /// Current cumulative counters for `range`
    pub async fn read_counters(
        &self,
        range: &MonitoredRange,
    ) -> Result<BTreeMap<IpAddr, Counter>, CollectorError> {
        let (set, _, _) = self.set_for(range);
        let text = self
            .nft(&["--json", "list", "set", "inet", &self.config.table, &set])
            .await?;
        parse_counters(&text)
    }

    /// Flush the accounting set so counters restart from zero
    pub async fn rotate(&self, range: &MonitoredRange) -> Result<(), CollectorError> {
        let (set, _, _) = self.set_for(range);
        self.nft(&["flush", "set", "inet", &self.config.table, &set])
            .await?;
        debug!("Rotated accounting set {} for {}", set, range.cidr);
        Ok(())
    }

    /// Wait out the window and return ranked per-address deltas.
    pub async fn sample(&self, range: &MonitoredRange) -> Result<Vec<TrafficSample>, CollectorError> {
        let window_start = Utc::now();
        let before = self.read_counters(range).await?;
        self.sleeper.sleep(range.window).await;
        let after = self.read_counters(range).await?;
        let window_end = Utc::now();

        if self.config.rotate_after_sample {
            self.rotate(range).await?;
        }

        let mut samples: Vec<TrafficSample> = after
            .into_iter()
            .filter(|(addr, _)| range.contains(*addr))
            .filter_map(|(address, now)| {
                let base = before.get(&address).copied().unwrap_or_default();
                let bytes = now.bytes.saturating_sub(base.bytes);
                let packets = now.packets.saturating_sub(base.packets);
                if bytes == 0 && packets == 0 {
                    return None;
                }
                Some(TrafficSample {
                    address,
                    bytes,
                    packets,
                    window_start,
                    window_end,
                })
            })
            .collect();

        rank_samples(&mut samples);
        debug!("Sampled {} sources in {}", samples.len(), range.cidr);
        Ok(samples)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{set_listing, InstantSleeper};
    use super::*;
    use crate::core::exec::testing::ScriptedRunner;
    use crate::core::exec::CommandOutput;
    use std::net::Ipv4Addr;

    fn range() -> MonitoredRange {
        MonitoredRange::parse("192.168.0.0/24", Duration::from_secs(5)).unwrap()
    }

    fn sample(ip: [u8; 4], bytes: u64, packets: u64) -> TrafficSample {
        let now = Utc::now();
        TrafficSample {
            address: IpAddr::V4(Ipv4Addr::from(ip)),
            bytes,
            packets,
            window_start: now,
            window_end: now,
        }
    }

    #[test]
    fn test_invalid_range() {
        let err = MonitoredRange::parse("192.168.0.0/33", Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Configuration);
        assert!(MonitoredRange::parse("not-a-range", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_range_is_canonicalized() {
        let range = MonitoredRange::parse("10.1.2.3/16", Duration::from_secs(1)).unwrap();
        assert_eq!(range.cidr.to_string(), "10.1.0.0/16");
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let a = sample([10, 0, 0, 1], 500, 5);
        let b = sample([10, 0, 0, 2], 500, 5);
        let c = sample([10, 0, 0, 3], 100, 1);

        let mut first = vec![c.clone(), b.clone(), a.clone()];
        let mut second = vec![b.clone(), a.clone(), c.clone()];
        rank_samples(&mut first);
        rank_samples(&mut second);

        assert_eq!(first, second);
        assert_eq!(first[0].address, a.address);
        assert_eq!(first[1].address, b.address);
        assert_eq!(first[2].address, c.address);
    }

    #[test]
    fn test_ranking_prefers_packets_on_byte_tie() {
        let mut samples = vec![sample([10, 0, 0, 1], 500, 2), sample([10, 0, 0, 9], 500, 7)];
        rank_samples(&mut samples);
        assert_eq!(samples[0].address.to_string(), "10.0.0.9");
    }

    #[test]
    fn test_parse_counters_shapes() {
        let text = r#"{"nftables":[{"metainfo":{}},{"map":{"name":"ip2cnt","elem":[
            {"key":[{"prefix":{"addr":"192.168.0.1","len":32}}],"counter":{"packets":3,"bytes":300}},
            {"elem":{"val":"192.168.0.2","counter":{"packets":1,"bytes":40}}},
            {"elem":{"val":"garbage"}}
        ]}}]}"#;
        let counters = parse_counters(text).unwrap();
        assert_eq!(counters.len(), 2);
        let first: IpAddr = "192.168.0.1".parse().unwrap();
        assert_eq!(counters[&first], Counter { bytes: 300, packets: 3 });
    }

    #[test]
    fn test_parse_counters_rejects_garbage() {
        assert!(parse_counters("not json").is_err());
        assert!(parse_counters("{}").is_err());
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let runner = Arc::new(ScriptedRunner::new(|line, history| {
            if line.starts_with("nft list chain") {
                let installed = history.iter().any(|c| c.line.starts_with("nft add rule"));
                if installed {
                    return Ok(CommandOutput::stdout(
                        "chain account { ip saddr 192.168.0.0/24 add @src_acct { ip saddr counter } comment \"tms-acct 192.168.0.0/24\" }",
                    ));
                }
                return Ok(CommandOutput::stdout("chain account { }"));
            }
            Ok(CommandOutput::default())
        }));
        let collector = CounterCollector::new(runner.clone(), CollectorConfig::default());

        let first = collector.install(&range()).await.unwrap();
        let second = collector.install(&range()).await.unwrap();

        assert!(first.rule_added);
        assert!(!second.rule_added);
        let rules = runner
            .lines()
            .into_iter()
            .filter(|l| l.starts_with("nft add rule"))
            .count();
        assert_eq!(rules, 1);
    }

    #[tokio::test]
    async fn test_install_tolerates_existing_objects() {
        let runner = Arc::new(ScriptedRunner::new(|line, _| {
            if line.starts_with("nft add table") {
                return Err(crate::core::exec::testing::failed("nft", "Error: Could not process rule: File exists"));
            }
            Ok(CommandOutput::default())
        }));
        let collector = CounterCollector::new(runner, CollectorConfig::default());
        assert!(collector.install(&range()).await.is_ok());
    }

    #[tokio::test]
    async fn test_install_without_privilege() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| {
            Err(crate::core::exec::testing::failed("nft", "Error: Operation not permitted"))
        }));
        let collector = CounterCollector::new(runner, CollectorConfig::default());
        let err = collector.install(&range()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Privilege);
    }

    #[tokio::test]
    async fn test_sample_reports_window_delta() {
        let runner = Arc::new(ScriptedRunner::new(|line, history| {
            if line.starts_with("nft --json list set") {
                let reads = history
                    .iter()
                    .filter(|c| c.line.starts_with("nft --json list set"))
                    .count();
                let listing = if reads == 0 {
                    set_listing(&[("192.168.0.10", 1000, 10), ("192.168.0.20", 50, 1)])
                } else {
                    set_listing(&[
                        ("192.168.0.10", 1200, 12),
                        ("192.168.0.20", 50, 1),
                        ("192.168.0.30", 80, 2),
                        ("10.9.9.9", 5000, 50),
                    ])
                };
                return Ok(CommandOutput::stdout(&listing));
            }
            Ok(CommandOutput::default())
        }));
        let collector = CounterCollector::new(runner, CollectorConfig::default())
            .with_sleeper(Arc::new(InstantSleeper));

        let samples = collector.sample(&range()).await.unwrap();
        let talkers = top_talkers(&samples, 10);

        assert_eq!(
            talkers,
            vec![
                TopTalker { ip: "192.168.0.10".to_string(), bytes: 200 },
                TopTalker { ip: "192.168.0.30".to_string(), bytes: 80 },
            ]
        );
        assert!(samples.iter().all(|s| s.window_start <= s.window_end));
    }

    #[tokio::test]
    async fn test_sample_rotates_when_configured() {
        let runner = Arc::new(ScriptedRunner::new(|line, _| {
            if line.starts_with("nft --json list set") {
                return Ok(CommandOutput::stdout(&set_listing(&[])));
            }
            Ok(CommandOutput::default())
        }));
        let config = CollectorConfig {
            rotate_after_sample: true,
            ..CollectorConfig::default()
        };
        let collector = CounterCollector::new(runner.clone(), config)
            .with_sleeper(Arc::new(InstantSleeper));

        collector.sample(&range()).await.unwrap();
        assert!(runner
            .lines()
            .contains(&"nft flush set inet tms_mon src_acct_192_168_0_0_24".to_string()));
    }

    #[test]
    fn test_set_for_each_family() {
        let collector = CounterCollector::new(Arc::new(ScriptedRunner::permissive()), CollectorConfig::default());
        let v6 = MonitoredRange::parse("2001:db8::/32", Duration::from_secs(1)).unwrap();

        assert_eq!(
            collector.set_for(&range()),
            ("src_acct_192_168_0_0_24".to_string(), "ip", "ipv4_addr")
        );
        assert_eq!(
            collector.set_for(&v6),
            ("src_acct_v6_2001_db8___32".to_string(), "ip6", "ipv6_addr")
        );
    }

    #[tokio::test]
    async fn test_install_and_sample_ipv6_range() {
        let runner = Arc::new(ScriptedRunner::new(|line, history| {
            if line.starts_with("nft --json list set") {
                let reads = history
                    .iter()
                    .filter(|c| c.line.starts_with("nft --json list set"))
                    .count();
                let listing = if reads == 0 {
                    set_listing(&[("2001:db8::10", 100, 1)])
                } else {
                    set_listing(&[("2001:db8::10", 400, 4), ("2001:db9::1", 900, 9)])
                };
                return Ok(CommandOutput::stdout(&listing));
            }
            Ok(CommandOutput::default())
        }));
        let collector = CounterCollector::new(runner.clone(), CollectorConfig::default())
            .with_sleeper(Arc::new(InstantSleeper));
        let range = MonitoredRange::parse("2001:db8::/32", Duration::from_secs(1)).unwrap();

        assert!(collector.install(&range).await.unwrap().rule_added);
        let samples = collector.sample(&range).await.unwrap();

        let lines = runner.lines();
        assert!(lines.iter().any(|l| l.starts_with("nft add set inet tms_mon src_acct_v6_2001_db8___32 { type ipv6_addr;")));
        assert!(lines.iter().any(|l| l.starts_with(
            "nft add rule inet tms_mon account ip6 saddr 2001:db8::/32 add @src_acct_v6_2001_db8___32 { ip6 saddr counter }"
        )));
        assert!(lines.contains(&"nft --json list set inet tms_mon src_acct_v6_2001_db8___32".to_string()));
        assert_eq!(
            top_talkers(&samples, 10),
            vec![TopTalker { ip: "2001:db8::10".to_string(), bytes: 300 }]
        );
    }

    /// Yields once so concurrent samples interleave their reads
    struct YieldingSleeper;

    #[async_trait]
    impl Sleeper for YieldingSleeper {
        async fn sleep(&self, _duration: Duration) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_rotation_does_not_reset_other_ranges() {
        // A set reads empty once flushed, otherwise 100 bytes then 300
        let runner = Arc::new(ScriptedRunner::new(|line, history| {
            if let Some(set) = line.strip_prefix("nft --json list set inet tms_mon ") {
                let flush = format!("nft flush set inet tms_mon {set}");
                if history.iter().any(|c| c.line == flush) {
                    return Ok(CommandOutput::stdout(&set_listing(&[])));
                }
                let reads = history.iter().filter(|c| c.line == line).count();
                let bytes = if reads == 0 { 100 } else { 300 };
                return Ok(CommandOutput::stdout(&set_listing(&[
                    ("10.0.0.5", bytes, 1),
                    ("10.1.0.5", bytes, 1),
                ])));
            }
            Ok(CommandOutput::default())
        }));
        let config = CollectorConfig {
            rotate_after_sample: true,
            ..CollectorConfig::default()
        };
        let collector = CounterCollector::new(runner.clone(), config)
            .with_sleeper(Arc::new(YieldingSleeper));
        let a = MonitoredRange::parse("10.0.0.0/16", Duration::from_secs(1)).unwrap();
        let b = MonitoredRange::parse("10.1.0.0/16", Duration::from_secs(1)).unwrap();

        let (first, second) = tokio::join!(collector.sample(&a), collector.sample(&b));

        assert_eq!(
            top_talkers(&first.unwrap(), 10),
            vec![TopTalker { ip: "10.0.0.5".to_string(), bytes: 200 }]
        );
        assert_eq!(
            top_talkers(&second.unwrap(), 10),
            vec![TopTalker { ip: "10.1.0.5".to_string(), bytes: 200 }]
        );
        let flushes: Vec<String> = runner
            .lines()
            .into_iter()
            .filter(|l| l.starts_with("nft flush set"))
            .collect();
        assert_eq!(flushes.len(), 2);
        assert_ne!(flushes[0], flushes[1]);
    }
}
