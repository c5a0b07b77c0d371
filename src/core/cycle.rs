//! Collection, enrichment and mitigation cycle.
//!
//! Every run carries its own `CycleContext`; cycles for different ranges
//! share only the read-only components and may run in parallel. The whole
//! pipeline runs under one deadline, and dropping it before dispatch
//! discards partial results.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{error, info, warn};
use metrics::increment_counter;
use thiserror::Error;
use tokio::time::{interval, timeout};
use uuid::Uuid;

use crate::core::auditor::ConnectionAuditor;
use crate::core::capability::ExecutionPlan;
use crate::core::cloudflare::CdnAdapter;
use crate::core::collector::{top_talkers, CollectorError, CounterCollector, MonitoredRange};
use crate::core::dispatcher::{DispatchContext, MitigationDispatcher};
use crate::core::edge::{default_limit_mbit, EdgeAdapter};
use crate::core::enrichment::{EnrichmentService, GeoProvider, HickoryResolver, IpApiProvider};
use crate::core::exec::CommandRunner;
use crate::core::notifier::{Alert, AlertNotifier};
use crate::core::policy::{plan_actions, PlanContext, PolicyEngine, ShapingTarget};
use crate::core::upstream::UpstreamAdapter;
use crate::models::{Config, CycleReport, CycleRequest, FailureKind};
use crate::utils::report_file_name;

/// Errors that end a cycle
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("invalid monitored range: {0}")]
    InvalidRange(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("traffic collection failed: {0}")]
    Collector(#[from] CollectorError),
    #[error("cycle exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
}

impl CycleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CycleError::InvalidRange(_) | CycleError::Configuration(_) => FailureKind::Configuration,
            CycleError::Collector(e) => e.kind(),
            CycleError::DeadlineExceeded(_) => FailureKind::Unavailable,
        }
    }
}

/// Identity and settings of one run
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub id: Uuid,
    pub range: MonitoredRange,
    pub interface: Option<String>,
    pub started_at: DateTime<Utc>,
    pub apply_shaping: bool,
    pub limit_mb_per_s: f64,
    pub share_threshold: Option<f64>,
    pub dry_run: bool,
}

/// Components a cycle runs through
pub struct CycleComponents {
    pub plan: ExecutionPlan,
    pub collector: CounterCollector,
    pub auditor: ConnectionAuditor,
    pub enrichment: EnrichmentService,
    pub policy: PolicyEngine,
    pub dispatcher: MitigationDispatcher,
    pub notifier: Option<AlertNotifier>,
}

impl CycleComponents {
    /// Wire every component from configuration and a resolved plan
    pub fn from_config(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        plan: ExecutionPlan,
    ) -> Result<Self, CycleError> {
        let collector = CounterCollector::new(runner.clone(), config.collector.clone());
        let auditor =
            ConnectionAuditor::new(runner.clone(), plan.socket_tool, config.audit.max_addresses);

        let resolver = HickoryResolver::from_system_conf()
            .map_err(|e| CycleError::Configuration(e.to_string()))?;
        let geo: Option<Arc<dyn GeoProvider>> = if config.enrichment.geo_enabled {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_millis(config.enrichment.lookup_timeout_ms.max(1)))
                .build()
                .map_err(|e| CycleError::Configuration(e.to_string()))?;
            Some(Arc::new(IpApiProvider::new(client, &config.enrichment.geo_endpoint)))
        } else {
            None
        };
        let enrichment = EnrichmentService::new(Arc::new(resolver), geo, &config.enrichment);

        let policy = match &config.policy.rules {
            Some(rules) => PolicyEngine::new(rules.clone()),
            None => PolicyEngine::with_defaults(config.policy.share_threshold),
        };

        let dispatcher = MitigationDispatcher::new()
            .register(Arc::new(EdgeAdapter::new(
                runner,
                plan.clone(),
                config.edge.clone(),
                config.shaping.clone(),
            )))
            .register(Arc::new(CdnAdapter::new(config.cdn.clone(), reqwest::Client::new())))
            .register(Arc::new(UpstreamAdapter::new()));

        let notifier = if config.alerts.channels.is_empty() {
            None
        } else {
            Some(
                AlertNotifier::new(&config.alerts)
                    .map_err(|e| CycleError::Configuration(e.to_string()))?,
            )
        };

        Ok(Self {
            plan,
            collector,
            auditor,
            enrichment,
            policy,
            dispatcher,
            notifier,
        })
    }
}

/// Runs cycles over the configured components
pub struct CycleRunner {
    components: CycleComponents,
    config: Config,
}

impl CycleRunner {
    pub fn new(components: CycleComponents, config: Config) -> Self {
        Self { components, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &MitigationDispatcher {
        &self.components.dispatcher
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.components.plan
    }

    fn deadline(&self) -> Duration {
        Duration::from_secs(self.config.cycle.deadline_seconds.max(1))
    }

    /// Validate `request` before anything touches the host
    pub fn context(&self, request: &CycleRequest) -> Result<CycleContext, CycleError> {
        let seconds = request
            .sample_seconds
            .unwrap_or(self.config.cycle.window_seconds);
        if seconds == 0 {
            return Err(CycleError::Configuration(
                "sampling window must be at least one second".to_string(),
            ));
        }
        let window = Duration::from_secs(seconds);
        if window > self.deadline() {
            return Err(CycleError::Configuration(format!(
                "sampling window of {}s exceeds the {}s cycle deadline",
                seconds,
                self.deadline().as_secs()
            )));
        }

        let range = MonitoredRange::parse(&request.cidr, window)
            .map_err(|_| CycleError::InvalidRange(request.cidr.clone()))?;

        let limit_mb_per_s = request
            .limit_mb_per_s
            .unwrap_or(self.config.shaping.limit_mb_per_s);
        if !limit_mb_per_s.is_finite() || limit_mb_per_s <= 0.0 {
            return Err(CycleError::Configuration(format!(
                "invalid bandwidth ceiling {limit_mb_per_s}"
            )));
        }
        if let Some(threshold) = request.share_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(CycleError::Configuration(format!(
                    "traffic share threshold {threshold} outside (0, 1]"
                )));
            }
        }

        let interface = request
            .interface
            .clone()
            .or_else(|| self.config.shaping.interface.clone())
            .or_else(|| self.components.plan.default_interface.clone());
        let apply_shaping = request.apply_shaping.unwrap_or(self.config.shaping.enabled);
        if apply_shaping && interface.is_none() {
            return Err(CycleError::Configuration(
                "shaping requested but no interface is known".to_string(),
            ));
        }

        Ok(CycleContext {
            id: Uuid::new_v4(),
            range,
            interface,
            started_at: Utc::now(),
            apply_shaping,
            limit_mb_per_s,
            share_threshold: request.share_threshold,
            dry_run: request.dry_run.unwrap_or(self.config.cycle.dry_run),
        })
    }

    /// Run one full cycle for `request`
    pub async fn run_cycle(&self, request: CycleRequest) -> Result<CycleReport, CycleError> {
        let ctx = self.context(&request)?;
        let deadline = self.deadline();
        info!("[{}] Cycle started for {}", ctx.id, ctx.range.cidr);

        let result = match timeout(deadline, self.execute(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(CycleError::DeadlineExceeded(deadline)),
        };

        match &result {
            Ok(report) => {
                increment_counter!("cycles_total", "result" => "ok");
                info!(
                    "[{}] Cycle finished: {} talkers, {} candidates",
                    ctx.id,
                    report.top10.len(),
                    report.candidates.len()
                );
            }
            Err(e) => {
                increment_counter!("cycles_total", "result" => e.kind().as_str());
                error!("[{}] Cycle failed: {}", ctx.id, e);
            }
        }
        result
    }

    async fn execute(&self, ctx: &CycleContext) -> Result<CycleReport, CycleError> {
        let c = &self.components;
        let cidr = ctx.range.cidr.to_string();

        c.collector.install(&ctx.range).await?;
        let (samples, remotes) = tokio::join!(c.collector.sample(&ctx.range), c.auditor.snapshot());
        let samples = samples?;
        let remotes = remotes.unwrap_or_else(|e| {
            warn!("[{}] Connection audit skipped: {}", ctx.id, e);
            Vec::new()
        });

        let top10 = top_talkers(&samples, c.collector.top_n());
        let top_addresses: Vec<IpAddr> = samples
            .iter()
            .take(c.collector.top_n())
            .map(|s| s.address)
            .collect();

        let mut lookup: Vec<IpAddr> = top_addresses.clone();
        lookup.extend(remotes.iter().copied());
        let enrichments = c.enrichment.enrich(&lookup).await;

        let candidates = match ctx.share_threshold {
            Some(threshold) => c.policy.with_share_threshold(threshold),
            None => c.policy.clone(),
        }
        .classify(&samples, &enrichments);

        let limit_mbit = default_limit_mbit(ctx.limit_mb_per_s);
        let shaping = match (&ctx.interface, ctx.apply_shaping) {
            (Some(interface), true) => Some(ShapingTarget {
                interface: interface.clone(),
                default_limit_mbit: limit_mbit,
                priority_rate_mbit: self.config.shaping.priority_rate_mbit,
                priority_addresses: top_addresses,
            }),
            _ => None,
        };
        let planned = plan_actions(
            &candidates,
            &PlanContext {
                block_set: self.config.edge.block_set.clone(),
                shaping,
                cdn_enabled: self.config.cdn.enabled,
            },
        );

        let dispatch = if ctx.dry_run || planned.is_empty() {
            None
        } else {
            let dispatch_ctx = DispatchContext { cycle_id: ctx.id };
            Some(c.dispatcher.dispatch(&planned, &dispatch_ctx).await)
        };

        let notifications = match (&c.notifier, &dispatch) {
            (Some(notifier), Some(report)) => {
                notifier
                    .notify_all(&Alert::from_dispatch(ctx.id, &cidr, report))
                    .await
            }
            _ => Vec::new(),
        };

        let shaping_applied = dispatch.as_ref().map_or(false, |d| {
            d.targets
                .iter()
                .any(|t| t.action == "throttle" && t.ok && t.applied)
        });

        let mut report = CycleReport {
            cycle_id: ctx.id,
            interface: ctx.interface.clone(),
            cidr: cidr.clone(),
            sampled_seconds: ctx.range.window.as_secs(),
            top10,
            shaping_applied,
            default_limit_mbit: limit_mbit,
            report_path: None,
            connections_audited: remotes.len(),
            candidates,
            planned,
            dispatch,
            notifications,
        };

        if let Some(dir) = &self.config.cycle.report_dir {
            match write_report(Path::new(dir), &mut report).await {
                Ok(path) => info!("[{}] Report written to {}", ctx.id, path),
                Err(e) => warn!("[{}] Report not written: {}", ctx.id, e),
            }
        }

        Ok(report)
    }

    /// Run independent cycles in parallel, one result per request
    pub async fn run_many(&self, requests: Vec<CycleRequest>) -> Vec<Result<CycleReport, CycleError>> {
        join_all(requests.into_iter().map(|r| self.run_cycle(r))).await
    }

    /// Re-run the configured ranges every `cycle.interval_seconds`
    pub async fn run_periodic(self: Arc<Self>) {
        let period = self.config.cycle.interval_seconds;
        if period == 0 || self.config.cycle.ranges.is_empty() {
            info!("Periodic cycles disabled");
            return;
        }

        let mut ticker = interval(Duration::from_secs(period));
        loop {
            ticker.tick().await;
            let requests = self
                .config
                .cycle
                .ranges
                .iter()
                .map(|cidr| CycleRequest::for_range(cidr))
                .collect();
            let results = self.run_many(requests).await;
            let failed = results.iter().filter(|r| r.is_err()).count();
            info!(
                "Periodic run finished: {} ranges, {} failed",
                results.len(),
                failed
            );
        }
    }
}

/// Serialize `report` into `dir`, recording the path in the report itself
async fn write_report(dir: &Path, report: &mut CycleReport) -> std::io::Result<String> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(report_file_name(&report.cidr));
    let path_text = path.to_string_lossy().into_owned();
    report.report_path = Some(path_text.clone());

    let body = serde_json::to_vec_pretty(report).map_err(std::io::Error::from)?;
    if let Err(e) = tokio::fs::write(&path, body).await {
        report.report_path = None;
        return Err(e);
    }
    Ok(path_text)
}
