//! API endpoints for the threat mitigation service.
//!
//! Exposes health, on-demand cycles, direct mitigation dispatch and the
//! Prometheus scrape endpoint.

use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::core::cycle::{CycleError, CycleRunner};
use crate::core::dispatcher::DispatchContext;
use crate::models::{CycleRequest, FailureKind, MitigationRequest};

pub struct ApiState {
    pub cycles: Arc<CycleRunner>,
    pub metrics: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/cycle").route(web::post().to(run_cycle)))
            .service(web::resource("/mitigate").route(web::post().to(mitigate))),
    )
    .service(web::resource("/metrics").route(web::get().to(render_metrics)));
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    nft: bool,
    tc: bool,
    default_interface: Option<String>,
}

/// Error body returned for rejected or failed cycles
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: FailureKind,
}

/// One request or a batch
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MitigateBody {
    Batch { requests: Vec<MitigationRequest> },
    Single(MitigationRequest),
}

impl MitigateBody {
    fn into_requests(self) -> Vec<MitigationRequest> {
        match self {
            MitigateBody::Batch { requests } => requests,
            MitigateBody::Single(request) => vec![request],
        }
    }
}

/// Health check endpoint
async fn health_check(state: web::Data<ApiState>) -> impl Responder {
    let plan = state.cycles.plan();
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        nft: plan.nft,
        tc: plan.tc,
        default_interface: plan.default_interface.clone(),
    })
}

fn cycle_error_response(err: &CycleError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
        kind: err.kind(),
    };
    match err {
        CycleError::InvalidRange(_) | CycleError::Configuration(_) => {
            HttpResponse::BadRequest().json(body)
        }
        CycleError::DeadlineExceeded(_) => HttpResponse::GatewayTimeout().json(body),
        CycleError::Collector(_) => HttpResponse::InternalServerError().json(body),
    }
}

/// Run one cycle and return its report
pub async fn run_cycle(state: web::Data<ApiState>, req: web::Json<CycleRequest>) -> impl Responder {
    match state.cycles.run_cycle(req.into_inner()).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => cycle_error_response(&e),
    }
}

/// Dispatch mitigation requests directly
pub async fn mitigate(state: web::Data<ApiState>, body: web::Json<MitigateBody>) -> impl Responder {
    let requests = body.into_inner().into_requests();
    let report = state
        .cycles
        .dispatcher()
        .dispatch(&requests, &DispatchContext::new())
        .await;
    HttpResponse::Ok().json(report)
}

/// Prometheus scrape endpoint
async fn render_metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cycle::testing::{components, host_with_counters};
    use crate::core::exec::testing::ScriptedRunner;
    use crate::models::{Config, DispatchReport, Scope};
    use actix_web::{test, App};
    use serde_json::json;

    const COUNTERS: &[(&str, u64, u64)] = &[("192.168.0.10", 200, 4), ("192.168.0.20", 50, 1)];

    fn state_with(runner: Arc<ScriptedRunner>) -> web::Data<ApiState> {
        let config = Config::default();
        let cycles = CycleRunner::new(components(runner, &config), config);
        web::Data::new(ApiState {
            cycles: Arc::new(cycles),
            metrics: None,
        })
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(
            App::new()
                .app_data(state_with(Arc::new(ScriptedRunner::permissive())))
                .configure(config),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_cycle_endpoint() {
        let app = test::init_service(
            App::new()
                .app_data(state_with(Arc::new(host_with_counters(COUNTERS))))
                .configure(config),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/cycle")
            .set_json(json!({ "cidr": "192.168.0.0/24", "sample_seconds": 1, "dry_run": true }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["top10"][0], json!({ "ip": "192.168.0.10", "bytes": 200 }));
        assert_eq!(body["sampled_seconds"], json!(1));
        assert_eq!(body["shaping_applied"], json!(false));
    }

    #[actix_web::test]
    async fn test_cycle_rejects_invalid_range() {
        let app = test::init_service(
            App::new()
                .app_data(state_with(Arc::new(ScriptedRunner::permissive())))
                .configure(config),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/cycle")
            .set_json(json!({ "cidr": "300.1.2.0/24" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.kind, FailureKind::Configuration);
    }

    #[actix_web::test]
    async fn test_mitigate_reports_per_target() {
        let app = test::init_service(
            App::new()
                .app_data(state_with(Arc::new(ScriptedRunner::permissive())))
                .configure(config),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/mitigate")
            .set_json(json!({
                "requests": [
                    { "scope": "upstream", "action": "rtbh", "params": { "prefix": "203.0.113.9/32" } },
                    { "scope": "cloudflare", "action": "cf_asn_block", "params": { "asn": [4134] } }
                ]
            }))
            .to_request();
        let report: DispatchReport = test::call_and_read_body_json(&app, req).await;

        assert!(report.success);
        assert_eq!(report.targets.len(), 2);
        assert_eq!(report.targets[0].scope, Scope::Upstream);
        assert!(report.targets[0].ok);
        assert!(!report.targets[0].applied);
        assert_eq!(report.targets[1].scope, Scope::Cdn);
        assert_eq!(report.targets[1].error_kind, Some(FailureKind::Unavailable));
    }

    #[actix_web::test]
    async fn test_single_mitigation_request() {
        let app = test::init_service(
            App::new()
                .app_data(state_with(Arc::new(ScriptedRunner::permissive())))
                .configure(config),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/mitigate")
            .set_json(json!({ "scope": "edge", "action": "block_ipset", "params": { "list": "203.0.113.9" } }))
            .to_request();
        let report: DispatchReport = test::call_and_read_body_json(&app, req).await;

        assert_eq!(report.applied, 1);
        assert_eq!(report.targets[0].action, "block_ipset");
    }

    #[actix_web::test]
    async fn test_metrics_without_recorder() {
        let app = test::init_service(
            App::new()
                .app_data(state_with(Arc::new(ScriptedRunner::permissive())))
                .configure(config),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }
}
