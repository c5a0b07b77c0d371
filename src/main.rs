//! Threat Mitigation Service
//!
//! This is the main entry point for the threat mitigation service.
//! It resolves host capabilities, wires the cycle components, starts the
//! periodic cycle loop and serves the control API.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;

use threat_mitigation_service::api::{self, ApiState};
use threat_mitigation_service::config;
use threat_mitigation_service::core::exec::SystemRunner;
use threat_mitigation_service::core::{detect_capabilities, CycleComponents, CycleRunner};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Threat Mitigation Service...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Metrics recorder not installed: {}", e);
            None
        }
    };

    // Resolve the tools this host offers once, up front
    let runner = Arc::new(SystemRunner);
    let plan = detect_capabilities(runner.as_ref()).await;

    let components = CycleComponents::from_config(&config, runner, plan)
        .context("Failed to initialize cycle components")?;
    let cycles = Arc::new(CycleRunner::new(components, config.clone()));

    actix_rt::spawn(cycles.clone().run_periodic());

    let state = web::Data::new(ApiState { cycles, metrics });

    info!(
        "Listening on {}:{}",
        config.server.host, config.server.port
    );
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))?
        .run()
        .await?;

    Ok(())
}
