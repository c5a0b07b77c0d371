//! Mitigation dispatch.
//!
//! Routes each mitigation request to the adapter registered for its scope,
//! serializes requests touching the same backend resource and collects a
//! per-target outcome. A failing target never fails the dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use log::{error, info};
use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::exec::CommandError;
use crate::models::{DispatchReport, FailureKind, MitigationRequest, Scope, TargetOutcome};

/// Errors an adapter may report for one target
#[derive(Debug, Error)]
pub enum MitigationError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("insufficient privileges: {0}")]
    Privilege(String),
    #[error("provider error: {0}")]
    TransientProvider(String),
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("unsupported action '{action}' for scope {scope}")]
    UnsupportedAction { scope: Scope, action: String },
}

impl MitigationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MitigationError::Configuration(_) | MitigationError::UnsupportedAction { .. } => {
                FailureKind::Configuration
            }
            MitigationError::Privilege(_) => FailureKind::Privilege,
            MitigationError::TransientProvider(_) | MitigationError::RateLimited(_) => {
                FailureKind::TransientProvider
            }
            MitigationError::Unavailable(_) => FailureKind::Unavailable,
            MitigationError::Command(_) => FailureKind::Command,
        }
    }
}

impl From<CommandError> for MitigationError {
    fn from(err: CommandError) -> Self {
        match err.kind() {
            FailureKind::Privilege => MitigationError::Privilege(err.to_string()),
            FailureKind::Unavailable => MitigationError::Unavailable(err.to_string()),
            _ => MitigationError::Command(err.to_string()),
        }
    }
}

/// What an adapter reports back for a target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterOutcome {
    pub applied: bool,
    pub detail: Value,
}

/// Context shared by every target of one dispatch
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub cycle_id: Uuid,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
        }
    }
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniform adapter contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MitigationBackend: Send + Sync {
    /// Scope served by this adapter
    fn scope(&self) -> Scope;

    /// Key of the backend resource `request` writes to
    fn resource_key(&self, request: &MitigationRequest) -> String;

    /// Apply one request as a single backend operation
    async fn apply(
        &self,
        request: &MitigationRequest,
        ctx: &DispatchContext,
    ) -> Result<AdapterOutcome, MitigationError>;
}

/// Per-resource write locks
#[derive(Default)]
pub struct ResourceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResourceLocks {
    pub async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Routes requests to scope adapters
pub struct MitigationDispatcher {
    backends: HashMap<Scope, Arc<dyn MitigationBackend>>,
    locks: ResourceLocks,
}

impl MitigationDispatcher {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            locks: ResourceLocks::default(),
        }
    }

    /// Register an adapter, replacing any previous one for its scope
    pub fn register(mut self, backend: Arc<dyn MitigationBackend>) -> Self {
        self.backends.insert(backend.scope(), backend);
        self
    }

    /// Apply one request and record its outcome
    pub async fn apply_one(
        &self,
        request: &MitigationRequest,
        ctx: &DispatchContext,
    ) -> TargetOutcome {
        let result = match self.backends.get(&request.scope) {
            Some(backend) => {
                let lock = self.locks.lock_for(&backend.resource_key(request)).await;
                let _guard = lock.lock().await;
                backend.apply(request, ctx).await
            }
            None => Err(MitigationError::Unavailable(format!(
                "no backend registered for scope {}",
                request.scope
            ))),
        };

        let applied_at = Utc::now();
        match result {
            Ok(outcome) => {
                info!(
                    "[{}] {} {} applied={}",
                    ctx.cycle_id, request.scope, request.action, outcome.applied
                );
                increment_counter!(
                    "mitigation_targets_total",
                    "scope" => request.scope.as_str(),
                    "result" => "ok"
                );
                TargetOutcome {
                    scope: request.scope,
                    action: request.action.clone(),
                    ok: true,
                    applied: outcome.applied,
                    applied_at,
                    detail: Some(outcome.detail),
                    error: None,
                    error_kind: None,
                }
            }
            Err(e) => {
                error!(
                    "[{}] {} {} failed: {}",
                    ctx.cycle_id, request.scope, request.action, e
                );
                increment_counter!(
                    "mitigation_targets_total",
                    "scope" => request.scope.as_str(),
                    "result" => e.kind().as_str()
                );
                TargetOutcome {
                    scope: request.scope,
                    action: request.action.clone(),
                    ok: false,
                    applied: false,
                    applied_at,
                    detail: None,
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind()),
                }
            }
        }
    }

    /// Apply every request; targets come back in request order.
    pub async fn dispatch(
        &self,
        requests: &[MitigationRequest],
        ctx: &DispatchContext,
    ) -> DispatchReport {
        let targets = join_all(requests.iter().map(|r| self.apply_one(r, ctx))).await;
        let applied = targets.iter().filter(|t| t.ok && t.applied).count();
        let failed = targets.iter().filter(|t| !t.ok).count();
        DispatchReport {
            success: true,
            applied,
            failed,
            targets,
        }
    }
}

impl Default for MitigationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
