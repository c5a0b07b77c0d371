//! Upstream route-based mitigation (RTBH / Flowspec).
//!
//! No provider integration exists yet. Requests are acknowledged with a
//! structured envelope and never reported as applied.

use async_trait::async_trait;
use log::warn;
use serde_json::{json, Value};

use crate::core::dispatcher::{AdapterOutcome, DispatchContext, MitigationBackend, MitigationError};
use crate::models::{MitigationRequest, Scope};

/// Acknowledging upstream backend
#[derive(Debug, Default, Clone)]
pub struct UpstreamAdapter;

impl UpstreamAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MitigationBackend for UpstreamAdapter {
    fn scope(&self) -> Scope {
        Scope::Upstream
    }

    fn resource_key(&self, request: &MitigationRequest) -> String {
        format!("upstream:{}", request.action)
    }

    async fn apply(
        &self,
        request: &MitigationRequest,
        ctx: &DispatchContext,
    ) -> Result<AdapterOutcome, MitigationError> {
        warn!(
            "[{}] upstream {} acknowledged but not applied: no provider integration",
            ctx.cycle_id, request.action
        );
        Ok(AdapterOutcome {
            applied: false,
            detail: json!({
                "upstream": "acknowledged",
                "action": request.action,
                "params": Value::Object(request.params.clone()),
                "cycle_id": ctx.cycle_id.to_string(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::{assert_ok, block_on};

    #[test]
    fn test_acknowledges_without_applying() {
        let adapter = UpstreamAdapter::new();
        let request = MitigationRequest::new(
            Scope::Upstream,
            "rtbh",
            json!({ "prefix": "203.0.113.9/32", "community": "65535:666" }),
        );
        let outcome = assert_ok!(block_on(adapter.apply(&request, &DispatchContext::new())));

        assert!(!outcome.applied);
        assert_eq!(outcome.detail["upstream"], json!("acknowledged"));
        assert_eq!(outcome.detail["action"], json!("rtbh"));
        assert_eq!(outcome.detail["params"]["community"], json!("65535:666"));
    }
}
