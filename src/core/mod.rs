//! Core functionality of the threat mitigation service.
//!
//! Components, leaves first: command execution and capability detection,
//! traffic accounting, connection auditing, reputation enrichment, policy,
//! mitigation dispatch with its backends, notifications and the cycle that
//! ties them together.

pub mod exec;
pub mod capability;
pub mod collector;
pub mod auditor;
pub mod enrichment;
pub mod policy;
pub mod dispatcher;
pub mod edge;
pub mod cloudflare;
pub mod upstream;
pub mod notifier;
pub mod cycle;

pub use capability::{detect_capabilities, ExecutionPlan};
pub use collector::CounterCollector;
pub use auditor::ConnectionAuditor;
pub use enrichment::EnrichmentService;
pub use policy::{PolicyEngine, PolicyRule, PolicyCondition, ActionKind};
pub use dispatcher::{MitigationBackend, MitigationDispatcher, MitigationError};
pub use notifier::AlertNotifier;
pub use cycle::{CycleComponents, CycleError, CycleRunner};
