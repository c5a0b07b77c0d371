//! Threat Mitigation Service
//!
//! Per-source traffic accounting, connection auditing, reputation
//! enrichment and mitigation dispatch across edge, CDN and upstream
//! backends.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
