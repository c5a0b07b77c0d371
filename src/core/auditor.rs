//! Live connection auditing.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::capability::SocketTool;
use crate::core::exec::{argv, CommandError, CommandRunner};
use crate::models::FailureKind;

/// Errors that can occur while listing connections
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("no connection listing tool available")]
    NoTool,
    #[error("connection listing failed: {0}")]
    Command(#[from] CommandError),
}

impl AuditError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AuditError::NoTool => FailureKind::Unavailable,
            AuditError::Command(e) => e.kind(),
        }
    }
}

/// One observed transport connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub remote: IpAddr,
    pub remote_port: u16,
    pub protocol: String,
    pub raw: String,
}

fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Loopback, link-local, unspecified and multicast peers are not audited.
pub fn is_auditable(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_loopback() || v4.is_link_local() || v4.is_unspecified() || v4.is_multicast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback() || is_link_local_v6(&v6) || v6.is_unspecified() || v6.is_multicast())
        }
    }
}

/// Split `addr:port`, `[v6]:port` or `v6:port` into its parts
pub fn split_endpoint(endpoint: &str) -> Option<(IpAddr, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = host.split('%').next().unwrap_or(host);
    let addr: IpAddr = host.parse().ok()?;
    let addr = match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    Some((addr, port))
}

/// Parse `ss -ntu` or `netstat -ntu` output
pub fn parse_connections(text: &str, tool: SocketTool) -> Vec<ConnectionRecord> {
    let peer_column = match tool {
        SocketTool::Ss => 5,
        SocketTool::Netstat => 4,
    };

    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let protocol = parts.first()?.to_ascii_lowercase();
            if !(protocol.starts_with("tcp") || protocol.starts_with("udp")) {
                return None;
            }
            let (remote, remote_port) = split_endpoint(parts.get(peer_column)?)?;
            Some(ConnectionRecord {
                remote,
                remote_port,
                protocol: protocol.trim_end_matches('6').to_string(),
                raw: line.to_string(),
            })
        })
        .collect()
}

/// Distinct auditable remotes in first-seen order, capped at `max`
pub fn distinct_remotes(records: &[ConnectionRecord], max: usize) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    records
        .iter()
        .map(|r| r.remote)
        .filter(|addr| is_auditable(*addr))
        .filter(|addr| seen.insert(*addr))
        .take(max)
        .collect()
}

/// Snapshots active transport connections
pub struct ConnectionAuditor {
    runner: Arc<dyn CommandRunner>,
    tool: Option<SocketTool>,
    max_addresses: usize,
}

impl ConnectionAuditor {
    pub fn new(runner: Arc<dyn CommandRunner>, tool: Option<SocketTool>, max_addresses: usize) -> Self {
        Self {
            runner,
            tool,
            max_addresses,
        }
    }

    /// Every parsed connection record
    pub async fn records(&self) -> Result<Vec<ConnectionRecord>, AuditError> {
        let tool = self.tool.ok_or(AuditError::NoTool)?;
        let output = self
            .runner
            .run(tool.program(), &argv(&["-ntu"]), None)
            .await?;
        Ok(parse_connections(&output.stdout, tool))
    }

    /// Distinct remote addresses of current connections
    pub async fn snapshot(&self) -> Result<Vec<IpAddr>, AuditError> {
        let records = self.records().await?;
        let remotes = distinct_remotes(&records, self.max_addresses);
        debug!(
            "Audited {} connections, {} distinct remotes",
            records.len(),
            remotes.len()
        );
        Ok(remotes)
    }
}
