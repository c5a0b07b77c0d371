//! Host capability detection.
//!
//! Probes the available kernel tooling once and resolves an execution plan
//! that the collector, auditor and edge adapter consume.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::core::exec::{argv, CommandRunner};

/// Tool used to list transport connections
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SocketTool {
    Ss,
    Netstat,
}

impl SocketTool {
    pub fn program(self) -> &'static str {
        match self {
            SocketTool::Ss => "ss",
            SocketTool::Netstat => "netstat",
        }
    }
}

/// Resolved set of tools usable on this host
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// nftables is installed
    pub nft: bool,
    /// iproute2 tc is installed
    pub tc: bool,
    /// Connection listing tool
    pub socket_tool: Option<SocketTool>,
    /// Interface of the default route
    pub default_interface: Option<String>,
}

impl ExecutionPlan {
    /// Plan assuming every tool is present
    pub fn full(default_interface: Option<&str>) -> Self {
        Self {
            nft: true,
            tc: true,
            socket_tool: Some(SocketTool::Ss),
            default_interface: default_interface.map(|s| s.to_string()),
        }
    }
}

async fn probe(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> bool {
    runner.run(program, &argv(args), None).await.is_ok()
}

/// Extract the `dev` of the first default route
pub fn parse_default_interface(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.starts_with("default"))?;
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "dev" {
            return tokens.next().map(|s| s.to_string());
        }
    }
    None
}

/// Probe the host and resolve the execution plan
pub async fn detect_capabilities(runner: &dyn CommandRunner) -> ExecutionPlan {
    let nft = probe(runner, "nft", &["--version"]).await;
    let tc = probe(runner, "tc", &["-V"]).await;

    let socket_tool = if probe(runner, "ss", &["-V"]).await {
        Some(SocketTool::Ss)
    } else if probe(runner, "netstat", &["--version"]).await {
        Some(SocketTool::Netstat)
    } else {
        None
    };

    let default_interface = match runner
        .run("ip", &argv(&["route", "show", "default"]), None)
        .await
    {
        Ok(output) => parse_default_interface(&output.stdout),
        Err(e) => {
            warn!("Default interface detection failed: {}", e);
            None
        }
    };

    let plan = ExecutionPlan {
        nft,
        tc,
        socket_tool,
        default_interface,
    };
    info!("Resolved execution plan: {:?}", plan);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exec::testing::{failed, ScriptedRunner};
    use crate::core::exec::{CommandError, CommandOutput};

    #[test]
    fn test_parse_default_interface() {
        let out = "default via 192.168.0.1 dev enp3s0 proto dhcp metric 100\n";
        assert_eq!(parse_default_interface(out), Some("enp3s0".to_string()));
        assert_eq!(parse_default_interface(""), None);
    }

    #[tokio::test]
    async fn test_detect_falls_back_to_netstat() {
        let runner = ScriptedRunner::new(|line, _| {
            if line.starts_with("ss ") {
                Err(CommandError::NotFound {
                    program: "ss".to_string(),
                })
            } else if line.starts_with("tc ") {
                Err(failed("tc", "Operation not permitted"))
            } else if line == "ip route show default" {
                Ok(CommandOutput::stdout("default via 10.0.0.1 dev eth0\n"))
            } else {
                Ok(CommandOutput::default())
            }
        });

        let plan = detect_capabilities(&runner).await;
        assert!(plan.nft);
        assert!(!plan.tc);
        assert_eq!(plan.socket_tool, Some(SocketTool::Netstat));
        assert_eq!(plan.default_interface.as_deref(), Some("eth0"));
    }
}
