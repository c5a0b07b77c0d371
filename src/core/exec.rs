//! External command execution.
//!
//! Every call to kernel tooling (nft, tc, ss, ip) goes through the
//! `CommandRunner` trait and comes back as a typed result, so expected
//! failures such as a missing binary or a permission error never surface
//! as panics.

use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::models::FailureKind;

/// Errors that can occur while running an external command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{program} is not installed")]
    NotFound { program: String },
    #[error("{program}: permission denied: {stderr}")]
    PermissionDenied { program: String, stderr: String },
    #[error("{program}: object already exists")]
    AlreadyExists { program: String, stderr: String },
    #[error("{program} exited with status {status}: {stderr}")]
    Failed {
        program: String,
        status: i32,
        stderr: String,
    },
    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CommandError::NotFound { .. } => FailureKind::Unavailable,
            CommandError::PermissionDenied { .. } => FailureKind::Privilege,
            CommandError::AlreadyExists { .. }
            | CommandError::Failed { .. }
            | CommandError::Io { .. } => FailureKind::Command,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, CommandError::AlreadyExists { .. })
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn stdout(text: &str) -> Self {
        Self {
            stdout: text.to_string(),
            stderr: String::new(),
        }
    }
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, feeding `stdin` when given.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<String>,
    ) -> Result<CommandOutput, CommandError>;
}

/// Build an owned argument vector
pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Map a non-zero exit onto the failure taxonomy
pub fn classify_failure(program: &str, status: i32, stderr: &str) -> CommandError {
    let lowered = stderr.to_ascii_lowercase();
    let stderr = stderr.trim().to_string();
    if lowered.contains("operation not permitted") || lowered.contains("permission denied") {
        CommandError::PermissionDenied {
            program: program.to_string(),
            stderr,
        }
    } else if lowered.contains("file exists") {
        CommandError::AlreadyExists {
            program: program.to_string(),
            stderr,
        }
    } else {
        CommandError::Failed {
            program: program.to_string(),
            status,
            stderr,
        }
    }
}

fn spawn_error(program: &str, err: std::io::Error) -> CommandError {
    match err.kind() {
        std::io::ErrorKind::NotFound => CommandError::NotFound {
            program: program.to_string(),
        },
        std::io::ErrorKind::PermissionDenied => CommandError::PermissionDenied {
            program: program.to_string(),
            stderr: err.to_string(),
        },
        _ => CommandError::Io {
            program: program.to_string(),
            source: err,
        },
    }
}

/// Runner backed by `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<String>,
    ) -> Result<CommandOutput, CommandError> {
        debug!("exec: {} {}", program, args.join(" "));

        let mut command = Command::new(program);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn().map_err(|e| spawn_error(program, e))?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .await
                    .map_err(|e| CommandError::Io {
                        program: program.to_string(),
                        source: e,
                    })?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CommandError::Io {
                program: program.to_string(),
                source: e,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            Err(classify_failure(
                program,
                output.status.code().unwrap_or(-1),
                &stderr,
            ))
        }
    }
}
