//! Lifecycle hook execution
//!
//! Hooks are operator commands run after the first bundle is installed
//! (`onstart`) and after every replacement (`onreplace`). Each command in a
//! list gets its own retry loop; the loops run concurrently.
//!
//! Failure policy: the list fails as soon as one command exhausts its
//! attempts. The remaining loops are abandoned at that point (their futures
//! are dropped and any running child is killed), since the caller treats the
//! failure as fatal anyway.
//!
//! Commands run via `sh -c` with stdio inherited from the daemon and these
//! environment variables set:
//!
//! - `TLS_RENEWER_EVENT`: `onstart` or `onreplace`
//! - `TLS_RENEWER_CERT_PATH`: path of the bundle file

use crate::config::HookSpec;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Lifecycle event a hook list belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    OnStart,
    OnReplace,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::OnStart => "onstart",
            HookEvent::OnReplace => "onreplace",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single failed command attempt
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed waiting for command: {0}")]
    Wait(#[source] std::io::Error),

    /// Exit code, or `None` when terminated by a signal
    #[error("command exited with {}", exit_description(.0))]
    Exit(Option<i32>),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

/// A hook list could not complete
#[derive(Debug, Error)]
pub enum HookError {
    #[error("{event} hook '{label}' failed after {attempts} attempt(s): {source}")]
    Exhausted {
        event: HookEvent,
        label: String,
        attempts: u32,
        #[source]
        source: ExecError,
    },
}

/// Runs one external command to completion
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, hook: &HookSpec, event: HookEvent) -> Result<(), ExecError>;
}

/// Executes hooks through `sh -c`
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    bundle_path: PathBuf,
}

impl ShellExecutor {
    pub fn new(bundle_path: impl Into<PathBuf>) -> Self {
        Self {
            bundle_path: bundle_path.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, hook: &HookSpec, event: HookEvent) -> Result<(), ExecError> {
        debug!(command = %hook.command, %event, "Spawning hook command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&hook.command)
            .env("TLS_RENEWER_EVENT", event.as_str())
            .env("TLS_RENEWER_CERT_PATH", &self.bundle_path)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecError::Spawn)?;

        let status = match hook.attempt_timeout() {
            Some(limit) => {
                let result = timeout(limit, child.wait()).await;
                match result {
                    Ok(status) => status.map_err(ExecError::Wait)?,
                    Err(_) => {
                        let _ = child.kill().await;
                        return Err(ExecError::Timeout(limit));
                    }
                }
            }
            None => child.wait().await.map_err(ExecError::Wait)?,
        };

        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Exit(status.code()))
        }
    }
}

/// Runs hook lists with per-command retry
#[derive(Clone)]
pub struct HookRunner {
    executor: Arc<dyn CommandExecutor>,
}

impl HookRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Run every hook in `hooks` concurrently
    ///
    /// Resolves `Ok` only if every command succeeded within its budget. An
    /// empty list succeeds immediately.
    pub async fn run(&self, event: HookEvent, hooks: &[HookSpec]) -> Result<(), HookError> {
        if hooks.is_empty() {
            debug!(%event, "No hooks configured");
            return Ok(());
        }

        info!(%event, count = hooks.len(), "Running hooks");
        try_join_all(hooks.iter().map(|hook| self.run_with_retry(event, hook))).await?;
        info!(%event, count = hooks.len(), "All hooks completed");
        Ok(())
    }

    async fn run_with_retry(&self, event: HookEvent, hook: &HookSpec) -> Result<(), HookError> {
        let max_attempts = hook.onfail.retry_num.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.executor.execute(hook, event).await {
                Ok(()) => {
                    info!(%event, hook = hook.label(), attempt, "Hook succeeded");
                    return Ok(());
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        %event,
                        hook = hook.label(),
                        attempt,
                        max_attempts,
                        retry_in_ms = hook.onfail.retry_every,
                        error = %e,
                        "Hook failed, will retry"
                    );
                    tokio::time::sleep(hook.retry_delay()).await;
                }
                Err(e) => {
                    error!(
                        %event,
                        hook = hook.label(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "Hook failed, no attempts left"
                    );
                    return Err(HookError::Exhausted {
                        event,
                        label: hook.label().to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}
