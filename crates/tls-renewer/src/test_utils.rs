//! In-memory doubles for the renewal seams

use crate::clock::Clock;
use crate::config::HookSpec;
use crate::hooks::{CommandExecutor, ExecError, HookEvent};
use crate::source::{CertificateBundle, CertificateSource, SourceError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Bundle with recognizable `CERT-<tag>` / `KEY-<tag>` contents
pub fn bundle(tag: &str, expiration_secs: i64) -> CertificateBundle {
    CertificateBundle {
        certificate: format!("CERT-{}", tag),
        private_key: format!("KEY-{}", tag),
        expiration: expiration_secs,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub command: String,
    pub event: HookEvent,
}

/// Records hook invocations and fails them on request
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<Call>>,
    remaining_failures: Mutex<HashMap<String, usize>>,
    always_failing: Mutex<HashSet<String>>,
    holds: Mutex<HashMap<String, Duration>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` attempts of `command`
    pub fn fail_times(&self, command: &str, n: usize) {
        self.remaining_failures
            .lock()
            .unwrap()
            .insert(command.to_string(), n);
    }

    pub fn always_fail(&self, command: &str) {
        self.always_failing
            .lock()
            .unwrap()
            .insert(command.to_string());
    }

    /// Keep every attempt of `command` running for `duration`
    pub fn hold(&self, command: &str, duration: Duration) {
        self.holds
            .lock()
            .unwrap()
            .insert(command.to_string(), duration);
    }

    pub fn attempts(&self, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.command == command)
            .count()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, hook: &HookSpec, event: HookEvent) -> Result<(), ExecError> {
        self.calls.lock().unwrap().push(Call {
            command: hook.command.clone(),
            event,
        });

        let hold = self.holds.lock().unwrap().get(&hook.command).copied();
        if let Some(duration) = hold {
            tokio::time::sleep(duration).await;
        }

        if self.always_failing.lock().unwrap().contains(&hook.command) {
            return Err(ExecError::Exit(Some(1)));
        }

        let mut remaining = self.remaining_failures.lock().unwrap();
        match remaining.get_mut(&hook.command) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(ExecError::Exit(Some(1)))
            }
            _ => Ok(()),
        }
    }
}

/// Replays queued fetch results; an empty queue answers 503
#[derive(Default)]
pub struct ScriptedSource {
    responses: Mutex<VecDeque<Result<CertificateBundle, String>>>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, bundle: CertificateBundle) {
        self.responses.lock().unwrap().push_back(Ok(bundle));
    }

    pub fn push_err(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateSource for ScriptedSource {
    async fn fetch(&self) -> Result<CertificateBundle, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(bundle)) => Ok(bundle),
            Some(Err(message)) => Err(SourceError::Api {
                status: 500,
                message,
            }),
            None => Err(SourceError::Api {
                status: 503,
                message: "no scripted response".to_string(),
            }),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
