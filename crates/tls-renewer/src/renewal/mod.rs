//! Certificate renewal state machine
//!
//! The daemon cycles through three states:
//!
//! - `Start`: no certificate installed yet. Fetch, write, run `onstart`
//!   hooks. Failures retry after the fixed `intervals.default` delay.
//! - `Ok`: healthy. Each cycle fetches a replacement and keeps it as the
//!   standby bundle; the standby is installed once the active bundle has
//!   entered its buffer window.
//! - `Error`: the last fetch or write failed. Retries at the faster
//!   `intervals.error` cadence until a fetch succeeds, and falls back to the
//!   standby bundle if the active one enters its buffer window meanwhile.
//!
//! Delays in `Ok` and `Error` are fractions of a certificate's ttl, so
//! short-lived and long-lived certificates are polled proportionally often.
//!
//! Each call to [`Renewer::step`] consumes the current state and returns the
//! next one with the delay before the following call. Recoverable failures
//! (fetch, write) are absorbed into the returned state; only the conditions
//! in [`RenewalError`] escape, and they stop the daemon.

mod scheduler;

pub use scheduler::{RenewalHandle, SHUTDOWN_GRACE};

use crate::cert_writer::write_bundle_async;
use crate::clock::{format_ms, Clock, SystemClock};
use crate::config::{Config, HookSpec, IntervalsConfig};
use crate::hooks::{HookError, HookEvent, HookRunner, ShellExecutor, CommandExecutor};
use crate::source::{CertificateBundle, CertificateSource, SourceError, VaultPkiSource};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Consecutive recoverable failures before an operator alert is logged
const FAILURE_ALERT_THRESHOLD: u32 = 3;

/// Conditions that stop the renewal loop
#[derive(Debug, Error)]
pub enum RenewalError {
    #[error(transparent)]
    HookFailed(#[from] HookError),

    #[error("certificate expiring at {expires_at} has non-positive ttl {ttl_ms}ms")]
    InvalidTtl { ttl_ms: i64, expires_at: String },

    /// Checked when an error cycle begins, before any fetch. A held standby
    /// is not tried once the active bundle has expired.
    #[error("active certificate expired at {expired_at} and no replacement could be installed")]
    ActiveExpired { expired_at: String },

    #[error("renewal task failed: {0}")]
    TaskPanic(String),
}

/// The installed bundle and the ttl it had when it became active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveBundle {
    pub bundle: CertificateBundle,
    /// Milliseconds of validity at activation time; never recomputed
    pub ttl_ms: i64,
}

/// Lifecycle state of the renewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalState {
    Start,
    Ok {
        active: ActiveBundle,
        standby: Option<CertificateBundle>,
    },
    Error {
        active: ActiveBundle,
        standby: Option<CertificateBundle>,
    },
}

impl RenewalState {
    pub fn name(&self) -> &'static str {
        match self {
            RenewalState::Start => "start",
            RenewalState::Ok { .. } => "ok",
            RenewalState::Error { .. } => "error",
        }
    }

    pub fn active(&self) -> Option<&ActiveBundle> {
        match self {
            RenewalState::Start => None,
            RenewalState::Ok { active, .. } | RenewalState::Error { active, .. } => Some(active),
        }
    }

    pub fn standby(&self) -> Option<&CertificateBundle> {
        match self {
            RenewalState::Start => None,
            RenewalState::Ok { standby, .. } | RenewalState::Error { standby, .. } => {
                standby.as_ref()
            }
        }
    }
}

/// Next state plus how long to wait before entering it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: RenewalState,
    pub delay: Duration,
}

impl Transition {
    fn new(state: RenewalState, delay: Duration) -> Self {
        Self { state, delay }
    }
}

/// `fraction` of `ttl_ms`, as a delay
fn scaled(ttl_ms: i64, fraction: f64) -> Duration {
    Duration::from_millis((ttl_ms.max(0) as f64 * fraction).round() as u64)
}

/// Drives the renewal state machine
pub struct Renewer {
    source: Arc<dyn CertificateSource>,
    hooks: HookRunner,
    clock: Arc<dyn Clock>,
    bundle_path: PathBuf,
    intervals: IntervalsConfig,
    onstart: Vec<HookSpec>,
    onreplace: Vec<HookSpec>,
    consecutive_failures: u32,
}

impl Renewer {
    pub fn new(
        config: &Config,
        source: Arc<dyn CertificateSource>,
        executor: Arc<dyn CommandExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            hooks: HookRunner::new(executor),
            clock,
            bundle_path: config.tls.bundle_path().to_path_buf(),
            intervals: config.intervals,
            onstart: config.onstart.clone(),
            onreplace: config.onreplace.clone(),
            consecutive_failures: 0,
        }
    }

    /// Wire up the Vault source, shell hooks and the system clock
    pub fn from_config(config: &Config) -> Result<Self, SourceError> {
        let source = VaultPkiSource::from_config(config)?;
        let executor = ShellExecutor::new(config.tls.bundle_path());
        Ok(Self::new(
            config,
            Arc::new(source),
            Arc::new(executor),
            Arc::new(SystemClock),
        ))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Run the handler for `state` and return what comes next
    pub async fn step(&mut self, state: RenewalState) -> Result<Transition, RenewalError> {
        match state {
            RenewalState::Start => self.handle_start().await,
            RenewalState::Ok { active, standby } => self.handle_ok(active, standby).await,
            RenewalState::Error { active, standby } => self.handle_error(active, standby).await,
        }
    }

    async fn handle_start(&mut self) -> Result<Transition, RenewalError> {
        let retry = self.intervals.default_delay();

        let bundle = match self.source.fetch().await {
            Ok(bundle) => bundle,
            Err(e) => {
                self.record_failure("start", "fetch", &e, retry);
                return Ok(Transition::new(RenewalState::Start, retry));
            }
        };

        // A failed write discards the bundle; the next attempt fetches again
        if let Err(e) = write_bundle_async(bundle.clone(), self.bundle_path.clone()).await {
            self.record_failure("start", "write", &e, retry);
            return Ok(Transition::new(RenewalState::Start, retry));
        }

        self.hooks.run(HookEvent::OnStart, &self.onstart).await?;

        let ttl_ms = self.ttl_for(&bundle)?;
        let delay = scaled(ttl_ms, self.intervals.ok);
        self.consecutive_failures = 0;

        info!(
            expires_at = %format_ms(bundle.expires_at_ms()),
            ttl_ms,
            next_check_ms = delay.as_millis() as u64,
            "Initial certificate installed"
        );

        Ok(Transition::new(
            RenewalState::Ok {
                active: ActiveBundle { bundle, ttl_ms },
                standby: None,
            },
            delay,
        ))
    }

    async fn handle_ok(
        &mut self,
        active: ActiveBundle,
        standby: Option<CertificateBundle>,
    ) -> Result<Transition, RenewalError> {
        let retry = scaled(active.ttl_ms, self.intervals.error);

        match self.source.fetch().await {
            Ok(fetched) => self.settle_fetched("ok", active, fetched, retry).await,
            Err(e) => {
                self.record_failure("ok", "fetch", &e, retry);
                Ok(Transition::new(RenewalState::Error { active, standby }, retry))
            }
        }
    }

    async fn handle_error(
        &mut self,
        active: ActiveBundle,
        standby: Option<CertificateBundle>,
    ) -> Result<Transition, RenewalError> {
        let now = self.clock.now_ms();
        if active.bundle.expires_at_ms() < now {
            return Err(RenewalError::ActiveExpired {
                expired_at: format_ms(active.bundle.expires_at_ms()),
            });
        }

        let retry = scaled(active.ttl_ms, self.intervals.error);

        let error = match self.source.fetch().await {
            Ok(fetched) => return self.settle_fetched("error", active, fetched, retry).await,
            Err(e) => e,
        };
        self.record_failure("error", "fetch", &error, retry);

        let standby = match standby {
            Some(candidate) if self.within_buffer(&active) => {
                return self.fall_back_to_standby(active, candidate, retry).await;
            }
            other => other,
        };

        Ok(Transition::new(RenewalState::Error { active, standby }, retry))
    }

    /// Install a standby bundle fetched in an earlier cycle
    async fn fall_back_to_standby(
        &mut self,
        active: ActiveBundle,
        candidate: CertificateBundle,
        retry: Duration,
    ) -> Result<Transition, RenewalError> {
        let remaining = candidate.remaining_ms(self.clock.now_ms());
        if remaining <= 0 {
            warn!(
                expired_at = %format_ms(candidate.expires_at_ms()),
                "Standby certificate already expired, discarding it"
            );
            return Ok(Transition::new(
                RenewalState::Error {
                    active,
                    standby: None,
                },
                retry,
            ));
        }

        if let Err(e) = write_bundle_async(candidate.clone(), self.bundle_path.clone()).await {
            self.record_failure("error", "write", &e, retry);
            return Ok(Transition::new(
                RenewalState::Error {
                    active,
                    standby: Some(candidate),
                },
                retry,
            ));
        }

        info!(
            expires_at = %format_ms(candidate.expires_at_ms()),
            "Active certificate entered buffer window; installed standby certificate"
        );
        self.hooks.run(HookEvent::OnReplace, &self.onreplace).await?;

        let ttl_ms = self.ttl_for(&candidate)?;
        Ok(Transition::new(
            RenewalState::Error {
                active: ActiveBundle {
                    bundle: candidate,
                    ttl_ms,
                },
                standby: None,
            },
            retry,
        ))
    }

    /// Shared tail of the `ok` and `error` handlers after a successful fetch
    async fn settle_fetched(
        &mut self,
        state: &'static str,
        active: ActiveBundle,
        fetched: CertificateBundle,
        retry: Duration,
    ) -> Result<Transition, RenewalError> {
        let promote = self.within_buffer(&active);

        if promote {
            if let Err(e) = write_bundle_async(fetched.clone(), self.bundle_path.clone()).await {
                // Keep the fetched bundle so the error state can retry installing it
                self.record_failure(state, "write", &e, retry);
                return Ok(Transition::new(
                    RenewalState::Error {
                        active,
                        standby: Some(fetched),
                    },
                    retry,
                ));
            }
            info!(
                state,
                expires_at = %format_ms(fetched.expires_at_ms()),
                "Active certificate entered buffer window; installed replacement"
            );
            self.hooks.run(HookEvent::OnReplace, &self.onreplace).await?;
        } else {
            debug!(
                state,
                expires_at = %format_ms(fetched.expires_at_ms()),
                "Holding fetched certificate as standby"
            );
        }

        let ttl_ms = self.ttl_for(&fetched)?;
        let delay = scaled(ttl_ms, self.intervals.ok);

        if self.consecutive_failures > 0 {
            info!(
                previous_failures = self.consecutive_failures,
                "Certificate renewal recovered"
            );
        }
        self.consecutive_failures = 0;

        let next = if promote {
            RenewalState::Ok {
                active: ActiveBundle {
                    bundle: fetched,
                    ttl_ms,
                },
                standby: None,
            }
        } else {
            RenewalState::Ok {
                active,
                standby: Some(fetched),
            }
        };

        Ok(Transition::new(next, delay))
    }

    /// Whether `active` has less than `buffer * ttl` validity left
    fn within_buffer(&self, active: &ActiveBundle) -> bool {
        let remaining = active.bundle.remaining_ms(self.clock.now_ms());
        (remaining as f64) < active.ttl_ms as f64 * self.intervals.buffer
    }

    fn ttl_for(&self, bundle: &CertificateBundle) -> Result<i64, RenewalError> {
        let ttl_ms = bundle.remaining_ms(self.clock.now_ms());
        if ttl_ms <= 0 {
            return Err(RenewalError::InvalidTtl {
                ttl_ms,
                expires_at: format_ms(bundle.expires_at_ms()),
            });
        }
        Ok(ttl_ms)
    }

    fn record_failure(
        &mut self,
        state: &'static str,
        stage: &'static str,
        error: &dyn fmt::Display,
        retry_in: Duration,
    ) {
        self.consecutive_failures += 1;
        warn!(
            state,
            stage,
            source = self.source.name(),
            consecutive_failures = self.consecutive_failures,
            retry_in_ms = retry_in.as_millis() as u64,
            error = %error,
            "Certificate renewal attempt failed"
        );

        if self.consecutive_failures >= FAILURE_ALERT_THRESHOLD {
            error!(
                consecutive_failures = self.consecutive_failures,
                threshold = FAILURE_ALERT_THRESHOLD,
                "CRITICAL: Certificate renewal has failed {} consecutive times. \
                 Check that the CA is reachable and the token is valid, \
                 and that the bundle directory is writable. \
                 The daemon stops once the installed certificate expires.",
                self.consecutive_failures
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{bundle, ManualClock, RecordingExecutor, ScriptedSource};
    use tempfile::TempDir;

    /// 2023-11-14T22:13:20Z
    const NOW_MS: i64 = 1_700_000_000_000;
    const HOUR_MS: i64 = 3_600_000;

    struct Harness {
        renewer: Renewer,
        source: Arc<ScriptedSource>,
        executor: Arc<RecordingExecutor>,
        clock: Arc<ManualClock>,
        bundle_path: PathBuf,
        _dir: TempDir,
    }

    fn test_config(bundle_path: &std::path::Path) -> Config {
        let json = serde_json::json!({
            "vault": { "address": "http://127.0.0.1:8200", "token": "t", "path": "pki/issue/test" },
            "tls": { "cert": bundle_path, "key": bundle_path },
            "onstart": [{ "command": "start-hook", "onfail": { "retry_every": 1000, "retry_num": 1 } }],
            "onreplace": [{ "command": "replace-hook", "onfail": { "retry_every": 1000, "retry_num": 1 } }],
            "intervals": { "ok": 0.2, "error": 0.05, "default": 30000, "buffer": 0.25 }
        });
        serde_json::from_value(json).unwrap()
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let bundle_path = dir.path().join("bundle.pem");
        harness_with_path(dir, bundle_path)
    }

    /// Bundle path whose parent is a regular file, so every write fails
    fn unwritable_harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let bundle_path = blocker.join("bundle.pem");
        harness_with_path(dir, bundle_path)
    }

    fn harness_with_path(dir: TempDir, bundle_path: PathBuf) -> Harness {
        let source = Arc::new(ScriptedSource::new());
        let executor = Arc::new(RecordingExecutor::new());
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let renewer = Renewer::new(
            &test_config(&bundle_path),
            source.clone(),
            executor.clone(),
            clock.clone(),
        );
        Harness {
            renewer,
            source,
            executor,
            clock,
            bundle_path,
            _dir: dir,
        }
    }

    /// A bundle valid for one hour from `now_ms`
    fn hour_bundle(tag: &str, now_ms: i64) -> CertificateBundle {
        bundle(tag, (now_ms + HOUR_MS) / 1000)
    }

    fn active_at(tag: &str, now_ms: i64) -> ActiveBundle {
        ActiveBundle {
            bundle: hour_bundle(tag, now_ms),
            ttl_ms: HOUR_MS,
        }
    }

    fn on_disk(h: &Harness) -> Option<String> {
        std::fs::read_to_string(&h.bundle_path).ok()
    }

    #[tokio::test]
    async fn test_start_success_moves_to_ok() {
        let mut h = harness();
        h.source.push_ok(hour_bundle("first", NOW_MS));

        let t = h.renewer.step(RenewalState::Start).await.unwrap();

        // 0.2 * 3600000ms
        assert_eq!(t.delay, Duration::from_millis(720_000));
        let active = t.state.active().expect("ok state has an active bundle");
        assert_eq!(t.state.name(), "ok");
        assert_eq!(active.ttl_ms, HOUR_MS);
        assert_eq!(active.bundle.certificate, "CERT-first");
        assert!(t.state.standby().is_none());
        assert_eq!(on_disk(&h).unwrap(), "CERT-first\nKEY-first");
        assert_eq!(h.executor.attempts("start-hook"), 1);
        assert_eq!(h.executor.attempts("replace-hook"), 0);
    }

    #[tokio::test]
    async fn test_start_fetch_failure_retries_after_default() {
        let mut h = harness();
        h.source.push_err("vault sealed");

        let t = h.renewer.step(RenewalState::Start).await.unwrap();

        assert_eq!(t.state, RenewalState::Start);
        assert_eq!(t.delay, Duration::from_millis(30_000));
        assert!(on_disk(&h).is_none());
        assert!(h.executor.calls().is_empty());
        assert_eq!(h.renewer.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_start_write_failure_discards_bundle() {
        let mut h = unwritable_harness();
        h.source.push_ok(hour_bundle("first", NOW_MS));

        let t = h.renewer.step(RenewalState::Start).await.unwrap();

        assert_eq!(t.state, RenewalState::Start);
        assert_eq!(t.delay, Duration::from_millis(30_000));
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_hook_exhaustion_is_fatal() {
        let mut h = harness();
        h.source.push_ok(hour_bundle("first", NOW_MS));
        h.executor.always_fail("start-hook");

        let err = h.renewer.step(RenewalState::Start).await.unwrap_err();
        assert!(matches!(err, RenewalError::HookFailed(_)));
        // Bundle was installed before hooks ran
        assert!(on_disk(&h).is_some());
    }

    #[tokio::test]
    async fn test_start_with_expired_certificate_is_fatal() {
        let mut h = harness();
        h.source.push_ok(bundle("stale", NOW_MS / 1000));

        let err = h.renewer.step(RenewalState::Start).await.unwrap_err();
        assert!(matches!(err, RenewalError::InvalidTtl { ttl_ms: 0, .. }));
    }

    #[tokio::test]
    async fn test_ok_outside_buffer_keeps_standby() {
        let mut h = harness();
        std::fs::write(&h.bundle_path, "CERT-first\nKEY-first").unwrap();
        let active = active_at("first", NOW_MS);

        // 2880000ms left, buffer is 900000ms
        h.clock.set(NOW_MS + 720_000);
        h.source.push_ok(hour_bundle("second", NOW_MS + 720_000));

        let t = h
            .renewer
            .step(RenewalState::Ok {
                active: active.clone(),
                standby: None,
            })
            .await
            .unwrap();

        assert_eq!(
            t.state,
            RenewalState::Ok {
                active,
                standby: Some(hour_bundle("second", NOW_MS + 720_000)),
            }
        );
        assert_eq!(t.delay, Duration::from_millis(720_000));
        assert_eq!(on_disk(&h).unwrap(), "CERT-first\nKEY-first");
        assert_eq!(h.executor.attempts("replace-hook"), 0);
    }

    #[tokio::test]
    async fn test_ok_inside_buffer_promotes_fetched_bundle() {
        let mut h = harness();
        let active = active_at("first", NOW_MS);

        // 800000ms left, below 0.25 * 3600000
        let now = NOW_MS + 2_800_000;
        h.clock.set(now);
        h.source.push_ok(hour_bundle("second", now));

        let t = h
            .renewer
            .step(RenewalState::Ok {
                active,
                standby: Some(hour_bundle("older-standby", NOW_MS)),
            })
            .await
            .unwrap();

        let new_active = t.state.active().unwrap();
        assert_eq!(t.state.name(), "ok");
        assert_eq!(new_active.bundle.certificate, "CERT-second");
        assert_eq!(new_active.ttl_ms, HOUR_MS);
        assert!(t.state.standby().is_none());
        assert_eq!(on_disk(&h).unwrap(), "CERT-second\nKEY-second");
        assert_eq!(h.executor.attempts("replace-hook"), 1);
        assert_eq!(t.delay, Duration::from_millis(720_000));
    }

    #[tokio::test]
    async fn test_ok_promotion_write_failure_keeps_fetched_as_standby() {
        let mut h = unwritable_harness();
        let active = active_at("first", NOW_MS);
        let now = NOW_MS + 2_800_000;
        h.clock.set(now);
        h.source.push_ok(hour_bundle("second", now));

        let t = h
            .renewer
            .step(RenewalState::Ok {
                active: active.clone(),
                standby: None,
            })
            .await
            .unwrap();

        assert_eq!(
            t.state,
            RenewalState::Error {
                active,
                standby: Some(hour_bundle("second", now)),
            }
        );
        // 0.05 * 3600000ms
        assert_eq!(t.delay, Duration::from_millis(180_000));
        assert_eq!(h.executor.attempts("replace-hook"), 0);
    }

    #[tokio::test]
    async fn test_ok_promotion_hook_exhaustion_is_fatal() {
        let mut h = harness();
        let now = NOW_MS + 2_800_000;
        h.clock.set(now);
        h.source.push_ok(hour_bundle("second", now));
        h.executor.always_fail("replace-hook");

        let result = h
            .renewer
            .step(RenewalState::Ok {
                active: active_at("first", NOW_MS),
                standby: None,
            })
            .await;
        assert!(matches!(result, Err(RenewalError::HookFailed(_))));
    }

    #[tokio::test]
    async fn test_repeated_fetch_failures_use_active_ttl_for_retry() {
        let mut h = harness();
        let active = active_at("first", NOW_MS);
        h.clock.set(NOW_MS + 720_000);
        for _ in 0..3 {
            h.source.push_err("connection refused");
        }

        let mut state = RenewalState::Ok {
            active: active.clone(),
            standby: None,
        };
        for cycle in 0..3 {
            let t = h.renewer.step(state).await.unwrap();
            assert_eq!(t.state.name(), "error", "cycle {}", cycle);
            assert_eq!(t.delay, Duration::from_millis(180_000), "cycle {}", cycle);
            assert_eq!(t.state.active(), Some(&active));
            h.clock.advance(180_000);
            state = t.state;
        }
        assert_eq!(h.renewer.consecutive_failures(), 3);
        assert_eq!(h.source.fetches(), 3);
    }

    #[tokio::test]
    async fn test_error_with_failing_source_is_idempotent() {
        let mut h = harness();
        let state = RenewalState::Error {
            active: active_at("first", NOW_MS),
            standby: None,
        };
        h.clock.set(NOW_MS + 3_000_000);

        let mut current = state.clone();
        for _ in 0..4 {
            h.source.push_err("timeout");
            let t = h.renewer.step(current).await.unwrap();
            assert_eq!(t.state, state);
            assert_eq!(t.delay, Duration::from_millis(180_000));
            current = t.state;
        }
        assert!(on_disk(&h).is_none());
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_error_with_expired_active_is_fatal() {
        let mut h = harness();
        h.clock.set(NOW_MS + HOUR_MS + 1);

        let err = h
            .renewer
            .step(RenewalState::Error {
                active: active_at("first", NOW_MS),
                standby: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RenewalError::ActiveExpired { .. }));
        assert_eq!(h.source.fetches(), 0);
    }

    #[tokio::test]
    async fn test_expired_active_is_fatal_even_with_valid_standby() {
        let mut h = harness();
        let now = NOW_MS + HOUR_MS + 1;
        h.clock.set(now);

        let err = h
            .renewer
            .step(RenewalState::Error {
                active: active_at("first", NOW_MS),
                standby: Some(hour_bundle("standby", now)),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RenewalError::ActiveExpired { .. }));
        assert_eq!(h.source.fetches(), 0);
        assert!(on_disk(&h).is_none());
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_error_fetch_failure_falls_back_to_standby_in_buffer() {
        let mut h = harness();
        let active = active_at("first", NOW_MS);
        let standby = hour_bundle("standby", NOW_MS + 720_000);
        let now = NOW_MS + 3_000_000;
        h.clock.set(now);
        h.source.push_err("vault unavailable");

        let t = h
            .renewer
            .step(RenewalState::Error {
                active,
                standby: Some(standby.clone()),
            })
            .await
            .unwrap();

        assert_eq!(t.state.name(), "error");
        let new_active = t.state.active().unwrap();
        assert_eq!(new_active.bundle, standby);
        assert_eq!(new_active.ttl_ms, standby.remaining_ms(now));
        assert!(t.state.standby().is_none());
        // Retry cadence comes from the bundle that was active on entry
        assert_eq!(t.delay, Duration::from_millis(180_000));
        assert_eq!(on_disk(&h).unwrap(), "CERT-standby\nKEY-standby");
        assert_eq!(h.executor.attempts("replace-hook"), 1);
    }

    #[tokio::test]
    async fn test_error_fetch_failure_keeps_standby_outside_buffer() {
        let mut h = harness();
        let state = RenewalState::Error {
            active: active_at("first", NOW_MS),
            standby: Some(hour_bundle("standby", NOW_MS)),
        };
        h.clock.set(NOW_MS + 720_000);
        h.source.push_err("vault unavailable");

        let t = h.renewer.step(state.clone()).await.unwrap();
        assert_eq!(t.state, state);
        assert!(on_disk(&h).is_none());
    }

    #[tokio::test]
    async fn test_error_fallback_write_failure_stays_in_error() {
        let mut h = unwritable_harness();
        let state = RenewalState::Error {
            active: active_at("first", NOW_MS),
            standby: Some(hour_bundle("standby", NOW_MS + 720_000)),
        };
        h.clock.set(NOW_MS + 3_000_000);
        h.source.push_err("vault unavailable");

        let t = h.renewer.step(state.clone()).await.unwrap();
        assert_eq!(t.state, state);
        assert_eq!(t.delay, Duration::from_millis(180_000));
        assert_eq!(h.executor.attempts("replace-hook"), 0);
    }

    #[tokio::test]
    async fn test_error_recovers_to_ok_on_successful_fetch() {
        let mut h = harness();
        let active = active_at("first", NOW_MS);
        let now = NOW_MS + 1_000_000;
        h.clock.set(now);
        h.source.push_ok(hour_bundle("second", now));

        let t = h
            .renewer
            .step(RenewalState::Error {
                active: active.clone(),
                standby: None,
            })
            .await
            .unwrap();

        assert_eq!(
            t.state,
            RenewalState::Ok {
                active,
                standby: Some(hour_bundle("second", now)),
            }
        );
        assert_eq!(t.delay, Duration::from_millis(720_000));
    }

    #[tokio::test]
    async fn test_error_success_inside_buffer_promotes() {
        let mut h = harness();
        let now = NOW_MS + 3_000_000;
        h.clock.set(now);
        h.source.push_ok(hour_bundle("second", now));

        let t = h
            .renewer
            .step(RenewalState::Error {
                active: active_at("first", NOW_MS),
                standby: Some(hour_bundle("stale-standby", NOW_MS)),
            })
            .await
            .unwrap();

        assert_eq!(t.state.name(), "ok");
        assert_eq!(t.state.active().unwrap().bundle.certificate, "CERT-second");
        assert!(t.state.standby().is_none());
        assert_eq!(on_disk(&h).unwrap(), "CERT-second\nKEY-second");
    }

    #[test]
    fn test_scaled_delay() {
        assert_eq!(scaled(3_600_000, 0.2), Duration::from_millis(720_000));
        assert_eq!(scaled(3_600_000, 0.05), Duration::from_millis(180_000));
        assert_eq!(scaled(-5, 0.2), Duration::ZERO);
    }

    #[test]
    fn test_renewal_error_display() {
        let err = RenewalError::ActiveExpired {
            expired_at: "2023-11-14T23:13:20+00:00".to_string(),
        };
        assert!(err.to_string().contains("expired at 2023-11-14T23:13:20+00:00"));
    }
}
