//! Background task that drives [`Renewer::step`] on its own schedule

use super::{RenewalError, RenewalState, Renewer};
use crate::clock::format_ms;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// How long `shutdown` waits for an in-flight cycle before aborting it
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handle for controlling a running renewal loop
///
/// Dropping the handle without calling [`RenewalHandle::shutdown`] also stops
/// the loop at its next wakeup.
pub struct RenewalHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// `None` once the task's outcome has been reported
    join_handle: Option<JoinHandle<Result<(), RenewalError>>>,
}

fn task_outcome(
    joined: Result<Result<(), RenewalError>, JoinError>,
) -> Result<(), RenewalError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(RenewalError::TaskPanic(e.to_string())),
    }
}

impl RenewalHandle {
    /// Wait for the loop to end on its own
    ///
    /// Only returns early on a fatal [`RenewalError`]; a healthy loop runs
    /// until shut down. The outcome is reported once; later calls return
    /// `Ok(())` immediately. Cancel safe.
    pub async fn stopped(&mut self) -> Result<(), RenewalError> {
        let Some(join_handle) = self.join_handle.as_mut() else {
            return Ok(());
        };
        let joined = join_handle.await;
        self.join_handle = None;
        task_outcome(joined)
    }

    /// Stop scheduling new cycles and wait up to `grace` for the current one
    ///
    /// A cycle still running after `grace` is aborted. Bundle writes run on
    /// the blocking pool and finish regardless, so the file on disk is never
    /// left half-written. Returns `Ok(())` if [`RenewalHandle::stopped`]
    /// already reported the loop's end.
    pub async fn shutdown(mut self, grace: Duration) -> Result<(), RenewalError> {
        debug!("Shutting down renewal loop");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        let Some(mut join_handle) = self.join_handle.take() else {
            debug!("Renewal loop already stopped");
            return Ok(());
        };

        match tokio::time::timeout(grace, &mut join_handle).await {
            Ok(joined) => task_outcome(joined),
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Renewal cycle still running after grace period, aborting"
                );
                join_handle.abort();
                Ok(())
            }
        }
    }
}

impl Renewer {
    /// Start the renewal loop from the `start` state
    pub fn spawn(self) -> RenewalHandle {
        self.spawn_from(RenewalState::Start)
    }

    /// Start the renewal loop from an arbitrary state
    pub fn spawn_from(mut self, initial: RenewalState) -> RenewalHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let join_handle = tokio::spawn(async move {
            let mut state = initial;
            let mut delay = Duration::ZERO;

            info!(
                source = self.source.name(),
                bundle = %self.bundle_path.display(),
                "Certificate renewal loop starting"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => {
                        info!(state = state.name(), "Certificate renewal loop shutting down");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                let from = state.name();
                let transition = match self.step(state).await {
                    Ok(transition) => transition,
                    Err(e) => {
                        error!(state = from, error = %e, "FATAL: {}", e);
                        return Err(e);
                    }
                };

                let next_at = self.clock.now_ms() + transition.delay.as_millis() as i64;
                debug!(
                    from,
                    to = transition.state.name(),
                    delay_ms = transition.delay.as_millis() as u64,
                    next_run = %format_ms(next_at),
                    "Renewal state transition"
                );

                state = transition.state;
                delay = transition.delay;
            }
        });

        RenewalHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
        }
    }
}
