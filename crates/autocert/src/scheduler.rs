//! Background certificate renewal
//!
//! One task per running manager. It sleeps until the live certificate
//! enters its renewal window, renews, and repeats. A failed renewal ends
//! the task: the authority may be rate limiting us, so retry cadence is
//! left to whoever restarts the manager.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::AcmeError;
use crate::manager::CertificateManager;

/// Time from `now` until `not_after - renew_before`, zero if already past
pub fn renewal_delay(
    not_after: DateTime<Utc>,
    renew_before: Duration,
    now: DateTime<Utc>,
) -> Duration {
    let window = TimeDelta::from_std(renew_before).unwrap_or(TimeDelta::MAX);
    let renew_at = not_after
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    (renew_at - now).to_std().unwrap_or(Duration::ZERO)
}

/// State of the background renewal task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalState {
    /// Waiting for the next renewal window
    Idle,
    /// A renewal is in progress
    Renewing,
    /// A renewal failed; the task has stopped
    Failed(String),
    /// Cancelled; the task has stopped
    Stopped,
}

impl RenewalState {
    /// Whether the task has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, RenewalState::Failed(_) | RenewalState::Stopped)
    }
}

/// Handle to a running renewal task
#[derive(Debug)]
pub struct RenewalHandle {
    join: JoinHandle<()>,
    state: watch::Receiver<RenewalState>,
}

impl RenewalHandle {
    /// Current state
    pub fn state(&self) -> RenewalState {
        self.state.borrow().clone()
    }

    /// Receiver for observing state changes
    pub fn subscribe(&self) -> watch::Receiver<RenewalState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task to end and return its final state
    pub async fn finished(self) -> RenewalState {
        if let Err(e) = self.join.await {
            error!(error = %e, "Renewal task panicked");
            return RenewalState::Failed(e.to_string());
        }
        let state = self.state.borrow().clone();
        state
    }
}

/// Start the renewal task for `manager`
pub(crate) fn spawn(manager: Arc<CertificateManager>, cancel: CancellationToken) -> RenewalHandle {
    let (tx, rx) = watch::channel(RenewalState::Idle);
    let join = tokio::spawn(async move {
        renewal_loop(&manager, &cancel, &tx).await;
        manager.finish_run();
    });

    RenewalHandle { join, state: rx }
}

async fn renewal_loop(
    manager: &CertificateManager,
    cancel: &CancellationToken,
    state: &watch::Sender<RenewalState>,
) {
    let domain = manager.config().domain.clone();
    info!(domain = %domain, "Starting certificate renewal scheduler");

    loop {
        let delay = manager.next_renewal_delay().unwrap_or(Duration::ZERO);
        info!(
            domain = %domain,
            delay_secs = delay.as_secs(),
            "Next certificate renewal scheduled"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                state.send_replace(RenewalState::Stopped);
                info!(domain = %domain, "Certificate renewal scheduler stopped");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        debug!(domain = %domain, "Renewal window reached");
        state.send_replace(RenewalState::Renewing);

        match manager.renew(cancel).await {
            Ok(()) => {
                // A fresh certificate already inside its window would renew
                // back to back
                if manager.next_renewal_delay().is_some_and(|d| d.is_zero()) {
                    let err = AcmeError::Configuration(format!(
                        "new certificate for '{}' is already inside the {}s renewal window",
                        domain,
                        manager.config().renew_before.as_secs()
                    ));
                    manager.report(&err);
                    state.send_replace(RenewalState::Failed(err.to_string()));
                    error!(
                        domain = %domain,
                        "Certificate renewal scheduler stopped, renew-before exceeds certificate lifetime"
                    );
                    return;
                }
                state.send_replace(RenewalState::Idle);
            }
            Err(AcmeError::Cancelled) => {
                state.send_replace(RenewalState::Stopped);
                info!(domain = %domain, "Certificate renewal scheduler stopped");
                return;
            }
            Err(e) => {
                // Already reported by renew
                state.send_replace(RenewalState::Failed(e.to_string()));
                error!(
                    domain = %domain,
                    "Certificate renewal scheduler stopped after a failed renewal"
                );
                return;
            }
        }
    }
}
