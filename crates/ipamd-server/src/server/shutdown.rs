//! Termination state and the signal-driven shutdown coordinator.
//!
//! The coordinator runs as one background task. It waits for the first
//! interrupt or termination signal, flips [`TerminationState`] to `true` and
//! exits. It never re-arms, and it does not touch in-flight requests or the
//! listener: stopping the process is left to the supervisor.

use core::future::Future;
use portable_atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Process-wide "shutting down" flag.
///
/// Cloning yields another handle to the same flag. The only transition is
/// `false -> true`.
#[derive(Debug, Clone, Default)]
pub struct TerminationState {
    terminating: Arc<AtomicBool>,
}

impl TerminationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Marks the process as terminating.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn set_terminating(&self) -> bool {
        !self.terminating.swap(true, Ordering::AcqRel)
    }
}

/// How a [`ShutdownCoordinator`] stopped observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A signal arrived and the termination state was set.
    Terminated,
    /// The coordinator was cancelled before any signal arrived.
    Cancelled,
}

/// One-shot listener that moves the process from `running` to
/// `terminating`.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    state: TerminationState,
    cancel: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(state: TerminationState) -> Self {
        Self {
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the coordinator without setting the termination
    /// state.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for `signal` (or cancellation) and performs the transition once.
    ///
    /// The coordinator is consumed: after the first signal nothing is left
    /// listening, so later signals have no effect through it.
    pub async fn run<F>(self, signal: F) -> Outcome
    where
        F: Future<Output = ()>,
    {
        tracing::info!("Setting up shutdown hook");

        tokio::select! {
            () = signal => {
                tracing::info!("Received shutdown signal, setting 'terminating' to true");
                if !self.state.set_terminating() {
                    tracing::debug!("Termination state was already set");
                }
                Outcome::Terminated
            }
            () = self.cancel.cancelled() => {
                tracing::debug!("Shutdown hook cancelled");
                Outcome::Cancelled
            }
        }
    }
}

/// Resolves on the first SIGINT (Ctrl+C) or SIGTERM.
///
/// # Errors
///
/// Returns an error if a signal handler cannot be installed. Handlers are
/// installed eagerly so failures surface at startup.
pub fn os_signal() -> std::io::Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    Ok(async move {
        #[cfg(unix)]
        let terminate = async {
            terminate.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            () = ctrl_c => {
                tracing::info!("Received Ctrl+C signal");
            },
            () = terminate => {
                tracing::info!("Received SIGTERM signal");
            },
        }
    })
}
