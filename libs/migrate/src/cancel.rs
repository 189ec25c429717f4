//! Cooperative cancellation.
//!
//! Two process-wide flags stop a batch: `shutdown` (the controller is going
//! away) and `cancel` (abandon the current command). Both arrive as
//! `watch` channels so the reactor can poll them between iterations and also
//! wake from a blocking wait when either flips.

use std::fmt;

use tokio::sync::watch;

/// Why a batch was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The process is shutting down.
    Shutdown,
    /// The running command was cancelled.
    Command,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Shutdown => write!(f, "shutdown"),
            CancelReason::Command => write!(f, "command cancelled"),
        }
    }
}

/// Receiving side of the shutdown and cancel flags.
#[derive(Debug, Clone)]
pub struct Cancellation {
    shutdown: watch::Receiver<bool>,
    cancel: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new(shutdown: watch::Receiver<bool>, cancel: watch::Receiver<bool>) -> Self {
        Self { shutdown, cancel }
    }

    /// A cancellation that never fires.
    pub fn never() -> Self {
        let (_, shutdown) = watch::channel(false);
        let (_, cancel) = watch::channel(false);
        Self { shutdown, cancel }
    }

    /// Current state of the flags. Shutdown wins if both are set.
    pub fn reason(&self) -> Option<CancelReason> {
        if *self.shutdown.borrow() {
            Some(CancelReason::Shutdown)
        } else if *self.cancel.borrow() {
            Some(CancelReason::Command)
        } else {
            None
        }
    }

    /// Resolves once either flag is set. Pends forever if both senders are gone
    /// without setting a flag.
    pub async fn triggered(&mut self) -> CancelReason {
        loop {
            if let Some(reason) = self.reason() {
                return reason;
            }

            tokio::select! {
                Ok(()) = self.shutdown.changed() => {}
                Ok(()) = self.cancel.changed() => {}
                else => std::future::pending::<()>().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_reason_prefers_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancellation = Cancellation::new(shutdown_rx, cancel_rx);

        assert_eq!(cancellation.reason(), None);

        cancel_tx.send(true).unwrap();
        assert_eq!(cancellation.reason(), Some(CancelReason::Command));

        shutdown_tx.send(true).unwrap();
        assert_eq!(cancellation.reason(), Some(CancelReason::Shutdown));
    }

    #[tokio::test]
    async fn test_triggered_wakes_on_cancel() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut cancellation = Cancellation::new(shutdown_rx, cancel_rx);

        let waiter = tokio::spawn(async move { cancellation.triggered().await });
        tokio::task::yield_now().await;
        cancel_tx.send(true).unwrap();

        assert_eq!(waiter.await.unwrap(), CancelReason::Command);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_does_not_fire() {
        let mut cancellation = Cancellation::never();
        assert_eq!(cancellation.reason(), None);

        let fired = tokio::time::timeout(Duration::from_secs(60), cancellation.triggered()).await;
        assert!(fired.is_err());
    }
}
