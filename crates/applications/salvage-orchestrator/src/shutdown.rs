//! Cooperative shutdown signalling
//!
//! A [`ShutdownTrigger`] fires once, every cloned [`ShutdownSignal`] observes
//! it. Nothing is aborted forcefully; holders check or await the signal at
//! their own suspension points.

use tokio::sync::watch;

/// Fires the shutdown signal
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Observes the shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger and signal
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    /// Fire the signal, later calls have no effect
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal connected to this trigger
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_, signal) = channel();
        signal
    }

    /// Whether shutdown has been requested
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested
    ///
    /// Never completes if the trigger is dropped without firing.
    pub async fn triggered(&mut self) {
        if self.rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_signal_fires_once_for_all_clones() {
        let (trigger, signal) = channel();
        let other = signal.clone();
        assert!(!signal.is_triggered());

        trigger.trigger();
        trigger.trigger();
        assert!(signal.is_triggered());
        assert!(other.is_triggered());
        assert!(trigger.signal().is_triggered());
    }

    #[test]
    fn test_triggered_waits_for_trigger() {
        let (trigger, mut signal) = channel();
        let mut wait = task::spawn(async move { signal.triggered().await });

        assert_pending!(wait.poll());
        trigger.trigger();
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
    }

    #[test]
    fn test_never_stays_pending() {
        let mut signal = ShutdownSignal::never();
        let mut wait = task::spawn(async move { signal.triggered().await });
        assert_pending!(wait.poll());
        assert!(!ShutdownSignal::never().is_triggered());
    }
}
