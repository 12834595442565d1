//! Cooperative stop signalling.

use tokio::sync::watch;

/// The owning half of a stop signal.
///
/// The orchestrator holds the signal; every session, acceptor, and connector
/// holds a [`StopToken`] and resolves pending work with
/// [`Error::ServiceStopped`](crate::Error::ServiceStopped) once the signal
/// fires. Firing is sticky: tokens created after the fact observe the signal
/// immediately.
#[derive(Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl StopSignal {
    /// Create an unfired signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        StopSignal { tx }
    }

    /// Derive a token observing this signal.
    pub fn token(&self) -> StopToken {
        StopToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn fired(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// An observer of a [`StopSignal`].
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    /// Whether the signal has fired.
    pub fn fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the signal fires.
    ///
    /// A dropped [`StopSignal`] counts as fired, so orphaned tasks still wind
    /// down.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fire_releases_waiters() {
        let signal = StopSignal::new();
        let token = signal.token();
        assert!(!token.fired());

        let waiter = tokio::spawn(async move { token.wait().await });
        signal.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should observe the signal")
            .unwrap();
    }

    #[tokio::test]
    async fn test_late_tokens_observe_fired_signal() {
        let signal = StopSignal::new();
        signal.fire();
        signal.fire();

        let token = signal.token();
        assert!(token.fired());
        token.wait().await;
    }

    #[tokio::test]
    async fn test_dropped_signal_counts_as_fired() {
        let signal = StopSignal::new();
        let token = signal.token();
        drop(signal);
        token.wait().await;
    }
}
