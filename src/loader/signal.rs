//! Cooperative cancellation.
//!
//! A [`StopHandle`] / [`StopSignal`] pair wraps a `watch` channel. Loaders
//! poll the signal between network calls and use [`StopSignal::sleep`] for
//! every wait, so a stop request wakes them immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{AppError, Result};

/// Outcome of an interruptible sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Stopped,
}

impl Wake {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Wake::Stopped)
    }
}

/// Sending half: requests a stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half: observed by loaders.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn channel() -> (StopHandle, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (StopHandle { tx: Arc::new(tx) }, StopSignal { rx })
    }

    /// A signal that never fires.
    pub fn never() -> StopSignal {
        Self::channel().1
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Interrupted)` once a stop was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_stopped() {
            Err(AppError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Resolve when a stop is requested; pends forever if the handle is gone.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless a stop arrives first.
    pub async fn sleep(&self, duration: Duration) -> Wake {
        if self.is_stopped() {
            return Wake::Stopped;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Wake::Elapsed,
            _ = self.stopped() => Wake::Stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_elapses() {
        let signal = StopSignal::never();
        assert_eq!(signal.sleep(Duration::from_millis(5)).await, Wake::Elapsed);
    }

    #[tokio::test]
    async fn test_stop_wakes_sleep() {
        let (handle, signal) = StopSignal::channel();
        let started = Instant::now();

        let sleeper = tokio::spawn(async move { signal.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();

        assert_eq!(sleeper.await.unwrap(), Wake::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_check_after_stop() {
        let (handle, signal) = StopSignal::channel();
        assert!(signal.check().is_ok());
        handle.stop();
        assert!(handle.is_stopped());
        assert!(matches!(signal.check(), Err(AppError::Interrupted)));
        assert!(handle.subscribe().is_stopped());
    }
}
