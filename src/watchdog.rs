use std::future::Future;
use std::time::Duration;

/// Outcome of running a future under a [`Watchdog`] deadline
#[derive(Debug)]
pub enum WatchdogOutcome<T> {
    Completed(T),
    Expired,
}

/// Deadline-based canceller for a running external process.
///
/// A watchdog with `timeout <= 0` is a no-op: unbounded execution
/// permitted by explicit request.
pub struct Watchdog {
    timeout: Option<Duration>,
}

impl Watchdog {
    pub fn new(timeout_secs: i64) -> Self {
        let timeout = if timeout_secs > 0 {
            Some(Duration::from_secs(timeout_secs as u64))
        } else {
            None
        };
        Self { timeout }
    }

    pub fn is_armed(&self) -> bool {
        self.timeout.is_some()
    }

    /// Run `work` to completion or until the deadline elapses.
    ///
    /// On expiry the callback fires before the caller observes
    /// `Expired`, so a timeout notice lands in the log ahead of the
    /// process-exit wait unblocking.
    pub async fn guard<F, T>(&self, work: F, on_expiry: impl FnOnce()) -> WatchdogOutcome<T>
    where
        F: Future<Output = T>,
    {
        match self.timeout {
            None => WatchdogOutcome::Completed(work.await),
            Some(limit) => {
                tokio::select! {
                    out = work => WatchdogOutcome::Completed(out),
                    _ = tokio::time::sleep(limit) => {
                        on_expiry();
                        WatchdogOutcome::Expired
                    }
                }
            }
        }
    }
}
