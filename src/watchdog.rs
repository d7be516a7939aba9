//! A process wide deadline guarding each poll cycle.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// Cloneable handle to the single armed deadline.
///
/// Every clone observes the same deadline, so the cycle can be raced against
/// [`Watchdog::expired`] while it is armed and disarmed elsewhere.
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    deadline: watch::Sender<Option<Instant>>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        let (deadline, _) = watch::channel(None);
        Self { timeout, deadline }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm for `timeout` from now, replacing any earlier deadline.
    pub fn arm(&self) -> Instant {
        let deadline = Instant::now() + self.timeout;
        self.deadline.send_replace(Some(deadline));
        deadline
    }

    pub fn disarm(&self) {
        self.deadline.send_replace(None);
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }

    /// Resolves once an armed deadline passes without being disarmed or re-armed.
    /// Pending for as long as the watchdog stays disarmed.
    pub async fn expired(&self) {
        let mut rx = self.deadline.subscribe();
        loop {
            let armed = *rx.borrow_and_update();
            match armed {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => return,
                        _ = rx.changed() => {}
                    }
                }
                None => {
                    // The sender lives in `self`, so this never errors while we wait
                    let _ = rx.changed().await;
                }
            }
        }
    }
}

/// What to do with the device once the watchdog has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Idle for this long before polling resumes
    Sleep(Duration),
    /// Exit with this status and leave the restart to the service manager
    Exit(i32),
}

impl RecoveryAction {
    pub async fn apply(self) {
        match self {
            RecoveryAction::Sleep(duration) => {
                log::error!("Watchdog fired, sleeping for {duration:?}");
                tokio::time::sleep(duration).await;
            }
            RecoveryAction::Exit(code) => {
                log::error!("Watchdog fired, exiting with status {code}");
                std::process::exit(code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_timeout() {
        let watchdog = Watchdog::new(Duration::from_secs(20));
        let started = Instant::now();
        watchdog.arm();

        watchdog.expired().await;

        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_never_fires() {
        let watchdog = Watchdog::new(Duration::from_secs(1));
        watchdog.arm();
        watchdog.disarm();

        let fired = tokio::time::timeout(Duration::from_secs(60), watchdog.expired()).await;

        assert!(fired.is_err());
        assert_eq!(watchdog.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_moves_deadline() {
        let watchdog = Watchdog::new(Duration::from_secs(10));
        let started = Instant::now();
        watchdog.arm();

        let rearm = watchdog.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            rearm.arm();
        });
        watchdog.expired().await;

        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_recovery() {
        let started = Instant::now();
        RecoveryAction::Sleep(Duration::from_secs(60)).apply().await;
        assert!(started.elapsed() >= Duration::from_secs(60));
    }
}
