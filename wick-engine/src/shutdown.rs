//! Cooperative shutdown signalling between the supervisor and workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::info;

/// A latching stop flag that tasks can await.
///
/// Every clone observes the same flag. Triggering is idempotent and
/// permanent; there is no reset.
#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A signal wired to Ctrl-C, for the process-level shutdown. Per-bot
    /// signals use [`ShutdownSignal::new`] so one bot stopping never
    /// touches the others.
    #[must_use]
    pub fn listening_to_ctrl_c() -> Self {
        let signal = Self::new();
        let ctrl_c = signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, shutting down");
                ctrl_c.trigger();
            }
        });
        signal
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Complete once the signal has been triggered. Safe to race with
    /// [`ShutdownSignal::trigger`]: the waiter registers before the flag
    /// is checked, so a trigger between the two still wakes it.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.triggered() {
            return;
        }
        notified.await;
    }

    /// Sleep for `duration`, waking early on shutdown. Returns `true`
    /// when the full duration elapsed undisturbed, which makes periodic
    /// loops read as `while shutdown.sleep(interval).await { .. }`.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.triggered() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => !self.triggered(),
            () = self.wait() => false,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
