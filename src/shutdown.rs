//! Cooperative shutdown signalling shared by every long-running task.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::info;

/// Tracks whether a shutdown has been requested, why, and how many
/// outstanding tasks still need to wind down before it is safe to exit.
///
/// Cloning shares the same underlying state; every clone observes the same
/// shutdown signal.
#[derive(Clone)]
pub struct ShutdownCondition {
    inner: Arc<Inner>,
}

struct Inner {
    triggered: AtomicBool,
    from_signal: AtomicBool,
    pending_tasks: AtomicUsize,
    notify: Notify,
}

impl ShutdownCondition {
    /// Creates a new, untriggered shutdown condition and spawns a task that
    /// triggers it when the process receives `SIGTERM`.
    pub fn new() -> Self {
        let condition = Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                from_signal: AtomicBool::new(false),
                pending_tasks: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        };
        condition.install_signal_handler();
        condition
    }

    #[cfg(unix)]
    fn install_signal_handler(&self) {
        let condition = self.clone();
        tokio::spawn(async move {
            if let Ok(mut term) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            {
                term.recv().await;
                info!("received SIGTERM, initiating shutdown");
                condition.initiate_shutdown_from_signal();
            }
        });
    }

    #[cfg(not(unix))]
    fn install_signal_handler(&self) {
        let condition = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                condition.initiate_shutdown_from_signal();
            }
        });
    }

    /// Idempotently requests shutdown. Safe to call from any number of
    /// tasks; only the first call has any effect.
    pub fn initiate_shutdown(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    fn initiate_shutdown_from_signal(&self) {
        self.inner.from_signal.store(true, Ordering::SeqCst);
        self.initiate_shutdown();
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Whether the shutdown, if any, was driven by a process signal rather
    /// than an explicit pub/sub `shutdown` command or task exhaustion.
    pub fn triggered_by_signal(&self) -> bool {
        self.inner.from_signal.load(Ordering::SeqCst)
    }

    /// Resolves once [`Self::initiate_shutdown`] has been called. Resolves
    /// immediately if shutdown was already triggered before this call.
    pub async fn wait(&self) {
        if self.is_triggered() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }

    /// Registers one more task that must finish before a natural
    /// (non-signal) shutdown is considered complete.
    pub fn track_pending_task(&self) {
        self.inner.pending_tasks.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks one tracked task as finished. When the last tracked task
    /// finishes, shutdown is triggered automatically.
    pub fn finished_task(&self) {
        let previous = self.inner.pending_tasks.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.initiate_shutdown();
        }
    }

    /// Number of tasks still tracked as pending.
    pub fn pending_task_count(&self) -> usize {
        self.inner.pending_tasks.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownCondition {
    fn default() -> Self {
        Self::new()
    }
}
