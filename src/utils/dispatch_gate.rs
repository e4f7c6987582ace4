use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// "New trade available" signal between discovery and the executor.
///
/// The executor runs a single dispatch loop around `wait()`; a `notify()`
/// that lands while a cycle is running is absorbed into the next
/// iteration rather than starting a concurrent cycle. `try_begin`/`end`
/// guard the cycle itself so a reentrant trigger is a provable no-op.
pub struct DispatchGate {
    notify: Notify,
    running: AtomicBool,
}

impl DispatchGate {
    pub fn new() -> Self {
        DispatchGate {
            notify: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Claims the single-flight slot. Returns false if a cycle is
    /// already in progress.
    pub fn try_begin(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Default for DispatchGate {
    fn default() -> Self {
        Self::new()
    }
}
