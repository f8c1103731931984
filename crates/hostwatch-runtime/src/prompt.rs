//! Interactive retry prompt

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

/// Asked after a failed start whether to try again.
#[async_trait]
pub trait RetryPrompt: Send + Sync {
    /// Resolve `true` when the operator asks for a retry, `false` when no
    /// answer will ever come (input closed).
    async fn wait_for_retry(&self) -> bool;
}

/// Prompt answered by lines read from the console.
///
/// The console reader calls [`release`](Self::release) for every line and
/// [`close`](Self::close) at end of input.
#[derive(Debug, Default)]
pub struct ConsolePrompt {
    notify: Notify,
    closed: AtomicBool,
}

impl ConsolePrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer a pending prompt. Lines typed while nobody waits are dropped.
    pub fn release(&self) {
        self.notify.notify_waiters();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RetryPrompt for ConsolePrompt {
    async fn wait_for_retry(&self) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking `closed` so a concurrent close is not lost.
        notified.as_mut().enable();
        if self.is_closed() {
            return false;
        }
        notified.await;
        !self.is_closed()
    }
}
