use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Process-wide cancellation shared by the session, the stdio copy tasks and
/// the signal listeners.
///
/// Triggered by a locally fatal signal or by the entry point. Every holder
/// can either poll [`is_shutting_down`](Self::is_shutting_down) or `select!`
/// on [`cancelled`](Self::cancelled):
///
/// ```ignore
/// tokio::select! {
///     _ = shutdown.cancelled() => return Outcome::Cancelled,
///     chunk = source.next_chunk() => { /* copy */ }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown. Returns `false` if it was already triggered.
    pub fn trigger(&self, reason: &str) -> bool {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!(%reason, "shutdown triggered");
            let _ = self.trigger.send(());
            true
        } else {
            debug!(%reason, "shutdown already triggered");
            false
        }
    }

    /// Resolves once shutdown has been triggered, including when that
    /// happened before this call.
    pub async fn cancelled(&self) {
        let mut rx = self.trigger.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
