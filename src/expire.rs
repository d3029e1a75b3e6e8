use crate::engine::{Envelope, InternalRequest};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Arms one-shot expiration timers that feed delete requests back into the
/// engine queue.
#[derive(Debug, Clone)]
pub struct ExpiryScheduler {
    tx: mpsc::Sender<Envelope>,
}

impl ExpiryScheduler {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        ExpiryScheduler { tx }
    }

    /// Schedule an expiry for `key` at `generation` after `after` has elapsed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&self, key: String, generation: u64, after: Duration) -> ExpiryTimer {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let expire = InternalRequest::Expire { key, generation };
                    // The engine only goes away at shutdown.
                    let _ = tx.send(Envelope::Internal(expire)).await;
                }
            }
        });

        ExpiryTimer { token }
    }
}

/// Handle to a pending expiration. Dropping it cancels the timer.
#[derive(Debug)]
pub struct ExpiryTimer {
    token: CancellationToken,
}

impl ExpiryTimer {
    /// Idempotent, and harmless after the timer has already fired.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
