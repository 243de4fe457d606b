//! One-shot cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A cloneable, idempotently-fired broadcast signal.
///
/// `fire` returns true only for the call that actually flipped the signal, so callers can
/// run one-time side effects (state transitions, queue aborts) without double-signalling.
#[derive(Clone, Default)]
pub struct CancelSignal {
    fired: Arc<AtomicBool>,
    token: CancellationToken,
}

impl CancelSignal {
    /// Create an unfired signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns true if this call fired it.
    pub fn fire(&self) -> bool {
        let first = self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.token.cancel();
        }
        first
    }

    /// Check if the signal has fired.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Wait until the signal fires.
    pub async fn fired(&self) {
        self.token.cancelled().await
    }

    /// Underlying token, for APIs that take one directly.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("fired", &self.is_fired())
            .finish()
    }
}
