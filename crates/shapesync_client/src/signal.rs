//! Cancellation of shape streams.

use tokio_util::sync::CancellationToken;

/// A cloneable abort handle shared by a stream and its owner.
///
/// Aborting is permanent: once fired, every clone and child reports aborted.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    /// Creates a fresh, unfired signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal.
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Returns true once the signal (or a parent) has fired.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the signal fires.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }

    /// Creates a signal that fires with this one but can also be fired alone.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }
}
