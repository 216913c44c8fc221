//! Process-wide cancellation with a fatal-error latch

use crate::UpdateError;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Cancellation shared by every task of a pass
///
/// Cancelling is idempotent. [`fail`](Self::fail) additionally records the
/// first fatal error so the coordinator can report it after the pass unwinds.
#[derive(Debug, Default)]
pub struct Shutdown {
    token: CancellationToken,
    fatal: Mutex<Option<UpdateError>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the underlying token, for tasks that select on it
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested
    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// Latches a fatal error and cancels everything
    ///
    /// Only the first error is kept; later ones are logged and dropped.
    pub fn fail(&self, err: UpdateError) {
        {
            let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
            if fatal.is_none() {
                tracing::error!("Fatal: {}", err);
                *fatal = Some(err);
            } else {
                tracing::warn!("Additional fatal error after shutdown: {}", err);
            }
        }
        self.cancel();
    }

    /// Takes the latched fatal error, if any
    pub fn take_fatal(&self) -> Option<UpdateError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
