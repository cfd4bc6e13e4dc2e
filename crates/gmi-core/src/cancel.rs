use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A cooperative cancellation flag.
///
/// The discovery pass checks the token at coarse progress points (per ~100
/// MiB scanned, per task, per superblock) and aborts with
/// [`GmiError::Cancelled`] when it has been raised. Cloning the token shares
/// the underlying flag.
///
/// [`GmiError::Cancelled`]: crate::GmiError::Cancelled
#[derive(Debug, Default, Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a new, unraised token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Checks whether the token has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
