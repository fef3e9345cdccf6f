//! Shared utilities: hashing, ID generation, time parsing, cancellation.

pub mod hash;
pub mod id;
pub mod time;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use hash::content_hash;
pub use id::{IdConfig, IdGenerator, IdResolver};

/// Cloneable cancellation token.
///
/// Long operations (lock-retry loops, export merges, import phases) poll
/// this between steps. Cancellation during an in-flight commit is not
/// guaranteed to abort; the database defines the commit boundary.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    flag: Arc<AtomicBool>,
}

impl Cancel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out if the token has been triggered.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
