//! Diagnostic identifiers.
//!
//! Clients, sessions and their threads are tagged with small integers so log
//! output and thread names can be correlated. Ids come from an explicit
//! [`IdGenerator`]; the process-wide [`IdGenerator::shared`] instance is only a
//! default and can be replaced per client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// A thread-safe monotonic id source. The first id handed out is 1.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

static SHARED: OnceLock<Arc<IdGenerator>> = OnceLock::new();

impl IdGenerator {
    /// Create a generator whose first id is 1.
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a generator whose first id is `first`.
    pub const fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// The lazily created process-wide generator.
    pub fn shared() -> Arc<IdGenerator> {
        SHARED.get_or_init(|| Arc::new(IdGenerator::new())).clone()
    }

    /// Take the next id.
    #[inline]
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
