//! Thread identity checks for session threads.
//!
//! Each client runs two kinds of internal threads: a dispatcher thread that
//! runs user slots, and a poll thread that drives the engine. Blocking client
//! operations must not run on either of them (the thread would wait on work
//! only it can perform), so both threads tag themselves with a
//! [`ThreadRole`] for their owner while they run:
//!
//! ```
//! use wsbridge_core::thread_check::{enter_role, role_for, ThreadRole};
//!
//! let handle = std::thread::spawn(|| {
//!     let _role = enter_role(7, ThreadRole::Poller);
//!     assert_eq!(role_for(7), Some(ThreadRole::Poller));
//!     assert_eq!(role_for(8), None);
//! });
//! handle.join().unwrap();
//! assert_eq!(role_for(7), None);
//! ```
//!
//! [`ThreadAffinity`] records a single thread's identity, for objects that
//! need to know whether they are being called from a particular thread.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::thread::{Thread, ThreadId};

/// The job a session thread performs for its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    /// Delivers events to user slots.
    Dispatcher,
    /// Drives engine progress.
    Poller,
}

impl ThreadRole {
    /// Human-readable role name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dispatcher => "dispatcher",
            Self::Poller => "poll",
        }
    }
}

impl fmt::Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

thread_local! {
    static CURRENT_ROLE: Cell<Option<(u64, ThreadRole)>> = const { Cell::new(None) };
}

/// Restores the previous role of the current thread when dropped.
///
/// Not `Send`: the guard must be dropped on the thread that created it.
#[must_use = "the role is cleared as soon as the guard is dropped"]
pub struct RoleGuard {
    previous: Option<(u64, ThreadRole)>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RoleGuard {
    fn drop(&mut self) {
        CURRENT_ROLE.with(|role| role.set(self.previous));
    }
}

/// Tag the current thread as performing `role` for the owner with id `owner`.
pub fn enter_role(owner: u64, role: ThreadRole) -> RoleGuard {
    let previous = CURRENT_ROLE.with(|current| current.replace(Some((owner, role))));
    RoleGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// The owner id and role of the current thread, if it is a session thread.
#[inline]
pub fn current_role() -> Option<(u64, ThreadRole)> {
    CURRENT_ROLE.with(Cell::get)
}

/// The role the current thread performs for `owner`, if any.
#[inline]
pub fn role_for(owner: u64) -> Option<ThreadRole> {
    match current_role() {
        Some((id, role)) if id == owner => Some(role),
        _ => None,
    }
}

/// Thread affinity tracker.
///
/// Records one thread's identity and answers whether the caller is running
/// on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAffinity {
    thread_id: ThreadId,
}

impl Default for ThreadAffinity {
    fn default() -> Self {
        Self::current()
    }
}

impl ThreadAffinity {
    /// Create a thread affinity tracker for the current thread.
    #[inline]
    pub fn current() -> Self {
        Self {
            thread_id: std::thread::current().id(),
        }
    }

    /// Create a thread affinity tracker for `thread`, typically taken from a
    /// `JoinHandle` right after spawning.
    #[inline]
    pub fn of(thread: &Thread) -> Self {
        Self {
            thread_id: thread.id(),
        }
    }

    /// Get the thread ID this tracker is bound to.
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Check if the current thread matches the tracked thread.
    #[inline]
    pub fn is_same_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }
}
