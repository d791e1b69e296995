//! Cross-thread handle used to let a secondary-thread `Connection` talk to
//! the main-thread `Connection` that owns the actual transport, without
//! either side holding a raw pointer into the other's memory once it may
//! have been torn down.
//!
//! Grounded on `util/commutex.h` (original_source): `Commutex`'s
//! `State::{Free, Locked, Broken}` tri-state, `compare_exchange_strong`
//! based `tryLock`, and the unlink-from-either-side lifecycle are carried
//! over closely. The original's `shared_ptr<Commutex>` plus raw
//! `Connection*` payload becomes an `Arc<CommLinkState<T>>` here: Rust's
//! ownership rules already guarantee the payload behind a still-locked
//! link outlives the lock, so the only thing left for the atomic state
//! machine to arbitrate is *whether* a peer may currently look at it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

const FREE: u8 = 0;
const LOCKED: u8 = 1;
const BROKEN: u8 = 2;

/// Outcome of a non-blocking lock attempt, mirroring `Commutex::TryLockResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockResult {
    /// Locked by the other side right now; try again later.
    TransientFailure,
    /// The link has been unlinked for good; stop trying.
    PermanentFailure,
    Success,
}

struct Inner<T> {
    state: AtomicU8,
    payload: Mutex<Option<T>>,
}

/// The shared link between two `CommLinkPeer<T>` handles.
pub struct CommLink<T> {
    inner: Arc<Inner<T>>,
}

impl<T> CommLink<T> {
    /// Creates a connected pair of peers sharing one link, initially free.
    pub fn pair(payload: T) -> (CommLinkPeer<T>, CommLinkPeer<T>) {
        let inner = Arc::new(Inner {
            state: AtomicU8::new(FREE),
            payload: Mutex::new(Some(payload)),
        });
        (
            CommLinkPeer { inner: inner.clone() },
            CommLinkPeer { inner },
        )
    }
}

/// One side's handle to a `CommLink`. Move-only in spirit (no `Clone`):
/// exactly two peers ever exist for one link, mirroring `CommutexPeer`.
pub struct CommLinkPeer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> CommLinkPeer<T> {
    pub fn try_lock(&self) -> TryLockResult {
        match self
            .inner
            .state
            .compare_exchange(FREE, LOCKED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => TryLockResult::Success,
            Err(BROKEN) => TryLockResult::PermanentFailure,
            Err(_) => TryLockResult::TransientFailure,
        }
    }

    /// Spins briefly then blocks-via-yield until the link is either
    /// acquired or found broken. There is no OS-level condition variable
    /// here (as in the original) because lock hold times are expected to
    /// be microseconds: a handful of field reads/writes under the guard.
    pub fn lock(&self) -> TryLockResult {
        loop {
            match self.try_lock() {
                TryLockResult::TransientFailure => std::thread::yield_now(),
                other => return other,
            }
        }
    }

    /// Releases a lock acquired via `try_lock`/`lock`. Panics if the link
    /// was not locked, the same contract as `CommutexPeer::unlock`.
    pub fn unlock(&self) {
        match self.inner.state.compare_exchange(
            LOCKED,
            FREE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(BROKEN) => {}
            Err(_) => panic!("CommLinkPeer::unlock called while not locked"),
        }
    }

    /// Runs `f` with the shared payload while holding the lock, or
    /// returns `None` if the link is broken or contended.
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if self.try_lock() != TryLockResult::Success {
            return None;
        }
        let result = {
            let mut guard = self.inner.payload.lock().unwrap();
            guard.as_mut().map(f)
        };
        self.unlock();
        result
    }

    /// Permanently breaks the link from this side, taking the payload if
    /// it was still present. Once broken, the other peer's `try_lock`
    /// always returns `PermanentFailure`.
    pub fn unlink(&self) -> Option<T> {
        self.inner.state.store(BROKEN, Ordering::Release);
        self.inner.payload.lock().unwrap().take()
    }

    /// As `unlink`, but only succeeds if the link is currently locked by
    /// *this* side, mirroring `CommutexPeer::unlinkFromLocked` (used when
    /// tearing down from inside a completion callback that already holds
    /// the lock).
    pub fn unlink_from_locked(&self) -> Option<T> {
        match self.inner.state.compare_exchange(
            LOCKED,
            BROKEN,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => self.inner.payload.lock().unwrap().take(),
            Err(_) => None,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == BROKEN
    }
}

/// RAII guard returned by `CommLinkPeer::try_lock`-and-hold call sites
/// that want the lock released on every exit path, mirroring
/// `CommutexLocker`. `with_locked` covers the common case; this is for
/// call sites that need to hold the lock across more than one operation.
pub struct CommLinkLocker<'a, T> {
    peer: &'a CommLinkPeer<T>,
    held: bool,
}

impl<'a, T> CommLinkLocker<'a, T> {
    pub fn new(peer: &'a CommLinkPeer<T>) -> Option<CommLinkLocker<'a, T>> {
        match peer.try_lock() {
            TryLockResult::Success => Some(CommLinkLocker { peer, held: true }),
            _ => None,
        }
    }

    pub fn payload(&self) -> std::sync::MutexGuard<'_, Option<T>> {
        self.peer.inner.payload.lock().unwrap()
    }
}

impl<'a, T> Drop for CommLinkLocker<'a, T> {
    fn drop(&mut self) {
        if self.held {
            self.peer.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_round_trip() {
        let (a, b) = CommLink::pair(42i32);
        assert_eq!(a.try_lock(), TryLockResult::Success);
        assert_eq!(b.try_lock(), TryLockResult::TransientFailure);
        a.unlock();
        assert_eq!(b.try_lock(), TryLockResult::Success);
        b.unlock();
    }

    #[test]
    fn unlink_breaks_both_sides() {
        let (a, b) = CommLink::pair("payload".to_string());
        let taken = a.unlink();
        assert_eq!(taken.as_deref(), Some("payload"));
        assert_eq!(b.try_lock(), TryLockResult::PermanentFailure);
        assert!(b.is_broken());
    }

    #[test]
    fn with_locked_mutates_shared_payload() {
        let (a, b) = CommLink::pair(0i32);
        a.with_locked(|v| *v += 1);
        b.with_locked(|v| *v += 1);
        let result = a.with_locked(|v| *v);
        assert_eq!(result, Some(2));
    }

    #[test]
    fn unlink_from_locked_requires_holding_lock() {
        let (a, b) = CommLink::pair(1i32);
        assert!(a.unlink_from_locked().is_none());
        a.try_lock();
        assert!(a.unlink_from_locked().is_some());
        assert!(b.is_broken());
    }
}
