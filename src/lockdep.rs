//! Lock classes and the per-operation ordering checker.
//!
//! Every lock this crate takes belongs to a [`LockClass`]. Within one
//! operation, locks must be acquired in non-decreasing class order:
//!
//! ```text
//! Rename           filesystem-wide rename serialization
//! Table            branch table (filesystem-wide, shared for operations)
//! NodeChild        logical node being operated on
//! NodeParent       its logical parent
//! NodeAncestor     grandparent and above (copy-up of the ancestor chain)
//! HostParent       host directory the new entry goes into
//! HostParent2      host directory of a copied-up ancestor / rename source
//! HostChild        host object being removed or renamed
//! HostChild2       host object a rename replaces
//! ```
//!
//! Logical locks always come before host locks, and a parent's host
//! directory before its ancestors' and children's. Nothing else in the crate
//! is allowed to nest locks, which is what keeps the two-branch protocols
//! free of lock inversions.
//!
//! In debug builds the tracker attached to each [`OpCtx`](crate::OpCtx)
//! records held classes and panics on an inversion. In release builds the
//! tracker is empty and the checks compile away.

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};
#[cfg(debug_assertions)]
use std::sync::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::{OpCtx, UnionError, UnionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockClass {
    Rename,
    Table,
    NodeChild,
    NodeParent,
    NodeAncestor,
    HostParent,
    HostParent2,
    HostChild,
    HostChild2,
}

impl LockClass {
    pub fn name(self) -> &'static str {
        match self {
            LockClass::Rename => "RENAME",
            LockClass::Table => "TABLE",
            LockClass::NodeChild => "NODE_CHILD",
            LockClass::NodeParent => "NODE_PARENT",
            LockClass::NodeAncestor => "NODE_ANCESTOR",
            LockClass::HostParent => "HOST_PARENT",
            LockClass::HostParent2 => "HOST_PARENT2",
            LockClass::HostChild => "HOST_CHILD",
            LockClass::HostChild2 => "HOST_CHILD2",
        }
    }
}

/// Classes held by one operation, in acquisition order.
#[derive(Clone, Debug, Default)]
pub struct LockTracker {
    #[cfg(debug_assertions)]
    held: Arc<Mutex<Vec<LockClass>>>,
}

impl LockTracker {
    pub fn new() -> LockTracker {
        LockTracker::default()
    }

    #[cfg(debug_assertions)]
    fn check_acquire(&self, class: LockClass) {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worst) = held.iter().copied().max() {
            if class < worst {
                // Drop the list lock before unwinding so the tracker stays
                // usable from destructors.
                drop(held);
                panic!(
                    "lock ordering violation: holding {} ({:?}), \
                     trying to acquire {} ({:?})",
                    worst.name(), worst, class.name(), class
                );
            }
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_acquire(&self, _class: LockClass) {}

    #[cfg(debug_assertions)]
    fn record_acquire(&self, class: LockClass) {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).push(class);
    }

    #[cfg(not(debug_assertions))]
    fn record_acquire(&self, _class: LockClass) {}

    #[cfg(debug_assertions)]
    fn record_release(&self, class: LockClass) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        // Pins release out of LIFO order (host lock, then lease, then the
        // logical lock), so remove the newest matching entry.
        if let Some(pos) = held.iter().rposition(|&c| c == class) {
            held.remove(pos);
        }
    }

    #[cfg(not(debug_assertions))]
    fn record_release(&self, _class: LockClass) {}

    /// Classes currently held. Always empty in release builds.
    pub fn held(&self) -> Vec<LockClass> {
        #[cfg(debug_assertions)]
        {
            self.held.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
        #[cfg(not(debug_assertions))]
        {
            Vec::new()
        }
    }
}

struct ClassToken {
    tracker: LockTracker,
    class: LockClass,
}

impl Drop for ClassToken {
    fn drop(&mut self) {
        self.tracker.record_release(self.class);
    }
}

/// A lock guard that is accounted for in its operation's tracker.
///
/// Fields drop in declaration order: the lock is released first, then the
/// tracker entry.
pub struct Tracked<G> {
    guard: G,
    token: ClassToken,
}

impl<G> Tracked<G> {
    fn new(guard: G, tracker: &LockTracker, class: LockClass) -> Tracked<G> {
        tracker.record_acquire(class);
        Tracked { guard, token: ClassToken { tracker: tracker.clone(), class } }
    }

    pub fn class(&self) -> LockClass {
        self.token.class
    }
}

impl<G: Deref> Deref for Tracked<G> {
    type Target = G::Target;
    fn deref(&self) -> &G::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for Tracked<G> {
    fn deref_mut(&mut self) -> &mut G::Target {
        &mut self.guard
    }
}

pub(crate) type ReadGuard<T> = Tracked<OwnedRwLockReadGuard<T>>;
pub(crate) type WriteGuard<T> = Tracked<OwnedRwLockWriteGuard<T>>;

/// Shared acquisition. Non-blocking contexts get `WouldBlock` instead of
/// waiting.
pub(crate) async fn read_owned<T>(lock: &Arc<RwLock<T>>, ctx: &OpCtx,
                                  class: LockClass)
    -> UnionResult<ReadGuard<T>> {
    ctx.lockdep.check_acquire(class);
    let guard = if ctx.nonblock {
        lock.clone().try_read_owned().map_err(|_| UnionError::WouldBlock)?
    }
    else {
        lock.clone().read_owned().await
    };
    Ok(Tracked::new(guard, &ctx.lockdep, class))
}

/// Exclusive acquisition. Non-blocking contexts get `WouldBlock` instead of
/// waiting.
pub(crate) async fn write_owned<T>(lock: &Arc<RwLock<T>>, ctx: &OpCtx,
                                   class: LockClass)
    -> UnionResult<WriteGuard<T>> {
    ctx.lockdep.check_acquire(class);
    let guard = if ctx.nonblock {
        lock.clone().try_write_owned().map_err(|_| UnionError::WouldBlock)?
    }
    else {
        lock.clone().write_owned().await
    };
    Ok(Tracked::new(guard, &ctx.lockdep, class))
}
