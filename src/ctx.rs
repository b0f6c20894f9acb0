use crate::{lockdep::{LockClass, LockTracker}, UnionError, UnionResult};

/// Who is asking. Used by the generic mode-bit check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn root() -> Credentials {
        Credentials { uid: 0, gid: 0, groups: vec![] }
    }
    pub fn user(uid: u32, gid: u32) -> Credentials {
        Credentials { uid, gid, groups: vec![] }
    }
    pub fn with_groups(mut self, groups: Vec<u32>) -> Credentials {
        self.groups = groups;
        self
    }
    pub fn is_root(&self) -> bool { self.uid == 0 }
    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Per-operation context.
///
/// Create one per filesystem call and pass it to everything that call does.
/// Clones share the lock-order tracker, so a clone belongs to the same
/// operation; two concurrent operations need two contexts.
#[derive(Clone, Debug)]
pub struct OpCtx {
    pub cred: Credentials,
    /// Fail with `WouldBlock` instead of waiting on a lock or calling into a
    /// host branch.
    pub nonblock: bool,
    pub(crate) lockdep: LockTracker,
}

impl OpCtx {
    pub fn new(cred: Credentials) -> OpCtx {
        OpCtx { cred, nonblock: false, lockdep: LockTracker::new() }
    }
    pub fn root() -> OpCtx {
        OpCtx::new(Credentials::root())
    }
    pub fn nonblocking(mut self) -> OpCtx {
        self.nonblock = true;
        self
    }
    /// Gate in front of every host adapter call.
    pub(crate) fn may_block(&self) -> UnionResult<()> {
        if self.nonblock { Err(UnionError::WouldBlock) } else { Ok(()) }
    }
    /// Lock classes this operation currently holds (debug builds only).
    pub fn held_locks(&self) -> Vec<LockClass> {
        self.lockdep.held()
    }
}
