//! The per-branch host filesystem interface.
//!
//! The union never touches a branch's tree directly. Every branch-local step
//! goes through a [`HostFs`], which performs exactly one operation against
//! one branch and reports success or failure.

use crate::*;

use std::{
    fmt,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};
use async_trait::async_trait;
use bitflags::bitflags;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKind {
    Directory,
    Regular,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl HostKind {
    /// Device nodes, FIFOs and sockets. Writing to one of these never
    /// modifies the branch, so the writable-branch scan skips them.
    pub fn is_special(self) -> bool {
        matches!(self, HostKind::CharDevice | HostKind::BlockDevice
                 | HostKind::Fifo | HostKind::Socket)
    }
}

/// The part of a host object's metadata the union looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAttr {
    /// Permission bits only (`0o7777`).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl HostAttr {
    pub fn new(mode: u32, uid: u32, gid: u32) -> HostAttr {
        HostAttr { mode: mode & 0o7777, uid, gid }
    }
    pub fn dir() -> HostAttr { HostAttr::new(0o755, 0, 0) }
    pub fn file() -> HostAttr { HostAttr::new(0o644, 0, 0) }
}

struct HostInodeInner {
    ino: u64,
    kind: HostKind,
    attr: Mutex<HostAttr>,
    nlink: AtomicU32,
    immutable: AtomicBool,
    lock: Arc<RwLock<()>>,
}

/// A strong handle to one object on one branch.
///
/// Clones are cheap and refer to the same object. Two handles are the same
/// object exactly when [`same`](#method.same) says so; the inode number is
/// informational.
#[derive(Clone)]
pub struct HostInode {
    inner: Arc<HostInodeInner>,
}

impl HostInode {
    pub fn new(ino: u64, kind: HostKind, attr: HostAttr) -> HostInode {
        let nlink = if kind == HostKind::Directory { 2 } else { 1 };
        HostInode { inner: Arc::new(HostInodeInner {
            ino, kind,
            attr: Mutex::new(attr),
            nlink: AtomicU32::new(nlink),
            immutable: AtomicBool::new(false),
            lock: Arc::new(RwLock::new(())),
        })}
    }
    pub fn ino(&self) -> u64 { self.inner.ino }
    pub fn kind(&self) -> HostKind { self.inner.kind }
    pub fn is_dir(&self) -> bool { self.inner.kind == HostKind::Directory }
    pub fn attr(&self) -> HostAttr {
        *self.inner.attr.lock().unwrap_or_else(|e| e.into_inner())
    }
    pub fn set_attr(&self, attr: HostAttr) {
        *self.inner.attr.lock().unwrap_or_else(|e| e.into_inner()) = attr;
    }
    pub fn nlink(&self) -> u32 { self.inner.nlink.load(Ordering::Acquire) }
    pub fn set_nlink(&self, nlink: u32) {
        self.inner.nlink.store(nlink, Ordering::Release)
    }
    pub fn inc_nlink(&self) {
        self.inner.nlink.fetch_add(1, Ordering::AcqRel);
    }
    pub fn drop_nlink(&self) {
        let _ = self.inner.nlink.fetch_update(Ordering::AcqRel,
                                              Ordering::Acquire,
                                              |n| n.checked_sub(1));
    }
    pub fn is_immutable(&self) -> bool {
        self.inner.immutable.load(Ordering::Acquire)
    }
    pub fn set_immutable(&self, immutable: bool) {
        self.inner.immutable.store(immutable, Ordering::Release)
    }
    /// Identity comparison.
    pub fn same(&self, other: &HostInode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
    /// Number of live handles to this object, including this one.
    pub fn ref_count(&self) -> usize { Arc::strong_count(&self.inner) }
    /// True while anybody holds this object's host lock in either mode.
    pub fn is_locked(&self) -> bool { self.inner.lock.try_write().is_err() }
    /// Only the pin module takes this lock; see `lockdep`.
    pub(crate) fn host_lock(&self) -> &Arc<RwLock<()>> { &self.inner.lock }
}

impl fmt::Debug for HostInode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "HostInode({} {:?} nlink={})", self.ino(), self.kind(),
               self.nlink())
    }
}

bitflags! {
    /// Requested access, as in `access(2)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessMask: u32 {
        const EXEC = 0o1;
        const WRITE = 0o2;
        const READ = 0o4;
        const APPEND = 0o10;
    }
}

impl AccessMask {
    pub fn wants_write(self) -> bool {
        self.intersects(AccessMask::WRITE | AccessMask::APPEND)
    }
    pub fn wants_exec(self) -> bool { self.contains(AccessMask::EXEC) }
}

/// One branch's native filesystem.
///
/// Directory-relative calls take the parent directory's handle. The union
/// holds that directory's host lock (exclusively for mutations, shared for
/// lookups) for the duration of the call, so implementations don't need to
/// serialize against the union themselves.
#[async_trait]
pub trait HostFs: Send + Sync {
    /// The branch's root directory. Always the same object.
    fn root(&self) -> HostInode;
    /// Looks up `name` in `dir`. Not found is `Ok(None)`, not an error.
    async fn lookup(&self, dir: &HostInode, name: &Name)
        -> io::Result<Option<HostInode>>;
    async fn create(&self, dir: &HostInode, name: &Name, attr: HostAttr)
        -> io::Result<HostInode>;
    async fn mkdir(&self, dir: &HostInode, name: &Name, attr: HostAttr)
        -> io::Result<HostInode>;
    async fn symlink(&self, dir: &HostInode, name: &Name, target: &str)
        -> io::Result<HostInode>;
    /// Makes a new name for `src` in `dir`. Returns the (same) object.
    async fn link(&self, src: &HostInode, dir: &HostInode, name: &Name)
        -> io::Result<HostInode>;
    async fn unlink(&self, dir: &HostInode, name: &Name, victim: &HostInode)
        -> io::Result<()>;
    async fn rmdir(&self, dir: &HostInode, name: &Name, victim: &HostInode)
        -> io::Result<()>;
    async fn rename(&self, src_dir: &HostInode, src_name: &Name,
                    dst_dir: &HostInode, dst_name: &Name) -> io::Result<()>;
    /// The branch's own permission check. `None` means the branch has none
    /// and the generic mode-bit check applies.
    ///
    /// Called with locks held and possibly from a non-blocking context, so
    /// this must not wait.
    fn permission(&self, _inode: &HostInode, _mask: AccessMask,
                  _cred: &Credentials) -> Option<io::Result<()>> {
        None
    }
    /// Whether the branch is mounted without exec permission.
    fn is_noexec(&self) -> bool { false }
    /// Takes a write lease on the branch's mount. Fails if the mount is
    /// read-only. Every successful call is balanced by one `drop_write`.
    fn want_write(&self) -> io::Result<()>;
    fn drop_write(&self);
    /// Bytes available for new entries. `Unsupported` if unknown.
    async fn free_space(&self) -> io::Result<u64>;
}

#[cfg(test)]
mod test {
    use super::*;
    #[test] fn identity_is_by_handle() {
        let a = HostInode::new(5, HostKind::Regular, HostAttr::file());
        let b = HostInode::new(5, HostKind::Regular, HostAttr::file());
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
        assert_eq!(a.ref_count(), 1);
    }
    #[test] fn nlink_never_wraps() {
        let a = HostInode::new(1, HostKind::Regular, HostAttr::file());
        a.drop_nlink();
        a.drop_nlink();
        assert_eq!(a.nlink(), 0);
        let d = HostInode::new(2, HostKind::Directory, HostAttr::dir());
        assert_eq!(d.nlink(), 2);
    }
    #[test] fn write_class_masks() {
        assert!(AccessMask::APPEND.wants_write());
        assert!((AccessMask::READ | AccessMask::WRITE).wants_write());
        assert!(!(AccessMask::READ | AccessMask::EXEC).wants_write());
    }
}
