//! Pinning: holding a logical node's parent directory on one branch.
//!
//! A [`Pin`] is what every mutating operation holds while it calls into a
//! host branch. Acquiring one takes, in order:
//!
//! 1. the logical parent's lock (shared), unless the caller already holds it,
//! 2. a mount write lease on the branch, if asked for,
//! 3. the parent's host directory lock (exclusive), in the caller's class,
//!
//! and then checks that what it locked is still what the node thinks it is.
//! Any failure along the way gives back everything taken so far. Releasing
//! goes the other way: host lock, lease, logical lock.

use crate::*;
use crate::branch::WriteLease;
use crate::lockdep::{self, LockClass, ReadGuard, WriteGuard};

use std::{fmt, sync::Arc};

/// Shared lock on a host object, for lookups.
pub(crate) async fn lock_host_shared(inode: &HostInode, ctx: &OpCtx,
                                     class: LockClass)
    -> UnionResult<ReadGuard<()>> {
    lockdep::read_owned(inode.host_lock(), ctx, class).await
}

/// Exclusive lock on a host object, for anything that changes it.
pub(crate) async fn lock_host_exclusive(inode: &HostInode, ctx: &OpCtx,
                                        class: LockClass)
    -> UnionResult<WriteGuard<()>> {
    lockdep::write_owned(inode.host_lock(), ctx, class).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinOptions {
    /// Take a mount write lease on the branch.
    pub want_write: bool,
    /// Class of the host directory lock.
    pub class: LockClass,
    pub udba: Udba,
}

impl Default for PinOptions {
    fn default() -> PinOptions {
        PinOptions { want_write: true, class: LockClass::HostParent,
                     udba: Udba::None }
    }
}

impl PinOptions {
    pub fn new(class: LockClass) -> PinOptions {
        PinOptions { class, ..PinOptions::default() }
    }
    pub fn with_write(mut self, want_write: bool) -> PinOptions {
        self.want_write = want_write;
        self
    }
    pub fn with_udba(mut self, udba: Udba) -> PinOptions {
        self.udba = udba;
        self
    }
}

/// Whether [`Pin::acquire`] should lock the logical parent itself.
#[derive(Clone, Copy)]
pub enum ParentLock<'a> {
    Acquire,
    /// The caller holds the parent's lock (either mode) and this is what it
    /// sees through it.
    HeldByCaller(&'a NodeInfo),
}

/// A pinned parent directory. See the module docs.
pub struct Pin {
    // Release order.
    hdir: Option<WriteGuard<()>>,
    lease: Option<WriteLease>,
    parent_guard: Option<ReadGuard<NodeInfo>>,
    table_guard: Option<ReadGuard<BranchTable>>,
    h_parent: Option<HostInode>,
    h_child: Option<HostInode>,
    branch: Arc<Branch>,
    bindex: usize,
    name: Option<NameBuf>,
    opts: PinOptions,
    ctx: OpCtx,
}

impl Pin {
    /// Pins `node`'s parent on branch `bindex`.
    ///
    /// `h_child` is the host object the caller expects to find under the
    /// node's name there, `None` for a name about to be made. The caller
    /// must hold the branch table for at least as long as the pin lives.
    pub async fn acquire(ctx: &OpCtx, table: &BranchTable, node: &UnionNode,
                         h_child: Option<HostInode>, bindex: usize,
                         opts: PinOptions, parent_lock: ParentLock<'_>)
        -> UnionResult<Pin> {
        let branch = table.get(bindex)?.clone();
        let parent = match node.parent() {
            Some(x) => x,
            None => {
                // The root has no parent: all there is to hold is the lease.
                let lease = if opts.want_write {
                    ctx.may_block()?;
                    Some(branch.want_write()?)
                } else { None };
                return Ok(Pin {
                    hdir: None, lease, parent_guard: None, table_guard: None,
                    h_parent: None, h_child, branch, bindex, name: None,
                    opts, ctx: ctx.clone(),
                })
            },
        };
        let mut parent_guard = None;
        let info: &NodeInfo = match parent_lock {
            ParentLock::HeldByCaller(x) => x,
            ParentLock::Acquire => &**parent_guard.insert(
                parent.read_info(ctx, LockClass::NodeParent).await?),
        };
        if info.generation() != table.generation() {
            log::debug!("pin {:?}: parent is from generation {}, table is \
                         at {}", node, info.generation(), table.generation());
            return Err(UnionError::Busy)
        }
        let h_parent = match info.entry(bindex) {
            Some(x) if x.is_dir() => x.clone(),
            _ => {
                log::debug!("pin {:?}: parent has no directory on branch {}",
                            node, bindex);
                return Err(UnionError::Busy)
            },
        };
        let lease = if opts.want_write {
            ctx.may_block()?;
            Some(branch.want_write()?)
        } else { None };
        let hdir = lock_host_exclusive(&h_parent, ctx, opts.class).await?;
        let still_ours = info.generation() == table.generation()
            && info.entry(bindex).map(|x| x.same(&h_parent)).unwrap_or(false);
        if !still_ours || h_parent.nlink() == 0 {
            log::debug!("pin {:?}: branch {} parent went away while locking",
                        node, bindex);
            return Err(UnionError::Busy)
        }
        let name = node.name().map(ToOwned::to_owned);
        if opts.udba == Udba::Reval {
            verify_child(ctx, &branch, &h_parent, name.as_deref(),
                         h_child.as_ref()).await?;
        }
        Ok(Pin {
            hdir: Some(hdir), lease, parent_guard, table_guard: None,
            h_parent: Some(h_parent), h_child, branch, bindex, name, opts,
            ctx: ctx.clone(),
        })
    }

    /// Hands a branch table guard to the pin, to be dropped after
    /// everything else it holds.
    pub(crate) fn hold_table(&mut self, guard: ReadGuard<BranchTable>) {
        self.table_guard = Some(guard);
    }

    /// Releases everything. Same as dropping the pin.
    pub fn release(mut self) {
        self.unpin();
    }

    fn unpin(&mut self) {
        self.hdir = None;
        self.lease = None;
        self.parent_guard = None;
        self.table_guard = None;
    }

    /// Drops only the host directory lock. Lease and logical lock stay.
    pub fn unlock(&mut self) {
        self.hdir = None;
    }

    /// Takes the host directory lock again after [`unlock`](Self::unlock),
    /// and fails with `Busy` if the parent or the child was removed in the
    /// meantime.
    pub async fn relock(&mut self) -> UnionResult<()> {
        let h_parent = match &self.h_parent {
            Some(x) => x.clone(),
            None => return Ok(()),
        };
        self.hdir = None;
        let hdir = lock_host_exclusive(&h_parent, &self.ctx, self.opts.class)
            .await?;
        let child_gone = self.h_child.as_ref().map(|x| x.nlink() == 0)
            .unwrap_or(false);
        if h_parent.nlink() == 0 || child_gone {
            log::debug!("relock on branch {}: {} removed", self.bindex,
                        if child_gone { "child" } else { "parent" });
            return Err(UnionError::Busy)
        }
        if self.opts.udba == Udba::Reval {
            verify_child(&self.ctx, &self.branch, &h_parent,
                         self.name.as_deref(), self.h_child.as_ref()).await?;
        }
        self.hdir = Some(hdir);
        Ok(())
    }

    /// The locked host directory. `None` when pinning the root.
    pub fn h_parent(&self) -> Option<&HostInode> { self.h_parent.as_ref() }
    pub fn h_child(&self) -> Option<&HostInode> { self.h_child.as_ref() }
    pub fn branch(&self) -> &Arc<Branch> { &self.branch }
    pub fn bindex(&self) -> usize { self.bindex }
    pub fn is_locked(&self) -> bool { self.hdir.is_some() }
    pub fn has_lease(&self) -> bool { self.lease.is_some() }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.unpin();
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Pin")
            .field("bindex", &self.bindex)
            .field("h_parent", &self.h_parent)
            .field("h_child", &self.h_child)
            .field("locked", &self.hdir.is_some())
            .field("lease", &self.lease.is_some())
            .finish()
    }
}

/// Looks the child up again under the locked parent and compares.
async fn verify_child(ctx: &OpCtx, branch: &Branch, h_parent: &HostInode,
                      name: Option<&Name>, h_child: Option<&HostInode>)
    -> UnionResult<()> {
    let name = match name {
        Some(x) => x,
        None => return Ok(()),
    };
    ctx.may_block()?;
    let found = branch.host().lookup(h_parent, name).await?;
    match (found.as_ref(), h_child) {
        (None, None) => Ok(()),
        (Some(a), Some(b)) if a.same(b) => Ok(()),
        (found, expected) => {
            log::debug!("udba: {:?} is {:?} on the host, expected {:?}",
                        name, found, expected);
            Err(UnionError::Busy)
        },
    }
}

#[cfg(all(test, feature = "mem"))]
mod test {
    use super::*;
    use std::io::ErrorKind;

    struct Fixture {
        hosts: Vec<Arc<MemHost>>,
        table: BranchTable,
        root: Arc<UnionNode>,
        dir: Arc<UnionNode>,
        file: Arc<UnionNode>,
    }

    /// `/d/f` on branch 0, `/d/` on branch 1, both writable.
    fn fixture() -> Fixture {
        let hosts = vec![Arc::new(MemHost::from_listing(&["/d/f"])),
                         Arc::new(MemHost::from_listing(&["/d/"]))];
        let table = BranchTable::new(hosts.iter().map(|h| {
            Arc::new(Branch::new(h.clone(), BranchPerm::ReadWrite))
        }).collect());
        let gen = table.generation();
        let mut root_info = NodeInfo::new(gen);
        let mut dir_info = NodeInfo::new(gen);
        for (b, host) in hosts.iter().enumerate() {
            root_info.set_entry(b, host.root());
            dir_info.set_entry(b, host.find("/d").unwrap());
        }
        let mut file_info = NodeInfo::new(gen);
        file_info.set_entry(0, hosts[0].find("/d/f").unwrap());
        let root = UnionNode::new_root(1, root_info);
        let dir = UnionNode::new_child(2, &root, n!("d"), dir_info);
        let file = UnionNode::new_child(3, &dir, n!("f"), file_info);
        Fixture { hosts, table, root, dir, file }
    }

    impl Fixture {
        fn h_dir(&self, b: usize) -> HostInode {
            self.hosts[b].find("/d").unwrap()
        }
        fn h_file(&self) -> Option<HostInode> {
            self.hosts[0].find("/d/f")
        }
        /// Nothing held anywhere.
        fn assert_balanced(&self, ctx: &OpCtx, refs: &[usize]) {
            for (b, host) in self.hosts.iter().enumerate() {
                assert_eq!(host.active_writers(), 0, "lease on branch {}", b);
                let h = self.h_dir(b);
                assert!(!h.is_locked(), "host lock on branch {}", b);
                // `h` itself is one more reference.
                assert_eq!(h.ref_count() - 1, refs[b],
                           "references on branch {}", b);
            }
            assert!(!self.dir.info_is_locked());
            assert!(ctx.held_locks().is_empty());
        }
        fn refs(&self) -> Vec<usize> {
            (0..self.hosts.len()).map(|b| self.h_dir(b).ref_count() - 1)
                .collect()
        }
    }

    #[tokio::test]
    async fn pin_and_release() {
        let fx = fixture();
        let refs = fx.refs();
        let ctx = OpCtx::root();
        let pin = Pin::acquire(&ctx, &fx.table, &fx.file, fx.h_file(), 0,
                               PinOptions::default(), ParentLock::Acquire)
            .await.unwrap();
        assert!(pin.h_parent().unwrap().same(&fx.h_dir(0)));
        assert!(pin.is_locked());
        assert!(pin.has_lease());
        assert_eq!(fx.hosts[0].active_writers(), 1);
        assert!(fx.h_dir(0).is_locked());
        assert!(fx.dir.info_is_locked());
        if cfg!(debug_assertions) {
            assert_eq!(ctx.held_locks(),
                       vec![LockClass::NodeParent, LockClass::HostParent]);
        }
        pin.release();
        fx.assert_balanced(&ctx, &refs);
    }

    #[tokio::test]
    async fn dropping_a_pin_releases_it() {
        let fx = fixture();
        let refs = fx.refs();
        let ctx = OpCtx::root();
        {
            let _pin = Pin::acquire(&ctx, &fx.table, &fx.file, fx.h_file(), 0,
                                    PinOptions::new(LockClass::HostParent2),
                                    ParentLock::Acquire).await.unwrap();
        }
        fx.assert_balanced(&ctx, &refs);
    }

    #[tokio::test]
    async fn root_pin_is_only_a_lease() {
        let fx = fixture();
        let ctx = OpCtx::root();
        let pin = Pin::acquire(&ctx, &fx.table, &fx.root, None, 1,
                               PinOptions::default(), ParentLock::Acquire)
            .await.unwrap();
        assert!(pin.h_parent().is_none());
        assert!(!pin.is_locked());
        assert_eq!(fx.hosts[1].active_writers(), 1);
        drop(pin);
        assert_eq!(fx.hosts[1].active_writers(), 0);
    }

    #[tokio::test]
    async fn caller_held_parent_is_left_alone() {
        let fx = fixture();
        let refs = fx.refs();
        let ctx = OpCtx::root();
        let held = fx.dir.write_info(&ctx, LockClass::NodeParent).await
            .unwrap();
        let pin = Pin::acquire(&ctx, &fx.table, &fx.file, None, 1,
                               PinOptions::default(),
                               ParentLock::HeldByCaller(&held)).await.unwrap();
        assert!(pin.h_parent().unwrap().same(&fx.h_dir(1)));
        pin.release();
        // Still ours.
        assert!(fx.dir.info_is_locked());
        assert_eq!(held.top(), Some(0));
        drop(held);
        fx.assert_balanced(&ctx, &refs);
    }

    async fn expect_failure(fx: &Fixture, ctx: &OpCtx, node: &UnionNode,
                            h_child: Option<HostInode>, bindex: usize,
                            opts: PinOptions) -> UnionError {
        let refs = fx.refs();
        let err = Pin::acquire(ctx, &fx.table, node, h_child, bindex, opts,
                               ParentLock::Acquire).await.unwrap_err();
        fx.assert_balanced(ctx, &refs);
        err
    }

    #[tokio::test]
    async fn every_failure_unwinds() {
        let fx = fixture();
        let ctx = OpCtx::root();
        let reval = PinOptions::default().with_udba(Udba::Reval);

        // Parent has no entry on the branch.
        let info = {
            let mut info = NodeInfo::new(fx.table.generation());
            info.set_entry(0, fx.h_dir(0));
            info
        };
        let lonely = UnionNode::new_child(10, &fx.dir, n!("x"), NodeInfo::new(1));
        let lone_dir = UnionNode::new_child(11, &fx.root, n!("d"), info);
        let under_lone = UnionNode::new_child(12, &lone_dir, n!("f"),
                                              NodeInfo::new(1));
        let refs = fx.refs();
        assert!(matches!(Pin::acquire(&ctx, &fx.table, &under_lone, None, 1,
                                      PinOptions::default(),
                                      ParentLock::Acquire).await,
                         Err(UnionError::Busy)));
        fx.assert_balanced(&ctx, &refs);
        drop(under_lone);

        // Parent from an older branch table.
        let stale = UnionNode::new_child(13, &fx.root, n!("d"),
                                         NodeInfo::new(0));
        let under_stale = UnionNode::new_child(14, &stale, n!("f"),
                                               NodeInfo::new(1));
        assert!(matches!(Pin::acquire(&ctx, &fx.table, &under_stale, None, 0,
                                      PinOptions::default(),
                                      ParentLock::Acquire).await,
                         Err(UnionError::Busy)));
        assert!(ctx.held_locks().is_empty());

        // Lease refused by the host.
        fx.hosts[0].inject(FaultRule::once(MemOp::WantWrite,
                                           ErrorKind::StorageFull));
        match expect_failure(&fx, &ctx, &fx.file, fx.h_file(), 0,
                             PinOptions::default()).await {
            UnionError::Host(e) => assert_eq!(e.kind(), ErrorKind::StorageFull),
            x => panic!("unexpected {:?}", x),
        }
        fx.hosts[1].set_read_only(true);
        match expect_failure(&fx, &ctx, &lonely, None, 1,
                             PinOptions::default()).await {
            UnionError::Host(e) =>
                assert_eq!(e.kind(), ErrorKind::ReadOnlyFilesystem),
            x => panic!("unexpected {:?}", x),
        }
        fx.hosts[1].set_read_only(false);

        // Revalidation lookup fails.
        fx.hosts[0].inject(FaultRule::once(MemOp::Lookup, ErrorKind::Other));
        assert!(matches!(expect_failure(&fx, &ctx, &fx.file, fx.h_file(), 0,
                                        reval).await,
                         UnionError::Host(_)));

        // Child is not what we cached: a name we thought free exists...
        assert!(matches!(expect_failure(&fx, &ctx, &fx.file, None, 0,
                                        reval).await,
                         UnionError::Busy));
        // ...and one we thought existed does not.
        assert!(matches!(expect_failure(&fx, &ctx, &fx.file, fx.h_file(), 1,
                                        reval).await,
                         UnionError::Busy));
        // With the right expectations both succeed.
        Pin::acquire(&ctx, &fx.table, &fx.file, fx.h_file(), 0, reval,
                     ParentLock::Acquire).await.unwrap().release();
        Pin::acquire(&ctx, &fx.table, &fx.file, None, 1, reval,
                     ParentLock::Acquire).await.unwrap().release();
        let refs = fx.refs();
        fx.assert_balanced(&ctx, &refs);
    }

    #[tokio::test]
    async fn nonblocking_contention_unwinds() {
        let fx = fixture();
        let refs = fx.refs();
        let other = OpCtx::root();
        let ctx = OpCtx::root().nonblocking();

        // Logical parent held by someone else.
        let held = fx.dir.write_info(&other, LockClass::NodeParent).await
            .unwrap();
        assert!(matches!(Pin::acquire(&ctx, &fx.table, &fx.file, None, 1,
                                      PinOptions::default().with_write(false),
                                      ParentLock::Acquire).await,
                         Err(UnionError::WouldBlock)));
        drop(held);

        // Host directory held by someone else. The lease would block first.
        assert!(matches!(Pin::acquire(&ctx, &fx.table, &fx.file, None, 1,
                                      PinOptions::default(),
                                      ParentLock::Acquire).await,
                         Err(UnionError::WouldBlock)));
        let h = fx.h_dir(1);
        let held = lock_host_exclusive(&h, &other, LockClass::HostParent).await
            .unwrap();
        assert!(matches!(Pin::acquire(&ctx, &fx.table, &fx.file, None, 1,
                                      PinOptions::default().with_write(false),
                                      ParentLock::Acquire).await,
                         Err(UnionError::WouldBlock)));
        drop(held);
        drop(h);
        fx.assert_balanced(&ctx, &refs);
        fx.assert_balanced(&other, &refs);
    }

    #[tokio::test]
    async fn relock_notices_removal() {
        let fx = fixture();
        let refs = fx.refs();
        let ctx = OpCtx::root();
        let h_file = fx.h_file().unwrap();
        let mut pin = Pin::acquire(&ctx, &fx.table, &fx.file,
                                   Some(h_file.clone()), 0,
                                   PinOptions::default(), ParentLock::Acquire)
            .await.unwrap();
        pin.unlock();
        assert!(!pin.is_locked());
        assert!(!fx.h_dir(0).is_locked());
        assert!(pin.has_lease());
        pin.relock().await.unwrap();
        assert!(pin.is_locked());

        pin.unlock();
        fx.hosts[0].unlink(&fx.h_dir(0), n!("f"), &h_file).await.unwrap();
        assert!(matches!(pin.relock().await, Err(UnionError::Busy)));
        assert!(!pin.is_locked());
        pin.release();
        drop(h_file);
        fx.assert_balanced(&ctx, &refs);
    }

    #[tokio::test]
    async fn relock_with_reval_notices_a_swapped_child() {
        let fx = fixture();
        let refs = fx.refs();
        let ctx = OpCtx::root();
        let reval = PinOptions::default().with_udba(Udba::Reval);
        let h_dir = fx.h_dir(0);
        let h_file = fx.h_file().unwrap();
        let mut pin = Pin::acquire(&ctx, &fx.table, &fx.file,
                                   Some(h_file.clone()), 0, reval,
                                   ParentLock::Acquire).await.unwrap();
        pin.unlock();
        // Moved aside and replaced: still linked, but no longer `f`.
        fx.hosts[0].rename(&h_dir, n!("f"), &h_dir, n!("g")).await.unwrap();
        let h_new = fx.hosts[0].create(&h_dir, n!("f"), HostAttr::file()).await
            .unwrap();
        assert_eq!(h_file.nlink(), 1);
        assert!(matches!(pin.relock().await, Err(UnionError::Busy)));
        assert!(!pin.is_locked());
        pin.release();

        // Without revalidation nothing looks at the name.
        let mut pin = Pin::acquire(&ctx, &fx.table, &fx.file,
                                   Some(h_file.clone()), 0,
                                   PinOptions::default(),
                                   ParentLock::Acquire).await.unwrap();
        pin.unlock();
        pin.relock().await.unwrap();
        pin.release();

        // The name went away without the object being removed.
        let mut pin = Pin::acquire(&ctx, &fx.table, &fx.file,
                                   Some(h_new.clone()), 0, reval,
                                   ParentLock::Acquire).await.unwrap();
        pin.unlock();
        fx.hosts[0].rename(&h_dir, n!("f"), &h_dir, n!("h")).await.unwrap();
        assert!(matches!(pin.relock().await, Err(UnionError::Busy)));
        pin.release();
        drop((h_dir, h_file, h_new));
        fx.assert_balanced(&ctx, &refs);
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "lock ordering violation")]
    async fn pinning_under_a_host_lock_is_rejected() {
        let fx = fixture();
        let ctx = OpCtx::root();
        let h = fx.h_dir(1);
        let _held = lock_host_shared(&h, &ctx, LockClass::HostParent).await
            .unwrap();
        let _ = Pin::acquire(&ctx, &fx.table, &fx.file, None, 0,
                             PinOptions::default(), ParentLock::Acquire).await;
    }
}
