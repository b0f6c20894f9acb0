//! Making a node's parent directory exist on the branch a write goes to.

use crate::*;
use crate::lockdep::{LockClass, WriteGuard};
use crate::pin::{lock_host_shared, ParentLock, Pin, PinOptions};

use std::{io::ErrorKind, sync::Arc};

/// Makes every ancestor of `node` present on `bcpup`, then, if `add_entry`
/// and the node is negative, checks the name is free there and moves the
/// node's start to `bcpup`.
///
/// The caller holds `node`'s lock and its parent's lock exclusively; their
/// contents are `node_info` and `parent_info`. Ancestors further up are
/// locked here. Directories made before a failure stay on the branch.
///
/// Panics if the chain is missing from `bcpup` and `bcpup` is already the
/// node's start, since there is then no direction to copy in.
pub(crate) async fn ensure_ancestor(ctx: &OpCtx, table: &BranchTable,
                                    node: &UnionNode,
                                    node_info: &mut NodeInfo,
                                    parent_info: &mut NodeInfo,
                                    bcpup: usize, add_entry: bool)
    -> UnionResult<usize> {
    let parent = match node.parent() {
        Some(x) => x,
        None => return Ok(bcpup),
    };
    table.get(bcpup)?;
    if parent_info.generation() != table.generation() {
        return Err(UnionError::Busy)
    }
    if parent_info.entry(bcpup).is_none() {
        if node_info.start() == bcpup {
            panic!("BUG IN YOUR PROGRAM: copy-up direction undefined: {:?} \
                    already starts on branch {} but its parent is not there",
                   node, bcpup)
        }
        copy_chain(ctx, table, parent, parent_info, bcpup).await?;
    }
    if add_entry && !node_info.is_positive() && node_info.start() != bcpup {
        negative_lookup(ctx, table, node, parent_info, bcpup).await?;
        node_info.set_negative_at(bcpup);
    }
    Ok(bcpup)
}

/// Locks ancestors above `parent` until one is present on `bcpup`, then
/// makes the missing ones, outermost first.
async fn copy_chain(ctx: &OpCtx, table: &BranchTable, parent: &Arc<UnionNode>,
                    parent_info: &mut NodeInfo, bcpup: usize)
    -> UnionResult<()> {
    let mut held: Vec<(Arc<UnionNode>, WriteGuard<NodeInfo>)> = vec![];
    for ancestor in parent.ancestors() {
        let info = ancestor.write_info(ctx, LockClass::NodeAncestor).await?;
        if info.generation() != table.generation() {
            return Err(UnionError::Busy)
        }
        let present = info.entry(bcpup).is_some();
        held.push((ancestor, info));
        if present { break }
    }
    match held.last() {
        Some((_, info)) if info.entry(bcpup).is_some() => (),
        _ => {
            log::debug!("copy-up of {:?}: no ancestor on branch {}", parent,
                        bcpup);
            return Err(UnionError::Busy)
        },
    }
    for i in (0 .. held.len() - 1).rev() {
        let (lower, upper) = held.split_at_mut(i + 1);
        let container: &NodeInfo = &upper[0].1;
        let (child, child_info) = &mut lower[i];
        copy_dir(ctx, table, child, child_info, container, bcpup).await?;
    }
    copy_dir(ctx, table, parent, parent_info, &held[0].1, bcpup).await
}

/// Makes one directory present on `bcpup` inside its (present) container.
/// Going up the stack it is made with the attributes of its current top;
/// going down an existing directory there is used as is.
async fn copy_dir(ctx: &OpCtx, table: &BranchTable, dir: &UnionNode,
                  info: &mut NodeInfo, container: &NodeInfo, bcpup: usize)
    -> UnionResult<()> {
    let name = match dir.name() {
        Some(x) => x,
        None => return Ok(()),
    };
    if !info.is_dir() {
        return Err(UnionError::kind(ErrorKind::NotADirectory))
    }
    let pin = Pin::acquire(ctx, table, dir, None, bcpup,
                           PinOptions::new(LockClass::HostParent2),
                           ParentLock::HeldByCaller(container)).await?;
    let h_container = match pin.h_parent() {
        Some(x) => x.clone(),
        None => return Err(UnionError::Busy),
    };
    let host = pin.branch().host().clone();
    let downward = info.top().map(|top| top < bcpup).unwrap_or(false);
    let attr = info.top().and_then(|top| info.entry(top))
        .map(HostInode::attr).unwrap_or_else(HostAttr::dir);
    ctx.may_block()?;
    let existing = if downward {
        host.lookup(&h_container, name).await?
    } else { None };
    let made = match existing {
        Some(x) => x,
        None => match host.mkdir(&h_container, name, attr).await {
            Ok(x) => x,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Made behind our back. Use it if it is a directory.
                match host.lookup(&h_container, name).await? {
                    Some(x) => x,
                    None => return Err(e.into()),
                }
            },
            Err(e) => return Err(e.into()),
        },
    };
    pin.release();
    if !made.is_dir() {
        log::warn!("copy-up of {:?}: branch {} has a {:?} in the way", dir,
                   bcpup, made.kind());
        return Err(UnionError::kind(ErrorKind::NotADirectory))
    }
    log::debug!("{} {:?} on branch {}",
                if downward { "found" } else { "copied up" }, dir, bcpup);
    info.set_entry(bcpup, made);
    Ok(())
}

/// The name must not exist on `bcpup` yet.
async fn negative_lookup(ctx: &OpCtx, table: &BranchTable, node: &UnionNode,
                         parent_info: &NodeInfo, bcpup: usize)
    -> UnionResult<()> {
    let (name, h_dir) = match (node.name(), parent_info.entry(bcpup)) {
        (Some(name), Some(h_dir)) => (name, h_dir.clone()),
        _ => return Err(UnionError::Busy),
    };
    let branch = table.get(bcpup)?;
    let _guard = lock_host_shared(&h_dir, ctx, LockClass::HostParent).await?;
    ctx.may_block()?;
    if let Some(found) = branch.host().lookup(&h_dir, name).await? {
        log::warn!("{:?} is hidden on branch {} but exists there as {:?}",
                   node, bcpup, found);
        return Err(UnionError::kind(ErrorKind::AlreadyExists))
    }
    Ok(())
}

#[cfg(all(test, feature = "mem"))]
mod test {
    use super::*;

    use BranchPerm::{ReadOnly as RO, ReadWrite as RW};

    struct Tree {
        hosts: Vec<Arc<MemHost>>,
        table: BranchTable,
        a: Arc<UnionNode>,
        b: Arc<UnionNode>,
        new: Arc<UnionNode>,
    }

    /// Branches with the given listings; `/a/b` is known to the union on
    /// every branch where the listing has it, and `/a/b/new` is negative.
    fn tree(branches: &[(BranchPerm, Vec<&str>)]) -> Tree {
        let hosts: Vec<Arc<MemHost>> = branches.iter()
            .map(|(_, listing)| Arc::new(MemHost::from_listing(&listing[..])))
            .collect();
        let table = BranchTable::new(hosts.iter().zip(branches)
            .map(|(h, (perm, _))| Arc::new(Branch::new(h.clone(), *perm)))
            .collect());
        let gen = table.generation();
        let info_for = |path: &str| {
            let mut info = NodeInfo::new(gen);
            for (bindex, host) in hosts.iter().enumerate() {
                if let Some(x) = host.find(path) { info.set_entry(bindex, x) }
            }
            info
        };
        let root = UnionNode::new_root(1, info_for("/"));
        let a = UnionNode::new_child(2, &root, n!("a"), info_for("/a"));
        let b_info = info_for("/a/b");
        let mut new_info = NodeInfo::new(gen);
        new_info.set_negative_at(b_info.start());
        let b = UnionNode::new_child(3, &a, n!("b"), b_info);
        let new = UnionNode::new_child(4, &b, n!("new"), new_info);
        Tree { hosts, table, a, b, new }
    }

    impl Tree {
        async fn ensure(&self, ctx: &OpCtx, bcpup: usize)
            -> UnionResult<usize> {
            let mut node = self.new.write_info(ctx, LockClass::NodeChild)
                .await?;
            let mut parent = self.b.write_info(ctx, LockClass::NodeParent)
                .await?;
            ensure_ancestor(ctx, &self.table, &self.new, &mut node,
                            &mut parent, bcpup, true).await
        }
        fn balanced(&self, ctx: &OpCtx) {
            for host in self.hosts.iter() {
                assert_eq!(host.active_writers(), 0);
            }
            assert!(ctx.held_locks().is_empty());
        }
    }

    #[tokio::test]
    async fn upward_copies_the_chain_once() {
        let t = tree(&[(RW, vec![]), (RO, vec!["/a/b/"])]);
        t.hosts[1].find("/a").unwrap().set_attr(HostAttr::new(0o700, 5, 6));
        let ctx = OpCtx::root();
        assert_eq!(t.ensure(&ctx, 0).await.unwrap(), 0);
        t.balanced(&ctx);
        assert_eq!(t.hosts[0].calls(MemOp::Mkdir), 2);
        let a0 = t.hosts[0].find("/a").unwrap();
        assert_eq!(a0.attr(), HostAttr::new(0o700, 5, 6));
        assert!(t.hosts[0].find("/a/b").unwrap().is_dir());
        let a = t.a.snapshot(&ctx).await.unwrap();
        assert_eq!((a.top(), a.bottom()), (Some(0), Some(1)));
        assert!(a.entry(0).unwrap().same(&a0));
        let new = t.new.snapshot(&ctx).await.unwrap();
        assert!(!new.is_positive());
        assert_eq!(new.start(), 0);

        // Again: nothing left to do.
        assert_eq!(t.ensure(&ctx, 0).await.unwrap(), 0);
        assert_eq!(t.hosts[0].calls(MemOp::Mkdir), 2);
        assert_eq!(t.hosts[0].calls(MemOp::Lookup), 1);
        t.balanced(&ctx);
    }

    #[tokio::test]
    async fn downward_uses_what_is_there() {
        // `/a` exists on branch 1 but the union hasn't seen it; `/a/b`
        // doesn't.
        let t = tree(&[(RO, vec!["/a/b/"]), (RW, vec!["/a/"])]);
        {
            let ctx = OpCtx::root();
            let mut a = t.a.write_info(&ctx, LockClass::NodeChild).await
                .unwrap();
            a.clear_entry(1);
        }
        let ctx = OpCtx::root();
        assert_eq!(t.ensure(&ctx, 1).await.unwrap(), 1);
        t.balanced(&ctx);
        assert_eq!(t.hosts[1].calls(MemOp::Mkdir), 1);
        let a = t.a.snapshot(&ctx).await.unwrap();
        assert!(a.entry(1).unwrap().same(&t.hosts[1].find("/a").unwrap()));
        let b = t.b.snapshot(&ctx).await.unwrap();
        assert_eq!((b.top(), b.bottom()), (Some(0), Some(1)));
    }

    #[tokio::test]
    async fn name_on_target_branch_is_reported() {
        let t = tree(&[(RW, vec!["/a/b/new"]), (RO, vec!["/a/b/"])]);
        // Forget branch 0 entirely, as if it had been added behind our back.
        {
            let ctx = OpCtx::root();
            for node in [&t.a, &t.b] {
                node.write_info(&ctx, LockClass::NodeChild).await.unwrap()
                    .clear_entry(0);
            }
            t.new.write_info(&ctx, LockClass::NodeChild).await.unwrap()
                .set_negative_at(1);
        }
        let ctx = OpCtx::root();
        match t.ensure(&ctx, 0).await {
            Err(UnionError::Host(e)) =>
                assert_eq!(e.kind(), ErrorKind::AlreadyExists),
            x => panic!("unexpected {:?}", x),
        }
        t.balanced(&ctx);
        // The chain was adopted on the way.
        assert_eq!(t.hosts[0].calls(MemOp::Mkdir), 2);
        assert!(t.b.snapshot(&ctx).await.unwrap().entry(0).is_some());
        assert_eq!(t.new.snapshot(&ctx).await.unwrap().start(), 1);
    }

    #[tokio::test]
    async fn failure_midway_leaves_made_directories() {
        let t = tree(&[(RW, vec![]), (RO, vec!["/a/b/"])]);
        t.hosts[0].inject(FaultRule {
            start_after: 1,
            ..FaultRule::once(MemOp::Mkdir, ErrorKind::StorageFull)
        });
        let ctx = OpCtx::root();
        match t.ensure(&ctx, 0).await {
            Err(UnionError::Host(e)) =>
                assert_eq!(e.kind(), ErrorKind::StorageFull),
            x => panic!("unexpected {:?}", x),
        }
        t.balanced(&ctx);
        assert!(t.hosts[0].find("/a").is_some());
        assert!(t.hosts[0].find("/a/b").is_none());
        assert!(t.a.snapshot(&ctx).await.unwrap().entry(0).is_some());
        assert!(t.b.snapshot(&ctx).await.unwrap().entry(0).is_none());
        // The leftover is picked up by the next attempt.
        t.ensure(&ctx, 0).await.unwrap();
        assert_eq!(t.hosts[0].calls(MemOp::Mkdir), 3);
    }

    #[tokio::test]
    async fn stale_ancestors_are_busy() {
        let t = tree(&[(RW, vec![]), (RO, vec!["/a/b/"])]);
        let ctx = OpCtx::root();
        t.a.write_info(&ctx, LockClass::NodeChild).await.unwrap()
            .set_generation(0);
        assert!(matches!(t.ensure(&ctx, 0).await, Err(UnionError::Busy)));
        t.balanced(&ctx);
        assert_eq!(t.hosts[0].calls(MemOp::Mkdir), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "copy-up direction undefined")]
    async fn equal_direction_is_a_bug() {
        let t = tree(&[(RW, vec![]), (RO, vec!["/a/b/"])]);
        let ctx = OpCtx::root();
        t.new.write_info(&ctx, LockClass::NodeChild).await.unwrap()
            .set_negative_at(0);
        let _ = t.ensure(&ctx, 0).await;
    }
}
