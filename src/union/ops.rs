//! Operations that change the union: each one picks a branch, pins the
//! parent there, makes one host call and records what it did.

use super::*;

enum NewEntry<'a> {
    File(HostAttr),
    Dir(HostAttr),
    Symlink(&'a str),
    Link(&'a Arc<UnionNode>),
}

impl NewEntry<'_> {
    fn op(&self) -> OpKind {
        match self {
            NewEntry::File(_) => OpKind::Create,
            NewEntry::Dir(_) => OpKind::Mkdir,
            NewEntry::Symlink(_) => OpKind::Symlink,
            NewEntry::Link(_) => OpKind::Link,
        }
    }
}

fn unsupported(what: &str) -> UnionError {
    io::Error::new(ErrorKind::Unsupported, what.to_string()).into()
}

/// Locks two distinct parents, the deeper one first. Returned in argument
/// order.
async fn lock_parents(ctx: &OpCtx, a: &UnionNode, b: &UnionNode)
    -> UnionResult<(WriteGuard<NodeInfo>, WriteGuard<NodeInfo>)> {
    if a.is_within(b) {
        let ga = a.write_info(ctx, LockClass::NodeParent).await?;
        let gb = b.write_info(ctx, LockClass::NodeParent).await?;
        Ok((ga, gb))
    }
    else {
        let gb = b.write_info(ctx, LockClass::NodeParent).await?;
        let ga = a.write_info(ctx, LockClass::NodeParent).await?;
        Ok((ga, gb))
    }
}

impl UnionFs {
    pub async fn create(&self, ctx: &OpCtx, parent: &Arc<UnionNode>,
                        name: &Name, attr: HostAttr)
        -> UnionResult<Arc<UnionNode>> {
        self.add_entry(ctx, parent, name, NewEntry::File(attr)).await
    }
    pub async fn mkdir(&self, ctx: &OpCtx, parent: &Arc<UnionNode>,
                       name: &Name, attr: HostAttr)
        -> UnionResult<Arc<UnionNode>> {
        self.add_entry(ctx, parent, name, NewEntry::Dir(attr)).await
    }
    pub async fn symlink(&self, ctx: &OpCtx, parent: &Arc<UnionNode>,
                         name: &Name, target: &str)
        -> UnionResult<Arc<UnionNode>> {
        self.add_entry(ctx, parent, name, NewEntry::Symlink(target)).await
    }
    /// Hard-links `src` as `name` in `parent`. The link is made on the
    /// branch `src` lives on when that branch takes links.
    pub async fn link(&self, ctx: &OpCtx, src: &Arc<UnionNode>,
                      parent: &Arc<UnionNode>, name: &Name)
        -> UnionResult<Arc<UnionNode>> {
        self.add_entry(ctx, parent, name, NewEntry::Link(src)).await
    }

    async fn add_entry(&self, ctx: &OpCtx, parent: &Arc<UnionNode>,
                       name: &Name, what: NewEntry<'_>)
        -> UnionResult<Arc<UnionNode>> {
        let op = what.op();
        let table = self.read_table(ctx).await?;
        let node = self.lookup_locked(ctx, &table, parent, name, true).await?;
        // A link source is only read, and its lock is not kept: holding it
        // while waiting for the target's parent would let a rename holding
        // that parent wait on the source in turn. The host objects in the
        // copy stay valid; one unlinked since is refused by the host.
        let src_info = match &what {
            NewEntry::Link(src) => {
                if src.id() == node.id() {
                    return Err(UnionError::kind(ErrorKind::AlreadyExists))
                }
                self.revalidate_locked(ctx, &table, src).await?;
                let info = src.snapshot(ctx).await?;
                if !info.is_positive() {
                    return Err(UnionError::kind(ErrorKind::NotFound))
                }
                if info.is_dir() {
                    return Err(UnionError::kind(ErrorKind::PermissionDenied))
                }
                Some(info)
            },
            _ => None,
        };
        let mut info = node.write_info(ctx, LockClass::NodeChild).await?;
        if info.is_positive() {
            return Err(UnionError::kind(ErrorKind::AlreadyExists))
        }
        let mut pinfo = parent.write_info(ctx, LockClass::NodeParent).await?;
        if !pinfo.is_positive() {
            return Err(UnionError::kind(ErrorKind::NotFound))
        }
        if !pinfo.is_dir() {
            return Err(UnionError::kind(ErrorKind::NotADirectory))
        }
        let source_top = src_info.as_ref().and_then(|x| x.top());
        let bcpup = self.wr_dir(ctx, &table, &node, &mut info,
                                Some(&mut *pinfo), source_top, op, None)
            .await?;
        let h_src = match &src_info {
            Some(src) => match src.entry(bcpup) {
                Some(x) if x.nlink() == 0 =>
                    return Err(UnionError::kind(ErrorKind::NotFound)),
                Some(x) => Some(x.clone()),
                None => {
                    log::debug!("link to {:?}: source is not on branch {}",
                                node, bcpup);
                    return Err(unsupported("link source needs a copy-up"))
                },
            },
            None => None,
        };
        let opts = PinOptions::new(LockClass::HostParent)
            .with_udba(self.inner.config.udba);
        let pin = Pin::acquire(ctx, &table, &node, None, bcpup, opts,
                               ParentLock::HeldByCaller(&pinfo)).await?;
        let h_dir = match pin.h_parent() {
            Some(x) => x.clone(),
            None => return Err(UnionError::Busy),
        };
        let host = pin.branch().host().clone();
        ctx.may_block()?;
        let made = match (what, h_src) {
            (NewEntry::File(attr), _) => host.create(&h_dir, name, attr).await,
            (NewEntry::Dir(attr), _) => host.mkdir(&h_dir, name, attr).await,
            (NewEntry::Symlink(target), _) =>
                host.symlink(&h_dir, name, target).await,
            (NewEntry::Link(_), Some(h_src)) =>
                host.link(&h_src, &h_dir, name).await,
            (NewEntry::Link(_), None) =>
                Err(io::Error::from(ErrorKind::NotFound)),
        };
        pin.release();
        let made = made?;
        log::debug!("{:?} {:?} on branch {}", op, node, bcpup);
        info.set_entry(bcpup, made);
        drop(info);
        Ok(node)
    }

    pub async fn unlink(&self, ctx: &OpCtx, node: &Arc<UnionNode>)
        -> UnionResult<()> {
        self.remove_entry(ctx, node, OpKind::Unlink).await
    }
    pub async fn rmdir(&self, ctx: &OpCtx, node: &Arc<UnionNode>)
        -> UnionResult<()> {
        self.remove_entry(ctx, node, OpKind::Rmdir).await
    }

    /// True if `name` exists on a branch below `top` where `parent` is.
    async fn exists_below(&self, ctx: &OpCtx, table: &BranchTable,
                          parent: &NodeInfo, name: &Name, top: usize)
        -> UnionResult<bool> {
        for (bindex, h_dir) in parent.entries().filter(|(b, _)| *b > top) {
            let branch = table.get(bindex)?;
            let _guard = lock_host_shared(h_dir, ctx, LockClass::HostParent)
                .await?;
            ctx.may_block()?;
            if branch.host().lookup(h_dir, name).await?.is_some() {
                return Ok(true)
            }
        }
        Ok(false)
    }

    async fn remove_entry(&self, ctx: &OpCtx, node: &Arc<UnionNode>,
                          op: OpKind) -> UnionResult<()> {
        let (parent, name) = match (node.parent(), node.name()) {
            (Some(parent), Some(name)) => (parent, name),
            _ => return Err(UnionError::kind(ErrorKind::ResourceBusy)),
        };
        let table = self.read_table(ctx).await?;
        self.revalidate_locked(ctx, &table, node).await?;
        let mut info = node.write_info(ctx, LockClass::NodeChild).await?;
        let pinfo = parent.write_info(ctx, LockClass::NodeParent).await?;
        let top = match info.top() {
            Some(x) => x,
            None => return Err(UnionError::kind(ErrorKind::NotFound)),
        };
        match (op, info.is_dir()) {
            (OpKind::Unlink, true) =>
                return Err(UnionError::kind(ErrorKind::IsADirectory)),
            (OpKind::Rmdir, false) =>
                return Err(UnionError::kind(ErrorKind::NotADirectory)),
            _ => (),
        }
        if info.bottom() != Some(top)
            || self.exists_below(ctx, &table, &pinfo, name, top).await? {
            log::debug!("{:?} {:?}: lower branches would show through",
                        op, node);
            return Err(unsupported("removal needs a whiteout"))
        }
        let bcpup = self.selector(ctx, &table).select_branch(&SelectArgs {
            node: &info, parent: Some(&*pinfo), source_top: None, op,
            forced: None,
        }).await?;
        if bcpup != top {
            log::debug!("{:?} {:?}: branch {} is read-only", op, node, top);
            return Err(unsupported("removal from a read-only branch needs a \
                                    whiteout"))
        }
        let h_child = match info.entry(top) {
            Some(x) => x.clone(),
            None => return Err(UnionError::Busy),
        };
        let opts = PinOptions::new(LockClass::HostParent)
            .with_udba(self.inner.config.udba);
        let pin = Pin::acquire(ctx, &table, node, Some(h_child.clone()), top,
                               opts, ParentLock::HeldByCaller(&pinfo)).await?;
        let h_dir = match pin.h_parent() {
            Some(x) => x.clone(),
            None => return Err(UnionError::Busy),
        };
        let host = pin.branch().host().clone();
        let victim = lock_host_exclusive(&h_child, ctx, LockClass::HostChild)
            .await?;
        ctx.may_block()?;
        let result = if op == OpKind::Rmdir {
            host.rmdir(&h_dir, name, &h_child).await
        }
        else {
            host.unlink(&h_dir, name, &h_child).await
        };
        drop(victim);
        pin.release();
        result?;
        log::debug!("{:?} {:?} on branch {}", op, node, top);
        info.clear_entry(top);
        self.forget_subtree(node, false);
        Ok(())
    }

    /// Moves `src` to `name` in `dst_parent`, on the branch `src` is on.
    pub async fn rename(&self, ctx: &OpCtx, src: &Arc<UnionNode>,
                        dst_parent: &Arc<UnionNode>, name: &Name)
        -> UnionResult<Arc<UnionNode>> {
        let _serial = lockdep::write_owned(&self.inner.rename_lock, ctx,
                                           LockClass::Rename).await?;
        let (src_parent, src_name) = match (src.parent(), src.name()) {
            (Some(parent), Some(name)) => (parent.clone(), name.to_owned()),
            _ => return Err(UnionError::kind(ErrorKind::ResourceBusy)),
        };
        let table = self.read_table(ctx).await?;
        self.revalidate_locked(ctx, &table, src).await?;
        if dst_parent.is_within(src) {
            return Err(UnionError::kind(ErrorKind::InvalidInput))
        }
        let dst = self.lookup_locked(ctx, &table, dst_parent, name, true)
            .await?;
        if dst.id() == src.id() {
            return Ok(dst)
        }
        if src.is_within(&dst) {
            return Err(UnionError::kind(ErrorKind::DirectoryNotEmpty))
        }
        let bcpup = match src.read_info(ctx, LockClass::NodeChild).await?
            .top() {
            Some(x) => x,
            None => return Err(UnionError::kind(ErrorKind::NotFound)),
        };
        if !table.allows(bcpup, OpKind::Rename) {
            log::debug!("rename of {:?}: branch {} refuses renames", src,
                        bcpup);
            return Err(unsupported("rename needs a copy-up of the source"))
        }
        // Make the target's parent exist on the source's branch first,
        // while nothing on the source side is held.
        {
            let mut info = dst.write_info(ctx, LockClass::NodeChild).await?;
            let mut pinfo = dst_parent.write_info(ctx, LockClass::NodeParent)
                .await?;
            self.wr_dir(ctx, &table, &dst, &mut info, Some(&mut *pinfo),
                        Some(bcpup), OpKind::Rename, Some(bcpup)).await?;
        }

        let mut src_info = src.write_info(ctx, LockClass::NodeChild).await?;
        let mut dst_info = dst.write_info(ctx, LockClass::NodeChild).await?;
        let (dst_pinfo, src_pinfo) = if src_parent.id() == dst_parent.id() {
            (dst_parent.write_info(ctx, LockClass::NodeParent).await?, None)
        }
        else {
            let (d, s) = lock_parents(ctx, dst_parent, &src_parent).await?;
            (d, Some(s))
        };
        let src_pinfo_ref: &NodeInfo = src_pinfo.as_deref()
            .unwrap_or(&*dst_pinfo);
        if src_info.top() != Some(bcpup) || dst_pinfo.entry(bcpup).is_none() {
            return Err(UnionError::Busy)
        }
        if src_info.bottom() != Some(bcpup)
            || self.exists_below(ctx, &table, src_pinfo_ref, &src_name,
                                 bcpup).await? {
            return Err(unsupported("rename source needs a whiteout"))
        }
        let h_dst = match (dst_info.top(), dst_info.bottom()) {
            (None, _) if dst_info.start() == bcpup => None,
            (Some(t), Some(b)) if t == bcpup && b == bcpup =>
                dst_info.entry(bcpup).cloned(),
            (None, _) => return Err(UnionError::Busy),
            _ => return Err(unsupported("rename target spans branches")),
        };
        let h_src = match src_info.entry(bcpup) {
            Some(x) => x.clone(),
            None => return Err(UnionError::Busy),
        };
        let udba = self.inner.config.udba;
        let dst_pin = Pin::acquire(ctx, &table, &dst, h_dst.clone(), bcpup,
                                   PinOptions::new(LockClass::HostParent)
                                   .with_udba(udba),
                                   ParentLock::HeldByCaller(&dst_pinfo))
            .await?;
        let src_pin = match src_pinfo.as_deref() {
            Some(held) => Some(Pin::acquire(
                ctx, &table, src, Some(h_src.clone()), bcpup,
                PinOptions::new(LockClass::HostParent2).with_write(false)
                    .with_udba(udba),
                ParentLock::HeldByCaller(held)).await?),
            None => None,
        };
        let h_dst_dir = dst_pin.h_parent().cloned();
        let h_src_dir = match &src_pin {
            Some(pin) => pin.h_parent().cloned(),
            None => h_dst_dir.clone(),
        };
        let (h_src_dir, h_dst_dir) = match (h_src_dir, h_dst_dir) {
            (Some(s), Some(d)) => (s, d),
            _ => return Err(UnionError::Busy),
        };
        let host = dst_pin.branch().host().clone();
        let moving = lock_host_exclusive(&h_src, ctx, LockClass::HostChild)
            .await?;
        // Two names for one object lock it once.
        let replaced = match h_dst.as_ref().filter(|x| !x.same(&h_src)) {
            Some(x) => Some(lock_host_exclusive(x, ctx, LockClass::HostChild2)
                            .await?),
            None => None,
        };
        ctx.may_block()?;
        let result = host.rename(&h_src_dir, &src_name, &h_dst_dir, name)
            .await;
        drop(replaced);
        drop(moving);
        drop(src_pin);
        dst_pin.release();
        result?;
        log::debug!("renamed {:?} to {:?} on branch {}", src, dst, bcpup);
        src_info.clear_entry(bcpup);
        dst_info.clear_all(bcpup);
        dst_info.set_entry(bcpup, h_src);
        self.forget_subtree(src, false);
        self.forget_subtree(&dst, true);
        Ok(dst)
    }
}
