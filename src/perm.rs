//! Access checks for logical nodes.
//!
//! A single branch is checked with [`check_one`]: immutable objects refuse
//! writes, regular files need an execute bit (and an exec-capable mount) to
//! be executed, then the branch's own check runs (or the generic mode-bit
//! check when it has none), and finally the two [`PermissionHooks`].
//!
//! [`check`] decides which branches to ask. Files, and any write, only
//! consult the node's top branch. Reading a directory consults every branch
//! that contributes to it, stopping at the first refusal.

use crate::*;

use std::io;

/// Policy checks that run after a branch has granted access.
pub trait PermissionHooks: Send + Sync {
    /// Device access control. Runs first.
    fn device_access(&self, _inode: &HostInode, _mask: AccessMask)
        -> io::Result<()> {
        Ok(())
    }
    fn security(&self, _inode: &HostInode, _mask: AccessMask,
                _cred: &Credentials) -> io::Result<()> {
        Ok(())
    }
}

/// Hooks that never refuse anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionHooks for AllowAll {}

/// Owner, group, other. Root passes everything except executing a
/// non-directory that nobody may execute.
pub fn generic_permission(inode: &HostInode, mask: AccessMask,
                          cred: &Credentials) -> UnionResult<()> {
    let attr = inode.attr();
    let mut want = 0;
    if mask.contains(AccessMask::READ) { want |= 0o4 }
    if mask.wants_write() { want |= 0o2 }
    if mask.wants_exec() { want |= 0o1 }
    if cred.is_root() {
        if mask.wants_exec() && !inode.is_dir() && attr.mode & 0o111 == 0 {
            return Err(UnionError::PermissionDenied)
        }
        return Ok(())
    }
    let bits = if cred.uid == attr.uid { (attr.mode >> 6) & 0o7 }
    else if cred.in_group(attr.gid) { (attr.mode >> 3) & 0o7 }
    else { attr.mode & 0o7 };
    if bits & want == want { Ok(()) } else { Err(UnionError::PermissionDenied) }
}

/// Checks one host object on one branch.
pub fn check_one(branch: &Branch, inode: &HostInode, mask: AccessMask,
                 cred: &Credentials, hooks: &dyn PermissionHooks)
    -> UnionResult<()> {
    let write = mask.wants_write();
    if write && inode.is_immutable() {
        return Err(UnionError::NotPermitted)
    }
    if mask.wants_exec() && inode.kind() == HostKind::Regular
        && (branch.host().is_noexec() || inode.attr().mode & 0o111 == 0) {
        return Err(UnionError::PermissionDenied)
    }
    // A read-only branch's own check would refuse every write, and the write
    // may yet go to another branch.
    let native = if write && !branch.perm().is_writable() { None }
    else { branch.host().permission(inode, mask, cred) };
    match native {
        Some(result) => result?,
        None => generic_permission(inode, mask, cred)?,
    }
    hooks.device_access(inode, mask)?;
    hooks.security(inode, mask, cred)?;
    Ok(())
}

/// Checks a whole node. The caller holds the branch table and the node's
/// lock, and `info` is current for `table`.
pub fn check(table: &BranchTable, info: &NodeInfo, mask: AccessMask,
             cred: &Credentials, hooks: &dyn PermissionHooks)
    -> UnionResult<()> {
    let top = match info.top() {
        Some(x) => x,
        None => return Err(UnionError::kind(io::ErrorKind::NotFound)),
    };
    if !info.is_dir() || mask.wants_write() {
        let inode = match info.entry(top) {
            Some(x) if Some(x.kind()) == info.kind() => x,
            other => {
                log::debug!("permission: top entry {:?} does not match {:?}",
                            other, info.kind());
                return Err(UnionError::Busy)
            },
        };
        check_one(table.get(top)?, inode, mask, cred, hooks)?;
        if mask.wants_write() && !inode.kind().is_special()
            && !(0..=top).rev().any(|b| table.is_writable(b)) {
            return Err(UnionError::ReadOnlyFilesystem)
        }
        return Ok(())
    }
    for (bindex, inode) in info.entries() {
        if !inode.is_dir() {
            log::debug!("permission: branch {} has {:?} under a directory",
                        bindex, inode.kind());
            return Err(UnionError::Busy)
        }
        check_one(table.get(bindex)?, inode, mask, cred, hooks)?;
    }
    Ok(())
}
