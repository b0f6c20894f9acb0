use crate::*;

use std::{
    fmt::{self, Display, Formatter},
    io,
    sync::Arc,
};

/// A mutating operation, as far as branch selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Create,
    Mkdir,
    Symlink,
    Link,
    Rename,
    Unlink,
    Rmdir,
}

impl OpKind {
    /// True if the operation makes a new name appear in a directory.
    pub fn adds_entry(self) -> bool {
        matches!(self, OpKind::Create | OpKind::Mkdir | OpKind::Symlink
                 | OpKind::Link | OpKind::Rename)
    }
    pub fn is_dir(self) -> bool { self == OpKind::Mkdir }
}

/// What the union may do to a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchPerm {
    /// Read-only to the union. The host may still change underneath.
    ReadOnly,
    /// Read-only, but whiteouts found on it are honored.
    ReadOnlyWhiteout,
    /// Really read-only: nobody changes it, not even the host.
    RealReadOnly,
    ReadWrite,
    /// Writable, except that hard links are never made here.
    ReadWriteNoLink,
}

impl BranchPerm {
    pub fn is_writable(self) -> bool {
        matches!(self, BranchPerm::ReadWrite | BranchPerm::ReadWriteNoLink)
    }
    /// The operation table.
    pub fn allows(self, op: OpKind) -> bool {
        match self {
            BranchPerm::ReadOnly | BranchPerm::ReadOnlyWhiteout
                | BranchPerm::RealReadOnly => false,
            BranchPerm::ReadWrite => true,
            BranchPerm::ReadWriteNoLink => op != OpKind::Link,
        }
    }
}

impl Display for BranchPerm {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            BranchPerm::ReadOnly => "ro",
            BranchPerm::ReadOnlyWhiteout => "ro+wh",
            BranchPerm::RealReadOnly => "rr",
            BranchPerm::ReadWrite => "rw",
            BranchPerm::ReadWriteNoLink => "rw+nolink",
        })
    }
}

pub struct Branch {
    perm: BranchPerm,
    host: Arc<dyn HostFs>,
    root: HostInode,
}

impl Branch {
    pub fn new(host: Arc<dyn HostFs>, perm: BranchPerm) -> Branch {
        let root = host.root();
        Branch { perm, host, root }
    }
    pub fn perm(&self) -> BranchPerm { self.perm }
    pub fn host(&self) -> &Arc<dyn HostFs> { &self.host }
    pub fn root(&self) -> &HostInode { &self.root }
    /// Same host tree under a different permission.
    pub fn with_perm(&self, perm: BranchPerm) -> Branch {
        Branch { perm, host: self.host.clone(), root: self.root.clone() }
    }
    /// Takes a mount write lease, released when the lease is dropped.
    pub(crate) fn want_write(self: &Arc<Self>) -> io::Result<WriteLease> {
        self.host.want_write()?;
        Ok(WriteLease { branch: self.clone() })
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "Branch({}, root={:?})", self.perm, self.root)
    }
}

/// A held mount write lease.
pub struct WriteLease {
    branch: Arc<Branch>,
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        self.branch.host.drop_write();
    }
}

/// The ordered branch stack. Index 0 is the top.
pub struct BranchTable {
    branches: Vec<Arc<Branch>>,
    generation: u64,
}

impl BranchTable {
    pub(crate) fn new(branches: Vec<Arc<Branch>>) -> BranchTable {
        BranchTable { branches, generation: 1 }
    }
    pub fn len(&self) -> usize { self.branches.len() }
    pub fn is_empty(&self) -> bool { self.branches.is_empty() }
    /// Index of the bottom branch.
    pub fn bottom(&self) -> usize { self.branches.len().saturating_sub(1) }
    pub fn generation(&self) -> u64 { self.generation }
    pub fn get(&self, bindex: usize) -> UnionResult<&Arc<Branch>> {
        self.branches.get(bindex).ok_or(UnionError::NoSuchBranch(bindex))
    }
    pub fn perm(&self, bindex: usize) -> Option<BranchPerm> {
        self.branches.get(bindex).map(|x| x.perm)
    }
    pub fn is_writable(&self, bindex: usize) -> bool {
        self.perm(bindex).map(BranchPerm::is_writable).unwrap_or(false)
    }
    pub fn allows(&self, bindex: usize, op: OpKind) -> bool {
        self.perm(bindex).map(|x| x.allows(op)).unwrap_or(false)
    }
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Branch>> {
        self.branches.iter()
    }
    /// Every structural change goes through here so the generation moves.
    pub(crate) fn branches_mut(&mut self) -> &mut Vec<Arc<Branch>> {
        self.generation += 1;
        &mut self.branches
    }
}
