use crate::*;

use std::{
    fmt,
    sync::Arc,
    time::Duration,
};

/// One branch as handed over by whatever parsed the mount options.
#[derive(Clone)]
pub struct BranchConfig {
    pub host: Arc<dyn HostFs>,
    pub perm: BranchPerm,
}

impl BranchConfig {
    pub fn new(host: Arc<dyn HostFs>, perm: BranchPerm) -> BranchConfig {
        BranchConfig { host, perm }
    }
    pub fn ro(host: Arc<dyn HostFs>) -> BranchConfig {
        BranchConfig::new(host, BranchPerm::ReadOnly)
    }
    pub fn rw(host: Arc<dyn HostFs>) -> BranchConfig {
        BranchConfig::new(host, BranchPerm::ReadWrite)
    }
}

impl fmt::Debug for BranchConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "BranchConfig({})", self.perm)
    }
}

/// How far the pin protocol trusts host trees not to change behind the
/// union's back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Udba {
    /// Trust the cached host handles.
    #[default]
    None,
    /// After locking a host directory, look the child up again and fail
    /// with `Busy` if it is no longer the object we cached.
    Reval,
}

#[derive(Clone)]
pub struct UnionConfig {
    /// Top first.
    pub branches: Vec<BranchConfig>,
    pub create: CreatePolicy,
    pub copyup: CopyupPolicy,
    pub udba: Udba,
    /// How long a free-space sample stays good for the MFS policies.
    pub mfs_expire: Duration,
    pub hooks: Arc<dyn PermissionHooks>,
}

impl Default for UnionConfig {
    fn default() -> UnionConfig {
        UnionConfig {
            branches: vec![],
            create: CreatePolicy::TopDownParent,
            copyup: CopyupPolicy::TopDownParent,
            udba: Udba::None,
            mfs_expire: Duration::from_secs(30),
            hooks: Arc::new(AllowAll),
        }
    }
}

impl UnionConfig {
    pub fn new() -> UnionConfig { UnionConfig::default() }
    /// Appends a branch below the ones already given.
    pub fn with_branch(mut self, branch: BranchConfig) -> UnionConfig {
        self.branches.push(branch);
        self
    }
    pub fn with_create(mut self, create: CreatePolicy) -> UnionConfig {
        self.create = create;
        self
    }
    pub fn with_copyup(mut self, copyup: CopyupPolicy) -> UnionConfig {
        self.copyup = copyup;
        self
    }
    pub fn with_udba(mut self, udba: Udba) -> UnionConfig {
        self.udba = udba;
        self
    }
    pub fn with_mfs_expire(mut self, mfs_expire: Duration) -> UnionConfig {
        self.mfs_expire = mfs_expire;
        self
    }
    pub fn with_hooks(mut self, hooks: Arc<dyn PermissionHooks>)
        -> UnionConfig {
        self.hooks = hooks;
        self
    }
}

impl fmt::Debug for UnionConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("UnionConfig")
            .field("branches", &self.branches)
            .field("create", &self.create)
            .field("copyup", &self.copyup)
            .field("udba", &self.udba)
            .field("mfs_expire", &self.mfs_expire)
            .finish_non_exhaustive()
    }
}
