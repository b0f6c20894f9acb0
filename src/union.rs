//! The union itself: branch table, node cache, and everything built on them.

use crate::*;
use crate::copyup::ensure_ancestor;
use crate::lockdep::{self, LockClass, ReadGuard, WriteGuard};
use crate::pin::{lock_host_exclusive, lock_host_shared};
use crate::policy::{PolicyState, Selector};

use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};
use tokio::sync::RwLock;

mod ops;

const ROOT_ID: u64 = 1;
/// Unused negative nodes the cache may gain before they are swept.
const NEGATIVE_SLACK: usize = 256;

struct UnionInner {
    table: Arc<RwLock<BranchTable>>,
    root: Arc<UnionNode>,
    cache: Mutex<HashMap<(u64, NameBuf), Arc<UnionNode>>>,
    policy: PolicyState,
    /// Everything but the branches, which live in `table`.
    config: UnionConfig,
    rename_lock: Arc<RwLock<()>>,
    next_id: AtomicU64,
    /// Cache size after the last sweep.
    swept_at: AtomicUsize,
}

/// A union of branches, top first. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct UnionFs {
    inner: Arc<UnionInner>,
}

fn root_info(table: &BranchTable) -> NodeInfo {
    let mut info = NodeInfo::new(table.generation());
    for (bindex, branch) in table.iter().enumerate() {
        info.set_entry(bindex, branch.root().clone());
    }
    info
}

fn describe(table: &BranchTable) -> String {
    table.iter().map(|x| x.perm().to_string()).collect::<Vec<_>>().join(":")
}

/// Looks `name` up in every directory `parent` has, top first. The first
/// hit decides the kind. Directories below a directory are merged, and
/// anything else ends the scan.
pub(crate) async fn lookup_entries(ctx: &OpCtx, table: &BranchTable,
                                   parent: &NodeInfo, name: &Name)
    -> UnionResult<NodeInfo> {
    let mut info = NodeInfo::new(table.generation());
    info.set_negative_at(parent.start());
    for (bindex, h_dir) in parent.entries() {
        if !h_dir.is_dir() { break }
        let branch = table.get(bindex)?;
        let found = {
            let _guard = lock_host_shared(h_dir, ctx, LockClass::HostParent)
                .await?;
            ctx.may_block()?;
            branch.host().lookup(h_dir, name).await?
        };
        let inode = match found {
            Some(x) => x,
            None => continue,
        };
        if !info.is_positive() {
            let is_dir = inode.is_dir();
            info.set_entry(bindex, inode);
            if !is_dir { break }
        }
        else if inode.is_dir() {
            info.set_entry(bindex, inode);
        }
        else { break }
    }
    Ok(info)
}

impl UnionFs {
    /// Builds a union from its configuration. Fails with `InvalidInput`
    /// when there are no branches.
    pub fn new(mut config: UnionConfig) -> UnionResult<UnionFs> {
        let branches = std::mem::take(&mut config.branches);
        if branches.is_empty() {
            return Err(io::Error::new(ErrorKind::InvalidInput,
                                      "a union needs at least one branch")
                       .into())
        }
        let table = BranchTable::new(branches.into_iter()
            .map(|x| Arc::new(Branch::new(x.host, x.perm))).collect());
        log::debug!("new union {}, create={:?} copyup={:?} udba={:?}",
                    describe(&table), config.create, config.copyup,
                    config.udba);
        let root = UnionNode::new_root(ROOT_ID, root_info(&table));
        Ok(UnionFs {
            inner: Arc::new(UnionInner {
                table: Arc::new(RwLock::new(table)),
                root,
                cache: Mutex::new(HashMap::new()),
                policy: PolicyState::new(),
                config,
                rename_lock: Arc::new(RwLock::new(())),
                next_id: AtomicU64::new(ROOT_ID + 1),
                swept_at: AtomicUsize::new(0),
            }),
        })
    }
    pub fn root(&self) -> &Arc<UnionNode> { &self.inner.root }
    pub fn config(&self) -> &UnionConfig { &self.inner.config }
    pub async fn generation(&self, ctx: &OpCtx) -> UnionResult<u64> {
        Ok(self.read_table(ctx).await?.generation())
    }
    pub async fn branch_count(&self, ctx: &OpCtx) -> UnionResult<usize> {
        Ok(self.read_table(ctx).await?.len())
    }
    pub async fn branch_perm(&self, ctx: &OpCtx, bindex: usize)
        -> UnionResult<BranchPerm> {
        Ok(self.read_table(ctx).await?.get(bindex)?.perm())
    }
    pub(crate) async fn read_table(&self, ctx: &OpCtx)
        -> UnionResult<ReadGuard<BranchTable>> {
        lockdep::read_owned(&self.inner.table, ctx, LockClass::Table).await
    }
    async fn write_table(&self, ctx: &OpCtx)
        -> UnionResult<WriteGuard<BranchTable>> {
        lockdep::write_owned(&self.inner.table, ctx, LockClass::Table).await
    }
    fn cache(&self) -> MutexGuard<'_, HashMap<(u64, NameBuf), Arc<UnionNode>>> {
        self.inner.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
    fn selector<'a>(&'a self, ctx: &'a OpCtx, table: &'a BranchTable)
        -> Selector<'a> {
        Selector { table, config: &self.inner.config,
                   state: &self.inner.policy, ctx }
    }

    /// Inserts a branch so that it gets index `bindex`.
    pub async fn add_branch(&self, ctx: &OpCtx, bindex: usize,
                            branch: BranchConfig) -> UnionResult<()> {
        let mut table = self.write_table(ctx).await?;
        if bindex > table.len() {
            return Err(UnionError::NoSuchBranch(bindex))
        }
        table.branches_mut().insert(bindex,
                                    Arc::new(Branch::new(branch.host,
                                                         branch.perm)));
        self.reconfigured(ctx, &table).await
    }
    pub async fn remove_branch(&self, ctx: &OpCtx, bindex: usize)
        -> UnionResult<()> {
        let mut table = self.write_table(ctx).await?;
        table.get(bindex)?;
        if table.len() == 1 {
            return Err(io::Error::new(ErrorKind::InvalidInput,
                                      "cannot remove the last branch").into())
        }
        table.branches_mut().remove(bindex);
        self.reconfigured(ctx, &table).await
    }
    pub async fn set_branch_perm(&self, ctx: &OpCtx, bindex: usize,
                                 perm: BranchPerm) -> UnionResult<()> {
        let mut table = self.write_table(ctx).await?;
        let branch = Arc::new(table.get(bindex)?.with_perm(perm));
        table.branches_mut()[bindex] = branch;
        self.reconfigured(ctx, &table).await
    }
    async fn reconfigured(&self, ctx: &OpCtx, table: &BranchTable)
        -> UnionResult<()> {
        self.inner.policy.reset();
        let mut root = self.inner.root.write_info(ctx, LockClass::NodeChild)
            .await?;
        *root = root_info(table);
        log::debug!("branch table generation {}: {}", table.generation(),
                    describe(table));
        Ok(())
    }

    /// Finds `name` in `parent`. A name that exists nowhere gives a negative
    /// node if `allow_negative`, `NotFound` otherwise.
    pub async fn lookup_logical(&self, ctx: &OpCtx, parent: &Arc<UnionNode>,
                                name: &Name, allow_negative: bool)
        -> UnionResult<Arc<UnionNode>> {
        let table = self.read_table(ctx).await?;
        self.lookup_locked(ctx, &table, parent, name, allow_negative).await
    }

    pub(crate) async fn lookup_locked(&self, ctx: &OpCtx, table: &BranchTable,
                                      parent: &Arc<UnionNode>, name: &Name,
                                      allow_negative: bool)
        -> UnionResult<Arc<UnionNode>> {
        self.revalidate_locked(ctx, table, parent).await?;
        let key = (parent.id(), name.to_owned());
        let cached = self.cache().get(&key).cloned();
        let node = match cached {
            Some(node) => {
                self.revalidate_locked(ctx, table, &node).await?;
                node
            },
            None => {
                let info = {
                    let pinfo = parent.read_info(ctx, LockClass::NodeParent)
                        .await?;
                    if !pinfo.is_positive() {
                        return Err(UnionError::kind(ErrorKind::NotFound))
                    }
                    if !pinfo.is_dir() {
                        return Err(UnionError::kind(ErrorKind::NotADirectory))
                    }
                    lookup_entries(ctx, table, &pinfo, name).await?
                };
                let negative = !info.is_positive();
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let node = UnionNode::new_child(id, parent, name, info);
                let mut cache = self.cache();
                let node = cache.entry(key).or_insert(node).clone();
                if negative {
                    self.sweep_negatives(&mut cache);
                }
                node
            },
        };
        if !allow_negative
            && !node.read_info(ctx, LockClass::NodeChild).await?.is_positive() {
            return Err(UnionError::kind(ErrorKind::NotFound))
        }
        Ok(node)
    }

    /// Walks a slash-separated path from the root.
    pub async fn resolve(&self, ctx: &OpCtx, path: &str)
        -> UnionResult<Arc<UnionNode>> {
        let table = self.read_table(ctx).await?;
        let mut cur = self.inner.root.clone();
        for component in path.split('/').filter(|x| !x.is_empty()) {
            let name = Name::try_from_str(component).map_err(|e| {
                io::Error::new(ErrorKind::InvalidInput, e.to_string())
            })?;
            cur = self.lookup_locked(ctx, &table, &cur, name, false).await?;
        }
        Ok(cur)
    }

    /// Brings `node` and its ancestors up to date with the branch table.
    pub async fn revalidate(&self, ctx: &OpCtx, node: &Arc<UnionNode>)
        -> UnionResult<()> {
        let table = self.read_table(ctx).await?;
        self.revalidate_locked(ctx, &table, node).await
    }

    pub(crate) async fn revalidate_locked(&self, ctx: &OpCtx,
                                          table: &BranchTable,
                                          node: &Arc<UnionNode>)
        -> UnionResult<()> {
        let mut chain = node.ancestors();
        chain.reverse();
        chain.push(node.clone());
        for cur in chain.iter() {
            let (parent, name) = match (cur.parent(), cur.name()) {
                (Some(parent), Some(name)) => (parent, name),
                // The root is rebuilt with the table.
                _ => continue,
            };
            if cur.read_info(ctx, LockClass::NodeChild).await?.generation()
                == table.generation() {
                continue
            }
            let mut info = cur.write_info(ctx, LockClass::NodeChild).await?;
            if info.generation() == table.generation() { continue }
            let pinfo = parent.read_info(ctx, LockClass::NodeParent).await?;
            if pinfo.generation() != table.generation() {
                return Err(UnionError::Busy)
            }
            *info = lookup_entries(ctx, table, &pinfo, name).await?;
            log::debug!("revalidated {:?}: {:?}..{:?}", cur, info.top(),
                        info.bottom());
        }
        Ok(())
    }

    /// Drops `node` from the cache. Holders of the node keep their copy.
    pub fn forget(&self, node: &UnionNode) {
        if let (Some(parent), Some(name)) = (node.parent(), node.name()) {
            let key = (parent.id(), name.to_owned());
            let mut cache = self.cache();
            if cache.get(&key).map(|x| x.id() == node.id()).unwrap_or(false) {
                cache.remove(&key);
            }
        }
    }

    /// Drops everything cached below `node`, and `node` too unless
    /// `keep_node`.
    fn forget_subtree(&self, node: &UnionNode, keep_node: bool) {
        self.cache().retain(|_, x| {
            !x.is_within(node) || (keep_node && x.id() == node.id())
        });
    }

    /// Drops negative nodes nobody else holds, once enough have piled up
    /// since the last sweep.
    fn sweep_negatives(&self,
                       cache: &mut HashMap<(u64, NameBuf), Arc<UnionNode>>) {
        let swept_at = self.inner.swept_at.load(Ordering::Relaxed);
        if cache.len() <= swept_at.saturating_add(NEGATIVE_SLACK) {
            return
        }
        let before = cache.len();
        cache.retain(|_, x| Arc::strong_count(x) > 1 || !x.is_idle_negative());
        log::debug!("swept {} negative nodes", before - cache.len());
        self.inner.swept_at.store(cache.len(), Ordering::Relaxed);
    }

    pub(crate) fn cached_nodes(&self) -> usize {
        self.cache().len()
    }

    /// Picks the branch a write to `node` goes to and makes sure its parent
    /// exists there.
    pub async fn resolve_write_branch(&self, ctx: &OpCtx,
                                      node: &Arc<UnionNode>,
                                      source: Option<&Arc<UnionNode>>,
                                      op: OpKind, forced: Option<usize>)
        -> UnionResult<usize> {
        let table = self.read_table(ctx).await?;
        self.revalidate_locked(ctx, &table, node).await?;
        let source_top = match source {
            Some(src) => {
                self.revalidate_locked(ctx, &table, src).await?;
                src.read_info(ctx, LockClass::NodeChild).await?.top()
            },
            None => None,
        };
        let mut info = node.write_info(ctx, LockClass::NodeChild).await?;
        match node.parent() {
            Some(parent) => {
                let mut pinfo = parent.write_info(ctx, LockClass::NodeParent)
                    .await?;
                self.wr_dir(ctx, &table, node, &mut info, Some(&mut *pinfo),
                            source_top, op, forced).await
            },
            None => self.wr_dir(ctx, &table, node, &mut info, None,
                                source_top, op, forced).await,
        }
    }

    /// Select, then copy up the parent chain if the branch is not the
    /// node's start. Caller holds both node locks exclusively.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn wr_dir(&self, ctx: &OpCtx, table: &BranchTable,
                               node: &UnionNode, info: &mut NodeInfo,
                               parent_info: Option<&mut NodeInfo>,
                               source_top: Option<usize>, op: OpKind,
                               forced: Option<usize>)
        -> UnionResult<usize> {
        let bcpup = {
            let args = SelectArgs {
                node: info, parent: parent_info.as_deref(), source_top, op,
                forced,
            };
            self.selector(ctx, table).select_branch(&args).await?
        };
        if bcpup != info.start() {
            if let Some(parent_info) = parent_info {
                ensure_ancestor(ctx, table, node, info, parent_info, bcpup,
                                op.adds_entry()).await?;
            }
        }
        Ok(bcpup)
    }

    /// Pins `node`'s parent on `bindex`. The pin keeps the branch table
    /// shared until it is released.
    pub async fn pin(&self, ctx: &OpCtx, node: &Arc<UnionNode>, bindex: usize,
                     opts: PinOptions) -> UnionResult<Pin> {
        let table = self.read_table(ctx).await?;
        self.revalidate_locked(ctx, &table, node).await?;
        let h_child = node.read_info(ctx, LockClass::NodeChild).await?
            .entry(bindex).cloned();
        let mut pin = Pin::acquire(ctx, &table, node, h_child, bindex, opts,
                                   ParentLock::Acquire).await?;
        pin.hold_table(table);
        Ok(pin)
    }

    /// May `ctx` access `node` this way?
    pub async fn check_permission(&self, ctx: &OpCtx, node: &Arc<UnionNode>,
                                  mask: AccessMask) -> UnionResult<()> {
        let table = self.read_table(ctx).await?;
        self.revalidate_locked(ctx, &table, node).await?;
        let info = node.read_info(ctx, LockClass::NodeChild).await?;
        perm::check(&table, &info, mask, &ctx.cred, &*self.inner.config.hooks)
    }
}
