//! Logical nodes: one per path in the union view.

use crate::*;
use crate::lockdep::{self, LockClass, ReadGuard, WriteGuard};

use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
};
use tokio::sync::RwLock;

/// Per-branch state of a [`UnionNode`]. Guarded by the node's own lock.
#[derive(Clone, Debug, Default)]
pub struct NodeInfo {
    entries: BTreeMap<usize, HostInode>,
    top: Option<usize>,
    bottom: Option<usize>,
    /// Where a negative node would start if it became positive.
    start: usize,
    kind: Option<HostKind>,
    generation: u64,
}

impl NodeInfo {
    pub(crate) fn new(generation: u64) -> NodeInfo {
        NodeInfo { generation, ..NodeInfo::default() }
    }
    /// Smallest branch index with a present entry.
    pub fn top(&self) -> Option<usize> { self.top }
    /// Largest branch index with a present entry.
    pub fn bottom(&self) -> Option<usize> { self.bottom }
    /// The top for a positive node, the recorded start for a negative one.
    pub fn start(&self) -> usize { self.top.unwrap_or(self.start) }
    pub fn entry(&self, bindex: usize) -> Option<&HostInode> {
        self.entries.get(&bindex)
    }
    /// Present entries, top first.
    pub fn entries(&self) -> impl Iterator<Item = (usize, &HostInode)> {
        self.entries.iter().map(|(&b, x)| (b, x))
    }
    pub fn kind(&self) -> Option<HostKind> { self.kind }
    pub fn is_positive(&self) -> bool { self.top.is_some() }
    pub fn is_dir(&self) -> bool { self.kind == Some(HostKind::Directory) }
    pub fn generation(&self) -> u64 { self.generation }
    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
    pub(crate) fn set_entry(&mut self, bindex: usize, inode: HostInode) {
        if self.entries.is_empty() {
            self.kind = Some(inode.kind());
        }
        self.entries.insert(bindex, inode);
        self.update_range();
    }
    pub(crate) fn clear_entry(&mut self, bindex: usize) -> Option<HostInode> {
        let ret = self.entries.remove(&bindex);
        self.update_range();
        ret
    }
    /// Drops every entry. The node becomes negative starting at `start`.
    pub(crate) fn clear_all(&mut self, start: usize) {
        self.entries.clear();
        self.start = start;
        self.update_range();
    }
    /// Records that a negative node's name is about to be made on `bindex`.
    pub(crate) fn set_negative_at(&mut self, bindex: usize) {
        debug_assert!(!self.is_positive());
        self.start = bindex;
    }
    fn update_range(&mut self) {
        self.top = self.entries.keys().next().copied();
        self.bottom = self.entries.keys().next_back().copied();
        if self.top.is_none() {
            self.kind = None;
        }
        if let Some(top) = self.top {
            self.start = top;
        }
    }
}

/// One logical path. Shared between the node cache and in-flight
/// operations; a child keeps its parent alive.
pub struct UnionNode {
    id: u64,
    name: Option<NameBuf>,
    parent: Option<Arc<UnionNode>>,
    info: Arc<RwLock<NodeInfo>>,
}

impl UnionNode {
    pub(crate) fn new_root(id: u64, info: NodeInfo) -> Arc<UnionNode> {
        Arc::new(UnionNode { id, name: None, parent: None,
                             info: Arc::new(RwLock::new(info)) })
    }
    pub(crate) fn new_child(id: u64, parent: &Arc<UnionNode>, name: &Name,
                            info: NodeInfo) -> Arc<UnionNode> {
        Arc::new(UnionNode { id, name: Some(name.to_owned()),
                             parent: Some(parent.clone()),
                             info: Arc::new(RwLock::new(info)) })
    }
    pub fn id(&self) -> u64 { self.id }
    /// `None` for the root.
    pub fn name(&self) -> Option<&Name> { self.name.as_deref() }
    pub fn parent(&self) -> Option<&Arc<UnionNode>> { self.parent.as_ref() }
    pub fn is_root(&self) -> bool { self.parent.is_none() }
    /// Absolute path in the union view.
    pub fn path(&self) -> String {
        let mut names = vec![];
        let mut cur = self;
        while let (Some(name), Some(parent)) = (cur.name(), cur.parent()) {
            names.push(name.as_str());
            cur = &**parent;
        }
        let mut ret = String::new();
        for name in names.iter().rev() {
            ret.push('/');
            ret.push_str(name);
        }
        if ret.is_empty() { ret.push('/') }
        ret
    }
    /// Strict ancestors, nearest first.
    pub fn ancestors(&self) -> Vec<Arc<UnionNode>> {
        let mut ret = vec![];
        let mut cur = self.parent.clone();
        while let Some(node) = cur {
            cur = node.parent.clone();
            ret.push(node);
        }
        ret
    }
    /// True if `other` is this node or one of its ancestors.
    pub fn is_within(&self, other: &UnionNode) -> bool {
        self.id == other.id
            || self.ancestors().iter().any(|x| x.id == other.id)
    }
    /// Copy of the per-branch state, for inspection.
    pub async fn snapshot(&self, ctx: &OpCtx) -> UnionResult<NodeInfo> {
        Ok(self.read_info(ctx, LockClass::NodeChild).await?.clone())
    }
    pub(crate) async fn read_info(&self, ctx: &OpCtx, class: LockClass)
        -> UnionResult<ReadGuard<NodeInfo>> {
        lockdep::read_owned(&self.info, ctx, class).await
    }
    pub(crate) async fn write_info(&self, ctx: &OpCtx, class: LockClass)
        -> UnionResult<WriteGuard<NodeInfo>> {
        lockdep::write_owned(&self.info, ctx, class).await
    }
    /// Negative, and nobody is holding its lock.
    pub(crate) fn is_idle_negative(&self) -> bool {
        self.info.try_read().map(|x| !x.is_positive()).unwrap_or(false)
    }
    #[cfg(test)]
    pub(crate) fn info_is_locked(&self) -> bool {
        self.info.try_write().is_err()
    }
}

impl fmt::Debug for UnionNode {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "UnionNode({} {:?})", self.id, self.path())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dir(ino: u64) -> HostInode {
        HostInode::new(ino, HostKind::Directory, HostAttr::dir())
    }

    #[test] fn range_follows_entries() {
        let mut info = NodeInfo::new(1);
        assert!(!info.is_positive());
        assert_eq!(info.start(), 0);
        info.set_entry(3, dir(1));
        info.set_entry(1, dir(2));
        info.set_entry(5, dir(3));
        assert_eq!((info.top(), info.bottom()), (Some(1), Some(5)));
        assert!(info.is_dir());
        info.clear_entry(1);
        assert_eq!((info.top(), info.bottom()), (Some(3), Some(5)));
        info.clear_entry(5);
        assert_eq!((info.top(), info.bottom()), (Some(3), Some(3)));
        info.clear_entry(3);
        assert_eq!((info.top(), info.bottom()), (None, None));
        assert_eq!(info.kind(), None);
        // Becoming negative keeps the last top as the start.
        assert_eq!(info.start(), 3);
        info.set_negative_at(2);
        assert_eq!(info.start(), 2);
    }

    #[tokio::test]
    async fn paths_and_ancestors() {
        let root = UnionNode::new_root(1, NodeInfo::new(1));
        let a = UnionNode::new_child(2, &root, n!("a"), NodeInfo::new(1));
        let b = UnionNode::new_child(3, &a, n!("b"), NodeInfo::new(1));
        assert_eq!(root.path(), "/");
        assert_eq!(b.path(), "/a/b");
        let ids: Vec<u64> = b.ancestors().iter().map(|x| x.id()).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(b.is_within(&a));
        assert!(b.is_within(&b));
        assert!(!a.is_within(&b));
        let ctx = OpCtx::root();
        assert_eq!(b.snapshot(&ctx).await.unwrap().generation(), 1);
    }
}
