//! Write-branch selection.
//!
//! A mutating operation needs one branch to happen on (`bcpup`). A forced
//! branch wins outright. Otherwise a link or rename prefers its source's
//! top branch, an operation that adds a name asks the create policy, and
//! anything else stays where the node already is. If that answer is not
//! usable the copy-up policy searches for one that is.

use crate::*;

use std::{
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePolicy {
    /// The branch the parent lives on, or the nearest writable one above
    /// it, or failing that below it.
    TopDownParent,
    /// Writable branches in turn.
    RoundRobin,
    /// The writable branch with the most free space.
    MostFreeSpace,
    /// `MostFreeSpace`, falling back to `RoundRobin` when even the best
    /// branch has less than `watermark` bytes free.
    MostFreeSpaceRoundRobin { watermark: u64 },
    /// `TopDownParent` order, skipping branches with less than `watermark`
    /// bytes free. Falls back to `MostFreeSpace`.
    TopDownMostFreeSpace { watermark: u64 },
    /// `MostFreeSpace` among the branches the parent is present on. Falls
    /// back to plain `MostFreeSpace`.
    ParentMostFreeSpace,
    /// Always this branch.
    Fixed(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyupPolicy {
    /// From the node's top toward branch 0.
    TopDownParent,
    /// From the parent's bottom toward branch 0.
    BottomUpParent,
    /// From the last branch toward branch 0.
    BottomUp,
}

#[derive(Debug, Clone, Copy)]
struct MfsSample {
    taken: Instant,
    generation: u64,
    best: Option<(usize, u64)>,
}

/// Mutable policy state, owned by the filesystem instance.
#[derive(Debug, Default)]
pub(crate) struct PolicyState {
    rr_next: AtomicUsize,
    mfs: Mutex<Option<MfsSample>>,
}

impl PolicyState {
    pub(crate) fn new() -> PolicyState { PolicyState::default() }
    /// Called whenever the branch table changes shape.
    pub(crate) fn reset(&self) {
        self.rr_next.store(0, Ordering::Release);
        *self.mfs.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Inputs to branch selection.
#[derive(Debug, Clone, Copy)]
pub struct SelectArgs<'a> {
    /// The node being written. Negative for a name about to be made.
    pub node: &'a NodeInfo,
    /// Its parent, if it has one.
    pub parent: Option<&'a NodeInfo>,
    /// Top branch of a link or rename source.
    pub source_top: Option<usize>,
    pub op: OpKind,
    /// Use this branch, no questions asked. Must be writable.
    pub forced: Option<usize>,
}

pub(crate) struct Selector<'a> {
    pub table: &'a BranchTable,
    pub config: &'a UnionConfig,
    pub state: &'a PolicyState,
    pub ctx: &'a OpCtx,
}

impl<'a> Selector<'a> {
    pub(crate) async fn select_branch(&self, args: &SelectArgs<'_>)
        -> UnionResult<usize> {
        if let Some(forced) = args.forced {
            if !self.table.is_writable(forced) {
                panic!("BUG IN YOUR PROGRAM: forced branch {} is not \
                        writable ({:?})", forced, self.table.perm(forced))
            }
            return Ok(forced)
        }
        let start = args.node.start();
        let candidate = match args.source_top {
            Some(src) if src < start => Ok(src),
            _ if args.op.adds_entry() => self.create(args).await,
            _ => Ok(start),
        };
        match candidate {
            Ok(b) if self.table.allows(b, args.op) => {
                log::debug!("bcpup {} for {:?}", b, args.op);
                Ok(b)
            },
            Err(UnionError::WouldBlock) => Err(UnionError::WouldBlock),
            other => {
                log::debug!("{:?} unusable for {:?}, trying copy-up policy",
                            other, args.op);
                let b = self.copyup(args).ok_or(UnionError::NoWritableBranch)?;
                log::debug!("bcpup {} for {:?} (copy-up)", b, args.op);
                Ok(b)
            },
        }
    }

    fn first_allowed_from(&self, from: usize, op: OpKind) -> Option<usize> {
        let from = from.min(self.table.bottom());
        (0..=from).rev().find(|&b| self.table.allows(b, op))
    }

    fn copyup(&self, args: &SelectArgs<'_>) -> Option<usize> {
        if self.table.is_empty() { return None }
        let from = match self.config.copyup {
            CopyupPolicy::TopDownParent => args.node.start(),
            CopyupPolicy::BottomUpParent => args.parent
                .and_then(NodeInfo::bottom)
                .unwrap_or_else(|| args.node.start()),
            CopyupPolicy::BottomUp => self.table.bottom(),
        };
        self.first_allowed_from(from, args.op)
    }

    async fn create(&self, args: &SelectArgs<'_>) -> UnionResult<usize> {
        match self.config.create {
            CreatePolicy::TopDownParent => self.top_down(args).first()
                .copied().ok_or(UnionError::NoWritableBranch),
            CreatePolicy::RoundRobin => self.round_robin(args.op),
            CreatePolicy::MostFreeSpace => Ok(self.mfs(args.op).await?.0),
            CreatePolicy::MostFreeSpaceRoundRobin { watermark } => {
                let (b, free) = self.mfs(args.op).await?;
                if free < watermark {
                    log::debug!("branch {} below watermark ({} < {}), \
                                 round-robin", b, free, watermark);
                    self.round_robin(args.op)
                }
                else { Ok(b) }
            },
            CreatePolicy::TopDownMostFreeSpace { watermark } => {
                for b in self.top_down(args) {
                    if let Some(free) = self.free_space(b).await? {
                        if free >= watermark { return Ok(b) }
                    }
                }
                Ok(self.mfs(args.op).await?.0)
            },
            CreatePolicy::ParentMostFreeSpace => {
                let candidates: Vec<usize> = match args.parent {
                    Some(parent) => parent.entries().map(|(b, _)| b)
                        .filter(|&b| self.table.allows(b, args.op)).collect(),
                    None => vec![],
                };
                let mut best: Option<(usize, u64)> = None;
                for b in candidates {
                    if let Some(free) = self.free_space(b).await? {
                        if best.map(|(_, x)| free > x).unwrap_or(true) {
                            best = Some((b, free));
                        }
                    }
                }
                match best {
                    Some((b, _)) => Ok(b),
                    None => Ok(self.mfs(args.op).await?.0),
                }
            },
            CreatePolicy::Fixed(b) => Ok(b),
        }
    }

    /// Writable branches from the node's start up to 0, then below it.
    fn top_down(&self, args: &SelectArgs<'_>) -> Vec<usize> {
        let len = self.table.len();
        let start = args.node.start().min(len.saturating_sub(1));
        (0..=start).rev().chain(start + 1 .. len)
            .filter(|&b| self.table.allows(b, args.op))
            .collect()
    }

    fn round_robin(&self, op: OpKind) -> UnionResult<usize> {
        let len = self.table.len();
        for _ in 0 .. len {
            let b = self.state.rr_next.fetch_add(1, Ordering::AcqRel) % len;
            if self.table.allows(b, op) { return Ok(b) }
        }
        Err(UnionError::NoWritableBranch)
    }

    async fn free_space(&self, bindex: usize) -> UnionResult<Option<u64>> {
        self.ctx.may_block()?;
        let branch = self.table.get(bindex)?;
        match branch.host().free_space().await {
            Ok(x) => Ok(Some(x)),
            Err(x) => {
                log::warn!("branch {}: free space unavailable: {}", bindex, x);
                Ok(None)
            },
        }
    }

    /// Best branch by free space, with its free byte count. Sampled at most
    /// once per `mfs_expire`.
    async fn mfs(&self, op: OpKind) -> UnionResult<(usize, u64)> {
        let cached = *self.state.mfs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sample) = cached {
            if sample.generation == self.table.generation()
                && sample.taken.elapsed() < self.config.mfs_expire {
                if let Some((b, free)) = sample.best {
                    if self.table.allows(b, op) { return Ok((b, free)) }
                }
            }
        }
        let mut best: Option<(usize, u64)> = None;
        for b in 0 .. self.table.len() {
            if !self.table.allows(b, op) { continue }
            if let Some(free) = self.free_space(b).await? {
                if best.map(|(_, x)| free > x).unwrap_or(true) {
                    best = Some((b, free));
                }
            }
        }
        *self.state.mfs.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(MfsSample { taken: Instant::now(),
                             generation: self.table.generation(), best });
        best.ok_or(UnionError::NoWritableBranch)
    }
}
