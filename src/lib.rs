//! This is the branch engine of a union (stacking) filesystem. It presents
//! an ordered stack of directory trees ("branches") as one logical tree,
//! decides which branch each write goes to, copies directories up so that
//! the write has somewhere to land, and locks objects across branches in an
//! order that cannot deadlock.
//!
//! It does not talk to any kernel. Branches are anything that implements
//! [`HostFs`]; the crate ships an in-memory one ([`MemHost`]) and one that
//! sits on a real directory ([`FsHost`]).
//!
//! # Overview
//!
//! Branch 0 is the top of the stack. A name is looked up in every branch,
//! top first. The first branch that has it decides what it is:
//!
//! - If it's a directory, directories with the same name further down are
//!   merged into it.
//! - Anything else hides whatever is below it.
//!
//! Given these three branches:
//!
//! - branch 0 (read-write): `/etc/a`
//! - branch 1 (read-only): `/etc/b`, `/bin`
//! - branch 2 (read-only): `/etc/`, `/bin/sh`
//!
//! the union shows:
//!
//! - `/etc/` (on branches 0, 1 and 2)
//!     - `/etc/a` (from branch 0)
//!     - `/etc/b` (from branch 1)
//! - `/bin` (a file, from branch 1; the directory on branch 2 is hidden)
//!
//! ## Writes
//!
//! Creating `/etc/c` asks the create policy for a branch; with the default
//! ([`CreatePolicy::TopDownParent`]) that is the nearest writable branch at
//! or above the parent. If the parent directory isn't on that branch yet,
//! the chain of missing ancestors is made there first ("copy-up"), with the
//! attributes they have where they already exist.
//!
//! ## Nodes
//!
//! Every path that has been looked at is a [`UnionNode`]. Its per-branch
//! state lives in a [`NodeInfo`] behind the node's lock. Nodes remember the
//! generation of the branch table they were built against, and are quietly
//! rebuilt the next time they are used after the table changes.
//!
//! ## Pins and locks
//!
//! Changing a host directory goes through a [`Pin`], which holds the
//! logical parent, a write lease on the branch, and the host directory's
//! own lock, and rechecks that none of them went stale in between. Every
//! lock the crate takes has a [`LockClass`](lockdep::LockClass), and the
//! classes are always taken in one order. Debug builds check that.
//!
//! A caller that must not sleep sets [`OpCtx::nonblock`]. Every place that
//! would wait then fails with [`UnionError::WouldBlock`] instead, having
//! released whatever it held.

// The `n!` macro expands to `::stackfs::Name`, which has to resolve inside
// this crate too.
extern crate self as stackfs;

/// Specifies a constant, literal entry name. Give it a string literal and it
/// will validate it and give you a [`&'static Name`](struct.Name.html), with
/// no runtime overhead.
///
/// ```rust
/// # use stackfs::{Name, n};
/// const LOST_AND_FOUND: &Name = n!("lost+found");
/// ```
///
/// The sole argument must be a single string literal. Names containing `/`,
/// names that are `.` or `..`, and names with the whiteout prefix are
/// rejected at compile time. If you want to build a name at runtime, use
/// [`Name::try_from_str`](struct.Name.html#method.try_from_str).
pub use stackfs_namemacro::n;

mod name;
pub use name::*;

mod error;
pub use error::*;

pub mod lockdep;

mod ctx;
pub use ctx::*;

mod host;
pub use host::*;

mod branch;
pub use branch::*;

mod config;
pub use config::*;

mod node;
pub use node::*;

mod policy;
pub use policy::*;

mod copyup;

pub mod pin;
pub use pin::{ParentLock, Pin, PinOptions};

pub mod perm;
pub use perm::{AllowAll, PermissionHooks, generic_permission};

mod union;
pub use union::UnionFs;

#[cfg(feature = "mem")]
mod mem;
#[cfg(feature = "mem")]
pub use mem::*;

#[cfg(all(feature = "fs", unix))]
mod fs;
#[cfg(all(feature = "fs", unix))]
pub use fs::FsHost;
