//! An in-memory host branch.
//!
//! Useful for tests and for branches that only exist for the lifetime of the
//! process. Every call is counted, and any call can be made to fail on
//! demand with a [`FaultRule`].

use crate::*;

use std::{
    collections::{BTreeMap, HashMap},
    io, io::ErrorKind,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};
use async_trait::async_trait;

/// The calls a `MemHost` counts and can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemOp {
    Lookup,
    Create,
    Mkdir,
    Symlink,
    Link,
    Unlink,
    Rmdir,
    Rename,
    Permission,
    WantWrite,
    FreeSpace,
}

/// Which call should fail, and how often.
#[derive(Debug, Clone)]
pub struct FaultRule {
    pub op: MemOp,
    pub kind: ErrorKind,
    /// Number of matching calls to let through before the first failure.
    pub start_after: usize,
    /// Stop failing after this many failures. `None` fails forever.
    pub max_faults: Option<usize>,
}

impl FaultRule {
    /// Fails the next matching call, once.
    pub fn once(op: MemOp, kind: ErrorKind) -> FaultRule {
        FaultRule { op, kind, start_after: 0, max_faults: Some(1) }
    }
    /// Fails every matching call.
    pub fn always(op: MemOp, kind: ErrorKind) -> FaultRule {
        FaultRule { op, kind, start_after: 0, max_faults: None }
    }
}

#[derive(Debug)]
struct ArmedFault {
    rule: FaultRule,
    seen: usize,
    fired: usize,
}

struct MemState {
    dirs: HashMap<u64, BTreeMap<NameBuf, HostInode>>,
    link_targets: HashMap<u64, String>,
    calls: HashMap<MemOp, usize>,
    faults: Vec<ArmedFault>,
    free_space: Option<u64>,
}

pub struct MemHost {
    root: HostInode,
    state: Mutex<MemState>,
    next_ino: AtomicU64,
    writers: AtomicUsize,
    read_only: AtomicBool,
    noexec: bool,
}

const ROOT_INO: u64 = 1;
const DEFAULT_FREE_SPACE: u64 = 1 << 30;

impl MemHost {
    /// An empty branch: just a root directory.
    pub fn new() -> MemHost {
        let root = HostInode::new(ROOT_INO, HostKind::Directory,
                                  HostAttr::dir());
        let mut dirs = HashMap::new();
        dirs.insert(ROOT_INO, BTreeMap::new());
        MemHost {
            root,
            state: Mutex::new(MemState {
                dirs,
                link_targets: HashMap::new(),
                calls: HashMap::new(),
                faults: vec![],
                free_space: Some(DEFAULT_FREE_SPACE),
            }),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            writers: AtomicUsize::new(0),
            read_only: AtomicBool::new(false),
            noexec: false,
        }
    }
    /// Builds a branch from a listing of absolute paths. A path ending in
    /// `/` is a directory (mode 0755), anything else an empty regular file
    /// (mode 0644). Intermediate directories are implied.
    ///
    /// Panics on a malformed listing.
    pub fn from_listing(listing: &[&str]) -> MemHost {
        let host = MemHost::new();
        for path in listing {
            if !path.starts_with('/') {
                panic!("BUG IN YOUR PROGRAM: \
                        MemHost listing contained a relative path! {:?}",
                       path)
            }
            if *path == "/" {
                panic!("BUG IN YOUR PROGRAM: \
                        MemHost listing contained an explicit root!")
            }
            let is_dir = path.ends_with('/');
            let body = &path[1..];
            let body = body.strip_suffix('/').unwrap_or(body);
            let components: Vec<&Name> = body.split('/').map(|x| {
                Name::try_from_str(x).unwrap_or_else(|e| {
                    panic!("BUG IN YOUR PROGRAM: \
                            MemHost listing contained a bad name in {:?}: {}",
                           path, e)
                })
            }).collect();
            let (last, parents) = match components.split_last() {
                Some(x) => x,
                None => unreachable!("split always yields a component"),
            };
            let mut state = host.state();
            let mut dir = host.root.clone();
            for component in parents {
                let existing = state.dirs.get(&dir.ino())
                    .and_then(|x| x.get(*component)).cloned();
                dir = match existing {
                    Some(x) if x.is_dir() => x,
                    Some(_) =>
                        panic!("BUG IN YOUR PROGRAM: \
                                MemHost listing contained a file that was \
                                \"under\" another file! {:?}", path),
                    None => host.insert(&mut state, &dir, component,
                                        HostKind::Directory, HostAttr::dir()),
                };
            }
            let exists = state.dirs.get(&dir.ino())
                .map(|x| x.contains_key(*last)).unwrap_or(false);
            if exists {
                panic!("BUG IN YOUR PROGRAM: \
                        MemHost listing contained a duplicate! {:?}", path)
            }
            if is_dir {
                host.insert(&mut state, &dir, last, HostKind::Directory,
                            HostAttr::dir());
            }
            else {
                host.insert(&mut state, &dir, last, HostKind::Regular,
                            HostAttr::file());
            }
        }
        host
    }
    /// Marks the whole branch as mounted `noexec`.
    pub fn with_noexec(mut self) -> MemHost {
        self.noexec = true;
        self
    }
    /// Finds an object by absolute path, without counting a lookup.
    pub fn find(&self, path: &str) -> Option<HostInode> {
        let state = self.state();
        let mut cur = self.root.clone();
        for component in path.split('/').filter(|x| !x.is_empty()) {
            let next = state.dirs.get(&cur.ino())?
                .get(Name::try_from_str(component).ok()?)?.clone();
            cur = next;
        }
        Some(cur)
    }
    /// Names in a directory, in byte order.
    pub fn list(&self, dir: &HostInode) -> Vec<NameBuf> {
        self.state().dirs.get(&dir.ino())
            .map(|x| x.keys().cloned().collect())
            .unwrap_or_default()
    }
    pub fn link_target(&self, inode: &HostInode) -> Option<String> {
        self.state().link_targets.get(&inode.ino()).cloned()
    }
    /// How many times `op` has been called, failed calls included.
    pub fn calls(&self, op: MemOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }
    /// Write leases currently outstanding.
    pub fn active_writers(&self) -> usize {
        self.writers.load(Ordering::Acquire)
    }
    /// Flips the mount between read-only and read-write. Outstanding leases
    /// are unaffected; new ones fail while read-only.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release)
    }
    /// `None` makes `free_space` report `Unsupported`.
    pub fn set_free_space(&self, bytes: Option<u64>) {
        self.state().free_space = bytes;
    }
    pub fn inject(&self, rule: FaultRule) {
        self.state().faults.push(ArmedFault { rule, seen: 0, fired: 0 });
    }
    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }
    fn state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
    /// Counts the call and fires any matching fault.
    fn enter(&self, state: &mut MemState, op: MemOp) -> io::Result<()> {
        *state.calls.entry(op).or_insert(0) += 1;
        for armed in state.faults.iter_mut().filter(|x| x.rule.op == op) {
            armed.seen += 1;
            if armed.seen <= armed.rule.start_after { continue }
            if let Some(max) = armed.rule.max_faults {
                if armed.fired >= max { continue }
            }
            armed.fired += 1;
            return Err(io::Error::new(armed.rule.kind,
                                      format!("injected {:?} failure", op)))
        }
        Ok(())
    }
    fn insert(&self, state: &mut MemState, dir: &HostInode, name: &Name,
              kind: HostKind, attr: HostAttr) -> HostInode {
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let inode = HostInode::new(ino, kind, attr);
        if kind == HostKind::Directory {
            state.dirs.insert(ino, BTreeMap::new());
            dir.inc_nlink();
        }
        if let Some(entries) = state.dirs.get_mut(&dir.ino()) {
            entries.insert(name.to_owned(), inode.clone());
        }
        inode
    }
}

impl Default for MemHost {
    fn default() -> MemHost { MemHost::new() }
}

fn entries<'a>(state: &'a mut MemState, dir: &HostInode)
    -> io::Result<&'a mut BTreeMap<NameBuf, HostInode>> {
    if !dir.is_dir() {
        return Err(io::Error::from(ErrorKind::NotADirectory))
    }
    state.dirs.get_mut(&dir.ino())
        .ok_or_else(|| io::Error::from(ErrorKind::NotFound))
}

fn expect_victim(entries: &BTreeMap<NameBuf, HostInode>, name: &Name,
                 victim: &HostInode) -> io::Result<()> {
    match entries.get(name) {
        Some(x) if x.same(victim) => Ok(()),
        _ => Err(io::Error::from(ErrorKind::NotFound)),
    }
}

#[async_trait]
impl HostFs for MemHost {
    fn root(&self) -> HostInode { self.root.clone() }
    async fn lookup(&self, dir: &HostInode, name: &Name)
        -> io::Result<Option<HostInode>> {
        let mut state = self.state();
        self.enter(&mut state, MemOp::Lookup)?;
        Ok(entries(&mut state, dir)?.get(name).cloned())
    }
    async fn create(&self, dir: &HostInode, name: &Name, attr: HostAttr)
        -> io::Result<HostInode> {
        let mut state = self.state();
        self.enter(&mut state, MemOp::Create)?;
        if entries(&mut state, dir)?.contains_key(name) {
            return Err(io::Error::from(ErrorKind::AlreadyExists))
        }
        Ok(self.insert(&mut state, dir, name, HostKind::Regular, attr))
    }
    async fn mkdir(&self, dir: &HostInode, name: &Name, attr: HostAttr)
        -> io::Result<HostInode> {
        let mut state = self.state();
        self.enter(&mut state, MemOp::Mkdir)?;
        if entries(&mut state, dir)?.contains_key(name) {
            return Err(io::Error::from(ErrorKind::AlreadyExists))
        }
        Ok(self.insert(&mut state, dir, name, HostKind::Directory, attr))
    }
    async fn symlink(&self, dir: &HostInode, name: &Name, target: &str)
        -> io::Result<HostInode> {
        let mut state = self.state();
        self.enter(&mut state, MemOp::Symlink)?;
        if entries(&mut state, dir)?.contains_key(name) {
            return Err(io::Error::from(ErrorKind::AlreadyExists))
        }
        let inode = self.insert(&mut state, dir, name, HostKind::Symlink,
                                HostAttr::new(0o777, 0, 0));
        state.link_targets.insert(inode.ino(), target.to_string());
        Ok(inode)
    }
    async fn link(&self, src: &HostInode, dir: &HostInode, name: &Name)
        -> io::Result<HostInode> {
        let mut state = self.state();
        self.enter(&mut state, MemOp::Link)?;
        if src.is_dir() {
            return Err(io::Error::from(ErrorKind::PermissionDenied))
        }
        if src.nlink() == 0 {
            return Err(io::Error::from(ErrorKind::NotFound))
        }
        let entries = entries(&mut state, dir)?;
        if entries.contains_key(name) {
            return Err(io::Error::from(ErrorKind::AlreadyExists))
        }
        entries.insert(name.to_owned(), src.clone());
        src.inc_nlink();
        Ok(src.clone())
    }
    async fn unlink(&self, dir: &HostInode, name: &Name, victim: &HostInode)
        -> io::Result<()> {
        let mut state = self.state();
        self.enter(&mut state, MemOp::Unlink)?;
        let entries = entries(&mut state, dir)?;
        expect_victim(entries, name, victim)?;
        if victim.is_dir() {
            return Err(io::Error::from(ErrorKind::IsADirectory))
        }
        entries.remove(name);
        victim.drop_nlink();
        if victim.nlink() == 0 {
            state.link_targets.remove(&victim.ino());
        }
        Ok(())
    }
    async fn rmdir(&self, dir: &HostInode, name: &Name, victim: &HostInode)
        -> io::Result<()> {
        let mut state = self.state();
        self.enter(&mut state, MemOp::Rmdir)?;
        expect_victim(entries(&mut state, dir)?, name, victim)?;
        if !victim.is_dir() {
            return Err(io::Error::from(ErrorKind::NotADirectory))
        }
        if !entries(&mut state, victim)?.is_empty() {
            return Err(io::Error::from(ErrorKind::DirectoryNotEmpty))
        }
        state.dirs.remove(&victim.ino());
        entries(&mut state, dir)?.remove(name);
        victim.set_nlink(0);
        dir.drop_nlink();
        Ok(())
    }
    async fn rename(&self, src_dir: &HostInode, src_name: &Name,
                    dst_dir: &HostInode, dst_name: &Name) -> io::Result<()> {
        let mut state = self.state();
        self.enter(&mut state, MemOp::Rename)?;
        let moving = entries(&mut state, src_dir)?.get(src_name).cloned()
            .ok_or_else(|| io::Error::from(ErrorKind::NotFound))?;
        let replaced = entries(&mut state, dst_dir)?.get(dst_name).cloned();
        if let Some(replaced) = replaced.as_ref() {
            if replaced.same(&moving) { return Ok(()) }
            match (moving.is_dir(), replaced.is_dir()) {
                (true, false) =>
                    return Err(io::Error::from(ErrorKind::NotADirectory)),
                (false, true) =>
                    return Err(io::Error::from(ErrorKind::IsADirectory)),
                (true, true) => {
                    if !entries(&mut state, replaced)?.is_empty() {
                        return Err(io::Error::from(
                            ErrorKind::DirectoryNotEmpty))
                    }
                },
                (false, false) => (),
            }
        }
        entries(&mut state, src_dir)?.remove(src_name);
        if let Some(replaced) = replaced {
            if replaced.is_dir() {
                state.dirs.remove(&replaced.ino());
                replaced.set_nlink(0);
                dst_dir.drop_nlink();
            }
            else {
                replaced.drop_nlink();
            }
        }
        entries(&mut state, dst_dir)?.insert(dst_name.to_owned(),
                                             moving.clone());
        if moving.is_dir() && !src_dir.same(dst_dir) {
            src_dir.drop_nlink();
            dst_dir.inc_nlink();
        }
        Ok(())
    }
    fn permission(&self, _inode: &HostInode, _mask: AccessMask,
                  _cred: &Credentials) -> Option<io::Result<()>> {
        // No native check. A fault on `Permission` stands in for one that
        // says no.
        let mut state = self.state();
        match self.enter(&mut state, MemOp::Permission) {
            Ok(()) => None,
            Err(e) => Some(Err(e)),
        }
    }
    fn is_noexec(&self) -> bool { self.noexec }
    fn want_write(&self) -> io::Result<()> {
        let mut state = self.state();
        self.enter(&mut state, MemOp::WantWrite)?;
        if self.read_only.load(Ordering::Acquire) {
            return Err(io::Error::from(ErrorKind::ReadOnlyFilesystem))
        }
        self.writers.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn drop_write(&self) {
        let prev = self.writers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced drop_write");
    }
    async fn free_space(&self) -> io::Result<u64> {
        let mut state = self.state();
        self.enter(&mut state, MemOp::FreeSpace)?;
        state.free_space.ok_or_else(|| io::Error::from(ErrorKind::Unsupported))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[test] #[should_panic]
    fn no_relative_paths() {
        MemHost::from_listing(&["relative/path"]);
    }
    #[test] #[should_panic]
    fn no_root_path() {
        MemHost::from_listing(&["/"]);
    }
    #[test] #[should_panic]
    fn no_file_under_file() {
        MemHost::from_listing(&["/some/file", "/some/file/beneath"]);
    }
    #[test] #[should_panic]
    fn no_duplicates() {
        MemHost::from_listing(&["/dir/", "/dir/"]);
    }
    #[test] #[should_panic]
    fn no_whiteout_names() {
        MemHost::from_listing(&["/dir/.wh.gone"]);
    }
    #[test]
    fn listing_implies_parents() {
        let host = MemHost::from_listing(&["/a/b/c", "/a/d/"]);
        let a = host.find("/a").unwrap();
        assert!(a.is_dir());
        assert_eq!(host.list(&a), vec![NameBuf::try_from_str("b").unwrap(),
                                       NameBuf::try_from_str("d").unwrap()]);
        assert_eq!(a.nlink(), 4);
        assert_eq!(host.find("/a/b/c").unwrap().kind(), HostKind::Regular);
        assert!(host.find("/a/x").is_none());
        assert_eq!(host.calls(MemOp::Lookup), 0);
    }
    #[tokio::test]
    async fn basic_ops() {
        let host = MemHost::from_listing(&["/d/", "/f"]);
        let root = host.root();
        let d = host.lookup(&root, n!("d")).await.unwrap().unwrap();
        assert!(host.lookup(&root, n!("nope")).await.unwrap().is_none());
        let f = host.create(&d, n!("new"), HostAttr::file()).await.unwrap();
        assert_eq!(host.create(&d, n!("new"), HostAttr::file()).await
                   .unwrap_err().kind(), ErrorKind::AlreadyExists);
        let l = host.link(&f, &root, n!("hard")).await.unwrap();
        assert!(l.same(&f));
        assert_eq!(f.nlink(), 2);
        assert_eq!(host.rmdir(&root, n!("d"), &d).await.unwrap_err().kind(),
                   ErrorKind::DirectoryNotEmpty);
        host.unlink(&d, n!("new"), &f).await.unwrap();
        assert_eq!(f.nlink(), 1);
        host.rmdir(&root, n!("d"), &d).await.unwrap();
        assert_eq!(d.nlink(), 0);
        assert_eq!(host.create(&d, n!("x"), HostAttr::file()).await
                   .unwrap_err().kind(), ErrorKind::NotFound);
        let s = host.symlink(&root, n!("s"), "/f").await.unwrap();
        assert_eq!(host.link_target(&s).as_deref(), Some("/f"));
        assert_eq!(host.calls(MemOp::Create), 3);
    }
    #[tokio::test]
    async fn rename_moves_directories() {
        let host = MemHost::from_listing(&["/a/sub/", "/b/"]);
        let a = host.find("/a").unwrap();
        let b = host.find("/b").unwrap();
        host.rename(&a, n!("sub"), &b, n!("moved")).await.unwrap();
        assert!(host.find("/a/sub").is_none());
        assert!(host.find("/b/moved").unwrap().is_dir());
        assert_eq!(a.nlink(), 2);
        assert_eq!(b.nlink(), 3);
    }
    #[tokio::test]
    async fn faults_respect_start_and_max() {
        let host = MemHost::new();
        host.inject(FaultRule {
            op: MemOp::Mkdir,
            kind: ErrorKind::StorageFull,
            start_after: 1,
            max_faults: Some(2),
        });
        let root = host.root();
        assert!(host.mkdir(&root, n!("a"), HostAttr::dir()).await.is_ok());
        assert_eq!(host.mkdir(&root, n!("b"), HostAttr::dir()).await
                   .unwrap_err().kind(), ErrorKind::StorageFull);
        assert!(host.mkdir(&root, n!("c"), HostAttr::dir()).await.is_err());
        assert!(host.mkdir(&root, n!("d"), HostAttr::dir()).await.is_ok());
        assert_eq!(host.calls(MemOp::Mkdir), 4);
    }
    #[test]
    fn write_leases() {
        let host = MemHost::new();
        host.want_write().unwrap();
        assert_eq!(host.active_writers(), 1);
        host.set_read_only(true);
        assert_eq!(host.want_write().unwrap_err().kind(),
                   ErrorKind::ReadOnlyFilesystem);
        host.drop_write();
        assert_eq!(host.active_writers(), 0);
    }
}
