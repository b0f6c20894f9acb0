//! A host branch backed by a directory on a real (UNIX) filesystem.

use crate::*;

use std::{
    collections::HashMap,
    fs::{FileType, Metadata, Permissions},
    io, io::ErrorKind,
    os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt},
    path::{self, PathBuf},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::fs::{self, OpenOptions};
use async_trait::async_trait;

struct Known {
    /// Relative to `base`.
    path: PathBuf,
    inode: HostInode,
}

/// Objects are identified by inode number. The first time an inode number
/// is seen it gets a `HostInode`, and every later lookup that lands on the
/// same number returns that same handle, so identity checks in the pin
/// protocol see through repeated lookups.
pub struct FsHost {
    base: PathBuf,
    root: HostInode,
    known: Mutex<HashMap<u64, Known>>,
    writers: AtomicUsize,
    read_only: AtomicBool,
}

fn kind_of(ft: FileType) -> HostKind {
    if ft.is_dir() { HostKind::Directory }
    else if ft.is_symlink() { HostKind::Symlink }
    else if ft.is_char_device() { HostKind::CharDevice }
    else if ft.is_block_device() { HostKind::BlockDevice }
    else if ft.is_fifo() { HostKind::Fifo }
    else if ft.is_socket() { HostKind::Socket }
    else { HostKind::Regular }
}

fn attr_of(meta: &Metadata) -> HostAttr {
    HostAttr::new(meta.mode() & 0o7777, meta.uid(), meta.gid())
}

fn inode_of(meta: &Metadata) -> HostInode {
    let inode = HostInode::new(meta.ino(), kind_of(meta.file_type()),
                               attr_of(meta));
    inode.set_nlink(meta.nlink() as u32);
    inode
}

impl FsHost {
    pub async fn new(base: impl Into<PathBuf>) -> io::Result<FsHost> {
        let base = base.into();
        let meta = fs::metadata(&base).await?;
        if !meta.is_dir() {
            return Err(io::Error::from(ErrorKind::NotADirectory))
        }
        let root = inode_of(&meta);
        let mut known = HashMap::new();
        known.insert(root.ino(), Known { path: PathBuf::new(),
                                         inode: root.clone() });
        Ok(FsHost {
            base, root,
            known: Mutex::new(known),
            writers: AtomicUsize::new(0),
            read_only: AtomicBool::new(false),
        })
    }
    pub fn base(&self) -> &path::Path { &self.base }
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release)
    }
    pub fn active_writers(&self) -> usize {
        self.writers.load(Ordering::Acquire)
    }
    fn known(&self) -> MutexGuard<'_, HashMap<u64, Known>> {
        self.known.lock().unwrap_or_else(|e| e.into_inner())
    }
    /// Relative path of an object we handed out. A handle we no longer know
    /// about was removed underneath us.
    fn rel_of(&self, inode: &HostInode) -> io::Result<PathBuf> {
        match self.known().get(&inode.ino()) {
            Some(x) if x.inode.same(inode) => Ok(x.path.clone()),
            _ => Err(io::Error::from(ErrorKind::NotFound)),
        }
    }
    fn adopt(&self, rel: PathBuf, meta: &Metadata) -> HostInode {
        let mut known = self.known();
        let kind = kind_of(meta.file_type());
        if let Some(x) = known.get_mut(&meta.ino()) {
            if x.inode.kind() == kind {
                x.inode.set_attr(attr_of(meta));
                x.inode.set_nlink(meta.nlink() as u32);
                x.path = rel;
                return x.inode.clone()
            }
        }
        let inode = inode_of(meta);
        known.insert(inode.ino(), Known { path: rel, inode: inode.clone() });
        inode
    }
    fn forget(&self, inode: &HostInode) {
        let mut known = self.known();
        if known.get(&inode.ino()).map(|x| x.inode.same(inode))
            .unwrap_or(false) {
            known.remove(&inode.ino());
        }
    }
    async fn stat(&self, rel: PathBuf) -> io::Result<Option<HostInode>> {
        match fs::symlink_metadata(self.base.join(&rel)).await {
            Ok(meta) => Ok(Some(self.adopt(rel, &meta))),
            Err(x) if x.kind() == ErrorKind::NotFound => Ok(None),
            Err(x) => Err(x),
        }
    }
    fn child(&self, dir: &HostInode, name: &Name) -> io::Result<PathBuf> {
        if !dir.is_dir() {
            return Err(io::Error::from(ErrorKind::NotADirectory))
        }
        Ok(self.rel_of(dir)?.join(name))
    }
    /// Checks that `rel` still names `victim`.
    async fn check_victim(&self, rel: &path::Path, victim: &HostInode)
        -> io::Result<()> {
        let meta = fs::symlink_metadata(self.base.join(rel)).await?;
        if meta.ino() != victim.ino() {
            return Err(io::Error::from(ErrorKind::NotFound))
        }
        Ok(())
    }
    async fn finish(&self, rel: PathBuf) -> io::Result<HostInode> {
        match self.stat(rel).await? {
            Some(x) => Ok(x),
            None => Err(io::Error::from(ErrorKind::NotFound)),
        }
    }
}

#[async_trait]
impl HostFs for FsHost {
    fn root(&self) -> HostInode { self.root.clone() }
    async fn lookup(&self, dir: &HostInode, name: &Name)
        -> io::Result<Option<HostInode>> {
        let rel = self.child(dir, name)?;
        self.stat(rel).await
    }
    async fn create(&self, dir: &HostInode, name: &Name, attr: HostAttr)
        -> io::Result<HostInode> {
        let rel = self.child(dir, name)?;
        let path = self.base.join(&rel);
        OpenOptions::new().write(true).create_new(true).mode(attr.mode)
            .open(&path).await?;
        // The umask applied to `mode` above; set the bits we were asked for.
        fs::set_permissions(&path, Permissions::from_mode(attr.mode)).await?;
        self.finish(rel).await
    }
    async fn mkdir(&self, dir: &HostInode, name: &Name, attr: HostAttr)
        -> io::Result<HostInode> {
        let rel = self.child(dir, name)?;
        let path = self.base.join(&rel);
        fs::create_dir(&path).await?;
        fs::set_permissions(&path, Permissions::from_mode(attr.mode)).await?;
        dir.inc_nlink();
        self.finish(rel).await
    }
    async fn symlink(&self, dir: &HostInode, name: &Name, target: &str)
        -> io::Result<HostInode> {
        let rel = self.child(dir, name)?;
        fs::symlink(target, self.base.join(&rel)).await?;
        self.finish(rel).await
    }
    async fn link(&self, src: &HostInode, dir: &HostInode, name: &Name)
        -> io::Result<HostInode> {
        let src_rel = self.rel_of(src)?;
        let rel = self.child(dir, name)?;
        fs::hard_link(self.base.join(&src_rel), self.base.join(&rel)).await?;
        self.finish(rel).await
    }
    async fn unlink(&self, dir: &HostInode, name: &Name, victim: &HostInode)
        -> io::Result<()> {
        let rel = self.child(dir, name)?;
        self.check_victim(&rel, victim).await?;
        fs::remove_file(self.base.join(&rel)).await?;
        victim.drop_nlink();
        // Another name may still reach it, but not the one we knew.
        self.forget(victim);
        Ok(())
    }
    async fn rmdir(&self, dir: &HostInode, name: &Name, victim: &HostInode)
        -> io::Result<()> {
        let rel = self.child(dir, name)?;
        self.check_victim(&rel, victim).await?;
        fs::remove_dir(self.base.join(&rel)).await?;
        victim.set_nlink(0);
        dir.drop_nlink();
        self.forget(victim);
        Ok(())
    }
    async fn rename(&self, src_dir: &HostInode, src_name: &Name,
                    dst_dir: &HostInode, dst_name: &Name) -> io::Result<()> {
        let src_rel = self.child(src_dir, src_name)?;
        let dst_rel = self.child(dst_dir, dst_name)?;
        let replaced = self.stat(dst_rel.clone()).await?;
        fs::rename(self.base.join(&src_rel), self.base.join(&dst_rel)).await?;
        if let Some(replaced) = replaced {
            replaced.drop_nlink();
            self.forget(&replaced);
        }
        let mut known = self.known();
        for entry in known.values_mut() {
            let suffix = match entry.path.strip_prefix(&src_rel) {
                Ok(x) => x.to_path_buf(),
                Err(_) => continue,
            };
            entry.path = if suffix.as_os_str().is_empty() {
                dst_rel.clone()
            }
            else {
                dst_rel.join(suffix)
            };
        }
        Ok(())
    }
    fn want_write(&self) -> io::Result<()> {
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
        Err(io::Error::from(ErrorKind::Unsupported))
    }
}
