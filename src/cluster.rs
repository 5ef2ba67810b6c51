//! The cluster core: N subvolumes behind one namespace.
//!
//! `Distribute` owns the subvolume registry, the option set, per-inode and
//! per-fd context tables and the runtime generation counter. It implements
//! [`Subvolume`] itself, so a distribute cluster can be stacked wherever a
//! single brick is expected.

use std::collections::HashMap;
use std::io;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::config::Options;
use crate::diskusage::DuStats;
use crate::errno::{Errno, FopResult};
use crate::hash::MungeRegexes;
use crate::layout::Layout;
use crate::notify::SubvolState;
use crate::subvol::{
    AccessMode, AttrPair, CreateReply, EntryReply, Fd, LockCmd, LockKind, LookupReply, OpenFlags,
    PosixLock, RenameReply, ReadReply, SetAttrs, SubvolRef, Subvolume, UnlinkReply, WriteReply,
    XattropOp,
};
use crate::types::{DirEntry, FileAttr, FileType, Gfid, Loc, Statvfs, Xattrs};
use crate::{entry_ops, file_ops, lookup, readdir, rename, xattr_ops};

/// Per-inode context: the cached layout plus the freshest attribute times
/// seen from any subvolume.
pub(crate) struct InodeCtx {
    pub(crate) layout: Mutex<Option<Arc<Layout>>>,
    pub(crate) times: Mutex<Option<FileAttr>>,
    /// Subvolume holding this inode's locks; pinned at first inodelk so
    /// unlock reaches the same brick even if migration moves the data.
    pub(crate) lock_subvol: Mutex<Option<SubvolRef>>,
}

impl InodeCtx {
    fn new() -> InodeCtx {
        InodeCtx {
            layout: Mutex::new(None),
            times: Mutex::new(None),
            lock_subvol: Mutex::new(None),
        }
    }
}

/// Per-fd context: which subvolume the fd was opened on, and, once
/// migration is detected, the destination it was re-opened on.
pub(crate) struct FdCtx {
    pub(crate) gfid: Gfid,
    pub(crate) subvol: SubvolRef,
    pub(crate) fd: Fd,
    pub(crate) acc: AccessMode,
    pub(crate) flags: OpenFlags,
    /// Written once by the first operation that chases a migrated file;
    /// read by every subsequent operation on this fd.
    pub(crate) dst: RwLock<Option<(SubvolRef, Fd)>>,
}

/// Per-directory-fd context: one brick handle per subvolume, walked in
/// order by readdir.
pub(crate) struct DirFdCtx {
    pub(crate) gfid: Gfid,
    pub(crate) fds: Vec<(SubvolRef, Fd)>,
}

/// The distribute cluster.
pub struct Distribute {
    name: String,
    subvolumes: Vec<SubvolRef>,
    pub(crate) options: RwLock<Options>,
    /// Compiled munging patterns; swapped wholesale on reconfigure.
    pub(crate) regexes: RwLock<MungeRegexes>,
    /// Runtime-state version; bumped on child up/modified events. Layouts
    /// built under an older generation are revalidated before use.
    generation: AtomicU32,
    /// Guarded by the same lock discipline as the original layout lock:
    /// all inode-to-layout transitions happen under this table's lock.
    inodes: RwLock<HashMap<Gfid, Arc<InodeCtx>>>,
    /// Interned single-subvolume layouts, index-aligned with `subvolumes`.
    file_layouts: Vec<Arc<Layout>>,
    pub(crate) subvol_state: Mutex<Vec<SubvolState>>,
    pub(crate) du_stats: Mutex<Vec<DuStats>>,
    pub(crate) last_du_fetch: Mutex<Option<Instant>>,
    fds: RwLock<HashMap<u64, Arc<FdCtx>>>,
    dir_fds: RwLock<HashMap<u64, Arc<DirFdCtx>>>,
    next_fd: AtomicU64,
    gfid_counter: AtomicU64,
    /// Observed by the migration engine between expensive steps.
    pub(crate) rebalance_abort: AtomicBool,
    self_ref: Weak<Distribute>,
}

impl Distribute {
    /// Build a cluster over `subvolumes`. Fails on an empty or
    /// duplicate-named subvolume set, mirroring volume-graph validation.
    pub fn new(
        name: impl Into<String>,
        subvolumes: Vec<SubvolRef>,
        options: Options,
    ) -> io::Result<Arc<Distribute>> {
        let name = name.into();
        if subvolumes.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("volume {name}: distribute needs at least one subvolume"),
            ));
        }
        for (i, a) in subvolumes.iter().enumerate() {
            for b in subvolumes.iter().skip(i + 1) {
                if a.name() == b.name() {
                    return Err(io::Error::new(
                        ErrorKind::InvalidInput,
                        format!("volume {name}: duplicate subvolume name {}", a.name()),
                    ));
                }
            }
        }

        let regexes = options.compile_regexes();
        let file_layouts = subvolumes
            .iter()
            .map(|s| Arc::new(Layout::preset(s.clone(), 0)))
            .collect();
        let subvol_state = subvolumes.iter().map(|_| SubvolState::new()).collect();
        let du_stats = subvolumes.iter().map(|_| DuStats::new()).collect();

        info!(
            "volume {name}: distribute over {} subvolumes",
            subvolumes.len()
        );

        Ok(Arc::new_cyclic(|self_ref| Distribute {
            name,
            subvolumes,
            options: RwLock::new(options),
            regexes: RwLock::new(regexes),
            generation: AtomicU32::new(1),
            inodes: RwLock::new(HashMap::new()),
            file_layouts,
            subvol_state: Mutex::new(subvol_state),
            du_stats: Mutex::new(du_stats),
            last_du_fetch: Mutex::new(None),
            fds: RwLock::new(HashMap::new()),
            dir_fds: RwLock::new(HashMap::new()),
            next_fd: AtomicU64::new(1),
            gfid_counter: AtomicU64::new(1),
            rebalance_abort: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        }))
    }

    /// A strong handle to this cluster, for detaching background work.
    pub(crate) fn self_arc(&self) -> Arc<Distribute> {
        self.self_ref
            .upgrade()
            .expect("cluster outlives its in-flight operations")
    }

    /// Volume name, also the identity this layer reports in pathinfo.
    pub fn volname(&self) -> &str {
        &self.name
    }

    pub fn subvolumes(&self) -> &[SubvolRef] {
        &self.subvolumes
    }

    pub fn subvol_count(&self) -> usize {
        self.subvolumes.len()
    }

    pub fn subvol_by_name(&self, name: &str) -> Option<SubvolRef> {
        self.subvolumes.iter().find(|s| s.name() == name).cloned()
    }

    pub(crate) fn subvol_index(&self, subvol: &SubvolRef) -> Option<usize> {
        self.subvolumes
            .iter()
            .position(|s| s.name() == subvol.name())
    }

    /// Current runtime-state version.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Apply option changes at runtime. Regexes recompile under the config
    /// lock; every other field is swapped in place.
    pub fn reconfigure<'a>(
        &self,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> io::Result<()> {
        let mut staged = self.options.read().clone();
        staged.set_many(pairs)?;
        let compiled = staged.compile_regexes();
        *self.options.write() = staged;
        *self.regexes.write() = compiled;
        debug!("volume {}: options reconfigured", self.name);
        Ok(())
    }

    /// Base xattr key for this cluster's on-disk records.
    pub(crate) fn xattr_name(&self) -> String {
        self.options.read().xattr_name.clone()
    }

    /// Key of the linkto xattr on pointer files.
    pub(crate) fn link_xattr_name(&self) -> String {
        self.options.read().link_xattr_name()
    }

    pub(crate) fn is_decommissioned(&self, subvol: &SubvolRef) -> bool {
        self.options
            .read()
            .decommissioned_bricks
            .iter()
            .any(|name| name == subvol.name())
    }

    /// Subvolumes eligible to receive new layout ranges: up and not being
    /// drained.
    pub(crate) fn usable_subvols(&self) -> Vec<SubvolRef> {
        let state = self.subvol_state.lock();
        self.subvolumes
            .iter()
            .enumerate()
            .filter(|&(i, subvol)| state[i].up && !self.is_decommissioned(subvol))
            .map(|(_, subvol)| subvol.clone())
            .collect()
    }

    pub(crate) fn subvol_is_up(&self, subvol: &SubvolRef) -> bool {
        match self.subvol_index(subvol) {
            Some(i) => self.subvol_state.lock()[i].up,
            None => false,
        }
    }

    /// A fresh layout sized for every subvolume, inheriting the configured
    /// spread count and the current generation.
    pub(crate) fn new_layout(&self, cnt: usize) -> Layout {
        let spread = {
            let opts = self.options.read();
            match opts.dir_spread_cnt {
                0 => self.subvol_count() as u32,
                n => n.min(self.subvol_count() as u32),
            }
        };
        Layout::new(cnt, spread, self.generation())
    }

    fn inode_ctx(&self, gfid: Gfid) -> Arc<InodeCtx> {
        if let Some(ctx) = self.inodes.read().get(&gfid) {
            return ctx.clone();
        }
        self.inodes
            .write()
            .entry(gfid)
            .or_insert_with(|| Arc::new(InodeCtx::new()))
            .clone()
    }

    /// The cached layout for an inode, if any.
    pub fn layout_get(&self, gfid: Gfid) -> Option<Arc<Layout>> {
        let ctx = self.inodes.read().get(&gfid)?.clone();
        let layout = ctx.layout.lock().clone();
        layout
    }

    /// Associate a layout with an inode, replacing any previous one.
    pub(crate) fn layout_set(&self, gfid: Gfid, layout: Arc<Layout>) {
        let ctx = self.inode_ctx(gfid);
        *ctx.layout.lock() = Some(layout);
    }

    /// Drop the cached layout for an inode, forcing the next lookup to
    /// rebuild it.
    pub(crate) fn layout_drop(&self, gfid: Gfid) {
        if let Some(ctx) = self.inodes.read().get(&gfid) {
            *ctx.layout.lock() = None;
        }
    }

    /// The interned single-subvolume layout for `subvol`.
    pub(crate) fn preset_layout(&self, subvol: &SubvolRef) -> Option<Arc<Layout>> {
        let i = self.subvol_index(subvol)?;
        Some(self.file_layouts[i].clone())
    }

    /// Bind an inode to the one subvolume holding its data.
    pub(crate) fn layout_preset(&self, subvol: &SubvolRef, gfid: Gfid) -> FopResult<()> {
        let layout = self.preset_layout(subvol).ok_or_else(|| {
            info!("no pre-set layout for subvolume {}", subvol.name());
            Errno::EINVAL
        })?;
        self.layout_set(gfid, layout);
        Ok(())
    }

    /// The subvolume an inode's data lives on, per the cached layout.
    pub fn cached_subvol(&self, gfid: Gfid) -> Option<SubvolRef> {
        self.layout_get(gfid)?.cached_subvol()
    }

    /// True when a cached layout predates the current generation and must
    /// be revalidated. Preset layouts never go stale this way.
    pub(crate) fn layout_is_stale(&self, layout: &Layout) -> bool {
        !layout.preset && layout.r#gen < self.generation()
    }

    /// Hashed subvolume of `name` under `layout`.
    pub(crate) fn hashed_subvol(&self, layout: &Layout, name: &str) -> Option<SubvolRef> {
        let regexes = self.regexes.read();
        layout.search(name, &regexes)
    }

    pub(crate) fn update_times(&self, gfid: Gfid, attr: &FileAttr) {
        let ctx = self.inode_ctx(gfid);
        let mut times = ctx.times.lock();
        match &mut *times {
            Some(seen) => {
                // never let an older reply roll visible times backwards
                if attr.mtime > seen.mtime {
                    *seen = *attr;
                }
            }
            None => *times = Some(*attr),
        }
    }

    pub(crate) fn lock_subvol_pin(&self, gfid: Gfid, subvol: &SubvolRef) -> SubvolRef {
        let ctx = self.inode_ctx(gfid);
        let mut pinned = ctx.lock_subvol.lock();
        match &*pinned {
            Some(existing) => existing.clone(),
            None => {
                *pinned = Some(subvol.clone());
                subvol.clone()
            }
        }
    }

    /// Mint a gfid for a new entry whose caller did not supply one. The
    /// identity must exist before any brick is touched, so pointer and
    /// data copies of the same file agree on it.
    pub(crate) fn generate_gfid(&self) -> Gfid {
        let count = self.gfid_counter.fetch_add(1, Ordering::Relaxed);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut seed: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in self.name.bytes() {
            seed ^= u64::from(byte);
            seed = seed.wrapping_mul(0x1000_0000_01b3);
        }
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&(seed ^ nanos).to_be_bytes());
        raw[8..].copy_from_slice(&count.to_be_bytes());
        Gfid(raw)
    }

    pub(crate) fn fd_insert(&self, ctx: FdCtx) -> Fd {
        let logical = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.fds.write().insert(logical, Arc::new(ctx));
        Fd(logical)
    }

    pub(crate) fn fd_ctx(&self, fd: Fd) -> FopResult<Arc<FdCtx>> {
        self.fds.read().get(&fd.0).cloned().ok_or(Errno::EINVAL)
    }

    pub(crate) fn fd_remove(&self, fd: Fd) -> Option<Arc<FdCtx>> {
        self.fds.write().remove(&fd.0)
    }

    pub(crate) fn dir_fd_insert(&self, ctx: DirFdCtx) -> Fd {
        let logical = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.dir_fds.write().insert(logical, Arc::new(ctx));
        Fd(logical)
    }

    pub(crate) fn dir_fd_ctx(&self, fd: Fd) -> FopResult<Arc<DirFdCtx>> {
        self.dir_fds.read().get(&fd.0).cloned().ok_or(Errno::EINVAL)
    }

    pub(crate) fn dir_fd_remove(&self, fd: Fd) -> Option<Arc<DirFdCtx>> {
        self.dir_fds.write().remove(&fd.0)
    }
}

impl std::fmt::Debug for Distribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distribute")
            .field("name", &self.name)
            .field(
                "subvolumes",
                &self.subvolumes.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("generation", &self.generation())
            .finish()
    }
}

/// The upward face of the cluster: the same vtable its own children
/// expose, so distribute layers stack.
#[async_trait]
impl Subvolume for Distribute {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, loc: &Loc, xattr_req: &Xattrs) -> FopResult<LookupReply> {
        lookup::lookup(self, loc, xattr_req).await
    }

    async fn stat(&self, loc: &Loc) -> FopResult<FileAttr> {
        file_ops::stat(self, loc).await
    }

    async fn fstat(&self, fd: Fd) -> FopResult<FileAttr> {
        file_ops::fstat(self, fd).await
    }

    async fn truncate(&self, loc: &Loc, size: u64) -> FopResult<AttrPair> {
        file_ops::truncate(self, loc, size).await
    }

    async fn ftruncate(&self, fd: Fd, size: u64) -> FopResult<AttrPair> {
        file_ops::ftruncate(self, fd, size).await
    }

    async fn access(&self, loc: &Loc, mask: u32) -> FopResult<()> {
        file_ops::access(self, loc, mask).await
    }

    async fn readlink(&self, loc: &Loc) -> FopResult<String> {
        file_ops::readlink(self, loc).await
    }

    async fn mknod(
        &self,
        loc: &Loc,
        kind: FileType,
        perm: u16,
        rdev: u32,
        xattrs: &Xattrs,
    ) -> FopResult<EntryReply> {
        entry_ops::mknod(self, loc, kind, perm, rdev, xattrs).await
    }

    async fn mkdir(&self, loc: &Loc, perm: u16, xattrs: &Xattrs) -> FopResult<EntryReply> {
        entry_ops::mkdir(self, loc, perm, xattrs).await
    }

    async fn unlink(&self, loc: &Loc, xattrs: &Xattrs) -> FopResult<UnlinkReply> {
        entry_ops::unlink(self, loc, xattrs).await
    }

    async fn rmdir(&self, loc: &Loc) -> FopResult<UnlinkReply> {
        entry_ops::rmdir(self, loc).await
    }

    async fn symlink(&self, loc: &Loc, target: &str, xattrs: &Xattrs) -> FopResult<EntryReply> {
        entry_ops::symlink(self, loc, target, xattrs).await
    }

    async fn rename(&self, src: &Loc, dst: &Loc) -> FopResult<RenameReply> {
        rename::rename(self, src, dst).await
    }

    async fn link(&self, src: &Loc, dst: &Loc) -> FopResult<EntryReply> {
        entry_ops::link(self, src, dst).await
    }

    async fn open(&self, loc: &Loc, acc: AccessMode, flags: OpenFlags) -> FopResult<Fd> {
        file_ops::open(self, loc, acc, flags).await
    }

    async fn create(
        &self,
        loc: &Loc,
        acc: AccessMode,
        flags: OpenFlags,
        perm: u16,
        xattrs: &Xattrs,
    ) -> FopResult<CreateReply> {
        entry_ops::create(self, loc, acc, flags, perm, xattrs).await
    }

    async fn readv(&self, fd: Fd, size: usize, offset: u64) -> FopResult<ReadReply> {
        file_ops::readv(self, fd, size, offset).await
    }

    async fn writev(&self, fd: Fd, data: &[u8], offset: u64) -> FopResult<WriteReply> {
        file_ops::writev(self, fd, data, offset).await
    }

    async fn flush(&self, fd: Fd) -> FopResult<()> {
        file_ops::flush(self, fd).await
    }

    async fn fsync(&self, fd: Fd, datasync: bool) -> FopResult<AttrPair> {
        file_ops::fsync(self, fd, datasync).await
    }

    async fn opendir(&self, loc: &Loc) -> FopResult<Fd> {
        readdir::opendir(self, loc).await
    }

    async fn readdir(&self, fd: Fd, offset: u64, count: usize) -> FopResult<Vec<DirEntry>> {
        readdir::readdir(self, fd, offset, count).await
    }

    async fn readdirp(
        &self,
        fd: Fd,
        offset: u64,
        count: usize,
        xattr_req: &Xattrs,
    ) -> FopResult<Vec<DirEntry>> {
        readdir::readdirp(self, fd, offset, count, xattr_req).await
    }

    async fn fsyncdir(&self, fd: Fd, datasync: bool) -> FopResult<()> {
        readdir::fsyncdir(self, fd, datasync).await
    }

    async fn statfs(&self, loc: &Loc) -> FopResult<Statvfs> {
        file_ops::statfs(self, loc).await
    }

    async fn setxattr(&self, loc: &Loc, xattrs: &Xattrs, flags: i32) -> FopResult<()> {
        xattr_ops::setxattr(self, loc, xattrs, flags).await
    }

    async fn getxattr(&self, loc: &Loc, name: Option<&str>) -> FopResult<Xattrs> {
        xattr_ops::getxattr(self, loc, name).await
    }

    async fn fsetxattr(&self, fd: Fd, xattrs: &Xattrs, flags: i32) -> FopResult<()> {
        xattr_ops::fsetxattr(self, fd, xattrs, flags).await
    }

    async fn fgetxattr(&self, fd: Fd, name: Option<&str>) -> FopResult<Xattrs> {
        xattr_ops::fgetxattr(self, fd, name).await
    }

    async fn removexattr(&self, loc: &Loc, name: &str) -> FopResult<()> {
        xattr_ops::removexattr(self, loc, name).await
    }

    async fn fremovexattr(&self, fd: Fd, name: &str) -> FopResult<()> {
        xattr_ops::fremovexattr(self, fd, name).await
    }

    async fn xattrop(&self, loc: &Loc, op: XattropOp, xattrs: &Xattrs) -> FopResult<Xattrs> {
        file_ops::xattrop(self, loc, op, xattrs).await
    }

    async fn fxattrop(&self, fd: Fd, op: XattropOp, xattrs: &Xattrs) -> FopResult<Xattrs> {
        file_ops::fxattrop(self, fd, op, xattrs).await
    }

    async fn inodelk(
        &self,
        domain: &str,
        loc: &Loc,
        cmd: LockCmd,
        kind: LockKind,
    ) -> FopResult<()> {
        file_ops::inodelk(self, domain, loc, cmd, kind).await
    }

    async fn finodelk(&self, domain: &str, fd: Fd, cmd: LockCmd, kind: LockKind) -> FopResult<()> {
        file_ops::finodelk(self, domain, fd, cmd, kind).await
    }

    async fn entrylk(
        &self,
        domain: &str,
        loc: &Loc,
        basename: &str,
        cmd: LockCmd,
        kind: LockKind,
    ) -> FopResult<()> {
        file_ops::entrylk(self, domain, loc, basename, cmd, kind).await
    }

    async fn fentrylk(
        &self,
        domain: &str,
        fd: Fd,
        basename: &str,
        cmd: LockCmd,
        kind: LockKind,
    ) -> FopResult<()> {
        file_ops::fentrylk(self, domain, fd, basename, cmd, kind).await
    }

    async fn lk(&self, fd: Fd, cmd: LockCmd, lock: &PosixLock) -> FopResult<PosixLock> {
        file_ops::lk(self, fd, cmd, lock).await
    }

    async fn lease(&self, loc: &Loc, cmd: u32) -> FopResult<()> {
        file_ops::lease(self, loc, cmd).await
    }

    async fn setattr(&self, loc: &Loc, attrs: &SetAttrs) -> FopResult<AttrPair> {
        file_ops::setattr(self, loc, attrs).await
    }

    async fn fsetattr(&self, fd: Fd, attrs: &SetAttrs) -> FopResult<AttrPair> {
        file_ops::fsetattr(self, fd, attrs).await
    }

    async fn fallocate(&self, fd: Fd, mode: i32, offset: u64, len: u64) -> FopResult<AttrPair> {
        file_ops::fallocate(self, fd, mode, offset, len).await
    }

    async fn discard(&self, fd: Fd, offset: u64, len: u64) -> FopResult<AttrPair> {
        file_ops::discard(self, fd, offset, len).await
    }

    async fn zerofill(&self, fd: Fd, offset: u64, len: u64) -> FopResult<AttrPair> {
        file_ops::zerofill(self, fd, offset, len).await
    }

    async fn ipc(&self, op: i32, xattrs: &Xattrs) -> FopResult<()> {
        file_ops::ipc(self, op, xattrs).await
    }

    async fn forget(&self, gfid: Gfid) {
        self.inodes.write().remove(&gfid);
        for subvol in &self.subvolumes {
            subvol.forget(gfid).await;
        }
    }

    async fn release(&self, fd: Fd) -> FopResult<()> {
        file_ops::release(self, fd).await
    }

    async fn releasedir(&self, fd: Fd) -> FopResult<()> {
        readdir::releasedir(self, fd).await
    }
}
