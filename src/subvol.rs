//! The subvolume vtable: everything the cluster core calls downward.
//!
//! A subvolume is one underlying storage brick. Each operation is an
//! asynchronous dispatch; the reply arrives whenever the brick answers,
//! possibly concurrently with replies from sibling subvolumes. Reasonable
//! default implementations are provided so test doubles only implement
//! what they exercise.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bitflags::bitflags;
use log::warn;

use crate::errno::{Errno, FopResult};
use crate::types::{DirEntry, FileAttr, FileType, Gfid, Loc, Statvfs, Xattrs};

/// Shared handle to a subvolume. Slices, frames and inode contexts all
/// hold these; the brick outlives every in-flight operation.
pub type SubvolRef = Arc<dyn Subvolume>;

/// Subvolume identity is its name; names are unique within a cluster.
pub fn same_subvol(a: &SubvolRef, b: &SubvolRef) -> bool {
    a.name() == b.name()
}

/// Xattr key requesting a specific gfid on create/mknod, so a file keeps
/// its identity when re-created on another subvolume.
pub const GFID_REQ_KEY: &str = "gfid-req";
/// Marks an operation as internally generated (pointer-file maintenance),
/// exempting it from quota/permission enforcement below.
pub const INTERNAL_FOP_KEY: &str = "glusterfs.internal-fop";
/// Virtual xattr: where does this path physically live.
pub const PATHINFO_KEY: &str = "trusted.glusterfs.pathinfo";
/// Virtual xattr: target of a pointer file.
pub const LINKINFO_KEY: &str = "trusted.glusterfs.linkinfo";
/// Quota consumption, byte-summed across subvolumes on aggregation.
pub const QUOTA_SIZE_KEY: &str = "trusted.glusterfs.quota-size";
/// Setxattr trigger: migrate this file's data to its hashed subvolume.
pub const MIGRATE_DATA_KEY: &str = "trusted.distribute.migrate-data";
/// Setxattr value for [`MIGRATE_DATA_KEY`] that skips the free-space check.
pub const MIGRATE_DATA_FORCE: &str = "force";
/// Setxattr trigger: recompute this directory's layout.
pub const FIX_LAYOUT_KEY: &str = "distribute.fix.layout";
/// Setxattr trigger on the root: stop placing new files on a brick.
pub const DECOMMISSION_BRICK_KEY: &str = "decommission-brick";
/// Per-file count of open fds, consulted before reaping stale pointers.
pub const OPEN_FD_COUNT_KEY: &str = "glusterfs.open-fd-count";
/// Inodelk domain serializing renames against file migration.
pub const FILE_MIGRATE_DOMAIN: &str = "dht.file.migrate";
/// Inodelk domain serializing directory layout changes.
pub const LAYOUT_HEAL_DOMAIN: &str = "dht.layout.heal";
/// Leading tag of this layer's pathinfo contribution.
pub const PATHINFO_HEADER: &str = "DISTRIBUTE:";

/// Opaque per-subvolume open-file handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fd(pub u64);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Access mode of an open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

bitflags! {
    /// Open modifier flags, a subset of `O_*` relevant above the brick.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const APPEND = libc::O_APPEND as u32;
        const TRUNC = libc::O_TRUNC as u32;
        const NONBLOCK = libc::O_NONBLOCK as u32;
        const SYNC = libc::O_SYNC as u32;
    }
}

/// Attribute changes for setattr; `None` fields are left untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SetAttrs {
    pub mode: Option<u16>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl SetAttrs {
    /// Ownership-only change, as used when healing pointer files.
    pub fn owner(uid: u32, gid: u32) -> SetAttrs {
        SetAttrs {
            uid: Some(uid),
            gid: Some(gid),
            ..SetAttrs::default()
        }
    }

    /// Mode-only change.
    pub fn mode(mode: u16) -> SetAttrs {
        SetAttrs {
            mode: Some(mode),
            ..SetAttrs::default()
        }
    }
}

/// Lock manipulation command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockCmd {
    /// Block until granted.
    Lock,
    /// Fail with `EAGAIN` instead of blocking.
    TryLock,
    Unlock,
}

/// Lock exclusivity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// A posix byte-range lock as carried by `lk`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PosixLock {
    pub kind: LockKind,
    pub start: u64,
    /// 0 means "to end of file"
    pub len: u64,
    pub owner: u64,
}

/// Numeric-array operation applied atomically to xattr values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XattropOp {
    AddInt32,
    AddInt64,
}

/// Reply to `lookup`.
#[derive(Clone, Debug)]
pub struct LookupReply {
    pub attr: FileAttr,
    pub xattrs: Xattrs,
    pub postparent: Option<FileAttr>,
}

/// Reply to the entry-creating operations (mknod, mkdir, symlink, link).
#[derive(Clone, Debug)]
pub struct EntryReply {
    pub attr: FileAttr,
    pub preparent: FileAttr,
    pub postparent: FileAttr,
}

/// Reply to `create`: an entry plus the open handle.
#[derive(Clone, Debug)]
pub struct CreateReply {
    pub fd: Fd,
    pub entry: EntryReply,
}

/// Reply to the entry-removing operations (unlink, rmdir).
#[derive(Clone, Debug)]
pub struct UnlinkReply {
    pub preparent: FileAttr,
    pub postparent: FileAttr,
}

/// Reply to `rename`: attributes of the file under its new name.
#[derive(Clone, Debug)]
pub struct RenameReply {
    pub attr: FileAttr,
}

/// Reply to `readv`. `postbuf` carries the file attributes observed at
/// read time; the cluster inspects its mode bits for migration markers.
#[derive(Clone, Debug)]
pub struct ReadReply {
    pub data: Vec<u8>,
    pub postbuf: FileAttr,
}

/// Reply to `writev`.
#[derive(Clone, Debug)]
pub struct WriteReply {
    pub written: usize,
    pub prebuf: FileAttr,
    pub postbuf: FileAttr,
}

/// Before/after attributes from the attribute-changing operations.
#[derive(Clone, Copy, Debug)]
pub struct AttrPair {
    pub pre: FileAttr,
    pub post: FileAttr,
}

/// One storage brick, viewed from above.
///
/// Methods correspond one-to-one with the operations a posix brick stack
/// exposes. Every method is an asynchronous dispatch: it may be awaited
/// concurrently from many tasks, and replies of sibling calls arrive in
/// arbitrary order.
#[allow(clippy::too_many_arguments)]
#[async_trait]
pub trait Subvolume: Send + Sync + 'static {
    /// Stable unique name of this subvolume. Identity for layouts,
    /// pointer files and lock ordering.
    fn name(&self) -> &str;

    /// Look up a name and get its attributes, plus any xattrs whose keys
    /// appear in `xattr_req`.
    async fn lookup(&self, loc: &Loc, _xattr_req: &Xattrs) -> FopResult<LookupReply> {
        warn!("[Not Implemented] lookup(path: {:?})", loc.path);
        Err(Errno::ENOSYS)
    }

    /// Get attributes by path.
    async fn stat(&self, loc: &Loc) -> FopResult<FileAttr> {
        warn!("[Not Implemented] stat(path: {:?})", loc.path);
        Err(Errno::ENOSYS)
    }

    /// Get attributes by handle.
    async fn fstat(&self, fd: Fd) -> FopResult<FileAttr> {
        warn!("[Not Implemented] fstat({fd})");
        Err(Errno::ENOSYS)
    }

    async fn truncate(&self, loc: &Loc, size: u64) -> FopResult<AttrPair> {
        warn!("[Not Implemented] truncate(path: {:?}, size: {size})", loc.path);
        Err(Errno::ENOSYS)
    }

    async fn ftruncate(&self, fd: Fd, size: u64) -> FopResult<AttrPair> {
        warn!("[Not Implemented] ftruncate({fd}, size: {size})");
        Err(Errno::ENOSYS)
    }

    async fn access(&self, loc: &Loc, mask: u32) -> FopResult<()> {
        warn!("[Not Implemented] access(path: {:?}, mask: {mask:#o})", loc.path);
        Err(Errno::ENOSYS)
    }

    async fn readlink(&self, loc: &Loc) -> FopResult<String> {
        warn!("[Not Implemented] readlink(path: {:?})", loc.path);
        Err(Errno::ENOSYS)
    }

    /// Create a file node. `xattrs` may carry [`GFID_REQ_KEY`] and other
    /// creation-time attributes.
    async fn mknod(
        &self,
        loc: &Loc,
        kind: FileType,
        perm: u16,
        rdev: u32,
        _xattrs: &Xattrs,
    ) -> FopResult<EntryReply> {
        warn!(
            "[Not Implemented] mknod(path: {:?}, kind: {kind:?}, perm: {perm:#o}, rdev: {rdev})",
            loc.path
        );
        Err(Errno::ENOSYS)
    }

    async fn mkdir(&self, loc: &Loc, perm: u16, _xattrs: &Xattrs) -> FopResult<EntryReply> {
        warn!("[Not Implemented] mkdir(path: {:?}, perm: {perm:#o})", loc.path);
        Err(Errno::ENOSYS)
    }

    async fn unlink(&self, loc: &Loc, _xattrs: &Xattrs) -> FopResult<UnlinkReply> {
        warn!("[Not Implemented] unlink(path: {:?})", loc.path);
        Err(Errno::ENOSYS)
    }

    async fn rmdir(&self, loc: &Loc) -> FopResult<UnlinkReply> {
        warn!("[Not Implemented] rmdir(path: {:?})", loc.path);
        Err(Errno::ENOSYS)
    }

    async fn symlink(&self, loc: &Loc, target: &str, _xattrs: &Xattrs) -> FopResult<EntryReply> {
        warn!(
            "[Not Implemented] symlink(path: {:?}, target: {target:?})",
            loc.path
        );
        Err(Errno::ENOSYS)
    }

    async fn rename(&self, src: &Loc, dst: &Loc) -> FopResult<RenameReply> {
        warn!(
            "[Not Implemented] rename(src: {:?}, dst: {:?})",
            src.path, dst.path
        );
        Err(Errno::ENOSYS)
    }

    async fn link(&self, src: &Loc, dst: &Loc) -> FopResult<EntryReply> {
        warn!(
            "[Not Implemented] link(src: {:?}, dst: {:?})",
            src.path, dst.path
        );
        Err(Errno::ENOSYS)
    }

    async fn open(&self, loc: &Loc, acc: AccessMode, flags: OpenFlags) -> FopResult<Fd> {
        warn!(
            "[Not Implemented] open(path: {:?}, acc: {acc:?}, flags: {flags:?})",
            loc.path
        );
        Err(Errno::ENOSYS)
    }

    async fn create(
        &self,
        loc: &Loc,
        acc: AccessMode,
        flags: OpenFlags,
        perm: u16,
        _xattrs: &Xattrs,
    ) -> FopResult<CreateReply> {
        warn!(
            "[Not Implemented] create(path: {:?}, acc: {acc:?}, flags: {flags:?}, perm: {perm:#o})",
            loc.path
        );
        Err(Errno::ENOSYS)
    }

    async fn readv(&self, fd: Fd, size: usize, offset: u64) -> FopResult<ReadReply> {
        warn!("[Not Implemented] readv({fd}, size: {size}, offset: {offset})");
        Err(Errno::ENOSYS)
    }

    async fn writev(&self, fd: Fd, data: &[u8], offset: u64) -> FopResult<WriteReply> {
        warn!(
            "[Not Implemented] writev({fd}, len: {}, offset: {offset})",
            data.len()
        );
        Err(Errno::ENOSYS)
    }

    async fn flush(&self, fd: Fd) -> FopResult<()> {
        warn!("[Not Implemented] flush({fd})");
        Err(Errno::ENOSYS)
    }

    async fn fsync(&self, fd: Fd, datasync: bool) -> FopResult<AttrPair> {
        warn!("[Not Implemented] fsync({fd}, datasync: {datasync})");
        Err(Errno::ENOSYS)
    }

    async fn opendir(&self, loc: &Loc) -> FopResult<Fd> {
        warn!("[Not Implemented] opendir(path: {:?})", loc.path);
        Err(Errno::ENOSYS)
    }

    /// Plain directory listing from `offset`, at most `count` entries.
    async fn readdir(&self, fd: Fd, offset: u64, count: usize) -> FopResult<Vec<DirEntry>> {
        warn!("[Not Implemented] readdir({fd}, offset: {offset}, count: {count})");
        Err(Errno::ENOSYS)
    }

    /// Directory listing with attributes and requested xattrs per entry.
    async fn readdirp(
        &self,
        fd: Fd,
        offset: u64,
        count: usize,
        _xattr_req: &Xattrs,
    ) -> FopResult<Vec<DirEntry>> {
        warn!("[Not Implemented] readdirp({fd}, offset: {offset}, count: {count})");
        Err(Errno::ENOSYS)
    }

    async fn fsyncdir(&self, fd: Fd, datasync: bool) -> FopResult<()> {
        warn!("[Not Implemented] fsyncdir({fd}, datasync: {datasync})");
        Err(Errno::ENOSYS)
    }

    async fn statfs(&self, loc: &Loc) -> FopResult<Statvfs> {
        warn!("[Not Implemented] statfs(path: {:?})", loc.path);
        Err(Errno::ENOSYS)
    }

    async fn setxattr(&self, loc: &Loc, xattrs: &Xattrs, _flags: i32) -> FopResult<()> {
        warn!(
            "[Not Implemented] setxattr(path: {:?}, keys: {:?})",
            loc.path,
            xattrs.keys().collect::<Vec<_>>()
        );
        Err(Errno::ENOSYS)
    }

    /// Get one xattr, or all of them when `name` is `None`.
    async fn getxattr(&self, loc: &Loc, name: Option<&str>) -> FopResult<Xattrs> {
        warn!("[Not Implemented] getxattr(path: {:?}, name: {name:?})", loc.path);
        Err(Errno::ENOSYS)
    }

    async fn fsetxattr(&self, fd: Fd, xattrs: &Xattrs, _flags: i32) -> FopResult<()> {
        warn!(
            "[Not Implemented] fsetxattr({fd}, keys: {:?})",
            xattrs.keys().collect::<Vec<_>>()
        );
        Err(Errno::ENOSYS)
    }

    async fn fgetxattr(&self, fd: Fd, name: Option<&str>) -> FopResult<Xattrs> {
        warn!("[Not Implemented] fgetxattr({fd}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    async fn removexattr(&self, loc: &Loc, name: &str) -> FopResult<()> {
        warn!(
            "[Not Implemented] removexattr(path: {:?}, name: {name:?})",
            loc.path
        );
        Err(Errno::ENOSYS)
    }

    async fn fremovexattr(&self, fd: Fd, name: &str) -> FopResult<()> {
        warn!("[Not Implemented] fremovexattr({fd}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    async fn xattrop(&self, loc: &Loc, op: XattropOp, _xattrs: &Xattrs) -> FopResult<Xattrs> {
        warn!("[Not Implemented] xattrop(path: {:?}, op: {op:?})", loc.path);
        Err(Errno::ENOSYS)
    }

    async fn fxattrop(&self, fd: Fd, op: XattropOp, _xattrs: &Xattrs) -> FopResult<Xattrs> {
        warn!("[Not Implemented] fxattrop({fd}, op: {op:?})");
        Err(Errno::ENOSYS)
    }

    /// Take or release an inode lock in a named domain.
    async fn inodelk(
        &self,
        domain: &str,
        loc: &Loc,
        cmd: LockCmd,
        kind: LockKind,
    ) -> FopResult<()> {
        warn!(
            "[Not Implemented] inodelk(domain: {domain:?}, path: {:?}, cmd: {cmd:?}, kind: {kind:?})",
            loc.path
        );
        Err(Errno::ENOSYS)
    }

    async fn finodelk(&self, domain: &str, fd: Fd, cmd: LockCmd, kind: LockKind) -> FopResult<()> {
        warn!("[Not Implemented] finodelk(domain: {domain:?}, {fd}, cmd: {cmd:?}, kind: {kind:?})");
        Err(Errno::ENOSYS)
    }

    /// Take or release a lock on one name within a directory.
    async fn entrylk(
        &self,
        domain: &str,
        loc: &Loc,
        basename: &str,
        cmd: LockCmd,
        kind: LockKind,
    ) -> FopResult<()> {
        warn!(
            "[Not Implemented] entrylk(domain: {domain:?}, path: {:?}, basename: {basename:?}, cmd: {cmd:?}, kind: {kind:?})",
            loc.path
        );
        Err(Errno::ENOSYS)
    }

    async fn fentrylk(
        &self,
        domain: &str,
        fd: Fd,
        basename: &str,
        cmd: LockCmd,
        kind: LockKind,
    ) -> FopResult<()> {
        warn!(
            "[Not Implemented] fentrylk(domain: {domain:?}, {fd}, basename: {basename:?}, cmd: {cmd:?}, kind: {kind:?})"
        );
        Err(Errno::ENOSYS)
    }

    /// Posix advisory record lock.
    async fn lk(&self, fd: Fd, cmd: LockCmd, lock: &PosixLock) -> FopResult<PosixLock> {
        warn!("[Not Implemented] lk({fd}, cmd: {cmd:?}, lock: {lock:?})");
        Err(Errno::ENOSYS)
    }

    async fn lease(&self, loc: &Loc, cmd: u32) -> FopResult<()> {
        warn!("[Not Implemented] lease(path: {:?}, cmd: {cmd})", loc.path);
        Err(Errno::ENOSYS)
    }

    async fn setattr(&self, loc: &Loc, attrs: &SetAttrs) -> FopResult<AttrPair> {
        warn!(
            "[Not Implemented] setattr(path: {:?}, attrs: {attrs:?})",
            loc.path
        );
        Err(Errno::ENOSYS)
    }

    async fn fsetattr(&self, fd: Fd, attrs: &SetAttrs) -> FopResult<AttrPair> {
        warn!("[Not Implemented] fsetattr({fd}, attrs: {attrs:?})");
        Err(Errno::ENOSYS)
    }

    async fn fallocate(&self, fd: Fd, mode: i32, offset: u64, len: u64) -> FopResult<AttrPair> {
        warn!("[Not Implemented] fallocate({fd}, mode: {mode}, offset: {offset}, len: {len})");
        Err(Errno::ENOSYS)
    }

    async fn discard(&self, fd: Fd, offset: u64, len: u64) -> FopResult<AttrPair> {
        warn!("[Not Implemented] discard({fd}, offset: {offset}, len: {len})");
        Err(Errno::ENOSYS)
    }

    async fn zerofill(&self, fd: Fd, offset: u64, len: u64) -> FopResult<AttrPair> {
        warn!("[Not Implemented] zerofill({fd}, offset: {offset}, len: {len})");
        Err(Errno::ENOSYS)
    }

    /// Side-channel message to the brick process.
    async fn ipc(&self, op: i32, _xattrs: &Xattrs) -> FopResult<()> {
        warn!("[Not Implemented] ipc(op: {op})");
        Err(Errno::ENOSYS)
    }

    /// Drop any per-inode state. Never fails.
    async fn forget(&self, _gfid: Gfid) {}

    /// Close an open file handle.
    async fn release(&self, _fd: Fd) -> FopResult<()> {
        Ok(())
    }

    /// Close an open directory handle.
    async fn releasedir(&self, _fd: Fd) -> FopResult<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn Subvolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subvolume({})", self.name())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// A subvolume that only has a name; every operation is ENOSYS.
    pub(crate) struct NamedSubvol {
        name: String,
    }

    #[async_trait]
    impl Subvolume for NamedSubvol {
        fn name(&self) -> &str {
            &self.name
        }
    }

    /// `n` inert subvolumes named `test-subvol-0..n`.
    pub(crate) fn named_subvols(n: usize) -> Vec<SubvolRef> {
        (0..n)
            .map(|i| {
                Arc::new(NamedSubvol {
                    name: format!("test-subvol-{i}"),
                }) as SubvolRef
            })
            .collect()
    }
}
