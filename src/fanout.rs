//! Reply merging for K-way fan-out calls.
//!
//! One logical operation winds to several subvolumes; the replies are
//! folded into a single result with per-field rules: any success wins the
//! return, the latest error wins the errno, directory attributes aggregate,
//! xattr dictionaries merge key-wise and statvfs results rescale to a
//! common fragment size before summing.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use crate::errno::{Errno, FopResult};
use crate::subvol::QUOTA_SIZE_KEY;
use crate::types::{FileAttr, Statvfs, Xattrs};

/// Size every merged directory iatt reports, regardless of how many
/// subvolumes hold a copy.
pub(crate) const DIR_STAT_SIZE: u64 = 4096;
/// Block count every merged directory iatt reports.
pub(crate) const DIR_STAT_BLOCKS: u64 = 8;

/// Outstanding-reply counter for a fan-out call. Each reply calls
/// [`CallCount::last_call`]; the one that drains the counter runs the
/// terminal transition.
pub(crate) struct CallCount(AtomicUsize);

impl CallCount {
    pub(crate) fn new(count: usize) -> CallCount {
        CallCount(AtomicUsize::new(count))
    }

    /// Account one reply; true when it was the last outstanding one.
    pub(crate) fn last_call(&self) -> bool {
        self.0.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Running `(op_ret, op_errno)` pair of a fan-out call.
///
/// The first success pins the final result to "ok"; each error overwrites
/// the errno. Lock-acquire failures are never masked by later successes,
/// which `fail_hard` implements.
#[derive(Debug, Default)]
pub(crate) struct OpResult {
    succeeded: bool,
    hard_failed: bool,
    errno: Option<Errno>,
}

impl OpResult {
    pub(crate) fn new() -> OpResult {
        OpResult::default()
    }

    pub(crate) fn absorb<T>(&mut self, reply: &FopResult<T>) {
        match reply {
            Ok(_) => self.succeeded = true,
            Err(errno) => self.errno = Some(*errno),
        }
    }

    /// Record a failure that later successes must not hide.
    pub(crate) fn fail_hard(&mut self, errno: Errno) {
        self.hard_failed = true;
        self.errno = Some(errno);
    }

    pub(crate) fn any_success(&self) -> bool {
        self.succeeded
    }

    pub(crate) fn errno(&self) -> Errno {
        self.errno.unwrap_or(Errno::EIO)
    }

    /// Collapse into the single pair the caller sees.
    pub(crate) fn finish(&self) -> FopResult<()> {
        if self.hard_failed || !self.succeeded {
            Err(self.errno())
        } else {
            Ok(())
        }
    }
}

/// Fold one directory reply's attributes into the accumulator. Identity
/// fields follow the latest reply; sizes and block counts add up; times
/// never move backwards.
pub(crate) fn iatt_merge(to: &mut FileAttr, from: &FileAttr) {
    to.gfid = from.gfid;
    to.kind = from.kind;
    to.perm = from.perm;
    to.nlink = from.nlink;
    to.uid = from.uid;
    to.gid = from.gid;
    to.rdev = from.rdev;
    to.blksize = from.blksize;
    to.size += from.size;
    to.blocks += from.blocks;
    to.atime = to.atime.max(from.atime);
    to.mtime = to.mtime.max(from.mtime);
    to.ctime = to.ctime.max(from.ctime);
}

/// Pin a merged directory iatt to the fixed size every client reports.
pub(crate) fn dir_stat_fixup(attr: &mut FileAttr) {
    attr.size = DIR_STAT_SIZE;
    attr.blocks = DIR_STAT_BLOCKS;
}

/// Merge one subvolume's xattr reply into the accumulated dictionary.
///
/// First writer wins per key, except quota sizes, which byte-sum as
/// network-order 64-bit integers. Conflicting `user.*` values are kept
/// from the first reply and logged, never failed.
pub(crate) fn xattr_aggregate(dst: &mut Xattrs, src: &Xattrs) {
    for (key, value) in src {
        if key == QUOTA_SIZE_KEY {
            let sum = match (decode_quota(dst.get(key)), decode_quota(Some(value))) {
                (have, Some(incoming)) => have.unwrap_or(0).wrapping_add(incoming),
                (_, None) => {
                    warn!("ignoring malformed quota size value ({} bytes)", value.len());
                    continue;
                }
            };
            dst.set(key.clone(), sum.to_be_bytes().to_vec());
            continue;
        }

        match dst.get(key) {
            None => dst.set(key.clone(), value.clone()),
            Some(existing) => {
                if key.starts_with("user.") && existing != value.as_slice() {
                    warn!("user xattr {key:?} differs between subvolumes");
                }
            }
        }
    }
}

fn decode_quota(raw: Option<&[u8]>) -> Option<i64> {
    let raw: [u8; 8] = raw?.try_into().ok()?;
    Some(i64::from_be_bytes(raw))
}

fn normalize_stats(stats: &mut Statvfs, bsize: u64, frsize: u64) {
    if stats.frsize != 0 && stats.frsize != frsize {
        stats.blocks = stats.blocks * stats.frsize / frsize;
        stats.bfree = stats.bfree * stats.frsize / frsize;
        stats.bavail = stats.bavail * stats.frsize / frsize;
    }
    stats.bsize = bsize;
    stats.frsize = frsize;
}

/// Fold one statvfs reply into the accumulator: rescale both sides to the
/// larger fragment size, then sum the counts.
pub(crate) fn statfs_merge(acc: &mut Statvfs, reply: &Statvfs) {
    let mut reply = *reply;
    let bsize = acc.bsize.max(reply.bsize);
    let frsize = acc.frsize.max(reply.frsize);
    normalize_stats(acc, bsize, frsize);
    normalize_stats(&mut reply, bsize, frsize);

    acc.blocks += reply.blocks;
    acc.bfree += reply.bfree;
    acc.bavail += reply.bavail;
    acc.files += reply.files;
    acc.ffree += reply.ffree;
    acc.namemax = match (acc.namemax, reply.namemax) {
        (0, n) | (n, 0) => n,
        (a, b) => a.min(b),
    };
}
