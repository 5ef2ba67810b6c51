//! The rename protocol.
//!
//! Rename must move two name-to-location mappings without a concurrent
//! lookup ever resolving to nothing. For files: lock out migration, make
//! the new name resolvable first (pointer on its hashed subvolume, hard
//! link beside the data), do the one critical rename, then retire the old
//! name and any stale pointers. Directories rename on every subvolume,
//! with compensating reverse renames if any of them refuses.

use futures::future::join_all;
use log::{debug, info, warn};
use smallvec::SmallVec;

use crate::cluster::Distribute;
use crate::errno::{Errno, FopResult};
use crate::fanout::iatt_merge;
use crate::linkfile;
use crate::lookup;
use crate::subvol::{
    FILE_MIGRATE_DOMAIN, INTERNAL_FOP_KEY, LAYOUT_HEAL_DOMAIN, LockCmd, LockKind, RenameReply,
    SubvolRef, same_subvol,
};
use crate::types::{FileAttr, Loc, Xattrs};

/// How lock acquisition treats per-subvolume failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LockPolicy {
    /// Any failure releases everything acquired and fails the caller.
    FailOnAnyError,
    /// A subvolume that does not know the inode is skipped; the lock set
    /// proceeds with whoever granted.
    IgnoreEnoentEstale,
}

/// A set of (subvolume, location) inode locks, always acquired in
/// canonical order (by subvolume name, then path) so two clients locking
/// the same pair can never deadlock each other.
pub(crate) struct LockSet {
    domain: &'static str,
    entries: SmallVec<[(SubvolRef, Loc); 2]>,
}

impl LockSet {
    pub(crate) fn new(domain: &'static str) -> LockSet {
        LockSet {
            domain,
            entries: SmallVec::new(),
        }
    }

    pub(crate) fn add(&mut self, subvol: SubvolRef, loc: Loc) {
        let duplicate = self
            .entries
            .iter()
            .any(|(s, l)| same_subvol(s, &subvol) && l.path == loc.path);
        if !duplicate {
            self.entries.push((subvol, loc));
        }
    }

    /// Acquire every lock, in canonical order. Returns the indexes that
    /// actually locked; on error everything already acquired has been
    /// released.
    pub(crate) async fn acquire(&mut self, policy: LockPolicy) -> FopResult<Vec<usize>> {
        self.entries.sort_by(|(a, al), (b, bl)| {
            a.name().cmp(b.name()).then_with(|| al.path.cmp(&bl.path))
        });

        let mut locked = Vec::new();
        for (i, (subvol, loc)) in self.entries.iter().enumerate() {
            match subvol
                .inodelk(self.domain, loc, LockCmd::Lock, LockKind::Write)
                .await
            {
                Ok(()) => locked.push(i),
                Err(err) if policy == LockPolicy::IgnoreEnoentEstale && err.entry_missing() => {
                    debug!(
                        "skipping lock on {} for {}: {err}",
                        subvol.name(),
                        loc.path
                    );
                }
                Err(err) => {
                    warn!(
                        "acquiring inodelk failed on {} for {}: {err}",
                        subvol.name(),
                        loc.path
                    );
                    self.release(&locked).await;
                    return Err(err);
                }
            }
        }
        Ok(locked)
    }

    pub(crate) async fn release(&self, locked: &[usize]) {
        for &i in locked {
            let (subvol, loc) = &self.entries[i];
            if let Err(err) = subvol
                .inodelk(self.domain, loc, LockCmd::Unlock, LockKind::Write)
                .await
            {
                warn!(
                    "releasing inodelk failed on {} for {}: {err}",
                    subvol.name(),
                    loc.path
                );
            }
        }
    }
}

fn internal_xattrs() -> Xattrs {
    let mut xattrs = Xattrs::new();
    xattrs.set_str(INTERNAL_FOP_KEY, "yes");
    xattrs
}

pub(crate) async fn rename(dist: &Distribute, src: &Loc, dst: &Loc) -> FopResult<RenameReply> {
    if src.name.is_empty() || dst.name.is_empty() {
        return Err(Errno::EINVAL);
    }

    // a directory rename is recognizable from the cached layout shape
    if let Some(layout) = dist.layout_get(src.gfid) {
        if !layout.preset {
            return rename_dir(dist, src, dst).await;
        }
    } else {
        lookup::lookup(dist, src, &Xattrs::new()).await?;
        if let Some(layout) = dist.layout_get(src.gfid) {
            if !layout.preset {
                return rename_dir(dist, src, dst).await;
            }
        }
    }

    rename_file(dist, src, dst).await
}

struct RenameCtx {
    src_hashed: SubvolRef,
    src_cached: SubvolRef,
    dst_hashed: SubvolRef,
    dst_cached: Option<SubvolRef>,
    /// Pointer for the old name created on `dst_hashed`
    linked: bool,
    /// Hard link of the data under the new name created on `src_cached`
    added_link: bool,
}

impl RenameCtx {
    fn rename_subvol(&self) -> SubvolRef {
        match &self.dst_cached {
            Some(dst_cached) if same_subvol(&self.src_cached, dst_cached) => {
                self.src_cached.clone()
            }
            _ => self.dst_hashed.clone(),
        }
    }
}

async fn rename_file(dist: &Distribute, src: &Loc, dst: &Loc) -> FopResult<RenameReply> {
    let src_hashed = dist
        .layout_get(src.parent)
        .and_then(|l| dist.hashed_subvol(&l, &src.name))
        .ok_or_else(|| {
            info!("no hashed subvolume in layout for path={}", src.path);
            Errno::EINVAL
        })?;
    let src_cached = dist.cached_subvol(src.gfid).ok_or_else(|| {
        info!("no cached subvolume for path={}", src.path);
        Errno::EINVAL
    })?;
    let dst_hashed = dist
        .layout_get(dst.parent)
        .and_then(|l| dist.hashed_subvol(&l, &dst.name))
        .ok_or_else(|| {
            info!("no hashed subvolume in layout for path={}", dst.path);
            Errno::EINVAL
        })?;

    // does the destination name already exist somewhere?
    let mut dst = dst.clone();
    let dst_cached = match lookup::lookup(dist, &dst, &Xattrs::new()).await {
        Ok(reply) => {
            if reply.attr.is_dir() {
                return Err(Errno::EISDIR);
            }
            dst.gfid = reply.attr.gfid;
            dist.cached_subvol(dst.gfid)
        }
        Err(err) if err.entry_missing() => None,
        Err(err) => return Err(err),
    };

    let mut ctx = RenameCtx {
        src_hashed,
        src_cached,
        dst_hashed,
        dst_cached,
        linked: false,
        added_link: false,
    };

    // serialize against migration on the data copies
    let mut locks = LockSet::new(FILE_MIGRATE_DOMAIN);
    locks.add(ctx.src_cached.clone(), src.clone());
    if let Some(dst_cached) = &ctx.dst_cached {
        if !same_subvol(dst_cached, &ctx.src_cached) {
            locks.add(dst_cached.clone(), dst.clone());
        }
    }
    let held = locks.acquire(LockPolicy::FailOnAnyError).await?;

    let result = rename_file_locked(dist, src, &dst, &mut ctx).await;

    let result = match result {
        Ok(reply) => Ok(reply),
        Err(err) => {
            rename_cleanup(dist, src, &dst, &ctx).await;
            Err(err)
        }
    };

    locks.release(&held).await;

    if result.is_ok() {
        dist.layout_preset(&ctx.src_cached, src.gfid).ok();
    }
    result
}

/// Everything between lock and unlock of a file rename.
async fn rename_file_locked(
    dist: &Distribute,
    src: &Loc,
    dst: &Loc,
    ctx: &mut RenameCtx,
) -> FopResult<RenameReply> {
    // between our earlier lookup and the lock, rebalance may have turned
    // the data file into a pointer; renaming a pointer as if it were data
    // loses the file
    let link_key = dist.link_xattr_name();
    let mut req = Xattrs::new();
    req.set(&link_key, Vec::new());
    let mut endpoints = vec![(ctx.src_cached.clone(), src)];
    if let Some(dst_cached) = &ctx.dst_cached {
        endpoints.push((dst_cached.clone(), dst));
    }
    for (subvol, loc) in endpoints {
        match subvol.lookup(loc, &req).await {
            Ok(reply) => {
                if linkfile::is_linkfile(&reply.attr, &reply.xattrs, &link_key) {
                    warn!("{} migrated while rename was locking, aborting", loc.path);
                    return Err(Errno::EIO);
                }
            }
            // cannot prove the lock covers a data file, act as if it
            // does not
            Err(_) => return Err(Errno::EIO),
        }
    }

    let same_cached = ctx
        .dst_cached
        .as_ref()
        .is_some_and(|d| same_subvol(d, &ctx.src_cached));

    if same_cached {
        // both names resolve to the same subvolume; only a stale pointer
        // for the new name can be in the way
        if !same_subvol(&ctx.dst_hashed, ctx.dst_cached.as_ref().unwrap()) {
            match linkfile::linkfile_unlink(dist, &ctx.dst_hashed, dst).await {
                Ok(()) => {}
                Err(err) if err == Errno::ENOENT => {}
                Err(err) => return Err(err),
            }
        }
    } else {
        // make the new name reach the data before anything is renamed:
        // a pointer for the old name on the destination's hashed
        // subvolume (the critical rename will flip its name), and a hard
        // link of the data under the new name
        if !same_subvol(&ctx.src_cached, &ctx.dst_hashed) {
            if !same_subvol(&ctx.dst_hashed, &ctx.src_hashed) {
                linkfile::linkfile_create(dist, &ctx.src_cached, &ctx.dst_hashed, src, src.gfid)
                    .await?;
                ctx.linked = true;
            }
            ctx.src_cached.link(src, dst).await.map_err(|err| {
                debug!("link {} => {} failed: {err}", src.path, dst.path);
                err
            })?;
            ctx.added_link = true;
        }
    }

    let rename_subvol = ctx.rename_subvol();
    debug!(
        "renaming {} => {} ({})",
        src.path,
        dst.path,
        rename_subvol.name()
    );

    let reply = match rename_subvol.rename(src, dst).await {
        Ok(reply) => Some(reply),
        Err(err) => {
            if same_subvol(&rename_subvol, &ctx.src_cached) {
                // critical: the data file could not take its new name
                warn!("{}: rename on {} failed: {err}", src.path, rename_subvol.name());
                return Err(err);
            }
            // only the pointer failed to flip; the hard link already
            // carries the new name, so the operation stands
            info!(
                "{}: rename (linkto file) on {} failed: {err}",
                src.path,
                rename_subvol.name()
            );
            None
        }
    };

    // the new name resolves; retire everything the old state left behind
    let internal = internal_xattrs();

    if !same_cached {
        // the old name on the data subvolume (the hard link keeps the
        // data alive under the new name)
        if !same_subvol(&ctx.src_cached, &ctx.dst_hashed) {
            if let Err(err) = ctx.src_cached.unlink(src, &internal).await {
                warn!(
                    "{}: rename: unlink of old name on {} failed: {err}",
                    src.path,
                    ctx.src_cached.name()
                );
            }
        }
    } else if !same_subvol(&ctx.dst_hashed, &ctx.src_cached) {
        // renamed in place but the new name hashes elsewhere: it needs a
        // pointer there
        if let Err(err) =
            linkfile::linkfile_create(dist, &ctx.src_cached, &ctx.dst_hashed, dst, src.gfid).await
        {
            info!(
                "failed to create linkfile for {} on {}: {err}",
                dst.path,
                ctx.dst_hashed.name()
            );
        }
    }

    // the old name's pointer on its own hashed subvolume; never touch the
    // subvolume the critical rename ran on, it holds the new name now
    if !same_subvol(&ctx.src_hashed, &rename_subvol)
        && !same_subvol(&ctx.src_hashed, &ctx.src_cached)
    {
        match linkfile::linkfile_unlink(dist, &ctx.src_hashed, src).await {
            Ok(()) => {}
                Err(err) if err == Errno::ENOENT => {}
            Err(err) => warn!(
                "{}: rename: unlink on {} failed: {err}",
                src.path,
                ctx.src_hashed.name()
            ),
        }
    }

    // stale data under the new name on a third subvolume
    if let Some(dst_cached) = &ctx.dst_cached {
        if !same_subvol(dst_cached, &ctx.dst_hashed) && !same_subvol(dst_cached, &ctx.src_cached) {
            if let Err(err) = dst_cached.unlink(dst, &internal).await {
                warn!(
                    "{}: rename: unlink of stale data on {} failed: {err}",
                    dst.path,
                    dst_cached.name()
                );
            }
        }
    }

    let attr = reply.map(|r| r.attr).unwrap_or_default();
    Ok(RenameReply { attr })
}

/// Undo whatever an aborted rename managed to create, in reverse order.
async fn rename_cleanup(dist: &Distribute, src: &Loc, dst: &Loc, ctx: &RenameCtx) {
    if ctx
        .dst_cached
        .as_ref()
        .is_some_and(|d| same_subvol(d, &ctx.src_cached))
    {
        return;
    }

    if ctx.linked
        && !same_subvol(&ctx.dst_hashed, &ctx.src_hashed)
        && !same_subvol(&ctx.dst_hashed, &ctx.src_cached)
    {
        debug!(
            "unlinking linkfile {} @ {} => {}",
            src.path,
            ctx.dst_hashed.name(),
            ctx.src_cached.name()
        );
        if let Err(err) = linkfile::linkfile_unlink(dist, &ctx.dst_hashed, src).await {
            warn!(
                "{}: cleanup of linkfile on {} failed: {err}",
                src.path,
                ctx.dst_hashed.name()
            );
        }
    }

    if ctx.added_link && !same_subvol(&ctx.src_cached, &ctx.dst_hashed) {
        debug!(
            "unlinking link {} => {} ({})",
            src.path,
            dst.path,
            ctx.src_cached.name()
        );
        if let Err(err) = ctx.src_cached.unlink(dst, &internal_xattrs()).await {
            warn!(
                "{}: cleanup of added link on {} failed: {err}",
                dst.path,
                ctx.src_cached.name()
            );
        }
    }
}

/// Directory rename: every subvolume holds a copy, every copy renames.
async fn rename_dir(dist: &Distribute, src: &Loc, dst: &Loc) -> FopResult<RenameReply> {
    let subvols = dist.subvolumes().to_vec();

    // the destination, if it exists, must be an empty directory on every
    // subvolume
    match lookup::lookup(dist, dst, &Xattrs::new()).await {
        Ok(reply) if !reply.attr.is_dir() => return Err(Errno::ENOTDIR),
        Ok(_) => {
            for subvol in &subvols {
                if !dir_is_empty(dist, subvol, dst).await? {
                    return Err(Errno::ENOTEMPTY);
                }
            }
        }
        Err(err) if err.entry_missing() => {}
        Err(err) => return Err(err),
    }

    // lock the directory everywhere for layout changes; subvolumes that
    // never got this directory are skipped
    let mut locks = LockSet::new(LAYOUT_HEAL_DOMAIN);
    for subvol in &subvols {
        locks.add(subvol.clone(), src.clone());
    }
    let held = locks.acquire(LockPolicy::IgnoreEnoentEstale).await?;

    let replies = join_all(subvols.iter().map(|s| s.rename(src, dst))).await;

    let mut merged = FileAttr::default();
    let mut failed: Option<Errno> = None;
    let mut succeeded: Vec<SubvolRef> = Vec::new();
    for (subvol, reply) in subvols.iter().zip(replies) {
        match reply {
            Ok(reply) => {
                iatt_merge(&mut merged, &reply.attr);
                succeeded.push(subvol.clone());
            }
            Err(err) if err == Errno::ENOENT => {}
            Err(err) => {
                warn!(
                    "dir rename {} => {} failed on {}: {err}",
                    src.path,
                    dst.path,
                    subvol.name()
                );
                failed = Some(err);
            }
        }
    }

    if let Some(err) = failed {
        // put the successfully renamed copies back so the namespace
        // stays consistent before failing the caller
        let reverts = join_all(succeeded.iter().map(|s| s.rename(dst, src))).await;
        for (subvol, revert) in succeeded.iter().zip(reverts) {
            if let Err(revert_err) = revert {
                warn!(
                    "compensating rename {} => {} failed on {}: {revert_err}",
                    dst.path,
                    src.path,
                    subvol.name()
                );
            }
        }
        locks.release(&held).await;
        return Err(err);
    }

    locks.release(&held).await;
    crate::fanout::dir_stat_fixup(&mut merged);
    Ok(RenameReply { attr: merged })
}

async fn dir_is_empty(dist: &Distribute, subvol: &SubvolRef, loc: &Loc) -> FopResult<bool> {
    let fd = match subvol.opendir(loc).await {
        Ok(fd) => fd,
        Err(err) if err.entry_missing() => return Ok(true),
        Err(err) => return Err(err),
    };
    let entries = if dist.options.read().use_readdirp {
        subvol.readdirp(fd, 0, 2, &Xattrs::new()).await
    } else {
        subvol.readdir(fd, 0, 2).await
    };
    let _ = subvol.releasedir(fd).await;
    let entries = entries?;
    Ok(entries.iter().all(|e| e.name == "." || e.name == ".."))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::subvol::test_util::named_subvols;

    #[test]
    fn lock_set_orders_canonically_and_dedups() {
        let subvols = named_subvols(3);
        let mut set = LockSet::new(FILE_MIGRATE_DOMAIN);
        let loc_a = Loc {
            path: "/a".into(),
            name: "a".into(),
            ..Loc::default()
        };
        let loc_b = Loc {
            path: "/b".into(),
            name: "b".into(),
            ..Loc::default()
        };
        set.add(subvols[2].clone(), loc_a.clone());
        set.add(subvols[0].clone(), loc_b.clone());
        set.add(subvols[2].clone(), loc_a.clone());
        assert_eq!(set.entries.len(), 2);

        set.entries.sort_by(|(a, al), (b, bl)| {
            a.name().cmp(b.name()).then_with(|| al.path.cmp(&bl.path))
        });
        assert_eq!(set.entries[0].0.name(), "test-subvol-0");
        assert_eq!(set.entries[1].0.name(), "test-subvol-2");
    }

    #[test]
    fn rename_subvol_rule() {
        let subvols = named_subvols(3);
        let ctx = RenameCtx {
            src_hashed: subvols[0].clone(),
            src_cached: subvols[1].clone(),
            dst_hashed: subvols[2].clone(),
            dst_cached: None,
            linked: false,
            added_link: false,
        };
        // no destination: the rename flips the pointer on dst_hashed
        assert_eq!(ctx.rename_subvol().name(), subvols[2].name());

        let ctx = RenameCtx {
            dst_cached: Some(subvols[1].clone()),
            ..RenameCtx {
                src_hashed: subvols[0].clone(),
                src_cached: subvols[1].clone(),
                dst_hashed: subvols[2].clone(),
                dst_cached: None,
                linked: false,
                added_link: false,
            }
        };
        // same cached subvolume: rename the data in place
        assert_eq!(ctx.rename_subvol().name(), subvols[1].name());
    }
}
