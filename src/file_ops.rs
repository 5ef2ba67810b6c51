//! Data-path operations: reads, writes, attributes, locks.
//!
//! Most of these route to the one subvolume holding the file and pass the
//! reply through. The complication is rebalance: mid-operation the file
//! may be moving, which the source subvolume advertises through marker
//! mode bits in reply attributes. Every operation here gets two attempts:
//! if the first lands on a source that has given the file away, the
//! destination is chased down and the operation re-issued there once.

use futures::future::join_all;
use log::{debug, warn};

use crate::cluster::{Distribute, FdCtx};
use crate::errno::{Errno, FopResult};
use crate::fanout::{self, OpResult};
use crate::linkfile;
use crate::lookup;
use crate::subvol::{
    AccessMode, AttrPair, Fd, LockCmd, LockKind, OpenFlags, PosixLock, SetAttrs, SubvolRef,
    XattropOp,
};
use crate::types::{FileAttr, Loc, MigrationPhase, Statvfs, Xattrs, strip_phase1_flags};

/// True when an error means "this subvolume no longer holds the file" and
/// the destination is worth chasing.
fn worth_chasing(err: Errno) -> bool {
    err.entry_missing() || err == Errno::EREMOTE
}

/// The subvolume+handle an fd-based operation should use right now.
fn fd_target(ctx: &FdCtx) -> (SubvolRef, Fd) {
    match ctx.dst.read().clone() {
        Some((subvol, fd)) => (subvol, fd),
        None => (ctx.subvol.clone(), ctx.fd),
    }
}

/// Open the migration destination and pin it in the fd context. Runs the
/// resolution at most once per fd.
async fn open_on_migration_target(dist: &Distribute, ctx: &FdCtx) -> FopResult<(SubvolRef, Fd)> {
    if let Some(dst) = ctx.dst.read().clone() {
        return Ok(dst);
    }

    let loc = Loc::from_gfid(ctx.gfid);
    let target = migration_target(dist, &ctx.subvol, &loc).await?;
    let dst_fd = target.open(&loc, ctx.acc, ctx.flags).await?;

    let raced = {
        let mut dst = ctx.dst.write();
        match &*dst {
            // somebody else won the race; give our duplicate handle back
            Some(existing) => Some((existing.clone(), dst_fd)),
            None => {
                *dst = Some((target.clone(), dst_fd));
                None
            }
        }
    };
    if let Some(((subvol, fd), duplicate)) = raced {
        let _ = target.release(duplicate).await;
        return Ok((subvol, fd));
    }
    Ok((target, dst_fd))
}

/// The migration finished: re-open on the destination and rebind the
/// inode's cached subvolume to it.
async fn rebalance_complete_check(dist: &Distribute, ctx: &FdCtx) -> FopResult<(SubvolRef, Fd)> {
    let (target, dst_fd) = open_on_migration_target(dist, ctx).await?;
    let _ = dist.layout_preset(&target, ctx.gfid);
    debug!("file {} moved to {}, fd re-opened", ctx.gfid, target.name());
    Ok((target, dst_fd))
}

/// Phase-1 variant: migration still copying. The destination is opened so
/// mutating operations can be applied to both copies, and the source is
/// stamped to fence late external writes. The source stays the inode's
/// cached subvolume until the move completes.
async fn rebalance_in_progress_check(
    dist: &Distribute,
    ctx: &FdCtx,
) -> FopResult<(SubvolRef, Fd)> {
    let loc = Loc::from_gfid(ctx.gfid);
    let fence_key = dist.options.read().no_external_writes_key();
    let mut fence = Xattrs::new();
    fence.set(fence_key, vec![1u8]);
    if let Err(err) = ctx.subvol.setxattr(&loc, &fence, 0).await {
        debug!("could not fence writes on {}: {err}", ctx.subvol.name());
    }
    open_on_migration_target(dist, ctx).await
}

/// Where did the file on `src` go: its linkto xattr if it is a stub, or a
/// cluster-wide discover as a last resort.
async fn migration_target(dist: &Distribute, src: &SubvolRef, loc: &Loc) -> FopResult<SubvolRef> {
    let link_key = dist.link_xattr_name();
    let mut req = Xattrs::new();
    req.set(&link_key, Vec::new());

    match src.lookup(loc, &req).await {
        Ok(reply) => {
            if let Some(target) = linkfile::linkfile_subvol(dist, &reply.xattrs, &link_key) {
                return Ok(target);
            }
        }
        Err(err) if err.entry_missing() => {}
        Err(err) => return Err(err),
    }

    // stub already reaped; ask everyone
    lookup::lookup(dist, loc, &Xattrs::new()).await?;
    dist.cached_subvol(loc.gfid).ok_or(Errno::EIO)
}

/// Loc-based variant of the chase: rebind the inode's cached subvolume.
async fn chase_migrated_loc(dist: &Distribute, loc: &Loc) -> FopResult<SubvolRef> {
    let cached = dist.cached_subvol(loc.gfid).ok_or(Errno::EINVAL)?;
    let target = migration_target(dist, &cached, loc).await?;
    let _ = dist.layout_preset(&target, loc.gfid);
    Ok(target)
}

/// The subvolume a loc-based file operation should start on, looking the
/// file up first if this inode has no context yet.
async fn cached_subvol_or_lookup(dist: &Distribute, loc: &Loc) -> FopResult<SubvolRef> {
    if let Some(cached) = dist.cached_subvol(loc.gfid) {
        return Ok(cached);
    }
    let reply = lookup::lookup(dist, loc, &Xattrs::new()).await?;
    dist.cached_subvol(reply.attr.gfid).ok_or(Errno::EINVAL)
}

pub(crate) async fn stat(dist: &Distribute, loc: &Loc) -> FopResult<FileAttr> {
    let layout = match dist.layout_get(loc.gfid) {
        Some(layout) => layout,
        None => {
            // no context yet: a full lookup both builds it and returns
            // fresh attributes
            let reply = lookup::lookup(dist, loc, &Xattrs::new()).await?;
            return Ok(reply.attr);
        }
    };

    if layout.preset {
        let cached = layout.cached_subvol().ok_or(Errno::EINVAL)?;
        let mut chased = false;
        let mut subvol = cached;
        loop {
            match subvol.stat(loc).await {
                Ok(mut attr) => {
                    if MigrationPhase::from_attr(&attr) == Some(MigrationPhase::Complete) && !chased
                    {
                        subvol = chase_migrated_loc(dist, loc).await?;
                        chased = true;
                        continue;
                    }
                    strip_phase1_flags(&mut attr);
                    return Ok(attr);
                }
                Err(err) if worth_chasing(err) && !chased => {
                    subvol = chase_migrated_loc(dist, loc).await?;
                    chased = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // directory: merge over every slice holder
    let targets: Vec<SubvolRef> = layout.slices().iter().filter_map(|s| s.subvol.clone()).collect();
    let replies = join_all(targets.iter().map(|s| s.stat(loc))).await;
    let mut op = OpResult::new();
    let mut merged = FileAttr::default();
    for reply in &replies {
        op.absorb(reply);
        if let Ok(attr) = reply {
            fanout::iatt_merge(&mut merged, attr);
        }
    }
    op.finish()?;
    fanout::dir_stat_fixup(&mut merged);
    Ok(merged)
}

pub(crate) async fn fstat(dist: &Distribute, fd: Fd) -> FopResult<FileAttr> {
    let ctx = dist.fd_ctx(fd)?;
    let (mut subvol, mut brick_fd) = fd_target(&ctx);
    let mut chased = false;
    loop {
        match subvol.fstat(brick_fd).await {
            Ok(mut attr) => {
                if MigrationPhase::from_attr(&attr) == Some(MigrationPhase::Complete) && !chased {
                    (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
                    chased = true;
                    continue;
                }
                strip_phase1_flags(&mut attr);
                return Ok(attr);
            }
            Err(err) if worth_chasing(err) && !chased => {
                (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
                chased = true;
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) async fn open(
    dist: &Distribute,
    loc: &Loc,
    acc: AccessMode,
    flags: OpenFlags,
) -> FopResult<Fd> {
    let mut subvol = cached_subvol_or_lookup(dist, loc).await?;
    let mut chased = false;
    loop {
        match subvol.open(loc, acc, flags).await {
            Ok(brick_fd) => {
                return Ok(dist.fd_insert(FdCtx {
                    gfid: loc.gfid,
                    subvol,
                    fd: brick_fd,
                    acc,
                    flags,
                    dst: parking_lot::RwLock::new(None),
                }));
            }
            Err(err) if worth_chasing(err) && !chased => {
                subvol = chase_migrated_loc(dist, loc).await?;
                chased = true;
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) async fn readv(
    dist: &Distribute,
    fd: Fd,
    size: usize,
    offset: u64,
) -> FopResult<crate::subvol::ReadReply> {
    let ctx = dist.fd_ctx(fd)?;
    let (mut subvol, mut brick_fd) = fd_target(&ctx);
    let mut chased = false;
    loop {
        match subvol.readv(brick_fd, size, offset).await {
            Ok(mut reply) => {
                // phase 1 still serves reads from the source; only a
                // completed migration moves the data out from under us
                if MigrationPhase::from_attr(&reply.postbuf) == Some(MigrationPhase::Complete)
                    && !chased
                {
                    (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
                    chased = true;
                    continue;
                }
                strip_phase1_flags(&mut reply.postbuf);
                return Ok(reply);
            }
            Err(err) if worth_chasing(err) && !chased => {
                (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
                chased = true;
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) async fn writev(
    dist: &Distribute,
    fd: Fd,
    data: &[u8],
    offset: u64,
) -> FopResult<crate::subvol::WriteReply> {
    let ctx = dist.fd_ctx(fd)?;
    let (mut subvol, mut brick_fd) = fd_target(&ctx);
    let mut chased = false;
    loop {
        match subvol.writev(brick_fd, data, offset).await {
            Ok(mut reply) => {
                match MigrationPhase::from_attr(&reply.postbuf) {
                    Some(MigrationPhase::Complete) if !chased => {
                        (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
                        chased = true;
                        continue;
                    }
                    Some(MigrationPhase::InProgress) if !chased => {
                        // the copier may already be past this offset;
                        // apply the write to the destination as well
                        (subvol, brick_fd) = rebalance_in_progress_check(dist, &ctx).await?;
                        chased = true;
                        continue;
                    }
                    _ => {}
                }
                strip_phase1_flags(&mut reply.postbuf);
                return Ok(reply);
            }
            Err(err) if worth_chasing(err) && !chased => {
                (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
                chased = true;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Shared retry loop for the fd-based attribute-changing operations,
/// which all reply with a pre/post attribute pair.
macro_rules! fd_attr_op {
    ($name:ident, $($arg:ident : $ty:ty),* ; $call:ident) => {
        pub(crate) async fn $name(
            dist: &Distribute,
            fd: Fd,
            $($arg: $ty),*
        ) -> FopResult<AttrPair> {
            let ctx = dist.fd_ctx(fd)?;
            let (mut subvol, mut brick_fd) = fd_target(&ctx);
            let mut chased = false;
            loop {
                match subvol.$call(brick_fd, $($arg),*).await {
                    Ok(mut pair) => {
                        match MigrationPhase::from_attr(&pair.post) {
                            Some(MigrationPhase::Complete) if !chased => {
                                (subvol, brick_fd) =
                                    rebalance_complete_check(dist, &ctx).await?;
                                chased = true;
                                continue;
                            }
                            Some(MigrationPhase::InProgress) if !chased => {
                                (subvol, brick_fd) =
                                    rebalance_in_progress_check(dist, &ctx).await?;
                                chased = true;
                                continue;
                            }
                            _ => {}
                        }
                        strip_phase1_flags(&mut pair.pre);
                        strip_phase1_flags(&mut pair.post);
                        return Ok(pair);
                    }
                    Err(err) if worth_chasing(err) && !chased => {
                        (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
                        chased = true;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    };
}

fd_attr_op!(ftruncate, size: u64 ; ftruncate);
fd_attr_op!(fallocate, mode: i32, offset: u64, len: u64 ; fallocate);
fd_attr_op!(discard, offset: u64, len: u64 ; discard);
fd_attr_op!(zerofill, offset: u64, len: u64 ; zerofill);

pub(crate) async fn fsetattr(dist: &Distribute, fd: Fd, attrs: &SetAttrs) -> FopResult<AttrPair> {
    let ctx = dist.fd_ctx(fd)?;
    let (mut subvol, mut brick_fd) = fd_target(&ctx);
    let mut chased = false;
    loop {
        match subvol.fsetattr(brick_fd, attrs).await {
            Ok(mut pair) => {
                if MigrationPhase::from_attr(&pair.post) == Some(MigrationPhase::Complete)
                    && !chased
                {
                    (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
                    chased = true;
                    continue;
                }
                strip_phase1_flags(&mut pair.pre);
                strip_phase1_flags(&mut pair.post);
                return Ok(pair);
            }
            Err(err) if worth_chasing(err) && !chased => {
                (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
                chased = true;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Loc-based attribute ops share this retry shape.
macro_rules! loc_attr_op {
    ($name:ident, $($arg:ident : $ty:ty),* ; $call:ident) => {
        pub(crate) async fn $name(
            dist: &Distribute,
            loc: &Loc,
            $($arg: $ty),*
        ) -> FopResult<AttrPair> {
            let layout = dist.layout_get(loc.gfid);
            if let Some(layout) = &layout {
                if !layout.preset {
                    // directory: apply on every subvolume, merge
                    let targets: Vec<SubvolRef> =
                        layout.slices().iter().filter_map(|s| s.subvol.clone()).collect();
                    let replies =
                        join_all(targets.iter().map(|s| s.$call(loc, $($arg),*))).await;
                    let mut op = OpResult::new();
                    let mut pre = FileAttr::default();
                    let mut post = FileAttr::default();
                    for reply in &replies {
                        op.absorb(reply);
                        if let Ok(pair) = reply {
                            fanout::iatt_merge(&mut pre, &pair.pre);
                            fanout::iatt_merge(&mut post, &pair.post);
                        }
                    }
                    op.finish()?;
                    fanout::dir_stat_fixup(&mut pre);
                    fanout::dir_stat_fixup(&mut post);
                    return Ok(AttrPair { pre, post });
                }
            }

            let mut subvol = cached_subvol_or_lookup(dist, loc).await?;
            let mut chased = false;
            loop {
                match subvol.$call(loc, $($arg),*).await {
                    Ok(mut pair) => {
                        if MigrationPhase::from_attr(&pair.post)
                            == Some(MigrationPhase::Complete)
                            && !chased
                        {
                            subvol = chase_migrated_loc(dist, loc).await?;
                            chased = true;
                            continue;
                        }
                        strip_phase1_flags(&mut pair.pre);
                        strip_phase1_flags(&mut pair.post);
                        return Ok(pair);
                    }
                    Err(err) if worth_chasing(err) && !chased => {
                        subvol = chase_migrated_loc(dist, loc).await?;
                        chased = true;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    };
}

loc_attr_op!(truncate, size: u64 ; truncate);
loc_attr_op!(setattr, attrs: &SetAttrs ; setattr);

pub(crate) async fn flush(dist: &Distribute, fd: Fd) -> FopResult<()> {
    let ctx = dist.fd_ctx(fd)?;
    let (subvol, brick_fd) = fd_target(&ctx);
    match subvol.flush(brick_fd).await {
        Err(err) if worth_chasing(err) => {
            let (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
            subvol.flush(brick_fd).await
        }
        other => other,
    }
}

pub(crate) async fn fsync(dist: &Distribute, fd: Fd, datasync: bool) -> FopResult<AttrPair> {
    let ctx = dist.fd_ctx(fd)?;
    let (mut subvol, mut brick_fd) = fd_target(&ctx);
    let mut chased = false;
    loop {
        match subvol.fsync(brick_fd, datasync).await {
            Ok(mut pair) => {
                if MigrationPhase::from_attr(&pair.post) == Some(MigrationPhase::Complete)
                    && !chased
                {
                    (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
                    chased = true;
                    continue;
                }
                strip_phase1_flags(&mut pair.pre);
                strip_phase1_flags(&mut pair.post);
                return Ok(pair);
            }
            Err(err) if worth_chasing(err) && !chased => {
                (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
                chased = true;
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) async fn release(dist: &Distribute, fd: Fd) -> FopResult<()> {
    let ctx = match dist.fd_remove(fd) {
        Some(ctx) => ctx,
        None => return Ok(()),
    };
    let _ = ctx.subvol.release(ctx.fd).await;
    let dst = ctx.dst.read().clone();
    if let Some((subvol, dst_fd)) = dst {
        let _ = subvol.release(dst_fd).await;
    }
    Ok(())
}

pub(crate) async fn access(dist: &Distribute, loc: &Loc, mask: u32) -> FopResult<()> {
    let subvol = cached_subvol_or_lookup(dist, loc).await?;
    match subvol.access(loc, mask).await {
        Err(err) if worth_chasing(err) => {
            let subvol = chase_migrated_loc(dist, loc).await?;
            subvol.access(loc, mask).await
        }
        other => other,
    }
}

pub(crate) async fn readlink(dist: &Distribute, loc: &Loc) -> FopResult<String> {
    let subvol = cached_subvol_or_lookup(dist, loc).await?;
    subvol.readlink(loc).await
}

pub(crate) async fn statfs(dist: &Distribute, loc: &Loc) -> FopResult<Statvfs> {
    let subvols = dist.subvolumes().to_vec();
    let replies = join_all(subvols.iter().map(|s| s.statfs(loc))).await;

    let mut op = OpResult::new();
    let mut merged = Statvfs::default();
    for reply in &replies {
        op.absorb(reply);
        if let Ok(statvfs) = reply {
            fanout::statfs_merge(&mut merged, statvfs);
        }
    }
    op.finish()?;
    Ok(merged)
}

pub(crate) async fn xattrop(
    dist: &Distribute,
    loc: &Loc,
    op: XattropOp,
    xattrs: &Xattrs,
) -> FopResult<Xattrs> {
    let subvol = cached_subvol_or_lookup(dist, loc).await?;
    match subvol.xattrop(loc, op, xattrs).await {
        Err(err) if worth_chasing(err) => {
            let subvol = chase_migrated_loc(dist, loc).await?;
            subvol.xattrop(loc, op, xattrs).await
        }
        other => other,
    }
}

pub(crate) async fn fxattrop(
    dist: &Distribute,
    fd: Fd,
    op: XattropOp,
    xattrs: &Xattrs,
) -> FopResult<Xattrs> {
    let ctx = dist.fd_ctx(fd)?;
    let (subvol, brick_fd) = fd_target(&ctx);
    match subvol.fxattrop(brick_fd, op, xattrs).await {
        Err(err) if worth_chasing(err) => {
            let (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
            subvol.fxattrop(brick_fd, op, xattrs).await
        }
        other => other,
    }
}

pub(crate) async fn inodelk(
    dist: &Distribute,
    domain: &str,
    loc: &Loc,
    cmd: LockCmd,
    kind: LockKind,
) -> FopResult<()> {
    let cached = cached_subvol_or_lookup(dist, loc).await?;
    // all lock traffic for an inode sticks to one subvolume, or an unlock
    // after migration would miss the lock
    let subvol = dist.lock_subvol_pin(loc.gfid, &cached);
    match subvol.inodelk(domain, loc, cmd, kind).await {
        Err(err) if worth_chasing(err) && cmd != LockCmd::Unlock => {
            let subvol = chase_migrated_loc(dist, loc).await?;
            subvol.inodelk(domain, loc, cmd, kind).await
        }
        other => other,
    }
}

pub(crate) async fn finodelk(
    dist: &Distribute,
    domain: &str,
    fd: Fd,
    cmd: LockCmd,
    kind: LockKind,
) -> FopResult<()> {
    let ctx = dist.fd_ctx(fd)?;
    let subvol = dist.lock_subvol_pin(ctx.gfid, &ctx.subvol);
    let brick_fd = if subvol.name() == ctx.subvol.name() {
        ctx.fd
    } else {
        match ctx.dst.read().clone() {
            Some((_, fd)) => fd,
            None => ctx.fd,
        }
    };
    subvol.finodelk(domain, brick_fd, cmd, kind).await
}

pub(crate) async fn entrylk(
    dist: &Distribute,
    domain: &str,
    loc: &Loc,
    basename: &str,
    cmd: LockCmd,
    kind: LockKind,
) -> FopResult<()> {
    let subvol = cached_subvol_or_lookup(dist, loc).await?;
    subvol.entrylk(domain, loc, basename, cmd, kind).await
}

pub(crate) async fn fentrylk(
    dist: &Distribute,
    domain: &str,
    fd: Fd,
    basename: &str,
    cmd: LockCmd,
    kind: LockKind,
) -> FopResult<()> {
    let ctx = dist.fd_ctx(fd)?;
    let (subvol, brick_fd) = fd_target(&ctx);
    subvol.fentrylk(domain, brick_fd, basename, cmd, kind).await
}

pub(crate) async fn lk(
    dist: &Distribute,
    fd: Fd,
    cmd: LockCmd,
    lock: &PosixLock,
) -> FopResult<PosixLock> {
    let ctx = dist.fd_ctx(fd)?;
    let (subvol, brick_fd) = fd_target(&ctx);
    match subvol.lk(brick_fd, cmd, lock).await {
        Err(err) if worth_chasing(err) && cmd != LockCmd::Unlock => {
            let (subvol, brick_fd) = rebalance_complete_check(dist, &ctx).await?;
            subvol.lk(brick_fd, cmd, lock).await
        }
        other => other,
    }
}

pub(crate) async fn lease(dist: &Distribute, loc: &Loc, cmd: u32) -> FopResult<()> {
    let subvol = cached_subvol_or_lookup(dist, loc).await?;
    subvol.lease(loc, cmd).await
}

pub(crate) async fn ipc(dist: &Distribute, op: i32, xattrs: &Xattrs) -> FopResult<()> {
    // side-channel messages go to the first reachable subvolume
    for subvol in dist.subvolumes() {
        match subvol.ipc(op, xattrs).await {
            Err(err) if err == Errno::ENOTCONN => continue,
            other => return other,
        }
    }
    Err(Errno::ENOTCONN)
}
