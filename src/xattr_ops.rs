//! Extended-attribute operations and the virtual xattr namespace.
//!
//! A handful of reserved keys never reach the bricks as-is: pathinfo and
//! linkinfo answer questions about placement, quota sizes aggregate
//! across subvolumes, and three setxattr keys are administrative triggers
//! (data migration, layout recompute, brick decommission).

use futures::future::join_all;
use log::{debug, info, warn};

use crate::cluster::Distribute;
use crate::errno::{Errno, FopResult};
use crate::fanout::{self, OpResult};
use crate::lookup;
use crate::rebalance::{self, MigrateMode, MigrateOutcome};
use crate::selfheal;
use crate::subvol::{
    DECOMMISSION_BRICK_KEY, FIX_LAYOUT_KEY, Fd, LINKINFO_KEY, MIGRATE_DATA_FORCE,
    MIGRATE_DATA_KEY, PATHINFO_HEADER, PATHINFO_KEY, QUOTA_SIZE_KEY, SubvolRef,
};
use crate::types::{Gfid, Loc, Xattrs};

pub(crate) async fn getxattr(
    dist: &Distribute,
    loc: &Loc,
    name: Option<&str>,
) -> FopResult<Xattrs> {
    match name {
        Some(PATHINFO_KEY) => pathinfo(dist, loc).await,
        Some(LINKINFO_KEY) => linkinfo(dist, loc).await,
        Some(QUOTA_SIZE_KEY) => quota_size(dist, loc).await,
        Some(key) if key.starts_with(&dist.xattr_name()) => {
            // the layout record is an implementation detail, not an
            // attribute of the file
            Err(Errno::ENODATA)
        }
        _ => plain_getxattr(dist, loc, name).await,
    }
}

async fn plain_getxattr(dist: &Distribute, loc: &Loc, name: Option<&str>) -> FopResult<Xattrs> {
    let layout = dist.layout_get(loc.gfid).ok_or(Errno::EINVAL)?;

    if layout.preset {
        let cached = layout.cached_subvol().ok_or(Errno::EINVAL)?;
        return cached.getxattr(loc, name).await;
    }

    let targets: Vec<SubvolRef> = layout.slices().iter().filter_map(|s| s.subvol.clone()).collect();
    let replies = join_all(targets.iter().map(|s| s.getxattr(loc, name))).await;

    let mut op = OpResult::new();
    let mut merged = Xattrs::new();
    for reply in &replies {
        op.absorb(reply);
        if let Ok(xattrs) = reply {
            fanout::xattr_aggregate(&mut merged, xattrs);
        }
    }
    op.finish()?;

    // the internal layout record never leaves this layer
    merged.remove(&dist.xattr_name());
    Ok(merged)
}

/// `trusted.glusterfs.pathinfo`: where the path physically lives, with
/// the layout ranges appended for directories.
async fn pathinfo(dist: &Distribute, loc: &Loc) -> FopResult<Xattrs> {
    let layout = dist.layout_get(loc.gfid).ok_or(Errno::EINVAL)?;

    let mut children = Vec::new();
    let targets: Vec<SubvolRef> = layout.slices().iter().filter_map(|s| s.subvol.clone()).collect();
    for subvol in &targets {
        let child = match subvol.getxattr(loc, Some(PATHINFO_KEY)).await {
            Ok(xattrs) => xattrs
                .get_str(PATHINFO_KEY)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("<{}:{}>", subvol.name(), loc.path)),
            Err(_) => format!("<{}:{}>", subvol.name(), loc.path),
        };
        children.push(child);
    }

    let mut info = format!(
        "(<{}{}> {}",
        PATHINFO_HEADER,
        dist.volname(),
        children.join(" ")
    );
    if !layout.preset {
        let ranges: Vec<String> = layout
            .slices()
            .iter()
            .filter(|s| s.err == 0 && s.start != s.stop)
            .map(|s| {
                format!(
                    "({} {} {})",
                    s.subvol.as_ref().map_or("?", |x| x.name()),
                    s.start,
                    s.stop
                )
            })
            .collect();
        info.push_str(&format!(" ({}-layout {})", dist.volname(), ranges.join(" ")));
    }
    info.push(')');

    let mut out = Xattrs::new();
    out.set_str(PATHINFO_KEY, &info);
    Ok(out)
}

/// `trusted.glusterfs.linkinfo`: the target a pointer file names.
async fn linkinfo(dist: &Distribute, loc: &Loc) -> FopResult<Xattrs> {
    let parent_layout = dist.layout_get(loc.parent).ok_or(Errno::EINVAL)?;
    let hashed = dist
        .hashed_subvol(&parent_layout, &loc.name)
        .ok_or(Errno::ENOENT)?;
    let link_key = dist.link_xattr_name();

    let xattrs = hashed.getxattr(loc, Some(&link_key)).await?;
    let target = xattrs.get_str(&link_key).ok_or(Errno::ENODATA)?;

    let mut out = Xattrs::new();
    out.set_str(LINKINFO_KEY, target);
    Ok(out)
}

/// `trusted.glusterfs.quota-size`: byte-summed across every subvolume.
async fn quota_size(dist: &Distribute, loc: &Loc) -> FopResult<Xattrs> {
    let subvols = dist.subvolumes().to_vec();
    let replies = join_all(
        subvols
            .iter()
            .map(|s| s.getxattr(loc, Some(QUOTA_SIZE_KEY))),
    )
    .await;

    let mut op = OpResult::new();
    let mut merged = Xattrs::new();
    for reply in &replies {
        op.absorb(reply);
        if let Ok(xattrs) = reply {
            fanout::xattr_aggregate(&mut merged, xattrs);
        }
    }
    op.finish()?;
    Ok(merged)
}

pub(crate) async fn setxattr(
    dist: &Distribute,
    loc: &Loc,
    xattrs: &Xattrs,
    flags: i32,
) -> FopResult<()> {
    if let Some(value) = xattrs.get_str(MIGRATE_DATA_KEY) {
        let mode = if value == MIGRATE_DATA_FORCE {
            MigrateMode::Force
        } else {
            MigrateMode::Normal
        };
        return trigger_migration(dist, loc, mode).await;
    }

    if xattrs.contains(FIX_LAYOUT_KEY) {
        return fix_layout(dist, loc).await;
    }

    if let Some(brick) = xattrs.get_str(DECOMMISSION_BRICK_KEY) {
        return decommission_brick(dist, loc, brick);
    }

    // nobody writes this layer's bookkeeping from above
    let xattr_name = dist.xattr_name();
    if xattrs.keys().any(|k| k.starts_with(&xattr_name)) {
        return Err(Errno::EPERM);
    }

    let layout = dist.layout_get(loc.gfid).ok_or(Errno::EINVAL)?;
    if layout.preset {
        let cached = layout.cached_subvol().ok_or(Errno::EINVAL)?;
        return cached.setxattr(loc, xattrs, flags).await;
    }

    let targets: Vec<SubvolRef> = layout.slices().iter().filter_map(|s| s.subvol.clone()).collect();
    let replies = join_all(targets.iter().map(|s| s.setxattr(loc, xattrs, flags))).await;
    let mut op = OpResult::new();
    for reply in &replies {
        op.absorb(reply);
    }
    op.finish()
}

/// Administrative `migrate-data` trigger: move this file's data to the
/// subvolume its name hashes to.
async fn trigger_migration(dist: &Distribute, loc: &Loc, mode: MigrateMode) -> FopResult<()> {
    // refresh placement knowledge before deciding anything
    let reply = lookup::lookup(dist, loc, &Xattrs::new()).await?;
    let mut loc = loc.clone();
    if loc.gfid.is_null() {
        loc.gfid = reply.attr.gfid;
    }

    let from = dist.cached_subvol(loc.gfid).ok_or(Errno::EINVAL)?;
    let parent_layout = dist.layout_get(loc.parent).ok_or(Errno::EINVAL)?;
    let to = dist
        .hashed_subvol(&parent_layout, &loc.name)
        .ok_or(Errno::ENOENT)?;

    if from.name() == to.name() {
        debug!("{} already lives on its hashed subvolume", loc.path);
        return Ok(());
    }

    info!(
        "migrate-data: {} from {} to {}",
        loc.path,
        from.name(),
        to.name()
    );
    match rebalance::migrate_file(dist, &loc, &from, &to, mode).await {
        Ok(MigrateOutcome::Done) => Ok(()),
        // not a failure, but nothing moved either: tell the admin why
        Ok(MigrateOutcome::Skipped) => Err(Errno::EPERM),
        Err(_) => Err(Errno::ENOSPC),
    }
}

/// Administrative `distribute.fix.layout` trigger: recompute and rewrite
/// this directory's layout.
async fn fix_layout(dist: &Distribute, loc: &Loc) -> FopResult<()> {
    let reply = lookup::lookup(dist, loc, &Xattrs::new()).await?;
    if !reply.attr.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    let mut dir_loc = loc.clone();
    if dir_loc.gfid.is_null() {
        dir_loc.gfid = reply.attr.gfid;
    }

    let mut layout = dist.new_layout(dist.subvol_count());
    let empty = Xattrs::new();
    for subvol in dist.subvolumes() {
        let _ = layout.merge(subvol.clone(), Ok(&empty), &dist.xattr_name());
    }
    selfheal::heal_directory(dist, &dir_loc, layout, &reply.attr).await?;
    info!("fixed layout of {}", dir_loc.path);
    Ok(())
}

/// Administrative decommission trigger, accepted on the root only.
fn decommission_brick(dist: &Distribute, loc: &Loc, brick: &str) -> FopResult<()> {
    if loc.gfid != Gfid::ROOT {
        return Err(Errno::EINVAL);
    }
    let brick = brick.trim();
    if dist.subvol_by_name(brick).is_none() {
        warn!("decommission request for unknown brick {brick:?}");
        return Err(Errno::EINVAL);
    }
    let mut opts = dist.options.write();
    if !opts.decommissioned_bricks.iter().any(|b| b == brick) {
        opts.decommissioned_bricks.push(brick.to_owned());
        info!("brick {brick} decommissioned, new files will avoid it");
    }
    Ok(())
}

pub(crate) async fn fsetxattr(
    dist: &Distribute,
    fd: Fd,
    xattrs: &Xattrs,
    flags: i32,
) -> FopResult<()> {
    let xattr_name = dist.xattr_name();
    if xattrs.keys().any(|k| k.starts_with(&xattr_name)) {
        return Err(Errno::EPERM);
    }
    let ctx = dist.fd_ctx(fd)?;
    let (subvol, brick_fd) = match ctx.dst.read().clone() {
        Some(dst) => dst,
        None => (ctx.subvol.clone(), ctx.fd),
    };
    subvol.fsetxattr(brick_fd, xattrs, flags).await
}

pub(crate) async fn fgetxattr(dist: &Distribute, fd: Fd, name: Option<&str>) -> FopResult<Xattrs> {
    let ctx = dist.fd_ctx(fd)?;
    let (subvol, brick_fd) = match ctx.dst.read().clone() {
        Some(dst) => dst,
        None => (ctx.subvol.clone(), ctx.fd),
    };
    subvol.fgetxattr(brick_fd, name).await
}

pub(crate) async fn removexattr(dist: &Distribute, loc: &Loc, name: &str) -> FopResult<()> {
    if name.starts_with(&dist.xattr_name()) {
        return Err(Errno::EPERM);
    }
    let layout = dist.layout_get(loc.gfid).ok_or(Errno::EINVAL)?;
    if layout.preset {
        let cached = layout.cached_subvol().ok_or(Errno::EINVAL)?;
        return cached.removexattr(loc, name).await;
    }
    let targets: Vec<SubvolRef> = layout.slices().iter().filter_map(|s| s.subvol.clone()).collect();
    let replies = join_all(targets.iter().map(|s| s.removexattr(loc, name))).await;
    let mut op = OpResult::new();
    for reply in &replies {
        op.absorb(reply);
    }
    op.finish()
}

pub(crate) async fn fremovexattr(dist: &Distribute, fd: Fd, name: &str) -> FopResult<()> {
    if name.starts_with(&dist.xattr_name()) {
        return Err(Errno::EPERM);
    }
    let ctx = dist.fd_ctx(fd)?;
    let (subvol, brick_fd) = match ctx.dst.read().clone() {
        Some(dst) => dst,
        None => (ctx.subvol.clone(), ctx.fd),
    };
    subvol.fremovexattr(brick_fd, name).await
}
