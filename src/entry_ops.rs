//! Namespace operations: create, mknod, mkdir, unlink, link, symlink,
//! rmdir.
//!
//! New files go to the subvolume their name hashes to unless it is short
//! on space, in which case the data lands on the roomiest subvolume and a
//! pointer file keeps the name resolvable on the hashed one. The pointer
//! is always created before the data so a concurrent lookup never sees
//! the name dangling.

use futures::future::join_all;
use log::{debug, info, warn};

use crate::cluster::{Distribute, FdCtx};
use crate::errno::{Errno, FopResult};
use crate::fanout::OpResult;
use crate::linkfile;
use crate::lookup;
use crate::selfheal;
use crate::subvol::{
    AccessMode, CreateReply, EntryReply, GFID_REQ_KEY, INTERNAL_FOP_KEY, OpenFlags, SubvolRef,
    UnlinkReply, same_subvol,
};
use crate::types::{FileType, Gfid, Loc, Xattrs};

/// Where a new file should go.
enum Placement {
    /// Hashed subvolume has room: data goes straight there.
    Direct(SubvolRef),
    /// Hashed subvolume is filled: pointer on `hashed`, data on `avail`.
    ViaLink { hashed: SubvolRef, avail: SubvolRef },
}

/// The gfid a new entry will carry: the caller's request, or one minted
/// here so every copy (pointer and data) agrees before any brick sees it.
fn settle_gfid(dist: &Distribute, xattrs: &mut Xattrs) -> Gfid {
    if let Some(raw) = xattrs.get(GFID_REQ_KEY) {
        if let Ok(raw) = <[u8; 16]>::try_from(raw) {
            return Gfid(raw);
        }
    }
    let gfid = dist.generate_gfid();
    xattrs.set(GFID_REQ_KEY, gfid.0.to_vec());
    gfid
}

/// Placement decision for a new file named by `loc`.
async fn pick_placement(dist: &Distribute, loc: &Loc) -> FopResult<Placement> {
    let parent_layout = dist.layout_get(loc.parent).ok_or(Errno::EINVAL)?;
    let hashed = dist
        .hashed_subvol(&parent_layout, &loc.name)
        .ok_or_else(|| {
            warn!("no subvolume in layout for path={}", loc.path);
            Errno::ENOENT
        })?;

    dist.maybe_refresh_du().await;

    if !dist.is_subvol_filled(&hashed) {
        return Ok(Placement::Direct(hashed));
    }

    let avail = dist.free_disk_available_subvol(&hashed);
    if same_subvol(&avail, &hashed) {
        return Ok(Placement::Direct(hashed));
    }
    Ok(Placement::ViaLink { hashed, avail })
}

pub(crate) async fn create(
    dist: &Distribute,
    loc: &Loc,
    acc: AccessMode,
    flags: OpenFlags,
    perm: u16,
    xattrs: &Xattrs,
) -> FopResult<CreateReply> {
    let (data_subvol, link_hashed) = match pick_placement(dist, loc).await? {
        Placement::Direct(subvol) => (subvol, None),
        Placement::ViaLink { hashed, avail } => {
            debug!(
                "creating {} on {} (hashed subvolume {} is full)",
                loc.path,
                avail.name(),
                hashed.name()
            );
            (avail, Some(hashed))
        }
    };

    let mut xattrs = xattrs.clone();
    let gfid = settle_gfid(dist, &mut xattrs);

    // pointer first: the name must resolve on the hashed subvolume before
    // the data exists anywhere else
    if let Some(hashed) = &link_hashed {
        linkfile::linkfile_create(dist, &data_subvol, hashed, loc, gfid).await?;
    }

    let reply = match data_subvol.create(loc, acc, flags, perm, &xattrs).await {
        Ok(reply) => reply,
        Err(err) => {
            if let Some(hashed) = &link_hashed {
                let _ = linkfile::linkfile_unlink(dist, hashed, loc).await;
            }
            return Err(err);
        }
    };

    if let Some(hashed) = &link_hashed {
        linkfile::linkfile_attr_heal(hashed, loc, &reply.entry.attr).await;
    }

    let gfid = reply.entry.attr.gfid;
    dist.layout_preset(&data_subvol, gfid)?;
    dist.update_times(gfid, &reply.entry.attr);

    let fd = dist.fd_insert(FdCtx {
        gfid,
        subvol: data_subvol,
        fd: reply.fd,
        acc,
        flags,
        dst: parking_lot::RwLock::new(None),
    });

    Ok(CreateReply {
        fd,
        entry: reply.entry,
    })
}

pub(crate) async fn mknod(
    dist: &Distribute,
    loc: &Loc,
    kind: FileType,
    perm: u16,
    rdev: u32,
    xattrs: &Xattrs,
) -> FopResult<EntryReply> {
    if kind == FileType::Directory {
        return Err(Errno::EINVAL);
    }

    let (data_subvol, link_hashed) = match pick_placement(dist, loc).await? {
        Placement::Direct(subvol) => (subvol, None),
        Placement::ViaLink { hashed, avail } => (avail, Some(hashed)),
    };

    let mut xattrs = xattrs.clone();
    let gfid = settle_gfid(dist, &mut xattrs);

    if let Some(hashed) = &link_hashed {
        linkfile::linkfile_create(dist, &data_subvol, hashed, loc, gfid).await?;
    }

    let reply = match data_subvol.mknod(loc, kind, perm, rdev, &xattrs).await {
        Ok(reply) => reply,
        Err(err) => {
            if let Some(hashed) = &link_hashed {
                let _ = linkfile::linkfile_unlink(dist, hashed, loc).await;
            }
            return Err(err);
        }
    };

    if let Some(hashed) = &link_hashed {
        linkfile::linkfile_attr_heal(hashed, loc, &reply.attr).await;
    }

    dist.layout_preset(&data_subvol, reply.attr.gfid)?;
    dist.update_times(reply.attr.gfid, &reply.attr);
    Ok(reply)
}

pub(crate) async fn mkdir(
    dist: &Distribute,
    loc: &Loc,
    perm: u16,
    xattrs: &Xattrs,
) -> FopResult<EntryReply> {
    let parent_layout = dist.layout_get(loc.parent).ok_or(Errno::EINVAL)?;
    let hashed = dist
        .hashed_subvol(&parent_layout, &loc.name)
        .ok_or(Errno::ENOENT)?;

    // the hashed subvolume goes first: it assigns the gfid and is the
    // copy a concurrent lookup will find
    let first = hashed.mkdir(loc, perm, xattrs).await?;
    let gfid = first.attr.gfid;

    let mut rest_xattrs = xattrs.clone();
    if !gfid.is_null() {
        rest_xattrs.set(GFID_REQ_KEY, gfid.0.to_vec());
    }
    rest_xattrs.set_str(INTERNAL_FOP_KEY, "yes");

    let rest: Vec<SubvolRef> = dist
        .subvolumes()
        .iter()
        .filter(|s| !same_subvol(s, &hashed))
        .cloned()
        .collect();
    let replies = join_all(rest.iter().map(|s| s.mkdir(loc, perm, &rest_xattrs))).await;

    // build the merged layout: the hashed copy plus whatever the rest did
    let mut layout = dist.new_layout(dist.subvol_count());
    let empty = Xattrs::new();
    let _ = layout.merge(hashed.clone(), Ok(&empty), &dist.xattr_name());
    for (subvol, reply) in rest.iter().zip(&replies) {
        let merge_input = match reply {
            Ok(_) => Ok(&empty),
            Err(err) if *err == Errno::EEXIST => Ok(&empty),
            Err(err) => Err(*err),
        };
        let _ = layout.merge(subvol.clone(), merge_input, &dist.xattr_name());
        if let Err(err) = reply {
            if *err != Errno::EEXIST {
                warn!(
                    "mkdir {} failed on {}: {err}",
                    loc.path,
                    subvol.name()
                );
            }
        }
    }

    let mut dir_loc = loc.clone();
    dir_loc.gfid = gfid;
    selfheal::heal_directory(dist, &dir_loc, layout, &first.attr).await?;

    dist.update_times(gfid, &first.attr);
    Ok(first)
}

pub(crate) async fn unlink(
    dist: &Distribute,
    loc: &Loc,
    xattrs: &Xattrs,
) -> FopResult<UnlinkReply> {
    let mut gfid = loc.gfid;
    let cached = match dist.cached_subvol(gfid) {
        Some(cached) => cached,
        None => {
            let reply = lookup::lookup(dist, loc, &Xattrs::new()).await?;
            gfid = reply.attr.gfid;
            dist.cached_subvol(gfid).ok_or(Errno::EINVAL)?
        }
    };
    let hashed = dist
        .layout_get(loc.parent)
        .and_then(|l| dist.hashed_subvol(&l, &loc.name));

    // the pointer goes first so the name stops resolving before the data
    // disappears
    if let Some(hashed) = &hashed {
        if !same_subvol(hashed, &cached) {
            match linkfile::linkfile_unlink(dist, hashed, loc).await {
                Ok(()) => {}
                Err(err) if err == Errno::ENOENT => {}
                Err(err) => {
                    warn!(
                        "failed to unlink linkfile {} on {}: {err}",
                        loc.path,
                        hashed.name()
                    );
                    return Err(err);
                }
            }
        }
    }

    let reply = cached.unlink(loc, xattrs).await?;
    dist.layout_drop(gfid);
    Ok(reply)
}

pub(crate) async fn link(dist: &Distribute, src: &Loc, dst: &Loc) -> FopResult<EntryReply> {
    let src_cached = dist.cached_subvol(src.gfid).ok_or(Errno::EINVAL)?;
    let dst_hashed = dist
        .layout_get(dst.parent)
        .and_then(|l| dist.hashed_subvol(&l, &dst.name))
        .ok_or(Errno::ENOENT)?;

    if !same_subvol(&src_cached, &dst_hashed) {
        // hard links cannot span subvolumes; a pointer under the new name
        // leads to the subvolume that can hold the link
        linkfile::linkfile_create(dist, &src_cached, &dst_hashed, dst, src.gfid).await?;
    }

    let reply = src_cached.link(src, dst).await?;
    dist.update_times(reply.attr.gfid, &reply.attr);
    Ok(reply)
}

pub(crate) async fn symlink(
    dist: &Distribute,
    loc: &Loc,
    target: &str,
    xattrs: &Xattrs,
) -> FopResult<EntryReply> {
    let parent_layout = dist.layout_get(loc.parent).ok_or(Errno::EINVAL)?;
    let hashed = dist
        .hashed_subvol(&parent_layout, &loc.name)
        .ok_or(Errno::ENOENT)?;

    let reply = hashed.symlink(loc, target, xattrs).await?;
    dist.layout_preset(&hashed, reply.attr.gfid)?;
    dist.update_times(reply.attr.gfid, &reply.attr);
    Ok(reply)
}

pub(crate) async fn rmdir(dist: &Distribute, loc: &Loc) -> FopResult<UnlinkReply> {
    let hashed = dist
        .layout_get(loc.parent)
        .and_then(|l| dist.hashed_subvol(&l, &loc.name));

    // every copy except the hashed one goes first; the name stays
    // resolvable until the very end
    let rest: Vec<SubvolRef> = dist
        .subvolumes()
        .iter()
        .filter(|s| match &hashed {
            Some(hashed) => !same_subvol(s, hashed),
            None => true,
        })
        .cloned()
        .collect();

    let replies = join_all(rest.iter().map(|s| s.rmdir(loc))).await;
    let mut op = OpResult::new();
    let mut last_ok: Option<UnlinkReply> = None;
    for (subvol, reply) in rest.iter().zip(replies) {
        match reply {
            Ok(unlink_reply) => {
                op.absorb::<()>(&Ok(()));
                last_ok = Some(unlink_reply);
            }
            // a missing copy is as good as a removed one
            Err(err) if err == Errno::ENOENT => op.absorb::<()>(&Ok(())),
            Err(err) => {
                info!("rmdir {} failed on {}: {err}", loc.path, subvol.name());
                op.fail_hard(err);
            }
        }
    }
    op.finish()?;

    let reply = match &hashed {
        Some(hashed) => match hashed.rmdir(loc).await {
            Ok(reply) => reply,
            Err(err) if err == Errno::ENOENT => last_ok.ok_or(Errno::ENOENT)?,
            Err(err) => return Err(err),
        },
        None => last_ok.ok_or(Errno::ENOENT)?,
    };

    dist.layout_drop(loc.gfid);
    Ok(reply)
}
