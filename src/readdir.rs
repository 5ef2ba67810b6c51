//! Directory listing across subvolumes.
//!
//! Every subvolume holds a copy of every directory, so a listing walks the
//! subvolumes in order, splicing their streams into one. The resume offset
//! encodes which subvolume a cursor is on; pointer files are hidden from
//! attribute-carrying listings, and directories are reported only from the
//! first subvolume so each shows up once.

use futures::future::join_all;
use log::debug;

use crate::cluster::{DirFdCtx, Distribute};
use crate::errno::{Errno, FopResult};
use crate::fanout::OpResult;
use crate::linkfile;
use crate::subvol::{Fd, SubvolRef};
use crate::types::{DirEntry, Loc, Xattrs};

/// Pack a per-subvolume offset and the subvolume's index into one opaque
/// cursor. Inverse of [`split_offset`].
fn join_offset(offset: u64, cnt: u64, idx: u64) -> u64 {
    offset * cnt + idx
}

fn split_offset(cursor: u64, cnt: u64) -> (u64, u64) {
    (cursor / cnt, cursor % cnt)
}

/// Open the directory on every subvolume; the logical fd owns one brick
/// handle per child.
pub(crate) async fn opendir(dist: &Distribute, loc: &Loc) -> FopResult<Fd> {
    let subvols = dist.subvolumes().to_vec();
    let replies = join_all(subvols.iter().map(|s| s.opendir(loc))).await;

    let mut op = OpResult::new();
    let mut fds = Vec::new();
    for (subvol, reply) in subvols.iter().zip(replies) {
        op.absorb(&reply);
        if let Ok(fd) = reply {
            fds.push((subvol.clone(), fd));
        }
    }
    op.finish()?;

    Ok(dist.dir_fd_insert(DirFdCtx {
        gfid: loc.gfid,
        fds,
    }))
}

enum ListKind {
    Plain,
    WithAttrs(Xattrs),
}

async fn list(
    dist: &Distribute,
    fd: Fd,
    cursor: u64,
    count: usize,
    kind: ListKind,
) -> FopResult<Vec<DirEntry>> {
    let ctx = dist.dir_fd_ctx(fd)?;
    let cnt = ctx.fds.len() as u64;
    if cnt == 0 {
        return Ok(Vec::new());
    }
    let link_key = dist.link_xattr_name();
    let (mut sub_offset, mut idx) = split_offset(cursor, cnt);

    let mut out: Vec<DirEntry> = Vec::new();
    while (idx as usize) < ctx.fds.len() && out.len() < count {
        let (subvol, sub_fd) = &ctx.fds[idx as usize];
        let want = count - out.len();
        let entries = match &kind {
            ListKind::Plain => subvol.readdir(*sub_fd, sub_offset, want).await,
            ListKind::WithAttrs(req) => subvol.readdirp(*sub_fd, sub_offset, want, req).await,
        };
        let entries = match entries {
            Ok(entries) => entries,
            // a dead subvolume hides its entries, it does not kill the
            // whole listing
            Err(err) if err == Errno::ENOTCONN => Vec::new(),
            Err(err) => return Err(err),
        };

        let exhausted = entries.is_empty();
        for entry in entries {
            sub_offset = entry.offset;
            if !keep_entry(dist, subvol, &entry, &kind, &link_key) {
                continue;
            }
            let mut entry = entry;
            entry.offset = join_offset(entry.offset, cnt, idx);
            if let Some(attr) = &mut entry.attr {
                crate::types::strip_phase1_flags(attr);
            }
            out.push(entry);
        }

        if exhausted {
            idx += 1;
            sub_offset = 0;
        } else if out.len() >= count {
            break;
        }
    }

    debug!("readdir {fd}: {} entries", out.len());
    Ok(out)
}

fn keep_entry(
    dist: &Distribute,
    subvol: &SubvolRef,
    entry: &DirEntry,
    kind: &ListKind,
    link_key: &str,
) -> bool {
    match kind {
        // plain listings carry no attributes to filter on
        ListKind::Plain => true,
        ListKind::WithAttrs(_) => {
            if let Some(attr) = &entry.attr {
                if linkfile::is_linkfile(attr, &entry.xattrs, link_key) {
                    return false;
                }
                if attr.is_dir() {
                    // each directory exists on every subvolume; report it
                    // from the first one only
                    return dist
                        .subvol_index(subvol)
                        .map_or(false, |i| i == 0);
                }
            }
            true
        }
    }
}

pub(crate) async fn readdir(
    dist: &Distribute,
    fd: Fd,
    offset: u64,
    count: usize,
) -> FopResult<Vec<DirEntry>> {
    list(dist, fd, offset, count, ListKind::Plain).await
}

pub(crate) async fn readdirp(
    dist: &Distribute,
    fd: Fd,
    offset: u64,
    count: usize,
    xattr_req: &Xattrs,
) -> FopResult<Vec<DirEntry>> {
    let mut req = xattr_req.clone();
    req.set(dist.link_xattr_name(), Vec::new());
    list(dist, fd, offset, count, ListKind::WithAttrs(req)).await
}

pub(crate) async fn fsyncdir(dist: &Distribute, fd: Fd, datasync: bool) -> FopResult<()> {
    let ctx = dist.dir_fd_ctx(fd)?;
    let replies = join_all(
        ctx.fds
            .iter()
            .map(|(subvol, sub_fd)| subvol.fsyncdir(*sub_fd, datasync)),
    )
    .await;

    let mut op = OpResult::new();
    for reply in &replies {
        op.absorb(reply);
    }
    op.finish()
}

pub(crate) async fn releasedir(dist: &Distribute, fd: Fd) -> FopResult<()> {
    let ctx = match dist.dir_fd_remove(fd) {
        Some(ctx) => ctx,
        None => return Ok(()),
    };
    for (subvol, sub_fd) in &ctx.fds {
        let _ = subvol.releasedir(*sub_fd).await;
    }
    Ok(())
}
