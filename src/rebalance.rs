//! The file migration engine.
//!
//! Moves one file's data between subvolumes while other clients keep
//! using it. The protocol is visible to everyone through two mode-bit
//! markers on the source: sticky+sgid while the copy runs, sticky-only
//! once the data has landed and only housekeeping remains. Clients react
//! to those markers in the data-path retry logic; this module only
//! produces them.

use std::sync::atomic::Ordering;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use log::{debug, error, info, warn};

use crate::cluster::Distribute;
use crate::errno::{Errno, FopResult};
use crate::linkfile;
use crate::lookup;
use crate::subvol::{
    AccessMode, Fd, GFID_REQ_KEY, INTERNAL_FOP_KEY, OpenFlags, SetAttrs, SubvolRef,
};
use crate::types::{
    FileAttr, FileType, LINKFILE_MODE, Loc, MODE_SGID, MODE_STICKY, Xattrs,
};

/// Copy chunk size.
const REBALANCE_BLKSIZE: usize = 128 * 1024;
/// Sector granularity for sparse detection and free-space accounting.
const DISK_SECTOR_SIZE: u64 = 512;

/// Whether the free-space check applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateMode {
    Normal,
    /// Administrative override: move the data even if it unbalances the
    /// cluster.
    Force,
}

/// What a migration attempt achieved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateOutcome {
    /// Data moved, source retired.
    Done,
    /// Nothing moved, and that was the right call (would unbalance, file
    /// has hardlinks). Not a failure.
    Skipped,
}

impl Distribute {
    /// Ask any in-flight migrations to stop at their next checkpoint.
    pub fn abort_rebalance(&self) {
        self.rebalance_abort.store(true, Ordering::Release);
    }

    /// Re-arm migrations after an abort.
    pub fn resume_rebalance(&self) {
        self.rebalance_abort.store(false, Ordering::Release);
    }

    fn rebalance_aborted(&self) -> bool {
        self.rebalance_abort.load(Ordering::Acquire)
    }

    /// Migrate a batch of files, bounded by the configured throttle.
    pub async fn migrate_files(
        &self,
        items: Vec<(Loc, SubvolRef, SubvolRef)>,
        mode: MigrateMode,
    ) -> Vec<FopResult<MigrateOutcome>> {
        let throttle = self.options.read().rebal_throttle;
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let width = throttle.max_parallel(cpus);

        let mut results = Vec::with_capacity(items.len());
        let mut in_flight = FuturesUnordered::new();
        let mut queue = items.into_iter();

        loop {
            while in_flight.len() < width {
                match queue.next() {
                    Some((loc, from, to)) => {
                        in_flight.push(async move {
                            migrate_file(self, &loc, &from, &to, mode).await
                        });
                    }
                    None => break,
                }
            }
            match in_flight.next().await {
                Some(result) => results.push(result),
                None => break,
            }
        }
        results
    }
}

/// Move one file from `from` to `to`.
///
/// Runs synchronously within the calling task; callers wanting a worker
/// spawn it themselves. Safe to race with foreground I/O: every phase
/// transition is a separate round-trip, so the markers become visible to
/// other clients strictly in order.
pub(crate) async fn migrate_file(
    dist: &Distribute,
    loc: &Loc,
    from: &SubvolRef,
    to: &SubvolRef,
    mode: MigrateMode,
) -> FopResult<MigrateOutcome> {
    info!(
        "{}: attempting to move from {} to {}",
        loc.path,
        from.name(),
        to.name()
    );

    let stbuf = from.lookup(loc, &Xattrs::new()).await.map_err(|err| {
        error!("{}: lookup failed on {}: {err}", loc.path, from.name());
        err
    })?;
    let stbuf = stbuf.attr;
    let src_perm = stbuf.perm;

    if stbuf.is_dir() {
        warn!("{}: migrate-file called on directory", loc.path);
        return Err(Errno::EISDIR);
    }
    if stbuf.nlink > 1 {
        warn!("{}: file has hardlinks", loc.path);
        return Err(Errno::ENOTSUP);
    }

    if !stbuf.is_regular() {
        return migrate_special_file(dist, loc, from, to, &stbuf).await;
    }

    if dist.rebalance_aborted() {
        return Err(Errno::EINTR);
    }

    // create the destination with the source's identity, as a pointer
    // back at the source until the copy lands
    let dst_fd = create_dst_file(dist, loc, from, to, &stbuf).await?;

    if mode != MigrateMode::Force {
        if let MigrateOutcome::Skipped = check_free_space(from, to, loc, &stbuf).await? {
            let _ = to.release(dst_fd).await;
            return Ok(MigrateOutcome::Skipped);
        }
    }

    // Phase 1: mark the source. Everyone now sees the move in progress.
    let src_fd = open_src_file(dist, loc, from, to, &stbuf).await?;

    let finish = async {
        let stbuf = from.fstat(src_fd).await.map_err(|err| {
            error!("failed to fstat file {} on {}: {err}", loc.path, from.name());
            err
        })?;

        let has_holes = stbuf.size > stbuf.blocks * DISK_SECTOR_SIZE;
        if let Err(err) = copy_data(dist, from, to, src_fd, dst_fd, stbuf.size, has_holes).await {
            error!("{}: failed to migrate data: {err}", loc.path);
            // reset the destination back to 0
            if let Err(trunc_err) = to.ftruncate(dst_fd, 0).await {
                error!(
                    "{}: failed to reset target size back to 0: {trunc_err}",
                    loc.path
                );
            }
            return Err(err);
        }

        // carry the source's xattrs over, best-effort
        match from.getxattr(loc, None).await {
            Ok(xattr) => {
                if let Err(err) = to.setxattr(loc, &xattr, 0).await {
                    warn!("{}: failed to set xattr on {}: {err}", loc.path, to.name());
                }
            }
            Err(err) => {
                warn!(
                    "{}: failed to get xattr from {}: {err}",
                    loc.path,
                    from.name()
                );
            }
        }

        if let Err(err) = to.fsync(dst_fd, false).await {
            warn!("{}: failed to fsync on {}: {err}", loc.path, to.name());
        }

        // Phase 2: data is in place, housekeeping follows
        let new_stbuf = from.fstat(src_fd).await.map_err(|err| {
            error!("failed to fstat file {} on {}: {err}", loc.path, from.name());
            err
        })?;

        // the marker bits belong to the migration, not the file; keep
        // them on the destination only if the file legitimately had them
        let mut final_perm = new_stbuf.perm;
        if src_perm & MODE_STICKY == 0 {
            final_perm &= !MODE_STICKY;
        }
        if src_perm & MODE_SGID == 0 {
            final_perm &= !MODE_SGID;
        }

        if let Err(err) = to
            .fsetattr(
                dst_fd,
                &SetAttrs {
                    mode: Some(final_perm),
                    uid: Some(new_stbuf.uid),
                    gid: Some(new_stbuf.gid),
                    ..SetAttrs::default()
                },
            )
            .await
        {
            warn!("{}: failed to perform setattr on {}: {err}", loc.path, to.name());
        }

        if let Err(err) = to
            .setattr(
                loc,
                &SetAttrs {
                    atime: Some(new_stbuf.atime),
                    mtime: Some(new_stbuf.mtime),
                    ..SetAttrs::default()
                },
            )
            .await
        {
            warn!("{}: failed to perform setattr on {}: {err}", loc.path, to.name());
        }

        // make the source a pointer stub before deleting it
        if let Err(err) = from.fsetattr(src_fd, &SetAttrs::mode(LINKFILE_MODE)).await {
            warn!(
                "{}: failed to perform setattr on {}: {err}",
                loc.path,
                from.name()
            );
        }

        // gfid check before the unlink: if someone re-created the name,
        // the new file must survive
        match from.stat(loc).await {
            Ok(check) if check.gfid == loc.gfid || loc.gfid.is_null() => {
                if let Err(err) = from.unlink(loc, &internal_xattrs()).await {
                    warn!(
                        "{}: failed to perform unlink on {}: {err}",
                        loc.path,
                        from.name()
                    );
                }
            }
            Ok(_) => {
                info!(
                    "{}: name re-created on {} during migration, leaving it",
                    loc.path,
                    from.name()
                );
            }
            Err(err) => {
                warn!("{}: failed to do a stat on {}: {err}", loc.path, from.name());
            }
        }

        // reclaim the data blocks even if the unlink path kept the name
        if let Err(err) = from.ftruncate(src_fd, 0).await {
            warn!(
                "{}: failed to perform truncate on {}: {err}",
                loc.path,
                from.name()
            );
        }

        // the destination is now the canonical file
        let link_key = dist.link_xattr_name();
        if let Err(err) = to.fremovexattr(dst_fd, &link_key).await {
            warn!(
                "{}: failed to perform removexattr on {}: {err}",
                loc.path,
                to.name()
            );
        }

        Ok(())
    };
    let result = finish.await;

    let _ = from.release(src_fd).await;
    let _ = to.release(dst_fd).await;
    result?;

    // refresh this client's own view of the file
    if !loc.gfid.is_null() {
        dist.layout_drop(loc.gfid);
        let _ = dist.layout_preset(to, loc.gfid);
    }
    if let Err(err) = lookup::lookup(dist, loc, &Xattrs::new()).await {
        warn!("{}: failed to lookup the file on subvolumes: {err}", loc.path);
    }

    info!(
        "completed migration of {} from subvolume {} to {}",
        loc.path,
        from.name(),
        to.name()
    );
    Ok(MigrateOutcome::Done)
}

fn internal_xattrs() -> Xattrs {
    let mut xattrs = Xattrs::new();
    xattrs.set_str(INTERNAL_FOP_KEY, "yes");
    xattrs
}

/// Create (or adopt) the destination file: same gfid, pointer mode,
/// linkto back at the source.
async fn create_dst_file(
    dist: &Distribute,
    loc: &Loc,
    from: &SubvolRef,
    to: &SubvolRef,
    stbuf: &FileAttr,
) -> FopResult<Fd> {
    match to.lookup(loc, &Xattrs::new()).await {
        Ok(existing) => {
            if existing.attr.gfid != stbuf.gfid {
                error!(
                    "file {} exists in {} with different gfid",
                    loc.path,
                    to.name()
                );
                return Err(Errno::EEXIST);
            }
            // an earlier interrupted run left its stub behind; reuse it
            return to.open(loc, AccessMode::ReadWrite, OpenFlags::empty()).await;
        }
        Err(err) if err.entry_missing() => {}
        Err(err) => {
            warn!("{}: failed to lookup file on {}: {err}", loc.path, to.name());
            return Err(err);
        }
    }

    let mut xattrs = Xattrs::new();
    xattrs.set(GFID_REQ_KEY, stbuf.gfid.0.to_vec());
    xattrs.set_str(&dist.link_xattr_name(), from.name());
    xattrs.set_str(INTERNAL_FOP_KEY, "yes");

    let reply = to
        .create(
            loc,
            AccessMode::ReadWrite,
            OpenFlags::empty(),
            LINKFILE_MODE,
            &xattrs,
        )
        .await
        .map_err(|err| {
            error!("failed to create {} on {}: {err}", loc.path, to.name());
            err
        })?;
    Ok(reply.fd)
}

/// The destination must be able to take the file without ending up worse
/// off than the source.
async fn check_free_space(
    from: &SubvolRef,
    to: &SubvolRef,
    loc: &Loc,
    stbuf: &FileAttr,
) -> FopResult<MigrateOutcome> {
    let src_statfs = from.statfs(loc).await.map_err(|err| {
        error!(
            "failed to get statfs of {} on {}: {err}",
            loc.path,
            from.name()
        );
        err
    })?;
    let dst_statfs = to.statfs(loc).await.map_err(|err| {
        error!(
            "failed to get statfs of {} on {}: {err}",
            loc.path,
            to.name()
        );
        err
    })?;

    let src_sectors = src_statfs.bavail * src_statfs.frsize / DISK_SECTOR_SIZE;
    let dst_sectors = dst_statfs.bavail * dst_statfs.frsize / DISK_SECTOR_SIZE;

    if dst_sectors < stbuf.blocks || dst_sectors < src_sectors.saturating_sub(stbuf.blocks) {
        warn!(
            "data movement attempted from node ({}) with higher disk space to a node ({}) with lesser disk space ({})",
            from.name(),
            to.name(),
            loc.path
        );
        return Ok(MigrateOutcome::Skipped);
    }
    Ok(MigrateOutcome::Done)
}

/// Open the source and mark it: linkto names the destination, sticky+sgid
/// announce "copy in progress".
async fn open_src_file(
    dist: &Distribute,
    loc: &Loc,
    from: &SubvolRef,
    to: &SubvolRef,
    stbuf: &FileAttr,
) -> FopResult<Fd> {
    let fd = from
        .open(loc, AccessMode::ReadWrite, OpenFlags::empty())
        .await
        .map_err(|err| {
            error!("failed to open file {} on {}: {err}", loc.path, from.name());
            err
        })?;

    let mut xattrs = Xattrs::new();
    xattrs.set_str(&dist.link_xattr_name(), to.name());
    if let Err(err) = from.setxattr(loc, &xattrs, 0).await {
        error!("failed to set xattr on {} in {}: {err}", loc.path, from.name());
        let _ = from.release(fd).await;
        return Err(err);
    }

    let marked = stbuf.perm | MODE_STICKY | MODE_SGID;
    if let Err(err) = from.setattr(loc, &SetAttrs::mode(marked)).await {
        error!("failed to set mode on {} in {}: {err}", loc.path, from.name());
        let _ = from.release(fd).await;
        return Err(err);
    }

    Ok(fd)
}

/// Chunked copy of the whole file, optionally skipping zero runs so
/// sparse files stay sparse.
async fn copy_data(
    dist: &Distribute,
    from: &SubvolRef,
    to: &SubvolRef,
    src_fd: Fd,
    dst_fd: Fd,
    size: u64,
    has_holes: bool,
) -> FopResult<()> {
    let mut total: u64 = 0;
    while total < size {
        if dist.rebalance_aborted() {
            return Err(Errno::EINTR);
        }

        let want = REBALANCE_BLKSIZE.min((size - total) as usize);
        let reply = from.readv(src_fd, want, total).await?;
        if reply.data.is_empty() {
            break;
        }
        let read = reply.data.len();

        if has_holes {
            write_with_holes(to, dst_fd, &reply.data, total).await?;
        } else {
            to.writev(dst_fd, &reply.data, total).await?;
        }

        total += read as u64;
    }
    debug!("copied {total} bytes");
    Ok(())
}

/// Write one chunk, skipping whole zero sectors. Pending non-zero runs
/// flush when a zero sector ends them; the trailing partial sector always
/// writes.
async fn write_with_holes(
    to: &SubvolRef,
    fd: Fd,
    buf: &[u8],
    offset: u64,
) -> FopResult<()> {
    let sector = DISK_SECTOR_SIZE as usize;
    let mut write_needed = false;
    let mut run_start = 0usize;
    let mut idx = 0usize;

    while idx + sector <= buf.len() {
        if buf[idx..idx + sector].iter().any(|&b| b != 0) {
            write_needed = true;
            idx += sector;
            continue;
        }

        if write_needed {
            to.writev(fd, &buf[run_start..idx], offset + run_start as u64)
                .await?;
            write_needed = false;
        }
        idx += sector;
        run_start = idx;
    }

    if idx < buf.len() || write_needed {
        to.writev(fd, &buf[run_start..], offset + run_start as u64)
            .await?;
    }
    Ok(())
}

/// Symlinks and device nodes carry no data: re-create on the destination
/// with the same gfid, then drop the source.
async fn migrate_special_file(
    dist: &Distribute,
    loc: &Loc,
    from: &SubvolRef,
    to: &SubvolRef,
    stbuf: &FileAttr,
) -> FopResult<MigrateOutcome> {
    let link_key = dist.link_xattr_name();
    let mut req = Xattrs::new();
    req.set(&link_key, Vec::new());

    // whatever occupies the destination must be a pointer, or the name is
    // genuinely taken
    match to.lookup(loc, &req).await {
        Ok(existing) => {
            if !linkfile::is_linkfile(&existing.attr, &existing.xattrs, &link_key) {
                warn!("{}: file exists in destination", loc.path);
                return Err(Errno::EEXIST);
            }
            to.unlink(loc, &internal_xattrs()).await.map_err(|err| {
                warn!("{}: failed to delete the linkfile: {err}", loc.path);
                err
            })?;
        }
        Err(err) if err.entry_missing() => {}
        Err(err) => {
            warn!("{}: lookup failed: {err}", loc.path);
            return Err(err);
        }
    }

    let mut xattrs = Xattrs::new();
    xattrs.set(GFID_REQ_KEY, stbuf.gfid.0.to_vec());
    xattrs.set_str(INTERNAL_FOP_KEY, "yes");

    if stbuf.kind == FileType::Symlink {
        let target = from.readlink(loc).await.map_err(|err| {
            warn!("{}: readlink on symlink failed: {err}", loc.path);
            err
        })?;
        to.symlink(loc, &target, &xattrs).await.map_err(|err| {
            warn!("{}: creating symlink failed: {err}", loc.path);
            err
        })?;
    } else {
        to.mknod(loc, stbuf.kind, stbuf.perm, stbuf.rdev, &xattrs)
            .await
            .map_err(|err| {
                warn!("{}: mknod failed: {err}", loc.path);
                err
            })?;
    }

    if let Err(err) = from.unlink(loc, &internal_xattrs()).await {
        warn!("{}: unlink failed: {err}", loc.path);
    }

    if !loc.gfid.is_null() {
        dist.layout_drop(loc.gfid);
        let _ = dist.layout_preset(to, loc.gfid);
    }
    Ok(MigrateOutcome::Done)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sector_math() {
        // a file shorter than its block footprint has no holes
        let size: u64 = 4096;
        let blocks: u64 = 8;
        assert!(size <= blocks * DISK_SECTOR_SIZE);
        // more bytes than allocated sectors implies holes
        let sparse_size: u64 = 1 << 20;
        let sparse_blocks: u64 = 16;
        assert!(sparse_size > sparse_blocks * DISK_SECTOR_SIZE);
    }
}
