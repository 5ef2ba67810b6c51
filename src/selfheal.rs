//! Directory layout self-heal.
//!
//! When a directory lookup finds anomalies (missing copies after a brick
//! was added, holes or overlaps after a crashed rebalance), the cluster
//! re-creates the missing copies, computes a fresh partition of the hash
//! space over the usable subvolumes and writes each slice back to its
//! subvolume's directory xattr.

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};

use crate::cluster::Distribute;
use crate::errno::{Errno, FopResult};
use crate::layout::Layout;
use crate::subvol::{GFID_REQ_KEY, INTERNAL_FOP_KEY, same_subvol};
use crate::types::{FileAttr, Loc, Xattrs};

/// Deterministic rotation start so directory ranges do not all begin on
/// the first subvolume: derived from the directory's gfid, identical on
/// every client.
fn alloc_start(loc: &Loc, cnt: usize) -> usize {
    if cnt == 0 {
        return 0;
    }
    let word = u32::from_be_bytes(loc.gfid.0[12..16].try_into().unwrap());
    word as usize % cnt
}

/// Assign fresh hash ranges to `layout` in place.
///
/// Subvolumes that are up and not being drained share the space; with
/// weighted rebalance enabled the share is proportional to free space,
/// otherwise equal. Everyone else gets a zero range. The configured
/// commit hash (rebalance only) is stamped on every slice.
pub(crate) fn fresh_ranges(dist: &Distribute, loc: &Loc, layout: &mut Layout) -> FopResult<()> {
    let usable = dist.usable_subvols();
    if usable.is_empty() {
        warn!("no usable subvolume to lay out {}", loc.path);
        return Err(Errno::ENOTCONN);
    }

    let spread = match layout.spread_cnt {
        0 => usable.len(),
        n => (n as usize).min(usable.len()),
    };

    let (weighted, commit_hash) = {
        let opts = dist.options.read();
        (opts.weighted_rebalance, opts.commit_hash.unwrap_or(0))
    };

    // the participating slice indexes, in layout order
    let mut participating: Vec<usize> = Vec::new();
    for (i, slice) in layout.slices().iter().enumerate() {
        let subvol = match &slice.subvol {
            Some(subvol) => subvol,
            None => continue,
        };
        if participating.len() < spread && usable.iter().any(|u| same_subvol(u, subvol)) {
            participating.push(i);
        }
    }
    if participating.is_empty() {
        return Err(Errno::ENOTCONN);
    }

    // free-space weights; equal shares when the tracker has not run yet
    let weights: Vec<u64> = {
        let stats = dist.du_stats.lock();
        participating
            .iter()
            .map(|&i| {
                let subvol = layout.slices()[i].subvol.as_ref().unwrap();
                match dist.subvol_index(subvol) {
                    Some(n) if weighted && stats[n].avail_space != u64::MAX => {
                        stats[n].avail_space.max(1)
                    }
                    _ => 1,
                }
            })
            .collect()
    };
    let total_weight: u64 = weights.iter().sum();

    for slice in layout.slices_mut() {
        slice.start = 0;
        slice.stop = 0;
        slice.commit_hash = commit_hash;
        if slice.subvol.is_some() {
            slice.err = 0;
        }
    }

    let start_at = alloc_start(loc, participating.len());
    let span = u64::from(u32::MAX) + 1;
    let mut cursor: u64 = 0;
    for k in 0..participating.len() {
        let pos = (start_at + k) % participating.len();
        let i = participating[pos];
        let share = if k + 1 == participating.len() {
            // last share absorbs rounding so the covering is exact
            span - cursor
        } else {
            // leave at least one hash value for every remaining slice
            let remaining = (participating.len() - 1 - k) as u64;
            let share = (u128::from(span) * u128::from(weights[pos])
                / u128::from(total_weight)) as u64;
            share.clamp(1, span - cursor - remaining)
        };
        let slice = &mut layout.slices_mut()[i];
        slice.start = cursor as u32;
        slice.stop = (cursor + share - 1) as u32;
        cursor += share;
    }

    layout.commit_hash = commit_hash;
    debug!(
        "fresh layout for {}: {} of {} subvolumes participating",
        loc.path,
        participating.len(),
        layout.len()
    );
    Ok(())
}

/// Create the directory on every subvolume whose slice reported it
/// missing. Creation is internal and carries the directory's gfid so all
/// copies share identity.
async fn make_missing_dirs(loc: &Loc, layout: &mut Layout, attr: &FileAttr) -> u32 {
    let mut xattrs = Xattrs::new();
    if !loc.gfid.is_null() {
        xattrs.set(GFID_REQ_KEY, loc.gfid.0.to_vec());
    }
    xattrs.set_str(INTERNAL_FOP_KEY, "yes");

    let perm = if attr.perm != 0 { attr.perm } else { 0o755 };

    let targets: Vec<(usize, _)> = layout
        .slices()
        .iter()
        .enumerate()
        .filter(|(_, s)| s.err == libc::ENOENT || s.err == libc::ESTALE)
        .filter_map(|(i, s)| s.subvol.clone().map(|subvol| (i, subvol)))
        .collect();

    let replies = join_all(targets.iter().map(|(_, subvol)| {
        let xattrs = xattrs.clone();
        async move { subvol.mkdir(loc, perm, &xattrs).await }
    }))
    .await;

    let mut healed = 0;
    for ((i, subvol), reply) in targets.into_iter().zip(replies) {
        match reply {
            Ok(_) => {
                layout.slices_mut()[i].err = 0;
                healed += 1;
            }
            Err(err) if err == Errno::EEXIST => {
                layout.slices_mut()[i].err = 0;
                healed += 1;
            }
            Err(err) => {
                warn!(
                    "failed to create directory {} on {}: {err}",
                    loc.path,
                    subvol.name()
                );
                layout.slices_mut()[i].err = err.code();
            }
        }
    }
    healed
}

/// Write each slice's 16-byte encoding to its subvolume's directory
/// xattr. Failures are logged; the slice keeps serving from memory and
/// the next lookup will heal again.
async fn write_layout_xattrs(dist: &Distribute, loc: &Loc, layout: &Layout) {
    let xattr_name = dist.xattr_name();
    let writes = layout.slices().iter().filter_map(|slice| {
        let subvol = slice.subvol.clone()?;
        if slice.err != 0 {
            return None;
        }
        let raw = layout.extract(&subvol)?;
        let xattr_name = xattr_name.clone();
        Some(async move {
            let mut xattrs = Xattrs::new();
            xattrs.set(xattr_name, raw);
            let result = subvol.setxattr(loc, &xattrs, 0).await;
            (subvol, result)
        })
    });

    for (subvol, result) in join_all(writes).await {
        if let Err(err) = result {
            warn!(
                "failed to write layout of {} on {}: {err}",
                loc.path,
                subvol.name()
            );
        }
    }
}

/// Full directory self-heal: create missing copies, assign fresh ranges,
/// persist them, and install the healed layout on the inode.
pub(crate) async fn heal_directory(
    dist: &Distribute,
    loc: &Loc,
    mut layout: Layout,
    attr: &FileAttr,
) -> FopResult<Arc<Layout>> {
    let healed = make_missing_dirs(loc, &mut layout, attr).await;
    if healed > 0 {
        info!("healed {healed} missing directory copies of {}", loc.path);
    }

    fresh_ranges(dist, loc, &mut layout)?;
    layout.sort();
    write_layout_xattrs(dist, loc, &layout).await;

    layout.r#gen = dist.generation();
    let layout = Arc::new(layout);
    if !loc.gfid.is_null() {
        dist.layout_set(loc.gfid, layout.clone());
    }
    Ok(layout)
}
