//! The lookup state machine.
//!
//! A name resolves through up to four stages: the hashed subvolume, a
//! pointer file's target, a fan-out over every subvolume, and finally a
//! full directory merge. Each stage is a state; replies drive the
//! transitions. Directory lookups rebuild the per-directory layout and
//! trigger self-heal when the merged layout has anomalies.

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cluster::Distribute;
use crate::errno::{Errno, FopResult};
use crate::fanout::{self, CallCount, OpResult};
use crate::layout::{COMMIT_HASH_INVALID, Layout, Normalized};
use crate::linkfile;
use crate::selfheal;
use crate::subvol::{LookupReply, OPEN_FD_COUNT_KEY, SubvolRef, same_subvol};
use crate::types::{FileAttr, Gfid, Loc, MODE_STICKY, Xattrs, strip_phase1_flags};

enum State {
    Fresh,
    Revalidate(Arc<Layout>),
    Directory,
    Linkfile {
        target: SubvolRef,
        hashed: SubvolRef,
    },
    Everywhere,
}

enum Flow {
    Next(State),
    Done(LookupReply),
}

/// Top-level lookup entry point.
pub(crate) async fn lookup(
    dist: &Distribute,
    loc: &Loc,
    xattr_req: &Xattrs,
) -> FopResult<LookupReply> {
    if loc.path.is_empty() {
        return Err(Errno::EINVAL);
    }

    let req = build_request(dist, xattr_req);

    if loc.is_discover() {
        return discover(dist, loc, &req).await;
    }

    let mut state = initial_state(dist, loc);
    loop {
        let flow = match state {
            State::Fresh => fresh(dist, loc, &req).await?,
            State::Revalidate(layout) => revalidate(dist, loc, &req, layout).await?,
            State::Directory => directory(dist, loc, &req).await?,
            State::Linkfile { target, hashed } => {
                linkfile_follow(dist, loc, &req, target, hashed).await?
            }
            State::Everywhere => everywhere(dist, loc, &req).await?,
        };
        match flow {
            Flow::Next(next) => state = next,
            Flow::Done(reply) => return Ok(reply),
        }
    }
}

/// The keys every internal lookup asks the bricks for, on top of what the
/// caller wanted.
fn build_request(dist: &Distribute, xattr_req: &Xattrs) -> Xattrs {
    let mut req = xattr_req.clone();
    req.set(dist.xattr_name(), Vec::new());
    req.set(dist.link_xattr_name(), Vec::new());
    req.set(OPEN_FD_COUNT_KEY, Vec::new());
    req
}

fn initial_state(dist: &Distribute, loc: &Loc) -> State {
    if !loc.gfid.is_null() {
        if let Some(layout) = dist.layout_get(loc.gfid) {
            if dist.layout_is_stale(&layout) {
                debug!("cached layout of {} is stale, relookup", loc.path);
                dist.layout_drop(loc.gfid);
            } else {
                return State::Revalidate(layout);
            }
        }
    }
    if loc.gfid == Gfid::ROOT {
        return State::Directory;
    }
    State::Fresh
}

/// Whether a hashed-lookup miss should fan out to every subvolume.
fn should_fan_out(dist: &Distribute, parent_layout: Option<&Layout>) -> bool {
    use crate::config::LookupUnhashed;
    let opts = dist.options.read();
    let hint = parent_layout.map_or(true, |l| l.search_unhashed);
    if opts.lookup_optimize && !hint {
        return false;
    }
    match opts.lookup_unhashed {
        LookupUnhashed::On => true,
        LookupUnhashed::Off => false,
        LookupUnhashed::Auto => hint,
    }
}

/// Mark sticky on attributes of a file living off its hashed subvolume,
/// when so configured, so upper caches treat the placement as volatile.
fn apply_unhashed_sticky(
    dist: &Distribute,
    attr: &mut FileAttr,
    cached: &SubvolRef,
    hashed: Option<&SubvolRef>,
) {
    if !dist.options.read().unhashed_sticky_bit {
        return;
    }
    if attr.nlink != 1 {
        return;
    }
    if let Some(hashed) = hashed {
        if !same_subvol(cached, hashed) {
            attr.perm |= MODE_STICKY;
        }
    }
}

/// Install the single-subvolume layout and hand the reply back.
fn preset_done(
    dist: &Distribute,
    subvol: &SubvolRef,
    mut reply: LookupReply,
    hashed: Option<&SubvolRef>,
) -> FopResult<Flow> {
    let gfid = reply.attr.gfid;
    dist.layout_preset(subvol, gfid)?;
    strip_phase1_flags(&mut reply.attr);
    apply_unhashed_sticky(dist, &mut reply.attr, subvol, hashed);
    dist.update_times(gfid, &reply.attr);
    Ok(Flow::Done(reply))
}

/// Fresh lookup: ask the subvolume the name hashes to.
async fn fresh(dist: &Distribute, loc: &Loc, req: &Xattrs) -> FopResult<Flow> {
    let parent_layout = dist.layout_get(loc.parent);
    let hashed = match &parent_layout {
        Some(layout) => dist.hashed_subvol(layout, &loc.name),
        None => None,
    };
    let hashed = match hashed {
        Some(hashed) => hashed,
        None => {
            debug!("no hashed subvolume for {}, doing directory lookup", loc.path);
            return Ok(Flow::Next(State::Directory));
        }
    };

    let link_key = dist.link_xattr_name();
    match hashed.lookup(loc, req).await {
        Ok(reply) => {
            if reply.attr.is_dir() {
                return Ok(Flow::Next(State::Directory));
            }
            if linkfile::is_linkfile(&reply.attr, &reply.xattrs, &link_key) {
                if reply.attr.size != 0 {
                    // a pointer never holds data; this one is damaged
                    warn!(
                        "linkfile {} on {} has a non-zero size",
                        loc.path,
                        hashed.name()
                    );
                }
                return match linkfile::linkfile_subvol(dist, &reply.xattrs, &link_key) {
                    Some(target) => Ok(Flow::Next(State::Linkfile { target, hashed })),
                    None => {
                        warn!("linkfile {} points at an unknown subvolume", loc.path);
                        Ok(Flow::Next(State::Everywhere))
                    }
                };
            }
            preset_done(dist, &hashed, reply, Some(&hashed))
        }
        Err(err) if err.entry_missing() => {
            if should_fan_out(dist, parent_layout.as_deref()) {
                Ok(Flow::Next(State::Everywhere))
            } else {
                Err(Errno::ENOENT)
            }
        }
        // a dead hashed subvolume proves nothing; the name may be a
        // directory present everywhere else
        Err(err) if err == Errno::ENOTCONN => Ok(Flow::Next(State::Directory)),
        Err(err) => Err(err),
    }
}

/// Revalidate a cached layout.
async fn revalidate(
    dist: &Distribute,
    loc: &Loc,
    req: &Xattrs,
    layout: Arc<Layout>,
) -> FopResult<Flow> {
    if layout.preset {
        return revalidate_file(dist, loc, req, layout).await;
    }
    revalidate_dir(dist, loc, req, layout).await
}

async fn revalidate_file(
    dist: &Distribute,
    loc: &Loc,
    req: &Xattrs,
    layout: Arc<Layout>,
) -> FopResult<Flow> {
    let cached = layout.cached_subvol().ok_or(Errno::EINVAL)?;
    let link_key = dist.link_xattr_name();

    match cached.lookup(loc, req).await {
        Ok(mut reply) => {
            if reply.attr.is_dir() {
                // file turned into a directory behind our back
                dist.layout_drop(loc.gfid);
                return Err(Errno::ESTALE);
            }
            if linkfile::is_linkfile(&reply.attr, &reply.xattrs, &link_key) {
                // the data moved on; the caller retries with a fresh
                // lookup that follows the pointer
                dist.layout_drop(loc.gfid);
                return Err(Errno::ESTALE);
            }
            strip_phase1_flags(&mut reply.attr);
            let parent_layout = dist.layout_get(loc.parent);
            let hashed = parent_layout
                .as_ref()
                .and_then(|l| dist.hashed_subvol(l, &loc.name));
            apply_unhashed_sticky(dist, &mut reply.attr, &cached, hashed.as_ref());
            dist.update_times(reply.attr.gfid, &reply.attr);
            Ok(Flow::Done(reply))
        }
        Err(err) if err.entry_missing() => {
            dist.layout_drop(loc.gfid);
            Ok(Flow::Next(State::Everywhere))
        }
        Err(err) => Err(err),
    }
}

async fn revalidate_dir(
    dist: &Distribute,
    loc: &Loc,
    req: &Xattrs,
    layout: Arc<Layout>,
) -> FopResult<Flow> {
    let xattr_name = dist.xattr_name();
    let targets: Vec<SubvolRef> = layout
        .slices()
        .iter()
        .filter_map(|s| s.subvol.clone())
        .collect();
    if targets.is_empty() {
        return Ok(Flow::Next(State::Directory));
    }

    let replies = join_all(targets.iter().map(|s| s.lookup(loc, req))).await;

    let mut op = OpResult::new();
    let mut merged = FileAttr::default();
    let mut xattrs = Xattrs::new();
    let mut postparent = None;
    let mut mismatch = false;
    let mut estale = false;

    for (subvol, reply) in targets.iter().zip(&replies) {
        op.absorb(reply);
        match reply {
            Ok(reply) => {
                if !reply.attr.is_dir() {
                    estale = true;
                    continue;
                }
                if layout.dir_mismatch(subvol, Some(&reply.xattrs), &xattr_name, &loc.path) {
                    mismatch = true;
                }
                fanout::iatt_merge(&mut merged, &reply.attr);
                fanout::xattr_aggregate(&mut xattrs, &reply.xattrs);
                if postparent.is_none() {
                    postparent = reply.postparent;
                }
            }
            Err(err) if err.entry_missing() => mismatch = true,
            Err(err) if *err == Errno::ENOTCONN => {}
            Err(_) => {}
        }
    }

    if estale {
        dist.layout_drop(loc.gfid);
        return Err(Errno::ESTALE);
    }
    if !op.any_success() {
        return Err(op.errno());
    }
    if mismatch {
        debug!("layout mismatch on {}, rebuilding", loc.path);
        dist.layout_drop(loc.gfid);
        return Ok(Flow::Next(State::Directory));
    }

    fanout::dir_stat_fixup(&mut merged);
    dist.update_times(merged.gfid, &merged);
    Ok(Flow::Done(LookupReply {
        attr: merged,
        xattrs,
        postparent,
    }))
}

/// Fan-out directory lookup: merge every subvolume's slice into a fresh
/// layout, self-heal if needed, and install it.
async fn directory(dist: &Distribute, loc: &Loc, req: &Xattrs) -> FopResult<Flow> {
    let xattr_name = dist.xattr_name();
    let link_key = dist.link_xattr_name();
    let subvols = dist.subvolumes().to_vec();

    let replies = join_all(subvols.iter().map(|s| s.lookup(loc, req))).await;

    let mut layout = dist.new_layout(subvols.len());
    let mut op = OpResult::new();
    let mut merged = FileAttr::default();
    let mut xattrs = Xattrs::new();
    let mut postparent = None;
    let mut first_gfid: Option<Gfid> = None;
    let mut mixed = false;

    for (subvol, reply) in subvols.iter().zip(&replies) {
        op.absorb(reply);
        let merge_input = match reply {
            Ok(r) => Ok(&r.xattrs),
            Err(e) => Err(*e),
        };
        let _ = layout.merge(subvol.clone(), merge_input, &xattr_name);

        let reply = match reply {
            Ok(reply) => reply,
            Err(_) => continue,
        };

        if linkfile::is_linkfile(&reply.attr, &reply.xattrs, &link_key) {
            warn!(
                "found a linkfile for {} on {} during directory lookup",
                loc.path,
                subvol.name()
            );
            continue;
        }
        if !reply.attr.is_dir() {
            mixed = true;
            continue;
        }

        match first_gfid {
            None => first_gfid = Some(reply.attr.gfid),
            Some(seen) if seen != reply.attr.gfid => {
                warn!(
                    "gfid differs for {} on subvolume {} ({} vs {})",
                    loc.path,
                    subvol.name(),
                    seen,
                    reply.attr.gfid
                );
            }
            Some(_) => {}
        }

        fanout::iatt_merge(&mut merged, &reply.attr);
        fanout::xattr_aggregate(&mut xattrs, &reply.xattrs);
        if postparent.is_none() {
            postparent = reply.postparent;
        }
    }

    if !op.any_success() {
        return Err(op.errno());
    }
    if mixed {
        // a file and a directory share the name; the everywhere scan
        // classifies and reports it
        return Ok(Flow::Next(State::Everywhere));
    }

    // commit-hash agreement lets a later miss skip the everywhere scan
    let vouched = layout.commit_hash != 0
        && layout.commit_hash != COMMIT_HASH_INVALID
        && dist.options.read().commit_hash == Some(layout.commit_hash);
    layout.search_unhashed = !vouched;

    let mut dir_loc = loc.clone();
    if dir_loc.gfid.is_null() {
        dir_loc.gfid = merged.gfid;
    }

    let installed = match layout.normalize(&loc.path) {
        Normalized::Clean => {
            let layout = Arc::new(layout);
            dist.layout_set(dir_loc.gfid, layout.clone());
            layout
        }
        Normalized::MissingDirs(n) => {
            debug!("{n} missing directory copies under {}", loc.path);
            selfheal::heal_directory(dist, &dir_loc, layout, &merged).await?
        }
        Normalized::Broken => selfheal::heal_directory(dist, &dir_loc, layout, &merged).await?,
    };
    debug!(
        "directory {} laid out over {} subvolumes",
        loc.path,
        installed.len()
    );

    fanout::dir_stat_fixup(&mut merged);
    dist.update_times(merged.gfid, &merged);
    Ok(Flow::Done(LookupReply {
        attr: merged,
        xattrs,
        postparent,
    }))
}

/// Follow a pointer file to its target subvolume.
async fn linkfile_follow(
    dist: &Distribute,
    loc: &Loc,
    req: &Xattrs,
    target: SubvolRef,
    hashed: SubvolRef,
) -> FopResult<Flow> {
    let link_key = dist.link_xattr_name();
    match target.lookup(loc, req).await {
        Ok(reply) => {
            if reply.attr.is_dir() {
                warn!("linkfile target {} is a directory on {}", loc.path, target.name());
                return Ok(Flow::Next(State::Everywhere));
            }
            if linkfile::is_linkfile(&reply.attr, &reply.xattrs, &link_key) {
                // pointer chains are never followed
                return Ok(Flow::Next(State::Everywhere));
            }
            if !loc.gfid.is_null() && reply.attr.gfid != loc.gfid {
                warn!("gfid mismatch following linkfile {}", loc.path);
                return Ok(Flow::Next(State::Everywhere));
            }
            preset_done(dist, &target, reply, Some(&hashed))
        }
        Err(err) => {
            debug!(
                "lookup of {} on linkfile target {} failed: {err}",
                loc.path,
                target.name()
            );
            Ok(Flow::Next(State::Everywhere))
        }
    }
}

struct Found {
    subvol: SubvolRef,
    reply: LookupReply,
}

/// Ask every subvolume and classify what comes back.
async fn everywhere(dist: &Distribute, loc: &Loc, req: &Xattrs) -> FopResult<Flow> {
    let link_key = dist.link_xattr_name();
    let subvols = dist.subvolumes().to_vec();
    let replies = join_all(subvols.iter().map(|s| s.lookup(loc, req))).await;

    let mut op = OpResult::new();
    let mut files: Vec<Found> = Vec::new();
    let mut links: Vec<Found> = Vec::new();
    let mut dir_cnt = 0usize;

    for (subvol, reply) in subvols.iter().zip(replies) {
        op.absorb(&reply);
        let reply = match reply {
            Ok(reply) => reply,
            Err(_) => continue,
        };
        if reply.attr.is_dir() {
            dir_cnt += 1;
        } else if linkfile::is_linkfile(&reply.attr, &reply.xattrs, &link_key) {
            links.push(Found {
                subvol: subvol.clone(),
                reply,
            });
        } else {
            files.push(Found {
                subvol: subvol.clone(),
                reply,
            });
        }
    }

    if !files.is_empty() && dir_cnt > 0 {
        warn!(
            "path {} exists as a file on one subvolume and directory on another",
            loc.path
        );
        return Err(Errno::EIO);
    }
    if dir_cnt > 0 {
        return Ok(Flow::Next(State::Directory));
    }

    if files.is_empty() {
        if !op.any_success() {
            return Err(op.errno());
        }
        // nothing but pointers (if that): reap one provably stale pointer
        // and report the miss
        if let Some(stale) = links
            .iter()
            .find(|l| linkfile::stale_link_removable(&l.reply.xattrs))
        {
            let _ = linkfile::linkfile_unlink(dist, &stale.subvol, loc).await;
        }
        return Err(Errno::ENOENT);
    }

    if files.len() > 1 {
        warn!(
            "multiple subvolumes ({} and {}) have file {}",
            files[0].subvol.name(),
            files[1].subvol.name(),
            loc.path
        );
    }

    let found = &files[0];
    let cached = found.subvol.clone();
    let gfid = found.reply.attr.gfid;

    let parent_layout = dist.layout_get(loc.parent);
    let hashed = parent_layout
        .as_ref()
        .and_then(|l| dist.hashed_subvol(l, &loc.name));

    let hashed = match hashed {
        None => {
            info!(
                "found {} on {} but cannot determine hashed subvolume",
                loc.path,
                cached.name()
            );
            return preset_done(dist, &cached, found.reply.clone(), None);
        }
        Some(hashed) => hashed,
    };

    if same_subvol(&hashed, &cached) {
        return preset_done(dist, &cached, found.reply.clone(), Some(&hashed));
    }

    // the hashed subvolume needs a pointer to where the data actually is
    if let Some(existing) = links.iter().find(|l| same_subvol(&l.subvol, &hashed)) {
        let points_at = linkfile::linkfile_subvol(dist, &existing.reply.xattrs, &link_key);
        let stale = points_at.map_or(true, |t| !same_subvol(&t, &cached));
        if stale {
            if linkfile::stale_link_removable(&existing.reply.xattrs) {
                if let Err(err) = linkfile::linkfile_unlink(dist, &hashed, loc).await {
                    warn!(
                        "failed to unlink stale linkfile {} on {}: {err}",
                        loc.path,
                        hashed.name()
                    );
                    return preset_done(dist, &cached, found.reply.clone(), Some(&hashed));
                }
            } else {
                info!(
                    "stale linkfile {} on {} still has open fds, leaving it",
                    loc.path,
                    hashed.name()
                );
                return preset_done(dist, &cached, found.reply.clone(), Some(&hashed));
            }
        } else {
            // pointer is already correct
            return preset_done(dist, &cached, found.reply.clone(), Some(&hashed));
        }
    }

    match linkfile::linkfile_create(dist, &cached, &hashed, loc, gfid).await {
        Ok(_) => {
            linkfile::linkfile_attr_heal(&hashed, loc, &found.reply.attr).await;
        }
        Err(err) => {
            warn!(
                "failed to create linkfile for {} on {}: {err}",
                loc.path,
                hashed.name()
            );
        }
    }
    preset_done(dist, &cached, found.reply.clone(), Some(&hashed))
}

struct DiscoverState {
    layout: Layout,
    op: OpResult,
    merged: FileAttr,
    xattrs: Xattrs,
    postparent: Option<FileAttr>,
    dir_cnt: usize,
    file_cnt: usize,
    tx: Option<oneshot::Sender<FopResult<LookupReply>>>,
}

/// Bare-gfid lookup: fan out to every subvolume, answer the caller as
/// soon as the file is found, keep absorbing the stragglers' replies.
async fn discover(dist: &Distribute, loc: &Loc, req: &Xattrs) -> FopResult<LookupReply> {
    let dist = dist.self_arc();
    let link_key = dist.link_xattr_name();
    let xattr_name = dist.xattr_name();
    let subvols = dist.subvolumes().to_vec();

    let (tx, rx) = oneshot::channel();
    let state = Arc::new(Mutex::new(DiscoverState {
        layout: dist.new_layout(subvols.len()),
        op: OpResult::new(),
        merged: FileAttr::default(),
        xattrs: Xattrs::new(),
        postparent: None,
        dir_cnt: 0,
        file_cnt: 0,
        tx: Some(tx),
    }));
    let calls = Arc::new(CallCount::new(subvols.len()));

    for subvol in subvols {
        let dist = dist.clone();
        let loc = loc.clone();
        let req = req.clone();
        let state = state.clone();
        let calls = calls.clone();
        let link_key = link_key.clone();
        let xattr_name = xattr_name.clone();

        tokio::spawn(async move {
            let reply = subvol.lookup(&loc, &req).await;

            let early = {
                let mut state = state.lock();
                state.op.absorb(&reply);
                let merge_input = match &reply {
                    Ok(r) => Ok(&r.xattrs),
                    Err(e) => Err(*e),
                };
                let _ = state.layout.merge(subvol.clone(), merge_input, &xattr_name);

                let mut early = None;
                if let Ok(reply) = &reply {
                    if reply.attr.is_dir() {
                        state.dir_cnt += 1;
                        fanout::iatt_merge(&mut state.merged, &reply.attr);
                        let incoming = reply.xattrs.clone();
                        fanout::xattr_aggregate(&mut state.xattrs, &incoming);
                        if state.postparent.is_none() {
                            state.postparent = reply.postparent;
                        }
                    } else if !linkfile::is_linkfile(&reply.attr, &reply.xattrs, &link_key) {
                        state.file_cnt += 1;
                        if state.file_cnt == 1 {
                            // first data hit answers the caller right away
                            early = state.tx.take().map(|tx| (tx, reply.clone()));
                        }
                    }
                }
                early
            };

            if let Some((tx, mut reply)) = early {
                let _ = dist.layout_preset(&subvol, reply.attr.gfid);
                strip_phase1_flags(&mut reply.attr);
                dist.update_times(reply.attr.gfid, &reply.attr);
                let _ = tx.send(Ok(reply));
            }

            if calls.last_call() {
                discover_complete(&dist, &loc, &state);
            }
        });
    }

    rx.await.unwrap_or(Err(Errno::EIO))
}

/// Terminal transition of a discover: runs exactly once, after every
/// subvolume has answered. If the fast path already released the caller,
/// only the layout bookkeeping remains.
fn discover_complete(dist: &Distribute, loc: &Loc, state: &Mutex<DiscoverState>) {
    let mut state = state.lock();

    if state.file_cnt > 0 && state.dir_cnt > 0 {
        warn!(
            "path {} exists as a file on one subvolume and directory on another",
            loc.path
        );
        if let Some(tx) = state.tx.take() {
            let _ = tx.send(Err(Errno::EIO));
        }
        return;
    }

    if state.dir_cnt > 0 {
        let mut layout = std::mem::replace(&mut state.layout, Layout::new(0, 0, 0));
        match layout.normalize(&loc.path) {
            Normalized::Clean | Normalized::MissingDirs(_) => {
                dist.layout_set(loc.gfid, Arc::new(layout));
                let mut merged = state.merged;
                fanout::dir_stat_fixup(&mut merged);
                dist.update_times(loc.gfid, &merged);
                if let Some(tx) = state.tx.take() {
                    let _ = tx.send(Ok(LookupReply {
                        attr: merged,
                        xattrs: state.xattrs.clone(),
                        postparent: state.postparent,
                    }));
                }
            }
            Normalized::Broken => {
                // no name, no parent: nothing to heal against
                if let Some(tx) = state.tx.take() {
                    let _ = tx.send(Err(Errno::ESTALE));
                }
            }
        }
        return;
    }

    if let Some(tx) = state.tx.take() {
        let errno = if state.op.any_success() {
            Errno::ENOENT
        } else {
            state.op.errno()
        };
        let _ = tx.send(Err(errno));
    }
}
