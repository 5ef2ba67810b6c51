//! Per-directory layouts: how a directory's 32-bit hash space is sliced
//! across subvolumes.
//!
//! A layout is built by merging one reply per subvolume, sorted, checked
//! for anomalies (holes, overlaps, missing copies) and, once normalized,
//! answers "which subvolume owns `hash(name)`". Each participating
//! subvolume stores its own slice of the layout in a 16-byte big-endian
//! extended attribute on its copy of the directory.

use std::fmt;

use log::{debug, info, trace, warn};
use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::errno::Errno;
use crate::hash::{self, HashType, MungeRegexes};
use crate::subvol::{SubvolRef, same_subvol};
use crate::types::Xattrs;

/// Sentinel for a layout whose slices disagree on their commit hash.
/// Never written to disk by a balanced rebalance, so an on-disk value of
/// this constant also marks "unknown".
pub const COMMIT_HASH_INVALID: u32 = 1;

/// Slice error marker for "directory exists but carried no layout xattr".
pub const ERR_UNKNOWN: i32 = -1;

/// One slice of a directory's hash space.
#[derive(Clone)]
pub struct LayoutSlice {
    /// Owning subvolume; `None` until a merge claims the slot
    pub subvol: Option<SubvolRef>,
    /// 0 when this slice is authoritative, `ERR_UNKNOWN` when the reply
    /// carried no layout, otherwise the errno of the failed reply
    pub err: i32,
    /// Inclusive lower bound of the hash range
    pub start: u32,
    /// Inclusive upper bound; `start == stop` marks a non-participating
    /// slice
    pub stop: u32,
    /// Topology version this slice was written under
    pub commit_hash: u32,
}

impl LayoutSlice {
    fn empty() -> LayoutSlice {
        LayoutSlice {
            subvol: None,
            err: ERR_UNKNOWN,
            start: 0,
            stop: 0,
            commit_hash: 0,
        }
    }

    /// True when the slice holds a real, nonempty hash range.
    pub fn participates(&self) -> bool {
        self.err == 0 && self.start != self.stop
    }
}

impl fmt::Debug for LayoutSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutSlice")
            .field("subvol", &self.subvol.as_ref().map(|s| s.name()))
            .field("err", &self.err)
            .field("start", &self.start)
            .field("stop", &self.stop)
            .field("commit_hash", &self.commit_hash)
            .finish()
    }
}

/// Anomaly counts produced by a layout scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Anomalies {
    /// Gaps in the hash-space covering
    pub holes: u32,
    /// Ranges claimed by more than one slice
    pub overlaps: u32,
    /// Slices whose directory copy is absent (`ENOENT`/`ESTALE`/unknown)
    pub missing: u32,
    /// Slices on unreachable subvolumes (`ENOTCONN`)
    pub down: u32,
    /// Slices with any other error
    pub misc: u32,
    /// Slices on full subvolumes (`ENOSPC`)
    pub no_space: u32,
}

/// Outcome of [`Layout::normalize`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Normalized {
    /// Disjoint covering, nothing to do.
    Clean,
    /// Covering is sound but this many directory copies are absent and
    /// should be created by self-heal. Not an error.
    MissingDirs(u32),
    /// Holes or overlaps: the layout needs a full re-heal before use.
    Broken,
}

/// A directory's (or, preset, a file's) placement across subvolumes.
#[derive(Clone)]
pub struct Layout {
    /// Hash algorithm the slices were computed with
    pub hash_type: HashType,
    /// How many subvolumes a fresh directory spreads across
    pub spread_cnt: u32,
    /// Runtime-state version at construction; compared against the
    /// cluster generation to detect staleness after child events
    pub r#gen: u32,
    /// Common commit hash of all slices, or [`COMMIT_HASH_INVALID`]
    pub commit_hash: u32,
    /// Interned single-subvolume layouts are never rebuilt
    pub preset: bool,
    /// Whether a miss under this directory still warrants asking every
    /// subvolume. Cleared only when the commit hash vouches the layout is
    /// fully balanced.
    pub search_unhashed: bool,
    slices: Vec<LayoutSlice>,
}

impl Layout {
    /// A fresh layout with `cnt` unclaimed slices.
    pub fn new(cnt: usize, spread_cnt: u32, r#gen: u32) -> Layout {
        Layout {
            hash_type: HashType::DaviesMeyer,
            spread_cnt,
            r#gen,
            commit_hash: 0,
            preset: false,
            search_unhashed: true,
            slices: vec![LayoutSlice::empty(); cnt],
        }
    }

    /// The interned "file lives on this one subvolume" layout.
    pub fn preset(subvol: SubvolRef, r#gen: u32) -> Layout {
        let mut layout = Layout::new(1, 0, r#gen);
        layout.preset = true;
        layout.slices[0].subvol = Some(subvol);
        layout.slices[0].err = 0;
        layout
    }

    pub fn slices(&self) -> &[LayoutSlice] {
        &self.slices
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// The single subvolume of a preset layout; the cached location of a
    /// regular file.
    pub fn cached_subvol(&self) -> Option<SubvolRef> {
        self.slices.first().and_then(|s| s.subvol.clone())
    }

    /// Index of `subvol`'s slice, if it has claimed one.
    pub fn index_of(&self, subvol: &SubvolRef) -> Option<usize> {
        self.slices.iter().position(|s| {
            s.subvol
                .as_ref()
                .is_some_and(|owner| same_subvol(owner, subvol))
        })
    }

    /// Whether `subvol` owns a nonempty range in this layout. Consulted by
    /// the lookup optimizer: a name cannot live on a subvolume outside its
    /// parent's layout.
    pub fn has_subvol_range(&self, subvol: &SubvolRef) -> bool {
        match self.index_of(subvol) {
            Some(i) => self.slices[i].start != self.slices[i].stop,
            None => false,
        }
    }

    /// Merge one per-subvolume lookup (or mkdir) reply into the layout.
    ///
    /// Claims the slice already tagged with `subvol`, or the first
    /// unclaimed one. A failed reply records its errno; a successful reply
    /// without a layout xattr participates as "present, range unknown".
    pub fn merge(
        &mut self,
        subvol: SubvolRef,
        reply: Result<&Xattrs, Errno>,
        xattr_name: &str,
    ) -> Result<(), Errno> {
        let pos = match self
            .index_of(&subvol)
            .or_else(|| self.slices.iter().position(|s| s.subvol.is_none()))
        {
            Some(pos) => pos,
            None => {
                warn!(
                    "no free slice to merge reply from {} into layout",
                    subvol.name()
                );
                return Err(Errno::EINVAL);
            }
        };
        self.slices[pos].subvol = Some(subvol.clone());

        let xattrs = match reply {
            Err(errno) => {
                self.slices[pos].err = errno.code();
                return Ok(());
            }
            Ok(xattrs) => xattrs,
        };

        let raw = match xattrs.get(xattr_name) {
            Some(raw) => raw,
            None => {
                trace!(
                    "missing disk layout on {}, present without range",
                    subvol.name()
                );
                self.slices[pos].err = 0;
                return Ok(());
            }
        };

        let disk = match DiskLayout::decode(raw) {
            Ok(disk) => disk,
            Err(errno) => {
                warn!("layout merge from subvolume {} failed", subvol.name());
                self.slices[pos].err = ERR_UNKNOWN;
                return Err(errno);
            }
        };

        if disk.hash_type == HashType::DaviesMeyerUser {
            debug!("found user-set layout on {}", subvol.name());
            self.hash_type = disk.hash_type;
        }

        self.slices[pos].commit_hash = disk.commit_hash;
        self.slices[pos].start = disk.start;
        self.slices[pos].stop = disk.stop;
        self.slices[pos].err = 0;

        trace!(
            "merged to layout: {} - {} (hash {}) from {}",
            disk.start,
            disk.stop,
            disk.commit_hash,
            self.slices[pos].subvol.as_ref().unwrap().name()
        );

        if self.commit_hash == 0 {
            self.commit_hash = disk.commit_hash;
        } else if self.commit_hash != disk.commit_hash {
            self.commit_hash = COMMIT_HASH_INVALID;
        }

        Ok(())
    }

    fn entry_cmp(&self, i: usize, j: usize) -> i64 {
        let (a, b) = (&self.slices[i], &self.slices[j]);
        // zero'ed out ranges sort to the front
        if b.start == 0 && b.stop == 0 {
            return i64::from(a.stop) - i64::from(b.stop);
        }
        i64::from(a.start) - i64::from(b.start)
    }

    /// Sort slices by range start, zero ranges first. Quadratic, but
    /// layouts are as small as the subvolume count.
    pub fn sort(&mut self) {
        let cnt = self.slices.len();
        for i in 0..cnt.saturating_sub(1) {
            for j in (i + 1)..cnt {
                if self.entry_cmp(i, j) > 0 {
                    self.slices.swap(i, j);
                }
            }
        }
    }

    /// Sort slices by subvolume name; the canonical order used when
    /// assigning fresh ranges so every client heals identically.
    pub fn sort_by_name(&mut self) {
        self.slices.sort_by(|a, b| {
            let an = a.subvol.as_ref().map(|s| s.name().to_owned()).unwrap_or_default();
            let bn = b.subvol.as_ref().map(|s| s.name().to_owned()).unwrap_or_default();
            an.cmp(&bn)
        });
    }

    /// Scan a sorted layout for anomalies.
    pub fn anomalies(&self) -> Anomalies {
        let mut out = Anomalies::default();
        let mut is_virgin = true;

        let first_start = self.slices.first().map_or(0, |s| s.start);
        let last_stop = first_start.wrapping_sub(1);
        let mut prev_stop = last_stop;

        for slice in &self.slices {
            match slice.err {
                e if e == ERR_UNKNOWN || e == libc::ENOENT || e == libc::ESTALE => {
                    out.missing += 1;
                    continue;
                }
                e if e == libc::ENOTCONN => {
                    out.down += 1;
                    continue;
                }
                e if e == libc::ENOSPC => {
                    out.no_space += 1;
                    continue;
                }
                0 => {
                    // err == 0 with an empty range is a well-formed
                    // non-participating slice (spread-cnt), not an anomaly
                    if slice.start == slice.stop {
                        continue;
                    }
                }
                _ => {
                    out.misc += 1;
                    continue;
                }
            }

            is_virgin = false;

            if prev_stop.wrapping_add(1) < slice.start {
                out.holes += 1;
            }
            if prev_stop.wrapping_add(1) > slice.start {
                out.overlaps += 1;
            }
            prev_stop = slice.stop;
        }

        if last_stop.wrapping_sub(prev_stop) != 0 || is_virgin {
            out.holes += 1;
        }

        out
    }

    /// Count of slices whose directory copy needs creating.
    pub fn missing_dirs(&self) -> u32 {
        self.slices
            .iter()
            .filter(|s| {
                s.err == libc::ENOENT || (s.err == ERR_UNKNOWN && s.start == 0 && s.stop == 0)
            })
            .count() as u32
    }

    /// Sort and validate. See [`Normalized`] for the outcomes.
    pub fn normalize(&mut self, path: &str) -> Normalized {
        self.sort();

        let anomalies = self.anomalies();
        if anomalies.holes != 0 || anomalies.overlaps != 0 {
            if anomalies.missing == self.slices.len() as u32 {
                debug!("directory {path} looked up first time");
            } else {
                info!(
                    "found anomalies in {path}: holes={} overlaps={}",
                    anomalies.holes, anomalies.overlaps
                );
            }
            return Normalized::Broken;
        }

        match self.missing_dirs() {
            0 => Normalized::Clean,
            n => Normalized::MissingDirs(n),
        }
    }

    /// The subvolume whose slice contains `hash`.
    pub fn search_hash(&self, hash: u32) -> Option<SubvolRef> {
        self.slices
            .iter()
            .find(|s| s.start <= hash && s.stop >= hash)
            .and_then(|s| s.subvol.clone())
    }

    /// The hashed subvolume for `name`. `None` means the layout is
    /// damaged (a normalized layout has no uncovered hash).
    pub fn search(&self, name: &str, regexes: &MungeRegexes) -> Option<SubvolRef> {
        let hash = hash::compute(name, regexes);
        let found = self.search_hash(hash);
        if found.is_none() {
            warn!("no subvolume for hash (value) = {hash}");
        }
        found
    }

    /// Compare this layout's slice for `subvol` against the disk encoding
    /// a revalidate just returned. `true` means the directory was
    /// re-laid-out behind our back and the cached layout must be dropped.
    pub fn dir_mismatch(
        &self,
        subvol: &SubvolRef,
        xattrs: Option<&Xattrs>,
        xattr_name: &str,
        path: &str,
    ) -> bool {
        let pos = match self.index_of(subvol) {
            Some(pos) => pos,
            None => {
                debug!("{path} - no layout info for subvolume {}", subvol.name());
                return true;
            }
        };
        let slice = &self.slices[pos];

        let xattrs = match xattrs {
            Some(xattrs) => xattrs,
            None => {
                if slice.err == 0 {
                    info!("{path}: xattr dictionary is missing");
                    return true;
                }
                return false;
            }
        };

        let raw = match xattrs.get(xattr_name) {
            Some(raw) => raw,
            None => {
                if slice.err == 0 && slice.stop != 0 {
                    info!("{path}: disk layout missing");
                    return true;
                }
                return false;
            }
        };

        let disk = match DiskLayout::decode(raw) {
            Ok(disk) => disk,
            Err(_) => return true,
        };

        if slice.start != disk.start
            || slice.stop != disk.stop
            || slice.commit_hash != disk.commit_hash
        {
            info!(
                "subvol: {}; inode layout - {} - {} - {}; disk layout - {} - {} - {}",
                subvol.name(),
                slice.start,
                slice.stop,
                slice.commit_hash,
                disk.start,
                disk.stop,
                disk.commit_hash
            );
            return true;
        }
        false
    }

    /// The 16-byte wire encoding of `subvol`'s slice, for writing to that
    /// subvolume's directory xattr.
    pub fn extract(&self, subvol: &SubvolRef) -> Option<Vec<u8>> {
        let pos = self.index_of(subvol)?;
        let slice = &self.slices[pos];
        Some(
            DiskLayout {
                commit_hash: slice.commit_hash,
                hash_type: self.hash_type,
                start: slice.start,
                stop: slice.stop,
            }
            .encode(),
        )
    }

    pub(crate) fn slices_mut(&mut self) -> &mut [LayoutSlice] {
        &mut self.slices
    }
}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layout")
            .field("hash_type", &self.hash_type)
            .field("commit_hash", &self.commit_hash)
            .field("gen", &self.r#gen)
            .field("preset", &self.preset)
            .field("slices", &self.slices)
            .finish()
    }
}

/// Decoded form of the per-directory per-subvolume layout xattr.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskLayout {
    pub commit_hash: u32,
    pub hash_type: HashType,
    pub start: u32,
    pub stop: u32,
}

/// Exact wire image: four big-endian words, 16 bytes total.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct DiskLayoutWire {
    commit_hash: U32,
    hash_type: U32,
    start: U32,
    stop: U32,
}

impl DiskLayout {
    /// Serialize to the 16-byte on-disk form.
    pub fn encode(&self) -> Vec<u8> {
        let wire = DiskLayoutWire {
            commit_hash: U32::new(self.commit_hash),
            hash_type: U32::new(self.hash_type.to_wire()),
            start: U32::new(self.start),
            stop: U32::new(self.stop),
        };
        wire.as_bytes().to_vec()
    }

    /// Parse the on-disk form; rejects short buffers and unknown hash
    /// algorithms.
    pub fn decode(raw: &[u8]) -> Result<DiskLayout, Errno> {
        let wire = DiskLayoutWire::read_from_bytes(raw).map_err(|_| {
            warn!("invalid disk layout: bad length {}", raw.len());
            Errno::EINVAL
        })?;
        let hash_type = HashType::from_wire(wire.hash_type.get()).ok_or_else(|| {
            warn!(
                "invalid disk layout: layout with unknown type {} found",
                wire.hash_type.get()
            );
            Errno::EINVAL
        })?;
        Ok(DiskLayout {
            commit_hash: wire.commit_hash.get(),
            hash_type,
            start: wire.start.get(),
            stop: wire.stop.get(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::subvol::test_util::named_subvols;

    fn layout_of(ranges: &[(u32, u32)]) -> (Layout, Vec<SubvolRef>) {
        let subvols = named_subvols(ranges.len());
        let mut layout = Layout::new(ranges.len(), 0, 0);
        for (i, &(start, stop)) in ranges.iter().enumerate() {
            let slice = &mut layout.slices_mut()[i];
            slice.subvol = Some(subvols[i].clone());
            slice.err = 0;
            slice.start = start;
            slice.stop = stop;
        }
        (layout, subvols)
    }

    #[test]
    fn disk_codec_round_trips() {
        let disk = DiskLayout {
            commit_hash: 42,
            hash_type: HashType::DaviesMeyer,
            start: 0x4000_0000,
            stop: 0x7fff_ffff,
        };
        let raw = disk.encode();
        assert_eq!(raw.len(), 16);
        // big-endian start word
        assert_eq!(&raw[8..12], &[0x40, 0x00, 0x00, 0x00]);
        assert_eq!(DiskLayout::decode(&raw).unwrap(), disk);
    }

    #[test]
    fn disk_codec_rejects_garbage() {
        assert_eq!(DiskLayout::decode(&[0u8; 8]), Err(Errno::EINVAL));
        let mut raw = DiskLayout {
            commit_hash: 0,
            hash_type: HashType::DaviesMeyer,
            start: 0,
            stop: 0,
        }
        .encode();
        raw[7] = 9; // unknown hash type
        assert_eq!(DiskLayout::decode(&raw), Err(Errno::EINVAL));
    }

    #[test]
    fn sort_puts_zero_ranges_first() {
        let (mut layout, _) = layout_of(&[(5, 10), (0, 0), (1, 4)]);
        layout.sort();
        let ranges: Vec<_> = layout.slices().iter().map(|s| (s.start, s.stop)).collect();
        assert_eq!(ranges, vec![(0, 0), (1, 4), (5, 10)]);
    }

    #[test]
    fn sort_is_idempotent() {
        let (mut layout, _) = layout_of(&[(10, 20), (0, 9), (21, 30)]);
        layout.sort();
        let once: Vec<_> = layout.slices().iter().map(|s| (s.start, s.stop)).collect();
        layout.sort();
        let twice: Vec<_> = layout.slices().iter().map(|s| (s.start, s.stop)).collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn clean_covering_has_no_anomalies() {
        let (mut layout, _) = layout_of(&[(0, 0x7fff_ffff), (0x8000_0000, u32::MAX)]);
        layout.sort();
        assert_eq!(layout.anomalies(), Anomalies::default());
        assert_eq!(layout.normalize("/d"), Normalized::Clean);
    }

    #[test]
    fn hole_is_detected() {
        let (mut layout, _) = layout_of(&[(0, 100), (200, u32::MAX)]);
        layout.sort();
        let anomalies = layout.anomalies();
        assert_eq!(anomalies.holes, 1);
        assert_eq!(anomalies.overlaps, 0);
        assert_eq!(layout.normalize("/d"), Normalized::Broken);
    }

    #[test]
    fn trailing_gap_counts_as_hole() {
        let (mut layout, _) = layout_of(&[(0, 100), (101, 5000)]);
        layout.sort();
        assert_eq!(layout.anomalies().holes, 1);
    }

    #[test]
    fn overlap_is_detected() {
        let (mut layout, _) = layout_of(&[(0, 150), (100, u32::MAX)]);
        layout.sort();
        let anomalies = layout.anomalies();
        assert_eq!(anomalies.overlaps, 1);
        assert_eq!(anomalies.holes, 0);
    }

    #[test]
    fn virgin_layout_is_one_hole() {
        let subvols = named_subvols(2);
        let mut layout = Layout::new(2, 0, 0);
        for (i, s) in subvols.iter().enumerate() {
            layout.slices_mut()[i].subvol = Some(s.clone());
            layout.slices_mut()[i].err = libc::ENOENT;
        }
        layout.sort();
        let anomalies = layout.anomalies();
        assert_eq!(anomalies.holes, 1);
        assert_eq!(anomalies.missing, 2);
    }

    #[test]
    fn non_participating_slice_is_skipped() {
        let (mut layout, _) = layout_of(&[(0, u32::MAX), (0, 0)]);
        layout.sort();
        assert_eq!(layout.anomalies(), Anomalies::default());
    }

    #[test]
    fn down_and_full_subvols_are_classified() {
        let (mut layout, _) = layout_of(&[(0, u32::MAX), (0, 0), (0, 0)]);
        layout.slices_mut()[1].err = libc::ENOTCONN;
        layout.slices_mut()[2].err = libc::ENOSPC;
        layout.sort();
        let anomalies = layout.anomalies();
        assert_eq!(anomalies.down, 1);
        assert_eq!(anomalies.no_space, 1);
        assert_eq!(anomalies.holes, 0);
    }

    #[test]
    fn missing_dirs_reported_by_normalize() {
        let subvols = named_subvols(3);
        let mut layout = Layout::new(3, 0, 0);
        layout.slices_mut()[0].subvol = Some(subvols[0].clone());
        layout.slices_mut()[0].err = 0;
        layout.slices_mut()[0].start = 0;
        layout.slices_mut()[0].stop = 0x7fff_ffff;
        layout.slices_mut()[1].subvol = Some(subvols[1].clone());
        layout.slices_mut()[1].err = 0;
        layout.slices_mut()[1].start = 0x8000_0000;
        layout.slices_mut()[1].stop = u32::MAX;
        // third brick has no copy of the directory yet
        layout.slices_mut()[2].subvol = Some(subvols[2].clone());
        layout.slices_mut()[2].err = libc::ENOENT;
        assert_eq!(layout.normalize("/d"), Normalized::MissingDirs(1));
    }

    #[test]
    fn search_finds_owning_slice() {
        let (layout, subvols) = layout_of(&[(0, 0x7fff_ffff), (0x8000_0000, u32::MAX)]);
        let hit = layout.search_hash(0x4a00_0000).unwrap();
        assert!(same_subvol(&hit, &subvols[0]));
        let hit = layout.search_hash(0x8000_0000).unwrap();
        assert!(same_subvol(&hit, &subvols[1]));
        let regexes = MungeRegexes::default();
        assert!(layout.search("anything", &regexes).is_some());
    }

    #[test]
    fn merge_tracks_commit_hash_agreement() {
        let subvols = named_subvols(2);
        let xattr_name = "trusted.glusterfs.dht";
        let encode = |commit, start, stop| {
            let mut x = Xattrs::new();
            x.set(
                xattr_name,
                DiskLayout {
                    commit_hash: commit,
                    hash_type: HashType::DaviesMeyer,
                    start,
                    stop,
                }
                .encode(),
            );
            x
        };

        let mut layout = Layout::new(2, 0, 0);
        let x0 = encode(7, 0, 0x7fff_ffff);
        layout
            .merge(subvols[0].clone(), Ok(&x0), xattr_name)
            .unwrap();
        assert_eq!(layout.commit_hash, 7);

        let x1 = encode(9, 0x8000_0000, u32::MAX);
        layout
            .merge(subvols[1].clone(), Ok(&x1), xattr_name)
            .unwrap();
        assert_eq!(layout.commit_hash, COMMIT_HASH_INVALID);
    }

    #[test]
    fn merge_records_errors_and_absence() {
        let subvols = named_subvols(2);
        let mut layout = Layout::new(2, 0, 0);
        layout
            .merge(subvols[0].clone(), Err(Errno::ENOTCONN), "k")
            .unwrap();
        assert_eq!(layout.slices()[0].err, libc::ENOTCONN);

        let empty = Xattrs::new();
        layout.merge(subvols[1].clone(), Ok(&empty), "k").unwrap();
        assert_eq!(layout.slices()[1].err, 0);
        assert_eq!(layout.slices()[1].start, 0);
        assert_eq!(layout.slices()[1].stop, 0);
    }

    #[test]
    fn dir_mismatch_spots_changed_range() {
        let (layout, subvols) = layout_of(&[(0, 0x7fff_ffff), (0x8000_0000, u32::MAX)]);
        let xattr_name = "trusted.glusterfs.dht";

        let mut same = Xattrs::new();
        same.set(
            xattr_name,
            DiskLayout {
                commit_hash: 0,
                hash_type: HashType::DaviesMeyer,
                start: 0,
                stop: 0x7fff_ffff,
            }
            .encode(),
        );
        assert!(!layout.dir_mismatch(&subvols[0], Some(&same), xattr_name, "/d"));

        let mut moved = Xattrs::new();
        moved.set(
            xattr_name,
            DiskLayout {
                commit_hash: 0,
                hash_type: HashType::DaviesMeyer,
                start: 0,
                stop: 0x3fff_ffff,
            }
            .encode(),
        );
        assert!(layout.dir_mismatch(&subvols[0], Some(&moved), xattr_name, "/d"));
    }
}
