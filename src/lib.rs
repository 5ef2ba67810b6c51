//! Hash-distributed clustering layer for stackable network filesystems.
//!
//! `scatterfs` aggregates N storage bricks ([`Subvolume`]s) into a single
//! namespace. Each directory's 32-bit hash space is partitioned across
//! its subvolumes ([`Layout`]); every file operation routes to the
//! subvolume whose slice contains `hash(filename)`. Files that are not
//! where their name says (because a brick filled up, or a rebalance moved
//! them) stay reachable through pointer files and a fan-out lookup.
//!
//! The cluster itself implements [`Subvolume`], so distribute layers
//! stack like any other brick. The host process feeds connection events
//! in through [`Distribute::notify`] and drives periodic free-space
//! refresh with [`Distribute::spawn_du_refresher`].

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub use crate::cluster::Distribute;
pub use crate::config::{FreeDiskThreshold, LookupUnhashed, Options, RebalThrottle};
pub use crate::errno::{Errno, FopResult};
pub use crate::hash::{HashType, RSYNC_REGEX_DEFAULT, hash_name};
pub use crate::layout::{
    Anomalies, COMMIT_HASH_INVALID, DiskLayout, ERR_UNKNOWN, Layout, LayoutSlice, Normalized,
};
pub use crate::notify::{ChildEvent, ClusterEvent};
pub use crate::rebalance::{MigrateMode, MigrateOutcome};
pub use crate::subvol::{
    AccessMode, AttrPair, CreateReply, DECOMMISSION_BRICK_KEY, EntryReply, FILE_MIGRATE_DOMAIN,
    FIX_LAYOUT_KEY, Fd, GFID_REQ_KEY, INTERNAL_FOP_KEY, LAYOUT_HEAL_DOMAIN, LINKINFO_KEY,
    LockCmd, LockKind, LookupReply, MIGRATE_DATA_FORCE, MIGRATE_DATA_KEY, OPEN_FD_COUNT_KEY,
    OpenFlags, PATHINFO_HEADER, PATHINFO_KEY, PosixLock, QUOTA_SIZE_KEY, ReadReply, RenameReply,
    SetAttrs, SubvolRef, Subvolume, UnlinkReply, WriteReply, XattropOp, same_subvol,
};
pub use crate::types::{
    DirEntry, FileAttr, FileType, Gfid, LINKFILE_MODE, Loc, MODE_SGID, MODE_STICKY,
    MigrationPhase, Statvfs, Xattrs, strip_phase1_flags,
};

mod cluster;
mod config;
mod diskusage;
mod entry_ops;
mod errno;
mod fanout;
mod file_ops;
mod hash;
mod layout;
mod linkfile;
mod lookup;
mod notify;
mod readdir;
mod rebalance;
mod rename;
mod selfheal;
mod subvol;
mod types;
mod xattr_ops;
