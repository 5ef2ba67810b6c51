//! The 32-bit filename hash that drives all routing.
//!
//! Every client must compute the identical value for the identical name, or
//! files stop resolving; the algorithm and the word byte order are therefore
//! fixed (little-endian loads), never host-dependent.
//!
//! Before hashing, the name is munged through up to two configured regexes
//! so that rsync-style temporary names (`.foo.txt.Xy12ab`) hash to the same
//! slot as their final name (`foo.txt`) and do not trigger pointless
//! migrations during rsync's rename dance.

use std::borrow::Cow;

use log::{debug, trace, warn};
use regex::Regex;

/// Identifies the hash algorithm a directory's layout was written with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashType {
    /// The built-in Davies-Meyer hash.
    DaviesMeyer,
    /// A user-provisioned layout that still uses the Davies-Meyer hash;
    /// kept distinct on disk so tooling can tell the layouts apart.
    DaviesMeyerUser,
}

impl HashType {
    /// Decode the on-disk `type` field.
    pub fn from_wire(raw: u32) -> Option<HashType> {
        match raw {
            0 => Some(HashType::DaviesMeyer),
            1 => Some(HashType::DaviesMeyerUser),
            _ => None,
        }
    }

    /// Encode for the on-disk `type` field.
    pub fn to_wire(self) -> u32 {
        match self {
            HashType::DaviesMeyer => 0,
            HashType::DaviesMeyerUser => 1,
        }
    }
}

/// Default pattern recognizing rsync temporary names: `.<name>.<suffix>`.
/// The capture group is what gets hashed.
pub const RSYNC_REGEX_DEFAULT: &str = r"^\.(.+)\.[^.]+$";

/// Compiled munging patterns. Rebuilt whenever the options change; readers
/// take the cluster's config lock for the duration of one hash computation.
#[derive(Debug, Default)]
pub(crate) struct MungeRegexes {
    extra: Option<Regex>,
    rsync: Option<Regex>,
}

impl MungeRegexes {
    /// Compile the configured patterns. An empty pattern disables munging;
    /// a malformed pattern is logged and disabled rather than failing the
    /// whole configuration.
    pub(crate) fn compile(rsync: Option<&str>, extra: Option<&str>) -> MungeRegexes {
        MungeRegexes {
            extra: extra.and_then(|p| compile_one("extra-hash-regex", p)),
            rsync: rsync.and_then(|p| compile_one("rsync-hash-regex", p)),
        }
    }

    /// Apply the first matching pattern's capture group. The extra regex
    /// takes precedence over the rsync one.
    pub(crate) fn munge<'a>(&self, name: &'a str) -> Cow<'a, str> {
        for re in [self.extra.as_ref(), self.rsync.as_ref()].into_iter().flatten() {
            if let Some(caps) = re.captures(name) {
                if let Some(m) = caps.get(1) {
                    debug!("munged {name:?} down to {:?}", m.as_str());
                    return Cow::Owned(m.as_str().to_owned());
                }
            }
            trace!("no munge match for {name:?}");
        }
        Cow::Borrowed(name)
    }
}

fn compile_one(option: &str, pattern: &str) -> Option<Regex> {
    if pattern.is_empty() || pattern == "none" {
        return None;
    }
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            warn!("could not compile {option} pattern {pattern:?}: {err}");
            None
        }
    }
}

/// Munge then hash; the single entry point used by layout search.
pub(crate) fn compute(name: &str, regexes: &MungeRegexes) -> u32 {
    hash_name(regexes.munge(name).as_ref())
}

const DM_DELTA: u32 = 0x9E37_79B9;
const DM_FULLROUNDS: u32 = 10;
const DM_PARTROUNDS: u32 = 6;

fn dm_round(rounds: u32, block: &[u32; 4], h0: &mut u32, h1: &mut u32) {
    let mut sum: u32 = 0;
    let mut b0 = *h0;
    let mut b1 = *h1;

    for _ in 0..rounds {
        sum = sum.wrapping_add(DM_DELTA);
        b0 = b0.wrapping_add(
            (b1 << 4).wrapping_add(block[0])
                ^ b1.wrapping_add(sum)
                ^ (b1 >> 5).wrapping_add(block[1]),
        );
        b1 = b1.wrapping_add(
            (b0 << 4).wrapping_add(block[2])
                ^ b0.wrapping_add(sum)
                ^ (b0 >> 5).wrapping_add(block[3]),
        );
    }

    *h0 = h0.wrapping_add(b0);
    *h1 = h1.wrapping_add(b1);
}

/// Davies-Meyer hash of an (already munged) name.
///
/// Consumes the name sixteen bytes at a time with a short mixing round,
/// then folds the remainder padded with a length-derived word through a
/// full round.
pub fn hash_name(name: &str) -> u32 {
    let msg = name.as_bytes();
    let len = msg.len();

    let mut h0: u32 = 0x9464_a485;
    let mut h1: u32 = 0x542e_1a94;

    let pad = {
        let p = (len as u32) | ((len as u32) << 8);
        p | (p << 16)
    };

    let mut words = msg.chunks_exact(4);
    let mut block = [0u32; 4];

    let full_quads = len / 16;
    for _ in 0..full_quads {
        for slot in block.iter_mut() {
            let word = words.next().expect("quad implies four whole words");
            *slot = u32::from_le_bytes(word.try_into().unwrap());
        }
        dm_round(DM_PARTROUNDS, &block, &mut h0, &mut h1);
    }

    let mut tail = words.remainder();
    for slot in block.iter_mut() {
        if let Some(word) = words.next() {
            *slot = u32::from_le_bytes(word.try_into().unwrap());
            continue;
        }
        *slot = pad;
        for &byte in tail {
            *slot = (*slot << 8) | u32::from(byte);
        }
        tail = &[];
    }
    dm_round(DM_FULLROUNDS, &block, &mut h0, &mut h1);

    h0 ^ h1
}
