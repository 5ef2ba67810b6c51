//! Cluster options.
//!
//! Options arrive as string key/value pairs from the management plane; the
//! same `set` path serves initial configuration and live reconfigure. Keys
//! are part of the public interface and must not be renamed.

use std::io;
use std::io::ErrorKind;
use std::time::Duration;

use crate::hash::{MungeRegexes, RSYNC_REGEX_DEFAULT};

/// Whether a failed hashed lookup falls back to asking every subvolume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupUnhashed {
    /// Always fan out on a hashed-lookup miss.
    On,
    /// Never fan out; a miss is final. Only safe on clusters that never
    /// rebalanced.
    Off,
    /// Fan out unless the parent layout's commit hash vouches that the
    /// name cannot live anywhere else.
    Auto,
}

/// Migration parallelism profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebalThrottle {
    Lazy,
    Normal,
    Aggressive,
}

impl RebalThrottle {
    /// Number of concurrently migrating files the profile allows.
    pub fn max_parallel(self, cpu_count: usize) -> usize {
        match self {
            RebalThrottle::Lazy => 1,
            RebalThrottle::Normal => (cpu_count / 2).max(2),
            RebalThrottle::Aggressive => cpu_count.max(4),
        }
    }
}

/// The "subvolume is filled" watermark for new-file placement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FreeDiskThreshold {
    /// Minimum free space as a percentage of the subvolume's capacity.
    Percent(f64),
    /// Minimum free space in bytes.
    Bytes(u64),
}

/// All recognized cluster options with their defaults.
#[derive(Clone, Debug)]
pub struct Options {
    /// `lookup-unhashed`
    pub lookup_unhashed: LookupUnhashed,
    /// `lookup-optimize`: skip the unhashed fallback when the parent
    /// layout vouches the name can't exist elsewhere
    pub lookup_optimize: bool,
    /// `min-free-disk`
    pub min_free_disk: FreeDiskThreshold,
    /// `min-free-inodes`: percent of free inodes below which a subvolume
    /// stops taking new files
    pub min_free_inodes: f64,
    /// `directory-layout-spread`: subvolumes a fresh directory's range is
    /// spread across; 0 means all of them
    pub dir_spread_cnt: u32,
    /// `unhashed-sticky-bit`
    pub unhashed_sticky_bit: bool,
    /// `use-readdirp`
    pub use_readdirp: bool,
    /// `rsync-hash-regex`
    pub rsync_hash_regex: Option<String>,
    /// `extra-hash-regex`
    pub extra_hash_regex: Option<String>,
    /// `rebalance-cmd`: integer sub-command the rebalance process was
    /// started with
    pub rebalance_cmd: i32,
    /// `commit-hash`: topology version forced onto layout writes; only
    /// the rebalance process sets this
    pub commit_hash: Option<u32>,
    /// `assert-no-child-down`
    pub assert_no_child_down: bool,
    /// `weighted-rebalance`: size slices proportionally to brick capacity
    pub weighted_rebalance: bool,
    /// `lock-migration`: carry posix locks along with migrating files
    pub lock_migration: bool,
    /// `rebal-throttle`
    pub rebal_throttle: RebalThrottle,
    /// `xattr-name`: base key for every on-disk attribute this layer owns
    pub xattr_name: String,
    /// `decommissioned-bricks`: subvolume names being drained
    pub decommissioned_bricks: Vec<String>,
    /// `refresh-interval`: how often disk-usage statistics are refreshed
    pub refresh_interval: Duration,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            lookup_unhashed: LookupUnhashed::On,
            lookup_optimize: false,
            min_free_disk: FreeDiskThreshold::Percent(10.0),
            min_free_inodes: 5.0,
            dir_spread_cnt: 0,
            unhashed_sticky_bit: false,
            use_readdirp: true,
            rsync_hash_regex: Some(RSYNC_REGEX_DEFAULT.to_owned()),
            extra_hash_regex: None,
            rebalance_cmd: 0,
            commit_hash: None,
            assert_no_child_down: false,
            weighted_rebalance: true,
            lock_migration: false,
            rebal_throttle: RebalThrottle::Normal,
            xattr_name: "trusted.glusterfs.dht".to_owned(),
            decommissioned_bricks: Vec::new(),
            refresh_interval: Duration::from_secs(10),
        }
    }
}

fn invalid(key: &str, value: &str, expected: &str) -> io::Error {
    io::Error::new(
        ErrorKind::InvalidInput,
        format!("option {key}: invalid value {value:?}, expected {expected}"),
    )
}

fn parse_bool(key: &str, value: &str) -> io::Result<bool> {
    match value {
        "on" | "yes" | "true" | "enable" | "1" => Ok(true),
        "off" | "no" | "false" | "disable" | "0" => Ok(false),
        _ => Err(invalid(key, value, "a boolean")),
    }
}

fn parse_percent(key: &str, value: &str) -> io::Result<f64> {
    let trimmed = value.strip_suffix('%').unwrap_or(value);
    let pct: f64 = trimmed
        .parse()
        .map_err(|_| invalid(key, value, "a percentage"))?;
    if !(0.0..=100.0).contains(&pct) {
        return Err(invalid(key, value, "a percentage between 0 and 100"));
    }
    Ok(pct)
}

/// Percent when suffixed with `%` or below 100, byte count otherwise.
fn parse_percent_or_bytes(key: &str, value: &str) -> io::Result<FreeDiskThreshold> {
    if let Some(trimmed) = value.strip_suffix('%') {
        let pct: f64 = trimmed
            .parse()
            .map_err(|_| invalid(key, value, "a percentage or byte count"))?;
        if !(0.0..=100.0).contains(&pct) {
            return Err(invalid(key, value, "a percentage between 0 and 100"));
        }
        return Ok(FreeDiskThreshold::Percent(pct));
    }
    let number: u64 = value
        .parse()
        .map_err(|_| invalid(key, value, "a percentage or byte count"))?;
    if number < 100 {
        Ok(FreeDiskThreshold::Percent(number as f64))
    } else {
        Ok(FreeDiskThreshold::Bytes(number))
    }
}

impl Options {
    /// Apply one key/value pair. Used both at init and on reconfigure;
    /// unknown keys and malformed values are rejected without modifying
    /// the option.
    pub fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        match key {
            "lookup-unhashed" => {
                self.lookup_unhashed = match value {
                    "auto" => LookupUnhashed::Auto,
                    _ => {
                        if parse_bool(key, value)? {
                            LookupUnhashed::On
                        } else {
                            LookupUnhashed::Off
                        }
                    }
                };
            }
            "lookup-optimize" => self.lookup_optimize = parse_bool(key, value)?,
            "min-free-disk" => self.min_free_disk = parse_percent_or_bytes(key, value)?,
            "min-free-inodes" => self.min_free_inodes = parse_percent(key, value)?,
            "directory-layout-spread" => {
                self.dir_spread_cnt = value
                    .parse()
                    .map_err(|_| invalid(key, value, "a subvolume count"))?;
            }
            "unhashed-sticky-bit" => self.unhashed_sticky_bit = parse_bool(key, value)?,
            "use-readdirp" => self.use_readdirp = parse_bool(key, value)?,
            "rsync-hash-regex" => {
                self.rsync_hash_regex = match value {
                    "none" | "" => None,
                    pattern => Some(pattern.to_owned()),
                };
            }
            "extra-hash-regex" => {
                self.extra_hash_regex = match value {
                    "none" | "" => None,
                    pattern => Some(pattern.to_owned()),
                };
            }
            "rebalance-cmd" => {
                self.rebalance_cmd = value
                    .parse()
                    .map_err(|_| invalid(key, value, "an integer sub-command"))?;
            }
            "commit-hash" => {
                self.commit_hash = Some(
                    value
                        .parse()
                        .map_err(|_| invalid(key, value, "a 32-bit topology version"))?,
                );
            }
            "assert-no-child-down" => self.assert_no_child_down = parse_bool(key, value)?,
            "weighted-rebalance" => self.weighted_rebalance = parse_bool(key, value)?,
            "lock-migration" => self.lock_migration = parse_bool(key, value)?,
            "rebal-throttle" => {
                self.rebal_throttle = match value {
                    "lazy" => RebalThrottle::Lazy,
                    "normal" => RebalThrottle::Normal,
                    "aggressive" => RebalThrottle::Aggressive,
                    _ => return Err(invalid(key, value, "lazy, normal or aggressive")),
                };
            }
            "xattr-name" => {
                if value.is_empty() {
                    return Err(invalid(key, value, "a non-empty xattr base name"));
                }
                self.xattr_name = value.to_owned();
            }
            "decommissioned-bricks" => {
                self.decommissioned_bricks = value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            "refresh-interval" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| invalid(key, value, "an interval in seconds"))?;
                self.refresh_interval = Duration::from_secs(secs);
            }
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("unrecognized option {key}"),
                ));
            }
        }
        Ok(())
    }

    /// Apply a batch of pairs, stopping at the first invalid one.
    pub fn set_many<'a>(
        &mut self,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> io::Result<()> {
        for (key, value) in pairs {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Key of the linkto xattr on pointer files.
    pub fn link_xattr_name(&self) -> String {
        format!("{}.linkto", self.xattr_name)
    }

    /// Key of the "writes are being drained" marker set on a migrating
    /// source file.
    pub fn no_external_writes_key(&self) -> String {
        format!("{}.no-external-writes", self.xattr_name)
    }

    pub(crate) fn compile_regexes(&self) -> MungeRegexes {
        MungeRegexes::compile(
            self.rsync_hash_regex.as_deref(),
            self.extra_hash_regex.as_deref(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = Options::default();
        assert_eq!(opts.lookup_unhashed, LookupUnhashed::On);
        assert_eq!(opts.min_free_disk, FreeDiskThreshold::Percent(10.0));
        assert_eq!(opts.xattr_name, "trusted.glusterfs.dht");
        assert_eq!(opts.link_xattr_name(), "trusted.glusterfs.dht.linkto");
        assert!(opts.rsync_hash_regex.is_some());
    }

    #[test]
    fn percent_or_bytes_parsing() {
        let mut opts = Options::default();
        opts.set("min-free-disk", "25%").unwrap();
        assert_eq!(opts.min_free_disk, FreeDiskThreshold::Percent(25.0));
        opts.set("min-free-disk", "42").unwrap();
        assert_eq!(opts.min_free_disk, FreeDiskThreshold::Percent(42.0));
        opts.set("min-free-disk", "1073741824").unwrap();
        assert_eq!(opts.min_free_disk, FreeDiskThreshold::Bytes(1 << 30));
        assert!(opts.set("min-free-disk", "150%").is_err());
    }

    #[test]
    fn lookup_unhashed_tri_state() {
        let mut opts = Options::default();
        opts.set("lookup-unhashed", "auto").unwrap();
        assert_eq!(opts.lookup_unhashed, LookupUnhashed::Auto);
        opts.set("lookup-unhashed", "off").unwrap();
        assert_eq!(opts.lookup_unhashed, LookupUnhashed::Off);
        assert!(opts.set("lookup-unhashed", "maybe").is_err());
    }

    #[test]
    fn decommissioned_brick_list() {
        let mut opts = Options::default();
        opts.set("decommissioned-bricks", "brick-1, brick-3").unwrap();
        assert_eq!(opts.decommissioned_bricks, vec!["brick-1", "brick-3"]);
        opts.set("decommissioned-bricks", "").unwrap();
        assert!(opts.decommissioned_bricks.is_empty());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut opts = Options::default();
        assert!(opts.set("no-such-option", "1").is_err());
    }

    #[test]
    fn custom_xattr_name_flows_into_derived_keys() {
        let mut opts = Options::default();
        opts.set("xattr-name", "trusted.acme.dht").unwrap();
        assert_eq!(opts.link_xattr_name(), "trusted.acme.dht.linkto");
        assert_eq!(
            opts.no_external_writes_key(),
            "trusted.acme.dht.no-external-writes"
        );
    }
}
