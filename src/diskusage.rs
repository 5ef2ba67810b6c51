//! Free-space tracking used by new-file placement.
//!
//! Each subvolume's availability is refreshed by a periodic statfs sweep;
//! placement consults the cached numbers, never the bricks directly.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use log::{debug, info, warn};

use crate::cluster::Distribute;
use crate::config::FreeDiskThreshold;
use crate::subvol::SubvolRef;
use crate::types::Loc;

/// Log a "subvolume filled" warning only every this many placements, so a
/// full brick does not flood the logs.
const FULL_WARN_EVERY: u64 = 420;

/// Cached availability of one subvolume.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DuStats {
    pub(crate) avail_percent: f64,
    pub(crate) avail_space: u64,
    pub(crate) avail_inodes: f64,
    /// Suppression counter for the "filled" warning
    pub(crate) log: u64,
}

impl DuStats {
    pub(crate) fn new() -> DuStats {
        // until the first statfs answers, assume fully available so
        // placement follows the hash
        DuStats {
            avail_percent: 100.0,
            avail_space: u64::MAX,
            avail_inodes: 100.0,
            log: 0,
        }
    }
}

impl Distribute {
    /// One statfs sweep over every subvolume, refreshing the cached
    /// stats. Unreachable subvolumes keep their previous numbers.
    pub async fn refresh_du_stats(&self) {
        let root = Loc::root();
        let replies = join_all(
            self.subvolumes()
                .iter()
                .map(|subvol| async { (subvol.clone(), subvol.statfs(&root).await) }),
        )
        .await;

        for (subvol, reply) in replies {
            let statvfs = match reply {
                Ok(statvfs) => statvfs,
                Err(err) => {
                    warn!("failed to get disk info from {}: {err}", subvol.name());
                    continue;
                }
            };

            let mut percent = 0.0;
            let mut bytes = 0;
            if statvfs.blocks > 0 {
                percent = (statvfs.bavail * 100) as f64 / statvfs.blocks as f64;
                bytes = statvfs.bavail * statvfs.frsize;
            }
            // dynamically allocated inode filesystems report zero totals;
            // treat them as never inode-bound and let placement follow
            // the hash
            let percent_inodes = if statvfs.files > 0 {
                (statvfs.ffree * 100) as f64 / statvfs.files as f64
            } else {
                100.0
            };

            if let Some(i) = self.subvol_index(&subvol) {
                let mut stats = self.du_stats.lock();
                stats[i].avail_percent = percent;
                stats[i].avail_space = bytes;
                stats[i].avail_inodes = percent_inodes;
                debug!(
                    "on subvolume '{}': avail_percent is: {:.2} and avail_space is: {} and avail_inodes is: {:.2}",
                    subvol.name(),
                    percent,
                    bytes,
                    percent_inodes
                );
            }
        }

        *self.last_du_fetch.lock() = Some(Instant::now());
    }

    /// Refresh the stats if the configured interval has elapsed. Called
    /// from the placement path, so the common case is a cheap time check.
    pub(crate) async fn maybe_refresh_du(&self) {
        let due = {
            let last = self.last_du_fetch.lock();
            let interval = self.options.read().refresh_interval;
            match *last {
                Some(at) => at.elapsed() >= interval,
                None => true,
            }
        };
        if due {
            self.refresh_du_stats().await;
        }
    }

    /// Run the statfs sweep forever on the configured interval. Spawn once
    /// per cluster from the host process.
    pub fn spawn_du_refresher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = cluster.options.read().refresh_interval;
                tokio::time::sleep(interval).await;
                cluster.refresh_du_stats().await;
            }
        })
    }

    /// Whether new files must avoid `subvol` because it is short on space
    /// or inodes.
    pub(crate) fn is_subvol_filled(&self, subvol: &SubvolRef) -> bool {
        let i = match self.subvol_index(subvol) {
            Some(i) => i,
            None => return false,
        };

        let (min_free_disk, min_free_inodes) = {
            let opts = self.options.read();
            (opts.min_free_disk, opts.min_free_inodes)
        };

        let (filled_space, filled_inodes, avail_percent, avail_inodes) = {
            let stats = self.du_stats.lock();
            let du = &stats[i];
            let filled_space = match min_free_disk {
                FreeDiskThreshold::Percent(min) => du.avail_percent < min,
                FreeDiskThreshold::Bytes(min) => du.avail_space < min,
            };
            let filled_inodes = du.avail_inodes < min_free_inodes;
            (filled_space, filled_inodes, du.avail_percent, du.avail_inodes)
        };

        let up = self.subvol_is_up(subvol);

        if filled_space && up && self.should_log_filled(i) {
            warn!(
                "disk space on subvolume '{}' is getting full ({:.2} %), consider adding more nodes",
                subvol.name(),
                100.0 - avail_percent
            );
        }
        if filled_inodes && up && self.should_log_filled(i) {
            warn!(
                "inodes on subvolume '{}' are at ({:.2} %), consider adding more nodes",
                subvol.name(),
                100.0 - avail_inodes
            );
        }

        filled_space || filled_inodes
    }

    fn should_log_filled(&self, i: usize) -> bool {
        let mut stats = self.du_stats.lock();
        let n = stats[i].log;
        stats[i].log += 1;
        n % FULL_WARN_EVERY == 0
    }

    /// The subvolume with the most headroom, or `avoid` itself when no
    /// candidate clears both thresholds (then the hash wins after all).
    pub(crate) fn free_disk_available_subvol(&self, avoid: &SubvolRef) -> SubvolRef {
        let (min_free_disk, min_free_inodes) = {
            let opts = self.options.read();
            (opts.min_free_disk, opts.min_free_inodes)
        };

        let mut best: Option<SubvolRef> = None;
        let mut max_space = 0.0f64;
        let mut max_bytes = 0u64;
        let mut max_inodes = 0.0f64;

        {
            let stats = self.du_stats.lock();
            for (i, subvol) in self.subvolumes().iter().enumerate() {
                let du = &stats[i];
                match min_free_disk {
                    FreeDiskThreshold::Percent(_) => {
                        if du.avail_percent > max_space && du.avail_inodes > max_inodes {
                            max_space = du.avail_percent;
                            max_inodes = du.avail_inodes;
                            best = Some(subvol.clone());
                        }
                    }
                    FreeDiskThreshold::Bytes(_) => {
                        if du.avail_space > max_bytes && du.avail_inodes > max_inodes {
                            max_bytes = du.avail_space;
                            max_inodes = du.avail_inodes;
                            best = Some(subvol.clone());
                        }
                    }
                }
            }
        }

        if best.is_none() {
            debug!("no subvolume has enough free space and inodes to create");
        }

        // even the best candidate is below the watermarks: respect the hash
        let best_is_filled = match min_free_disk {
            FreeDiskThreshold::Percent(min) => max_space < min,
            FreeDiskThreshold::Bytes(min) => max_bytes < min,
        };
        if best_is_filled && max_inodes < min_free_inodes {
            return avoid.clone();
        }

        match best {
            Some(best) => {
                if best.name() != avoid.name() {
                    info!(
                        "placing file away from '{}' onto '{}'",
                        avoid.name(),
                        best.name()
                    );
                }
                best
            }
            None => avoid.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Options;
    use crate::subvol::test_util::named_subvols;

    fn cluster_with_du(du: &[(f64, u64, f64)]) -> (Arc<Distribute>, Vec<SubvolRef>) {
        let subvols = named_subvols(du.len());
        let dist = Distribute::new("d", subvols.clone(), Options::default()).unwrap();
        {
            let mut stats = dist.du_stats.lock();
            for (i, &(pct, bytes, inodes)) in du.iter().enumerate() {
                stats[i].avail_percent = pct;
                stats[i].avail_space = bytes;
                stats[i].avail_inodes = inodes;
            }
        }
        (dist, subvols)
    }

    #[test]
    fn filled_below_percent_watermark() {
        let (dist, subvols) = cluster_with_du(&[(5.0, 1 << 30, 50.0), (50.0, 1 << 40, 50.0)]);
        assert!(dist.is_subvol_filled(&subvols[0]));
        assert!(!dist.is_subvol_filled(&subvols[1]));
    }

    #[test]
    fn filled_on_inode_exhaustion() {
        let (dist, subvols) = cluster_with_du(&[(50.0, 1 << 40, 2.0)]);
        assert!(dist.is_subvol_filled(&subvols[0]));
    }

    #[test]
    fn best_available_picks_most_headroom() {
        let (dist, subvols) =
            cluster_with_du(&[(5.0, 1 << 30, 50.0), (50.0, 1 << 40, 60.0), (30.0, 1 << 35, 55.0)]);
        let best = dist.free_disk_available_subvol(&subvols[0]);
        assert_eq!(best.name(), subvols[1].name());
    }

    #[test]
    fn all_filled_respects_the_hash() {
        let (dist, subvols) = cluster_with_du(&[(4.0, 100, 2.0), (3.0, 90, 1.0)]);
        let best = dist.free_disk_available_subvol(&subvols[1]);
        assert_eq!(best.name(), subvols[1].name());
    }

    #[test]
    fn byte_threshold_uses_byte_stats() {
        let (dist, subvols) = cluster_with_du(&[(90.0, 50, 90.0)]);
        dist.reconfigure([("min-free-disk", "1000")]).unwrap();
        assert!(dist.is_subvol_filled(&subvols[0]));
    }
}
