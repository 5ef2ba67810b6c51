//! Subvolume up/down tracking and upward event propagation.
//!
//! Child events arrive from each subvolume's transport. The cluster keeps
//! per-child status, bumps its generation so cached layouts revalidate,
//! and holds back the first upward CHILD_UP until every child has reported
//! at least once, so the parent never sees a half-connected cluster.

use std::time::Instant;

use log::{debug, error, info, warn};

use crate::cluster::Distribute;
use crate::subvol::SubvolRef;

/// Connection-state event reported by one subvolume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildEvent {
    Up,
    Down,
    Connecting,
    /// Topology under the child changed (e.g. replica membership);
    /// layouts must revalidate but the child stays usable.
    Modified,
}

/// Aggregated event the cluster forwards to its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    Up,
    Down,
    Connecting,
    Modified,
}

/// Per-subvolume connection state.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SubvolState {
    pub(crate) up: bool,
    pub(crate) last_event: Option<ChildEvent>,
    pub(crate) up_since: Option<Instant>,
}

impl SubvolState {
    pub(crate) fn new() -> SubvolState {
        SubvolState {
            up: false,
            last_event: None,
            up_since: None,
        }
    }
}

impl Distribute {
    /// Feed one child event into the cluster. Returns the event to
    /// propagate upward, or `None` while the first-propagate latch is
    /// still armed (or the event is from an unknown child).
    pub fn notify(&self, subvol: &SubvolRef, event: ChildEvent) -> Option<ClusterEvent> {
        let i = match self.subvol_index(subvol) {
            Some(i) => i,
            None => {
                warn!("notification from unknown subvolume {}", subvol.name());
                return None;
            }
        };

        let assert_no_child_down = self.options.read().assert_no_child_down;

        let (had_reported_all, reports_all, any_up) = {
            let mut state = self.subvol_state.lock();
            let had_reported_all = state.iter().all(|s| s.last_event.is_some());

            match event {
                ChildEvent::Up => {
                    if !state[i].up {
                        info!("subvolume {} came up", subvol.name());
                        state[i].up = true;
                        state[i].up_since = Some(Instant::now());
                    }
                }
                ChildEvent::Down => {
                    if state[i].up {
                        info!("subvolume {} went down", subvol.name());
                    }
                    state[i].up = false;
                    state[i].up_since = None;
                }
                ChildEvent::Connecting => {
                    debug!("subvolume {} connecting", subvol.name());
                }
                ChildEvent::Modified => {
                    debug!("subvolume {} modified", subvol.name());
                }
            }
            state[i].last_event = Some(event);

            let reports_all = state.iter().all(|s| s.last_event.is_some());
            let any_up = state.iter().any(|s| s.up);
            (had_reported_all, reports_all, any_up)
        };

        // an up or modified child can have rewritten layouts while we
        // were not looking; stale-mark everything cached
        if matches!(event, ChildEvent::Up | ChildEvent::Modified) {
            let generation = self.bump_generation();
            debug!("generation now {generation}");
        }

        if event == ChildEvent::Down && assert_no_child_down {
            error!(
                "received CHILD_DOWN from {} with assert-no-child-down set, exiting",
                subvol.name()
            );
            std::process::exit(1);
        }

        if !reports_all {
            // latch armed: not every child has spoken yet
            return None;
        }

        if !had_reported_all {
            // latch release: the one aggregated event announcing the
            // cluster to the parent
            return Some(if any_up {
                ClusterEvent::Up
            } else {
                ClusterEvent::Down
            });
        }

        Some(match event {
            ChildEvent::Up => ClusterEvent::Up,
            ChildEvent::Down => ClusterEvent::Down,
            ChildEvent::Connecting => ClusterEvent::Connecting,
            ChildEvent::Modified => ClusterEvent::Modified,
        })
    }
}
