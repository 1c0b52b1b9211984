use std::{
    collections::VecDeque,
    ops::{BitOr, BitOrAssign},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// What happened to the set of hosts, combinable with `|`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostUpdate(u8);

impl HostUpdate {
    pub const NO_UPDATE: Self = Self(0);
    pub const REMOVED: Self = Self(1);
    pub const ADDED: Self = Self(2);
    pub const MIXED: Self = Self(Self::REMOVED.0 | Self::ADDED.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HostUpdate {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for HostUpdate {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The queue host change notifications are delivered into.
///
/// Cloned handles share the queue, so the discovery side can push while the
/// training side owns the state.
#[derive(Debug, Clone, Default)]
pub struct HostUpdates {
    queue: Arc<Mutex<VecDeque<(u64, HostUpdate)>>>,
}

impl HostUpdates {
    /// Records that the hosts changed at `timestamp`.
    pub fn push(&self, timestamp: u64, update: HostUpdate) {
        self.queue.lock().push_back((timestamp, update));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Folds every queued notification newer than `since`.
    ///
    /// # Returns
    /// The newest accepted timestamp and the union of the accepted updates.
    pub(crate) fn drain_newer(&self, since: u64) -> (u64, HostUpdate) {
        let mut last = since;
        let mut all = HostUpdate::NO_UPDATE;

        for (timestamp, update) in self.queue.lock().drain(..) {
            if timestamp > last {
                last = timestamp;
                all |= update;
            }
        }

        (last, all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_is_removed_and_added() {
        assert_eq!(HostUpdate::REMOVED | HostUpdate::ADDED, HostUpdate::MIXED);
        assert!(HostUpdate::MIXED.contains(HostUpdate::REMOVED));
        assert!(!HostUpdate::REMOVED.contains(HostUpdate::ADDED));
    }

    #[test]
    fn drain_skips_stale_notifications() {
        let updates = HostUpdates::default();
        updates.push(5, HostUpdate::ADDED);
        updates.push(3, HostUpdate::REMOVED);
        updates.push(1, HostUpdate::REMOVED);

        assert_eq!(updates.drain_newer(2), (5, HostUpdate::ADDED));
        assert!(updates.is_empty());
    }

    #[test]
    fn drain_without_news_keeps_timestamp() {
        let updates = HostUpdates::default();
        assert_eq!(updates.drain_newer(7), (7, HostUpdate::NO_UPDATE));
    }
}
