//! Tracked subscriptions.
//!
//! The registry is plain data living inside the connection record, so every
//! mutation happens under the same lock as state transitions. Sending the
//! actual subscribe/unsubscribe frames is the connection's job.

use std::collections::BTreeSet;

/// Set of channels the application wants delivered.
///
/// Entries are removed only by an explicit unsubscribe; reconnects never
/// touch the set. Separately it remembers which channels were already
/// requested on the current open, so a replay pass never repeats a request.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionRegistry {
    channels: BTreeSet<String>,
    sent: BTreeSet<String>,
    restores: u64,
}

impl SubscriptionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `channel`. Returns `false` if it was already tracked.
    pub fn insert(&mut self, channel: &str) -> bool {
        if self.channels.contains(channel) {
            return false;
        }
        self.channels.insert(channel.to_owned())
    }

    /// Stop tracking `channel`. Returns `false` if it was not tracked.
    pub fn remove(&mut self, channel: &str) -> bool {
        let _ = self.sent.remove(channel);
        self.channels.remove(channel)
    }

    /// Whether `channel` is tracked.
    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    /// Number of tracked channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Ordered copy of the tracked channels.
    pub fn snapshot(&self) -> Vec<String> {
        self.channels.iter().cloned().collect()
    }

    /// Forget what was requested on the previous open.
    pub fn reset_sent(&mut self) {
        self.sent.clear();
    }

    /// Note that a subscribe request for `channel` went out on this open.
    pub fn mark_sent(&mut self, channel: &str) {
        let _ = self.sent.insert(channel.to_owned());
    }

    /// Whether `channel` was already requested on this open.
    pub fn was_sent(&self, channel: &str) -> bool {
        self.sent.contains(channel)
    }

    /// Count a restoration pass.
    pub fn record_restore(&mut self) {
        self.restores += 1;
    }

    /// Restoration passes started so far.
    pub fn restores(&self) -> u64 {
        self.restores
    }
}
