//! Cancellable one-shot deadlines.
//!
//! The engine never sleeps per timer. Components arm deadlines here and the
//! session loop sleeps until the earliest one, then collects whatever expired.
//! Because deadlines are plain [`Instant`]s, tests drive them with tokio's
//! paused clock or with hand-built instants.

use std::collections::BTreeMap;
use tokio::time::Instant;

/// A set of deadlines keyed by `K`. Re-arming a key replaces its deadline.
#[derive(Debug, Clone)]
pub struct Timers<K: Ord + Clone> {
    deadlines: BTreeMap<K, Instant>,
}

impl<K: Ord + Clone> Default for Timers<K> {
    fn default() -> Self {
        Self {
            deadlines: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> Timers<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, key: K, at: Instant) {
        self.deadlines.insert(key, at);
    }

    /// Arms `key` only if it is not already pending.
    pub fn arm_if_idle(&mut self, key: K, at: Instant) {
        self.deadlines.entry(key).or_insert(at);
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&K) -> bool) {
        self.deadlines.retain(|key, _| !predicate(key));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Removes and returns every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired: Vec<(Instant, K)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, at)| (*at, key.clone()))
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        for (_, key) in &expired {
            self.deadlines.remove(key);
        }
        expired.into_iter().map(|(_, key)| key).collect()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}
