//! Peer selection heap.
//!
//! Indexed binary min-heap over the peers of one service. The root is always
//! the best candidate: fewest outstanding calls, then fewest consecutive
//! failures, then least recently chosen. A position index makes score updates
//! and removals `O(log n)` instead of a linear scan.
//!
//! The rotation stamp gives round-robin behaviour among equally loaded,
//! equally healthy peers: choosing a peer restamps it with the next sequence
//! number, which sinks it below every peer chosen earlier.

use std::{collections::HashMap, hash::Hash};

/// Ordering key of one peer. Lower is better.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Score {
    /// Calls started and not yet finished.
    pub outstanding: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Selection sequence number; lower means chosen longer ago.
    pub stamp: u64,
}

/// How a call bound to a peer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Completed normally; clears the failure streak.
    Success,
    /// Failed in a way that reflects on the peer.
    Failure,
    /// Ended for reasons unrelated to the peer's health, such as a caller
    /// cancellation. Only the load changes.
    Abandoned,
}

#[derive(Debug, Clone)]
struct Entry<K> {
    key: K,
    score: Score,
}

/// Min-heap of peers keyed by `K` (usually the `host:port`).
#[derive(Debug, Clone)]
pub struct PeerHeap<K> {
    entries: Vec<Entry<K>>,
    positions: HashMap<K, usize>,
    next_stamp: u64,
}

impl<K: Clone + Eq + Hash> PeerHeap<K> {
    /// Empty heap.
    pub fn new() -> Self {
        Self { entries: Vec::new(), positions: HashMap::new(), next_stamp: 0 }
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no peers are known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    /// Current score of `key`.
    pub fn score(&self, key: &K) -> Option<Score> {
        self.positions.get(key).map(|&pos| self.entries[pos].score)
    }

    /// Add a peer with a clean score. Returns false if already present.
    pub fn insert(&mut self, key: K) -> bool {
        if self.positions.contains_key(&key) {
            return false;
        }
        let stamp = self.bump_stamp();
        let pos = self.entries.len();
        self.entries.push(Entry { key: key.clone(), score: Score { stamp, ..Score::default() } });
        self.positions.insert(key, pos);
        self.sift_up(pos);
        true
    }

    /// Drop a peer. Returns false if it was not present.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(pos) = self.positions.remove(key) else {
            return false;
        };
        let last = self.entries.len() - 1;
        self.entries.swap(pos, last);
        self.entries.pop();
        if pos < self.entries.len() {
            self.positions.insert(self.entries[pos].key.clone(), pos);
            self.restore(pos);
        }
        true
    }

    /// Pick the best peer and rotate it behind its equals.
    pub fn choose(&mut self) -> Option<K> {
        if self.entries.is_empty() {
            return None;
        }
        let stamp = self.bump_stamp();
        self.entries[0].score.stamp = stamp;
        let key = self.entries[0].key.clone();
        self.sift_down(0);
        Some(key)
    }

    /// A call was bound to `key`.
    pub fn record_start(&mut self, key: &K) {
        self.update(key, |score| score.outstanding = score.outstanding.saturating_add(1));
    }

    /// A call on `key` finished.
    pub fn record_end(&mut self, key: &K, outcome: CallOutcome) {
        self.update(key, |score| {
            score.outstanding = score.outstanding.saturating_sub(1);
            match outcome {
                CallOutcome::Success => score.consecutive_failures = 0,
                CallOutcome::Failure => {
                    score.consecutive_failures = score.consecutive_failures.saturating_add(1);
                },
                CallOutcome::Abandoned => {},
            }
        });
    }

    /// Connecting to `key` failed.
    pub fn record_connection_failure(&mut self, key: &K) {
        self.update(key, |score| {
            score.consecutive_failures = score.consecutive_failures.saturating_add(1);
        });
    }

    fn update(&mut self, key: &K, f: impl FnOnce(&mut Score)) {
        if let Some(&pos) = self.positions.get(key) {
            f(&mut self.entries[pos].score);
            self.restore(pos);
        }
    }

    fn bump_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    fn restore(&mut self, pos: usize) {
        let pos = self.sift_up(pos);
        self.sift_down(pos);
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.entries[pos].score >= self.entries[parent].score {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < self.entries.len() && self.entries[left].score < self.entries[smallest].score {
                smallest = left;
            }
            if right < self.entries.len() && self.entries[right].score < self.entries[smallest].score
            {
                smallest = right;
            }
            if smallest == pos {
                return;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].key.clone(), a);
        self.positions.insert(self.entries[b].key.clone(), b);
    }
}

impl<K: Clone + Eq + Hash> Default for PeerHeap<K> {
    fn default() -> Self {
        Self::new()
    }
}
