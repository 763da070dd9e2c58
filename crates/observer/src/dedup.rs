//! Short-lived seen-sets deduplicating inventory requests.
//!
//! Every session consults these before sending `getdata`, so each
//! announced object is fetched once per expiry window no matter how many
//! peers announce it. `mark` is first-wins under concurrency: exactly one
//! caller sees `true` per hash per window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use chainwatch_monitoring::SEEN_MAP_SIZE;
use chainwatch_protocol::Hash256;

/// How long a hash stays marked.
pub const SEEN_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// Sweep cadence for expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One hash set with insertion timestamps.
#[derive(Default)]
pub struct SeenSet {
    entries: Mutex<HashMap<Hash256, Instant>>,
}

impl SeenSet {
    pub fn new() -> Self {
        SeenSet::default()
    }

    /// Returns true iff `hash` was not present; inserts it with the
    /// current time.
    pub fn mark(&self, hash: Hash256) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&hash) {
            return false;
        }
        entries.insert(hash, Instant::now());
        true
    }

    /// Drops entries older than `max_age`; returns the remaining size.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, inserted| inserted.elapsed() < max_age);
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// The two disjoint seen-sets, created once at startup and shared by
/// handle. Tests build their own instances.
#[derive(Default)]
pub struct SeenCaches {
    pub txs: SeenSet,
    pub blocks: SeenSet,
}

impl SeenCaches {
    pub fn new() -> Self {
        SeenCaches::default()
    }

    fn sweep(&self) {
        let tx_len = self.txs.sweep(SEEN_EXPIRY);
        SEEN_MAP_SIZE.with_label_values(&["tx"]).set(tx_len as i64);

        let block_len = self.blocks.sweep(SEEN_EXPIRY);
        SEEN_MAP_SIZE
            .with_label_values(&["block"])
            .set(block_len as i64);
    }
}

/// Periodic eviction of expired entries until cancellation.
pub fn spawn_sweeper(
    caches: Arc<SeenCaches>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => caches.sweep(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(fill: u8) -> Hash256 {
        Hash256::from_bytes([fill; 32])
    }

    #[test]
    fn mark_is_first_wins() {
        let set = SeenSet::new();
        assert!(set.mark(hash(1)));
        assert!(!set.mark(hash(1)));
        assert!(set.mark(hash(2)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn sweep_expires_and_allows_remark() {
        let set = SeenSet::new();
        assert!(set.mark(hash(1)));

        // Within the window nothing is evicted.
        assert_eq!(set.sweep(Duration::from_secs(600)), 1);
        assert!(!set.mark(hash(1)));

        // A zero window expires everything; the hash marks fresh again.
        assert_eq!(set.sweep(Duration::ZERO), 0);
        assert!(set.mark(hash(1)));
    }

    #[test]
    fn tx_and_block_sets_are_disjoint() {
        let caches = SeenCaches::new();
        assert!(caches.txs.mark(hash(7)));
        assert!(caches.blocks.mark(hash(7)));
        assert!(!caches.txs.mark(hash(7)));
    }

    #[test]
    fn concurrent_marks_hand_out_one_true() {
        let set = Arc::new(SeenSet::new());
        let winners: Vec<bool> = std::thread::scope(|scope| {
            (0..8)
                .map(|_| {
                    let set = Arc::clone(&set);
                    scope.spawn(move || set.mark(hash(0x42)))
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });
        assert_eq!(winners.into_iter().filter(|&won| won).count(), 1);
    }
}
