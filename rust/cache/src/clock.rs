//! Process-wide version clock.
//!
//! Entry timestamps double as version numbers for last-writer-wins conflict
//! resolution, so within one process two reads must never return the same or
//! a regressing value.  Wall-clock nanoseconds are bumped through an atomic
//! to guarantee that; across the cluster the hosts are assumed to be
//! NTP-synchronized.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST: AtomicU64 = AtomicU64::new(0);

/// Current timestamp in nanoseconds since the Unix epoch, strictly greater
/// than every value previously returned in this process.
pub fn tsm_now() -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = wall.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => prev = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing_within_a_thread() {
        let mut last = 0;
        for _ in 0..10_000 {
            let now = tsm_now();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn strictly_increasing_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..1_000).map(|_| tsm_now()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("clock thread"))
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
