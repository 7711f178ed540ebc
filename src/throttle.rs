use dashmap::DashMap;

use crate::model::Ms;

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Ms,
    count: u32,
}

/// Fixed-window submission limiter keyed by renter (user id or phone).
///
/// The count is bumped inside the map entry, which holds the shard lock,
/// so concurrent submissions for one key never lose an increment.
pub struct SubmitThrottle {
    limit: u32,
    window_ms: Ms,
    windows: DashMap<String, Window>,
}

impl SubmitThrottle {
    /// `limit == 0` disables throttling.
    pub fn new(limit: u32, window_ms: Ms) -> Self {
        Self {
            limit,
            window_ms,
            windows: DashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Record one submission for `key`. Returns false if over the limit.
    pub fn try_acquire(&self, key: &str, now: Ms) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now - entry.started_at >= self.window_ms {
            entry.started_at = now;
            entry.count = 0;
        }
        if entry.count >= self.limit {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop windows that have fully elapsed.
    pub fn prune(&self, now: Ms) {
        self.windows
            .retain(|_, w| now - w.started_at < self.window_ms);
    }

    #[cfg(test)]
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rejects_beyond_limit_within_window() {
        let t = SubmitThrottle::new(2, 1_000);
        assert!(t.try_acquire("u1", 0));
        assert!(t.try_acquire("u1", 10));
        assert!(!t.try_acquire("u1", 20));
        // other keys are independent
        assert!(t.try_acquire("u2", 20));
    }

    #[test]
    fn window_resets() {
        let t = SubmitThrottle::new(1, 1_000);
        assert!(t.try_acquire("u1", 0));
        assert!(!t.try_acquire("u1", 999));
        assert!(t.try_acquire("u1", 1_000));
    }

    #[test]
    fn disabled_never_rejects() {
        let t = SubmitThrottle::disabled();
        for i in 0..100 {
            assert!(t.try_acquire("u1", i));
        }
        assert_eq!(t.tracked_keys(), 0);
    }

    #[test]
    fn prune_drops_elapsed_windows() {
        let t = SubmitThrottle::new(5, 1_000);
        t.try_acquire("a", 0);
        t.try_acquire("b", 900);
        t.prune(1_500);
        assert_eq!(t.tracked_keys(), 1);
    }

    #[test]
    fn concurrent_acquires_respect_limit() {
        let t = Arc::new(SubmitThrottle::new(50, 60_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = t.clone();
                std::thread::spawn(move || (0..20).filter(|_| t.try_acquire("hot", 1)).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
    }
}
