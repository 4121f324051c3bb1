//! Per-client sliding-window rate limiting

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Allows at most `limit` calls per client within any `window`
///
/// Each limiter owns its table of call timestamps; the agent holds one and
/// tests build their own. Clients idle for a whole window are dropped from
/// the table at most once per window, on the next call.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    state: Mutex<Calls>,
}

#[derive(Default)]
struct Calls {
    by_client: HashMap<String, VecDeque<Instant>>,
    last_prune: Option<Instant>,
}

impl Calls {
    fn prune(&mut self, now: Instant, window: Duration) {
        self.by_client.retain(|_, recent| {
            recent
                .back()
                .is_some_and(|last| now.saturating_duration_since(*last) < window)
        });
        self.last_prune = Some(now);
    }
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(Calls::default()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn allow(&self, client_id: &str) -> bool {
        self.allow_at(client_id, Instant::now())
    }

    /// Record a call at `now` unless the client already made `limit` calls
    /// within the preceding window. Rejected calls are not recorded.
    pub fn allow_at(&self, client_id: &str, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let last_prune = state.last_prune;
        match last_prune {
            Some(last) if now.saturating_duration_since(last) < self.window => {}
            Some(_) => {
                state.prune(now, self.window);
                log::debug!("Rate limiter tracking {} clients", state.by_client.len());
            }
            None => state.last_prune = Some(now),
        }

        let recent = state.by_client.entry(client_id.to_string()).or_default();
        while let Some(oldest) = recent.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                recent.pop_front();
            } else {
                break;
            }
        }
        if recent.len() >= self.limit {
            return false;
        }
        recent.push_back(now);
        true
    }

    /// Drop clients with no call inside the window.
    pub fn prune_at(&self, now: Instant) {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .prune(now, self.window);
    }

    pub fn tracked_clients(&self) -> usize {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).by_client.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_after_limit_is_rejected_until_window_passes() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for i in 0..3 {
            assert!(limiter.allow_at("ci", start + Duration::from_secs(i)));
        }
        assert!(!limiter.allow_at("ci", start + Duration::from_secs(10)));

        // The first call leaves the window at start + 60s.
        assert!(limiter.allow_at("ci", start + Duration::from_secs(60)));
        assert!(!limiter.allow_at("ci", start + Duration::from_secs(60)));
    }

    #[test]
    fn test_clients_are_limited_independently() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }

    #[test]
    fn test_prune_forgets_idle_clients() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let now = Instant::now();
        limiter.allow_at("a", now);
        limiter.allow_at("b", now + Duration::from_secs(2));
        limiter.prune_at(now + Duration::from_secs(2));
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_idle_clients_are_dropped_by_later_calls() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();
        for i in 0..100 {
            assert!(limiter.allow_at(&format!("client-{i}"), start));
        }
        assert_eq!(limiter.tracked_clients(), 100);

        // Inside the window nothing is dropped.
        assert!(limiter.allow_at("late", start + Duration::from_secs(30)));
        assert_eq!(limiter.tracked_clients(), 101);

        // The first call after a full window drops everyone idle since.
        assert!(limiter.allow_at("late", start + Duration::from_secs(61)));
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert!(!limiter.allow("a"));
    }
}
