use crate::identity::RateLimiter;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// In-process sliding-window limiter: a bounded map of per-key ring buffers
/// of request timestamps, evicted lazily on each `acquire`.
pub struct InProcessRateLimiter {
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<u64>>>,
    max_tracked_keys: usize,
}

impl InProcessRateLimiter {
    pub fn new(window: Duration, max_tracked_keys: usize) -> Self {
        Self {
            window,
            windows: Mutex::new(HashMap::new()),
            max_tracked_keys,
        }
    }

    fn evict_expired(buffer: &mut VecDeque<u64>, now: u64, window_secs: u64) {
        while let Some(&oldest) = buffer.front() {
            if now.saturating_sub(oldest) >= window_secs {
                buffer.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiter for InProcessRateLimiter {
    fn acquire(&self, key: &str, capacity: u32) -> Result<(), u64> {
        let now = now_secs();
        let window_secs = self.window.as_secs();
        let mut windows = self.windows.lock().unwrap();

        if !windows.contains_key(key) && windows.len() >= self.max_tracked_keys {
            // Periodic eviction: drop any key whose window is already empty
            // to make room, rather than growing unbounded.
            windows.retain(|_, buf| {
                Self::evict_expired(buf, now, window_secs);
                !buf.is_empty()
            });
        }

        let buffer = windows.entry(key.to_string()).or_default();
        Self::evict_expired(buffer, now, window_secs);

        if buffer.len() as u32 >= capacity {
            let oldest = *buffer.front().unwrap_or(&now);
            let retry_after = window_secs.saturating_sub(now.saturating_sub(oldest));
            return Err(retry_after.max(1));
        }

        buffer.push_back(now);
        Ok(())
    }
}

/// Backing client for the shared, key-value-service-backed limiter variant.
/// Mirrors an atomic increment-with-expiry primitive (e.g. Redis `INCR` + `EXPIRE`).
pub trait SharedCounterClient: Send + Sync {
    /// Increments the counter for `key`, creating it with `ttl` if absent.
    /// Returns the post-increment value, or `None` on client/connectivity failure.
    fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Option<u64>;
}

/// Rate limiter over a shared key-value service. On client failure it
/// degrades to permissive mode rather than failing the request, and tracks
/// how often it had to do so.
pub struct SharedRateLimiter<C> {
    client: C,
    window: Duration,
    degraded_count: AtomicU64,
}

impl<C: SharedCounterClient> SharedRateLimiter<C> {
    pub fn new(client: C, window: Duration) -> Self {
        Self {
            client,
            window,
            degraded_count: AtomicU64::new(0),
        }
    }

    pub fn degraded_mode_count(&self) -> u64 {
        self.degraded_count.load(Ordering::Relaxed)
    }
}

impl<C: SharedCounterClient> RateLimiter for SharedRateLimiter<C> {
    fn acquire(&self, key: &str, capacity: u32) -> Result<(), u64> {
        match self.client.increment_with_expiry(key, self.window) {
            Some(count) if count > capacity as u64 => Err(self.window.as_secs()),
            Some(_) => Ok(()),
            None => {
                self.degraded_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn in_process_limiter_allows_up_to_capacity() {
        let limiter = InProcessRateLimiter::new(Duration::from_secs(60), 1024);
        assert!(limiter.acquire("k1", 2).is_ok());
        assert!(limiter.acquire("k1", 2).is_ok());
        let err = limiter.acquire("k1", 2).unwrap_err();
        assert!(err <= 60);
    }

    #[test]
    fn in_process_limiter_tracks_keys_independently() {
        let limiter = InProcessRateLimiter::new(Duration::from_secs(60), 1024);
        assert!(limiter.acquire("k1", 1).is_ok());
        assert!(limiter.acquire("k2", 1).is_ok());
        assert!(limiter.acquire("k1", 1).is_err());
    }

    struct FailingClient;
    impl SharedCounterClient for FailingClient {
        fn increment_with_expiry(&self, _key: &str, _ttl: Duration) -> Option<u64> {
            None
        }
    }

    struct WorkingClient(StdMutex<HashMap<String, u64>>);
    impl SharedCounterClient for WorkingClient {
        fn increment_with_expiry(&self, key: &str, _ttl: Duration) -> Option<u64> {
            let mut map = self.0.lock().unwrap();
            let v = map.entry(key.to_string()).or_insert(0);
            *v += 1;
            Some(*v)
        }
    }

    #[test]
    fn shared_limiter_degrades_to_permissive_on_client_failure() {
        let limiter = SharedRateLimiter::new(FailingClient, Duration::from_secs(60));
        assert!(limiter.acquire("k1", 1).is_ok());
        assert!(limiter.acquire("k1", 1).is_ok());
        assert_eq!(limiter.degraded_mode_count(), 2);
    }

    #[test]
    fn shared_limiter_enforces_capacity_when_client_healthy() {
        let limiter = SharedRateLimiter::new(WorkingClient(StdMutex::new(HashMap::new())), Duration::from_secs(60));
        assert!(limiter.acquire("k1", 1).is_ok());
        assert!(limiter.acquire("k1", 1).is_err());
        assert_eq!(limiter.degraded_mode_count(), 0);
    }
}
