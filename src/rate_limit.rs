use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

struct AttemptWindow {
    count: u32,
    window_start: Instant,
}

/// Fixed-window counter over connection *attempts* per source address.
/// An accepted connection that stays open does not count against later
/// windows; only new attempts do.
pub struct ConnectionRateLimiter {
    window: Duration,
    max_attempts: u32,
    attempts: Mutex<HashMap<IpAddr, AttemptWindow>>,
}

impl ConnectionRateLimiter {
    pub fn new(window: Duration, max_attempts: u32) -> Self {
        Self {
            window,
            max_attempts: max_attempts.max(1),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the attempt is admitted. Must be called before
    /// the connection is tracked anywhere else; a rejected attempt never
    /// reaches the registry.
    pub async fn admit(&self, source: IpAddr) -> bool {
        self.admit_at(source, Instant::now()).await
    }

    async fn admit_at(&self, source: IpAddr, now: Instant) -> bool {
        let mut attempts = self.attempts.lock().await;
        // Fully elapsed windows carry no budget; dropping them here
        // keeps the map bounded by sources active in the last window.
        attempts.retain(|_, entry| now.duration_since(entry.window_start) < self.window);
        let entry = attempts.entry(source).or_insert(AttemptWindow {
            count: 0,
            window_start: now,
        });
        entry.count += 1;
        entry.count <= self.max_attempts
    }

    #[cfg(test)]
    async fn tracked_sources(&self) -> usize {
        self.attempts.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant};

    use super::ConnectionRateLimiter;

    fn addr(last_octet: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet))
    }

    #[tokio::test]
    async fn eleventh_attempt_in_window_is_rejected() {
        let limiter = ConnectionRateLimiter::new(Duration::from_secs(60), 10);
        let start = Instant::now();
        for _ in 0..10 {
            assert!(limiter.admit_at(addr(1), start).await);
        }
        assert!(!limiter.admit_at(addr(1), start).await);
    }

    #[tokio::test]
    async fn first_attempt_after_window_elapses_is_accepted() {
        let limiter = ConnectionRateLimiter::new(Duration::from_secs(60), 10);
        let start = Instant::now();
        for _ in 0..11 {
            let _ = limiter.admit_at(addr(1), start).await;
        }
        assert!(!limiter.admit_at(addr(1), start).await);
        let later = start + Duration::from_secs(60);
        assert!(limiter.admit_at(addr(1), later).await);
        // The window restarted; the fresh budget applies again.
        for _ in 0..9 {
            assert!(limiter.admit_at(addr(1), later).await);
        }
        assert!(!limiter.admit_at(addr(1), later).await);
    }

    #[tokio::test]
    async fn elapsed_windows_are_dropped_from_the_attempt_map() {
        let limiter = ConnectionRateLimiter::new(Duration::from_secs(60), 10);
        let start = Instant::now();
        assert!(limiter.admit_at(addr(1), start).await);
        assert!(limiter.admit_at(addr(2), start).await);
        assert_eq!(limiter.tracked_sources().await, 2);

        // One window later only the fresh source remains tracked.
        let later = start + Duration::from_secs(60);
        assert!(limiter.admit_at(addr(3), later).await);
        assert_eq!(limiter.tracked_sources().await, 1);
    }

    #[tokio::test]
    async fn distinct_sources_are_limited_independently() {
        let limiter = ConnectionRateLimiter::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        assert!(limiter.admit_at(addr(1), now).await);
        assert!(limiter.admit_at(addr(1), now).await);
        assert!(!limiter.admit_at(addr(1), now).await);
        assert!(limiter.admit_at(addr(2), now).await);
        assert!(limiter.admit_at(addr(2), now).await);
    }
}
