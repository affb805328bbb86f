//! Per-client sliding-window admission control.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// How often the background sweep reclaims idle entries.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// Sliding-window counter keyed by client address. Admission and
/// reclamation share the single mutex.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: i64,
    window: Duration,
    requests: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: i64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_seconds),
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a request from `ip` is admitted right now.
    pub fn allow(&self, ip: &str) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: &str, now: Instant) -> bool {
        if self.max_requests <= 0 {
            return true;
        }

        let mut requests = match self.requests.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let timestamps = requests.entry(ip.to_string()).or_default();

        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() as i64 >= self.max_requests {
            return false;
        }

        timestamps.push_back(now);
        // The window drop above already bounds the deque, but a clock
        // anomaly must never let it grow past the configured ceiling.
        while timestamps.len() as i64 > self.max_requests {
            timestamps.pop_front();
        }
        true
    }

    /// Drop entries whose whole window has expired.
    pub fn reclaim(&self) {
        self.reclaim_at(Instant::now());
    }

    fn reclaim_at(&self, now: Instant) {
        let mut requests = match self.requests.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        requests.retain(|_, timestamps| {
            while let Some(front) = timestamps.front() {
                if now.duration_since(*front) >= self.window {
                    timestamps.pop_front();
                } else {
                    break;
                }
            }
            !timestamps.is_empty()
        });
    }

    pub fn tracked_clients(&self) -> usize {
        match self.requests.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Periodic reclamation until the shutdown signal flips.
    pub async fn run_reclaimer(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(RECLAIM_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reclaim(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!(target: "gatehouse::ratelimit", "reclaimer stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_admits_then_denies_then_recovers() {
        let limiter = RateLimiter::new(3, 60);
        let start = Instant::now();

        assert!(limiter.allow_at("1.2.3.4", start));
        assert!(limiter.allow_at("1.2.3.4", start + Duration::from_secs(1)));
        assert!(limiter.allow_at("1.2.3.4", start + Duration::from_secs(2)));
        assert!(!limiter.allow_at("1.2.3.4", start + Duration::from_secs(3)));
        assert!(limiter.allow_at("1.2.3.4", start + Duration::from_secs(61)));
    }

    #[test]
    fn clients_are_tracked_independently() {
        let limiter = RateLimiter::new(1, 60);
        let now = Instant::now();
        assert!(limiter.allow_at("1.1.1.1", now));
        assert!(limiter.allow_at("2.2.2.2", now));
        assert!(!limiter.allow_at("1.1.1.1", now));
    }

    #[test]
    fn zero_limit_disables_the_limiter() {
        let limiter = RateLimiter::new(0, 60);
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(limiter.allow_at("1.2.3.4", now));
        }
    }

    #[test]
    fn per_client_list_is_bounded_by_the_limit() {
        let limiter = RateLimiter::new(5, 60);
        let now = Instant::now();
        for i in 0..50 {
            limiter.allow_at("9.9.9.9", now + Duration::from_millis(i));
        }
        let requests = limiter.requests.lock().unwrap();
        assert!(requests.get("9.9.9.9").unwrap().len() <= 5);
    }

    #[test]
    fn reclaim_drops_expired_entries() {
        let limiter = RateLimiter::new(3, 60);
        let start = Instant::now();
        limiter.allow_at("old.client", start);
        limiter.allow_at("new.client", start + Duration::from_secs(90));
        assert_eq!(limiter.tracked_clients(), 2);

        limiter.reclaim_at(start + Duration::from_secs(100));
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test]
    async fn reclaimer_exits_on_shutdown() {
        let limiter = std::sync::Arc::new(RateLimiter::new(3, 60));
        let (tx, rx) = watch::channel(false);
        let task = {
            let limiter = std::sync::Arc::clone(&limiter);
            tokio::spawn(async move { limiter.run_reclaimer(rx).await })
        };
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reclaimer exits")
            .unwrap();
    }
}
