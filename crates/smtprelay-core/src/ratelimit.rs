//! Rate limiter - per-tenant rolling minute/hour windows
//!
//! Counters are created lazily on the first message for a tenant and
//! live for the process lifetime (bounded by the tenant set). Windows
//! are rolling rather than bucket-aligned so a burst straddling a
//! minute boundary cannot double its admission. Increment-and-check is
//! one critical section: two concurrent transactions can never both
//! pass a limit only one should.

use smtprelay_common::config::RateLimit;
use smtprelay_common::RelayError;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
struct TenantWindows {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

impl TenantWindows {
    fn prune(&mut self, now: Instant) {
        while self.minute.front().is_some_and(|t| now.duration_since(*t) >= MINUTE) {
            self.minute.pop_front();
        }
        while self.hour.front().is_some_and(|t| now.duration_since(*t) >= HOUR) {
            self.hour.pop_front();
        }
    }
}

/// Per-tenant rate limiter shared across sessions
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, TenantWindows>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one message for `tenant`, or fail with `RateLimited`.
    ///
    /// Called synchronously before any delivery I/O is spent. A tenant
    /// without a configured limit is unrestricted and keeps no state.
    pub fn check(&self, tenant: &str, limit: Option<&RateLimit>) -> Result<(), RelayError> {
        self.check_at(tenant, limit, Instant::now())
    }

    fn check_at(
        &self,
        tenant: &str,
        limit: Option<&RateLimit>,
        now: Instant,
    ) -> Result<(), RelayError> {
        let Some(limit) = limit else {
            return Ok(());
        };
        if limit.per_minute.is_none() && limit.per_hour.is_none() {
            return Ok(());
        }

        let mut map = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let windows = map.entry(tenant.to_string()).or_default();
        windows.prune(now);

        if let Some(per_minute) = limit.per_minute {
            if windows.minute.len() >= per_minute as usize {
                return Err(RelayError::RateLimited(tenant.to_string()));
            }
        }
        if let Some(per_hour) = limit.per_hour {
            if windows.hour.len() >= per_hour as usize {
                return Err(RelayError::RateLimited(tenant.to_string()));
            }
        }

        windows.minute.push_back(now);
        windows.hour.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(per_minute: Option<u32>, per_hour: Option<u32>) -> RateLimit {
        RateLimit {
            per_minute,
            per_hour,
        }
    }

    #[test]
    fn test_minute_window_enforced() {
        let limiter = RateLimiter::new();
        let lim = limit(Some(2), None);
        let t0 = Instant::now();

        assert!(limiter.check_at("acme", Some(&lim), t0).is_ok());
        assert!(limiter.check_at("acme", Some(&lim), t0).is_ok());
        let err = limiter.check_at("acme", Some(&lim), t0).unwrap_err();
        assert!(matches!(err, RelayError::RateLimited(_)));

        // After the rolling window elapses the slot frees up again.
        let later = t0 + Duration::from_secs(61);
        assert!(limiter.check_at("acme", Some(&lim), later).is_ok());
    }

    #[test]
    fn test_rolling_not_bucket_aligned() {
        let limiter = RateLimiter::new();
        let lim = limit(Some(2), None);
        let t0 = Instant::now();

        assert!(limiter.check_at("acme", Some(&lim), t0).is_ok());
        assert!(limiter
            .check_at("acme", Some(&lim), t0 + Duration::from_secs(30))
            .is_ok());
        // 59s after the first message: the first still occupies its slot.
        assert!(limiter
            .check_at("acme", Some(&lim), t0 + Duration::from_secs(59))
            .is_err());
        // 61s after the first message: only the second remains.
        assert!(limiter
            .check_at("acme", Some(&lim), t0 + Duration::from_secs(61))
            .is_ok());
    }

    #[test]
    fn test_hour_window_enforced() {
        let limiter = RateLimiter::new();
        let lim = limit(None, Some(3));
        let t0 = Instant::now();

        for i in 0..3 {
            assert!(
                limiter
                    .check_at("acme", Some(&lim), t0 + Duration::from_secs(i * 600))
                    .is_ok()
            );
        }
        assert!(limiter
            .check_at("acme", Some(&lim), t0 + Duration::from_secs(1800))
            .is_err());
        assert!(limiter
            .check_at("acme", Some(&lim), t0 + Duration::from_secs(3601))
            .is_ok());
    }

    #[test]
    fn test_unlimited_tenant() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        for _ in 0..1000 {
            assert!(limiter.check_at("open", None, t0).is_ok());
            assert!(limiter
                .check_at("open", Some(&limit(None, None)), t0)
                .is_ok());
        }
    }

    #[test]
    fn test_tenants_are_independent() {
        let limiter = RateLimiter::new();
        let lim = limit(Some(1), None);
        let t0 = Instant::now();

        assert!(limiter.check_at("a", Some(&lim), t0).is_ok());
        assert!(limiter.check_at("b", Some(&lim), t0).is_ok());
        assert!(limiter.check_at("a", Some(&lim), t0).is_err());
    }
}
