use crate::storage::CounterStore;
use crate::{Result, SumiError};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A fixed-window rate limit backed by a shared counter store
///
/// Time is cut into windows of `unit`; at most `limit` uses are allowed per
/// window. Because the counters live in the [`CounterStore`], every worker
/// sharing the store shares the limit.
pub struct RateLimit {
    counters: Arc<dyn CounterStore>,
    resource: String,
    limit: u64,
    unit: Duration,
}

impl RateLimit {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        resource: impl Into<String>,
        limit: u64,
        unit: Duration,
    ) -> Self {
        Self {
            counters,
            resource: resource.into(),
            limit: limit.max(1),
            unit: unit.max(Duration::from_millis(1)),
        }
    }

    /// A limit expressed in uses per minute
    ///
    /// Rates of one per second or more use one-second windows; slower rates
    /// allow a single use per `60 / per_minute` seconds. Zero disables the
    /// limit.
    pub fn per_minute(
        counters: Arc<dyn CounterStore>,
        resource: impl Into<String>,
        per_minute: u32,
    ) -> Self {
        match per_minute {
            0 => Self::new(counters, resource, u64::MAX, Duration::from_secs(1)),
            n if n >= 60 => Self::new(counters, resource, u64::from(n / 60), Duration::from_secs(1)),
            n => Self::new(
                counters,
                resource,
                1,
                Duration::from_secs_f64(60.0 / f64::from(n)),
            ),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn now_millis() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    }

    fn window(&self) -> u128 {
        Self::now_millis() / self.unit.as_millis().max(1)
    }

    fn key(&self) -> String {
        format!("rate/{}/{}", self.resource, self.window())
    }

    /// Time left in the current window
    fn remaining(&self) -> Duration {
        let unit = self.unit.as_millis().max(1);
        let elapsed = Self::now_millis() % unit;
        Duration::from_millis((unit - elapsed) as u64)
    }

    /// Counts one use in the current window and returns the window's total
    pub fn update(&self) -> Result<u64> {
        Ok(self.counters.incr(&self.key(), self.unit * 2)?)
    }

    /// Checks whether the current window is within the limit
    pub fn check(&self) -> Result<bool> {
        Ok(self.counters.count(&self.key())? <= self.limit)
    }

    /// Waits until the current window is within the limit
    pub async fn comply(&self) -> Result<()> {
        while !self.check()? {
            tokio::time::sleep(self.remaining()).await;
        }
        Ok(())
    }

    /// Counts a use, failing instead of waiting when over the limit
    pub fn try_acquire(&self) -> Result<()> {
        if self.update()? > self.limit {
            return Err(SumiError::RateLimit {
                resource: self.resource.clone(),
            });
        }
        Ok(())
    }

    /// Counts a use, waiting for a later window while over the limit
    pub async fn enforce(&self) -> Result<()> {
        while self.update()? > self.limit {
            tracing::debug!("Rate limit reached for {}, waiting", self.resource);
            tokio::time::sleep(self.remaining()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::time::Instant;

    fn store() -> Arc<dyn CounterStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_per_minute_windows() {
        let fast = RateLimit::per_minute(store(), "a", 120);
        assert_eq!(fast.limit, 2);
        assert_eq!(fast.unit, Duration::from_secs(1));

        let slow = RateLimit::per_minute(store(), "b", 30);
        assert_eq!(slow.limit, 1);
        assert_eq!(slow.unit, Duration::from_secs(2));
    }

    #[test]
    fn test_try_acquire_fails_over_limit() {
        let limit = RateLimit::new(store(), "host", 2, Duration::from_secs(3600));
        assert!(limit.try_acquire().is_ok());
        assert!(limit.try_acquire().is_ok());
        assert!(limit.check().unwrap());
        assert!(matches!(
            limit.try_acquire(),
            Err(SumiError::RateLimit { resource }) if resource == "host"
        ));
        assert!(!limit.check().unwrap());
    }

    #[test]
    fn test_limits_are_per_resource() {
        let counters = store();
        let a = RateLimit::new(counters.clone(), "a", 1, Duration::from_secs(3600));
        let b = RateLimit::new(counters, "b", 1, Duration::from_secs(3600));
        a.try_acquire().unwrap();
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_enforce_waits_for_next_window() {
        let limit = RateLimit::new(store(), "host", 1, Duration::from_millis(200));
        let start = Instant::now();
        limit.enforce().await.unwrap();
        limit.enforce().await.unwrap();
        limit.enforce().await.unwrap();
        // three uses at one per window span at least two window boundaries
        assert!(start.elapsed() >= Duration::from_millis(200));
        limit.comply().await.unwrap();
    }
}
