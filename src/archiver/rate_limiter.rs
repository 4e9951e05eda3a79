//! Per-host limit on concurrent page fetches, shared across archive workers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, RwLock, Semaphore};

/// Bounds how many page fetches run at once against any single host.
#[derive(Debug)]
pub struct HostLimiter {
    per_host_limit: usize,
    semaphores: RwLock<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimiter {
    #[must_use]
    pub fn new(per_host_limit: usize) -> Self {
        Self {
            per_host_limit: per_host_limit.max(1),
            semaphores: RwLock::new(HashMap::new()),
        }
    }

    /// Wait for a fetch slot on `host`. The slot is released when the permit drops.
    ///
    /// # Errors
    ///
    /// Fails only if the host's semaphore was closed.
    pub async fn acquire(&self, host: &str) -> Result<HostPermit, AcquireError> {
        let semaphore = self.semaphore_for(host).await;
        let permit = semaphore.acquire_owned().await?;
        Ok(HostPermit { _permit: permit })
    }

    /// Take a slot on `host` only if one is free right now.
    pub async fn try_acquire(&self, host: &str) -> Option<HostPermit> {
        let semaphore = self.semaphore_for(host).await;
        semaphore
            .try_acquire_owned()
            .ok()
            .map(|permit| HostPermit { _permit: permit })
    }

    async fn semaphore_for(&self, host: &str) -> Arc<Semaphore> {
        {
            let read_guard = self.semaphores.read().await;
            if let Some(sem) = read_guard.get(host) {
                return Arc::clone(sem);
            }
        }

        let mut write_guard = self.semaphores.write().await;
        Arc::clone(
            write_guard
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit))),
        )
    }

    /// Forget hosts with no fetch in flight, returning how many were dropped.
    pub async fn prune_idle(&self) -> usize {
        let mut write_guard = self.semaphores.write().await;
        let before = write_guard.len();
        write_guard.retain(|_, sem| {
            Arc::strong_count(sem) > 1 || sem.available_permits() < self.per_host_limit
        });
        before - write_guard.len()
    }

    /// Number of hosts currently tracked.
    pub async fn host_count(&self) -> usize {
        self.semaphores.read().await.len()
    }
}

/// A fetch slot on one host.
#[derive(Debug)]
pub struct HostPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_is_per_host() {
        let limiter = HostLimiter::new(1);

        let _first = limiter.acquire("example.com").await.unwrap();
        assert!(limiter.try_acquire("example.com").await.is_none());
        assert!(limiter.try_acquire("other.example.com").await.is_some());
        assert_eq!(limiter.host_count().await, 2);
    }

    #[tokio::test]
    async fn test_permit_release() {
        let limiter = HostLimiter::new(2);

        let a = limiter.acquire("example.com").await.unwrap();
        let b = limiter.acquire("example.com").await.unwrap();
        assert!(limiter.try_acquire("example.com").await.is_none());

        drop(a);
        assert!(limiter.try_acquire("example.com").await.is_some());
        drop(b);
    }

    #[tokio::test]
    async fn test_prune_idle_keeps_busy_hosts() {
        let limiter = HostLimiter::new(1);

        let busy = limiter.acquire("busy.example.com").await.unwrap();
        drop(limiter.acquire("idle.example.com").await.unwrap());

        assert_eq!(limiter.prune_idle().await, 1);
        assert_eq!(limiter.host_count().await, 1);
        assert!(limiter.try_acquire("busy.example.com").await.is_none());
        drop(busy);
    }

    #[tokio::test]
    async fn test_zero_limit_still_admits_one() {
        let limiter = HostLimiter::new(0);
        assert!(limiter.try_acquire("example.com").await.is_some());
    }
}
