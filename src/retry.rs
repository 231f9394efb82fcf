//! Retry policy and the retrying store decorator.
//!
//! One [`RetryPolicy`] shape serves three callers: transient store errors
//! on the search path and transient generation failures (both exponential)
//! and analytics consumer failures (linear, `base × attempt`).

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use grounding_core::error::RetrievalError;
use grounding_core::models::{Fragment, FragmentHit, FragmentSummary};
use grounding_core::store::VectorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base × attempt`
    Linear,
    /// `base × 2^(attempt - 1)`
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            backoff: Backoff::Linear,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are used up. Returns the last error in the latter cases.
pub async fn retry_with<T, E, F, Fut>(
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.max_retries && is_retryable(&e) => {
                attempt += 1;
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// [`VectorStore`] decorator that retries reads on
/// [`RetrievalError::TransientRetrieval`].
///
/// Writes are not retried here: ingestion reports per-fragment failures to
/// its caller instead.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: VectorStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: VectorStore> VectorStore for RetryingStore<S> {
    async fn upsert(&self, fragment: &Fragment) -> Result<(), RetrievalError> {
        self.inner.upsert(fragment).await
    }

    async fn get(&self, fragment_id: &str) -> Result<Option<Fragment>, RetrievalError> {
        retry_with(&self.policy, RetrievalError::is_transient, |_| {
            self.inner.get(fragment_id)
        })
        .await
    }

    async fn search_within_partition(
        &self,
        partition_key: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<FragmentHit>, RetrievalError> {
        retry_with(&self.policy, RetrievalError::is_transient, |attempt| {
            if attempt > 0 {
                warn!(partition_key, attempt, "retrying partition search");
            }
            self.inner.search_within_partition(partition_key, query, k)
        })
        .await
    }

    async fn list_partition(
        &self,
        partition_key: &str,
    ) -> Result<Vec<FragmentSummary>, RetrievalError> {
        retry_with(&self.policy, RetrievalError::is_transient, |_| {
            self.inner.list_partition(partition_key)
        })
        .await
    }

    async fn list_sources(&self, tenant_id: &str) -> Result<Vec<String>, RetrievalError> {
        retry_with(&self.policy, RetrievalError::is_transient, |_| {
            self.inner.list_sources(tenant_id)
        })
        .await
    }

    async fn delete(&self, fragment_id: &str) -> Result<bool, RetrievalError> {
        self.inner.delete(fragment_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grounding_core::models::partition_key;
    use grounding_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32, backoff: Backoff) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            backoff,
        }
    }

    #[test]
    fn test_linear_delay() {
        let p = policy(3, Backoff::Linear);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_delay() {
        let p = policy(3, Backoff::Exponential);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(40), Duration::MAX);
    }

    #[tokio::test]
    async fn test_retry_with_stops_on_success() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy {
            base_delay: Duration::ZERO,
            ..policy(5, Backoff::Linear)
        };
        let out: Result<u32, String> = retry_with(&p, |_| true, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("boom".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy {
            base_delay: Duration::ZERO,
            ..policy(2, Backoff::Linear)
        };
        let out: Result<(), String> = retry_with(&p, |_| true, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom".to_string()) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_skips_non_retryable() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = retry_with(&policy(5, Backoff::Linear), |_| false, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("fatal".to_string()) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct Flaky {
        inner: InMemoryStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl VectorStore for Flaky {
        async fn upsert(&self, f: &Fragment) -> Result<(), RetrievalError> {
            self.inner.upsert(f).await
        }
        async fn get(&self, id: &str) -> Result<Option<Fragment>, RetrievalError> {
            self.inner.get(id).await
        }
        async fn search_within_partition(
            &self,
            key: &str,
            q: &[f32],
            k: usize,
        ) -> Result<Vec<FragmentHit>, RetrievalError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RetrievalError::TransientRetrieval("timeout".to_string()));
            }
            self.inner.search_within_partition(key, q, k).await
        }
        async fn list_partition(&self, key: &str) -> Result<Vec<FragmentSummary>, RetrievalError> {
            self.inner.list_partition(key).await
        }
        async fn list_sources(&self, t: &str) -> Result<Vec<String>, RetrievalError> {
            self.inner.list_sources(t).await
        }
        async fn delete(&self, id: &str) -> Result<bool, RetrievalError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_retrying_store_recovers_from_transient_errors() {
        let p = RetryPolicy {
            base_delay: Duration::ZERO,
            ..policy(2, Backoff::Exponential)
        };
        let flaky = Flaky {
            inner: InMemoryStore::new(),
            failures_left: AtomicU32::new(2),
        };
        let store = RetryingStore::new(flaky, p);
        let hits = store
            .search_within_partition(&partition_key("sage", "a"), &[1.0], 3)
            .await
            .unwrap();
        assert!(hits.is_empty());

        let flaky = Flaky {
            inner: InMemoryStore::new(),
            failures_left: AtomicU32::new(3),
        };
        let store = RetryingStore::new(flaky, p);
        let err = store
            .search_within_partition(&partition_key("sage", "a"), &[1.0], 3)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
