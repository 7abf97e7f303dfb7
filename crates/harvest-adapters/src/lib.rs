//! Scraping collaborator contract, bounded-retry decorator and fixture-first source.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::{AttributeSet, ReviewContent, VenueDraft, VenueTarget};
use thiserror::Error;
use tracing::warn;

mod fixture;
pub mod normalize;

pub use fixture::{load_fixture_bundle, FixtureBundle, FixtureSource, FixtureTarget};
pub use normalize::{RawReview, RawVenueFields};

pub const CRATE_NAME: &str = "harvest-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("target unreachable: {0}")]
    Unreachable(String),
    #[error("driver setup failed: {0}")]
    Setup(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl AdapterError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            AdapterError::Timeout { .. } | AdapterError::Unreachable(_) => RetryDisposition::Retryable,
            AdapterError::Setup(_) | AdapterError::Message(_) | AdapterError::Anyhow(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

/// Capability offered by the (external) page-interaction layer. Every call is fallible and
/// may be retried by the caller; implementations never retry on their own.
#[async_trait]
pub trait TargetSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Listing pass: every `{url, name}` pair currently visible on the search surface.
    async fn fetch_target_list(&self) -> Result<Vec<VenueTarget>, AdapterError>;

    async fn open_target(&self, url: &str) -> Result<(), AdapterError>;

    /// Scalar fields of the opened target. Fields that could not be located are blank.
    async fn extract_current_target_fields(&self) -> Result<VenueDraft, AdapterError>;

    async fn extract_attribute_categories(&self) -> Result<AttributeSet, AdapterError>;

    /// Next page of reviews of the opened target, newest first; `None` once exhausted.
    async fn next_review_page(&self) -> Result<Option<Vec<ReviewContent>>, AdapterError>;

    /// Releases the underlying session. Called once at the end of every run.
    async fn shutdown(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub call_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Wraps a source with a per-call timeout and bounded exponential-backoff retries.
pub struct RetryingSource<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: TargetSource> RetryingSource<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, AdapterError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, AdapterError>> + Send,
        T: Send,
    {
        let backoff = self.policy.backoff;
        let mut attempt = 0usize;
        loop {
            let result = match tokio::time::timeout(self.policy.call_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout {
                    operation,
                    after: self.policy.call_timeout,
                }),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < backoff.max_retries =>
                {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(operation, attempt = attempt + 1, ?delay, error = %err, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<S: TargetSource> TargetSource for RetryingSource<S> {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    async fn fetch_target_list(&self) -> Result<Vec<VenueTarget>, AdapterError> {
        self.call("fetch_target_list", || self.inner.fetch_target_list())
            .await
    }

    async fn open_target(&self, url: &str) -> Result<(), AdapterError> {
        self.call("open_target", || self.inner.open_target(url)).await
    }

    async fn extract_current_target_fields(&self) -> Result<VenueDraft, AdapterError> {
        self.call("extract_current_target_fields", || {
            self.inner.extract_current_target_fields()
        })
        .await
    }

    async fn extract_attribute_categories(&self) -> Result<AttributeSet, AdapterError> {
        self.call("extract_attribute_categories", || {
            self.inner.extract_attribute_categories()
        })
        .await
    }

    async fn next_review_page(&self) -> Result<Option<Vec<ReviewContent>>, AdapterError> {
        self.call("next_review_page", || self.inner.next_review_page())
            .await
    }

    async fn shutdown(&self) -> Result<(), AdapterError> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySource {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        hang: bool,
    }

    impl FlakySource {
        fn new(failures: usize, hang: bool) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                hang,
            }
        }
    }

    #[async_trait]
    impl TargetSource for FlakySource {
        fn source_id(&self) -> &str {
            "flaky"
        }

        async fn fetch_target_list(&self) -> Result<Vec<VenueTarget>, AdapterError> {
            Err(AdapterError::Message("listing markup changed".into()))
        }

        async fn open_target(&self, url: &str) -> Result<(), AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(AdapterError::Unreachable(url.to_string()));
            }
            Ok(())
        }

        async fn extract_current_target_fields(&self) -> Result<VenueDraft, AdapterError> {
            Ok(VenueDraft::default())
        }

        async fn extract_attribute_categories(&self) -> Result<AttributeSet, AdapterError> {
            Ok(AttributeSet::new())
        }

        async fn next_review_page(&self) -> Result<Option<Vec<ReviewContent>>, AdapterError> {
            Ok(None)
        }
    }

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            call_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let source = RetryingSource::new(FlakySource::new(2, false), fast_policy(3));
        source.open_target("https://maps.example/a").await.expect("open");
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let source = RetryingSource::new(FlakySource::new(10, false), fast_policy(2));
        let err = source.open_target("https://maps.example/a").await.unwrap_err();
        assert!(matches!(err, AdapterError::Unreachable(_)));
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_calls_become_timeouts() {
        let source = RetryingSource::new(FlakySource::new(0, true), fast_policy(1));
        let err = source.open_target("https://maps.example/a").await.unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { operation: "open_target", .. }));
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let source = RetryingSource::new(FlakySource::new(0, false), fast_policy(3));
        let err = source.fetch_target_list().await.unwrap_err();
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }
}
