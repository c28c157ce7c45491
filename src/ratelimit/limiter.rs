//! Sliding-window rate limiter.
//!
//! The limiter holds no counts of its own. Every decision is a fresh count
//! query against the shared store, so all instances see the same state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::identity::ClientIdentity;
use super::policy::{PolicyRegistry, RateLimitPolicy};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::store::{NewRecord, RequestStore};

/// Default deadline for the count query and the record write.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a rate limit evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Allow,
    /// The request must be rejected; retry after the given number of seconds
    Deny { retry_after_secs: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allow => None,
            Decision::Deny { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

/// Evaluates requests against per-category policies using the shared store.
///
/// Cheap to share behind an `Arc`; it carries configuration only.
pub struct RateLimiter {
    store: Arc<dyn RequestStore>,
    clock: Arc<dyn Clock>,
    policies: Arc<PolicyRegistry>,
    query_timeout: Duration,
    write_timeout: Duration,
}

impl RateLimiter {
    /// Create a limiter using the system clock and default timeouts.
    pub fn new(store: Arc<dyn RequestStore>, policies: PolicyRegistry) -> Self {
        Self::with_clock(store, policies, Arc::new(SystemClock))
    }

    /// Create a limiter with an explicit clock.
    pub fn with_clock(
        store: Arc<dyn RequestStore>,
        policies: PolicyRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            policies: Arc::new(policies),
            query_timeout: DEFAULT_STORE_TIMEOUT,
            write_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Override the count query and record write deadlines.
    pub fn with_timeouts(mut self, query_timeout: Duration, write_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self.write_timeout = write_timeout;
        self
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Evaluate a request against the registered policy for `category`.
    ///
    /// Categories without a policy are allowed.
    pub async fn check(&self, identity: &ClientIdentity, category: &str) -> Decision {
        match self.policies.get(category).copied() {
            Some(policy) => self.evaluate(identity, category, &policy).await,
            None => {
                warn!(
                    category = %category,
                    client = %identity,
                    "No rate limit policy for category, allowing request"
                );
                Decision::Allow
            }
        }
    }

    /// Decide whether `identity` may make another request to `category`.
    ///
    /// Returns as soon as the count is known. On `Allow` the record write
    /// continues in the background and its outcome never affects the result.
    /// Store failures and timeouts on the count query yield `Allow`.
    pub async fn evaluate(
        &self,
        identity: &ClientIdentity,
        category: &str,
        policy: &RateLimitPolicy,
    ) -> Decision {
        // Dropping the handle detaches the write; it is not cancelled.
        let (decision, _write) = self.evaluate_detached(identity, category, policy).await;
        decision
    }

    async fn evaluate_detached(
        &self,
        identity: &ClientIdentity,
        category: &str,
        policy: &RateLimitPolicy,
    ) -> (Decision, Option<JoinHandle<()>>) {
        let now = self.clock.now();
        let window = policy.window_span();
        let window_start = now - window;

        trace!(
            client = %identity,
            category = %category,
            window_start = %window_start,
            "Counting requests in window"
        );

        let counted = with_deadline(
            self.query_timeout,
            self.store
                .count_since(identity.as_str(), category, window_start),
        )
        .await;

        let count = match counted {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    category = %category,
                    client = %identity,
                    error = %e,
                    "Rate limit count failed, failing open"
                );
                return (Decision::Allow, None);
            }
        };

        if count >= u64::from(policy.max_requests) {
            debug!(
                category = %category,
                client = %identity,
                count = count,
                limit = policy.max_requests,
                "Rate limit exceeded"
            );
            return (
                Decision::Deny {
                    retry_after_secs: policy.window_secs,
                },
                None,
            );
        }

        let record = NewRecord {
            client_identity: identity.as_str().to_string(),
            endpoint_category: category.to_string(),
            expires_at: now + window,
        };
        (Decision::Allow, Some(self.record_detached(record)))
    }

    /// Write the record on a detached task; failures are only logged.
    fn record_detached(&self, record: NewRecord) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let deadline = self.write_timeout;

        tokio::spawn(async move {
            let client = record.client_identity.clone();
            let category = record.endpoint_category.clone();

            if let Err(e) = with_deadline(deadline, store.insert(record)).await {
                warn!(
                    category = %category,
                    client = %client,
                    error = %e,
                    "Failed to record request, discarding"
                );
            }
        })
    }
}

async fn with_deadline<T>(deadline: Duration, op: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(deadline, op)
        .await
        .map_err(|_| TollgateError::Timeout(deadline))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, RecordId};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        limiter: RateLimiter,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter =
            RateLimiter::with_clock(store.clone(), PolicyRegistry::default(), clock.clone());
        Fixture {
            clock,
            store,
            limiter,
        }
    }

    fn policy(max_requests: u32, window_secs: u64) -> RateLimitPolicy {
        RateLimitPolicy::new(max_requests, window_secs).unwrap()
    }

    /// Evaluate and wait for the background write so the next call sees it.
    async fn evaluate_settled(
        limiter: &RateLimiter,
        client: &str,
        category: &str,
        policy: &RateLimitPolicy,
    ) -> Decision {
        let identity = ClientIdentity::new(client);
        let (decision, write) = limiter.evaluate_detached(&identity, category, policy).await;
        if let Some(write) = write {
            write.await.unwrap();
        }
        decision
    }

    /// A store that is entirely unreachable.
    struct UnreachableStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestStore for UnreachableStore {
        async fn insert(&self, _record: NewRecord) -> Result<()> {
            Err(TollgateError::Store("connection refused".to_string()))
        }

        async fn count_since(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TollgateError::Store("connection refused".to_string()))
        }

        async fn expired_ids(&self, _: DateTime<Utc>, _: usize) -> Result<Vec<RecordId>> {
            Err(TollgateError::Store("connection refused".to_string()))
        }

        async fn delete_batch(&self, _: &[RecordId]) -> Result<u64> {
            Err(TollgateError::Store("connection refused".to_string()))
        }
    }

    /// Counts succeed but every write fails.
    struct ReadOnlyStore;

    #[async_trait]
    impl RequestStore for ReadOnlyStore {
        async fn insert(&self, _record: NewRecord) -> Result<()> {
            Err(TollgateError::Store("read-only replica".to_string()))
        }

        async fn count_since(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }

        async fn expired_ids(&self, _: DateTime<Utc>, _: usize) -> Result<Vec<RecordId>> {
            Ok(Vec::new())
        }

        async fn delete_batch(&self, _: &[RecordId]) -> Result<u64> {
            Ok(0)
        }
    }

    /// Count queries hang far longer than any sane deadline.
    struct StalledStore;

    #[async_trait]
    impl RequestStore for StalledStore {
        async fn insert(&self, _record: NewRecord) -> Result<()> {
            Ok(())
        }

        async fn count_since(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<u64> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(u64::MAX)
        }

        async fn expired_ids(&self, _: DateTime<Utc>, _: usize) -> Result<Vec<RecordId>> {
            Ok(Vec::new())
        }

        async fn delete_batch(&self, _: &[RecordId]) -> Result<u64> {
            Ok(0)
        }
    }

    /// Counts succeed but inserts hang well past any write deadline.
    struct SlowWriteStore;

    #[async_trait]
    impl RequestStore for SlowWriteStore {
        async fn insert(&self, _record: NewRecord) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn count_since(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }

        async fn expired_ids(&self, _: DateTime<Utc>, _: usize) -> Result<Vec<RecordId>> {
            Ok(Vec::new())
        }

        async fn delete_batch(&self, _: &[RecordId]) -> Result<u64> {
            Ok(0)
        }
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
        type Writer = LogCapture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// Route warnings on this thread into a buffer until the guard drops.
    fn capture_warnings() -> (LogCapture, tracing::subscriber::DefaultGuard) {
        let capture = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    #[tokio::test]
    async fn test_first_n_allowed_then_denied() {
        let f = fixture();
        let limit = policy(5, 60);

        for i in 1..=5 {
            let decision = evaluate_settled(&f.limiter, "10.0.0.1", "standard", &limit).await;
            assert_eq!(decision, Decision::Allow, "Request {} should be allowed", i);
        }

        let decision = evaluate_settled(&f.limiter, "10.0.0.1", "standard", &limit).await;
        assert_eq!(
            decision,
            Decision::Deny {
                retry_after_secs: 60
            }
        );
        assert_eq!(f.store.len(), 5);
    }

    #[tokio::test]
    async fn test_sliding_window_scenario() {
        let f = fixture();
        let limit = policy(2, 60);

        // t=0
        assert!(evaluate_settled(&f.limiter, "A", "standard", &limit).await.is_allowed());

        f.clock.advance(Duration::from_secs(10));
        assert!(evaluate_settled(&f.limiter, "A", "standard", &limit).await.is_allowed());

        f.clock.advance(Duration::from_secs(10));
        let denied = evaluate_settled(&f.limiter, "A", "standard", &limit).await;
        assert_eq!(denied.retry_after_secs(), Some(60));

        // t=61: the t=0 request has left the window
        f.clock.advance(Duration::from_secs(41));
        assert!(evaluate_settled(&f.limiter, "A", "standard", &limit).await.is_allowed());
    }

    #[tokio::test]
    async fn test_requests_age_out_individually() {
        let f = fixture();
        let limit = policy(2, 60);

        evaluate_settled(&f.limiter, "A", "standard", &limit).await; // t=0
        f.clock.advance(Duration::from_secs(10));
        evaluate_settled(&f.limiter, "A", "standard", &limit).await; // t=10
        f.clock.advance(Duration::from_secs(51));
        assert!(evaluate_settled(&f.limiter, "A", "standard", &limit).await.is_allowed()); // t=61

        // t=62: t=10 and t=61 are both still in the window
        f.clock.advance(Duration::from_secs(1));
        assert!(!evaluate_settled(&f.limiter, "A", "standard", &limit).await.is_allowed());

        // t=71: only t=61 remains
        f.clock.advance(Duration::from_secs(9));
        assert!(evaluate_settled(&f.limiter, "A", "standard", &limit).await.is_allowed());
    }

    #[tokio::test]
    async fn test_window_start_is_inclusive() {
        let f = fixture();
        let limit = policy(1, 60);

        assert!(evaluate_settled(&f.limiter, "A", "standard", &limit).await.is_allowed());

        f.clock.advance(Duration::from_secs(60));
        assert!(!evaluate_settled(&f.limiter, "A", "standard", &limit).await.is_allowed());

        f.clock.advance(Duration::from_secs(1));
        assert!(evaluate_settled(&f.limiter, "A", "standard", &limit).await.is_allowed());
    }

    #[tokio::test]
    async fn test_deny_does_not_write_record() {
        let f = fixture();
        let limit = policy(1, 60);

        evaluate_settled(&f.limiter, "A", "standard", &limit).await;
        let before = f.store.len();

        for _ in 0..3 {
            let decision = evaluate_settled(&f.limiter, "A", "standard", &limit).await;
            assert!(!decision.is_allowed());
        }

        assert_eq!(f.store.len(), before);
    }

    #[tokio::test]
    async fn test_record_expiry_matches_window() {
        let f = fixture();
        let limit = policy(3, 90);
        let start = f.clock.now();

        evaluate_settled(&f.limiter, "A", "expensive", &limit).await;

        let records = f.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].client_identity, "A");
        assert_eq!(records[0].endpoint_category, "expensive");
        assert_eq!(records[0].observed_at, start);
        assert_eq!(records[0].expires_at, start + chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn test_categories_and_clients_are_independent() {
        let f = fixture();
        let limit = policy(1, 60);

        assert!(evaluate_settled(&f.limiter, "A", "standard", &limit).await.is_allowed());
        assert!(!evaluate_settled(&f.limiter, "A", "standard", &limit).await.is_allowed());

        assert!(evaluate_settled(&f.limiter, "A", "expensive", &limit).await.is_allowed());
        assert!(evaluate_settled(&f.limiter, "B", "standard", &limit).await.is_allowed());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_open_and_logs() {
        let (capture, _guard) = capture_warnings();

        let store = Arc::new(UnreachableStore {
            calls: AtomicUsize::new(0),
        });
        let limiter = RateLimiter::new(store.clone(), PolicyRegistry::default());
        let limit = policy(1, 60);
        let identity = ClientIdentity::new("198.51.100.4");

        for _ in 0..5 {
            let decision = limiter.evaluate(&identity, "expensive", &limit).await;
            assert_eq!(decision, Decision::Allow);
        }

        assert_eq!(store.calls.load(Ordering::SeqCst), 5);
        let logs = capture.contents();
        assert!(logs.contains("failing open"));
        assert!(logs.contains("expensive"));
        assert!(logs.contains("198.51.100.4"));
        assert!(logs.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_count_timeout_fails_open() {
        let limiter = RateLimiter::new(Arc::new(StalledStore), PolicyRegistry::default())
            .with_timeouts(Duration::from_millis(20), Duration::from_millis(20));
        let identity = ClientIdentity::new("A");

        let decision = limiter.evaluate(&identity, "standard", &policy(1, 60)).await;
        assert_eq!(decision, Decision::Allow);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_allow_and_is_logged() {
        let (capture, _guard) = capture_warnings();
        let limiter = RateLimiter::new(Arc::new(ReadOnlyStore), PolicyRegistry::default());
        let identity = ClientIdentity::new("203.0.113.9");

        let (decision, write) = limiter
            .evaluate_detached(&identity, "standard", &policy(1, 60))
            .await;
        assert_eq!(decision, Decision::Allow);

        write.unwrap().await.unwrap();
        let logs = capture.contents();
        assert!(logs.contains("Failed to record request, discarding"));
        assert!(logs.contains("203.0.113.9"));
        assert!(logs.contains("read-only replica"));
    }

    #[tokio::test]
    async fn test_slow_write_does_not_delay_decision() {
        let (capture, _guard) = capture_warnings();
        let limiter = RateLimiter::new(Arc::new(SlowWriteStore), PolicyRegistry::default())
            .with_timeouts(Duration::from_secs(2), Duration::from_millis(20));
        let identity = ClientIdentity::new("A");

        let (decision, write) = tokio::time::timeout(
            Duration::from_millis(500),
            limiter.evaluate_detached(&identity, "standard", &policy(1, 60)),
        )
        .await
        .expect("decision must not wait for the write");
        assert_eq!(decision, Decision::Allow);

        let write = write.unwrap();
        assert!(!write.is_finished());
        assert!(!capture.contents().contains("Failed to record request"));

        write.await.unwrap();
        let logs = capture.contents();
        assert!(logs.contains("Failed to record request, discarding"));
        assert!(logs.contains("timed out"));
    }

    #[tokio::test]
    async fn test_check_uses_registered_policy() {
        let clock = Arc::new(ManualClock::at_secs(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let registry = PolicyRegistry::empty().with_policy("login", policy(2, 60));
        let limiter = RateLimiter::with_clock(store.clone(), registry, clock);
        let identity = ClientIdentity::new("A");

        for expected in 1..=2 {
            assert!(limiter.check(&identity, "login").await.is_allowed());
            // Let the detached write land before the next count.
            while store.len() < expected {
                tokio::task::yield_now().await;
            }
        }

        assert_eq!(
            limiter.check(&identity, "login").await,
            Decision::Deny {
                retry_after_secs: 60
            }
        );
    }

    #[tokio::test]
    async fn test_check_unknown_category_allows_without_writing() {
        let f = fixture();
        let identity = ClientIdentity::new("A");

        let decision = f.limiter.check(&identity, "no-such-category").await;
        assert_eq!(decision, Decision::Allow);

        tokio::task::yield_now().await;
        assert!(f.store.is_empty());
    }
}
