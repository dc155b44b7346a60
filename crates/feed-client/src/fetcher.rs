//! Run-scoped fetch coordination.
//!
//! Deduplicates provider calls per (subject, call) within one run: the
//! first request for a key issues the upstream call, concurrent requests
//! for the same key await the in-flight result, and later requests hit
//! the cache. Failures are not cached, so a retry re-issues the call.

use appraisal_core::{CallSpec, ProviderFetch, ProviderPayload, ValuationError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::governor::RateGovernor;

/// Counter snapshot for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub requests: u64,
    pub upstream_calls: u64,
    pub deduplicated: u64,
    pub failures: u64,
}

pub struct FetchOrchestrator<P> {
    provider: Arc<P>,
    governor: RateGovernor,
    cache: DashMap<String, Arc<OnceCell<ProviderPayload>>>,
    requests: AtomicU64,
    upstream_calls: AtomicU64,
    failures: AtomicU64,
}

impl<P: ProviderFetch> FetchOrchestrator<P> {
    pub fn new(provider: Arc<P>, governor: RateGovernor) -> Self {
        Self {
            provider,
            governor,
            cache: DashMap::new(),
            requests: AtomicU64::new(0),
            upstream_calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// The governor shared with the underlying client, for batch planning.
    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    /// Fetch a payload, deduplicated per (subject, call) for the lifetime
    /// of this orchestrator. Admission control happens inside the provider,
    /// so cache and in-flight hits consume no quota.
    pub async fn fetch(
        &self,
        subject: &str,
        call: &CallSpec,
    ) -> Result<ProviderPayload, ValuationError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let key = cache_key(subject, call);
        // clone the cell out so the map shard lock is not held across await
        let cell = {
            let entry = self
                .cache
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()));
            entry.value().clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                self.upstream_calls.fetch_add(1, Ordering::Relaxed);
                self.provider.fetch(subject, call).await
            })
            .await;

        match result {
            Ok(payload) => Ok(payload.clone()),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> FetchStats {
        let requests = self.requests.load(Ordering::Relaxed);
        let upstream_calls = self.upstream_calls.load(Ordering::Relaxed);
        FetchStats {
            requests,
            upstream_calls,
            deduplicated: requests.saturating_sub(upstream_calls),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

fn cache_key(subject: &str, call: &CallSpec) -> String {
    let params: Vec<String> = call
        .params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!("{}::{}?{}", subject, call.path, params.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::QuotaConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicI64;

    struct StubProvider {
        calls: AtomicU64,
        fail_first: AtomicI64,
    }

    impl StubProvider {
        fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail_first: AtomicI64::new(0),
            }
        }

        fn failing_first(n: i64) -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail_first: AtomicI64::new(n),
            }
        }
    }

    #[async_trait]
    impl ProviderFetch for StubProvider {
        async fn fetch(
            &self,
            subject: &str,
            call: &CallSpec,
        ) -> Result<ProviderPayload, ValuationError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail_first.fetch_sub(1, Ordering::Relaxed) > 0 {
                return Err(ValuationError::Provider("boom".to_string()));
            }
            // tiny delay so concurrent requests overlap in flight
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(ProviderPayload::empty(format!(
                "{}:{}",
                subject, call.response_key
            )))
        }
    }

    fn orchestrator(provider: StubProvider) -> FetchOrchestrator<StubProvider> {
        FetchOrchestrator::new(
            Arc::new(provider),
            RateGovernor::new(QuotaConfig::default()),
        )
    }

    fn statements_call() -> CallSpec {
        CallSpec::new("incomeStatement", "/v1/statements").with_param("timeframe", "quarterly")
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_upstream_call() {
        let orch = orchestrator(StubProvider::new());
        let call = statements_call();
        let (a, b, c) = tokio::join!(
            orch.fetch("ACME", &call),
            orch.fetch("ACME", &call),
            orch.fetch("ACME", &call)
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());

        let stats = orch.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.upstream_calls, 1);
        assert_eq!(stats.deduplicated, 2);
        assert_eq!(orch.provider.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_subjects_fetch_separately() {
        let orch = orchestrator(StubProvider::new());
        let call = statements_call();
        let (a, b) = tokio::join!(orch.fetch("ACME", &call), orch.fetch("GLOBO", &call));
        assert_eq!(a.unwrap().response_key, "ACME:incomeStatement");
        assert_eq!(b.unwrap().response_key, "GLOBO:incomeStatement");
        assert_eq!(orch.stats().upstream_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_calls_for_one_subject_fetch_separately() {
        let orch = orchestrator(StubProvider::new());
        let statements = statements_call();
        let balance = CallSpec::new("balanceSheet", "/v1/balance");
        let (a, b) = tokio::join!(
            orch.fetch("ACME", &statements),
            orch.fetch("ACME", &balance)
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(orch.stats().upstream_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_not_cached() {
        let orch = orchestrator(StubProvider::failing_first(1));
        let call = statements_call();

        assert!(orch.fetch("ACME", &call).await.is_err());
        assert!(orch.fetch("ACME", &call).await.is_ok());

        let stats = orch.stats();
        assert_eq!(stats.upstream_calls, 2);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_request_hits_cache() {
        let orch = orchestrator(StubProvider::new());
        let call = statements_call();
        orch.fetch("ACME", &call).await.unwrap();
        orch.fetch("ACME", &call).await.unwrap();
        let stats = orch.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.upstream_calls, 1);
    }
}
