//! Deadline decorator for backing stores
//!
//! Bounds every call on the wrapped store by a fixed timeout. An elapsed
//! deadline is reported as [`KvError::TimedOut`]; no retry happens here.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::{KvError, KvStore, Record};

/// Wraps a store so no single operation can block past `limit`
pub struct TimeoutKv<K> {
    inner: K,
    limit: Duration,
}

impl<K: KvStore> TimeoutKv<K> {
    pub fn new(inner: K, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn inner(&self) -> &K {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, KvError>>,
    ) -> Result<T, KvError> {
        match tokio::time::timeout(self.limit, op).await {
            Ok(result) => result,
            Err(_) => Err(KvError::TimedOut(self.limit)),
        }
    }
}

#[async_trait]
impl<K: KvStore> KvStore for TimeoutKv<K> {
    async fn put(&self, record: Record) -> Result<(), KvError> {
        self.bounded(self.inner.put(record)).await
    }

    async fn get(&self, primary: &str, secondary: &str) -> Result<Option<Record>, KvError> {
        self.bounded(self.inner.get(primary, secondary)).await
    }

    async fn query_primary_prefix(
        &self,
        primary: &str,
        secondary_prefix: &str,
    ) -> Result<Vec<Record>, KvError> {
        self.bounded(self.inner.query_primary_prefix(primary, secondary_prefix))
            .await
    }

    async fn query_inverse_prefix(
        &self,
        secondary: &str,
        primary_prefix: &str,
    ) -> Result<Vec<Record>, KvError> {
        self.bounded(self.inner.query_inverse_prefix(secondary, primary_prefix))
            .await
    }

    async fn delete(&self, primary: &str, secondary: &str) -> Result<bool, KvError> {
        self.bounded(self.inner.delete(primary, secondary)).await
    }
}
