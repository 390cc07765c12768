//! Composite-key record storage
//!
//! Every entity and every relationship edge is stored as a record under a
//! two-part key: a primary key naming the entity (or edge source) and a
//! secondary key naming the record kind (or edge target). Backends keep an
//! inverse index so edges can be walked from either side without a scan.

pub mod file;
pub mod keys;
pub mod memory;
pub mod timeout;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::FileKv;
pub use memory::MemoryKv;
pub use timeout::TimeoutKv;

/// Error types for backing store operations
#[derive(Error, Debug)]
pub enum KvError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// A single keyed record.
///
/// The body is an arbitrary JSON document; record kinds give it structure
/// through [`Record::encode`] and [`Record::decode`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub primary: String,
    pub secondary: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Record {
    /// A record with no body, used for membership edges.
    pub fn edge(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
            body: serde_json::Value::Null,
        }
    }

    /// Build a record whose body is the serialized form of `body`.
    pub fn encode<T: Serialize>(
        primary: impl Into<String>,
        secondary: impl Into<String>,
        body: &T,
    ) -> Result<Self, KvError> {
        let body = serde_json::to_value(body)
            .map_err(|e| KvError::SerializationError(e.to_string()))?;
        Ok(Self {
            primary: primary.into(),
            secondary: secondary.into(),
            body,
        })
    }

    /// Decode the body into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, KvError> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| KvError::SerializationError(e.to_string()))
    }
}

/// Trait for composite-key backing stores.
///
/// Single-record operations are atomic; there are no multi-record
/// transactions. Prefix queries return records in ascending key order.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Insert or replace a record
    async fn put(&self, record: Record) -> Result<(), KvError>;

    /// Fetch a single record by its full key
    async fn get(&self, primary: &str, secondary: &str) -> Result<Option<Record>, KvError>;

    /// All records under `primary` whose secondary key starts with `secondary_prefix`
    async fn query_primary_prefix(
        &self,
        primary: &str,
        secondary_prefix: &str,
    ) -> Result<Vec<Record>, KvError>;

    /// All records with secondary key `secondary` whose primary key starts
    /// with `primary_prefix` (the inverse index)
    async fn query_inverse_prefix(
        &self,
        secondary: &str,
        primary_prefix: &str,
    ) -> Result<Vec<Record>, KvError>;

    /// Delete a record, returning whether it existed
    async fn delete(&self, primary: &str, secondary: &str) -> Result<bool, KvError>;
}

#[async_trait::async_trait]
impl<K: KvStore + ?Sized> KvStore for Arc<K> {
    async fn put(&self, record: Record) -> Result<(), KvError> {
        (**self).put(record).await
    }

    async fn get(&self, primary: &str, secondary: &str) -> Result<Option<Record>, KvError> {
        (**self).get(primary, secondary).await
    }

    async fn query_primary_prefix(
        &self,
        primary: &str,
        secondary_prefix: &str,
    ) -> Result<Vec<Record>, KvError> {
        (**self).query_primary_prefix(primary, secondary_prefix).await
    }

    async fn query_inverse_prefix(
        &self,
        secondary: &str,
        primary_prefix: &str,
    ) -> Result<Vec<Record>, KvError> {
        (**self).query_inverse_prefix(secondary, primary_prefix).await
    }

    async fn delete(&self, primary: &str, secondary: &str) -> Result<bool, KvError> {
        (**self).delete(primary, secondary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Body {
        name: String,
        count: u32,
    }

    #[test]
    fn test_encode_decode_body() {
        let body = Body {
            name: "x".to_string(),
            count: 3,
        };
        let record = Record::encode("p", "s", &body).unwrap();
        assert_eq!(record.primary, "p");
        assert_eq!(record.decode::<Body>().unwrap(), body);
    }

    #[test]
    fn test_decode_wrong_shape() {
        let record = Record::edge("p", "s");
        let result = record.decode::<Body>();
        assert!(matches!(result, Err(KvError::SerializationError(_))));
    }
}
