//! In-memory backing store
//!
//! Keeps the forward table and the inverse index as two ordered maps so
//! prefix queries are range scans on either side.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{KvError, KvStore, Record};

/// Forward table plus inverse index.
///
/// Shared with the file backend, which persists the forward table and
/// rebuilds the index on load.
#[derive(Debug, Default, Clone)]
pub(crate) struct Tables {
    forward: BTreeMap<(String, String), Record>,
    inverse: BTreeSet<(String, String)>,
}

impl Tables {
    pub(crate) fn from_records(records: Vec<Record>) -> Self {
        let mut tables = Tables::default();
        for record in records {
            tables.insert(record);
        }
        tables
    }

    /// All records in key order.
    pub(crate) fn records(&self) -> Vec<Record> {
        self.forward.values().cloned().collect()
    }

    pub(crate) fn insert(&mut self, record: Record) {
        let key = (record.primary.clone(), record.secondary.clone());
        self.inverse
            .insert((record.secondary.clone(), record.primary.clone()));
        self.forward.insert(key, record);
    }

    pub(crate) fn get(&self, primary: &str, secondary: &str) -> Option<Record> {
        self.forward
            .get(&(primary.to_string(), secondary.to_string()))
            .cloned()
    }

    pub(crate) fn remove(&mut self, primary: &str, secondary: &str) -> bool {
        let existed = self
            .forward
            .remove(&(primary.to_string(), secondary.to_string()))
            .is_some();
        self.inverse
            .remove(&(secondary.to_string(), primary.to_string()));
        existed
    }

    pub(crate) fn primary_prefix(&self, primary: &str, secondary_prefix: &str) -> Vec<Record> {
        let start = (primary.to_string(), secondary_prefix.to_string());
        self.forward
            .range(start..)
            .take_while(|((p, s), _)| p == primary && s.starts_with(secondary_prefix))
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub(crate) fn inverse_prefix(&self, secondary: &str, primary_prefix: &str) -> Vec<Record> {
        let start = (secondary.to_string(), primary_prefix.to_string());
        self.inverse
            .range(start..)
            .take_while(|(s, p)| s == secondary && p.starts_with(primary_prefix))
            .filter_map(|(s, p)| self.forward.get(&(p.clone(), s.clone())).cloned())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.forward.len()
    }
}

/// A backing store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryKv {
    tables: RwLock<Tables>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored
    pub async fn len(&self) -> usize {
        self.tables.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, record: Record) -> Result<(), KvError> {
        self.tables.write().await.insert(record);
        Ok(())
    }

    async fn get(&self, primary: &str, secondary: &str) -> Result<Option<Record>, KvError> {
        Ok(self.tables.read().await.get(primary, secondary))
    }

    async fn query_primary_prefix(
        &self,
        primary: &str,
        secondary_prefix: &str,
    ) -> Result<Vec<Record>, KvError> {
        Ok(self
            .tables
            .read()
            .await
            .primary_prefix(primary, secondary_prefix))
    }

    async fn query_inverse_prefix(
        &self,
        secondary: &str,
        primary_prefix: &str,
    ) -> Result<Vec<Record>, KvError> {
        Ok(self
            .tables
            .read()
            .await
            .inverse_prefix(secondary, primary_prefix))
    }

    async fn delete(&self, primary: &str, secondary: &str) -> Result<bool, KvError> {
        Ok(self.tables.write().await.remove(primary, secondary))
    }
}
