//! Status ingestion and retrieval
//!
//! A device's status report updates three projections that never touch the
//! derived documents:
//!
//! - per-declaration status, overwritten wholesale on every report
//! - the value set, which only ever grows: a tuple is appended unless an
//!   identical tuple is already present, so a new value at a known path is
//!   kept alongside the old one
//! - the error log, append-only with no deduplication
//!
//! The raw body of the latest report is kept as well. None of these writes
//! are transactional; concurrent reports for one enrollment can lose a
//! value-set append.

pub mod report;

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::declaration::DeclarationRecord;
use crate::error::{EntityKind, StoreError};
use crate::graph::Graph;
use crate::invalidation::DocumentRecord;
use crate::kv::{keys, KvStore, Record};

pub use report::StatusReport;

/// Status of one declaration as reported by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclarationStatus {
    pub identifier: String,
    pub active: bool,
    pub valid: String,
    pub server_token: String,
    pub manifest_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasons: Option<serde_json::Value>,
}

/// One reported status value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusValue {
    pub path: String,
    pub container_type: String,
    pub value_type: String,
    pub value: String,
}

/// One reported status error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub path: String,
    pub body: String,
}

/// A declaration status as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclarationQueryStatus {
    #[serde(flatten)]
    pub status: DeclarationStatus,
    /// Whether the reported token matches the declaration's present token
    pub current: bool,
    pub status_received: DateTime<Utc>,
}

/// A logged status error as returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedStatusError {
    pub path: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeclarationStatusRecord {
    #[serde(flatten)]
    status: DeclarationStatus,
    status_received: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ValueSetRecord {
    values: Vec<StatusValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorRecord {
    path: String,
    body: String,
    timestamp: DateTime<Utc>,
}

/// What an ingestion changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub declarations: usize,
    pub values_added: usize,
    pub errors: usize,
}

/// Append every tuple of `incoming` that is not already in `current`,
/// matching on all four fields. Returns how many were appended.
pub fn merge_values(current: &mut Vec<StatusValue>, incoming: &[StatusValue]) -> usize {
    let mut added = 0;
    for value in incoming {
        if !current.contains(value) {
            current.push(value.clone());
            added += 1;
        }
    }
    added
}

/// Match a path against a filter pattern.
///
/// `%` at the start, end or both ends of the pattern turns it into a
/// suffix, prefix or substring match. Without a marker the path must equal
/// the pattern.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let leading = pattern.starts_with('%');
    let trailing = pattern.len() > 1 && pattern.ends_with('%');

    match (leading, trailing) {
        (true, true) => path.contains(&pattern[1..pattern.len() - 1]),
        (true, false) => path.ends_with(&pattern[1..]),
        (false, true) => path.starts_with(&pattern[..pattern.len() - 1]),
        (false, false) => path == pattern,
    }
}

/// Offset/limit window over a result list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Page {
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let rest = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => rest.take(limit).collect(),
            None => rest.collect(),
        }
    }
}

/// Reads and writes the status projections of enrollments
pub struct StatusMerger<'a> {
    kv: &'a dyn KvStore,
}

impl<'a> StatusMerger<'a> {
    pub fn new(kv: &'a dyn KvStore) -> Self {
        Self { kv }
    }

    fn backend(enrollment_id: &str) -> impl FnOnce(crate::kv::KvError) -> StoreError + '_ {
        StoreError::backend(EntityKind::Enrollment, enrollment_id)
    }

    /// Merge a report into the enrollment's projections, stamping new
    /// entries with `now`.
    pub async fn ingest(
        &self,
        enrollment_id: &str,
        report: &StatusReport,
        now: DateTime<Utc>,
    ) -> Result<IngestSummary, StoreError> {
        let primary = keys::enrollment(enrollment_id);

        let raw = DocumentRecord {
            body: String::from_utf8_lossy(&report.raw).into_owned(),
        };
        self.put(enrollment_id, Record::encode(primary.clone(), keys::STATUS_LAST, &raw))
            .await?;

        for status in &report.declarations {
            let record = DeclarationStatusRecord {
                status: status.clone(),
                status_received: now,
            };
            self.put(
                enrollment_id,
                Record::encode(
                    primary.clone(),
                    keys::status_declaration(&status.identifier),
                    &record,
                ),
            )
            .await?;
        }

        let values_added = self.store_values(enrollment_id, &report.values).await?;

        let timestamp = now.to_rfc3339_opts(SecondsFormat::Nanos, true);
        for (seq, error) in report.errors.iter().enumerate() {
            let record = ErrorRecord {
                path: error.path.clone(),
                body: error.body.clone(),
                timestamp: now,
            };
            let secondary = keys::status_error(&error.path, &format!("{}#{}", timestamp, seq));
            self.put(enrollment_id, Record::encode(primary.clone(), secondary, &record))
                .await?;
        }

        let summary = IngestSummary {
            declarations: report.declarations.len(),
            values_added,
            errors: report.errors.len(),
        };
        log::debug!("ingested status for enrollment {}: {:?}", enrollment_id, summary);
        Ok(summary)
    }

    async fn put(
        &self,
        enrollment_id: &str,
        record: Result<Record, crate::kv::KvError>,
    ) -> Result<(), StoreError> {
        let record = record.map_err(Self::backend(enrollment_id))?;
        self.kv
            .put(record)
            .await
            .map_err(Self::backend(enrollment_id))
    }

    async fn read_values(&self, enrollment_id: &str) -> Result<Vec<StatusValue>, StoreError> {
        let record = self
            .kv
            .get(&keys::enrollment(enrollment_id), keys::STATUS_VALUES)
            .await
            .map_err(Self::backend(enrollment_id))?;
        match record {
            Some(record) => {
                let set: ValueSetRecord = record.decode().map_err(Self::backend(enrollment_id))?;
                Ok(set.values)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn store_values(
        &self,
        enrollment_id: &str,
        incoming: &[StatusValue],
    ) -> Result<usize, StoreError> {
        if incoming.is_empty() {
            return Ok(0);
        }

        let mut values = self.read_values(enrollment_id).await?;
        let added = merge_values(&mut values, incoming);
        if added == 0 {
            return Ok(0);
        }

        let record = Record::encode(
            keys::enrollment(enrollment_id),
            keys::STATUS_VALUES,
            &ValueSetRecord { values },
        );
        self.put(enrollment_id, record).await?;
        Ok(added)
    }

    /// Raw body of the latest report, if any
    pub async fn last_report(&self, enrollment_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let record = self
            .kv
            .get(&keys::enrollment(enrollment_id), keys::STATUS_LAST)
            .await
            .map_err(Self::backend(enrollment_id))?;
        match record {
            Some(record) => {
                let raw: DocumentRecord = record.decode().map_err(Self::backend(enrollment_id))?;
                Ok(Some(raw.body.into_bytes()))
            }
            None => Ok(None),
        }
    }

    /// Every value in the enrollment's set, optionally filtered by path
    /// pattern.
    pub async fn values(
        &self,
        enrollment_id: &str,
        pattern: Option<&str>,
    ) -> Result<Vec<StatusValue>, StoreError> {
        let values = self.read_values(enrollment_id).await?;
        Ok(match pattern {
            Some(pattern) if !pattern.is_empty() => values
                .into_iter()
                .filter(|v| path_matches(pattern, &v.path))
                .collect(),
            _ => values,
        })
    }

    /// Logged errors, newest first, windowed by `page`.
    pub async fn errors(
        &self,
        enrollment_id: &str,
        page: Page,
    ) -> Result<Vec<LoggedStatusError>, StoreError> {
        let records = self
            .kv
            .query_primary_prefix(&keys::enrollment(enrollment_id), keys::STATUS_ERROR)
            .await
            .map_err(Self::backend(enrollment_id))?;

        let mut errors = Vec::with_capacity(records.len());
        for record in records {
            let entry: ErrorRecord = record.decode().map_err(Self::backend(enrollment_id))?;
            errors.push(LoggedStatusError {
                path: entry.path,
                body: entry.body,
                timestamp: entry.timestamp,
            });
        }
        errors.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.path.cmp(&b.path))
        });

        Ok(page.apply(errors))
    }

    /// Latest status of every declaration the enrollment currently reaches.
    /// Declarations the device has not reported on are left out.
    pub async fn declaration_statuses(
        &self,
        enrollment_id: &str,
    ) -> Result<Vec<DeclarationQueryStatus>, StoreError> {
        let reachable: BTreeSet<String> = Graph::new(self.kv)
            .declarations_of_enrollment(enrollment_id)
            .await?;
        let primary = keys::enrollment(enrollment_id);

        let mut statuses = Vec::new();
        for declaration_id in reachable {
            let record = self
                .kv
                .get(&primary, &keys::status_declaration(&declaration_id))
                .await
                .map_err(Self::backend(enrollment_id))?;
            let Some(record) = record else {
                continue;
            };
            let stored: DeclarationStatusRecord =
                record.decode().map_err(Self::backend(enrollment_id))?;

            let current = self
                .kv
                .get(&keys::declaration(&declaration_id), keys::DECLARATION_RECORD)
                .await
                .map_err(StoreError::backend(EntityKind::Declaration, &declaration_id))?
                .map(|r| r.decode::<DeclarationRecord>())
                .transpose()
                .map_err(StoreError::backend(EntityKind::Declaration, &declaration_id))?
                .map(|d| d.token == stored.status.server_token)
                .unwrap_or(false);

            statuses.push(DeclarationQueryStatus {
                status: stored.status,
                current,
                status_received: stored.status_received,
            });
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use chrono::TimeZone;

    fn value(path: &str, v: &str) -> StatusValue {
        StatusValue {
            path: path.to_string(),
            container_type: "object".to_string(),
            value_type: "string".to_string(),
            value: v.to_string(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_path_patterns() {
        assert!(path_matches("%foo%", "a.foo.b"));
        assert!(!path_matches("%foo%", "a.fo.b"));
        assert!(path_matches("foo%", "foo.bar"));
        assert!(!path_matches("foo%", "x.foo"));
        assert!(path_matches("%foo", "x.foo"));
        assert!(!path_matches("%foo", "foo.x"));
        assert!(path_matches("foo", "foo"));
        assert!(!path_matches("foo", "foo.bar"));
        assert!(path_matches("%", "anything"));
        assert!(path_matches("%%", "anything"));
    }

    #[test]
    fn test_merge_values_dedups_exact_tuples_only() {
        let mut set = vec![value(".a", "1")];
        assert_eq!(merge_values(&mut set, &[value(".a", "1")]), 0);
        assert_eq!(merge_values(&mut set, &[value(".a", "2")]), 1);
        assert_eq!(set, vec![value(".a", "1"), value(".a", "2")]);
    }

    #[test]
    fn test_page() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(Page { offset: 1, limit: Some(2) }.apply(items.clone()), vec![2, 3]);
        assert_eq!(Page { offset: 3, limit: None }.apply(items.clone()), vec![4, 5]);
        assert!(Page { offset: 9, limit: None }.apply(items).is_empty());
    }

    #[tokio::test]
    async fn test_value_set_accumulates() {
        let kv = MemoryKv::new();
        let merger = StatusMerger::new(&kv);

        let mut report = StatusReport {
            values: vec![value(".StatusItems.os.version", "14.0")],
            ..Default::default()
        };
        merger.ingest("e1", &report, at(0)).await.unwrap();
        merger.ingest("e1", &report, at(1)).await.unwrap();
        assert_eq!(merger.values("e1", None).await.unwrap().len(), 1);

        report.values = vec![value(".StatusItems.os.version", "14.1")];
        let summary = merger.ingest("e1", &report, at(2)).await.unwrap();
        assert_eq!(summary.values_added, 1);

        let values = merger.values("e1", Some("%version")).await.unwrap();
        let seen: Vec<_> = values.iter().map(|v| v.value.as_str()).collect();
        assert_eq!(seen, vec!["14.0", "14.1"]);
    }

    #[tokio::test]
    async fn test_errors_are_appended_newest_first() {
        let kv = MemoryKv::new();
        let merger = StatusMerger::new(&kv);

        let error = StatusError {
            path: "passcode".to_string(),
            body: "{}".to_string(),
        };
        let report = StatusReport {
            errors: vec![error.clone(), error],
            ..Default::default()
        };
        merger.ingest("e1", &report, at(0)).await.unwrap();
        merger.ingest("e1", &report, at(5)).await.unwrap();

        let all = merger.errors("e1", Page::default()).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].timestamp, at(5));
        assert_eq!(all[3].timestamp, at(0));

        let window = merger
            .errors("e1", Page { offset: 2, limit: Some(1) })
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].timestamp, at(0));
    }

    #[tokio::test]
    async fn test_last_report_overwritten() {
        let kv = MemoryKv::new();
        let merger = StatusMerger::new(&kv);
        assert!(merger.last_report("e1").await.unwrap().is_none());

        for body in ["{\"n\":1}", "{\"n\":2}"] {
            let report = StatusReport {
                raw: body.as_bytes().to_vec(),
                ..Default::default()
            };
            merger.ingest("e1", &report, at(0)).await.unwrap();
        }
        assert_eq!(
            merger.last_report("e1").await.unwrap().unwrap(),
            b"{\"n\":2}".to_vec()
        );
    }

    #[tokio::test]
    async fn test_declaration_status_limited_to_reachable() {
        let kv = MemoryKv::new();
        kv.put(Record::edge(keys::group("g"), keys::declaration("d1")))
            .await
            .unwrap();
        kv.put(Record::edge(keys::enrollment("e1"), keys::group("g")))
            .await
            .unwrap();

        let merger = StatusMerger::new(&kv);
        let status = |id: &str| DeclarationStatus {
            identifier: id.to_string(),
            active: true,
            valid: "valid".to_string(),
            server_token: "tok".to_string(),
            manifest_type: "configurations".to_string(),
            reasons: None,
        };
        let report = StatusReport {
            declarations: vec![status("d1"), status("stray")],
            ..Default::default()
        };
        merger.ingest("e1", &report, at(0)).await.unwrap();

        let statuses = merger.declaration_statuses("e1").await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status.identifier, "d1");
        // No declaration record exists, so the token cannot be current.
        assert!(!statuses[0].current);
        assert_eq!(statuses[0].status_received, at(0));
    }
}
