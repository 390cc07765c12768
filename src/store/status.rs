//! Status operations

use std::collections::BTreeMap;

use chrono::Utc;

use super::{require_id, DdmStore};
use crate::error::{EntityKind, StoreError};
use crate::status::{
    DeclarationQueryStatus, IngestSummary, LoggedStatusError, Page, StatusMerger, StatusReport,
    StatusValue,
};

impl DdmStore {
    fn merger(&self) -> StatusMerger<'_> {
        StatusMerger::new(self.kv.as_ref())
    }

    /// Ingest a raw status report posted by an enrollment.
    ///
    /// Derived documents are never touched by status.
    pub async fn store_status(
        &self,
        enrollment_id: &str,
        raw: &[u8],
    ) -> Result<IngestSummary, StoreError> {
        require_id(EntityKind::Enrollment, enrollment_id)?;
        let report = StatusReport::parse(raw)?;
        self.merger().ingest(enrollment_id, &report, Utc::now()).await
    }

    /// Latest declaration statuses per enrollment
    pub async fn retrieve_declaration_status(
        &self,
        enrollment_ids: &[&str],
    ) -> Result<BTreeMap<String, Vec<DeclarationQueryStatus>>, StoreError> {
        let mut statuses = BTreeMap::new();
        for id in enrollment_ids {
            statuses.insert(id.to_string(), self.merger().declaration_statuses(id).await?);
        }
        Ok(statuses)
    }

    /// Accumulated status values per enrollment, optionally filtered by a
    /// path pattern
    pub async fn retrieve_status_values(
        &self,
        enrollment_ids: &[&str],
        pattern: Option<&str>,
    ) -> Result<BTreeMap<String, Vec<StatusValue>>, StoreError> {
        let mut values = BTreeMap::new();
        for id in enrollment_ids {
            values.insert(id.to_string(), self.merger().values(id, pattern).await?);
        }
        Ok(values)
    }

    /// Logged status errors per enrollment, newest first
    pub async fn retrieve_status_errors(
        &self,
        enrollment_ids: &[&str],
        page: Page,
    ) -> Result<BTreeMap<String, Vec<LoggedStatusError>>, StoreError> {
        let mut errors = BTreeMap::new();
        for id in enrollment_ids {
            errors.insert(id.to_string(), self.merger().errors(id, page).await?);
        }
        Ok(errors)
    }

    /// The raw body of the enrollment's latest status report
    pub async fn retrieve_status_report(&self, enrollment_id: &str) -> Result<Vec<u8>, StoreError> {
        self.merger()
            .last_report(enrollment_id)
            .await?
            .ok_or_else(|| StoreError::not_found(EntityKind::Enrollment, enrollment_id))
    }
}

#[cfg(test)]
mod tests {
    use crate::store::tests::test_store;

    #[tokio::test]
    async fn test_status_does_not_touch_documents() {
        let store = test_store();
        store.store_enrollment_set("e1", "g1").await.unwrap();
        let before = store.retrieve_tokens_json("e1").await.unwrap();

        let report = br#"{"StatusItems":{"device":{"model":{"family":"iPad"}}}}"#;
        let summary = store.store_status("e1", report).await.unwrap();
        assert_eq!(summary.values_added, 1);

        assert_eq!(store.retrieve_tokens_json("e1").await.unwrap(), before);
        assert_eq!(store.retrieve_status_report("e1").await.unwrap(), report.to_vec());
    }

    #[tokio::test]
    async fn test_status_for_unknown_enrollment() {
        let store = test_store();
        assert!(store
            .retrieve_status_report("ghost")
            .await
            .unwrap_err()
            .is_not_found());

        let values = store.retrieve_status_values(&["ghost"], None).await.unwrap();
        assert!(values["ghost"].is_empty());
    }

    #[tokio::test]
    async fn test_malformed_report_rejected() {
        let store = test_store();
        assert!(store.store_status("e1", b"not json").await.is_err());
        assert!(store.retrieve_status_report("e1").await.is_err());
    }
}
