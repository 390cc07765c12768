//! Storage facade
//!
//! [`DdmStore`] ties the addressing layer, the token protocol, graph
//! traversal, invalidation and status merging together behind the
//! operations callers use. Every mutation of a declaration or membership
//! edge is followed by a cascade that recomputes the affected enrollments'
//! derived documents before the call returns.

mod declarations;
mod membership;
mod status;

use std::sync::Arc;

use crate::builder::{DeclarationItemsBuilder, DerivedDocuments, DocumentBuilder};
use crate::config::{default_salt_source, SaltSource, StoreConfig};
use crate::error::{EntityKind, StoreError};
use crate::graph::Graph;
use crate::invalidation::{DocumentRecord, Invalidator};
use crate::kv::{keys, KvStore, TimeoutKv};

pub use declarations::StoreOutcome;

/// Declarative device management storage over a composite-key backend
pub struct DdmStore {
    kv: Arc<dyn KvStore>,
    builder: Arc<dyn DocumentBuilder>,
    salts: Arc<dyn SaltSource>,
    config: StoreConfig,
}

impl DdmStore {
    /// Create a store with the default document builder and the OS salt
    /// source. When the configuration sets an operation timeout the backend
    /// is wrapped so that every call honours it.
    pub fn new(kv: Arc<dyn KvStore>, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let kv: Arc<dyn KvStore> = match config.op_timeout() {
            Some(limit) => Arc::new(TimeoutKv::new(kv, limit)),
            None => kv,
        };

        Ok(Self {
            kv,
            builder: Arc::new(DeclarationItemsBuilder::new(config.token_hash)),
            salts: default_salt_source(),
            config,
        })
    }

    /// Replace the document builder
    pub fn with_builder(mut self, builder: Arc<dyn DocumentBuilder>) -> Self {
        self.builder = builder;
        self
    }

    /// Replace the salt source
    pub fn with_salt_source(mut self, salts: Arc<dyn SaltSource>) -> Self {
        self.salts = salts;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn graph(&self) -> Graph<'_> {
        Graph::new(self.kv.as_ref())
    }

    fn invalidator(&self) -> Invalidator<'_> {
        Invalidator::new(self.kv.as_ref(), self.builder.as_ref())
    }

    /// Rebuild one enrollment's derived documents from the current graph.
    ///
    /// Also the way to retry an enrollment listed in a
    /// [`crate::CascadeFailure`].
    pub async fn recompute_enrollment(
        &self,
        enrollment_id: &str,
    ) -> Result<DerivedDocuments, StoreError> {
        require_id(EntityKind::Enrollment, enrollment_id)?;
        self.invalidator().recompute(enrollment_id).await
    }

    /// Recompute every enrollment that reaches the declaration. Retries the
    /// cascade of a declaration store that ended in
    /// [`StoreError::Unpropagated`].
    pub async fn recompute_declaration(
        &self,
        declaration_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        require_id(EntityKind::Declaration, declaration_id)?;
        self.invalidator().declaration_changed(declaration_id).await
    }

    /// Recompute every enrollment in the group.
    pub async fn recompute_group(&self, group: &str) -> Result<Vec<String>, StoreError> {
        require_id(EntityKind::Group, group)?;
        self.invalidator().group_changed(group).await
    }

    /// The enrollment's manifest document
    pub async fn retrieve_declaration_items_json(
        &self,
        enrollment_id: &str,
    ) -> Result<Vec<u8>, StoreError> {
        self.derived_document(enrollment_id, keys::MANIFEST).await
    }

    /// The enrollment's token document
    pub async fn retrieve_tokens_json(&self, enrollment_id: &str) -> Result<Vec<u8>, StoreError> {
        self.derived_document(enrollment_id, keys::TOKENS).await
    }

    async fn derived_document(
        &self,
        enrollment_id: &str,
        kind: &str,
    ) -> Result<Vec<u8>, StoreError> {
        let record = self
            .kv
            .get(&keys::enrollment(enrollment_id), kind)
            .await
            .map_err(StoreError::backend(EntityKind::Enrollment, enrollment_id))?
            .ok_or_else(|| StoreError::not_found(EntityKind::Enrollment, enrollment_id))?;

        let document: DocumentRecord = record
            .decode()
            .map_err(StoreError::backend(EntityKind::Enrollment, enrollment_id))?;
        Ok(document.body.into_bytes())
    }
}

/// Reject empty identifiers and names before anything is read or written.
fn require_id(kind: EntityKind, id: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::validation(
            kind.to_string(),
            "identifier must not be empty",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SeededSaltSource;
    use crate::kv::MemoryKv;

    pub(crate) fn test_store() -> DdmStore {
        DdmStore::new(Arc::new(MemoryKv::new()), StoreConfig::default())
            .unwrap()
            .with_salt_source(Arc::new(SeededSaltSource::new(7)))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StoreConfig {
            salt_len: 0,
            ..Default::default()
        };
        assert!(DdmStore::new(Arc::new(MemoryKv::new()), config).is_err());
    }

    #[tokio::test]
    async fn test_documents_missing_before_first_recompute() {
        let store = test_store();
        let err = store.retrieve_tokens_json("e1").await.unwrap_err();
        assert!(err.is_not_found());

        store.recompute_enrollment("e1").await.unwrap();
        assert!(store.retrieve_tokens_json("e1").await.is_ok());
        assert!(store.retrieve_declaration_items_json("e1").await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_enrollment_id_rejected() {
        let store = test_store();
        assert!(matches!(
            store.recompute_enrollment("").await,
            Err(StoreError::Validation { .. })
        ));
    }
}
