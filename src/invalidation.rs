//! Invalidation and recomputation of derived documents
//!
//! Every graph mutation ends here. The engine works out which enrollments
//! could be affected and rebuilds their manifest and token documents from
//! scratch. Rebuilds are full overwrites and depend only on the graph as it
//! is read at that moment, so redundant or concurrent rebuilds of the same
//! enrollment are harmless and converge.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::builder::{BuilderError, DerivedDocuments, DocumentBuilder};
use crate::declaration::{Declaration, DeclarationRecord};
use crate::error::{CascadeFailure, EntityKind, StoreError};
use crate::graph::Graph;
use crate::kv::{keys, KvStore, Record};

/// Body of a stored manifest or token document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DocumentRecord {
    pub body: String,
}

pub struct Invalidator<'a> {
    kv: &'a dyn KvStore,
    builder: &'a dyn DocumentBuilder,
}

impl<'a> Invalidator<'a> {
    pub fn new(kv: &'a dyn KvStore, builder: &'a dyn DocumentBuilder) -> Self {
        Self { kv, builder }
    }

    fn graph(&self) -> Graph<'a> {
        Graph::new(self.kv)
    }

    /// Rebuild and store the manifest and token documents of one enrollment.
    pub async fn recompute(&self, enrollment_id: &str) -> Result<DerivedDocuments, StoreError> {
        let ids = self.graph().declarations_of_enrollment(enrollment_id).await?;

        let mut declarations = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.load_declaration(id).await? {
                Some(declaration) => declarations.push(declaration),
                None => log::warn!(
                    "declaration {} linked for enrollment {} has no record; skipping",
                    id,
                    enrollment_id
                ),
            }
        }

        let documents = self.build(enrollment_id, &declarations)?;
        let manifest = self.text(enrollment_id, "manifest", &documents.manifest)?;
        let tokens = self.text(enrollment_id, "tokens", &documents.tokens)?;

        let primary = keys::enrollment(enrollment_id);
        for (secondary, body) in [(keys::MANIFEST, manifest), (keys::TOKENS, tokens)] {
            let record = DocumentRecord { body };
            let record = Record::encode(primary.clone(), secondary, &record)
                .map_err(StoreError::backend(EntityKind::Enrollment, enrollment_id))?;
            self.kv
                .put(record)
                .await
                .map_err(StoreError::backend(EntityKind::Enrollment, enrollment_id))?;
        }

        log::debug!(
            "recomputed enrollment {} with {} declaration(s)",
            enrollment_id,
            declarations.len()
        );
        Ok(documents)
    }

    fn build(
        &self,
        enrollment_id: &str,
        declarations: &[Declaration],
    ) -> Result<DerivedDocuments, StoreError> {
        let builder_error = |source| StoreError::Builder {
            enrollment: enrollment_id.to_string(),
            source,
        };

        let mut session = self.builder.begin();
        for declaration in declarations {
            session.add_declaration(declaration).map_err(builder_error)?;
        }
        session.finalize().map_err(builder_error)
    }

    /// Documents are stored as text; builder output must be UTF-8.
    fn text(&self, enrollment_id: &str, kind: &str, body: &[u8]) -> Result<String, StoreError> {
        String::from_utf8(body.to_vec()).map_err(|e| StoreError::Builder {
            enrollment: enrollment_id.to_string(),
            source: BuilderError::SerializationError(format!("{} is not UTF-8: {}", kind, e)),
        })
    }

    async fn load_declaration(&self, id: &str) -> Result<Option<Declaration>, StoreError> {
        let record = self
            .kv
            .get(&keys::declaration(id), keys::DECLARATION_RECORD)
            .await
            .map_err(StoreError::backend(EntityKind::Declaration, id))?;

        match record {
            Some(record) => {
                let stored: DeclarationRecord = record
                    .decode()
                    .map_err(StoreError::backend(EntityKind::Declaration, id))?;
                Ok(Some(stored.to_declaration()?))
            }
            None => Ok(None),
        }
    }

    /// Recompute each enrollment independently.
    ///
    /// A failure for one enrollment does not stop the others; if any failed
    /// the result is a [`StoreError::Cascade`] listing them.
    pub async fn recompute_each(
        &self,
        enrollments: BTreeSet<String>,
    ) -> Result<Vec<String>, StoreError> {
        let mut recomputed = Vec::new();
        let mut failures = Vec::new();

        for enrollment_id in enrollments {
            match self.recompute(&enrollment_id).await {
                Ok(_) => recomputed.push(enrollment_id),
                Err(e) => {
                    log::warn!("recompute of enrollment {} failed: {}", enrollment_id, e);
                    failures.push((enrollment_id, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(recomputed)
        } else {
            Err(StoreError::Cascade(CascadeFailure {
                recomputed,
                failures,
            }))
        }
    }

    /// A declaration's content changed.
    pub async fn declaration_changed(&self, declaration_id: &str) -> Result<Vec<String>, StoreError> {
        let enrollments = self.graph().enrollments_of_declaration(declaration_id).await?;
        log::info!(
            "declaration {} changed; recomputing {} enrollment(s)",
            declaration_id,
            enrollments.len()
        );
        self.recompute_each(enrollments).await
    }

    /// A group gained or lost a declaration.
    pub async fn group_changed(&self, group: &str) -> Result<Vec<String>, StoreError> {
        let enrollments: BTreeSet<String> = self
            .graph()
            .enrollments_of_group(group)
            .await?
            .into_iter()
            .collect();
        log::info!(
            "group {} changed; recomputing {} enrollment(s)",
            group,
            enrollments.len()
        );
        self.recompute_each(enrollments).await
    }

    /// An enrollment joined or left a group.
    pub async fn enrollment_changed(&self, enrollment_id: &str) -> Result<Vec<String>, StoreError> {
        self.recompute_each(BTreeSet::from([enrollment_id.to_string()]))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildSession, DeclarationItems, DeclarationItemsBuilder};
    use crate::declaration::{content_token, parse_object, with_token};
    use crate::config::TokenHash;
    use crate::kv::MemoryKv;

    async fn put_declaration(kv: &MemoryKv, id: &str) {
        let raw = format!(r#"{{"Identifier":"{}","Type":"t","Payload":{{}}}}"#, id);
        let doc = parse_object(raw.as_bytes()).unwrap();
        let token = content_token(&doc, b"salt", TokenHash::Sha256).unwrap();
        let stored = DeclarationRecord {
            json: with_token(&doc, &token).unwrap(),
            token,
            declaration_type: "t".to_string(),
            salt: hex::encode(b"salt"),
        };
        kv.put(Record::encode(keys::declaration(id), keys::DECLARATION_RECORD, &stored).unwrap())
            .await
            .unwrap();
    }

    async fn link(kv: &MemoryKv, primary: String, secondary: String) {
        kv.put(Record::edge(primary, secondary)).await.unwrap();
    }

    async fn manifest_ids(kv: &MemoryKv, enrollment: &str) -> Vec<String> {
        let record = kv
            .get(&keys::enrollment(enrollment), keys::MANIFEST)
            .await
            .unwrap()
            .unwrap();
        let doc: DocumentRecord = record.decode().unwrap();
        let items: DeclarationItems = serde_json::from_str(&doc.body).unwrap();
        items.declarations.all().map(|i| i.identifier.clone()).collect()
    }

    /// Builder that refuses any set containing a given declaration
    struct PickyBuilder {
        poison: &'static str,
    }

    struct PickySession {
        poison: &'static str,
        inner: Box<dyn BuildSession + Send>,
    }

    impl DocumentBuilder for PickyBuilder {
        fn begin(&self) -> Box<dyn BuildSession + Send> {
            Box::new(PickySession {
                poison: self.poison,
                inner: DeclarationItemsBuilder::default().begin(),
            })
        }
    }

    impl BuildSession for PickySession {
        fn add_declaration(&mut self, declaration: &Declaration) -> Result<(), BuilderError> {
            if declaration.identifier == self.poison {
                return Err(BuilderError::Rejected {
                    identifier: declaration.identifier.clone(),
                    reason: "poisoned".to_string(),
                });
            }
            self.inner.add_declaration(declaration)
        }

        fn finalize(self: Box<Self>) -> Result<DerivedDocuments, BuilderError> {
            self.inner.finalize()
        }
    }

    #[tokio::test]
    async fn test_recompute_is_idempotent() {
        let kv = MemoryKv::new();
        put_declaration(&kv, "d1").await;
        link(&kv, keys::group("g1"), keys::declaration("d1")).await;
        link(&kv, keys::enrollment("e1"), keys::group("g1")).await;

        let builder = DeclarationItemsBuilder::default();
        let engine = Invalidator::new(&kv, &builder);

        let first = engine.recompute("e1").await.unwrap();
        let second = engine.recompute("e1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(manifest_ids(&kv, "e1").await, vec!["d1"]);
    }

    #[tokio::test]
    async fn test_dangling_edge_is_skipped() {
        let kv = MemoryKv::new();
        put_declaration(&kv, "d1").await;
        link(&kv, keys::group("g1"), keys::declaration("d1")).await;
        link(&kv, keys::group("g1"), keys::declaration("gone")).await;
        link(&kv, keys::enrollment("e1"), keys::group("g1")).await;

        let builder = DeclarationItemsBuilder::default();
        Invalidator::new(&kv, &builder).recompute("e1").await.unwrap();
        assert_eq!(manifest_ids(&kv, "e1").await, vec!["d1"]);
    }

    #[tokio::test]
    async fn test_partial_cascade_failure() {
        let kv = MemoryKv::new();
        put_declaration(&kv, "shared").await;
        put_declaration(&kv, "bad").await;
        link(&kv, keys::group("clean"), keys::declaration("shared")).await;
        link(&kv, keys::group("dirty"), keys::declaration("shared")).await;
        link(&kv, keys::group("dirty"), keys::declaration("bad")).await;
        link(&kv, keys::enrollment("ok"), keys::group("clean")).await;
        link(&kv, keys::enrollment("broken"), keys::group("dirty")).await;

        let builder = PickyBuilder { poison: "bad" };
        let engine = Invalidator::new(&kv, &builder);

        match engine.declaration_changed("shared").await {
            Err(StoreError::Cascade(failure)) => {
                assert_eq!(failure.recomputed, vec!["ok"]);
                assert_eq!(failure.failed_enrollments(), vec!["broken"]);
                assert!(matches!(failure.failures[0].1, StoreError::Builder { .. }));
            }
            other => panic!("expected cascade failure, got {:?}", other),
        }

        // The healthy enrollment's documents were still written.
        assert_eq!(manifest_ids(&kv, "ok").await, vec!["shared"]);
        assert!(kv
            .get(&keys::enrollment("broken"), keys::MANIFEST)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_group_changed_touches_only_members() {
        let kv = MemoryKv::new();
        put_declaration(&kv, "d1").await;
        link(&kv, keys::group("g1"), keys::declaration("d1")).await;
        link(&kv, keys::enrollment("member"), keys::group("g1")).await;
        link(&kv, keys::enrollment("outsider"), keys::group("g2")).await;

        let builder = DeclarationItemsBuilder::default();
        let recomputed = Invalidator::new(&kv, &builder)
            .group_changed("g1")
            .await
            .unwrap();
        assert_eq!(recomputed, vec!["member"]);
    }

    /// Builder whose manifest bytes are not text
    struct BinaryBuilder;

    struct BinarySession;

    impl DocumentBuilder for BinaryBuilder {
        fn begin(&self) -> Box<dyn BuildSession + Send> {
            Box::new(BinarySession)
        }
    }

    impl BuildSession for BinarySession {
        fn add_declaration(&mut self, _declaration: &Declaration) -> Result<(), BuilderError> {
            Ok(())
        }

        fn finalize(self: Box<Self>) -> Result<DerivedDocuments, BuilderError> {
            Ok(DerivedDocuments {
                manifest: vec![0xff, 0xfe, 0x00],
                tokens: b"{}".to_vec(),
            })
        }
    }

    #[tokio::test]
    async fn test_non_utf8_output_is_rejected_before_writing() {
        let kv = MemoryKv::new();
        link(&kv, keys::enrollment("e1"), keys::group("g1")).await;

        let result = Invalidator::new(&kv, &BinaryBuilder).recompute("e1").await;
        assert!(matches!(
            result,
            Err(StoreError::Builder {
                source: BuilderError::SerializationError(_),
                ..
            })
        ));
        assert!(kv
            .get(&keys::enrollment("e1"), keys::TOKENS)
            .await
            .unwrap()
            .is_none());
    }

    /// Store that refuses to write documents for one enrollment
    struct RefusingKv {
        inner: MemoryKv,
        refused: String,
    }

    #[async_trait::async_trait]
    impl KvStore for RefusingKv {
        async fn put(&self, record: Record) -> Result<(), crate::kv::KvError> {
            if record.primary == self.refused {
                return Err(crate::kv::KvError::Unavailable("disk full".to_string()));
            }
            self.inner.put(record).await
        }

        async fn get(
            &self,
            primary: &str,
            secondary: &str,
        ) -> Result<Option<Record>, crate::kv::KvError> {
            self.inner.get(primary, secondary).await
        }

        async fn query_primary_prefix(
            &self,
            primary: &str,
            secondary_prefix: &str,
        ) -> Result<Vec<Record>, crate::kv::KvError> {
            self.inner.query_primary_prefix(primary, secondary_prefix).await
        }

        async fn query_inverse_prefix(
            &self,
            secondary: &str,
            primary_prefix: &str,
        ) -> Result<Vec<Record>, crate::kv::KvError> {
            self.inner.query_inverse_prefix(secondary, primary_prefix).await
        }

        async fn delete(&self, primary: &str, secondary: &str) -> Result<bool, crate::kv::KvError> {
            self.inner.delete(primary, secondary).await
        }
    }

    #[tokio::test]
    async fn test_write_failure_fails_only_that_enrollment() {
        let inner = MemoryKv::new();
        put_declaration(&inner, "d1").await;
        link(&inner, keys::group("g1"), keys::declaration("d1")).await;
        link(&inner, keys::enrollment("e1"), keys::group("g1")).await;
        link(&inner, keys::enrollment("e2"), keys::group("g1")).await;

        let kv = RefusingKv {
            inner,
            refused: keys::enrollment("e2"),
        };
        let builder = DeclarationItemsBuilder::default();

        match Invalidator::new(&kv, &builder).declaration_changed("d1").await {
            Err(StoreError::Cascade(failure)) => {
                assert_eq!(failure.recomputed, vec!["e1"]);
                assert_eq!(failure.failed_enrollments(), vec!["e2"]);
                assert!(matches!(
                    failure.failures[0].1,
                    StoreError::Backend {
                        kind: EntityKind::Enrollment,
                        ..
                    }
                ));
            }
            other => panic!("expected cascade failure, got {:?}", other),
        }
        assert_eq!(manifest_ids(&kv.inner, "e1").await, vec!["d1"]);
    }
}

