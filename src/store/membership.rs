//! Group and enrollment membership operations
//!
//! Edges are idempotent: adding an existing edge or removing a missing one
//! succeeds and reports `false`. The recompute runs either way, so repeating
//! a call whose cascade failed brings the derived documents up to date.

use super::{require_id, DdmStore};
use crate::error::{EntityKind, StoreError};
use crate::kv::{keys, Record};

impl DdmStore {
    /// Whether a record exists at the key, with errors attributed to `kind`
    async fn edge_exists(
        &self,
        kind: EntityKind,
        id: &str,
        primary: &str,
        secondary: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .kv
            .get(primary, secondary)
            .await
            .map_err(StoreError::backend(kind, id))?
            .is_some())
    }

    /// Add a declaration to a group and recompute the group's enrollments.
    ///
    /// The declaration must already be stored.
    pub async fn store_set_declaration(
        &self,
        group: &str,
        declaration_id: &str,
    ) -> Result<bool, StoreError> {
        require_id(EntityKind::Group, group)?;
        require_id(EntityKind::Declaration, declaration_id)?;
        self.require_declaration_record(declaration_id).await?;

        let primary = keys::group(group);
        let secondary = keys::declaration(declaration_id);
        let existed = self
            .edge_exists(EntityKind::Group, group, &primary, &secondary)
            .await?;

        let backend = || StoreError::backend(EntityKind::Group, group);
        if !existed {
            self.kv
                .put(Record::edge(primary.clone(), secondary))
                .await
                .map_err(backend())?;
            log::info!("added declaration {} to group {}", declaration_id, group);
        }
        self.kv
            .put(Record::edge(keys::GROUP_REGISTRY, primary))
            .await
            .map_err(backend())?;

        self.invalidator()
            .group_changed(group)
            .await
            .map_err(StoreError::unpropagated(EntityKind::Group, group))?;
        Ok(!existed)
    }

    /// Remove a declaration from a group and recompute the group's
    /// enrollments.
    pub async fn remove_set_declaration(
        &self,
        group: &str,
        declaration_id: &str,
    ) -> Result<bool, StoreError> {
        require_id(EntityKind::Group, group)?;
        require_id(EntityKind::Declaration, declaration_id)?;

        let existed = self.unlink_group_declaration(group, declaration_id).await?;
        if existed {
            log::info!("removed declaration {} from group {}", declaration_id, group);
        }

        self.invalidator()
            .group_changed(group)
            .await
            .map_err(StoreError::unpropagated(EntityKind::Group, group))?;
        Ok(existed)
    }

    /// Delete a group -> declaration edge without recomputing anything.
    /// Drops the group from the registry whenever it has no declarations
    /// left, including after an earlier call that stopped part way.
    pub(super) async fn unlink_group_declaration(
        &self,
        group: &str,
        declaration_id: &str,
    ) -> Result<bool, StoreError> {
        let backend = || StoreError::backend(EntityKind::Group, group);
        let existed = self
            .kv
            .delete(&keys::group(group), &keys::declaration(declaration_id))
            .await
            .map_err(backend())?;

        if self.graph().declarations_of_group(group).await?.is_empty()
            && self
                .kv
                .delete(keys::GROUP_REGISTRY, &keys::group(group))
                .await
                .map_err(backend())?
        {
            log::debug!("group {} has no declarations left", group);
        }
        Ok(existed)
    }

    /// Declarations in the group
    pub async fn retrieve_set_declarations(&self, group: &str) -> Result<Vec<String>, StoreError> {
        self.graph().declarations_of_group(group).await
    }

    /// Groups that contain the declaration
    pub async fn retrieve_declaration_sets(
        &self,
        declaration_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        self.graph().groups_of_declaration(declaration_id).await
    }

    /// Every group that has at least one declaration
    pub async fn retrieve_sets(&self) -> Result<Vec<String>, StoreError> {
        let records = self
            .kv
            .query_primary_prefix(keys::GROUP_REGISTRY, keys::GROUP)
            .await
            .map_err(StoreError::backend(EntityKind::Group, "*"))?;
        Ok(records
            .iter()
            .filter_map(|r| keys::strip(&r.secondary, keys::GROUP))
            .map(str::to_string)
            .collect())
    }

    /// Subscribe an enrollment to a group and recompute it.
    pub async fn store_enrollment_set(
        &self,
        enrollment_id: &str,
        group: &str,
    ) -> Result<bool, StoreError> {
        require_id(EntityKind::Enrollment, enrollment_id)?;
        require_id(EntityKind::Group, group)?;

        let primary = keys::enrollment(enrollment_id);
        let secondary = keys::group(group);
        let existed = self
            .edge_exists(EntityKind::Enrollment, enrollment_id, &primary, &secondary)
            .await?;
        if !existed {
            self.kv
                .put(Record::edge(primary, secondary))
                .await
                .map_err(StoreError::backend(EntityKind::Enrollment, enrollment_id))?;
            log::info!("added enrollment {} to group {}", enrollment_id, group);
        }

        self.invalidator().enrollment_changed(enrollment_id).await?;
        Ok(!existed)
    }

    /// Unsubscribe an enrollment from a group and recompute it.
    pub async fn remove_enrollment_set(
        &self,
        enrollment_id: &str,
        group: &str,
    ) -> Result<bool, StoreError> {
        require_id(EntityKind::Enrollment, enrollment_id)?;
        require_id(EntityKind::Group, group)?;

        let existed = self
            .kv
            .delete(&keys::enrollment(enrollment_id), &keys::group(group))
            .await
            .map_err(StoreError::backend(EntityKind::Enrollment, enrollment_id))?;
        if existed {
            log::info!("removed enrollment {} from group {}", enrollment_id, group);
        }

        self.invalidator().enrollment_changed(enrollment_id).await?;
        Ok(existed)
    }

    /// Unsubscribe an enrollment from every group, recomputing it once.
    pub async fn remove_all_enrollment_sets(&self, enrollment_id: &str) -> Result<bool, StoreError> {
        require_id(EntityKind::Enrollment, enrollment_id)?;

        let primary = keys::enrollment(enrollment_id);
        let mut removed = 0;
        for group in self.graph().groups_of_enrollment(enrollment_id).await? {
            if self
                .kv
                .delete(&primary, &keys::group(&group))
                .await
                .map_err(StoreError::backend(EntityKind::Enrollment, enrollment_id))?
            {
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("removed enrollment {} from {} group(s)", enrollment_id, removed);
        }

        self.invalidator().enrollment_changed(enrollment_id).await?;
        Ok(removed > 0)
    }

    /// Groups the enrollment is subscribed to
    pub async fn retrieve_enrollment_sets(
        &self,
        enrollment_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        self.graph().groups_of_enrollment(enrollment_id).await
    }

    /// Enrollments subscribed to the group
    pub async fn retrieve_set_enrollment_ids(&self, group: &str) -> Result<Vec<String>, StoreError> {
        self.graph().enrollments_of_group(group).await
    }
}

#[cfg(test)]
mod tests {
    use crate::store::tests::test_store;

    #[tokio::test]
    async fn test_set_declaration_requires_declaration() {
        let store = test_store();
        let err = store.store_set_declaration("g1", "missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.retrieve_sets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edges_are_idempotent() {
        let store = test_store();
        store
            .store_declaration(br#"{"Identifier":"d1","Type":"t"}"#)
            .await
            .unwrap();

        assert!(store.store_set_declaration("g1", "d1").await.unwrap());
        assert!(!store.store_set_declaration("g1", "d1").await.unwrap());
        assert!(store.store_enrollment_set("e1", "g1").await.unwrap());
        assert!(!store.store_enrollment_set("e1", "g1").await.unwrap());

        assert!(store.remove_enrollment_set("e1", "g1").await.unwrap());
        assert!(!store.remove_enrollment_set("e1", "g1").await.unwrap());
        assert!(!store.remove_set_declaration("g1", "nothing").await.unwrap());
    }

    #[tokio::test]
    async fn test_group_registry_follows_declaration_edges() {
        let store = test_store();
        for id in ["d1", "d2"] {
            let raw = format!(r#"{{"Identifier":"{}","Type":"t"}}"#, id);
            store.store_declaration(raw.as_bytes()).await.unwrap();
        }
        store.store_set_declaration("g1", "d1").await.unwrap();
        store.store_set_declaration("g1", "d2").await.unwrap();
        store.store_set_declaration("g2", "d2").await.unwrap();
        assert_eq!(store.retrieve_sets().await.unwrap(), vec!["g1", "g2"]);
        assert_eq!(
            store.retrieve_declaration_sets("d2").await.unwrap(),
            vec!["g1", "g2"]
        );

        store.remove_set_declaration("g1", "d1").await.unwrap();
        assert_eq!(store.retrieve_sets().await.unwrap(), vec!["g1", "g2"]);
        store.remove_set_declaration("g1", "d2").await.unwrap();
        assert_eq!(store.retrieve_sets().await.unwrap(), vec!["g2"]);
    }

    #[tokio::test]
    async fn test_remove_all_enrollment_sets() {
        let store = test_store();
        store.store_enrollment_set("e1", "g1").await.unwrap();
        store.store_enrollment_set("e1", "g2").await.unwrap();
        assert_eq!(
            store.retrieve_enrollment_sets("e1").await.unwrap(),
            vec!["g1", "g2"]
        );
        assert_eq!(store.retrieve_set_enrollment_ids("g2").await.unwrap(), vec!["e1"]);

        assert!(store.remove_all_enrollment_sets("e1").await.unwrap());
        assert!(store.retrieve_enrollment_sets("e1").await.unwrap().is_empty());
        assert!(!store.remove_all_enrollment_sets("e1").await.unwrap());
    }
}
