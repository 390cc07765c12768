//! Membership graph traversal
//!
//! Declarations, groups and enrollments form a two-level bipartite graph
//! stored as edge records. Walks compose forward and inverse prefix queries
//! and never cache anything of their own.

use std::collections::BTreeSet;

use crate::error::{EntityKind, StoreError};
use crate::kv::{keys, KvStore, Record};

/// Read-only view over the membership edges of a store
pub struct Graph<'a> {
    kv: &'a dyn KvStore,
}

/// Collect the identifiers behind `key` for every record, dropping records
/// whose key sits outside `namespace`.
fn ids(records: Vec<Record>, namespace: &str, key: impl Fn(&Record) -> &str) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| keys::strip(key(r), namespace).map(str::to_string))
        .collect()
}

impl<'a> Graph<'a> {
    pub fn new(kv: &'a dyn KvStore) -> Self {
        Self { kv }
    }

    /// Groups the enrollment belongs to
    pub async fn groups_of_enrollment(&self, enrollment_id: &str) -> Result<Vec<String>, StoreError> {
        let records = self
            .kv
            .query_primary_prefix(&keys::enrollment(enrollment_id), keys::GROUP)
            .await
            .map_err(StoreError::backend(EntityKind::Enrollment, enrollment_id))?;
        Ok(ids(records, keys::GROUP, |r| r.secondary.as_str()))
    }

    /// Declarations directly linked to the group
    pub async fn declarations_of_group(&self, group: &str) -> Result<Vec<String>, StoreError> {
        let records = self
            .kv
            .query_primary_prefix(&keys::group(group), keys::DECLARATION)
            .await
            .map_err(StoreError::backend(EntityKind::Group, group))?;
        Ok(ids(records, keys::DECLARATION, |r| r.secondary.as_str()))
    }

    /// Groups that contain the declaration
    pub async fn groups_of_declaration(&self, declaration_id: &str) -> Result<Vec<String>, StoreError> {
        let records = self
            .kv
            .query_inverse_prefix(&keys::declaration(declaration_id), keys::GROUP)
            .await
            .map_err(StoreError::backend(EntityKind::Declaration, declaration_id))?;
        Ok(ids(records, keys::GROUP, |r| r.primary.as_str()))
    }

    /// Enrollments that are members of the group
    pub async fn enrollments_of_group(&self, group: &str) -> Result<Vec<String>, StoreError> {
        let records = self
            .kv
            .query_inverse_prefix(&keys::group(group), keys::ENROLLMENT)
            .await
            .map_err(StoreError::backend(EntityKind::Group, group))?;
        Ok(ids(records, keys::ENROLLMENT, |r| r.primary.as_str()))
    }

    /// Union of the declarations of every group the enrollment belongs to,
    /// without duplicates, in identifier order.
    pub async fn declarations_of_enrollment(
        &self,
        enrollment_id: &str,
    ) -> Result<BTreeSet<String>, StoreError> {
        let mut declarations = BTreeSet::new();
        for group in self.groups_of_enrollment(enrollment_id).await? {
            declarations.extend(self.declarations_of_group(&group).await?);
        }
        Ok(declarations)
    }

    /// Every enrollment that reaches the declaration through some group.
    pub async fn enrollments_of_declaration(
        &self,
        declaration_id: &str,
    ) -> Result<BTreeSet<String>, StoreError> {
        let mut enrollments = BTreeSet::new();
        for group in self.groups_of_declaration(declaration_id).await? {
            enrollments.extend(self.enrollments_of_group(&group).await?);
        }
        Ok(enrollments)
    }

    /// Whether the declaration is reachable from the enrollment
    pub async fn enrollment_reaches(
        &self,
        enrollment_id: &str,
        declaration_id: &str,
    ) -> Result<bool, StoreError> {
        for group in self.groups_of_enrollment(enrollment_id).await? {
            let edge = self
                .kv
                .get(&keys::group(&group), &keys::declaration(declaration_id))
                .await
                .map_err(StoreError::backend(EntityKind::Group, &group))?;
            if edge.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
