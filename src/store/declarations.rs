//! Declaration operations

use super::{require_id, DdmStore};
use crate::declaration::{content_token, parse_object, with_token, Declaration, DeclarationRecord};
use crate::error::{EntityKind, StoreError};
use crate::kv::{keys, Record};

/// Result of storing a declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// New or altered content; the token changed and dependents were
    /// recomputed
    Changed,
    /// Content identical to what is stored; nothing was written
    Unchanged,
}

impl StoreOutcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, StoreOutcome::Changed)
    }
}

impl DdmStore {
    pub(super) async fn load_declaration_record(
        &self,
        declaration_id: &str,
    ) -> Result<Option<DeclarationRecord>, StoreError> {
        let backend = || StoreError::backend(EntityKind::Declaration, declaration_id);
        self.kv
            .get(&keys::declaration(declaration_id), keys::DECLARATION_RECORD)
            .await
            .map_err(backend())?
            .map(|record| record.decode::<DeclarationRecord>())
            .transpose()
            .map_err(backend())
    }

    pub(super) async fn require_declaration_record(
        &self,
        declaration_id: &str,
    ) -> Result<DeclarationRecord, StoreError> {
        self.load_declaration_record(declaration_id)
            .await?
            .ok_or_else(|| StoreError::not_found(EntityKind::Declaration, declaration_id))
    }

    fn draw_salt(&self) -> Result<Vec<u8>, StoreError> {
        let mut salt = vec![0u8; self.config.salt_len];
        self.salts
            .fill(&mut salt)
            .map_err(|e| StoreError::Salt(e.to_string()))?;
        Ok(salt)
    }

    /// Store a declaration, creating or updating it.
    ///
    /// The token is recomputed from the content and the declaration's
    /// creation salt. If it matches the stored token nothing is written and
    /// no enrollment is touched. Once the new record is written, cascade
    /// failures come back as [`StoreError::Cascade`] or
    /// [`StoreError::Unpropagated`]; storing again would then report
    /// `Unchanged`, so retry with [`DdmStore::recompute_declaration`].
    pub async fn store_declaration(&self, raw: &[u8]) -> Result<StoreOutcome, StoreError> {
        let declaration = Declaration::parse(raw)?;
        let document = parse_object(raw)?;
        let id = declaration.identifier.as_str();

        let existing = self.load_declaration_record(id).await?;
        let salt = match &existing {
            Some(record) => record.salt_bytes()?,
            None => self.draw_salt()?,
        };

        let token = content_token(&document, &salt, self.config.token_hash)?;
        if let Some(existing) = &existing {
            if existing.token == token {
                log::debug!("declaration {} unchanged", id);
                return Ok(StoreOutcome::Unchanged);
            }
        }

        let record = DeclarationRecord {
            json: with_token(&document, &token)?,
            token,
            declaration_type: declaration.declaration_type.clone(),
            salt: hex::encode(&salt),
        };
        let record = Record::encode(keys::declaration(id), keys::DECLARATION_RECORD, &record)
            .map_err(StoreError::backend(EntityKind::Declaration, id))?;
        self.kv
            .put(record)
            .await
            .map_err(StoreError::backend(EntityKind::Declaration, id))?;

        log::info!(
            "stored declaration {} ({})",
            id,
            if existing.is_some() { "updated" } else { "created" }
        );

        self.invalidator()
            .declaration_changed(id)
            .await
            .map_err(StoreError::unpropagated(EntityKind::Declaration, id))?;
        Ok(StoreOutcome::Changed)
    }

    /// A stored declaration, with its current token set
    pub async fn retrieve_declaration(&self, declaration_id: &str) -> Result<Declaration, StoreError> {
        self.require_declaration_record(declaration_id)
            .await?
            .to_declaration()
    }

    /// Identifiers of every stored declaration
    pub async fn retrieve_declarations(&self) -> Result<Vec<String>, StoreError> {
        let records = self
            .kv
            .query_inverse_prefix(keys::DECLARATION_RECORD, keys::DECLARATION)
            .await
            .map_err(StoreError::backend(EntityKind::Declaration, "*"))?;
        Ok(records
            .iter()
            .filter_map(|r| keys::strip(&r.primary, keys::DECLARATION))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Delete a declaration and all of its group edges, then recompute
    /// every enrollment that could reach it.
    pub async fn delete_declaration(&self, declaration_id: &str) -> Result<(), StoreError> {
        require_id(EntityKind::Declaration, declaration_id)?;
        self.require_declaration_record(declaration_id).await?;

        let affected = self.graph().enrollments_of_declaration(declaration_id).await?;
        let removed = self.remove_declaration_and_edges(declaration_id).await;
        match &removed {
            Ok(()) => log::info!(
                "deleted declaration {}; recomputing {} enrollment(s)",
                declaration_id,
                affected.len()
            ),
            Err(e) => log::warn!(
                "delete of declaration {} stopped part way: {}; recomputing {} enrollment(s)",
                declaration_id,
                e,
                affected.len()
            ),
        }

        // Edges already removed are gone for good, so their enrollments are
        // recomputed even when the delete has to be repeated.
        let recomputed = self.invalidator().recompute_each(affected).await;
        removed?;
        recomputed?;
        Ok(())
    }

    async fn remove_declaration_and_edges(&self, declaration_id: &str) -> Result<(), StoreError> {
        for group in self.graph().groups_of_declaration(declaration_id).await? {
            self.unlink_group_declaration(&group, declaration_id).await?;
        }
        self.kv
            .delete(&keys::declaration(declaration_id), keys::DECLARATION_RECORD)
            .await
            .map_err(StoreError::backend(EntityKind::Declaration, declaration_id))?;
        Ok(())
    }

    /// The declaration's JSON as served to one enrollment.
    ///
    /// Fails with not-found unless the enrollment currently reaches the
    /// declaration through one of its groups.
    pub async fn retrieve_enrollment_declaration_json(
        &self,
        declaration_id: &str,
        enrollment_id: &str,
    ) -> Result<Vec<u8>, StoreError> {
        if !self
            .graph()
            .enrollment_reaches(enrollment_id, declaration_id)
            .await?
        {
            return Err(StoreError::not_found(EntityKind::Declaration, declaration_id));
        }
        let record = self.require_declaration_record(declaration_id).await?;
        Ok(record.json.into_bytes())
    }

    /// Enrollments that reach the declaration through some group
    pub async fn retrieve_declaration_enrollment_ids(
        &self,
        declaration_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .graph()
            .enrollments_of_declaration(declaration_id)
            .await?
            .into_iter()
            .collect())
    }
}
