use std::fmt;

use thiserror::Error;

use crate::builder::BuilderError;
use crate::kv::KvError;

/// The kind of entity an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Declaration,
    Group,
    Enrollment,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Declaration => write!(f, "declaration"),
            EntityKind::Group => write!(f, "group"),
            EntityKind::Enrollment => write!(f, "enrollment"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {kind} {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Validation failure ({context}): {reason}")]
    Validation { context: String, reason: String },

    #[error("Backing store failure on {kind} {id}: {source}")]
    Backend {
        kind: EntityKind,
        id: String,
        #[source]
        source: KvError,
    },

    #[error("Builder failure for enrollment {enrollment}: {source}")]
    Builder {
        enrollment: String,
        #[source]
        source: BuilderError,
    },

    #[error("Salt generation failed: {0}")]
    Salt(String),

    #[error("{0}")]
    Cascade(CascadeFailure),

    /// The mutation on `kind` `id` was committed, but the enrollments it
    /// affects could not be worked out, so none were recomputed.
    #[error("{kind} {id} committed but its cascade did not run: {source}")]
    Unpropagated {
        kind: EntityKind,
        id: String,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    pub(crate) fn backend(kind: EntityKind, id: &str) -> impl FnOnce(KvError) -> StoreError + '_ {
        move |source| StoreError::Backend {
            kind,
            id: id.to_string(),
            source,
        }
    }

    pub(crate) fn not_found(kind: EntityKind, id: &str) -> StoreError {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn validation(context: impl Into<String>, reason: impl fmt::Display) -> StoreError {
        StoreError::Validation {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Whether the mutation that returned this error was committed. Such
    /// errors call for a recompute, not for repeating the mutation.
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            StoreError::Cascade(_) | StoreError::Unpropagated { .. }
        )
    }

    /// Attribute a cascade error to the committed mutation on `kind` `id`.
    /// Per-enrollment failures already say what to retry and pass through.
    pub(crate) fn unpropagated(
        kind: EntityKind,
        id: &str,
    ) -> impl FnOnce(StoreError) -> StoreError + '_ {
        move |source| match source {
            StoreError::Cascade(_) => source,
            source => StoreError::Unpropagated {
                kind,
                id: id.to_string(),
                source: Box::new(source),
            },
        }
    }
}

/// Outcome of a cascade in which at least one enrollment failed to
/// recompute.
///
/// The mutation that triggered the cascade has already been committed, as
/// have the documents of every enrollment listed in `recomputed`. Each
/// entry in `failures` can be retried on its own with
/// [`crate::DdmStore::recompute_enrollment`].
#[derive(Debug)]
pub struct CascadeFailure {
    pub recomputed: Vec<String>,
    pub failures: Vec<(String, StoreError)>,
}

impl CascadeFailure {
    pub fn failed_enrollments(&self) -> Vec<&str> {
        self.failures.iter().map(|(id, _)| id.as_str()).collect()
    }
}

impl fmt::Display for CascadeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cascade incomplete: {} enrollment(s) failed to recompute",
            self.failures.len()
        )?;
        for (id, err) in &self.failures {
            write!(f, "; {}: {}", id, err)?;
        }
        Ok(())
    }
}
