//! Derived document builders
//!
//! A builder turns the set of declarations reachable from an enrollment into
//! that enrollment's manifest and token documents. The store only relies on
//! the [`DocumentBuilder`] contract: accumulate zero or more declarations,
//! then finalize. Output must not depend on accumulation order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TokenHash;
use crate::declaration::Declaration;

#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("Rejected declaration {identifier}: {reason}")]
    Rejected { identifier: String, reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// The manifest and token documents of one enrollment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedDocuments {
    pub manifest: Vec<u8>,
    pub tokens: Vec<u8>,
}

/// Factory for build sessions
pub trait DocumentBuilder: Send + Sync {
    fn begin(&self) -> Box<dyn BuildSession + Send>;
}

/// One accumulation run producing a [`DerivedDocuments`]
pub trait BuildSession {
    fn add_declaration(&mut self, declaration: &Declaration) -> Result<(), BuilderError>;

    fn finalize(self: Box<Self>) -> Result<DerivedDocuments, BuilderError>;
}

/// Manifest category a declaration is listed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManifestCategory {
    Activations,
    Assets,
    Configurations,
    Management,
}

impl ManifestCategory {
    /// Classify a declaration type. Anything that is not an activation,
    /// asset or management declaration is listed as a configuration.
    pub fn of_type(declaration_type: &str) -> Self {
        if declaration_type.starts_with("com.apple.activation") {
            ManifestCategory::Activations
        } else if declaration_type.starts_with("com.apple.asset") {
            ManifestCategory::Assets
        } else if declaration_type.starts_with("com.apple.management") {
            ManifestCategory::Management
        } else {
            ManifestCategory::Configurations
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestItem {
    pub identifier: String,
    pub server_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestDeclarations {
    pub activations: Vec<ManifestItem>,
    pub assets: Vec<ManifestItem>,
    pub configurations: Vec<ManifestItem>,
    pub management: Vec<ManifestItem>,
}

impl ManifestDeclarations {
    /// Every listed item regardless of category
    pub fn all(&self) -> impl Iterator<Item = &ManifestItem> {
        self.activations
            .iter()
            .chain(&self.assets)
            .chain(&self.configurations)
            .chain(&self.management)
    }
}

/// Manifest document: every applicable declaration with its token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeclarationItems {
    pub declarations: ManifestDeclarations,
    pub declarations_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncTokens {
    pub declarations_token: String,
}

/// Token document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokensResponse {
    pub sync_tokens: SyncTokens,
}

/// Default builder producing declaration-items and tokens JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclarationItemsBuilder {
    hash: TokenHash,
}

impl DeclarationItemsBuilder {
    pub fn new(hash: TokenHash) -> Self {
        Self { hash }
    }
}

impl DocumentBuilder for DeclarationItemsBuilder {
    fn begin(&self) -> Box<dyn BuildSession + Send> {
        Box::new(DeclarationItemsSession {
            hash: self.hash,
            items: BTreeMap::new(),
        })
    }
}

struct DeclarationItemsSession {
    hash: TokenHash,
    /// identifier -> (category, token); ordered so output is stable
    items: BTreeMap<String, (ManifestCategory, String)>,
}

impl BuildSession for DeclarationItemsSession {
    fn add_declaration(&mut self, declaration: &Declaration) -> Result<(), BuilderError> {
        if declaration.server_token.is_empty() {
            return Err(BuilderError::Rejected {
                identifier: declaration.identifier.clone(),
                reason: "declaration has no server token".to_string(),
            });
        }
        self.items.insert(
            declaration.identifier.clone(),
            (
                ManifestCategory::of_type(&declaration.declaration_type),
                declaration.server_token.clone(),
            ),
        );
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<DerivedDocuments, BuilderError> {
        let mut declarations = ManifestDeclarations::default();
        let mut token_input = Vec::new();

        for (identifier, (category, token)) in &self.items {
            let item = ManifestItem {
                identifier: identifier.clone(),
                server_token: token.clone(),
            };
            match category {
                ManifestCategory::Activations => declarations.activations.push(item),
                ManifestCategory::Assets => declarations.assets.push(item),
                ManifestCategory::Configurations => declarations.configurations.push(item),
                ManifestCategory::Management => declarations.management.push(item),
            }
            token_input.extend_from_slice(identifier.as_bytes());
            token_input.push(0);
            token_input.extend_from_slice(token.as_bytes());
            token_input.push(0);
        }

        let declarations_token = self.hash.hex_digest(&[&token_input]);

        let manifest = DeclarationItems {
            declarations,
            declarations_token: declarations_token.clone(),
        };
        let tokens = TokensResponse {
            sync_tokens: SyncTokens { declarations_token },
        };

        Ok(DerivedDocuments {
            manifest: serde_json::to_vec(&manifest)
                .map_err(|e| BuilderError::SerializationError(e.to_string()))?,
            tokens: serde_json::to_vec(&tokens)
                .map_err(|e| BuilderError::SerializationError(e.to_string()))?,
        })
    }
}
