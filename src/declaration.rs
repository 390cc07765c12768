//! Declarations and their change tokens
//!
//! A declaration's token is a salted hash of its canonical JSON with the
//! token field removed. The salt is drawn once, when the declaration is
//! first stored, and reused for every later store of the same identifier,
//! so identical content always hashes to the identical token while the
//! token stays unguessable from the content alone.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::TokenHash;
use crate::error::StoreError;

/// Field carrying the change token inside a declaration document
pub const SERVER_TOKEN: &str = "ServerToken";

const IDENTIFIER: &str = "Identifier";
const TYPE: &str = "Type";
const PAYLOAD: &str = "Payload";

/// A parsed declaration
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub identifier: String,
    pub declaration_type: String,
    pub server_token: String,
    pub payload: Value,
    pub raw: Vec<u8>,
}

impl Declaration {
    /// Parse a raw declaration document.
    ///
    /// The document must be a JSON object with non-empty string
    /// `Identifier` and `Type` fields. `Payload`, if present, must be an
    /// object.
    pub fn parse(raw: &[u8]) -> Result<Self, StoreError> {
        let document = parse_object(raw)?;
        Self::from_object(&document, raw.to_vec())
    }

    fn from_object(document: &Map<String, Value>, raw: Vec<u8>) -> Result<Self, StoreError> {
        let identifier = required_string(document, IDENTIFIER)?;
        let declaration_type = required_string(document, TYPE)?;

        let payload = match document.get(PAYLOAD) {
            None | Some(Value::Null) => Value::Null,
            Some(Value::Object(payload)) => Value::Object(payload.clone()),
            Some(_) => {
                return Err(StoreError::validation(
                    format!("declaration {}", identifier),
                    "Payload must be an object",
                ))
            }
        };

        let server_token = document
            .get(SERVER_TOKEN)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            identifier,
            declaration_type,
            server_token,
            payload,
            raw,
        })
    }
}

/// Stored form of a declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DeclarationRecord {
    /// Declaration JSON including its current token
    pub json: String,
    pub token: String,
    pub declaration_type: String,
    /// Hex-encoded creation salt
    pub salt: String,
}

impl DeclarationRecord {
    pub fn salt_bytes(&self) -> Result<Vec<u8>, StoreError> {
        hex::decode(&self.salt).map_err(|e| StoreError::validation("stored salt", e))
    }

    pub fn to_declaration(&self) -> Result<Declaration, StoreError> {
        Declaration::parse(self.json.as_bytes())
    }
}

/// Parse `raw` into a JSON object.
pub(crate) fn parse_object(raw: &[u8]) -> Result<Map<String, Value>, StoreError> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(document)) => Ok(document),
        Ok(_) => Err(StoreError::validation(
            "declaration",
            "document is not a JSON object",
        )),
        Err(e) => Err(StoreError::validation("declaration", e)),
    }
}

fn required_string(document: &Map<String, Value>, field: &str) -> Result<String, StoreError> {
    match document.get(field).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(StoreError::validation(
            "declaration",
            format!("missing or empty {}", field),
        )),
    }
}

/// Compute the change token of `document` under `salt`.
///
/// Any existing token field is ignored. Objects serialize with sorted keys,
/// which makes the byte form canonical.
pub fn content_token(
    document: &Map<String, Value>,
    salt: &[u8],
    hash: TokenHash,
) -> Result<String, StoreError> {
    let mut stripped = document.clone();
    stripped.remove(SERVER_TOKEN);

    let canonical = serde_json::to_vec(&stripped)
        .map_err(|e| StoreError::validation("declaration", e))?;
    Ok(hash.hex_digest(&[&canonical, salt]))
}

/// Serialize `document` with `token` set as its token field.
pub(crate) fn with_token(
    document: &Map<String, Value>,
    token: &str,
) -> Result<String, StoreError> {
    let mut tokenized = document.clone();
    tokenized.insert(SERVER_TOKEN.to_string(), Value::String(token.to_string()));
    serde_json::to_string(&tokenized).map_err(|e| StoreError::validation("declaration", e))
}
