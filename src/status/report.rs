//! Status report parsing
//!
//! Turns the JSON body a device posts into the three kinds of entries the
//! merge engine stores. The `StatusItems` tree is flattened into one value
//! per leaf, except for `management.declarations`, whose entries become
//! per-declaration statuses. Top-level `Errors` become error entries.

use serde_json::{Map, Value};

use super::{DeclarationStatus, StatusError, StatusValue};
use crate::error::StoreError;

const STATUS_ITEMS: &str = "StatusItems";
const ERRORS: &str = "Errors";
const ERROR_PATH: &str = "StatusItem";

/// A parsed status report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub raw: Vec<u8>,
    pub declarations: Vec<DeclarationStatus>,
    pub values: Vec<StatusValue>,
    pub errors: Vec<StatusError>,
}

impl StatusReport {
    pub fn parse(raw: &[u8]) -> Result<Self, StoreError> {
        let document = match serde_json::from_slice::<Value>(raw) {
            Ok(Value::Object(document)) => document,
            Ok(_) => return Err(StoreError::validation("status report", "not a JSON object")),
            Err(e) => return Err(StoreError::validation("status report", e)),
        };

        let mut report = StatusReport {
            raw: raw.to_vec(),
            ..Default::default()
        };

        match document.get(STATUS_ITEMS) {
            None | Some(Value::Null) => {}
            Some(Value::Object(items)) => {
                let path = format!(".{}", STATUS_ITEMS);
                report.walk_object(&path, items, &[])?;
            }
            Some(_) => {
                return Err(StoreError::validation(
                    "status report",
                    "StatusItems is not an object",
                ))
            }
        }

        if let Some(errors) = document.get(ERRORS) {
            let errors = errors.as_array().ok_or_else(|| {
                StoreError::validation("status report", "Errors is not an array")
            })?;
            for error in errors {
                let path = error
                    .get(ERROR_PATH)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                report.errors.push(StatusError {
                    path,
                    body: error.to_string(),
                });
            }
        }

        Ok(report)
    }

    /// Walk an object below `path`. `keys` is the chain of object keys from
    /// `StatusItems` down to this object.
    fn walk_object(
        &mut self,
        path: &str,
        object: &Map<String, Value>,
        keys: &[&str],
    ) -> Result<(), StoreError> {
        if keys == ["management", "declarations"] {
            return self.read_declarations(object);
        }

        for (key, value) in object {
            let child_path = format!("{}.{}", path, key);
            let mut child_keys = keys.to_vec();
            child_keys.push(key);
            self.walk_value(&child_path, value, &child_keys, "object")?;
        }
        Ok(())
    }

    fn walk_value(
        &mut self,
        path: &str,
        value: &Value,
        keys: &[&str],
        container_type: &str,
    ) -> Result<(), StoreError> {
        match value {
            Value::Object(object) => self.walk_object(path, object, keys),
            Value::Array(elements) => {
                for element in elements {
                    self.walk_value(path, element, keys, "array")?;
                }
                Ok(())
            }
            leaf => {
                self.values.push(StatusValue {
                    path: path.to_string(),
                    container_type: container_type.to_string(),
                    value_type: value_type(leaf).to_string(),
                    value: match leaf {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                });
                Ok(())
            }
        }
    }

    /// Read `management.declarations`, one array per manifest category.
    fn read_declarations(&mut self, categories: &Map<String, Value>) -> Result<(), StoreError> {
        for (manifest_type, entries) in categories {
            let entries = entries.as_array().ok_or_else(|| {
                StoreError::validation(
                    "status report",
                    format!("declarations.{} is not an array", manifest_type),
                )
            })?;
            for entry in entries {
                self.declarations
                    .push(parse_declaration_status(manifest_type, entry)?);
            }
        }
        Ok(())
    }
}

fn parse_declaration_status(manifest_type: &str, entry: &Value) -> Result<DeclarationStatus, StoreError> {
    let identifier = entry
        .get("identifier")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            StoreError::validation(
                "status report",
                format!("{} declaration status without identifier", manifest_type),
            )
        })?;

    let text = |field: &str| {
        entry
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Ok(DeclarationStatus {
        identifier: identifier.to_string(),
        active: entry.get("active").and_then(Value::as_bool).unwrap_or(false),
        valid: text("valid"),
        server_token: text("server-token"),
        manifest_type: manifest_type.to_string(),
        reasons: entry.get("reasons").filter(|r| !r.is_null()).cloned(),
    })
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{
        "StatusItems": {
            "device": {
                "model": {"family": "Mac", "marketing-name": "MacBook"},
                "operating-system": {"version": "14.1", "supplemental": {"build-version": "23B"}}
            },
            "management": {
                "client-capabilities": {"supported-versions": ["1.0", "2.0"]},
                "declarations": {
                    "activations": [
                        {"active": true, "identifier": "act1", "valid": "valid", "server-token": "t1"}
                    ],
                    "configurations": [
                        {"active": false, "identifier": "cfg1", "valid": "invalid", "server-token": "t2",
                         "reasons": [{"code": "Error.ConfigurationCannotBeApplied"}]}
                    ],
                    "assets": [],
                    "management": []
                }
            },
            "passcode": {"is-compliant": true}
        },
        "Errors": [
            {"StatusItem": "softwareupdate.install-state", "Reasons": [{"code": "x"}]}
        ]
    }"#;

    #[test]
    fn test_parse_full_report() {
        let report = StatusReport::parse(REPORT.as_bytes()).unwrap();

        assert_eq!(report.declarations.len(), 2);
        let cfg = report
            .declarations
            .iter()
            .find(|d| d.identifier == "cfg1")
            .unwrap();
        assert_eq!(cfg.manifest_type, "configurations");
        assert!(!cfg.active);
        assert_eq!(cfg.valid, "invalid");
        assert_eq!(cfg.server_token, "t2");
        assert!(cfg.reasons.is_some());

        let family = report
            .values
            .iter()
            .find(|v| v.path == ".StatusItems.device.model.family")
            .unwrap();
        assert_eq!(family.value, "Mac");
        assert_eq!(family.value_type, "string");
        assert_eq!(family.container_type, "object");

        let compliant = report
            .values
            .iter()
            .find(|v| v.path == ".StatusItems.passcode.is-compliant")
            .unwrap();
        assert_eq!(compliant.value, "true");
        assert_eq!(compliant.value_type, "boolean");

        let versions: Vec<_> = report
            .values
            .iter()
            .filter(|v| v.path == ".StatusItems.management.client-capabilities.supported-versions")
            .collect();
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().all(|v| v.container_type == "array"));

        assert!(report
            .values
            .iter()
            .all(|v| !v.path.contains("management.declarations")));

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].path, "softwareupdate.install-state");
        assert!(report.errors[0].body.contains("Reasons"));
    }

    #[test]
    fn test_empty_report() {
        let report = StatusReport::parse(b"{}").unwrap();
        assert!(report.declarations.is_empty());
        assert!(report.values.is_empty());
        assert!(report.errors.is_empty());
        assert_eq!(report.raw, b"{}");
    }

    #[test]
    fn test_malformed_reports() {
        assert!(StatusReport::parse(b"nope").is_err());
        assert!(StatusReport::parse(br#"{"StatusItems": 4}"#).is_err());
        assert!(StatusReport::parse(br#"{"Errors": {}}"#).is_err());
        assert!(StatusReport::parse(
            br#"{"StatusItems":{"management":{"declarations":{"activations":[{"active":true}]}}}}"#
        )
        .is_err());
    }
}
