//! JSON Schema validation for policy files.
//!
//! The schema covers structure only (required fields, types, no unknown
//! keys). Value rules such as threshold range and id uniqueness are checked
//! afterwards so they surface as typed [`ConfigError`](super::ConfigError)s.

use std::sync::OnceLock;

/// Embedded policy file schema (loaded at compile time).
const POLICY_SCHEMA_JSON: &str = include_str!("../../schemas/policy_file.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

fn get_validator() -> Result<&'static jsonschema::Validator, String> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(POLICY_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;

        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result.as_ref().map_err(|e| e.clone())
}

/// Validate a policy file value against the schema.
///
/// Returns every violation found, each formatted as `message at /path`.
pub fn validate_policy_schema(value: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e])?;

    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
