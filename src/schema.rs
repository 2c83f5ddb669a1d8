use jsonschema::validator_for;
use serde_json::Value;

use crate::error::ServerError;

/// Validate tool-call arguments against the tool's declared input schema
/// (JSON Schema, draft 2020-12). Runs before the handler is dispatched.
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), ServerError> {
    // An absent or trivially-empty schema accepts anything; skip compilation.
    if schema.is_null() || schema.as_object().is_some_and(|m| m.is_empty()) {
        return Ok(());
    }

    let validator = validator_for(schema)
        .map_err(|e| ServerError::Internal(format!("input schema failed to compile: {e}")))?;

    if let Some(err) = validator.iter_errors(args).next() {
        return Err(ServerError::InvalidArguments(format!(
            "{} (at {})",
            err,
            err.instance_path()
        )));
    }
    Ok(())
}
