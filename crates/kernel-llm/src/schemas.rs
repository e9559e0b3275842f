//! Structured-output validation for the fixed response shapes.

use contracts::{DecisionResponse, IntentResponse, ProviderHealth, ResponseSchema};
use serde_json::Value;

/// Validates a raw payload against one of the fixed schemas and returns the
/// normalized value (re-serialized from the typed form, so downstream
/// consumers always see canonical field sets).
pub fn validate_structured(schema: ResponseSchema, payload: &Value) -> Result<Value, String> {
    match schema {
        ResponseSchema::Intent => normalize::<IntentResponse>(payload),
        ResponseSchema::Decision => normalize::<DecisionResponse>(payload),
        ResponseSchema::Health => normalize::<ProviderHealth>(payload),
    }
}

fn normalize<T>(payload: &Value) -> Result<Value, String>
where
    T: serde::de::DeserializeOwned + serde::Serialize,
{
    let typed: T = serde_json::from_value(payload.clone())
        .map_err(|err| format!("validation failed: {err}"))?;
    serde_json::to_value(typed).map_err(|err| format!("normalization failed: {err}"))
}

/// Builds the schema-instruction suffix appended to user prompts for
/// providers without native structured output.
pub(crate) fn schema_instruction(schema: ResponseSchema) -> String {
    format!(
        "\n\nRespond with a valid JSON object matching this schema: {}",
        schema.prompt_schema()
    )
}

pub(crate) fn parse_json_body(content: &str) -> Result<Value, String> {
    serde_json::from_str::<Value>(content).map_err(|err| format!("invalid JSON in response: {err}"))
}
