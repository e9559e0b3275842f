//! Static intent validation against the action whitelist. Pure and
//! side-effect free; the narrator converts failures into rejected verdicts.

use std::collections::BTreeSet;
use std::fmt;

use contracts::{ActionWhitelist, ErrorCode, Intent, ReasonCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistError {
    UnknownAction { action: String },
    MissingParameters { names: Vec<String> },
    UnknownParameters { names: Vec<String> },
}

impl WhitelistError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::UnknownAction { .. } => ReasonCode::UnknownAction,
            Self::MissingParameters { .. } => ReasonCode::MissingParameter,
            Self::UnknownParameters { .. } => ReasonCode::UnknownParameter,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnknownAction { .. } => ErrorCode::UnknownAction,
            Self::MissingParameters { .. } => ErrorCode::MissingParameter,
            Self::UnknownParameters { .. } => ErrorCode::UnknownParameter,
        }
    }
}

impl fmt::Display for WhitelistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAction { action } => write!(f, "action not allowed: {action}"),
            Self::MissingParameters { names } => {
                write!(f, "missing required parameters: {}", names.join(","))
            }
            Self::UnknownParameters { names } => {
                write!(f, "unknown parameters: {}", names.join(","))
            }
        }
    }
}

impl std::error::Error for WhitelistError {}

/// Checks the intent's action and parameter keys and returns the intent
/// unchanged on success.
pub fn validate_intent<'a>(
    intent: &'a Intent,
    whitelist: &ActionWhitelist,
) -> Result<&'a Intent, WhitelistError> {
    let rule = whitelist
        .rule(&intent.action)
        .ok_or_else(|| WhitelistError::UnknownAction {
            action: intent.action.clone(),
        })?;

    let keys: BTreeSet<&str> = intent.parameters.keys().map(String::as_str).collect();
    let required: BTreeSet<&str> = rule.required.iter().map(String::as_str).collect();

    let missing: Vec<String> = required
        .difference(&keys)
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(WhitelistError::MissingParameters { names: missing });
    }

    let unknown: Vec<String> = keys
        .iter()
        .filter(|name| !rule.allows(name))
        .map(|name| name.to_string())
        .collect();
    if !unknown.is_empty() {
        return Err(WhitelistError::UnknownParameters { names: unknown });
    }

    Ok(intent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::ActionRule;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn whitelist() -> ActionWhitelist {
        ActionWhitelist {
            version: 1,
            actions: BTreeMap::from([(
                "move".to_string(),
                ActionRule {
                    required: vec!["to".to_string()],
                    optional: vec!["speed".to_string()],
                },
            )]),
        }
    }

    fn intent(action: &str, parameters: BTreeMap<String, serde_json::Value>) -> Intent {
        Intent::new("char:ansel", action, parameters, "flavor", 0)
    }

    #[test]
    fn valid_intent_passes_through_unchanged() {
        let candidate = intent(
            "move",
            BTreeMap::from([
                ("to".to_string(), json!("loc:ford")),
                ("speed".to_string(), json!("fast")),
            ]),
        );
        let validated = validate_intent(&candidate, &whitelist()).expect("valid");
        assert_eq!(validated, &candidate);
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let candidate = intent("move", BTreeMap::new());
        let err = validate_intent(&candidate, &whitelist()).unwrap_err();
        assert_eq!(err.reason_code(), ReasonCode::MissingParameter);
        assert_eq!(err.to_string(), "missing required parameters: to");
    }

    #[test]
    fn unknown_action_is_rejected() {
        let candidate = intent("fly", BTreeMap::from([("to".to_string(), json!("x"))]));
        let err = validate_intent(&candidate, &whitelist()).unwrap_err();
        assert_eq!(err.reason_code(), ReasonCode::UnknownAction);
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let candidate = intent(
            "move",
            BTreeMap::from([
                ("to".to_string(), json!("x")),
                ("cost".to_string(), json!(1)),
            ]),
        );
        let err = validate_intent(&candidate, &whitelist()).unwrap_err();
        assert_eq!(err.reason_code(), ReasonCode::UnknownParameter);
        assert_eq!(err.to_string(), "unknown parameters: cost");
    }

    #[test]
    fn unknown_parameter_names_are_sorted() {
        let candidate = intent(
            "move",
            BTreeMap::from([
                ("to".to_string(), json!("x")),
                ("zeal".to_string(), json!(1)),
                ("cost".to_string(), json!(1)),
            ]),
        );
        let err = validate_intent(&candidate, &whitelist()).unwrap_err();
        assert_eq!(err.to_string(), "unknown parameters: cost,zeal");
    }
}
