//! Action whitelist contracts shared by the validator and the loader.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::{Error as DeError, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{ErrorCode, KernelError};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActionRule {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

impl ActionRule {
    /// Required and optional sets must not overlap and must not repeat.
    pub fn validate(&self, action: &str) -> Result<(), KernelError> {
        let mut seen = BTreeSet::new();
        for param in self.required.iter().chain(self.optional.iter()) {
            if !seen.insert(param.as_str()) {
                return Err(KernelError::new(
                    ErrorCode::InvalidConfig,
                    format!("action {action}: duplicated parameter {param}"),
                ));
            }
        }
        Ok(())
    }

    pub fn allows(&self, param: &str) -> bool {
        self.required.iter().any(|name| name == param)
            || self.optional.iter().any(|name| name == param)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActionWhitelist {
    pub version: u32,
    #[serde(deserialize_with = "deserialize_actions")]
    pub actions: BTreeMap<String, ActionRule>,
}

/// A duplicated action key in the source document must fail loudly, not
/// silently keep the last entry, so the map is built entry by entry.
fn deserialize_actions<'de, D>(deserializer: D) -> Result<BTreeMap<String, ActionRule>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ActionMapVisitor;

    impl<'de> Visitor<'de> for ActionMapVisitor {
        type Value = BTreeMap<String, ActionRule>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a mapping of action name to parameter rule")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut actions = BTreeMap::new();
            while let Some((action, rule)) = access.next_entry::<String, ActionRule>()? {
                if actions.insert(action.clone(), rule).is_some() {
                    return Err(A::Error::custom(format!("duplicated action key: {action}")));
                }
            }
            Ok(actions)
        }
    }

    deserializer.deserialize_map(ActionMapVisitor)
}

impl ActionWhitelist {
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.version < 1 {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                format!("whitelist version must be >= 1, got {}", self.version),
            ));
        }
        if self.actions.is_empty() {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                "whitelist must declare at least one action",
            ));
        }
        for (action, rule) in &self.actions {
            rule.validate(action)?;
        }
        Ok(())
    }

    pub fn rule(&self, action: &str) -> Option<&ActionRule> {
        self.actions.get(action)
    }
}
