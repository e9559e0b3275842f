//! Kernel configuration tree. Loaded from YAML by the CLI; every section
//! rejects unknown keys so typos fail loudly at startup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{serde_u64_string, ErrorCode, Granularity, KernelError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    #[serde(with = "serde_u64_string")]
    pub seed: u64,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub narrator: NarratorConfig,
    pub llm: LlmConfig,
    #[serde(default = "default_whitelist_path")]
    pub whitelist: String,
    #[serde(default)]
    pub event_log: EventLogConfig,
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), KernelError> {
        self.clock.validate()?;
        self.narrator.validate()?;
        self.llm.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClockConfig {
    #[serde(default)]
    pub start_tick: i64,
    #[serde(default = "default_clock_step")]
    pub default_step: i64,
}

impl ClockConfig {
    fn validate(&self) -> Result<(), KernelError> {
        if self.start_tick < 0 {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                format!("clock.start_tick must be >= 0, got {}", self.start_tick),
            ));
        }
        if self.default_step <= 0 {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                format!("clock.default_step must be > 0, got {}", self.default_step),
            ));
        }
        Ok(())
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            start_tick: 0,
            default_step: default_clock_step(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NarratorConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(default = "default_granularity_steps")]
    pub granularity_steps: BTreeMap<Granularity, u64>,
    #[serde(default = "default_tick_deadline_ms")]
    pub tick_deadline_ms: u64,
    #[serde(default = "default_fallback_table")]
    pub fallback: BTreeMap<String, FallbackIntent>,
    #[serde(default = "default_threshold_active")]
    pub threshold_active: f64,
    #[serde(default = "default_threshold_passive")]
    pub threshold_passive: f64,
}

impl NarratorConfig {
    fn validate(&self) -> Result<(), KernelError> {
        if self.tick_deadline_ms == 0 {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                "narrator.tick_deadline_ms must be > 0",
            ));
        }
        for (granularity, step) in &self.granularity_steps {
            if *step == 0 {
                return Err(KernelError::new(
                    ErrorCode::InvalidConfig,
                    format!(
                        "narrator.granularity_steps.{} must be > 0",
                        granularity.as_str()
                    ),
                ));
            }
        }
        if !self.fallback.contains_key("default") {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                "narrator.fallback must contain a default entry",
            ));
        }
        if self.threshold_active <= self.threshold_passive {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                "narrator.threshold_active must be greater than threshold_passive",
            ));
        }
        Ok(())
    }

    pub fn step_for(&self, granularity: Granularity) -> u64 {
        self.granularity_steps
            .get(&granularity)
            .copied()
            .unwrap_or_else(|| granularity.default_step())
    }

    pub fn fallback_for(&self, context_class: &str) -> &FallbackIntent {
        self.fallback
            .get(context_class)
            .or_else(|| self.fallback.get("default"))
            .expect("fallback table validated to contain a default entry")
    }
}

impl Default for NarratorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            granularity: default_granularity(),
            granularity_steps: default_granularity_steps(),
            tick_deadline_ms: default_tick_deadline_ms(),
            fallback: default_fallback_table(),
            threshold_active: default_threshold_active(),
            threshold_passive: default_threshold_passive(),
        }
    }
}

/// A known-safe intent the narrator can commit without re-consulting the
/// whitelist. Kept as data so the loop has no per-action special cases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FallbackIntent {
    pub action: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default = "default_fallback_flavor")]
    pub flavor_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    pub default_provider: String,
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl LlmConfig {
    fn validate(&self) -> Result<(), KernelError> {
        if self.providers.is_empty() {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                "llm.providers must not be empty",
            ));
        }
        if !self.providers.contains_key(&self.default_provider) {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                format!(
                    "llm.default_provider {} is not a configured provider",
                    self.default_provider
                ),
            ));
        }
        for (id, provider) in &self.providers {
            provider.validate(id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

impl ProviderConfig {
    fn validate(&self, id: &str) -> Result<(), KernelError> {
        if self.model.is_empty() {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                format!("llm.providers.{id}.model must not be empty"),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                format!("llm.providers.{id}.timeout_ms must be > 0"),
            ));
        }
        let needs_key = matches!(self.kind, ProviderKind::Openai | ProviderKind::Anthropic);
        if needs_key && self.api_key_env.is_none() {
            return Err(KernelError::new(
                ErrorCode::InvalidConfig,
                format!("llm.providers.{id}.api_key_env is required for {}", self.kind.as_str()),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EventLogConfig {
    #[serde(default = "default_event_log_path")]
    pub path: String,
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: default_event_log_path(),
            sqlite_path: None,
        }
    }
}

fn default_clock_step() -> i64 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_granularity() -> Granularity {
    Granularity::Day
}

fn default_granularity_steps() -> BTreeMap<Granularity, u64> {
    let mut steps = BTreeMap::new();
    for granularity in [
        Granularity::Immediate,
        Granularity::Day,
        Granularity::Month,
        Granularity::Year,
    ] {
        steps.insert(granularity, granularity.default_step());
    }
    steps
}

fn default_tick_deadline_ms() -> u64 {
    120_000
}

fn default_fallback_table() -> BTreeMap<String, FallbackIntent> {
    let mut table = BTreeMap::new();
    table.insert(
        "default".to_string(),
        FallbackIntent {
            action: "wait".to_string(),
            parameters: BTreeMap::new(),
            flavor_text: default_fallback_flavor(),
        },
    );
    table.insert(
        "traveling".to_string(),
        FallbackIntent {
            action: "rest".to_string(),
            parameters: BTreeMap::new(),
            flavor_text: "They make camp where they stand.".to_string(),
        },
    );
    table
}

fn default_fallback_flavor() -> String {
    "They idle in their current location.".to_string()
}

fn default_threshold_active() -> f64 {
    0.7
}

fn default_threshold_passive() -> f64 {
    0.3
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

fn default_whitelist_path() -> String {
    "config/action_whitelist.yaml".to_string()
}

fn default_event_log_path() -> String {
    "data/events.jsonl".to_string()
}
