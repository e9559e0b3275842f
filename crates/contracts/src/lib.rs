//! v1 cross-boundary contracts for the narrator kernel, LLM layer,
//! persistence, and CLI.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod actions;
pub mod config;
pub mod llm;
pub mod serde_u64_string;

pub use actions::{ActionRule, ActionWhitelist};
pub use config::{
    ClockConfig, EventLogConfig, FallbackIntent, KernelConfig, LlmConfig, NarratorConfig,
    ProviderConfig, ProviderKind,
};
pub use llm::{
    DecisionResponse, IntentResponse, LlmRequest, LlmResponse, ProviderHealth, ResponseSchema,
};

pub const SCHEMA_VERSION_V1: &str = "1.0";
pub const TICKS_PER_DAY: u64 = 24;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateMode {
    Active,
    Passive,
    Dormant,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Immediate,
    Day,
    Month,
    Year,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    pub fn default_step(self) -> u64 {
        match self {
            Self::Immediate => 1,
            Self::Day => TICKS_PER_DAY,
            Self::Month => 30 * TICKS_PER_DAY,
            Self::Year => 360 * TICKS_PER_DAY,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approved,
    Rejected,
}

/// Reason codes attached to rejected verdicts and fallback outcomes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    UnknownAction,
    MissingParameter,
    UnknownParameter,
    InvalidIntent,
    Timeout,
    ProviderError,
    DmRejected,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownAction => "unknown-action",
            Self::MissingParameter => "missing-parameter",
            Self::UnknownParameter => "unknown-parameter",
            Self::InvalidIntent => "invalid-intent",
            Self::Timeout => "timeout",
            Self::ProviderError => "provider-error",
            Self::DmRejected => "dm-rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub state_mode: StateMode,
    pub location_id: String,
    pub narrative_importance: f64,
    pub last_active_tick: u64,
    #[serde(default)]
    pub status_effects: Vec<String>,
    #[serde(default)]
    pub visibility: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Character {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        location_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state_mode: StateMode::Passive,
            location_id: location_id.into(),
            narrative_importance: 0.5,
            last_active_tick: 0,
            status_effects: Vec::new(),
            visibility: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_state_mode(mut self, state_mode: StateMode) -> Self {
        self.state_mode = state_mode;
        self
    }

    pub fn with_importance(mut self, narrative_importance: f64) -> Self {
        self.narrative_importance = narrative_importance.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldState {
    pub tick: u64,
    #[serde(with = "serde_u64_string")]
    pub seed: u64,
    pub granularity: Granularity,
    pub characters: BTreeMap<String, Character>,
    #[serde(default)]
    pub phenology: BTreeMap<String, f64>,
    #[serde(default)]
    pub resources: BTreeMap<String, f64>,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
}

impl WorldState {
    /// Builds a snapshot, rejecting character maps whose key does not match
    /// the character's own id.
    pub fn new(
        tick: u64,
        seed: u64,
        granularity: Granularity,
        characters: BTreeMap<String, Character>,
    ) -> Result<Self, KernelError> {
        for (key, character) in &characters {
            if key != &character.id {
                return Err(KernelError::new(
                    ErrorCode::InvalidArgument,
                    format!("character key mismatch: {} != {}", key, character.id),
                ));
            }
        }
        Ok(Self {
            tick,
            seed,
            granularity,
            characters,
            phenology: BTreeMap::new(),
            resources: BTreeMap::new(),
            flags: BTreeMap::new(),
        })
    }

    pub fn character(&self, id: &str) -> Option<&Character> {
        self.characters.get(id)
    }

    pub fn character_ids(&self) -> Vec<String> {
        self.characters.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub character_id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    pub flavor_text: String,
    pub attempt: u32,
}

impl Intent {
    pub fn new(
        character_id: impl Into<String>,
        action: impl Into<String>,
        parameters: BTreeMap<String, Value>,
        flavor_text: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            character_id: character_id.into(),
            action: action.into(),
            parameters,
            flavor_text: flavor_text.into(),
            attempt,
        }
    }
}

/// One structured field mutation produced by a rule hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChange {
    pub path: String,
    pub before: Value,
    pub after: Value,
    pub reason: String,
}

impl StateChange {
    pub fn new(
        path: impl Into<String>,
        before: Value,
        after: Value,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            before,
            after,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleExecutionRecord {
    pub rule_id: String,
    pub priority: i32,
    pub registration_index: usize,
    pub matched: bool,
    pub miss_reason: Option<String>,
    pub context_digest: String,
    pub changes: Option<Vec<StateChange>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptKind {
    HaltTick,
    WakeCharacter,
    Advisory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptSignal {
    pub kind: InterruptKind,
    pub rule_id: String,
    pub payload: Value,
}

impl InterruptSignal {
    pub fn new(kind: InterruptKind, rule_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            rule_id: rule_id.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outcome {
    pub verdict: Verdict,
    pub result: Value,
    pub rule_trace: Vec<RuleExecutionRecord>,
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<ReasonCode>,
}

impl Outcome {
    pub fn resolved(verdict: Verdict, result: Value, rule_trace: Vec<RuleExecutionRecord>) -> Self {
        Self {
            verdict,
            result,
            rule_trace,
            fallback: false,
            fallback_reason: None,
        }
    }

    pub fn fallback(
        verdict: Verdict,
        result: Value,
        rule_trace: Vec<RuleExecutionRecord>,
        fallback_reason: ReasonCode,
    ) -> Self {
        Self {
            verdict,
            result,
            rule_trace,
            fallback: true,
            fallback_reason: Some(fallback_reason),
        }
    }
}

/// One entry of an event's verdict chain. `intent` is absent when the
/// provider failed before producing one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
}

impl AttemptRecord {
    pub fn approved(intent: Intent) -> Self {
        Self {
            intent: Some(intent),
            verdict: Verdict::Approved,
            reason: None,
        }
    }

    pub fn rejected(intent: Intent, reason: ReasonCode) -> Self {
        Self {
            intent: Some(intent),
            verdict: Verdict::Rejected,
            reason: Some(reason),
        }
    }

    pub fn failed(reason: ReasonCode) -> Self {
        Self {
            intent: None,
            verdict: Verdict::Rejected,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalRecord {
    pub intent: Intent,
    pub outcome: Outcome,
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<ReasonCode>,
}

impl FinalRecord {
    pub fn from_outcome(intent: Intent, outcome: Outcome) -> Self {
        let fallback = outcome.fallback;
        let fallback_reason = outcome.fallback_reason;
        Self {
            intent,
            outcome,
            fallback,
            fallback_reason,
        }
    }
}

/// One committed character event, appended exactly once at tick close.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub schema_version: String,
    pub tick: u64,
    pub character_id: String,
    pub attempts: Vec<AttemptRecord>,
    #[serde(rename = "final")]
    pub final_record: FinalRecord,
    pub seed_labels: Vec<String>,
    pub token_usage: TokenUsage,
}

impl Event {
    pub fn new(
        tick: u64,
        character_id: impl Into<String>,
        attempts: Vec<AttemptRecord>,
        final_record: FinalRecord,
        seed_labels: Vec<String>,
        token_usage: TokenUsage,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            tick,
            character_id: character_id.into(),
            attempts,
            final_record,
            seed_labels,
            token_usage,
        }
    }
}

/// A single line of the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub enum EventRecord {
    Event(Event),
    TickAborted {
        tick: u64,
        aborted: bool,
        error_code: ErrorCode,
        message: String,
    },
}

impl EventRecord {
    pub fn tick(&self) -> u64 {
        match self {
            Self::Event(event) => event.tick,
            Self::TickAborted { tick, .. } => *tick,
        }
    }

    pub fn aborted(tick: u64, error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self::TickAborted {
            tick,
            aborted: true,
            error_code,
            message: message.into(),
        }
    }
}

/// Per-tick bookkeeping the driver can poll between ticks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickSummary {
    pub tick: u64,
    pub granularity: Granularity,
    pub granularity_rationale: String,
    pub active_characters: u64,
    pub passive_characters: u64,
    pub dormant_characters: u64,
    pub events_appended: u64,
    pub halted: bool,
}

impl fmt::Display for TickSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tick={} granularity={} active={} passive={} dormant={} events={}{}",
            self.tick,
            self.granularity.as_str(),
            self.active_characters,
            self.passive_characters,
            self.dormant_characters,
            self.events_appended,
            if self.halted { " halted" } else { "" }
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidConfig,
    InvalidArgument,
    UnknownAction,
    MissingParameter,
    UnknownParameter,
    ProviderUnavailable,
    ProviderValidation,
    ProviderError,
    RuleError,
    InterruptError,
    IoError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::UnknownAction => "UNKNOWN_ACTION",
            Self::MissingParameter => "MISSING_PARAMETER",
            Self::UnknownParameter => "UNKNOWN_PARAMETER",
            Self::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            Self::ProviderValidation => "PROVIDER_VALIDATION",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::RuleError => "RULE_ERROR",
            Self::InterruptError => "INTERRUPT_ERROR",
            Self::IoError => "IO_ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelError {
    pub code: ErrorCode,
    pub message: String,
}

impl KernelError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfig, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IoError, message)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for KernelError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn world_state_rejects_mismatched_character_key() {
        let mut characters = BTreeMap::new();
        characters.insert(
            "wrong".to_string(),
            Character::new("char:ansel", "Ansel", "loc:mill"),
        );
        let err = WorldState::new(3, 99, Granularity::Day, characters).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn event_record_round_trip() {
        let intent = Intent::new(
            "char:ansel",
            "wait",
            BTreeMap::new(),
            "Ansel waits by the mill.",
            0,
        );
        let outcome = Outcome::resolved(Verdict::Approved, json!({"moved": false}), Vec::new());
        let event = Event::new(
            7,
            "char:ansel",
            vec![AttemptRecord::approved(intent.clone())],
            FinalRecord::from_outcome(intent, outcome),
            vec!["tick:7:char:char:ansel:attempt:0".to_string()],
            TokenUsage::default(),
        );
        let record = EventRecord::Event(event);
        let line = serde_json::to_string(&record).expect("serialize");
        let decoded: EventRecord = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(record, decoded);
        assert_eq!(decoded.tick(), 7);
    }

    #[test]
    fn aborted_record_carries_marker() {
        let record = EventRecord::aborted(4, ErrorCode::RuleError, "rule drought-check failed");
        let line = serde_json::to_string(&record).expect("serialize");
        assert!(line.contains("\"aborted\":true"));
        assert!(line.contains("RULE_ERROR"));
    }

    #[test]
    fn reason_codes_use_kebab_case_wire_names() {
        let encoded = serde_json::to_string(&ReasonCode::UnknownAction).expect("serialize");
        assert_eq!(encoded, "\"unknown-action\"");
        assert_eq!(ReasonCode::ProviderError.as_str(), "provider-error");
    }

    #[test]
    fn granularity_step_table_is_day_based() {
        assert_eq!(Granularity::Immediate.default_step(), 1);
        assert_eq!(Granularity::Day.default_step(), TICKS_PER_DAY);
        assert_eq!(Granularity::Month.default_step(), 30 * TICKS_PER_DAY);
        assert_eq!(Granularity::Year.default_step(), 360 * TICKS_PER_DAY);
    }
}
