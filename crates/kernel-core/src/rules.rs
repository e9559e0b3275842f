//! Deterministic rule engine: stable execution order, full audit trace,
//! effects merged last-write-wins through a threaded accumulator.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;

use contracts::{Intent, KernelError, RuleExecutionRecord, StateChange, WorldState};
use serde_json::{json, Value};

use crate::digest::sha256_hex;

#[derive(Debug, Clone)]
pub struct RuleContext<'a> {
    pub world: &'a WorldState,
    pub tick: u64,
    pub seed: u64,
    pub intent: Option<&'a Intent>,
    pub outcome: Option<&'a Value>,
    pub character_id: Option<&'a str>,
}

impl<'a> RuleContext<'a> {
    pub fn environmental(world: &'a WorldState, tick: u64, seed: u64) -> Self {
        Self {
            world,
            tick,
            seed,
            intent: None,
            outcome: None,
            character_id: None,
        }
    }

    pub fn for_character(world: &'a WorldState, tick: u64, seed: u64, character_id: &'a str) -> Self {
        Self {
            world,
            tick,
            seed,
            intent: None,
            outcome: None,
            character_id: Some(character_id),
        }
    }

    pub fn for_outcome(
        world: &'a WorldState,
        tick: u64,
        seed: u64,
        intent: &'a Intent,
        outcome: &'a Value,
    ) -> Self {
        Self {
            world,
            tick,
            seed,
            intent: Some(intent),
            outcome: Some(outcome),
            character_id: Some(intent.character_id.as_str()),
        }
    }

    /// Stable digest over everything a rule can observe. Recorded on every
    /// audit entry so replays can be diffed.
    pub fn digest(&self) -> String {
        let view = json!({
            "world": self.world,
            "tick": self.tick,
            "seed": self.seed.to_string(),
            "intent": self.intent,
            "outcome": self.outcome,
            "character_id": self.character_id,
        });
        sha256_hex(view.to_string().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleVerdict {
    Hit(Vec<StateChange>),
    Miss(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleError {
    pub rule_id: String,
    pub message: String,
}

impl RuleError {
    pub fn new(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule {} failed: {}", self.rule_id, self.message)
    }
}

impl std::error::Error for RuleError {}

pub trait Rule: Send + Sync {
    fn id(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    fn tags(&self) -> &[&str] {
        &[]
    }

    fn evaluate(
        &self,
        context: &RuleContext<'_>,
        effects: &EffectAccumulator,
    ) -> Result<RuleVerdict, RuleError>;
}

/// Working view of merged effects; later rules observe earlier hits here.
/// Merge semantics on a shared path are last-write-wins under stable order.
#[derive(Debug, Clone, Default)]
pub struct EffectAccumulator {
    latest: BTreeMap<String, Value>,
}

impl EffectAccumulator {
    pub fn value(&self, path: &str) -> Option<&Value> {
        self.latest.get(path)
    }

    pub fn merged(&self) -> &BTreeMap<String, Value> {
        &self.latest
    }

    fn absorb(&mut self, changes: &[StateChange]) {
        for change in changes {
            self.latest.insert(change.path.clone(), change.after.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleEngineResult {
    pub changes: Vec<StateChange>,
    pub records: Vec<RuleExecutionRecord>,
    pub merged: BTreeMap<String, Value>,
}

struct RegisteredRule {
    rule: Box<dyn Rule>,
    registration_index: usize,
}

#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<RegisteredRule>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: Box<dyn Rule>) -> Result<(), KernelError> {
        if rule.id().is_empty() {
            return Err(KernelError::invalid_argument("rule id must not be empty"));
        }
        let registration_index = self.rules.len();
        self.rules.push(RegisteredRule {
            rule,
            registration_index,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Identifies the registry for DM packaging: any change to the rule set,
    /// priorities, or ordering changes the digest.
    pub fn registry_digest(&self) -> String {
        let entries: Vec<Value> = self
            .sorted_rules()
            .into_iter()
            .map(|registered| {
                json!({
                    "rule_id": registered.rule.id(),
                    "priority": registered.rule.priority(),
                    "registration_index": registered.registration_index,
                    "tags": registered.rule.tags(),
                })
            })
            .collect();
        sha256_hex(Value::Array(entries).to_string().as_bytes())
    }

    pub fn evaluate(&self, context: &RuleContext<'_>) -> Result<RuleEngineResult, RuleError> {
        self.evaluate_where(context, |_| true)
    }

    pub fn evaluate_tagged(
        &self,
        tag: &str,
        context: &RuleContext<'_>,
    ) -> Result<RuleEngineResult, RuleError> {
        self.evaluate_where(context, |rule| rule.tags().contains(&tag))
    }

    pub fn evaluate_excluding_tag(
        &self,
        tag: &str,
        context: &RuleContext<'_>,
    ) -> Result<RuleEngineResult, RuleError> {
        self.evaluate_where(context, |rule| !rule.tags().contains(&tag))
    }

    /// Runs the selected rules in stable `(-priority, registration_index)`
    /// order. Errors abort the evaluation and propagate; they are never
    /// swallowed.
    pub fn evaluate_where(
        &self,
        context: &RuleContext<'_>,
        select: impl Fn(&dyn Rule) -> bool,
    ) -> Result<RuleEngineResult, RuleError> {
        let context_digest = context.digest();
        let mut accumulator = EffectAccumulator::default();
        let mut changes = Vec::new();
        let mut records = Vec::new();

        for registered in self.sorted_rules() {
            if !select(registered.rule.as_ref()) {
                continue;
            }
            let verdict = registered.rule.evaluate(context, &accumulator)?;
            let record = match verdict {
                RuleVerdict::Hit(rule_changes) => {
                    accumulator.absorb(&rule_changes);
                    changes.extend(rule_changes.iter().cloned());
                    RuleExecutionRecord {
                        rule_id: registered.rule.id().to_string(),
                        priority: registered.rule.priority(),
                        registration_index: registered.registration_index,
                        matched: true,
                        miss_reason: None,
                        context_digest: context_digest.clone(),
                        changes: Some(rule_changes),
                    }
                }
                RuleVerdict::Miss(reason) => RuleExecutionRecord {
                    rule_id: registered.rule.id().to_string(),
                    priority: registered.rule.priority(),
                    registration_index: registered.registration_index,
                    matched: false,
                    miss_reason: Some(reason),
                    context_digest: context_digest.clone(),
                    changes: None,
                },
            };
            records.push(record);
        }

        Ok(RuleEngineResult {
            changes,
            records,
            merged: accumulator.latest,
        })
    }

    fn sorted_rules(&self) -> Vec<&RegisteredRule> {
        let mut sorted: Vec<&RegisteredRule> = self.rules.iter().collect();
        sorted.sort_by_key(|registered| {
            (
                Reverse(registered.rule.priority()),
                registered.registration_index,
            )
        });
        sorted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::Granularity;
    use serde_json::json;

    struct StubRule {
        id: String,
        priority: i32,
        tags: Vec<&'static str>,
        verdict: RuleVerdict,
    }

    impl StubRule {
        fn hit(id: &str, priority: i32, changes: Vec<StateChange>) -> Self {
            Self {
                id: id.to_string(),
                priority,
                tags: Vec::new(),
                verdict: RuleVerdict::Hit(changes),
            }
        }

        fn miss(id: &str, priority: i32, reason: &str) -> Self {
            Self {
                id: id.to_string(),
                priority,
                tags: Vec::new(),
                verdict: RuleVerdict::Miss(reason.to_string()),
            }
        }

        fn tagged(mut self, tags: Vec<&'static str>) -> Self {
            self.tags = tags;
            self
        }
    }

    impl Rule for StubRule {
        fn id(&self) -> &str {
            &self.id
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn tags(&self) -> &[&str] {
            &self.tags
        }

        fn evaluate(
            &self,
            _context: &RuleContext<'_>,
            _effects: &EffectAccumulator,
        ) -> Result<RuleVerdict, RuleError> {
            Ok(self.verdict.clone())
        }
    }

    struct FailingRule;

    impl Rule for FailingRule {
        fn id(&self) -> &str {
            "failing"
        }

        fn evaluate(
            &self,
            _context: &RuleContext<'_>,
            _effects: &EffectAccumulator,
        ) -> Result<RuleVerdict, RuleError> {
            Err(RuleError::new("failing", "synthetic failure"))
        }
    }

    fn change(path: &str, after: Value, reason: &str) -> StateChange {
        StateChange::new(path, Value::Null, after, reason)
    }

    fn world() -> WorldState {
        WorldState::new(5, 2026, Granularity::Day, Default::default()).expect("world")
    }

    #[test]
    fn higher_priority_runs_first_then_registration_order() {
        let mut engine = RuleEngine::new();
        engine
            .register(Box::new(StubRule::hit(
                "late",
                0,
                vec![change("flags.alarm", json!(true), "late")],
            )))
            .expect("register");
        engine
            .register(Box::new(StubRule::hit(
                "urgent",
                10,
                vec![change("flags.alarm", json!(false), "urgent")],
            )))
            .expect("register");

        let world = world();
        let context = RuleContext::environmental(&world, 6, 2026);
        let result = engine.evaluate(&context).expect("evaluate");

        let order: Vec<&str> = result
            .records
            .iter()
            .map(|record| record.rule_id.as_str())
            .collect();
        assert_eq!(order, vec!["urgent", "late"]);
        // Last write under stable order belongs to the lower-priority rule.
        assert_eq!(result.merged["flags.alarm"], json!(true));
    }

    #[test]
    fn same_priority_merges_last_write_wins_in_registration_order() {
        let mut engine = RuleEngine::new();
        engine
            .register(Box::new(StubRule::hit(
                "r1",
                10,
                vec![change("resources.grain", json!(5.0), "r1")],
            )))
            .expect("register");
        engine
            .register(Box::new(StubRule::hit(
                "r2",
                10,
                vec![change("resources.grain", json!(9.0), "r2")],
            )))
            .expect("register");

        let world = world();
        let context = RuleContext::environmental(&world, 6, 2026);
        let result = engine.evaluate(&context).expect("evaluate");
        assert_eq!(result.merged["resources.grain"], json!(9.0));
        assert_eq!(result.changes.len(), 2);
    }

    #[test]
    fn miss_is_audited_with_reason_and_null_effect() {
        let mut engine = RuleEngine::new();
        engine
            .register(Box::new(StubRule::miss("noop", 0, "below threshold")))
            .expect("register");
        let world = world();
        let context = RuleContext::environmental(&world, 6, 2026);
        let result = engine.evaluate(&context).expect("evaluate");
        assert!(result.changes.is_empty());
        let record = &result.records[0];
        assert!(!record.matched);
        assert_eq!(record.miss_reason.as_deref(), Some("below threshold"));
        assert!(record.changes.is_none());
    }

    #[test]
    fn evaluation_is_deterministic_for_same_input() {
        let mut engine = RuleEngine::new();
        engine
            .register(Box::new(StubRule::hit(
                "stable",
                1,
                vec![change("resources.grain", json!(4.0), "stable")],
            )))
            .expect("register");
        let world = world();
        let context = RuleContext::environmental(&world, 6, 2026);
        let first = engine.evaluate(&context).expect("evaluate");
        let second = engine.evaluate(&context).expect("evaluate");
        assert_eq!(first.records, second.records);
        assert_eq!(first.changes, second.changes);
    }

    #[test]
    fn rule_error_aborts_and_propagates() {
        let mut engine = RuleEngine::new();
        engine
            .register(Box::new(StubRule::hit(
                "first",
                10,
                vec![change("flags.ok", json!(true), "first")],
            )))
            .expect("register");
        engine.register(Box::new(FailingRule)).expect("register");
        let world = world();
        let context = RuleContext::environmental(&world, 6, 2026);
        let err = engine.evaluate(&context).unwrap_err();
        assert_eq!(err.rule_id, "failing");
    }

    #[test]
    fn tag_filters_select_subsets_without_reindexing() {
        let mut engine = RuleEngine::new();
        engine
            .register(Box::new(
                StubRule::hit(
                    "weather",
                    0,
                    vec![change("phenology.frost", json!(0.2), "weather")],
                )
                .tagged(vec!["environmental"]),
            ))
            .expect("register");
        engine
            .register(Box::new(StubRule::hit(
                "outcome",
                0,
                vec![change("flags.moved", json!(true), "outcome")],
            )))
            .expect("register");

        let world = world();
        let context = RuleContext::environmental(&world, 6, 2026);
        let environmental = engine
            .evaluate_tagged("environmental", &context)
            .expect("evaluate");
        assert_eq!(environmental.records.len(), 1);
        assert_eq!(environmental.records[0].rule_id, "weather");

        let rest = engine
            .evaluate_excluding_tag("environmental", &context)
            .expect("evaluate");
        assert_eq!(rest.records.len(), 1);
        assert_eq!(rest.records[0].registration_index, 1);
    }

    #[test]
    fn registry_digest_tracks_registration() {
        let mut engine = RuleEngine::new();
        let empty = engine.registry_digest();
        engine
            .register(Box::new(StubRule::miss("noop", 0, "n/a")))
            .expect("register");
        assert_ne!(empty, engine.registry_digest());
    }
}
