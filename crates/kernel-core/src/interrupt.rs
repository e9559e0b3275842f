//! Interrupt polling. Registered rules raise signals the narrator uses to
//! truncate or redirect a tick; exceptions propagate untouched.

use std::fmt;

use contracts::{InterruptKind, InterruptSignal};

use crate::rules::RuleContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptError {
    pub rule_id: String,
    pub message: String,
}

impl InterruptError {
    pub fn new(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for InterruptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interrupt rule {} failed: {}", self.rule_id, self.message)
    }
}

impl std::error::Error for InterruptError {}

pub trait InterruptRule: Send + Sync {
    fn id(&self) -> &str;

    fn poll(&self, context: &RuleContext<'_>) -> Result<Vec<InterruptSignal>, InterruptError>;
}

#[derive(Default)]
pub struct InterruptManager {
    rules: Vec<Box<dyn InterruptRule>>,
}

impl InterruptManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: Box<dyn InterruptRule>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Invokes every rule in registration order and concatenates the raised
    /// signals.
    pub fn poll(&self, context: &RuleContext<'_>) -> Result<Vec<InterruptSignal>, InterruptError> {
        let mut signals = Vec::new();
        for rule in &self.rules {
            signals.extend(rule.poll(context)?);
        }
        Ok(signals)
    }
}

pub fn contains_halt(signals: &[InterruptSignal]) -> bool {
    signals
        .iter()
        .any(|signal| signal.kind == InterruptKind::HaltTick)
}
