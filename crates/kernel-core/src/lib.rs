//! Deterministic narrator simulation kernel: global clock, labeled seed
//! streams, whitelist validation, rule engine, interrupt polling, and the
//! per-tick narrator loop over the LLM provider router.

mod digest;

pub mod clock;
pub mod event_log;
pub mod interrupt;
pub mod narrator;
pub mod rules;
pub mod seed;
pub mod whitelist;
pub mod world;

pub use clock::GlobalClock;
pub use event_log::{last_logged_tick, EventSink, JsonlEventSink, MemoryEventSink};
pub use interrupt::{contains_halt, InterruptError, InterruptManager, InterruptRule};
pub use narrator::{DmPackage, DmResolution, DmResolver, Narrator, Solicitation};
pub use rules::{
    EffectAccumulator, Rule, RuleContext, RuleEngine, RuleEngineResult, RuleError, RuleVerdict,
};
pub use seed::SeedManager;
pub use whitelist::{validate_intent, WhitelistError};
pub use world::{
    apply_changes, spotlight_partition, visible_context, with_partition, SpotlightPartition,
};
