//! The narrator: per-tick orchestrator that advances the clock, runs the
//! environmental pre-pass, partitions characters, solicits and adjudicates
//! intents, resolves outcomes through the DM, applies rules, and commits
//! exactly one event per active character in stable character-id order.

mod resolve;
mod solicit;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use contracts::{
    ActionWhitelist, Character, ErrorCode, EventRecord, Granularity, InterruptKind, KernelConfig,
    KernelError, NarratorConfig, TickSummary, WorldState,
};
use kernel_llm::ProviderRouter;

use crate::clock::GlobalClock;
use crate::event_log::EventSink;
use crate::interrupt::{contains_halt, InterruptManager};
use crate::rules::{RuleContext, RuleEngine};
use crate::seed::SeedManager;
use crate::world::{apply_changes, spotlight_partition, with_partition};

pub use resolve::{DmPackage, DmResolution, DmResolver};
pub use solicit::Solicitation;

pub struct Narrator {
    config: NarratorConfig,
    llm_model: String,
    clock: GlobalClock,
    default_step: u64,
    seeds: SeedManager,
    rules: RuleEngine,
    interrupts: InterruptManager,
    whitelist: ActionWhitelist,
    router: Arc<ProviderRouter>,
    resolver: DmResolver,
    sink: Box<dyn EventSink>,
    world: WorldState,
    pending_signals: Vec<contracts::InterruptSignal>,
}

impl Narrator {
    pub fn new(
        config: &KernelConfig,
        whitelist: ActionWhitelist,
        router: Arc<ProviderRouter>,
        characters: BTreeMap<String, Character>,
        sink: Box<dyn EventSink>,
    ) -> Result<Self, KernelError> {
        config.validate()?;
        whitelist.validate()?;

        let default_provider = config
            .llm
            .providers
            .get(&config.llm.default_provider)
            .ok_or_else(|| {
                KernelError::invalid_config(format!(
                    "default provider {} missing from llm.providers",
                    config.llm.default_provider
                ))
            })?;

        let clock = GlobalClock::new(config.clock.start_tick)?;
        let world = WorldState::new(
            clock.current(),
            config.seed,
            config.narrator.granularity,
            characters,
        )?;

        Ok(Self {
            config: config.narrator.clone(),
            llm_model: default_provider.model.clone(),
            clock,
            default_step: config.clock.default_step as u64,
            seeds: SeedManager::new(config.seed),
            rules: RuleEngine::new(),
            interrupts: InterruptManager::new(),
            whitelist,
            router,
            resolver: DmResolver::new(default_provider.model.clone()),
            sink,
            world,
            pending_signals: Vec::new(),
        })
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }

    pub fn current_tick(&self) -> u64 {
        self.clock.current()
    }

    pub fn rules_mut(&mut self) -> &mut RuleEngine {
        &mut self.rules
    }

    pub fn interrupts_mut(&mut self) -> &mut InterruptManager {
        &mut self.interrupts
    }

    /// Runs up to `ticks` ticks; stops early only on fatal errors.
    pub async fn run(&mut self, ticks: u64) -> Result<Vec<TickSummary>, KernelError> {
        let mut summaries = Vec::new();
        for _ in 0..ticks {
            summaries.push(self.step().await?);
        }
        Ok(summaries)
    }

    /// Executes one complete tick. Tick N+1 never starts before tick N's
    /// final append has completed, by construction.
    pub async fn step(&mut self) -> Result<TickSummary, KernelError> {
        let (granularity, rationale, wake_requests) = self.open_tick();
        // A granularity missing from the step table falls back to the
        // clock's configured default step.
        let step_ticks = self
            .config
            .granularity_steps
            .get(&granularity)
            .copied()
            .unwrap_or(self.default_step);
        let step = i64::try_from(step_ticks)
            .map_err(|_| KernelError::invalid_argument("granularity step exceeds clock range"))?;
        let tick = self.clock.advance(step)?;
        let deadline = Instant::now() + Duration::from_millis(self.config.tick_deadline_ms);
        tracing::info!(
            tick,
            granularity = granularity.as_str(),
            rationale = rationale.as_str(),
            "tick opened"
        );

        // Environmental pre-pass against the prior snapshot.
        let env_seed = self.seeds.sub_seed(&format!("tick:{tick}:environment"))?;
        let env_context = RuleContext::environmental(&self.world, tick, env_seed);
        let env_result = match self.rules.evaluate_tagged("environmental", &env_context) {
            Ok(result) => result,
            Err(err) => return Err(self.abort_tick(tick, ErrorCode::RuleError, err.to_string())),
        };
        let mut world = match apply_changes(&self.world, &env_result.changes) {
            Ok(world) => world,
            Err(err) => return Err(self.abort_tick(tick, err.code, err.message)),
        };

        // Partition, with interrupt-requested wakes promoted to the LLM path.
        let mut partition = spotlight_partition(&world, tick, &self.config, &self.seeds)?;
        promote_woken(&mut partition, &wake_requests);
        world = with_partition(&world, &partition);
        let summary_counts = (
            partition.active.len() as u64,
            partition.passive.len() as u64,
            partition.dormant.len() as u64,
        );

        // Rule-only updates for passive characters; dormant ones advance in
        // time only.
        for character_id in &partition.passive {
            let seed = self
                .seeds
                .sub_seed(&format!("tick:{tick}:char:{character_id}:passive"))?;
            let context = RuleContext::for_character(&world, tick, seed, character_id);
            let result = match self.rules.evaluate_tagged("character", &context) {
                Ok(result) => result,
                Err(err) => {
                    return Err(self.abort_tick(tick, ErrorCode::RuleError, err.to_string()))
                }
            };
            world = match apply_changes(&world, &result.changes) {
                Ok(world) => world,
                Err(err) => return Err(self.abort_tick(tick, err.code, err.message)),
            };
        }

        // Parallel fan-out over immutable snapshots, then a deterministic
        // collect: results come back sorted by character id.
        let solicitations = self
            .solicit_all(&world, &partition.active, tick, deadline)
            .await?;

        let mut events_appended = 0_u64;
        let mut halted = false;

        let post_intent_seed = self
            .seeds
            .sub_seed(&format!("tick:{tick}:interrupts:post-intent"))?;
        let post_intent_context = RuleContext::environmental(&world, tick, post_intent_seed);
        let post_intent_signals = match self.interrupts.poll(&post_intent_context) {
            Ok(signals) => signals,
            Err(err) => {
                return Err(self.abort_tick(tick, ErrorCode::InterruptError, err.to_string()))
            }
        };
        if contains_halt(&post_intent_signals) {
            halted = true;
            self.pending_signals.extend(post_intent_signals);
        } else {
            self.pending_signals.extend(post_intent_signals);
            for solicitation in solicitations {
                let halt = self
                    .resolve_and_commit(&mut world, solicitation, tick, deadline)
                    .await?;
                events_appended += 1;
                if halt {
                    halted = true;
                    break;
                }
            }
        }

        let end_seed = self.seeds.sub_seed(&format!("tick:{tick}:interrupts:end"))?;
        let end_context = RuleContext::environmental(&world, tick, end_seed);
        match self.interrupts.poll(&end_context) {
            Ok(signals) => self.pending_signals.extend(signals),
            Err(err) => {
                return Err(self.abort_tick(tick, ErrorCode::InterruptError, err.to_string()))
            }
        }

        world.tick = tick;
        world.granularity = granularity;
        self.world = world;

        Ok(TickSummary {
            tick,
            granularity,
            granularity_rationale: rationale,
            active_characters: summary_counts.0,
            passive_characters: summary_counts.1,
            dormant_characters: summary_counts.2,
            events_appended,
            halted,
        })
    }

    /// Consumes the signals carried over from the previous tick and decides
    /// this tick's granularity.
    fn open_tick(&mut self) -> (Granularity, String, BTreeSet<String>) {
        let pending = std::mem::take(&mut self.pending_signals);
        let wake_requests: BTreeSet<String> = pending
            .iter()
            .filter(|signal| signal.kind == InterruptKind::WakeCharacter)
            .filter_map(|signal| {
                signal.payload["character_id"]
                    .as_str()
                    .map(str::to_string)
            })
            .collect();

        if pending.is_empty() {
            (
                self.config.granularity,
                "configured default cadence".to_string(),
                wake_requests,
            )
        } else {
            (
                Granularity::Immediate,
                format!("{} interrupt signals pending", pending.len()),
                wake_requests,
            )
        }
    }

    fn abort_tick(&mut self, tick: u64, code: ErrorCode, message: String) -> KernelError {
        tracing::error!(tick, code = code.as_str(), message = message.as_str(), "tick aborted");
        let record = EventRecord::aborted(tick, code, message.clone());
        if let Err(append_err) = self.sink.append(&record) {
            tracing::error!(tick, error = %append_err, "failed to record tick abort");
        }
        KernelError::new(code, message)
    }
}

fn promote_woken(
    partition: &mut crate::world::SpotlightPartition,
    wake_requests: &BTreeSet<String>,
) {
    if wake_requests.is_empty() {
        return;
    }
    partition
        .passive
        .retain(|id| !wake_requests.contains(id.as_str()));
    partition
        .dormant
        .retain(|id| !wake_requests.contains(id.as_str()));
    for id in wake_requests {
        if !partition.active.contains(id) {
            partition.active.push(id.clone());
        }
    }
    partition.active.sort();
}
