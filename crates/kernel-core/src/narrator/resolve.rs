//! Deterministic DM packaging, the stateless resolver, and the per-character
//! commit path: resolve, apply rules, poll interrupts, append the event.

use std::time::Instant;

use contracts::{
    serde_u64_string, Character, DecisionResponse, ErrorCode, Event, EventRecord, FinalRecord,
    KernelError, LlmRequest, Outcome, ReasonCode, ResponseSchema, TokenUsage, Verdict, WorldState,
};
use kernel_llm::{ProviderError, ProviderRouter};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::solicit::{call_structured, Solicitation};
use super::Narrator;
use crate::interrupt::contains_halt;
use crate::rules::RuleContext;
use crate::world::apply_changes;

const DM_SYSTEM_PROMPT: &str = "You are the impartial dungeon master of a persistent world. \
     Given a character's approved intent and the visible world state, decide whether the \
     action succeeds and describe the structured outcome. Judge only from the package; \
     you have no memory of prior calls.";

/// Byte-stable input to a single DM resolution: two runs with identical
/// inputs serialize to identical bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DmPackage {
    pub character: Character,
    pub world: WorldState,
    pub rule_registry_digest: String,
    pub seed_label: String,
    #[serde(with = "serde_u64_string")]
    pub sub_seed: u64,
}

impl DmPackage {
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, KernelError> {
        serde_json::to_vec(self)
            .map_err(|err| KernelError::invalid_argument(format!("package encode failed: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DmResolution {
    pub decision: DecisionResponse,
    pub usage: TokenUsage,
}

/// Stateless wrapper over the router: fixed prompt, fixed decision schema,
/// no call-to-call memory beyond the explicit package.
#[derive(Debug, Clone)]
pub struct DmResolver {
    model: String,
}

impl DmResolver {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    pub async fn resolve(
        &self,
        router: &ProviderRouter,
        package: &DmPackage,
        deadline: Instant,
    ) -> Result<DmResolution, ProviderError> {
        let body = package.canonical_bytes().map_err(|err| {
            ProviderError::failed(router.default_id(), format!("package encode failed: {err}"))
        })?;
        let user_prompt = String::from_utf8(body).map_err(|err| {
            ProviderError::failed(router.default_id(), format!("package not utf-8: {err}"))
        })?;
        let request = LlmRequest::new(
            &self.model,
            DM_SYSTEM_PROMPT,
            user_prompt,
            &package.seed_label,
        );
        let response = call_structured(router, &request, ResponseSchema::Decision, deadline).await?;
        let payload = response.structured.ok_or_else(|| {
            ProviderError::validation(&response.provider_id, "missing structured decision")
        })?;
        let decision: DecisionResponse = serde_json::from_value(payload).map_err(|err| {
            ProviderError::validation(&response.provider_id, format!("decision malformed: {err}"))
        })?;
        Ok(DmResolution {
            decision,
            usage: response.usage,
        })
    }
}

impl Narrator {
    /// Resolves one approved or fallback intent, applies the outcome, and
    /// appends the character's event. Returns true when a HALT_TICK
    /// interrupt asks the narrator to truncate the rest of the tick.
    pub(super) async fn resolve_and_commit(
        &mut self,
        world: &mut WorldState,
        solicitation: Solicitation,
        tick: u64,
        deadline: Instant,
    ) -> Result<bool, KernelError> {
        let character_id = solicitation.character_id.clone();
        let resolve_label = format!("tick:{tick}:char:{character_id}:resolve");
        let sub_seed = self.seeds.sub_seed(&resolve_label)?;
        let character = world.character(&character_id).cloned().ok_or_else(|| {
            KernelError::invalid_argument(format!("unknown character: {character_id}"))
        })?;

        let package = DmPackage {
            character,
            world: world.clone(),
            rule_registry_digest: self.rules.registry_digest(),
            seed_label: resolve_label.clone(),
            sub_seed,
        };

        let mut usage = solicitation.usage;
        let mut seed_labels = solicitation.seed_labels.clone();
        seed_labels.push(resolve_label);

        let (verdict, result_payload) = match self
            .resolver
            .resolve(self.router.as_ref(), &package, deadline)
            .await
        {
            Ok(resolution) => {
                usage.add(&resolution.usage);
                if resolution.decision.accepted() {
                    (
                        Verdict::Approved,
                        json!({
                            "reason": resolution.decision.reason,
                            "outcome": resolution.decision.outcome,
                        }),
                    )
                } else {
                    (
                        Verdict::Rejected,
                        json!({
                            "reason_code": ReasonCode::DmRejected,
                            "reason": resolution.decision.reason,
                            "outcome": resolution.decision.outcome,
                        }),
                    )
                }
            }
            Err(err) => {
                tracing::warn!(
                    tick,
                    character_id = character_id.as_str(),
                    error = %err,
                    "dm resolution failed"
                );
                (
                    Verdict::Rejected,
                    json!({
                        "reason_code": super::solicit::provider_reason(&err),
                        "error": err.to_string(),
                    }),
                )
            }
        };

        let mut rule_trace = Vec::new();
        if verdict == Verdict::Approved {
            let context = RuleContext::for_outcome(
                world,
                tick,
                sub_seed,
                &solicitation.final_intent,
                &result_payload,
            );
            let result = match self.rules.evaluate_excluding_tag("environmental", &context) {
                Ok(result) => result,
                Err(err) => {
                    return Err(self.abort_tick(tick, ErrorCode::RuleError, err.to_string()))
                }
            };
            *world = match apply_changes(world, &result.changes) {
                Ok(next) => next,
                Err(err) => return Err(self.abort_tick(tick, err.code, err.message)),
            };
            rule_trace = result.records;
        }

        if let Some(character) = world.characters.get_mut(&character_id) {
            character.last_active_tick = tick;
        }

        let outcome = if solicitation.fallback {
            Outcome::fallback(
                verdict,
                result_payload,
                rule_trace,
                solicitation
                    .fallback_reason
                    .unwrap_or(ReasonCode::InvalidIntent),
            )
        } else {
            Outcome::resolved(verdict, result_payload, rule_trace)
        };

        let event = Event::new(
            tick,
            &character_id,
            solicitation.attempts,
            FinalRecord::from_outcome(solicitation.final_intent, outcome),
            seed_labels,
            usage,
        );
        self.sink.append(&EventRecord::Event(event))?;

        let poll_seed = self
            .seeds
            .sub_seed(&format!("tick:{tick}:char:{character_id}:interrupts"))?;
        let context = RuleContext::for_character(world, tick, poll_seed, &character_id);
        let signals = match self.interrupts.poll(&context) {
            Ok(signals) => signals,
            Err(err) => {
                return Err(self.abort_tick(tick, ErrorCode::InterruptError, err.to_string()))
            }
        };
        let halt = contains_halt(&signals);
        self.pending_signals.extend(signals);
        Ok(halt)
    }
}
