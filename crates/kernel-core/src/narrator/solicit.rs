//! Intent solicitation: parallel fan-out across active characters, a
//! sequential retry sub-loop per character, and the data-driven fallback
//! when retries exhaust.

use std::time::Instant;

use contracts::{
    ActionWhitelist, AttemptRecord, Character, Intent, IntentResponse, KernelError, LlmRequest,
    NarratorConfig, ReasonCode, ResponseSchema, TokenUsage, WorldState,
};
use futures::future::join_all;
use kernel_llm::{ProviderError, ProviderRouter};
use serde_json::Value;

use super::Narrator;
use crate::whitelist::validate_intent;
use crate::world::visible_context;

#[derive(Debug, Clone)]
pub struct Solicitation {
    pub character_id: String,
    pub attempts: Vec<AttemptRecord>,
    pub final_intent: Intent,
    pub fallback: bool,
    pub fallback_reason: Option<ReasonCode>,
    pub seed_labels: Vec<String>,
    pub usage: TokenUsage,
}

impl Narrator {
    pub(super) async fn solicit_all(
        &self,
        world: &WorldState,
        active: &[String],
        tick: u64,
        deadline: Instant,
    ) -> Result<Vec<Solicitation>, KernelError> {
        let futures: Vec<_> = active
            .iter()
            .map(|character_id| {
                solicit_character(
                    self.router.as_ref(),
                    &self.llm_model,
                    &self.whitelist,
                    &self.config,
                    world,
                    tick,
                    character_id.clone(),
                    deadline,
                )
            })
            .collect();

        let mut solicitations = join_all(futures)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        // Commit order is character-id order, never completion order.
        solicitations.sort_by(|a, b| a.character_id.cmp(&b.character_id));
        Ok(solicitations)
    }
}

#[allow(clippy::too_many_arguments)]
async fn solicit_character(
    router: &ProviderRouter,
    model: &str,
    whitelist: &ActionWhitelist,
    config: &NarratorConfig,
    world: &WorldState,
    tick: u64,
    character_id: String,
    deadline: Instant,
) -> Result<Solicitation, KernelError> {
    let character = world
        .character(&character_id)
        .ok_or_else(|| KernelError::invalid_argument(format!("unknown character: {character_id}")))?;
    let context = visible_context(world, &character_id)?;
    let system_prompt = intent_system_prompt(whitelist);

    let mut attempts: Vec<AttemptRecord> = Vec::new();
    let mut seed_labels = Vec::new();
    let mut usage = TokenUsage::default();
    let mut feedback: Option<String> = None;

    for attempt in 0..=config.max_retries {
        let label = format!("tick:{tick}:char:{character_id}:attempt:{attempt}");
        seed_labels.push(label.clone());

        let user_prompt = build_intent_prompt(&context, feedback.as_deref());
        let request = LlmRequest::new(model, system_prompt.clone(), user_prompt, label);

        match call_structured(router, &request, ResponseSchema::Intent, deadline).await {
            Ok(response) => {
                usage.add(&response.usage);
                let payload = match response.structured {
                    Some(payload) => payload,
                    None => {
                        attempts.push(AttemptRecord::failed(ReasonCode::ProviderError));
                        feedback = Some("provider returned no structured payload".to_string());
                        continue;
                    }
                };
                let parsed: IntentResponse = match serde_json::from_value(payload) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        attempts.push(AttemptRecord::failed(ReasonCode::InvalidIntent));
                        feedback = Some(format!("intent payload malformed: {err}"));
                        continue;
                    }
                };
                let intent = Intent::new(
                    &character_id,
                    parsed.action,
                    parsed.parameters,
                    parsed.flavor_text,
                    attempt,
                );

                if let Err(err) = validate_intent(&intent, whitelist) {
                    let reason = err.reason_code();
                    feedback = Some(err.to_string());
                    attempts.push(AttemptRecord::rejected(intent, reason));
                    continue;
                }
                match adjudicate(world, character, &intent) {
                    Ok(()) => {
                        attempts.push(AttemptRecord::approved(intent.clone()));
                        return Ok(Solicitation {
                            character_id,
                            attempts,
                            final_intent: intent,
                            fallback: false,
                            fallback_reason: None,
                            seed_labels,
                            usage,
                        });
                    }
                    Err((reason, note)) => {
                        feedback = Some(note);
                        attempts.push(AttemptRecord::rejected(intent, reason));
                    }
                }
            }
            Err(err) => {
                let reason = provider_reason(&err);
                tracing::warn!(
                    tick,
                    character_id = character_id.as_str(),
                    attempt,
                    error = %err,
                    "intent solicitation failed"
                );
                attempts.push(AttemptRecord::failed(reason));
                feedback = Some(err.to_string());
            }
        }
    }

    // All attempts rejected: synthesize the known-safe fallback. It skips
    // the whitelist but still passes through the DM.
    let fallback_reason = attempts
        .last()
        .and_then(|attempt| attempt.reason)
        .unwrap_or(ReasonCode::InvalidIntent);
    let policy = config.fallback_for(fallback_class(character));
    let final_intent = Intent::new(
        &character_id,
        &policy.action,
        policy.parameters.clone(),
        &policy.flavor_text,
        attempts.len() as u32,
    );

    Ok(Solicitation {
        character_id,
        attempts,
        final_intent,
        fallback: true,
        fallback_reason: Some(fallback_reason),
        seed_labels,
        usage,
    })
}

pub(super) async fn call_structured(
    router: &ProviderRouter,
    request: &LlmRequest,
    schema: ResponseSchema,
    deadline: Instant,
) -> Result<contracts::LlmResponse, ProviderError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(ProviderError::unavailable(
            router.default_id(),
            "tick deadline exceeded before dispatch",
        ));
    }
    match tokio::time::timeout(remaining, router.complete_structured(request, schema, None)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::unavailable(
            router.default_id(),
            "call exceeded tick deadline",
        )),
    }
}

pub(super) fn provider_reason(err: &ProviderError) -> ReasonCode {
    match err {
        ProviderError::Unavailable { .. } => ReasonCode::Timeout,
        _ => ReasonCode::ProviderError,
    }
}

/// Narrator adjudication beyond the static whitelist: cheap, deterministic
/// plausibility checks against the snapshot.
fn adjudicate(
    world: &WorldState,
    character: &Character,
    intent: &Intent,
) -> Result<(), (ReasonCode, String)> {
    if character
        .status_effects
        .iter()
        .any(|effect| effect == "incapacitated")
        && !matches!(intent.action.as_str(), "wait" | "rest")
    {
        return Err((
            ReasonCode::InvalidIntent,
            "incapacitated characters may only wait or rest".to_string(),
        ));
    }
    if let Some(target) = intent.parameters.get("target").and_then(Value::as_str) {
        if !world.characters.contains_key(target) {
            return Err((
                ReasonCode::InvalidIntent,
                format!("unknown target character: {target}"),
            ));
        }
    }
    Ok(())
}

fn fallback_class(character: &Character) -> &'static str {
    if character
        .status_effects
        .iter()
        .any(|effect| effect == "traveling")
    {
        "traveling"
    } else {
        "default"
    }
}

fn intent_system_prompt(whitelist: &ActionWhitelist) -> String {
    let mut prompt = String::from(
        "You narrate one character in a persistent simulated world. \
         Choose exactly one action for this tick from the allowed list.\n\
         Allowed actions:\n",
    );
    for (action, rule) in &whitelist.actions {
        prompt.push_str(&format!(
            "- {} (required: {}; optional: {})\n",
            action,
            join_or_none(&rule.required),
            join_or_none(&rule.optional),
        ));
    }
    prompt
}

fn join_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

fn build_intent_prompt(context: &Value, feedback: Option<&str>) -> String {
    match feedback {
        Some(feedback) => format!(
            "World context:\n{context}\n\nYour previous intent was rejected: {feedback}. \
             Choose a different, valid action."
        ),
        None => format!("World context:\n{context}\n\nState your intent."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::ActionRule;
    use std::collections::BTreeMap;

    #[test]
    fn system_prompt_lists_actions_deterministically() {
        let whitelist = ActionWhitelist {
            version: 1,
            actions: BTreeMap::from([
                (
                    "move".to_string(),
                    ActionRule {
                        required: vec!["to".to_string()],
                        optional: vec!["speed".to_string()],
                    },
                ),
                ("wait".to_string(), ActionRule::default()),
            ]),
        };
        let prompt = intent_system_prompt(&whitelist);
        assert!(prompt.contains("- move (required: to; optional: speed)"));
        assert!(prompt.contains("- wait (required: none; optional: none)"));
        let move_at = prompt.find("- move").expect("move listed");
        let wait_at = prompt.find("- wait").expect("wait listed");
        assert!(move_at < wait_at);
    }

    #[test]
    fn provider_reason_maps_unavailable_to_timeout() {
        assert_eq!(
            provider_reason(&ProviderError::unavailable("p", "slow")),
            ReasonCode::Timeout
        );
        assert_eq!(
            provider_reason(&ProviderError::validation("p", "bad shape")),
            ReasonCode::ProviderError
        );
    }

    #[test]
    fn feedback_is_threaded_into_the_retry_prompt() {
        let context = serde_json::json!({"tick": 3});
        let prompt = build_intent_prompt(&context, Some("action not allowed: fly"));
        assert!(prompt.contains("action not allowed: fly"));
    }
}
