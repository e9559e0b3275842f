//! Deterministic in-process provider. Tests and offline runs script its
//! replies; the narrator cannot tell it apart from a remote vendor.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use contracts::{LlmRequest, LlmResponse, ProviderHealth, ResponseSchema, TokenUsage};
use serde_json::Value;

use crate::provider::{Provider, ProviderError};
use crate::schemas::{parse_json_body, validate_structured};

const SCRIPTED_USAGE: TokenUsage = TokenUsage {
    prompt_tokens: 8,
    completion_tokens: 4,
    total_tokens: 12,
};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Structured(Value),
    Text(String),
    Unavailable(String),
    Failed(String),
}

#[derive(Debug, Clone)]
struct RouteRule {
    key: String,
    reply: ScriptedReply,
    delay_ms: u64,
}

pub struct ScriptedProvider {
    id: String,
    latency: Duration,
    routes: Mutex<Vec<RouteRule>>,
    script: Mutex<VecDeque<ScriptedReply>>,
    default_reply: Option<ScriptedReply>,
    unhealthy: Mutex<Option<String>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            latency: Duration::ZERO,
            routes: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            default_reply: None,
            unhealthy: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider that answers every call with the same structured payload.
    pub fn repeating(id: impl Into<String>, payload: Value) -> Self {
        let mut provider = Self::new(id);
        provider.default_reply = Some(ScriptedReply::Structured(payload));
        provider
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency = Duration::from_millis(latency_ms);
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(reply);
    }

    /// Answers every request whose correlation id contains `key`, regardless
    /// of arrival order. Concurrent fan-out tests stay deterministic this
    /// way; earlier routes win when several keys match.
    pub fn route(&self, key: impl Into<String>, reply: ScriptedReply) {
        self.route_with_delay(key, reply, 0);
    }

    pub fn route_with_delay(&self, key: impl Into<String>, reply: ScriptedReply, delay_ms: u64) {
        self.routes
            .lock()
            .expect("route lock poisoned")
            .push(RouteRule {
                key: key.into(),
                reply,
                delay_ms,
            });
    }

    pub fn set_unhealthy(&self, message: impl Into<String>) {
        *self.unhealthy.lock().expect("health lock poisoned") = Some(message.into());
    }

    /// Requests observed so far, in call order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().expect("request lock poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().expect("request lock poisoned").len()
    }

    fn reply_for(&self, request: &LlmRequest) -> (ScriptedReply, Duration) {
        let routes = self.routes.lock().expect("route lock poisoned");
        if let Some(rule) = routes
            .iter()
            .find(|rule| request.correlation_id.contains(&rule.key))
        {
            return (rule.reply.clone(), Duration::from_millis(rule.delay_ms));
        }
        drop(routes);

        let mut script = self.script.lock().expect("script lock poisoned");
        let reply = match script.pop_front() {
            Some(reply) => reply,
            None => self
                .default_reply
                .clone()
                .unwrap_or_else(|| ScriptedReply::Failed("script exhausted".to_string())),
        };
        (reply, self.latency)
    }

    fn record(&self, request: &LlmRequest) {
        self.requests
            .lock()
            .expect("request lock poisoned")
            .push(request.clone());
    }

    async fn simulate_latency(&self, latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn response(&self, text: String, structured: Option<Value>) -> LlmResponse {
        LlmResponse {
            text,
            structured,
            usage: SCRIPTED_USAGE,
            provider_id: self.id.clone(),
            latency_ms: u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn health_check(&self) -> ProviderHealth {
        self.simulate_latency(self.latency).await;
        match self.unhealthy.lock().expect("health lock poisoned").clone() {
            Some(message) => ProviderHealth::unhealthy(message),
            None => ProviderHealth::ok(),
        }
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        self.record(request);
        let (reply, latency) = self.reply_for(request);
        self.simulate_latency(latency).await;
        match reply {
            ScriptedReply::Text(text) => Ok(self.response(text, None)),
            ScriptedReply::Structured(payload) => Ok(self.response(payload.to_string(), None)),
            ScriptedReply::Unavailable(message) => {
                Err(ProviderError::unavailable(&self.id, message))
            }
            ScriptedReply::Failed(message) => Err(ProviderError::failed(&self.id, message)),
        }
    }

    async fn complete_structured(
        &self,
        request: &LlmRequest,
        schema: ResponseSchema,
    ) -> Result<LlmResponse, ProviderError> {
        self.record(request);
        let (reply, latency) = self.reply_for(request);
        self.simulate_latency(latency).await;
        let payload = match reply {
            ScriptedReply::Structured(payload) => payload,
            ScriptedReply::Text(text) => {
                parse_json_body(&text).map_err(|err| ProviderError::validation(&self.id, err))?
            }
            ScriptedReply::Unavailable(message) => {
                return Err(ProviderError::unavailable(&self.id, message))
            }
            ScriptedReply::Failed(message) => return Err(ProviderError::failed(&self.id, message)),
        };
        let structured = validate_structured(schema, &payload)
            .map_err(|err| ProviderError::validation(&self.id, err))?;
        Ok(self.response(payload.to_string(), Some(structured)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_replies_pop_in_order() {
        let provider = ScriptedProvider::new("stub");
        provider.push(ScriptedReply::Text("first".to_string()));
        provider.push(ScriptedReply::Text("second".to_string()));
        let request = LlmRequest::new("m", "s", "u", "corr");
        assert_eq!(provider.complete(&request).await.expect("first").text, "first");
        assert_eq!(
            provider.complete(&request).await.expect("second").text,
            "second"
        );
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_without_default_fails() {
        let provider = ScriptedProvider::new("stub");
        let request = LlmRequest::new("m", "s", "u", "corr");
        let err = provider.complete(&request).await.unwrap_err();
        assert!(matches!(err, ProviderError::Failed { .. }));
    }

    #[tokio::test]
    async fn invalid_structured_payload_surfaces_validation_error() {
        let provider = ScriptedProvider::repeating("stub", json!({"action": "move"}));
        let request = LlmRequest::new("m", "s", "u", "corr");
        let err = provider
            .complete_structured(&request, ResponseSchema::Intent)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Validation { .. }));
    }

    #[tokio::test]
    async fn routed_replies_match_correlation_ids() {
        let provider = ScriptedProvider::new("stub");
        provider.route(
            "char:a",
            ScriptedReply::Text("reply for a".to_string()),
        );
        provider.route(
            "char:b",
            ScriptedReply::Text("reply for b".to_string()),
        );

        let request_b = LlmRequest::new("m", "s", "u", "tick:1:char:b:attempt:0");
        let request_a = LlmRequest::new("m", "s", "u", "tick:1:char:a:attempt:0");
        assert_eq!(
            provider.complete(&request_b).await.expect("b").text,
            "reply for b"
        );
        assert_eq!(
            provider.complete(&request_a).await.expect("a").text,
            "reply for a"
        );
    }

    #[tokio::test]
    async fn repeating_provider_replays_forever() {
        let payload = json!({
            "action": "wait",
            "parameters": {},
            "flavor_text": "He waits."
        });
        let provider = ScriptedProvider::repeating("stub", payload.clone());
        let request = LlmRequest::new("m", "s", "u", "corr");
        for _ in 0..3 {
            let response = provider
                .complete_structured(&request, ResponseSchema::Intent)
                .await
                .expect("reply");
            assert_eq!(response.structured, Some(payload.clone()));
        }
    }
}
