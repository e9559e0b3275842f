//! Ollama generate provider for local models.

use std::time::Instant;

use async_trait::async_trait;
use contracts::{LlmRequest, LlmResponse, ProviderHealth, ResponseSchema, TokenUsage};
use serde_json::{json, Value};

use crate::openai::status_error;
use crate::provider::{build_http_client, elapsed_ms, map_transport_error, Provider, ProviderError};
use crate::schemas::{parse_json_body, schema_instruction, validate_structured};

const DEFAULT_ENDPOINT: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    id: String,
    endpoint: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(
        id: impl Into<String>,
        endpoint: Option<String>,
        timeout_ms: u64,
    ) -> Result<Self, ProviderError> {
        let id = id.into();
        let client = build_http_client(&id, timeout_ms)?;
        Ok(Self {
            id,
            endpoint: endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            client,
        })
    }

    fn generate_payload(&self, request: &LlmRequest, user_prompt: &str, json_mode: bool) -> Value {
        let mut payload = json!({
            "model": request.model,
            "prompt": user_prompt,
            "system": request.system_prompt,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });
        if json_mode {
            payload["format"] = json!("json");
        }
        payload
    }

    async fn send_generate(&self, payload: &Value) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .json(payload)
            .send()
            .await
            .map_err(|err| map_transport_error(&self.id, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.id, status, &body));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| ProviderError::failed(&self.id, format!("decode response: {err}")))
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn health_check(&self) -> ProviderHealth {
        let probe = self
            .client
            .get(format!("{}/api/tags", self.endpoint))
            .send()
            .await;
        match probe {
            Ok(response) if response.status().is_success() => ProviderHealth::ok(),
            Ok(response) => {
                ProviderHealth::unhealthy(format!("status code: {}", response.status().as_u16()))
            }
            Err(err) => ProviderHealth::unhealthy(format!("connection failed: {err}")),
        }
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let started = Instant::now();
        let payload = self.generate_payload(request, &request.user_prompt, false);
        let data = self.send_generate(&payload).await?;
        let text = data["response"].as_str().unwrap_or_default().to_string();
        Ok(LlmResponse {
            text,
            structured: None,
            usage: usage_from(&data),
            provider_id: self.id.clone(),
            latency_ms: elapsed_ms(started),
        })
    }

    async fn complete_structured(
        &self,
        request: &LlmRequest,
        schema: ResponseSchema,
    ) -> Result<LlmResponse, ProviderError> {
        let started = Instant::now();
        let user_prompt = format!("{}{}", request.user_prompt, schema_instruction(schema));
        let payload = self.generate_payload(request, &user_prompt, true);
        let data = self.send_generate(&payload).await?;
        let text = data["response"].as_str().unwrap_or_default().to_string();
        let raw = parse_json_body(&text).map_err(|err| ProviderError::validation(&self.id, err))?;
        let structured = validate_structured(schema, &raw)
            .map_err(|err| ProviderError::validation(&self.id, err))?;
        Ok(LlmResponse {
            text,
            structured: Some(structured),
            usage: usage_from(&data),
            provider_id: self.id.clone(),
            latency_ms: elapsed_ms(started),
        })
    }
}

fn usage_from(data: &Value) -> TokenUsage {
    let prompt_tokens = data["prompt_eval_count"].as_u64().unwrap_or(0);
    let completion_tokens = data["eval_count"].as_u64().unwrap_or(0);
    TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens.saturating_add(completion_tokens),
    }
}
