use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use contracts::{ErrorCode, LlmRequest, LlmResponse, ProviderHealth, ResponseSchema};

/// Closed taxonomy of failures at the provider boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Transport, auth, or rate-limit failure.
    Unavailable { provider_id: String, message: String },
    /// The response did not conform to the requested schema.
    Validation { provider_id: String, message: String },
    /// Anything else recoverable at the provider boundary.
    Failed { provider_id: String, message: String },
    /// The router was asked for a provider that was never registered.
    NotConfigured { name: String },
}

impl ProviderError {
    pub fn unavailable(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            provider_id: provider_id.into(),
            message: message.into(),
        }
    }

    pub fn validation(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            provider_id: provider_id.into(),
            message: message.into(),
        }
    }

    pub fn failed(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            provider_id: provider_id.into(),
            message: message.into(),
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Unavailable { .. } => ErrorCode::ProviderUnavailable,
            Self::Validation { .. } => ErrorCode::ProviderValidation,
            Self::Failed { .. } => ErrorCode::ProviderError,
            Self::NotConfigured { .. } => ErrorCode::InvalidConfig,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable {
                provider_id,
                message,
            } => write!(f, "provider {provider_id} unavailable: {message}"),
            Self::Validation {
                provider_id,
                message,
            } => write!(f, "provider {provider_id} response invalid: {message}"),
            Self::Failed {
                provider_id,
                message,
            } => write!(f, "provider {provider_id} error: {message}"),
            Self::NotConfigured { name } => write!(f, "provider '{name}' not configured"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Uniform async contract every vendor hides behind. The kernel never
/// branches on provider identity.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    async fn health_check(&self) -> ProviderHealth;

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError>;

    /// Like `complete`, but the response body must parse and validate
    /// against one of the fixed schemas. Validation failures surface as
    /// `ProviderError::Validation`, never as transport errors.
    async fn complete_structured(
        &self,
        request: &LlmRequest,
        schema: ResponseSchema,
    ) -> Result<LlmResponse, ProviderError>;
}

pub(crate) fn build_http_client(
    provider_id: &str,
    timeout_ms: u64,
) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms.max(1)))
        .build()
        .map_err(|err| ProviderError::failed(provider_id, format!("client build failed: {err}")))
}

pub(crate) fn map_transport_error(provider_id: &str, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::unavailable(provider_id, err.to_string())
    } else {
        ProviderError::failed(provider_id, err.to_string())
    }
}

pub(crate) fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
