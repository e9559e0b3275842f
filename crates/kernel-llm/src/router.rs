//! Provider registry and dispatch. The router only routes: failover stays
//! with the narrator's retry discipline.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use contracts::{LlmRequest, LlmResponse, ProviderHealth, ResponseSchema};
use futures::future::join_all;

use crate::provider::{Provider, ProviderError};

struct RouterInner {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    default_id: String,
}

pub struct ProviderRouter {
    // Read-mostly; register/set_default are expected only at startup or
    // administrative reconfiguration.
    inner: RwLock<RouterInner>,
}

impl ProviderRouter {
    pub fn new(default_id: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(RouterInner {
                providers: BTreeMap::new(),
                default_id: default_id.into(),
            }),
        }
    }

    /// Adds or replaces a provider keyed by its id.
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let mut inner = self.inner.write().expect("router lock poisoned");
        inner.providers.insert(provider.id().to_string(), provider);
    }

    pub fn set_default(&self, id: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.write().expect("router lock poisoned");
        if !inner.providers.contains_key(id) {
            return Err(ProviderError::NotConfigured {
                name: id.to_string(),
            });
        }
        inner.default_id = id.to_string();
        Ok(())
    }

    pub fn default_id(&self) -> String {
        self.inner
            .read()
            .expect("router lock poisoned")
            .default_id
            .clone()
    }

    pub fn available_providers(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("router lock poisoned")
            .providers
            .keys()
            .cloned()
            .collect()
    }

    pub fn provider(&self, name: Option<&str>) -> Result<Arc<dyn Provider>, ProviderError> {
        let inner = self.inner.read().expect("router lock poisoned");
        let name = name.unwrap_or(&inner.default_id);
        inner
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotConfigured {
                name: name.to_string(),
            })
    }

    pub async fn complete(
        &self,
        request: &LlmRequest,
        provider_name: Option<&str>,
    ) -> Result<LlmResponse, ProviderError> {
        let provider = self.provider(provider_name)?;
        provider.complete(request).await
    }

    pub async fn complete_structured(
        &self,
        request: &LlmRequest,
        schema: ResponseSchema,
        provider_name: Option<&str>,
    ) -> Result<LlmResponse, ProviderError> {
        let provider = self.provider(provider_name)?;
        provider.complete_structured(request, schema).await
    }

    /// Concurrent health fan-out; a single provider's failure never fails
    /// the fan-out.
    pub async fn health_check_all(&self) -> BTreeMap<String, ProviderHealth> {
        let providers: Vec<(String, Arc<dyn Provider>)> = {
            let inner = self.inner.read().expect("router lock poisoned");
            inner
                .providers
                .iter()
                .map(|(id, provider)| (id.clone(), provider.clone()))
                .collect()
        };

        let checks = providers.into_iter().map(|(id, provider)| async move {
            let health = provider.health_check().await;
            (id, health)
        });
        join_all(checks).await.into_iter().collect()
    }
}
