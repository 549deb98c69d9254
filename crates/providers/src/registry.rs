//! Provider registry — resolves a role ("supervisor", "specialist",
//! "summarizer") or an explicit `provider/model` spec to a provider handle.

use std::collections::HashMap;
use std::sync::Arc;

use ps_domain::config::LlmConfig;

use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

/// A resolved provider plus an optional model override within it.
pub type ProviderHandle = (Arc<dyn LlmProvider>, Option<String>);

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    /// Role → "provider_id/model" spec.
    roles: HashMap<String, String>,
    /// Insertion order of successfully initialized providers.
    order: Vec<String>,
}

impl ProviderRegistry {
    /// Initialize every configured provider. Providers that fail to
    /// initialize (missing key, bad URL) are skipped with a warning so the
    /// daemon still boots; investigations fail with `llm_error` until fixed.
    pub fn from_config(cfg: &LlmConfig) -> Self {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        let mut order = Vec::new();

        for pc in &cfg.providers {
            match OpenAiCompatProvider::from_config(pc, cfg.request_timeout_secs) {
                Ok(p) => {
                    tracing::info!(provider = %pc.id, base_url = %pc.base_url, "provider ready");
                    providers.insert(pc.id.clone(), Arc::new(p));
                    order.push(pc.id.clone());
                }
                Err(e) => {
                    tracing::warn!(provider = %pc.id, error = %e, "provider init failed, skipping");
                }
            }
        }

        Self {
            providers,
            roles: cfg.roles.clone(),
            order,
        }
    }

    /// Test-only constructor wiring an explicit provider for every role.
    pub fn single(id: &str, provider: Arc<dyn LlmProvider>) -> Self {
        let mut providers = HashMap::new();
        providers.insert(id.to_string(), provider);
        Self {
            providers,
            roles: HashMap::new(),
            order: vec![id.to_string()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(provider_id).cloned()
    }

    /// Resolve an explicit `provider/model` (or bare `provider`) spec.
    pub fn resolve_spec(&self, spec: &str) -> Option<ProviderHandle> {
        let (provider_id, model) = match spec.split_once('/') {
            Some((p, m)) => (p, Some(m.to_string())),
            None => (spec, None),
        };
        self.get(provider_id).map(|p| (p, model))
    }

    /// Resolve a role to a provider. Order: role mapping → first provider.
    pub fn for_role(&self, role: &str) -> Option<ProviderHandle> {
        if let Some(spec) = self.roles.get(role) {
            if let Some(handle) = self.resolve_spec(spec) {
                return Some(handle);
            }
            tracing::warn!(role, spec = %spec, "role maps to unknown provider, falling back");
        }
        let first = self.order.first()?;
        self.get(first).map(|p| (p, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_domain::error::Result;
    use ps_domain::stream::{BoxStream, ChatChunk};

    use crate::traits::{ChatRequest, ChatResponse};

    struct DummyProvider(String);

    #[async_trait::async_trait]
    impl LlmProvider for DummyProvider {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: String::new(),
                tool_calls: Vec::new(),
                usage: None,
                finish_reason: None,
            })
        }

        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> Result<BoxStream<'static, Result<ChatChunk>>> {
            Ok(Box::pin(async_stream::stream! {
                yield Ok(ChatChunk::Completed {
                    usage: None,
                    finish_reason: None,
                });
            }))
        }

        fn provider_id(&self) -> &str {
            &self.0
        }
    }

    #[test]
    fn resolve_spec_with_model() {
        let registry = ProviderRegistry::single("or", Arc::new(DummyProvider("or".into())));
        let (p, model) = registry.resolve_spec("or/gpt-4o").unwrap();
        assert_eq!(p.provider_id(), "or");
        assert_eq!(model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn unknown_role_falls_back_to_first_provider() {
        let registry = ProviderRegistry::single("or", Arc::new(DummyProvider("or".into())));
        let (p, model) = registry.for_role("summarizer").unwrap();
        assert_eq!(p.provider_id(), "or");
        assert!(model.is_none());
    }

    #[test]
    fn empty_registry_resolves_nothing() {
        let registry = ProviderRegistry::from_config(&ps_domain::config::LlmConfig::default());
        assert!(registry.is_empty());
        assert!(registry.for_role("supervisor").is_none());
    }
}
