use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::adapter::HttpAdapter;
use crate::config::AppConfig;
use crate::error::EngineError;
use crate::transport::{HttpTransport, Transport};

/// One [`HttpAdapter`] per configured provider, indexed by model id.
#[derive(Debug)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<HttpAdapter>>,
    by_name: FxHashMap<String, usize>,
    /// First provider listing each model wins.
    by_model: FxHashMap<String, usize>,
    default_index: usize,
}

impl AdapterRegistry {
    /// Build adapters sharing one pooled [`HttpTransport`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Transport`] when the HTTP client cannot be built
    /// and [`EngineError::Config`] for an unusable provider entry.
    pub fn from_config(config: &AppConfig) -> Result<Self, EngineError> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.http)?);
        Self::with_transport(config, transport)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when no provider is configured or an
    /// entry names an unknown provider kind.
    pub fn with_transport(
        config: &AppConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, EngineError> {
        if config.providers.is_empty() {
            return Err(EngineError::Config("no providers configured".to_string()));
        }
        let mut adapters = Vec::with_capacity(config.providers.len());
        let mut by_name = FxHashMap::default();
        let mut by_model = FxHashMap::default();
        let mut default_index = 0;
        for (index, provider) in config.providers.iter().enumerate() {
            adapters.push(Arc::new(HttpAdapter::from_config(provider, transport.clone())?));
            by_name.entry(provider.name.clone()).or_insert(index);
            for model in &provider.models {
                by_model.entry(model.clone()).or_insert(index);
            }
            if provider.is_default {
                default_index = index;
            }
        }
        tracing::debug!(
            providers = adapters.len(),
            models = by_model.len(),
            "adapter registry ready"
        );
        Ok(Self {
            adapters,
            by_name,
            by_model,
            default_index,
        })
    }

    /// The provider listing `model`, else the default provider.
    #[must_use]
    pub fn resolve(&self, model: &str) -> &Arc<HttpAdapter> {
        let index = self
            .by_model
            .get(model)
            .copied()
            .unwrap_or(self.default_index);
        &self.adapters[index]
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<HttpAdapter>> {
        self.by_name.get(name).map(|&index| &self.adapters[index])
    }

    #[must_use]
    pub fn default_adapter(&self) -> &Arc<HttpAdapter> {
        &self.adapters[self.default_index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<HttpAdapter>> {
        self.adapters.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
