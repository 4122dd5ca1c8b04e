//! Model registry lookup
//!
//! The fallback chain only reads from the registry. The gateway owns the
//! catalogue; [`StaticModelRegistry`] is the in-memory implementation used by
//! the daemon (seeded from configuration) and by tests.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

fn default_available() -> bool {
    true
}

/// What the registry knows about a model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,

    #[serde(default = "default_available")]
    pub available: bool,

    #[serde(default)]
    pub context_window: Option<u32>,

    /// Free-form capability tags ("vision", "tools", ...)
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            available: true,
            context_window: None,
            capabilities: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = Some(tokens);
        self
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// Read-only model catalogue
pub trait ModelRegistry: Send + Sync {
    fn get_model(&self, id: &str) -> Option<ModelInfo>;
}

/// In-memory registry
#[derive(Debug, Default)]
pub struct StaticModelRegistry {
    models: RwLock<HashMap<String, ModelInfo>>,
}

impl StaticModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models<I>(models: I) -> Self
    where
        I: IntoIterator<Item = ModelInfo>,
    {
        let registry = Self::new();
        for model in models {
            registry.register(model);
        }
        registry
    }

    pub fn register(&self, model: ModelInfo) {
        self.models.write().insert(model.id.clone(), model);
    }

    /// Toggle availability; false if the model is unknown
    pub fn set_available(&self, id: &str, available: bool) -> bool {
        match self.models.write().get_mut(id) {
            Some(model) => {
                model.available = available;
                true
            }
            None => false,
        }
    }

    /// All models sorted by id
    pub fn models(&self) -> Vec<ModelInfo> {
        let mut models: Vec<_> = self.models.read().values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }
}

impl ModelRegistry for StaticModelRegistry {
    fn get_model(&self, id: &str) -> Option<ModelInfo> {
        self.models.read().get(id).cloned()
    }
}

/// Constraints a fallback candidate must meet
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRequirements {
    pub min_context_window: Option<u32>,
    pub capabilities: BTreeSet<String>,
    pub excluded_providers: BTreeSet<String>,
}

impl ModelRequirements {
    #[must_use]
    pub fn with_min_context_window(mut self, tokens: u32) -> Self {
        self.min_context_window = Some(tokens);
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    #[must_use]
    pub fn excluding_provider(mut self, provider: impl Into<String>) -> Self {
        self.excluded_providers.insert(provider.into());
        self
    }

    /// Check a model against every constraint
    ///
    /// A model with an unknown context window fails a minimum.
    pub fn is_satisfied_by(&self, model: &ModelInfo) -> bool {
        if self.excluded_providers.contains(&model.provider) {
            return false;
        }
        if let Some(min) = self.min_context_window {
            if model.context_window.map_or(true, |w| w < min) {
                return false;
            }
        }
        self.capabilities.is_subset(&model.capabilities)
    }
}
