//! Builds and caches [`ChatModel`] instances by `(configName,
//! effectiveTemperature)` (spec.md §3 "Ownership & lifecycle", §9
//! "Polymorphic chat model").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use super::{ChatAnthropic, ChatGoogle, ChatModel, ChatOpenAI};

/// One named model configuration an `AgentDefinition.llmRef` can point at.
/// Declared once at orchestrator init time, outside the hot path.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ModelConfig {
    OpenAi { model: String, api_key: String, #[serde(default)] base_url: Option<String> },
    Anthropic { model: String, api_key: String },
    Google { model: String, api_key: String },
}

impl ModelConfig {
    fn build(&self, temperature: f32) -> Box<dyn ChatModel> {
        match self {
            ModelConfig::OpenAi { model, api_key, base_url } => {
                let mut cfg = async_openai::config::OpenAIConfig::new().with_api_key(api_key);
                if let Some(base) = base_url {
                    cfg = cfg.with_api_base(base);
                }
                Box::new(ChatOpenAI::with_config(cfg, model.clone()).with_temperature(temperature))
            }
            ModelConfig::Anthropic { model, api_key } => {
                Box::new(ChatAnthropic::new(model.clone(), api_key.clone()).with_temperature(temperature))
            }
            ModelConfig::Google { model, api_key } => {
                Box::new(ChatGoogle::new(model.clone(), api_key.clone()).with_temperature(temperature))
            }
        }
    }
}

/// Cache key: the configured name plus the bit pattern of the effective
/// temperature, so `get("gpt4", 0.7)` and `get("gpt4", 0.2)` are distinct
/// entries sharing nothing (spec.md §3).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    config_name: String,
    temperature_bits: u32,
}

/// Resolves `AgentDefinition.llmRef` to a shared, cached [`ChatModel`].
/// `bind_tools`/`with_structured_output` always derive from the cached
/// instance without touching the cache — only the base (tool-less,
/// schema-less) instance is ever cached (spec.md §9).
pub struct ModelFactory {
    configs: HashMap<String, ModelConfig>,
    cache: Mutex<HashMap<CacheKey, Arc<dyn ChatModel>>>,
}

impl ModelFactory {
    pub fn new(configs: HashMap<String, ModelConfig>) -> Self {
        Self { configs, cache: Mutex::new(HashMap::new()) }
    }

    /// Returns the cached model for `config_name` at `temperature`,
    /// building and inserting it on first use.
    pub fn get(&self, config_name: &str, temperature: f32) -> Result<Arc<dyn ChatModel>, FactoryError> {
        let key = CacheKey { config_name: config_name.to_string(), temperature_bits: temperature.to_bits() };

        let mut cache = self.cache.lock().expect("model factory cache mutex poisoned");
        if let Some(model) = cache.get(&key) {
            return Ok(Arc::clone(model));
        }

        let config = self.configs.get(config_name).ok_or_else(|| FactoryError::UnknownConfig(config_name.to_string()))?;
        let model: Arc<dyn ChatModel> = Arc::from(config.build(temperature));
        cache.insert(key, Arc::clone(&model));
        Ok(model)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("unknown model config: {0}")]
    UnknownConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> HashMap<String, ModelConfig> {
        let mut m = HashMap::new();
        m.insert("gpt4".into(), ModelConfig::OpenAi { model: "gpt-4o-mini".into(), api_key: "k".into(), base_url: None });
        m
    }

    #[test]
    fn get_caches_by_config_name_and_temperature() {
        let factory = ModelFactory::new(configs());
        let a = factory.get("gpt4", 0.7).unwrap();
        let b = factory.get("gpt4", 0.7).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn get_treats_different_temperatures_as_distinct_entries() {
        let factory = ModelFactory::new(configs());
        let a = factory.get("gpt4", 0.7).unwrap();
        let b = factory.get("gpt4", 0.2).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn get_rejects_unknown_config_name() {
        let factory = ModelFactory::new(configs());
        assert!(factory.get("nope", 0.0).is_err());
    }
}
