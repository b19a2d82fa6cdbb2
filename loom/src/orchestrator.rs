//! Root lifecycle (C10, spec.md §2): initialization order, the accessor
//! surface an embedder (HTTP API, CLI, trigger wiring) builds against, and
//! graceful shutdown.
//!
//! The orchestrator owns every long-lived collaborator the rest of the
//! crate is built around — the [`ModelFactory`] cache, the
//! [`ConversationStore`], [`LongTermMemory`], and one [`AgentExecutor`] per
//! declared agent — and is the thing that starts and stops the background
//! services (integration connectors, cron triggers) uniformly. Workspace
//! discovery (walking a directory of agent YAML files) stays outside this
//! crate per spec.md §1; the orchestrator is handed already-parsed
//! [`AgentDefinition`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::agent::{AgentDefinition, AgentExecutor, AgentExecutorDeps, AgentResult, InvokeInput};
use crate::error::AgentError;
use crate::integrations::BackgroundService;
use crate::llm::{CancelToken, ModelFactory};
use crate::memory::LongTermMemory;
use crate::store::ConversationStore;
use crate::triggers::{AgentInvoker, WebhookRegistry};

/// Knobs that don't belong to any single agent: session bounds and the
/// workspace root long-term memory is rooted under (spec.md §4.5, §4.6).
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub max_messages_per_session: usize,
    pub session_ttl: Option<Duration>,
    pub workspace_root: std::path::PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_messages_per_session: 200, session_ttl: None, workspace_root: std::path::PathBuf::from(".") }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("duplicate agent name: {0}")]
    DuplicateAgent(String),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Root object: holds every [`AgentExecutor`] and the shared collaborators
/// they were built from, plus the set of background services (integration
/// connectors, cron triggers) spawned alongside them.
pub struct Orchestrator {
    agents: HashMap<String, Arc<AgentExecutor>>,
    store: Arc<ConversationStore>,
    memory: Arc<LongTermMemory>,
    model_factory: Arc<ModelFactory>,
    webhooks: Arc<WebhookRegistry>,
    services: Vec<Arc<dyn BackgroundService>>,
    cancel: CancelToken,
    service_handles: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    /// Loads process environment from `.env` (best-effort, via the
    /// `dotenv` crate) and XDG config (via `env_config`, applied only to
    /// keys not already set), then constructs the shared
    /// collaborators: [`ModelFactory`], [`ConversationStore`],
    /// [`LongTermMemory`]. Call [`OrchestratorBuilder::register_agent`] to
    /// populate agents before [`Orchestrator::start`].
    pub fn bootstrap(app_name: &str, model_factory: ModelFactory, config: OrchestratorConfig) -> OrchestratorBuilder {
        dotenv::dotenv().ok();
        if let Err(e) = env_config::load_and_apply(app_name, Some(config.workspace_root.as_path())) {
            warn!(error = %e, "failed to load .env/XDG config; continuing with process environment as-is");
        }

        let store = ConversationStore::new(config.max_messages_per_session, config.session_ttl);
        let memory = Arc::new(LongTermMemory::new(&config.workspace_root));

        OrchestratorBuilder {
            model_factory: Arc::new(model_factory),
            store,
            memory,
            agents: HashMap::new(),
            webhooks: Arc::new(WebhookRegistry::new()),
            services: Vec::new(),
        }
    }

    pub fn agent(&self, name: &str) -> Option<Arc<AgentExecutor>> {
        self.agents.get(name).cloned()
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn memory(&self) -> &Arc<LongTermMemory> {
        &self.memory
    }

    pub fn model_factory(&self) -> &Arc<ModelFactory> {
        &self.model_factory
    }

    pub fn webhooks(&self) -> &Arc<WebhookRegistry> {
        &self.webhooks
    }

    /// Invokes a named agent. This is the accessor surface triggers and an
    /// embedding HTTP layer drive through (spec.md §4.8 `AgentInvoker`).
    pub async fn invoke_agent(
        &self,
        name: &str,
        input: serde_json::Value,
        session_id: Option<String>,
    ) -> Result<AgentResult, OrchestratorError> {
        let executor = self.agent(name).ok_or_else(|| OrchestratorError::AgentNotFound(name.to_string()))?;
        let result = executor
            .invoke(InvokeInput::Options { input, session_id, cancel: None })
            .await?;
        Ok(result)
    }

    /// Spawns every registered background service (spec.md §4.7/§4.8:
    /// channel/email connectors, cron triggers) under one shared cancel
    /// token. Idempotent only in the sense that calling it twice spawns a
    /// second set of tasks — callers should call it once after
    /// registration is complete.
    pub async fn start(&self) {
        let mut handles = self.service_handles.lock().await;
        for service in &self.services {
            let service = Arc::clone(service);
            let cancel = self.cancel.clone();
            let name = service.service_name().to_string();
            info!(service = %name, "starting background service");
            handles.push(tokio::spawn(async move {
                service.run(cancel).await;
            }));
        }
    }

    /// Signals cancellation to every background service and the
    /// conversation store's TTL sweeper, then awaits their tasks.
    /// In-flight agent invocations observe the same cancellation only if
    /// the caller threaded this orchestrator's token into their
    /// [`InvokeInput`] — the orchestrator itself does not force-cancel
    /// invocations it didn't originate.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.store.destroy().await;
        let mut handles = self.service_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!("orchestrator shutdown complete");
    }
}

#[async_trait]
impl AgentInvoker for Orchestrator {
    async fn invoke(
        &self,
        agent_name: &str,
        input: serde_json::Value,
        session_id: Option<String>,
    ) -> Result<AgentResult, AgentError> {
        self.invoke_agent(agent_name, input, session_id).await.map_err(|e| match e {
            OrchestratorError::Agent(err) => err,
            other => AgentError::other(other.to_string()),
        })
    }
}

/// Accumulates agents and background services before the orchestrator is
/// frozen into its running form via [`OrchestratorBuilder::build`].
pub struct OrchestratorBuilder {
    model_factory: Arc<ModelFactory>,
    store: Arc<ConversationStore>,
    memory: Arc<LongTermMemory>,
    agents: HashMap<String, Arc<AgentExecutor>>,
    webhooks: Arc<WebhookRegistry>,
    services: Vec<Arc<dyn BackgroundService>>,
}

impl OrchestratorBuilder {
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn memory(&self) -> &Arc<LongTermMemory> {
        &self.memory
    }

    pub fn model_factory(&self) -> &Arc<ModelFactory> {
        &self.model_factory
    }

    pub fn webhooks(&self) -> &Arc<WebhookRegistry> {
        &self.webhooks
    }

    /// Assembles and registers one agent (spec.md §4.3 construction steps).
    /// Rejects a duplicate name rather than silently shadowing an earlier
    /// registration — agent definitions are owned by the orchestrator and
    /// meant to be unambiguous.
    pub async fn register_agent(
        &mut self,
        definition: AgentDefinition,
        deps: AgentExecutorDeps,
    ) -> Result<(), OrchestratorError> {
        if self.agents.contains_key(&definition.name) {
            return Err(OrchestratorError::DuplicateAgent(definition.name.clone()));
        }
        let mut deps = deps;
        deps.store.get_or_insert_with(|| self.store.clone());
        deps.memory.get_or_insert_with(|| self.memory.clone());

        let name = definition.name.clone();
        let executor = AgentExecutor::new(definition, &self.model_factory, deps).await?;
        self.agents.insert(name, Arc::new(executor));
        Ok(())
    }

    pub fn add_service(&mut self, service: Arc<dyn BackgroundService>) {
        self.services.push(service);
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            agents: self.agents,
            store: self.store,
            memory: self.memory,
            model_factory: self.model_factory,
            webhooks: self.webhooks,
            services: self.services,
            cancel: CancelToken::new(),
            service_handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::definition::{LlmRef, PromptConfig};
    use crate::llm::ModelConfig;

    fn definition(name: &str) -> AgentDefinition {
        AgentDefinition {
            name: name.to_string(),
            description: String::new(),
            version: "1.0.0".into(),
            llm: LlmRef::Name("gpt4".into()),
            prompt: PromptConfig { system: "be nice".into(), input_variables: vec!["q".into()] },
            tools: Vec::new(),
            skills: None,
            output: None,
            memory: None,
            integrations: Vec::new(),
            triggers: Vec::new(),
        }
    }

    fn model_factory() -> ModelFactory {
        let mut configs = HashMap::new();
        configs.insert(
            "gpt4".to_string(),
            ModelConfig::OpenAi { model: "gpt-4o-mini".into(), api_key: "test-key".into(), base_url: None },
        );
        ModelFactory::new(configs)
    }

    async fn orchestrator_with_one_agent(name: &str) -> Orchestrator {
        let config = OrchestratorConfig { workspace_root: std::env::temp_dir(), ..Default::default() };
        let mut builder = Orchestrator::bootstrap("loom-test", model_factory(), config);
        builder.register_agent(definition(name), AgentExecutorDeps::default()).await.unwrap();
        builder.build()
    }

    #[tokio::test]
    async fn register_agent_rejects_duplicate_name() {
        let config = OrchestratorConfig { workspace_root: std::env::temp_dir(), ..Default::default() };
        let mut builder = Orchestrator::bootstrap("loom-test", model_factory(), config);
        builder.register_agent(definition("greeter"), AgentExecutorDeps::default()).await.unwrap();
        let err = builder.register_agent(definition("greeter"), AgentExecutorDeps::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateAgent(n) if n == "greeter"));
    }

    #[tokio::test]
    async fn invoke_agent_rejects_unknown_name() {
        let orch = orchestrator_with_one_agent("greeter").await;
        let err = orch.invoke_agent("nope", serde_json::json!({}), None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AgentNotFound(n) if n == "nope"));
        assert_eq!(orch.agent_names(), vec!["greeter"]);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let orch = orchestrator_with_one_agent("greeter").await;
        orch.shutdown().await;
        orch.shutdown().await;
    }
}
