//! Wires the settings in a loaded [`MamaConfig`] into the live object graph:
//! store, sandbox, router, scheduler, heartbeat, and the agent loop itself.
//! Grounded on the teacher's own `hub.rs` (the one place it built an LLM
//! client and its config together), generalized from "one provider, one
//! terminal session" into the full daemon graph.

use std::path::PathBuf;
use std::sync::Arc;

use mama_core::agent::tools::ToolRegistry;
use mama_core::agent::{AgentLoop, AgentLoopDeps, NoopAgentEventSink};
use mama_core::config::MamaConfig;
use mama_core::error::Result;
use mama_core::heartbeat::{Heartbeat, HeartbeatConfig};
use mama_core::llm::{CloudProvider, CostTracker, LlmProviderClient, LocalProvider, ModelSelection, Router as LlmRouter, TaskType};
use mama_core::memory::{ConsolidatedMemoryStore, EmbeddingService, EpisodicStore, SoulDocument};
use mama_core::sandbox::filesystem::{FilesystemCapability, FilesystemConfig};
use mama_core::sandbox::network::{NetworkCapability, NetworkConfig};
use mama_core::sandbox::shell::{ShellCapability, ShellConfig};
use mama_core::sandbox::{AuditStore, Sandbox};
use mama_core::scheduler::{JobStore, RunTask, ScheduleParser, Scheduler};
use mama_core::store::Store;

const ROUTABLE_TASK_TYPES: &[TaskType] = &[
    TaskType::ComplexReasoning,
    TaskType::CodeGeneration,
    TaskType::SimpleTasks,
    TaskType::Embeddings,
    TaskType::MemoryConsolidation,
    TaskType::PrivateContent,
    TaskType::General,
];

/// Everything the binary's subcommands and the daemon supervisor need.
pub struct App {
    pub home: PathBuf,
    pub config: MamaConfig,
    pub agent: Arc<AgentLoop>,
    pub scheduler: Arc<Scheduler>,
    pub heartbeat: Arc<Heartbeat>,
    pub llm_router: Arc<LlmRouter>,
    pub audit: Arc<AuditStore>,
    pub memories: ConsolidatedMemoryStore,
    pub embeddings: Arc<EmbeddingService>,
    pub sandbox: Arc<Sandbox>,
    pub soul: SoulDocument,
}

pub async fn build(config: MamaConfig, home: PathBuf) -> Result<App> {
    tokio::fs::create_dir_all(&home).await?;

    let store = Store::open(home.join("mama.db")).await?;
    let audit = Arc::new(AuditStore::new(store.clone()));

    let cost_tracker = CostTracker::new(store.clone());
    let mut router = LlmRouter::new(cost_tracker);
    for (name, provider) in &config.providers {
        let models = ModelSelection {
            default_model: provider.default_model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
            smart_model: provider.smart_model.clone(),
            fast_model: provider.fast_model.clone(),
            embedding_model: provider.embedding_model.clone(),
        };
        let client: Arc<dyn LlmProviderClient> = match provider.kind.as_str() {
            "local" => Arc::new(LocalProvider::new(provider.base_url.clone().unwrap_or_default())),
            _ => {
                let base_url = provider.base_url.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string());
                let mut cloud = CloudProvider::new(base_url, provider.api_key.clone());
                if let Some(embedding_model) = &models.embedding_model {
                    cloud = cloud.with_embeddings(embedding_model.clone());
                }
                Arc::new(cloud)
            }
        };
        router.register_provider(name.clone(), client, models);
    }
    for task_type in ROUTABLE_TASK_TYPES.iter().copied() {
        if let Some(provider_name) = config.routing_for(task_type) {
            router.set_route(task_type, provider_name.to_string());
        }
    }
    let llm_router = Arc::new(router);

    let embeddings = Arc::new(EmbeddingService::new(llm_router.clone()));
    let episodes = EpisodicStore::new(store.clone(), embeddings.clone());
    let memories = ConsolidatedMemoryStore::new(store.clone());

    let sandbox = Arc::new(Sandbox::new(AuditStore::new(store.clone())));
    sandbox
        .register(Arc::new(FilesystemCapability::new(FilesystemConfig {
            workspace_root: home.join("workspace"),
            allow_rules: vec![],
            denied_globs: vec![],
        })))
        .await;
    sandbox.register(Arc::new(ShellCapability::new(ShellConfig::default()))).await;
    sandbox
        .register(Arc::new(NetworkCapability::new(NetworkConfig {
            allowed_domains: vec![],
            ask_domains: true,
            rate_limit_per_minute: 60,
            log_all_requests: true,
        })))
        .await;

    let tools = ToolRegistry::with_builtins();

    let jobs = JobStore::new(store.clone());
    let parser = ScheduleParser::new(Some(llm_router.clone()));

    // The scheduler's and heartbeat's `RunTask` closures call back into the
    // agent loop, but the agent loop itself needs a constructed scheduler
    // (to surface jobs as retrieval candidates). The cell below breaks that
    // cycle: the closures capture it and only resolve it once a task
    // actually runs, by which point `build` has filled it in.
    let agent_cell: Arc<tokio::sync::OnceCell<Arc<AgentLoop>>> = Arc::new(tokio::sync::OnceCell::new());
    let soul_path = home.join("soul.md");
    let run_task: RunTask = {
        let agent_cell = agent_cell.clone();
        let soul_path = soul_path.clone();
        Arc::new(move |task: String| {
            let agent_cell = agent_cell.clone();
            let soul_path = soul_path.clone();
            Box::pin(async move {
                let agent = agent_cell.get().expect("agent loop initialized before any task runs").clone();
                let soul = SoulDocument::load(&soul_path).await?;
                let result = agent.handle_message(&task, "scheduled", &soul, &NoopAgentEventSink).await?;
                Ok(result.content)
            })
        })
    };

    let scheduler = Arc::new(Scheduler::new(jobs, parser, audit.clone(), run_task.clone()));

    let heartbeat_settings = config.heartbeat.clone().unwrap_or(mama_core::config::HeartbeatSettings {
        enabled: true,
        interval_minutes: 30,
    });
    let heartbeat = Arc::new(Heartbeat::new(
        HeartbeatConfig {
            interval_minutes: heartbeat_settings.interval_minutes,
            checklist_path: home.join("heartbeat.md"),
        },
        audit.clone(),
        run_task,
    ));

    let deps = AgentLoopDeps {
        router: llm_router.clone(),
        embeddings: embeddings.clone(),
        episodes,
        memories: memories.clone(),
        sandbox: Some(sandbox.clone()),
        scheduler: scheduler.clone(),
        tools,
    };
    let agent = Arc::new(AgentLoop::new(deps));
    let _ = agent_cell.set(agent.clone());

    let soul = SoulDocument::load(&soul_path).await?;

    Ok(App {
        home,
        config,
        agent,
        scheduler,
        heartbeat,
        llm_router,
        audit,
        memories,
        embeddings,
        sandbox,
        soul,
    })
}
