//! Minimal wiring binary for the agent development kit core (§1 Non-goals:
//! no bot/webhook/dashboard surface — just enough assembly to drive
//! `AgentRuntime::handle` from stdin).
//!
//! Grounded on `openintent-cli::main`/`repl::cmd_run`'s construct-then-run
//! shape, trimmed to the pieces this core actually needs: a store, an
//! embedding-backed semantic index, a tool registry, a task orchestrator
//! with its worker pool, and the runtime itself.

mod embedding_adapter;
mod llm_adapter;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use adk_core::config::Config;
use adk_core::events::EventBus;
use adk_core::interfaces::{EventSink, KeyValueStore, LLMProvider, Sandbox};
use adk_core::model::Role;
use adk_runtime::{AgentRuntime, HandleRequest, HandleResponse, RequestContext};
use adk_sandbox::{WasmSandbox, WasmSandboxConfig};
use adk_semantic::{EmbeddingService, SemanticIndex};
use adk_store::DocumentStore;
use adk_tasks::{RepairLoop, StaticValidator, TaskOrchestrator, TaskWorker};
use adk_tools::tools::{HttpRequestTool, ReadFileTool, ShellExecuteTool};
use adk_tools::{Dispatcher, ToolRegistry};

use crate::embedding_adapter::{OpenAiEmbeddingConfig, OpenAiEmbeddingProvider};
use crate::llm_adapter::AnthropicLlmProvider;

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info");

    let config = match env_non_empty("ADK_CONFIG_PATH") {
        Some(path) => Config::from_file(std::path::Path::new(&path))
            .context("failed to load config file")?,
        None => Config::default(),
    };

    let anthropic_key = env_non_empty("ANTHROPIC_API_KEY")
        .context("ANTHROPIC_API_KEY must be set")?;
    let model = env_non_empty("ADK_MODEL").unwrap_or_else(|| "claude-sonnet-4-5".to_string());
    let llm: Arc<dyn LLMProvider> = Arc::new(
        AnthropicLlmProvider::new(anthropic_key, model).context("failed to build LLM provider")?,
    );

    let embeddings_key = env_non_empty("OPENAI_API_KEY")
        .context("OPENAI_API_KEY must be set for the embedding provider")?;
    let embedding_model =
        env_non_empty("ADK_EMBEDDING_MODEL").unwrap_or_else(|| "text-embedding-3-small".to_string());
    let embedding_provider = Arc::new(
        OpenAiEmbeddingProvider::new(OpenAiEmbeddingConfig::new(embeddings_key, embedding_model))
            .context("failed to build embedding provider")?,
    );
    let embeddings = Arc::new(EmbeddingService::new(
        embedding_provider,
        config.embedding.cache_capacity,
        Duration::from_millis(config.embedding.cache_ttl_ms),
    ));
    embeddings.spawn_report_loop(Duration::from_millis(config.embedding.metrics_report_ms));

    let store: Arc<dyn KeyValueStore> = Arc::new(DocumentStore::new());
    let events: Arc<dyn EventSink> = Arc::new(EventBus::new(1024));

    let semantic = Arc::new(SemanticIndex::new(
        Arc::clone(&embeddings),
        config.embedding.cache_capacity,
        Duration::from_millis(config.embedding.cache_ttl_ms),
    ));

    let tools = ToolRegistry::new();
    let work_dir = std::env::temp_dir().join("adk-cli-workspace");
    std::fs::create_dir_all(&work_dir).context("failed to create tool working directory")?;
    tools.register(Arc::new(ShellExecuteTool::new(
        work_dir.clone(),
        vec![Role::Admin],
    )));
    tools.register(Arc::new(HttpRequestTool::new(vec![Role::User, Role::Admin])));
    tools.register(Arc::new(ReadFileTool::new(
        work_dir.clone(),
        vec![Role::User, Role::Admin],
    )));

    let dispatcher = Arc::new(Dispatcher::new(tools.clone(), Arc::clone(&events)));

    let orchestrator = Arc::new(TaskOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&llm),
        Arc::clone(&events),
        config.task.clone(),
    ));

    let sandbox_config = WasmSandboxConfig::new();
    let sandbox = Arc::new(
        WasmSandbox::with_collaborators(sandbox_config, Some(Arc::clone(&llm)), Some(Arc::clone(&store)))
            .context("failed to initialize the wasm sandbox")?,
    );
    let validator = StaticValidator::new(config.task.max_script_bytes);
    let repair_loop = Arc::new(RepairLoop::new(
        Arc::clone(&store),
        Arc::clone(&llm),
        Arc::clone(&semantic),
        validator,
        config.task.max_repairs,
    ));

    for n in 0..config.task.workers {
        let worker = TaskWorker::new(
            format!("worker-{n}"),
            (*orchestrator).clone(),
            Arc::clone(&sandbox) as Arc<dyn Sandbox>,
            Arc::clone(&repair_loop),
        );
        tokio::spawn(async move { worker.run().await });
    }

    let runtime = Arc::new(AgentRuntime::new(
        llm,
        store,
        events,
        semantic,
        tools,
        dispatcher,
        orchestrator,
        config.plan.clone(),
        config.retrieval.clone(),
    ));

    info!("adk-cli ready, reading requests from stdin (one message per line)");
    run_stdin_loop(runtime).await
}

/// Reads one message per line from stdin, drives it through
/// `AgentRuntime::handle` as a single user in a single conversation, and
/// prints the response. There is no session/channel abstraction here by
/// design (§1 Non-goals) — this binary exists to exercise the runtime, not
/// to be a product surface.
async fn run_stdin_loop(runtime: Arc<AgentRuntime>) -> Result<()> {
    let conversation_id = Uuid::new_v4().to_string();
    let user_id = env_non_empty("ADK_USER_ID").unwrap_or_else(|| "local-user".to_string());
    let role = if env_non_empty("ADK_ADMIN").is_some() {
        Role::Admin
    } else {
        Role::User
    };

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        line.clear();
        let bytes = stdin.read_line(&mut line).context("failed to read from stdin")?;
        if bytes == 0 {
            break;
        }
        let message = line.trim().to_string();
        if message.is_empty() {
            continue;
        }

        let ctx = RequestContext::default();
        let req = HandleRequest {
            user_id: user_id.clone(),
            role,
            conversation_id: conversation_id.clone(),
            message,
            platform_hint: Some("cli".to_string()),
        };

        match runtime.handle(&ctx, req).await {
            Ok(HandleResponse::Answer { text }) => println!("{text}"),
            Ok(HandleResponse::TaskSubmitted { task_id, acknowledgement }) => {
                println!("{acknowledgement} (task {task_id})")
            }
            Err(err) => println!("error: {err}"),
        }
    }

    Ok(())
}
