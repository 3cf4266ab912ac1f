use conversational_agent::{
    agent::ChatAgent,
    api::start_server,
    config::AgentConfig,
    scheduler::{run_due_tasks, Scheduler, TaskRunner},
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load environment variables
    let config = AgentConfig::from_env()?;

    if !config.has_api_key() {
        warn!("GEMINI_API_KEY not set; chat requests will be rejected until it is configured");
    }

    let port = config.port;

    info!("Conversational Agent - API Server");
    info!(port, model = %config.model, "Configuration loaded");

    // Create components
    let (scheduler, due_rx) = Scheduler::new();
    let agent = Arc::new(ChatAgent::from_config(config, scheduler)?);

    let runner: Arc<dyn TaskRunner> = agent.clone();
    tokio::spawn(run_due_tasks(due_rx, runner));

    info!(tools = ?agent.registry().list(), "Agent initialized");
    info!("Starting API server...");

    // Start API server
    start_server(agent, port).await?;

    Ok(())
}
