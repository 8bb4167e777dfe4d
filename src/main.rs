use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use dotenv::dotenv;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use mcp_chat::{
    AppConfig, ChatClient, Console, ConversationLoop, FunctionInvocationOptions, McpClientManager,
    StatsTracker, ToolCallingClient, ToolProvider, ToolRegistry,
};

fn init_logging(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    // The console belongs to the conversation, so logs go to the file.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv().ok();

    let config = AppConfig::from_env()?;
    init_logging(&config.log_file)?;

    let mut console = Console::styled(io::stdout());

    let provider = match &config.mcp {
        Some(mcp) => match McpClientManager::connect(mcp.clone()).await {
            Ok(manager) => {
                tracing::info!(servers = manager.server_count(), "tool provider connected");
                Some(Arc::new(manager))
            }
            Err(e) => {
                tracing::error!("failed to start tool provider: {:#}", e);
                console.error(&format!("Tool provider unavailable, continuing without tools: {:#}", e))?;
                None
            }
        },
        None => None,
    };

    let tools = match &provider {
        Some(manager) => ToolRegistry::load(manager.as_ref()).await,
        None => ToolRegistry::default(),
    };

    let stats = StatsTracker::new();
    stats.set_available_tools(tools.names());

    let mut client = ToolCallingClient::new(config.backend.build(tools.definitions()))
        .with_options(FunctionInvocationOptions {
            max_iterations: config.max_tool_iterations,
            allow_concurrent_invocation: false,
        })
        .with_stats(stats.clone());
    if let Some(manager) = &provider {
        client = client.with_tool_provider(Arc::clone(manager) as Arc<dyn ToolProvider>);
    }

    tracing::info!(
        backend = client.inner().client_name(),
        tools = tools.len(),
        max_iterations = config.max_tool_iterations,
        "starting chat session"
    );
    console.banner(client.inner().client_name(), tools.len())?;

    let input = BufReader::new(tokio::io::stdin());
    let mut conversation = ConversationLoop::new(client, tools, stats, input, console);
    if let Some(prompt) = config.load_system_prompt() {
        tracing::info!(path = %config.system_prompt_file.display(), "system prompt loaded");
        conversation = conversation.with_system_prompt(prompt);
    }

    let result = conversation.run().await;

    if let Some(manager) = provider {
        manager.shutdown().await;
    }
    result?;

    println!("Goodbye!");
    Ok(())
}
