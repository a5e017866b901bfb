use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use graphpilot::config::AppConfig;
use graphpilot::events::{AgentEvent, DEFAULT_SUBSCRIBER_CAPACITY};
use graphpilot::executor::summary_lines;
use graphpilot::llm::LlmClient;
use graphpilot::planner::Planner;
use graphpilot::registry::{TaskOptions, TaskRegistry};
use graphpilot::server;
use graphpilot::tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "graphpilot", about = "Goal-directed web automation engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket server.
    Serve {
        /// Bind address, e.g. 127.0.0.1:8700.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Execute a single task and print its summary.
    Run {
        /// Natural-language goal.
        description: String,
        /// Run the browser headless.
        #[arg(long)]
        headless: Option<bool>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_registry(config: &AppConfig) -> Arc<TaskRegistry> {
    let planner = Arc::new(Planner::new(Arc::new(LlmClient::new(config))));
    let tools = Arc::new(ToolRegistry::with_local_tools());
    let bus = Arc::new(graphpilot::events::EventBus::new());
    Arc::new(TaskRegistry::new(planner, tools, bus, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command {
        Commands::Serve { bind } => {
            let registry = build_registry(&config);
            let bind_addr = bind.unwrap_or_else(|| config.bind_addr.clone());
            server::serve(registry, &bind_addr).await
        }
        Commands::Run {
            description,
            headless,
        } => run_once(&config, &description, headless).await,
    }
}

async fn run_once(config: &AppConfig, description: &str, headless: Option<bool>) -> Result<()> {
    let registry = build_registry(config);
    let task_id = Uuid::new_v4().to_string();
    let mut events = registry
        .bus()
        .subscribe(&task_id, DEFAULT_SUBSCRIBER_CAPACITY);

    registry.create(
        description,
        TaskOptions {
            task_id: Some(task_id.clone()),
            headless,
            ..TaskOptions::default()
        },
    )?;

    // Stream progress until the terminal task update arrives.
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::Log(entry) => {
                println!("[{:?}] {}", entry.severity, entry.message);
            }
            AgentEvent::NodeUpdate { node } => {
                println!(
                    "node {} -> {:?} ({})",
                    node.node_id, node.current_status, node.action.tool_name
                );
            }
            AgentEvent::TaskUpdate { task } if task.status.is_terminal() => break,
            _ => {}
        }
    }

    if let Some(execution) = registry.get(&task_id) {
        println!();
        for line in summary_lines(&execution) {
            println!("{line}");
        }
    }
    Ok(())
}
