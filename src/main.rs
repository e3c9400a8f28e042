use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trellis_core::config::AppConfig;
use trellis_core::event::EventStream;
use trellis_core::graph::GraphDefinition;
use trellis_core::session::Session;
use trellis_core::types::Payload;

use trellis_engine::builtin::PassthroughProcessor;
use trellis_engine::{CircuitBreaker, Engine, InMemorySessionRepository, NodeRegistry, PersistQueue};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Workflow graph orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph definition for structural errors
    Validate {
        /// Graph definition (JSON)
        graph: PathBuf,
    },
    /// Execute a graph with passthrough processors, printing every event
    DryRun {
        /// Graph definition (JSON)
        graph: PathBuf,
        /// Session input as key=value (value parsed as JSON when possible)
        #[arg(short, long = "input")]
        inputs: Vec<String>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        AppConfig::default()
    };

    // Events go to stdout, logs to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { graph } => validate(&graph),
        Commands::DryRun { graph, inputs } => dry_run(&config, &graph, &inputs).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_graph(path: &Path) -> anyhow::Result<GraphDefinition> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading graph {}", path.display()))?;
    let graph = GraphDefinition::from_json(&json)
        .with_context(|| format!("parsing graph {}", path.display()))?;
    Ok(graph)
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let graph = load_graph(path)?;
    graph.validate()?;

    let edges: usize = graph.nodes.values().map(|n| n.next_ids.len()).sum();
    let parallel = graph.nodes.values().filter(|n| n.is_parallel()).count();
    let loops = graph.nodes.values().filter(|n| n.is_loop()).count();
    println!(
        "{} ({}): {} nodes, {} edges, {} parallel, {} loop, start at {}",
        graph.name,
        graph.id,
        graph.nodes.len(),
        edges,
        parallel,
        loops,
        graph.start_node_id
    );
    Ok(())
}

fn parse_inputs(pairs: &[String]) -> anyhow::Result<Payload> {
    let mut inputs = Payload::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("input '{}' is not key=value", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.trim().to_string(), value);
    }
    Ok(inputs)
}

/// Registry for dry runs: control-flow builtins, everything else passes
/// its input through. `wait` is satisfied immediately.
fn dry_run_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::with_builtins();
    registry.register("wait", |_, _| Ok(Arc::new(PassthroughProcessor)));
    registry.set_fallback(|_, _| Ok(Arc::new(PassthroughProcessor)));
    registry
}

async fn dry_run(config: &AppConfig, path: &Path, pairs: &[String]) -> anyhow::Result<()> {
    let graph = Arc::new(load_graph(path)?);
    let inputs = parse_inputs(pairs)?;
    let session = Arc::new(Session::new(graph, inputs));

    let (events, mut rx) = EventStream::new(config.engine.event_buffer, config.engine.backpressure);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Unprintable event"),
            }
        }
    });

    let repo = Arc::new(InMemorySessionRepository::new());
    let queue = PersistQueue::spawn(
        repo.clone(),
        config.persistence.queue_capacity,
        config.persistence.max_in_flight,
    );

    let engine = Engine::builder(session.clone(), events.clone())
        .factory(dry_run_registry())
        .middleware(CircuitBreaker::new(config.safety.max_node_visits))
        .persistence(queue.clone())
        .build();

    info!(session_id = %session.id(), "Dry run started");
    let result = engine.run().await;
    let suspended = engine.suspended_nodes().await;
    let dropped = events.dropped();
    drop(events);
    drop(engine);
    printer.await?;
    queue.wait_idle().await;

    eprintln!("session {}: {}", session.id(), session.status().await);
    if !suspended.is_empty() {
        eprintln!("suspended: {}", suspended.join(", "));
    }
    if dropped > 0 {
        eprintln!("events dropped under back-pressure: {}", dropped);
    }
    eprintln!("status writes persisted: {}", repo.writes());

    result?;
    Ok(())
}
