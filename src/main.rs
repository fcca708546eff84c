use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strata_core::config::StrataConfig;
use strata_core::event::EventBus;
use strata_core::state::State;
use strata_core::trace::{RunId, RunStatus, TraceEvent};
use strata_engine::{GraphDefinition, GraphExecutor, TraceLogger};

#[derive(Parser)]
#[command(name = "strata", version, about = "Superstep graph execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strata.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph and print the final state
    Run {
        /// Graph definition (TOML)
        graph: PathBuf,
        /// Start node (defaults to the graph's `start`, then its first node)
        #[arg(long)]
        start: Option<String>,
        /// Initial state as a JSON object
        #[arg(long)]
        state: Option<String>,
        /// Print the trace as JSON lines on stderr
        #[arg(long)]
        trace: bool,
    },
    /// Check that a graph definition builds
    Validate {
        /// Graph definition (TOML)
        graph: PathBuf,
        /// Start node to check
        #[arg(long)]
        start: Option<String>,
    },
    /// Print a graph in Graphviz dot format
    Dot {
        /// Graph definition (TOML)
        graph: PathBuf,
    },
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strata=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "strata", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            graph,
            start,
            state,
            trace,
        } => run_graph(&graph, start, state, trace, config).await,
        Commands::Validate { graph, start } => {
            let definition = GraphDefinition::load(&graph)?;
            let built = definition.build()?;
            let start = resolve_start(&definition, start)?;
            built.validate(&start)?;
            println!(
                "{}: {} nodes, {} edges, start '{}'",
                graph.display(),
                built.len(),
                built.edges().len(),
                start
            );
            Ok(())
        }
        Commands::Dot { graph } => {
            let built = GraphDefinition::load(&graph)?.build()?;
            print!("{}", built.to_dot());
            Ok(())
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

fn load_config(path: &Path) -> anyhow::Result<StrataConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(StrataConfig::load(path)?)
    } else {
        Ok(StrataConfig::default())
    }
}

fn resolve_start(definition: &GraphDefinition, start: Option<String>) -> anyhow::Result<String> {
    start
        .or_else(|| definition.start_node().map(String::from))
        .ok_or_else(|| anyhow::anyhow!("graph has no nodes to start from"))
}

async fn run_graph(
    path: &Path,
    start: Option<String>,
    initial: Option<String>,
    print_trace: bool,
    config: StrataConfig,
) -> anyhow::Result<()> {
    let definition = GraphDefinition::load(path)?;
    let graph = definition.build()?;
    let start = resolve_start(&definition, start)?;
    let initial = match initial {
        Some(json) => State::from_json(serde_json::from_str(&json)?)?,
        None => State::new(),
    };

    let run_id = RunId::new();
    let mut executor = GraphExecutor::new(graph).with_config(config.clone());

    // JSONL trace sink, subscribed before the run starts
    let cancel = CancellationToken::new();
    let logger = match config.trace.log_dir().filter(|_| config.trace.enabled) {
        Some(dir) => {
            let bus = Arc::new(EventBus::default());
            let rx = bus.subscribe();
            executor = executor.with_event_bus(bus);
            Some(tokio::spawn(
                TraceLogger::new(dir).run(rx, run_id.clone(), cancel.clone()),
            ))
        }
        None => None,
    };

    let outcome = executor.run_with_id(run_id, initial, &start).await;

    if let Some(handle) = logger {
        match handle.await {
            Ok(Ok(path)) => info!(path = %path.display(), "Trace written"),
            Ok(Err(e)) => warn!(error = %e, "Trace logger failed"),
            Err(e) => warn!(error = %e, "Trace logger task panicked"),
        }
    }
    cancel.cancel();

    match outcome {
        Ok(result) => {
            if print_trace {
                print_trace_lines(&result.trace)?;
            }
            if result.status == RunStatus::BudgetExhausted {
                warn!(
                    steps = result.steps,
                    "Run stopped at the step budget before the graph finished"
                );
            }
            eprintln!(
                "run {} {:?} after {} step(s) in {}ms",
                result.run_id, result.status, result.steps, result.total_elapsed_ms
            );
            println!("{}", serde_json::to_string_pretty(&result.state)?);
            Ok(())
        }
        Err(run_error) => {
            if print_trace {
                print_trace_lines(&run_error.trace)?;
            }
            eprintln!(
                "State before the failing step:\n{}",
                serde_json::to_string_pretty(&run_error.state)?
            );
            Err(run_error.into())
        }
    }
}

fn print_trace_lines(trace: &[TraceEvent]) -> anyhow::Result<()> {
    for event in trace {
        eprintln!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}
