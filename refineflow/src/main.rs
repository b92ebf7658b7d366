//! refineflow command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use refineflow::backend::HttpBackend;
use refineflow::config::RefineflowConfig;
use refineflow::core::Stage;
use refineflow::events::LoggingEventSink;
use refineflow::observability::{init_tracing, LogFormat};
use refineflow::pipeline::Pipeline;
use serde::Serialize;

/// Staged suggestion, critique, reflection and refinement over chat models
#[derive(Parser)]
#[command(name = "refineflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = r#"
Runs the refinement pipeline over a work directory.

Examples:
  refineflow run                         # run every stage in order
  refineflow run --stages critique       # run one stage
  refineflow status consolidate          # prepared / completed / pending
  refineflow review                      # judge pass over refinement wins
  refineflow stats --compare a.jsonl b.jsonl
"#)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "REFINEFLOW_CONFIG", default_value = "refineflow.json")]
    config: PathBuf,

    /// Log output format (text or json)
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run stages in dependency order
    Run {
        /// Stages to run; defaults to all of them
        #[arg(short, long, value_delimiter = ',')]
        stages: Vec<Stage>,
    },

    /// Show progress of a stage
    Status {
        /// Stage name
        stage: Stage,
    },

    /// Send refinement wins to the judge backend
    Review,

    /// Show reflection acceptance statistics
    Stats {
        /// Reflection output stores of several runs to compare instead
        #[arg(long, num_args = 2..)]
        compare: Vec<PathBuf>,
    },

    /// Show consolidation verdict counts
    Tally,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, "info")?;

    let config = RefineflowConfig::from_path(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let pipeline = Pipeline::new(config, Arc::new(HttpBackend::new()))
        .with_sink(Arc::new(LoggingEventSink::debug()));

    match cli.command {
        Commands::Run { stages } => {
            let stages = if stages.is_empty() {
                Stage::ALL.to_vec()
            } else {
                stages
            };
            let reports = pipeline.run(&stages).await?;
            print_json(&reports)?;
            if reports.iter().any(|report| report.summary.has_failures()) {
                std::process::exit(2);
            }
        }
        Commands::Status { stage } => print_json(&pipeline.status(stage).await?)?,
        Commands::Review => print_json(&pipeline.review().await?)?,
        Commands::Stats { compare } if compare.is_empty() => {
            print_json(&pipeline.reflection_stats().await?)?;
        }
        Commands::Stats { compare } => print_json(&pipeline.critique_agreement(&compare).await?)?,
        Commands::Tally => print_json(&pipeline.tally().await?)?,
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
