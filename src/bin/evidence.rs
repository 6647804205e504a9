#![forbid(unsafe_code)]

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use evidence_harness::action_log::{ActionSink, JsonlActionSink, NoopActionSink};
use evidence_harness::citation::segment;
use evidence_harness::config::PipelineConfig;
use evidence_harness::gateway::{MemoryUsageSink, ProviderGateway};
use evidence_harness::narration::TracingStatusSink;
use evidence_harness::pipeline::Pipeline;
use evidence_harness::vector_store::HttpVectorStore;

#[derive(Parser)]
#[command(name = "evidence", version, about = "Evidence-gathering answer pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one question against the configured vector store
    Ask {
        #[arg(long)]
        question: String,
        /// Pipeline config (JSON); defaults apply to missing fields
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the run report as JSON instead of printing the answer
        #[arg(long)]
        out: Option<PathBuf>,
        /// Write one JSON line per agent call to this file
        #[arg(long)]
        actions: Option<PathBuf>,
    },
    /// Print the typed segments of a markdown answer as JSON
    Segment {
        #[arg(long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ask {
            question,
            config,
            out,
            actions,
        } => {
            let mut config = match config {
                Some(path) => PipelineConfig::from_path(path)?,
                None => PipelineConfig::default(),
            };
            if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
                config.embedding_model = model;
            }

            let usage = Arc::new(MemoryUsageSink::new());
            let gateway = Arc::new(ProviderGateway::from_env(usage.clone())?);
            if !gateway.has_embedder() {
                return Err("OPENAI_API_KEY is required for embeddings".into());
            }
            let store = Arc::new(HttpVectorStore::from_env()?);

            let (action_sink, worker) = match actions {
                Some(path) => {
                    let (sink, worker) = JsonlActionSink::new(path)?;
                    (Arc::new(sink) as Arc<dyn ActionSink>, Some(worker))
                }
                None => (Arc::new(NoopActionSink) as Arc<dyn ActionSink>, None),
            };

            let pipeline = Pipeline::new(config, gateway.clone(), gateway, store)?
                .with_status_sink(Arc::new(TracingStatusSink))
                .with_action_sink(action_sink);
            let result = pipeline.run(&question).await;

            // Close the channel before joining the writer.
            drop(pipeline);
            if let Some(worker) = worker {
                worker.join()?;
            }
            let output = result?;

            let totals = usage.totals(Some(output.request_id));
            eprintln!(
                "[evidence] {} provider calls ({} failed), {} nanodollars",
                totals.calls, totals.failed_calls, totals.cost_nanodollars
            );

            match out {
                Some(path) => {
                    write_json(&path, &output)?;
                    eprintln!("[evidence] report written to {}", path.display());
                }
                None => println!("{}", output.answer),
            }
        }
        Commands::Segment { input } => {
            let text = std::fs::read_to_string(input)?;
            let segments = segment(&text);
            println!("{}", serde_json::to_string_pretty(&segments)?);
        }
    }

    Ok(())
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
