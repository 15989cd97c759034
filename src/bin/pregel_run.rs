//! pregel-run
//!
//! Runs the bundled PageRank over a generated ring graph and prints the job
//! result as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pregel_bsp::algorithms::{ring_graph, PageRankMasterCompute, SimplePageRank};
use pregel_bsp::pregel::{
    create_checkpointer, CheckpointPolicy, CheckpointerConfig, CollectingWriter, InMemoryGraph, PregelConfig,
    PregelRuntime, VertexWriter,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Pregel job runner
#[derive(Parser, Debug)]
#[command(name = "pregel-run")]
#[command(about = "Run PageRank on a ring graph with the BSP engine")]
#[command(version)]
struct Cli {
    /// Enable verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Vertices in the ring
    #[arg(short = 'n', long, default_value_t = 5)]
    vertices: u64,

    /// Workers launched at job start
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// Compute threads per worker
    #[arg(short, long)]
    threads: Option<usize>,

    /// Partition count (defaults to workers * threads)
    #[arg(short, long)]
    partitions: Option<u32>,

    /// Checkpoint every N supersteps
    #[arg(long)]
    checkpoint_every: Option<u64>,

    /// Store checkpoints under this directory instead of in memory
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Delete checkpoints left in the directory by an earlier job
    #[arg(long)]
    overwrite_checkpoints: bool,

    /// Barrier timeout in seconds
    #[arg(long, default_value_t = 60)]
    barrier_timeout: u64,

    /// Load the job configuration from a JSON file; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Include final vertex values in the output
    #[arg(long)]
    values: bool,
}

impl Cli {
    fn job_config(&self) -> Result<PregelConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => PregelConfig::default(),
        };
        config.num_workers = self.workers;
        config.barrier_timeout = Duration::from_secs(self.barrier_timeout);
        if let Some(threads) = self.threads {
            config.compute_threads = threads;
        }
        if let Some(partitions) = self.partitions {
            config.partition_count = Some(partitions);
        }
        if let Some(every) = self.checkpoint_every {
            config.checkpoint = CheckpointPolicy::every(every);
        }
        if self.overwrite_checkpoints {
            config.checkpoint.overwrite_existing = true;
        }
        config.validate().context("Invalid job configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let config = cli.job_config()?;
    let mut runtime = PregelRuntime::new(SimplePageRank, config).with_master_compute(PageRankMasterCompute);
    if let Some(dir) = &cli.checkpoint_dir {
        let storage = create_checkpointer(&CheckpointerConfig::File {
            path: dir.clone(),
            compression_level: 3,
        })
        .context("Failed to open checkpoint directory")?;
        runtime = runtime.with_checkpoint_storage(storage);
    }

    let graph: InMemoryGraph<u64, f64, f32> = ring_graph(cli.vertices).into_iter().collect();
    let writer = Arc::new(CollectingWriter::new());
    let result = runtime
        .run(Arc::new(graph), Arc::clone(&writer) as Arc<dyn VertexWriter<u64, f64, f32>>)
        .await
        .context("PageRank job failed")?;

    let mut output = serde_json::to_value(&result)?;
    if cli.values {
        output["values"] = json!(writer.values());
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
