//! # codonflow
//!
//! Command-line entry point.
//!
//! ```bash
//! # Write a starting configuration
//! codonflow sample-config > codonflow.toml
//!
//! # Check inputs and the stage graph without running tools
//! codonflow validate --config codonflow.toml
//!
//! # Run the batch
//! codonflow run --config codonflow.toml --concurrency 8
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use codonflow::config::PipelineConfig;
use codonflow::events::LoggingEventSink;
use codonflow::runner::BatchRunner;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codonflow")]
#[command(about = "Batch codon-model selection analyses with LRT and FDR correction")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage over every unit and write the batch report
    Run(RunArgs),
    /// Check the configuration, the input tree and the stage graph
    Validate(RunArgs),
    /// Print a commented sample configuration
    SampleConfig,
}

#[derive(Args)]
struct RunArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory scanned for unit sequence files
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Directory for artifacts, the ledger and the report
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// Units in flight per stage
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Split units at recombination breakpoints
    #[arg(long)]
    recombination: bool,
}

impl RunArgs {
    fn load(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if let Some(input) = &self.input {
            config.input_dir.clone_from(input);
        }
        if let Some(work_dir) = &self.work_dir {
            config.work_dir.clone_from(work_dir);
        }
        if self.concurrency.is_some() {
            config.concurrency = self.concurrency;
        }
        if self.recombination {
            config.recombination = true;
        }
        Ok(config)
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Commands::SampleConfig => {
            print!("{}", PipelineConfig::sample_toml());
        }
        Commands::Validate(args) => {
            let plan = BatchRunner::new(args.load()?).plan()?;
            println!("{} units", plan.units.len());
            println!("stages: {}", plan.stages.join(" -> "));
        }
        Commands::Run(args) => {
            let runner = BatchRunner::new(args.load()?).with_event_sink(Arc::new(LoggingEventSink::debug()));
            let outcome = runner.run().await?;

            println!("run {}", outcome.run_id);
            println!(
                "{} units completed, {} dropped out",
                outcome.run.units.len(),
                outcome.run.failed.len()
            );
            println!("ledger: {}", outcome.ledger_path.display());
            for path in &outcome.report_paths {
                println!("report: {}", path.display());
            }
            if let Some(error) = outcome.run.error() {
                tracing::error!(error = %error, "Run aborted");
                std::process::exit(2);
            }
        }
    }
    Ok(())
}
