//! flowrun runner
//!
//! Loads a pipeline file (`.toml` or `.json`), runs it with the built-in stage
//! kinds and prints the execution result as JSON.
//!
//! ```text
//! flowrun etl.toml [NAME=VALUE ...]
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use flowrun::{config::PipelineFile, stages::BuiltinStageFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Run a pipeline file with the built-in stage kinds.
#[derive(Parser, Debug)]
#[clap(name = "flowrun", version, about)]
struct RunnerOpts {
    /// Pipeline file, `.toml` or `.json`
    file: PathBuf,

    /// Variables overriding the file's `[variables]`, as NAME=VALUE
    #[clap(value_parser = parse_variable)]
    vars: Vec<(String, String)>,
}

fn parse_variable(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", arg)),
    }
}

fn main() -> anyhow::Result<()> {
    let opts = RunnerOpts::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,flowrun=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut file = PipelineFile::load(&opts.file)
        .with_context(|| format!("Failed to load pipeline file {}", opts.file.display()))?;
    for (name, value) in &opts.vars {
        file.variables.set(name, value);
    }

    tracing::info!(
        "Running pipeline '{}' from {}",
        file.pipeline.name,
        opts.file.display()
    );

    let engine = file.into_engine(Arc::new(BuiltinStageFactory::new()));
    engine.execute().context("Failed to start pipeline")?;
    engine.wait_until_finished();

    let result = engine.result();
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.errors > 0 {
        bail!(
            "pipeline '{}' finished with {} error(s)",
            engine.name(),
            result.errors
        );
    }
    Ok(())
}
