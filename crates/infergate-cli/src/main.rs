//! InferGate CLI
//!
//! Lists the engines the dispatch core knows about and runs single requests
//! through an endpoint described in a deployment file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use infergate_core::{FsArtifactStore, FsModelStore, Payload, StatsSink};
use infergate_engines::{Dispatcher, EngineRegistry, ServingContext};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod config;

use config::DeploymentConfig;

#[derive(Parser, Debug)]
#[command(name = "infergate")]
#[command(about = "InferGate model-serving dispatch core", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered engines and the modules that loaded
    Engines,

    /// Run one request through an endpoint
    Invoke {
        /// Deployment file
        #[arg(short, long, default_value = "deploy.yaml", env = "INFERGATE_CONFIG")]
        config: PathBuf,

        /// Endpoint path, e.g. `digits/2`
        #[arg(short, long)]
        endpoint: String,

        /// Request body as JSON; read from stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Artifact cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Directory holding model files
        #[arg(long)]
        model_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Engines => list_engines(),
        Command::Invoke {
            config,
            endpoint,
            input,
            cache_dir,
            model_root,
        } => {
            let mut deployment = DeploymentConfig::from_file(&config)?;
            if cache_dir.is_some() {
                deployment.artifacts.cache_dir = cache_dir;
            }
            if model_root.is_some() {
                deployment.models.root = model_root;
            }

            let request = read_request(input.as_ref())?;
            let output = invoke(&deployment, &endpoint, request).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

fn list_engines() -> Result<()> {
    let registry = EngineRegistry::global();
    let modules = registry.load_modules();

    for name in registry.names() {
        println!("{}", name);
    }
    if !modules.is_empty() {
        println!("modules: {}", modules.join(", "));
    }
    Ok(())
}

fn read_request(input: Option<&PathBuf>) -> Result<Value> {
    match input {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("cannot open input {}", path.display()))?;
            serde_json::from_reader(file)
                .with_context(|| format!("input {} is not JSON", path.display()))
        }
        None => serde_json::from_reader(std::io::stdin().lock()).context("stdin is not JSON"),
    }
}

/// Build the endpoint's dispatcher and run one request through it
async fn invoke(deployment: &DeploymentConfig, path: &str, request: Value) -> Result<Value> {
    let endpoint = deployment.endpoint(path)?.clone();

    let ctx = ServingContext::builder()
        .serving(deployment.serving.clone())
        .artifacts(Arc::new(FsArtifactStore::from_config(&deployment.artifacts)))
        .models(Arc::new(FsModelStore::new(deployment.models.clone())))
        .build()?;

    let dispatcher = Dispatcher::new(endpoint, &ctx)
        .await
        .with_context(|| format!("cannot serve endpoint '{}'", path))?;
    info!("Invoking {:?}", dispatcher);

    let (stats, mut collected) = StatsSink::channel();
    let response = dispatcher.handle(Payload::Json(request), &stats).await?;

    let mut statistics = Vec::new();
    while let Ok(entry) = collected.try_recv() {
        statistics.push(Value::Object(entry));
    }

    Ok(json!({
        "response": response.into_json(),
        "statistics": statistics,
    }))
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("infergate=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("infergate=info"))
    };

    // logs go to stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
