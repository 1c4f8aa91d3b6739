// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

#![forbid(unsafe_code)]

use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::styling;
use clap::{crate_version, Parser, Subcommand};
use serde_json::Value;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use rulecraft_engine::clients::control_plane::HttpControlPlaneClient;
use rulecraft_engine::clients::kv_store::HttpKvStoreClient;
use rulecraft_engine::clients::object_store::HttpObjectStoreClient;
use rulecraft_engine::clients::pubsub::HttpPubSubClient;
use rulecraft_engine::{AlertMerger, Config, Dispatcher, Engine, Ingestor, OutputBuffer};
use rulecraft_runtime::{Config as WasmConfig, Engine as WasmEngine};

const HELP_TEMPLATE: &str = r#"
{before-help}{about} {version}

{usage-heading} {usage}

{all-args}{after-help}
"#;

/// Rulecraft: the detection-execution and alert-materialization engine
/// for a security analytics pipeline.
#[derive(Parser)]
#[clap(name = "rulecraft", help_template = HELP_TEMPLATE, version = crate_version!())]
struct RulecraftCli {
    #[clap(subcommand)]
    command: RulecraftCommand,
}

#[derive(Subcommand)]
enum RulecraftCommand {
    /// Processes one input envelope (batch log analysis or a direct rule
    /// test) and writes the response, if any, to stdout.
    Invoke {
        /// Path to the JSON envelope. Reads stdin when omitted.
        #[clap(long)]
        file: Option<PathBuf>,
        /// Path to an optional YAML config file layered under
        /// `RULECRAFT_`-prefixed environment variables.
        #[clap(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let styles = styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default().bold().underline())
        .usage(styling::AnsiColor::Green.on_default().bold().underline())
        .literal(styling::AnsiColor::Blue.on_default().bold());

    let matches = <RulecraftCli as clap::CommandFactory>::command()
        .styles(styles)
        .get_matches();
    let cli = <RulecraftCli as clap::FromArgMatches>::from_arg_matches(&matches)?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_target(false)
        .without_time()
        .with_env_filter(EnvFilter::from_env("RULECRAFT_LOG"))
        .with_max_level(Level::INFO)
        .init();

    match cli.command {
        RulecraftCommand::Invoke { file, config } => invoke(file, config).await,
    }
}

async fn invoke(file: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;

    let envelope = read_envelope(file.as_deref())?;

    let wasm_engine = WasmEngine::builder(&WasmConfig::default())
        .context("building wasm engine")?
        .build();

    let control_plane = Arc::new(HttpControlPlaneClient::new(
        config.analysis_api_fqdn.clone(),
        config.analysis_api_path.clone(),
        config.aws_default_region.clone(),
        config.aws_access_key_id.clone(),
        config.aws_secret_access_key.clone(),
        config.aws_session_token.clone(),
    ));
    let kv_store = Arc::new(HttpKvStoreClient::new(
        config.kv_store_endpoint.clone(),
        config.alerts_dedup_table.clone(),
    ));
    let object_store = Arc::new(HttpObjectStoreClient::new(config.object_store_endpoint.clone()));
    let pubsub = Arc::new(HttpPubSubClient::new(config.pubsub_endpoint.clone()));

    let engine = Arc::new(Engine::new(
        wasm_engine.clone(),
        control_plane,
        Some(config.refresh_ttl_seconds),
    ));
    let alert_merger = AlertMerger::new(kv_store);
    let mut buffer = OutputBuffer::new(
        alert_merger,
        object_store.clone(),
        pubsub,
        config.s3_bucket.clone(),
        config.notifications_topic.clone(),
        Some(config.max_bytes_in_memory),
    );
    let ingestor = Ingestor::new(engine, object_store);
    let dispatcher = Dispatcher::new(wasm_engine, ingestor);

    match dispatcher.handle(envelope, &mut buffer).await? {
        Some(response) => {
            let rendered = serde_json::to_string_pretty(&response)
                .context("serializing direct-test response")?;
            println!("{rendered}");
        }
        None => {
            tracing::info!("batch analysis complete");
        }
    }

    Ok(())
}

fn read_envelope(file: Option<&std::path::Path>) -> Result<Value> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading envelope file {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading envelope from stdin")?;
            buf
        }
    };
    serde_json::from_str(&raw).context("parsing envelope as JSON")
}
