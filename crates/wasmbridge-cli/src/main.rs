//! CLI entry point for wasmbridge.
//!
//! This binary provides the `wasmbridge` command: `parse` runs a batch of
//! events through a guest module, `inspect` lists what a module imports and
//! exports.

mod cli;
mod helpers;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use wasmbridge_core::{
    BatchOutput, BatchRunner, InvocationModel, MemoryBridge, ParsedRequest, Record,
    SandboxConfig, SandboxRuntime,
};

use cli::{Cli, Commands, ParseArgs};
use helpers::{FileConfig, collect_events, init_tracing};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Parse(args) => cmd_parse(args).await,
        Commands::Inspect { module } => cmd_inspect(&module),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: parse
// ---------------------------------------------------------------------------

async fn cmd_parse(args: ParseArgs) -> Result<()> {
    let config = FileConfig::load(args.config.as_deref())?;
    let model = InvocationModel::from(args.model);

    let runtime =
        SandboxRuntime::new(config.sandbox.clone()).context("failed to create sandbox runtime")?;
    let bridge = MemoryBridge::new(model, config.bridge_for(model, args.partial))
        .context("invalid bridge configuration")?;
    let events = collect_events(args.events.as_deref(), &args.inline)?;

    let runner = BatchRunner::load(runtime, bridge, &args.module)
        .await
        .with_context(|| format!("failed to load module {}", args.module.display()))?;

    info!(model = ?model, events = events.len(), "parsing batch");
    let output = runner
        .run(events)
        .await
        .with_context(|| format!("batch failed in module {}", runner.module().name()))?;

    if !output.is_complete() {
        warn!(
            reported = output.reported,
            decoded = output.records.len(),
            "guest reported more records than its output region holds"
        );
    }

    if args.json {
        println!("{}", render_json(&output)?);
    } else {
        for line in render_text(&output) {
            println!("{line}");
        }
    }
    Ok(())
}

fn render_json(output: &BatchOutput) -> Result<String> {
    let report = serde_json::json!({
        "complete": output.is_complete(),
        "reported": output.reported,
        "requests": output.requests(),
    });
    serde_json::to_string_pretty(&report).context("failed to serialize results")
}

fn render_text(output: &BatchOutput) -> Vec<String> {
    output.records.iter().map(render_record).collect()
}

fn render_record(record: &Record) -> String {
    if let Some(request) = ParsedRequest::from_record(record) {
        return format!("Method: {}, Path: {}", request.method, request.path);
    }
    record
        .fields()
        .iter()
        .map(|field| {
            let value = record.text(&field.name).unwrap_or_default();
            format!("{}: {value}", field.name)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Subcommand: inspect
// ---------------------------------------------------------------------------

fn cmd_inspect(path: &Path) -> Result<()> {
    let runtime =
        SandboxRuntime::new(SandboxConfig::default()).context("failed to create sandbox runtime")?;
    let module = runtime
        .load(path)
        .with_context(|| format!("failed to load module {}", path.display()))?;

    println!("module {}", module.name());
    for line in module.describe() {
        println!("  {line}");
    }
    Ok(())
}
