//! CLI argument definitions for wasmbridge.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use wasmbridge_core::InvocationModel;

/// wasmbridge -- batch parsing inside a WebAssembly sandbox.
#[derive(Parser)]
#[command(
    name = "wasmbridge",
    version,
    about = "wasmbridge -- batch parsing inside a WebAssembly sandbox",
    long_about = "Moves a batch of HTTP request events into a sandboxed wasm guest, \
                  runs the guest's parser, and decodes its fixed-width result records."
)]
pub struct Cli {
    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse a batch of events with a guest module.
    Parse(ParseArgs),

    /// List a module's imports and exports with their signatures.
    Inspect {
        /// Path to the module (`.wasm` or `.wat`).
        #[arg(long, short)]
        module: PathBuf,
    },
}

#[derive(Args)]
pub struct ParseArgs {
    /// Path to the guest module (`.wasm` or `.wat`).
    #[arg(long, short)]
    pub module: PathBuf,

    /// How the batch is handed to the guest.
    #[arg(long, value_enum, default_value_t = ModelArg::Guest)]
    pub model: ModelArg,

    /// TOML file with `[sandbox]` and `[bridge]` tables.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// JSON file holding an array of event strings.
    #[arg(long, conflicts_with = "inline")]
    pub events: Option<PathBuf>,

    /// Print the decodable prefix when the guest over-reports its output.
    #[arg(long)]
    pub partial: bool,

    /// Print results as JSON.
    #[arg(long)]
    pub json: bool,

    /// Events given on the command line. Without any events, a built-in
    /// sample of three requests is parsed.
    #[arg(value_name = "EVENT")]
    pub inline: Vec<String>,
}

/// Command-line names of the invocation models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelArg {
    /// Events as process arguments, parsed by `_start`.
    Argv,
    /// Guest allocates both buffers.
    Guest,
    /// Host reserves both buffers in guest memory.
    Host,
}

impl From<ModelArg> for InvocationModel {
    fn from(model: ModelArg) -> Self {
        match model {
            ModelArg::Argv => InvocationModel::ArgumentVector,
            ModelArg::Guest => InvocationModel::GuestAllocated,
            ModelArg::Host => InvocationModel::HostReserved,
        }
    }
}
