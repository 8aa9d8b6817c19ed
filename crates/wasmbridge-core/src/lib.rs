//! wasmbridge host-guest memory bridge.
//!
//! This crate drives a parsing routine that runs inside a WebAssembly
//! sandbox: it places a batch of variable-length events into the guest's
//! linear memory, invokes the guest, and decodes fixed-width result records
//! back out. The parsing itself lives in the guest; this crate only enforces
//! the data-exchange protocol around it.
//!
//! - **[`region`]** -- [`MemoryRegion`], a bounds-checked, offset-addressed
//!   span of guest memory.
//! - **[`codec`]** -- slot encoding of input events and [`RecordLayout`]
//!   driven decoding of output records.
//! - **[`guest`]** -- [`GuestOp`] and the [`ExportNames`] table the bridge
//!   dispatches through.
//! - **[`runtime`]** -- [`SandboxRuntime`], the wasmtime + WASI adapter.
//! - **[`bridge`]** -- [`MemoryBridge`] and its three [`InvocationModel`]s.
//! - **[`session`]** -- [`BridgeSession`], one batch end to end.
//! - **[`runner`]** -- [`BatchRunner`], independent sessions run
//!   concurrently on tokio.
//! - **[`config`]** / **[`error`]** -- configuration and the unified
//!   [`BridgeError`].

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod guest;
pub mod region;
pub mod runner;
pub mod runtime;
pub mod session;

// Re-export the most commonly used types at the crate root.
pub use bridge::{InvocationModel, MemoryBridge};
pub use codec::{FieldSpec, Record, RecordLayout};
pub use config::{BridgeConfig, SandboxConfig};
pub use error::{BridgeError, FailureKind, Result};
pub use guest::{ExportNames, GuestOp};
pub use region::{MemoryRegion, Owner};
pub use runner::BatchRunner;
pub use runtime::{GuestInstance, GuestModule, ImportTable, SandboxRuntime};
pub use session::{BatchOutput, BridgeSession, ParsedRequest, SessionState};
