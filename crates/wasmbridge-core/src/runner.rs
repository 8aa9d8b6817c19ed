//! Concurrent batch runner.
//!
//! [`BatchRunner`] compiles a module once and runs batches against it, each
//! in its own [`BridgeSession`] with its own guest instance. Sessions share
//! nothing mutable, so they run side by side on tokio's blocking pool.

use std::path::Path;

use crate::bridge::MemoryBridge;
use crate::error::{BridgeError, Result};
use crate::runtime::{GuestModule, SandboxRuntime};
use crate::session::{BatchOutput, BridgeSession};

/// Runs independent batches against one compiled module.
#[derive(Clone)]
pub struct BatchRunner {
    runtime: SandboxRuntime,
    bridge: MemoryBridge,
    module: GuestModule,
}

impl BatchRunner {
    pub fn new(runtime: SandboxRuntime, bridge: MemoryBridge, module: GuestModule) -> Self {
        Self {
            runtime,
            bridge,
            module,
        }
    }

    /// Read and compile a module file.
    ///
    /// The file is read asynchronously; compilation is CPU-bound and runs on
    /// a blocking thread.
    pub async fn load(runtime: SandboxRuntime, bridge: MemoryBridge, path: &Path) -> Result<Self> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                BridgeError::Load(format!("cannot derive module name from path: {}", path.display()))
            })?
            .to_owned();

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| BridgeError::Load(format!("cannot read {}: {e}", path.display())))?;

        tracing::debug!(
            module = %name,
            path = %path.display(),
            size_bytes = bytes.len(),
            "read wasm bytes from disk"
        );

        let rt = runtime.clone();
        let module = tokio::task::spawn_blocking(move || rt.load_bytes(&name, &bytes))
            .await
            .map_err(|e| BridgeError::Task(format!("compile task failed: {e}")))??;

        Ok(Self::new(runtime, bridge, module))
    }

    pub fn module(&self) -> &GuestModule {
        &self.module
    }

    /// Run one batch in a fresh session.
    pub async fn run(&self, events: Vec<Vec<u8>>) -> Result<BatchOutput> {
        let runtime = self.runtime.clone();
        let bridge = self.bridge.clone();
        let module = self.module.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = BridgeSession::new(runtime, bridge);
            session.attach(module)?;
            session.run(events.as_slice())
        })
        .await
        .map_err(|e| BridgeError::Task(format!("session task failed: {e}")))?
    }

    /// Run every batch concurrently. Results come back in batch order; one
    /// batch failing does not affect the others.
    pub async fn run_all(&self, batches: Vec<Vec<Vec<u8>>>) -> Vec<Result<BatchOutput>> {
        tracing::info!(batches = batches.len(), module = %self.module.name(), "running batches");

        let handles: Vec<_> = batches
            .into_iter()
            .map(|events| {
                let runner = self.clone();
                tokio::spawn(async move { runner.run(events).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .unwrap_or_else(|e| Err(BridgeError::Task(format!("batch task failed: {e}")))),
            );
        }
        results
    }
}
