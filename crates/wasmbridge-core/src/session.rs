//! One end-to-end batch through the bridge.
//!
//! A [`BridgeSession`] moves strictly forward through [`SessionState`]:
//! `Created → ModuleLoaded → Instantiated → InputWritten → GuestInvoked →
//! OutputDecoded → Done`. Any error moves it to `Failed`, discards the guest
//! instance, and every later call is refused. Retrying means creating a new
//! session.

use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::bridge::MemoryBridge;
use crate::codec::{PartialBatch, Record};
use crate::error::{BridgeError, FailureKind, Result};
use crate::runtime::{GuestModule, SandboxRuntime};

/// Lifecycle of a [`BridgeSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    ModuleLoaded,
    Instantiated,
    InputWritten,
    GuestInvoked,
    OutputDecoded,
    Done,
    Failed(FailureKind),
}

impl SessionState {
    /// `Done` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "Failed({kind})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Decoded results of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutput {
    /// Records in input order.
    pub records: Vec<Record>,
    /// Item count the guest reported.
    pub reported: u32,
}

impl BatchOutput {
    /// False only for a partial result.
    pub fn is_complete(&self) -> bool {
        self.records.len() as u64 == u64::from(self.reported)
    }

    /// Records viewed as HTTP request lines. Records without `method` and
    /// `path` fields are skipped.
    pub fn requests(&self) -> Vec<ParsedRequest> {
        self.records.iter().filter_map(ParsedRequest::from_record).collect()
    }
}

impl From<PartialBatch> for BatchOutput {
    fn from(batch: PartialBatch) -> Self {
        Self {
            records: batch.records,
            reported: batch.reported,
        }
    }
}

/// Method and path of one parsed request, padding removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
}

impl ParsedRequest {
    pub fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            method: record.text("method")?,
            path: record.text("path")?,
        })
    }
}

/// Drives a single batch against a single guest instance.
pub struct BridgeSession {
    runtime: SandboxRuntime,
    bridge: MemoryBridge,
    module: Option<GuestModule>,
    state: SessionState,
}

impl BridgeSession {
    pub fn new(runtime: SandboxRuntime, bridge: MemoryBridge) -> Self {
        Self {
            runtime,
            bridge,
            module: None,
            state: SessionState::Created,
        }
    }

    /// Load the module file and run one batch through it.
    pub fn run_file<E: AsRef<[u8]>>(
        runtime: SandboxRuntime,
        bridge: MemoryBridge,
        path: &Path,
        events: &[E],
    ) -> Result<BatchOutput> {
        let mut session = Self::new(runtime, bridge);
        session.load(path)?;
        session.run(events)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bridge(&self) -> &MemoryBridge {
        &self.bridge
    }

    /// Load the guest module from a file.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.expect_state(SessionState::Created)?;
        match self.runtime.load(path) {
            Ok(module) => self.attach(module),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Use an already compiled module.
    pub fn attach(&mut self, module: GuestModule) -> Result<()> {
        self.expect_state(SessionState::Created)?;
        tracing::debug!(module = %module.name(), "session module loaded");
        self.module = Some(module);
        self.state = SessionState::ModuleLoaded;
        Ok(())
    }

    /// Run one batch. Output record `i` corresponds to event `i`.
    pub fn run<E: AsRef<[u8]>>(&mut self, events: &[E]) -> Result<BatchOutput> {
        self.expect_state(SessionState::ModuleLoaded)?;
        match self.drive(events) {
            Ok(output) => {
                self.state = SessionState::Done;
                tracing::info!(
                    model = ?self.bridge.model(),
                    events = events.len(),
                    records = output.records.len(),
                    complete = output.is_complete(),
                    "batch complete"
                );
                Ok(output)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn drive<E: AsRef<[u8]>>(&mut self, events: &[E]) -> Result<BatchOutput> {
        let module = self
            .module
            .as_ref()
            .ok_or_else(|| BridgeError::Config("session has no module".into()))?;

        let argv = self.bridge.process_args(events)?;
        // Dropped on every exit path, which releases the guest's memory with
        // it.
        let mut instance = self
            .runtime
            .instantiate(module, self.bridge.import_table(), &argv)?;
        self.state = SessionState::Instantiated;

        let buffers = self.bridge.acquire(&mut instance)?;
        self.bridge.write_input(&mut instance, &buffers, events)?;
        self.state = SessionState::InputWritten;

        self.bridge.invoke(&mut instance, events.len())?;
        self.state = SessionState::GuestInvoked;

        let output = self.bridge.locate_output(&mut instance, &buffers)?;
        let batch = self.bridge.decode(&mut instance, &output)?;
        self.state = SessionState::OutputDecoded;

        Ok(batch.into())
    }

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state == expected {
            return Ok(());
        }
        if self.state.is_terminal() {
            return Err(BridgeError::SessionClosed {
                state: self.state.to_string(),
            });
        }
        Err(BridgeError::Config(format!(
            "session is {}, expected {expected}",
            self.state
        )))
    }

    fn fail(&mut self, err: BridgeError) -> BridgeError {
        tracing::error!(state = %self.state, error = %err, "session failed");
        self.state = SessionState::Failed(err.kind());
        self.module = None;
        err
    }
}
