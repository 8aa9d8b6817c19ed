//! Sandbox and bridge configuration.
//!
//! [`SandboxConfig`] controls the resource limits and process environment of
//! every guest instance. [`BridgeConfig`] holds the protocol constants both
//! sides agree on: slot sizes, record layout and export names. Both have
//! sensible defaults, a builder-style API, and deserialize from TOML tables
//! with missing keys falling back to the defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::codec::RecordLayout;
use crate::error::{BridgeError, Result};
use crate::guest::ExportNames;

/// A host directory exposed to the guest under `guest_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreopenDir {
    pub host_path: PathBuf,
    pub guest_path: String,
}

/// Resource limits and process environment for the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum linear memory a guest may grow to, in bytes.
    ///
    /// Default: **16 MiB**.
    pub max_memory: usize,

    /// Maximum fuel (abstract instruction count) per session. Running out
    /// traps the guest.
    ///
    /// Default: **100 000 000**.
    pub max_fuel: u64,

    /// Whether the guest sees the host's environment variables.
    ///
    /// Default: **false**.
    pub inherit_env: bool,

    /// Whether the guest's stdin/stdout/stderr are the host's.
    ///
    /// Default: **true**.
    pub inherit_stdio: bool,

    /// Directories mapped into the guest's filesystem view.
    ///
    /// Default: none.
    pub preopens: Vec<PreopenDir>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory: 16 * 1024 * 1024,
            max_fuel: 100_000_000,
            inherit_env: false,
            inherit_stdio: true,
            preopens: Vec::new(),
        }
    }
}

impl SandboxConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum memory limit (in bytes).
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Set the fuel budget.
    pub fn with_max_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = fuel;
        self
    }

    pub fn with_inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn with_inherit_stdio(mut self, inherit: bool) -> Self {
        self.inherit_stdio = inherit;
        self
    }

    /// Map `host_path` into the guest at `guest_path`.
    pub fn with_preopen(mut self, host_path: impl Into<PathBuf>, guest_path: impl Into<String>) -> Self {
        self.preopens.push(PreopenDir {
            host_path: host_path.into(),
            guest_path: guest_path.into(),
        });
        self
    }
}

/// Protocol constants shared by host and guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Size of one input slot; longer events are truncated.
    ///
    /// Default: **4096**.
    pub max_event_size: u32,

    /// Number of input slots, and so the largest batch.
    ///
    /// Default: **128**.
    pub max_events: u32,

    /// Largest output record the host accepts. With `max_events` this sizes
    /// the output region.
    ///
    /// Default: **128**.
    pub max_output_item_size: u32,

    /// Field widths of one output record.
    ///
    /// Default: `method` (8) then `path` (120).
    pub layout: RecordLayout,

    /// Guest export names.
    pub exports: ExportNames,

    /// Name of the guest's exported linear memory.
    ///
    /// Default: **"memory"**.
    pub memory_export: String,

    /// Return the decodable prefix instead of failing when the guest reports
    /// more output than the region holds.
    ///
    /// Default: **false**.
    pub allow_partial: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_event_size: 4096,
            max_events: 128,
            max_output_item_size: 128,
            layout: RecordLayout::default(),
            exports: ExportNames::default(),
            memory_export: "memory".into(),
            allow_partial: false,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_event_size(mut self, bytes: u32) -> Self {
        self.max_event_size = bytes;
        self
    }

    pub fn with_max_events(mut self, count: u32) -> Self {
        self.max_events = count;
        self
    }

    pub fn with_max_output_item_size(mut self, bytes: u32) -> Self {
        self.max_output_item_size = bytes;
        self
    }

    pub fn with_layout(mut self, layout: RecordLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_exports(mut self, exports: ExportNames) -> Self {
        self.exports = exports;
        self
    }

    pub fn with_memory_export(mut self, name: impl Into<String>) -> Self {
        self.memory_export = name.into();
        self
    }

    pub fn with_allow_partial(mut self, allow: bool) -> Self {
        self.allow_partial = allow;
        self
    }

    /// Bytes needed for the input region.
    pub fn input_capacity(&self) -> Result<u32> {
        self.max_events
            .checked_mul(self.max_event_size)
            .ok_or_else(|| BridgeError::Config("input region size overflows u32".into()))
    }

    /// Bytes needed for the output region.
    pub fn output_capacity(&self) -> Result<u32> {
        self.max_events
            .checked_mul(self.max_output_item_size)
            .ok_or_else(|| BridgeError::Config("output region size overflows u32".into()))
    }

    /// Check the values are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.max_event_size == 0 {
            return Err(BridgeError::Config("max_event_size must be non-zero".into()));
        }
        if u64::from(self.max_output_item_size) < self.layout.width() {
            return Err(BridgeError::Config(format!(
                "max_output_item_size {} is narrower than layout width {}",
                self.max_output_item_size,
                self.layout.width()
            )));
        }
        self.input_capacity()?;
        self.output_capacity()?;
        Ok(())
    }
}
