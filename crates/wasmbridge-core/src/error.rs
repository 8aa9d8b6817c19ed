//! Bridge error types.
//!
//! Every subsystem surfaces errors through [`BridgeError`], the single error
//! type returned by the public API of this crate. [`FailureKind`] is the
//! copyable classification recorded by a failed session.

use std::fmt;

/// Unified error type for the host-guest memory bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The module file is missing or is not valid bytecode.
    #[error("module load error: {0}")]
    Load(String),

    /// An import or export is missing or has the wrong signature.
    #[error("link error: {0}")]
    Link(String),

    /// A region access fell outside the region or the guest's memory.
    #[error("out of bounds: {len} bytes at offset {offset} exceed limit {limit}")]
    OutOfBounds {
        /// Offset of the access, relative to the region base.
        offset: u64,
        /// Length of the access in bytes.
        len: u64,
        /// The bound that was exceeded.
        limit: u64,
    },

    /// The guest trapped. Its memory must be considered poisoned.
    #[error("guest fault: {0}")]
    GuestFault(String),

    /// The guest reported more output than the output region holds.
    #[error("truncated region: guest reported {required} bytes, region holds {available}")]
    TruncatedRegion {
        /// `item_count * item_stride` as reported by the guest.
        required: u64,
        /// Capacity of the output region.
        available: u64,
    },

    /// A guest accessor returned a failure code.
    #[error("guest call `{op}` returned status {code}")]
    GuestStatus {
        /// Export name of the failing call.
        op: String,
        /// Status code returned by the guest.
        code: i32,
    },

    /// A record layout does not fit the stride it is applied to.
    #[error("layout error: {0}")]
    Layout(String),

    /// An event cannot be carried by the selected invocation model.
    #[error("invalid event #{index}: {reason}")]
    InvalidEvent {
        /// Position of the event in the batch.
        index: usize,
        /// Why the event was rejected.
        reason: String,
    },

    /// The session already finished or failed and cannot be re-entered.
    #[error("session closed in state {state}")]
    SessionClosed {
        /// Display form of the state the session was left in.
        state: String,
    },

    /// The instance trapped earlier and refuses further calls.
    #[error("instance poisoned by an earlier trap")]
    InstancePoisoned,

    /// Invalid configuration value, or a call in the wrong session state.
    #[error("config error: {0}")]
    Config(String),

    /// A background session task could not be joined.
    #[error("task error: {0}")]
    Task(String),

    /// An I/O error occurred (e.g. reading a module file from disk).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the bridge crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Copyable classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Load,
    Link,
    OutOfBounds,
    GuestFault,
    TruncatedRegion,
    GuestStatus,
    Layout,
    InvalidEvent,
    SessionClosed,
    InstancePoisoned,
    Config,
    Task,
    Io,
}

impl BridgeError {
    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Load(_) => FailureKind::Load,
            Self::Link(_) => FailureKind::Link,
            Self::OutOfBounds { .. } => FailureKind::OutOfBounds,
            Self::GuestFault(_) => FailureKind::GuestFault,
            Self::TruncatedRegion { .. } => FailureKind::TruncatedRegion,
            Self::GuestStatus { .. } => FailureKind::GuestStatus,
            Self::Layout(_) => FailureKind::Layout,
            Self::InvalidEvent { .. } => FailureKind::InvalidEvent,
            Self::SessionClosed { .. } => FailureKind::SessionClosed,
            Self::InstancePoisoned => FailureKind::InstancePoisoned,
            Self::Config(_) => FailureKind::Config,
            Self::Task(_) => FailureKind::Task,
            Self::Io(_) => FailureKind::Io,
        }
    }

    pub(crate) fn out_of_bounds(offset: u64, len: u64, limit: u64) -> Self {
        Self::OutOfBounds { offset, len, limit }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
