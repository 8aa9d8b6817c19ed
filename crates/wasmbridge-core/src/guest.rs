//! Guest capabilities, dispatched by export name.
//!
//! The bridge never binds typed guest functions. Each capability is a
//! [`GuestOp`], and [`ExportNames`] maps it to the export to call, so a guest
//! with different symbol names only needs a different name table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named operation the bridge may ask the guest to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestOp {
    /// Allocate input and output buffers; returns 0 on success.
    Allocate,
    /// Byte offset of the input buffer.
    GetInputBuf,
    /// Byte offset of the output buffer.
    GetOutputBuf,
    /// Number of records in the output buffer.
    GetItemCount,
    /// Size in bytes of one output record.
    GetItemStride,
    /// Parse entry point.
    Parse,
}

impl GuestOp {
    pub const ALL: [GuestOp; 6] = [
        GuestOp::Allocate,
        GuestOp::GetInputBuf,
        GuestOp::GetOutputBuf,
        GuestOp::GetItemCount,
        GuestOp::GetItemStride,
        GuestOp::Parse,
    ];
}

impl fmt::Display for GuestOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Export name for every [`GuestOp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportNames {
    pub allocate: String,
    pub get_input_buf: String,
    pub get_output_buf: String,
    pub get_item_count: String,
    pub get_item_stride: String,
    pub parse: String,
}

impl ExportNames {
    /// Names used by guests that own shared input/output buffers.
    pub fn shared_buffers() -> Self {
        Self {
            allocate: "allocate_input_output_bufs".into(),
            get_input_buf: "get_input_buf".into(),
            get_output_buf: "get_output_buf".into(),
            get_item_count: "get_output_item_count".into(),
            get_item_stride: "get_output_item_size".into(),
            parse: "parse_batch".into(),
        }
    }

    /// Names used by command-style guests that read their batch from argv
    /// and run it from `_start`.
    pub fn argument_vector() -> Self {
        Self {
            parse: "_start".into(),
            get_output_buf: "get_result_buf".into(),
            get_item_count: "get_result_count".into(),
            get_item_stride: "get_result_struct_size".into(),
            ..Self::shared_buffers()
        }
    }

    /// Export name for `op`.
    pub fn name(&self, op: GuestOp) -> &str {
        match op {
            GuestOp::Allocate => &self.allocate,
            GuestOp::GetInputBuf => &self.get_input_buf,
            GuestOp::GetOutputBuf => &self.get_output_buf,
            GuestOp::GetItemCount => &self.get_item_count,
            GuestOp::GetItemStride => &self.get_item_stride,
            GuestOp::Parse => &self.parse,
        }
    }

    /// Override the export name for `op`.
    pub fn with_name(mut self, op: GuestOp, name: impl Into<String>) -> Self {
        let slot = match op {
            GuestOp::Allocate => &mut self.allocate,
            GuestOp::GetInputBuf => &mut self.get_input_buf,
            GuestOp::GetOutputBuf => &mut self.get_output_buf,
            GuestOp::GetItemCount => &mut self.get_item_count,
            GuestOp::GetItemStride => &mut self.get_item_stride,
            GuestOp::Parse => &mut self.parse,
        };
        *slot = name.into();
        self
    }
}

impl Default for ExportNames {
    fn default() -> Self {
        Self::shared_buffers()
    }
}
