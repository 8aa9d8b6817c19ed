//! The memory bridge: one input/output contract, three ways to move bytes.
//!
//! - [`InvocationModel::ArgumentVector`]: the batch travels as the guest's
//!   process arguments and `_start` parses it; results are located through
//!   guest accessors afterwards.
//! - [`InvocationModel::GuestAllocated`]: the guest allocates both buffers
//!   and reports their offsets; the host writes slots and calls the parse
//!   entry with the event count.
//! - [`InvocationModel::HostReserved`]: the host grows the guest's own
//!   memory, reserves both regions there, and serves their offsets through
//!   the `env.get_input_buf` / `env.get_output_buf` imports.
//!
//! In every model the guest owns the only memory object involved and the
//! host addresses it by offset.

use serde::{Deserialize, Serialize};

use crate::codec::{self, PartialBatch};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::guest::GuestOp;
use crate::region::{MemoryRegion, Owner};
use crate::runtime::{GuestInstance, ImportTable};

/// How a batch is handed to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationModel {
    ArgumentVector,
    #[default]
    GuestAllocated,
    HostReserved,
}

/// Regions known before the guest runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Buffers {
    pub input: Option<MemoryRegion>,
    /// Set only when the host reserved the output region itself.
    pub output: Option<MemoryRegion>,
}

/// Where the guest left its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputDescriptor {
    pub region: MemoryRegion,
    pub item_count: u32,
    pub item_stride: u32,
}

/// Drives one invocation model against a guest instance.
#[derive(Debug, Clone)]
pub struct MemoryBridge {
    model: InvocationModel,
    config: BridgeConfig,
}

impl MemoryBridge {
    pub fn new(model: InvocationModel, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { model, config })
    }

    pub fn model(&self) -> InvocationModel {
        self.model
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Host functions this model needs linked in.
    pub fn import_table(&self) -> ImportTable {
        match self.model {
            InvocationModel::HostReserved => ImportTable::buffer_offsets(),
            _ => ImportTable::none(),
        }
    }

    fn check_batch_len(&self, len: usize) -> Result<()> {
        if len as u64 > u64::from(self.config.max_events) {
            return Err(BridgeError::out_of_bounds(
                0,
                len as u64,
                u64::from(self.config.max_events),
            ));
        }
        Ok(())
    }

    /// The guest's argument list: the decimal event count, then one event
    /// per argument. Empty for models that pass data through memory.
    ///
    /// Events are truncated to `max_event_size` like memory slots are. A cut
    /// that splits a UTF-8 sequence backs off to the last whole character.
    /// Events that are not UTF-8, or that hold a NUL byte, cannot be process
    /// arguments and are rejected.
    pub fn process_args<E: AsRef<[u8]>>(&self, events: &[E]) -> Result<Vec<String>> {
        if self.model != InvocationModel::ArgumentVector {
            return Ok(Vec::new());
        }
        self.check_batch_len(events.len())?;

        let limit = self.config.max_event_size as usize;
        let mut argv = Vec::with_capacity(events.len() + 1);
        argv.push(events.len().to_string());
        for (index, event) in events.iter().enumerate() {
            let event = event.as_ref();
            let cut = &event[..event.len().min(limit)];
            let text = match std::str::from_utf8(cut) {
                Ok(text) => text,
                // Only the cut split a character.
                Err(err) if err.error_len().is_none() && cut.len() < event.len() => {
                    std::str::from_utf8(&cut[..err.valid_up_to()]).unwrap_or_default()
                }
                Err(err) => {
                    return Err(BridgeError::InvalidEvent {
                        index,
                        reason: format!("not valid UTF-8: {err}"),
                    });
                }
            };
            if text.contains('\0') {
                return Err(BridgeError::InvalidEvent {
                    index,
                    reason: "NUL byte cannot be passed as an argument".into(),
                });
            }
            argv.push(text.to_owned());
        }
        Ok(argv)
    }

    /// Establish the regions the model needs before input is written.
    pub fn acquire(&self, instance: &mut GuestInstance) -> Result<Buffers> {
        match self.model {
            InvocationModel::ArgumentVector => Ok(Buffers::default()),
            InvocationModel::GuestAllocated => {
                let names = &self.config.exports;
                let allocate = names.name(GuestOp::Allocate);
                let status = instance.call_i32(allocate, &[])?;
                if status != 0 {
                    return Err(BridgeError::GuestStatus {
                        op: allocate.to_owned(),
                        code: status,
                    });
                }
                let offset = self.guest_value(instance, GuestOp::GetInputBuf, true)?;
                let memory = instance.memory(&self.config.memory_export)?;
                let region = MemoryRegion::new(
                    offset,
                    self.config.input_capacity()?,
                    Owner::Guest,
                    instance.data(memory).len(),
                )?;
                tracing::debug!(base = offset, capacity = region.capacity(), "guest allocated input buffer");
                Ok(Buffers {
                    input: Some(region),
                    output: None,
                })
            }
            InvocationModel::HostReserved => {
                let input_cap = self.config.input_capacity()?;
                let output_cap = self.config.output_capacity()?;
                let memory = instance.memory(&self.config.memory_export)?;
                let start = instance.grow(memory, u64::from(input_cap) + u64::from(output_cap))?;
                let start = u32::try_from(start)
                    .map_err(|_| BridgeError::out_of_bounds(start, 0, u64::from(u32::MAX)))?;
                let output_base = start.checked_add(input_cap).ok_or_else(|| {
                    BridgeError::out_of_bounds(u64::from(start), u64::from(input_cap), u64::from(u32::MAX))
                })?;
                let mem_len = instance.data(memory).len();
                let input = MemoryRegion::new(start, input_cap, Owner::Host, mem_len)?;
                let output = MemoryRegion::new(output_base, output_cap, Owner::Host, mem_len)?;
                instance.set_host_offsets(start, output_base);
                tracing::debug!(input_base = start, output_base, "host reserved buffers in guest memory");
                Ok(Buffers {
                    input: Some(input),
                    output: Some(output),
                })
            }
        }
    }

    /// Encode the batch into the input region. A no-op for the argument
    /// vector model, whose input was fixed at instantiation.
    pub fn write_input<E: AsRef<[u8]>>(
        &self,
        instance: &mut GuestInstance,
        buffers: &Buffers,
        events: &[E],
    ) -> Result<()> {
        let Some(region) = buffers.input else {
            return Ok(());
        };
        self.check_batch_len(events.len())?;
        let memory = instance.memory(&self.config.memory_export)?;
        let truncated = codec::encode_batch(
            events,
            &region,
            self.config.max_event_size,
            instance.data_mut(memory),
        )?;
        tracing::debug!(events = events.len(), truncated, "input batch written");
        Ok(())
    }

    /// Run the guest's parse entry point.
    pub fn invoke(&self, instance: &mut GuestInstance, event_count: usize) -> Result<()> {
        let parse = self.config.exports.name(GuestOp::Parse);
        let status = match self.model {
            InvocationModel::ArgumentVector => instance.call(parse, &[])?,
            _ => {
                let count = i32::try_from(event_count).map_err(|_| {
                    BridgeError::out_of_bounds(0, event_count as u64, i32::MAX as u64)
                })?;
                instance.call(parse, &[count])?
            }
        };
        match status {
            None | Some(0) => Ok(()),
            Some(code) => Err(BridgeError::GuestStatus {
                op: parse.to_owned(),
                code,
            }),
        }
    }

    /// Ask the guest where its results are, how many, and how wide.
    pub fn locate_output(
        &self,
        instance: &mut GuestInstance,
        buffers: &Buffers,
    ) -> Result<OutputDescriptor> {
        let memory = instance.memory(&self.config.memory_export)?;
        let region = match buffers.output {
            Some(region) => region,
            None => {
                let base = self.guest_value(instance, GuestOp::GetOutputBuf, true)?;
                let mem_len = instance.data(memory).len() as u64;
                // The region is what the host will read, clipped to the memory
                // that actually exists behind the guest's offset.
                let room = mem_len.checked_sub(u64::from(base)).ok_or_else(|| {
                    BridgeError::out_of_bounds(u64::from(base), 0, mem_len)
                })?;
                let capacity = u64::from(self.config.output_capacity()?).min(room) as u32;
                MemoryRegion::new(base, capacity, Owner::Guest, mem_len as usize)?
            }
        };
        let item_count = self.guest_value(instance, GuestOp::GetItemCount, false)?;
        let item_stride = self.guest_value(instance, GuestOp::GetItemStride, false)?;
        tracing::debug!(
            base = region.base_offset(),
            capacity = region.capacity(),
            item_count,
            item_stride,
            "located guest output"
        );
        Ok(OutputDescriptor {
            region,
            item_count,
            item_stride,
        })
    }

    /// Decode the guest's results. Over-reported output fails with
    /// [`BridgeError::TruncatedRegion`] unless partial results are allowed.
    pub fn decode(
        &self,
        instance: &mut GuestInstance,
        output: &OutputDescriptor,
    ) -> Result<PartialBatch> {
        let memory = instance.memory(&self.config.memory_export)?;
        let data = instance.data(memory);
        if self.config.allow_partial {
            return codec::decode_batch_partial(
                &output.region,
                output.item_count,
                output.item_stride,
                &self.config.layout,
                data,
            );
        }
        let records = codec::decode_batch(
            &output.region,
            output.item_count,
            output.item_stride,
            &self.config.layout,
            data,
        )?;
        Ok(PartialBatch {
            records,
            reported: output.item_count,
        })
    }

    /// Call a no-argument accessor returning a non-negative value. Offsets
    /// must also be non-zero, since zero is the guest's null pointer.
    fn guest_value(&self, instance: &mut GuestInstance, op: GuestOp, offset: bool) -> Result<u32> {
        let name = self.config.exports.name(op);
        let value = instance.call_i32(name, &[])?;
        if value < 0 || (offset && value == 0) {
            return Err(BridgeError::GuestStatus {
                op: name.to_owned(),
                code: value,
            });
        }
        Ok(value as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn argv_bridge() -> MemoryBridge {
        MemoryBridge::new(
            InvocationModel::ArgumentVector,
            BridgeConfig::new().with_max_event_size(8).with_max_events(3),
        )
        .unwrap()
    }

    #[test]
    fn argv_starts_with_decimal_count() {
        let argv = argv_bridge()
            .process_args(&[b"GET /a".as_slice(), b"PUT /b"])
            .unwrap();
        assert_eq!(argv, vec!["2", "GET /a", "PUT /b"]);
    }

    #[test]
    fn argv_truncates_to_slot_size() {
        let argv = argv_bridge().process_args(&[b"GET /abcdef"]).unwrap();
        assert_eq!(argv[1], "GET /abc");
    }

    #[test]
    fn argv_rejects_nul() {
        let err = argv_bridge()
            .process_args(&[b"ok".as_slice(), b"a\0b"])
            .unwrap_err();
        match err {
            BridgeError::InvalidEvent { index, .. } => assert_eq!(index, 1),
            other => panic!("expected InvalidEvent, got: {other}"),
        }
    }

    #[test]
    fn argv_cut_inside_a_character_backs_off() {
        // "é" is two bytes; the slot ends after its first byte.
        let argv = argv_bridge().process_args(&["GET /abé".as_bytes()]).unwrap();
        assert_eq!(argv[1], "GET /ab");
        assert!(argv[1].len() <= 8);
    }

    #[test]
    fn argv_keeps_multibyte_that_fits() {
        let argv = argv_bridge().process_args(&["GET /é".as_bytes()]).unwrap();
        assert_eq!(argv[1].as_bytes(), "GET /é".as_bytes());
    }

    #[test]
    fn argv_rejects_non_utf8() {
        let err = argv_bridge().process_args(&[b"GET /\xff".as_slice()]).unwrap_err();
        match err {
            BridgeError::InvalidEvent { index, reason } => {
                assert_eq!(index, 0);
                assert!(reason.contains("UTF-8"));
            }
            other => panic!("expected InvalidEvent, got: {other}"),
        }
    }

    #[test]
    fn argv_rejects_incomplete_sequence_without_cut() {
        // Truncated sequence at the end of an event that was not cut.
        let err = argv_bridge().process_args(&[b"GET /\xc3".as_slice()]).unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidEvent);
    }

    #[test]
    fn argv_rejects_oversized_batch() {
        let events = vec![b"x".to_vec(); 4];
        let err = argv_bridge().process_args(&events).unwrap_err();
        assert_eq!(err.kind(), FailureKind::OutOfBounds);
    }

    #[test]
    fn argv_of_empty_batch_is_just_count() {
        let events: Vec<Vec<u8>> = Vec::new();
        assert_eq!(argv_bridge().process_args(&events).unwrap(), vec!["0"]);
    }

    #[test]
    fn memory_models_pass_no_args() {
        let bridge = MemoryBridge::new(InvocationModel::GuestAllocated, BridgeConfig::new()).unwrap();
        assert!(bridge.process_args(&[b"GET /"]).unwrap().is_empty());
    }

    #[test]
    fn only_host_reserved_links_offset_imports() {
        let cfg = BridgeConfig::new();
        for (model, expected) in [
            (InvocationModel::ArgumentVector, false),
            (InvocationModel::GuestAllocated, false),
            (InvocationModel::HostReserved, true),
        ] {
            let bridge = MemoryBridge::new(model, cfg.clone()).unwrap();
            assert_eq!(bridge.import_table().has_buffer_offsets(), expected);
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = MemoryBridge::new(
            InvocationModel::GuestAllocated,
            BridgeConfig::new().with_max_event_size(0),
        )
        .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Config);
    }

    #[test]
    fn model_names_in_config() {
        let model: InvocationModel = serde_json::from_str(r#""host-reserved""#).unwrap();
        assert_eq!(model, InvocationModel::HostReserved);
        assert_eq!(InvocationModel::default(), InvocationModel::GuestAllocated);
    }
}
