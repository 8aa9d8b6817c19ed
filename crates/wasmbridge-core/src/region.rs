//! Offset-addressed views into guest linear memory.
//!
//! A [`MemoryRegion`] never holds a pointer. It names a span of the guest's
//! single exported memory by byte offset and capacity, and every access is
//! checked against both the region's capacity and the current size of the
//! memory slice it is applied to.

use std::ops::Range;

use crate::error::{BridgeError, Result};

/// Which side decided where a region lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The guest allocated the region and reported its offset.
    Guest,
    /// The host reserved the region inside the guest's memory.
    Host,
}

/// A bounds-checked span of guest linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    base_offset: u32,
    capacity: u32,
    owner: Owner,
}

impl MemoryRegion {
    /// Create a region, verifying that it fits inside a memory of
    /// `memory_len` bytes.
    pub fn new(base_offset: u32, capacity: u32, owner: Owner, memory_len: usize) -> Result<Self> {
        let end = u64::from(base_offset) + u64::from(capacity);
        if end > memory_len as u64 {
            return Err(BridgeError::out_of_bounds(
                u64::from(base_offset),
                u64::from(capacity),
                memory_len as u64,
            ));
        }
        Ok(Self {
            base_offset,
            capacity,
            owner,
        })
    }

    /// Byte offset of the region inside guest memory.
    pub fn base_offset(&self) -> u32 {
        self.base_offset
    }

    /// Region size in bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Absolute range in guest memory for `len` bytes at region-relative
    /// `offset`.
    fn span(&self, offset: usize, len: usize, memory_len: usize) -> Result<Range<usize>> {
        let rel_end = offset as u64 + len as u64;
        if rel_end > u64::from(self.capacity) {
            return Err(BridgeError::out_of_bounds(
                offset as u64,
                len as u64,
                u64::from(self.capacity),
            ));
        }
        let start = u64::from(self.base_offset) + offset as u64;
        let end = start + len as u64;
        if end > memory_len as u64 {
            return Err(BridgeError::out_of_bounds(start, len as u64, memory_len as u64));
        }
        Ok(start as usize..end as usize)
    }

    /// Borrow `len` bytes at region-relative `offset`.
    pub fn read<'m>(&self, memory: &'m [u8], offset: usize, len: usize) -> Result<&'m [u8]> {
        let span = self.span(offset, len, memory.len())?;
        Ok(&memory[span])
    }

    /// Copy `bytes` to region-relative `offset`. Nothing is written when the
    /// access is out of bounds.
    pub fn write(&self, memory: &mut [u8], offset: usize, bytes: &[u8]) -> Result<()> {
        let span = self.span(offset, bytes.len(), memory.len())?;
        memory[span].copy_from_slice(bytes);
        Ok(())
    }

    /// Set `len` bytes at region-relative `offset` to `byte`.
    pub fn fill(&self, memory: &mut [u8], offset: usize, len: usize, byte: u8) -> Result<()> {
        let span = self.span(offset, len, memory.len())?;
        memory[span].fill(byte);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn new_rejects_region_past_memory_end() {
        let err = MemoryRegion::new(60, 8, Owner::Guest, 64).unwrap_err();
        assert_eq!(err.kind(), FailureKind::OutOfBounds);
        assert!(MemoryRegion::new(56, 8, Owner::Guest, 64).is_ok());
    }

    #[test]
    fn new_does_not_overflow_near_u32_max() {
        let err = MemoryRegion::new(u32::MAX, u32::MAX, Owner::Host, 64).unwrap_err();
        assert_eq!(err.kind(), FailureKind::OutOfBounds);
    }

    #[test]
    fn write_then_read_is_offset_by_base() {
        let mut mem = vec![0u8; 32];
        let region = MemoryRegion::new(8, 16, Owner::Guest, mem.len()).unwrap();
        region.write(&mut mem, 2, b"abc").unwrap();
        assert_eq!(&mem[10..13], b"abc");
        assert_eq!(region.read(&mem, 2, 3).unwrap(), b"abc");
    }

    #[test]
    fn access_past_capacity_is_out_of_bounds() {
        let mut mem = vec![0u8; 64];
        let region = MemoryRegion::new(0, 16, Owner::Host, mem.len()).unwrap();
        let err = region.write(&mut mem, 14, b"abc").unwrap_err();
        match err {
            BridgeError::OutOfBounds { offset, len, limit } => {
                assert_eq!((offset, len, limit), (14, 3, 16));
            }
            other => panic!("expected OutOfBounds, got: {other}"),
        }
        // Never partially applied.
        assert!(mem.iter().all(|b| *b == 0));
        assert!(region.read(&mem, 16, 1).is_err());
    }

    #[test]
    fn access_past_memory_is_out_of_bounds() {
        let mem = vec![0u8; 64];
        let region = MemoryRegion::new(32, 32, Owner::Guest, mem.len()).unwrap();
        // A shorter view than the region was created against.
        let err = region.read(&mem[..40], 0, 16).unwrap_err();
        assert_eq!(err.kind(), FailureKind::OutOfBounds);
    }

    #[test]
    fn zero_length_access_at_end_is_allowed() {
        let mem = vec![0u8; 16];
        let region = MemoryRegion::new(0, 16, Owner::Guest, mem.len()).unwrap();
        assert!(region.read(&mem, 16, 0).unwrap().is_empty());
    }

    #[test]
    fn fill_zeroes_span() {
        let mut mem = vec![0xffu8; 16];
        let region = MemoryRegion::new(4, 8, Owner::Guest, mem.len()).unwrap();
        region.fill(&mut mem, 0, 8, 0).unwrap();
        assert_eq!(&mem[..4], &[0xff; 4]);
        assert_eq!(&mem[4..12], &[0; 8]);
        assert_eq!(&mem[12..], &[0xff; 4]);
    }
}
