//! Fixed-size slot allocator

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::traits::BufferAllocator;
use crate::{
    error::{BufferPoolError, Result},
    types::{AllocationParams, NativeHandle},
};

/// Descriptor carried inside handles issued by [`FixedSizeAllocator`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDescriptor {
    /// Name of the region the slot lives in
    pub region: String,
    /// Slot index
    pub slot: u32,
    /// Byte offset of the slot within the region
    pub offset: u64,
    /// Slot length in bytes
    pub len: u64,
}

/// Allocator for fixed-size slots in a named region
///
/// The region spans `slot_size * slot_count` bytes. Every slot has the same
/// size, so any request that fits a slot can be served by any idle slot.
#[derive(Debug)]
pub struct FixedSizeAllocator {
    /// Region name written into descriptors
    region: String,
    /// Size of each slot
    slot_size: usize,
    /// Total number of slots
    slot_count: usize,
    /// Free slot indices; the last entry is handed out first
    free: Mutex<Vec<u32>>,
    /// Number of slots handed out
    allocated_count: AtomicUsize,
}

impl FixedSizeAllocator {
    /// Create an allocator with `slot_count` slots of `slot_size` bytes
    pub fn new(region: impl Into<String>, slot_size: usize, slot_count: usize) -> Result<Self> {
        if slot_size == 0 {
            return Err(BufferPoolError::invalid_config(
                "slot_size",
                "Slot size cannot be zero",
            ));
        }

        if slot_count == 0 || u32::try_from(slot_count).is_err() {
            return Err(BufferPoolError::invalid_config(
                "slot_count",
                "Slot count must be between 1 and u32::MAX",
            ));
        }

        // Reverse order so slot 0 is handed out first
        let free: Vec<u32> = (0..slot_count as u32).rev().collect();

        Ok(Self {
            region: region.into(),
            slot_size,
            slot_count,
            free: Mutex::new(free),
            allocated_count: AtomicUsize::new(0),
        })
    }

    /// Get slot size
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Get number of free slots
    pub fn free_slots(&self) -> usize {
        self.slot_count - self.allocated_count.load(Ordering::Acquire)
    }

    /// Check if allocator is full
    pub fn is_full(&self) -> bool {
        self.free_slots() == 0
    }

    fn check_request(&self, params: &AllocationParams) -> Result<()> {
        match params.requested_size() {
            Some(size) if size > self.slot_size => Err(BufferPoolError::no_memory(format!(
                "requested {} bytes, slot size is {}",
                size, self.slot_size
            ))),
            _ => Ok(()),
        }
    }
}

impl BufferAllocator for FixedSizeAllocator {
    fn allocate(&self, params: &AllocationParams) -> Result<NativeHandle> {
        self.check_request(params)?;

        let slot = self
            .free
            .lock()
            .pop()
            .ok_or_else(|| BufferPoolError::no_memory(format!("region {} exhausted", self.region)))?;
        self.allocated_count.fetch_add(1, Ordering::AcqRel);

        NativeHandle::encode(&SlotDescriptor {
            region: self.region.clone(),
            slot,
            offset: slot as u64 * self.slot_size as u64,
            len: self.slot_size as u64,
        })
    }

    fn free(&self, handle: &NativeHandle) -> Result<()> {
        let descriptor: SlotDescriptor = handle.decode()?;

        if descriptor.region != self.region || descriptor.slot as usize >= self.slot_count {
            return Err(BufferPoolError::not_found(format!(
                "slot {} of region {}",
                descriptor.slot, descriptor.region
            )));
        }

        let mut free = self.free.lock();
        if free.contains(&descriptor.slot) {
            return Err(BufferPoolError::critical(format!(
                "slot {} freed twice",
                descriptor.slot
            )));
        }
        free.push(descriptor.slot);
        self.allocated_count.fetch_sub(1, Ordering::AcqRel);

        Ok(())
    }

    fn compatible(&self, requested: &AllocationParams, _existing: &AllocationParams) -> bool {
        self.check_request(requested).is_ok()
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.slot_count)
    }

    fn in_use(&self) -> usize {
        self.allocated_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultStatus;

    #[test]
    fn test_allocate_until_exhausted() {
        let allocator = FixedSizeAllocator::new("test", 1024, 2).unwrap();
        let params = AllocationParams::with_size(512);

        let first = allocator.allocate(&params).unwrap();
        let second = allocator.allocate(&params).unwrap();
        assert_ne!(first, second);
        assert!(allocator.is_full());

        let err = allocator.allocate(&params).unwrap_err();
        assert_eq!(err.status(), ResultStatus::NoMemory);

        allocator.free(&first).unwrap();
        assert_eq!(allocator.free_slots(), 1);
        assert!(allocator.allocate(&params).is_ok());
    }

    #[test]
    fn test_descriptor_contents() {
        let allocator = FixedSizeAllocator::new("video", 4096, 4).unwrap();
        allocator.allocate(&AllocationParams::default()).unwrap();
        let handle = allocator.allocate(&AllocationParams::default()).unwrap();

        let descriptor: SlotDescriptor = handle.decode().unwrap();
        assert_eq!(descriptor.region, "video");
        assert_eq!(descriptor.slot, 1);
        assert_eq!(descriptor.offset, 4096);
        assert_eq!(descriptor.len, 4096);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let allocator = FixedSizeAllocator::new("test", 256, 4).unwrap();
        let big = AllocationParams::with_size(1024);

        assert_eq!(
            allocator.allocate(&big).unwrap_err().status(),
            ResultStatus::NoMemory
        );
        assert!(!allocator.compatible(&big, &AllocationParams::with_size(16)));
        assert!(allocator.compatible(&AllocationParams::with_size(200), &AllocationParams::with_size(16)));
    }

    #[test]
    fn test_double_free_detected() {
        let allocator = FixedSizeAllocator::new("test", 64, 2).unwrap();
        let handle = allocator.allocate(&AllocationParams::default()).unwrap();
        allocator.free(&handle).unwrap();
        assert_eq!(
            allocator.free(&handle).unwrap_err().status(),
            ResultStatus::CriticalError
        );
    }

    #[test]
    fn test_invalid_construction() {
        assert!(FixedSizeAllocator::new("test", 0, 4).is_err());
        assert!(FixedSizeAllocator::new("test", 64, 0).is_err());
    }
}
