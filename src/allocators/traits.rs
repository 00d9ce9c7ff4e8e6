//! Backing allocator trait definition

use crate::{
    error::Result,
    types::{AllocationParams, NativeHandle},
};

/// Supplies the memory behind pool buffers
///
/// The broker calls [`BufferAllocator::allocate`] when no idle buffer can
/// serve a request, and [`BufferAllocator::free`] when it evicts an idle
/// buffer. Contents and sizing policy belong to the allocator.
pub trait BufferAllocator: Send + Sync + std::fmt::Debug {
    /// Allocate backing memory for the given parameters
    fn allocate(&self, params: &AllocationParams) -> Result<NativeHandle>;

    /// Release backing memory previously returned by `allocate`
    fn free(&self, handle: &NativeHandle) -> Result<()>;

    /// Whether an idle buffer allocated with `existing` may serve `requested`
    fn compatible(&self, requested: &AllocationParams, existing: &AllocationParams) -> bool {
        requested == existing
    }

    /// Number of buffers this allocator can back at once, if bounded
    fn capacity(&self) -> Option<usize> {
        None
    }

    /// Number of buffers currently backed
    fn in_use(&self) -> usize;

    /// Get allocator type name for debugging
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
