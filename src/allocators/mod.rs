//! Backing allocators that supply buffer memory to a pool

pub mod fixed;
pub mod traits;

pub use fixed::{FixedSizeAllocator, SlotDescriptor};
pub use traits::BufferAllocator;
