//! Identity and value types shared by the broker and its clients

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{BufferPoolError, Result};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl $name {
            /// Raw integer value
            pub fn get(&self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Global identity of a pool (and of the accessor serving it)
    PoolId(u32),
    "pool#"
);
id_type!(
    /// Pool-scoped buffer identity
    BufferId(u32),
    "buf#"
);
id_type!(
    /// Pool-scoped connection identity
    ConnectionId(u64),
    "conn#"
);
id_type!(
    /// Pool-scoped, monotonically increasing transaction identity
    TransactionId(u64),
    "tx#"
);
id_type!(
    /// Identity of a process attaching to a pool
    ProcessId(u32),
    "pid#"
);

impl PoolId {
    /// Allocate a fresh pool identity
    pub(crate) fn next() -> Self {
        static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);
        Self(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl ProcessId {
    /// Identity of the calling OS process
    pub fn current() -> Self {
        Self(std::process::id())
    }
}

/// Opaque allocation parameters, interpreted only by the backing allocator
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationParams(pub Vec<u8>);

impl AllocationParams {
    /// Parameters requesting a buffer of at least `size` bytes
    pub fn with_size(size: usize) -> Self {
        Self((size as u64).to_le_bytes().to_vec())
    }

    /// Requested size, when the parameters were built by [`AllocationParams::with_size`]
    pub fn requested_size(&self) -> Option<usize> {
        let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
        usize::try_from(u64::from_le_bytes(bytes)).ok()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque, marshalable descriptor of the memory behind a buffer
///
/// Cloning is cheap; the payload is shared.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeHandle(Arc<[u8]>);

impl NativeHandle {
    /// Wrap raw descriptor bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    /// Encode a structured descriptor into a handle
    pub fn encode<T: Serialize>(descriptor: &T) -> Result<Self> {
        Ok(Self::from_bytes(bincode::serialize(descriptor)?))
    }

    /// Decode a structured descriptor from a handle
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.0).map_err(BufferPoolError::from)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeHandle({} bytes)", self.0.len())
    }
}

/// A buffer as seen by a client: identity plus backing handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pool: PoolId,
    id: BufferId,
    handle: NativeHandle,
}

impl Buffer {
    pub(crate) fn new(pool: PoolId, id: BufferId, handle: NativeHandle) -> Self {
        Self { pool, id, handle }
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn handle(&self) -> &NativeHandle {
        &self.handle
    }
}

/// What a sender relays to its receiver out-of-band after a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTicket {
    pub transaction: TransactionId,
    pub buffer: BufferId,
    pub timestamp_us: i64,
}

/// Broker to connection notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    /// The receiver completed a transfer this connection sent
    Completed {
        transaction: TransactionId,
        buffer: BufferId,
    },
    /// A transfer this connection sent expired; the buffer is owned again
    Returned {
        transaction: TransactionId,
        buffer: BufferId,
        handle: NativeHandle,
    },
    /// A transfer aimed at this connection expired before it was received
    Cancelled {
        transaction: TransactionId,
        buffer: BufferId,
    },
    /// The broker took back a buffer this connection owned
    Reclaimed { buffer: BufferId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(BufferId(7).to_string(), "buf#7");
        assert_eq!(TransactionId(42).to_string(), "tx#42");
        assert_eq!(ConnectionId::from(3).to_string(), "conn#3");
    }

    #[test]
    fn test_pool_ids_are_unique() {
        let a = PoolId::next();
        let b = PoolId::next();
        assert!(b > a);
    }

    #[test]
    fn test_allocation_params_size() {
        let params = AllocationParams::with_size(4096);
        assert_eq!(params.requested_size(), Some(4096));
        assert_eq!(AllocationParams(vec![1, 2, 3]).requested_size(), None);
    }

    #[test]
    fn test_native_handle_descriptor() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Descriptor {
            offset: u64,
            len: u64,
        }

        let handle = NativeHandle::encode(&Descriptor { offset: 64, len: 128 }).unwrap();
        let decoded: Descriptor = handle.decode().unwrap();
        assert_eq!(decoded, Descriptor { offset: 64, len: 128 });
        assert!(NativeHandle::from_bytes(vec![1u8]).decode::<Descriptor>().is_err());
    }
}
