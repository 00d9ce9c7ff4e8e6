//! # Bufferpool - Broker-Arbitrated Buffer Ownership Transfer
//!
//! Bufferpool lets cooperating processes share a pool of buffers without
//! copying data. A broker tracks which connection owns each buffer and moves
//! ownership from a sender to a receiver through short-lived transactions.
//! Clients only manage buffer identity and custody, never buffer bytes.
//!
//! ## Features
//!
//! - **Single authoritative registry**: one broker per pool owns all custody state
//! - **Transactional handoff**: send opens a transaction, receive completes it
//! - **Replay guard**: receives must name the exact transaction, buffer and timestamp
//! - **Bounded staleness**: unfinished transfers expire and return to the sender
//! - **Cached facades**: clients keep owned handles locally, one facade per pool per process
//! - **Pluggable backing memory**: allocators supply opaque, marshalable handles
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐          ┌──────────────────────┐
//! │  BufferPoolClient A  │          │  BufferPoolClient B  │
//! │  - owned-cache       │  ticket  │  - owned-cache       │
//! │  - outstanding sends │ ───────► │                      │
//! └──────────┬───────────┘          └──────────┬───────────┘
//!            │ Accessor (local or loopback)    │
//!            ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Broker (per pool)                  │
//! │  Buffer Registry │ Transaction Ledger │ Connections     │
//! └─────────────────────────────┬───────────────────────────┘
//!                               ▼
//!                      BufferAllocator
//! ```

// Core modules
pub mod accessor;
pub mod allocators;
pub mod broker;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod transport;
pub mod types;

// Main API re-exports
pub use accessor::Accessor;
pub use allocators::{BufferAllocator, FixedSizeAllocator, SlotDescriptor};
pub use broker::{
    Broker, BrokerStats, BufferState, ConnectionState, NoticeReceiver, Sweeper, Transaction,
    TransactionState,
};
pub use client::{BufferPoolClient, ClientDirectory, ClientMode, ClientStats, OutstandingSend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BrokerConfig, BrokerConfigBuilder};
pub use error::{BufferPoolError, Result, ResultStatus, WireError};
pub use transport::LoopbackAccessor;
pub use types::{
    AllocationParams, Buffer, BufferId, ConnectionId, NativeHandle, Notice, PoolId, ProcessId,
    TransactionId, TransferTicket,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
