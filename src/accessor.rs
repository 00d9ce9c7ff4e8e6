//! Broker-facing call surface used by client facades
//!
//! A facade never touches the broker's state directly; it issues calls
//! through an [`Accessor`]. The [`Broker`] itself is the in-process accessor,
//! and [`crate::transport::LoopbackAccessor`] carries the same calls as
//! marshaled frames.

use crate::{
    broker::{Broker, NoticeReceiver},
    error::Result,
    types::{AllocationParams, BufferId, ConnectionId, NativeHandle, PoolId, ProcessId, TransactionId},
};

/// Calls a client may issue against a pool's broker
///
/// Implementations must deliver calls from one connection in the order they
/// were issued.
pub trait Accessor: Send + Sync + std::fmt::Debug {
    /// Pool this accessor reaches
    fn pool_id(&self) -> PoolId;

    /// Attach a process and obtain its notice channel
    fn connect(&self, process: ProcessId) -> Result<(ConnectionId, NoticeReceiver)>;

    fn allocate(
        &self,
        connection: ConnectionId,
        params: &AllocationParams,
    ) -> Result<(BufferId, NativeHandle)>;

    /// Open a transfer; returns the transaction and acceptance timestamp
    fn send(
        &self,
        sender: ConnectionId,
        receiver: ConnectionId,
        buffer: BufferId,
    ) -> Result<(TransactionId, i64)>;

    fn receive(
        &self,
        receiver: ConnectionId,
        transaction: TransactionId,
        buffer: BufferId,
        timestamp_us: i64,
    ) -> Result<NativeHandle>;

    fn release(&self, connection: ConnectionId, buffer: BufferId) -> Result<()>;

    fn query(&self, connection: ConnectionId, buffer: BufferId) -> Result<NativeHandle>;

    fn detach(&self, connection: ConnectionId) -> Result<()>;
}

impl Accessor for Broker {
    fn pool_id(&self) -> PoolId {
        Broker::pool_id(self)
    }

    fn connect(&self, process: ProcessId) -> Result<(ConnectionId, NoticeReceiver)> {
        Broker::connect(self, process)
    }

    fn allocate(
        &self,
        connection: ConnectionId,
        params: &AllocationParams,
    ) -> Result<(BufferId, NativeHandle)> {
        Broker::allocate(self, connection, params)
    }

    fn send(
        &self,
        sender: ConnectionId,
        receiver: ConnectionId,
        buffer: BufferId,
    ) -> Result<(TransactionId, i64)> {
        Broker::send(self, sender, receiver, buffer)
    }

    fn receive(
        &self,
        receiver: ConnectionId,
        transaction: TransactionId,
        buffer: BufferId,
        timestamp_us: i64,
    ) -> Result<NativeHandle> {
        Broker::receive(self, receiver, transaction, buffer, timestamp_us)
    }

    fn release(&self, connection: ConnectionId, buffer: BufferId) -> Result<()> {
        Broker::release(self, connection, buffer)
    }

    fn query(&self, connection: ConnectionId, buffer: BufferId) -> Result<NativeHandle> {
        Broker::query(self, connection, buffer)
    }

    fn detach(&self, connection: ConnectionId) -> Result<()> {
        Broker::detach(self, connection)
    }
}
