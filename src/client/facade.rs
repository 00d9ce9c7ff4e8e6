//! Per-process client of one buffer pool

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{
    cache::{LocalCache, OutstandingSend},
    connection::ClientConnection,
    stats::{AtomicClientStats, ClientStats},
};
use crate::{
    accessor::Accessor,
    broker::Broker,
    error::{BufferPoolError, Result},
    types::{
        AllocationParams, Buffer, BufferId, ConnectionId, Notice, PoolId, ProcessId,
        TransactionId, TransferTicket,
    },
};

/// Whether a facade may allocate from its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    /// Created against a pool this process allocates from
    Local,
    /// Created only to receive buffers from a remote pool
    Remote,
}

/// Client facade for one pool
///
/// Keeps a cache of the buffers this process owns so repeated access does not
/// round-trip to the broker. The broker stays the only authority on custody:
/// a buffer leaves the cache the moment it is handed to [`send`], before the
/// broker is even asked.
///
/// [`send`]: BufferPoolClient::send
#[derive(Debug)]
pub struct BufferPoolClient {
    pool: PoolId,
    mode: ClientMode,
    connection: ClientConnection,
    cache: Mutex<LocalCache>,
    stats: AtomicClientStats,
}

impl BufferPoolClient {
    /// Facade over a pool this process can allocate from
    pub fn local(broker: Arc<Broker>, process: ProcessId) -> Result<Self> {
        Self::open(broker, process, ClientMode::Local)
    }

    /// Receive-only facade over a pool reached through an accessor
    pub fn remote(accessor: Arc<dyn Accessor>, process: ProcessId) -> Result<Self> {
        Self::open(accessor, process, ClientMode::Remote)
    }

    fn open(accessor: Arc<dyn Accessor>, process: ProcessId, mode: ClientMode) -> Result<Self> {
        let pool = accessor.pool_id();
        let connection = ClientConnection::open(accessor, process)?;
        info!(%pool, connection = %connection.id(), ?mode, "Buffer pool client created");

        Ok(Self {
            pool,
            mode,
            connection,
            cache: Mutex::new(LocalCache::new()),
            stats: AtomicClientStats::default(),
        })
    }

    /// Whether the connection to the broker is still live
    ///
    /// Queued notices are applied first, so a detach by the broker is seen.
    pub fn is_valid(&self) -> bool {
        drop(self.settled_cache());
        self.connection.is_alive()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn process(&self) -> ProcessId {
        self.connection.process()
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool
    }

    pub fn mode(&self) -> ClientMode {
        self.mode
    }

    /// Accessor of the bound broker, for registering a new peer
    pub fn accessor(&self) -> Arc<dyn Accessor> {
        Arc::clone(self.connection.accessor())
    }

    /// Allocate a buffer owned by this process
    pub fn allocate(&self, params: &AllocationParams) -> Result<Buffer> {
        if self.mode == ClientMode::Remote {
            return Err(BufferPoolError::unsupported(format!(
                "allocate on remote client of {}",
                self.pool
            )));
        }

        drop(self.settled_cache());
        let (id, handle) = self
            .connection
            .call("allocate", |accessor, connection| accessor.allocate(connection, params))?;

        let buffer = Buffer::new(self.pool, id, handle);
        self.cache.lock().insert(buffer.clone());
        AtomicClientStats::bump(&self.stats.allocations);
        debug!(pool = %self.pool, buffer = %id, "Buffer allocated");
        Ok(buffer)
    }

    /// Hand an owned buffer to another connection
    ///
    /// The returned ticket must reach the receiver out-of-band.
    pub fn send(&self, receiver: ConnectionId, buffer: &Buffer) -> Result<TransferTicket> {
        self.connection.ensure_alive()?;
        if buffer.pool() != self.pool {
            return Err(self.not_owned(buffer.id()));
        }
        let mut cache = self.settled_cache();
        let entry = cache
            .take(buffer.id())
            .ok_or_else(|| self.not_owned(buffer.id()))?;

        let result = self.connection.call("send", |accessor, connection| {
            accessor.send(connection, receiver, entry.id())
        });
        match result {
            Ok((transaction, timestamp_us)) => {
                cache.record_send(OutstandingSend {
                    transaction,
                    buffer: entry.id(),
                    receiver,
                    timestamp_us,
                });
                AtomicClientStats::bump(&self.stats.sends);
                debug!(pool = %self.pool, %transaction, buffer = %entry.id(), %receiver, "Buffer sent");
                Ok(TransferTicket {
                    transaction,
                    buffer: entry.id(),
                    timestamp_us,
                })
            }
            Err(err) => {
                // Custody is unknown after a transport failure
                if !err.is_transport() {
                    cache.insert(entry);
                }
                Err(err)
            }
        }
    }

    /// Complete a transfer aimed at this connection
    pub fn receive(
        &self,
        transaction: TransactionId,
        buffer: BufferId,
        timestamp_us: i64,
    ) -> Result<Buffer> {
        // Held across the call so the buffer is cached before anyone can
        // look it up through the broker and send it on
        let mut cache = self.settled_cache();
        let handle = self.connection.call("receive", |accessor, connection| {
            accessor.receive(connection, transaction, buffer, timestamp_us)
        })?;

        let received = Buffer::new(self.pool, buffer, handle);
        cache.insert(received.clone());
        AtomicClientStats::bump(&self.stats.receives);
        debug!(pool = %self.pool, %transaction, %buffer, "Buffer received");
        Ok(received)
    }

    /// Complete the transfer described by a ticket
    pub fn receive_ticket(&self, ticket: &TransferTicket) -> Result<Buffer> {
        self.receive(ticket.transaction, ticket.buffer, ticket.timestamp_us)
    }

    /// Return an owned buffer to the pool's free list
    pub fn release(&self, buffer: &Buffer) -> Result<()> {
        self.connection.ensure_alive()?;
        if buffer.pool() != self.pool {
            return Err(self.not_owned(buffer.id()));
        }
        let mut cache = self.settled_cache();
        let entry = cache
            .take(buffer.id())
            .ok_or_else(|| self.not_owned(buffer.id()))?;

        match self
            .connection
            .call("release", |accessor, connection| accessor.release(connection, entry.id()))
        {
            Ok(()) => {
                AtomicClientStats::bump(&self.stats.releases);
                debug!(pool = %self.pool, buffer = %entry.id(), "Buffer released");
                Ok(())
            }
            Err(err) => {
                if !err.is_transport() {
                    cache.insert(entry);
                }
                Err(err)
            }
        }
    }

    /// Look up an owned buffer, asking the broker only on a cache miss
    pub fn get(&self, id: BufferId) -> Result<Buffer> {
        let mut cache = self.settled_cache();
        self.connection.ensure_alive()?;
        if let Some(buffer) = cache.get(id) {
            AtomicClientStats::bump(&self.stats.cache_hits);
            return Ok(buffer.clone());
        }

        AtomicClientStats::bump(&self.stats.cache_misses);
        let handle = self
            .connection
            .call("query", |accessor, connection| accessor.query(connection, id))?;
        let buffer = Buffer::new(self.pool, id, handle);
        cache.insert(buffer.clone());
        Ok(buffer)
    }

    /// Whether this facade currently owns a buffer
    pub fn owns(&self, id: BufferId) -> bool {
        self.settled_cache().contains(id)
    }

    pub fn owned_buffers(&self) -> Vec<Buffer> {
        self.settled_cache().owned()
    }

    pub fn owned_count(&self) -> usize {
        self.settled_cache().owned_count()
    }

    /// Sends the broker accepted that are not yet completed or returned
    pub fn pending_sends(&self) -> Vec<OutstandingSend> {
        self.settled_cache().outstanding()
    }

    /// Apply queued broker notices; returns how many were applied
    pub fn sync(&self) -> Result<usize> {
        self.connection.ensure_alive()?;
        let mut cache = self.cache.lock();
        Ok(self.apply_notices(&mut cache))
    }

    /// Detach from the broker; closing twice is a no-op
    pub fn close(&self) -> Result<()> {
        let detached = self.connection.detach();
        self.cache.lock().clear();
        if let Ok(true) = detached {
            info!(pool = %self.pool, connection = %self.connection.id(), "Buffer pool client closed");
        }
        detached.map(|_| ())
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.snapshot()
    }

    fn not_owned(&self, id: BufferId) -> BufferPoolError {
        BufferPoolError::not_found(format!(
            "{} is not owned by {}",
            id,
            self.connection.id()
        ))
    }

    fn settled_cache(&self) -> MutexGuard<'_, LocalCache> {
        let mut cache = self.cache.lock();
        self.apply_notices(&mut cache);
        cache
    }

    fn apply_notices(&self, cache: &mut LocalCache) -> usize {
        let notices = self.connection.drain();
        let count = notices.len();

        for notice in notices {
            match notice {
                Notice::Completed { transaction, buffer } => {
                    cache.settle(transaction);
                    AtomicClientStats::bump(&self.stats.completions);
                    debug!(pool = %self.pool, %transaction, %buffer, "Send completed");
                }
                Notice::Returned {
                    transaction,
                    buffer,
                    handle,
                } => {
                    cache.settle(transaction);
                    cache.insert(Buffer::new(self.pool, buffer, handle));
                    AtomicClientStats::bump(&self.stats.returns);
                    info!(pool = %self.pool, %transaction, %buffer, "Send expired, buffer returned");
                }
                Notice::Cancelled { transaction, buffer } => {
                    AtomicClientStats::bump(&self.stats.cancellations);
                    info!(pool = %self.pool, %transaction, %buffer, "Incoming transfer cancelled");
                }
                Notice::Reclaimed { buffer } => {
                    cache.take(buffer);
                    AtomicClientStats::bump(&self.stats.reclaims);
                    warn!(pool = %self.pool, %buffer, "Buffer reclaimed by broker");
                }
            }
        }

        // Custody is void once the connection is gone
        if !self.connection.is_alive() {
            cache.clear();
        }
        count
    }
}

impl Drop for BufferPoolClient {
    fn drop(&mut self) {
        if let Err(err) = self.connection.detach() {
            warn!(pool = %self.pool, error = %err, "Detach on drop failed");
        }
    }
}
