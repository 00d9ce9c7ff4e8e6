//! Pool broker: the sole arbiter of buffer custody
//!
//! One [`Broker`] owns the authoritative registry, transaction ledger and
//! connection table of a pool. Every mutation runs under a single pool lock,
//! and every operation first expires transfers that outlived the configured
//! timeout, so a stalled handoff never pins a buffer for longer than the
//! timeout plus the gap to the next operation (or sweep).

pub mod connections;
pub mod ledger;
pub mod registry;
pub mod stats;
pub mod sweeper;

pub use connections::{ConnectionState, NoticeReceiver};
pub use ledger::{Transaction, TransactionState};
pub use registry::BufferState;
pub use stats::BrokerStats;
pub use sweeper::Sweeper;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    allocators::BufferAllocator,
    clock::{duration_us, Clock, SystemClock},
    config::BrokerConfig,
    error::{BufferPoolError, Result},
    types::{
        AllocationParams, BufferId, ConnectionId, NativeHandle, Notice, PoolId, ProcessId,
        TransactionId,
    },
};

use connections::ConnectionTable;
use ledger::{Lookup, TransactionLedger};
use registry::BufferRegistry;
use stats::AtomicBrokerStats;

/// Everything guarded by the pool lock
#[derive(Debug)]
struct PoolState {
    registry: BufferRegistry,
    ledger: TransactionLedger,
    connections: ConnectionTable,
    /// Latest acceptance timestamp handed out
    last_timestamp_us: i64,
    /// Set once an invariant violation is detected
    poisoned: Option<String>,
    /// Set by shutdown
    closed: bool,
}

/// Authoritative owner of one pool's registry and ledger
#[derive(Debug)]
pub struct Broker {
    pool_id: PoolId,
    config: BrokerConfig,
    allocator: Arc<dyn BufferAllocator>,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState>,
    stats: AtomicBrokerStats,
}

impl Broker {
    /// Create a broker over a backing allocator, timed by the system clock
    pub fn new(config: BrokerConfig, allocator: Arc<dyn BufferAllocator>) -> Result<Self> {
        Self::with_clock(config, allocator, Arc::new(SystemClock))
    }

    /// Create a broker with an explicit clock
    pub fn with_clock(
        config: BrokerConfig,
        allocator: Arc<dyn BufferAllocator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let pool_id = PoolId::next();
        info!(
            pool = %pool_id,
            name = %config.name,
            allocator = allocator.type_name(),
            timeout_ms = config.transaction_timeout.as_millis() as u64,
            "Buffer pool broker created"
        );

        Ok(Self {
            pool_id,
            state: Mutex::new(PoolState {
                registry: BufferRegistry::new(),
                ledger: TransactionLedger::new(config.retired_history),
                connections: ConnectionTable::new(),
                last_timestamp_us: i64::MIN,
                poisoned: None,
                closed: false,
            }),
            config,
            allocator,
            clock,
            stats: AtomicBrokerStats::default(),
        })
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.allocator
    }

    /// Attach a process to the pool
    pub fn connect(&self, process: ProcessId) -> Result<(ConnectionId, NoticeReceiver)> {
        self.run("connect", |state, _| {
            if state.closed {
                return Err(BufferPoolError::not_found(format!("{} is shut down", self.pool_id)));
            }

            let (connection, notices) = state.connections.attach(process)?;
            AtomicBrokerStats::bump(&self.stats.connections_attached);
            info!(pool = %self.pool_id, %connection, %process, "Connection attached");
            Ok((connection, notices))
        })
    }

    /// Hand a buffer to `connection`, reusing an idle one when possible
    pub fn allocate(
        &self,
        connection: ConnectionId,
        params: &AllocationParams,
    ) -> Result<(BufferId, NativeHandle)> {
        self.run("allocate", |state, _| {
            state.connections.require_active(connection)?;

            let reusable = state
                .registry
                .find_idle(|existing| self.allocator.compatible(params, existing));
            if let Some(buffer) = reusable {
                let handle = state
                    .registry
                    .set_state(buffer, BufferState::Owned(connection))?
                    .handle
                    .clone();
                AtomicBrokerStats::bump(&self.stats.buffers_reused);
                debug!(pool = %self.pool_id, %buffer, %connection, "Idle buffer reused");
                return Ok((buffer, handle));
            }

            if state.registry.live_count() >= self.config.max_buffers {
                AtomicBrokerStats::bump(&self.stats.allocation_failures);
                return Err(BufferPoolError::no_memory(format!(
                    "{} already holds {} buffers",
                    self.pool_id, self.config.max_buffers
                )));
            }

            let handle = self.allocator.allocate(params).map_err(|err| {
                AtomicBrokerStats::bump(&self.stats.allocation_failures);
                err
            })?;
            let buffer = state
                .registry
                .insert(handle.clone(), params.clone(), connection);
            AtomicBrokerStats::bump(&self.stats.buffers_allocated);
            debug!(pool = %self.pool_id, %buffer, %connection, "Buffer allocated");
            Ok((buffer, handle))
        })
    }

    /// Open a transfer of `buffer` from `sender` to `receiver`
    ///
    /// Returns the transaction id and the acceptance timestamp the receiver
    /// must present. Timestamps never decrease within a pool.
    pub fn send(
        &self,
        sender: ConnectionId,
        receiver: ConnectionId,
        buffer: BufferId,
    ) -> Result<(TransactionId, i64)> {
        self.run("send", |state, now_us| {
            state.connections.require_active(sender)?;
            if receiver == sender {
                return Err(BufferPoolError::unsupported(format!(
                    "transfer of {} from {} to itself",
                    buffer, sender
                )));
            }
            state.connections.require_active(receiver)?;
            state.registry.owned_entry(buffer, sender)?;

            let timestamp_us = now_us.max(state.last_timestamp_us);
            state.last_timestamp_us = timestamp_us;

            let transaction = state.ledger.open(sender, receiver, buffer, timestamp_us);
            state
                .registry
                .set_state(buffer, BufferState::InTransit(transaction.id))?;

            AtomicBrokerStats::bump(&self.stats.transfers_started);
            debug!(
                pool = %self.pool_id,
                transaction = %transaction.id,
                %buffer,
                %sender,
                %receiver,
                "Transfer opened"
            );
            Ok((transaction.id, timestamp_us))
        })
    }

    /// Complete a transfer on behalf of its receiver
    pub fn receive(
        &self,
        receiver: ConnectionId,
        transaction: TransactionId,
        buffer: BufferId,
        timestamp_us: i64,
    ) -> Result<NativeHandle> {
        self.run("receive", |state, _| {
            state.connections.require_active(receiver)?;

            let pending = match state.ledger.lookup(transaction) {
                Lookup::Pending(t) if t.matches(receiver, buffer, timestamp_us) => t,
                Lookup::Closed(Some(t)) if t.matches(receiver, buffer, timestamp_us) => {
                    return Err(self.reject(receiver, BufferPoolError::already_used(transaction.0)));
                }
                Lookup::Closed(None) => {
                    return Err(self.reject(receiver, BufferPoolError::already_used(transaction.0)));
                }
                _ => {
                    return Err(self.reject(
                        receiver,
                        BufferPoolError::not_found(format!(
                            "{} of {} for {} at {}us",
                            transaction, buffer, receiver, timestamp_us
                        )),
                    ));
                }
            };

            Self::expect_in_transit(&state.registry, &pending)?;
            state.ledger.complete(transaction);
            let handle = state
                .registry
                .set_state(buffer, BufferState::Owned(receiver))?
                .handle
                .clone();
            state
                .connections
                .notify(pending.sender, Notice::Completed { transaction, buffer });

            AtomicBrokerStats::bump(&self.stats.transfers_completed);
            debug!(
                pool = %self.pool_id,
                %transaction,
                %buffer,
                sender = %pending.sender,
                %receiver,
                "Transfer completed"
            );
            Ok(handle)
        })
    }

    /// Return an owned buffer to the free pool
    pub fn release(&self, connection: ConnectionId, buffer: BufferId) -> Result<()> {
        self.run("release", |state, _| {
            state.connections.require_active(connection)?;
            state.registry.owned_entry(buffer, connection)?;
            state.registry.set_state(buffer, BufferState::Allocated)?;

            AtomicBrokerStats::bump(&self.stats.buffers_released);
            debug!(pool = %self.pool_id, %buffer, %connection, "Buffer released");
            Ok(())
        })
    }

    /// Handle of a buffer owned by `connection`
    pub fn query(&self, connection: ConnectionId, buffer: BufferId) -> Result<NativeHandle> {
        self.run("query", |state, _| {
            state.connections.require_active(connection)?;
            Ok(state.registry.owned_entry(buffer, connection)?.handle.clone())
        })
    }

    /// Detach a connection and reclaim everything it holds
    ///
    /// Owned buffers return to the free pool and the owner is sent a
    /// `Reclaimed` notice for each. Detaching an already detached connection
    /// is a no-op.
    pub fn detach(&self, connection: ConnectionId) -> Result<()> {
        self.run("detach", |state, _| self.detach_locked(state, connection))
    }

    /// Expire every transfer that outlived the timeout
    pub fn housekeeping(&self) -> Result<usize> {
        let mut state = self.state.lock();
        self.check_poisoned(&state)?;
        let result = self.expire_stale(&mut state, self.clock.now_us());
        self.poison_on_critical(&mut state, "housekeeping", &result);
        result
    }

    /// Evict idle buffers back to the allocator
    ///
    /// Keeps `min_idle_buffers` of them unless `clear_all` is set.
    pub fn cleanup(&self, clear_all: bool) -> Result<usize> {
        self.run("cleanup", |state, _| {
            let keep = if clear_all {
                0
            } else {
                self.config.min_idle_buffers
            };
            Ok(self.evict_idle_locked(state, keep))
        })
    }

    /// Detach every connection and release all idle memory
    ///
    /// Owners receive `Reclaimed` for each buffer taken from them.
    pub fn shutdown(&self) -> Result<()> {
        self.run("shutdown", |state, _| {
            if state.closed {
                return Ok(());
            }
            state.closed = true;

            let connections = state.connections.active_ids();
            for connection in &connections {
                self.detach_locked(state, *connection)?;
            }
            let evicted = self.evict_idle_locked(state, 0);

            info!(
                pool = %self.pool_id,
                detached = connections.len(),
                evicted,
                "Buffer pool shut down"
            );
            Ok(())
        })
    }

    /// Start the periodic sweep configured by `sweep_interval`
    pub fn spawn_sweeper(self: &Arc<Self>) -> Result<Option<Sweeper>> {
        match self.config.sweep_interval {
            Some(interval) => Sweeper::spawn(Arc::downgrade(self), self.pool_id, interval).map(Some),
            None => Ok(None),
        }
    }

    pub fn buffer_state(&self, buffer: BufferId) -> Option<BufferState> {
        self.state.lock().registry.state(buffer)
    }

    pub fn buffer_owner(&self, buffer: BufferId) -> Option<ConnectionId> {
        self.buffer_state(buffer).and_then(|state| state.owner())
    }

    /// State of a transaction that is pending or still in the history window
    pub fn transaction_state(&self, transaction: TransactionId) -> Option<TransactionState> {
        self.state.lock().ledger.state(transaction)
    }

    pub fn connection_state(&self, connection: ConnectionId) -> Option<ConnectionState> {
        self.state.lock().connections.state(connection)
    }

    /// Buffers currently owned by a connection
    pub fn owned_by(&self, connection: ConnectionId) -> Vec<BufferId> {
        self.state.lock().registry.owned_by(connection)
    }

    /// Highest transaction id issued so far
    pub fn last_transaction(&self) -> TransactionId {
        self.state.lock().ledger.last_issued()
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned.is_some()
    }

    /// Counters plus current occupancy
    pub fn stats(&self) -> BrokerStats {
        let state = self.state.lock();
        BrokerStats {
            live_buffers: state.registry.live_count(),
            idle_buffers: state.registry.idle_count(),
            pending_transactions: state.ledger.pending_count(),
            active_connections: state.connections.active_ids().len(),
            ..self.stats.snapshot()
        }
    }

    /// Verify the custody invariants of the pool
    ///
    /// Every buffer has one active owner, is idle, or is in transit under
    /// exactly one pending transaction that references it; every pending
    /// transaction joins two active connections.
    pub fn check_invariants(&self) -> Result<()> {
        let state = self.state.lock();

        for (id, entry) in state.registry.iter() {
            match entry.state {
                BufferState::Owned(owner) if !state.connections.is_active(owner) => {
                    return Err(BufferPoolError::critical(format!(
                        "{} owned by inactive {}",
                        id, owner
                    )));
                }
                BufferState::InTransit(transaction) => match state.ledger.lookup(transaction) {
                    Lookup::Pending(t) if t.buffer == *id => {}
                    _ => {
                        return Err(BufferPoolError::critical(format!(
                            "{} in transit under {} which is not pending for it",
                            id, transaction
                        )));
                    }
                },
                BufferState::Freed => {
                    return Err(BufferPoolError::critical(format!(
                        "{} is freed but still registered",
                        id
                    )));
                }
                BufferState::Owned(_) | BufferState::Allocated => {}
            }
        }

        for transaction in state.ledger.pending() {
            Self::expect_in_transit(&state.registry, transaction)?;
            if !state.connections.is_active(transaction.sender)
                || !state.connections.is_active(transaction.receiver)
            {
                return Err(BufferPoolError::critical(format!(
                    "{} joins an inactive connection",
                    transaction.id
                )));
            }
        }

        Ok(())
    }

    fn run<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut PoolState, i64) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        self.check_poisoned(&state)?;

        let now_us = self.clock.now_us();
        let result = self
            .expire_stale(&mut state, now_us)
            .and_then(|_| f(&mut state, now_us));
        self.poison_on_critical(&mut state, operation, &result);
        result
    }

    fn check_poisoned(&self, state: &PoolState) -> Result<()> {
        match &state.poisoned {
            Some(reason) => Err(BufferPoolError::critical(format!(
                "{} is poisoned: {}",
                self.pool_id, reason
            ))),
            None => Ok(()),
        }
    }

    fn poison_on_critical<T>(&self, state: &mut PoolState, operation: &str, result: &Result<T>) {
        if let Err(BufferPoolError::Critical { message }) = result {
            error!(pool = %self.pool_id, operation, %message, "Invariant violation, pool poisoned");
            state.poisoned = Some(message.clone());
        }
    }

    fn reject(&self, receiver: ConnectionId, err: BufferPoolError) -> BufferPoolError {
        AtomicBrokerStats::bump(&self.stats.receive_rejections);
        warn!(pool = %self.pool_id, %receiver, status = %err.status(), error = %err, "Receive rejected");
        err
    }

    fn expire_stale(&self, state: &mut PoolState, now_us: i64) -> Result<usize> {
        let timeout_us = duration_us(self.config.transaction_timeout);
        let stale = state.ledger.stale(now_us, timeout_us);
        for transaction in &stale {
            self.expire_transaction(state, *transaction, "timeout")?;
        }
        Ok(stale.len())
    }

    /// Close a pending transfer and give its buffer back to the sender
    fn expire_transaction(
        &self,
        state: &mut PoolState,
        id: TransactionId,
        cause: &'static str,
    ) -> Result<()> {
        let transaction = state
            .ledger
            .expire(id)
            .ok_or_else(|| BufferPoolError::critical(format!("{} is not pending", id)))?;
        Self::expect_in_transit(&state.registry, &transaction)?;

        let returned = state.connections.is_active(transaction.sender);
        if returned {
            let handle = state
                .registry
                .set_state(transaction.buffer, BufferState::Owned(transaction.sender))?
                .handle
                .clone();
            state.connections.notify(
                transaction.sender,
                Notice::Returned {
                    transaction: id,
                    buffer: transaction.buffer,
                    handle,
                },
            );
        } else {
            state
                .registry
                .set_state(transaction.buffer, BufferState::Allocated)?;
        }
        state.connections.notify(
            transaction.receiver,
            Notice::Cancelled {
                transaction: id,
                buffer: transaction.buffer,
            },
        );

        AtomicBrokerStats::bump(&self.stats.transfers_expired);
        warn!(
            pool = %self.pool_id,
            transaction = %id,
            buffer = %transaction.buffer,
            sender = %transaction.sender,
            receiver = %transaction.receiver,
            cause,
            returned,
            "Transfer expired"
        );
        Ok(())
    }

    fn detach_locked(&self, state: &mut PoolState, connection: ConnectionId) -> Result<()> {
        // Owners hear about reclaimed buffers before their channel closes
        let owned = state.registry.owned_by(connection);
        for buffer in &owned {
            state
                .connections
                .notify(connection, Notice::Reclaimed { buffer: *buffer });
        }

        if !state.connections.detach(connection)? {
            debug!(pool = %self.pool_id, %connection, "Connection already detached");
            return Ok(());
        }

        let involved = state.ledger.involving(connection);
        for transaction in &involved {
            self.expire_transaction(state, *transaction, "detach")?;
        }

        for buffer in &owned {
            state.registry.set_state(*buffer, BufferState::Allocated)?;
        }

        AtomicBrokerStats::bump(&self.stats.connections_detached);
        info!(
            pool = %self.pool_id,
            %connection,
            reclaimed = owned.len(),
            expired = involved.len(),
            "Connection detached"
        );
        Ok(())
    }

    fn evict_idle_locked(&self, state: &mut PoolState, keep: usize) -> usize {
        let evicted = state.registry.evict_idle(keep);
        for (buffer, handle) in &evicted {
            if let Err(err) = self.allocator.free(handle) {
                warn!(pool = %self.pool_id, %buffer, error = %err, "Backing allocator failed to free buffer");
            }
        }

        AtomicBrokerStats::add(&self.stats.buffers_evicted, evicted.len() as u64);
        if !evicted.is_empty() {
            debug!(pool = %self.pool_id, evicted = evicted.len(), "Idle buffers evicted");
        }
        evicted.len()
    }

    fn expect_in_transit(registry: &BufferRegistry, transaction: &Transaction) -> Result<()> {
        match registry.state(transaction.buffer) {
            Some(BufferState::InTransit(id)) if id == transaction.id => Ok(()),
            other => Err(BufferPoolError::critical(format!(
                "{} of {} found in state {:?}",
                transaction.buffer, transaction.id, other
            ))),
        }
    }
}
