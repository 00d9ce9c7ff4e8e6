//! Process-wide map from pool to its client facade

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::debug;

use super::facade::{BufferPoolClient, ClientMode};
use crate::{
    accessor::Accessor,
    broker::Broker,
    error::{BufferPoolError, Result},
    types::{ConnectionId, PoolId, ProcessId},
};

/// Guarantees at most one live facade per pool for a process
///
/// Entries are weak: a facade is detached when its last handle drops, and
/// dead entries are pruned whenever the directory is touched.
#[derive(Debug)]
pub struct ClientDirectory {
    process: ProcessId,
    clients: Mutex<HashMap<PoolId, Weak<BufferPoolClient>>>,
}

impl ClientDirectory {
    pub fn new(process: ProcessId) -> Self {
        Self {
            process,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Directory for the calling OS process
    pub fn for_current_process() -> Self {
        Self::new(ProcessId::current())
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Facade for a pool this process allocates from
    ///
    /// Returns the existing local facade if there is one. A live remote facade
    /// for the same pool is a conflict.
    pub fn create(&self, broker: &Arc<Broker>) -> Result<Arc<BufferPoolClient>> {
        let pool = broker.pool_id();
        let mut clients = self.clients.lock();
        Self::prune(&mut clients);

        if let Some(existing) = clients.get(&pool).and_then(Weak::upgrade) {
            if existing.is_valid() {
                return match existing.mode() {
                    ClientMode::Local => Ok(existing),
                    ClientMode::Remote => Err(BufferPoolError::already_exists(format!(
                        "remote client for {} in {}",
                        pool, self.process
                    ))),
                };
            }
        }

        let client = Arc::new(BufferPoolClient::local(Arc::clone(broker), self.process)?);
        clients.insert(pool, Arc::downgrade(&client));
        debug!(%pool, process = %self.process, "Local client registered");
        Ok(client)
    }

    /// Facade for receiving from a pool reached through `accessor`
    ///
    /// Returns whatever live facade already exists for that pool.
    pub fn register_sender(&self, accessor: Arc<dyn Accessor>) -> Result<Arc<BufferPoolClient>> {
        let pool = accessor.pool_id();
        let mut clients = self.clients.lock();
        Self::prune(&mut clients);

        if let Some(existing) = clients.get(&pool).and_then(Weak::upgrade) {
            if existing.is_valid() {
                return Ok(existing);
            }
        }

        let client = Arc::new(BufferPoolClient::remote(accessor, self.process)?);
        clients.insert(pool, Arc::downgrade(&client));
        debug!(%pool, process = %self.process, "Remote client registered");
        Ok(client)
    }

    pub fn get(&self, pool: PoolId) -> Option<Arc<BufferPoolClient>> {
        let mut clients = self.clients.lock();
        Self::prune(&mut clients);
        clients.get(&pool).and_then(Weak::upgrade)
    }

    /// Facade whose connection has the given id
    ///
    /// Connection ids are pool-scoped, so this returns the first match.
    pub fn find_by_connection(&self, connection: ConnectionId) -> Option<Arc<BufferPoolClient>> {
        let mut clients = self.clients.lock();
        Self::prune(&mut clients);
        clients
            .values()
            .filter_map(Weak::upgrade)
            .find(|client| client.connection_id() == connection)
    }

    /// Close and forget the facade of a pool; returns false if there was none
    pub fn close(&self, pool: PoolId) -> Result<bool> {
        let removed = self.clients.lock().remove(&pool).and_then(|weak| weak.upgrade());
        match removed {
            Some(client) => {
                client.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn len(&self) -> usize {
        let mut clients = self.clients.lock();
        Self::prune(&mut clients);
        clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(clients: &mut HashMap<PoolId, Weak<BufferPoolClient>>) {
        clients.retain(|_, client| client.strong_count() > 0);
    }
}
