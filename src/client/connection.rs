//! Client side of a connection to a pool's broker

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    accessor::Accessor,
    broker::NoticeReceiver,
    error::{BufferPoolError, Result},
    types::{ConnectionId, Notice, PoolId, ProcessId},
};

/// A live attachment to a pool, invalidated by transport loss
#[derive(Debug)]
pub(crate) struct ClientConnection {
    accessor: Arc<dyn Accessor>,
    pool: PoolId,
    id: ConnectionId,
    process: ProcessId,
    notices: Mutex<NoticeReceiver>,
    alive: AtomicBool,
}

impl ClientConnection {
    pub fn open(accessor: Arc<dyn Accessor>, process: ProcessId) -> Result<Self> {
        let pool = accessor.pool_id();
        let (id, notices) = accessor.connect(process)?;
        debug!(%pool, connection = %id, %process, "Client connection opened");

        Ok(Self {
            accessor,
            pool,
            id,
            process,
            notices: Mutex::new(notices),
            alive: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn accessor(&self) -> &Arc<dyn Accessor> {
        &self.accessor
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(BufferPoolError::not_found(format!(
                "{} to {} is no longer valid",
                self.id, self.pool
            )))
        }
    }

    /// Issue a broker call; a transport failure invalidates the connection
    pub fn call<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&dyn Accessor, ConnectionId) -> Result<T>,
    ) -> Result<T> {
        self.ensure_alive()?;
        let result = f(self.accessor.as_ref(), self.id);
        if let Err(err) = &result {
            if err.is_transport() {
                self.invalidate(operation, &err.to_string());
            }
        }
        result
    }

    /// Take every queued notice; a closed channel invalidates the connection
    pub fn drain(&self) -> Vec<Notice> {
        let (notices, closed) = self.notices.lock().drain();
        if closed {
            self.invalidate("drain", "broker closed the notice channel");
        }
        notices
    }

    /// Detach from the broker; returns false if already invalid
    pub fn detach(&self) -> Result<bool> {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        self.accessor.detach(self.id)?;
        debug!(pool = %self.pool, connection = %self.id, "Client connection detached");
        Ok(true)
    }

    fn invalidate(&self, operation: &str, reason: &str) {
        if self.alive.swap(false, Ordering::AcqRel) {
            warn!(
                pool = %self.pool,
                connection = %self.id,
                operation,
                reason,
                "Connection lost, client invalidated"
            );
        }
    }
}
