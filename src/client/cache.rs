//! Facade-local view of owned buffers and outstanding sends

use std::collections::{BTreeMap, HashMap};

use crate::types::{Buffer, BufferId, ConnectionId, TransactionId};

/// A send the broker accepted that has not been settled by a notice yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingSend {
    pub transaction: TransactionId,
    pub buffer: BufferId,
    pub receiver: ConnectionId,
    pub timestamp_us: i64,
}

/// Buffers this facade owns, plus sends awaiting completion or return
///
/// A buffer is never in `owned` while one of its sends is outstanding.
#[derive(Debug, Default)]
pub(crate) struct LocalCache {
    owned: HashMap<BufferId, Buffer>,
    outstanding: BTreeMap<TransactionId, OutstandingSend>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, buffer: Buffer) {
        self.owned.insert(buffer.id(), buffer);
    }

    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.owned.get(&id)
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.owned.contains_key(&id)
    }

    /// Remove an owned buffer so no other caller can observe it
    pub fn take(&mut self, id: BufferId) -> Option<Buffer> {
        self.owned.remove(&id)
    }

    pub fn owned(&self) -> Vec<Buffer> {
        let mut buffers: Vec<Buffer> = self.owned.values().cloned().collect();
        buffers.sort_unstable_by_key(|buffer| buffer.id());
        buffers
    }

    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    pub fn record_send(&mut self, send: OutstandingSend) {
        self.outstanding.insert(send.transaction, send);
    }

    /// Forget an outstanding send once the broker reported its outcome
    pub fn settle(&mut self, transaction: TransactionId) -> Option<OutstandingSend> {
        self.outstanding.remove(&transaction)
    }

    pub fn outstanding(&self) -> Vec<OutstandingSend> {
        self.outstanding.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.owned.clear();
        self.outstanding.clear();
    }
}
