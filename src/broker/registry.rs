//! Authoritative buffer registry for one pool

use std::collections::{BTreeSet, HashMap};

use crate::{
    error::{BufferPoolError, Result},
    types::{AllocationParams, BufferId, ConnectionId, NativeHandle, TransactionId},
};

/// Custody state of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Backed and idle in the free pool, owned by no connection
    Allocated,
    /// Owned exclusively by one connection
    Owned(ConnectionId),
    /// Handed to a pending transaction, owned by neither endpoint
    InTransit(TransactionId),
    /// Backing memory returned to the allocator
    Freed,
}

impl BufferState {
    /// Connection owning the buffer, if any
    pub fn owner(&self) -> Option<ConnectionId> {
        match self {
            BufferState::Owned(connection) => Some(*connection),
            _ => None,
        }
    }
}

/// Registry record for a live buffer
#[derive(Debug, Clone)]
pub(crate) struct BufferEntry {
    pub handle: NativeHandle,
    pub params: AllocationParams,
    pub state: BufferState,
}

/// Map from buffer identity to custody state
#[derive(Debug, Default)]
pub(crate) struct BufferRegistry {
    /// Live buffers; freed ones are removed
    buffers: HashMap<BufferId, BufferEntry>,
    /// Buffers in the `Allocated` state, oldest id first
    idle: BTreeSet<BufferId>,
    /// Last issued buffer id
    last_id: u32,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (not freed) buffers
    pub fn live_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of idle buffers in the free pool
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Register a freshly backed buffer owned by `owner`
    pub fn insert(
        &mut self,
        handle: NativeHandle,
        params: AllocationParams,
        owner: ConnectionId,
    ) -> BufferId {
        self.last_id += 1;
        let id = BufferId(self.last_id);
        self.buffers.insert(
            id,
            BufferEntry {
                handle,
                params,
                state: BufferState::Owned(owner),
            },
        );
        id
    }

    /// State of a buffer; `None` for ids never issued
    pub fn state(&self, id: BufferId) -> Option<BufferState> {
        match self.buffers.get(&id) {
            Some(entry) => Some(entry.state),
            None if id.0 != 0 && id.0 <= self.last_id => Some(BufferState::Freed),
            None => None,
        }
    }

    /// Find an idle buffer whose allocation parameters satisfy `accept`
    pub fn find_idle(&self, mut accept: impl FnMut(&AllocationParams) -> bool) -> Option<BufferId> {
        self.idle
            .iter()
            .copied()
            .find(|id| self.buffers.get(id).is_some_and(|entry| accept(&entry.params)))
    }

    /// Look up a buffer that must be owned by `connection`
    pub fn owned_entry(&self, id: BufferId, connection: ConnectionId) -> Result<&BufferEntry> {
        match self.buffers.get(&id) {
            Some(entry) if entry.state == BufferState::Owned(connection) => Ok(entry),
            _ => Err(BufferPoolError::not_found(format!(
                "{} is not owned by {}",
                id, connection
            ))),
        }
    }

    /// Move a buffer into a new state
    pub fn set_state(&mut self, id: BufferId, state: BufferState) -> Result<&BufferEntry> {
        let entry = self
            .buffers
            .get_mut(&id)
            .ok_or_else(|| BufferPoolError::critical(format!("{} missing from registry", id)))?;

        if state == BufferState::Freed {
            return Err(BufferPoolError::critical(format!(
                "{} must be evicted, not marked freed",
                id
            )));
        }

        entry.state = state;
        if state == BufferState::Allocated {
            self.idle.insert(id);
        } else {
            self.idle.remove(&id);
        }
        Ok(entry)
    }

    /// Buffers owned by a connection
    pub fn owned_by(&self, connection: ConnectionId) -> Vec<BufferId> {
        let mut ids: Vec<BufferId> = self
            .buffers
            .iter()
            .filter(|(_, entry)| entry.state == BufferState::Owned(connection))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Remove idle buffers beyond the newest `keep`, returning their handles
    pub fn evict_idle(&mut self, keep: usize) -> Vec<(BufferId, NativeHandle)> {
        let excess = self.idle.len().saturating_sub(keep);
        let victims: Vec<BufferId> = self.idle.iter().copied().take(excess).collect();

        victims
            .into_iter()
            .filter_map(|id| {
                self.idle.remove(&id);
                self.buffers.remove(&id).map(|entry| (id, entry.handle))
            })
            .collect()
    }

    /// Iterate over live buffers
    pub fn iter(&self) -> impl Iterator<Item = (&BufferId, &BufferEntry)> {
        self.buffers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultStatus;

    fn handle(byte: u8) -> NativeHandle {
        NativeHandle::from_bytes(vec![byte])
    }

    #[test]
    fn test_insert_registers_owner() {
        let mut registry = BufferRegistry::new();
        let id = registry.insert(handle(1), AllocationParams::default(), ConnectionId(1));

        assert_eq!(id, BufferId(1));
        assert_eq!(registry.state(id), Some(BufferState::Owned(ConnectionId(1))));
        assert!(registry.owned_entry(id, ConnectionId(1)).is_ok());
        assert_eq!(
            registry.owned_entry(id, ConnectionId(2)).unwrap_err().status(),
            ResultStatus::NotFound
        );
        assert_eq!(registry.state(BufferId(99)), None);
    }

    #[test]
    fn test_idle_tracking() {
        let mut registry = BufferRegistry::new();
        let a = registry.insert(handle(1), AllocationParams::with_size(64), ConnectionId(1));
        let b = registry.insert(handle(2), AllocationParams::with_size(128), ConnectionId(1));

        registry.set_state(a, BufferState::Allocated).unwrap();
        registry.set_state(b, BufferState::Allocated).unwrap();
        assert_eq!(registry.idle_count(), 2);

        let found = registry.find_idle(|params| params.requested_size() == Some(128));
        assert_eq!(found, Some(b));

        registry.set_state(b, BufferState::Owned(ConnectionId(2))).unwrap();
        assert_eq!(registry.idle_count(), 1);
        assert_eq!(registry.owned_by(ConnectionId(2)), vec![b]);
    }

    #[test]
    fn test_evict_idle_keeps_newest() {
        let mut registry = BufferRegistry::new();
        let ids: Vec<BufferId> = (0..4)
            .map(|i| registry.insert(handle(i), AllocationParams::default(), ConnectionId(1)))
            .collect();
        for id in &ids {
            registry.set_state(*id, BufferState::Allocated).unwrap();
        }

        let evicted = registry.evict_idle(1);
        assert_eq!(evicted.len(), 3);
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.state(ids[0]), Some(BufferState::Freed));
        assert_eq!(registry.state(ids[3]), Some(BufferState::Allocated));
    }

    #[test]
    fn test_set_state_on_missing_buffer_is_critical() {
        let mut registry = BufferRegistry::new();
        let err = registry
            .set_state(BufferId(5), BufferState::Allocated)
            .unwrap_err();
        assert_eq!(err.status(), ResultStatus::CriticalError);
    }
}
