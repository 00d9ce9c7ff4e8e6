//! Broker-side connection table

use std::{
    collections::HashMap,
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
};

use tracing::debug;

use crate::{
    error::{BufferPoolError, Result},
    types::{ConnectionId, Notice, ProcessId},
};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Attaching,
    Active,
    /// Terminal
    Detached,
}

/// Receiving end of a connection's notice channel
#[derive(Debug)]
pub struct NoticeReceiver {
    rx: Receiver<Notice>,
}

impl NoticeReceiver {
    /// Collect every queued notice
    ///
    /// The flag is true once the broker has closed the channel and nothing
    /// else will arrive.
    pub fn drain(&self) -> (Vec<Notice>, bool) {
        let mut notices = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(notice) => notices.push(notice),
                Err(TryRecvError::Empty) => return (notices, false),
                Err(TryRecvError::Disconnected) => return (notices, true),
            }
        }
    }
}

#[derive(Debug)]
struct ConnectionRecord {
    process: ProcessId,
    state: ConnectionState,
    /// Dropped with the record on detach, which closes the client's receiver
    notices: Option<Sender<Notice>>,
}

/// Connections of a pool that have not yet detached
///
/// Detached records are dropped; ids up to `last_id` without a record are
/// known to be detached.
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    records: HashMap<ConnectionId, ConnectionRecord>,
    last_id: u64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a process, rejecting a second live connection for it
    pub fn attach(&mut self, process: ProcessId) -> Result<(ConnectionId, NoticeReceiver)> {
        let duplicate = self
            .records
            .iter()
            .find(|(_, record)| record.process == process);
        if let Some((existing, _)) = duplicate {
            return Err(BufferPoolError::already_exists(format!(
                "{} already attached as {}",
                process, existing
            )));
        }

        self.last_id += 1;
        let id = ConnectionId(self.last_id);
        self.records.insert(
            id,
            ConnectionRecord {
                process,
                state: ConnectionState::Attaching,
                notices: None,
            },
        );

        let (tx, rx) = mpsc::channel();
        if let Some(record) = self.records.get_mut(&id) {
            record.notices = Some(tx);
            record.state = ConnectionState::Active;
        }

        Ok((id, NoticeReceiver { rx }))
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        match self.records.get(&id) {
            Some(record) => Some(record.state),
            None if self.was_issued(id) => Some(ConnectionState::Detached),
            None => None,
        }
    }

    fn was_issued(&self, id: ConnectionId) -> bool {
        id.0 != 0 && id.0 <= self.last_id
    }

    pub fn is_active(&self, id: ConnectionId) -> bool {
        self.state(id) == Some(ConnectionState::Active)
    }

    pub fn require_active(&self, id: ConnectionId) -> Result<()> {
        if self.is_active(id) {
            Ok(())
        } else {
            Err(BufferPoolError::not_found(format!("{} is not active", id)))
        }
    }

    /// Mark a connection detached; returns false when it already was
    pub fn detach(&mut self, id: ConnectionId) -> Result<bool> {
        if !self.was_issued(id) {
            return Err(BufferPoolError::not_found(format!("{} was never attached", id)));
        }
        // Dropping the record drops the notice sender, closing the channel
        Ok(self.records.remove(&id).is_some())
    }

    /// Queue a notice for an active connection
    pub fn notify(&self, id: ConnectionId, notice: Notice) {
        let Some(sender) = self.records.get(&id).and_then(|record| record.notices.as_ref()) else {
            return;
        };
        if sender.send(notice).is_err() {
            debug!(connection = %id, "Notice dropped, client side receiver is gone");
        }
    }

    pub fn active_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .records
            .iter()
            .filter(|(_, record)| record.state == ConnectionState::Active)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ResultStatus, types::BufferId};

    #[test]
    fn test_attach_and_duplicate() {
        let mut table = ConnectionTable::new();
        let (id, _rx) = table.attach(ProcessId(10)).unwrap();
        assert_eq!(table.state(id), Some(ConnectionState::Active));

        let err = table.attach(ProcessId(10)).unwrap_err();
        assert_eq!(err.status(), ResultStatus::AlreadyExists);

        let (other, _rx2) = table.attach(ProcessId(11)).unwrap();
        assert!(other > id);
    }

    #[test]
    fn test_detach_is_idempotent() {
        let mut table = ConnectionTable::new();
        let (id, rx) = table.attach(ProcessId(1)).unwrap();

        assert!(table.detach(id).unwrap());
        assert!(!table.detach(id).unwrap());
        assert_eq!(
            table.detach(ConnectionId(42)).unwrap_err().status(),
            ResultStatus::NotFound
        );

        let (_, closed) = rx.drain();
        assert!(closed);

        // The process may attach again once detached
        assert!(table.attach(ProcessId(1)).is_ok());
    }

    #[test]
    fn test_detached_records_are_dropped() {
        let mut table = ConnectionTable::new();
        let mut ids = Vec::new();
        for round in 0..100 {
            let (id, _rx) = table.attach(ProcessId(round % 3)).unwrap();
            table.detach(id).unwrap();
            ids.push(id);
        }

        assert!(table.records.is_empty());
        assert!(ids.iter().all(|id| table.state(*id) == Some(ConnectionState::Detached)));
        assert_eq!(table.state(ConnectionId(101)), None);
        assert!(!table.detach(ids[0]).unwrap());
        assert!(table.active_ids().is_empty());
    }

    #[test]
    fn test_notify_delivers_to_active_only() {
        let mut table = ConnectionTable::new();
        let (id, rx) = table.attach(ProcessId(1)).unwrap();

        table.notify(id, Notice::Reclaimed { buffer: BufferId(3) });
        let (notices, closed) = rx.drain();
        assert_eq!(notices, vec![Notice::Reclaimed { buffer: BufferId(3) }]);
        assert!(!closed);

        table.detach(id).unwrap();
        table.notify(id, Notice::Reclaimed { buffer: BufferId(4) });
        let (notices, closed) = rx.drain();
        assert!(notices.is_empty());
        assert!(closed);
    }
}
