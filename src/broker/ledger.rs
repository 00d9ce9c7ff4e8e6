//! Ledger of in-flight ownership transfers

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::types::{BufferId, ConnectionId, TransactionId};

/// Lifecycle of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Completed,
    Expired,
}

/// One ownership transfer of a buffer between two connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: TransactionId,
    pub sender: ConnectionId,
    pub receiver: ConnectionId,
    pub buffer: BufferId,
    /// Broker acceptance time in microseconds
    pub created_at_us: i64,
    pub state: TransactionState,
}

impl Transaction {
    /// Whether a receive request names exactly this transfer
    pub fn matches(&self, receiver: ConnectionId, buffer: BufferId, timestamp_us: i64) -> bool {
        self.receiver == receiver && self.buffer == buffer && self.created_at_us == timestamp_us
    }

    /// Whether the transfer involves a connection on either end
    pub fn involves(&self, connection: ConnectionId) -> bool {
        self.sender == connection || self.receiver == connection
    }
}

/// Result of looking up a transaction id
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// Still pending
    Pending(Transaction),
    /// Closed; the record is kept while it is within the history window
    Closed(Option<Transaction>),
    /// Never issued by this pool
    Unissued,
}

/// Pending transfers plus a bounded history of closed ones
#[derive(Debug)]
pub(crate) struct TransactionLedger {
    /// Pending transfers in issue order
    pending: BTreeMap<TransactionId, Transaction>,
    /// Recently closed transfers
    closed: HashMap<TransactionId, Transaction>,
    /// Close order, used to trim `closed`
    closed_order: VecDeque<TransactionId>,
    /// Closed records to remember
    history: usize,
    /// Last issued transaction id
    last_id: u64,
}

impl TransactionLedger {
    pub fn new(history: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            closed: HashMap::new(),
            closed_order: VecDeque::new(),
            history,
            last_id: 0,
        }
    }

    pub fn last_issued(&self) -> TransactionId {
        TransactionId(self.last_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Open a pending transfer
    pub fn open(
        &mut self,
        sender: ConnectionId,
        receiver: ConnectionId,
        buffer: BufferId,
        created_at_us: i64,
    ) -> Transaction {
        self.last_id += 1;
        let transaction = Transaction {
            id: TransactionId(self.last_id),
            sender,
            receiver,
            buffer,
            created_at_us,
            state: TransactionState::Pending,
        };
        self.pending.insert(transaction.id, transaction.clone());
        transaction
    }

    pub fn lookup(&self, id: TransactionId) -> Lookup {
        if id.0 == 0 || id.0 > self.last_id {
            return Lookup::Unissued;
        }
        match self.pending.get(&id) {
            Some(transaction) => Lookup::Pending(transaction.clone()),
            None => Lookup::Closed(self.closed.get(&id).cloned()),
        }
    }

    /// State of a transaction, if it is pending or still in the history
    pub fn state(&self, id: TransactionId) -> Option<TransactionState> {
        self.pending
            .get(&id)
            .or_else(|| self.closed.get(&id))
            .map(|transaction| transaction.state)
    }

    pub fn complete(&mut self, id: TransactionId) -> Option<Transaction> {
        self.close(id, TransactionState::Completed)
    }

    pub fn expire(&mut self, id: TransactionId) -> Option<Transaction> {
        self.close(id, TransactionState::Expired)
    }

    fn close(&mut self, id: TransactionId, state: TransactionState) -> Option<Transaction> {
        let mut transaction = self.pending.remove(&id)?;
        transaction.state = state;

        if self.history > 0 {
            self.closed.insert(id, transaction.clone());
            self.closed_order.push_back(id);
            while self.closed_order.len() > self.history {
                if let Some(oldest) = self.closed_order.pop_front() {
                    self.closed.remove(&oldest);
                }
            }
        }

        Some(transaction)
    }

    /// Pending transfers whose age has reached `timeout_us`
    ///
    /// Creation timestamps are non-decreasing in id order, so the scan stops
    /// at the first transfer that is still fresh.
    pub fn stale(&self, now_us: i64, timeout_us: i64) -> Vec<TransactionId> {
        self.pending
            .values()
            .take_while(|transaction| now_us.saturating_sub(transaction.created_at_us) >= timeout_us)
            .map(|transaction| transaction.id)
            .collect()
    }

    /// Pending transfers sent or targeted by a connection
    pub fn involving(&self, connection: ConnectionId) -> Vec<TransactionId> {
        self.pending
            .values()
            .filter(|transaction| transaction.involves(connection))
            .map(|transaction| transaction.id)
            .collect()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Transaction> {
        self.pending.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_two() -> TransactionLedger {
        let mut ledger = TransactionLedger::new(8);
        ledger.open(ConnectionId(1), ConnectionId(2), BufferId(7), 100);
        ledger.open(ConnectionId(1), ConnectionId(3), BufferId(8), 200);
        ledger
    }

    #[test]
    fn test_ids_increase() {
        let mut ledger = TransactionLedger::new(8);
        let first = ledger.open(ConnectionId(1), ConnectionId(2), BufferId(1), 0);
        let second = ledger.open(ConnectionId(1), ConnectionId(2), BufferId(2), 0);
        assert!(second.id > first.id);
        assert_eq!(ledger.last_issued(), second.id);
    }

    #[test]
    fn test_lookup_states() {
        let mut ledger = ledger_with_two();
        assert!(matches!(ledger.lookup(TransactionId(1)), Lookup::Pending(_)));
        assert_eq!(ledger.lookup(TransactionId(0)), Lookup::Unissued);
        assert_eq!(ledger.lookup(TransactionId(3)), Lookup::Unissued);

        let completed = ledger.complete(TransactionId(1)).unwrap();
        assert_eq!(completed.state, TransactionState::Completed);
        match ledger.lookup(TransactionId(1)) {
            Lookup::Closed(Some(t)) => assert_eq!(t.state, TransactionState::Completed),
            other => panic!("unexpected lookup {:?}", other),
        }
        assert!(ledger.complete(TransactionId(1)).is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut ledger = TransactionLedger::new(1);
        ledger.open(ConnectionId(1), ConnectionId(2), BufferId(1), 0);
        ledger.open(ConnectionId(1), ConnectionId(2), BufferId(2), 0);
        ledger.expire(TransactionId(1));
        ledger.expire(TransactionId(2));

        assert_eq!(ledger.lookup(TransactionId(1)), Lookup::Closed(None));
        assert_eq!(ledger.state(TransactionId(2)), Some(TransactionState::Expired));
    }

    #[test]
    fn test_stale_scan() {
        let ledger = ledger_with_two();
        assert!(ledger.stale(150, 100).is_empty());
        assert_eq!(ledger.stale(200, 100), vec![TransactionId(1)]);
        assert_eq!(ledger.stale(300, 100), vec![TransactionId(1), TransactionId(2)]);
    }

    #[test]
    fn test_involving() {
        let ledger = ledger_with_two();
        assert_eq!(ledger.involving(ConnectionId(1)).len(), 2);
        assert_eq!(ledger.involving(ConnectionId(3)), vec![TransactionId(2)]);
        assert!(ledger.involving(ConnectionId(9)).is_empty());
    }

    #[test]
    fn test_matches_guard() {
        let mut ledger = ledger_with_two();
        let t = ledger.complete(TransactionId(2)).unwrap();
        assert!(t.matches(ConnectionId(3), BufferId(8), 200));
        assert!(!t.matches(ConnectionId(3), BufferId(8), 201));
        assert!(!t.matches(ConnectionId(2), BufferId(8), 200));
    }
}
