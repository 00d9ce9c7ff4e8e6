//! Connection attach, detach and shutdown behaviour

use std::sync::Arc;

use bufferpool::{
    AllocationParams, Broker, BrokerConfig, BufferAllocator, BufferPoolClient, BufferState, ConnectionId,
    ConnectionState, FixedSizeAllocator, ManualClock, Notice, ProcessId, ResultStatus,
    TransactionState,
};

#[cfg(test)]
mod connection_lifecycle_tests {
    use super::*;

    fn create_pool() -> Arc<Broker> {
        let allocator = Arc::new(FixedSizeAllocator::new("lifecycle", 256, 16).unwrap());
        let clock = Arc::new(ManualClock::new(5_000_000));
        Arc::new(Broker::with_clock(BrokerConfig::new("lifecycle"), allocator, clock).unwrap())
    }

    #[test]
    fn test_duplicate_process_is_already_exists() {
        let broker = create_pool();
        let first = BufferPoolClient::local(broker.clone(), ProcessId(7)).unwrap();

        let err = BufferPoolClient::local(broker.clone(), ProcessId(7)).unwrap_err();
        assert_eq!(err.status(), ResultStatus::AlreadyExists);

        // Once detached the process may attach again
        first.close().unwrap();
        let again = BufferPoolClient::local(broker.clone(), ProcessId(7)).unwrap();
        assert!(again.connection_id() > first.connection_id());
    }

    #[test]
    fn test_detach_is_idempotent_and_isolated() {
        let broker = create_pool();
        let (a, _na) = broker.connect(ProcessId(1)).unwrap();
        let (b, _nb) = broker.connect(ProcessId(2)).unwrap();

        let (mine, _) = broker.allocate(a, &AllocationParams::default()).unwrap();
        let (theirs, _) = broker.allocate(b, &AllocationParams::default()).unwrap();

        broker.detach(a).unwrap();
        broker.detach(a).unwrap();

        assert_eq!(broker.connection_state(a), Some(ConnectionState::Detached));
        assert_eq!(broker.buffer_state(mine), Some(BufferState::Allocated));
        assert_eq!(broker.buffer_owner(theirs), Some(b));
        assert_eq!(broker.stats().connections_detached, 1);
        broker.check_invariants().unwrap();
    }

    #[test]
    fn test_detach_unknown_connection_is_not_found() {
        let broker = create_pool();
        let err = broker.detach(ConnectionId(12)).unwrap_err();
        assert_eq!(err.status(), ResultStatus::NotFound);
    }

    #[test]
    fn test_detached_connection_is_refused() {
        let broker = create_pool();
        let (a, _na) = broker.connect(ProcessId(1)).unwrap();
        let (buffer, _) = broker.allocate(a, &AllocationParams::default()).unwrap();
        broker.detach(a).unwrap();

        for status in [
            broker.allocate(a, &AllocationParams::default()).unwrap_err().status(),
            broker.query(a, buffer).unwrap_err().status(),
            broker.release(a, buffer).unwrap_err().status(),
        ] {
            assert_eq!(status, ResultStatus::NotFound);
        }
    }

    #[test]
    fn test_sender_detach_frees_in_flight_buffer() {
        let broker = create_pool();
        let (a, _na) = broker.connect(ProcessId(1)).unwrap();
        let (b, nb) = broker.connect(ProcessId(2)).unwrap();

        let (buffer, _) = broker.allocate(a, &AllocationParams::default()).unwrap();
        let (transaction, ts) = broker.send(a, b, buffer).unwrap();
        broker.detach(a).unwrap();

        assert_eq!(broker.transaction_state(transaction), Some(TransactionState::Expired));
        assert_eq!(broker.buffer_state(buffer), Some(BufferState::Allocated));
        assert_eq!(nb.drain().0, vec![Notice::Cancelled { transaction, buffer }]);

        let err = broker.receive(b, transaction, buffer, ts).unwrap_err();
        assert_eq!(err.status(), ResultStatus::AlreadyUsed);
    }

    #[test]
    fn test_receiver_detach_returns_buffer_to_sender() {
        let broker = create_pool();
        let (a, na) = broker.connect(ProcessId(1)).unwrap();
        let (b, _nb) = broker.connect(ProcessId(2)).unwrap();

        let (buffer, handle) = broker.allocate(a, &AllocationParams::default()).unwrap();
        let (transaction, _) = broker.send(a, b, buffer).unwrap();
        broker.detach(b).unwrap();

        assert_eq!(broker.buffer_owner(buffer), Some(a));
        assert_eq!(
            na.drain().0,
            vec![Notice::Returned { transaction, buffer, handle }]
        );
    }

    #[test]
    fn test_shutdown_reclaims_and_invalidates_clients() {
        let broker = create_pool();
        let client = BufferPoolClient::local(broker.clone(), ProcessId(1)).unwrap();
        let buffer = client.allocate(&AllocationParams::default()).unwrap();

        broker.shutdown().unwrap();
        assert_eq!(broker.buffer_state(buffer.id()), Some(BufferState::Freed));
        assert_eq!(broker.allocator().in_use(), 0);

        // The first touch applies the reclaim notice and sees the closed channel
        assert!(!client.owns(buffer.id()));
        assert!(!client.is_valid());
        assert_eq!(client.stats().reclaims, 1);
        assert_eq!(
            client.allocate(&AllocationParams::default()).unwrap_err().status(),
            ResultStatus::NotFound
        );

        let err = BufferPoolClient::local(broker.clone(), ProcessId(2)).unwrap_err();
        assert_eq!(err.status(), ResultStatus::NotFound);
    }

    #[test]
    fn test_cleanup_keeps_minimum_idle() {
        let allocator = Arc::new(FixedSizeAllocator::new("cleanup", 256, 8).unwrap());
        let config = BrokerConfig::new("cleanup").with_min_idle_buffers(2);
        let broker = Broker::new(config, allocator).unwrap();
        let (a, _na) = broker.connect(ProcessId(1)).unwrap();

        let buffers: Vec<_> = (0..5)
            .map(|_| broker.allocate(a, &AllocationParams::default()).unwrap().0)
            .collect();
        for buffer in &buffers {
            broker.release(a, *buffer).unwrap();
        }

        assert_eq!(broker.cleanup(false).unwrap(), 3);
        assert_eq!(broker.stats().idle_buffers, 2);
        assert_eq!(broker.cleanup(true).unwrap(), 2);
        assert_eq!(broker.stats().live_buffers, 0);
        assert_eq!(broker.allocator().in_use(), 0);
    }
}
