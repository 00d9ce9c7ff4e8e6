//! Client directory: one facade per pool per process

use std::sync::Arc;

use bufferpool::{
    Accessor, AllocationParams, Broker, BrokerConfig, ClientDirectory, ClientMode,
    ConnectionState, FixedSizeAllocator, LoopbackAccessor, PoolId, ProcessId, ResultStatus,
};

#[cfg(test)]
mod directory_tests {
    use super::*;

    fn create_pool(name: &str) -> Arc<Broker> {
        let allocator = Arc::new(FixedSizeAllocator::new(name, 512, 8).unwrap());
        Arc::new(Broker::new(BrokerConfig::new(name), allocator).unwrap())
    }

    #[test]
    fn test_create_returns_existing_facade() {
        let directory = ClientDirectory::new(ProcessId(1));
        let broker = create_pool("shared");

        let first = directory.create(&broker).unwrap();
        let second = directory.create(&broker).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.stats().connections_attached, 1);
    }

    #[test]
    fn test_pools_are_independent() {
        let directory = ClientDirectory::new(ProcessId(1));
        let left = create_pool("left");
        let right = create_pool("right");

        let l = directory.create(&left).unwrap();
        let r = directory.create(&right).unwrap();
        assert_ne!(l.pool_id(), r.pool_id());
        assert_eq!(directory.len(), 2);

        assert!(Arc::ptr_eq(&directory.get(left.pool_id()).unwrap(), &l));
        assert!(directory.get(PoolId(u32::MAX)).is_none());
    }

    #[test]
    fn test_register_sender_reuses_any_mode() {
        let directory = ClientDirectory::new(ProcessId(1));
        let broker = create_pool("reuse");

        let local = directory.create(&broker).unwrap();
        let via_sender = directory
            .register_sender(Arc::new(LoopbackAccessor::new(broker.clone())))
            .unwrap();
        assert!(Arc::ptr_eq(&local, &via_sender));
        assert_eq!(via_sender.mode(), ClientMode::Local);
    }

    #[test]
    fn test_create_conflicts_with_live_remote() {
        let directory = ClientDirectory::new(ProcessId(9));
        let broker = create_pool("conflict");

        let remote = directory
            .register_sender(Arc::new(LoopbackAccessor::new(broker.clone())))
            .unwrap();
        assert_eq!(remote.mode(), ClientMode::Remote);

        let err = directory.create(&broker).unwrap_err();
        assert_eq!(err.status(), ResultStatus::AlreadyExists);
    }

    #[test]
    fn test_separate_processes_get_separate_facades() {
        let broker = create_pool("processes");
        let alpha = ClientDirectory::new(ProcessId(1));
        let beta = ClientDirectory::new(ProcessId(2));

        let a = alpha.create(&broker).unwrap();
        let b = beta.create(&broker).unwrap();
        assert_ne!(a.connection_id(), b.connection_id());

        let buffer = a.allocate(&AllocationParams::default()).unwrap();
        let ticket = a.send(b.connection_id(), &buffer).unwrap();
        let peer = beta.find_by_connection(b.connection_id()).unwrap();
        peer.receive_ticket(&ticket).unwrap();
        assert!(b.owns(buffer.id()));
    }

    #[test]
    fn test_last_handle_drop_detaches() {
        let directory = ClientDirectory::new(ProcessId(3));
        let broker = create_pool("teardown");

        let client = directory.create(&broker).unwrap();
        let connection = client.connection_id();
        let buffer = client.allocate(&AllocationParams::default()).unwrap();
        drop(client);

        assert!(directory.is_empty());
        assert_eq!(broker.connection_state(connection), Some(ConnectionState::Detached));
        assert_eq!(broker.buffer_owner(buffer.id()), None);

        // A fresh facade can be created afterwards
        let fresh = directory.create(&broker).unwrap();
        assert_ne!(fresh.connection_id(), connection);
    }

    #[test]
    fn test_close_detaches_and_forgets() {
        let directory = ClientDirectory::new(ProcessId(4));
        let broker = create_pool("close");

        let client = directory.create(&broker).unwrap();
        assert!(directory.close(broker.pool_id()).unwrap());
        assert!(!client.is_valid());
        assert!(directory.get(broker.pool_id()).is_none());
        assert!(!directory.close(broker.pool_id()).unwrap());
    }

    #[test]
    fn test_remote_accessor_reports_pool() {
        let broker = create_pool("accessor");
        let loopback = LoopbackAccessor::new(broker.clone());
        assert_eq!(loopback.pool_id(), broker.pool_id());

        let directory = ClientDirectory::new(ProcessId(5));
        let remote = directory.register_sender(Arc::new(loopback)).unwrap();
        assert_eq!(remote.accessor().pool_id(), broker.pool_id());
    }
}
