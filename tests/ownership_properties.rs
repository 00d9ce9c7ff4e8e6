//! Property tests: random operation sequences keep custody exclusive

use std::{collections::HashSet, sync::Arc, time::Duration};

use proptest::prelude::*;

use bufferpool::{
    AllocationParams, Broker, BrokerConfig, BufferId, ConnectionId, FixedSizeAllocator,
    ManualClock, NoticeReceiver, ProcessId, ResultStatus, TransferTicket,
};

const PEERS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Allocate { peer: usize },
    Send { from: usize, to: usize, pick: usize },
    Receive { peer: usize, pick: usize },
    Release { peer: usize, pick: usize },
    Advance { millis: u64 },
    Reattach { peer: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..PEERS).prop_map(|peer| Op::Allocate { peer }),
        4 => (0..PEERS, 0..PEERS, any::<usize>())
            .prop_map(|(from, to, pick)| Op::Send { from, to, pick }),
        4 => (0..PEERS, any::<usize>()).prop_map(|(peer, pick)| Op::Receive { peer, pick }),
        2 => (0..PEERS, any::<usize>()).prop_map(|(peer, pick)| Op::Release { peer, pick }),
        1 => (0u64..80).prop_map(|millis| Op::Advance { millis }),
        1 => (0..PEERS).prop_map(|peer| Op::Reattach { peer }),
    ]
}

struct Harness {
    broker: Arc<Broker>,
    clock: Arc<ManualClock>,
    peers: Vec<(ConnectionId, NoticeReceiver)>,
    tickets: Vec<(ConnectionId, TransferTicket)>,
    completed: HashSet<u64>,
    next_process: u32,
}

impl Harness {
    fn new() -> Self {
        let allocator = Arc::new(FixedSizeAllocator::new("props", 64, 6).unwrap());
        let clock = Arc::new(ManualClock::new(0));
        let config = BrokerConfig::new("props")
            .with_transaction_timeout(Duration::from_millis(50))
            .with_max_buffers(6)
            .with_retired_history(4);
        let broker = Arc::new(Broker::with_clock(config, allocator, clock.clone()).unwrap());

        let peers = (0..PEERS as u32)
            .map(|process| broker.connect(ProcessId(process)).unwrap())
            .collect();

        Self {
            broker,
            clock,
            peers,
            tickets: Vec::new(),
            completed: HashSet::new(),
            next_process: PEERS as u32,
        }
    }

    fn connection(&self, peer: usize) -> ConnectionId {
        self.peers[peer].0
    }

    fn owned(&self, peer: usize) -> Vec<BufferId> {
        self.broker.owned_by(self.connection(peer))
    }

    fn apply(&mut self, op: &Op) -> Result<(), TestCaseError> {
        match *op {
            Op::Allocate { peer } => {
                if let Err(err) = self
                    .broker
                    .allocate(self.connection(peer), &AllocationParams::default())
                {
                    prop_assert_eq!(err.status(), ResultStatus::NoMemory);
                }
            }
            Op::Send { from, to, pick } => {
                let owned = self.owned(from);
                if owned.is_empty() {
                    return Ok(());
                }
                let buffer = owned[pick % owned.len()];
                let receiver = self.connection(to);
                match self.broker.send(self.connection(from), receiver, buffer) {
                    Ok((transaction, timestamp_us)) => {
                        prop_assert!(from != to);
                        prop_assert_eq!(self.broker.buffer_owner(buffer), None);
                        self.tickets.push((
                            receiver,
                            TransferTicket {
                                transaction,
                                buffer,
                                timestamp_us,
                            },
                        ));
                    }
                    Err(err) => {
                        prop_assert_eq!(from, to);
                        prop_assert_eq!(err.status(), ResultStatus::Unsupported);
                    }
                }
            }
            Op::Receive { peer, pick } => {
                if self.tickets.is_empty() {
                    return Ok(());
                }
                let (target, ticket) = self.tickets[pick % self.tickets.len()];
                let connection = self.connection(peer);
                let result = self.broker.receive(
                    connection,
                    ticket.transaction,
                    ticket.buffer,
                    ticket.timestamp_us,
                );
                match result {
                    Ok(_) => {
                        prop_assert_eq!(connection, target);
                        prop_assert!(self.completed.insert(ticket.transaction.get()));
                        prop_assert_eq!(self.broker.buffer_owner(ticket.buffer), Some(connection));
                    }
                    Err(err) => {
                        let status = err.status();
                        prop_assert!(
                            status == ResultStatus::NotFound || status == ResultStatus::AlreadyUsed,
                            "unexpected status {}",
                            status
                        );
                    }
                }
            }
            Op::Release { peer, pick } => {
                let owned = self.owned(peer);
                if owned.is_empty() {
                    return Ok(());
                }
                let buffer = owned[pick % owned.len()];
                self.broker.release(self.connection(peer), buffer).map_err(fail)?;
                prop_assert_eq!(self.broker.buffer_owner(buffer), None);
            }
            Op::Advance { millis } => {
                self.clock.advance(Duration::from_millis(millis));
                self.broker.housekeeping().map_err(fail)?;
            }
            Op::Reattach { peer } => {
                self.broker.detach(self.connection(peer)).map_err(fail)?;
                prop_assert!(self.broker.owned_by(self.connection(peer)).is_empty());
                self.peers[peer] = self
                    .broker
                    .connect(ProcessId(self.next_process))
                    .map_err(fail)?;
                self.next_process += 1;
            }
        }
        Ok(())
    }

    fn assert_exclusive(&self) -> Result<(), TestCaseError> {
        self.broker.check_invariants().map_err(fail)?;

        let mut seen = HashSet::new();
        for peer in 0..PEERS {
            for buffer in self.owned(peer) {
                prop_assert!(seen.insert(buffer), "{} owned twice", buffer);
            }
        }
        let stats = self.broker.stats();
        prop_assert!(stats.live_buffers <= 6);
        prop_assert_eq!(
            stats.live_buffers,
            seen.len() + stats.idle_buffers + stats.pending_transactions
        );
        Ok(())
    }
}

fn fail(err: bufferpool::BufferPoolError) -> TestCaseError {
    TestCaseError::fail(err.to_string())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn prop_custody_stays_exclusive(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let mut harness = Harness::new();
        for op in &ops {
            harness.apply(op)?;
            harness.assert_exclusive()?;
        }
    }

    #[test]
    fn prop_tickets_complete_at_most_once(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let mut harness = Harness::new();
        for op in &ops {
            harness.apply(op)?;
        }

        // Replaying every ticket afterwards never yields a second success
        let tickets = harness.tickets.clone();
        for (target, ticket) in tickets {
            let replay = harness.broker.receive(
                target,
                ticket.transaction,
                ticket.buffer,
                ticket.timestamp_us,
            );
            if replay.is_ok() {
                prop_assert!(harness.completed.insert(ticket.transaction.get()));
            }
        }
        harness.assert_exclusive()?;
    }
}
