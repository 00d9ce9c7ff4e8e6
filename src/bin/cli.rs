use bufferpool::{
    AllocationParams, Broker, BrokerConfig, BufferPoolClient, BufferPoolError, ClientDirectory,
    ConnectionId, FixedSizeAllocator, LoopbackAccessor, ManualClock, ProcessId, Result,
    ResultStatus, TransferTicket,
};
use clap::{value_parser, Arg, ArgMatches, Command};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("bufferpool-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Buffer pool ownership transfer simulator")
        .subcommand(
            Command::new("simulate")
                .about("Run senders and receivers over loopback links")
                .arg(
                    Arg::new("senders")
                        .long("senders")
                        .value_name("N")
                        .help("Number of sending processes")
                        .value_parser(value_parser!(usize))
                        .default_value("4"),
                )
                .arg(
                    Arg::new("receivers")
                        .long("receivers")
                        .value_name("M")
                        .help("Number of receiving processes")
                        .value_parser(value_parser!(usize))
                        .default_value("2"),
                )
                .arg(
                    Arg::new("transfers")
                        .long("transfers")
                        .value_name("K")
                        .help("Transfers per sender")
                        .value_parser(value_parser!(usize))
                        .default_value("100"),
                )
                .arg(
                    Arg::new("loss_rate")
                        .long("loss-rate")
                        .value_name("P")
                        .help("Probability that a transfer ticket is never relayed")
                        .value_parser(value_parser!(f64))
                        .default_value("0.05"),
                )
                .arg(
                    Arg::new("timeout_ms")
                        .long("timeout-ms")
                        .value_name("T")
                        .help("Transaction timeout in milliseconds")
                        .value_parser(value_parser!(u64))
                        .default_value("200"),
                ),
        )
        .subcommand(Command::new("scenario").about("Walk through the reference handoff scenarios"))
        .subcommand(Command::new("info").about("Show version information"))
        .get_matches();

    match matches.subcommand() {
        Some(("simulate", simulate_matches)) => handle_simulate(simulate_matches),
        Some(("scenario", _)) => run_scenarios(),
        Some(("info", _)) => show_info(),
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

/// Seeded decision of which tickets get lost on the relay
struct Lossy {
    rng: StdRng,
    rate: f64,
}

impl Lossy {
    fn new(seed: u64, rate: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            rate: rate.clamp(0.0, 1.0),
        }
    }

    fn drop_next(&mut self) -> bool {
        self.rng.gen_bool(self.rate)
    }
}

fn handle_simulate(matches: &ArgMatches) -> Result<()> {
    let senders = matches.get_one::<usize>("senders").copied().unwrap_or(4);
    let receivers = matches.get_one::<usize>("receivers").copied().unwrap_or(2);
    let transfers = matches.get_one::<usize>("transfers").copied().unwrap_or(100);
    let loss_rate = matches.get_one::<f64>("loss_rate").copied().unwrap_or(0.0);
    let timeout = Duration::from_millis(matches.get_one::<u64>("timeout_ms").copied().unwrap_or(200));

    if senders == 0 || receivers == 0 {
        return Err(BufferPoolError::invalid_config(
            "senders/receivers",
            "Need at least one sender and one receiver",
        ));
    }
    if !(0.0..=1.0).contains(&loss_rate) {
        return Err(BufferPoolError::invalid_config(
            "loss_rate",
            "Loss rate must be between 0 and 1",
        ));
    }

    let capacity = (senders * transfers).max(1);
    let allocator = Arc::new(FixedSizeAllocator::new("simulate", 4096, capacity)?);
    let config = BrokerConfig::new("simulate")
        .with_transaction_timeout(timeout)
        .with_max_buffers(capacity)
        .with_sweep_interval(Some(timeout / 4));
    let broker = Arc::new(Broker::new(config, allocator)?);
    let _sweeper = broker.spawn_sweeper()?;

    println!("Simulating buffer handoffs...");
    println!("  Senders: {}", senders);
    println!("  Receivers: {}", receivers);
    println!("  Transfers per sender: {}", transfers);
    println!("  Loss rate: {:.2}%", loss_rate * 100.0);
    println!("  Timeout: {}ms", timeout.as_millis());

    // Receivers reach the pool through marshaled loopback links
    let mut relays = Vec::with_capacity(receivers);
    let mut receiver_threads = Vec::with_capacity(receivers);
    let mut receiver_ids: Vec<ConnectionId> = Vec::with_capacity(receivers);
    for index in 0..receivers {
        let directory = ClientDirectory::new(ProcessId(2000 + index as u32));
        let client = directory.register_sender(Arc::new(LoopbackAccessor::new(Arc::clone(&broker))))?;
        receiver_ids.push(client.connection_id());

        let (relay_tx, relay_rx) = mpsc::channel::<TransferTicket>();
        relays.push(relay_tx);
        receiver_threads.push(thread::spawn(move || receive_loop(client, relay_rx)));
    }

    let start = Instant::now();
    let mut sender_threads = Vec::with_capacity(senders);
    for index in 0..senders {
        let client = BufferPoolClient::local(Arc::clone(&broker), ProcessId(1000 + index as u32))?;
        let relays = relays.clone();
        let receiver_ids = receiver_ids.clone();
        let mut lossy = Lossy::new(index as u64 + 1, loss_rate);

        sender_threads.push(thread::spawn(move || -> Result<(BufferPoolClient, usize)> {
            let mut lost = 0;
            for transfer in 0..transfers {
                let target = transfer % receiver_ids.len();
                let buffer = client.allocate(&AllocationParams::with_size(1024))?;
                let ticket = client.send(receiver_ids[target], &buffer)?;
                if lossy.drop_next() {
                    lost += 1;
                    continue;
                }
                if relays[target].send(ticket).is_err() {
                    warn!(%target, "Receiver relay closed early");
                }
            }
            Ok((client, lost))
        }));
    }
    drop(relays);

    let mut clients = Vec::with_capacity(senders);
    let mut lost = 0;
    for handle in sender_threads {
        let (client, dropped) = handle
            .join()
            .map_err(|_| BufferPoolError::critical("sender thread panicked"))??;
        lost += dropped;
        clients.push(client);
    }

    let mut received = 0;
    for handle in receiver_threads {
        received += handle
            .join()
            .map_err(|_| BufferPoolError::critical("receiver thread panicked"))?;
    }
    let elapsed = start.elapsed();

    // Lost tickets leave transfers pending until they time out
    thread::sleep(timeout + timeout / 2);
    broker.housekeeping()?;

    let mut returned = 0;
    for client in &clients {
        client.sync()?;
        for buffer in client.owned_buffers() {
            client.release(&buffer)?;
            returned += 1;
        }
    }

    let stats = broker.stats();
    println!("\nResults:");
    println!("  Total time: {:.2}ms", elapsed.as_secs_f64() * 1000.0);
    println!(
        "  Transfers/sec: {:.0}",
        (senders * transfers) as f64 / elapsed.as_secs_f64()
    );
    println!("  Received: {}", received);
    println!("  Tickets lost: {}", lost);
    println!("  Returned to senders: {}", returned);
    println!("  {}", stats.summary());

    broker.check_invariants()?;
    println!("  Invariants: ok");
    info!(received, lost, returned, "Simulation finished");
    Ok(())
}

fn receive_loop(client: Arc<BufferPoolClient>, relay: mpsc::Receiver<TransferTicket>) -> usize {
    let mut received = 0;
    for ticket in relay {
        match client.receive_ticket(&ticket) {
            Ok(buffer) => {
                received += 1;
                if let Err(err) = client.release(&buffer) {
                    warn!(buffer = %buffer.id(), error = %err, "Release failed");
                }
            }
            Err(err) => warn!(transaction = %ticket.transaction, error = %err, "Receive failed"),
        }
    }
    received
}

fn run_scenarios() -> Result<()> {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000_000));
    let allocator = Arc::new(FixedSizeAllocator::new("scenario", 4096, 16)?);
    let broker = Arc::new(Broker::with_clock(BrokerConfig::new("scenario"), allocator, clock)?);

    println!("Scenario 1: receive completes once");
    let a = BufferPoolClient::local(Arc::clone(&broker), ProcessId(1))?;
    let b = BufferPoolClient::remote(a.accessor(), ProcessId(2))?;

    let buffer = a.allocate(&AllocationParams::default())?;
    println!("  A allocated {}", buffer.id());
    let ticket = a.send(b.connection_id(), &buffer)?;
    println!(
        "  A sent {} to {} as {} at {}us",
        buffer.id(),
        b.connection_id(),
        ticket.transaction,
        ticket.timestamp_us
    );
    let received = b.receive_ticket(&ticket)?;
    println!("  {} received {}, owns it: {}", b.connection_id(), received.id(), b.owns(received.id()));
    match b.receive_ticket(&ticket) {
        Err(err) if err.status() == ResultStatus::AlreadyUsed => {
            println!("  Second receive rejected: {}", err.status())
        }
        other => {
            return Err(BufferPoolError::critical(format!(
                "second receive should be rejected, got {:?}",
                other
            )))
        }
    }

    println!("\nScenario 2: receiver detaches before receiving");
    let c = BufferPoolClient::local(Arc::clone(&broker), ProcessId(3))?;
    let second = a.allocate(&AllocationParams::default())?;
    let ticket = a.send(c.connection_id(), &second)?;
    println!("  A sent {} to {} as {}", second.id(), c.connection_id(), ticket.transaction);
    c.close()?;
    println!("  {} detached", c.connection_id());

    let third = a.allocate(&AllocationParams::default())?;
    println!("  A allocated {} and synced notices", third.id());
    println!(
        "  {} back in A's cache: {}",
        second.id(),
        a.owns(second.id())
    );
    println!("  Transaction state: {:?}", broker.transaction_state(ticket.transaction));

    broker.check_invariants()?;
    println!("\n{}", broker.stats().summary());
    Ok(())
}

fn show_info() -> Result<()> {
    println!("Bufferpool v{}", bufferpool::VERSION);
    println!("Broker-arbitrated buffer ownership transfer");
    println!("\nFeatures:");
    println!("  ✓ Single authoritative buffer registry per pool");
    println!("  ✓ Transactional send/receive with replay guard");
    println!("  ✓ Timeout-based expiry with optional background sweep");
    println!("  ✓ Per-process client directory");
    println!("  ✓ Marshaled loopback transport");
    Ok(())
}
