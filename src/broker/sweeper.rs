//! Background expiry for pools that see little traffic

use std::{
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::Broker;
use crate::{error::{BufferPoolError, Result}, types::PoolId};

#[derive(Debug, Default)]
struct Signal {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Periodically runs broker housekeeping until dropped or the broker goes away
#[derive(Debug)]
pub struct Sweeper {
    signal: Arc<Signal>,
    thread: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub(crate) fn spawn(broker: Weak<Broker>, pool: PoolId, interval: Duration) -> Result<Self> {
        let signal = Arc::new(Signal::default());
        let worker_signal = Arc::clone(&signal);

        let thread = thread::Builder::new()
            .name(format!("sweeper-{}", pool))
            .spawn(move || sweep_loop(broker, pool, interval, worker_signal))
            .map_err(|err| BufferPoolError::critical(format!("failed to start sweeper: {}", err)))?;

        debug!(%pool, interval_ms = interval.as_millis() as u64, "Sweeper started");
        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    /// Stop the sweeper and wait for its thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.signal.stop.lock() = true;
        self.signal.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Sweeper thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep_loop(broker: Weak<Broker>, pool: PoolId, interval: Duration, signal: Arc<Signal>) {
    let mut stop = signal.stop.lock();
    loop {
        if *stop {
            break;
        }
        signal.wake.wait_for(&mut stop, interval);
        if *stop {
            break;
        }

        let Some(broker) = broker.upgrade() else {
            debug!(%pool, "Broker dropped, sweeper exiting");
            break;
        };
        let swept = parking_lot::MutexGuard::unlocked(&mut stop, || broker.housekeeping());
        match swept {
            Ok(0) => {}
            Ok(expired) => debug!(%pool, expired, "Sweep expired stale transfers"),
            Err(err) => {
                warn!(%pool, error = %err, "Sweep failed, sweeper exiting");
                break;
            }
        }
    }
    debug!(%pool, "Sweeper stopped");
}
