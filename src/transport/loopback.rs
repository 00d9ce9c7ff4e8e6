//! In-process transport that marshals every call through encoded frames

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::messages::{decode_frame, encode_frame, Frame, Request, Response};
use crate::{
    accessor::Accessor,
    broker::{Broker, NoticeReceiver},
    error::{BufferPoolError, Result},
    types::{
        AllocationParams, BufferId, ConnectionId, NativeHandle, PoolId, ProcessId, TransactionId,
    },
};

#[derive(Debug, Default)]
struct Channel {
    /// Last request sequence issued by the client side
    next_sequence: u64,
    /// Last request sequence served by the broker side
    last_served: u64,
    /// Notice channels handed over out-of-band after a connect
    notices: HashMap<ConnectionId, NoticeReceiver>,
}

/// An [`Accessor`] that reaches a broker through encoded request frames
///
/// Calls are synchronous and serialized on one channel, so calls from a
/// connection reach the broker in issue order. Once [`sever`] is called every
/// later call fails with a transport error.
///
/// [`sever`]: LoopbackAccessor::sever
#[derive(Debug)]
pub struct LoopbackAccessor {
    broker: Arc<Broker>,
    pool: PoolId,
    channel: Mutex<Channel>,
    severed: AtomicBool,
    frames: AtomicU64,
}

impl LoopbackAccessor {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            pool: broker.pool_id(),
            broker,
            channel: Mutex::new(Channel::default()),
            severed: AtomicBool::new(false),
            frames: AtomicU64::new(0),
        }
    }

    /// Simulate loss of the link to the broker
    pub fn sever(&self) {
        if !self.severed.swap(true, Ordering::AcqRel) {
            warn!(pool = %self.pool, "Loopback link severed");
        }
    }

    pub fn is_severed(&self) -> bool {
        self.severed.load(Ordering::Acquire)
    }

    /// Frames carried so far, requests and responses combined
    pub fn frames_exchanged(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn call(&self, request: Request) -> Result<Response> {
        let kind = request.kind();
        if self.is_severed() {
            return Err(BufferPoolError::transport(format!(
                "link to {} severed during {}",
                self.pool, kind
            )));
        }

        let mut channel = self.channel.lock();
        channel.next_sequence += 1;
        let sequence = channel.next_sequence;

        let request_bytes = encode_frame(&Frame {
            sequence,
            body: request,
        })?;
        let response_bytes = self.serve(&mut channel, &request_bytes)?;
        let response: Frame<Response> = decode_frame(&response_bytes)?;
        self.frames.fetch_add(2, Ordering::Relaxed);

        if response.sequence != sequence {
            return Err(BufferPoolError::transport(format!(
                "response {} answers request {}",
                response.sequence, sequence
            )));
        }
        trace!(
            pool = %self.pool,
            sequence,
            kind,
            request_len = request_bytes.len(),
            response_len = response_bytes.len(),
            "Frame exchanged"
        );
        response.body.into_result()
    }

    /// Broker side of the channel
    fn serve(&self, channel: &mut Channel, bytes: &[u8]) -> Result<Vec<u8>> {
        let frame: Frame<Request> = decode_frame(bytes)?;
        if frame.sequence <= channel.last_served {
            return Err(BufferPoolError::transport(format!(
                "request {} arrived after {}",
                frame.sequence, channel.last_served
            )));
        }
        channel.last_served = frame.sequence;

        let body = self.dispatch(channel, frame.body);
        encode_frame(&Frame {
            sequence: frame.sequence,
            body,
        })
    }

    fn dispatch(&self, channel: &mut Channel, request: Request) -> Response {
        let broker = &self.broker;
        match request {
            Request::Connect { process } => {
                Response::from_result(broker.connect(process), |(connection, notices)| {
                    channel.notices.insert(connection, notices);
                    Response::Connected { connection }
                })
            }
            Request::Allocate { connection, params } => Response::from_result(
                broker.allocate(connection, &params),
                |(buffer, handle)| Response::Allocated { buffer, handle },
            ),
            Request::Send {
                sender,
                receiver,
                buffer,
            } => Response::from_result(
                broker.send(sender, receiver, buffer),
                |(transaction, timestamp_us)| Response::Sent {
                    transaction,
                    timestamp_us,
                },
            ),
            Request::Receive {
                receiver,
                transaction,
                buffer,
                timestamp_us,
            } => Response::from_result(
                broker.receive(receiver, transaction, buffer, timestamp_us),
                |handle| Response::Handle { handle },
            ),
            Request::Release { connection, buffer } => {
                Response::from_result(broker.release(connection, buffer), |_| Response::Done)
            }
            Request::Query { connection, buffer } => {
                Response::from_result(broker.query(connection, buffer), |handle| {
                    Response::Handle { handle }
                })
            }
            Request::Detach { connection } => {
                Response::from_result(broker.detach(connection), |_| Response::Done)
            }
        }
    }
}

fn unexpected<T>(kind: &str, response: Response) -> Result<T> {
    Err(BufferPoolError::transport(format!(
        "unexpected response {:?} to {}",
        response, kind
    )))
}

impl Accessor for LoopbackAccessor {
    fn pool_id(&self) -> PoolId {
        self.pool
    }

    fn connect(&self, process: ProcessId) -> Result<(ConnectionId, NoticeReceiver)> {
        match self.call(Request::Connect { process })? {
            Response::Connected { connection } => {
                let notices = self.channel.lock().notices.remove(&connection).ok_or_else(|| {
                    BufferPoolError::transport(format!("no notice channel for {}", connection))
                })?;
                Ok((connection, notices))
            }
            other => unexpected("connect", other),
        }
    }

    fn allocate(
        &self,
        connection: ConnectionId,
        params: &AllocationParams,
    ) -> Result<(BufferId, NativeHandle)> {
        let request = Request::Allocate {
            connection,
            params: params.clone(),
        };
        match self.call(request)? {
            Response::Allocated { buffer, handle } => Ok((buffer, handle)),
            other => unexpected("allocate", other),
        }
    }

    fn send(
        &self,
        sender: ConnectionId,
        receiver: ConnectionId,
        buffer: BufferId,
    ) -> Result<(TransactionId, i64)> {
        let request = Request::Send {
            sender,
            receiver,
            buffer,
        };
        match self.call(request)? {
            Response::Sent {
                transaction,
                timestamp_us,
            } => Ok((transaction, timestamp_us)),
            other => unexpected("send", other),
        }
    }

    fn receive(
        &self,
        receiver: ConnectionId,
        transaction: TransactionId,
        buffer: BufferId,
        timestamp_us: i64,
    ) -> Result<NativeHandle> {
        let request = Request::Receive {
            receiver,
            transaction,
            buffer,
            timestamp_us,
        };
        match self.call(request)? {
            Response::Handle { handle } => Ok(handle),
            other => unexpected("receive", other),
        }
    }

    fn release(&self, connection: ConnectionId, buffer: BufferId) -> Result<()> {
        match self.call(Request::Release { connection, buffer })? {
            Response::Done => Ok(()),
            other => unexpected("release", other),
        }
    }

    fn query(&self, connection: ConnectionId, buffer: BufferId) -> Result<NativeHandle> {
        match self.call(Request::Query { connection, buffer })? {
            Response::Handle { handle } => Ok(handle),
            other => unexpected("query", other),
        }
    }

    fn detach(&self, connection: ConnectionId) -> Result<()> {
        match self.call(Request::Detach { connection })? {
            Response::Done => Ok(()),
            other => unexpected("detach", other),
        }
    }
}
