//! Request and response frames carried between facade and broker

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    error::{BufferPoolError, Result, WireError},
    types::{AllocationParams, BufferId, ConnectionId, NativeHandle, ProcessId, TransactionId},
};

/// A call issued against the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Connect {
        process: ProcessId,
    },
    Allocate {
        connection: ConnectionId,
        params: AllocationParams,
    },
    Send {
        sender: ConnectionId,
        receiver: ConnectionId,
        buffer: BufferId,
    },
    Receive {
        receiver: ConnectionId,
        transaction: TransactionId,
        buffer: BufferId,
        timestamp_us: i64,
    },
    Release {
        connection: ConnectionId,
        buffer: BufferId,
    },
    Query {
        connection: ConnectionId,
        buffer: BufferId,
    },
    Detach {
        connection: ConnectionId,
    },
}

impl Request {
    /// Short name of the call, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "connect",
            Request::Allocate { .. } => "allocate",
            Request::Send { .. } => "send",
            Request::Receive { .. } => "receive",
            Request::Release { .. } => "release",
            Request::Query { .. } => "query",
            Request::Detach { .. } => "detach",
        }
    }
}

/// The broker's answer to a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Connected {
        connection: ConnectionId,
    },
    Allocated {
        buffer: BufferId,
        handle: NativeHandle,
    },
    Sent {
        transaction: TransactionId,
        timestamp_us: i64,
    },
    Handle {
        handle: NativeHandle,
    },
    Done,
    Failed(WireError),
}

impl Response {
    /// Build a response from a broker result
    pub fn from_result<T>(result: Result<T>, ok: impl FnOnce(T) -> Response) -> Response {
        match result {
            Ok(value) => ok(value),
            Err(err) => Response::Failed(WireError::from(&err)),
        }
    }

    /// Turn an error frame back into a typed error
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Failed(wire) => Err(BufferPoolError::from(wire)),
            other => Ok(other),
        }
    }
}

/// A sequenced frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame<T> {
    /// Per-channel sequence number, starting at 1
    pub sequence: u64,
    pub body: T,
}

pub fn encode_frame<T: Serialize>(frame: &Frame<T>) -> Result<Vec<u8>> {
    Ok(bincode::serialize(frame)?)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<Frame<T>> {
    Ok(bincode::deserialize(bytes)?)
}
