//! Error types and result status taxonomy for the buffer pool

use serde::{Deserialize, Serialize};

/// Result type alias for buffer pool operations
pub type Result<T> = std::result::Result<T, BufferPoolError>;

/// Status codes reported by pool operations.
///
/// Every [`BufferPoolError`] maps onto exactly one non-`Ok` status so callers
/// can branch on the kind of failure without matching on error details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultStatus {
    /// Operation succeeded
    Ok,
    /// Backing allocator exhausted
    NoMemory,
    /// Duplicate connection registration
    AlreadyExists,
    /// Unknown buffer, transaction or connection reference
    NotFound,
    /// Transaction already completed or expired
    AlreadyUsed,
    /// Operation invalid for this client's mode
    Unsupported,
    /// Broker-side invariant violation, fatal to the pool
    CriticalError,
}

impl ResultStatus {
    /// Get a short name for the status
    pub fn name(&self) -> &'static str {
        match self {
            ResultStatus::Ok => "ok",
            ResultStatus::NoMemory => "no-memory",
            ResultStatus::AlreadyExists => "already-exists",
            ResultStatus::NotFound => "not-found",
            ResultStatus::AlreadyUsed => "already-used",
            ResultStatus::Unsupported => "unsupported",
            ResultStatus::CriticalError => "critical-error",
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Error types for the buffer pool broker and clients
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferPoolError {
    /// Backing allocator or registry cannot satisfy the request
    #[error("No memory: {message}")]
    NoMemory { message: String },

    /// A registration that must be unique already exists
    #[error("Already exists: {what}")]
    AlreadyExists { what: String },

    /// Reference to an unknown or mismatched buffer, transaction or connection
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Transaction was already completed or expired
    #[error("Transaction {transaction} already used")]
    AlreadyUsed { transaction: u64 },

    /// Operation not supported in the current mode
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Invariant violation inside the broker
    #[error("Critical error: {message}")]
    Critical { message: String },

    /// The channel to the broker failed
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Invalid configuration value
    #[error("Invalid config: {parameter} - {message}")]
    InvalidConfig { parameter: String, message: String },

    /// Frame or descriptor encoding failure
    #[error("Codec error: {message}")]
    Codec { message: String },
}

impl BufferPoolError {
    /// Create a no memory error
    pub fn no_memory(message: impl Into<String>) -> Self {
        Self::NoMemory {
            message: message.into(),
        }
    }

    /// Create an already exists error
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an already used error
    pub fn already_used(transaction: u64) -> Self {
        Self::AlreadyUsed { transaction }
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create a critical error
    pub fn critical(message: impl Into<String>) -> Self {
        Self::Critical {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a codec error
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Status code for this error
    pub fn status(&self) -> ResultStatus {
        match self {
            Self::NoMemory { .. } => ResultStatus::NoMemory,
            Self::AlreadyExists { .. } => ResultStatus::AlreadyExists,
            Self::NotFound { .. } => ResultStatus::NotFound,
            Self::AlreadyUsed { .. } => ResultStatus::AlreadyUsed,
            Self::Unsupported { .. } | Self::InvalidConfig { .. } => ResultStatus::Unsupported,
            Self::Critical { .. } | Self::Transport { .. } | Self::Codec { .. } => {
                ResultStatus::CriticalError
            }
        }
    }

    /// Whether this error means the channel to the broker is gone
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<bincode::Error> for BufferPoolError {
    fn from(err: bincode::Error) -> Self {
        Self::codec(format!("Bincode error: {}", err))
    }
}

/// Marshalable form of an error, carried in response frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub status: ResultStatus,
    pub message: String,
    pub transaction: Option<u64>,
}

impl From<&BufferPoolError> for WireError {
    fn from(err: &BufferPoolError) -> Self {
        let (message, transaction) = match err {
            BufferPoolError::NoMemory { message }
            | BufferPoolError::Critical { message }
            | BufferPoolError::Transport { message }
            | BufferPoolError::Codec { message } => (message.clone(), None),
            BufferPoolError::AlreadyExists { what } | BufferPoolError::NotFound { what } => {
                (what.clone(), None)
            }
            BufferPoolError::AlreadyUsed { transaction } => (String::new(), Some(*transaction)),
            BufferPoolError::Unsupported { operation } => (operation.clone(), None),
            BufferPoolError::InvalidConfig { parameter, message } => {
                (format!("{}: {}", parameter, message), None)
            }
        };
        Self {
            status: err.status(),
            message,
            transaction,
        }
    }
}

impl From<WireError> for BufferPoolError {
    fn from(wire: WireError) -> Self {
        match wire.status {
            ResultStatus::NoMemory => Self::no_memory(wire.message),
            ResultStatus::AlreadyExists => Self::already_exists(wire.message),
            ResultStatus::NotFound => Self::not_found(wire.message),
            ResultStatus::AlreadyUsed => Self::already_used(wire.transaction.unwrap_or_default()),
            ResultStatus::Unsupported => Self::unsupported(wire.message),
            // An `Ok` status never travels as an error frame
            ResultStatus::CriticalError | ResultStatus::Ok => Self::critical(wire.message),
        }
    }
}
