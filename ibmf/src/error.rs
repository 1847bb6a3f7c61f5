//! Error types for IBMF.

use thiserror::Error;

/// Error type for synchronous IBMF operations.
///
/// Timeouts and aborts of an in-flight transaction are not errors at this
/// level; they are reported once, asynchronously, as a [`TransStatus`] on the
/// message.
#[derive(Debug, Error)]
pub enum Error {
    /// A message context or receive buffer could not be allocated.
    #[error("no resources: {0}")]
    NoResources(&'static str),
    /// The message is still owned by the transport, or the client still
    /// has messages outstanding.
    #[error("busy: {0}")]
    Busy(&'static str),
    /// A client of this type is already registered on the port.
    #[error("client type {0:?} already registered")]
    ClientExists(crate::client::ClientType),
    /// No client of this type is registered on the port.
    #[error("client type {0:?} not registered")]
    ClientNotFound(crate::client::ClientType),
    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The send primitive failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The directed-route loopback destination was already completed.
    #[error("loopback destination tid {tid:#x} already completed")]
    LoopbackStale { tid: u64 },
    /// The port has been shut down.
    #[error("port is shut down")]
    Shutdown,
}

/// Result type for IBMF operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal status of a transaction, delivered with the completion
/// notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransStatus {
    /// The transaction has not terminated yet.
    #[default]
    Pending,
    /// The transaction completed normally.
    Success,
    /// No response arrived within the retry budget.
    TransTimeout,
    /// The transaction was aborted (RMPP abort, failed resend).
    TransFailure,
    /// A receive buffer could not be allocated mid-transfer.
    NoMemory,
}

impl TransStatus {
    /// Whether this status ends the transaction.
    #[inline]
    pub fn is_terminal(self) -> bool {
        self != TransStatus::Pending
    }
}
