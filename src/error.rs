//! Error taxonomy for the connection supervisor.
//!
//! Every failure surfaced to callers or recorded on a connection maps to one
//! of these variants. Recoverable conditions (a dropped line, a process-side
//! restart) are handled in place and never reach this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The managed process never connected to the management listener within
    /// the configured wait, or the listener could not be set up.
    #[error("management channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The privileged helper's socket could not be reached.
    #[error("interactive service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A write on the helper pipe failed. Treated like a closed management
    /// socket: the connection goes through unexpected-termination cleanup.
    #[error("service pipe write failed: {0}")]
    BridgeWriteFailed(String),

    /// A management line exceeded the framing buffer. The line is dropped;
    /// the channel stays usable.
    #[error("management line exceeds {limit} bytes")]
    OversizedMessage { limit: usize },

    /// The registry's fixed capacity is exhausted.
    #[error("connection registry is full (capacity {0})")]
    RegistryFull(usize),

    /// Too many consecutive failed password attempts.
    #[error("authentication rejected after {0} failed attempts")]
    AuthRejected(u32),

    /// No management channel activity within the session timeout while the
    /// connection was mid-transition.
    #[error("management session timed out")]
    Timeout,

    /// No connection with the given name or id.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
