//! Defines error types and the client-visible error codes.

use enum_primitive_derive::Primitive;
use thiserror::Error;

/// An error code with a stable numeric representation, suitable for
/// surfacing to clients over a wire protocol.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum ErrorCode {
    /// Access failure
    AccessDenied = 1,
    /// Unknown command
    Command = 2,
    /// Invalid argument
    Invalid = 3,
    /// Entity exists
    Exist = 4,
    /// No such entity
    NoEntity = 5,
    /// Connection refused
    ConnectionRefused = 6,
    /// Protocol error
    Protocol = 7,
    /// Timeout
    Timeout = 8,
    /// No authentication key
    AuthKey = 9,
    /// Internal error
    Internal = 10,
    /// Connection terminated
    ConnectionTerminated = 11,
    /// Entity killed
    Killed = 12,
    /// Invalid server
    InvalidServer = 13,
    /// Module initialization failed
    ModInitFailed = 14,
}

/// The error type returned by fallible core operations.
///
/// Each variant maps onto exactly one [`ErrorCode`], so a protocol frontend
/// can translate a failure into a wire error without inspecting it further.
#[derive(Error, Debug)]
pub enum Error {
    /// A lookup by name or index found nothing.
    #[error("no such entity: {0}")]
    NoEntity(String),
    /// A name is already registered and strict registration was requested.
    #[error("entity already exists: {0}")]
    Exist(String),
    /// A malformed or out-of-range argument.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// The caller is not allowed to perform the operation.
    #[error("access denied")]
    AccessDenied,
    /// The entity was killed while the operation was in flight.
    #[error("entity killed")]
    Killed,
    /// A module factory failed to initialize.
    #[error("module initialization failed: {0}")]
    ModInitFailed(String),
    /// The operation is not known to the dispatcher.
    #[error("unknown command")]
    Command,
    /// An invariant the caller cannot recover from.
    #[error("internal error: {0}")]
    Internal(String),
    /// An I/O error from the event loop or a loader.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NoEntity(_) => ErrorCode::NoEntity,
            Error::Exist(_) => ErrorCode::Exist,
            Error::Invalid(_) => ErrorCode::Invalid,
            Error::AccessDenied => ErrorCode::AccessDenied,
            Error::Killed => ErrorCode::Killed,
            Error::ModInitFailed(_) => ErrorCode::ModInitFailed,
            Error::Command => ErrorCode::Command,
            Error::Internal(_) => ErrorCode::Internal,
            Error::Io(_) => ErrorCode::Internal,
        }
    }
}
