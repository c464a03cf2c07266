// Copyright 2020 Joyent, Inc.

//! Error taxonomy shared by every layer of the runtime.
//!
//! Errors fall into four groups: configuration errors raised at setup time,
//! transport errors that the client invoker may recover from by retrying on
//! a fresh connection, application errors thrown by invocation handlers and
//! propagated unchanged, and lifecycle errors raised when an invoker is used
//! in the wrong state.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::invocation::{ApplicationError, Failure, FailureKind};

#[derive(Debug, Error)]
pub enum RemotingError {
    #[error("malformed locator '{uri}': {reason}")]
    MalformedLocator { uri: String, reason: String },

    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("cannot connect to {locator}: {source}")]
    CannotConnect {
        locator: String,
        #[source]
        source: io::Error,
    },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection pool exhausted for {0}")]
    PoolExhausted(String),

    #[error("server busy: {0}")]
    ServerBusy(String),

    #[error("no invocation handler registered for subsystem {0:?}")]
    NoHandler(Option<String>),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown serialization type: {0}")]
    UnknownSerializationType(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("application error: {0}")]
    Application(ApplicationError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server failure: {0}")]
    ServerFailure(String),

    #[error("lease expired for session {0}")]
    LeaseExpired(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RemotingError>;

impl RemotingError {
    /// Whether the failure happened below the invocation layer, such that the
    /// same request may be replayed on a newly created connection.
    pub fn is_transport(&self) -> bool {
        match self {
            RemotingError::CannotConnect { .. } | RemotingError::ConnectionFailed(_) => true,
            RemotingError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Configuration errors are never retried automatically.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RemotingError::MalformedLocator { .. }
                | RemotingError::UnknownTransport(_)
                | RemotingError::InvalidConfiguration(_)
                | RemotingError::UnknownSerializationType(_)
        )
    }

    pub fn serialization<E: std::fmt::Display>(err: E) -> RemotingError {
        RemotingError::Serialization(err.to_string())
    }

    /// Maps an error into the form a server reports back to its caller.
    pub(crate) fn to_failure(&self) -> Failure {
        let kind = match self {
            RemotingError::NoHandler(_) => FailureKind::NoHandler,
            RemotingError::Serialization(_) | RemotingError::UnknownSerializationType(_) => {
                FailureKind::Serialization
            }
            RemotingError::ServerBusy(_) => FailureKind::Busy,
            RemotingError::InvalidState(_) => FailureKind::InvalidState,
            RemotingError::Protocol(_) => FailureKind::Protocol,
            _ => FailureKind::Internal,
        };
        Failure {
            kind,
            message: self.to_string(),
        }
    }
}

impl From<Failure> for RemotingError {
    fn from(failure: Failure) -> RemotingError {
        match failure.kind {
            FailureKind::NoHandler => RemotingError::NoHandler(Some(failure.message)),
            FailureKind::Serialization => RemotingError::Serialization(failure.message),
            FailureKind::Busy => RemotingError::ServerBusy(failure.message),
            FailureKind::InvalidState => RemotingError::InvalidState(failure.message),
            FailureKind::Protocol => RemotingError::Protocol(failure.message),
            FailureKind::Internal => RemotingError::ServerFailure(failure.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let e = RemotingError::CannotConnect {
            locator: String::from("socket://127.0.0.1:1"),
            source: refused,
        };
        assert!(e.is_transport());
        assert!(RemotingError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")).is_transport());
        assert!(!RemotingError::Timeout(Duration::from_millis(5)).is_transport());
        assert!(!RemotingError::Serialization(String::from("x")).is_transport());
        assert!(RemotingError::UnknownTransport(String::from("foo")).is_configuration());
    }

    #[test]
    fn failure_round_trip_keeps_kind() {
        let e = RemotingError::ServerBusy(String::from("all workers busy"));
        match RemotingError::from(e.to_failure()) {
            RemotingError::ServerBusy(_) => (),
            other => panic!("unexpected {:?}", other),
        }
    }
}
