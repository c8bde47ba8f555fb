/*
 * Copyright 2026 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Error and result types returned by every fallible operation in this crate.

use std::{error, fmt, io, sync::Arc};

/// The phase whose deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedOut {
    /// Resolving the endpoint's host name.
    Resolve,
    /// Establishing the transport connection.
    Connect,
    /// The transport-level (e.g. TLS) handshake.
    TlsHandshake,
    /// The `HELLO 3` protocol handshake.
    Resp3Handshake,
    /// A deadline-bounded `exec`.
    Exec,
    /// No traffic from the server within the liveness window.
    Idle,
}

impl TimedOut {
    fn as_str(&self) -> &'static str {
        match self {
            TimedOut::Resolve => "resolve",
            TimedOut::Connect => "connect",
            TimedOut::TlsHandshake => "TLS handshake",
            TimedOut::Resp3Handshake => "RESP3 handshake",
            TimedOut::Exec => "exec",
            TimedOut::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Error {
    /// An IO error occurred.  Stored behind an `Arc` so the same error can be
    /// fanned out to every operation that was in flight when the connection
    /// died.
    Io(Arc<io::Error>),

    /// The incoming byte stream violated the RESP3 framing rules.
    Protocol(String),

    /// The server answered with a simple error (`-`) reply.
    SimpleError(String),

    /// The server answered with a blob error (`!`) reply.
    BlobError(String),

    /// A reply could not be adapted into the destination supplied by the
    /// caller, e.g. an aggregate where a scalar was expected.
    Resp(String),

    /// The number of commands in a request exceeds the number of response
    /// slots its adapter supports.
    IncompatibleSize,

    /// A connection phase or liveness deadline expired.
    Timeout(TimedOut),

    /// The operation was cancelled before it could complete.
    Aborted,

    /// A `receive` waiter was cancelled via `cancel(Operation::Receive)`.
    ChannelCancelled,

    /// The connection was lost while the operation was outstanding.
    ConnectionLost,

    /// The request demanded an established connection and there was none.
    NotConnected,

    /// The server closed its end of the stream.
    EndOfStream,

    /// A non-specific internal error that prevented an operation from
    /// completing.
    Internal(String),
}

pub(crate) fn protocol(msg: impl Into<String>) -> Error {
    Error::Protocol(msg.into())
}

pub(crate) fn resp(msg: impl Into<String>) -> Error {
    Error::Resp(msg.into())
}

pub(crate) fn internal(msg: impl Into<String>) -> Error {
    Error::Internal(msg.into())
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Protocol(msg) => write!(f, "RESP3 protocol violation: {}", msg),
            Error::SimpleError(msg) => write!(f, "server error: {}", msg),
            Error::BlobError(msg) => write!(f, "server error: {}", msg),
            Error::Resp(msg) => write!(f, "cannot adapt response: {}", msg),
            Error::IncompatibleSize => {
                write!(f, "request and adapter have incompatible sizes")
            }
            Error::Timeout(phase) => write!(f, "{} timeout", phase.as_str()),
            Error::Aborted => write!(f, "operation aborted"),
            Error::ChannelCancelled => write!(f, "receive channel cancelled"),
            Error::ConnectionLost => write!(f, "connection lost"),
            Error::NotConnected => write!(f, "not connected"),
            Error::EndOfStream => write!(f, "end of stream"),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}
