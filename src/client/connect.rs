/*
 * Copyright 2026 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The seam between the connection engine and the transport.
//!
//! The engine only ever sees a [`Transport`]: a boxed read half and a boxed
//! write half.  How those come to exist — plain TCP, TLS, a test harness —
//! is the business of a [`Connector`].

use std::{future::Future, net::SocketAddr, pin::Pin};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::Error;

pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// The two halves of an established byte stream.  The engine reads and
/// writes concurrently, so the halves are carried separately.
pub struct Transport {
    pub read: BoxedRead,
    pub write: BoxedWrite,
}

impl Transport {
    /// Wraps any full-duplex stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Transport {
            read: Box::new(read),
            write: Box::new(write),
        }
    }
}

/// Establishes transports for the connection engine.
///
/// `handshake` runs after `connect` and before the protocol handshake; the
/// default is a no-op, which is what plain TCP wants.  A TLS connector would
/// perform its handshake there, bounded by the transport-handshake deadline
/// of [`Timeouts`](super::Timeouts).
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        addr: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = Result<Transport, Error>> + Send + 'a>>;

    fn handshake<'a>(
        &'a self,
        transport: Transport,
        host: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Transport, Error>> + Send + 'a>> {
        let _ = host;
        Box::pin(async move { Ok(transport) })
    }
}

/// The plain TCP connector used by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        addr: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = Result<Transport, Error>> + Send + 'a>> {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            let (read, write) = stream.into_split();
            Ok(Transport {
                read: Box::new(read),
                write: Box::new(write),
            })
        })
    }
}
