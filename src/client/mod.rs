/*
 * Copyright 2026 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The client API: a long-lived, multiplexed connection to one server.
//!
//! [`Connection`] is the central type.  Cloning it is cheap; clones share the
//! same underlying connection.  Requests submitted through
//! [`Connection::exec`] are pipelined in submission order, server pushes are
//! delivered through [`Connection::receive`], and [`Connection::run`] owns
//! the transport for the life of one connection attempt.

pub mod connect;
pub mod reconnect;

mod connection;

use std::time::Duration;

pub use connection::Connection;

/// Where and how to reach the server.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    pub fn password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Credentials are sent with the protocol handshake when both are set.
    pub fn requires_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// Deadlines for the phases of a connection's life, plus the health-check
/// cadence.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Resolving the host name.
    pub resolve: Duration,
    /// Establishing the transport connection.
    pub connect: Duration,
    /// The transport-level handshake, for connectors that have one.
    pub tls_handshake: Duration,
    /// The `HELLO 3` exchange.
    pub resp3_handshake: Duration,
    /// How often a PING is issued; the connection is considered idle after
    /// twice this interval without traffic.
    pub ping_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            resolve: Duration::from_secs(10),
            connect: Duration::from_secs(10),
            tls_handshake: Duration::from_secs(10),
            resp3_handshake: Duration::from_secs(2),
            ping_interval: Duration::from_secs(1),
        }
    }
}

/// The classes of operation that [`Connection::cancel`] acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Pending `exec` calls whose requests have not been written yet.
    Exec,
    /// In-flight `receive` calls.
    Receive,
    /// The active `run`, cascading to `Exec` and `Receive`.
    Run,
    /// Everything above.
    All,
}
