/*
 * Copyright 2026 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A multiplexed RESP3 client core for Redis, using Tokio and Futures.
//!
//! One [`Connection`] holds one long-lived connection to a server.  Many
//! tasks may share it: requests submitted through [`Connection::exec`] are
//! pipelined in submission order and their responses demultiplexed back to
//! the callers, while unsolicited server pushes (e.g. pub/sub messages) are
//! delivered separately through [`Connection::receive`].
//!
//! ## Requests and adapters
//!
//! A [`resp3::Request`] accumulates one or more commands into a single
//! framed payload.  How the responses come back is decided by an
//! [`adapter::Adapter`]: [`adapter::adapt`] decodes into a tuple with one
//! typed slot per command, [`adapter::nodes`] records the raw node events of
//! arbitrarily nested replies, and [`adapter::ignore`] discards them.
//!
//! ```no_run
//! use redis_resp3::{adapter, resp3::Request, Connection, Endpoint, Timeouts};
//!
//! # async fn example() -> Result<(), redis_resp3::Error> {
//! let connection = Connection::new();
//!
//! let runner = connection.clone();
//! tokio::spawn(async move {
//!     let endpoint = Endpoint::new("127.0.0.1", 6379);
//!     let _ = runner.run(&endpoint, &Timeouts::default()).await;
//! });
//!
//! let mut req = Request::new();
//! req.push(["PING"]);
//! req.push(["GET", "some-key"]);
//!
//! let mut resp: (String, Option<String>) = Default::default();
//! connection.exec(&req, &mut adapter::adapt(&mut resp)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Pushes
//!
//! Subscribe-family commands reply through pushes, so they contribute no
//! response slots; an application that subscribes must drain
//! [`Connection::receive`] in a loop.  A connection whose pushes are not
//! drained stops making progress and ends its run with an idle timeout.
//!
//! ## Reconnection
//!
//! [`Connection::run`] performs one connection lifetime: resolve, connect,
//! handshake, pump, terminal error.  [`client::reconnect::run_with_backoff`]
//! layers retry-with-backoff on top.

pub mod adapter;
pub mod client;
pub mod error;
pub mod resp3;

pub use crate::client::{Connection, Endpoint, Operation, Timeouts};
pub use crate::error::{Error, TimedOut};
