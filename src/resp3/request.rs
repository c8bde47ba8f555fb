/*
 * Copyright 2026 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Building requests out of one or more Redis commands.
//!
//! Commands are encoded eagerly into a single RESP2 multibulk payload, which
//! is what servers accept regardless of the protocol version they answer
//! with.  A request also tracks how many of its commands expect a response;
//! the subscribe family replies through server pushes, so those commands are
//! written but never enqueued for response matching.

use bytes::{BufMut, BytesMut};

/// Commands whose replies arrive as server pushes rather than responses.
const NO_RESPONSE_COMMANDS: &[&str] = &[
    "SUBSCRIBE",
    "PSUBSCRIBE",
    "UNSUBSCRIBE",
    "PUNSUBSCRIBE",
];

/// Per-request behaviour knobs, consulted by the connection.
#[derive(Debug, Clone, Copy)]
pub struct RequestConfig {
    /// Allow the writer to flush this request together with neighbouring
    /// pending requests in a single write.
    pub coalesce: bool,

    /// If the connection is lost while this request is enqueued, complete it
    /// with `Error::Aborted` instead of retaining it for the next run.
    pub cancel_on_connection_lost: bool,

    /// If this request was written but the connection died before all its
    /// responses arrived, submit it again on the next successful run.
    pub retry_on_disconnect: bool,

    /// Fail `exec` immediately with `Error::NotConnected` unless the
    /// connection is currently established.
    pub cancel_if_not_connected: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            coalesce: true,
            cancel_on_connection_lost: false,
            retry_on_disconnect: false,
            cancel_if_not_connected: false,
        }
    }
}

/// A type that can be used as one argument of a Redis command.
pub trait ToArg {
    fn to_arg(&self) -> Vec<u8>;
}

impl ToArg for str {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Vec<u8> {
        self.clone()
    }
}

impl<'a, T: ToArg + ?Sized> ToArg for &'a T {
    fn to_arg(&self) -> Vec<u8> {
        (**self).to_arg()
    }
}

macro_rules! impl_toarg_display {
    ($($t:ty),* $(,)?) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self) -> Vec<u8> {
                    self.to_string().into_bytes()
                }
            }
        )*
    };
}

impl_toarg_display!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

/// One or more commands accumulated into a single framed payload.
///
/// Requests are reusable: executing one leaves it untouched, and `clear`
/// resets it for building afresh while keeping its configuration.
#[derive(Debug, Clone, Default)]
pub struct Request {
    payload: BytesMut,
    command_count: usize,
    config: RequestConfig,
}

impl Request {
    pub fn new() -> Self {
        Request::default()
    }

    pub fn with_config(config: RequestConfig) -> Self {
        Request {
            config,
            ..Request::default()
        }
    }

    /// Appends one command; the first element of `command` is the command
    /// name, the rest are its arguments.
    ///
    /// Commands of the subscribe family are written but not counted, since
    /// their replies arrive as pushes.
    pub fn push<I>(&mut self, command: I)
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        let args: Vec<Vec<u8>> = command.into_iter().map(|arg| arg.to_arg()).collect();
        let name = match args.first() {
            Some(name) => name.clone(),
            None => return,
        };

        self.write_header(args.len());
        for arg in &args {
            self.write_bulk(arg);
        }

        if expects_response(&name) {
            self.command_count += 1;
        }
    }

    /// Appends one command whose trailing arguments come from a sequence,
    /// e.g. `RPUSH key v1 v2 v3`.  Only one command is counted however long
    /// the sequence is.
    pub fn push_range<C, K, I>(&mut self, command: C, key: K, range: I)
    where
        C: ToArg,
        K: ToArg,
        I: IntoIterator,
        I::Item: ToArg,
    {
        let name = command.to_arg();
        let items: Vec<Vec<u8>> = range.into_iter().map(|item| item.to_arg()).collect();

        self.write_header(2 + items.len());
        self.write_bulk(&name);
        self.write_bulk(&key.to_arg());
        for item in &items {
            self.write_bulk(item);
        }

        if expects_response(&name) {
            self.command_count += 1;
        }
    }

    /// Discards all accumulated commands, keeping the configuration.
    pub fn clear(&mut self) {
        self.payload.clear();
        self.command_count = 0;
    }

    /// The number of commands that expect a response.
    pub fn command_count(&self) -> usize {
        self.command_count
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The encoded wire payload of all accumulated commands.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RequestConfig {
        &mut self.config
    }

    fn write_header(&mut self, args: usize) {
        self.payload.put_u8(b'*');
        self.payload
            .extend_from_slice(args.to_string().as_bytes());
        self.payload.extend_from_slice(b"\r\n");
    }

    fn write_bulk(&mut self, arg: &[u8]) {
        self.payload.put_u8(b'$');
        self.payload
            .extend_from_slice(arg.len().to_string().as_bytes());
        self.payload.extend_from_slice(b"\r\n");
        self.payload.extend_from_slice(arg);
        self.payload.extend_from_slice(b"\r\n");
    }
}

fn expects_response(name: &[u8]) -> bool {
    !NO_RESPONSE_COMMANDS
        .iter()
        .any(|candidate| candidate.as_bytes().eq_ignore_ascii_case(name))
}
