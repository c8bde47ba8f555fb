/*
 * Copyright 2026 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Buffered reads of complete RESP3 elements from an async stream.

use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{self, Error};

use super::{DataType, NodeRef, Parser};

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;

/// Reads one complete top-level RESP3 element at a time from an underlying
/// stream, driving a [`Parser`] and emitting node events as they decode.
///
/// Bytes past the end of an element stay buffered for the next call, so a
/// single `FrameReader` must be used for the whole life of a stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    stream: R,
    buffer: BytesMut,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R) -> Self {
        FrameReader {
            stream,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Classifies the next frame without consuming it, reading from the
    /// stream only if nothing is buffered.  A clean end-of-stream here means
    /// the server closed the connection between elements.
    pub async fn peek_type(&mut self) -> Result<DataType, Error> {
        while self.buffer.is_empty() {
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(Error::EndOfStream);
            }
        }
        Ok(DataType::from_byte(self.buffer[0]))
    }

    /// Reads one complete top-level element, invoking `on_node` for every
    /// parse event, and returns the number of bytes the element occupied.
    ///
    /// `max_read_size` bounds how much of the element may be buffered at
    /// once; a response needing more fails without consuming further input.
    pub async fn read_response<F>(
        &mut self,
        on_node: &mut F,
        max_read_size: usize,
    ) -> Result<usize, Error>
    where
        F: FnMut(&NodeRef<'_>) -> Result<(), Error>,
    {
        let mut parser = Parser::new();
        let mut consumed = 0;

        loop {
            let n = parser.consume(&self.buffer[..], on_node)?;
            if n > 0 {
                self.buffer.advance(n);
                consumed += n;
                if parser.done() {
                    return Ok(consumed);
                }
                continue;
            }

            // The parser needs more input: either the rest of a bulk payload
            // of known length, or at least one more byte of a header line.
            // A bulk payload cannot be scanned for the delimiter since it may
            // contain `\r\n` itself.
            let target = match parser.bulk_needed() {
                Some(needed) => needed,
                None => self.buffer.len() + 1,
            };
            if target > max_read_size {
                return Err(error::resp(
                    "response exceeds the adapter's maximum read size",
                ));
            }

            while self.buffer.len() < target {
                self.buffer.reserve(target - self.buffer.len());
                let n = self.stream.read_buf(&mut self.buffer).await?;
                if n == 0 {
                    return Err(if consumed == 0 && self.buffer.is_empty() {
                        Error::EndOfStream
                    } else {
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed inside a RESP3 element",
                        )
                        .into()
                    });
                }
            }
        }
    }
}
