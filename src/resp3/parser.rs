/*
 * Copyright 2026 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! An incremental, resumable RESP3 parser.
//!
//! One [`Parser`] decodes exactly one top-level element (a reply or a push).
//! It is fed byte slices of arbitrary length and emits a flat stream of
//! [`NodeRef`] events; nesting is expressed through each node's `depth`.  The
//! caller decides how bytes reach the parser, which is what makes it usable
//! both against a socket (see [`FrameReader`](super::FrameReader)) and against
//! fully buffered test input.

use std::str;

use crate::error::{self, Error};

use super::{DataType, NodeRef};

/// Nesting deeper than this is treated as a protocol violation; real replies
/// stay in single digits.
const MAX_NESTED_DEPTH: usize = 64;

/// Sentinel for the expected-children counter of a streamed string, which has
/// no declared length.
const UNBOUNDED: u64 = u64::MAX;

/// Decoder state for one top-level RESP3 element.
///
/// `consume` returns the number of bytes it swallowed, or `Ok(0)` when the
/// input does not yet hold a complete header line or bulk payload.  Feeding
/// the same byte stream in different chunkings produces the same event
/// sequence.
#[derive(Debug)]
pub struct Parser {
    /// Current nesting depth; top-level frames are at 0.
    depth: usize,
    /// For each open aggregate, how many child elements are still expected.
    /// The entry at depth 0 is a sentinel that starts at 2 so that the first
    /// completed top-level element leaves it at 1, which is the `done` state.
    sizes: Vec<(u64, bool)>,
    /// Set once a bulk header line has been parsed but its payload has not
    /// been consumed.  The payload may contain `\r\n` and is read by length.
    bulk: Option<DataType>,
    bulk_length: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            depth: 0,
            sizes: vec![(2, false)],
            bulk: None,
            bulk_length: 0,
        }
    }

    /// True when one complete top-level element has been consumed.
    pub fn done(&self) -> bool {
        self.depth == 0 && self.bulk.is_none() && self.sizes[0].0 < 2
    }

    /// When a bulk payload is pending, the total number of bytes (payload
    /// plus trailing `\r\n`) the next `consume` call needs to see.
    pub fn bulk_needed(&self) -> Option<usize> {
        self.bulk.map(|_| self.bulk_length + 2)
    }

    /// Consumes one frame header line or one pending bulk payload from the
    /// front of `buf`, emitting node events into `on_node`.
    ///
    /// Returns the number of bytes consumed; `Ok(0)` means more input is
    /// needed.  An error from `on_node` aborts the parse and is returned
    /// as-is.
    pub fn consume<F>(&mut self, buf: &[u8], on_node: &mut F) -> Result<usize, Error>
    where
        F: FnMut(&NodeRef<'_>) -> Result<(), Error>,
    {
        debug_assert!(!self.done());

        if let Some(bulk_type) = self.bulk {
            let needed = self.bulk_length + 2;
            if buf.len() < needed {
                return Ok(0);
            }
            if &buf[self.bulk_length..needed] != b"\r\n" {
                return Err(error::protocol("bulk payload not terminated by CRLF"));
            }

            on_node(&NodeRef {
                data_type: bulk_type,
                aggregate_size: 1,
                depth: self.depth,
                value: &buf[..self.bulk_length],
            })?;

            self.bulk = None;
            self.sizes[self.depth].0 -= 1;
            self.close_completed();
            return Ok(needed);
        }

        let line_end = match find_crlf(buf) {
            Some(pos) => pos,
            None => return Ok(0),
        };
        let line = &buf[..line_end];
        let consumed = line_end + 2;

        if line.is_empty() {
            return Err(error::protocol("empty frame header"));
        }

        let data_type = DataType::from_byte(line[0]);
        let content = &line[1..];

        match data_type {
            DataType::StreamedStringPart => {
                let length = parse_length(content)?;
                if length == 0 {
                    // Terminator of a streamed string.
                    on_node(&NodeRef {
                        data_type,
                        aggregate_size: 1,
                        depth: self.depth,
                        value: b"",
                    })?;
                    self.sizes[self.depth].0 = 0;
                    self.close_completed();
                } else {
                    self.bulk = Some(data_type);
                    self.bulk_length = length as usize;
                }
            }
            DataType::BlobString | DataType::BlobError | DataType::VerbatimString => {
                if content == b"?" {
                    // A streamed string is an aggregate of unknown length;
                    // the server closes it with a zero-length part.
                    self.open_aggregate(UNBOUNDED, false)?;
                } else if content == b"-1" {
                    self.emit_null(on_node)?;
                } else {
                    self.bulk = Some(data_type);
                    self.bulk_length = parse_length(content)? as usize;
                }
            }
            DataType::Boolean => {
                if content.is_empty() {
                    return Err(error::protocol("empty boolean field"));
                }
                if content != b"t" && content != b"f" {
                    return Err(error::protocol("unexpected boolean value"));
                }
                self.emit_scalar(data_type, content, on_node)?;
            }
            DataType::Number | DataType::Double | DataType::BigNumber => {
                if content.is_empty() {
                    return Err(error::protocol("empty numeric field"));
                }
                self.emit_scalar(data_type, content, on_node)?;
            }
            DataType::SimpleString | DataType::SimpleError => {
                self.emit_scalar(data_type, content, on_node)?;
            }
            DataType::Null => {
                self.emit_null(on_node)?;
            }
            DataType::Array
            | DataType::Push
            | DataType::Set
            | DataType::Map
            | DataType::Attribute => {
                if content == b"-1" && data_type == DataType::Array {
                    // RESP2 null array.
                    self.emit_null(on_node)?;
                } else {
                    let size = parse_length(content)?;
                    let is_attribute = data_type == DataType::Attribute;
                    on_node(&NodeRef {
                        data_type,
                        aggregate_size: size,
                        depth: self.depth,
                        value: b"",
                    })?;
                    if size == 0 {
                        // An empty attribute annotates the frame that follows
                        // without standing in for it.
                        if !is_attribute {
                            self.sizes[self.depth].0 -= 1;
                            self.close_completed();
                        }
                    } else {
                        self.open_aggregate(
                            size * data_type.element_multiplicity(),
                            is_attribute,
                        )?;
                    }
                }
            }
            DataType::Invalid => {
                return Err(error::protocol(format!(
                    "invalid data type byte: 0x{:02x}",
                    line[0]
                )));
            }
        }

        Ok(consumed)
    }

    fn emit_scalar<F>(
        &mut self,
        data_type: DataType,
        value: &[u8],
        on_node: &mut F,
    ) -> Result<(), Error>
    where
        F: FnMut(&NodeRef<'_>) -> Result<(), Error>,
    {
        on_node(&NodeRef {
            data_type,
            aggregate_size: 1,
            depth: self.depth,
            value,
        })?;
        self.sizes[self.depth].0 -= 1;
        self.close_completed();
        Ok(())
    }

    fn emit_null<F>(&mut self, on_node: &mut F) -> Result<(), Error>
    where
        F: FnMut(&NodeRef<'_>) -> Result<(), Error>,
    {
        on_node(&NodeRef {
            data_type: DataType::Null,
            aggregate_size: 0,
            depth: self.depth,
            value: b"",
        })?;
        self.sizes[self.depth].0 -= 1;
        self.close_completed();
        Ok(())
    }

    fn open_aggregate(&mut self, expected: u64, is_attribute: bool) -> Result<(), Error> {
        if self.depth == MAX_NESTED_DEPTH {
            return Err(error::protocol("maximum nesting depth exceeded"));
        }
        self.depth += 1;
        if self.sizes.len() <= self.depth {
            self.sizes.push((expected, is_attribute));
        } else {
            self.sizes[self.depth] = (expected, is_attribute);
        }
        Ok(())
    }

    /// Pops every aggregate whose children have all arrived, charging each to
    /// its parent.  Attribute aggregates annotate the frame that follows them
    /// and therefore do not consume a slot of their parent.
    fn close_completed(&mut self) {
        while self.depth > 0 && self.sizes[self.depth].0 == 0 {
            let (_, was_attribute) = self.sizes[self.depth];
            self.depth -= 1;
            if !was_attribute {
                self.sizes[self.depth].0 -= 1;
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

fn parse_length(content: &[u8]) -> Result<u64, Error> {
    let text = str::from_utf8(content)
        .map_err(|_| error::protocol(format!("length is not valid UTF-8: {:?}", content)))?;
    text.parse()
        .map_err(|_| error::protocol(format!("not a number: {}", text)))
}
