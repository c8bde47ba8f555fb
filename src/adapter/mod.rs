/*
 * Copyright 2026 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Adapters absorb parse events into caller-owned destinations.
//!
//! An [`Adapter`] is handed every node event of every response to a request;
//! `index` identifies which of the request's commands a node belongs to.
//! Three families are provided:
//!
//! * [`ignore`] / [`check_error`] — absorb everything without keeping it;
//!   the latter reports server error replies.
//! * [`nodes`] — record the whole event stream as a flat list of owned
//!   [`Node`]s, preserving aggregate structure through each node's depth.
//! * [`adapt`] — bind each response of a request to one slot of a caller
//!   supplied tuple, decoding into plain Rust types.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

use crate::error::{self, Error};
use crate::resp3::{DataType, Node, NodeRef};

/// A sink for the node events of the responses to one request.
///
/// Implementations are stateful and are only ever used for a single `exec`
/// or `receive` call.
pub trait Adapter {
    /// The largest number of responses this adapter can absorb.  A request
    /// with more commands than this is rejected before being enqueued.
    fn supported_responses(&self) -> usize {
        usize::MAX
    }

    /// A cap on how many bytes of one response may be buffered at a time.
    fn max_read_size(&self) -> usize {
        usize::MAX
    }

    /// Called once per node event; `index` is the position of the node's
    /// response within the request.  Returning an error aborts the operation.
    fn on_node(&mut self, index: usize, node: &NodeRef<'_>) -> Result<(), Error>;
}

/// An adapter that absorbs everything and keeps nothing.  Server error
/// replies are treated as data; use [`check_error`] to reject them.
///
/// Also usable as a placeholder slot in [`adapt`] tuples for commands whose
/// reply is not interesting.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ignore;

pub fn ignore() -> Ignore {
    Ignore
}

impl Adapter for Ignore {
    fn on_node(&mut self, _index: usize, _node: &NodeRef<'_>) -> Result<(), Error> {
        Ok(())
    }
}

/// An adapter that absorbs everything but fails on server error replies,
/// carrying the server's message.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckError;

pub fn check_error() -> CheckError {
    CheckError
}

impl Adapter for CheckError {
    fn on_node(&mut self, _index: usize, node: &NodeRef<'_>) -> Result<(), Error> {
        match node.data_type {
            DataType::SimpleError => Err(Error::SimpleError(lossy(node.value))),
            DataType::BlobError => Err(Error::BlobError(lossy(node.value))),
            _ => Ok(()),
        }
    }
}

/// The generic tree adapter: records every event into a flat list of owned
/// nodes.  See [`nodes`].
#[derive(Debug)]
pub struct Nodes<'a> {
    out: &'a mut Vec<Node>,
}

/// Records every node event of every response into `out`, attribute frames
/// and error replies included.
pub fn nodes(out: &mut Vec<Node>) -> Nodes<'_> {
    Nodes { out }
}

impl<'a> Adapter for Nodes<'a> {
    fn on_node(&mut self, _index: usize, node: &NodeRef<'_>) -> Result<(), Error> {
        self.out.push(node.to_owned());
        Ok(())
    }
}

/// Per-slot working state used while a response streams in.
#[derive(Debug, Default)]
pub struct SlotScratch {
    /// A buffered map key awaiting its value.
    pending: Option<Node>,
}

/// A destination type that can absorb the node events of one response.
pub trait Absorb {
    fn absorb(&mut self, scratch: &mut SlotScratch, node: &NodeRef<'_>) -> Result<(), Error>;
}

/// A tuple of [`Absorb`] destinations, one per command of a request.
pub trait Slots {
    const ARITY: usize;
    fn slot(
        &mut self,
        index: usize,
        scratch: &mut SlotScratch,
        node: &NodeRef<'_>,
    ) -> Result<(), Error>;
}

/// The typed adapter returned by [`adapt`].
#[derive(Debug)]
pub struct StaticAdapter<'a, T: Slots> {
    dest: &'a mut T,
    scratch: Vec<SlotScratch>,
    /// Depth of an attribute opener whose subtree is being skipped.
    skipping: Option<usize>,
    current_index: usize,
}

/// Binds the responses of a request to the slots of a caller-supplied tuple,
/// one slot per command, e.g. `adapt(&mut resp)` with
/// `resp: (String, String)` for a request of two commands.
///
/// Slots decode scalars into plain types and flat aggregates into `Vec`s and
/// maps; a `Vec<Node>` slot captures an arbitrarily nested reply verbatim.
/// Attribute frames preceding a reply are skipped.
pub fn adapt<T: Slots>(dest: &mut T) -> StaticAdapter<'_, T> {
    let scratch = (0..T::ARITY).map(|_| SlotScratch::default()).collect();
    StaticAdapter {
        dest,
        scratch,
        skipping: None,
        current_index: 0,
    }
}

impl<'a, T: Slots> Adapter for StaticAdapter<'a, T> {
    fn supported_responses(&self) -> usize {
        T::ARITY
    }

    fn on_node(&mut self, index: usize, node: &NodeRef<'_>) -> Result<(), Error> {
        if index >= T::ARITY {
            return Err(Error::IncompatibleSize);
        }
        if index != self.current_index {
            self.current_index = index;
            self.skipping = None;
        }

        // Attribute frames annotate the reply that follows them; typed
        // destinations have no slot shape for them, so the whole subtree is
        // dropped here.
        if let Some(depth) = self.skipping {
            if node.depth > depth {
                return Ok(());
            }
            self.skipping = None;
        }
        if node.data_type == DataType::Attribute {
            if node.aggregate_size > 0 {
                self.skipping = Some(node.depth);
            }
            return Ok(());
        }

        self.dest.slot(index, &mut self.scratch[index], node)
    }
}

macro_rules! impl_slots {
    ($arity:expr => $($T:ident : $idx:tt),+) => {
        impl<$($T: Absorb),+> Slots for ($($T,)+) {
            const ARITY: usize = $arity;

            fn slot(
                &mut self,
                index: usize,
                scratch: &mut SlotScratch,
                node: &NodeRef<'_>,
            ) -> Result<(), Error> {
                match index {
                    $($idx => self.$idx.absorb(scratch, node),)+
                    _ => Err(Error::IncompatibleSize),
                }
            }
        }
    };
}

impl_slots!(1 => A:0);
impl_slots!(2 => A:0, B:1);
impl_slots!(3 => A:0, B:1, C:2);
impl_slots!(4 => A:0, B:1, C:2, D:3);
impl_slots!(5 => A:0, B:1, C:2, D:3, E:4);
impl_slots!(6 => A:0, B:1, C:2, D:3, E:4, F:5);
impl_slots!(7 => A:0, B:1, C:2, D:3, E:4, F:5, G:6);
impl_slots!(8 => A:0, B:1, C:2, D:3, E:4, F:5, G:6, H:7);

fn lossy(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

/// Accepts only scalar payloads, converting server errors and nulls into the
/// matching error kinds.
fn expect_scalar<'a>(node: &'a NodeRef<'_>) -> Result<&'a [u8], Error> {
    match node.data_type {
        DataType::SimpleError => Err(Error::SimpleError(lossy(node.value))),
        DataType::BlobError => Err(Error::BlobError(lossy(node.value))),
        DataType::Null => Err(error::resp("unexpected null reply")),
        t if t.is_aggregate() => Err(error::resp("expected a scalar, got an aggregate")),
        _ => Ok(node.value),
    }
}

/// A scalar destination type, decodable from a single node's payload.
pub trait FromScalar: Sized {
    fn from_scalar(node: &NodeRef<'_>) -> Result<Self, Error>;
}

impl FromScalar for String {
    fn from_scalar(node: &NodeRef<'_>) -> Result<Self, Error> {
        Ok(lossy(expect_scalar(node)?))
    }
}

impl FromScalar for Vec<u8> {
    fn from_scalar(node: &NodeRef<'_>) -> Result<Self, Error> {
        Ok(expect_scalar(node)?.to_vec())
    }
}

macro_rules! impl_fromscalar_integers {
    ($($int_ty:ident),* $(,)?) => {
        $(
            impl FromScalar for $int_ty {
                fn from_scalar(node: &NodeRef<'_>) -> Result<Self, Error> {
                    let value = expect_scalar(node)?;
                    let text = std::str::from_utf8(value)
                        .map_err(|_| error::resp("integer field is not valid UTF-8"))?;
                    text.parse().map_err(|_| {
                        error::resp(format!(
                            concat!("cannot represent as ", stringify!($int_ty), ": {}"),
                            text
                        ))
                    })
                }
            }
        )*
    };
}

impl_fromscalar_integers!(isize, usize, i32, u32, i64, u64);

impl FromScalar for f64 {
    fn from_scalar(node: &NodeRef<'_>) -> Result<Self, Error> {
        let value = expect_scalar(node)?;
        let text = std::str::from_utf8(value)
            .map_err(|_| error::resp("double field is not valid UTF-8"))?;
        text.parse()
            .map_err(|_| error::resp(format!("not a double: {}", text)))
    }
}

impl FromScalar for bool {
    fn from_scalar(node: &NodeRef<'_>) -> Result<Self, Error> {
        match expect_scalar(node)? {
            b"t" | b"1" => Ok(true),
            b"f" | b"0" => Ok(false),
            other => Err(error::resp(format!(
                "cannot represent as bool: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

impl Absorb for Ignore {
    fn absorb(&mut self, _scratch: &mut SlotScratch, _node: &NodeRef<'_>) -> Result<(), Error> {
        Ok(())
    }
}

impl Absorb for String {
    fn absorb(&mut self, _scratch: &mut SlotScratch, node: &NodeRef<'_>) -> Result<(), Error> {
        // Appending rather than assigning lets streamed string parts
        // accumulate into one value.
        self.push_str(&lossy(expect_scalar(node)?));
        Ok(())
    }
}

impl Absorb for Vec<u8> {
    fn absorb(&mut self, _scratch: &mut SlotScratch, node: &NodeRef<'_>) -> Result<(), Error> {
        self.extend_from_slice(expect_scalar(node)?);
        Ok(())
    }
}

macro_rules! impl_absorb_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl Absorb for $t {
                fn absorb(
                    &mut self,
                    _scratch: &mut SlotScratch,
                    node: &NodeRef<'_>,
                ) -> Result<(), Error> {
                    *self = <$t>::from_scalar(node)?;
                    Ok(())
                }
            }
        )*
    };
}

impl_absorb_scalar!(isize, usize, i32, u32, i64, u64, f64, bool);

impl<T: Absorb + Default> Absorb for Option<T> {
    fn absorb(&mut self, scratch: &mut SlotScratch, node: &NodeRef<'_>) -> Result<(), Error> {
        if node.data_type == DataType::Null {
            return Ok(());
        }
        if self.is_none() {
            *self = Some(T::default());
        }
        self.as_mut()
            .expect("value was just installed")
            .absorb(scratch, node)
    }
}

impl<T: FromScalar> Absorb for Vec<T> {
    fn absorb(&mut self, _scratch: &mut SlotScratch, node: &NodeRef<'_>) -> Result<(), Error> {
        if node.data_type.is_aggregate() {
            if node.depth > 0 {
                return Err(error::resp("nested aggregate not supported here"));
            }
            let expected = node.aggregate_size * node.data_type.element_multiplicity();
            self.reserve(expected as usize);
            return Ok(());
        }
        if node.depth < 1 {
            return Err(error::resp("expected an aggregate reply"));
        }
        self.push(T::from_scalar(node)?);
        Ok(())
    }
}

impl Absorb for Vec<Node> {
    fn absorb(&mut self, _scratch: &mut SlotScratch, node: &NodeRef<'_>) -> Result<(), Error> {
        self.push(node.to_owned());
        Ok(())
    }
}

impl<K, V, S> Absorb for HashMap<K, V, S>
where
    K: FromScalar + Hash + Eq,
    V: FromScalar,
    S: BuildHasher,
{
    fn absorb(&mut self, scratch: &mut SlotScratch, node: &NodeRef<'_>) -> Result<(), Error> {
        if node.data_type.is_aggregate() {
            if node.depth > 0 {
                return Err(error::resp("nested aggregate not supported here"));
            }
            if node.data_type.element_multiplicity() != 2 {
                return Err(error::resp("expected a map reply"));
            }
            return Ok(());
        }
        if node.depth < 1 {
            return Err(error::resp("expected a map reply"));
        }
        match scratch.pending.take() {
            None => {
                scratch.pending = Some(node.to_owned());
                Ok(())
            }
            Some(key) => {
                let key = K::from_scalar(&key.as_ref())?;
                let value = V::from_scalar(node)?;
                self.insert(key, value);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::error::Error;
    use crate::resp3::{DataType, Node, Parser};

    use super::{adapt, check_error, ignore, nodes, Adapter, Ignore};

    /// Parses `frame` as one complete element and feeds the events to
    /// `adapter` as response `index`.
    fn feed<A: Adapter>(adapter: &mut A, index: usize, frame: &[u8]) -> Result<(), Error> {
        let mut parser = Parser::new();
        let mut offset = 0;
        let mut result = Ok(());
        while !parser.done() && result.is_ok() {
            let n = parser.consume(&frame[offset..], &mut |node| adapter.on_node(index, node));
            match n {
                Ok(n) => {
                    assert!(n > 0, "test frame is truncated");
                    offset += n;
                }
                Err(err) => result = Err(err),
            }
        }
        result
    }

    #[test]
    fn typed_tuple_of_strings() {
        let mut resp = (String::new(), String::new());
        let mut adapter = adapt(&mut resp);
        feed(&mut adapter, 0, b"+PONG\r\n").unwrap();
        feed(&mut adapter, 1, b"$2\r\nOK\r\n").unwrap();
        assert_eq!(resp, ("PONG".to_string(), "OK".to_string()));
    }

    #[test]
    fn scalar_slots() {
        let mut resp = (0i64, true, 0.0f64, Vec::<u8>::new());
        let mut adapter = adapt(&mut resp);
        feed(&mut adapter, 0, b":42\r\n").unwrap();
        feed(&mut adapter, 1, b"#f\r\n").unwrap();
        feed(&mut adapter, 2, b",3.25\r\n").unwrap();
        feed(&mut adapter, 3, b"$3\r\n\x00\x01\x02\r\n").unwrap();
        assert_eq!(resp.0, 42);
        assert!(!resp.1);
        assert_eq!(resp.2, 3.25);
        assert_eq!(resp.3, vec![0, 1, 2]);
    }

    #[test]
    fn option_slots() {
        let mut resp = (Option::<String>::None, Option::<String>::None);
        let mut adapter = adapt(&mut resp);
        feed(&mut adapter, 0, b"$-1\r\n").unwrap();
        feed(&mut adapter, 1, b"+hi\r\n").unwrap();
        assert_eq!(resp, (None, Some("hi".to_string())));
    }

    #[test]
    fn vector_and_map_slots() {
        let mut resp = (Vec::<String>::new(), HashMap::<String, i64>::new());
        let mut adapter = adapt(&mut resp);
        feed(&mut adapter, 0, b"*2\r\n+a\r\n$1\r\nb\r\n").unwrap();
        feed(&mut adapter, 1, b"%2\r\n+one\r\n:1\r\n+two\r\n:2\r\n").unwrap();
        assert_eq!(resp.0, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(resp.1.get("one"), Some(&1));
        assert_eq!(resp.1.get("two"), Some(&2));
    }

    #[test]
    fn node_tree_slot_keeps_nesting() {
        let mut resp = (Vec::<Node>::new(),);
        let mut adapter = adapt(&mut resp);
        feed(&mut adapter, 0, b"*2\r\n*1\r\n+deep\r\n:5\r\n").unwrap();
        let depths: Vec<usize> = resp.0.iter().map(|node| node.depth).collect();
        assert_eq!(depths, vec![0, 1, 2, 1]);
    }

    #[test]
    fn ignore_slot_discards() {
        let mut resp = (Ignore, String::new());
        let mut adapter = adapt(&mut resp);
        feed(&mut adapter, 0, b"*2\r\n+a\r\n+b\r\n").unwrap();
        feed(&mut adapter, 1, b"+kept\r\n").unwrap();
        assert_eq!(resp.1, "kept");
    }

    #[test]
    fn server_error_is_rejected_by_typed_slot() {
        let mut resp = (String::new(),);
        let mut adapter = adapt(&mut resp);
        match feed(&mut adapter, 0, b"-ERR unknown command\r\n") {
            Err(Error::SimpleError(msg)) => assert_eq!(msg, "ERR unknown command"),
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[test]
    fn aggregate_into_scalar_slot_is_rejected() {
        let mut resp = (String::new(),);
        let mut adapter = adapt(&mut resp);
        assert!(matches!(
            feed(&mut adapter, 0, b"*1\r\n+x\r\n"),
            Err(Error::Resp(_))
        ));
    }

    #[test]
    fn nested_aggregate_into_vector_slot_is_rejected() {
        let mut resp = (Vec::<String>::new(),);
        let mut adapter = adapt(&mut resp);
        assert!(matches!(
            feed(&mut adapter, 0, b"*1\r\n*1\r\n+x\r\n"),
            Err(Error::Resp(_))
        ));
    }

    #[test]
    fn attribute_frames_are_skipped_by_typed_slots() {
        let mut resp = (String::new(),);
        let mut adapter = adapt(&mut resp);
        feed(&mut adapter, 0, b"|1\r\n+ttl\r\n:3600\r\n+PONG\r\n").unwrap();
        assert_eq!(resp.0, "PONG");
    }

    #[test]
    fn streamed_string_accumulates() {
        let mut resp = (String::new(),);
        let mut adapter = adapt(&mut resp);
        feed(
            &mut adapter,
            0,
            b"$?\r\n;5\r\nHello\r\n;6\r\n world\r\n;0\r\n",
        )
        .unwrap();
        assert_eq!(resp.0, "Hello world");
    }

    #[test]
    fn out_of_range_index_is_incompatible() {
        let mut resp = (String::new(),);
        let mut adapter = adapt(&mut resp);
        assert_eq!(adapter.supported_responses(), 1);
        assert!(matches!(
            feed(&mut adapter, 1, b"+x\r\n"),
            Err(Error::IncompatibleSize)
        ));
    }

    #[test]
    fn check_error_flags_server_errors() {
        let mut adapter = check_error();
        assert!(feed(&mut adapter, 0, b"+fine\r\n").is_ok());
        assert!(matches!(
            feed(&mut adapter, 0, b"-ERR nope\r\n"),
            Err(Error::SimpleError(_))
        ));
        assert!(matches!(
            feed(&mut adapter, 0, b"!10\r\nSYNTAX err\r\n"),
            Err(Error::BlobError(_))
        ));
    }

    #[test]
    fn ignore_accepts_everything() {
        let mut adapter = ignore();
        assert!(feed(&mut adapter, 0, b"-ERR treated as data\r\n").is_ok());
        assert!(feed(&mut adapter, 3, b"*2\r\n+a\r\n+b\r\n").is_ok());
    }

    #[test]
    fn nodes_records_attributes_too() {
        let mut out = Vec::new();
        let mut adapter = nodes(&mut out);
        feed(&mut adapter, 0, b"|1\r\n+k\r\n+v\r\n+PONG\r\n").unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].data_type, DataType::Attribute);
        assert_eq!(out[3].value, b"PONG");
    }
}
