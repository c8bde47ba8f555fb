/*
 * Copyright 2026 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The connection engine: a full-duplex reader/writer pair over one
//! transport, a FIFO of in-flight requests, and the run loop that ties them
//! to a server.
//!
//! Ordering is the load-bearing invariant here: requests are written in
//! submission order, the server answers them in that order, and the head of
//! the in-flight queue is therefore always the request whose next response
//! is expected.  Push frames interleave freely with responses and never
//! consume the head's response.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_channel::{mpsc, oneshot};
use futures_util::{future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::lookup_host;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::time::timeout;

use crate::adapter::{self, Adapter};
use crate::error::{self, Error, TimedOut};
use crate::resp3::{DataType, FrameReader, Node, Request, RequestConfig};

use super::connect::{BoxedRead, BoxedWrite, Connector, TcpConnector};
use super::{Endpoint, Operation, Timeouts};

/// Where an in-flight request stands with respect to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Submitted, not yet picked up by the writer.
    Pending,
    /// Part of the batch the writer is currently flushing.
    Staged,
    /// On the wire; responses are owed.
    Written,
}

/// The recorded responses to one request, handed back to `exec` for
/// adaptation.
struct ExecReply {
    replies: Vec<Vec<Node>>,
    bytes_read: usize,
}

impl ExecReply {
    fn empty() -> Self {
        ExecReply {
            replies: Vec::new(),
            bytes_read: 0,
        }
    }
}

/// Bookkeeping for one submitted request awaiting completion.
struct InflightEntry {
    payload: Bytes,
    command_count: usize,
    config: RequestConfig,
    max_read_size: usize,
    status: Status,
    remaining: usize,
    replies: Vec<Vec<Node>>,
    bytes_read: usize,
    done_tx: Option<oneshot::Sender<Result<ExecReply, Error>>>,
}

impl InflightEntry {
    fn complete(&mut self, result: Result<ExecReply, Error>) {
        if let Some(tx) = self.done_tx.take() {
            // The caller may have abandoned the exec; nothing to do then.
            let _ = tx.send(result);
        }
    }
}

/// One push frame, handed from the reader to a `receive` caller.  The `ack`
/// is the second half of the rendezvous: the reader does not resume until
/// the consumer has taken the message, which is what lets the idle check
/// detect an application that forgot to drain pushes.
struct PushMessage {
    nodes: Vec<Node>,
    bytes_read: usize,
    ack: oneshot::Sender<()>,
}

#[derive(Debug, Clone, Copy)]
enum StopKind {
    Aborted,
    ConnectionLost,
}

impl StopKind {
    fn into_error(self) -> Error {
        match self {
            StopKind::Aborted => Error::Aborted,
            StopKind::ConnectionLost => Error::ConnectionLost,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StopSignal {
    generation: u64,
    kind: StopKind,
}

/// State shared by every clone of a [`Connection`] and by the engine tasks.
/// The mutex is only ever held for short, non-blocking critical sections.
struct Inner {
    queue: VecDeque<InflightEntry>,
    /// Commands staged or written whose responses have not yet arrived.
    expected_responses: usize,
    /// Whether the writer currently owns a batch it has not finished.
    staging: bool,
    open: bool,
    running: bool,
    last_data: Instant,
    receive_waiters: usize,
}

struct Shared {
    inner: Mutex<Inner>,
    writer_wake: Notify,
    push_tx: mpsc::Sender<PushMessage>,
    push_rx: AsyncMutex<mpsc::Receiver<PushMessage>>,
    stop_tx: watch::Sender<StopSignal>,
    receive_cancel_tx: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("lock is tainted")
    }
}

/// A read half that refreshes the connection's traffic clock on every
/// successful read, so the idle check sees progress even while a large bulk
/// is still streaming in.
struct Monitored {
    inner: BoxedRead,
    shared: Arc<Shared>,
}

impl AsyncRead for Monitored {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.shared.lock().last_data = Instant::now();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// A multiplexed connection to one server.
///
/// The connection is constructed idle.  [`run`](Connection::run) drives it
/// against an endpoint until a terminal failure; [`exec`](Connection::exec)
/// and [`receive`](Connection::receive) may be called before, during and
/// after any run — requests submitted while disconnected are written once a
/// run is established.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    /// A connection that will use plain TCP transports.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(TcpConnector))
    }

    /// A connection using a caller-supplied transport factory.
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        let (push_tx, push_rx) = mpsc::channel(0);
        let (stop_tx, _) = watch::channel(StopSignal {
            generation: 0,
            kind: StopKind::Aborted,
        });
        let (receive_cancel_tx, _) = watch::channel(0u64);
        Connection {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    expected_responses: 0,
                    staging: false,
                    open: false,
                    running: false,
                    last_data: Instant::now(),
                    receive_waiters: 0,
                }),
                writer_wake: Notify::new(),
                push_tx,
                push_rx: AsyncMutex::new(push_rx),
                stop_tx,
                receive_cancel_tx,
            }),
            connector,
        }
    }

    /// Whether a run currently has an established, handshaken transport.
    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    /// Submits a request and completes once all of its responses have been
    /// absorbed by `adapter`.  Returns the number of response bytes read.
    ///
    /// Responses are delivered to the adapter in command order; a request
    /// whose commands all reply via pushes completes as soon as it has been
    /// written.
    pub async fn exec<A>(&self, request: &Request, adapter: &mut A) -> Result<usize, Error>
    where
        A: Adapter,
    {
        if request.command_count() > adapter.supported_responses() {
            return Err(Error::IncompatibleSize);
        }
        if request.is_empty() {
            return Ok(0);
        }

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut inner = self.shared.lock();
            if request.config().cancel_if_not_connected && !inner.open {
                return Err(Error::NotConnected);
            }
            inner.queue.push_back(InflightEntry {
                payload: Bytes::copy_from_slice(request.payload()),
                command_count: request.command_count(),
                config: *request.config(),
                max_read_size: adapter.max_read_size(),
                status: Status::Pending,
                remaining: request.command_count(),
                replies: Vec::new(),
                bytes_read: 0,
                done_tx: Some(done_tx),
            });
            if inner.open && inner.expected_responses == 0 && !inner.staging {
                self.shared.writer_wake.notify_one();
            }
        }

        let reply = match done_rx.await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Aborted),
        };

        for (index, nodes) in reply.replies.iter().enumerate() {
            for node in nodes {
                adapter.on_node(index, &node.as_ref())?;
            }
        }
        Ok(reply.bytes_read)
    }

    /// [`exec`](Connection::exec) bounded by a deadline.  On expiry the call
    /// fails with an exec timeout; the request itself stays queued and its
    /// responses, when they arrive, are discarded.
    pub async fn exec_with_timeout<A>(
        &self,
        request: &Request,
        adapter: &mut A,
        deadline: Duration,
    ) -> Result<usize, Error>
    where
        A: Adapter,
    {
        match timeout(deadline, self.exec(request, adapter)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(TimedOut::Exec)),
        }
    }

    /// Awaits one server push and absorbs it into `adapter` (always as
    /// response index 0).  Returns the number of bytes the push occupied.
    ///
    /// The push channel is a lossless handoff with a single consumer at a
    /// time; applications expecting pushes should call this in a loop.
    pub async fn receive<A>(&self, adapter: &mut A) -> Result<usize, Error>
    where
        A: Adapter,
    {
        self.shared.lock().receive_waiters += 1;
        let mut cancel_rx = self.shared.receive_cancel_tx.subscribe();

        let received = {
            let next_push = async {
                let mut rx = self.shared.push_rx.lock().await;
                rx.next().await
            };
            tokio::select! {
                message = next_push => message,
                _ = cancel_rx.changed() => {
                    return Err(Error::ChannelCancelled);
                }
            }
        };

        {
            let mut inner = self.shared.lock();
            inner.receive_waiters = inner.receive_waiters.saturating_sub(1);
        }

        let message = received.ok_or_else(|| error::internal("push channel closed"))?;
        // Release the reader before adapting; the handoff is complete.
        let _ = message.ack.send(());

        for node in &message.nodes {
            adapter.on_node(0, &node.as_ref())?;
        }
        Ok(message.bytes_read)
    }

    /// Cancels operations of the given class, returning how many were newly
    /// cancelled.  Cancellation is idempotent: a second call finds nothing
    /// left to cancel and returns zero.
    pub fn cancel(&self, operation: Operation) -> usize {
        match operation {
            Operation::Exec => self.cancel_unwritten(),
            Operation::Receive => self.cancel_receive_waiters(),
            Operation::Run | Operation::All => {
                let active = self.signal_stop(StopKind::Aborted);
                let cancelled = self.cancel_unwritten() + self.cancel_receive_waiters();
                cancelled + usize::from(active)
            }
        }
    }

    /// Discards the current transport, if any; the active run completes with
    /// a connection-loss error and the connection is ready for a fresh run.
    pub fn reset_stream(&self) {
        self.signal_stop(StopKind::ConnectionLost);
    }

    /// Runs the connection against `endpoint` until a terminal failure:
    /// resolve, connect, handshake, then pump requests and responses.
    ///
    /// Always returns an error — the first terminal one — since a healthy
    /// connection runs until something ends it.  Pending requests are
    /// drained according to their per-request configuration: see
    /// [`RequestConfig`].
    pub async fn run(&self, endpoint: &Endpoint, timeouts: &Timeouts) -> Result<(), Error> {
        let mut stop_rx = self.shared.stop_tx.subscribe();
        let stop_seen = stop_rx.borrow().generation;
        {
            let mut inner = self.shared.lock();
            if inner.running {
                return Err(error::internal("connection is already running"));
            }
            inner.running = true;
        }

        // The stop signal covers every phase, not just the pump: a cancel
        // during resolve or connect unwinds the run just the same.
        let result = tokio::select! {
            result = self.run_inner(endpoint, timeouts) => result,
            err = Self::stopped(&mut stop_rx, stop_seen) => Err(err),
        };

        self.teardown();
        result
    }

    async fn run_inner(&self, endpoint: &Endpoint, timeouts: &Timeouts) -> Result<(), Error> {
        let addrs = self.resolve(endpoint, timeouts.resolve).await?;
        let transport = self.establish(addrs, timeouts.connect).await?;
        let transport = timeout(
            timeouts.tls_handshake,
            self.connector.handshake(transport, &endpoint.host),
        )
        .await
        .map_err(|_| Error::Timeout(TimedOut::TlsHandshake))??;

        let mut writer = transport.write;
        let mut reader = FrameReader::new(Monitored {
            inner: transport.read,
            shared: self.shared.clone(),
        });

        self.hello(endpoint, timeouts.resp3_handshake, &mut reader, &mut writer)
            .await?;

        log::debug!(
            "connected to {}:{}, protocol handshake complete",
            endpoint.host,
            endpoint.port
        );

        {
            let mut inner = self.shared.lock();
            inner.open = true;
            inner.expected_responses = 0;
            inner.staging = false;
            inner.last_data = Instant::now();
        }

        let err = tokio::select! {
            err = self.reader_task(&mut reader) => err,
            err = self.writer_task(&mut writer) => err,
            err = self.ping_task(timeouts.ping_interval) => err,
            err = self.idle_task(timeouts.ping_interval) => err,
        };
        Err(err)
    }

    async fn resolve(
        &self,
        endpoint: &Endpoint,
        deadline: Duration,
    ) -> Result<Vec<SocketAddr>, Error> {
        let addrs: Vec<SocketAddr> =
            match timeout(deadline, lookup_host((endpoint.host.as_str(), endpoint.port))).await {
                Ok(resolved) => resolved?.collect(),
                Err(_) => return Err(Error::Timeout(TimedOut::Resolve)),
            };
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {}", endpoint.host),
            )
            .into());
        }
        Ok(addrs)
    }

    /// Connects to the first reachable address, bounded by one deadline
    /// overall.
    async fn establish(
        &self,
        addrs: Vec<SocketAddr>,
        deadline: Duration,
    ) -> Result<super::connect::Transport, Error> {
        let attempt = async {
            let mut last_err = None;
            for addr in addrs {
                match self.connector.connect(addr).await {
                    Ok(transport) => return Ok(transport),
                    Err(err) => {
                        log::debug!("cannot connect to {}: {}", addr, err);
                        last_err = Some(err);
                    }
                }
            }
            Err(last_err.unwrap_or(Error::ConnectionLost))
        };
        match timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(TimedOut::Connect)),
        }
    }

    /// Issues `HELLO 3` (with AUTH when the endpoint carries credentials)
    /// directly on the freshly established stream.
    async fn hello(
        &self,
        endpoint: &Endpoint,
        deadline: Duration,
        reader: &mut FrameReader<Monitored>,
        writer: &mut BoxedWrite,
    ) -> Result<(), Error> {
        let mut request = Request::new();
        match (&endpoint.username, &endpoint.password) {
            (Some(username), Some(password)) => {
                request.push(["HELLO", "3", "AUTH", username.as_str(), password.as_str()]);
            }
            _ => request.push(["HELLO", "3"]),
        }

        let exchange = async {
            writer.write_all(request.payload()).await?;
            let mut nodes: Vec<Node> = Vec::new();
            reader
                .read_response(
                    &mut |node: &crate::resp3::NodeRef<'_>| {
                        nodes.push(node.to_owned());
                        Ok(())
                    },
                    usize::MAX,
                )
                .await?;
            Ok::<Vec<Node>, Error>(nodes)
        };
        let nodes = match timeout(deadline, exchange).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout(TimedOut::Resp3Handshake)),
        };

        // A handshake failure is a single error or null frame.
        if nodes.len() == 1 {
            let node = &nodes[0];
            let message = String::from_utf8_lossy(&node.value).into_owned();
            match node.data_type {
                DataType::SimpleError => return Err(Error::SimpleError(message)),
                DataType::BlobError => return Err(Error::BlobError(message)),
                DataType::Null => {
                    return Err(error::resp("server rejected the protocol handshake"));
                }
                _ => (),
            }
        }
        Ok(())
    }

    /// Pulls frames off the stream, routing pushes to the push channel and
    /// responses to the head in-flight request, until the stream fails.
    async fn reader_task(&self, reader: &mut FrameReader<Monitored>) -> Error {
        let mut push_tx = self.shared.push_tx.clone();
        loop {
            let kind = match reader.peek_type().await {
                Ok(kind) => kind,
                Err(err) => return self.fail_head(err),
            };

            // A frame is a response only if something is waiting for one;
            // everything else — push frames, unsolicited errors, replies to
            // requests that expect none — goes to the push channel.
            let (to_head, max_read_size) = {
                let inner = self.shared.lock();
                match inner.queue.front() {
                    Some(head)
                        if head.status != Status::Pending
                            && head.command_count > 0
                            && kind != DataType::Push =>
                    {
                        (true, head.max_read_size)
                    }
                    _ => (false, usize::MAX),
                }
            };

            let mut nodes: Vec<Node> = Vec::new();
            let bytes_read = match reader
                .read_response(
                    &mut |node: &crate::resp3::NodeRef<'_>| {
                        nodes.push(node.to_owned());
                        Ok(())
                    },
                    max_read_size,
                )
                .await
            {
                Ok(n) => n,
                Err(err) => {
                    return if to_head { self.fail_head(err) } else { err };
                }
            };

            if to_head {
                let wake_writer = {
                    let mut inner = self.shared.lock();
                    inner.expected_responses = inner.expected_responses.saturating_sub(1);
                    if let Some(head) = inner.queue.front_mut() {
                        head.replies.push(nodes);
                        head.bytes_read += bytes_read;
                        head.remaining -= 1;
                        if head.remaining == 0 {
                            let mut entry = inner
                                .queue
                                .pop_front()
                                .expect("head entry was just observed");
                            let reply = ExecReply {
                                replies: std::mem::take(&mut entry.replies),
                                bytes_read: entry.bytes_read,
                            };
                            entry.complete(Ok(reply));
                        }
                    }
                    inner.expected_responses == 0 && !inner.queue.is_empty()
                };
                if wake_writer {
                    self.shared.writer_wake.notify_one();
                }
            } else {
                let (ack_tx, ack_rx) = oneshot::channel();
                let message = PushMessage {
                    nodes,
                    bytes_read,
                    ack: ack_tx,
                };
                if push_tx.send(message).await.is_err() {
                    return error::internal("push channel closed");
                }
                // Block until a consumer takes the push.  With no consumer
                // attached the traffic clock stalls here and the idle check
                // ends the run, which is the intended signal that pushes are
                // not being drained.
                let _ = ack_rx.await;
            }
        }
    }

    /// Completes the head in-flight request with the reader's error, if one
    /// was owed responses, and passes the error on as the run's verdict.
    fn fail_head(&self, err: Error) -> Error {
        let mut inner = self.shared.lock();
        let head_expects = inner
            .queue
            .front()
            .map(|head| head.status != Status::Pending && head.command_count > 0)
            .unwrap_or(false);
        if head_expects {
            let mut entry = inner.queue.pop_front().expect("head entry was just observed");
            entry.complete(Err(err.clone()));
        }
        err
    }

    /// Flushes pending requests in coalesced batches, then parks until the
    /// reader or a submitter wakes it.
    async fn writer_task(&self, writer: &mut BoxedWrite) -> Error {
        loop {
            let batch = self.stage_batch();
            match batch {
                Some(bytes) => {
                    if let Err(err) = writer.write_all(&bytes).await {
                        self.shared.lock().staging = false;
                        return err.into();
                    }
                    self.on_write();
                }
                None => self.shared.writer_wake.notified().await,
            }
        }
    }

    /// Collects the longest front run of pending requests whose `coalesce`
    /// flags allow them to share one write.  Nothing is staged while
    /// responses to the previous batch are still owed.
    fn stage_batch(&self) -> Option<Bytes> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        if inner.expected_responses != 0 || inner.staging || inner.queue.is_empty() {
            return None;
        }

        let mut batch = BytesMut::new();
        let mut previous_coalesce = true;
        for entry in inner.queue.iter_mut() {
            if entry.status != Status::Pending {
                break;
            }
            if !batch.is_empty() && !(previous_coalesce && entry.config.coalesce) {
                break;
            }
            batch.extend_from_slice(&entry.payload);
            entry.status = Status::Staged;
            inner.expected_responses += entry.command_count;
            previous_coalesce = entry.config.coalesce;
        }

        if batch.is_empty() {
            None
        } else {
            inner.staging = true;
            Some(batch.freeze())
        }
    }

    /// After a successful write: staged requests are now on the wire.  Those
    /// owing no responses complete immediately and leave the queue.
    fn on_write(&self) {
        let mut inner = self.shared.lock();
        inner.staging = false;
        let mut index = 0;
        while index < inner.queue.len() {
            if inner.queue[index].status == Status::Staged {
                if inner.queue[index].command_count == 0 {
                    let mut entry = inner
                        .queue
                        .remove(index)
                        .expect("index was just checked");
                    entry.complete(Ok(ExecReply::empty()));
                    continue;
                }
                inner.queue[index].status = Status::Written;
            }
            index += 1;
        }
    }

    /// Issues a PING every interval through the ordinary exec path, keeping
    /// traffic flowing on an otherwise quiet connection.
    async fn ping_task(&self, interval: Duration) -> Error {
        let mut request = Request::new();
        *request.config_mut() = RequestConfig {
            coalesce: true,
            cancel_on_connection_lost: true,
            retry_on_disconnect: false,
            cancel_if_not_connected: true,
        };
        request.push(["PING"]);

        loop {
            tokio::time::sleep(interval).await;
            let mut sink = adapter::ignore();
            if self.exec(&request, &mut sink).await.is_err() {
                // The reader or the idle check surfaces the real failure.
                return future::pending::<Error>().await;
            }
        }
    }

    /// Declares the connection idle when nothing has arrived for twice the
    /// ping interval.
    async fn idle_task(&self, interval: Duration) -> Error {
        let window = interval * 2;
        loop {
            tokio::time::sleep(window).await;
            let last_data = self.shared.lock().last_data;
            if last_data.elapsed() >= window {
                return Error::Timeout(TimedOut::Idle);
            }
        }
    }

    async fn stopped(stop_rx: &mut watch::Receiver<StopSignal>, seen: u64) -> Error {
        loop {
            {
                let signal = *stop_rx.borrow();
                if signal.generation > seen {
                    return signal.kind.into_error();
                }
            }
            if stop_rx.changed().await.is_err() {
                return Error::Aborted;
            }
        }
    }

    fn signal_stop(&self, kind: StopKind) -> bool {
        let was_running = self.shared.lock().running;
        self.shared.stop_tx.send_modify(|signal| {
            signal.generation += 1;
            signal.kind = kind;
        });
        was_running
    }

    fn cancel_unwritten(&self) -> usize {
        let mut inner = self.shared.lock();
        let mut kept = VecDeque::with_capacity(inner.queue.len());
        let mut cancelled = 0;
        for mut entry in inner.queue.drain(..) {
            if entry.status == Status::Pending {
                entry.complete(Err(Error::Aborted));
                cancelled += 1;
            } else {
                kept.push_back(entry);
            }
        }
        inner.queue = kept;
        cancelled
    }

    fn cancel_receive_waiters(&self) -> usize {
        let waiters = {
            let mut inner = self.shared.lock();
            std::mem::take(&mut inner.receive_waiters)
        };
        self.shared
            .receive_cancel_tx
            .send_modify(|generation| *generation += 1);
        waiters
    }

    /// Drains the queue after a run ends, honouring each request's
    /// connection-loss policy, and returns the connection to idle.
    fn teardown(&self) {
        let mut inner = self.shared.lock();
        inner.open = false;
        inner.running = false;
        inner.staging = false;
        inner.expected_responses = 0;

        let queue = std::mem::take(&mut inner.queue);
        let mut kept = VecDeque::new();
        for mut entry in queue {
            if entry.config.cancel_on_connection_lost {
                entry.complete(Err(Error::Aborted));
            } else if entry.status == Status::Written && !entry.config.retry_on_disconnect {
                entry.complete(Err(Error::Aborted));
            } else {
                entry.status = Status::Pending;
                entry.remaining = entry.command_count;
                entry.replies.clear();
                entry.bytes_read = 0;
                kept.push_back(entry);
            }
        }
        inner.queue = kept;
    }
}
