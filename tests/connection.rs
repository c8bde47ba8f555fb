/*
 * Copyright 2026 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! End-to-end tests of the connection engine against an in-process server
//! that speaks just enough of the protocol: HELLO, PING, SUBSCRIBE, GET and
//! QUIT, with subscribe confirmations delivered as RESP3 pushes.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use redis_resp3::adapter;
use redis_resp3::resp3::{Request, RequestConfig};
use redis_resp3::{Connection, Endpoint, Error, Operation, TimedOut, Timeouts};

#[derive(Debug, Clone, Copy, Default)]
struct ServerOptions {
    reject_hello: bool,
}

async fn start_server(options: ServerOptions) -> SocketAddr {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    tokio::spawn(handle_client(socket, options));
                }
                Err(_) => return,
            }
        }
    });
    addr
}

async fn handle_client(socket: TcpStream, options: ServerOptions) {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);

    while let Ok(Some(command)) = read_command(&mut reader).await {
        let name = command[0].to_ascii_uppercase();
        let outcome: io::Result<()> = match name.as_str() {
            "HELLO" if options.reject_hello => {
                write
                    .write_all(b"-NOPROTO unsupported protocol version\r\n")
                    .await
            }
            "HELLO" => {
                write
                    .write_all(b"%1\r\n$6\r\nserver\r\n$5\r\nredis\r\n")
                    .await
            }
            "PING" => {
                if command.len() > 1 {
                    let msg = &command[1];
                    write
                        .write_all(format!("${}\r\n{}\r\n", msg.len(), msg).as_bytes())
                        .await
                } else {
                    write.write_all(b"+PONG\r\n").await
                }
            }
            "SUBSCRIBE" => {
                let channel = &command[1];
                write
                    .write_all(
                        format!(
                            ">3\r\n$9\r\nsubscribe\r\n${}\r\n{}\r\n:1\r\n",
                            channel.len(),
                            channel
                        )
                        .as_bytes(),
                    )
                    .await
            }
            "GET" => write.write_all(b"$-1\r\n").await,
            "QUIT" => {
                let _ = write.write_all(b"+OK\r\n").await;
                return;
            }
            _ => write.write_all(b"-ERR unknown command\r\n").await,
        };
        if outcome.is_err() {
            return;
        }
    }
}

/// Reads one RESP2 multibulk command, or `None` on a clean close.
async fn read_command(
    reader: &mut BufReader<OwnedReadHalf>,
) -> io::Result<Option<Vec<String>>> {
    let mut header = String::new();
    if reader.read_line(&mut header).await? == 0 {
        return Ok(None);
    }
    let header = header.trim();
    if !header.starts_with('*') {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "expected array"));
    }
    let count: usize = header[1..]
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad count"))?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let mut bulk_header = String::new();
        reader.read_line(&mut bulk_header).await?;
        let bulk_header = bulk_header.trim();
        if !bulk_header.starts_with('$') {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len: usize = bulk_header[1..]
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad length"))?;
        let mut payload = vec![0u8; len + 2];
        reader.read_exact(&mut payload).await?;
        args.push(String::from_utf8_lossy(&payload[..len]).into_owned());
    }
    Ok(Some(args))
}

fn fast_timeouts(ping_interval: Duration) -> Timeouts {
    Timeouts {
        ping_interval,
        ..Timeouts::default()
    }
}

const TEST_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn push_is_filtered_out_of_a_typed_response() {
    let addr = start_server(ServerOptions::default()).await;
    let connection = Connection::new();
    let endpoint = Endpoint::new(addr.ip().to_string(), addr.port());

    let mut req = Request::new();
    req.push(["PING"]);
    req.push(["SUBSCRIBE", "channel"]);
    req.push(["QUIT"]);
    assert_eq!(req.command_count(), 2);

    // The subscribe confirmation arrives as a push between the two replies;
    // a receiver must be draining it.
    let push_task = tokio::spawn({
        let connection = connection.clone();
        async move {
            let mut sink = adapter::ignore();
            connection.receive(&mut sink).await
        }
    });

    let run_task = tokio::spawn({
        let connection = connection.clone();
        let endpoint = endpoint.clone();
        async move {
            connection
                .run(&endpoint, &fast_timeouts(Duration::from_secs(1)))
                .await
        }
    });

    let mut resp = (String::new(), String::new());
    timeout(TEST_DEADLINE, connection.exec(&req, &mut adapter::adapt(&mut resp)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp, ("PONG".to_string(), "OK".to_string()));

    let push_bytes = timeout(TEST_DEADLINE, push_task).await.unwrap().unwrap();
    assert!(push_bytes.unwrap() > 0);

    let run_result = timeout(TEST_DEADLINE, run_task).await.unwrap().unwrap();
    assert!(matches!(run_result, Err(Error::EndOfStream)));
}

#[tokio::test]
async fn handshake_then_ping_echo() {
    let addr = start_server(ServerOptions::default()).await;
    let connection = Connection::new();
    let endpoint = Endpoint::new(addr.ip().to_string(), addr.port());

    let run_task = tokio::spawn({
        let connection = connection.clone();
        let endpoint = endpoint.clone();
        async move {
            connection
                .run(&endpoint, &fast_timeouts(Duration::from_secs(1)))
                .await
        }
    });

    let mut req = Request::new();
    req.push(["PING", "x"]);

    let mut resp = (String::new(),);
    timeout(TEST_DEADLINE, connection.exec(&req, &mut adapter::adapt(&mut resp)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp.0, "x");

    assert!(connection.is_open());
    connection.cancel(Operation::Run);
    let run_result = timeout(TEST_DEADLINE, run_task).await.unwrap().unwrap();
    assert!(matches!(run_result, Err(Error::Aborted)));
}

#[tokio::test]
async fn undrained_pushes_end_in_idle_timeout() {
    let addr = start_server(ServerOptions::default()).await;
    let connection = Connection::new();
    let endpoint = Endpoint::new(addr.ip().to_string(), addr.port());

    let mut req = Request::with_config(RequestConfig {
        cancel_on_connection_lost: true,
        ..RequestConfig::default()
    });
    req.push(["SUBSCRIBE", "channel"]);
    assert_eq!(req.command_count(), 0);

    let exec_task = tokio::spawn({
        let connection = connection.clone();
        async move {
            let mut sink = adapter::ignore();
            connection.exec(&req, &mut sink).await
        }
    });

    // No receive caller: the subscribe confirmation stalls the reader and
    // the idle check must end the run.
    let run_result = timeout(
        TEST_DEADLINE,
        connection.run(&endpoint, &fast_timeouts(Duration::from_millis(50))),
    )
    .await
    .unwrap();
    assert!(matches!(
        run_result,
        Err(Error::Timeout(TimedOut::Idle))
    ));

    // The subscribe itself completed once written.
    let exec_result = timeout(TEST_DEADLINE, exec_task).await.unwrap().unwrap();
    assert!(exec_result.is_ok());
}

#[tokio::test]
async fn quit_in_a_coalesced_batch() {
    let addr = start_server(ServerOptions::default()).await;
    let connection = Connection::new();
    let endpoint = Endpoint::new(addr.ip().to_string(), addr.port());

    let mut ping = Request::new();
    ping.push(["PING"]);
    let mut quit = Request::new();
    quit.push(["QUIT"]);

    // All four are submitted before the run starts, so the writer flushes
    // them as one coalesced batch: PING, QUIT, PING, PING.
    let requests = [&ping, &quit, &ping, &ping];
    let exec_futures: Vec<_> = requests
        .into_iter()
        .map(|req| {
            let connection = connection.clone();
            async move {
                let mut sink = adapter::ignore();
                connection.exec(req, &mut sink).await
            }
        })
        .collect();
    // join_all polls in order, which fixes the submission order; the run is
    // polled after every request is enqueued.
    let execs = futures_util::future::join_all(exec_futures);
    let run = {
        let connection = connection.clone();
        let endpoint = endpoint.clone();
        async move {
            connection
                .run(&endpoint, &fast_timeouts(Duration::from_secs(30)))
                .await
        }
    };

    let (results, run_result) =
        timeout(TEST_DEADLINE, futures_util::future::join(execs, run))
            .await
            .unwrap();
    assert!(matches!(run_result, Err(Error::EndOfStream)));

    assert!(results[0].is_ok(), "first PING: {:?}", results[0]);
    assert!(results[1].is_ok(), "QUIT: {:?}", results[1]);
    assert!(
        matches!(results[2], Err(Error::EndOfStream)),
        "PING after QUIT: {:?}",
        results[2]
    );
    assert!(
        matches!(results[3], Err(Error::Aborted)),
        "last PING: {:?}",
        results[3]
    );
}

#[tokio::test]
async fn pushes_interleave_with_replies() {
    let addr = start_server(ServerOptions::default()).await;
    let connection = Connection::new();
    let endpoint = Endpoint::new(addr.ip().to_string(), addr.port());

    let push_counter = tokio::spawn({
        let connection = connection.clone();
        async move {
            let mut count = 0usize;
            loop {
                let mut sink = adapter::ignore();
                match connection.receive(&mut sink).await {
                    Ok(_) => count += 1,
                    Err(Error::ChannelCancelled) => return count,
                    Err(err) => panic!("unexpected receive error: {:?}", err),
                }
            }
        }
    });

    let mut requests = Vec::new();
    for command in [
        vec!["PING"],
        vec!["SUBSCRIBE", "chan-a"],
        vec!["PING"],
        vec!["SUBSCRIBE", "chan-b"],
        vec!["PING"],
        vec!["QUIT"],
    ] {
        let mut req = Request::new();
        req.push(command);
        requests.push(req);
    }

    let exec_futures: Vec<_> = requests
        .iter()
        .map(|req| {
            let connection = connection.clone();
            async move {
                let mut sink = adapter::ignore();
                connection.exec(req, &mut sink).await
            }
        })
        .collect();
    // join_all polls in order, which fixes the submission order.
    let exec_results = futures_util::future::join_all(exec_futures);

    let run = {
        let connection = connection.clone();
        let endpoint = endpoint.clone();
        async move {
            connection
                .run(&endpoint, &fast_timeouts(Duration::from_secs(30)))
                .await
        }
    };

    let (exec_results, run_result) =
        timeout(TEST_DEADLINE, futures_util::future::join(exec_results, run))
            .await
            .unwrap();

    for result in &exec_results {
        assert!(result.is_ok(), "exec failed: {:?}", result);
    }
    assert!(matches!(run_result, Err(Error::EndOfStream)));

    connection.cancel(Operation::Receive);
    let pushes = timeout(TEST_DEADLINE, push_counter).await.unwrap().unwrap();
    assert_eq!(pushes, 2);
}

#[tokio::test]
async fn rejected_handshake_fails_the_run() {
    let addr = start_server(ServerOptions { reject_hello: true }).await;
    let connection = Connection::new();
    let endpoint = Endpoint::new(addr.ip().to_string(), addr.port());

    let run_result = timeout(
        TEST_DEADLINE,
        connection.run(&endpoint, &Timeouts::default()),
    )
    .await
    .unwrap();
    match run_result {
        Err(Error::SimpleError(message)) => assert!(message.starts_with("NOPROTO")),
        other => panic!("expected a handshake rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn cancel_exec_is_idempotent() {
    let connection = Connection::new();

    let mut req = Request::new();
    req.push(["PING"]);

    let execs: Vec<_> = (0..2)
        .map(|_| {
            let connection = connection.clone();
            let req = req.clone();
            tokio::spawn(async move {
                let mut sink = adapter::ignore();
                connection.exec(&req, &mut sink).await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(connection.cancel(Operation::Exec), 2);
    for task in execs {
        let result = timeout(TEST_DEADLINE, task).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Aborted)));
    }
    assert_eq!(connection.cancel(Operation::Exec), 0);
}

#[tokio::test]
async fn cancel_receive_is_idempotent() {
    let connection = Connection::new();

    let receive_task = tokio::spawn({
        let connection = connection.clone();
        async move {
            let mut sink = adapter::ignore();
            connection.receive(&mut sink).await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(connection.cancel(Operation::Receive), 1);
    let result = timeout(TEST_DEADLINE, receive_task).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::ChannelCancelled)));
    assert_eq!(connection.cancel(Operation::Receive), 0);
}

#[tokio::test]
async fn exec_with_timeout_expires_while_disconnected() {
    let connection = Connection::new();

    let mut req = Request::new();
    req.push(["PING"]);

    let mut sink = adapter::ignore();
    let result = connection
        .exec_with_timeout(&req, &mut sink, Duration::from_millis(20))
        .await;
    assert!(matches!(result, Err(Error::Timeout(TimedOut::Exec))));
}

#[tokio::test]
async fn cancel_if_not_connected_fails_fast() {
    let connection = Connection::new();

    let mut req = Request::with_config(RequestConfig {
        cancel_if_not_connected: true,
        ..RequestConfig::default()
    });
    req.push(["PING"]);

    let mut sink = adapter::ignore();
    let result = connection.exec(&req, &mut sink).await;
    assert!(matches!(result, Err(Error::NotConnected)));
}
