// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use bytes::{Bytes, BytesMut};
use catloop::{EventLoop, Fail, ServerOptions, StreamConnection, TcpServer, DEFAULT_MAX_READ};

use std::{
    cell::RefCell,
    io::{Read, Write},
    net::{IpAddr, Ipv4Addr, TcpListener, TcpStream},
    rc::Rc,
    thread,
    time::{Duration, Instant},
};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Drives the loop for roughly `duration` while background I/O happens.
fn run_for(loop_: &EventLoop, duration: Duration) {
    let done = loop_.sleep(duration);
    loop_.run_until(done).unwrap();
}

//==============================================================================
// Echo
//==============================================================================

/// Tests a delimited request/response round trip: the server reads one CRLF
/// line, prefixes it, writes it back, and closes.
#[test]
fn echo() {
    let loop_ = EventLoop::new().unwrap();
    let server = TcpServer::new(
        &loop_,
        LOCALHOST,
        0,
        ServerOptions::default(),
        |conn, _addr| async move {
            let line = conn.read_until(b"\r\n", DEFAULT_MAX_READ).await?;
            let mut response = BytesMut::from(&b"server say: "[..]);
            response.extend_from_slice(&line);
            conn.write(response.freeze()).await?;
            Ok(())
        },
    )
    .unwrap();
    let addr = server.local_addr();

    let client = thread::spawn(move || {
        let mut sock = TcpStream::connect(addr).unwrap();
        sock.write_all(b"hello\r\n").unwrap();
        let mut response = Vec::new();
        sock.read_to_end(&mut response).unwrap();
        response
    });

    run_for(&loop_, Duration::from_millis(500));
    assert_eq!(client.join().unwrap(), b"server say: hello\r\n".to_vec());
    server.close();
}

//==============================================================================
// Read Limits
//==============================================================================

/// Tests that a delimited read overrunning its limit fails with the
/// entity-too-large connection error.
#[test]
fn read_until_entity_too_large() {
    let loop_ = EventLoop::new().unwrap();
    let seen: Rc<RefCell<Option<Result<Bytes, Fail>>>> = Rc::new(RefCell::new(None));
    let seen2 = seen.clone();
    let server = TcpServer::new(
        &loop_,
        LOCALHOST,
        0,
        ServerOptions::default(),
        move |conn, _addr| {
            let seen = seen2.clone();
            async move {
                *seen.borrow_mut() = Some(conn.read_until(b"\r\n", 16).await);
                Ok(())
            }
        },
    )
    .unwrap();
    let addr = server.local_addr();

    let client = thread::spawn(move || {
        let mut sock = TcpStream::connect(addr).unwrap();
        sock.write_all(&[b'x'; 32]).unwrap();
        // Stay connected so the failure is the limit, not EOF.
        thread::sleep(Duration::from_millis(300));
    });

    run_for(&loop_, Duration::from_millis(200));
    client.join().unwrap();
    match seen.borrow().as_ref() {
        Some(Err(Fail::ConnectionClosed { reason, .. })) => {
            assert_eq!(reason.as_str(), "Entity Too Large")
        }
        other => panic!("unexpected read outcome: {:?}", other),
    };
}

//==============================================================================
// Timeouts
//==============================================================================

/// Tests that an exact read under a deadline fails with a timeout and closes
/// the connection when the peer goes quiet.
#[test]
fn read_exact_times_out() {
    let loop_ = EventLoop::new().unwrap();
    let seen: Rc<RefCell<Option<Result<Bytes, Fail>>>> = Rc::new(RefCell::new(None));
    let seen2 = seen.clone();
    let server = TcpServer::new(
        &loop_,
        LOCALHOST,
        0,
        ServerOptions::default(),
        move |conn, _addr| {
            let seen = seen2.clone();
            async move {
                let result = conn.read_exact_timeout(100, Duration::from_millis(200)).await;
                let closed = conn.is_closed();
                *seen.borrow_mut() = Some(result);
                assert!(closed, "timeout must close the connection");
                Ok(())
            }
        },
    )
    .unwrap();
    let addr = server.local_addr();

    let started = Instant::now();
    let client = thread::spawn(move || {
        let mut sock = TcpStream::connect(addr).unwrap();
        sock.write_all(b"ten bytes.").unwrap();
        // Idle; the server should hang up on us once its read expires.
        let mut rest = Vec::new();
        sock.read_to_end(&mut rest).unwrap();
        rest
    });

    run_for(&loop_, Duration::from_millis(400));
    assert_eq!(client.join().unwrap(), Vec::<u8>::new());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(matches!(*seen.borrow(), Some(Err(Fail::Timeout {}))));
}

//==============================================================================
// Write Backpressure
//==============================================================================

/// Tests that a large write drains through multiple writability events and
/// arrives intact.
#[test]
fn large_write_drains() {
    let loop_ = EventLoop::new().unwrap();
    let sent: Rc<RefCell<Option<Result<usize, Fail>>>> = Rc::new(RefCell::new(None));
    let sent2 = sent.clone();
    let payload_len: usize = 1 << 20;
    let server = TcpServer::new(
        &loop_,
        LOCALHOST,
        0,
        ServerOptions::default(),
        move |conn, _addr| {
            let sent = sent2.clone();
            async move {
                let payload = Bytes::from(vec![0xa5u8; 1 << 20]);
                *sent.borrow_mut() = Some(conn.write(payload).await);
                Ok(())
            }
        },
    )
    .unwrap();
    let addr = server.local_addr();

    let client = thread::spawn(move || {
        let mut sock = TcpStream::connect(addr).unwrap();
        let mut received = Vec::new();
        sock.read_to_end(&mut received).unwrap();
        received
    });

    run_for(&loop_, Duration::from_millis(800));
    let received = client.join().unwrap();
    assert_eq!(received.len(), payload_len);
    assert!(received.iter().all(|b| *b == 0xa5));
    assert!(matches!(*sent.borrow(), Some(Ok(_))));
}

//==============================================================================
// Connect
//==============================================================================

/// Tests the asynchronous connect path against a blocking peer.
#[test]
fn connect_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut request = [0u8; 4];
        sock.read_exact(&mut request).unwrap();
        assert_eq!(&request, b"ping");
        sock.write_all(b"pong").unwrap();
    });

    let loop_ = EventLoop::new().unwrap();
    let l2 = loop_.clone();
    let handle = loop_.spawn(async move {
        let conn = StreamConnection::connect(&l2, addr, Some(Duration::from_secs(1))).await?;
        conn.write(Bytes::from_static(b"ping")).await?;
        let reply = conn.read_exact(4).await?;
        conn.close();
        Ok(reply)
    });
    let reply = loop_.run_until(handle).unwrap();
    peer.join().unwrap();
    assert_eq!(&reply[..], b"pong");
}

/// Tests that connecting to a dead port surfaces the OS error.
#[test]
fn connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let loop_ = EventLoop::new().unwrap();
    let l2 = loop_.clone();
    let handle = loop_.spawn(async move {
        StreamConnection::connect(&l2, addr, Some(Duration::from_secs(1)))
            .await
            .map(|_| ())
    });
    assert!(matches!(loop_.run_until(handle), Err(Fail::Os { .. })));
}
