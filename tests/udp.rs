// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use bytes::BytesMut;
use catloop::{EventLoop, Fail, ServerOptions, UdpClient, UdpServer};

use std::{
    net::{IpAddr, Ipv4Addr, UdpSocket},
    thread,
    time::Duration,
};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Drives the loop for roughly `duration` while background I/O happens.
fn run_for(loop_: &EventLoop, duration: Duration) {
    let done = loop_.sleep(duration);
    loop_.run_until(done).unwrap();
}

//==============================================================================
// Server
//==============================================================================

/// Tests that each received datagram is handed to the handler and that the
/// reply goes back through the shared server socket.
#[test]
fn udp_server_echo() {
    let loop_ = EventLoop::new().unwrap();
    let server = UdpServer::new(
        &loop_,
        LOCALHOST,
        0,
        ServerOptions::default(),
        |dgram, _addr| async move {
            let package = dgram.read_package();
            let mut response = BytesMut::from(&b"server say: "[..]);
            response.extend_from_slice(&package);
            dgram.write_package(&response)?;
            Ok(())
        },
    )
    .unwrap();
    let addr = server.local_addr();

    let client = thread::spawn(move || {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        sock.send_to(b"ping", addr).unwrap();
        let mut package = [0u8; 64];
        let (n, _) = sock.recv_from(&mut package).unwrap();
        package[..n].to_vec()
    });

    run_for(&loop_, Duration::from_millis(400));
    assert_eq!(client.join().unwrap(), b"server say: ping".to_vec());
    server.close();
}

//==============================================================================
// Client
//==============================================================================

/// Tests a request/response round trip from the loop side.
#[test]
fn udp_client_round_trip() {
    let server_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server_addr = server_sock.local_addr().unwrap();
    let server = thread::spawn(move || {
        let mut package = [0u8; 64];
        let (n, from) = server_sock.recv_from(&mut package).unwrap();
        assert_eq!(&package[..n], b"ping");
        server_sock.send_to(b"pong", from).unwrap();
    });

    let loop_ = EventLoop::new().unwrap();
    let client = UdpClient::new(&loop_, UdpSocket::bind("127.0.0.1:0").unwrap()).unwrap();
    let c2 = client.clone();
    let handle = loop_.spawn(async move {
        c2.write(b"ping", server_addr)?;
        c2.read(Some(Duration::from_secs(1))).await
    });
    let (data, from) = loop_.run_until(handle).unwrap();
    server.join().unwrap();
    assert_eq!(&data[..], b"pong");
    assert_eq!(from, server_addr);
}

/// Tests that an expired read closes the socket and reports the timeout.
#[test]
fn udp_client_read_times_out() {
    let loop_ = EventLoop::new().unwrap();
    let client = UdpClient::new(&loop_, UdpSocket::bind("127.0.0.1:0").unwrap()).unwrap();
    let c2 = client.clone();
    let handle = loop_.spawn(async move { c2.read(Some(Duration::from_millis(50))).await });
    assert_eq!(loop_.run_until(handle), Err(Fail::Timeout {}));

    // The socket is gone; further reads fail immediately.
    let c3 = client.clone();
    let handle = loop_.spawn(async move { c3.read(None).await });
    assert!(matches!(
        loop_.run_until(handle),
        Err(Fail::ConnectionClosed { .. })
    ));
}
