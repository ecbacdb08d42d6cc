// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use bytes::BytesMut;
use catloop::{EventLoop, ServerOptions, TcpServer, DEFAULT_MAX_READ};
use log::info;

fn main() {
    flexi_logger::Logger::try_with_env_or_str("debug")
        .unwrap()
        .start()
        .unwrap();

    let loop_ = EventLoop::current();
    let server = TcpServer::new(
        &loop_,
        "127.0.0.1".parse().unwrap(),
        8888,
        ServerOptions::default(),
        |conn, addr| async move {
            while !conn.is_closed() {
                let line = conn.read_until(b"\r\n", DEFAULT_MAX_READ).await?;
                info!("{} sent {} bytes", addr, line.len());
                let mut response = BytesMut::from(&b"server say: "[..]);
                response.extend_from_slice(&line);
                conn.write(response.freeze()).await?;
            }
            Ok(())
        },
    )
    .unwrap();

    info!("echo server on {}", server.local_addr());
    loop_.run();
}
