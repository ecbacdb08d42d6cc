// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use catloop::{socks5::Socks5Server, EventLoop, ServerOptions};
use log::info;

fn main() {
    flexi_logger::Logger::try_with_env_or_str("info")
        .unwrap()
        .start()
        .unwrap();

    let loop_ = EventLoop::current();
    let server = Socks5Server::new(
        &loop_,
        "127.0.0.1".parse().unwrap(),
        1080,
        ServerOptions::default(),
    )
    .unwrap();

    info!("SOCKS5 relay on {}", server.local_addr());
    loop_.run();
}
