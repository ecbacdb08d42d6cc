// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Single-threaded cooperative I/O runtime.
//!
//! The crate couples a readiness-driven event loop to a coroutine scheduler
//! through one-shot completion futures. Coroutines are plain `async` blocks
//! spawned onto the loop; everything that would block — socket reads and
//! writes, timers, locks, bounded queues — is expressed as a future resolved
//! by the loop. All state is thread-local: there is no preemption and no
//! locking of runtime structures, and code between two awaits runs atomically
//! with respect to every other coroutine.
//!
//! On top of the runtime sit buffered TCP stream connections with delimited
//! and exact reads, datagram sockets, accept-loop servers, and a SOCKS5
//! CONNECT relay.

#[macro_use]
extern crate log;

pub mod collections;
mod datagram;
mod event_loop;
mod fail;
mod future;
mod server;
pub mod socks5;
mod stream;
mod sync;
mod utils;

pub use self::{
    datagram::{Datagram, UdpClient},
    event_loop::{sched, sleep, EventFlags, EventHandler, EventLoop, Timer},
    fail::Fail,
    future::Oneshot,
    server::{ServerOptions, TcpServer, UdpServer},
    stream::{StreamConnection, DEFAULT_MAX_READ},
    sync::{Lock, Queue},
};
