// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{
    datagram::Datagram,
    event_loop::{EventFlags, EventHandler, EventLoop},
    fail::Fail,
    stream::StreamConnection,
    utils,
};

use bytes::Bytes;
use futures::future::{FutureExt, LocalBoxFuture};

use std::{
    cell::Cell,
    future::Future,
    io,
    net::{IpAddr, SocketAddr, TcpListener, UdpSocket},
    os::unix::io::{AsRawFd, RawFd},
    rc::Rc,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Largest datagram accepted per receive.
const PACKAGE_SIZE: usize = 65535;

/// Listening-socket options.
#[derive(Clone, Copy, Debug)]
pub struct ServerOptions {
    pub backlog: i32,
    pub reuse_addr: bool,
}

type ConnHandler = Box<dyn Fn(StreamConnection, SocketAddr) -> LocalBoxFuture<'static, Result<(), Fail>>>;
type DatagramHandler = Box<dyn Fn(Datagram, SocketAddr) -> LocalBoxFuture<'static, Result<(), Fail>>>;

/// TCP accept loop.
///
/// Every accepted socket is wrapped in a [StreamConnection] and handed to the
/// server's handler coroutine. Handler failures are logged and never take the
/// loop down; the connection is closed when its handler finishes.
#[derive(Clone)]
pub struct TcpServer {
    inner: Rc<TcpServerInner>,
}

struct TcpServerInner {
    loop_: EventLoop,
    sock: TcpListener,
    local: SocketAddr,
    handler: ConnHandler,
    closed: Cell<bool>,
}

/// UDP receive loop; each message is handed to the handler as a [Datagram].
#[derive(Clone)]
pub struct UdpServer {
    inner: Rc<UdpServerInner>,
}

struct UdpServerInner {
    loop_: EventLoop,
    sock: Rc<UdpSocket>,
    local: SocketAddr,
    handler: DatagramHandler,
    closed: Cell<bool>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [TcpServer].
impl TcpServer {
    /// Binds a listener and starts accepting.
    pub fn new<F, Fut>(
        loop_: &EventLoop,
        ip: IpAddr,
        port: u16,
        options: ServerOptions,
        handler: F,
    ) -> Result<Self, Fail>
    where
        F: Fn(StreamConnection, SocketAddr) -> Fut + 'static,
        Fut: Future<Output = Result<(), Fail>> + 'static,
    {
        let sock = utils::create_listener(
            SocketAddr::new(ip, port),
            options.backlog,
            options.reuse_addr,
        )?;
        let local = sock.local_addr()?;
        let server = Self {
            inner: Rc::new(TcpServerInner {
                loop_: loop_.clone(),
                sock,
                local,
                handler: Box::new(move |conn, addr| handler(conn, addr).boxed_local()),
                closed: Cell::new(false),
            }),
        };
        loop_.register(
            server.inner.sock.as_raw_fd(),
            EventFlags::READ | EventFlags::ERROR,
            Rc::new(server.clone()),
        )?;
        info!("TCP: listening on {}", local);
        Ok(server)
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// Stops accepting. Established connections are unaffected.
    pub fn close(&self) {
        if !self.inner.closed.replace(true) {
            self.inner.loop_.unregister(self.inner.sock.as_raw_fd());
        }
    }
}

/// Associate functions for [UdpServer].
impl UdpServer {
    /// Binds a datagram socket and starts receiving.
    pub fn new<F, Fut>(
        loop_: &EventLoop,
        ip: IpAddr,
        port: u16,
        options: ServerOptions,
        handler: F,
    ) -> Result<Self, Fail>
    where
        F: Fn(Datagram, SocketAddr) -> Fut + 'static,
        Fut: Future<Output = Result<(), Fail>> + 'static,
    {
        let sock = utils::create_dgram(SocketAddr::new(ip, port), options.reuse_addr)?;
        let local = sock.local_addr()?;
        let server = Self {
            inner: Rc::new(UdpServerInner {
                loop_: loop_.clone(),
                sock: Rc::new(sock),
                local,
                handler: Box::new(move |dgram, addr| handler(dgram, addr).boxed_local()),
                closed: Cell::new(false),
            }),
        };
        loop_.register(
            server.inner.sock.as_raw_fd(),
            EventFlags::READ | EventFlags::ERROR,
            Rc::new(server.clone()),
        )?;
        info!("UDP: listening on {}", local);
        Ok(server)
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// Stops receiving.
    pub fn close(&self) {
        if !self.inner.closed.replace(true) {
            self.inner.loop_.unregister(self.inner.sock.as_raw_fd());
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Default trait implementation for [ServerOptions].
impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            backlog: 128,
            reuse_addr: true,
        }
    }
}

/// Event-handler trait implementation for [TcpServer].
impl EventHandler for TcpServer {
    fn on_event(&self, _fd: RawFd, events: EventFlags) {
        if events.contains(EventFlags::ERROR) {
            warn!("TCP: listener error on {}", self.inner.local);
            self.close();
            return;
        }
        if !events.contains(EventFlags::READ) {
            return;
        }
        match self.inner.sock.accept() {
            Ok((sock, addr)) => {
                debug!("TCP: accept {}", addr);
                let conn = match StreamConnection::new(&self.inner.loop_, sock, addr) {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("TCP: failed to set up connection from {}: {}", addr, e);
                        return;
                    }
                };
                let future = (self.inner.handler)(conn.clone(), addr);
                self.inner.loop_.spawn(async move {
                    if let Err(e) = future.await {
                        warn!("TCP: connection {} failed: {}", addr, e);
                    }
                    conn.close();
                    Ok::<(), Fail>(())
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => warn!("TCP: accept error: {}", e),
        }
    }
}

/// Event-handler trait implementation for [UdpServer].
impl EventHandler for UdpServer {
    fn on_event(&self, _fd: RawFd, events: EventFlags) {
        if events.contains(EventFlags::ERROR) {
            warn!("UDP: socket error on {}", self.inner.local);
            self.close();
            return;
        }
        if !events.contains(EventFlags::READ) {
            return;
        }
        let mut package = [0u8; PACKAGE_SIZE];
        match self.inner.sock.recv_from(&mut package) {
            Ok((n, addr)) => {
                debug!("UDP: received {} bytes from {}", n, addr);
                let dgram = Datagram::new(
                    self.inner.sock.clone(),
                    addr,
                    Bytes::copy_from_slice(&package[..n]),
                );
                let future = (self.inner.handler)(dgram, addr);
                self.inner.loop_.spawn(async move {
                    if let Err(e) = future.await {
                        warn!("UDP: datagram handler for {} failed: {}", addr, e);
                    }
                    Ok::<(), Fail>(())
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => warn!("UDP: recv error: {}", e),
        }
    }
}
