// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{
    event_loop::{EventFlags, EventHandler, EventLoop},
    fail::Fail,
    future::Oneshot,
};

use bytes::Bytes;

use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    net::{SocketAddr, UdpSocket},
    os::unix::io::{AsRawFd, RawFd},
    rc::Rc,
    time::Duration,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Largest datagram accepted per receive.
const PACKAGE_SIZE: usize = 65535;

/// One received message on a server's shared datagram socket.
///
/// Replies go back to the sender through the shared socket; closing a
/// [Datagram] drops the message without touching the socket.
pub struct Datagram {
    sock: Rc<UdpSocket>,
    peer: SocketAddr,
    data: RefCell<Bytes>,
}

/// Non-blocking request/response datagram socket.
///
/// Messages that arrive while no reader is waiting are buffered in arrival
/// order; a waiting reader is resolved directly. At most one read may be
/// pending at a time.
#[derive(Clone)]
pub struct UdpClient {
    inner: Rc<RefCell<UdpClientInner>>,
}

struct UdpClientInner {
    loop_: EventLoop,
    sock: Option<UdpSocket>,
    rbuf: VecDeque<(Bytes, SocketAddr)>,
    rfut: Option<Oneshot<(Bytes, SocketAddr)>>,
    closed: bool,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Datagram].
impl Datagram {
    /// Wraps one received message.
    pub fn new(sock: Rc<UdpSocket>, peer: SocketAddr, data: Bytes) -> Self {
        Self {
            sock,
            peer,
            data: RefCell::new(data),
        }
    }

    /// Returns the received message.
    pub fn read_package(&self) -> Bytes {
        self.data.borrow().clone()
    }

    /// Sends a reply to the message's sender.
    pub fn write_package(&self, package: &[u8]) -> Result<usize, Fail> {
        self.sock.send_to(package, self.peer).map_err(Into::into)
    }

    /// Returns the sender's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Drops the buffered message.
    pub fn close(&self) {
        *self.data.borrow_mut() = Bytes::new();
    }
}

/// Associate functions for [UdpClient].
impl UdpClient {
    /// Wraps a datagram socket and registers it with the loop.
    pub fn new(loop_: &EventLoop, sock: UdpSocket) -> Result<Self, Fail> {
        sock.set_nonblocking(true)?;
        let client = Self {
            inner: Rc::new(RefCell::new(UdpClientInner {
                loop_: loop_.clone(),
                sock: Some(sock),
                rbuf: VecDeque::new(),
                rfut: None,
                closed: false,
            })),
        };
        {
            let inner = client.inner.borrow();
            let fd = inner.sock.as_ref().unwrap().as_raw_fd();
            inner
                .loop_
                .register(fd, EventFlags::READ | EventFlags::ERROR, Rc::new(client.clone()))?;
        }
        Ok(client)
    }

    /// Sends a message to `server`.
    pub fn write(&self, data: &[u8], server: SocketAddr) -> Result<usize, Fail> {
        let inner = self.inner.borrow();
        match inner.sock.as_ref() {
            Some(sock) => sock.send_to(data, server).map_err(Into::into),
            None => Err(Fail::ConnectionClosed {
                by: server.to_string(),
                reason: "socket closed".to_string(),
            }),
        }
    }

    /// Receives the next message and its sender.
    ///
    /// A previously buffered message is delivered through the ready queue;
    /// otherwise a receive future is parked. An expired timeout closes the
    /// socket and fails the read with [Fail::Timeout].
    pub async fn read(&self, timeout: Option<Duration>) -> Result<(Bytes, SocketAddr), Fail> {
        let future: Oneshot<(Bytes, SocketAddr)> = Oneshot::new();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(Fail::ConnectionClosed {
                    by: "[::]:0".to_string(),
                    reason: "socket closed".to_string(),
                });
            }
            if let Some(message) = inner.rbuf.pop_front() {
                let f = future.clone();
                inner.loop_.call_soon(move || f.set_result(message));
                drop(inner);
                return future.await;
            }
            assert!(inner.rfut.is_none(), "concurrent read on datagram socket");
            inner.rfut = Some(future.clone());
        }
        let timer = timeout.map(|t| {
            let fut = future.clone();
            let client = self.clone();
            self.loop_handle().call_later(t, move || {
                fut.cancel(Fail::Timeout {});
                client.close();
            })
        });
        let result = future.await;
        if let Some(timer) = &timer {
            self.loop_handle().cancel_timer(timer);
        }
        result
    }

    /// Closes the socket: unregisters, drops it, and cancels a pending read.
    pub fn close(&self) {
        let (loop_, sock, rfut) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.rbuf.clear();
            (inner.loop_.clone(), inner.sock.take(), inner.rfut.take())
        };
        if let Some(sock) = sock {
            loop_.unregister(sock.as_raw_fd());
        }
        if let Some(fut) = rfut {
            fut.cancel_default();
        }
    }

    fn loop_handle(&self) -> EventLoop {
        self.inner.borrow().loop_.clone()
    }

    fn on_read(&self) {
        let mut package = [0u8; PACKAGE_SIZE];
        let mut inner = self.inner.borrow_mut();
        let (n, from) = {
            let sock = match inner.sock.as_ref() {
                Some(sock) => sock,
                None => return,
            };
            match sock.recv_from(&mut package) {
                Ok(received) => received,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return;
                }
                Err(e) => {
                    warn!("UDP: recv error: {}", e);
                    return;
                }
            }
        };
        let message = (Bytes::copy_from_slice(&package[..n]), from);
        if let Some(fut) = inner.rfut.take() {
            drop(inner);
            fut.set_result(message);
        } else {
            inner.rbuf.push_back(message);
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Event-handler trait implementation for [UdpClient].
impl EventHandler for UdpClient {
    fn on_event(&self, _fd: RawFd, events: EventFlags) {
        if events.contains(EventFlags::READ) {
            self.on_read();
        }
        if events.contains(EventFlags::ERROR) {
            warn!("UDP: socket error");
            let rfut = self.inner.borrow_mut().rfut.take();
            if let Some(fut) = rfut {
                fut.cancel(Fail::ConnectionClosed {
                    by: "[::]:0".to_string(),
                    reason: "socket error".to_string(),
                });
            }
            self.close();
        }
    }
}
