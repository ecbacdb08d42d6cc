// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{
    collections::BufferDeque,
    event_loop::{EventFlags, EventHandler, EventLoop, Timer},
    fail::Fail,
    future::Oneshot,
    utils,
};

use bytes::Bytes;

use std::{
    cell::RefCell,
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    os::unix::io::{AsRawFd, FromRawFd, RawFd},
    rc::Rc,
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Largest slice moved through the socket per call.
const CHUNK_SIZE: usize = 65535;

/// Default cap on the coalesced read buffer for delimited reads.
pub const DEFAULT_MAX_READ: usize = 65535;

/// Non-blocking buffered TCP byte stream.
///
/// Reads and writes go through chunk deques so that no byte is copied more
/// than the coalescing demands. A connection admits at most one pending
/// reader and one pending writer at a time; violating that is a programming
/// error. All reads optionally carry a deadline that closes the connection
/// and fails the pending future with [Fail::Timeout].
#[derive(Clone)]
pub struct StreamConnection {
    inner: Rc<RefCell<StreamInner>>,
}

struct StreamInner {
    loop_: EventLoop,
    sock: Option<TcpStream>,
    peer: SocketAddr,
    rbuf: BufferDeque,
    rfut: Option<Oneshot<Bytes>>,
    wbuf: BufferDeque,
    wfut: Option<Oneshot<usize>>,
    closed: bool,
}

/// Resolves a pending non-blocking connect on WRITE readiness.
struct ConnectHandler {
    future: Oneshot<()>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [StreamConnection].
impl StreamConnection {
    /// Wraps an accepted or connected socket and registers it with the loop.
    pub fn new(loop_: &EventLoop, sock: TcpStream, peer: SocketAddr) -> Result<Self, Fail> {
        sock.set_nonblocking(true)?;
        let conn = Self {
            inner: Rc::new(RefCell::new(StreamInner {
                loop_: loop_.clone(),
                sock: Some(sock),
                peer,
                rbuf: BufferDeque::new(),
                rfut: None,
                wbuf: BufferDeque::new(),
                wfut: None,
                closed: false,
            })),
        };
        conn.register_interest()?;
        Ok(conn)
    }

    /// Opens a connection to `addr`, waiting at most `timeout` for the
    /// three-way handshake.
    pub async fn connect(
        loop_: &EventLoop,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<Self, Fail> {
        let fd = utils::start_connect(addr)?;
        let future: Oneshot<()> = Oneshot::new();
        let handler = Rc::new(ConnectHandler {
            future: future.clone(),
        });
        if let Err(e) = loop_.register(fd, EventFlags::WRITE | EventFlags::ERROR, handler) {
            utils::close_fd(fd);
            return Err(e);
        }
        let timer = timeout.map(|t| {
            let f = future.clone();
            loop_.call_later(t, move || f.cancel(Fail::Timeout {}))
        });
        let result = future.await;
        if let Some(timer) = &timer {
            loop_.cancel_timer(timer);
        }
        loop_.unregister(fd);
        match result {
            Ok(()) => {
                debug!("TCP: connected to {}", addr);
                let sock = unsafe { TcpStream::from_raw_fd(fd) };
                Self::new(loop_, sock, addr)
            }
            Err(e) => {
                utils::close_fd(fd);
                Err(e)
            }
        }
    }

    /// Returns the peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.borrow().peer
    }

    /// Returns `true` once the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Reads up to and including the first occurrence of `delimiter`.
    ///
    /// Fails with a connection-closed error carrying the reason
    /// `"Entity Too Large"` when the coalesced head of the read buffer
    /// reaches `max_bytes` without a match.
    pub async fn read_until(&self, delimiter: &[u8], max_bytes: usize) -> Result<Bytes, Fail> {
        self.read_until_deadline(delimiter, max_bytes, None).await
    }

    /// [read_until](StreamConnection::read_until) with a deadline.
    pub async fn read_until_timeout(
        &self,
        delimiter: &[u8],
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Bytes, Fail> {
        self.read_until_deadline(delimiter, max_bytes, Some(Instant::now() + timeout))
            .await
    }

    /// Reads exactly `n` bytes, satisfying from the buffer first.
    pub async fn read_exact(&self, n: usize) -> Result<Bytes, Fail> {
        self.read_exact_deadline(n, None).await
    }

    /// [read_exact](StreamConnection::read_exact) with a deadline.
    pub async fn read_exact_timeout(&self, n: usize, timeout: Duration) -> Result<Bytes, Fail> {
        self.read_exact_deadline(n, Some(Instant::now() + timeout)).await
    }

    /// Returns the next available chunk: the coalesced buffer head if any
    /// bytes are buffered, else whatever the socket delivers next.
    pub async fn read_forever(&self, timeout: Option<Duration>) -> Result<Bytes, Fail> {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.rbuf.is_empty() {
                return Ok(inner.rbuf.pop_all());
            }
        }
        let chunk = self.read_chunk(timeout).await?;
        if chunk.is_empty() {
            let peer = self.peer_addr();
            self.close();
            return Err(Fail::closed_by(peer));
        }
        Ok(chunk)
    }

    /// Queues `data` for sending and returns a future that resolves with the
    /// bytes sent by the handler call that drained the write buffer.
    pub fn write(&self, data: Bytes) -> Oneshot<usize> {
        let future: Oneshot<usize> = Oneshot::new();
        let empty = data.is_empty();
        {
            let mut inner = self.inner.borrow_mut();
            assert!(!inner.closed, "write on closed connection");
            assert!(inner.wfut.is_none(), "concurrent write on connection");
            if !empty {
                inner.wbuf.push_back(data);
                inner.wfut = Some(future.clone());
            }
        }
        if empty {
            let f = future.clone();
            self.loop_handle().call_soon(move || f.set_result(0));
            return future;
        }
        if let Err(e) = self.register_interest() {
            self.inner.borrow_mut().wfut.take();
            future.cancel(e);
        }
        future
    }

    /// Closes the connection: unregisters, drops the socket, clears both
    /// buffers, and cancels any outstanding read or write future. Idempotent.
    pub fn close(&self) {
        let (loop_, sock, rfut, wfut, peer) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.rbuf.clear();
            inner.wbuf.clear();
            (
                inner.loop_.clone(),
                inner.sock.take(),
                inner.rfut.take(),
                inner.wfut.take(),
                inner.peer,
            )
        };
        if let Some(sock) = sock {
            loop_.unregister(sock.as_raw_fd());
        }
        if let Some(fut) = rfut {
            fut.cancel(Fail::closed_by(peer));
        }
        if let Some(fut) = wfut {
            fut.cancel(Fail::closed_by(peer));
        }
    }

    async fn read_until_deadline(
        &self,
        delimiter: &[u8],
        max_bytes: usize,
        deadline: Option<Instant>,
    ) -> Result<Bytes, Fail> {
        assert!(!delimiter.is_empty(), "empty read delimiter");
        loop {
            {
                let mut inner = self.inner.borrow_mut();
                if !inner.rbuf.is_empty() {
                    inner.rbuf.merge_prefix(max_bytes);
                    let (pos, head_len) = {
                        let head = inner.rbuf.front().unwrap();
                        (find(head, delimiter), head.len())
                    };
                    if let Some(pos) = pos {
                        let end = pos + delimiter.len();
                        return Ok(inner.rbuf.pop_prefix(end));
                    }
                    if head_len >= max_bytes {
                        return Err(Fail::entity_too_large());
                    }
                }
            }
            let chunk = self.read_chunk(self.remaining(deadline)?).await?;
            if chunk.is_empty() {
                let peer = self.peer_addr();
                self.close();
                return Err(Fail::closed_by(peer));
            }
            self.inner.borrow_mut().rbuf.push_back(chunk);
        }
    }

    async fn read_exact_deadline(
        &self,
        n: usize,
        deadline: Option<Instant>,
    ) -> Result<Bytes, Fail> {
        if n == 0 {
            return Ok(Bytes::new());
        }
        loop {
            {
                let mut inner = self.inner.borrow_mut();
                if inner.rbuf.len() >= n {
                    return Ok(inner.rbuf.pop_prefix(n));
                }
            }
            let chunk = self.read_chunk(self.remaining(deadline)?).await?;
            if chunk.is_empty() {
                let peer = self.peer_addr();
                self.close();
                return Err(Fail::closed_by(peer));
            }
            self.inner.borrow_mut().rbuf.push_back(chunk);
        }
    }

    /// Waits for the next chunk off the socket, guarded by an optional timer
    /// that fails the read and closes the connection.
    async fn read_chunk(&self, timeout: Option<Duration>) -> Result<Bytes, Fail> {
        let future = self.read_from_fd()?;
        let timer: Option<Timer> = timeout.map(|t| {
            let fut = future.clone();
            let conn = self.clone();
            self.loop_handle().call_later(t, move || {
                fut.cancel(Fail::Timeout {});
                conn.close();
            })
        });
        let result = future.await;
        if let Some(timer) = &timer {
            self.loop_handle().cancel_timer(timer);
        }
        result
    }

    /// Parks a read future for the readable handler to resolve.
    fn read_from_fd(&self) -> Result<Oneshot<Bytes>, Fail> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(Fail::closed_by(inner.peer));
        }
        assert!(inner.rfut.is_none(), "concurrent read on connection");
        let future = Oneshot::new();
        inner.rfut = Some(future.clone());
        Ok(future)
    }

    /// Time left until `deadline`; an expired deadline closes the connection.
    fn remaining(&self, deadline: Option<Instant>) -> Result<Option<Duration>, Fail> {
        match deadline {
            None => Ok(None),
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    self.close();
                    return Err(Fail::Timeout {});
                }
                Ok(Some(deadline - now))
            }
        }
    }

    /// (Re)registers the socket with READ interest, plus WRITE while the
    /// write buffer is non-empty.
    fn register_interest(&self) -> Result<(), Fail> {
        let (loop_, fd, flags) = {
            let inner = self.inner.borrow();
            let sock = match inner.sock.as_ref() {
                Some(sock) if !inner.closed => sock,
                _ => return Ok(()),
            };
            let mut flags = EventFlags::READ | EventFlags::ERROR;
            if !inner.wbuf.is_empty() {
                flags |= EventFlags::WRITE;
            }
            (inner.loop_.clone(), sock.as_raw_fd(), flags)
        };
        loop_.register(fd, flags, Rc::new(self.clone()))
    }

    fn loop_handle(&self) -> EventLoop {
        self.inner.borrow().loop_.clone()
    }

    /// Readable: one `recv` of up to [CHUNK_SIZE] bytes. Zero bytes is EOF,
    /// handed to a waiting reader as empty bytes so that the coroutine can
    /// surface the closed connection; with no reader waiting, EOF closes.
    fn on_read(&self) {
        let mut chunk = [0u8; CHUNK_SIZE];
        let mut inner = self.inner.borrow_mut();
        let n = {
            let mut sock = match inner.sock.as_ref() {
                Some(sock) => sock,
                None => return,
            };
            match sock.read(&mut chunk) {
                Ok(n) => n,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return;
                }
                Err(e) => {
                    // Hard receive errors degrade to the EOF path.
                    warn!("TCP: read error on {}: {}", inner.peer, e);
                    0
                }
            }
        };
        if let Some(fut) = inner.rfut.take() {
            drop(inner);
            fut.set_result(Bytes::copy_from_slice(&chunk[..n]));
        } else if n == 0 {
            drop(inner);
            self.close();
        } else {
            inner.rbuf.push_back(Bytes::copy_from_slice(&chunk[..n]));
        }
    }

    /// Writable: send coalesced head chunks until the buffer drains or the
    /// socket pushes back, then resolve the write future with the bytes sent
    /// by this call.
    fn on_write(&self) {
        let mut total: usize = 0;
        let mut error: Option<Fail> = None;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed || inner.sock.is_none() {
                return;
            }
            inner.wbuf.merge_prefix(CHUNK_SIZE);
            while !inner.wbuf.is_empty() {
                let head = inner.wbuf.front().unwrap().clone();
                let result = {
                    let mut sock = inner.sock.as_ref().unwrap();
                    sock.write(&head)
                };
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        inner.wbuf.pop_prefix(n);
                        total += n;
                    }
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted
                            || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        break;
                    }
                    Err(e) => {
                        error = Some(e.into());
                        break;
                    }
                }
            }
        }
        if let Some(e) = error {
            warn!("TCP: write error on {}: {}", self.peer_addr(), e);
            let wfut = self.inner.borrow_mut().wfut.take();
            if let Some(fut) = wfut {
                fut.cancel(e);
            }
            self.close();
            return;
        }
        let finished = {
            let mut inner = self.inner.borrow_mut();
            if inner.wbuf.is_empty() {
                inner.wfut.take()
            } else {
                None
            }
        };
        if let Some(fut) = finished {
            fut.set_result(total);
        }
    }

    /// Socket error: fail both pending futures and close.
    fn on_error(&self) {
        let peer = self.peer_addr();
        let err = {
            let inner = self.inner.borrow();
            match inner.sock.as_ref().and_then(|s| s.take_error().ok()).flatten() {
                Some(e) => Fail::from(e),
                None => Fail::ConnectionClosed {
                    by: peer.to_string(),
                    reason: "socket error".to_string(),
                },
            }
        };
        warn!("TCP: socket error on {}: {}", peer, err);
        let (rfut, wfut) = {
            let mut inner = self.inner.borrow_mut();
            (inner.rfut.take(), inner.wfut.take())
        };
        if let Some(fut) = rfut {
            fut.cancel(err.clone());
        }
        if let Some(fut) = wfut {
            fut.cancel(err);
        }
        self.close();
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Event-handler trait implementation for [StreamConnection].
impl EventHandler for StreamConnection {
    fn on_event(&self, _fd: RawFd, events: EventFlags) {
        if events.contains(EventFlags::ERROR) {
            self.on_error();
            return;
        }
        if events.contains(EventFlags::READ) {
            self.on_read();
        }
        if events.contains(EventFlags::WRITE) {
            self.on_write();
        }
        if !self.is_closed() {
            // Interest may have changed as the write buffer drained.
            if let Err(e) = self.register_interest() {
                warn!("TCP: re-register failed on {}: {}", self.peer_addr(), e);
                self.close();
            }
        }
    }
}

/// Event-handler trait implementation for [ConnectHandler].
impl EventHandler for ConnectHandler {
    fn on_event(&self, fd: RawFd, events: EventFlags) {
        match utils::take_socket_error(fd) {
            Err(e) => self.future.cancel(e),
            Ok(()) if events.contains(EventFlags::WRITE) => self.future.set_result(()),
            Ok(()) if events.contains(EventFlags::ERROR) => self.future.cancel(Fail::Os {
                errno: libc::ECONNREFUSED,
            }),
            Ok(()) => (),
        }
    }
}

//==============================================================================
// Free Functions
//==============================================================================

/// Finds the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::find;

    /// Tests delimiter search over chunk contents.
    #[test]
    fn find_delimiter() {
        assert_eq!(find(b"hello\r\nworld", b"\r\n"), Some(5));
        assert_eq!(find(b"hello", b"\r\n"), None);
        assert_eq!(find(b"\r\n", b"\r\n"), Some(0));
        assert_eq!(find(b"x", b"\r\n"), None);
    }
}
