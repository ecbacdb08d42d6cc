// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Non-blocking socket plumbing shared by the stream, datagram, and server
//! handlers. Sockets are created through `libc` so that options (reuse,
//! backlog) and the non-blocking flag are set before `bind`, then handed to
//! the standard-library wrappers for I/O.

use crate::fail::Fail;

use std::{
    io,
    mem,
    net::{SocketAddr, TcpListener, UdpSocket},
    os::unix::io::{FromRawFd, RawFd},
};

//==============================================================================
// Free Functions
//==============================================================================

fn family(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

/// Converts a socket address into its C representation.
fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in)
            };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6)
            };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Creates a non-blocking, close-on-exec socket.
fn nonblocking_socket(
    addr: &SocketAddr,
    socktype: libc::c_int,
    reuse_addr: bool,
) -> Result<RawFd, Fail> {
    let fd = unsafe {
        libc::socket(
            family(addr),
            socktype | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Fail::last_os_error());
    }
    if reuse_addr {
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = Fail::last_os_error();
            close_fd(fd);
            return Err(e);
        }
    }
    Ok(fd)
}

fn bind_fd(fd: RawFd, addr: &SocketAddr) -> Result<(), Fail> {
    let (storage, len) = to_sockaddr(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        return Err(Fail::last_os_error());
    }
    Ok(())
}

/// Creates a bound, listening, non-blocking TCP socket.
pub(crate) fn create_listener(
    addr: SocketAddr,
    backlog: i32,
    reuse_addr: bool,
) -> Result<TcpListener, Fail> {
    let fd = nonblocking_socket(&addr, libc::SOCK_STREAM, reuse_addr)?;
    if let Err(e) = bind_fd(fd, &addr) {
        close_fd(fd);
        return Err(e);
    }
    let rc = unsafe { libc::listen(fd, backlog) };
    if rc < 0 {
        let e = Fail::last_os_error();
        close_fd(fd);
        return Err(e);
    }
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

/// Creates a bound, non-blocking UDP socket.
pub(crate) fn create_dgram(addr: SocketAddr, reuse_addr: bool) -> Result<UdpSocket, Fail> {
    let fd = nonblocking_socket(&addr, libc::SOCK_DGRAM, reuse_addr)?;
    if let Err(e) = bind_fd(fd, &addr) {
        close_fd(fd);
        return Err(e);
    }
    Ok(unsafe { UdpSocket::from_raw_fd(fd) })
}

/// Starts a non-blocking connect. The caller waits for WRITE readiness and
/// then checks `SO_ERROR` to learn the outcome.
pub(crate) fn start_connect(addr: SocketAddr) -> Result<RawFd, Fail> {
    let fd = nonblocking_socket(&addr, libc::SOCK_STREAM, false)?;
    let (storage, len) = to_sockaddr(&addr);
    let rc = unsafe {
        libc::connect(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::EINPROGRESS) {
            close_fd(fd);
            return Err(e.into());
        }
    }
    Ok(fd)
}

/// Reads and clears the pending error on a socket.
pub(crate) fn take_socket_error(fd: RawFd) -> Result<(), Fail> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(Fail::last_os_error());
    }
    if err != 0 {
        return Err(Fail::Os { errno: err });
    }
    Ok(())
}

pub(crate) fn close_fd(fd: RawFd) {
    let _ = unsafe { libc::close(fd) };
}
