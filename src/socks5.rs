// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Minimal SOCKS5 (RFC 1928) CONNECT relay built on the public runtime
//! surface: handshake and request codecs, plus a relay server that pumps
//! bytes between the client and the upstream connection.

use crate::{
    event_loop::EventLoop,
    fail::Fail,
    server::{ServerOptions, TcpServer},
    stream::StreamConnection,
};

use bytes::{BufMut, Bytes, BytesMut};

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    time::Duration,
};

//==============================================================================
// Constants & Structures
//==============================================================================

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// How long a relay waits for the upstream handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Target address of a SOCKS5 request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Socks5Addr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

/// Decoded SOCKS5 request.
#[derive(Clone, Debug)]
pub struct Socks5Request {
    pub cmd: u8,
    pub addr: Socks5Addr,
    pub port: u16,
}

/// SOCKS5 CONNECT relay server.
pub struct Socks5Server {
    tcp: TcpServer,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Socks5Addr].
impl Socks5Addr {
    /// Resolves the target to one socket address. Domain targets resolve
    /// through the system resolver.
    pub fn resolve(&self, port: u16) -> Result<SocketAddr, Fail> {
        match self {
            Socks5Addr::V4(ip) => Ok(SocketAddr::new(IpAddr::V4(*ip), port)),
            Socks5Addr::V6(ip) => Ok(SocketAddr::new(IpAddr::V6(*ip), port)),
            Socks5Addr::Domain(host) => (host.as_str(), port)
                .to_socket_addrs()
                .map_err(|_| Fail::Resolution { host: host.clone() })?
                .next()
                .ok_or(Fail::Resolution { host: host.clone() }),
        }
    }

    /// Appends the ATYP-tagged wire form of the address.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Socks5Addr::V4(ip) => {
                out.put_u8(ATYP_IPV4);
                out.put_slice(&ip.octets());
            }
            Socks5Addr::V6(ip) => {
                out.put_u8(ATYP_IPV6);
                out.put_slice(&ip.octets());
            }
            Socks5Addr::Domain(host) => {
                out.put_u8(ATYP_DOMAIN);
                out.put_u8(host.len() as u8);
                out.put_slice(host.as_bytes());
            }
        }
    }
}

/// Associate functions for [Socks5Server].
impl Socks5Server {
    /// Binds a relay on `ip:port`.
    pub fn new(
        loop_: &EventLoop,
        ip: IpAddr,
        port: u16,
        options: ServerOptions,
    ) -> Result<Self, Fail> {
        let conn_loop = loop_.clone();
        let tcp = TcpServer::new(loop_, ip, port, options, move |conn, addr| {
            handle_client(conn_loop.clone(), conn, addr)
        })?;
        Ok(Self { tcp })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.tcp.local_addr()
    }

    /// Stops accepting clients.
    pub fn close(&self) {
        self.tcp.close();
    }
}

//==============================================================================
// Free Functions
//==============================================================================

/// Performs the method negotiation. Only "no authentication" is offered.
pub async fn negotiate(conn: &StreamConnection) -> Result<(), Fail> {
    let head = conn.read_exact(2).await?;
    if head[0] != VERSION {
        return Err(Fail::Malformed {
            details: "bad socks version",
        });
    }
    let _methods = conn.read_exact(head[1] as usize).await?;
    conn.write(Bytes::from_static(&[VERSION, METHOD_NO_AUTH])).await?;
    Ok(())
}

/// Reads and decodes one SOCKS5 request.
pub async fn read_request(conn: &StreamConnection) -> Result<Socks5Request, Fail> {
    let head = conn.read_exact(4).await?;
    if head[0] != VERSION {
        return Err(Fail::Malformed {
            details: "bad socks version",
        });
    }
    let cmd = head[1];
    let (addr, port) = match head[3] {
        ATYP_IPV4 => {
            let body = conn.read_exact(6).await?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&body[..4]);
            (
                Socks5Addr::V4(Ipv4Addr::from(octets)),
                u16::from_be_bytes([body[4], body[5]]),
            )
        }
        ATYP_DOMAIN => {
            let len = conn.read_exact(1).await?[0] as usize;
            let body = conn.read_exact(len + 2).await?;
            let host = String::from_utf8_lossy(&body[..len]).into_owned();
            (
                Socks5Addr::Domain(host),
                u16::from_be_bytes([body[len], body[len + 1]]),
            )
        }
        ATYP_IPV6 => {
            let body = conn.read_exact(18).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[..16]);
            (
                Socks5Addr::V6(Ipv6Addr::from(octets)),
                u16::from_be_bytes([body[16], body[17]]),
            )
        }
        _ => {
            return Err(Fail::Malformed {
                details: "unknown address type",
            });
        }
    };
    Ok(Socks5Request { cmd, addr, port })
}

/// Encodes a reply with the given code and an all-zero bound address.
pub fn encode_reply(code: u8) -> Bytes {
    Bytes::from_static(match code {
        REP_SUCCESS => &[VERSION, REP_SUCCESS, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0],
        REP_HOST_UNREACHABLE => &[VERSION, REP_HOST_UNREACHABLE, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0],
        _ => &[VERSION, REP_COMMAND_NOT_SUPPORTED, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0],
    })
}

async fn handle_client(
    loop_: EventLoop,
    conn: StreamConnection,
    addr: SocketAddr,
) -> Result<(), Fail> {
    let result = session(&loop_, &conn, addr).await;
    conn.close();
    result
}

async fn session(
    loop_: &EventLoop,
    conn: &StreamConnection,
    addr: SocketAddr,
) -> Result<(), Fail> {
    negotiate(conn).await?;
    let request = read_request(conn).await?;
    if request.cmd != CMD_CONNECT {
        conn.write(encode_reply(REP_COMMAND_NOT_SUPPORTED)).await?;
        return Err(Fail::Unsupported {
            details: "only CONNECT is supported",
        });
    }
    let target = match request.addr.resolve(request.port) {
        Ok(target) => target,
        Err(e) => {
            let _ = conn.write(encode_reply(REP_HOST_UNREACHABLE)).await;
            return Err(e);
        }
    };
    let upstream = match StreamConnection::connect(loop_, target, Some(CONNECT_TIMEOUT)).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("SOCKS5: {} -> {} failed: {}", addr, target, e);
            let _ = conn.write(encode_reply(REP_HOST_UNREACHABLE)).await;
            return Err(e);
        }
    };
    debug!("SOCKS5: {} -> {}", addr, target);
    let result = relay(loop_, conn, &upstream).await;
    upstream.close();
    result
}

/// Confirms the tunnel and pumps bytes both ways until either side closes.
async fn relay(
    loop_: &EventLoop,
    conn: &StreamConnection,
    upstream: &StreamConnection,
) -> Result<(), Fail> {
    conn.write(encode_reply(REP_SUCCESS)).await?;
    let up = loop_.spawn(pump(conn.clone(), upstream.clone()));
    let down = loop_.spawn(pump(upstream.clone(), conn.clone()));
    let _ = up.await;
    let _ = down.await;
    Ok(())
}

/// Copies chunks from one connection to the other until either side closes,
/// then closes both so the opposite pump unblocks.
async fn pump(from: StreamConnection, to: StreamConnection) -> Result<(), Fail> {
    loop {
        let chunk = match from.read_forever(None).await {
            Ok(chunk) => chunk,
            Err(_) => break,
        };
        if to.is_closed() {
            break;
        }
        if to.write(chunk).await.is_err() {
            break;
        }
    }
    from.close();
    to.close();
    Ok(())
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Display trait implementation for [Socks5Addr].
impl fmt::Display for Socks5Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Socks5Addr::V4(ip) => write!(f, "{}", ip),
            Socks5Addr::V6(ip) => write!(f, "{}", ip),
            Socks5Addr::Domain(host) => write!(f, "{}", host),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
