// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

//! SOCKS5 (RFC 1928) negotiation.
//!
//! The server half runs on connections accepted by the supervisor's local
//! listener; the client half issues CONNECT through the ssh process's
//! dynamic-forward port. Only the no-authentication method and the CONNECT
//! command are supported.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_TTL_EXPIRED: u8 = 0x06;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid SOCKS version: expected 5, got {0}")]
    InvalidVersion(u8),

    #[error("No acceptable authentication method offered")]
    NoAcceptableMethod,

    #[error("Unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Domain name too long ({0} bytes)")]
    DomainTooLong(usize),

    #[error("Upstream proxy refused the request (reply {0:#04x})")]
    Refused(u8),
}

/// SOCKS5 target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl SocksAddr {
    /// Unspecified IPv4 address, used in failure replies
    pub fn unspecified() -> Self {
        SocksAddr::Ipv4(Ipv4Addr::UNSPECIFIED, 0)
    }

    pub fn port(&self) -> u16 {
        match self {
            SocksAddr::Ipv4(_, port) | SocksAddr::Ipv6(_, port) | SocksAddr::Domain(_, port) => {
                *port
            }
        }
    }

    /// Wire encoding: ATYP | address | port
    pub fn encode(&self) -> Result<Vec<u8>, SocksError> {
        let mut buf = Vec::with_capacity(22);
        match self {
            SocksAddr::Ipv4(ip, port) => {
                buf.push(ADDR_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            SocksAddr::Ipv6(ip, port) => {
                buf.push(ADDR_IPV6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            SocksAddr::Domain(domain, port) => {
                let len = u8::try_from(domain.len())
                    .map_err(|_| SocksError::DomainTooLong(domain.len()))?;
                buf.push(ADDR_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(buf)
    }

    /// Open a direct TCP connection to this address
    pub async fn connect(&self) -> io::Result<TcpStream> {
        match self {
            SocksAddr::Ipv4(ip, port) => TcpStream::connect((*ip, *port)).await,
            SocksAddr::Ipv6(ip, port) => TcpStream::connect((*ip, *port)).await,
            SocksAddr::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
        }
    }
}

impl From<SocketAddr> for SocksAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => SocksAddr::Ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => SocksAddr::Ipv6(*v6.ip(), v6.port()),
        }
    }
}

impl std::fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocksAddr::Ipv4(ip, port) => write!(f, "{ip}:{port}"),
            SocksAddr::Ipv6(ip, port) => write!(f, "[{ip}]:{port}"),
            SocksAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// Server side: method selection followed by the CONNECT request.
///
/// Protocol violations that the client can be told about (unsupported
/// command or address type) are answered with the matching reply before
/// the error is returned.
pub async fn accept_connect<S>(stream: &mut S) -> Result<SocksAddr, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream).await?;

    match read_request(stream).await {
        Ok(target) => Ok(target),
        Err(e) => {
            let reply = match &e {
                SocksError::UnsupportedCommand(_) => Some(REPLY_COMMAND_NOT_SUPPORTED),
                SocksError::UnsupportedAddressType(_) => Some(REPLY_ADDRESS_TYPE_NOT_SUPPORTED),
                _ => None,
            };
            if let Some(reply) = reply {
                let _ = send_reply(stream, reply, &SocksAddr::unspecified()).await;
            }
            Err(e)
        }
    }
}

async fn negotiate_method<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;
        Ok(())
    } else {
        stream.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        Err(SocksError::NoAcceptableMethod)
    }
}

async fn read_request<S>(stream: &mut S) -> Result<SocksAddr, SocksError>
where
    S: AsyncRead + Unpin,
{
    // VER, CMD, RSV, ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(header[0]));
    }

    let cmd = header[1];
    let atyp = header[3];

    // The address is parsed even for unsupported commands so the reply
    // lands on a clean message boundary
    let addr = read_address(stream, atyp).await?;

    if cmd != CMD_CONNECT {
        return Err(SocksError::UnsupportedCommand(cmd));
    }

    Ok(addr)
}

async fn read_address<S>(stream: &mut S, atyp: u8) -> Result<SocksAddr, SocksError>
where
    S: AsyncRead + Unpin,
{
    let addr = match atyp {
        ADDR_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            SocksAddr::Ipv4(Ipv4Addr::from(ip), stream.read_u16().await?)
        }
        ADDR_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            SocksAddr::Domain(String::from_utf8_lossy(&domain).to_string(), port)
        }
        ADDR_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            SocksAddr::Ipv6(Ipv6Addr::from(ip), stream.read_u16().await?)
        }
        other => return Err(SocksError::UnsupportedAddressType(other)),
    };
    Ok(addr)
}

/// Send a reply to the client
pub async fn send_reply<S>(stream: &mut S, reply: u8, bound: &SocksAddr) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin,
{
    let mut response = vec![SOCKS_VERSION, reply, 0x00];
    response.extend(bound.encode()?);
    stream.write_all(&response).await?;
    Ok(())
}

/// Client side: ask an upstream SOCKS5 proxy to CONNECT to `target`.
///
/// On success the stream is positioned at the start of the relayed data.
pub async fn connect_via<S>(upstream: &mut S, target: &SocksAddr) -> Result<SocksAddr, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    upstream.write_all(&[SOCKS_VERSION, 1, AUTH_NONE]).await?;

    let mut choice = [0u8; 2];
    upstream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(choice[0]));
    }
    if choice[1] != AUTH_NONE {
        return Err(SocksError::NoAcceptableMethod);
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    request.extend(target.encode()?);
    upstream.write_all(&request).await?;

    let mut header = [0u8; 4];
    upstream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(header[0]));
    }
    let bound = read_address(upstream, header[3]).await?;
    if header[1] != REPLY_SUCCEEDED {
        return Err(SocksError::Refused(header[1]));
    }

    Ok(bound)
}

/// Map a connection failure to a SOCKS5 reply code
pub fn error_to_reply(error: &SocksError) -> u8 {
    match error {
        SocksError::Io(e) => match e.kind() {
            io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
            io::ErrorKind::TimedOut => REPLY_TTL_EXPIRED,
            io::ErrorKind::AddrNotAvailable => REPLY_HOST_UNREACHABLE,
            _ => REPLY_GENERAL_FAILURE,
        },
        SocksError::Refused(code) => *code,
        SocksError::UnsupportedCommand(_) => REPLY_COMMAND_NOT_SUPPORTED,
        SocksError::UnsupportedAddressType(_) => REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
        _ => REPLY_GENERAL_FAILURE,
    }
}

/// Map a plain I/O failure to a SOCKS5 reply code
pub fn io_error_to_reply(error: &io::Error) -> u8 {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        io::ErrorKind::TimedOut => REPLY_TTL_EXPIRED,
        io::ErrorKind::AddrNotAvailable => REPLY_HOST_UNREACHABLE,
        _ => REPLY_NETWORK_UNREACHABLE,
    }
}
