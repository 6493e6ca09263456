//! PROXY protocol v2 headers.
//!
//! When enabled, every backend connection starts with a v2 header carrying
//! the client address and the address the client connected to.
//!
//! Wire format:
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length
//! - variable: addresses and ports

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// PROXY protocol v2 signature (12 bytes).
const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Signature, version/command, family/transport and length.
const FIXED_LEN: usize = 16;

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

const AF_INET: u8 = 0x10;
const AF_INET6: u8 = 0x20;
const TRANSPORT_STREAM: u8 = 0x01;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Errors decoding a PROXY v2 header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header incomplete: need {needed} bytes")]
    Incomplete { needed: usize },

    #[error("missing PROXY v2 signature")]
    BadSignature,

    #[error("unsupported version/command byte {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address family byte {0:#04x}")]
    UnsupportedFamily(u8),
}

/// A PROXY v2 header for one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Client address.
    pub source: SocketAddr,
    /// Address the client connected to.
    pub destination: SocketAddr,
}

impl ProxyHeader {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Encoded size for the address family this header will use.
    pub fn encoded_len(&self) -> usize {
        match (self.source.ip(), self.destination.ip()) {
            (IpAddr::V6(_), IpAddr::V6(_)) => FIXED_LEN + IPV6_ADDR_LEN as usize,
            _ => FIXED_LEN + IPV4_ADDR_LEN as usize,
        }
    }

    /// Encode the header.
    ///
    /// Mixed families are written as IPv4, mapping IPv6 addresses that embed
    /// an IPv4 address and using `0.0.0.0` otherwise.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&SIGNATURE);
        buf.put_u8(VERSION_COMMAND_PROXY);

        match (self.source.ip(), self.destination.ip()) {
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                buf.put_u8(AF_INET6 | TRANSPORT_STREAM);
                buf.put_u16(IPV6_ADDR_LEN);
                buf.put_slice(&src.octets());
                buf.put_slice(&dst.octets());
            }
            (src, dst) => {
                buf.put_u8(AF_INET | TRANSPORT_STREAM);
                buf.put_u16(IPV4_ADDR_LEN);
                buf.put_slice(&as_v4(src).octets());
                buf.put_slice(&as_v4(dst).octets());
            }
        }
        buf.put_u16(self.source.port());
        buf.put_u16(self.destination.port());
        buf.freeze()
    }

    /// Decode a header from the front of `data`.
    ///
    /// Returns the header and the number of bytes it occupied.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), HeaderError> {
        if data.len() < FIXED_LEN {
            return Err(HeaderError::Incomplete { needed: FIXED_LEN });
        }
        if data[..12] != SIGNATURE {
            return Err(HeaderError::BadSignature);
        }
        if data[12] != VERSION_COMMAND_PROXY {
            return Err(HeaderError::UnsupportedCommand(data[12]));
        }

        let family = data[13];
        let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
        let total = FIXED_LEN + addr_len;
        if data.len() < total {
            return Err(HeaderError::Incomplete { needed: total });
        }
        let body = &data[FIXED_LEN..total];

        let header = match family {
            f if f == AF_INET | TRANSPORT_STREAM && addr_len >= IPV4_ADDR_LEN as usize => {
                let src = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let dst = Ipv4Addr::new(body[4], body[5], body[6], body[7]);
                Self::new(
                    SocketAddr::new(src.into(), u16::from_be_bytes([body[8], body[9]])),
                    SocketAddr::new(dst.into(), u16::from_be_bytes([body[10], body[11]])),
                )
            }
            f if f == AF_INET6 | TRANSPORT_STREAM && addr_len >= IPV6_ADDR_LEN as usize => {
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&body[..16]);
                dst.copy_from_slice(&body[16..32]);
                Self::new(
                    SocketAddr::new(Ipv6Addr::from(src).into(), u16::from_be_bytes([body[32], body[33]])),
                    SocketAddr::new(Ipv6Addr::from(dst).into(), u16::from_be_bytes([body[34], body[35]])),
                )
            }
            other => return Err(HeaderError::UnsupportedFamily(other)),
        };
        Ok((header, total))
    }
}

fn as_v4(ip: IpAddr) -> Ipv4Addr {
    match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => v6.to_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED),
    }
}
