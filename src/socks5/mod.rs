use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::Result;

pub use self::{
    message::{decode_greeting, decode_request, encode_method, encode_reply, Greeting, Request},
    target::Socks5Target,
};

mod message;
mod target;

pub const VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_UNACCEPTABLE: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_V4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_V6: u8 = 0x04;

/// REP field values of the request reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Success = 0x00,
    CommandNotSupported = 0x02,
    NetworkUnavailable = 0x03,
    HostUnavailable = 0x04,
    ConnectionFailure = 0x05,
    ProtocolError = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let desc = match self {
            Self::Success => "succeeded",
            Self::CommandNotSupported => "command not supported",
            Self::NetworkUnavailable => "network unreachable",
            Self::HostUnavailable => "host unreachable",
            Self::ConnectionFailure => "connection refused",
            Self::ProtocolError => "protocol error",
            Self::AddressTypeNotSupported => "address type not supported",
        };
        desc.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes() {
        assert_eq!(Reply::Success as u8, 0x00);
        assert_eq!(Reply::CommandNotSupported as u8, 0x02);
        assert_eq!(Reply::NetworkUnavailable as u8, 0x03);
        assert_eq!(Reply::HostUnavailable as u8, 0x04);
        assert_eq!(Reply::ConnectionFailure as u8, 0x05);
        assert_eq!(Reply::ProtocolError as u8, 0x07);
        assert_eq!(Reply::AddressTypeNotSupported as u8, 0x08);
    }
}
