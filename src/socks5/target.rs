use super::*;

/// A destination taken from a CONNECT request, before resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Socks5Target {
    V4(SocketAddrV4),
    Domain(String),
}

impl Display for Socks5Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4(s) => s.fmt(f),
            Self::Domain(s) => s.fmt(f),
        }
    }
}

impl Socks5Target {
    /// `data` holds the 4 address bytes followed by the big-endian port.
    pub(super) fn parse_ipv4(data: &[u8]) -> Self {
        Self::V4(SocketAddrV4::new(
            Ipv4Addr::new(data[0], data[1], data[2], data[3]),
            u16::from_be_bytes([data[4], data[5]]),
        ))
    }

    /// `data` holds the length-prefixed domain name followed by the port.
    pub(super) fn try_parse_domain(data: &[u8]) -> Result<Self> {
        let len = data.len();
        let domain = match String::from_utf8(data[1..len - 2].into()) {
            Ok(s) => s,
            Err(e) => return Err(format!("Invalid Domain: {}!", e).into()),
        };
        let port = u16::from_be_bytes([data[len - 2], data[len - 1]]).to_string();
        Ok(Self::Domain(domain + ":" + &port))
    }
}
