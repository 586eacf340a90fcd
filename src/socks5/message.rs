use super::*;

/// A decoded method-negotiation greeting: `VER NMETHODS METHODS...`.
pub struct Greeting {
    pub len: usize,
    pub accept: bool,
}

/// A decoded CONNECT request, or the reply code it must be refused with.
pub enum Request {
    Connect { len: usize, target: Socks5Target },
    Invalid(Reply),
}

/// Decodes the greeting from the buffered bytes, `None` if the message is
/// still incomplete.
///
/// The greeting is acceptable when the version matches and the client offers
/// the no-authentication method; a version mismatch and a missing method are
/// both answered with the same `0xff` reply.
pub fn decode_greeting(buf: &[u8]) -> Option<Greeting> {
    if buf.len() < 2 {
        return None;
    }

    let len = 2 + buf[1] as usize;
    if buf.len() < len {
        return None;
    }

    Some(Greeting {
        len,
        accept: buf[0] == VERSION && buf[2..len].contains(&METHOD_NO_AUTH),
    })
}

/// Decodes the request from the buffered bytes, `None` if the message is
/// still incomplete: `VER CMD RSV ATYP DST.ADDR DST.PORT`.
///
/// Version, command and address type are checked in that order as soon as the
/// fixed header is buffered. The frame length depends on the address type, so
/// an unsupported type is refused without waiting for the rest.
pub fn decode_request(buf: &[u8]) -> Option<Request> {
    if buf.len() < 4 {
        return None;
    }

    if buf[0] != VERSION {
        return Some(Request::Invalid(Reply::ProtocolError));
    }
    if buf[1] != CMD_CONNECT {
        return Some(Request::Invalid(Reply::CommandNotSupported));
    }

    let len = match buf[3] {
        ATYP_V4 => 10,
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return None;
            }
            7 + buf[4] as usize
        }
        _ => return Some(Request::Invalid(Reply::AddressTypeNotSupported)),
    };

    if buf.len() < len {
        return None;
    }

    let target = match buf[3] {
        ATYP_V4 => Socks5Target::parse_ipv4(&buf[4..len]),
        _ => match Socks5Target::try_parse_domain(&buf[4..len]) {
            Ok(target) => target,
            Err(_) => return Some(Request::Invalid(Reply::NetworkUnavailable)),
        },
    };

    Some(Request::Connect { len, target })
}

/// The 2-byte method-selection reply.
pub fn encode_method(method: u8) -> [u8; 2] {
    [VERSION, method]
}

/// The 10-byte request reply: `VER REP RSV ATYP BND.ADDR BND.PORT`.
///
/// The bound address is always the proxy's own listening address, for
/// failure replies as well as for success.
pub fn encode_reply(reply: Reply, bind: SocketAddrV4) -> [u8; 10] {
    let ip = bind.ip().octets();
    let port = bind.port().to_be_bytes();
    [
        VERSION,
        reply as u8,
        0x00,
        ATYP_V4,
        ip[0],
        ip[1],
        ip[2],
        ip[3],
        port[0],
        port[1],
    ]
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn greeting_incremental() {
        let msg = [0x05, 0x02, 0x00, 0x01];
        for n in 0..msg.len() {
            assert!(decode_greeting(&msg[..n]).is_none());
        }

        let greeting = decode_greeting(&msg).unwrap();
        assert_eq!(greeting.len, 4);
        assert!(greeting.accept);
    }

    #[test]
    fn greeting_no_acceptable_method() {
        let greeting = decode_greeting(&[0x05, 0x01, 0x02]).unwrap();
        assert!(!greeting.accept);
    }

    #[test]
    fn greeting_bad_version() {
        let greeting = decode_greeting(&[0x04, 0x01, 0x00]).unwrap();
        assert!(!greeting.accept);
    }

    #[test]
    fn request_ipv4() {
        let msg = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90];
        for n in 0..msg.len() {
            assert!(decode_request(&msg[..n]).is_none());
        }

        match decode_request(&msg) {
            Some(Request::Connect { len, target }) => {
                assert_eq!(len, 10);
                match target {
                    Socks5Target::V4(s) => {
                        assert_eq!(*s.ip(), Ipv4Addr::new(127, 0, 0, 1));
                        assert_eq!(s.port(), 8080);
                    }
                    _ => panic!("expected an ipv4 target"),
                }
            }
            _ => panic!("expected a connect request"),
        }
    }

    #[test]
    fn request_domain() {
        let mut msg = vec![0x05, 0x01, 0x00, 0x03, 0x0b];
        msg.extend_from_slice(b"example.com");
        msg.extend_from_slice(&443u16.to_be_bytes());

        for n in 0..msg.len() {
            assert!(decode_request(&msg[..n]).is_none());
        }

        match decode_request(&msg) {
            Some(Request::Connect { len, target }) => {
                assert_eq!(len, msg.len());
                assert_eq!(target.to_string(), "example.com:443");
            }
            _ => panic!("expected a connect request"),
        }
    }

    #[test]
    fn request_bad_version() {
        match decode_request(&[0x04, 0x01, 0x00, 0x01]) {
            Some(Request::Invalid(reply)) => assert_eq!(reply, Reply::ProtocolError),
            _ => panic!("expected a refusal"),
        }
    }

    #[test]
    fn request_unsupported_command() {
        match decode_request(&[0x05, 0x02, 0x00, 0x01]) {
            Some(Request::Invalid(reply)) => assert_eq!(reply, Reply::CommandNotSupported),
            _ => panic!("expected a refusal"),
        }
    }

    #[test]
    fn request_unsupported_atyp() {
        match decode_request(&[0x05, 0x01, 0x00, 0x04]) {
            Some(Request::Invalid(reply)) => assert_eq!(reply, Reply::AddressTypeNotSupported),
            _ => panic!("expected a refusal"),
        }
    }

    #[test]
    fn reply_encoding() {
        let bind = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 1080);
        assert_eq!(
            encode_reply(Reply::Success, bind),
            [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]
        );
        assert_eq!(
            encode_reply(Reply::NetworkUnavailable, bind)[1],
            Reply::NetworkUnavailable as u8
        );
        assert_eq!(encode_method(METHOD_UNACCEPTABLE), [0x05, 0xff]);
    }
}
