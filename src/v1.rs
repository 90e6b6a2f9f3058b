use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::str::{from_utf8, FromStr};

use crate::{Addresses, Command, Error, Header, Protocol, Version};

// Maximum line length including CRLF, per the protocol text.
const MAX_LINE: usize = 107;
const SIGNATURE: &[u8] = b"PROXY";

fn parse_ip<T: FromStr>(token: &[u8]) -> Result<T, Error> {
    from_utf8(token)
        .map_err(|_| Error::InvalidAddress)
        .and_then(|s| T::from_str(s).map_err(|_| Error::InvalidAddress))
}

fn parse_port(token: &[u8]) -> Result<u16, Error> {
    if token.is_empty() || !token.iter().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidPortNumber);
    }

    let s = from_utf8(token).map_err(|_| Error::InvalidPortNumber)?;
    let port = u32::from_str(s).map_err(|_| Error::InvalidPortNumber)?;
    if port > u16::MAX as u32 {
        return Err(Error::InvalidPortNumber);
    }
    Ok(port as u16)
}

fn parse_addrs<'a, T: FromStr>(
    mut tokens: impl Iterator<Item = &'a [u8]>,
) -> Result<(T, T, u16, u16), Error> {
    let src_ip = parse_ip::<T>(tokens.next().ok_or(Error::UnknownFamily)?)?;
    let dst_ip = parse_ip::<T>(tokens.next().ok_or(Error::UnknownFamily)?)?;
    let src_port = parse_port(tokens.next().ok_or(Error::UnknownFamily)?)?;
    let dst_port = parse_port(tokens.next().ok_or(Error::UnknownFamily)?)?;
    if tokens.next().is_some() {
        return Err(Error::UnknownFamily);
    }

    Ok((src_ip, dst_ip, src_port, dst_port))
}

/// Decode a version 1 header from a buffer.
///
/// Returns the decoded header and the number of bytes consumed.
pub(crate) fn decode(buf: &[u8]) -> Result<(Header, usize), Error> {
    let n = buf.len().min(SIGNATURE.len());
    if buf[..n] != SIGNATURE[..n] {
        return Err(Error::NoProxyProtocol);
    }
    if buf.len() < SIGNATURE.len() {
        return Err(Error::Incomplete);
    }

    let line_end = match buf.iter().position(|&b| b == b'\n') {
        Some(i) if i >= MAX_LINE => return Err(Error::V1HeaderTooLong),
        Some(i) => i,
        None if buf.len() >= MAX_LINE => return Err(Error::V1HeaderTooLong),
        None => return Err(Error::Incomplete),
    };
    if buf[line_end - 1] != b'\r' {
        return Err(Error::MissingCrlf);
    }

    let consumed = line_end + 1;
    let mut tokens = buf[..line_end - 1].split(|&b| b == b' ');

    if tokens.next() != Some(SIGNATURE) {
        return Err(Error::NoProxyProtocol);
    }

    let addresses = match tokens.next().ok_or(Error::UnknownFamily)? {
        b"TCP4" => {
            let (src_ip, dst_ip, src_port, dst_port) = parse_addrs::<Ipv4Addr>(tokens)?;
            Addresses::IPv4 {
                source: SocketAddrV4::new(src_ip, src_port),
                destination: SocketAddrV4::new(dst_ip, dst_port),
            }
        }
        b"TCP6" => {
            let (src_ip, dst_ip, src_port, dst_port) = parse_addrs::<Ipv6Addr>(tokens)?;
            Addresses::IPv6 {
                source: SocketAddrV6::new(src_ip, src_port, 0, 0),
                destination: SocketAddrV6::new(dst_ip, dst_port, 0, 0),
            }
        }
        // Anything after UNKNOWN up to CRLF is consumed and ignored, even
        // tokens that would not parse as addresses or ports.
        b"UNKNOWN" => {
            let header = Header::parsed(
                Version::V1,
                Command::Local,
                Protocol::Unspecified,
                Addresses::Unspecified,
                Vec::new(),
            );
            return Ok((header, consumed));
        }
        _ => return Err(Error::UnknownFamily),
    };

    let header = Header::parsed(
        Version::V1,
        Command::Proxy,
        Protocol::Stream,
        addresses,
        Vec::new(),
    );

    Ok((header, consumed))
}

pub(crate) fn encode(header: &Header, buf: &mut Vec<u8>) {
    let line = match (header.protocol, &header.addresses) {
        (
            Protocol::Stream,
            Addresses::IPv4 {
                source,
                destination,
            },
        ) => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            source.ip(),
            destination.ip(),
            source.port(),
            destination.port()
        ),
        (
            Protocol::Stream,
            Addresses::IPv6 {
                source,
                destination,
            },
        ) => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            source.ip(),
            destination.ip(),
            source.port(),
            destination.port()
        ),
        _ => "PROXY UNKNOWN\r\n".to_owned(),
    };

    buf.extend_from_slice(line.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParseConfig;

    fn parse(buf: &[u8]) -> Result<(Header, usize), Error> {
        Header::parse(buf, ParseConfig::default())
    }

    #[test]
    fn decode_tcp4_with_payload() {
        let buf = b"PROXY TCP4 192.168.1.1 192.168.1.2 12345 443\r\nGET /";
        let (header, consumed) = parse(buf).unwrap();

        assert_eq!(header.version, Version::V1);
        assert_eq!(header.command, Command::Proxy);
        assert_eq!(header.protocol, Protocol::Stream);
        assert_eq!(
            header.addresses.source(),
            Some("192.168.1.1:12345".parse().unwrap())
        );
        assert_eq!(
            header.addresses.destination(),
            Some("192.168.1.2:443".parse().unwrap())
        );
        assert_eq!(&buf[consumed..], b"GET /");
    }

    #[test]
    fn decode_tcp6() {
        let buf = b"PROXY TCP6 2001:db8::1 ::1 12345 443\r\n";
        let (header, consumed) = parse(buf).unwrap();

        assert_eq!(consumed, buf.len());
        assert_eq!(
            header.addresses.source(),
            Some("[2001:db8::1]:12345".parse().unwrap())
        );
        assert_eq!(header.addresses.destination(), Some("[::1]:443".parse().unwrap()));
    }

    #[test]
    fn decode_unknown_ignores_trailing_garbage() {
        // out-of-range ports after UNKNOWN must not be an error
        let buf = b"PROXY UNKNOWN 10.0.0.1 10.0.0.2 99999 99999\r\n";
        let (header, consumed) = parse(buf).unwrap();

        assert_eq!(consumed, buf.len());
        assert_eq!(header.command, Command::Local);
        assert_eq!(header.protocol, Protocol::Unspecified);
        assert!(header.addresses.is_unspecified());

        let (header, _) = parse(b"PROXY UNKNOWN\r\n").unwrap();
        assert!(header.addresses.is_unspecified());
    }

    #[test]
    fn decode_family_mismatch() {
        assert_eq!(
            parse(b"PROXY TCP6 192.168.1.1 192.168.1.2 1 2\r\n").unwrap_err(),
            Error::InvalidAddress
        );
        assert_eq!(
            parse(b"PROXY TCP4 2001:db8::1 2001:db8::2 1 2\r\n").unwrap_err(),
            Error::InvalidAddress
        );
    }

    #[test]
    fn decode_bad_ports() {
        assert_eq!(
            parse(b"PROXY TCP4 10.0.0.1 10.0.0.2 65536 443\r\n").unwrap_err(),
            Error::InvalidPortNumber
        );
        assert_eq!(
            parse(b"PROXY TCP4 10.0.0.1 10.0.0.2 12345 -1\r\n").unwrap_err(),
            Error::InvalidPortNumber
        );
        assert_eq!(
            parse(b"PROXY TCP4 10.0.0.1 10.0.0.2 abc 443\r\n").unwrap_err(),
            Error::InvalidPortNumber
        );
    }

    #[test]
    fn decode_bad_family_token() {
        assert_eq!(
            parse(b"PROXY UDP4 10.0.0.1 10.0.0.2 1 2\r\n").unwrap_err(),
            Error::UnknownFamily
        );
        assert_eq!(parse(b"PROXY \r\n").unwrap_err(), Error::UnknownFamily);
    }

    #[test]
    fn decode_wrong_token_count() {
        assert_eq!(
            parse(b"PROXY TCP4 10.0.0.1 10.0.0.2 1\r\n").unwrap_err(),
            Error::UnknownFamily
        );
        assert_eq!(
            parse(b"PROXY TCP4 10.0.0.1 10.0.0.2 1 2 3\r\n").unwrap_err(),
            Error::UnknownFamily
        );
    }

    #[test]
    fn decode_requires_crlf() {
        assert_eq!(
            parse(b"PROXY UNKNOWN\n").unwrap_err(),
            Error::MissingCrlf
        );
        // no terminator yet
        assert_eq!(
            parse(b"PROXY TCP4 10.0.0.1 10.0.0.2 1 2").unwrap_err(),
            Error::Incomplete
        );
        assert_eq!(parse(b"PRO").unwrap_err(), Error::Incomplete);
        assert_eq!(parse(b"PROBE /1\r\n").unwrap_err(), Error::NoProxyProtocol);
    }

    #[test]
    fn decode_line_length_cap() {
        // unterminated at 107 bytes or longer is a hard error
        let mut long = b"PROXY TCP4 10.0.0.1 10.0.0.2 1 ".to_vec();
        long.extend_from_slice(&[b'9'; 100]);
        assert_eq!(parse(&long).unwrap_err(), Error::V1HeaderTooLong);

        // LF beyond the cap is equally rejected
        long.extend_from_slice(b"\r\n");
        assert_eq!(parse(&long).unwrap_err(), Error::V1HeaderTooLong);
    }

    #[test]
    fn encode_round_trip_tcp4() {
        let header = Header::proxy(
            Version::V1,
            Protocol::Stream,
            "127.0.0.1:1234".parse().unwrap(),
            "8.8.4.4:5678".parse().unwrap(),
        );

        let buf = header.to_vec();
        assert_eq!(&buf, b"PROXY TCP4 127.0.0.1 8.8.4.4 1234 5678\r\n");

        let (decoded, consumed) = parse(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn encode_round_trip_tcp6() {
        let header = Header::proxy(
            Version::V1,
            Protocol::Stream,
            "[2001:db8::1]:1234".parse().unwrap(),
            "[::1]:5678".parse().unwrap(),
        );

        let buf = header.to_vec();
        assert_eq!(&buf, b"PROXY TCP6 2001:db8::1 ::1 1234 5678\r\n");

        let (decoded, consumed) = parse(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn encode_local_and_datagram_as_unknown() {
        let buf = Header::local(Version::V1).to_vec();
        assert_eq!(&buf, b"PROXY UNKNOWN\r\n");

        // v1 cannot express datagram transports
        let header = Header::proxy(
            Version::V1,
            Protocol::Datagram,
            "127.0.0.1:1234".parse().unwrap(),
            "8.8.4.4:5678".parse().unwrap(),
        );
        assert_eq!(&header.to_vec(), b"PROXY UNKNOWN\r\n");
    }
}
