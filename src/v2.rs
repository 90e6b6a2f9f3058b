use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use crate::{Addresses, Command, Error, Header, ParseConfig, Protocol, UnixAddr, Version};

pub(crate) const SIGNATURE: &[u8] = b"\r\n\r\n\x00\r\nQUIT\n";

/// Signature + version/command byte + family byte + length field.
pub(crate) const PREAMBLE_LEN: usize = 16;

const VERSION_NIBBLE: u8 = 0x02;

const COMMAND_LOCAL: u8 = 0x00;
const COMMAND_PROXY: u8 = 0x01;

const FAMILY_UNSPEC: u8 = 0x00;
const FAMILY_TCP4: u8 = 0x11;
const FAMILY_UDP4: u8 = 0x12;
const FAMILY_TCP6: u8 = 0x21;
const FAMILY_UDP6: u8 = 0x22;
const FAMILY_UNIX_STREAM: u8 = 0x31;
const FAMILY_UNIX_DGRAM: u8 = 0x32;

const ADDR_LEN_UNSPEC: usize = 0;
const ADDR_LEN_INET: usize = 4 + 4 + 2 + 2;
const ADDR_LEN_INET6: usize = 16 + 16 + 2 + 2;
const ADDR_LEN_UNIX: usize = 2 * UnixAddr::LEN;

fn ipv4(block: &[u8]) -> Ipv4Addr {
    let mut octets = [0u8; 4];
    octets.copy_from_slice(block);
    Ipv4Addr::from(octets)
}

fn ipv6(block: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(block);
    Ipv6Addr::from(octets)
}

fn unix(block: &[u8]) -> UnixAddr {
    let mut path = [0u8; UnixAddr::LEN];
    path.copy_from_slice(block);
    UnixAddr::from_wire(path)
}

fn port(block: &[u8]) -> u16 {
    u16::from_be_bytes([block[0], block[1]])
}

/// Decode a version 2 header from a buffer.
///
/// Returns the decoded header and the number of bytes consumed.
pub(crate) fn decode(buf: &[u8], config: &ParseConfig) -> Result<(Header, usize), Error> {
    let n = buf.len().min(SIGNATURE.len());
    if buf[..n] != SIGNATURE[..n] {
        return Err(Error::NoProxyProtocol);
    }
    if buf.len() < PREAMBLE_LEN {
        return Err(Error::Incomplete);
    }

    let b12 = buf[12];
    if b12 >> 4 != VERSION_NIBBLE {
        return Err(Error::UnsupportedVersionOrCommand);
    }
    let command = match b12 & 0x0F {
        COMMAND_LOCAL => Command::Local,
        COMMAND_PROXY => Command::Proxy,
        _ => return Err(Error::UnsupportedVersionOrCommand),
    };

    let b13 = buf[13];
    let addr_len = match b13 {
        FAMILY_UNSPEC => ADDR_LEN_UNSPEC,
        FAMILY_TCP4 | FAMILY_UDP4 => ADDR_LEN_INET,
        FAMILY_TCP6 | FAMILY_UDP6 => ADDR_LEN_INET6,
        FAMILY_UNIX_STREAM | FAMILY_UNIX_DGRAM => ADDR_LEN_UNIX,
        _ => return Err(Error::UnsupportedFamilyOrProtocol),
    };

    // Bounds are checked against the declared length before any address byte
    // is interpreted.
    let length = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    if length < addr_len || length > config.max_length {
        return Err(Error::InvalidLength);
    }
    if buf.len() < PREAMBLE_LEN + length {
        return Err(Error::Incomplete);
    }

    let body = &buf[PREAMBLE_LEN..PREAMBLE_LEN + length];
    let addresses = match b13 {
        FAMILY_TCP4 | FAMILY_UDP4 => Addresses::IPv4 {
            source: SocketAddrV4::new(ipv4(&body[0..4]), port(&body[8..10])),
            destination: SocketAddrV4::new(ipv4(&body[4..8]), port(&body[10..12])),
        },
        FAMILY_TCP6 | FAMILY_UDP6 => Addresses::IPv6 {
            source: SocketAddrV6::new(ipv6(&body[0..16]), port(&body[32..34]), 0, 0),
            destination: SocketAddrV6::new(ipv6(&body[16..32]), port(&body[34..36]), 0, 0),
        },
        FAMILY_UNIX_STREAM | FAMILY_UNIX_DGRAM => Addresses::Unix {
            source: unix(&body[..UnixAddr::LEN]),
            destination: unix(&body[UnixAddr::LEN..ADDR_LEN_UNIX]),
        },
        _ => Addresses::Unspecified,
    };
    let protocol = match b13 & 0x0F {
        0x01 => Protocol::Stream,
        0x02 => Protocol::Datagram,
        _ => Protocol::Unspecified,
    };

    // Everything past the address block, padding included, is the TLV slab.
    let raw_tlvs = body[addr_len..].to_vec();

    // LOCAL carries no address override; whatever the family byte declared,
    // the receiver must keep the socket's own addresses.
    let header = if command.is_local() {
        Header::parsed(
            Version::V2,
            command,
            Protocol::Unspecified,
            Addresses::Unspecified,
            raw_tlvs,
        )
    } else {
        Header::parsed(Version::V2, command, protocol, addresses, raw_tlvs)
    };

    Ok((header, PREAMBLE_LEN + length))
}

pub(crate) fn encode(header: &Header, buf: &mut Vec<u8>) {
    buf.extend_from_slice(SIGNATURE);

    // A PROXY command without a representable address/transport pair can only
    // be expressed as LOCAL/UNSPEC.
    let local = header.command.is_local()
        || header.addresses.is_unspecified()
        || header.protocol.is_unspecified();
    if local {
        buf.push(VERSION_NIBBLE << 4 | COMMAND_LOCAL);
        buf.push(FAMILY_UNSPEC);
        let length = header.raw_tlvs.len() as u16;
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&header.raw_tlvs);
        return;
    }

    buf.push(VERSION_NIBBLE << 4 | COMMAND_PROXY);
    buf.push(header.addresses.family_nibble() << 4 | header.protocol.nibble());

    let length = (header.addresses.block_len() + header.raw_tlvs.len()) as u16;
    buf.extend_from_slice(&length.to_be_bytes());

    match &header.addresses {
        Addresses::IPv4 {
            source,
            destination,
        } => {
            buf.extend_from_slice(&source.ip().octets());
            buf.extend_from_slice(&destination.ip().octets());
            buf.extend_from_slice(&source.port().to_be_bytes());
            buf.extend_from_slice(&destination.port().to_be_bytes());
        }
        Addresses::IPv6 {
            source,
            destination,
        } => {
            buf.extend_from_slice(&source.ip().octets());
            buf.extend_from_slice(&destination.ip().octets());
            buf.extend_from_slice(&source.port().to_be_bytes());
            buf.extend_from_slice(&destination.port().to_be_bytes());
        }
        Addresses::Unix {
            source,
            destination,
        } => {
            buf.extend_from_slice(source.as_bytes());
            buf.extend_from_slice(destination.as_bytes());
        }
        Addresses::Unspecified => {}
    }

    buf.extend_from_slice(&header.raw_tlvs);
}
