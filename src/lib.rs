//! PROXY protocol decoder, encoder and stream wrapper
//!
//! This crate implements the
//! [PROXY protocol](https://www.haproxy.org/download/2.8/doc/proxy-protocol.txt)
//! (versions 1 and 2), which is used by load balancers and reverse proxies to
//! preserve original client connection information when forwarding TCP or Unix
//! socket connections. It is supported by HAProxy, Amazon ELB/ALB/NLB, Azure
//! Private Link, GCP Private Service Connect and others.
//!
//! Beyond the wire codec, the crate provides a transparent wrapper around
//! listeners and streams (see the [`io`] module): the wrapper consumes the
//! header on first read, applies a configurable trust [`Policy`] based on the
//! upstream peer, and then passes the remaining byte stream through untouched.
//!
//! # Decoding
//!
//! To decode a header from a buffer, use [`Header::parse`]. It returns the
//! parsed header and the number of bytes consumed, or [`Error::Incomplete`]
//! when more data is needed:
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use proxy_wrap::{Header, ParseConfig};
//!
//! let buf = b"PROXY TCP4 192.168.1.1 192.168.1.2 12345 443\r\nGET /";
//!
//! let (header, len) = Header::parse(buf, ParseConfig::default())?;
//! assert_eq!(
//!     header.addresses.source(),
//!     Some("192.168.1.1:12345".parse().unwrap())
//! );
//! assert_eq!(&buf[len..], b"GET /");
//! # Ok(())
//! # }
//! ```
//!
//! Version 2 headers may carry additional type-length-value metadata, exposed
//! through the [`Header::tlvs`] iterator and convenience accessors such as
//! [`Header::authority`]. See [`Tlv`] and the [`cloud`] module.
//!
//! # Encoding
//!
//! Construct a header from addresses and encode it with [`Header::encode`]:
//!
//! ```
//! use proxy_wrap::{Header, Protocol, Version};
//!
//! let header = Header::proxy(
//!     Version::V2,
//!     Protocol::Stream,
//!     "[2001:db8::1:1]:51234".parse().unwrap(),
//!     "[2001:db8::2:1]:443".parse().unwrap(),
//! );
//!
//! let mut buf = Vec::new();
//! header.encode(&mut buf);
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

mod v1;
mod v2;

pub mod cloud;
pub mod io;
pub mod policy;
pub mod tlv;

pub use crate::policy::Policy;
pub use crate::tlv::{SslInfo, Tlv};

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::tlv::TlvIter;

/// PROXY protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    /// Human-readable text format (`PROXY ...\r\n`)
    V1,
    /// Binary format with a 12-byte signature
    V2,
}

impl Version {
    /// Version number as used on the wire.
    pub fn number(self) -> u8 {
        match self {
            Version::V1 => 1,
            Version::V2 => 2,
        }
    }
}

impl TryFrom<u8> for Version {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(Version::V1),
            2 => Ok(Version::V2),
            _ => Err(Error::UnknownVersion),
        }
    }
}

/// PROXY protocol command.
///
/// A `Local` header carries no address information; the receiver must keep
/// using the underlying socket's addresses. Proxies emit `Local` for health
/// checks and other self-initiated connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Local,
    Proxy,
}

impl Command {
    pub fn is_local(self) -> bool {
        self == Command::Local
    }

    pub fn is_proxy(self) -> bool {
        self == Command::Proxy
    }
}

/// Transport protocol (the low nibble of the version 2 family byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Unspecified,
    /// Stream protocol (TCP or `SOCK_STREAM` Unix socket)
    Stream,
    /// Datagram protocol (UDP or `SOCK_DGRAM` Unix socket)
    Datagram,
}

impl Protocol {
    pub fn is_unspecified(self) -> bool {
        self == Protocol::Unspecified
    }

    pub fn is_stream(self) -> bool {
        self == Protocol::Stream
    }

    pub fn is_datagram(self) -> bool {
        self == Protocol::Datagram
    }

    pub(crate) fn nibble(self) -> u8 {
        match self {
            Protocol::Unspecified => 0x00,
            Protocol::Stream => 0x01,
            Protocol::Datagram => 0x02,
        }
    }
}

/// Unix socket address as carried in a version 2 header.
///
/// The wire format is a fixed 108-byte NUL-padded path. The raw block is
/// retained verbatim so that re-encoding a parsed header is byte-identical.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnixAddr([u8; Self::LEN]);

impl UnixAddr {
    /// On-wire length of a single Unix address block.
    pub const LEN: usize = 108;

    /// Create an address from a socket path.
    ///
    /// Returns [`Error::InvalidAddress`] if the path does not fit in the
    /// 108-byte block.
    pub fn new(path: &[u8]) -> Result<Self, Error> {
        if path.len() > Self::LEN {
            return Err(Error::InvalidAddress);
        }
        let mut block = [0u8; Self::LEN];
        block[..path.len()].copy_from_slice(path);
        Ok(UnixAddr(block))
    }

    pub(crate) fn from_wire(block: [u8; Self::LEN]) -> Self {
        UnixAddr(block)
    }

    /// The full 108-byte NUL-padded block.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// The socket path, up to the first NUL byte.
    pub fn path_bytes(&self) -> &[u8] {
        match self.0.iter().position(|&b| b == 0) {
            Some(end) => &self.0[..end],
            None => &self.0[..],
        }
    }
}

impl fmt::Debug for UnixAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.path_bytes()))
    }
}

/// Source and destination addresses carried by a header.
///
/// The address family is part of the variant, so a header can never pair an
/// IPv4 source with an IPv6 destination or a family byte that contradicts its
/// addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addresses {
    /// No address information (`LOCAL` command or `UNKNOWN` v1 family)
    Unspecified,
    IPv4 {
        source: SocketAddrV4,
        destination: SocketAddrV4,
    },
    IPv6 {
        source: SocketAddrV6,
        destination: SocketAddrV6,
    },
    Unix {
        source: UnixAddr,
        destination: UnixAddr,
    },
}

impl Addresses {
    pub fn is_unspecified(&self) -> bool {
        matches!(self, Addresses::Unspecified)
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self, Addresses::IPv4 { .. })
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Addresses::IPv6 { .. })
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Addresses::Unix { .. })
    }

    /// Source socket address, for the INET families.
    pub fn source(&self) -> Option<SocketAddr> {
        match self {
            Addresses::IPv4 { source, .. } => Some(SocketAddr::V4(*source)),
            Addresses::IPv6 { source, .. } => Some(SocketAddr::V6(*source)),
            _ => None,
        }
    }

    /// Destination socket address, for the INET families.
    pub fn destination(&self) -> Option<SocketAddr> {
        match self {
            Addresses::IPv4 { destination, .. } => Some(SocketAddr::V4(*destination)),
            Addresses::IPv6 { destination, .. } => Some(SocketAddr::V6(*destination)),
            _ => None,
        }
    }

    /// Length of the version 2 address block for this family.
    pub(crate) fn block_len(&self) -> usize {
        match self {
            Addresses::Unspecified => 0,
            Addresses::IPv4 { .. } => 12,
            Addresses::IPv6 { .. } => 36,
            Addresses::Unix { .. } => 2 * UnixAddr::LEN,
        }
    }

    pub(crate) fn family_nibble(&self) -> u8 {
        match self {
            Addresses::Unspecified => 0x00,
            Addresses::IPv4 { .. } => 0x01,
            Addresses::IPv6 { .. } => 0x02,
            Addresses::Unix { .. } => 0x03,
        }
    }
}

/// Configuration for parsing PROXY protocol headers
#[derive(Debug, Clone, Copy)]
pub struct ParseConfig {
    /// Whether to accept version 1 headers
    pub allow_v1: bool,

    /// Whether to accept version 2 headers
    pub allow_v2: bool,

    /// Ceiling on the version 2 remainder (address block plus TLVs).
    ///
    /// The length field is a `u16`, but accepting the full 64 KiB would let a
    /// malicious upstream force large allocations before any payload byte is
    /// seen. Headers declaring more than this are rejected with
    /// [`Error::InvalidLength`].
    pub max_length: usize,
}

impl ParseConfig {
    pub const DEFAULT_MAX_LENGTH: usize = 4096;
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            allow_v1: true,
            allow_v2: true,
            max_length: Self::DEFAULT_MAX_LENGTH,
        }
    }
}

/// A PROXY protocol header
///
/// Carries the protocol version, command, transport protocol and the original
/// source/destination addresses, plus (for version 2) an opaque TLV section
/// decoded on demand through [`Header::tlvs`].
#[derive(Clone, PartialEq, Eq)]
pub struct Header {
    pub version: Version,
    pub command: Command,
    pub protocol: Protocol,
    pub addresses: Addresses,
    raw_tlvs: Vec<u8>,
}

impl Header {
    /// A `LOCAL` header: no address information, receiver keeps the socket's
    /// own addresses.
    pub fn local(version: Version) -> Self {
        Header {
            version,
            command: Command::Local,
            protocol: Protocol::Unspecified,
            addresses: Addresses::Unspecified,
            raw_tlvs: Vec::new(),
        }
    }

    /// A `PROXY` header for a pair of socket addresses.
    ///
    /// If the two addresses belong to different IP families the header
    /// degrades to [`Header::local`], since such a pair cannot be expressed
    /// on the wire.
    pub fn proxy(
        version: Version,
        protocol: Protocol,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Self {
        let addresses = match (source, destination) {
            (SocketAddr::V4(source), SocketAddr::V4(destination)) => Addresses::IPv4 {
                source,
                destination,
            },
            (SocketAddr::V6(source), SocketAddr::V6(destination)) => Addresses::IPv6 {
                source,
                destination,
            },
            _ => return Header::local(version),
        };

        Header {
            version,
            command: Command::Proxy,
            protocol,
            addresses,
            raw_tlvs: Vec::new(),
        }
    }

    /// A version 2 `PROXY` header for a pair of Unix socket addresses.
    pub fn unix(protocol: Protocol, source: UnixAddr, destination: UnixAddr) -> Self {
        Header {
            version: Version::V2,
            command: Command::Proxy,
            protocol,
            addresses: Addresses::Unix {
                source,
                destination,
            },
            raw_tlvs: Vec::new(),
        }
    }

    pub(crate) fn parsed(
        version: Version,
        command: Command,
        protocol: Protocol,
        addresses: Addresses,
        raw_tlvs: Vec<u8>,
    ) -> Self {
        Header {
            version,
            command,
            protocol,
            addresses,
            raw_tlvs,
        }
    }

    /// Attempt to parse a header from the given buffer.
    ///
    /// Returns the parsed header and the number of bytes consumed. If the
    /// buffer holds a valid prefix of a header, returns [`Error::Incomplete`]
    /// so more data can be read from the socket.
    ///
    /// If the first bytes do not carry a version 1 or version 2 signature,
    /// returns [`Error::NoProxyProtocol`]; nothing is consumed and the buffer
    /// can be handed to a non-PROXY consumer as-is.
    pub fn parse(buf: &[u8], config: ParseConfig) -> Result<(Self, usize), Error> {
        match buf.first() {
            Some(&b'P') if config.allow_v1 => v1::decode(buf),
            Some(&0x0D) if config.allow_v2 => v2::decode(buf, &config),
            None => Err(Error::Incomplete),
            _ => Err(Error::NoProxyProtocol),
        }
    }

    /// Encode this header onto the end of `buf`, in the format selected by
    /// [`Header::version`].
    ///
    /// Headers whose addresses cannot be expressed in the target format are
    /// written as `PROXY UNKNOWN` (version 1) or `LOCAL`/`UNSPEC` (version 2).
    /// The version 1 format has no TLV section; any TLVs on the header are
    /// not written.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self.version {
            Version::V1 => v1::encode(self, buf),
            Version::V2 => v2::encode(self, buf),
        }
    }

    /// Encode this header into a new buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(v2::PREAMBLE_LEN + self.addresses.block_len() + self.raw_tlvs.len());
        self.encode(&mut buf);
        buf
    }

    /// The raw TLV section, exactly as carried on the wire (version 2 only).
    pub fn raw_tlvs(&self) -> &[u8] {
        &self.raw_tlvs
    }

    /// Iterator over the TLV records in the header.
    pub fn tlvs(&self) -> TlvIter<'_> {
        TlvIter::new(&self.raw_tlvs)
    }

    /// Replace the TLV section.
    ///
    /// Returns [`Error::HeaderTooBig`] if the joined records would not fit in
    /// the version 2 length field together with the address block.
    pub fn set_tlvs(&mut self, tlvs: &[Tlv<'_>]) -> Result<(), Error> {
        let joined = tlv::join_tlvs(tlvs)?;
        if joined.len() > u16::MAX as usize - self.addresses.block_len() {
            return Err(Error::HeaderTooBig);
        }
        self.raw_tlvs = joined;
        Ok(())
    }

    fn find_tlv(&self, kind: u8) -> Option<Tlv<'_>> {
        self.tlvs().find_map(|t| match t {
            Ok(t) if t.kind == kind => Some(t),
            _ => None,
        })
    }

    /// Raw ALPN extension data (TLV type `0x01`), typically an exact copy of
    /// the TLS ALPN extension, e.g. `b"h2"`.
    pub fn alpn(&self) -> Option<&[u8]> {
        self.find_tlv(tlv::PP2_TYPE_ALPN)
            .map(Tlv::into_borrowed_value)
    }

    /// Authority (TLV type `0x02`): the host name passed by the client,
    /// usually the TLS SNI value.
    pub fn authority(&self) -> Option<&str> {
        self.find_tlv(tlv::PP2_TYPE_AUTHORITY)
            .and_then(|t| std::str::from_utf8(t.into_borrowed_value()).ok())
    }

    /// CRC32c checksum of the header (TLV type `0x03`).
    ///
    /// The checksum is surfaced but not validated.
    pub fn crc32c(&self) -> Option<u32> {
        self.find_tlv(tlv::PP2_TYPE_CRC32C)
            .and_then(|t| <[u8; 4]>::try_from(t.into_borrowed_value()).ok())
            .map(u32::from_be_bytes)
    }

    /// Unique connection ID generated by the upstream proxy (TLV type `0x05`).
    pub fn unique_id(&self) -> Option<&[u8]> {
        self.find_tlv(tlv::PP2_TYPE_UNIQUE_ID)
            .map(Tlv::into_borrowed_value)
    }

    /// Network namespace name (TLV type `0x30`).
    pub fn netns(&self) -> Option<&str> {
        self.find_tlv(tlv::PP2_TYPE_NETNS)
            .and_then(|t| std::str::from_utf8(t.into_borrowed_value()).ok())
    }

    /// SSL information (TLV type `0x20`), if present and well-formed.
    pub fn ssl(&self) -> Option<SslInfo<'_>> {
        self.tlvs().find_map(|t| match t {
            Ok(t) if t.kind == tlv::PP2_TYPE_SSL => SslInfo::decode(t).ok(),
            _ => None,
        })
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("version", &self.version)
            .field("command", &self.command)
            .field("protocol", &self.protocol)
            .field("addresses", &self.addresses)
            .field("tlvs", &self.tlvs().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors surfaced by the codec, the stream wrapper and the policy layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Neither a version 1 nor a version 2 signature at the start of the
    /// stream.
    #[error("proxy protocol signature not present")]
    NoProxyProtocol,

    /// The buffer holds a valid prefix of a header; more data is needed.
    #[error("header incomplete, more data needed")]
    Incomplete,

    /// Stream ended before the version 1 line terminator.
    #[error("version 1 header truncated before CRLF")]
    TruncatedV1Header,

    /// Version 1 line terminated by a bare LF.
    #[error("version 1 header must end with CRLF")]
    MissingCrlf,

    /// Version 1 line exceeds the 107-byte maximum.
    #[error("version 1 header longer than 107 bytes")]
    V1HeaderTooLong,

    /// Version 1 family token is not `TCP4`, `TCP6` or `UNKNOWN`, or the
    /// token count does not match the family.
    #[error("cannot read version 1 address family and protocol")]
    UnknownFamily,

    /// Address literal does not match the declared family.
    #[error("invalid address")]
    InvalidAddress,

    /// Port is not a decimal number in `[0, 65535]`.
    #[error("invalid port number")]
    InvalidPortNumber,

    /// Version 2 version/command byte is unrecognized.
    #[error("unsupported proxy protocol version and command")]
    UnsupportedVersionOrCommand,

    /// Version 2 family/transport byte is unrecognized.
    #[error("unsupported address family and protocol")]
    UnsupportedFamilyOrProtocol,

    /// Stream ended inside the version 2 fixed preamble.
    #[error("cannot read version 2 header length")]
    TruncatedV2Header,

    /// Version 2 length field underruns the address block, exceeds the
    /// configured ceiling, or declares more bytes than the stream delivered.
    #[error("invalid version 2 header length")]
    InvalidLength,

    /// A TLV record declares more bytes than are available.
    #[error("truncated TLV record")]
    TruncatedTlv,

    /// A TLV value fails its semantic checks.
    #[error("malformed TLV value")]
    MalformedTlv,

    /// A TLV accessor was invoked on a record of the wrong type.
    #[error("incompatible TLV type")]
    IncompatibleTlv,

    /// A header was present although the policy for this upstream is
    /// [`Policy::Reject`].
    #[error("superfluous proxy protocol header")]
    SuperfluousProxyHeader,

    /// Version number is neither 1 nor 2.
    #[error("unknown proxy protocol version")]
    UnknownVersion,

    /// Header and TLVs together exceed the 64 KiB length field.
    #[error("header does not fit in the version 2 length field")]
    HeaderTooBig,

    /// Returned by a policy to drop the connection while keeping the
    /// listener accepting.
    #[error("upstream connection rejected by policy")]
    InvalidUpstream,
}
