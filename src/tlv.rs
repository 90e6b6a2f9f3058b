//! Type-length-value records carried in version 2 headers.
//!
//! A header stores its TLV section as an opaque byte slab; records are split
//! out lazily through [`TlvIter`] (or [`split_tlvs`]) and joined back with
//! [`join_tlvs`]. Keeping the slab opaque preserves byte identity across a
//! parse/encode round trip, which matters for checksummed headers.

use std::borrow::Cow;
use std::fmt;
use std::str::from_utf8;

use crate::Error;

// Registered types, sections 2.2.1 to 2.2.6 of the protocol text.
pub const PP2_TYPE_ALPN: u8 = 0x01;
pub const PP2_TYPE_AUTHORITY: u8 = 0x02;
pub const PP2_TYPE_CRC32C: u8 = 0x03;
pub const PP2_TYPE_NOOP: u8 = 0x04;
pub const PP2_TYPE_UNIQUE_ID: u8 = 0x05;
pub const PP2_TYPE_SSL: u8 = 0x20;
pub const PP2_SUBTYPE_SSL_VERSION: u8 = 0x21;
pub const PP2_SUBTYPE_SSL_CN: u8 = 0x22;
pub const PP2_SUBTYPE_SSL_CIPHER: u8 = 0x23;
pub const PP2_SUBTYPE_SSL_SIG_ALG: u8 = 0x24;
pub const PP2_SUBTYPE_SSL_KEY_ALG: u8 = 0x25;
pub const PP2_TYPE_NETNS: u8 = 0x30;

// Reserved ranges, section 2.2.7.
pub const PP2_TYPE_MIN_CUSTOM: u8 = 0xE0;
pub const PP2_TYPE_MAX_CUSTOM: u8 = 0xEF;
pub const PP2_TYPE_MIN_EXPERIMENT: u8 = 0xF0;
pub const PP2_TYPE_MAX_EXPERIMENT: u8 = 0xF7;
pub const PP2_TYPE_MIN_FUTURE: u8 = 0xF8;

// pp2_tlv_ssl client bit field.
pub const PP2_CLIENT_SSL: u8 = 0x01;
pub const PP2_CLIENT_CERT_CONN: u8 = 0x02;
pub const PP2_CLIENT_CERT_SESS: u8 = 0x04;

const TLV_HEADER_LEN: usize = 3;
const SSL_MIN_LEN: usize = 5;

/// A single type-length-value record.
///
/// The length field is implied by `value.len()` and written on encode. NOOP
/// padding records keep their value bytes so that re-encoding reproduces the
/// original slab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub kind: u8,
    pub value: Cow<'a, [u8]>,
}

impl<'a> Tlv<'a> {
    pub fn new(kind: u8, value: impl Into<Cow<'a, [u8]>>) -> Self {
        Tlv {
            kind,
            value: value.into(),
        }
    }

    /// True if the type is registered in the protocol text (section 2.2).
    pub fn is_registered(&self) -> bool {
        matches!(
            self.kind,
            PP2_TYPE_ALPN
                | PP2_TYPE_AUTHORITY
                | PP2_TYPE_CRC32C
                | PP2_TYPE_NOOP
                | PP2_TYPE_UNIQUE_ID
                | PP2_TYPE_SSL
                | PP2_SUBTYPE_SSL_VERSION
                | PP2_SUBTYPE_SSL_CN
                | PP2_SUBTYPE_SSL_CIPHER
                | PP2_SUBTYPE_SSL_SIG_ALG
                | PP2_SUBTYPE_SSL_KEY_ALG
                | PP2_TYPE_NETNS
        )
    }

    /// True if the type is reserved for application-specific data
    /// (`0xE0`–`0xEF`).
    pub fn is_app(&self) -> bool {
        (PP2_TYPE_MIN_CUSTOM..=PP2_TYPE_MAX_CUSTOM).contains(&self.kind)
    }

    /// True if the type is reserved for temporary experimental use
    /// (`0xF0`–`0xF7`).
    pub fn is_experiment(&self) -> bool {
        (PP2_TYPE_MIN_EXPERIMENT..=PP2_TYPE_MAX_EXPERIMENT).contains(&self.kind)
    }

    /// True if the type is reserved for future use (`0xF8`–`0xFF`).
    pub fn is_future(&self) -> bool {
        self.kind >= PP2_TYPE_MIN_FUTURE
    }

    /// True if the type falls in any range the protocol text accounts for.
    pub fn is_in_registry(&self) -> bool {
        self.is_registered() || self.is_app() || self.is_experiment() || self.is_future()
    }

    /// Returns an owned version of this record.
    pub fn into_owned(self) -> Tlv<'static> {
        Tlv {
            kind: self.kind,
            value: Cow::Owned(self.value.into_owned()),
        }
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let len = u16::try_from(self.value.len()).map_err(|_| Error::HeaderTooBig)?;
        buf.push(self.kind);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.value);
        Ok(())
    }

    // Records produced by `TlvIter` always borrow from the slab.
    pub(crate) fn into_borrowed_value(self) -> &'a [u8] {
        match self.value {
            Cow::Borrowed(v) => v,
            Cow::Owned(_) => unreachable!(),
        }
    }
}

/// Iterator over the records of a TLV slab.
///
/// A record that declares more bytes than the slab holds yields
/// [`Error::TruncatedTlv`] and ends the iteration.
pub struct TlvIter<'a> {
    buf: &'a [u8],
}

impl<'a> TlvIter<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        TlvIter { buf }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<Tlv<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }

        let kind = self.buf[0];
        match self
            .buf
            .get(1..TLV_HEADER_LEN)
            .map(|s| u16::from_be_bytes([s[0], s[1]]) as usize)
        {
            Some(len) if TLV_HEADER_LEN + len <= self.buf.len() => {
                let (record, rest) = self.buf.split_at(TLV_HEADER_LEN + len);
                self.buf = rest;

                Some(Ok(Tlv {
                    kind,
                    value: Cow::Borrowed(&record[TLV_HEADER_LEN..]),
                }))
            }
            _ => {
                self.buf = &[];
                Some(Err(Error::TruncatedTlv))
            }
        }
    }
}

/// Split a TLV slab into its records.
pub fn split_tlvs(buf: &[u8]) -> Result<Vec<Tlv<'_>>, Error> {
    TlvIter::new(buf).collect()
}

/// Join records back into a slab.
///
/// Returns [`Error::HeaderTooBig`] if a value or the joined slab does not fit
/// in a `u16` length field.
pub fn join_tlvs(tlvs: &[Tlv<'_>]) -> Result<Vec<u8>, Error> {
    let total: usize = tlvs.iter().map(|t| TLV_HEADER_LEN + t.value.len()).sum();
    if total > u16::MAX as usize {
        return Err(Error::HeaderTooBig);
    }

    let mut buf = Vec::with_capacity(total);
    for tlv in tlvs {
        tlv.encode_into(&mut buf)?;
    }
    Ok(buf)
}

/// SSL information from a `PP2_TYPE_SSL` record
///
/// Wraps the `pp2_tlv_ssl` structure: a client bit field, a verification
/// result and a nested slab of sub-records (TLS version, certificate common
/// name, cipher, signature and key algorithms).
#[derive(Clone, PartialEq, Eq)]
pub struct SslInfo<'a> {
    client: u8,
    verify: u32,
    sub: Cow<'a, [u8]>,
}

impl<'a> SslInfo<'a> {
    pub fn new(client_ssl: bool, client_cert_conn: bool, client_cert_sess: bool, verify: u32) -> Self {
        let mut client = 0;
        if client_ssl {
            client |= PP2_CLIENT_SSL;
        }
        if client_cert_conn {
            client |= PP2_CLIENT_CERT_CONN;
        }
        if client_cert_sess {
            client |= PP2_CLIENT_CERT_SESS;
        }

        SslInfo {
            client,
            verify,
            sub: Default::default(),
        }
    }

    /// Decode and validate a `PP2_TYPE_SSL` record.
    ///
    /// Returns [`Error::IncompatibleTlv`] for records of a different type and
    /// [`Error::MalformedTlv`] when the value is shorter than the fixed
    /// fields, when `client_ssl` is set without an ASCII version sub-record,
    /// or when a common-name sub-record is empty or not valid UTF-8.
    pub fn decode(tlv: Tlv<'a>) -> Result<Self, Error> {
        if tlv.kind != PP2_TYPE_SSL {
            return Err(Error::IncompatibleTlv);
        }
        validate_ssl(tlv.value.as_ref())?;

        let (client, verify) = {
            let v = tlv.value.as_ref();
            (v[0], u32::from_be_bytes([v[1], v[2], v[3], v[4]]))
        };
        let sub = match tlv.value {
            Cow::Borrowed(v) => Cow::Borrowed(&v[SSL_MIN_LEN..]),
            Cow::Owned(v) => Cow::Owned(v[SSL_MIN_LEN..].to_vec()),
        };

        Ok(SslInfo {
            client,
            verify,
            sub,
        })
    }

    /// The client connected over SSL/TLS. When set, [`SslInfo::version`]
    /// carries the TLS version string.
    pub fn client_ssl(&self) -> bool {
        self.client & PP2_CLIENT_SSL != 0
    }

    /// The client provided a certificate over the current connection.
    pub fn client_cert_conn(&self) -> bool {
        self.client & PP2_CLIENT_CERT_CONN != 0
    }

    /// The client provided a certificate at least once over the TLS session
    /// this connection belongs to.
    pub fn client_cert_sess(&self) -> bool {
        self.client & PP2_CLIENT_CERT_SESS != 0
    }

    /// Raw client bit field.
    pub fn client(&self) -> u8 {
        self.client
    }

    /// Zero if the client presented a certificate and it was successfully
    /// verified, non-zero otherwise.
    pub fn verify(&self) -> u32 {
        self.verify
    }

    pub fn verified(&self) -> bool {
        self.verify == 0
    }

    /// Iterator over the sub-records.
    pub fn tlvs(&self) -> TlvIter<'_> {
        TlvIter::new(&self.sub)
    }

    fn find_sub(&self, kind: u8) -> Option<&[u8]> {
        self.tlvs().find_map(|t| match t {
            Ok(t) if t.kind == kind => Some(t.into_borrowed_value()),
            _ => None,
        })
    }

    /// TLS version string, e.g. `"TLSv1.3"`.
    pub fn version(&self) -> Option<&str> {
        self.find_sub(PP2_SUBTYPE_SSL_VERSION)
            .and_then(|v| from_utf8(v).ok())
    }

    /// Common Name field of the client certificate's Distinguished Name,
    /// e.g. `"example.com"`.
    pub fn cn(&self) -> Option<&str> {
        self.find_sub(PP2_SUBTYPE_SSL_CN)
            .and_then(|v| from_utf8(v).ok())
    }

    /// Cipher name, e.g. `"ECDHE-RSA-AES128-GCM-SHA256"`.
    pub fn cipher(&self) -> Option<&str> {
        self.find_sub(PP2_SUBTYPE_SSL_CIPHER)
            .and_then(|v| from_utf8(v).ok())
    }

    /// Signature algorithm of the client certificate, e.g. `"SHA256"`.
    pub fn sig_alg(&self) -> Option<&str> {
        self.find_sub(PP2_SUBTYPE_SSL_SIG_ALG)
            .and_then(|v| from_utf8(v).ok())
    }

    /// Key algorithm of the client certificate, e.g. `"RSA2048"`.
    pub fn key_alg(&self) -> Option<&str> {
        self.find_sub(PP2_SUBTYPE_SSL_KEY_ALG)
            .and_then(|v| from_utf8(v).ok())
    }

    /// Append a sub-record.
    pub fn push_tlv(&mut self, tlv: &Tlv<'_>) -> Result<(), Error> {
        tlv.encode_into(self.sub.to_mut())
    }

    /// Re-encode as a `PP2_TYPE_SSL` record.
    pub fn to_tlv(&self) -> Tlv<'static> {
        let mut value = Vec::with_capacity(SSL_MIN_LEN + self.sub.len());
        value.push(self.client);
        value.extend_from_slice(&self.verify.to_be_bytes());
        value.extend_from_slice(&self.sub);

        Tlv {
            kind: PP2_TYPE_SSL,
            value: Cow::Owned(value),
        }
    }

    /// Returns an owned version of this struct.
    pub fn into_owned(self) -> SslInfo<'static> {
        SslInfo {
            client: self.client,
            verify: self.verify,
            sub: Cow::Owned(self.sub.into_owned()),
        }
    }
}

fn validate_ssl(value: &[u8]) -> Result<(), Error> {
    if value.len() < SSL_MIN_LEN {
        return Err(Error::MalformedTlv);
    }

    let mut version_found = value[0] & PP2_CLIENT_SSL == 0;
    for sub in TlvIter::new(&value[SSL_MIN_LEN..]) {
        let sub = sub?;
        match sub.kind {
            PP2_SUBTYPE_SSL_VERSION => {
                if sub.value.is_empty() || !sub.value.iter().all(|b| b.is_ascii()) {
                    return Err(Error::MalformedTlv);
                }
                version_found = true;
            }
            PP2_SUBTYPE_SSL_CN => {
                if sub.value.is_empty() || from_utf8(&sub.value).is_err() {
                    return Err(Error::MalformedTlv);
                }
            }
            _ => {}
        }
    }

    if !version_found {
        return Err(Error::MalformedTlv);
    }
    Ok(())
}

impl fmt::Debug for SslInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslInfo")
            .field("verify", &self.verify())
            .field("client_ssl", &self.client_ssl())
            .field("client_cert_conn", &self.client_cert_conn())
            .field("client_cert_sess", &self.client_cert_sess())
            .field("fields", &self.tlvs().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_round_trip() {
        let tlvs = vec![
            Tlv::new(PP2_TYPE_ALPN, &b"h2"[..]),
            Tlv::new(PP2_TYPE_NOOP, &b"\0\0\0"[..]),
            Tlv::new(0xE7, &b"custom"[..]),
        ];

        let slab = join_tlvs(&tlvs).unwrap();
        let parsed = split_tlvs(&slab).unwrap();
        assert_eq!(parsed, tlvs);

        // NOOP value bytes survive the trip
        assert_eq!(parsed[1].value.as_ref(), b"\0\0\0");
        assert_eq!(join_tlvs(&parsed).unwrap(), slab);
    }

    #[test]
    fn split_rejects_truncated_record() {
        // declares 4 value bytes, delivers 2
        let slab = [0x01, 0x00, 0x04, 0xAA, 0xBB];
        assert_eq!(split_tlvs(&slab), Err(Error::TruncatedTlv));

        // length field itself cut short
        assert_eq!(split_tlvs(&[0x01, 0x00]), Err(Error::TruncatedTlv));
    }

    #[test]
    fn join_rejects_oversized_slab() {
        let tlvs = vec![
            Tlv::new(0xE0, vec![0u8; 40_000]),
            Tlv::new(0xE1, vec![0u8; 40_000]),
        ];
        assert_eq!(join_tlvs(&tlvs), Err(Error::HeaderTooBig));
    }

    #[test]
    fn registry_classification() {
        assert!(Tlv::new(PP2_TYPE_ALPN, &[][..]).is_registered());
        assert!(Tlv::new(PP2_TYPE_NETNS, &[][..]).is_registered());
        assert!(Tlv::new(0xE0, &[][..]).is_app());
        assert!(Tlv::new(0xEF, &[][..]).is_app());
        assert!(Tlv::new(0xF0, &[][..]).is_experiment());
        assert!(Tlv::new(0xF7, &[][..]).is_experiment());
        assert!(Tlv::new(0xF8, &[][..]).is_future());
        assert!(Tlv::new(0xFF, &[][..]).is_future());

        let unassigned = Tlv::new(0x42, Vec::new());
        assert!(!unassigned.is_in_registry());
        assert!(Tlv::new(0xEA, &[][..]).is_in_registry());
    }

    #[test]
    fn ssl_round_trip() {
        let mut ssl = SslInfo::new(true, true, false, 0);
        ssl.push_tlv(&Tlv::new(PP2_SUBTYPE_SSL_VERSION, &b"TLSv1.3"[..]))
            .unwrap();
        ssl.push_tlv(&Tlv::new(PP2_SUBTYPE_SSL_CN, &b"localhost"[..]))
            .unwrap();
        ssl.push_tlv(&Tlv::new(PP2_SUBTYPE_SSL_CIPHER, &b"TLS_AES_256_GCM_SHA384"[..]))
            .unwrap();

        let decoded = SslInfo::decode(ssl.to_tlv()).unwrap();
        assert!(decoded.client_ssl());
        assert!(decoded.client_cert_conn());
        assert!(!decoded.client_cert_sess());
        assert!(decoded.verified());
        assert_eq!(decoded.version(), Some("TLSv1.3"));
        assert_eq!(decoded.cn(), Some("localhost"));
        assert_eq!(decoded.cipher(), Some("TLS_AES_256_GCM_SHA384"));
        assert_eq!(decoded.sig_alg(), None);
        assert_eq!(decoded.key_alg(), None);
    }

    #[test]
    fn ssl_rejects_wrong_kind_and_short_value() {
        assert_eq!(
            SslInfo::decode(Tlv::new(PP2_TYPE_ALPN, &b"h2"[..])),
            Err(Error::IncompatibleTlv)
        );
        assert_eq!(
            SslInfo::decode(Tlv::new(PP2_TYPE_SSL, &b"\x01\0\0"[..])),
            Err(Error::MalformedTlv)
        );
    }

    #[test]
    fn ssl_requires_version_when_client_ssl_set() {
        // client_ssl set, no version sub-record
        let bare = SslInfo::new(true, false, false, 0);
        assert_eq!(SslInfo::decode(bare.to_tlv()), Err(Error::MalformedTlv));

        // without the flag, no version is required
        let plain = SslInfo::new(false, false, false, 1);
        assert!(SslInfo::decode(plain.to_tlv()).is_ok());

        // non-ASCII version string
        let mut bad = SslInfo::new(true, false, false, 0);
        bad.push_tlv(&Tlv::new(PP2_SUBTYPE_SSL_VERSION, &[0xFF, 0xFE][..]))
            .unwrap();
        assert_eq!(SslInfo::decode(bad.to_tlv()), Err(Error::MalformedTlv));
    }

    #[test]
    fn ssl_rejects_bad_common_name() {
        let mut empty_cn = SslInfo::new(false, true, false, 0);
        empty_cn.push_tlv(&Tlv::new(PP2_SUBTYPE_SSL_CN, &[][..])).unwrap();
        assert_eq!(SslInfo::decode(empty_cn.to_tlv()), Err(Error::MalformedTlv));

        let mut bad_utf8 = SslInfo::new(false, true, false, 0);
        bad_utf8
            .push_tlv(&Tlv::new(PP2_SUBTYPE_SSL_CN, &[0xC0, 0x80][..]))
            .unwrap();
        assert_eq!(SslInfo::decode(bad_utf8.to_tlv()), Err(Error::MalformedTlv));
    }

    #[test]
    fn ssl_rejects_truncated_sub_records() {
        let mut value = vec![0x00, 0, 0, 0, 0];
        value.extend_from_slice(&[PP2_SUBTYPE_SSL_CIPHER, 0x00, 0x10, b'x']);
        assert_eq!(
            SslInfo::decode(Tlv::new(PP2_TYPE_SSL, value)),
            Err(Error::TruncatedTlv)
        );
    }
}
