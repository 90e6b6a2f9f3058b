//! Cloud provider TLV extensions.
//!
//! AWS, Azure and GCP all attach an identifier of the private endpoint a
//! connection entered through, each in their own application-reserved TLV
//! type. The helpers here extract those identifiers from the records of a
//! parsed header:
//!
//! ```
//! # use proxy_wrap::{cloud, tlv::split_tlvs};
//! # let slab = [0xEAu8, 0x00, 0x0e, 0x01, b'v', b'p', b'c', b'e', b'-', b'0', b'8', b'9', b'a', b'b', b'c', b'1', b'2'];
//! let tlvs = split_tlvs(&slab)?;
//! if let Some(vpce) = cloud::find_aws_vpce_id(&tlvs) {
//!     println!("via VPC endpoint {vpce}");
//! }
//! # Ok::<(), proxy_wrap::Error>(())
//! ```

use crate::{Error, Tlv};

/// AWS application TLV type for Network Load Balancer VPC endpoint services.
pub const PP2_TYPE_AWS: u8 = 0xEA;
/// Subtype carrying the VPC endpoint ID.
pub const PP2_SUBTYPE_AWS_VPCE_ID: u8 = 0x01;

/// Azure application TLV type for Private Link services.
pub const PP2_TYPE_AZURE: u8 = 0xEE;
/// Subtype carrying the private endpoint LinkID.
pub const PP2_SUBTYPE_AZURE_PRIVATEENDPOINT_LINKID: u8 = 0x01;

/// GCP application TLV type for Private Service Connect.
pub const PP2_TYPE_GCP: u8 = 0xE0;

/// True if the record carries an AWS VPC endpoint ID.
pub fn is_aws_vpce_id(tlv: &Tlv<'_>) -> bool {
    tlv.kind == PP2_TYPE_AWS
        && !tlv.value.is_empty()
        && tlv.value[0] == PP2_SUBTYPE_AWS_VPCE_ID
}

/// The VPC endpoint ID of an AWS extension record, e.g.
/// `"vpce-08d2bf15fac5001c9"`.
///
/// Returns [`Error::IncompatibleTlv`] for records of a different type or
/// subtype and [`Error::MalformedTlv`] if the ID contains characters outside
/// `[A-Za-z0-9-]`.
pub fn aws_vpce_id<'a>(tlv: &'a Tlv<'a>) -> Result<&'a str, Error> {
    if !is_aws_vpce_id(tlv) {
        return Err(Error::IncompatibleTlv);
    }

    let id = &tlv.value[1..];
    if !id
        .iter()
        .all(|&b| b == b'-' || b.is_ascii_alphanumeric())
    {
        return Err(Error::MalformedTlv);
    }
    std::str::from_utf8(id).map_err(|_| Error::MalformedTlv)
}

/// The first well-formed AWS VPC endpoint ID in the records, if any.
pub fn find_aws_vpce_id<'a>(tlvs: &'a [Tlv<'a>]) -> Option<&'a str> {
    tlvs.iter().find_map(|tlv| aws_vpce_id(tlv).ok())
}

fn is_azure_private_endpoint_link_id(tlv: &Tlv<'_>) -> bool {
    tlv.kind == PP2_TYPE_AZURE
        && tlv.value.len() == 5
        && tlv.value[0] == PP2_SUBTYPE_AZURE_PRIVATEENDPOINT_LINKID
}

/// The LinkID of an Azure Private Link extension record.
///
/// The value is one subtype byte followed by a little-endian `u32`.
pub fn azure_private_endpoint_link_id(tlv: &Tlv<'_>) -> Result<u32, Error> {
    if !is_azure_private_endpoint_link_id(tlv) {
        return Err(Error::IncompatibleTlv);
    }
    Ok(u32::from_le_bytes([
        tlv.value[1],
        tlv.value[2],
        tlv.value[3],
        tlv.value[4],
    ]))
}

/// The first Azure Private Link LinkID in the records, if any.
pub fn find_azure_private_endpoint_link_id(tlvs: &[Tlv<'_>]) -> Option<u32> {
    tlvs.iter()
        .find_map(|tlv| azure_private_endpoint_link_id(tlv).ok())
}

fn is_gcp_psc_connection_id(tlv: &Tlv<'_>) -> bool {
    tlv.kind == PP2_TYPE_GCP && tlv.value.len() == 8
}

/// The connection ID of a GCP Private Service Connect extension record.
///
/// The value is an 8-byte big-endian `u64`.
pub fn gcp_psc_connection_id(tlv: &Tlv<'_>) -> Result<u64, Error> {
    if !is_gcp_psc_connection_id(tlv) {
        return Err(Error::IncompatibleTlv);
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&tlv.value);
    Ok(u64::from_be_bytes(id))
}

/// The first GCP PSC connection ID in the records, if any.
pub fn find_gcp_psc_connection_id(tlvs: &[Tlv<'_>]) -> Option<u64> {
    tlvs.iter().find_map(|tlv| gcp_psc_connection_id(tlv).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aws_tlv(id: &[u8]) -> Tlv<'static> {
        let mut value = vec![PP2_SUBTYPE_AWS_VPCE_ID];
        value.extend_from_slice(id);
        Tlv::new(PP2_TYPE_AWS, value)
    }

    #[test]
    fn aws_vpce_id_extraction() {
        let tlv = aws_tlv(b"vpce-08d2bf15fac5001c9");
        assert!(is_aws_vpce_id(&tlv));
        assert_eq!(aws_vpce_id(&tlv), Ok("vpce-08d2bf15fac5001c9"));
        assert_eq!(find_aws_vpce_id(&[tlv]), Some("vpce-08d2bf15fac5001c9"));
    }

    #[test]
    fn aws_vpce_id_rejects_bad_charset_and_type() {
        assert_eq!(aws_vpce_id(&aws_tlv(b"vpce_0!")), Err(Error::MalformedTlv));
        assert_eq!(
            aws_vpce_id(&Tlv::new(0xEB, &b"\x01vpce-1"[..])),
            Err(Error::IncompatibleTlv)
        );
        // wrong subtype
        assert_eq!(
            aws_vpce_id(&Tlv::new(PP2_TYPE_AWS, &b"\x02vpce-1"[..])),
            Err(Error::IncompatibleTlv)
        );
        // empty value
        assert_eq!(
            aws_vpce_id(&Tlv::new(PP2_TYPE_AWS, &b""[..])),
            Err(Error::IncompatibleTlv)
        );

        // the empty ID is allowed, mirroring the charset rule alone
        assert_eq!(aws_vpce_id(&aws_tlv(b"")), Ok(""));
    }

    #[test]
    fn azure_link_id_is_little_endian() {
        let tlv = Tlv::new(
            PP2_TYPE_AZURE,
            vec![PP2_SUBTYPE_AZURE_PRIVATEENDPOINT_LINKID, 0x01, 0x02, 0x03, 0x04],
        );
        assert_eq!(azure_private_endpoint_link_id(&tlv), Ok(0x04030201));
        assert_eq!(find_azure_private_endpoint_link_id(&[tlv]), Some(0x04030201));

        // wrong length
        let short = Tlv::new(
            PP2_TYPE_AZURE,
            vec![PP2_SUBTYPE_AZURE_PRIVATEENDPOINT_LINKID, 0x01],
        );
        assert_eq!(
            azure_private_endpoint_link_id(&short),
            Err(Error::IncompatibleTlv)
        );
    }

    #[test]
    fn gcp_psc_connection_id_is_big_endian() {
        let tlv = Tlv::new(
            PP2_TYPE_GCP,
            vec![0xFF, 0xFF, 0xFF, 0xFF, 0xC0, 0xA8, 0x64, 0x02],
        );
        assert_eq!(gcp_psc_connection_id(&tlv), Ok(18446744072646845442));

        let wrong_len = Tlv::new(PP2_TYPE_GCP, vec![0x01]);
        assert_eq!(gcp_psc_connection_id(&wrong_len), Err(Error::IncompatibleTlv));
        assert_eq!(find_gcp_psc_connection_id(&[wrong_len]), None);
    }
}
