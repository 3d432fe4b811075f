//! Just enough of EDNS0 (RFC 6891) to pull an EDNS Client Subnet
//! option (RFC 7871) out of a query's additional section.
//!
//! The wire format (`dns-types`) has no first-class `OPT` record: it
//! decodes unrecognised types - which `OPT`'s type 41 is, to this
//! crate - as `RecordTypeWithData::Unknown { octets, .. }`, which is
//! exactly the raw RDATA this module needs. Nothing else about EDNS
//! (advertised UDP payload size, the DO bit, other options) is
//! interpreted; the transport layer's own 512-byte/TCP framing rules
//! apply regardless of what a client advertises.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use dns_types::protocol::types::{RecordType, ResourceRecord};

const OPT_RECORD_TYPE: u16 = 41;
const OPTION_CODE_CLIENT_SUBNET: u16 = 8;
const FAMILY_IPV4: u16 = 1;
const FAMILY_IPV6: u16 = 2;

/// Find the first ECS option in `additional` (the query's OPT
/// pseudo-record, if any) and decode the client address it carries.
/// The subnet's prefix length is not modelled here - geo/ASN lookups
/// only need a representative address, not the exact mask the client
/// sent.
pub fn client_subnet(additional: &[ResourceRecord]) -> Option<IpAddr> {
    let opt = additional
        .iter()
        .find(|rr| u16::from(rr.rtype_with_data.rtype()) == OPT_RECORD_TYPE)?;

    let dns_types::protocol::types::RecordTypeWithData::Unknown { octets, .. } = &opt.rtype_with_data else {
        return None;
    };

    parse_options(octets).find_map(|(code, data)| (code == OPTION_CODE_CLIENT_SUBNET).then(|| decode_client_subnet(data)).flatten())
}

/// Walk the `(option-code, option-length, option-data)` triples of an
/// OPT RR's RDATA (RFC 6891 section 6.1.2).
fn parse_options(octets: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let mut rest = octets;
    std::iter::from_fn(move || {
        if rest.len() < 4 {
            return None;
        }
        let code = u16::from_be_bytes([rest[0], rest[1]]);
        let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            return None;
        }
        let data = &rest[4..4 + len];
        rest = &rest[4 + len..];
        Some((code, data))
    })
}

/// Decode RFC 7871's `FAMILY`/`SOURCE PREFIX-LENGTH`/`SCOPE
/// PREFIX-LENGTH`/`ADDRESS` layout, zero-padding a truncated address
/// out to its family's full width.
fn decode_client_subnet(data: &[u8]) -> Option<IpAddr> {
    if data.len() < 4 {
        return None;
    }
    let family = u16::from_be_bytes([data[0], data[1]]);
    let address = &data[4..];

    match family {
        FAMILY_IPV4 => {
            let mut octets = [0u8; 4];
            let n = address.len().min(4);
            octets[..n].copy_from_slice(&address[..n]);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        FAMILY_IPV6 => {
            let mut octets = [0u8; 16];
            let n = address.len().min(16);
            octets[..n].copy_from_slice(&address[..n]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::{DomainName, RecordClass, RecordTypeWithData};

    fn opt_rr(rdata: Vec<u8>) -> ResourceRecord {
        let RecordType::Unknown(tag) = RecordType::from(OPT_RECORD_TYPE) else {
            unreachable!("41 is not a recognised RecordType variant")
        };
        ResourceRecord {
            name: DomainName::root_domain(),
            rtype_with_data: RecordTypeWithData::Unknown {
                tag,
                octets: rdata.into(),
            },
            rclass: RecordClass::from(4096),
            ttl: 0,
        }
    }

    fn ecs_option(family: u16, address: &[u8]) -> Vec<u8> {
        let mut option_data = Vec::new();
        option_data.extend_from_slice(&family.to_be_bytes());
        option_data.push(24); // source prefix length, unused by decode_client_subnet
        option_data.push(0); // scope prefix length
        option_data.extend_from_slice(address);

        let mut rdata = Vec::new();
        rdata.extend_from_slice(&OPTION_CODE_CLIENT_SUBNET.to_be_bytes());
        rdata.extend_from_slice(&(option_data.len() as u16).to_be_bytes());
        rdata.extend_from_slice(&option_data);
        rdata
    }

    #[test]
    fn no_opt_record_means_no_subnet() {
        assert_eq!(None, client_subnet(&[]));
    }

    #[test]
    fn decodes_ipv4_client_subnet() {
        let rr = opt_rr(ecs_option(FAMILY_IPV4, &[203, 0, 113, 0]));
        assert_eq!(Some("203.0.113.0".parse().unwrap()), client_subnet(&[rr]));
    }

    #[test]
    fn decodes_truncated_ipv4_client_subnet() {
        // a /24 is often sent with only the significant octets present
        let rr = opt_rr(ecs_option(FAMILY_IPV4, &[203, 0, 113]));
        assert_eq!(Some("203.0.113.0".parse().unwrap()), client_subnet(&[rr]));
    }

    #[test]
    fn decodes_ipv6_client_subnet() {
        let addr: Ipv6Addr = "2001:db8::".parse().unwrap();
        let rr = opt_rr(ecs_option(FAMILY_IPV6, &addr.octets()));
        assert_eq!(Some(IpAddr::V6(addr)), client_subnet(&[rr]));
    }

    #[test]
    fn unrelated_option_is_ignored() {
        let mut rdata = Vec::new();
        rdata.extend_from_slice(&99u16.to_be_bytes());
        rdata.extend_from_slice(&2u16.to_be_bytes());
        rdata.extend_from_slice(&[0xAB, 0xCD]);
        let rr = opt_rr(rdata);
        assert_eq!(None, client_subnet(&[rr]));
    }
}
