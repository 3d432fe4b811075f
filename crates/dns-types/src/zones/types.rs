use std::collections::{BTreeSet, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

/// The set of authoritative origins known to the resolver.
///
/// This is deliberately minimal: it answers "is this a zone, and if
/// so which one is the most specific match" (see section 4.1 of the
/// design this crate implements).  The records themselves, and each
/// zone's config, live in the external store and are fetched on
/// demand by the record store adapter - this type only tracks which
/// origins exist.
#[derive(Debug, Clone, Default)]
pub struct Zones {
    origins: HashSet<DomainName>,
}

impl Zones {
    pub fn new() -> Self {
        Self {
            origins: HashSet::new(),
        }
    }

    pub fn from_origins<I: IntoIterator<Item = DomainName>>(origins: I) -> Self {
        Self {
            origins: origins.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, origin: DomainName) {
        self.origins.insert(origin);
    }

    pub fn remove(&mut self, origin: &DomainName) {
        self.origins.remove(origin);
    }

    pub fn contains(&self, origin: &DomainName) -> bool {
        self.origins.contains(origin)
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainName> {
        self.origins.iter()
    }

    /// Find the most specific zone origin which is equal to, or a
    /// proper ancestor of, `name`.  Matching is label-aligned: it
    /// walks whole-label suffixes of `name` from longest to shortest,
    /// so `b1.zone.zon.` never matches a zone `1.zone.zon.`.
    pub fn find(&self, name: &DomainName) -> Option<&DomainName> {
        for i in 0..name.labels.len() {
            let suffix_labels = &name.labels[i..];
            if let Some(suffix) = DomainName::from_labels(suffix_labels.to_vec()) {
                if let Some(origin) = self.origins.get(&suffix) {
                    return Some(origin);
                }
            }
        }

        None
    }
}

/// A label path relative to a zone's apex.  The apex itself is `@`
/// (an empty label list).
///
/// The labels are stored in the same leftmost-first order as a
/// `DomainName`'s `labels` field, i.e. `p[0]` is the leftmost label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NodePath {
    labels: Vec<Label>,
}

impl NodePath {
    pub fn apex() -> Self {
        Self { labels: Vec::new() }
    }

    pub fn is_apex(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// The relative path of `name` under `origin`, or `None` if `name`
    /// is not `origin` or a subdomain of it.
    pub fn relative_to(name: &DomainName, origin: &DomainName) -> Option<Self> {
        if name.is_subdomain_of(origin) {
            let cut = name.labels.len() - origin.labels.len();
            Some(Self {
                labels: name.labels[0..cut].to_vec(),
            })
        } else {
            None
        }
    }

    /// Drop the leftmost `k` labels, keeping the rest of the path.
    /// Used when trying successively shorter wildcard candidates
    /// (`*.p[k:]`).
    pub fn suffix(&self, k: usize) -> Self {
        let start = k.min(self.labels.len());
        Self {
            labels: self.labels[start..].to_vec(),
        }
    }

    /// Rebuild the absolute domain name this path refers to, under
    /// `origin`.
    pub fn to_domain(&self, origin: &DomainName) -> DomainName {
        let mut labels = self.labels.clone();
        labels.append(&mut origin.labels.clone());
        DomainName::from_labels(labels).unwrap_or_else(|| origin.clone())
    }

    /// The KVS hash-field form of this path: `@` for the apex,
    /// otherwise the labels joined with `.` (leftmost first, no
    /// trailing dot).
    pub fn to_key_string(&self) -> String {
        if self.is_apex() {
            "@".to_string()
        } else {
            self.labels
                .iter()
                .map(|l| String::from_utf8_lossy(l.octets()).into_owned())
                .collect::<Vec<_>>()
                .join(".")
        }
    }

    /// Parse the KVS hash-field form of a node path.
    pub fn parse(s: &str) -> Option<Self> {
        if s == "@" {
            return Some(Self::apex());
        }

        let mut labels = Vec::new();
        for chunk in s.split('.') {
            if chunk.is_empty() {
                return None;
            }
            labels.push(Label::try_from(chunk.as_bytes()).ok()?);
        }

        Some(Self { labels })
    }

    /// True if the leftmost label is the wildcard label `*`.
    pub fn starts_with_wildcard_label(&self) -> bool {
        matches!(self.labels.first(), Some(l) if l.octets().as_ref() == b"*")
    }

    /// Build the wildcard candidate `*.suffix` - `suffix` having come
    /// from a prior call to `Self::suffix`.
    pub fn wildcard(suffix: Self) -> Self {
        let mut labels = vec![Label::try_from(b"*".as_slice()).expect("'*' is a valid label")];
        labels.extend(suffix.labels);
        Self { labels }
    }
}

/// Per-zone configuration, equivalent to the fields of an RFC 1035
/// `SOA` record plus a couple of resolver-specific knobs.
///
/// Absent or unparsable config blobs fall back to these defaults (see
/// `get_config` in the record store adapter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneConfig {
    pub mbox: String,
    pub ns: String,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub ttl: u32,
    pub minttl: u32,
    pub cname_flattening: bool,
    pub domain_id: String,
}

/// The serial number used for synthesized SOA records, matching the
/// value observed in the upstream project's test fixtures.
pub const DEFAULT_SOA_SERIAL: u32 = 1_460_498_836;

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            mbox: String::new(),
            ns: String::new(),
            refresh: 0,
            retry: 0,
            expire: 0,
            ttl: 300,
            minttl: 100,
            cname_flattening: false,
            domain_id: String::new(),
        }
    }
}

impl ZoneConfig {
    /// Build the SOA RDATA this config implies for `apex`.
    pub fn to_soa(&self, apex: &DomainName) -> RecordTypeWithData {
        RecordTypeWithData::SOA {
            mname: DomainName::from_dotted_string(&self.ns)
                .unwrap_or_else(|| apex.clone()),
            rname: DomainName::from_dotted_string(&self.mbox)
                .unwrap_or_else(|| apex.clone()),
            serial: DEFAULT_SOA_SERIAL,
            refresh: self.refresh,
            retry: self.retry,
            expire: self.expire,
            minimum: self.minttl,
        }
    }

    pub fn soa_rr(&self, apex: &DomainName) -> ResourceRecord {
        ResourceRecord {
            name: apex.clone(),
            rtype_with_data: self.to_soa(apex),
            rclass: RecordClass::IN,
            ttl: self.minttl,
        }
    }

    pub fn ns_rr(&self, apex: &DomainName) -> Option<ResourceRecord> {
        let nsdname = DomainName::from_dotted_string(&self.ns)?;
        Some(ResourceRecord {
            name: apex.clone(),
            rtype_with_data: RecordTypeWithData::NS { nsdname },
            rclass: RecordClass::IN,
            ttl: self.ttl,
        })
    }
}

/// How many A/AAAA records to return.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum FilterCount {
    #[default]
    Multi,
    Single,
}

/// How to order (and, for `single`, select among) the surviving
/// A/AAAA records.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum FilterOrder {
    #[default]
    None,
    Weighted,
    Rr,
}

/// Which geographic/network dimension to filter A/AAAA records by.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum GeoFilter {
    #[default]
    None,
    Country,
    Location,
    Asn,
    AsnCountry,
}

/// The filter and selection policy for an A/AAAA record set.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Filter {
    pub count: FilterCount,
    pub order: FilterOrder,
    pub geo_filter: GeoFilter,
}

/// A single A or AAAA record, with the metadata the filter/selector
/// needs to apply geo/ASN/weighted selection.
///
/// An empty `country` or `asn` set means "matches any" - see
/// `matches_country`/`matches_asn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IPRecord {
    pub ip: IpAddrValue,
    pub country: BTreeSet<String>,
    pub asn: BTreeSet<u32>,
    pub weight: u32,
}

impl IPRecord {
    pub fn matches_country(&self, country: &str) -> bool {
        self.country.is_empty() || self.country.iter().any(|c| c.eq_ignore_ascii_case(country))
    }

    pub fn matches_asn(&self, asn: u32) -> bool {
        self.asn.is_empty() || self.asn.contains(&asn)
    }
}

/// Either flavour of address a record bundle's `A`/`AAAA` entries can
/// hold.  The wire `A` vs `AAAA` rtype is determined by which variant
/// this is, not by a separate field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IpAddrValue {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl From<IpAddrValue> for std::net::IpAddr {
    fn from(value: IpAddrValue) -> Self {
        match value {
            IpAddrValue::V4(addr) => std::net::IpAddr::V4(addr),
            IpAddrValue::V6(addr) => std::net::IpAddr::V6(addr),
        }
    }
}

/// `{ttl, filter?, records: [IPRecord]}` - the `A`/`AAAA` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecordSet {
    pub ttl: u32,
    pub filter: Filter,
    pub records: Vec<IPRecord>,
}

/// `{ttl, records: [{text}]}` - the `TXT` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtRecordSet {
    pub ttl: u32,
    pub records: Vec<String>,
}

/// `{ttl, host}` - the `CNAME` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnameRecord {
    pub ttl: u32,
    pub host: DomainName,
}

/// `{ttl, records: [host]}` - the `NS` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsRecordSet {
    pub ttl: u32,
    pub records: Vec<DomainName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxEntry {
    pub preference: u16,
    pub host: DomainName,
}

/// `{ttl, records: [{preference, host}]}` - the `MX` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecordSet {
    pub ttl: u32,
    pub records: Vec<MxEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvEntry {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: DomainName,
}

/// `{ttl, records: [{priority, weight, port, target}]}` - the `SRV`
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecordSet {
    pub ttl: u32,
    pub records: Vec<SrvEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsaEntry {
    pub cert_usage: u8,
    pub selector: u8,
    pub matching_type: u8,
    pub certificate: bytes::Bytes,
}

/// `{ttl, records: [...]}` - the `TLSA` payload (RFC 6698).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsaRecordSet {
    pub ttl: u32,
    pub records: Vec<TlsaEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaaEntry {
    pub flag: u8,
    pub tag: String,
    pub value: String,
}

/// `{ttl, records: [...]}` - the `CAA` payload (RFC 6844).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaaRecordSet {
    pub ttl: u32,
    pub records: Vec<CaaEntry>,
}

/// `{ttl, host}` - the `PTR` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtrRecord {
    pub ttl: u32,
    pub host: DomainName,
}

/// `{location}` - the non-standard `ANAME` payload.  `location` is
/// substituted for A/AAAA at query time; it never appears on the
/// wire under its own type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnameRecord {
    pub location: DomainName,
}

/// Everything a named node can carry, as fetched from the record
/// store for one `(origin, node_path)` pair.
///
/// A record type absent from the bundle is represented as `None`; a
/// record type present in the store but with zero surviving records
/// (after parsing) is normalized to `None` as well, per the parsing
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordBundle {
    pub a: Option<AddressRecordSet>,
    pub aaaa: Option<AddressRecordSet>,
    pub txt: Option<TxtRecordSet>,
    pub cname: Option<CnameRecord>,
    pub ns: Option<NsRecordSet>,
    pub mx: Option<MxRecordSet>,
    pub srv: Option<SrvRecordSet>,
    pub tlsa: Option<TlsaRecordSet>,
    pub caa: Option<CaaRecordSet>,
    pub ptr: Option<PtrRecord>,
    pub aname: Option<AnameRecord>,
}

impl RecordBundle {
    pub fn is_empty(&self) -> bool {
        self.a.is_none()
            && self.aaaa.is_none()
            && self.txt.is_none()
            && self.cname.is_none()
            && self.ns.is_none()
            && self.mx.is_none()
            && self.srv.is_none()
            && self.tlsa.is_none()
            && self.caa.is_none()
            && self.ptr.is_none()
            && self.aname.is_none()
    }
}
