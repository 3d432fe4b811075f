//! Parsing of the JSON payloads stored in the external key-value
//! store: a zone's config blob, and a named node's record bundle.
//!
//! Per the parsing contract, unknown fields are ignored and absent
//! fields get their documented defaults.  A record type whose payload
//! fails to parse - or whose `records` array is present but ends up
//! empty after dropping individually-unparsable entries - is treated
//! as though the type were absent entirely, rather than failing the
//! whole bundle.

use std::collections::BTreeSet;

use bytes::Bytes;
use serde_json::Value;

use crate::protocol::types::DomainName;
use crate::zones::types::*;

impl ZoneConfig {
    /// Parse a `zones:<origin>:config` value.  Returns the default
    /// config if the JSON is malformed or is not an object - this
    /// mirrors treating a broken config as "use defaults" rather than
    /// refusing to serve the zone.
    pub fn parse(json: &str) -> Self {
        let Ok(Value::Object(top)) = serde_json::from_str::<Value>(json) else {
            return Self::default();
        };

        let mut config = Self::default();

        if let Some(Value::Object(soa)) = top.get("soa") {
            if let Some(v) = soa.get("mbox").and_then(Value::as_str) {
                config.mbox = v.to_string();
            }
            if let Some(v) = soa.get("ns").and_then(Value::as_str) {
                config.ns = v.to_string();
            }
            if let Some(v) = soa.get("refresh").and_then(Value::as_u64) {
                config.refresh = v as u32;
            }
            if let Some(v) = soa.get("retry").and_then(Value::as_u64) {
                config.retry = v as u32;
            }
            if let Some(v) = soa.get("expire").and_then(Value::as_u64) {
                config.expire = v as u32;
            }
            if let Some(v) = soa.get("ttl").and_then(Value::as_u64) {
                config.ttl = v as u32;
            }
            if let Some(v) = soa.get("minttl").and_then(Value::as_u64) {
                config.minttl = v as u32;
            }
        }

        if let Some(v) = top.get("cname_flattening").and_then(Value::as_bool) {
            config.cname_flattening = v;
        }
        if let Some(v) = top.get("domain_id").and_then(Value::as_str) {
            config.domain_id = v.to_string();
        }

        config
    }
}

impl RecordBundle {
    /// Parse a `zones:<origin>` hash field value (one named node's
    /// record bundle).  Returns an empty bundle if the JSON is not an
    /// object; each top-level record type is parsed independently and
    /// dropped (left `None`) if it doesn't fit its documented shape.
    pub fn parse(json: &str) -> Self {
        let Ok(Value::Object(top)) = serde_json::from_str::<Value>(json) else {
            return Self::default();
        };

        Self {
            a: top.get("a").and_then(|v| parse_address_set(v, false)),
            aaaa: top.get("aaaa").and_then(|v| parse_address_set(v, true)),
            txt: top.get("txt").and_then(parse_txt_set),
            cname: top.get("cname").and_then(parse_cname),
            ns: top.get("ns").and_then(parse_ns_set),
            mx: top.get("mx").and_then(parse_mx_set),
            srv: top.get("srv").and_then(parse_srv_set),
            tlsa: top.get("tlsa").and_then(parse_tlsa_set),
            caa: top.get("caa").and_then(parse_caa_set),
            ptr: top.get("ptr").and_then(parse_ptr),
            aname: top.get("aname").and_then(parse_aname),
        }
    }
}

fn as_u32(v: &Value) -> Option<u32> {
    v.as_u64().map(|n| n as u32)
}

fn as_u16(v: &Value) -> Option<u16> {
    v.as_u64().map(|n| n as u16)
}

fn as_u8(v: &Value) -> Option<u8> {
    v.as_u64().map(|n| n as u8)
}

/// `country`/`asn` accept either a bare scalar or a JSON array; either
/// form normalizes to a set, with absence (or an empty string) meaning
/// "no constraint" - an empty set.
fn scalar_or_array_strings(v: Option<&Value>) -> BTreeSet<String> {
    match v {
        Some(Value::String(s)) if !s.is_empty() => {
            let mut set = BTreeSet::new();
            set.insert(s.clone());
            set
        }
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn scalar_or_array_u32(v: Option<&Value>) -> BTreeSet<u32> {
    match v {
        Some(Value::Number(n)) => {
            let mut set = BTreeSet::new();
            if let Some(asn) = n.as_u64() {
                if asn != 0 {
                    set.insert(asn as u32);
                }
            }
            set
        }
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_u64)
            .filter(|n| *n != 0)
            .map(|n| n as u32)
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn parse_filter(v: Option<&Value>) -> Filter {
    let Some(Value::Object(obj)) = v else {
        return Filter::default();
    };

    let count = match obj.get("count").and_then(Value::as_str) {
        Some("single") => FilterCount::Single,
        _ => FilterCount::Multi,
    };
    let order = match obj.get("order").and_then(Value::as_str) {
        Some("weighted") => FilterOrder::Weighted,
        Some("rr") => FilterOrder::Rr,
        _ => FilterOrder::None,
    };
    let geo_filter = match obj.get("geo_filter").and_then(Value::as_str) {
        Some("country") => GeoFilter::Country,
        Some("location") => GeoFilter::Location,
        Some("asn") => GeoFilter::Asn,
        Some("asn+country") => GeoFilter::AsnCountry,
        _ => GeoFilter::None,
    };

    Filter {
        count,
        order,
        geo_filter,
    }
}

fn parse_address_set(v: &Value, is_v6: bool) -> Option<AddressRecordSet> {
    let obj = v.as_object()?;
    let ttl = obj.get("ttl").and_then(as_u32).unwrap_or(0);
    let filter = parse_filter(obj.get("filter"));

    let records: Vec<IPRecord> = obj
        .get("records")?
        .as_array()?
        .iter()
        .filter_map(|r| {
            let r = r.as_object()?;
            let ip_str = r.get("ip")?.as_str()?;
            let ip = if is_v6 {
                IpAddrValue::V6(ip_str.parse().ok()?)
            } else {
                IpAddrValue::V4(ip_str.parse().ok()?)
            };
            Some(IPRecord {
                ip,
                country: scalar_or_array_strings(r.get("country")),
                asn: scalar_or_array_u32(r.get("asn")),
                weight: r.get("weight").and_then(as_u32).unwrap_or(0),
            })
        })
        .collect();

    if records.is_empty() {
        return None;
    }

    Some(AddressRecordSet {
        ttl,
        filter,
        records,
    })
}

fn parse_txt_set(v: &Value) -> Option<TxtRecordSet> {
    let obj = v.as_object()?;
    let ttl = obj.get("ttl").and_then(as_u32).unwrap_or(0);
    let records: Vec<String> = obj
        .get("records")?
        .as_array()?
        .iter()
        .filter_map(|r| r.as_object()?.get("text")?.as_str().map(str::to_string))
        .collect();

    if records.is_empty() {
        return None;
    }

    Some(TxtRecordSet { ttl, records })
}

fn parse_cname(v: &Value) -> Option<CnameRecord> {
    let obj = v.as_object()?;
    let ttl = obj.get("ttl").and_then(as_u32).unwrap_or(0);
    let host = DomainName::from_dotted_string(obj.get("host")?.as_str()?)?;
    Some(CnameRecord { ttl, host })
}

fn parse_ns_set(v: &Value) -> Option<NsRecordSet> {
    let obj = v.as_object()?;
    let ttl = obj.get("ttl").and_then(as_u32).unwrap_or(0);
    let records: Vec<DomainName> = obj
        .get("records")?
        .as_array()?
        .iter()
        .filter_map(|r| DomainName::from_dotted_string(r.as_object()?.get("host")?.as_str()?))
        .collect();

    if records.is_empty() {
        return None;
    }

    Some(NsRecordSet { ttl, records })
}

fn parse_mx_set(v: &Value) -> Option<MxRecordSet> {
    let obj = v.as_object()?;
    let ttl = obj.get("ttl").and_then(as_u32).unwrap_or(0);
    let records: Vec<MxEntry> = obj
        .get("records")?
        .as_array()?
        .iter()
        .filter_map(|r| {
            let r = r.as_object()?;
            let host = DomainName::from_dotted_string(r.get("host")?.as_str()?)?;
            let preference = r.get("preference").and_then(as_u16).unwrap_or(0);
            Some(MxEntry { preference, host })
        })
        .collect();

    if records.is_empty() {
        return None;
    }

    Some(MxRecordSet { ttl, records })
}

fn parse_srv_set(v: &Value) -> Option<SrvRecordSet> {
    let obj = v.as_object()?;
    let ttl = obj.get("ttl").and_then(as_u32).unwrap_or(0);
    let records: Vec<SrvEntry> = obj
        .get("records")?
        .as_array()?
        .iter()
        .filter_map(|r| {
            let r = r.as_object()?;
            let target = DomainName::from_dotted_string(r.get("target")?.as_str()?)?;
            Some(SrvEntry {
                priority: r.get("priority").and_then(as_u16).unwrap_or(0),
                weight: r.get("weight").and_then(as_u16).unwrap_or(0),
                port: r.get("port").and_then(as_u16).unwrap_or(0),
                target,
            })
        })
        .collect();

    if records.is_empty() {
        return None;
    }

    Some(SrvRecordSet { ttl, records })
}

fn parse_tlsa_set(v: &Value) -> Option<TlsaRecordSet> {
    let obj = v.as_object()?;
    let ttl = obj.get("ttl").and_then(as_u32).unwrap_or(0);
    let records: Vec<TlsaEntry> = obj
        .get("records")?
        .as_array()?
        .iter()
        .filter_map(|r| {
            let r = r.as_object()?;
            let certificate = decode_hex(r.get("certificate")?.as_str()?)?;
            Some(TlsaEntry {
                cert_usage: r.get("usage").and_then(as_u8).unwrap_or(0),
                selector: r.get("selector").and_then(as_u8).unwrap_or(0),
                matching_type: r.get("matching_type").and_then(as_u8).unwrap_or(0),
                certificate,
            })
        })
        .collect();

    if records.is_empty() {
        return None;
    }

    Some(TlsaRecordSet { ttl, records })
}

fn parse_caa_set(v: &Value) -> Option<CaaRecordSet> {
    let obj = v.as_object()?;
    let ttl = obj.get("ttl").and_then(as_u32).unwrap_or(0);
    let records: Vec<CaaEntry> = obj
        .get("records")?
        .as_array()?
        .iter()
        .filter_map(|r| {
            let r = r.as_object()?;
            let tag = r.get("tag")?.as_str()?.to_string();
            let value = r.get("value")?.as_str()?.to_string();
            Some(CaaEntry {
                flag: r.get("flag").and_then(as_u8).unwrap_or(0),
                tag,
                value,
            })
        })
        .collect();

    if records.is_empty() {
        return None;
    }

    Some(CaaRecordSet { ttl, records })
}

fn parse_ptr(v: &Value) -> Option<PtrRecord> {
    let obj = v.as_object()?;
    let ttl = obj.get("ttl").and_then(as_u32).unwrap_or(0);
    let host = DomainName::from_relative_dotted_string(
        &DomainName::root_domain(),
        obj.get("domain")?.as_str()?,
    )?;
    Some(PtrRecord { ttl, host })
}

fn parse_aname(v: &Value) -> Option<AnameRecord> {
    let obj = v.as_object()?;
    let location = DomainName::from_relative_dotted_string(
        &DomainName::root_domain(),
        obj.get("location")?.as_str()?,
    )?;
    Some(AnameRecord { location })
}

fn decode_hex(s: &str) -> Option<Bytes> {
    if s.len() % 2 != 0 {
        return None;
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for chunk in bytes.chunks(2) {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }

    Some(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::domain;

    #[test]
    fn parses_zone_config() {
        let config = ZoneConfig::parse(
            r#"{"soa":{"ttl":300, "minttl":100, "mbox":"hostmaster.example.com.","ns":"ns1.example.com.","refresh":44,"retry":55,"expire":66},"cname_flattening":true}"#,
        );

        assert_eq!("hostmaster.example.com.", config.mbox);
        assert_eq!("ns1.example.com.", config.ns);
        assert_eq!(300, config.ttl);
        assert_eq!(100, config.minttl);
        assert_eq!(44, config.refresh);
        assert_eq!(55, config.retry);
        assert_eq!(66, config.expire);
        assert!(config.cname_flattening);
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let config = ZoneConfig::parse("not json");
        assert_eq!(ZoneConfig::default(), config);
    }

    #[test]
    fn parses_a_records_with_scalar_country() {
        let bundle = RecordBundle::parse(
            r#"{"a":{"ttl":300, "records":[{"ip":"1.2.3.4", "country":"ES"},{"ip":"5.6.7.8", "country":""}]}}"#,
        );

        let a = bundle.a.unwrap();
        assert_eq!(300, a.ttl);
        assert_eq!(2, a.records.len());
        assert!(a.records[0].country.contains("ES"));
        assert!(a.records[1].country.is_empty());
    }

    #[test]
    fn parses_cname_and_aname() {
        let bundle = RecordBundle::parse(r#"{"cname":{"ttl":300, "host":"x.example.com."}}"#);
        assert_eq!(domain("x.example.com."), bundle.cname.unwrap().host);

        let bundle = RecordBundle::parse(r#"{"aname":{"location":"aname.arvan.an."}}"#);
        assert_eq!(domain("aname.arvan.an."), bundle.aname.unwrap().location);
    }

    #[test]
    fn parses_tlsa_with_hex_certificate() {
        let bundle = RecordBundle::parse(
            r#"{"tlsa":{"ttl":300, "records":[{"usage":0, "selector":0, "matching_type":1, "certificate":"abcd"}]}}"#,
        );
        let tlsa = bundle.tlsa.unwrap();
        assert_eq!(1, tlsa.records.len());
        assert_eq!(
            Bytes::from_static(&[0xab, 0xcd]),
            tlsa.records[0].certificate
        );
    }

    #[test]
    fn parses_ptr_domain_field() {
        let bundle = RecordBundle::parse(r#"{"ptr":{"ttl":300, "domain":"localhost"}}"#);
        assert_eq!(domain("localhost."), bundle.ptr.unwrap().host);
    }

    #[test]
    fn record_type_with_zero_surviving_records_is_absent() {
        let bundle = RecordBundle::parse(r#"{"a":{"ttl":300, "records":[{"ip":"not-an-ip"}]}}"#);
        assert!(bundle.a.is_none());
    }

    #[test]
    fn unparsable_bundle_is_empty() {
        let bundle = RecordBundle::parse("not json");
        assert!(bundle.is_empty());
    }

    #[test]
    fn parses_filter() {
        let bundle = RecordBundle::parse(
            r#"{"a":{"ttl":300, "filter": {"count":"single", "order": "weighted", "geo_filter":"asn+country"}, "records":[{"ip":"1.1.1.1", "weight":1}]}}"#,
        );
        let filter = bundle.a.unwrap().filter;
        assert_eq!(FilterCount::Single, filter.count);
        assert_eq!(FilterOrder::Weighted, filter.order);
        assert_eq!(GeoFilter::AsnCountry, filter.geo_filter);
    }
}
