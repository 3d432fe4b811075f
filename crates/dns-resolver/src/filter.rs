//! Component D: the filter and selector pipeline applied to an
//! `A`/`AAAA` record set before it goes on the wire.
//!
//! The pipeline runs in two stages:
//!
//! 1. `geo_filter` narrows the candidate set down using whatever the
//!    client's resolved location tells us (its country, its ASN, or
//!    its approximate coordinates). A narrowing that would leave
//!    nothing to answer with is abandoned - matching records still
//!    beat no records.
//! 2. `order` decides both how the survivors are ordered and, via
//!    `count`, how many of them are actually returned.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use rand::Rng;

use dns_types::zones::types::{FilterCount, FilterOrder, GeoFilter, IPRecord};

use crate::geo::{haversine_km, GeoDatabase, GeoInfo};

/// What we know about the querying client, used to evaluate geo
/// filters. All fields are best-effort: a `None` simply means that
/// dimension can't narrow the candidate set.
#[derive(Debug, Clone, Default)]
pub struct ClientLocation {
    pub country: Option<String>,
    pub asn: Option<u32>,
    pub coordinates: Option<(f64, f64)>,
}

impl ClientLocation {
    pub fn from_ip(ip: IpAddr, geo: &GeoDatabase) -> Self {
        let GeoInfo {
            country,
            asn,
            coordinates,
        } = geo.lookup(ip);

        Self {
            country: country.and_then(|c| std::str::from_utf8(&c).ok().map(str::to_string)),
            asn,
            coordinates,
        }
    }
}

/// Per-node round-robin counters for `order: rr`, keyed by an
/// arbitrary caller-chosen identifier (typically `origin + node_path +
/// qtype`).
#[derive(Debug, Default)]
pub struct RrCounters {
    counters: Mutex<HashMap<String, u64>>,
}

impl RrCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the counter for `key`, wrapping it into
    /// `0..modulus`.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    fn next(&self, key: &str, modulus: usize) -> usize {
        if modulus == 0 {
            return 0;
        }

        let mut counters = self.counters.lock().expect("rr counters poisoned");
        let counter = counters.entry(key.to_string()).or_insert(0);
        let value = (*counter as usize) % modulus;
        *counter = counter.wrapping_add(1);
        value
    }
}

/// Run the geo-filter -> count/order pipeline over `records`.
///
/// `rr_key` identifies the node for round-robin state; `rng` drives
/// weighted sampling - pass a seeded source in tests for determinism.
pub fn apply(
    records: &[IPRecord],
    geo_filter: GeoFilter,
    count: FilterCount,
    order: FilterOrder,
    client: &ClientLocation,
    geo: &GeoDatabase,
    rr_counters: &RrCounters,
    rr_key: &str,
    rng: &mut impl Rng,
) -> Vec<IPRecord> {
    let candidates = apply_geo_filter(records, geo_filter, client, geo);
    apply_order(&candidates, count, order, rr_counters, rr_key, rng)
}

fn apply_geo_filter(
    records: &[IPRecord],
    geo_filter: GeoFilter,
    client: &ClientLocation,
    geo: &GeoDatabase,
) -> Vec<IPRecord> {
    match geo_filter {
        GeoFilter::None => records.to_vec(),
        GeoFilter::Country => country_pool(records, client.country.as_deref()),
        GeoFilter::Asn => asn_pool(records, client.asn),
        GeoFilter::AsnCountry => {
            let country_pass = country_pool(records, client.country.as_deref());
            let asn_pass = asn_pool(records, client.asn);
            let asn_ips: std::collections::HashSet<_> = asn_pass.iter().map(|r| r.ip).collect();
            let combined: Vec<IPRecord> = country_pass.into_iter().filter(|r| asn_ips.contains(&r.ip)).collect();
            if combined.is_empty() {
                records
                    .iter()
                    .filter(|r| r.country.is_empty() && r.asn.is_empty())
                    .cloned()
                    .collect()
            } else {
                combined
            }
        }
        GeoFilter::Location => match client.coordinates {
            Some(client_coords) => nearest_by_location(records, client_coords, geo),
            None => records.to_vec(),
        },
    }
}

/// §4.4.1 `country`: records explicitly tagged with the client's
/// country take priority; if none are tagged (or the client's country
/// is unknown), fall back to the untagged (unconstrained) records.
fn country_pool(records: &[IPRecord], country: Option<&str>) -> Vec<IPRecord> {
    let tagged: Vec<IPRecord> = match country {
        Some(country) => records
            .iter()
            .filter(|r| !r.country.is_empty() && r.country.iter().any(|c| c.eq_ignore_ascii_case(country)))
            .cloned()
            .collect(),
        None => Vec::new(),
    };
    if !tagged.is_empty() {
        return tagged;
    }
    records.iter().filter(|r| r.country.is_empty()).cloned().collect()
}

/// §4.4.1 `asn`: the ASN analogue of `country_pool`.
fn asn_pool(records: &[IPRecord], asn: Option<u32>) -> Vec<IPRecord> {
    let tagged: Vec<IPRecord> = match asn {
        Some(asn) => records.iter().filter(|r| !r.asn.is_empty() && r.asn.contains(&asn)).cloned().collect(),
        None => Vec::new(),
    };
    if !tagged.is_empty() {
        return tagged;
    }
    records.iter().filter(|r| r.asn.is_empty()).cloned().collect()
}

/// Keep the record(s) whose resolved coordinates are closest to the
/// client's. Records we can't geolocate are dropped; if none can be
/// geolocated, every record passes through unfiltered.
fn nearest_by_location(
    records: &[IPRecord],
    client_coords: (f64, f64),
    geo: &GeoDatabase,
) -> Vec<IPRecord> {
    let mut with_distance: Vec<(f64, &IPRecord)> = records
        .iter()
        .filter_map(|r| {
            let ip: IpAddr = r.ip.into();
            let coords = geo.lookup(ip).coordinates?;
            Some((haversine_km(client_coords, coords), r))
        })
        .collect();

    if with_distance.is_empty() {
        return records.to_vec();
    }

    with_distance.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let nearest = with_distance[0].0;
    with_distance
        .into_iter()
        .filter(|(d, _)| (*d - nearest).abs() < f64::EPSILON)
        .map(|(_, r)| r.clone())
        .collect()
}

fn apply_order(
    candidates: &[IPRecord],
    count: FilterCount,
    order: FilterOrder,
    rr_counters: &RrCounters,
    rr_key: &str,
    rng: &mut impl Rng,
) -> Vec<IPRecord> {
    if candidates.is_empty() {
        return Vec::new();
    }

    match order {
        FilterOrder::None => match count {
            FilterCount::Single => vec![candidates[0].clone()],
            FilterCount::Multi => candidates.to_vec(),
        },
        FilterOrder::Rr => {
            let start = rr_counters.next(rr_key, candidates.len());
            let rotated: Vec<IPRecord> = candidates[start..]
                .iter()
                .chain(candidates[..start].iter())
                .cloned()
                .collect();
            match count {
                FilterCount::Single => vec![rotated[0].clone()],
                FilterCount::Multi => rotated,
            }
        }
        FilterOrder::Weighted => {
            let permutation = weighted_permutation(candidates, rng);
            match count {
                FilterCount::Single => vec![permutation[0].clone()],
                FilterCount::Multi => permutation,
            }
        }
    }
}

/// Weighted sampling without replacement: repeatedly pick one record
/// with probability proportional to its weight among those not yet
/// picked, producing a full permutation.
///
/// If every record has weight zero, falls back to uniform sampling
/// (every record is equally likely at each step) rather than picking
/// nothing.
fn weighted_permutation(candidates: &[IPRecord], rng: &mut impl Rng) -> Vec<IPRecord> {
    let mut pool: Vec<IPRecord> = candidates.to_vec();
    let mut out = Vec::with_capacity(pool.len());

    while !pool.is_empty() {
        let total_weight: u64 = pool.iter().map(|r| u64::from(r.weight)).sum();

        let idx = if total_weight == 0 {
            rng.gen_range(0..pool.len())
        } else {
            let mut target = rng.gen_range(0..total_weight);
            let mut chosen = pool.len() - 1;
            for (i, r) in pool.iter().enumerate() {
                let w = u64::from(r.weight);
                if target < w {
                    chosen = i;
                    break;
                }
                target -= w;
            }
            chosen
        };

        out.push(pool.swap_remove(idx));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::zones::types::IpAddrValue;
    use rand::SeedableRng;
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;

    fn ip_record(ip: [u8; 4], country: &str, asn: u32, weight: u32) -> IPRecord {
        IPRecord {
            ip: IpAddrValue::V4(Ipv4Addr::from(ip)),
            country: if country.is_empty() {
                BTreeSet::new()
            } else {
                BTreeSet::from([country.to_string()])
            },
            asn: if asn == 0 { BTreeSet::new() } else { BTreeSet::from([asn]) },
            weight,
        }
    }

    #[test]
    fn geo_filter_no_tagged_or_untagged_match_is_empty() {
        // Neither record is tagged for the client's country, and
        // neither is untagged, so there's nothing left to fall back to.
        let records = vec![ip_record([1, 1, 1, 1], "GB", 0, 0), ip_record([2, 2, 2, 2], "FR", 0, 0)];
        let client = ClientLocation {
            country: Some("ES".to_string()),
            ..Default::default()
        };

        let result = apply_geo_filter(&records, GeoFilter::Country, &client, &GeoDatabase::empty());
        assert!(result.is_empty());
    }

    #[test]
    fn geo_filter_unknown_client_country_falls_back_to_untagged() {
        let records = vec![
            ip_record([1, 1, 1, 1], "GB", 0, 0),
            ip_record([2, 2, 2, 2], "FR", 0, 0),
            ip_record([3, 3, 3, 3], "", 0, 0),
        ];
        let result = apply_geo_filter(&records, GeoFilter::Country, &ClientLocation::default(), &GeoDatabase::empty());
        assert_eq!(1, result.len());
        assert_eq!(IpAddrValue::V4(Ipv4Addr::new(3, 3, 3, 3)), result[0].ip);
    }

    #[test]
    fn geo_filter_country_keeps_matching_only() {
        let records = vec![ip_record([1, 1, 1, 1], "GB", 0, 0), ip_record([2, 2, 2, 2], "FR", 0, 0)];
        let client = ClientLocation {
            country: Some("FR".to_string()),
            ..Default::default()
        };

        let result = apply_geo_filter(&records, GeoFilter::Country, &client, &GeoDatabase::empty());
        assert_eq!(1, result.len());
        assert_eq!(IpAddrValue::V4(Ipv4Addr::new(2, 2, 2, 2)), result[0].ip);
    }

    #[test]
    fn geo_filter_asn_country_combines_both_dimensions() {
        let records = vec![
            ip_record([1, 1, 1, 1], "DE", 47447, 0),
            ip_record([2, 2, 2, 2], "DE", 20776, 0),
            ip_record([3, 3, 3, 3], "GB", 0, 0),
            ip_record([4, 4, 4, 4], "", 0, 0),
        ];

        // both country and ASN tagged-match: only the intersection survives.
        let client = ClientLocation {
            country: Some("DE".to_string()),
            asn: Some(47447),
            ..Default::default()
        };
        let result = apply_geo_filter(&records, GeoFilter::AsnCountry, &client, &GeoDatabase::empty());
        assert_eq!(1, result.len());
        assert_eq!(IpAddrValue::V4(Ipv4Addr::new(1, 1, 1, 1)), result[0].ip);

        // unresolved client falls back to the untagged-in-both-dimensions record.
        let result = apply_geo_filter(&records, GeoFilter::AsnCountry, &ClientLocation::default(), &GeoDatabase::empty());
        assert_eq!(1, result.len());
        assert_eq!(IpAddrValue::V4(Ipv4Addr::new(4, 4, 4, 4)), result[0].ip);
    }

    #[test]
    fn order_none_single_takes_first() {
        let records = vec![ip_record([1, 1, 1, 1], "", 0, 0), ip_record([2, 2, 2, 2], "", 0, 0)];
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let result = apply_order(&records, FilterCount::Single, FilterOrder::None, &RrCounters::new(), "k", &mut rng);
        assert_eq!(1, result.len());
        assert_eq!(records[0].ip, result[0].ip);
    }

    #[test]
    fn order_rr_rotates_through_records() {
        let records = vec![
            ip_record([1, 1, 1, 1], "", 0, 0),
            ip_record([2, 2, 2, 2], "", 0, 0),
            ip_record([3, 3, 3, 3], "", 0, 0),
        ];
        let counters = RrCounters::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);

        let first = apply_order(&records, FilterCount::Single, FilterOrder::Rr, &counters, "k", &mut rng);
        let second = apply_order(&records, FilterCount::Single, FilterOrder::Rr, &counters, "k", &mut rng);
        let third = apply_order(&records, FilterCount::Single, FilterOrder::Rr, &counters, "k", &mut rng);
        let fourth = apply_order(&records, FilterCount::Single, FilterOrder::Rr, &counters, "k", &mut rng);

        assert_eq!(records[0].ip, first[0].ip);
        assert_eq!(records[1].ip, second[0].ip);
        assert_eq!(records[2].ip, third[0].ip);
        assert_eq!(records[0].ip, fourth[0].ip);
    }

    #[test]
    fn weighted_multi_is_a_permutation() {
        let records = vec![
            ip_record([1, 1, 1, 1], "", 0, 5),
            ip_record([2, 2, 2, 2], "", 0, 1),
            ip_record([3, 3, 3, 3], "", 0, 10),
        ];
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        let result = weighted_permutation(&records, &mut rng);
        assert_eq!(3, result.len());

        let mut ips: Vec<_> = result.iter().map(|r| r.ip).collect();
        ips.sort_by_key(|ip| format!("{ip:?}"));
        let mut expected: Vec<_> = records.iter().map(|r| r.ip).collect();
        expected.sort_by_key(|ip| format!("{ip:?}"));
        assert_eq!(expected, ips);
    }

    #[test]
    fn weighted_all_zero_falls_back_to_uniform() {
        let records = vec![ip_record([1, 1, 1, 1], "", 0, 0), ip_record([2, 2, 2, 2], "", 0, 0)];
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let result = weighted_permutation(&records, &mut rng);
        assert_eq!(2, result.len());
    }
}
