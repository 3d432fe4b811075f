//! Component C: the resolver engine.
//!
//! This is the core of the whole system - everything else exists to
//! feed it data or to carry its answers onto the wire. `resolve`
//! implements the algorithm in one pass per CNAME/ANAME hop: authority
//! check, qtype dispatch, apex special-casing, wildcard-synthesizing
//! node lookup, CNAME/ANAME indirection, record emission, and the
//! empty-answer and TXT-segmentation rules.

use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::SeedableRng;

use dns_types::protocol::types::{
    DomainName, QueryType, RecordClass, RecordType, RecordTypeWithData, ResourceRecord,
};
use dns_types::zones::types::{AddressRecordSet, NodePath, RecordBundle, ZoneConfig};

use crate::filter::{self, ClientLocation, RrCounters};
use crate::geo::GeoDatabase;
use crate::record_store::{Kvs, RecordStore};
use crate::upstream::UpstreamResolver;
use crate::Context;
use dns_types::protocol::types::Rcode;
use crate::zone_index::ZoneIndex;

/// The outcome of one `resolve` call: an RCODE plus the answer and
/// authority sections. The additional section is never populated by
/// the core (see §6 - only the interfaces the core consumes are
/// specified; EDNS/additional-section bookkeeping is a server concern).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolution {
    pub rcode: Rcode,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
}

impl Resolution {
    fn not_auth() -> Self {
        Self {
            rcode: Rcode::NotAuth,
            ..Default::default()
        }
    }

    fn servfail() -> Self {
        Self {
            rcode: Rcode::ServerFailure,
            ..Default::default()
        }
    }
}

enum NodeLookup {
    Found(RecordBundle),
    /// No record data at this path, nor any node beneath it: the name
    /// doesn't exist.
    NotFound,
    /// No record data at this path, but a descendant node has data -
    /// the name exists as a structural node, just an empty one.
    EmptyNonTerminal,
}

enum AnameOutcome {
    Records(Vec<ResourceRecord>),
    Cname(ResourceRecord),
    ServFail,
}

/// Qtypes this resolver has a node-level record type for. `ANAME`
/// never appears here: it is a zone-data concept, substituted away
/// before anything reaches the wire (see §6.3 step 6).
fn record_type_for_qtype(qtype: QueryType) -> Option<RecordType> {
    match qtype {
        QueryType::Record(
            rtype @ (RecordType::A
            | RecordType::AAAA
            | RecordType::TXT
            | RecordType::CNAME
            | RecordType::NS
            | RecordType::MX
            | RecordType::SRV
            | RecordType::TLSA
            | RecordType::CAA
            | RecordType::PTR
            | RecordType::SOA),
        ) => Some(rtype),
        _ => None,
    }
}

/// Qtypes for which CNAME flattening rewrites the terminal answer
/// instead of leaving the CNAME chain visible (§4.3 step 5).
fn flattens(qtype: QueryType) -> bool {
    matches!(
        qtype,
        QueryType::Record(
            RecordType::A | RecordType::AAAA | RecordType::TXT | RecordType::NS | RecordType::MX | RecordType::SRV
        )
    )
}

pub struct ResolverEngine<K: Kvs> {
    zone_index: ZoneIndex,
    record_store: RecordStore<K>,
    geo: GeoDatabase,
    rr_counters: RrCounters,
    upstream: UpstreamResolver,
    aname_upstream_fallback: bool,
    rng: Mutex<StdRng>,
    max_chain: usize,
    max_ttl: u32,
}

impl<K: Kvs> ResolverEngine<K> {
    pub fn new(
        zone_index: ZoneIndex,
        record_store: RecordStore<K>,
        geo: GeoDatabase,
        upstream: UpstreamResolver,
        aname_upstream_fallback: bool,
        max_chain: usize,
        max_ttl: u32,
    ) -> Self {
        Self {
            zone_index,
            record_store,
            geo,
            rr_counters: RrCounters::new(),
            upstream,
            aname_upstream_fallback,
            rng: Mutex::new(StdRng::from_entropy()),
            max_chain,
            max_ttl,
        }
    }

    /// Build an engine with a seeded RNG, for deterministic tests of
    /// `weighted` selection.
    #[cfg(test)]
    pub fn with_seed(
        zone_index: ZoneIndex,
        record_store: RecordStore<K>,
        geo: GeoDatabase,
        upstream: UpstreamResolver,
        aname_upstream_fallback: bool,
        max_chain: usize,
        max_ttl: u32,
        seed: u64,
    ) -> Self {
        let mut engine = Self::new(
            zone_index,
            record_store,
            geo,
            upstream,
            aname_upstream_fallback,
            max_chain,
            max_ttl,
        );
        engine.rng = Mutex::new(StdRng::seed_from_u64(seed));
        engine
    }

    /// The zone index this engine resolves against. Exposed so the
    /// reload controller can swap in fresh snapshots without owning
    /// the engine itself.
    pub fn zone_index(&self) -> &ZoneIndex {
        &self.zone_index
    }

    /// The record store this engine reads bundles and config from.
    /// Exposed so the reload controller can invalidate cache entries
    /// and enumerate origins.
    pub fn record_store(&self) -> &RecordStore<K> {
        &self.record_store
    }

    /// The geo/ASN database this engine consults for filtering.
    /// Exposed so the server can resolve a querying client's location
    /// once per request instead of re-opening the databases.
    pub fn geo(&self) -> &GeoDatabase {
        &self.geo
    }

    /// Resolve one `(qname, qtype)` question for `client`. Never
    /// panics and never leaves a query unanswered - every path returns
    /// a well-formed `Resolution` (§7: "errors never propagate past
    /// the query boundary").
    pub async fn resolve(&self, qname: &DomainName, qtype: QueryType, client: &ClientLocation) -> Resolution {
        let mut ctx = Context::new(self.max_chain);
        let mut answers: Vec<ResourceRecord> = Vec::new();
        let mut current = qname.clone();
        let mut flatten: Option<bool> = None;

        loop {
            if !ctx.visit(&current) {
                return Resolution::servfail();
            }

            let Some(origin) = self.zone_index.find(&current) else {
                return Resolution::not_auth();
            };

            let config = self.record_store.get_config(&origin).await;
            let flatten = *flatten.get_or_insert(config.cname_flattening);

            let Some(rtype) = record_type_for_qtype(qtype) else {
                return Resolution {
                    rcode: Rcode::NotImplemented,
                    answers: Vec::new(),
                    authority: vec![config.soa_rr(&origin)],
                };
            };

            let relative = NodePath::relative_to(&current, &origin).expect("zone index only returns ancestors");

            if relative.is_apex() {
                if rtype == RecordType::SOA {
                    return Resolution {
                        rcode: Rcode::NoError,
                        answers: vec![config.soa_rr(&origin)],
                        authority: Vec::new(),
                    };
                }
                if rtype == RecordType::NS {
                    return Resolution {
                        rcode: Rcode::NoError,
                        answers: config.ns_rr(&origin).into_iter().collect(),
                        authority: vec![config.soa_rr(&origin)],
                    };
                }
            }

            let bundle = match self.lookup_node(&origin, &relative).await {
                NodeLookup::Found(bundle) => bundle,
                NodeLookup::EmptyNonTerminal => {
                    return Resolution {
                        rcode: Rcode::NoError,
                        answers: Vec::new(),
                        authority: vec![config.soa_rr(&origin)],
                    };
                }
                NodeLookup::NotFound => {
                    return Resolution {
                        rcode: Rcode::NameError,
                        answers: Vec::new(),
                        authority: vec![config.soa_rr(&origin)],
                    };
                }
            };

            if let Some(cname) = &bundle.cname {
                if rtype != RecordType::CNAME {
                    answers.push(ResourceRecord {
                        name: current.clone(),
                        rtype_with_data: RecordTypeWithData::CNAME {
                            cname: cname.host.clone(),
                        },
                        rclass: RecordClass::IN,
                        ttl: cname.ttl.min(self.max_ttl),
                    });

                    if self.zone_index.find(&cname.host).is_none() {
                        return Resolution {
                            rcode: Rcode::NoError,
                            answers,
                            authority: Vec::new(),
                        };
                    }

                    current = cname.host.clone();
                    continue;
                }
            }

            if rtype == RecordType::A || rtype == RecordType::AAAA {
                if let Some(aname) = &bundle.aname {
                    return match self.resolve_aname(&current, &aname.location, rtype, client).await {
                        AnameOutcome::Records(terminal) => {
                            self.finish(qname, qtype, answers, terminal, flatten, &config, &origin)
                        }
                        AnameOutcome::Cname(rr) => {
                            answers.push(rr);
                            Resolution {
                                rcode: Rcode::NoError,
                                answers,
                                authority: Vec::new(),
                            }
                        }
                        AnameOutcome::ServFail => Resolution::servfail(),
                    };
                }
            }

            let terminal = self.emit_records(&current, rtype, &bundle, client, &origin, &relative).await;
            return self.finish(qname, qtype, answers, terminal, flatten, &config, &origin);
        }
    }

    /// Fold a CNAME chain's accumulated answers with its terminal
    /// records, applying flattening if the originating zone requests
    /// it (§4.3 step 5) and the empty-answer policy if there's nothing
    /// to emit (§4.3 step 8).
    fn finish(
        &self,
        original_qname: &DomainName,
        qtype: QueryType,
        mut chain: Vec<ResourceRecord>,
        terminal: Vec<ResourceRecord>,
        flatten: bool,
        config: &ZoneConfig,
        origin: &DomainName,
    ) -> Resolution {
        if terminal.is_empty() {
            return Resolution {
                rcode: Rcode::NoError,
                answers: chain,
                authority: vec![config.soa_rr(origin)],
            };
        }

        let answers = if flatten && flattens(qtype) {
            terminal
                .into_iter()
                .map(|mut rr| {
                    rr.name = original_qname.clone();
                    rr
                })
                .collect()
        } else {
            chain.extend(terminal);
            chain
        };

        Resolution {
            rcode: Rcode::NoError,
            answers,
            authority: Vec::new(),
        }
    }

    /// Node lookup with wildcard synthesis (§4.3 step 4). Tries the
    /// exact path first; failing that, tries `*.p[k:]` for increasing
    /// `k`, rejecting the first hit (and the whole lookup) if any
    /// exact node exists strictly between the wildcard and the query
    /// name.
    async fn lookup_node(&self, origin: &DomainName, path: &NodePath) -> NodeLookup {
        if let Some(bundle) = self.record_store.get_records(origin, path).await {
            return NodeLookup::Found(bundle);
        }

        if path.is_apex() {
            return NodeLookup::NotFound;
        }

        for k in 1..=path.len() {
            let wildcard = NodePath::wildcard(path.suffix(k));
            if let Some(bundle) = self.record_store.get_records(origin, &wildcard).await {
                for j in 1..k {
                    if self.record_store.get_records(origin, &path.suffix(j)).await.is_some() {
                        return NodeLookup::NotFound;
                    }
                }
                return NodeLookup::Found(bundle);
            }
        }

        if self.record_store.has_descendant_records(origin, path).await {
            return NodeLookup::EmptyNonTerminal;
        }

        NodeLookup::NotFound
    }

    /// ANAME substitution (§4.3 step 6): try to resolve the target
    /// in-zone first, then upstream if enabled, falling back to a
    /// plain CNAME if fallback is disabled.
    async fn resolve_aname(
        &self,
        owner: &DomainName,
        target: &DomainName,
        rtype: RecordType,
        client: &ClientLocation,
    ) -> AnameOutcome {
        if let Some(origin) = self.zone_index.find(target) {
            let path = NodePath::relative_to(target, &origin).expect("zone index guarantees subdomain");
            if let NodeLookup::Found(bundle) = self.lookup_node(&origin, &path).await {
                let set = if rtype == RecordType::A { &bundle.a } else { &bundle.aaaa };
                if let Some(set) = set {
                    let rr_key = format!(
                        "{}|{}|{}|aname",
                        origin.to_dotted_string(),
                        path.to_key_string(),
                        if rtype == RecordType::A { "A" } else { "AAAA" }
                    );
                    let records = self.select_addresses(owner, set, client, &rr_key);
                    return AnameOutcome::Records(records);
                }
            }
        }

        if self.aname_upstream_fallback {
            if self.upstream.is_empty() {
                crate::metrics::DNS_RESOLVER_ANAME_UPSTREAM_MISS_TOTAL.inc();
                return AnameOutcome::ServFail;
            }

            let qtype = QueryType::Record(rtype);
            return match self.upstream.resolve(target, qtype).await {
                Some(records) => {
                    crate::metrics::DNS_RESOLVER_ANAME_UPSTREAM_HIT_TOTAL.inc();
                    AnameOutcome::Records(
                        records
                            .into_iter()
                            .filter(|rr| rr.rtype_with_data.rtype() == rtype)
                            .map(|mut rr| {
                                rr.name = owner.clone();
                                rr.ttl = rr.ttl.min(self.max_ttl);
                                rr
                            })
                            .collect(),
                    )
                }
                None => {
                    crate::metrics::DNS_RESOLVER_ANAME_UPSTREAM_MISS_TOTAL.inc();
                    AnameOutcome::ServFail
                }
            };
        }

        AnameOutcome::Cname(ResourceRecord {
            name: owner.clone(),
            rtype_with_data: RecordTypeWithData::CNAME { cname: target.clone() },
            rclass: RecordClass::IN,
            ttl: self.max_ttl,
        })
    }

    /// Record emission for the matched qtype on `bundle` (§4.3 step
    /// 7), including TTL capping and TXT segmentation (step 9).
    async fn emit_records(
        &self,
        owner: &DomainName,
        rtype: RecordType,
        bundle: &RecordBundle,
        client: &ClientLocation,
        origin: &DomainName,
        node_path: &NodePath,
    ) -> Vec<ResourceRecord> {
        match rtype {
            RecordType::A => match &bundle.a {
                Some(set) => {
                    let rr_key = format!("{}|{}|A", origin.to_dotted_string(), node_path.to_key_string());
                    self.select_addresses(owner, set, client, &rr_key)
                }
                None => Vec::new(),
            },
            RecordType::AAAA => match &bundle.aaaa {
                Some(set) => {
                    let rr_key = format!("{}|{}|AAAA", origin.to_dotted_string(), node_path.to_key_string());
                    self.select_addresses(owner, set, client, &rr_key)
                }
                None => Vec::new(),
            },
            RecordType::TXT => bundle
                .txt
                .as_ref()
                .map(|set| {
                    let ttl = set.ttl.min(self.max_ttl);
                    set.records
                        .iter()
                        .map(|text| ResourceRecord {
                            name: owner.clone(),
                            rtype_with_data: RecordTypeWithData::TXT {
                                octets: segment_txt(text.as_bytes()),
                            },
                            rclass: RecordClass::IN,
                            ttl,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            RecordType::CNAME => bundle
                .cname
                .as_ref()
                .map(|c| {
                    vec![ResourceRecord {
                        name: owner.clone(),
                        rtype_with_data: RecordTypeWithData::CNAME { cname: c.host.clone() },
                        rclass: RecordClass::IN,
                        ttl: c.ttl.min(self.max_ttl),
                    }]
                })
                .unwrap_or_default(),
            RecordType::NS => bundle
                .ns
                .as_ref()
                .map(|set| {
                    let ttl = set.ttl.min(self.max_ttl);
                    set.records
                        .iter()
                        .map(|nsdname| ResourceRecord {
                            name: owner.clone(),
                            rtype_with_data: RecordTypeWithData::NS { nsdname: nsdname.clone() },
                            rclass: RecordClass::IN,
                            ttl,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            RecordType::MX => bundle
                .mx
                .as_ref()
                .map(|set| {
                    let ttl = set.ttl.min(self.max_ttl);
                    set.records
                        .iter()
                        .map(|entry| ResourceRecord {
                            name: owner.clone(),
                            rtype_with_data: RecordTypeWithData::MX {
                                preference: entry.preference,
                                exchange: entry.host.clone(),
                            },
                            rclass: RecordClass::IN,
                            ttl,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            RecordType::SRV => bundle
                .srv
                .as_ref()
                .map(|set| {
                    let ttl = set.ttl.min(self.max_ttl);
                    set.records
                        .iter()
                        .map(|entry| ResourceRecord {
                            name: owner.clone(),
                            rtype_with_data: RecordTypeWithData::SRV {
                                priority: entry.priority,
                                weight: entry.weight,
                                port: entry.port,
                                target: entry.target.clone(),
                            },
                            rclass: RecordClass::IN,
                            ttl,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            RecordType::TLSA => bundle
                .tlsa
                .as_ref()
                .map(|set| {
                    let ttl = set.ttl.min(self.max_ttl);
                    set.records
                        .iter()
                        .map(|entry| ResourceRecord {
                            name: owner.clone(),
                            rtype_with_data: RecordTypeWithData::TLSA {
                                cert_usage: entry.cert_usage,
                                selector: entry.selector,
                                matching_type: entry.matching_type,
                                certificate_association_data: entry.certificate.clone(),
                            },
                            rclass: RecordClass::IN,
                            ttl,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            RecordType::CAA => bundle
                .caa
                .as_ref()
                .map(|set| {
                    let ttl = set.ttl.min(self.max_ttl);
                    set.records
                        .iter()
                        .map(|entry| ResourceRecord {
                            name: owner.clone(),
                            rtype_with_data: RecordTypeWithData::CAA {
                                flags: entry.flag,
                                tag: Bytes::from(entry.tag.clone().into_bytes()),
                                value: Bytes::from(entry.value.clone().into_bytes()),
                            },
                            rclass: RecordClass::IN,
                            ttl,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            RecordType::PTR => bundle
                .ptr
                .as_ref()
                .map(|p| {
                    vec![ResourceRecord {
                        name: owner.clone(),
                        rtype_with_data: RecordTypeWithData::PTR { ptrdname: p.host.clone() },
                        rclass: RecordClass::IN,
                        ttl: p.ttl.min(self.max_ttl),
                    }]
                })
                .unwrap_or_default(),
            // SOA is handled at the apex before we ever get here; a
            // non-apex SOA query just falls through to "no records of
            // this type", which is the correct NOERROR+SOA behavior.
            _ => Vec::new(),
        }
    }

    fn select_addresses(
        &self,
        owner: &DomainName,
        set: &AddressRecordSet,
        client: &ClientLocation,
        rr_key: &str,
    ) -> Vec<ResourceRecord> {
        let selected = {
            let mut rng = self.rng.lock().expect("rng poisoned");
            filter::apply(
                &set.records,
                set.filter.geo_filter,
                set.filter.count,
                set.filter.order,
                client,
                &self.geo,
                &self.rr_counters,
                rr_key,
                &mut *rng,
            )
        };

        let ttl = set.ttl.min(self.max_ttl);
        selected
            .into_iter()
            .map(|record| {
                let rtype_with_data = match record.ip.into() {
                    std::net::IpAddr::V4(address) => RecordTypeWithData::A { address },
                    std::net::IpAddr::V6(address) => RecordTypeWithData::AAAA { address },
                };
                ResourceRecord {
                    name: owner.clone(),
                    rtype_with_data,
                    rclass: RecordClass::IN,
                    ttl,
                }
            })
            .collect()
    }
}

/// Split `bytes` into RFC 1035 character-strings (each at most 255
/// octets, length-prefixed) and concatenate them into one RR's RDATA
/// (§4.3 step 9).
fn segment_txt(bytes: &[u8]) -> Bytes {
    if bytes.is_empty() {
        return Bytes::from_static(&[0]);
    }

    let mut buf = BytesMut::with_capacity(bytes.len() + bytes.len() / 255 + 1);
    for chunk in bytes.chunks(255) {
        buf.put_u8(chunk.len() as u8);
        buf.put_slice(chunk);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::KeyNaming;
    use dns_types::protocol::types::test_util::domain;
    use dns_types::zones::types::{IPRecord, IpAddrValue, Zones};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeKvs {
        sets: StdMutex<HashMap<String, Vec<String>>>,
        hashes: StdMutex<HashMap<String, HashMap<String, String>>>,
        strings: StdMutex<HashMap<String, String>>,
    }

    #[async_trait::async_trait]
    impl Kvs for FakeKvs {
        async fn smembers(&self, key: &str) -> redis::RedisResult<Vec<String>> {
            Ok(self.sets.lock().unwrap().get(key).cloned().unwrap_or_default())
        }

        async fn hgetall(&self, key: &str) -> redis::RedisResult<HashMap<String, String>> {
            Ok(self.hashes.lock().unwrap().get(key).cloned().unwrap_or_default())
        }

        async fn get(&self, key: &str) -> redis::RedisResult<Option<String>> {
            Ok(self.strings.lock().unwrap().get(key).cloned())
        }
    }

    fn put_node(kvs: &FakeKvs, origin: &str, node: &str, json: &str) {
        kvs.hashes
            .lock()
            .unwrap()
            .entry(format!("zones:{origin}"))
            .or_default()
            .insert(node.to_string(), json.to_string());
    }

    fn make_engine(kvs: FakeKvs, zones: Zones) -> ResolverEngine<FakeKvs> {
        let zone_index = ZoneIndex::new(zones);
        let record_store = RecordStore::new(kvs, KeyNaming::default(), Duration::from_secs(30));
        ResolverEngine::with_seed(
            zone_index,
            record_store,
            GeoDatabase::empty(),
            UpstreamResolver::default(),
            false,
            10,
            3600,
            1,
        )
    }

    #[tokio::test]
    async fn not_authoritative_for_unknown_zone() {
        let engine = make_engine(FakeKvs::default(), Zones::new());
        let result = engine
            .resolve(
                &domain("example.com."),
                QueryType::Record(RecordType::A),
                &ClientLocation::default(),
            )
            .await;
        assert_eq!(Rcode::NotAuth, result.rcode);
        assert!(result.answers.is_empty());
    }

    #[tokio::test]
    async fn basic_a_lookup_returns_both_records() {
        let kvs = FakeKvs::default();
        put_node(
            &kvs,
            "example.com.",
            "x",
            r#"{"a":{"ttl":300,"records":[{"ip":"1.2.3.4"},{"ip":"5.6.7.8"}]}}"#,
        );
        let engine = make_engine(kvs, Zones::from_origins([domain("example.com.")]));

        let result = engine
            .resolve(
                &domain("x.example.com."),
                QueryType::Record(RecordType::A),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NoError, result.rcode);
        assert_eq!(2, result.answers.len());
        assert!(result.answers.iter().all(|rr| rr.ttl == 300));
    }

    #[tokio::test]
    async fn missing_node_is_nxdomain_with_soa() {
        let kvs = FakeKvs::default();
        kvs.strings.lock().unwrap().insert(
            "zones:example.com.:config".to_string(),
            r#"{"ns":"ns1.example.com.","mbox":"hostmaster.example.com."}"#.to_string(),
        );
        let engine = make_engine(kvs, Zones::from_origins([domain("example.com.")]));

        let result = engine
            .resolve(
                &domain("nope.example.com."),
                QueryType::Record(RecordType::A),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NameError, result.rcode);
        assert!(result.answers.is_empty());
        assert_eq!(1, result.authority.len());
    }

    #[tokio::test]
    async fn empty_non_terminal_is_noerror_with_soa() {
        let kvs = FakeKvs::default();
        put_node(
            &kvs,
            "example.com.",
            "host.v.w",
            r#"{"a":{"ttl":300,"records":[{"ip":"1.2.3.4"}]}}"#,
        );
        let engine = make_engine(kvs, Zones::from_origins([domain("example.com.")]));

        let result = engine
            .resolve(
                &domain("v.w.example.com."),
                QueryType::Record(RecordType::A),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NoError, result.rcode);
        assert!(result.answers.is_empty());
        assert_eq!(1, result.authority.len());
    }

    #[tokio::test]
    async fn node_without_matching_qtype_is_empty_noerror() {
        let kvs = FakeKvs::default();
        put_node(&kvs, "example.net.", "host1", r#"{"a":{"ttl":300,"records":[{"ip":"1.1.1.1"}]}}"#);
        let engine = make_engine(kvs, Zones::from_origins([domain("example.net.")]));

        let result = engine
            .resolve(
                &domain("host1.example.net."),
                QueryType::Record(RecordType::MX),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NoError, result.rcode);
        assert!(result.answers.is_empty());
        assert_eq!(1, result.authority.len());
    }

    #[tokio::test]
    async fn wildcard_synthesizes_when_no_exact_node_exists() {
        let kvs = FakeKvs::default();
        put_node(&kvs, "example.net.", "*", r#"{"txt":{"ttl":300,"records":[{"text":"this is a wildcard"}]}}"#);
        let engine = make_engine(kvs, Zones::from_origins([domain("example.net.")]));

        let result = engine
            .resolve(
                &domain("host3.example.net."),
                QueryType::Record(RecordType::TXT),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NoError, result.rcode);
        assert_eq!(1, result.answers.len());
    }

    #[tokio::test]
    async fn wildcard_is_masked_by_an_intervening_exact_node() {
        let kvs = FakeKvs::default();
        put_node(&kvs, "example.net.", "*", r#"{"txt":{"ttl":300,"records":[{"text":"wildcard"}]}}"#);
        put_node(&kvs, "example.net.", "b", r#"{"txt":{"ttl":300,"records":[{"text":"real node"}]}}"#);
        let engine = make_engine(kvs, Zones::from_origins([domain("example.net.")]));

        let result = engine
            .resolve(
                &domain("a.b.example.net."),
                QueryType::Record(RecordType::TXT),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NameError, result.rcode);
    }

    #[tokio::test]
    async fn literal_node_beats_wildcard_even_without_matching_qtype() {
        let kvs = FakeKvs::default();
        put_node(&kvs, "example.net.", "sub.*", r#"{"txt":{"ttl":300,"records":[{"text":"not a wildcard"}]}}"#);
        let engine = make_engine(kvs, Zones::from_origins([domain("example.net.")]));

        let result = engine
            .resolve(
                &domain("sub.*.example.net."),
                QueryType::Record(RecordType::MX),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NoError, result.rcode);
        assert!(result.answers.is_empty());
        assert_eq!(1, result.authority.len());
    }

    #[tokio::test]
    async fn cname_chain_is_followed_without_flattening() {
        let kvs = FakeKvs::default();
        put_node(&kvs, "example.ddd.", "e", r#"{"cname":{"ttl":300,"host":"d.example.ddd."}}"#);
        put_node(&kvs, "example.ddd.", "d", r#"{"cname":{"ttl":300,"host":"c.example.ddd."}}"#);
        put_node(&kvs, "example.ddd.", "c", r#"{"cname":{"ttl":300,"host":"b.example.ddd."}}"#);
        put_node(&kvs, "example.ddd.", "b", r#"{"cname":{"ttl":300,"host":"a.example.ddd."}}"#);
        put_node(&kvs, "example.ddd.", "a", r#"{"a":{"ttl":300,"records":[{"ip":"1.2.3.4"}]}}"#);
        let engine = make_engine(kvs, Zones::from_origins([domain("example.ddd.")]));

        let result = engine
            .resolve(
                &domain("e.example.ddd."),
                QueryType::Record(RecordType::A),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NoError, result.rcode);
        // 4 CNAME hops + 1 terminal A record
        assert_eq!(5, result.answers.len());
        assert_eq!(domain("e.example.ddd."), result.answers[0].name);
        assert_eq!(domain("a.example.ddd."), result.answers[4].name);
    }

    #[tokio::test]
    async fn cname_chain_flattens_when_zone_requests_it() {
        let kvs = FakeKvs::default();
        kvs.strings
            .lock()
            .unwrap()
            .insert("zones:example.ddd.:config".to_string(), r#"{"cname_flattening":true}"#.to_string());
        put_node(&kvs, "example.ddd.", "e", r#"{"cname":{"ttl":300,"host":"d.example.ddd."}}"#);
        put_node(&kvs, "example.ddd.", "d", r#"{"cname":{"ttl":300,"host":"c.example.ddd."}}"#);
        put_node(&kvs, "example.ddd.", "c", r#"{"cname":{"ttl":300,"host":"b.example.ddd."}}"#);
        put_node(&kvs, "example.ddd.", "b", r#"{"cname":{"ttl":300,"host":"a.example.ddd."}}"#);
        put_node(&kvs, "example.ddd.", "a", r#"{"a":{"ttl":300,"records":[{"ip":"1.2.3.4"}]}}"#);
        let engine = make_engine(kvs, Zones::from_origins([domain("example.ddd.")]));

        let result = engine
            .resolve(
                &domain("e.example.ddd."),
                QueryType::Record(RecordType::A),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NoError, result.rcode);
        assert_eq!(1, result.answers.len());
        assert_eq!(domain("e.example.ddd."), result.answers[0].name);
        assert_eq!(
            RecordTypeWithData::A {
                address: Ipv4Addr::new(1, 2, 3, 4)
            },
            result.answers[0].rtype_with_data
        );
    }

    #[tokio::test]
    async fn cname_loop_is_servfail() {
        let kvs = FakeKvs::default();
        put_node(&kvs, "example.com.", "a", r#"{"cname":{"ttl":300,"host":"b.example.com."}}"#);
        put_node(&kvs, "example.com.", "b", r#"{"cname":{"ttl":300,"host":"a.example.com."}}"#);
        let engine = make_engine(kvs, Zones::from_origins([domain("example.com.")]));

        let result = engine
            .resolve(
                &domain("a.example.com."),
                QueryType::Record(RecordType::A),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::ServerFailure, result.rcode);
    }

    #[tokio::test]
    async fn cname_to_external_name_stops_without_servfail() {
        let kvs = FakeKvs::default();
        put_node(&kvs, "example.com.", "a", r#"{"cname":{"ttl":300,"host":"elsewhere.net."}}"#);
        let engine = make_engine(kvs, Zones::from_origins([domain("example.com.")]));

        let result = engine
            .resolve(
                &domain("a.example.com."),
                QueryType::Record(RecordType::A),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NoError, result.rcode);
        assert_eq!(1, result.answers.len());
        assert!(matches!(result.answers[0].rtype_with_data, RecordTypeWithData::CNAME { .. }));
    }

    #[tokio::test]
    async fn aname_substitutes_in_zone_target() {
        let kvs = FakeKvs::default();
        put_node(&kvs, "arvancloud.com.", "@", r#"{"aname":{"location":"aname.arvan.an."}}"#);
        put_node(&kvs, "arvan.an.", "aname", r#"{"a":{"ttl":300,"records":[{"ip":"6.5.6.5"}]}}"#);
        let engine = make_engine(
            kvs,
            Zones::from_origins([domain("arvancloud.com."), domain("arvan.an.")]),
        );

        let result = engine
            .resolve(
                &domain("arvancloud.com."),
                QueryType::Record(RecordType::A),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NoError, result.rcode);
        assert_eq!(1, result.answers.len());
        assert_eq!(domain("arvancloud.com."), result.answers[0].name);
        assert_eq!(
            RecordTypeWithData::A {
                address: Ipv4Addr::new(6, 5, 6, 5)
            },
            result.answers[0].rtype_with_data
        );
    }

    #[tokio::test]
    async fn aname_without_fallback_returns_cname() {
        let kvs = FakeKvs::default();
        put_node(&kvs, "example.com.", "@", r#"{"aname":{"location":"target.elsewhere.net."}}"#);
        let engine = make_engine(kvs, Zones::from_origins([domain("example.com.")]));

        let result = engine
            .resolve(
                &domain("example.com."),
                QueryType::Record(RecordType::A),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(Rcode::NoError, result.rcode);
        assert_eq!(1, result.answers.len());
        assert!(matches!(result.answers[0].rtype_with_data, RecordTypeWithData::CNAME { .. }));
    }

    #[tokio::test]
    async fn unsupported_qtype_is_not_implemented() {
        let kvs = FakeKvs::default();
        let engine = make_engine(kvs, Zones::from_origins([domain("example.com.")]));

        let result = engine
            .resolve(&domain("example.com."), QueryType::Wildcard, &ClientLocation::default())
            .await;

        assert_eq!(Rcode::NotImplemented, result.rcode);
        assert_eq!(1, result.authority.len());
    }

    #[tokio::test]
    async fn apex_soa_and_ns_are_synthesized() {
        let kvs = FakeKvs::default();
        kvs.strings.lock().unwrap().insert(
            "zones:example.com.:config".to_string(),
            r#"{"ns":"ns1.example.com.","mbox":"hostmaster.example.com.","ttl":300}"#.to_string(),
        );
        let engine = make_engine(kvs, Zones::from_origins([domain("example.com.")]));

        let soa = engine
            .resolve(
                &domain("example.com."),
                QueryType::Record(RecordType::SOA),
                &ClientLocation::default(),
            )
            .await;
        assert_eq!(Rcode::NoError, soa.rcode);
        assert_eq!(1, soa.answers.len());
        assert!(matches!(soa.answers[0].rtype_with_data, RecordTypeWithData::SOA { .. }));

        let ns = engine
            .resolve(
                &domain("example.com."),
                QueryType::Record(RecordType::NS),
                &ClientLocation::default(),
            )
            .await;
        assert_eq!(Rcode::NoError, ns.rcode);
        assert_eq!(1, ns.answers.len());
        assert!(matches!(ns.answers[0].rtype_with_data, RecordTypeWithData::NS { .. }));
    }

    #[tokio::test]
    async fn txt_longer_than_255_octets_is_segmented() {
        let kvs = FakeKvs::default();
        let long = "a".repeat(300);
        put_node(
            &kvs,
            "example.com.",
            "x",
            &format!(r#"{{"txt":{{"ttl":300,"records":[{{"text":"{long}"}}]}}}}"#),
        );
        let engine = make_engine(kvs, Zones::from_origins([domain("example.com.")]));

        let result = engine
            .resolve(
                &domain("x.example.com."),
                QueryType::Record(RecordType::TXT),
                &ClientLocation::default(),
            )
            .await;

        assert_eq!(1, result.answers.len());
        let RecordTypeWithData::TXT { octets } = &result.answers[0].rtype_with_data else {
            panic!("expected TXT");
        };
        // 255-byte chunk (1 len + 255 data) then a 45-byte chunk (1 len + 45 data)
        assert_eq!(256 + 46, octets.len());
        assert_eq!(255, octets[0]);
        assert_eq!(45, octets[256]);
    }

    #[tokio::test]
    async fn geo_country_filter_keeps_only_matching_record() {
        let kvs = FakeKvs::default();
        put_node(
            &kvs,
            "example.com.",
            "ww2",
            r#"{"a":{"ttl":300,"filter":{"geo_filter":"country"},"records":[
                {"ip":"1.1.1.1","country":"US"},
                {"ip":"2.2.2.2","country":"GB"},
                {"ip":"3.3.3.3","country":"ES"},
                {"ip":"4.4.4.4"},
                {"ip":"5.5.5.5"},
                {"ip":"6.6.6.6"}
            ]}}"#,
        );
        let engine = make_engine(kvs, Zones::from_origins([domain("example.com.")]));

        let gb_client = ClientLocation {
            country: Some("GB".to_string()),
            ..Default::default()
        };
        let result = engine
            .resolve(&domain("ww2.example.com."), QueryType::Record(RecordType::A), &gb_client)
            .await;
        assert_eq!(1, result.answers.len());

        let unknown_client = ClientLocation {
            country: Some("FR".to_string()),
            ..Default::default()
        };
        let result = engine
            .resolve(
                &domain("ww2.example.com."),
                QueryType::Record(RecordType::A),
                &unknown_client,
            )
            .await;
        assert_eq!(3, result.answers.len());
    }

    #[test]
    fn address_ordering_is_deterministic_in_ipaddr_record_type() {
        // sanity check that IpAddrValue round-trips into the right wire type
        let v4 = IpAddrValue::V4(Ipv4Addr::new(9, 9, 9, 9));
        let ip: std::net::IpAddr = v4.into();
        assert!(ip.is_ipv4());
    }
}
