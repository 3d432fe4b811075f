//! Prometheus metrics for the parts of the core that the server crate
//! has no direct visibility into: the record store's cache and the
//! ANAME upstream-fallback path. Registered against the global default
//! registry, same as the server's own metrics, so a single `/metrics`
//! scrape picks both up without this crate needing to know anything
//! about HTTP.

use prometheus::{opts, register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

pub static RECORD_STORE_CACHE_HIT_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec!(
        opts!("record_store_cache_hit_total", "Total number of record store cache hits."),
        &["kind"]
    )
    .unwrap()
});

pub static RECORD_STORE_CACHE_MISS_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "record_store_cache_miss_total",
            "Total number of record store cache misses, served from the KVS directly."
        ),
        &["kind"]
    )
    .unwrap()
});

pub static DNS_RESOLVER_ANAME_UPSTREAM_HIT_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_aname_upstream_hit_total",
        "Total number of ANAME substitutions resolved by querying an upstream server."
    ),)
    .unwrap()
});

pub static DNS_RESOLVER_ANAME_UPSTREAM_MISS_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_aname_upstream_miss_total",
        "Total number of ANAME substitutions that fell back to a plain CNAME or SERVFAIL because no upstream server answered."
    ),)
    .unwrap()
});
