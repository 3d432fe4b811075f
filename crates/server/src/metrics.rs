use actix_web::{get, http::header::ContentType, App, HttpResponse, HttpServer, Responder};
use prometheus::{
    opts, register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec, IntCounter,
    IntCounterVec,
};
use std::net::SocketAddr;

pub const RESPONSE_TIME_BUCKETS: &[f64] = &[
    0.0001, // 0.1 ms
    0.0005, // 0.5 ms
    0.0010, // 1   ms
    0.0025, // 2.5 ms
    0.0050, // 5   ms
    0.0075, // 7.5 ms
    0.0100, // 10  ms
    0.0250, // 25  ms
    0.0500, // 50  ms
    0.0750, // 75  ms
    0.1000, // 100 ms
    0.2500, // 250 ms
    0.5000, // 500 ms
    0.7500, // 750 ms
    1.0000, // 1    s
];

// separate const because we may want to change this in the future to
// get more granularity on the lower end
pub const PROCESSING_TIME_BUCKETS: &[f64] = RESPONSE_TIME_BUCKETS;

pub const REFUSED_FOR_MULTIPLE_QUESTIONS: &str = "multiple_questions";
pub const REFUSED_FOR_UNKNOWN_QTYPE_OR_QCLASS: &str = "unknown_qtype_or_qclass";

pub static DNS_REQUESTS_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "dns_requests_total",
            "Total number of DNS requests received, whether valid or invalid."
        ),
        &["protocol"]
    )
    .unwrap()
});

pub static DNS_REQUESTS_REFUSED_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec!(
        opts!("dns_requests_refused_total", "Total number of DNS requests refused."),
        &["reason"]
    )
    .unwrap()
});

pub static DNS_RESPONSES_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec!(
        opts!("dns_responses_total", "Total number of DNS responses sent."),
        &["aa", "tc", "rd", "ra", "rcode"]
    )
    .unwrap()
});

pub static DNS_RESPONSE_TIME_SECONDS: std::sync::LazyLock<HistogramVec> = std::sync::LazyLock::new(|| {
    register_histogram_vec!(
        "dns_response_time_seconds",
        "Response time of DNS requests, whether valid or invalid.",
        &["protocol"],
        RESPONSE_TIME_BUCKETS.to_vec()
    )
    .unwrap()
});

pub static DNS_QUESTIONS_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "dns_questions_total",
            "Total number of DNS questions received (a request may have multiple questions)."
        ),
        &["rd", "qtype", "qclass"]
    )
    .unwrap()
});

pub static DNS_QUESTION_PROCESSING_TIME_SECONDS: std::sync::LazyLock<HistogramVec> = std::sync::LazyLock::new(|| {
    register_histogram_vec!(
        "dns_question_processing_time_seconds",
        "Time spent processing a DNS question (a request may have multiple questions).",
        &["rd", "qtype", "class"],
        PROCESSING_TIME_BUCKETS.to_vec()
    )
    .unwrap()
});

pub static DNS_RESOLVER_AUTHORITATIVE_HIT_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_authoritative_hit_total",
        "Total number of questions answered from local authoritative zone data."
    ),)
    .unwrap()
});

// the record-store cache and ANAME-upstream-fallback metrics live in
// `dns_resolver::metrics`, next to the code that actually increments
// them; they still show up at this crate's `/metrics` endpoint because
// `prometheus::gather()` reads the shared global registry regardless
// of which crate registered a metric with it.
pub use dns_resolver::metrics::{
    DNS_RESOLVER_ANAME_UPSTREAM_HIT_TOTAL, DNS_RESOLVER_ANAME_UPSTREAM_MISS_TOTAL, RECORD_STORE_CACHE_HIT_TOTAL,
    RECORD_STORE_CACHE_MISS_TOTAL,
};

pub static ZONE_RELOAD_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec!(
        opts!("zone_reload_total", "Total number of zone index reloads."),
        &["trigger"]
    )
    .unwrap()
});

pub static ZONE_COUNT: std::sync::LazyLock<prometheus::IntGauge> = std::sync::LazyLock::new(|| {
    prometheus::register_int_gauge!(opts!("zone_count", "Number of zones in the current index.")).unwrap()
});

#[get("/metrics")]
async fn get_metrics() -> impl Responder {
    match prometheus::TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(metrics_str) => HttpResponse::Ok().content_type(ContentType::plaintext()).body(metrics_str),
        Err(err) => {
            tracing::error!(error = %err, "failed to serialise metrics");
            HttpResponse::InternalServerError()
                .content_type(ContentType::plaintext())
                .body(err.to_string())
        }
    }
}

pub async fn serve_prometheus_endpoint_task(address: SocketAddr) -> std::io::Result<()> {
    HttpServer::new(|| App::new().service(get_metrics)).bind(address)?.run().await
}
