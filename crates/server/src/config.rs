//! Command-line/environment configuration, in the style of
//! `bin-resolved`'s `Args`: a single `clap::Parser` struct whose doc
//! comments double as `--help` text, with every field also settable
//! from the environment (`#[clap(env)]`) so a container deployment
//! never has to template a config file.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use dns_resolver::upstream::{UpstreamProtocol, UpstreamServer};

const DNS_PORT: u16 = 53;

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser, Clone)]
/// An authoritative DNS resolver backed by a Redis-compatible
/// key-value store.
///
/// Zone membership, per-zone SOA configuration, and per-node record
/// bundles are all read from the store - this binary only holds the
/// in-memory zone index and record cache, and the UDP/TCP listeners
/// that front them.
///
/// Prometheus metrics are served at
/// "http://{metrics_interface}:{metrics_port}/metrics"
pub struct Args {
    /// Interface to listen on for DNS queries
    #[clap(long, env, value_parser, default_value_t = Ipv4Addr::UNSPECIFIED)]
    pub interface: Ipv4Addr,

    /// Port to listen on for DNS queries
    #[clap(long, env, value_parser, default_value_t = DNS_PORT)]
    pub port: u16,

    /// Interface to listen on to serve Prometheus metrics
    #[clap(long, env, value_parser, default_value_t = Ipv4Addr::LOCALHOST)]
    pub metrics_interface: Ipv4Addr,

    /// Port to listen on to serve Prometheus metrics
    #[clap(long, env, value_parser, default_value_t = 9420)]
    pub metrics_port: u16,

    /// Redis-compatible connection URL for the zone data store
    #[clap(long, env, value_parser, default_value = "redis://127.0.0.1:6379")]
    pub kvs_url: String,

    /// Prefix applied to every key name in the store
    #[clap(long, env, value_parser, default_value = "")]
    pub key_prefix: String,

    /// Suffix applied to every key name in the store
    #[clap(long, env, value_parser, default_value = "")]
    pub key_suffix: String,

    /// Timeout, in milliseconds, for establishing the store connection
    #[clap(long, env, value_parser, default_value_t = 5_000)]
    pub connect_timeout_ms: u64,

    /// Timeout, in milliseconds, for a single store read
    #[clap(long, env, value_parser, default_value_t = 2_000)]
    pub read_timeout_ms: u64,

    /// How long, in seconds, a fetched record bundle or zone config
    /// may be served from the in-process cache before being re-read
    #[clap(long, env, value_parser, default_value_t = 60)]
    pub cache_timeout_secs: u64,

    /// How often, in seconds, to fully reconcile the zone index
    /// against the store's `zones` set, regardless of keyspace
    /// notifications
    #[clap(long, env, value_parser, default_value_t = 300)]
    pub zone_reload_secs: u64,

    /// Maximum number of CNAME/ANAME hops to follow before giving up
    /// with SERVFAIL
    #[clap(long, env, value_parser, default_value_t = 10)]
    pub max_cname_chain: usize,

    /// Upper bound applied to every emitted record's TTL, regardless
    /// of what the zone data requests
    #[clap(long, env, value_parser, default_value_t = 3_600)]
    pub max_ttl: u32,

    /// Path to a MaxMind GeoIP2 City (or GeoLite2 City) database,
    /// used for the `country` and `location` geo filters
    #[clap(long, env, value_parser)]
    pub geo_city_db: Option<String>,

    /// Path to a MaxMind GeoIP2 ASN (or GeoLite2 ASN) database, used
    /// for the `asn` and `asn+country` geo filters
    #[clap(long, env, value_parser)]
    pub geo_asn_db: Option<String>,

    /// Consult an upstream recursive resolver for ANAME targets that
    /// fall outside every served zone, rather than returning a plain
    /// CNAME to the target
    #[clap(long, env, action(clap::ArgAction::SetTrue))]
    pub aname_upstream_fallback: bool,

    /// Upstream server to use for ANAME fallback, in
    /// `ip:port:protocol:timeout_ms` form (e.g. `1.1.1.1:53:udp:2000`);
    /// may be given more than once, and is tried in order
    #[clap(long = "upstream", env, value_parser, value_delimiter = ',')]
    pub upstream_servers: Vec<UpstreamServerArg>,
}

impl Args {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_timeout_secs)
    }

    pub fn zone_reload_interval(&self) -> Duration {
        Duration::from_secs(self.zone_reload_secs)
    }

    pub fn upstream_servers(&self) -> Vec<UpstreamServer> {
        self.upstream_servers.iter().map(|a| a.0.clone()).collect()
    }
}

/// A `clap`-parseable wrapper around [`UpstreamServer`], accepting
/// `ip:port:protocol:timeout_ms`.
#[derive(Debug, Clone)]
pub struct UpstreamServerArg(UpstreamServer);

impl FromStr for UpstreamServerArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [ip, port, protocol, timeout_ms] = parts.as_slice() else {
            return Err(format!(
                "expected `ip:port:protocol:timeout_ms`, got `{s}`"
            ));
        };

        let ip = ip.parse().map_err(|e| format!("invalid IP `{ip}`: {e}"))?;
        let port: u16 = port.parse().map_err(|e| format!("invalid port `{port}`: {e}"))?;
        let protocol = match *protocol {
            "udp" => UpstreamProtocol::Udp,
            "tcp" => UpstreamProtocol::Tcp,
            other => return Err(format!("unknown protocol `{other}`, expected `udp` or `tcp`")),
        };
        let timeout_ms: u64 = timeout_ms
            .parse()
            .map_err(|e| format!("invalid timeout `{timeout_ms}`: {e}"))?;

        Ok(Self(UpstreamServer {
            address: std::net::SocketAddr::new(ip, port),
            protocol,
            timeout: Duration::from_millis(timeout_ms),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upstream_server() {
        let parsed: UpstreamServerArg = "1.1.1.1:53:udp:2000".parse().unwrap();
        assert_eq!("1.1.1.1:53".parse::<std::net::SocketAddr>().unwrap(), parsed.0.address);
        assert_eq!(UpstreamProtocol::Udp, parsed.0.protocol);
        assert_eq!(Duration::from_millis(2000), parsed.0.timeout);
    }

    #[test]
    fn rejects_malformed_upstream_server() {
        assert!("1.1.1.1:53:udp".parse::<UpstreamServerArg>().is_err());
        assert!("1.1.1.1:53:quic:2000".parse::<UpstreamServerArg>().is_err());
    }
}
