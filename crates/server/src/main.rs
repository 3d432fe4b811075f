use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use clap::Parser;
use redis::aio::ConnectionManager;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use dns_resolver::engine::ResolverEngine;
use dns_resolver::filter::ClientLocation;
use dns_resolver::geo::GeoDatabase;
use dns_resolver::record_store::{KeyNaming, RecordStore};
use dns_resolver::reload::ReloadController;
use dns_resolver::upstream::UpstreamResolver;
use dns_resolver::zone_index::ZoneIndex;
use dns_types::protocol::types::*;
use dns_types::zones::types::Zones;

mod config;
mod metrics;
mod net_util;

use config::Args;
use metrics::*;
use net_util::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes_to, TcpError};

type Engine = ResolverEngine<ConnectionManager>;

/// Arguments shared by the UDP and TCP listener tasks.
#[derive(Clone)]
struct ListenArgs {
    engine: Arc<Engine>,
}

async fn resolve_and_build_response(args: ListenArgs, query: Message, client: ClientLocation) -> Message {
    let mut response = query.make_response();
    response.header.is_authoritative = true;
    response.header.recursion_available = false;

    if query.questions.len() != 1 {
        DNS_REQUESTS_REFUSED_TOTAL
            .with_label_values(&[REFUSED_FOR_MULTIPLE_QUESTIONS])
            .inc();
        response.header.rcode = Rcode::Refused;
        response.header.is_authoritative = false;
        return response;
    }

    let question = &query.questions[0];
    if question.is_unknown() {
        DNS_REQUESTS_REFUSED_TOTAL
            .with_label_values(&[REFUSED_FOR_UNKNOWN_QTYPE_OR_QCLASS])
            .inc();
        response.header.rcode = Rcode::Refused;
        response.header.is_authoritative = false;
        return response;
    }

    let client = dns_resolver::edns::client_subnet(&query.additional)
        .map(|ip| ClientLocation::from_ip(ip, args.engine.geo()))
        .unwrap_or(client);

    let rd = query.header.recursion_desired.to_string();
    let qtype = question.qtype.to_string();
    let qclass = question.qclass.to_string();
    DNS_QUESTIONS_TOTAL.with_label_values(&[&rd, &qtype, &qclass]).inc();
    let timer = DNS_QUESTION_PROCESSING_TIME_SECONDS
        .with_label_values(&[&rd, &qtype, &qclass])
        .start_timer();

    let resolution = args.engine.resolve(&question.name, question.qtype, &client).await;
    timer.observe_duration();

    if resolution.rcode == Rcode::NoError {
        DNS_RESOLVER_AUTHORITATIVE_HIT_TOTAL.inc();
    }
    response.header.rcode = resolution.rcode;
    response.answers = resolution.answers;
    response.authority = resolution.authority;
    response
}

async fn handle_raw_message(args: ListenArgs, buf: &[u8], client: ClientLocation) -> Option<Message> {
    match Message::from_octets(buf) {
        Ok(msg) if msg.header.is_response => Some(Message::make_format_error_response(msg.header.id)),
        Ok(msg) if msg.header.opcode != Opcode::Standard => {
            let mut response = msg.make_response();
            response.header.rcode = Rcode::NotImplemented;
            Some(response)
        }
        Ok(msg) => Some(resolve_and_build_response(args, msg, client).await),
        Err(error) => error.id().map(Message::make_format_error_response),
    }
}

async fn listen_tcp_task(args: ListenArgs, socket: TcpListener) {
    loop {
        let (mut stream, peer) = match socket.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::debug!(?error, "TCP accept error");
                continue;
            }
        };

        DNS_REQUESTS_TOTAL.with_label_values(&["tcp"]).inc();
        let args = args.clone();
        tokio::spawn(async move {
            let timer = DNS_RESPONSE_TIME_SECONDS.with_label_values(&["tcp"]).start_timer();
            let client = ClientLocation::from_ip(peer.ip(), args.engine.geo());
            let response = match read_tcp_bytes(&mut stream).await {
                Ok(bytes) => handle_raw_message(args, bytes.as_ref(), client).await,
                Err(error) => {
                    let id = match error {
                        TcpError::TooShort { id, .. } | TcpError::Io { id, .. } => id,
                    };
                    tracing::debug!(?peer, ?error, "TCP read error");
                    id.map(Message::make_format_error_response)
                }
            };

            if let Some(message) = response {
                respond_tcp(&mut stream, peer, message).await;
            }
            timer.observe_duration();
        });
    }
}

async fn respond_tcp(stream: &mut TcpStream, peer: SocketAddr, message: Message) {
    match message.to_octets() {
        Ok(mut serialised) => {
            record_response_metrics(&message);
            if let Err(error) = send_tcp_bytes(stream, &mut serialised).await {
                tracing::debug!(?peer, ?error, "TCP send error");
            }
        }
        Err(error) => tracing::warn!(?peer, ?message, ?error, "could not serialise message"),
    }
}

async fn listen_udp_task(args: ListenArgs, socket: UdpSocket) {
    let (tx, mut rx) = mpsc::channel(32);
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            Ok((size, peer)) = socket.recv_from(&mut buf) => {
                DNS_REQUESTS_TOTAL.with_label_values(&["udp"]).inc();
                let bytes = BytesMut::from(&buf[..size]);
                let reply = tx.clone();
                let args = args.clone();
                tokio::spawn(async move {
                    let timer = DNS_RESPONSE_TIME_SECONDS.with_label_values(&["udp"]).start_timer();
                    let client = ClientLocation::from_ip(peer.ip(), args.engine.geo());
                    if let Some(response) = handle_raw_message(args, bytes.as_ref(), client).await {
                        if reply.send((response, peer, timer)).await.is_err() {
                            tracing::debug!(?peer, "UDP reply channel closed");
                        }
                    }
                });
            }

            Some((message, peer, timer)) = rx.recv() => {
                match message.to_octets() {
                    Ok(mut serialised) => {
                        record_response_metrics(&message);
                        if let Err(error) = send_udp_bytes_to(&socket, peer, &mut serialised).await {
                            tracing::debug!(?peer, ?error, "UDP send error");
                        }
                    }
                    Err(error) => tracing::warn!(?peer, ?message, ?error, "could not serialise message"),
                }
                timer.observe_duration();
            }
        }
    }
}

fn record_response_metrics(message: &Message) {
    DNS_RESPONSES_TOTAL
        .with_label_values(&[
            &message.header.is_authoritative.to_string(),
            &message.header.is_truncated.to_string(),
            &message.header.recursion_desired.to_string(),
            &message.header.recursion_available.to_string(),
            &message.header.rcode.to_string(),
        ])
        .inc();
}

/// Re-send SIGHUP for an immediate out-of-band reload, on top of the
/// periodic and keyspace-notification driven ones.
async fn sighup_reload_task<K: dns_resolver::record_store::Kvs>(controller: Arc<ReloadController<K>>) {
    let mut stream = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGHUP");
            return;
        }
    };

    loop {
        stream.recv().await;
        tracing::info!("SIGHUP received, reloading zone index");
        controller.reload_once().await;
        ZONE_RELOAD_TOTAL.with_label_values(&["sighup"]).inc();
    }
}

/// Run the keyspace-notification subscription, restarting with a
/// backoff if the connection drops - the periodic reload keeps things
/// eventually consistent in the meantime (§4.5: "running both means a
/// change is usually picked up immediately").
async fn keyspace_notification_task<K: dns_resolver::record_store::Kvs>(
    controller: Arc<ReloadController<K>>,
    client: redis::Client,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        match controller.run_keyspace_notifications(client.clone()).await {
            Ok(()) => backoff = Duration::from_secs(1),
            Err(error) => {
                tracing::warn!(%error, ?backoff, "keyspace notification subscription failed, retrying");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(60));
    }
}

fn begin_logging() {
    let log_format: HashSet<String> = env::var("RUST_LOG_FORMAT")
        .map(|var| var.split(',').map(str::to_string).collect())
        .unwrap_or_default();

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        logger.json().init();
    } else if log_format.contains("pretty") {
        logger.pretty().init();
    } else {
        logger.compact().init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    begin_logging();

    let geo = match GeoDatabase::open(args.geo_city_db.as_deref(), args.geo_asn_db.as_deref()) {
        Ok(geo) => geo,
        Err(error) => {
            tracing::error!(?error, "could not open geo database");
            process::exit(1);
        }
    };

    let redis_client = match redis::Client::open(args.kvs_url.as_str()) {
        Ok(client) => client,
        Err(error) => {
            tracing::error!(?error, "invalid KVS connection URL");
            process::exit(1);
        }
    };

    let connection_manager = match timeout(args.connect_timeout(), ConnectionManager::new(redis_client.clone())).await
    {
        Ok(Ok(manager)) => manager,
        Ok(Err(error)) => {
            tracing::error!(?error, "could not connect to KVS");
            process::exit(1);
        }
        Err(_) => {
            tracing::error!("timed out connecting to KVS");
            process::exit(1);
        }
    };

    let naming = KeyNaming {
        prefix: args.key_prefix.clone(),
        suffix: args.key_suffix.clone(),
    };
    let record_store = RecordStore::with_read_timeout(
        connection_manager,
        naming.clone(),
        args.cache_timeout(),
        args.read_timeout(),
    );
    let zone_index = ZoneIndex::new(Zones::new());
    let upstream = UpstreamResolver::new(args.upstream_servers());

    let engine = Arc::new(ResolverEngine::new(
        zone_index,
        record_store,
        geo,
        upstream,
        args.aname_upstream_fallback,
        args.max_cname_chain,
        args.max_ttl,
    ));

    let controller = Arc::new(ReloadController::new(engine.clone(), naming));
    tracing::info!("performing initial zone index load");
    controller.reload_once().await;
    ZONE_COUNT.set(engine.zone_index().snapshot().len() as i64);

    tracing::info!(interface = %args.interface, port = %args.port, "binding DNS UDP socket");
    let udp = match UdpSocket::bind((args.interface, args.port)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(interface = %args.interface, port = %args.port, "binding DNS TCP socket");
    let tcp = match TcpListener::bind((args.interface, args.port)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS TCP socket");
            process::exit(1);
        }
    };

    let listen_args = ListenArgs { engine: engine.clone() };

    tokio::spawn(listen_tcp_task(listen_args.clone(), tcp));
    tokio::spawn(listen_udp_task(listen_args, udp));
    tokio::spawn(sighup_reload_task(controller.clone()));
    tokio::spawn(keyspace_notification_task(controller.clone(), redis_client));
    tokio::spawn({
        let controller = controller.clone();
        let engine = engine.clone();
        let interval = args.zone_reload_interval();
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick - the initial load already happened
            loop {
                ticker.tick().await;
                controller.reload_once().await;
                ZONE_RELOAD_TOTAL.with_label_values(&["periodic"]).inc();
                ZONE_COUNT.set(engine.zone_index().snapshot().len() as i64);
            }
        }
    });

    tracing::info!(interface = %args.metrics_interface, port = %args.metrics_port, "binding metrics HTTP socket");
    let metrics_addr = SocketAddr::from((args.metrics_interface, args.metrics_port));
    if let Err(error) = serve_prometheus_endpoint_task(metrics_addr).await {
        tracing::error!(?error, "could not bind metrics HTTP socket");
        process::exit(1);
    }
}
