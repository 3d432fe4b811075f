//! A minimal client for the configured upstream resolver(s).
//!
//! This exists solely to support ANAME fallback (§6 of the design:
//! "used only for ANAME targets outside all served zones when
//! fallback is enabled, no other purpose within the core"). It is not
//! a general recursive resolver: one question in, one best-effort
//! answer out, no delegation-following.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use dns_types::protocol::types::{
    DomainName, Message, QueryClass, QueryType, Question, Rcode, RecordClass, ResourceRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamProtocol {
    Udp,
    Tcp,
}

/// One configured upstream server: address, transport, and a
/// per-query timeout.
#[derive(Debug, Clone)]
pub struct UpstreamServer {
    pub address: SocketAddr,
    pub protocol: UpstreamProtocol,
    pub timeout: Duration,
}

#[derive(Debug)]
enum UpstreamError {
    Io(std::io::Error),
    Timeout,
    Encode,
    Decode,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UpstreamError::Io(e) => write!(f, "i/o error: {e}"),
            UpstreamError::Timeout => write!(f, "timed out"),
            UpstreamError::Encode => write!(f, "failed to encode query"),
            UpstreamError::Decode => write!(f, "failed to decode response"),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Forwards a question to each configured server in turn, returning
/// the answer section of the first one that replies `NOERROR`.
#[derive(Debug, Clone, Default)]
pub struct UpstreamResolver {
    servers: Vec<UpstreamServer>,
}

impl UpstreamResolver {
    pub fn new(servers: Vec<UpstreamServer>) -> Self {
        Self { servers }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Resolve `qname`/`qtype` against the configured servers. Returns
    /// `None` if every server failed or timed out, or none replied
    /// `NOERROR` - the caller (the resolver engine) treats that as a
    /// dependency error (`SERVFAIL`).
    pub async fn resolve(&self, qname: &DomainName, qtype: QueryType) -> Option<Vec<ResourceRecord>> {
        let question = Question {
            name: qname.clone(),
            qtype,
            qclass: QueryClass::Record(RecordClass::IN),
        };

        for server in &self.servers {
            match self.query_one(server, &question).await {
                Ok(response) if response.header.rcode == Rcode::NoError => {
                    return Some(response.answers);
                }
                Ok(response) => {
                    tracing::debug!(
                        rcode = %response.header.rcode,
                        server = %server.address,
                        "upstream replied with a non-success rcode"
                    );
                }
                Err(error) => {
                    tracing::warn!(%error, server = %server.address, "upstream query failed");
                }
            }
        }

        None
    }

    async fn query_one(&self, server: &UpstreamServer, question: &Question) -> Result<Message, UpstreamError> {
        let id = rand::thread_rng().gen();
        let query = Message::from_question(id, question.clone());
        let bytes = query.to_octets().map_err(|_| UpstreamError::Encode)?;

        let response_bytes = timeout(server.timeout, async {
            match server.protocol {
                UpstreamProtocol::Udp => query_udp(server.address, &bytes).await,
                UpstreamProtocol::Tcp => query_tcp(server.address, &bytes).await,
            }
        })
        .await
        .map_err(|_| UpstreamError::Timeout)??;

        Message::from_octets(&response_bytes).map_err(|_| UpstreamError::Decode)
    }
}

async fn query_udp(address: SocketAddr, bytes: &[u8]) -> Result<Vec<u8>, UpstreamError> {
    let local: SocketAddr = if address.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };

    let socket = UdpSocket::bind(local).await.map_err(UpstreamError::Io)?;
    socket.connect(address).await.map_err(UpstreamError::Io)?;
    socket.send(bytes).await.map_err(UpstreamError::Io)?;

    let mut buf = vec![0u8; 4096];
    let n = socket.recv(&mut buf).await.map_err(UpstreamError::Io)?;
    buf.truncate(n);
    Ok(buf)
}

async fn query_tcp(address: SocketAddr, bytes: &[u8]) -> Result<Vec<u8>, UpstreamError> {
    let mut stream = TcpStream::connect(address).await.map_err(UpstreamError::Io)?;

    let mut framed = BytesMut::with_capacity(bytes.len() + 2);
    framed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    framed.extend_from_slice(bytes);
    stream.write_all(&framed).await.map_err(UpstreamError::Io)?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.map_err(UpstreamError::Io)?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut response = vec![0u8; len];
    stream.read_exact(&mut response).await.map_err(UpstreamError::Io)?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_resolver_never_answers() {
        let resolver = UpstreamResolver::default();
        assert!(resolver.is_empty());

        let qname = DomainName::from_dotted_string("aname.arvan.an.").unwrap();
        assert_eq!(None, resolver.resolve(&qname, QueryType::Record(dns_types::protocol::types::RecordType::A)).await);
    }

    #[tokio::test]
    async fn unreachable_server_times_out_quickly() {
        // nothing is listening on this port - the connect/send should
        // fail or the read should time out well within the bound below
        let resolver = UpstreamResolver::new(vec![UpstreamServer {
            address: "127.0.0.1:1".parse().unwrap(),
            protocol: UpstreamProtocol::Udp,
            timeout: Duration::from_millis(200),
        }]);

        let qname = DomainName::from_dotted_string("example.com.").unwrap();
        let result = resolver.resolve(&qname, QueryType::Record(dns_types::protocol::types::RecordType::A)).await;
        assert_eq!(None, result);
    }
}
