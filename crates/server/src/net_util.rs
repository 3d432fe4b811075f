//! Wire-level helpers for the UDP/TCP listeners: framing a TCP
//! message with its two-byte length prefix, and setting/clearing the
//! truncation bit when a response doesn't fit the 512-octet
//! traditional UDP limit.

use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// An error that can occur when reading a DNS TCP message.
#[derive(Debug)]
pub enum TcpError {
    TooShort { id: Option<u16>, expected: usize, actual: usize },
    Io { id: Option<u16>, error: io::Error },
}

/// Read a DNS message from a TCP stream.
///
/// A DNS TCP message is slightly different to a DNS UDP message: it
/// has a big-endian u16 prefix giving the total length of the
/// message. This is redundant (the header is fixed-size and the
/// message itself carries section counts), but it lets the whole
/// message be read before parsing begins.
pub async fn read_tcp_bytes(stream: &mut TcpStream) -> Result<BytesMut, TcpError> {
    let size = stream
        .read_u16()
        .await
        .map_err(|error| TcpError::Io { id: None, error })?;

    let expected = size as usize;
    let mut bytes = BytesMut::with_capacity(expected);
    while bytes.len() < expected {
        let id = || if bytes.len() >= 2 { Some(u16::from_be_bytes([bytes[0], bytes[1]])) } else { None };
        match stream.read_buf(&mut bytes).await {
            Ok(0) => {
                return Err(TcpError::TooShort {
                    id: id(),
                    expected,
                    actual: bytes.len(),
                });
            }
            Ok(_) => {}
            Err(error) => return Err(TcpError::Io { id: id(), error }),
        }
    }

    Ok(bytes)
}

/// Write a serialised message to a TCP channel: a two-byte big-endian
/// length prefix followed by the message itself, setting or clearing
/// the TC flag to match what actually fits in a `u16`.
pub async fn send_tcp_bytes(stream: &mut TcpStream, bytes: &mut [u8]) -> io::Result<()> {
    if bytes.len() < 12 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too short"));
    }

    let len = if let Ok(len) = u16::try_from(bytes.len()) {
        bytes[2] &= 0b1111_1101;
        len
    } else {
        bytes[2] |= 0b0000_0010;
        u16::MAX
    };

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes[..len as usize]).await?;
    Ok(())
}

/// Write a serialised message to a UDP socket, truncating to 512
/// octets (and setting the TC flag) if it doesn't fit.
pub async fn send_udp_bytes_to(sock: &UdpSocket, target: SocketAddr, bytes: &mut [u8]) -> io::Result<()> {
    if bytes.len() < 12 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too short"));
    }

    if bytes.len() > 512 {
        bytes[2] |= 0b0000_0010;
        sock.send_to(&bytes[..512], target).await?;
    } else {
        bytes[2] &= 0b1111_1101;
        sock.send_to(bytes, target).await?;
    }

    Ok(())
}
