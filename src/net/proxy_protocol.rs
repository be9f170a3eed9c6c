//! Minimal PROXY protocol v1 front-end for the Coordinator and STUN
//! listeners (§6, §4.8). Not used on the TURN plane: TURN connections carry
//! a raw byte stream once paired, and speculatively peeking bytes off it
//! would corrupt the relay.

use std::net::{IpAddr, SocketAddr};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

const MAX_HEADER_LEN: usize = 107; // PROXY v1's own documented worst case.

/// Reads a `PROXY TCP4/TCP6 <src> <dst> <srcport> <dstport>\r\n` header off
/// `stream` and returns the declared source address, replacing the
/// kernel-reported peer address for the remainder of the connection's
/// lifetime.
///
/// Reads one byte at a time so no bytes belonging to the framed protocol
/// that follows are ever buffered-and-discarded — the control plane's
/// connection rate makes this an acceptable cost.
///
/// Returns `Ok(None)` only for the `PROXY UNKNOWN` variant (no usable
/// source address). A malformed header is treated the same as any other
/// malformed frame: the caller should close the connection.
pub async fn read_header(stream: &mut TcpStream) -> std::io::Result<Option<SocketAddr>> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        if stream.read_exact(&mut byte).await.is_err() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before PROXY header",
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_HEADER_LEN {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "PROXY header too long"));
        }
        line.push(byte[0]);
    }

    let line = String::from_utf8(line)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "PROXY header not UTF-8"))?;

    parse_line(line.trim_end_matches('\r')).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed PROXY header")
    })
}

fn parse_line(line: &str) -> Option<Option<SocketAddr>> {
    let mut parts = line.split(' ');
    if parts.next()? != "PROXY" {
        return None;
    }

    match parts.next()? {
        "UNKNOWN" => Some(None),
        "TCP4" | "TCP6" => {
            let src_ip: IpAddr = parts.next()?.parse().ok()?;
            let _dst_ip: IpAddr = parts.next()?.parse().ok()?;
            let src_port: u16 = parts.next()?.parse().ok()?;
            let _dst_port: u16 = parts.next()?.parse().ok()?;
            Some(Some(SocketAddr::new(src_ip, src_port)))
        }
        _ => None,
    }
}

/// Peeks the first bytes of `stream` without consuming them, returning
/// whether they look like the start of a PROXY protocol line. Used so a
/// listener configured with proxy-protocol support doesn't misparse a
/// client that didn't send one — the distilled spec treats this as an
/// all-or-nothing listener setting, so this is only called when the
/// operator has opted in.
pub async fn looks_like_proxy_header(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 6];
    matches!(stream.peek(&mut buf).await, Ok(n) if n >= 5 && &buf[..5] == b"PROXY")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp4_header() {
        let addr = parse_line("PROXY TCP4 198.51.100.7 203.0.113.1 50000 3976")
            .unwrap()
            .unwrap();
        assert_eq!(addr.ip().to_string(), "198.51.100.7");
        assert_eq!(addr.port(), 50000);
    }

    #[test]
    fn parses_unknown_as_no_address() {
        assert_eq!(parse_line("PROXY UNKNOWN"), Some(None));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_line("GET / HTTP/1.1"), None);
    }
}
