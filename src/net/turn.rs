//! TURN plane listener: each connection announces a token, then (once its
//! counterpart has announced the same token) becomes a raw relayed byte
//! stream. PROXY protocol is never honored here (§4.8) — we read exactly
//! the handshake frame's bytes and not one more, so no relayed byte is
//! ever misread as protocol framing.

use std::sync::Arc;

use log::warn;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::model::Token;
use crate::protocol::decode_turn_inbound;
use crate::relay::RelayRegistry;

pub async fn run(registry: Arc<RelayRegistry>, listener: TcpListener) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("turn listener accept failed: {e}");
                continue;
            }
        };

        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(registry, stream).await {
                warn!("turn {peer_addr}: {e}");
            }
        });
    }
}

async fn handle_connection(registry: Arc<RelayRegistry>, mut stream: TcpStream) -> std::io::Result<()> {
    let peer_addr = stream.peer_addr()?;

    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let frame_len = u16::from_le_bytes(header) as usize;
    if frame_len < 2 {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "zero-length TURN frame"));
    }

    let mut body = vec![0u8; frame_len - 2];
    stream.read_exact(&mut body).await?;

    let handshake = decode_turn_inbound(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

    let Some((role, token)) = Token::parse_with_role(&handshake.token) else {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed TURN token"));
    };

    registry.join(token, role, stream, peer_addr).await;
    Ok(())
}
