//! STUN plane listener: short-lived connections whose only purpose is to
//! let the coordinator observe the reflexive (NAT-translated) source
//! address a peer connects from.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use log::warn;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::net::proxy_protocol;
use crate::protocol::decode_stun_inbound;
use crate::state::Coordinator;
use crate::wire::split_frames;

pub async fn run(app: Arc<Coordinator>, listener: TcpListener, proxy_protocol_enabled: bool) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("stun listener accept failed: {e}");
                continue;
            }
        };

        let app = app.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(app, stream, peer_addr, proxy_protocol_enabled).await {
                warn!("stun {peer_addr}: {e}");
            }
        });
    }
}

async fn handle_connection(
    app: Arc<Coordinator>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    proxy_protocol_enabled: bool,
) -> std::io::Result<()> {
    let effective_addr = if proxy_protocol_enabled && proxy_protocol::looks_like_proxy_header(&stream).await {
        proxy_protocol::read_header(&mut stream).await?.unwrap_or(peer_addr)
    } else {
        peer_addr
    };

    let mut buf = BytesMut::with_capacity(256);
    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }

        for frame in split_frames(&mut buf) {
            match decode_stun_inbound(&frame) {
                Ok(packet) => {
                    app.record_stun_observation((packet.token, packet.interface), effective_addr);
                }
                Err(e) => {
                    warn!("stun {peer_addr}: malformed frame: {e}");
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}
