//! TURN relay pairing: matches the two TCP connections that share a token,
//! then splices their raw byte streams full-duplex until either side
//! closes.

use std::net::SocketAddr;
use std::time::Instant;

use ahash::{HashMap, HashMapExt};
use log::info;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, copy};
use tokio::net::TcpStream;

use crate::model::{ip_to_wire_string, Token, TokenRole};

struct PendingHalf {
    role: TokenRole,
    stream: TcpStream,
    addr: SocketAddr,
}

/// Holds TURN connections that have announced their token but are still
/// waiting for their counterpart.
#[derive(Default)]
pub struct RelayRegistry {
    pending: Mutex<HashMap<Token, PendingHalf>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one side of a TURN session. The second side to arrive
    /// completes the pair and drives the splice to completion; the first
    /// side simply parks its stream in the registry and returns.
    ///
    /// The remove-or-insert decision happens under a single lock acquisition
    /// so two connections for the same token arriving concurrently can't
    /// both observe "no peer yet" and each park a half that the other then
    /// silently overwrites.
    pub async fn join(&self, token: Token, role: TokenRole, stream: TcpStream, addr: SocketAddr) {
        let paired = {
            let mut pending = self.pending.lock();
            match pending.remove(&token) {
                Some(peer) => Some((PendingHalf { role, stream, addr }, peer)),
                None => {
                    pending.insert(token.clone(), PendingHalf { role, stream, addr });
                    None
                }
            }
        };

        match paired {
            Some((mine, peer)) => {
                let (client, server) = match role {
                    TokenRole::Client => (mine, peer),
                    _ => (peer, mine),
                };
                run_pair(token, client, server).await;
            }
            None => {
                info!("turn {}: {role:?} arrived first, waiting for peer", token.as_str());
            }
        }
    }
}

async fn run_pair(token: Token, client: PendingHalf, server: PendingHalf) {
    let client_addr = client.addr;
    let server_addr = server.addr;

    let client_connected =
        crate::protocol::encode_turn_server_connected(&ip_to_wire_string(server_addr.ip()), server_addr.port());
    let server_connected =
        crate::protocol::encode_turn_server_connected(&ip_to_wire_string(client_addr.ip()), client_addr.port());

    let mut client_stream = client.stream;
    let mut server_stream = server.stream;

    if client_stream.write_all(&client_connected).await.is_err() || server_stream.write_all(&server_connected).await.is_err() {
        return;
    }

    let start = Instant::now();
    let (mut client_r, mut client_w) = client_stream.into_split();
    let (mut server_r, mut server_w) = server_stream.into_split();

    let client_to_server = async {
        let n = copy(&mut client_r, &mut server_w).await.unwrap_or(0);
        let _ = server_w.shutdown().await;
        n
    };
    let server_to_client = async {
        let n = copy(&mut server_r, &mut client_w).await.unwrap_or(0);
        let _ = client_w.shutdown().await;
        n
    };

    let (to_server, to_client) = tokio::join!(client_to_server, server_to_client);

    info!(
        "turn {}: relay closed after {:?}, client->server {to_server} bytes, server->client {to_client} bytes",
        token.as_str(),
        start.elapsed()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream, SocketAddr, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(listener_addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        let (accepted, _) = accepted.unwrap();
        let connected = connected.unwrap();
        let accepted_local = accepted.local_addr().unwrap();
        let connected_local = connected.local_addr().unwrap();
        (accepted, connected, accepted_local, connected_local)
    }

    #[tokio::test]
    async fn pairs_and_splices_both_directions() {
        let registry = RelayRegistry::new();
        let token = Token::from("deadbeefdeadbeefdeadbeefdeadbeef");

        let (client_side, mut client_peer, client_addr, _) = loopback_pair().await;
        let (server_side, mut server_peer, server_addr, _) = loopback_pair().await;

        let registry_ref = &registry;
        let client_token = token.clone();
        let server_token = token.clone();
        tokio::join!(
            registry_ref.join(client_token, TokenRole::Client, client_side, client_addr),
            registry_ref.join(server_token, TokenRole::Server, server_side, server_addr),
        );

        // Both sides receive a TURN_SERVER_CONNECTED frame announcing the peer.
        let mut header = [0u8; 2];
        client_peer.read_exact(&mut header).await.unwrap();
        let len = u16::from_le_bytes(header) as usize;
        let mut rest = vec![0u8; len - 2];
        client_peer.read_exact(&mut rest).await.unwrap();

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_peer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
