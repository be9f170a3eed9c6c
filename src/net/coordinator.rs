//! Coordinator plane listener: the long-lived control connection every
//! registered server and every querying client keeps open.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use log::warn;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::connect::{spawn_connect, TurnEndpoint};
use crate::model::{Family, JoinKey, TokenRole};
use crate::net::proxy_protocol;
use crate::net::sink::{run_writer, ConnSink};
use crate::protocol::{decode_coordinator_inbound, CoordinatorErrorType, CoordinatorInbound, CoordinatorOutbound};
use crate::state::{Coordinator, Session};
use crate::verify::spawn_verify;
use crate::wire::split_frames;

/// Accepts Coordinator-plane connections until the listener errors.
pub async fn run(app: Arc<Coordinator>, listener: TcpListener, proxy_protocol_enabled: bool, turn: TurnEndpoint) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("coordinator listener accept failed: {e}");
                continue;
            }
        };

        let app = app.clone();
        let turn = turn.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(app, stream, peer_addr, proxy_protocol_enabled, turn).await {
                warn!("coordinator {peer_addr}: {e}");
            }
        });
    }
}

struct ConnectionState {
    join_key: Option<JoinKey>,
    client_family: Family,
}

async fn handle_connection(
    app: Arc<Coordinator>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    proxy_protocol_enabled: bool,
    turn: TurnEndpoint,
) -> std::io::Result<()> {
    let effective_addr = if proxy_protocol_enabled && proxy_protocol::looks_like_proxy_header(&stream).await {
        proxy_protocol::read_header(&mut stream).await?.unwrap_or(peer_addr)
    } else {
        peer_addr
    };

    let (mut reader, write_half) = stream.into_split();
    let (sink, rx) = ConnSink::new();
    tokio::spawn(run_writer(write_half, rx));

    let mut conn = ConnectionState {
        join_key: None,
        client_family: Family::of(effective_addr.ip()),
    };
    let mut buf = BytesMut::with_capacity(4096);

    'read: loop {
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }

        for frame in split_frames(&mut buf) {
            let packet = match decode_coordinator_inbound(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("coordinator {peer_addr}: malformed frame: {e}");
                    break 'read;
                }
            };

            if !dispatch(&app, &sink, &mut conn, &turn, packet).await {
                break 'read;
            }
        }
    }

    if let Some(join_key) = conn.join_key.take() {
        app.remove_server(&join_key);
    }
    Ok(())
}

/// Returns `false` when the dispatcher decided the connection must close.
async fn dispatch(
    app: &Arc<Coordinator>,
    sink: &ConnSink,
    conn: &mut ConnectionState,
    turn: &TurnEndpoint,
    packet: CoordinatorInbound,
) -> bool {
    match packet {
        CoordinatorInbound::Register { game_type, server_port } => {
            let server = match &conn.join_key {
                Some(join_key) => match app.get_server(join_key) {
                    Some(server) => server,
                    None => return false,
                },
                None => {
                    let server = app.create_server(sink.clone(), game_type, server_port);
                    conn.join_key = Some(server.join_key.clone());
                    server
                }
            };
            spawn_verify(app.clone(), server);
            true
        }

        CoordinatorInbound::Update { join_key, info } => {
            if conn.join_key.as_ref() != Some(&join_key) {
                return false;
            }
            let Some(server) = app.get_server(&join_key) else { return false };
            let previous = server.info();
            match info.apply(previous.as_ref()) {
                Ok(new_info) => {
                    server.set_info(new_info);
                    true
                }
                Err(_) => false,
            }
        }

        CoordinatorInbound::Listing => {
            for server in app.list_public_servers() {
                if let Some(info) = server.info() {
                    sink.send(
                        CoordinatorOutbound::ListingEntry { join_key: server.join_key.clone(), info }.encode(),
                    );
                }
            }
            sink.send(CoordinatorOutbound::ListingEnd.encode());
            true
        }

        CoordinatorInbound::Connect { join_key } => {
            let Some(server) = app.get_server(&join_key) else {
                sink.send(
                    CoordinatorOutbound::Error {
                        code: CoordinatorErrorType::InvalidJoinKey,
                        detail: join_key.as_str().to_string(),
                    }
                    .encode(),
                );
                return false;
            };
            let _ = spawn_connect(app.clone(), server, sink.clone(), conn.client_family, turn.clone());
            true
        }

        CoordinatorInbound::ConnectFailed { token, tracking_number } => {
            if let Some((role, session)) = resolve_session(app, &token) {
                if role != TokenRole::Verify {
                    if let Session::Connect(s) = session {
                        s.handle_connect_failed(tracking_number);
                    }
                }
            }
            true
        }

        CoordinatorInbound::Connected { token } => match resolve_session(app, &token) {
            Some((_, Session::Connect(s))) => {
                s.handle_connected(app);
                true
            }
            _ => false,
        },

        CoordinatorInbound::StunResult { token, interface, success } => {
            if let Some((role, session)) = resolve_session(app, &token) {
                match (role, session) {
                    (TokenRole::Verify, Session::Verify(s)) => s.handle_stun_result(app, interface, success).await,
                    (TokenRole::Server | TokenRole::Client, Session::Connect(s)) => {
                        s.handle_stun_result(app, role, interface, success).await
                    }
                    _ => {}
                }
            }
            true
        }
    }
}

fn resolve_session(app: &Coordinator, wire_token: &str) -> Option<(TokenRole, Session)> {
    let (role, token) = crate::model::Token::parse_with_role(wire_token)?;
    let session = app.get_session(&token)?;
    Some((role, session))
}
