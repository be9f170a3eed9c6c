//! Black-box, socket-level scenarios that drive the Coordinator and STUN
//! listeners together over real loopback TCP, exercising the full decode →
//! dispatch → state-machine → encode round trip rather than any one layer in
//! isolation. TURN-plane splicing has its own loopback test in `relay.rs`;
//! here the cascade is only followed as far as the SERVER_TURN_CONNECT
//! hand-off, since that's the last hop the Coordinator plane controls.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::connect::TurnEndpoint;
use crate::model::{ConnectionType, JoinKey, ServerGameType};
use crate::protocol::{coordinator_type, stun_type};
use crate::state::Coordinator;
use crate::wire::{split_frames, Reader, Writer};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_coordinator_and_stun() -> (Arc<Coordinator>, SocketAddr, SocketAddr) {
    let app = Arc::new(Coordinator::new());

    let coordinator_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let coordinator_addr = coordinator_listener.local_addr().unwrap();
    let stun_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stun_addr = stun_listener.local_addr().unwrap();

    let turn = TurnEndpoint {
        host: "turn.example".into(),
        port: 3974,
    };
    tokio::spawn(crate::net::coordinator::run(app.clone(), coordinator_listener, false, turn));
    tokio::spawn(crate::net::stun::run(app.clone(), stun_listener, false));

    (app, coordinator_addr, stun_addr)
}

/// A hand-rolled client for one plane's TCP connection: writes whole frames,
/// reads whole frames back, queuing anything that arrives out of the order
/// the test asked for.
struct TestConn {
    stream: TcpStream,
    buf: BytesMut,
    pending: VecDeque<BytesMut>,
}

impl TestConn {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            pending: VecDeque::new(),
        }
    }

    async fn send(&mut self, frame: BytesMut) {
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn next_frame(&mut self) -> BytesMut {
        loop {
            if let Some(f) = self.pending.pop_front() {
                return f;
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "peer closed unexpectedly");
            for f in split_frames(&mut self.buf) {
                self.pending.push_back(f);
            }
        }
    }

    async fn next_frame_of_type(&mut self, want: u8) -> BytesMut {
        loop {
            let f = self.next_frame().await;
            if f[0] == want {
                return f;
            }
        }
    }
}

async fn recv_type(conn: &mut TestConn, want: u8) -> BytesMut {
    timeout(RECV_TIMEOUT, conn.next_frame_of_type(want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for packet type {want}"))
}

/// Opens a short-lived STUN-plane connection reporting `token`/`interface`,
/// giving the coordinator a moment to record the observation before the
/// caller relies on it.
async fn report_stun_interface(stun_addr: SocketAddr, token_wire: &str, interface: u8) {
    let mut conn = TcpStream::connect(stun_addr).await.unwrap();
    let mut w = Writer::new(stun_type::CLIENT_STUN);
    w.u8(1).string(token_wire).u8(interface);
    conn.write_all(&w.finish()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Drives one server connection through REGISTER and a two-interface Verify
/// cycle (one STUN success, one failure) to a SERVER_REGISTER_ACK, returning
/// the join-key the coordinator assigned.
async fn register_and_await_ack(server_conn: &mut TestConn, stun_addr: SocketAddr, server_port: u16) -> String {
    let mut w = Writer::new(coordinator_type::CLIENT_REGISTER);
    w.u8(1).u8(ServerGameType::Public.as_wire()).u16(server_port);
    server_conn.send(w.finish()).await;

    let stun_req = recv_type(server_conn, coordinator_type::SERVER_STUN_REQUEST).await;
    let mut r = Reader::new(&stun_req[1..]);
    let verify_token = r.string().unwrap();
    r.finish().unwrap();
    assert!(verify_token.starts_with('V'));

    report_stun_interface(stun_addr, &verify_token, 0).await;

    let mut w = Writer::new(coordinator_type::CLIENT_STUN_RESULT);
    w.u8(1).string(&verify_token).u8(0).u8(1);
    server_conn.send(w.finish()).await;

    let mut w = Writer::new(coordinator_type::CLIENT_STUN_RESULT);
    w.u8(1).string(&verify_token).u8(1).u8(0);
    server_conn.send(w.finish()).await;

    let failed = recv_type(server_conn, coordinator_type::SERVER_CONNECT_FAILED).await;
    let mut r = Reader::new(&failed[1..]);
    assert_eq!(r.string().unwrap(), verify_token);

    let ack = recv_type(server_conn, coordinator_type::SERVER_REGISTER_ACK).await;
    let mut r = Reader::new(&ack[1..]);
    let join_key = r.string().unwrap();
    let connection_type = r.u8().unwrap();
    r.finish().unwrap();

    // Loopback refuses the direct dial (nothing listens on `server_port`),
    // so the only reachable family classifies as STUN.
    assert_eq!(connection_type, ConnectionType::Stun.as_wire());
    join_key
}

#[tokio::test]
async fn register_cycles_through_verify_and_acks_stun_classification() {
    let (_app, coordinator_addr, stun_addr) = spawn_coordinator_and_stun().await;
    let mut server_conn = TestConn::connect(coordinator_addr).await;

    let join_key = register_and_await_ack(&mut server_conn, stun_addr, 9999).await;
    assert!(!join_key.is_empty());
}

#[tokio::test]
async fn listing_returns_registered_public_server_after_update() {
    let (_app, coordinator_addr, stun_addr) = spawn_coordinator_and_stun().await;
    let mut server_conn = TestConn::connect(coordinator_addr).await;
    let join_key = register_and_await_ack(&mut server_conn, stun_addr, 9999).await;

    let mut w = Writer::new(coordinator_type::CLIENT_UPDATE);
    w.u8(1).u8(5).string(&join_key).u8(0); // newgrf_mode = 0: no newgrfs yet
    w.u32(1).u32(1);
    w.u8(8).u8(2).u8(0);
    w.string("Example Server").string("13.0").u8(0);
    w.u8(16).u8(3).u8(0);
    w.u16(512).u16(512).u8(0);
    w.u8(1);
    server_conn.send(w.finish()).await;

    let mut client_conn = TestConn::connect(coordinator_addr).await;
    let mut w = Writer::new(coordinator_type::CLIENT_LISTING);
    w.u8(1);
    client_conn.send(w.finish()).await;

    let entry = recv_type(&mut client_conn, coordinator_type::SERVER_LISTING).await;
    let mut r = Reader::new(&entry[1..]);
    assert_eq!(r.u16().unwrap(), 1);
    let _game_info_version = r.u8().unwrap();
    assert_eq!(r.string().unwrap(), join_key);

    let end = recv_type(&mut client_conn, coordinator_type::SERVER_LISTING).await;
    let mut r = Reader::new(&end[1..]);
    assert_eq!(r.u16().unwrap(), 0);
}

#[tokio::test]
async fn listing_omits_a_server_that_never_sent_an_update() {
    let (_app, coordinator_addr, stun_addr) = spawn_coordinator_and_stun().await;
    let mut server_conn = TestConn::connect(coordinator_addr).await;
    register_and_await_ack(&mut server_conn, stun_addr, 9999).await;

    let mut client_conn = TestConn::connect(coordinator_addr).await;
    let mut w = Writer::new(coordinator_type::CLIENT_LISTING);
    w.u8(1);
    client_conn.send(w.finish()).await;

    let end = recv_type(&mut client_conn, coordinator_type::SERVER_LISTING).await;
    let mut r = Reader::new(&end[1..]);
    assert_eq!(r.u16().unwrap(), 0, "unlisted server must not appear before its first UPDATE");
}

#[tokio::test]
async fn connect_cascades_to_turn_and_completes_on_connected() {
    let (app, coordinator_addr, stun_addr) = spawn_coordinator_and_stun().await;
    let mut server_conn = TestConn::connect(coordinator_addr).await;
    let join_key = register_and_await_ack(&mut server_conn, stun_addr, 9999).await;

    let mut client_conn = TestConn::connect(coordinator_addr).await;
    let mut w = Writer::new(coordinator_type::CLIENT_CONNECT);
    w.u8(1).string(&join_key);
    client_conn.send(w.finish()).await;

    let connecting = recv_type(&mut client_conn, coordinator_type::SERVER_CONNECTING).await;
    let mut r = Reader::new(&connecting[1..]);
    let client_token_wire = r.string().unwrap();
    assert_eq!(r.string().unwrap(), join_key);
    r.finish().unwrap();
    assert!(client_token_wire.starts_with('C'));

    // The cascade's first step asks both sides for a fresh STUN reading.
    recv_type(&mut server_conn, coordinator_type::SERVER_STUN_REQUEST).await;
    recv_type(&mut client_conn, coordinator_type::SERVER_STUN_REQUEST).await;

    // Neither side ever reports one back, so the queue runs dry and the
    // driver falls back to the fixed TURN relay for both sides.
    let server_turn = recv_type(&mut server_conn, coordinator_type::SERVER_TURN_CONNECT).await;
    let mut r = Reader::new(&server_turn[1..]);
    assert!(r.string().unwrap().starts_with('S'));

    let client_turn = recv_type(&mut client_conn, coordinator_type::SERVER_TURN_CONNECT).await;
    let mut r = Reader::new(&client_turn[1..]);
    assert_eq!(r.string().unwrap(), client_token_wire);

    let mut w = Writer::new(coordinator_type::CLIENT_CONNECTED);
    w.u8(1).string(&client_token_wire);
    client_conn.send(w.finish()).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let server = app.get_server(&JoinKey::from(join_key)).unwrap();
    assert!(
        server.active_connects.lock().is_empty(),
        "driver should have exited once CONNECTED arrived"
    );

    assert!(
        timeout(Duration::from_millis(200), server_conn.next_frame_of_type(coordinator_type::SERVER_CONNECT_FAILED))
            .await
            .is_err(),
        "a successful CONNECTED must not be followed by CONNECT_FAILED"
    );
}
