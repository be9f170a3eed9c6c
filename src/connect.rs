//! The per-attempt connection negotiator: drives one client→server session
//! through an ordered cascade of candidate strategies (direct, STUN,
//! TURN-relay) until one succeeds or all are exhausted.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::model::{ConnectionType, Family, ip_to_wire_string, Token, TokenRole};
use crate::net::sink::ConnSink;
use crate::protocol::CoordinatorOutbound;
use crate::state::{Coordinator, Server, Session};

const STRATEGY_FETCH_TIMEOUT: Duration = Duration::from_secs(1);
const STEP_TIMEOUT: Duration = Duration::from_secs(4);
const STUN_LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A candidate connectivity path the driver can attempt.
#[derive(Debug, Clone, Copy)]
enum Strategy {
    Direct(Family),
    StartStun,
    Stun(Family),
    Turn,
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Direct,
    Stun,
    Turn,
}

/// Fixed TURN relay endpoint advertised to both peers when every other
/// strategy is exhausted. A single endpoint, not a pool (§9 open question).
#[derive(Clone)]
pub struct TurnEndpoint {
    pub host: String,
    pub port: u16,
}

pub struct ConnectSession {
    token: Token,
    server: Arc<Server>,
    client_sink: ConnSink,
    client_family: Family,
    turn: TurnEndpoint,

    queue: Mutex<VecDeque<Strategy>>,
    queue_ready: Notify,
    step: Notify,

    tracking_number: AtomicU8,
    is_connected: AtomicBool,
    stuns: Mutex<u8>,

    server_stun: Mutex<HashMap<Family, (u8, SocketAddr)>>,
    client_stun: Mutex<HashMap<Family, (u8, SocketAddr)>>,
    stun_tried: Mutex<HashMap<Family, bool>>,

    connect_state: Mutex<Option<(Method, Family, Family)>>,
}

impl ConnectSession {
    fn push(&self, strat: Strategy) {
        self.queue.lock().push_back(strat);
        self.queue_ready.notify_one();
    }

    /// Handles `CONNECTED(token)`: marks success and wakes the driver.
    /// Token removal is immediate, matching the "lazy deletion" rule —
    /// a CONNECT_FAILED racing in after this point finds nothing to act on.
    pub fn handle_connected(&self, app: &Coordinator) {
        self.is_connected.store(true, Ordering::SeqCst);
        self.step.notify_one();
        app.delete_token(&self.token);
    }

    /// Handles `CONNECT_FAILED(token, tracking_number)`: only a failure for
    /// the *current* attempt advances the driver; stale ones are dropped.
    pub fn handle_connect_failed(&self, tracking_number: u8) {
        if tracking_number == self.tracking_number.load(Ordering::SeqCst) {
            self.step.notify_one();
        }
    }

    /// Handles `STUN_RESULT` with a `C` or `S` prefix.
    pub async fn handle_stun_result(&self, app: &Coordinator, role: TokenRole, interface: u8, success: bool) {
        {
            let mut s = self.stuns.lock();
            *s += 1;
        }
        if !success {
            debug!("connect {}: interface {interface} unreachable for {role:?}", self.token.as_str());
            return;
        }

        let prefixed = self.token.with_role(role);
        let mut addr = app.lookup_stun_observation(&(prefixed, interface));
        if addr.is_none() {
            tokio::time::sleep(STUN_LOOKUP_RETRY_DELAY).await;
            // Preserved as-written: a delayed result is re-looked-up only
            // under the Verify-plane prefix, the same fallback Verify's own
            // handle_stun_result uses, not the role's own prefix again.
            let verify_key = (self.token.with_role(TokenRole::Verify), interface);
            addr = app.lookup_stun_observation(&verify_key);
        }

        let Some(addr) = addr else {
            warn!(
                "connect {}: no STUN observation for interface {interface} ({role:?}), dropping result",
                self.token.as_str()
            );
            return;
        };

        let family = Family::of(addr.ip());

        if matches!(role, TokenRole::Client)
            && family != self.client_family
            && self.server.connection_type(family) == ConnectionType::Direct
        {
            self.push(Strategy::Direct(family));
        }

        match role {
            TokenRole::Server => {
                self.server_stun.lock().insert(family, (interface, addr));
            }
            TokenRole::Client => {
                self.client_stun.lock().insert(family, (interface, addr));
            }
            TokenRole::Verify => return,
        }

        let both_present = self.server_stun.lock().contains_key(&family) && self.client_stun.lock().contains_key(&family);
        if both_present {
            let mut tried = self.stun_tried.lock();
            let already = tried.get(&family).copied().unwrap_or(false);
            if !already {
                tried.insert(family, true);
                drop(tried);
                self.push(Strategy::Stun(family));
            }
        }
    }
}

/// Starts a Connect attempt from `client_sink` toward `server`, returning
/// the wire token (with the client's `C` prefix) to report back to the
/// client.
pub fn spawn_connect(
    app: Arc<Coordinator>,
    server: Arc<Server>,
    client_sink: ConnSink,
    client_family: Family,
    turn: TurnEndpoint,
) -> Token {
    let token = app.create_token(|token| {
        let mut queue = VecDeque::new();
        if server.connection_type(client_family) == ConnectionType::Direct {
            queue.push_back(Strategy::Direct(client_family));
        }
        queue.push_back(Strategy::StartStun);

        Session::Connect(Arc::new(ConnectSession {
            token: token.clone(),
            server: server.clone(),
            client_sink: client_sink.clone(),
            client_family,
            turn: turn.clone(),
            queue: Mutex::new(queue),
            queue_ready: Notify::new(),
            step: Notify::new(),
            tracking_number: AtomicU8::new(0),
            is_connected: AtomicBool::new(false),
            stuns: Mutex::new(0),
            server_stun: Mutex::new(HashMap::new()),
            client_stun: Mutex::new(HashMap::new()),
            stun_tried: Mutex::new(HashMap::new()),
            connect_state: Mutex::new(None),
        }))
    });

    let Some(Session::Connect(session)) = app.get_session(&token) else {
        unreachable!("just inserted");
    };

    client_sink.send(
        CoordinatorOutbound::Connecting {
            token: token.with_role(TokenRole::Client),
            join_key: server.join_key.clone(),
        }
        .encode(),
    );

    let handle = tokio::spawn(run_driver(app.clone(), server.clone(), session, token.clone()));
    server.active_connects.lock().insert(token.clone(), handle);

    token
}

async fn next_strategy(session: &ConnectSession, wait: Duration) -> Option<Strategy> {
    if let Some(s) = session.queue.lock().pop_front() {
        return Some(s);
    }
    let notified = session.queue_ready.notified();
    if timeout(wait, notified).await.is_ok() {
        session.queue.lock().pop_front()
    } else {
        None
    }
}

async fn run_driver(app: Arc<Coordinator>, server: Arc<Server>, session: Arc<ConnectSession>, token: Token) {
    loop {
        let stuns_now = *session.stuns.lock();
        let queue_empty = session.queue.lock().is_empty();

        let (strat, is_final) = if stuns_now >= 4 && queue_empty {
            (Strategy::Turn, true)
        } else {
            match next_strategy(&session, STRATEGY_FETCH_TIMEOUT).await {
                Some(s) => (s, false),
                None => (Strategy::Turn, true),
            }
        };

        run_strategy(&server, &session, &token, strat);

        let _ = timeout(STEP_TIMEOUT, session.step.notified()).await;

        if session.is_connected.load(Ordering::SeqCst) || is_final {
            break;
        }
    }

    if session.is_connected.load(Ordering::SeqCst) {
        info!("connect {}: session {} connected", token.as_str(), server.join_key);
    } else {
        info!("connect {}: session {} exhausted all strategies", token.as_str(), server.join_key);
        server
            .sink
            .send(CoordinatorOutbound::ConnectFailed { token: token.with_role(TokenRole::Server) }.encode());
        session
            .client_sink
            .send(CoordinatorOutbound::ConnectFailed { token: token.with_role(TokenRole::Client) }.encode());
    }

    app.delete_token(&token);
    server.active_connects.lock().remove(&token);
}

fn run_strategy(server: &Server, session: &ConnectSession, token: &Token, strat: Strategy) {
    match strat {
        Strategy::Direct(family) => {
            let tracking = session.tracking_number.fetch_add(1, Ordering::SeqCst) + 1;
            *session.connect_state.lock() = Some((Method::Direct, family, family));

            let Some(ip) = server.server_ip(family) else {
                warn!("connect {}: no observed server ip for {family:?}, skipping direct", token.as_str());
                session.step.notify_one();
                return;
            };

            session.client_sink.send(
                CoordinatorOutbound::DirectConnect {
                    token: token.with_role(TokenRole::Client),
                    tracking_number: tracking,
                    host: ip_to_wire_string(ip),
                    port: server.server_port,
                }
                .encode(),
            );
        }
        Strategy::StartStun => {
            server
                .sink
                .send(CoordinatorOutbound::StunRequest { token: token.with_role(TokenRole::Server) }.encode());
            session
                .client_sink
                .send(CoordinatorOutbound::StunRequest { token: token.with_role(TokenRole::Client) }.encode());
            session.step.notify_one();
        }
        Strategy::Stun(family) => {
            let tracking = session.tracking_number.fetch_add(1, Ordering::SeqCst) + 1;
            *session.connect_state.lock() = Some((Method::Stun, family, family));

            let server_entry = session.server_stun.lock().get(&family).copied();
            let client_entry = session.client_stun.lock().get(&family).copied();
            let (Some((server_iface, server_addr)), Some((client_iface, client_addr))) = (server_entry, client_entry)
            else {
                warn!("connect {}: missing STUN pair for {family:?}", token.as_str());
                session.step.notify_one();
                return;
            };

            session.client_sink.send(
                CoordinatorOutbound::StunConnect {
                    token: token.with_role(TokenRole::Client),
                    tracking_number: tracking,
                    interface: server_iface,
                    host: ip_to_wire_string(server_addr.ip()),
                    port: server_addr.port(),
                }
                .encode(),
            );
            server.sink.send(
                CoordinatorOutbound::StunConnect {
                    token: token.with_role(TokenRole::Server),
                    tracking_number: tracking,
                    interface: client_iface,
                    host: ip_to_wire_string(client_addr.ip()),
                    port: client_addr.port(),
                }
                .encode(),
            );
        }
        Strategy::Turn => {
            let tracking = session.tracking_number.fetch_add(1, Ordering::SeqCst) + 1;
            *session.connect_state.lock() = None;

            server.sink.send(
                CoordinatorOutbound::TurnConnect {
                    token: token.with_role(TokenRole::Server),
                    tracking_number: tracking,
                    host: session.turn.host.clone(),
                    port: session.turn.port,
                }
                .encode(),
            );
            session.client_sink.send(
                CoordinatorOutbound::TurnConnect {
                    token: token.with_role(TokenRole::Client),
                    tracking_number: tracking,
                    host: session.turn.host.clone(),
                    port: session.turn.port,
                }
                .encode(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JoinKey, ServerGameType};

    fn new_session(client_family: Family) -> (Arc<Coordinator>, Arc<Server>, Arc<ConnectSession>, Token) {
        let app = Arc::new(Coordinator::new());
        let (server_sink, _server_rx) = ConnSink::new();
        let server = app.create_server(server_sink, ServerGameType::Public, 3979);
        let (client_sink, _client_rx) = ConnSink::new();

        let turn = TurnEndpoint { host: "turn.example".into(), port: 3974 };
        let token = app.create_token(|token| {
            Session::Connect(Arc::new(ConnectSession {
                token: token.clone(),
                server: server.clone(),
                client_sink,
                client_family,
                turn,
                queue: Mutex::new(VecDeque::new()),
                queue_ready: Notify::new(),
                step: Notify::new(),
                tracking_number: AtomicU8::new(0),
                is_connected: AtomicBool::new(false),
                stuns: Mutex::new(0),
                server_stun: Mutex::new(HashMap::new()),
                client_stun: Mutex::new(HashMap::new()),
                stun_tried: Mutex::new(HashMap::new()),
                connect_state: Mutex::new(None),
            }))
        });
        let Some(Session::Connect(session)) = app.get_session(&token) else {
            panic!()
        };
        (app, server, session, token)
    }

    #[tokio::test]
    async fn stale_connect_failed_is_ignored() {
        let (_app, _server, session, _token) = new_session(Family::IPv4);
        session.tracking_number.store(3, Ordering::SeqCst);
        session.handle_connect_failed(2);

        let woke = timeout(Duration::from_millis(50), session.step.notified()).await;
        assert!(woke.is_err(), "stale CONNECT_FAILED must not signal step");
    }

    #[tokio::test]
    async fn matching_tracking_connect_failed_signals_step() {
        let (_app, _server, session, _token) = new_session(Family::IPv4);
        session.tracking_number.store(3, Ordering::SeqCst);
        let notified = session.step.notified();
        session.handle_connect_failed(3);

        assert!(timeout(Duration::from_millis(50), notified).await.is_ok());
    }

    #[test]
    fn connected_marks_success_and_deletes_token() {
        let (app, _server, session, token) = new_session(Family::IPv4);
        session.handle_connected(&app);
        assert!(session.is_connected.load(Ordering::SeqCst));
        assert!(app.get_session(&token).is_none());
    }

    #[tokio::test]
    async fn matching_stun_pair_enqueues_stun_strategy() {
        let (app, _server, session, _token) = new_session(Family::IPv4);
        let server_prefixed = (session.token.with_role(TokenRole::Server), 0u8);
        let client_prefixed = (session.token.with_role(TokenRole::Client), 0u8);
        app.record_stun_observation(server_prefixed, "198.51.100.1:1".parse().unwrap());
        app.record_stun_observation(client_prefixed, "198.51.100.2:2".parse().unwrap());

        session.handle_stun_result(&app, TokenRole::Server, 0, true).await;
        session.handle_stun_result(&app, TokenRole::Client, 0, true).await;

        assert_eq!(session.queue.lock().len(), 1);
    }
}
