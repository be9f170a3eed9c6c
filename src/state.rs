//! The shared, process-wide in-memory domain model: the Server registry,
//! the Token registry, and the STUN-observation store. All three are
//! singletons held behind `Arc` and handed to connection handlers — never
//! accessed as free-standing globals (§9's Design Notes).
//!
//! Every map is guarded by a `parking_lot` lock. The logical model (§5) is
//! cooperative single-loop; this port runs on Tokio's multi-threaded
//! runtime, so the locks are what make "mutation happens between
//! suspension points" still true across real OS threads. No `.await` is
//! ever held across a lock guard.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::connect::ConnectSession;
use crate::model::{ConnectionType, Family, GameInfo, JoinKey, ServerGameType, Token};
use crate::net::sink::ConnSink;
use crate::verify::VerifySession;

/// A registered game server: created on first REGISTER from a TCP source,
/// torn down when that source disconnects.
pub struct Server {
    pub join_key: JoinKey,
    pub sink: ConnSink,
    pub game_type: ServerGameType,
    pub server_port: u16,

    reachability: Mutex<Reachability>,
    info: Mutex<Option<GameInfo>>,

    /// The in-flight Verify task for this server, if any, alongside its
    /// token so a caller that aborts the task can also purge it from the
    /// token registry (§3's invariant: exactly one active Verify cycle per
    /// Server, and no token outlives the task driving it).
    pub verify_task: Mutex<Option<(Token, JoinHandle<()>)>>,

    /// Connect attempts currently targeting this server, so a disconnect
    /// can cancel every one of them (§3 invariant (c)).
    pub active_connects: Mutex<HashMap<Token, JoinHandle<()>>>,
}

#[derive(Default)]
struct Reachability {
    ip: HashMap<Family, IpAddr>,
    connection_type: HashMap<Family, ConnectionType>,
}

impl Server {
    pub fn new(join_key: JoinKey, sink: ConnSink, game_type: ServerGameType, server_port: u16) -> Self {
        Self {
            join_key,
            sink,
            game_type,
            server_port,
            reachability: Mutex::new(Reachability::default()),
            info: Mutex::new(None),
            verify_task: Mutex::new(None),
            active_connects: Mutex::new(HashMap::new()),
        }
    }

    pub fn connection_type(&self, family: Family) -> ConnectionType {
        self.reachability
            .lock()
            .connection_type
            .get(&family)
            .copied()
            .unwrap_or(ConnectionType::Isolated)
    }

    /// Upgrades (never downgrades) the classification for `family`.
    pub fn set_connection_type(&self, family: Family, candidate: ConnectionType) {
        let mut r = self.reachability.lock();
        let current = r.connection_type.get(&family).copied().unwrap_or(ConnectionType::Isolated);
        r.connection_type.insert(family, current.upgrade_to(candidate));
    }

    pub fn server_ip(&self, family: Family) -> Option<IpAddr> {
        self.reachability.lock().ip.get(&family).copied()
    }

    pub fn set_server_ip(&self, family: Family, ip: IpAddr) {
        self.reachability.lock().ip.insert(family, ip);
    }

    /// Snapshots both families' classification, for logging and for the
    /// final "best overall" computation.
    pub fn connection_types(&self) -> Vec<(Family, ConnectionType)> {
        let r = self.reachability.lock();
        [Family::IPv4, Family::IPv6]
            .into_iter()
            .map(|f| (f, r.connection_type.get(&f).copied().unwrap_or(ConnectionType::Isolated)))
            .collect()
    }

    pub fn info(&self) -> Option<GameInfo> {
        self.info.lock().clone()
    }

    pub fn set_info(&self, info: GameInfo) {
        *self.info.lock() = Some(info);
    }

    pub fn is_listable(&self) -> bool {
        self.game_type == ServerGameType::Public && self.info.lock().is_some()
    }
}

/// A session referenced by a token: either an in-progress Verify cycle or
/// an in-progress Connect attempt. Indexed by the bare (prefix-stripped)
/// token so STUN_RESULT / CONNECT_FAILED / CONNECTED can be routed to the
/// right state machine regardless of which role prefix they arrived with.
#[derive(Clone)]
pub enum Session {
    Verify(Arc<VerifySession>),
    Connect(Arc<ConnectSession>),
}

/// Key for the STUN-observation store: `(prefix||token, interface-id)` —
/// the prefix is part of the key (§3 invariant (e)), because the Verify and
/// Connect machines each probe under their own role prefix.
pub type StunKey = (String, u8);

/// The coordinator's process-wide shared state.
pub struct Coordinator {
    servers: RwLock<HashMap<JoinKey, Arc<Server>>>,
    tokens: RwLock<HashMap<Token, Session>>,
    stun_store: RwLock<HashMap<StunKey, SocketAddr>>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            stun_store: RwLock::new(HashMap::new()),
        }
    }

    // -- Server registry -------------------------------------------------

    /// Allocates a fresh, collision-free join-key and registers a new
    /// server under it.
    pub fn create_server(&self, sink: ConnSink, game_type: ServerGameType, server_port: u16) -> Arc<Server> {
        let mut servers = self.servers.write();
        let join_key = loop {
            let candidate = JoinKey::generate();
            if !servers.contains_key(&candidate) {
                break candidate;
            }
        };

        let server = Arc::new(Server::new(join_key.clone(), sink, game_type, server_port));
        servers.insert(join_key, server.clone());
        server
    }

    pub fn get_server(&self, join_key: &JoinKey) -> Option<Arc<Server>> {
        self.servers.read().get(join_key).cloned()
    }

    pub fn list_public_servers(&self) -> Vec<Arc<Server>> {
        self.servers
            .read()
            .values()
            .filter(|s| s.is_listable())
            .cloned()
            .collect()
    }

    /// Tears down a server and everything that referenced it: its
    /// in-flight Connect attempts, its in-flight Verify cycle, and its
    /// entry in the server registry. Idempotent.
    pub fn remove_server(&self, join_key: &JoinKey) {
        let server = self.servers.write().remove(join_key);
        let Some(server) = server else { return };

        for (token, handle) in server.active_connects.lock().drain() {
            handle.abort();
            self.delete_token(&token);
        }

        if let Some((token, handle)) = server.verify_task.lock().take() {
            handle.abort();
            self.delete_token(&token);
        }
    }

    // -- Token registry ---------------------------------------------------

    /// Allocates a fresh, collision-free token and stores `session` under
    /// it.
    pub fn create_token(&self, make_session: impl FnOnce(Token) -> Session) -> Token {
        let mut tokens = self.tokens.write();
        let token = loop {
            let candidate = Token::generate();
            if !tokens.contains_key(&candidate) {
                break candidate;
            }
        };

        tokens.insert(token.clone(), make_session(token.clone()));
        token
    }

    pub fn get_session(&self, token: &Token) -> Option<Session> {
        self.tokens.read().get(token).cloned()
    }

    /// Removes a token's session and purges any STUN observations filed
    /// under it (§3 invariant: token teardown purges its STUN entries).
    pub fn delete_token(&self, token: &Token) {
        self.tokens.write().remove(token);

        let mut store = self.stun_store.write();
        store.retain(|(key, _), _| !key.ends_with(token.as_str()));
    }

    // -- STUN observation store -------------------------------------------

    pub fn record_stun_observation(&self, key: StunKey, addr: SocketAddr) {
        self.stun_store.write().insert(key, addr);
    }

    pub fn lookup_stun_observation(&self, key: &StunKey) -> Option<SocketAddr> {
        self.stun_store.read().get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> ConnSink {
        ConnSink::new().0
    }

    #[test]
    fn create_server_generates_unique_join_keys() {
        let app = Coordinator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let s = app.create_server(sink(), ServerGameType::Public, 3979);
            assert!(seen.insert(s.join_key.clone()));
        }
    }

    #[test]
    fn remove_server_cancels_connect_tokens_and_purges_stun() {
        let app = Coordinator::new();
        let server = app.create_server(sink(), ServerGameType::Public, 3979);

        let token = Token::generate();
        app.record_stun_observation(("S".to_string() + token.as_str(), 0), "127.0.0.1:1".parse().unwrap());

        let handle = tokio::spawn(async { std::future::pending::<()>().await });
        server.active_connects.lock().insert(token.clone(), handle);

        app.remove_server(&server.join_key);

        assert!(app.get_server(&server.join_key).is_none());
        assert!(app
            .lookup_stun_observation(&("S".to_string() + token.as_str(), 0))
            .is_none());
    }

    #[test]
    fn connection_type_never_regresses_within_a_server() {
        let server = Server::new(JoinKey::from("ABCDE"), sink(), ServerGameType::Public, 1);
        server.set_connection_type(Family::IPv4, ConnectionType::Direct);
        server.set_connection_type(Family::IPv4, ConnectionType::Stun);
        assert_eq!(server.connection_type(Family::IPv4), ConnectionType::Direct);
    }
}
