//! The reachability prober: drives one STUN-then-direct-dial detection
//! cycle per freshly (re)registered server, classifying it DIRECT/STUN per
//! address family before acking the REGISTER.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::model::{ConnectionType, Family, Token, TokenRole};
use crate::protocol::CoordinatorOutbound;
use crate::state::{Coordinator, Server, Session};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(4);
const STUN_LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(100);
const DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-cycle state for one REGISTER's reachability probe.
pub struct VerifySession {
    token: Token,
    server: Arc<Server>,
    stuns: Mutex<u8>,
    done: Notify,
}

impl VerifySession {
    fn key(&self) -> (String, u8) {
        // interface is filled in by the caller; this helper only builds the
        // token half of the STUN store key.
        (self.token.with_role(TokenRole::Verify), 0)
    }

    fn stun_store_key(&self, interface: u8) -> (String, u8) {
        (self.token.with_role(TokenRole::Verify), interface)
    }

    /// Handles one `STUN_RESULT` addressed to this cycle.
    pub async fn handle_stun_result(&self, app: &Coordinator, interface: u8, success: bool) {
        let stuns = {
            let mut s = self.stuns.lock();
            *s += 1;
            *s
        };

        if !success {
            debug!(
                "verify {}: interface {interface} reported unreachable",
                self.token.as_str()
            );
            if stuns >= 2 {
                self.done.notify_one();
            }
            return;
        }

        let mut addr = app.lookup_stun_observation(&self.stun_store_key(interface));
        if addr.is_none() {
            tokio::time::sleep(STUN_LOOKUP_RETRY_DELAY).await;
            addr = app.lookup_stun_observation(&self.stun_store_key(interface));
        }

        let Some(addr) = addr else {
            warn!(
                "verify {}: no STUN observation for interface {interface}, dropping result",
                self.token.as_str()
            );
            if stuns >= 2 {
                self.done.notify_one();
            }
            return;
        };

        self.classify(addr).await;

        if stuns >= 2 {
            self.done.notify_one();
        }
    }

    async fn classify(&self, observed: SocketAddr) {
        let family = Family::of(observed.ip());
        self.server.set_server_ip(family, observed.ip());

        let dial_target = SocketAddr::new(observed.ip(), self.server.server_port);
        let reachable = matches!(
            timeout(DIRECT_DIAL_TIMEOUT, TcpStream::connect(dial_target)).await,
            Ok(Ok(_))
        );

        let classification = if reachable {
            ConnectionType::Direct
        } else {
            ConnectionType::Stun
        };
        self.server.set_connection_type(family, classification);
    }
}

/// Starts a detection cycle for `server`, registering it as the server's
/// active Verify task.
pub fn spawn_verify(app: Arc<Coordinator>, server: Arc<Server>) {
    let token = app.create_token(|token| {
        Session::Verify(Arc::new(VerifySession {
            token: token.clone(),
            server: server.clone(),
            stuns: Mutex::new(0),
            done: Notify::new(),
        }))
    });

    let Some(Session::Verify(session)) = app.get_session(&token) else {
        unreachable!("just inserted");
    };

    let handle = tokio::spawn(run_cycle(app.clone(), server.clone(), session, token.clone()));
    let previous = server.verify_task.lock().replace((token, handle));
    if let Some((previous_token, previous_handle)) = previous {
        previous_handle.abort();
        app.delete_token(&previous_token);
    }
}

async fn run_cycle(app: Arc<Coordinator>, server: Arc<Server>, session: Arc<VerifySession>, token: Token) {
    server
        .sink
        .send(CoordinatorOutbound::StunRequest {
            token: token.with_role(TokenRole::Verify),
        }
        .encode());

    let _ = timeout(VERIFY_TIMEOUT, session.done.notified()).await;

    server
        .sink
        .send(CoordinatorOutbound::ConnectFailed {
            token: token.with_role(TokenRole::Verify),
        }
        .encode());
    app.delete_token(&token);

    let best = ConnectionType::best_of(server.connection_types().into_iter().map(|(_, t)| t));
    server
        .sink
        .send(CoordinatorOutbound::RegisterAck {
            join_key: server.join_key.clone(),
            connection_type: best.as_wire(),
        }
        .encode());

    debug!(
        "verify {}: server {} classified {best:?}",
        token.as_str(),
        server.join_key
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServerGameType;
    use crate::net::sink::ConnSink;

    #[tokio::test]
    async fn failed_interface_counts_toward_completion_without_reclassifying() {
        let app = Arc::new(Coordinator::new());
        let (sink, _rx) = ConnSink::new();
        let server = app.create_server(sink, ServerGameType::Public, 3979);

        let token = app.create_token(|token| {
            Session::Verify(Arc::new(VerifySession {
                token,
                server: server.clone(),
                stuns: Mutex::new(0),
                done: Notify::new(),
            }))
        });
        let Some(Session::Verify(session)) = app.get_session(&token) else {
            panic!()
        };

        session.handle_stun_result(&app, 0, false).await;
        assert_eq!(server.connection_type(Family::IPv4), ConnectionType::Isolated);
    }

    #[test]
    fn stun_store_key_carries_verify_prefix() {
        let session = VerifySession {
            token: Token::from("abc"),
            server: Arc::new(Server::new(
                crate::model::JoinKey::from("ABCDE"),
                ConnSink::new().0,
                ServerGameType::Public,
                1,
            )),
            stuns: Mutex::new(0),
            done: Notify::new(),
        };
        assert_eq!(session.key().0, "Vabc");
    }
}
