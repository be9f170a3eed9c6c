//! A rendezvous and NAT-traversal coordinator for a multiplayer game
//! ecosystem: servers register behind arbitrary NATs, clients discover
//! them, and a connection negotiator picks the best reachable path
//! (direct, STUN-assisted, or TURN-relayed) between each pair.

pub mod config;
pub mod connect;
pub mod error;
pub mod model;
pub mod net;
pub mod protocol;
pub mod relay;
pub mod state;
pub mod verify;
pub mod wire;

#[cfg(test)]
mod flow_tests;

use std::net::SocketAddr;
use std::sync::Arc;

use config::Cli;
use connect::TurnEndpoint;
use relay::RelayRegistry;
use state::Coordinator;
use tokio::net::{TcpListener, TcpSocket};

/// Binds a listener with `SO_REUSEADDR`/`SO_REUSEPORT` set before `bind`, per
/// §6's "socket-reuse enabled" requirement (mirroring the original's
/// `loop.create_server(..., reuse_port=True)`), rather than a bare
/// `TcpListener::bind`.
fn bind_reuse_port(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Binds all three listeners across every configured address and runs them
/// to completion (i.e. forever, barring a bind failure).
pub async fn server_main(cli: Cli) -> anyhow::Result<()> {
    let app = Arc::new(Coordinator::new());
    let relays = Arc::new(RelayRegistry::new());
    let turn = TurnEndpoint {
        host: cli.turn_host.clone(),
        port: cli.turn_relay_port,
    };

    let mut tasks = Vec::new();

    for &ip in &cli.bind {
        let coordinator_listener = bind_reuse_port(SocketAddr::new(ip, cli.coordinator_port))?;
        log::info!("coordinator listening on {}", coordinator_listener.local_addr()?);
        tasks.push(tokio::spawn(net::coordinator::run(
            app.clone(),
            coordinator_listener,
            cli.coordinator_proxy_protocol,
            turn.clone(),
        )));

        let stun_listener = bind_reuse_port(SocketAddr::new(ip, cli.stun_port))?;
        log::info!("stun listening on {}", stun_listener.local_addr()?);
        tasks.push(tokio::spawn(net::stun::run(app.clone(), stun_listener, cli.stun_proxy_protocol)));

        let turn_listener = bind_reuse_port(SocketAddr::new(ip, cli.turn_port))?;
        log::info!("turn listening on {}", turn_listener.local_addr()?);
        tasks.push(tokio::spawn(net::turn::run(relays.clone(), turn_listener)));
    }

    for task in tasks {
        task.await?;
    }

    Ok(())
}
