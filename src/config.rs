//! Process configuration: a `clap`-derived CLI, every flag also readable
//! from a `GAME_COORDINATOR_*` environment variable. No configuration
//! file — the protocol's external interface names flags and environment
//! variables only.

use std::net::IpAddr;

use clap::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
pub struct Cli {
    /// Address to bind every listener to. Repeatable; defaults to loopback
    /// on both address families.
    #[arg(long, env = "GAME_COORDINATOR_BIND", default_values = ["::1", "127.0.0.1"])]
    pub bind: Vec<IpAddr>,

    /// Coordinator-plane TCP port.
    #[arg(long, env = "GAME_COORDINATOR_COORDINATOR_PORT", default_value_t = 3976)]
    pub coordinator_port: u16,

    /// STUN-plane TCP port.
    #[arg(long, env = "GAME_COORDINATOR_STUN_PORT", default_value_t = 3975)]
    pub stun_port: u16,

    /// TURN-plane TCP port.
    #[arg(long, env = "GAME_COORDINATOR_TURN_PORT", default_value_t = 3974)]
    pub turn_port: u16,

    /// Accept a PROXY protocol v1 header ahead of framed traffic on the
    /// Coordinator listener.
    #[arg(long, env = "GAME_COORDINATOR_COORDINATOR_PROXY_PROTOCOL")]
    pub coordinator_proxy_protocol: bool,

    /// Accept a PROXY protocol v1 header ahead of framed traffic on the
    /// STUN listener.
    #[arg(long, env = "GAME_COORDINATOR_STUN_PROXY_PROTOCOL")]
    pub stun_proxy_protocol: bool,

    /// Host advertised to peers as the fixed TURN relay endpoint.
    #[arg(long, env = "GAME_COORDINATOR_TURN_HOST", default_value = "coordinator.openttd.org")]
    pub turn_host: String,

    /// Port advertised to peers as the fixed TURN relay endpoint. Not
    /// necessarily the same as `--turn-port`, the local listener's bind
    /// port.
    #[arg(long, env = "GAME_COORDINATOR_TURN_RELAY_PORT", default_value_t = 3974)]
    pub turn_relay_port: u16,

    /// Logging verbosity.
    #[arg(long, env = "GAME_COORDINATOR_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,
}

impl Cli {
    pub fn load() -> Self {
        Self::parse()
    }
}
