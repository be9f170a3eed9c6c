//! Core value types shared across the registries and state machines:
//! join-keys, tokens, address families and the reachability classification.

use std::fmt;
use std::net::IpAddr;

use rand::Rng;

/// The 53-character alphabet used to render a join-key. Order matters: it
/// defines the base-53 digit values used by [`JoinKey::generate`].
pub const JOIN_KEY_ALPHABET: &[u8; 53] =
    b"abcdefghjkmnpqrstuvwxyzABCDEFGHJKMNQRSTUVWXYZ23456789";

/// A 5-byte random handle for a registered server, rendered in
/// [`JOIN_KEY_ALPHABET`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinKey(String);

impl JoinKey {
    /// Draws 5 random bytes and renders them least-significant-digit-first
    /// in the 53-character alphabet. Leading zero digits are not emitted,
    /// so the result can be shorter than the "full width" of 5 bytes.
    pub fn generate() -> Self {
        let bytes: [u8; 5] = rand::rng().random();
        let mut value = u64::from_be_bytes({
            let mut buf = [0u8; 8];
            buf[3..8].copy_from_slice(&bytes);
            buf
        });

        let base = JOIN_KEY_ALPHABET.len() as u64;
        let mut out = Vec::new();
        while value > 0 {
            out.push(JOIN_KEY_ALPHABET[(value % base) as usize]);
            value /= base;
        }

        Self(String::from_utf8(out).expect("alphabet is ASCII"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JoinKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JoinKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The role a token plays on the wire, carried as a one-character prefix
/// ahead of the 32 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenRole {
    /// `V` — a registration reachability probe.
    Verify,
    /// `S` — the server side of a connect attempt.
    Server,
    /// `C` — the client side of a connect attempt.
    Client,
}

impl TokenRole {
    pub fn prefix(self) -> char {
        match self {
            Self::Verify => 'V',
            Self::Server => 'S',
            Self::Client => 'C',
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'V' => Some(Self::Verify),
            'S' => Some(Self::Server),
            'C' => Some(Self::Client),
            _ => None,
        }
    }
}

/// A 128-bit session identifier, rendered as 32 lowercase hex characters.
/// Stored and compared without its role prefix; the prefix travels
/// alongside, not inside, the token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(String);

impl Token {
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::rng().random();
        let mut s = String::with_capacity(32);
        for b in bytes {
            s.push_str(&format!("{b:02x}"));
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits a wire token (`<prefix><32 hex chars>`) into its role and bare
    /// value.
    pub fn parse_with_role(raw: &str) -> Option<(TokenRole, Token)> {
        let mut chars = raw.chars();
        let prefix = chars.next()?;
        let role = TokenRole::from_prefix(prefix)?;
        Some((role, Token(chars.as_str().to_string())))
    }

    /// Renders `<prefix><token>` for the wire.
    pub fn with_role(&self, role: TokenRole) -> String {
        format!("{}{}", role.prefix(), self.0)
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Address family a reflexive address or a connection attempt falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    IPv4,
    IPv6,
}

impl Family {
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::IPv4,
            IpAddr::V6(_) => Self::IPv6,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::IPv4 => Self::IPv6,
            Self::IPv6 => Self::IPv4,
        }
    }
}

/// Renders a host for a wire `string` field: IPv6 addresses are wrapped in
/// `[...]`, IPv4 addresses are rendered bare.
pub fn ip_to_wire_string(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Per-family reachability classification of a registered server.
/// Wire-encoded ordinal order is arbitrary but fixed; it does not reflect
/// priority (use [`ConnectionType::rank`] / [`ConnectionType::best_of`] for
/// that).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Isolated = 0,
    Direct = 1,
    Stun = 2,
    Turn = 3,
}

impl ConnectionType {
    pub fn as_wire(self) -> u8 {
        self as u8
    }

    /// Lower is better: DIRECT > STUN > TURN > ISOLATED.
    fn rank(self) -> u8 {
        match self {
            Self::Direct => 0,
            Self::Stun => 1,
            Self::Turn => 2,
            Self::Isolated => 3,
        }
    }

    /// The best of two classifications for the same family, where "best"
    /// never regresses an already-established DIRECT/STUN result to
    /// ISOLATED — ConnectionType only ever improves during a Verify cycle.
    pub fn upgrade_to(self, candidate: Self) -> Self {
        if candidate.rank() < self.rank() {
            candidate
        } else {
            self
        }
    }

    /// Picks the best classification across the known families, in
    /// priority DIRECT > STUN > TURN > ISOLATED.
    pub fn best_of(types: impl IntoIterator<Item = Self>) -> Self {
        types
            .into_iter()
            .min_by_key(|t| t.rank())
            .unwrap_or(Self::Isolated)
    }
}

/// Visibility of a registered server in LISTING responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerGameType {
    Public = 0,
    InviteOnly = 1,
}

impl ServerGameType {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Public),
            1 => Some(Self::InviteOnly),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u8 {
        self as u8
    }
}

/// The game-info blob carried by UPDATE and re-broadcast verbatim in
/// LISTING responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInfo {
    pub newgrfs: Vec<(u32, [u8; 16])>,
    pub game_date: u32,
    pub start_date: u32,
    pub companies_max: u8,
    pub companies_on: u8,
    pub spectators_max: u8,
    pub name: String,
    pub openttd_version: String,
    pub use_password: u8,
    pub clients_max: u8,
    pub clients_on: u8,
    pub spectators_on: u8,
    pub map_width: u16,
    pub map_height: u16,
    pub map_type: u8,
    pub is_dedicated: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_key_uses_only_alphabet_chars() {
        for _ in 0..1000 {
            let key = JoinKey::generate();
            assert!(key.as_str().bytes().all(|b| JOIN_KEY_ALPHABET.contains(&b)));
            assert!(key.as_str().len() <= 7);
        }
    }

    #[test]
    fn token_role_prefix_round_trips() {
        let token = Token::generate();
        let wire = token.with_role(TokenRole::Client);
        assert!(wire.starts_with('C'));

        let (role, parsed) = Token::parse_with_role(&wire).unwrap();
        assert_eq!(role, TokenRole::Client);
        assert_eq!(parsed, token);
    }

    #[test]
    fn connection_type_priority_picks_direct_over_stun() {
        let best = ConnectionType::best_of([ConnectionType::Stun, ConnectionType::Direct]);
        assert_eq!(best, ConnectionType::Direct);
    }

    #[test]
    fn connection_type_priority_falls_back_to_isolated() {
        let best = ConnectionType::best_of([]);
        assert_eq!(best, ConnectionType::Isolated);
    }

    #[test]
    fn upgrade_never_downgrades() {
        let current = ConnectionType::Direct;
        assert_eq!(current.upgrade_to(ConnectionType::Stun), ConnectionType::Direct);
        assert_eq!(current.upgrade_to(ConnectionType::Isolated), ConnectionType::Direct);
    }
}
