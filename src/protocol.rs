//! Packet catalog and per-plane decode/encode for the three wire protocols
//! (Coordinator, STUN, TURN). See SPEC_FULL.md §6 for the field list this
//! mirrors.

use crate::error::DecodeError;
use crate::model::{GameInfo, JoinKey, ServerGameType};
use crate::wire::{Reader, Writer};
use bytes::BytesMut;

const PROTOCOL_VERSION: u8 = 1;
const GAME_INFO_VERSION: u8 = 5;

/// `NetworkCoordinatorErrorType` — the one error code this service emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorErrorType {
    InvalidJoinKey,
}

impl CoordinatorErrorType {
    pub fn as_wire(self) -> u8 {
        match self {
            Self::InvalidJoinKey => 0,
        }
    }
}

/// A field-level view of an UPDATE packet. `newgrfs` is `None` when the
/// sender omitted the NewGRF list and the previous value should be kept.
#[derive(Debug, Clone)]
pub struct GameInfoUpdate {
    pub newgrfs: Option<Vec<(u32, [u8; 16])>>,
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

impl GameInfoUpdate {
    /// Merges this update onto a previous [`GameInfo`] (or `None` if this is
    /// the server's first UPDATE), inheriting `newgrfs` when the update
    /// didn't carry one.
    pub fn apply(self, previous: Option<&GameInfo>) -> Result<GameInfo, DecodeError> {
        let newgrfs = match self.newgrfs {
            Some(n) => n,
            None => previous
                .map(|p| p.newgrfs.clone())
                .ok_or_else(|| DecodeError::InvalidData("no previous newgrfs to inherit".into()))?,
        };

        Ok(GameInfo {
            newgrfs,
            game_date: self.game_date,
            start_date: self.start_date,
            companies_max: self.companies_max,
            companies_on: self.companies_on,
            spectators_max: self.spectators_max,
            name: self.name,
            openttd_version: self.openttd_version,
            use_password: self.use_password,
            clients_max: self.clients_max,
            clients_on: self.clients_on,
            spectators_on: self.spectators_on,
            map_width: self.map_width,
            map_height: self.map_height,
            map_type: self.map_type,
            is_dedicated: self.is_dedicated,
        })
    }
}

/// Packets accepted from a client or server on the Coordinator plane.
#[derive(Debug, Clone)]
pub enum CoordinatorInbound {
    Register {
        game_type: ServerGameType,
        server_port: u16,
    },
    Update {
        join_key: JoinKey,
        info: GameInfoUpdate,
    },
    Listing,
    Connect {
        join_key: JoinKey,
    },
    ConnectFailed {
        /// Wire token including its role prefix, e.g. `"S0123...".
        token: String,
        tracking_number: u8,
    },
    Connected {
        token: String,
    },
    StunResult {
        token: String,
        interface: u8,
        success: bool,
    },
}

pub(crate) mod coordinator_type {
    pub const CLIENT_REGISTER: u8 = 0;
    pub const CLIENT_UPDATE: u8 = 1;
    pub const CLIENT_LISTING: u8 = 2;
    pub const CLIENT_CONNECT: u8 = 3;
    pub const CLIENT_CONNECT_FAILED: u8 = 4;
    pub const CLIENT_CONNECTED: u8 = 5;
    pub const CLIENT_STUN_RESULT: u8 = 6;
    pub const SERVER_ERROR: u8 = 7;
    pub const SERVER_REGISTER_ACK: u8 = 8;
    pub const SERVER_LISTING: u8 = 9;
    pub const SERVER_CONNECTING: u8 = 10;
    pub const SERVER_CONNECT_FAILED: u8 = 11;
    pub const SERVER_DIRECT_CONNECT: u8 = 12;
    pub const SERVER_STUN_REQUEST: u8 = 13;
    pub const SERVER_STUN_CONNECT: u8 = 14;
    pub const SERVER_TURN_CONNECT: u8 = 15;
    pub const END: u8 = 16;
}

fn check_version(r: &mut Reader) -> Result<(), DecodeError> {
    let v = r.u8()?;
    if v != PROTOCOL_VERSION {
        return Err(DecodeError::InvalidData(format!(
            "unknown protocol version: {v}"
        )));
    }
    Ok(())
}

/// Decodes a Coordinator-plane frame (type byte onward, length prefix
/// already stripped) received from a client or server. Frames whose type is
/// out of range, or which name a server-bound reply, are rejected as
/// `InvalidType` — this dispatcher only ever receives client-bound packets.
pub fn decode_coordinator_inbound(frame: &[u8]) -> Result<CoordinatorInbound, DecodeError> {
    use coordinator_type::*;

    if frame.is_empty() {
        return Err(DecodeError::Truncated);
    }
    let packet_type = frame[0];
    if packet_type >= END {
        return Err(DecodeError::InvalidType(packet_type));
    }

    let mut r = Reader::new(&frame[1..]);

    let packet = match packet_type {
        CLIENT_REGISTER => {
            check_version(&mut r)?;
            let game_type = ServerGameType::from_wire(r.u8()?)
                .ok_or_else(|| DecodeError::InvalidData("invalid game type".into()))?;
            let server_port = r.u16()?;
            CoordinatorInbound::Register {
                game_type,
                server_port,
            }
        }
        CLIENT_UPDATE => {
            check_version(&mut r)?;
            let game_info_version = r.u8()?;
            if game_info_version != GAME_INFO_VERSION {
                return Err(DecodeError::InvalidData(format!(
                    "unknown game info version: {game_info_version}"
                )));
            }
            let join_key = JoinKey::from(r.string()?);

            let newgrf_mode = r.u8()?;
            let newgrfs = if newgrf_mode == 0 {
                None
            } else {
                let count = r.u8()?;
                let mut list = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let id = r.u32()?;
                    let md5: [u8; 16] = r.bytes(16)?.try_into().unwrap();
                    // Mode 2 additionally carries a GRF name; servers
                    // shouldn't send it but we stay protocol-compatible.
                    if newgrf_mode == 2 {
                        let _ = r.string()?;
                    }
                    list.push((id, md5));
                }
                Some(list)
            };

            let game_date = r.u32()?;
            let start_date = r.u32()?;
            let companies_max = r.u8()?;
            let companies_on = r.u8()?;
            let spectators_max = r.u8()?;
            let name = r.string()?;
            let openttd_version = r.string()?;
            let use_password = r.u8()?;
            let clients_max = r.u8()?;
            let clients_on = r.u8()?;
            let spectators_on = r.u8()?;
            let map_width = r.u16()?;
            let map_height = r.u16()?;
            let map_type = r.u8()?;
            let is_dedicated = r.u8()?;

            CoordinatorInbound::Update {
                join_key,
                info: GameInfoUpdate {
                    newgrfs,
                    game_date,
                    start_date,
                    companies_max,
                    companies_on,
                    spectators_max,
                    name,
                    openttd_version,
                    use_password,
                    clients_max,
                    clients_on,
                    spectators_on,
                    map_width,
                    map_height,
                    map_type,
                    is_dedicated,
                },
            }
        }
        CLIENT_LISTING => {
            check_version(&mut r)?;
            CoordinatorInbound::Listing
        }
        CLIENT_CONNECT => {
            check_version(&mut r)?;
            let join_key = JoinKey::from(r.string()?);
            CoordinatorInbound::Connect { join_key }
        }
        CLIENT_CONNECT_FAILED => {
            check_version(&mut r)?;
            let token = r.string()?;
            let tracking_number = r.u8()?;
            CoordinatorInbound::ConnectFailed {
                token,
                tracking_number,
            }
        }
        CLIENT_CONNECTED => {
            check_version(&mut r)?;
            let token = r.string()?;
            CoordinatorInbound::Connected { token }
        }
        CLIENT_STUN_RESULT => {
            check_version(&mut r)?;
            let token = r.string()?;
            let interface = r.u8()?;
            let success = r.u8()? != 0;
            CoordinatorInbound::StunResult {
                token,
                interface,
                success,
            }
        }
        _ => return Err(DecodeError::InvalidType(packet_type)),
    };

    r.finish()?;
    Ok(packet)
}

/// Packets the Coordinator sends back to a client or server.
#[derive(Debug, Clone)]
pub enum CoordinatorOutbound {
    Error {
        code: CoordinatorErrorType,
        detail: String,
    },
    RegisterAck {
        join_key: JoinKey,
        connection_type: u8,
    },
    /// One entry of a SERVER_LISTING response.
    ListingEntry {
        join_key: JoinKey,
        info: GameInfo,
    },
    /// The SERVER_LISTING terminator (count = 0).
    ListingEnd,
    Connecting {
        token: String,
        join_key: JoinKey,
    },
    ConnectFailed {
        token: String,
    },
    DirectConnect {
        token: String,
        tracking_number: u8,
        host: String,
        port: u16,
    },
    StunRequest {
        token: String,
    },
    StunConnect {
        token: String,
        tracking_number: u8,
        interface: u8,
        host: String,
        port: u16,
    },
    TurnConnect {
        token: String,
        tracking_number: u8,
        host: String,
        port: u16,
    },
}

impl CoordinatorOutbound {
    pub fn encode(&self) -> BytesMut {
        use coordinator_type::*;

        match self {
            Self::Error { code, detail } => {
                let mut w = Writer::new(SERVER_ERROR);
                w.u8(code.as_wire()).string(detail);
                w.finish()
            }
            Self::RegisterAck {
                join_key,
                connection_type,
            } => {
                let mut w = Writer::new(SERVER_REGISTER_ACK);
                w.string(join_key.as_str()).u8(*connection_type);
                w.finish()
            }
            Self::ListingEntry { join_key, info } => {
                let mut w = Writer::new(SERVER_LISTING);
                w.u16(1);
                w.u8(GAME_INFO_VERSION);
                w.string(join_key.as_str());
                w.u8(1); // has-newgrf-data
                w.u8(info.newgrfs.len() as u8);
                for (id, md5) in &info.newgrfs {
                    w.u32(*id).bytes(md5);
                }
                w.u32(info.game_date).u32(info.start_date);
                w.u8(info.companies_max)
                    .u8(info.companies_on)
                    .u8(info.spectators_max);
                w.string(&info.name).string(&info.openttd_version);
                w.u8(info.use_password)
                    .u8(info.clients_max)
                    .u8(info.clients_on)
                    .u8(info.spectators_on);
                w.u16(info.map_width).u16(info.map_height).u8(info.map_type);
                w.u8(info.is_dedicated);
                w.finish()
            }
            Self::ListingEnd => {
                let mut w = Writer::new(SERVER_LISTING);
                w.u16(0);
                w.finish()
            }
            Self::Connecting { token, join_key } => {
                let mut w = Writer::new(SERVER_CONNECTING);
                w.string(token).string(join_key.as_str());
                w.finish()
            }
            Self::ConnectFailed { token } => {
                let mut w = Writer::new(SERVER_CONNECT_FAILED);
                w.string(token);
                w.finish()
            }
            Self::DirectConnect {
                token,
                tracking_number,
                host,
                port,
            } => {
                let mut w = Writer::new(SERVER_DIRECT_CONNECT);
                w.string(token).u8(*tracking_number).string(host).u16(*port);
                w.finish()
            }
            Self::StunRequest { token } => {
                let mut w = Writer::new(SERVER_STUN_REQUEST);
                w.string(token);
                w.finish()
            }
            Self::StunConnect {
                token,
                tracking_number,
                interface,
                host,
                port,
            } => {
                let mut w = Writer::new(SERVER_STUN_CONNECT);
                w.string(token)
                    .u8(*tracking_number)
                    .u8(*interface)
                    .string(host)
                    .u16(*port);
                w.finish()
            }
            Self::TurnConnect {
                token,
                tracking_number,
                host,
                port,
            } => {
                let mut w = Writer::new(SERVER_TURN_CONNECT);
                w.string(token).u8(*tracking_number).string(host).u16(*port);
                w.finish()
            }
        }
    }
}

/// STUN plane: the only packet a STUN-plane connection ever sends.
#[derive(Debug, Clone)]
pub struct StunClientStun {
    pub token: String,
    pub interface: u8,
}

pub(crate) mod stun_type {
    pub const CLIENT_STUN: u8 = 0;
    pub const END: u8 = 1;
}

pub fn decode_stun_inbound(frame: &[u8]) -> Result<StunClientStun, DecodeError> {
    if frame.is_empty() {
        return Err(DecodeError::Truncated);
    }
    let packet_type = frame[0];
    if packet_type >= stun_type::END {
        return Err(DecodeError::InvalidType(packet_type));
    }

    let mut r = Reader::new(&frame[1..]);
    check_version(&mut r)?;
    let token = r.string()?;
    let interface = r.u8()?;
    r.finish()?;

    Ok(StunClientStun { token, interface })
}

/// TURN plane inbound: the handshake packet that tells the relay which
/// session this raw byte stream belongs to.
#[derive(Debug, Clone)]
pub struct TurnClientConnect {
    pub token: String,
}

pub(crate) mod turn_type {
    pub const CLIENT_CONNECT: u8 = 0;
    pub const SERVER_CONNECTED: u8 = 1;
    pub const END: u8 = 2;
}

pub fn decode_turn_inbound(frame: &[u8]) -> Result<TurnClientConnect, DecodeError> {
    if frame.is_empty() {
        return Err(DecodeError::Truncated);
    }
    let packet_type = frame[0];
    if packet_type != turn_type::CLIENT_CONNECT {
        return Err(DecodeError::InvalidType(packet_type));
    }

    let mut r = Reader::new(&frame[1..]);
    check_version(&mut r)?;
    let token = r.string()?;
    r.finish()?;

    Ok(TurnClientConnect { token })
}

/// TURN plane outbound: announces the relayed peer's address once both
/// sides of a session have connected.
pub fn encode_turn_server_connected(host: &str, port: u16) -> BytesMut {
    let mut w = Writer::new(turn_type::SERVER_CONNECTED);
    w.string(host).u16(port);
    w.finish()
}
