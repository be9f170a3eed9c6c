//! Transport-facing glue: the three listeners, the per-connection writer
//! task, and the PROXY protocol front-end.

pub mod coordinator;
pub mod proxy_protocol;
pub mod sink;
pub mod stun;
pub mod turn;
