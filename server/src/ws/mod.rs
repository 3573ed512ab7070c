//! WebSocket endpoint: authentication-gated upgrade plus a per-connection
//! actor that bridges the socket and the hub.

pub mod actor;
pub mod handler;
