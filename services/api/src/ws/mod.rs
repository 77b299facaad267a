//! WebSocket Connection Layer
//!
//! This module contains everything between the socket and the speech
//! sessions. It is structured into submodules:
//!
//! - `protocol`: the JSON envelope format for client-server communication.
//! - `session`: the upgrade handler and handshake authentication.
//! - `client`: the per-connection reader, writer and heartbeat tasks.
//! - `hub`: the registry of live connections and message delivery.
//! - `dispatch`: routes inbound frames to handlers by type.
//! - `error`: the connection error taxonomy.

pub mod client;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod session;

pub use session::ws_handler;
