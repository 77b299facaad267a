//! Streaming speech recognition sessions.
//!
//! - `manager`: one recognition session per client, created and torn down on request.
//! - `relay`: per-session task that relays engine output back to the client.
//! - `provider`: concrete engine adapters.

pub mod manager;
pub mod provider;
mod relay;

pub use manager::{Readiness, Session, SessionManager, SessionState};
