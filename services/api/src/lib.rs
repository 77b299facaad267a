//! Speech Relay API Library Crate
//!
//! This library contains all the logic for the speech relay service: the
//! configuration, the WebSocket connection layer, the speech sessions and the
//! routing. The binary in `bin/api.rs` is a thin wrapper around this library.

pub mod config;
pub mod metrics;
pub mod router;
pub mod speech;
pub mod state;
pub mod ws;
