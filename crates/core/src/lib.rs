//! Collaborator contracts for the speech relay: the streaming recognition
//! engine and the handshake identity provider.

pub mod engine;
pub mod identity;
