//! relayterm: the terminal core of a remote-operations console.
//!
//! Multiplexed interactive shell sessions over relay-mediated WebSocket
//! channels, plus recording and deterministic replay of session output.

pub mod config;
pub mod multiplexer;
pub mod player;
pub mod protocol;
pub mod recording;
pub mod session;
pub mod sink;
pub mod terminal;
pub mod transport;
