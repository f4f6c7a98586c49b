//! Relay transports
//!
//! Carries signaling envelopes between the session and the message relay.

pub mod websocket;

pub use websocket::WebSocketRelay;
