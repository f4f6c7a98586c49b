//! Relay signaling protocol
//!
//! Envelopes exchanged through the message relay before (and alongside)
//! direct peer links: discovery (`join`/`peer`), negotiation
//! (`offer`/`answer`/`ice`/`rollback`), teardown (`leave`/`disconnect`) and
//! presence updates (`meta`/`video`/`sound`).

pub mod envelope;

pub use envelope::{
    Envelope, EnvelopeType, IceCandidate, Meta, PeerId, Role, SdpType, SessionDescription,
};
