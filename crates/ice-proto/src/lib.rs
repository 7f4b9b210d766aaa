//! Wire protocols for the icegate relay.
//!
//! This crate implements the byte-level formats the relay speaks on its data
//! ports: the RFC 5389 STUN subset used for ICE connectivity checks, the
//! first-byte packet classification that separates STUN from DTLS/RTP/RTCP,
//! a micro-parser for the SDP fields signaling needs (ice credentials and
//! candidate lines), and the length-prefixed ICE-over-TCP framing.

pub mod candidate;
pub mod classify;
pub mod error;
pub mod framer;
pub mod sdp;
pub mod stun;

pub use candidate::{Candidate, CandidateKind, TcpType};
pub use classify::{classify, PacketKind};
pub use error::{Error, Result};
pub use stun::{Attribute, MessageType, StunMessage, TransactionId};
