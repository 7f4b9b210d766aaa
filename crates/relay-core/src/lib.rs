//! The icegate relay engine.
//!
//! icegate sits between WebRTC clients and a media server. Signaling decides
//! per session whether the client should talk to the server directly or
//! through this proxy; in relay mode the proxy answers the client's ICE
//! connectivity checks with the media server's credentials and bridges the
//! DTLS/SRTP/SCTP byte stream upstream.
//!
//! The moving parts, leaves first: a TTL [`cache`] holding signaled sessions
//! waiting for their first connectivity check, per-remote [`connection`]
//! state, the per-client [`session`] that owns an [`upstream`] agent toward
//! the media server, the [`hub`] that dispatches every inbound packet, the
//! UDP/TCP [`transport`] listeners feeding it, and the HTTP [`signal`]
//! surface that installs sessions.

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod geo;
pub mod hub;
pub mod session;
pub mod signal;
pub mod stats;
pub mod transport;
pub mod upstream;

pub use cache::Cache;
pub use config::RelayConfig;
pub use error::{Error, Result};
pub use hub::Hub;
pub use session::{IceCredentials, PendingSession, RouteMode, Session};
