//! Upstream agents: the proxy's leg toward the media server.
//!
//! Two back-ends satisfy one capability. The `ice` back-end runs a real ICE
//! client against the server: it gathers host candidates, exchanges
//! connectivity checks under the session's short-term credentials and only
//! then opens the data path. The `direct` back-end skips negotiation and
//! dials one of the server's host candidates, framing bytes on TCP.
//! The owning session cannot tell them apart.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod direct;
pub mod ice;

pub use direct::DirectAgent;
pub use ice::IceClientAgent;

/// Capacity of an agent's internal outbound queue.
pub const AGENT_QUEUE_CAPACITY: usize = 100;

/// Upstream agent lifecycle states.
///
/// The happy path walks `Disconnected → Gathering → Connecting → Connected →
/// Ready`; `Failed` is terminal, and `Disconnected` after start is terminal
/// too since the relay never renegotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Ready,
    Failed,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Disconnected => write!(f, "disconnected"),
            AgentState::Gathering => write!(f, "gathering"),
            AgentState::Connecting => write!(f, "connecting"),
            AgentState::Connected => write!(f, "connected"),
            AgentState::Ready => write!(f, "ready"),
            AgentState::Failed => write!(f, "failed"),
        }
    }
}

/// Events an agent reports to its owning session.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    GatheringDone,
    StateChanged(AgentState),
    NegotiationDone,
    NewLocalCandidate(String),
    NewRemoteCandidate(String),
    DataReceived(Bytes),
}

/// The capability a session programs against.
#[async_trait]
pub trait UpstreamAgent: Send + Sync {
    /// Bring the leg up. Resolves once the agent reached a state where
    /// traffic can eventually flow; a returned error means the session
    /// cannot be served.
    async fn start(&self) -> Result<()>;

    /// Queue bytes toward the media server. Never blocks on the network;
    /// a full internal queue makes the caller wait, which is the
    /// backpressure story for the whole client-to-server direction. Returns
    /// the number of bytes accepted, [`crate::Error::UpstreamNotReady`]
    /// before the data path opened, or [`crate::Error::UpstreamClosed`]
    /// after teardown.
    async fn send(&self, data: Bytes) -> Result<usize>;

    /// Tear down sockets and workers. Idempotent.
    async fn dispose(&self);
}
