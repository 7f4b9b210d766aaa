//! Logical client sessions.
//!
//! A session is one signaled WebRTC client: the ICE credential pair from its
//! offer/answer exchange, the media server's candidates, the set of network
//! paths the client is reaching us over, and the upstream agent carrying its
//! bytes to the media server. Sessions are born from a [`PendingSession`]
//! the signaling layer cached, on the first matching connectivity check.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

use icegate_ice_proto::sdp::agent_remote_sdp;

use crate::config::{UpstreamConfig, UpstreamMode};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::transport::EndpointAddr;
use crate::upstream::{AgentEvent, AgentState, DirectAgent, IceClientAgent, UpstreamAgent};

/// An ICE short-term credential pair as it appears in signaling JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

/// Whether signaling kept the client on the direct path or put this proxy in
/// the middle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    Direct,
    Relay,
}

/// Signaled state waiting in the cache for its first connectivity check.
#[derive(Debug, Clone)]
pub struct PendingSession {
    /// Client-side credentials, from the offer.
    pub offer_ice: IceCredentials,
    /// Server-side credentials, from the answer.
    pub answer_ice: IceCredentials,
    /// The media server's candidate lines.
    pub candidates: Vec<String>,
    pub mode: RouteMode,
}

impl PendingSession {
    /// Cache key, which is also the USERNAME a client puts in its checks:
    /// `answer_ufrag:offer_ufrag`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.answer_ice.ufrag, self.offer_ice.ufrag)
    }
}

/// The connection set and active-path pointer, guarded together.
#[derive(Default)]
struct Paths {
    connections: HashMap<EndpointAddr, Arc<Connection>>,
    active: Option<Arc<Connection>>,
}

/// One live relayed client.
pub struct Session {
    key: String,
    /// Credentials the client authenticates toward us with (from the offer).
    recv_ice: IceCredentials,
    /// Credentials we present as the server (from the answer).
    send_ice: IceCredentials,
    ice_tcp: bool,
    ice_direct: bool,
    paths: Mutex<Paths>,
    agent: Box<dyn UpstreamAgent>,
    leaving: AtomicBool,
}

impl Session {
    /// Materialize a session: build the configured upstream back-end, start
    /// it, and wire its events back into the session. Failure to start the
    /// upstream fails the whole session.
    pub async fn start(pending: PendingSession, upstream: &UpstreamConfig) -> Result<Arc<Self>> {
        let (event_tx, event_rx) = mpsc::channel(crate::upstream::AGENT_QUEUE_CAPACITY);

        let agent: Box<dyn UpstreamAgent> = match upstream.mode {
            UpstreamMode::Direct => Box::new(DirectAgent::new(
                &pending.candidates,
                upstream.prefer_tcp,
                event_tx,
            )),
            UpstreamMode::Ice => {
                let remote_sdp = agent_remote_sdp(
                    &pending.answer_ice.ufrag,
                    &pending.answer_ice.pwd,
                    &pending.candidates,
                );
                Box::new(IceClientAgent::new(
                    pending.offer_ice.clone(),
                    &remote_sdp,
                    event_tx,
                )?)
            }
        };

        let ice_direct = upstream.mode == UpstreamMode::Direct;
        Self::with_agent(pending, agent, event_rx, upstream.prefer_tcp, ice_direct).await
    }

    /// Start with a caller-supplied agent. The seam the back-end selection
    /// above and the tests both go through.
    pub(crate) async fn with_agent(
        pending: PendingSession,
        agent: Box<dyn UpstreamAgent>,
        event_rx: mpsc::Receiver<AgentEvent>,
        ice_tcp: bool,
        ice_direct: bool,
    ) -> Result<Arc<Self>> {
        let session = Arc::new(Session {
            key: pending.key(),
            recv_ice: pending.offer_ice,
            send_ice: pending.answer_ice,
            ice_tcp,
            ice_direct,
            paths: Mutex::new(Paths::default()),
            agent,
            leaving: AtomicBool::new(false),
        });

        if let Err(e) = session.agent.start().await {
            warn!(key = %session.key, error = %e, "upstream agent failed to start");
            session.dispose().await;
            return Err(Error::UpstreamStart(e.to_string()));
        }

        tokio::spawn(Self::run_agent_events(
            Arc::downgrade(&session),
            event_rx,
        ));

        info!(key = %session.key, ice_tcp, ice_direct, "session started");
        Ok(session)
    }

    /// Pump agent events for the lifetime of the session.
    async fn run_agent_events(session: Weak<Session>, mut event_rx: mpsc::Receiver<AgentEvent>) {
        while let Some(event) = event_rx.recv().await {
            let Some(session) = session.upgrade() else { return };
            match event {
                AgentEvent::DataReceived(data) => session.on_server_data(data).await,
                AgentEvent::StateChanged(state) => match state {
                    AgentState::Failed | AgentState::Disconnected => {
                        warn!(key = %session.key, %state, "upstream agent ended, disposing session");
                        session.dispose().await;
                        return;
                    }
                    AgentState::Ready => debug!(key = %session.key, "upstream agent ready"),
                    _ => trace!(key = %session.key, %state, "upstream agent state"),
                },
                AgentEvent::NegotiationDone => debug!(key = %session.key, "upstream negotiation done"),
                AgentEvent::GatheringDone => trace!(key = %session.key, "upstream gathering done"),
                AgentEvent::NewLocalCandidate(line) => {
                    trace!(key = %session.key, line = %line, "upstream local candidate")
                }
                AgentEvent::NewRemoteCandidate(line) => {
                    trace!(key = %session.key, line = %line, "upstream remote candidate")
                }
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Credentials the client signs its checks with (offer side).
    pub fn recv_ice(&self) -> &IceCredentials {
        &self.recv_ice
    }

    /// Credentials we answer with in the server's name (answer side).
    pub fn send_ice(&self) -> &IceCredentials {
        &self.send_ice
    }

    pub fn is_ice_direct(&self) -> bool {
        self.ice_direct
    }

    pub fn is_ice_tcp(&self) -> bool {
        self.ice_tcp
    }

    pub fn is_leaving(&self) -> bool {
        self.leaving.load(Ordering::Acquire)
    }

    /// Attach a connection; the first one becomes the active path.
    pub async fn add_connection(&self, conn: Arc<Connection>) {
        let mut paths = self.paths.lock().await;
        if paths.active.is_none() {
            paths.active = Some(conn.clone());
        }
        paths.connections.insert(conn.endpoint(), conn);
    }

    /// Detach a connection, clearing the active pointer if it pointed here.
    pub async fn remove_connection(&self, endpoint: EndpointAddr) {
        let mut paths = self.paths.lock().await;
        paths.connections.remove(&endpoint);
        if paths
            .active
            .as_ref()
            .is_some_and(|active| active.endpoint() == endpoint)
        {
            paths.active = None;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.paths.lock().await.connections.len()
    }

    /// A session with no paths left is finished.
    pub async fn is_timed_out(&self) -> bool {
        self.paths.lock().await.connections.is_empty()
    }

    /// Client-to-server data: the connection it arrived on becomes the
    /// active path, then the bytes go to the upstream agent.
    pub async fn on_client_data(&self, conn: &Arc<Connection>, data: Bytes) {
        if self.is_leaving() {
            return;
        }
        {
            let mut paths = self.paths.lock().await;
            paths.active = Some(conn.clone());
        }
        match self.agent.send(data).await {
            Ok(_) => {}
            Err(Error::UpstreamNotReady) => {
                debug!(key = %self.key, "client data before upstream ready, dropped")
            }
            Err(e) => debug!(key = %self.key, error = %e, "upstream send failed"),
        }
    }

    /// Server-to-client data: out on the active path, or the first ready
    /// connection when no path was promoted yet.
    pub async fn on_server_data(&self, data: Bytes) {
        if self.is_leaving() {
            return;
        }
        let target = {
            let mut paths = self.paths.lock().await;
            if paths.active.is_none() {
                if let Some((endpoint, conn)) = paths
                    .connections
                    .iter()
                    .find(|(_, c)| c.is_ready())
                    .map(|(e, c)| (*e, c.clone()))
                {
                    info!(key = %self.key, %endpoint, "promoted ready connection to active");
                    paths.active = Some(conn);
                }
            }
            paths.active.clone()
        };

        match target {
            Some(conn) => conn.send_packet(data).await,
            None => warn!(key = %self.key, "server data with no ready client path, dropped"),
        }
    }

    /// Tear the session down: upstream agent first, then every connection.
    pub async fn dispose(&self) {
        if self.leaving.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(key = %self.key, "session disposing");
        self.agent.dispose().await;
        let mut paths = self.paths.lock().await;
        for conn in paths.connections.values() {
            conn.set_leaving();
        }
        paths.connections.clear();
        paths.active = None;
    }
}
