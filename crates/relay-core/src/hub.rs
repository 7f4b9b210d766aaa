//! The hub: central packet dispatcher and lifecycle owner.
//!
//! Every listener feeds one intake channel. Packets from a known remote go
//! straight to its connection; an unknown remote must introduce itself with
//! a STUN Binding Request whose USERNAME matches a pending session installed
//! by signaling, which materializes the session, creates the connection and
//! answers the check. A reaper tick collects idle connections and empty
//! sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use icegate_ice_proto::classify::{classify, PacketKind};
use icegate_ice_proto::stun::{MessageType, StunMessage};

use crate::cache::Cache;
use crate::config::UpstreamConfig;
use crate::connection::Connection;
use crate::session::{PendingSession, Session};
use crate::transport::{EndpointAddr, InboundPacket, INTAKE_CHANNEL_CAPACITY};

/// Cadence of the connection/session reaper.
pub const REAP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct HubState {
    connections: HashMap<EndpointAddr, Arc<Connection>>,
    sessions: HashMap<String, Arc<Session>>,
}

/// Owns the connection table, the session map and the signaling cache.
pub struct Hub {
    cache: Arc<Cache<PendingSession>>,
    upstream: UpstreamConfig,
    intake_tx: mpsc::Sender<InboundPacket>,
    intake_rx: Mutex<Option<mpsc::Receiver<InboundPacket>>>,
    state: Mutex<HubState>,
}

impl Hub {
    pub fn new(cache: Arc<Cache<PendingSession>>, upstream: UpstreamConfig) -> Arc<Self> {
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CHANNEL_CAPACITY);
        Arc::new(Self {
            cache,
            upstream,
            intake_tx,
            intake_rx: Mutex::new(Some(intake_rx)),
            state: Mutex::new(HubState::default()),
        })
    }

    /// The channel listeners push inbound packets onto.
    pub fn intake(&self) -> mpsc::Sender<InboundPacket> {
        self.intake_tx.clone()
    }

    pub fn cache(&self) -> &Arc<Cache<PendingSession>> {
        &self.cache
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Main loop: serialized intake, periodic reaping, shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut intake_rx = self
            .intake_rx
            .lock()
            .await
            .take()
            .expect("hub run started twice");

        info!("hub running");
        let mut reap_tick = tokio::time::interval(REAP_INTERVAL);
        reap_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it.
        reap_tick.tick().await;

        loop {
            tokio::select! {
                packet = intake_rx.recv() => match packet {
                    Some(packet) => self.on_packet(packet).await,
                    None => {
                        info!("hub intake closed, exiting");
                        return;
                    }
                },
                _ = reap_tick.tick() => self.reap().await,
                _ = shutdown.changed() => {
                    info!("hub shutting down");
                    self.close().await;
                    return;
                }
            }
        }
    }

    /// Dispatch one inbound packet.
    async fn on_packet(&self, packet: InboundPacket) {
        let known = self.state.lock().await.connections.get(&packet.from).cloned();
        if let Some(conn) = known {
            conn.handle_packet(packet.data).await;
            return;
        }

        // First contact: only an authenticated Binding Request can open a
        // connection.
        if classify(&packet.data) != PacketKind::Stun {
            debug!(from = %packet.from, "non-stun packet from unknown remote, dropped");
            return;
        }
        let msg = match StunMessage::decode(&packet.data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(from = %packet.from, error = %e, "undecodable stun from unknown remote");
                return;
            }
        };
        if msg.message_type != MessageType::BindingRequest {
            debug!(from = %packet.from, message_type = ?msg.message_type, "unexpected stun type from unknown remote");
            return;
        }
        let Some(username) = msg.username() else {
            debug!(from = %packet.from, "binding request without username, dropped");
            return;
        };
        // USERNAME must be exactly `answer_ufrag:offer_ufrag`.
        if username.matches(':').count() != 1 || username.starts_with(':') || username.ends_with(':') {
            debug!(from = %packet.from, username, "malformed stun username, dropped");
            return;
        }
        let username = username.to_string();

        let session = match self.find_or_materialize_session(&username).await {
            Some(session) => session,
            None => return,
        };

        let conn = Connection::new(packet.from, packet.reply.clone(), session.clone());
        session.add_connection(conn.clone()).await;
        self.state
            .lock()
            .await
            .connections
            .insert(packet.from, conn.clone());
        info!(from = %packet.from, key = %username, "connection created");

        conn.handle_packet(packet.data).await;
    }

    /// An existing session for the username, or one materialized from the
    /// signaling cache.
    async fn find_or_materialize_session(&self, username: &str) -> Option<Arc<Session>> {
        if let Some(session) = self.state.lock().await.sessions.get(username).cloned() {
            debug!(key = username, "another connection for a live session");
            return Some(session);
        }

        let Some(pending) = self.cache.get(username).await else {
            debug!(key = username, "no pending session for username, dropped");
            return None;
        };

        match Session::start(pending, &self.upstream).await {
            Ok(session) => {
                self.state
                    .lock()
                    .await
                    .sessions
                    .insert(username.to_string(), session.clone());
                Some(session)
            }
            Err(e) => {
                warn!(key = username, error = %e, "session failed to materialize");
                None
            }
        }
    }

    /// Collect idle or doomed connections, then sessions with no paths left.
    async fn reap(&self) {
        let doomed: Vec<(EndpointAddr, Arc<Connection>)> = {
            let state = self.state.lock().await;
            state
                .connections
                .iter()
                .filter(|(_, conn)| conn.is_timed_out() || conn.is_leaving())
                .map(|(endpoint, conn)| (*endpoint, conn.clone()))
                .collect()
        };
        if !doomed.is_empty() {
            info!(count = doomed.len(), "reaping idle connections");
        }
        for (endpoint, conn) in doomed {
            conn.dispose().await;
            self.state.lock().await.connections.remove(&endpoint);
        }

        let empty: Vec<(String, Arc<Session>)> = {
            let state = self.state.lock().await;
            let mut empty = Vec::new();
            for (key, session) in state.sessions.iter() {
                empty.push((key.clone(), session.clone()));
            }
            empty
        };
        for (key, session) in empty {
            if session.is_timed_out().await {
                info!(key = %key, "reaping empty session");
                session.dispose().await;
                self.state.lock().await.sessions.remove(&key);
            }
        }
    }

    /// Dispose everything. Used at shutdown.
    pub async fn close(&self) {
        let (connections, sessions) = {
            let mut state = self.state.lock().await;
            (
                state.connections.drain().collect::<Vec<_>>(),
                state.sessions.drain().collect::<Vec<_>>(),
            )
        };
        for (_, conn) in connections {
            conn.dispose().await;
        }
        for (_, session) in sessions {
            session.dispose().await;
        }
    }
}
