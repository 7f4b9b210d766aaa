//! Per-remote-endpoint relay state.
//!
//! A connection exists for every `(transport, ip:port)` a client reaches us
//! from. It answers the client's Binding Requests in the media server's name
//! (integrity keyed with the answer-side password), runs its own keepalive
//! check toward the client until a Binding Response proves the path is
//! consensual both ways, and forwards everything that is not STUN to the
//! session. All packet handling for one connection is serialized by the hub,
//! so the bookkeeping here is plain atomics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use icegate_ice_proto::classify::{classify, PacketKind};
use icegate_ice_proto::stun::{Attribute, MessageType, StunMessage, TransactionId};

use crate::session::Session;
use crate::stats::{now_ms, NetStat};
use crate::transport::{EndpointAddr, OutboundPacket};

/// Idle lifetime before the reaper collects a connection.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// First keepalive interval.
const PING_INITIAL: Duration = Duration::from_millis(500);

/// Idle span above which the keepalive interval widens to `delta / 2`.
const PING_WIDEN_AFTER: Duration = Duration::from_secs(5);

/// Idle span at which the keepalive gives the connection up for dead.
const PING_DEADLINE: Duration = Duration::from_secs(15);

/// One network path of a session.
pub struct Connection {
    endpoint: EndpointAddr,
    reply: mpsc::Sender<OutboundPacket>,
    session: Arc<Session>,
    last_activity_ms: AtomicU64,
    ready: AtomicBool,
    had_stun_response: AtomicBool,
    stun_checking: AtomicBool,
    leaving: AtomicBool,
    stats: NetStat,
    /// Self-handle for the pinger task and the session's active pointer.
    weak_self: Weak<Connection>,
}

impl Connection {
    pub fn new(
        endpoint: EndpointAddr,
        reply: mpsc::Sender<OutboundPacket>,
        session: Arc<Session>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            endpoint,
            reply,
            session,
            last_activity_ms: AtomicU64::new(now_ms()),
            ready: AtomicBool::new(false),
            had_stun_response: AtomicBool::new(false),
            stun_checking: AtomicBool::new(false),
            leaving: AtomicBool::new(false),
            stats: NetStat::new(),
            weak_self: weak_self.clone(),
        })
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    pub fn endpoint(&self) -> EndpointAddr {
        self.endpoint
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_leaving(&self) -> bool {
        self.leaving.load(Ordering::Acquire)
    }

    pub fn set_leaving(&self) {
        self.leaving.store(true, Ordering::Release);
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms().saturating_sub(last))
    }

    pub fn is_timed_out(&self) -> bool {
        self.idle() >= CONNECTION_TIMEOUT
    }

    /// Queue bytes out through the listener this connection arrived on.
    pub async fn send_packet(&self, data: Bytes) {
        self.stats.update_sent(data.len());
        let packet = OutboundPacket {
            data,
            to: self.endpoint.addr,
        };
        if self.reply.send(packet).await.is_err() {
            debug!(endpoint = %self.endpoint, "listener send channel closed");
        }
    }

    /// One inbound packet from this connection's remote.
    pub async fn handle_packet(&self, data: Bytes) {
        self.touch();
        self.stats.update_recv(data.len());

        if !self.session.is_ice_direct() && classify(&data) == PacketKind::Stun {
            let msg = match StunMessage::decode(&data) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "undecodable stun packet");
                    return;
                }
            };
            match msg.message_type {
                MessageType::BindingRequest => {
                    self.on_binding_request(msg.transaction_id).await;
                }
                MessageType::BindingResponse => {
                    if self.had_stun_response.swap(true, Ordering::AcqRel) {
                        trace!(endpoint = %self.endpoint, "duplicate binding response");
                    } else {
                        debug!(endpoint = %self.endpoint, "client answered our check, path ready");
                        self.ready.store(true, Ordering::Release);
                    }
                }
                MessageType::BindingErrorResponse => {
                    warn!(endpoint = %self.endpoint, "binding error response from client");
                }
                MessageType::BindingIndication => {
                    trace!(endpoint = %self.endpoint, "binding indication dropped");
                }
            }
        } else {
            // DTLS, SRTP/SRTCP or SCTP payload; in ice-direct mode even STUN
            // passes through untouched.
            self.ready.store(true, Ordering::Release);
            if let Some(me) = self.strong() {
                self.session.on_client_data(&me, data).await;
            }
        }
    }

    /// Answer a client Binding Request in the media server's name and make
    /// sure our own check toward the client is running.
    async fn on_binding_request(&self, transaction_id: TransactionId) {
        if self.is_leaving() {
            debug!(endpoint = %self.endpoint, "binding request after leave, dropped");
            return;
        }

        let mut resp = StunMessage::binding_response(transaction_id);
        resp.add_attribute(Attribute::XorMappedAddress(self.endpoint.addr));
        resp.add_message_integrity(self.session.send_ice().pwd.as_bytes());
        resp.add_fingerprint();
        self.send_packet(Bytes::from(resp.encode())).await;

        self.start_keepalive().await;
    }

    /// Send one Binding Request toward the client, or report that the check
    /// already completed.
    async fn send_binding_check(&self) -> bool {
        if self.had_stun_response.load(Ordering::Acquire) {
            return false;
        }
        let recv_ice = self.session.recv_ice();
        let send_ice = self.session.send_ice();

        let mut req = StunMessage::binding_request();
        let username = format!("{}:{}", recv_ice.ufrag, send_ice.ufrag);
        req.add_attribute(Attribute::Username(username.into_bytes()));
        req.add_message_integrity(recv_ice.pwd.as_bytes());
        req.add_fingerprint();

        trace!(endpoint = %self.endpoint, "sending binding request toward client");
        self.send_packet(Bytes::from(req.encode())).await;
        true
    }

    /// Fire the first check immediately, then keep checking on an adaptive
    /// interval until the client answers or goes quiet for good. At most one
    /// pinger runs per connection.
    async fn start_keepalive(&self) {
        if !self.send_binding_check().await {
            return;
        }
        if self.stun_checking.swap(true, Ordering::AcqRel) {
            return;
        }

        let Some(conn) = self.strong() else {
            self.stun_checking.store(false, Ordering::Release);
            return;
        };
        tokio::spawn(async move {
            let mut interval = PING_INITIAL;
            loop {
                tokio::time::sleep(interval).await;

                if conn.is_leaving() {
                    break;
                }
                if !conn.send_binding_check().await {
                    debug!(endpoint = %conn.endpoint, "keepalive satisfied, pinger exiting");
                    break;
                }

                let idle = conn.idle();
                if idle >= PING_DEADLINE {
                    warn!(endpoint = %conn.endpoint, "no answer from client, giving the path up");
                    conn.set_leaving();
                    break;
                } else if idle > PING_WIDEN_AFTER {
                    interval = idle / 2;
                } else if idle < PING_INITIAL {
                    interval = PING_INITIAL;
                }
            }
            conn.stun_checking.store(false, Ordering::Release);
        });
    }

    /// Shift last-activity into the past, for timeout tests.
    #[cfg(test)]
    pub(crate) fn backdate(&self, ms: u64) {
        self.last_activity_ms
            .store(now_ms().saturating_sub(ms), Ordering::Relaxed);
    }

    /// Detach from the session. The hub removes the table entry.
    pub async fn dispose(&self) {
        self.set_leaving();
        self.session.remove_connection(self.endpoint).await;
        debug!(endpoint = %self.endpoint, stats = %self.stats, "connection disposed");
    }
}
