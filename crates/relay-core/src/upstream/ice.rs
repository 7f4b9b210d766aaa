//! Library-driven upstream agent: a small ICE client.
//!
//! The proxy presents the client's short-term credentials to the media
//! server and runs real connectivity checks against the server's UDP host
//! candidates: gather one local host candidate, send authenticated Binding
//! Requests, nominate the first pair that answers, then open the data path.
//! The server's own checks are answered with our password so either side
//! can finish the handshake first.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

use icegate_ice_proto::classify::{classify, PacketKind};
use icegate_ice_proto::sdp::SessionDescription;
use icegate_ice_proto::stun::{attr_type, Attribute, MessageType, StunMessage};
use icegate_ice_proto::Candidate;

use crate::error::{Error, Result};
use crate::session::IceCredentials;
use crate::stats::NetStat;
use crate::upstream::{AgentEvent, AgentState, UpstreamAgent, AGENT_QUEUE_CAPACITY};

/// Interval between connectivity-check rounds.
const CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Give up negotiating after this long.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

const UDP_HOST_PRIORITY: u32 = 2113937151;

fn state_from_u8(value: u8) -> AgentState {
    match value {
        1 => AgentState::Gathering,
        2 => AgentState::Connecting,
        3 => AgentState::Connected,
        4 => AgentState::Ready,
        5 => AgentState::Failed,
        _ => AgentState::Disconnected,
    }
}

fn state_to_u8(state: AgentState) -> u8 {
    match state {
        AgentState::Disconnected => 0,
        AgentState::Gathering => 1,
        AgentState::Connecting => 2,
        AgentState::Connected => 3,
        AgentState::Ready => 4,
        AgentState::Failed => 5,
    }
}

struct Shared {
    local: IceCredentials,
    remote_ufrag: String,
    remote_pwd: String,
    remote_candidates: Vec<SocketAddr>,
    events: mpsc::Sender<AgentEvent>,
    state: AtomicU8,
    ready: AtomicBool,
    closed: AtomicBool,
    /// The nominated remote endpoint once a check succeeded.
    selected: Mutex<Option<SocketAddr>>,
    tiebreaker: u64,
    stats: NetStat,
}

impl Shared {
    async fn set_state(&self, new: AgentState) {
        let old = state_from_u8(self.state.swap(state_to_u8(new), Ordering::AcqRel));
        if old != new {
            debug!(%old, %new, "upstream ice agent state changed");
            let _ = self.events.send(AgentEvent::StateChanged(new)).await;
        }
    }

    fn state(&self) -> AgentState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    /// The Binding Request this agent sends as a check:
    /// USERNAME is `remote_ufrag:local_ufrag`, integrity keyed with the
    /// remote password.
    fn check_request(&self) -> Vec<u8> {
        let mut msg = StunMessage::binding_request();
        let username = format!("{}:{}", self.remote_ufrag, self.local.ufrag);
        msg.add_attribute(Attribute::Username(username.into_bytes()));
        msg.add_attribute(Attribute::Priority(UDP_HOST_PRIORITY));
        msg.add_attribute(Attribute::IceControlling(self.tiebreaker));
        msg.add_attribute(Attribute::UseCandidate);
        msg.add_message_integrity(self.remote_pwd.as_bytes());
        msg.add_fingerprint();
        msg.encode()
    }
}

/// Upstream leg that negotiates ICE with the media server.
pub struct IceClientAgent {
    shared: Arc<Shared>,
    out_tx: mpsc::Sender<Bytes>,
    out_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl IceClientAgent {
    /// Configure local credentials and parse the remote SDP for the server's
    /// credentials and UDP host candidates.
    pub fn new(
        local: IceCredentials,
        remote_sdp: &str,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<Self> {
        let sdp = SessionDescription::parse(remote_sdp)
            .map_err(|e| Error::UpstreamStart(format!("remote sdp: {e}")))?;
        let remote_ufrag = sdp
            .ice_ufrag()
            .ok_or_else(|| Error::UpstreamStart("remote sdp has no ice-ufrag".into()))?
            .to_string();
        let remote_pwd = sdp
            .ice_pwd()
            .ok_or_else(|| Error::UpstreamStart("remote sdp has no ice-pwd".into()))?
            .to_string();

        let remote_candidates: Vec<SocketAddr> =
            Candidate::parse_all(sdp.candidates().iter().map(String::as_str))
                .into_iter()
                .filter(|c| c.is_host() && !c.is_tcp())
                .filter_map(|c| c.endpoint().parse().ok())
                .collect();
        if remote_candidates.is_empty() {
            return Err(Error::UpstreamStart(
                "remote sdp has no udp host candidate".into(),
            ));
        }

        let (out_tx, out_rx) = mpsc::channel(AGENT_QUEUE_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                local,
                remote_ufrag,
                remote_pwd,
                remote_candidates,
                events,
                state: AtomicU8::new(state_to_u8(AgentState::Disconnected)),
                ready: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                selected: Mutex::new(None),
                tiebreaker: rand::random(),
                stats: NetStat::new(),
            }),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    async fn spawn_reader(&self, socket: Arc<UdpSocket>) {
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 128 * 1024];
            loop {
                let (n, from) = match socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "upstream ice socket read failed");
                        shared.set_state(AgentState::Disconnected).await;
                        return;
                    }
                };
                let data = &buf[..n];

                if classify(data) != PacketKind::Stun {
                    if shared.ready.load(Ordering::Acquire) {
                        shared.stats.update_recv(n);
                        let payload = Bytes::copy_from_slice(data);
                        if shared.events.send(AgentEvent::DataReceived(payload)).await.is_err() {
                            return;
                        }
                    } else {
                        trace!(%from, "payload before ice completed, dropped");
                    }
                    continue;
                }

                let msg = match StunMessage::decode(data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(%from, error = %e, "bad stun from media server");
                        continue;
                    }
                };

                match msg.message_type {
                    MessageType::BindingResponse => {
                        if !shared.remote_candidates.contains(&from) {
                            debug!(%from, "binding response from unknown endpoint");
                            continue;
                        }
                        let mut selected = shared.selected.lock().await;
                        if selected.is_none() {
                            *selected = Some(from);
                            drop(selected);
                            info!(%from, "upstream ice pair nominated");
                            shared.set_state(AgentState::Connected).await;
                            let _ = shared.events.send(AgentEvent::NegotiationDone).await;
                            shared.ready.store(true, Ordering::Release);
                            shared.set_state(AgentState::Ready).await;
                        }
                    }
                    MessageType::BindingRequest => {
                        // The server checks toward us; answer with our
                        // password so its side of the handshake completes.
                        if !shared.remote_candidates.contains(&from) {
                            let line = format!(
                                "a=candidate:1 1 udp {UDP_HOST_PRIORITY} {} {} typ prflx",
                                from.ip(),
                                from.port()
                            );
                            let _ = shared.events.send(AgentEvent::NewRemoteCandidate(line)).await;
                        }
                        let mut resp = StunMessage::binding_response(msg.transaction_id);
                        resp.add_attribute(Attribute::XorMappedAddress(from));
                        resp.add_message_integrity(shared.local.pwd.as_bytes());
                        resp.add_fingerprint();
                        if let Err(e) = socket.send_to(&resp.encode(), from).await {
                            warn!(%from, error = %e, "failed to answer server check");
                        }
                    }
                    MessageType::BindingErrorResponse => {
                        if let Some(Attribute::ErrorCode { class, number, reason }) =
                            msg.get(attr_type::ERROR_CODE)
                        {
                            let code = *class as u16 * 100 + *number as u16;
                            warn!(%from, code, reason = %reason, "binding error from server");
                        }
                    }
                    MessageType::BindingIndication => {}
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    async fn spawn_checker(&self, socket: Arc<UdpSocket>) {
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + NEGOTIATION_TIMEOUT;
            loop {
                if shared.closed.load(Ordering::Acquire)
                    || shared.ready.load(Ordering::Acquire)
                {
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!("upstream ice negotiation timed out");
                    shared.set_state(AgentState::Failed).await;
                    return;
                }
                let request = shared.check_request();
                for remote in &shared.remote_candidates {
                    if let Err(e) = socket.send_to(&request, remote).await {
                        warn!(%remote, error = %e, "connectivity check send failed");
                    }
                }
                tokio::time::sleep(CHECK_INTERVAL).await;
            }
        });
        self.tasks.lock().await.push(task);
    }

    async fn spawn_writer(&self, socket: Arc<UdpSocket>, mut out_rx: mpsc::Receiver<Bytes>) {
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(crate::transport::STATS_LOG_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    data = out_rx.recv() => {
                        let Some(data) = data else { return };
                        let Some(remote) = *shared.selected.lock().await else {
                            warn!("dropping upstream payload, no nominated pair yet");
                            continue;
                        };
                        match socket.send_to(&data, remote).await {
                            Ok(n) => shared.stats.update_sent(n),
                            Err(e) => {
                                warn!(%remote, error = %e, "upstream ice write failed");
                                return;
                            }
                        }
                    }
                    _ = tick.tick() => {
                        if !shared.stats.idle(crate::transport::STATS_IDLE_THRESHOLD) {
                            debug!(stats = %shared.stats, "upstream ice traffic");
                        }
                    }
                }
            }
        });
        self.tasks.lock().await.push(task);
    }
}

#[async_trait]
impl UpstreamAgent for IceClientAgent {
    async fn start(&self) -> Result<()> {
        let out_rx = self
            .out_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::UpstreamStart("agent already started".into()))?;

        self.shared.set_state(AgentState::Gathering).await;
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let local_addr = socket.local_addr()?;
        let line = format!(
            "a=candidate:1 1 udp {UDP_HOST_PRIORITY} {} {} typ host",
            local_addr.ip(),
            local_addr.port()
        );
        let _ = self.shared.events.send(AgentEvent::NewLocalCandidate(line)).await;
        let _ = self.shared.events.send(AgentEvent::GatheringDone).await;

        self.shared.set_state(AgentState::Connecting).await;
        self.spawn_reader(socket.clone()).await;
        self.spawn_checker(socket.clone()).await;
        self.spawn_writer(socket, out_rx).await;
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<usize> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::UpstreamClosed);
        }
        if !self.shared.ready.load(Ordering::Acquire) {
            return Err(Error::UpstreamNotReady);
        }
        let len = data.len();
        self.out_tx.send(data).await.map_err(|_| Error::UpstreamClosed)?;
        Ok(len)
    }

    async fn dispose(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.ready.store(false, Ordering::Release);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        debug!(stats = %self.shared.stats, "ice upstream agent disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icegate_ice_proto::stun::verify_integrity;

    fn credentials(ufrag: &str, pwd: &str) -> IceCredentials {
        IceCredentials {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
            options: None,
        }
    }

    /// A minimal media-server stand-in: answers one authenticated check,
    /// then echoes payloads back.
    async fn fake_server(ufrag: String, pwd: String, local_pwd: String) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                let data = &buf[..n];
                if classify(data) == PacketKind::Stun {
                    let msg = StunMessage::decode(data).unwrap();
                    if msg.message_type != MessageType::BindingRequest {
                        continue;
                    }
                    // The check must be addressed to us and keyed with our
                    // password.
                    assert!(msg.username().unwrap().starts_with(&format!("{ufrag}:")));
                    assert!(verify_integrity(data, pwd.as_bytes()).unwrap());
                    let mut resp = StunMessage::binding_response(msg.transaction_id);
                    resp.add_attribute(Attribute::XorMappedAddress(from));
                    resp.add_message_integrity(local_pwd.as_bytes());
                    resp.add_fingerprint();
                    socket.send_to(&resp.encode(), from).await.unwrap();
                } else {
                    socket.send_to(data, from).await.unwrap();
                }
            }
        });
        (addr, handle)
    }

    fn remote_sdp(ufrag: &str, pwd: &str, addr: SocketAddr) -> String {
        format!(
            "m=application\nc=IN IP4 0.0.0.0\na=ice-ufrag:{ufrag}\na=ice-pwd:{pwd}\n\
             a=candidate:1 1 udp 2113937151 {} {} typ host",
            addr.ip(),
            addr.port()
        )
    }

    #[tokio::test]
    async fn negotiates_and_relays_data() {
        let (server_addr, server) =
            fake_server("srv".into(), "srvpwd".into(), "localpwd".into()).await;

        let (tx, mut rx) = mpsc::channel(32);
        let agent = IceClientAgent::new(
            credentials("loc", "localpwd"),
            &remote_sdp("srv", "srvpwd", server_addr),
            tx,
        )
        .unwrap();
        agent.start().await.unwrap();

        // Walk events until Ready.
        let mut negotiation_done = false;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("agent events dried up")
                .expect("agent event channel closed")
            {
                AgentEvent::NegotiationDone => negotiation_done = true,
                AgentEvent::StateChanged(AgentState::Ready) => break,
                AgentEvent::StateChanged(AgentState::Failed) => panic!("negotiation failed"),
                _ => {}
            }
        }
        assert!(negotiation_done);

        agent.send(Bytes::from_static(b"sctp payload")).await.unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                AgentEvent::DataReceived(data) => {
                    assert_eq!(&data[..], b"sctp payload");
                    break;
                }
                _ => {}
            }
        }

        agent.dispose().await;
        server.abort();
    }

    #[tokio::test]
    async fn rejects_sdp_without_credentials() {
        let (tx, _rx) = mpsc::channel(8);
        let sdp = "m=application\na=candidate:1 1 udp 1 127.0.0.1 9999 typ host";
        assert!(matches!(
            IceClientAgent::new(credentials("a", "b"), sdp, tx),
            Err(Error::UpstreamStart(_))
        ));
    }

    #[tokio::test]
    async fn rejects_sdp_without_udp_host_candidates() {
        let (tx, _rx) = mpsc::channel(8);
        let sdp = "m=application\na=ice-ufrag:u\na=ice-pwd:p\n\
                   a=candidate:1 1 tcp 1 127.0.0.1 9999 typ host tcptype passive";
        assert!(matches!(
            IceClientAgent::new(credentials("a", "b"), sdp, tx),
            Err(Error::UpstreamStart(_))
        ));
    }
}
