//! Direct-dial upstream agent.
//!
//! When the media server is reachable without NAT traversal, ICE between
//! proxy and server is pure overhead. This back-end picks one of the
//! server's host candidates, dials it, and pumps raw bytes: framed per
//! RFC 4571 on TCP, datagrams on UDP. Candidate order follows the session's
//! transport preference; the first successful dial wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use icegate_ice_proto::framer::{read_frame, write_frame, MAX_FRAME_LEN};
use icegate_ice_proto::{Candidate, TcpType};

use crate::error::{Error, Result};
use crate::stats::NetStat;
use crate::upstream::{AgentEvent, AgentState, UpstreamAgent, AGENT_QUEUE_CAPACITY};

/// Upstream leg that dials a server host candidate directly.
pub struct DirectAgent {
    candidates: Vec<Candidate>,
    prefer_tcp: bool,
    events: mpsc::Sender<AgentEvent>,
    out_tx: mpsc::Sender<Bytes>,
    out_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    ready: AtomicBool,
    closed: AtomicBool,
    stats: Arc<NetStat>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DirectAgent {
    /// Build from the candidate lines signaling cached for this session.
    /// Only host candidates qualify; TCP ones must be `tcptype passive`.
    pub fn new(
        candidate_lines: &[String],
        prefer_tcp: bool,
        events: mpsc::Sender<AgentEvent>,
    ) -> Self {
        let candidates = Candidate::parse_all(candidate_lines.iter().map(String::as_str))
            .into_iter()
            .filter(|c| c.is_host())
            .collect();
        let (out_tx, out_rx) = mpsc::channel(AGENT_QUEUE_CAPACITY);
        Self {
            candidates,
            prefer_tcp,
            events,
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats: Arc::new(NetStat::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Dial order: TCP-passive candidates first when the session asked for
    /// ice-tcp, UDP first otherwise.
    fn dial_order(&self) -> Vec<&Candidate> {
        let (tcp, udp): (Vec<&Candidate>, Vec<&Candidate>) = self
            .candidates
            .iter()
            .filter(|c| !c.is_tcp() || c.tcp_type == Some(TcpType::Passive))
            .partition(|c| c.is_tcp());
        if self.prefer_tcp {
            tcp.into_iter().chain(udp).collect()
        } else {
            udp.into_iter().chain(tcp).collect()
        }
    }

    async fn emit(&self, event: AgentEvent) {
        if self.events.send(event).await.is_err() {
            debug!("agent event receiver dropped");
        }
    }

    async fn run_tcp(&self, stream: TcpStream, out_rx: mpsc::Receiver<Bytes>) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let events = self.events.clone();
        let stats = self.stats.clone();

        let read_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_LEN];
            loop {
                match read_frame(&mut reader, &mut buf).await {
                    Ok(0) => continue,
                    Ok(n) => {
                        stats.update_recv(n);
                        let payload = Bytes::copy_from_slice(&buf[..n]);
                        if events.send(AgentEvent::DataReceived(payload)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "upstream tcp read failed");
                        let _ = events
                            .send(AgentEvent::StateChanged(AgentState::Disconnected))
                            .await;
                        return;
                    }
                }
            }
        });

        let stats = self.stats.clone();
        let mut out_rx = out_rx;
        let write_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(crate::transport::STATS_LOG_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    data = out_rx.recv() => {
                        let Some(data) = data else { return };
                        if let Err(e) = write_frame(&mut writer, &data).await {
                            warn!(error = %e, "upstream tcp write failed");
                            return;
                        }
                        stats.update_sent(data.len());
                    }
                    _ = tick.tick() => {
                        if !stats.idle(crate::transport::STATS_IDLE_THRESHOLD) {
                            debug!(stats = %stats, "upstream tcp traffic");
                        }
                    }
                }
            }
        });

        self.tasks.lock().await.extend([read_task, write_task]);
    }

    async fn run_udp(&self, socket: UdpSocket, out_rx: mpsc::Receiver<Bytes>) {
        let socket = Arc::new(socket);
        let events = self.events.clone();
        let stats = self.stats.clone();

        let read_socket = socket.clone();
        let read_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 128 * 1024];
            loop {
                match read_socket.recv(&mut buf).await {
                    Ok(n) if n > 0 => {
                        stats.update_recv(n);
                        let payload = Bytes::copy_from_slice(&buf[..n]);
                        if events.send(AgentEvent::DataReceived(payload)).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "upstream udp read failed");
                        let _ = events
                            .send(AgentEvent::StateChanged(AgentState::Disconnected))
                            .await;
                        return;
                    }
                }
            }
        });

        let stats = self.stats.clone();
        let mut out_rx = out_rx;
        let write_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(crate::transport::STATS_LOG_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    data = out_rx.recv() => {
                        let Some(data) = data else { return };
                        match socket.send(&data).await {
                            Ok(n) => stats.update_sent(n),
                            Err(e) => {
                                warn!(error = %e, "upstream udp write failed");
                                return;
                            }
                        }
                    }
                    _ = tick.tick() => {
                        if !stats.idle(crate::transport::STATS_IDLE_THRESHOLD) {
                            debug!(stats = %stats, "upstream udp traffic");
                        }
                    }
                }
            }
        });

        self.tasks.lock().await.extend([read_task, write_task]);
    }
}

#[async_trait]
impl UpstreamAgent for DirectAgent {
    async fn start(&self) -> Result<()> {
        let out_rx = self
            .out_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::UpstreamStart("agent already started".into()))?;

        self.emit(AgentEvent::StateChanged(AgentState::Connecting)).await;

        for candidate in self.dial_order() {
            let endpoint = candidate.endpoint();
            if candidate.is_tcp() {
                match TcpStream::connect(&endpoint).await {
                    Ok(stream) => {
                        info!(%endpoint, "upstream connected over tcp");
                        self.run_tcp(stream, out_rx).await;
                        self.ready.store(true, Ordering::Release);
                        self.emit(AgentEvent::StateChanged(AgentState::Connected)).await;
                        self.emit(AgentEvent::StateChanged(AgentState::Ready)).await;
                        return Ok(());
                    }
                    Err(e) => warn!(%endpoint, error = %e, "upstream tcp dial failed"),
                }
            } else {
                let dial = async {
                    let socket = UdpSocket::bind("0.0.0.0:0").await?;
                    socket.connect(&endpoint).await?;
                    std::io::Result::Ok(socket)
                };
                match dial.await {
                    Ok(socket) => {
                        info!(%endpoint, "upstream connected over udp");
                        self.run_udp(socket, out_rx).await;
                        self.ready.store(true, Ordering::Release);
                        self.emit(AgentEvent::StateChanged(AgentState::Connected)).await;
                        self.emit(AgentEvent::StateChanged(AgentState::Ready)).await;
                        return Ok(());
                    }
                    Err(e) => warn!(%endpoint, error = %e, "upstream udp dial failed"),
                }
            }
        }

        self.emit(AgentEvent::StateChanged(AgentState::Failed)).await;
        Err(Error::UpstreamStart(
            "no server host candidate accepted the connection".into(),
        ))
    }

    async fn send(&self, data: Bytes) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UpstreamClosed);
        }
        if !self.ready.load(Ordering::Acquire) {
            return Err(Error::UpstreamNotReady);
        }
        let len = data.len();
        self.out_tx.send(data).await.map_err(|_| Error::UpstreamClosed)?;
        Ok(len)
    }

    async fn dispose(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ready.store(false, Ordering::Release);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        debug!(stats = %self.stats, "direct upstream agent disposed");
    }
}
