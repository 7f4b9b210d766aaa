//! UDP data-plane listener.
//!
//! One reader loop feeds the hub; one writer task drains the reply channel
//! and sends each packet to its recorded destination. The listener never
//! interprets payloads.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::stats::NetStat;
use crate::transport::{
    EndpointAddr, InboundPacket, OutboundPacket, SEND_CHANNEL_CAPACITY, STATS_IDLE_THRESHOLD,
    STATS_LOG_INTERVAL,
};

const READ_BUFFER_LEN: usize = 128 * 1024;

/// A bound UDP relay port.
pub struct UdpRelayListener {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpRelayListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "udp relay listener bound");
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Pump datagrams until shutdown or a socket error.
    pub async fn run(
        self,
        intake: mpsc::Sender<InboundPacket>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (reply_tx, reply_rx) = mpsc::channel(SEND_CHANNEL_CAPACITY);
        let stats = Arc::new(NetStat::new());

        let writer = tokio::spawn(write_loop(
            self.socket.clone(),
            reply_rx,
            stats.clone(),
            self.local_addr,
        ));

        let mut buf = vec![0u8; READ_BUFFER_LEN];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            // This listener is done; others keep running.
                            warn!(local_addr = %self.local_addr, error = %e, "udp read failed, listener exiting");
                            break;
                        }
                    };
                    stats.update_recv(n);
                    let packet = InboundPacket {
                        data: Bytes::copy_from_slice(&buf[..n]),
                        from: EndpointAddr::udp(from),
                        reply: reply_tx.clone(),
                    };
                    if intake.send(packet).await.is_err() {
                        warn!(local_addr = %self.local_addr, "hub intake closed, listener exiting");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    info!(local_addr = %self.local_addr, "udp listener shutting down");
                    break;
                }
            }
        }
        drop(reply_tx);
        writer.abort();
    }
}

async fn write_loop(
    socket: Arc<UdpSocket>,
    mut reply_rx: mpsc::Receiver<OutboundPacket>,
    stats: Arc<NetStat>,
    local_addr: SocketAddr,
) {
    let mut tick = tokio::time::interval(STATS_LOG_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            packet = reply_rx.recv() => {
                let Some(packet) = packet else {
                    debug!(%local_addr, "udp send channel closed");
                    return;
                };
                match socket.send_to(&packet.data, packet.to).await {
                    Ok(n) => stats.update_sent(n),
                    Err(e) => warn!(%local_addr, to = %packet.to, error = %e, "udp send failed"),
                }
            }
            _ = tick.tick() => {
                if !stats.idle(STATS_IDLE_THRESHOLD) {
                    info!(%local_addr, stats = %stats, "udp listener traffic");
                }
            }
        }
    }
}
