//! Data-plane listeners and the messages they exchange with the hub.
//!
//! Every listener pushes inbound packets onto the hub's intake channel
//! together with a handle to its own send channel, so replies flow back out
//! through whichever socket the packet arrived on. Channels are bounded;
//! a slow consumer throttles the producer instead of dropping packets.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

pub mod peek;
pub mod tcp;
pub mod udp;

pub use peek::PeekStream;

/// Capacity of each listener's outbound (reply) channel.
pub const SEND_CHANNEL_CAPACITY: usize = 100;

/// Capacity of the hub's intake channel.
pub const INTAKE_CHANNEL_CAPACITY: usize = 1000;

/// Cadence of the listener traffic-summary log line.
pub(crate) const STATS_LOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Idle threshold below which the summary line is suppressed.
pub(crate) const STATS_IDLE_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(5);

/// The transport a remote endpoint spoke on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Udp,
    Tcp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Udp => write!(f, "udp"),
            Network::Tcp => write!(f, "tcp"),
        }
    }
}

/// A remote endpoint qualified by its transport, the connection-table key.
/// A UDP flow and a TCP connection from the same `ip:port` are distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddr {
    pub network: Network,
    pub addr: SocketAddr,
}

impl EndpointAddr {
    pub fn udp(addr: SocketAddr) -> Self {
        Self { network: Network::Udp, addr }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self { network: Network::Tcp, addr }
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.addr)
    }
}

/// A packet a listener read, on its way to the hub.
pub struct InboundPacket {
    pub data: Bytes,
    pub from: EndpointAddr,
    /// The reading listener's send channel; replies to `from` go here.
    pub reply: mpsc::Sender<OutboundPacket>,
}

/// A packet on its way out through a listener.
///
/// UDP listeners send to `to`; TCP per-connection writers are already bound
/// to their peer and ignore it.
pub struct OutboundPacket {
    pub data: Bytes,
    pub to: SocketAddr,
}
