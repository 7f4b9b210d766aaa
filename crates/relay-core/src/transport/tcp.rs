//! TCP listener with protocol sniffing.
//!
//! One port serves four greetings. In sniffing order: the fixed SSLTCP
//! pseudo-handshake some WebRTC stacks open TCP candidates with, plain
//! HTTP signaling, real TLS (after which the plaintext is re-sniffed for
//! HTTP vs ICE), and bare length-prefixed ICE-over-TCP. The peeked bytes
//! are always replayed to whichever protocol handler wins.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Extension;
use axum::Router;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use icegate_ice_proto::framer::{
    read_frame, write_frame, MAX_FRAME_LEN, SSL_CLIENT_HELLO, SSL_SERVER_HELLO,
};

use crate::error::{Error, Result};
use crate::signal::ClientAddr;
use crate::stats::NetStat;
use crate::transport::{
    EndpointAddr, InboundPacket, OutboundPacket, PeekStream, SEND_CHANNEL_CAPACITY,
    STATS_IDLE_THRESHOLD, STATS_LOG_INTERVAL,
};

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// The three bytes opening a TLS ClientHello record.
const TLS_HANDSHAKE_PREFIX: [u8; 3] = [0x16, 0x03, 0x01];

/// Everything a sniffed connection might need.
#[derive(Clone)]
struct ConnContext {
    intake: mpsc::Sender<InboundPacket>,
    router: Router,
    tls: Option<TlsAcceptor>,
}

/// A bound TCP relay port.
pub struct TcpRelayListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: ConnContext,
}

impl TcpRelayListener {
    pub async fn bind(
        addr: SocketAddr,
        intake: mpsc::Sender<InboundPacket>,
        router: Router,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, tls = tls.is_some(), "tcp relay listener bound");
        Ok(Self {
            listener,
            local_addr,
            context: ConnContext { intake, router, tls },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until shutdown, backing off on transient accept errors.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = ACCEPT_BACKOFF_INITIAL;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff = ACCEPT_BACKOFF_INITIAL;
                        let context = self.context.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, context).await {
                                debug!(%peer, error = %e, "tcp connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(local_addr = %self.local_addr, error = %e, "accept failed, retrying after {backoff:?}");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    }
                },
                _ = shutdown.changed() => {
                    info!(local_addr = %self.local_addr, "tcp listener shutting down");
                    return;
                }
            }
        }
    }
}

/// Sniff the first bytes and hand the stream to the right protocol.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: ConnContext,
) -> Result<()> {
    let mut stream = PeekStream::new(stream);
    let mut prefix = [0u8; 3];
    prefix.copy_from_slice(stream.peek(3).await?);

    if prefix == SSL_CLIENT_HELLO[..3] {
        if stream.peek(SSL_CLIENT_HELLO.len()).await? == SSL_CLIENT_HELLO {
            debug!(%peer, "ssltcp pseudo-handshake");
            let mut hello = [0u8; SSL_CLIENT_HELLO.len()];
            stream.read_exact(&mut hello).await?;
            stream.write_all(&SSL_SERVER_HELLO).await?;
            return serve_ice(stream, peer, context.intake).await;
        }
        debug!(%peer, "ssltcp-looking prefix without the full magic, treating as raw ice");
        return serve_ice(stream, peer, context.intake).await;
    }

    if is_http_prefix(&prefix) {
        debug!(%peer, "plain http signaling");
        return serve_http(stream, peer, context.router).await;
    }

    if prefix == TLS_HANDSHAKE_PREFIX {
        let Some(acceptor) = context.tls else {
            warn!(%peer, "tls client but no certificate configured, dropping");
            return Ok(());
        };
        let tls_stream = acceptor.accept(stream).await?;
        let mut tls_stream = PeekStream::new(tls_stream);
        let mut inner_prefix = [0u8; 3];
        inner_prefix.copy_from_slice(tls_stream.peek(3).await?);
        return if is_http_prefix(&inner_prefix) {
            debug!(%peer, "https signaling");
            serve_http(tls_stream, peer, context.router).await
        } else {
            debug!(%peer, "ice-over-tls");
            serve_ice(tls_stream, peer, context.intake).await
        };
    }

    debug!(%peer, "raw ice-over-tcp");
    serve_ice(stream, peer, context.intake).await
}

/// The request-line prefixes of the HTTP methods signaling uses.
fn is_http_prefix(prefix: &[u8; 3]) -> bool {
    matches!(prefix, b"GET" | b"POS" | b"PUT" | b"HEA" | b"DEL" | b"OPT")
}

/// Run the ICE-over-TCP framing loop: frames in to the hub, frames out from
/// the per-connection reply channel.
async fn serve_ice<S>(
    stream: S,
    peer: SocketAddr,
    intake: mpsc::Sender<InboundPacket>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let endpoint = EndpointAddr::tcp(peer);
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (reply_tx, mut reply_rx) = mpsc::channel::<OutboundPacket>(SEND_CHANNEL_CAPACITY);
    let stats = Arc::new(NetStat::new());

    let writer_stats = stats.clone();
    let writer_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(STATS_LOG_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                packet = reply_rx.recv() => {
                    let Some(packet) = packet else { return };
                    if let Err(e) = write_frame(&mut writer, &packet.data).await {
                        warn!(%peer, error = %e, "ice-tcp write failed");
                        return;
                    }
                    writer_stats.update_sent(packet.data.len());
                }
                _ = tick.tick() => {
                    if !writer_stats.idle(STATS_IDLE_THRESHOLD) {
                        info!(%peer, stats = %writer_stats, "ice-tcp connection traffic");
                    }
                }
            }
        }
    });

    let mut buf = vec![0u8; MAX_FRAME_LEN];
    loop {
        match read_frame(&mut reader, &mut buf).await {
            Ok(0) => {
                debug!(%peer, "empty ice-tcp frame");
                continue;
            }
            Ok(n) => {
                stats.update_recv(n);
                let packet = InboundPacket {
                    data: Bytes::copy_from_slice(&buf[..n]),
                    from: endpoint,
                    reply: reply_tx.clone(),
                };
                if intake.send(packet).await.is_err() {
                    debug!(%peer, "hub intake closed");
                    break;
                }
            }
            Err(e) => {
                debug!(%peer, error = %e, "ice-tcp read ended");
                break;
            }
        }
    }
    writer_task.abort();
    Ok(())
}

/// Serve HTTP on an already-sniffed stream, tagging requests with the
/// client address signaling needs for the geo decision.
async fn serve_http<S>(stream: S, peer: SocketAddr, router: Router) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = router.layer(Extension(ClientAddr(peer)));
    hyper::server::conn::Http::new()
        .serve_connection(stream, service)
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

/// Load a rustls acceptor from PEM certificate and key files.
pub fn tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("tls setup: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::Config(format!("read cert {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .map_err(|e| Error::Config(format!("parse cert {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificate in {}",
            path.display()
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::Config(format!("read key {}: {e}", path.display())))?;

    let mut reader = pem.as_slice();
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::Config(format!("parse key {}: {e}", path.display())))?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }

    let mut reader = pem.as_slice();
    if let Some(key) = rustls_pemfile::rsa_private_keys(&mut reader)
        .map_err(|e| Error::Config(format!("parse key {}: {e}", path.display())))?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }

    Err(Error::Config(format!(
        "no usable private key in {}",
        path.display()
    )))
}
