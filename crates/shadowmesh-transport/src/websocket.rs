//! TLS 1.3 + WebSocket transport backend (§4.6 / C5).
//!
//! Every wire message (HELLO, CHALLENGE, DATA_FRAME, ...) is carried as one
//! binary WebSocket frame over a `rustls`-terminated TLS 1.3 connection,
//! upgraded at the `/ws` path. Text frames are protocol errors; ping/pong
//! is used as the keepalive heartbeat independent of the application-level
//! HEARTBEAT message.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::transport::{Transport, TransportError, TransportResult, TransportStats};

/// WebSocket upgrade path ShadowMesh listens/connects on.
pub const WS_PATH: &str = "/ws";
/// Interval between keepalive pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Consecutive missed pongs before the connection is declared dead.
pub const MAX_MISSED_PONGS: u32 = 3;
/// Deadline for a single write to complete.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for a single read to complete.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Load a `rustls::ServerConfig` from a PEM certificate chain and private
/// key, negotiating TLS 1.3 only (with TLS 1.2 available via the
/// `tokio-rustls` `tls12` feature as a compatibility fallback).
///
/// # Errors
/// Returns [`TransportError::InvalidConfig`] if the files cannot be read or
/// parsed, or [`TransportError::TlsHandshake`] if rustls rejects the
/// resulting key material.
pub fn server_tls_config(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> TransportResult<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::InvalidConfig(format!("certificate PEM: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| TransportError::InvalidConfig(format!("private key PEM: {e}")))?
        .ok_or_else(|| TransportError::InvalidConfig("no private key found in PEM".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Build a `rustls::ClientConfig` trusting the platform's native root store.
///
/// # Errors
/// Returns [`TransportError::InvalidConfig`] if the native root store
/// cannot be loaded.
pub fn client_tls_config() -> TransportResult<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!(%err, "transport: skipping unreadable native root certificate");
    }
    for cert in native.certs {
        roots
            .add(cert)
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Dial a ShadowMesh peer: TCP connect, TLS 1.3 handshake, WebSocket
/// upgrade at [`WS_PATH`].
///
/// # Errors
/// Returns [`TransportError::Io`] on connection failure,
/// [`TransportError::TlsHandshake`] if the TLS handshake fails, or
/// [`TransportError::WebSocketHandshake`] if the upgrade is rejected.
pub async fn connect(
    addr: &str,
    server_name: &str,
    tls_config: Arc<rustls::ClientConfig>,
) -> TransportResult<WebSocketTransport> {
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true).ok();

    let connector = TlsConnector::from(tls_config);
    let name = ServerName::try_from(server_name.to_owned())
        .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
    let tls = connector
        .connect(name, tcp)
        .await
        .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;

    let url = format!("wss://{server_name}{WS_PATH}");
    let (ws, _response) = tokio_tungstenite::client_async_tls_with_config(
        url,
        MaybeTlsStream::Rustls(tls),
        Some(websocket_config()),
        None,
    )
    .await
    .map_err(|e| TransportError::WebSocketHandshake(e.to_string()))?;

    Ok(WebSocketTransport::new(ws))
}

/// Accept an inbound ShadowMesh peer on an already-accepted TCP stream:
/// TLS 1.3 handshake then WebSocket upgrade.
///
/// # Errors
/// Returns [`TransportError::TlsHandshake`] if the TLS handshake fails, or
/// [`TransportError::WebSocketHandshake`] if the upgrade is rejected.
pub async fn accept(
    tcp: TcpStream,
    tls_config: Arc<rustls::ServerConfig>,
) -> TransportResult<WebSocketTransport> {
    tcp.set_nodelay(true).ok();
    let acceptor = TlsAcceptor::from(tls_config);
    let tls = acceptor
        .accept(tcp)
        .await
        .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;

    let ws = tokio_tungstenite::accept_async_with_config(
        MaybeTlsStream::Rustls(tokio_rustls::TlsStream::Server(tls)),
        Some(websocket_config()),
    )
    .await
    .map_err(|e| TransportError::WebSocketHandshake(e.to_string()))?;

    Ok(WebSocketTransport::new(ws))
}

fn websocket_config() -> WebSocketConfig {
    WebSocketConfig::default()
}

/// An established, binary-framed WebSocket-over-TLS channel to one peer.
pub struct WebSocketTransport {
    stream: Mutex<WsStream>,
    closed: AtomicBool,
    missed_pongs: AtomicU32,
    stats: Mutex<TransportStats>,
}

impl WebSocketTransport {
    fn new(stream: WsStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            missed_pongs: AtomicU32::new(0),
            stats: Mutex::new(TransportStats::new()),
        }
    }

    /// Send one keepalive ping. Called by the owning session's heartbeat
    /// timer every [`PING_INTERVAL`].
    ///
    /// # Errors
    /// Returns [`TransportError::KeepaliveTimeout`] once
    /// [`MAX_MISSED_PONGS`] consecutive pings have gone unanswered, and
    /// marks the transport closed.
    pub async fn send_ping(&self) -> TransportResult<()> {
        if self.missed_pongs.load(Ordering::Acquire) >= MAX_MISSED_PONGS {
            self.closed.store(true, Ordering::Release);
            return Err(TransportError::KeepaliveTimeout(MAX_MISSED_PONGS));
        }
        let mut stream = self.stream.lock().await;
        timeout(WRITE_TIMEOUT, stream.send(Message::Ping(Vec::new().into())))
            .await
            .map_err(|_| TransportError::Timeout("ping write"))?
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
        self.missed_pongs.fetch_add(1, Ordering::AcqRel);
        let mut stats = self.stats.lock().await;
        stats.pings_sent += 1;
        Ok(())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, message: Vec<u8>) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let len = message.len();
        let mut stream = self.stream.lock().await;
        let result = timeout(WRITE_TIMEOUT, stream.send(Message::Binary(message.into())))
            .await
            .map_err(|_| TransportError::Timeout("write"))?;
        drop(stream);

        let mut stats = self.stats.lock().await;
        match result {
            Ok(()) => {
                stats.record_send(len);
                Ok(())
            }
            Err(err) => {
                stats.record_send_error();
                Err(TransportError::Io(std::io::Error::other(err.to_string())))
            }
        }
    }

    async fn recv(&self) -> TransportResult<Vec<u8>> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let mut stream = self.stream.lock().await;
            let next = timeout(READ_TIMEOUT, stream.next())
                .await
                .map_err(|_| TransportError::Timeout("read"))?;
            drop(stream);

            match next {
                Some(Ok(Message::Binary(bytes))) => {
                    let payload = bytes.to_vec();
                    let mut stats = self.stats.lock().await;
                    stats.record_recv(payload.len());
                    return Ok(payload);
                }
                Some(Ok(Message::Pong(_))) => {
                    self.missed_pongs.store(0, Ordering::Release);
                    continue;
                }
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite queues the matching Pong automatically on
                    // the next write; nothing to do here.
                    continue;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "transport: peer closed WebSocket connection");
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Closed);
                }
                Some(Ok(Message::Text(_) | Message::Frame(_))) => {
                    let mut stats = self.stats.lock().await;
                    stats.record_recv_error();
                    return Err(TransportError::UnexpectedFrameKind);
                }
                Some(Err(err)) => {
                    let mut stats = self.stats.lock().await;
                    stats.record_recv_error();
                    return Err(TransportError::Io(std::io::Error::other(err.to_string())));
                }
                None => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Closed);
                }
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut stream = self.stream.lock().await;
        stream
            .close(None)
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        self.stats.try_lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_path_is_stable() {
        assert_eq!(WS_PATH, "/ws");
    }

    #[test]
    fn keepalive_constants_match_design() {
        assert_eq!(PING_INTERVAL, Duration::from_secs(20));
        assert_eq!(MAX_MISSED_PONGS, 3);
    }
}
