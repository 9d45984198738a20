//! WebSocket tunnel bridge
//!
//! Accepts WebSocket connections and relays binary frames to the WireGuard
//! UDP endpoint, one frame per datagram, nothing added in between. Each
//! session runs two forwarders with independent cancellation; whichever leg
//! dies first drains the other, so a broken client never reaches past its
//! own session.

use crate::config::TunnelConfig;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Largest UDP payload that fits a datagram
pub const MAX_DATAGRAM: usize = 65507;
/// Frames beyond this error the connection outright instead of being
/// dropped one by one
const MAX_WS_MESSAGE: usize = 1 << 20;
/// Rearmed on every UDP read so the forwarder can poll cancellation
const UDP_READ_TIMEOUT: Duration = Duration::from_secs(1);
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge listener error: {0}")]
    Listen(String),
    #[error("bridge TLS error: {0}")]
    Tls(String),
}

#[derive(Debug, Default)]
pub struct BridgeCounters {
    pub sessions_opened: AtomicU64,
    pub sessions_active: AtomicU64,
    pub oversized_dropped: AtomicU64,
}

#[derive(Clone)]
struct BridgeState {
    engine_addr: SocketAddr,
    counters: Arc<BridgeCounters>,
}

enum Listener {
    Plain(tokio::net::TcpListener),
    Tls { addr: SocketAddr, cert: PathBuf, key: PathBuf },
}

pub struct WsBridge {
    listener: Listener,
    path: String,
    state: BridgeState,
}

impl WsBridge {
    /// Bind the bridge listener. Plain-ws listeners are bound eagerly so the
    /// chosen port is known before `run`; TLS listeners bind inside `run`.
    pub async fn bind(config: &TunnelConfig, engine_addr: SocketAddr) -> Result<Self, BridgeError> {
        let addr: SocketAddr = config
            .listen_addr
            .parse()
            .map_err(|e| BridgeError::Listen(format!("{}: {e}", config.listen_addr)))?;

        let listener = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => Listener::Tls {
                addr,
                cert: cert.clone(),
                key: key.clone(),
            },
            _ => Listener::Plain(
                tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|e| BridgeError::Listen(e.to_string()))?,
            ),
        };

        Ok(Self {
            listener,
            path: config.path.clone(),
            state: BridgeState {
                engine_addr,
                counters: Arc::new(BridgeCounters::default()),
            },
        })
    }

    pub fn counters(&self) -> Arc<BridgeCounters> {
        Arc::clone(&self.state.counters)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Plain(listener) => listener.local_addr().ok(),
            Listener::Tls { .. } => None,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
        let app = Router::new()
            .route(&self.path, get(upgrade_handler))
            .with_state(self.state);

        match self.listener {
            Listener::Plain(listener) => {
                tracing::info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                    "tunnel bridge listening (ws)");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.changed().await;
                    })
                    .await
                    .map_err(|e| BridgeError::Listen(e.to_string()))
            }
            Listener::Tls { addr, cert, key } => {
                let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| BridgeError::Tls(e.to_string()))?;
                let handle = axum_server::Handle::new();
                let drain_handle = handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown.changed().await;
                    drain_handle.graceful_shutdown(Some(DRAIN_GRACE));
                });
                tracing::info!(%addr, "tunnel bridge listening (wss)");
                axum_server::bind_rustls(addr, tls)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| BridgeError::Listen(e.to_string()))
            }
        }
    }
}

/// Any origin is accepted: this is a protocol tunnel, not a browser API.
async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<BridgeState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_WS_MESSAGE)
        .on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: BridgeState) {
    let session = state.counters.sessions_opened.fetch_add(1, Ordering::Relaxed);
    state.counters.sessions_active.fetch_add(1, Ordering::Relaxed);

    let udp = match open_engine_socket(state.engine_addr).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            tracing::warn!(session, "cannot reach engine endpoint: {}", e);
            state.counters.sessions_active.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };
    tracing::info!(session, engine = %state.engine_addr, "tunnel session active");

    let (ws_tx, ws_rx) = socket.split();
    let (stop_tx, _) = watch::channel(false);

    let mut inbound = tokio::spawn(ws_to_udp(
        ws_rx,
        Arc::clone(&udp),
        stop_tx.subscribe(),
        Arc::clone(&state.counters),
    ));
    let mut outbound = tokio::spawn(udp_to_ws(ws_tx, udp, stop_tx.subscribe()));

    // Draining: the first leg to exit cancels the other
    let (first, inbound_finished) = tokio::select! {
        reason = &mut inbound => (reason, true),
        reason = &mut outbound => (reason, false),
    };
    let _ = stop_tx.send(true);
    let reason = first.unwrap_or("forwarder panicked");
    tracing::debug!(session, reason, "tunnel session draining");

    if inbound_finished {
        let _ = outbound.await;
    } else {
        let _ = inbound.await;
    }

    state.counters.sessions_active.fetch_sub(1, Ordering::Relaxed);
    tracing::info!(session, reason, "tunnel session closed");
}

/// A fresh ephemeral socket per session keeps the engine's view of each
/// client distinct.
async fn open_engine_socket(engine_addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await?;
    socket.connect(engine_addr).await?;
    Ok(socket)
}

/// WebSocket → UDP: every binary frame becomes exactly one datagram.
async fn ws_to_udp(
    mut ws_rx: SplitStream<WebSocket>,
    udp: Arc<UdpSocket>,
    mut stop: watch::Receiver<bool>,
    counters: Arc<BridgeCounters>,
) -> &'static str {
    loop {
        let message = tokio::select! {
            _ = stop.changed() => return "cancelled",
            message = ws_rx.next() => message,
        };
        match message {
            Some(Ok(Message::Binary(frame))) => {
                if frame.len() > MAX_DATAGRAM {
                    counters.oversized_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(len = frame.len(), "oversized frame dropped");
                    continue;
                }
                if let Err(e) = udp.send(&frame).await {
                    tracing::info!("UDP send failed: {}", e);
                    return "udp send error";
                }
            }
            Some(Ok(Message::Close(frame))) => {
                match frame {
                    Some(ref f) if f.code == close_code::NORMAL || f.code == close_code::AWAY => {
                        tracing::debug!(code = f.code, "client closed");
                    }
                    Some(ref f) => tracing::info!(code = f.code, "client closed abnormally"),
                    None => tracing::debug!("client closed without a frame"),
                }
                return "client close";
            }
            // the tunnel protocol is binary-only
            Some(Ok(Message::Text(_))) => return "text frame violation",
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::info!("WebSocket read failed: {}", e);
                return "ws read error";
            }
            None => return "ws stream ended",
        }
    }
}

/// UDP → WebSocket. The read deadline is not an error, only the point where
/// cancellation gets polled.
async fn udp_to_ws(
    mut ws_tx: SplitSink<WebSocket, Message>,
    udp: Arc<UdpSocket>,
    mut stop: watch::Receiver<bool>,
) -> &'static str {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = stop.changed() => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "".into(),
                    })))
                    .await;
                return "cancelled";
            }
            received = tokio::time::timeout(UDP_READ_TIMEOUT, udp.recv(&mut buf)) => received,
        };
        match received {
            Err(_) => continue,
            Ok(Ok(len)) => {
                if ws_tx.send(Message::Binary(buf[..len].to_vec())).await.is_err() {
                    return "ws send error";
                }
            }
            Ok(Err(e)) => {
                tracing::info!("UDP recv failed: {}", e);
                return "udp recv error";
            }
        }
    }
}
