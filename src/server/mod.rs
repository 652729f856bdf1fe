//! WebSocket listener and per-connection tasks
//!
//! Every accepted connection gets its own tokio task, its own strategy
//! instance and its own [`Session`]. The only state shared between tasks is
//! the [`DeviceHandle`].
//!
//! # Architecture
//!
//! ```text
//!                       ┌──► connection task ──► Session ──┐
//! TcpListener ──accept──┼──► connection task ──► Session ──┼──► DeviceHandle
//!                       └──► ...                           ┘
//!        ▲                         ▲
//!        └──── CancellationToken ──┘ (shutdown)
//! ```

use crate::device::{DeviceError, DeviceHandle};
use crate::mapping::{MappingConfig, MappingError};
use crate::session::{CloseReason, MessageOutcome, Session};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause after a failed `accept` so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Longest time a peer may take to complete the WebSocket upgrade
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unable to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Listener I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid mapping: {0}")]
    Mapping(#[from] MappingError),

    #[error("Device cannot serve the mapping: {0}")]
    Device(#[from] DeviceError),
}

/// Per-connection behavior
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    /// Send an acknowledgment after every applied sample
    pub ack: bool,
    /// Close sessions that stay silent this long
    pub idle_timeout: Option<Duration>,
}

/// Everything a connection task needs, shared between all of them
struct Shared {
    device: DeviceHandle,
    mapping: Arc<dyn MappingConfig>,
    options: ServerOptions,
    shutdown: CancellationToken,
}

pub struct BridgeServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    tracker: TaskTracker,
    next_id: AtomicU64,
}

impl BridgeServer {
    /// Validates the mapping against the device and binds the listener
    ///
    /// # Errors
    ///
    /// * [`ServerError::Mapping`] - the mapping configuration is invalid
    /// * [`ServerError::Device`] - the device lacks an axis or key the mapping
    ///   needs, or the initial neutral write failed
    /// * [`ServerError::Bind`] - the address is unavailable
    pub async fn bind(
        host: &str,
        port: u16,
        device: DeviceHandle,
        mapping: Arc<dyn MappingConfig>,
        options: ServerOptions,
    ) -> Result<Self, ServerError> {
        mapping.validate()?;
        let strategy = mapping.create_strategy()?;
        device.ensure_supports(&strategy.required_commands())?;

        // Gerät vor der ersten Verbindung in Ruhelage bringen
        let neutral = strategy.neutral(&strategy.initial_state());
        device.apply(&neutral.commands)?;
        debug!("Applied startup neutral ({} commands)", neutral.commands.len());

        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        info!(
            "Listening on ws://{} with {} ({})",
            listener.local_addr()?,
            mapping.get_name(),
            mapping.get_type()
        );

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                device,
                mapping,
                options,
                shutdown: CancellationToken::new(),
            }),
            tracker: TaskTracker::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the accept loop and closes every session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Accepts connections until the shutdown token is cancelled
    ///
    /// Returns after every session task has closed and reset the device.
    pub async fn run(self) -> Result<(), ServerError> {
        let shutdown = self.shared.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let span = info_span!("session", id, %peer);
                        let connection = handle_connection(stream, peer, id, self.shared.clone());
                        self.tracker.spawn(connection.instrument(span));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        self.tracker.close();
        debug!("Waiting for {} session tasks", self.tracker.len());
        self.tracker.wait().await;
        info!("All sessions closed");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, id: u64, shared: Arc<Shared>) {
    let handshake =
        tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream));
    let ws = tokio::select! {
        _ = shared.shutdown.cancelled() => {
            debug!("Shutdown before {} completed the handshake", peer);
            return;
        }

        result = handshake => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!("WebSocket handshake with {} failed: {}", peer, e);
                return;
            }
            Err(_) => {
                warn!(
                    "WebSocket handshake with {} timed out after {:?}",
                    peer, HANDSHAKE_TIMEOUT
                );
                return;
            }
        },
    };

    let strategy = match shared.mapping.create_strategy() {
        Ok(strategy) => strategy,
        Err(e) => {
            error!("Unable to create mapping strategy: {}", e);
            return;
        }
    };

    info!("Client connected: {}", peer);
    let (mut sink, mut frames) = ws.split();
    let mut session = Session::open(id, shared.device.clone(), strategy);

    let reason = loop {
        let next_frame = async {
            match shared.options.idle_timeout {
                Some(limit) => tokio::time::timeout(limit, frames.next()).await.ok(),
                None => Some(frames.next().await),
            }
        };

        tokio::select! {
            _ = shared.shutdown.cancelled() => break CloseReason::Shutdown,

            frame = next_frame => {
                let outcome = match frame {
                    None => break CloseReason::IdleTimeout,
                    Some(None) | Some(Some(Ok(Message::Close(_)))) => {
                        break CloseReason::ClientClosed
                    }
                    Some(Some(Err(e))) => {
                        warn!("WebSocket error from {}: {}", peer, e);
                        break CloseReason::TransportError;
                    }
                    Some(Some(Ok(Message::Text(text)))) => {
                        session.on_message(&text, Instant::now())
                    }
                    Some(Some(Ok(Message::Binary(bytes)))) => {
                        session.on_bytes(&bytes, Instant::now())
                    }
                    Some(Some(Ok(Message::Ping(_)))) => {
                        // tungstenite hat den Pong bereits eingereiht, nur noch abschicken
                        if let Err(e) = sink.flush().await {
                            warn!("Failed to answer ping: {}", e);
                            break CloseReason::TransportError;
                        }
                        continue;
                    }
                    Some(Some(Ok(_))) => continue,
                };

                match outcome {
                    Ok(MessageOutcome::Applied(ack)) if shared.options.ack => match ack.encode() {
                        Ok(text) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                warn!("Failed to send acknowledgment: {}", e);
                                break CloseReason::TransportError;
                            }
                        }
                        Err(e) => warn!("Failed to encode acknowledgment: {}", e),
                    },
                    Ok(_) => {}
                    Err(e) => {
                        error!("{}", e);
                        break CloseReason::DeviceFailure;
                    }
                }
            }
        }
    };

    let closed = session.close(reason);
    info!("{}", closed.summary());

    if reason != CloseReason::TransportError {
        if let Err(e) = sink.close().await {
            debug!("Closing WebSocket to {} failed: {}", peer, e);
        }
    }
}
