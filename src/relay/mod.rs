//! Authenticating WebSocket relay.
//!
//! Clients connect without credentials. For each client the relay fetches a
//! bearer token, opens its own connection to the upstream Live endpoint and
//! then forwards text and binary messages unchanged in both directions until
//! either side goes away.

pub mod token;

pub use token::{CommandToken, StaticToken, TokenProvider};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::session::transport::{self, close_frame};

/// Vertex AI Live endpoint for `location`.
pub fn vertex_upstream_url(location: &str) -> String {
    format!(
        "wss://{location}-aiplatform.googleapis.com/ws/google.cloud.aiplatform.v1beta1.LlmBidiService/BidiGenerateContent"
    )
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub upstream_url: String,
}

impl RelayConfig {
    pub fn new(listen: SocketAddr, upstream_url: impl Into<String>) -> Self {
        Self {
            listen,
            upstream_url: upstream_url.into(),
        }
    }
}

pub struct Relay {
    upstream_url: Arc<str>,
    tokens: Arc<dyn TokenProvider>,
    connections: AtomicU64,
}

impl Relay {
    pub fn new(upstream_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        let upstream_url: String = upstream_url.into();
        Self {
            upstream_url: upstream_url.into(),
            tokens,
            connections: AtomicU64::new(0),
        }
    }

    /// Bind `config.listen` and serve until the listener fails.
    pub async fn serve(config: RelayConfig, tokens: Arc<dyn TokenProvider>) -> Result<(), RelayError> {
        let listener = TcpListener::bind(config.listen).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Arc::new(Self::new(config.upstream_url, tokens)).run(listener).await
    }

    /// Accept clients on an already bound listener. Each client gets its own task.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), RelayError> {
        let upstream = self.upstream_url.split('?').next().unwrap_or_default().to_string();
        info!("Relaying to {}", upstream);
        loop {
            let (stream, peer) = listener.accept().await?;
            let id = self.connections.fetch_add(1, Ordering::Relaxed);
            let relay = self.clone();
            tokio::spawn(async move {
                match relay.handle(stream, peer, id).await {
                    Ok(()) => info!("Relay connection {} from {} closed", id, peer),
                    Err(e) => warn!("Relay connection {} from {} ended: {}", id, peer, e),
                }
            });
        }
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr, id: u64) -> Result<(), RelayError> {
        let mut client = accept_async(stream).await?;
        info!("Relay connection {} accepted from {}", id, peer);

        let token = match self.tokens.token().await {
            Ok(token) => token,
            Err(e) => {
                error!("Relay connection {}: {}", id, e);
                let _ = client.send(close_frame(CloseCode::Policy, "Authentication failed")).await;
                return Err(e);
            }
        };

        let upstream = match transport::connect(&self.upstream_url, Some(&token)).await {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("Relay connection {}: upstream unavailable: {}", id, e);
                let _ = client.send(close_frame(CloseCode::Error, "Upstream unavailable")).await;
                return Err(e.into());
            }
        };
        debug!("Relay connection {} linked upstream", id);

        pump(id, client, upstream).await
    }
}

enum Side {
    Client,
    Upstream,
}

/// Forward messages both ways until one leg closes, then close the other.
async fn pump<C, U>(id: u64, client: WebSocketStream<C>, upstream: WebSocketStream<U>) -> Result<(), RelayError>
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    U: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let mut forwarded = (0u64, 0u64);

    let outcome: Result<(Side, Option<Message>), RelayError> = loop {
        tokio::select! {
            message = client_rx.next() => match message {
                Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                    forwarded.0 += 1;
                    if let Err(e) = upstream_tx.send(message).await {
                        break Err(e.into());
                    }
                }
                Some(Ok(Message::Close(frame))) => break Ok((Side::Client, Some(Message::Close(frame)))),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
                None => break Ok((Side::Client, None)),
            },
            message = upstream_rx.next() => match message {
                Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                    forwarded.1 += 1;
                    if let Err(e) = client_tx.send(message).await {
                        break Err(e.into());
                    }
                }
                Some(Ok(Message::Close(frame))) => break Ok((Side::Upstream, Some(Message::Close(frame)))),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
                None => break Ok((Side::Upstream, None)),
            },
        }
    };
    debug!(
        "Relay connection {}: {} messages up, {} down",
        id, forwarded.0, forwarded.1
    );

    match outcome {
        Ok((Side::Client, close)) => {
            debug!("Relay connection {}: client closed", id);
            if let Some(close) = close {
                let _ = upstream_tx.send(close).await;
            }
            let _ = upstream_tx.close().await;
            let _ = client_tx.close().await;
            Ok(())
        }
        Ok((Side::Upstream, close)) => {
            debug!("Relay connection {}: upstream closed", id);
            if let Some(close) = close {
                let _ = client_tx.send(close).await;
            }
            let _ = client_tx.close().await;
            let _ = upstream_tx.close().await;
            Ok(())
        }
        Err(e) => {
            let _ = client_tx.close().await;
            let _ = upstream_tx.close().await;
            Err(e)
        }
    }
}
