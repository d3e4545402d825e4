//! In-process stand-in for the Live endpoint.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use talelive::SessionEvent;

#[derive(Clone, Copy, PartialEq)]
pub enum SetupReply {
    Confirm,
    Silent,
}

/// What the mock saw and a way to push frames to the client.
pub struct MockUpstream {
    pub url: String,
    pub accepted: Arc<AtomicUsize>,
    pub authorization: Arc<Mutex<Option<String>>>,
    pub received: mpsc::UnboundedReceiver<Message>,
    pub to_client: mpsc::UnboundedSender<Message>,
}

impl MockUpstream {
    /// Only the first connection is served; later ones are counted and dropped.
    pub async fn start(reply: SetupReply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let authorization = Arc::new(Mutex::new(None));
        let (received_tx, received) = mpsc::unbounded_channel();
        let (to_client, mut outgoing) = mpsc::unbounded_channel::<Message>();

        let counter = accepted.clone();
        let auth = authorization.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                    continue;
                }
                let auth = auth.clone();
                let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
                    let header = req
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    *auth.lock().unwrap() = header;
                    Ok::<Response, ErrorResponse>(resp)
                })
                .await;
                let Ok(mut ws) = ws else { continue };

                if let Some(Ok(setup)) = ws.next().await {
                    let _ = received_tx.send(setup);
                }
                if reply == SetupReply::Confirm {
                    let _ = ws.send(Message::text(r#"{"setupComplete": {}}"#)).await;
                }

                loop {
                    tokio::select! {
                        frame = ws.next() => match frame {
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                                let _ = received_tx.send(Message::Close(None));
                                break;
                            }
                            Some(Ok(message)) => {
                                let _ = received_tx.send(message);
                            }
                        },
                        Some(message) = outgoing.recv() => {
                            let closing = matches!(message, Message::Close(_));
                            let _ = ws.send(message).await;
                            if closing {
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            url,
            accepted,
            authorization,
            received,
            to_client,
        }
    }

    pub fn send_json(&self, value: Value) {
        self.to_client.send(Message::text(value.to_string())).unwrap();
    }

    /// Next JSON message from the client, skipping non-text frames.
    pub async fn next_json(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.received.recv())
                .await
                .expect("no message from client")
                .expect("mock upstream stopped");
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Wait until the client's close reaches the mock.
    pub async fn wait_closed(&mut self) {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.received.recv())
                .await
                .expect("client never closed");
            if matches!(message, None | Some(Message::Close(_))) {
                return;
            }
        }
    }
}

/// Receive events until `pred` matches, failing after five seconds.
pub async fn wait_for_event<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended");
        if pred(&event) {
            return event;
        }
    }
}
